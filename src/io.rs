use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tga::TgaEncoder;
use image::{DynamicImage, ImageEncoder, ImageError, ImageOutputFormat, RgbaImage};
use serde::Deserialize;

use crate::ops::stroke_mask::{BrushParams, FillMode, Point, Stroke};

// ============================================================================
// IMAGES
// ============================================================================

/// Raster formats the headless tool can write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SaveFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
    Bmp,
    Tga,
    Tiff,
}

impl SaveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Png => "png",
            SaveFormat::Jpeg => "jpg",
            SaveFormat::Webp => "webp",
            SaveFormat::Bmp => "bmp",
            SaveFormat::Tga => "tga",
            SaveFormat::Tiff => "tiff",
        }
    }

    /// Format for a name or extension; `None` if unknown.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "png" => Some(SaveFormat::Png),
            "jpg" | "jpeg" => Some(SaveFormat::Jpeg),
            "webp" => Some(SaveFormat::Webp),
            "bmp" => Some(SaveFormat::Bmp),
            "tga" => Some(SaveFormat::Tga),
            "tif" | "tiff" => Some(SaveFormat::Tiff),
            _ => None,
        }
    }

    /// Format implied by a path's extension, PNG when unknown.
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_name)
            .unwrap_or_default()
    }
}

/// Decode any supported image file to RGBA8.
pub fn load_image(path: &Path) -> Result<RgbaImage, ImageError> {
    Ok(image::open(path)?.to_rgba8())
}

/// Encode `image` to `path`. `quality` applies to JPEG only.
pub fn encode_and_write(image: &RgbaImage, path: &Path, format: SaveFormat, quality: u8) -> Result<(), ImageError> {
    if format == SaveFormat::Webp {
        return DynamicImage::ImageRgba8(image.clone()).save(path);
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let (w, h) = image.dimensions();

    match format {
        SaveFormat::Png => {
            PngEncoder::new(&mut writer).write_image(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
        SaveFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
            encoder.encode(rgb.as_raw(), w, h, image::ColorType::Rgb8)?;
        }
        SaveFormat::Bmp => {
            let mut encoder = BmpEncoder::new(&mut writer);
            encoder.encode(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
        SaveFormat::Tga => {
            TgaEncoder::new(&mut writer).write_image(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
        SaveFormat::Tiff => {
            DynamicImage::ImageRgba8(image.clone()).write_to(&mut writer, ImageOutputFormat::Tiff)?;
        }
        SaveFormat::Webp => {}
    }

    Ok(())
}

// ============================================================================
// STROKE FILES
// ============================================================================
//
// JSON array of strokes:
//   [{ "points": [[x, y], ...], "radius": 20, "feather": 0.3, "opacity": 1,
//      "mode": "content_aware", "source": null }]
// Every field except `points` falls back to the default brush.

#[derive(Debug)]
pub enum StrokeFileError {
    Io(std::io::Error),
    Parse(String),
    /// Stroke at this index has no points.
    EmptyStroke(usize),
    /// Stroke at this index has a coordinate or brush value that is not a
    /// finite number (e.g. `1e39`, which overflows `f32`).
    NonFinite(usize),
}

impl fmt::Display for StrokeFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrokeFileError::Io(e) => write!(f, "I/O error: {}", e),
            StrokeFileError::Parse(e) => write!(f, "Invalid stroke file: {}", e),
            StrokeFileError::EmptyStroke(i) => write!(f, "Stroke {} has no points", i),
            StrokeFileError::NonFinite(i) => write!(f, "Stroke {} has a non-finite value", i),
        }
    }
}

impl std::error::Error for StrokeFileError {}

impl From<std::io::Error> for StrokeFileError {
    fn from(e: std::io::Error) -> Self {
        StrokeFileError::Io(e)
    }
}

impl From<serde_json::Error> for StrokeFileError {
    fn from(e: serde_json::Error) -> Self {
        StrokeFileError::Parse(e.to_string())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StrokeRecord {
    points: Vec<[f32; 2]>,
    radius: Option<f32>,
    feather: Option<f32>,
    opacity: Option<f32>,
    mode: Option<FillMode>,
    #[serde(default)]
    source: Option<[f32; 2]>,
}

impl StrokeRecord {
    fn is_finite(&self) -> bool {
        let scalars = [self.radius, self.feather, self.opacity];
        self.points.iter().chain(self.source.iter()).flatten().all(|v| v.is_finite())
            && scalars.iter().flatten().all(|v| v.is_finite())
    }

    fn into_stroke(self, index: usize) -> Result<Stroke, StrokeFileError> {
        if !self.is_finite() {
            return Err(StrokeFileError::NonFinite(index));
        }
        let defaults = BrushParams::default();
        let brush = BrushParams {
            radius: self.radius.unwrap_or(defaults.radius),
            feather: self.feather.unwrap_or(defaults.feather),
            opacity: self.opacity.unwrap_or(defaults.opacity),
            mode: self.mode.unwrap_or(defaults.mode),
        };
        let mut points = self.points.into_iter().map(|[x, y]| Point::new(x, y));
        let first = points.next().ok_or(StrokeFileError::EmptyStroke(index))?;
        let mut stroke = Stroke::new(brush, first).with_source(self.source.map(|[x, y]| Point::new(x, y)));
        for p in points {
            stroke.push(p);
        }
        Ok(stroke)
    }
}

pub fn parse_strokes(json: &str) -> Result<Vec<Stroke>, StrokeFileError> {
    let records: Vec<StrokeRecord> = serde_json::from_str(json)?;
    records
        .into_iter()
        .enumerate()
        .map(|(i, r)| r.into_stroke(i))
        .collect()
}

pub fn load_strokes(path: &Path) -> Result<Vec<Stroke>, StrokeFileError> {
    let text = std::fs::read_to_string(path)?;
    parse_strokes(&text)
}
