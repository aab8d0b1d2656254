// ============================================================================
// Region fill: clone / heal / content-aware replacement of masked pixels
// ============================================================================

use image::{Rgba, RgbaImage};

use super::inpaint::NearestNeighborField;
use super::stroke_mask::{FillMode, Mask, Point};

/// Tunables for filling and source resolution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FillConfig {
    /// Feather-ring weight range used to estimate the surrounding colour.
    pub ring_low: f32,
    pub ring_high: f32,
    /// Heal correction fades as `1 - gain × weight`.
    pub heal_edge_gain: f32,
    /// Rings tried by the automatic source search.
    pub search_rings: u32,
    /// Angular samples per ring.
    pub search_samples: u32,
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            ring_low: 0.05,
            ring_high: 0.4,
            heal_edge_gain: 1.5,
            search_rings: 4,
            search_samples: 16,
        }
    }
}

/// Where replacement pixels come from.
#[derive(Clone, Copy, Debug)]
pub enum FillSource<'a> {
    /// One global offset for every masked pixel.
    Offset(i32, i32),
    /// Per-pixel offsets from PatchMatch.
    Field(&'a NearestNeighborField),
}

impl FillSource<'_> {
    #[inline]
    fn resolve(&self, x: i32, y: i32) -> Option<(i32, i32)> {
        match self {
            FillSource::Offset(dx, dy) => Some((x + dx, y + dy)),
            FillSource::Field(nnf) => nnf.offset(x, y).map(|(dx, dy)| (x + dx, y + dy)),
        }
    }
}

/// Outcome of a fill. Skipped pixels had no usable source and were left as-is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FillReport {
    pub filled: usize,
    pub skipped: usize,
}

impl FillReport {
    pub fn is_partial(&self) -> bool {
        self.skipped > 0
    }
}

/// Rec. 601 luma.
#[inline]
pub fn luminance(p: &Rgba<u8>) -> f32 {
    0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32
}

#[inline]
fn in_image(img: &RgbaImage, x: i32, y: i32) -> bool {
    x >= 0 && y >= 0 && x < img.width() as i32 && y < img.height() as i32
}

// -- Source resolution ---------------------------------------------------------

/// Global source offset for Clone / Heal.
///
/// An explicit source point maps onto the rounded, weight-averaged mask
/// centroid. Without one, rings around the mask are searched for the region
/// whose mean luminance best matches the target's.
pub fn resolve_source_offset(
    img: &RgbaImage,
    mask: &Mask,
    explicit: Option<Point>,
    cfg: &FillConfig,
) -> Option<(i32, i32)> {
    let centroid = mask.centroid()?;
    let (cx, cy) = (centroid.x.round() as i32, centroid.y.round() as i32);
    match explicit {
        Some(sp) => Some((sp.x.round() as i32 - cx, sp.y.round() as i32 - cy)),
        None => auto_source_offset(img, mask, cfg),
    }
}

fn mean_luminance_at(img: &RgbaImage, mask: &Mask, dx: i32, dy: i32) -> Option<f32> {
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for (x, y, _) in mask.iter() {
        let (sx, sy) = (x + dx, y + dy);
        if in_image(img, sx, sy) {
            sum += luminance(img.get_pixel(sx as u32, sy as u32)) as f64;
            n += 1;
        }
    }
    (n > 0).then(|| (sum / n as f64) as f32)
}

fn auto_source_offset(img: &RgbaImage, mask: &Mask, cfg: &FillConfig) -> Option<(i32, i32)> {
    let bounds = mask.bounds();
    let target = mean_luminance_at(img, mask, 0, 0)?;
    let step = bounds.width.max(bounds.height).max(1) as f32;
    let samples = cfg.search_samples.max(1);

    let mut best: Option<((i32, i32), f32)> = None;
    for ring in 1..=cfg.search_rings {
        let radius = step * ring as f32;
        for s in 0..samples {
            let angle = s as f32 / samples as f32 * std::f32::consts::TAU;
            let dx = (angle.cos() * radius).round() as i32;
            let dy = (angle.sin() * radius).round() as i32;
            if !bounds.translate(dx, dy).fits_within(img.width(), img.height()) {
                continue;
            }
            if mask.iter().any(|(x, y, _)| mask.is_masked(x + dx, y + dy)) {
                continue;
            }
            let Some(lum) = mean_luminance_at(img, mask, dx, dy) else {
                continue;
            };
            let diff = (lum - target).abs();
            if best.is_none_or(|(_, d)| diff < d) {
                best = Some(((dx, dy), diff));
            }
        }
    }

    match best {
        Some((offset, diff)) => {
            crate::log_info!(
                "Auto source: offset ({}, {}), luminance delta {:.1}",
                offset.0,
                offset.1,
                diff
            );
            Some(offset)
        }
        None => {
            crate::log_warn!("Auto source: no candidate region fits inside the image");
            None
        }
    }
}

// -- Filling --------------------------------------------------------------------

/// Per-channel `surroundMean − sourceMean`, from the target's feather ring.
fn heal_correction(src: &RgbaImage, mask: &Mask, source: &FillSource<'_>, cfg: &FillConfig) -> [f32; 3] {
    let mut ring = [0.0f64; 3];
    let mut ring_n = 0usize;
    for (x, y, w) in mask.iter() {
        if w > cfg.ring_low && w < cfg.ring_high && in_image(src, x, y) {
            let p = src.get_pixel(x as u32, y as u32);
            for c in 0..3 {
                ring[c] += p.0[c] as f64;
            }
            ring_n += 1;
        }
    }
    if ring_n == 0 {
        return [0.0; 3];
    }

    let mut from = [0.0f64; 3];
    let mut from_n = 0usize;
    let mut accumulate = |sx: i32, sy: i32| {
        if in_image(src, sx, sy) {
            let p = src.get_pixel(sx as u32, sy as u32);
            for c in 0..3 {
                from[c] += p.0[c] as f64;
            }
            from_n += 1;
        }
    };
    match source {
        FillSource::Offset(dx, dy) => {
            let b = mask.bounds();
            for y in b.y..b.bottom() {
                for x in b.x..b.right() {
                    accumulate(x + dx, y + dy);
                }
            }
        }
        FillSource::Field(_) => {
            for (x, y, _) in mask.iter() {
                if let Some((sx, sy)) = source.resolve(x, y) {
                    accumulate(sx, sy);
                }
            }
        }
    }
    if from_n == 0 {
        return [0.0; 3];
    }

    let mut correction = [0.0f32; 3];
    for c in 0..3 {
        correction[c] = (ring[c] / ring_n as f64 - from[c] / from_n as f64) as f32;
    }
    correction
}

/// Replace masked pixels from `source`, blended by `weight × opacity`.
///
/// Clone copies directly. Heal and ContentAware add a colour correction that is
/// strongest at the feathered edge and fades to zero toward the centre. Pixels
/// whose source is missing or outside the image are left untouched and counted
/// in [`FillReport::skipped`].
pub fn fill_region(
    img: &mut RgbaImage,
    mask: &Mask,
    mode: FillMode,
    source: FillSource<'_>,
    opacity: f32,
    cfg: &FillConfig,
) -> FillReport {
    let src = img.clone();
    let opacity = opacity.clamp(0.0, 1.0);
    let correction = match mode {
        FillMode::Clone => None,
        FillMode::Heal | FillMode::ContentAware => Some(heal_correction(&src, mask, &source, cfg)),
    };

    let mut report = FillReport::default();
    for (x, y, w) in mask.iter() {
        if !in_image(&src, x, y) {
            report.skipped += 1;
            continue;
        }
        let Some((sx, sy)) = source.resolve(x, y).filter(|&(sx, sy)| in_image(&src, sx, sy)) else {
            report.skipped += 1;
            continue;
        };

        let sp = src.get_pixel(sx as u32, sy as u32);
        let tp = src.get_pixel(x as u32, y as u32);
        let edge = (1.0 - cfg.heal_edge_gain * w).clamp(0.0, 1.0);
        let t = w * opacity;

        let mut out = [0u8; 4];
        for c in 0..3 {
            let value = match correction {
                Some(corr) => (sp.0[c] as f32 + corr[c] * edge).clamp(0.0, 255.0),
                None => sp.0[c] as f32,
            };
            out[c] = lerp(tp.0[c] as f32, value, t);
        }
        out[3] = lerp(tp.0[3] as f32, sp.0[3] as f32, t);
        img.put_pixel(x as u32, y as u32, Rgba(out));
        report.filled += 1;
    }

    if report.is_partial() {
        crate::log_warn!(
            "{} fill partial: {} filled, {} skipped (source outside image)",
            mode.label(),
            report.filled,
            report.skipped
        );
    }
    report
}

#[inline(always)]
fn lerp(a: f32, b: f32, t: f32) -> u8 {
    (a + (b - a) * t).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::inpaint::{PatchMatchParams, compute_nnf};
    use crate::ops::stroke_mask::{BrushParams, MaskConfig, MaskRect, Stroke, build_mask_clipped};

    fn solid_square(x: i32, y: i32, size: u32) -> Mask {
        Mask::from_weights(MaskRect::new(x, y, size, size), vec![1.0; (size * size) as usize]).unwrap()
    }

    fn feathered_disc(cx: f32, cy: f32, r: f32, feather: f32, w: u32, h: u32) -> Mask {
        let brush = BrushParams {
            radius: r,
            feather,
            opacity: 1.0,
            mode: FillMode::Heal,
        };
        build_mask_clipped(&Stroke::new(brush, Point::new(cx, cy)), &MaskConfig::default(), w, h)
    }

    #[test]
    fn clone_at_full_opacity_reproduces_source() {
        let mut img = RgbaImage::from_fn(32, 32, |x, y| Rgba([x as u8 * 5, y as u8 * 7, 10, 255]));
        let original = img.clone();
        let mask = solid_square(4, 4, 6);
        let report = fill_region(&mut img, &mask, FillMode::Clone, FillSource::Offset(15, 12), 1.0, &FillConfig::default());

        assert_eq!(report, FillReport { filled: 36, skipped: 0 });
        for y in 4..10u32 {
            for x in 4..10u32 {
                assert_eq!(img.get_pixel(x, y), original.get_pixel(x + 15, y + 12));
            }
        }
        assert_eq!(img.get_pixel(3, 3), original.get_pixel(3, 3));
    }

    #[test]
    fn clone_opacity_blends_halfway() {
        let mut img = RgbaImage::from_pixel(20, 20, Rgba([0, 0, 0, 255]));
        for y in 0..20 {
            img.put_pixel(15, y, Rgba([200, 100, 50, 255]));
        }
        let mask = solid_square(5, 5, 1);
        fill_region(&mut img, &mask, FillMode::Clone, FillSource::Offset(10, 0), 0.5, &FillConfig::default());
        assert_eq!(img.get_pixel(5, 5), &Rgba([100, 50, 25, 255]));
    }

    #[test]
    fn heal_on_uniform_region_is_a_no_op() {
        let mut img = RgbaImage::from_pixel(64, 64, Rgba([90, 120, 150, 255]));
        let original = img.clone();
        let mask = feathered_disc(20.0, 20.0, 8.0, 0.6, 64, 64);
        let report = fill_region(&mut img, &mask, FillMode::Heal, FillSource::Offset(25, 20), 1.0, &FillConfig::default());
        assert!(report.filled > 0);
        assert_eq!(img, original);
    }

    #[test]
    fn heal_pulls_edges_toward_the_surround() {
        // Left half 100, right half 160; target on the left, source on the right.
        let base = RgbaImage::from_fn(80, 40, |x, _| {
            let v = if x < 40 { 100 } else { 160 };
            Rgba([v, v, v, 255])
        });
        let mask = feathered_disc(18.0, 20.0, 8.0, 0.6, 80, 40);
        let cfg = FillConfig::default();

        let mut healed = base.clone();
        fill_region(&mut healed, &mask, FillMode::Heal, FillSource::Offset(40, 0), 1.0, &cfg);
        let mut cloned = base.clone();
        fill_region(&mut cloned, &mask, FillMode::Clone, FillSource::Offset(40, 0), 1.0, &cfg);

        let (ex, ey) = mask
            .iter()
            .find(|(_, _, w)| *w > 0.3 && *w < 0.6)
            .map(|(x, y, _)| (x as u32, y as u32))
            .unwrap();
        assert!(healed.get_pixel(ex, ey).0[0] < cloned.get_pixel(ex, ey).0[0]);
        // Solid centre receives the uncorrected source.
        assert_eq!(healed.get_pixel(18, 20).0[0], 160);
    }

    #[test]
    fn out_of_image_sources_are_skipped() {
        let mut img = RgbaImage::from_pixel(16, 16, Rgba([7, 7, 7, 255]));
        let original = img.clone();
        let mask = solid_square(10, 10, 4);
        let report = fill_region(&mut img, &mask, FillMode::Clone, FillSource::Offset(4, 0), 1.0, &FillConfig::default());
        assert!(report.is_partial());
        assert_eq!(report.filled + report.skipped, 16);
        assert_eq!(img.get_pixel(13, 10), original.get_pixel(13, 10));
    }

    #[test]
    fn content_aware_on_flat_image_keeps_it_flat() {
        let mut img = RgbaImage::from_pixel(48, 48, Rgba([128, 128, 128, 255]));
        let original = img.clone();
        let mask = feathered_disc(24.0, 24.0, 9.0, 0.3, 48, 48);
        let nnf = compute_nnf(&img, &mask, PatchMatchParams::default());
        let report = fill_region(&mut img, &mask, FillMode::ContentAware, FillSource::Field(&nnf), 1.0, &FillConfig::default());
        assert_eq!(report.skipped, 0);
        assert_eq!(img, original);
    }

    #[test]
    fn explicit_source_maps_onto_rounded_centroid() {
        let img = RgbaImage::new(64, 64);
        let mask = solid_square(10, 10, 5); // centroid (12, 12)
        let offset = resolve_source_offset(&img, &mask, Some(Point::new(40.2, 30.7)), &FillConfig::default());
        assert_eq!(offset, Some((28, 19)));
    }

    #[test]
    fn auto_source_matches_target_luminance() {
        // Dark left, bright right; the object to replace is bright.
        let mut img = RgbaImage::from_fn(100, 40, |x, _| {
            let v = if x < 50 { 0 } else { 200 };
            Rgba([v, v, v, 255])
        });
        let mask = feathered_disc(30.0, 20.0, 4.0, 0.0, 100, 40);
        for (x, y, _) in mask.iter() {
            img.put_pixel(x as u32, y as u32, Rgba([200, 200, 200, 255]));
        }
        let (dx, _) = resolve_source_offset(&img, &mask, None, &FillConfig::default()).unwrap();
        assert!(dx >= 24, "offset dx {dx} should land in the bright half");
    }

    #[test]
    fn empty_mask_has_no_source() {
        let img = RgbaImage::new(8, 8);
        assert_eq!(resolve_source_offset(&img, &Mask::empty(), None, &FillConfig::default()), None);
    }
}
