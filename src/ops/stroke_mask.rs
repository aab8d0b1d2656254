// ============================================================================
// Stroke → weighted coverage mask
// ============================================================================
//
// A committed stroke becomes a per-pixel weight grid in [0, 1] over a bounding
// rectangle. Open strokes are a union of radial brush dabs; strokes that loop
// back onto their start are simplified into a polygon whose interior is filled
// solid, with the dabs max-combined on top so stray tails are not lost.

use image::{GrayImage, Luma};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// -- Geometry primitives ----------------------------------------------------

/// Image-space sample position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    #[inline]
    pub fn distance(self, other: Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Integer pixel rectangle. `x`/`y` may be negative before clipping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaskRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl MaskRect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge, saturating at `i32::MAX`.
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width.min(i32::MAX as u32) as i32)
    }

    /// Exclusive bottom edge, saturating at `i32::MAX`.
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height.min(i32::MAX as u32) as i32)
    }

    #[inline]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    pub fn intersect(&self, other: &MaskRect) -> MaskRect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return MaskRect::default();
        }
        MaskRect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    pub fn translate(&self, dx: i32, dy: i32) -> MaskRect {
        MaskRect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// True when the whole rectangle lies inside a `width`×`height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.right() <= width as i32
            && self.bottom() <= height as i32
    }
}

// -- Brush / stroke ----------------------------------------------------------

/// How a committed stroke sources its replacement pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Direct copy from a single source offset.
    Clone,
    /// Copy from a single source offset with edge colour correction.
    Heal,
    /// Per-pixel source offsets from a nearest-neighbour field.
    ContentAware,
}

impl FillMode {
    pub fn label(&self) -> &'static str {
        match self {
            FillMode::Clone => "Clone",
            FillMode::Heal => "Heal",
            FillMode::ContentAware => "Content-Aware",
        }
    }
}

/// Brush parameters captured when a stroke starts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BrushParams {
    pub radius: f32,
    /// Fraction of the radius over which the edge fades out, 0–1.
    pub feather: f32,
    pub opacity: f32,
    pub mode: FillMode,
}

impl Default for BrushParams {
    fn default() -> Self {
        Self {
            radius: 20.0,
            feather: 0.3,
            opacity: 1.0,
            mode: FillMode::ContentAware,
        }
    }
}

impl BrushParams {
    /// Clamp every field into range. NaN and infinities fall back to the
    /// default brush value.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let finite_or = |v: f32, d: f32| if v.is_finite() { v } else { d };
        Self {
            radius: finite_or(self.radius, defaults.radius).max(0.5),
            feather: finite_or(self.feather, defaults.feather).clamp(0.0, 1.0),
            opacity: finite_or(self.opacity, defaults.opacity).clamp(0.0, 1.0),
            mode: self.mode,
        }
    }
}

/// Ordered pointer samples plus the brush they were drawn with.
#[derive(Clone, Debug, PartialEq)]
pub struct Stroke {
    pub points: Vec<Point>,
    pub radius: f32,
    pub feather: f32,
    pub opacity: f32,
    pub mode: FillMode,
    /// Explicit source point (Alt+click style) for Clone / Heal.
    pub source: Option<Point>,
}

impl Stroke {
    /// Start a stroke. A non-finite start sample leaves the stroke empty.
    pub fn new(brush: BrushParams, start: Point) -> Self {
        let brush = brush.sanitized();
        Self {
            points: if start.is_finite() { vec![start] } else { Vec::new() },
            radius: brush.radius,
            feather: brush.feather,
            opacity: brush.opacity,
            mode: brush.mode,
            source: None,
        }
    }

    /// Set the explicit source point; a non-finite point is ignored.
    pub fn with_source(mut self, source: Option<Point>) -> Self {
        self.source = source.filter(|p| p.is_finite());
        self
    }

    /// Append a sample. Exact repeats of the previous sample and non-finite
    /// samples are dropped.
    pub fn push(&mut self, p: Point) {
        if !p.is_finite() {
            return;
        }
        if self.points.last() != Some(&p) {
            self.points.push(p);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn brush(&self) -> BrushParams {
        BrushParams {
            radius: self.radius,
            feather: self.feather,
            opacity: self.opacity,
            mode: self.mode,
        }
    }

    /// A stroke is closed when it has enough samples and ends near its start.
    pub fn is_closed(&self, cfg: &MaskConfig) -> bool {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => {
                self.points.len() >= cfg.closed_min_points
                    && first.distance(*last) <= self.radius * cfg.closing_distance_factor
            }
            _ => false,
        }
    }

    /// Classify the stroke geometry.
    pub fn shape(&self, cfg: &MaskConfig) -> StrokeShape<'_> {
        match self.points.as_slice() {
            [] => StrokeShape::Empty,
            [p] => StrokeShape::Dot(*p),
            path if self.is_closed(cfg) => {
                let tolerance = self.radius * cfg.simplify_tolerance_factor;
                let polygon = douglas_peucker(path, tolerance);
                if polygon.len() >= 3 {
                    StrokeShape::Closed { path, polygon }
                } else {
                    StrokeShape::Open(path)
                }
            }
            path => StrokeShape::Open(path),
        }
    }
}

/// Stroke geometry after closed-loop detection.
#[derive(Clone, Debug, PartialEq)]
pub enum StrokeShape<'a> {
    Empty,
    Dot(Point),
    Open(&'a [Point]),
    Closed {
        path: &'a [Point],
        polygon: Vec<Point>,
    },
}

/// Tunables for mask construction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskConfig {
    /// Minimum sample count before a stroke can count as a closed loop.
    pub closed_min_points: usize,
    /// First/last distance (× radius) that closes a loop.
    pub closing_distance_factor: f32,
    /// Douglas-Peucker tolerance (× radius).
    pub simplify_tolerance_factor: f32,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            closed_min_points: 10,
            closing_distance_factor: 1.0,
            simplify_tolerance_factor: 0.25,
        }
    }
}

// -- Mask ---------------------------------------------------------------------

/// Per-pixel weight grid. Weight is 0 everywhere outside `bounds`.
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    bounds: MaskRect,
    weights: Vec<f32>,
}

impl Mask {
    pub fn empty() -> Self {
        Self {
            bounds: MaskRect::default(),
            weights: Vec::new(),
        }
    }

    fn zeroed(bounds: MaskRect) -> Self {
        Self {
            bounds,
            weights: vec![0.0; bounds.area() as usize],
        }
    }

    /// Build a mask from raw row-major weights covering `bounds`.
    /// Returns `None` if the lengths disagree.
    pub fn from_weights(bounds: MaskRect, weights: Vec<f32>) -> Option<Self> {
        if weights.len() as u64 != bounds.area() {
            return None;
        }
        let weights = weights.into_iter().map(|w| w.clamp(0.0, 1.0)).collect();
        Some(Self { bounds, weights })
    }

    pub fn bounds(&self) -> MaskRect {
        self.bounds
    }

    #[inline]
    pub fn weight(&self, x: i32, y: i32) -> f32 {
        if !self.bounds.contains(x, y) {
            return 0.0;
        }
        let idx = (y - self.bounds.y) as usize * self.bounds.width as usize
            + (x - self.bounds.x) as usize;
        self.weights[idx]
    }

    #[inline]
    pub fn is_masked(&self, x: i32, y: i32) -> bool {
        self.weight(x, y) > 0.0
    }

    /// True when no pixel carries weight.
    pub fn is_empty(&self) -> bool {
        !self.weights.iter().any(|&w| w > 0.0)
    }

    /// Number of pixels with weight > 0.
    pub fn area(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0.0).count()
    }

    /// Weight-averaged position of the masked pixels.
    pub fn centroid(&self) -> Option<Point> {
        let mut sx = 0.0f64;
        let mut sy = 0.0f64;
        let mut total = 0.0f64;
        for (x, y, w) in self.iter() {
            sx += x as f64 * w as f64;
            sy += y as f64 * w as f64;
            total += w as f64;
        }
        if total <= 0.0 {
            return None;
        }
        Some(Point::new((sx / total) as f32, (sy / total) as f32))
    }

    /// Masked pixels in row-major order as `(x, y, weight)`.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32, f32)> + '_ {
        let b = self.bounds;
        self.weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0.0)
            .map(move |(i, &w)| {
                let x = b.x + (i % b.width as usize) as i32;
                let y = b.y + (i / b.width as usize) as i32;
                (x, y, w)
            })
    }

    /// Binary raster for external consumers: 255 = fill, 0 = keep.
    pub fn to_raster(&self, width: u32, height: u32) -> GrayImage {
        let mut raster = GrayImage::new(width, height);
        for (x, y, _) in self.iter() {
            if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                raster.put_pixel(x as u32, y as u32, Luma([255u8]));
            }
        }
        raster
    }
}

// -- Construction -------------------------------------------------------------

/// Rasterise a stroke into a weight mask.
///
/// Bounds cover every sample expanded by `radius × (1 + feather)`. The mask is
/// not clipped to any image; use [`build_mask_clipped`] for pointer input that
/// may run off the canvas.
pub fn build_mask(stroke: &Stroke, cfg: &MaskConfig) -> Mask {
    rasterize(stroke, cfg, None)
}

/// Rasterise a stroke into a mask restricted to a `width`×`height` image.
///
/// The weight grid never exceeds the image, however far the samples stray.
pub fn build_mask_clipped(stroke: &Stroke, cfg: &MaskConfig, width: u32, height: u32) -> Mask {
    rasterize(stroke, cfg, Some(MaskRect::new(0, 0, width, height)))
}

fn rasterize(stroke: &Stroke, cfg: &MaskConfig, clip: Option<MaskRect>) -> Mask {
    let r = stroke.radius.max(0.5);
    let f = stroke.feather.clamp(0.0, 1.0);
    let bounds_for = |points: &[Point]| {
        let b = stroke_bounds(points, r, f);
        clip.map_or(b, |c| b.intersect(&c))
    };

    match stroke.shape(cfg) {
        StrokeShape::Empty => Mask::empty(),
        StrokeShape::Dot(p) => {
            let bounds = bounds_for(&[p]);
            if bounds.is_empty() {
                return Mask::empty();
            }
            let mut mask = Mask::zeroed(bounds);
            stamp_radial(&mut mask, &[p], r, f);
            mask
        }
        StrokeShape::Open(path) => {
            let bounds = bounds_for(path);
            if bounds.is_empty() {
                return Mask::empty();
            }
            let mut mask = Mask::zeroed(bounds);
            stamp_radial(&mut mask, path, r, f);
            mask
        }
        StrokeShape::Closed { path, polygon } => {
            let bounds = bounds_for(path);
            if bounds.is_empty() {
                return Mask::empty();
            }
            let mut mask = Mask::zeroed(bounds);
            fill_polygon(&mut mask, &polygon, r * f);
            stamp_radial(&mut mask, path, r, f);
            mask
        }
    }
}

fn stroke_bounds(points: &[Point], r: f32, f: f32) -> MaskRect {
    let expand = (r * (1.0 + f)) as f64;
    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for p in points {
        min_x = min_x.min(p.x as f64);
        min_y = min_y.min(p.y as f64);
        max_x = max_x.max(p.x as f64);
        max_y = max_y.max(p.y as f64);
    }
    // Keep both edges representable so width/height fit in u32.
    let edge = |v: f64| v.clamp(i32::MIN as f64 / 2.0, i32::MAX as f64 / 2.0) as i64;
    let x0 = edge((min_x - expand).floor());
    let y0 = edge((min_y - expand).floor());
    let x1 = edge((max_x + expand).ceil());
    let y1 = edge((max_y + expand).ceil());
    MaskRect::new(x0 as i32, y0 as i32, (x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32)
}

/// Radial brush profile: solid inside `r(1-f)`, smoothstep to 0 at `r`.
#[inline]
pub fn radial_falloff(dist: f32, r: f32, f: f32) -> f32 {
    let inner = r * (1.0 - f);
    if dist <= inner {
        1.0
    } else if dist >= r {
        0.0
    } else {
        1.0 - smoothstep(inner, r, dist)
    }
}

/// Max-combine a radial dab at every sample into the mask (row-parallel).
fn stamp_radial(mask: &mut Mask, points: &[Point], r: f32, f: f32) {
    let b = mask.bounds;
    let width = b.width as usize;
    mask.weights
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, weights)| {
            let y = (b.y + row as i32) as f32;
            for p in points {
                let dy = y - p.y;
                if dy.abs() > r {
                    continue;
                }
                let x0 = ((p.x - r).floor() as i32).max(b.x);
                let x1 = ((p.x + r).ceil() as i32).min(b.right() - 1);
                for x in x0..=x1 {
                    let dx = x as f32 - p.x;
                    let w = radial_falloff((dx * dx + dy * dy).sqrt(), r, f);
                    let slot = &mut weights[(x - b.x) as usize];
                    if w > *slot {
                        *slot = w;
                    }
                }
            }
        });
}

/// Solid interior plus a smoothstep band of width `band` outside the edges.
fn fill_polygon(mask: &mut Mask, polygon: &[Point], band: f32) {
    let b = mask.bounds;
    let width = b.width as usize;
    mask.weights
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, weights)| {
            let y = (b.y + row as i32) as f32;
            for (col, slot) in weights.iter_mut().enumerate() {
                let p = Point::new((b.x + col as i32) as f32, y);
                let w = if point_in_polygon(p, polygon) {
                    1.0
                } else if band > 0.0 {
                    let d = distance_to_polygon(p, polygon);
                    if d < band { 1.0 - smoothstep(0.0, band, d) } else { 0.0 }
                } else {
                    0.0
                };
                if w > *slot {
                    *slot = w;
                }
            }
        });
}

/// Even-odd ray casting. Self-intersecting outlines are handled approximately.
pub fn point_in_polygon(p: Point, polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[j];
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Distance to the nearest edge of a closed polygon.
fn distance_to_polygon(p: Point, polygon: &[Point]) -> f32 {
    let n = polygon.len();
    let mut best = f32::MAX;
    for i in 0..n {
        let d = distance_to_segment(p, polygon[i], polygon[(i + 1) % n]);
        if d < best {
            best = d;
        }
    }
    best
}

fn distance_to_segment(p: Point, a: Point, b: Point) -> f32 {
    let abx = b.x - a.x;
    let aby = b.y - a.y;
    let len_sq = abx * abx + aby * aby;
    if len_sq <= f32::EPSILON {
        return p.distance(a);
    }
    let t = (((p.x - a.x) * abx + (p.y - a.y) * aby) / len_sq).clamp(0.0, 1.0);
    p.distance(Point::new(a.x + t * abx, a.y + t * aby))
}

/// Douglas-Peucker polyline simplification. Endpoints are always kept.
pub fn douglas_peucker(points: &[Point], tolerance: f32) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    let mut stack = vec![(0usize, points.len() - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let mut max_d = 0.0f32;
        let mut max_i = start;
        for i in start + 1..end {
            let d = distance_to_segment(points[i], points[start], points[end]);
            if d > max_d {
                max_d = d;
                max_i = i;
            }
        }
        if max_d > tolerance {
            keep[max_i] = true;
            stack.push((start, max_i));
            stack.push((max_i, end));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

/// Smoothstep between edge0 and edge1.
#[inline]
pub(crate) fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}
