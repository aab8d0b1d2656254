// ============================================================================
// PatchMatch: approximate nearest-neighbour field over a removal mask
// ============================================================================
//
// Core correctness principle: patch distance must IGNORE masked pixels on both
// sides of the comparison. Only surrounding context participates, so the search
// matches what is around the object rather than the object itself.
//
// Algorithm (Barnes et al.):
//   1. Random init: every masked pixel gets a random offset whose target is a
//      valid (in-bounds, unmasked) source.
//   2. Propagation: serpentine scan, each pixel tries the offset of its already
//      updated scan-order predecessors.
//   3. Random search: exponentially shrinking window around the current best.
//   Steps 2–3 repeat `iterations` times, alternating scan direction.

use image::RgbaImage;
use rayon::prelude::*;

use super::stroke_mask::{Mask, MaskRect};

/// Seed attempts before falling back to a nearest-valid ring scan.
const MAX_INIT_ATTEMPTS: usize = 64;

// -- Parameters ---------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PatchMatchParams {
    /// Patch side length (odd, ≥ 3).
    pub patch_size: u32,
    pub iterations: usize,
    /// Initial random-search radius. `None` = max(width, height) / 2.
    pub search_radius: Option<f32>,
    pub seed: u64,
}

impl Default for PatchMatchParams {
    fn default() -> Self {
        Self {
            patch_size: 7,
            iterations: 5,
            search_radius: None,
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

impl PatchMatchParams {
    /// Half window size; even patch sizes round up to the next odd size.
    pub fn half(&self) -> i32 {
        (self.patch_size.max(3) | 1) as i32 / 2
    }

    fn radius_for(&self, img: &RgbaImage) -> f32 {
        match self.search_radius {
            Some(r) if r >= 1.0 => r,
            _ => (img.width().max(img.height()) as f32 / 2.0).max(1.0),
        }
    }
}

// -- Nearest-neighbour field ---------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NnfEntry {
    pub dx: i32,
    pub dy: i32,
    /// Patch distance of the current match; `f32::INFINITY` if unresolved.
    pub distance: f32,
}

impl NnfEntry {
    const IDENTITY: NnfEntry = NnfEntry {
        dx: 0,
        dy: 0,
        distance: 0.0,
    };
    const UNRESOLVED: NnfEntry = NnfEntry {
        dx: 0,
        dy: 0,
        distance: f32::INFINITY,
    };
}

/// Offsets for every masked pixel of a mask's bounds. Unmasked pixels are identity.
#[derive(Clone, Debug)]
pub struct NearestNeighborField {
    bounds: MaskRect,
    entries: Vec<NnfEntry>,
    masked: Vec<bool>,
}

impl NearestNeighborField {
    fn new(mask: &Mask, bounds: MaskRect) -> Self {
        let len = bounds.area() as usize;
        let mut masked = vec![false; len];
        for row in 0..bounds.height as i32 {
            for col in 0..bounds.width as i32 {
                masked[(row * bounds.width as i32 + col) as usize] =
                    mask.is_masked(bounds.x + col, bounds.y + row);
            }
        }
        Self {
            bounds,
            entries: vec![NnfEntry::IDENTITY; len],
            masked,
        }
    }

    pub fn bounds(&self) -> MaskRect {
        self.bounds
    }

    #[inline]
    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.bounds.contains(x, y) {
            return None;
        }
        Some(((y - self.bounds.y) * self.bounds.width as i32 + (x - self.bounds.x)) as usize)
    }

    /// Entry for a masked pixel; `None` for unmasked or out-of-bounds positions.
    pub fn get(&self, x: i32, y: i32) -> Option<NnfEntry> {
        let idx = self.index(x, y)?;
        self.masked[idx].then_some(self.entries[idx])
    }

    /// Offset for a masked pixel, only once a valid source has been found.
    pub fn offset(&self, x: i32, y: i32) -> Option<(i32, i32)> {
        self.get(x, y)
            .filter(|e| e.dx != 0 || e.dy != 0)
            .map(|e| (e.dx, e.dy))
    }

    /// Masked entries in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32, NnfEntry)> + '_ {
        let b = self.bounds;
        self.entries
            .iter()
            .zip(&self.masked)
            .enumerate()
            .filter(|(_, (_, m))| **m)
            .map(move |(i, (e, _))| {
                let x = b.x + (i % b.width as usize) as i32;
                let y = b.y + (i / b.width as usize) as i32;
                (x, y, *e)
            })
    }

    /// Distances of masked entries in row-major order.
    pub fn distances(&self) -> Vec<f32> {
        self.iter().map(|(_, _, e)| e.distance).collect()
    }

    /// Mean of the finite distances (0 when none are finite).
    pub fn mean_distance(&self) -> f32 {
        let (sum, n) = self
            .iter()
            .filter(|(_, _, e)| e.distance.is_finite())
            .fold((0.0f64, 0usize), |(s, n), (_, _, e)| (s + e.distance as f64, n + 1));
        if n == 0 { 0.0 } else { (sum / n as f64) as f32 }
    }
}

// -- Distance -----------------------------------------------------------------

#[inline]
fn in_image(img: &RgbaImage, x: i32, y: i32) -> bool {
    x >= 0 && y >= 0 && x < img.width() as i32 && y < img.height() as i32
}

#[inline]
fn is_valid_source(img: &RgbaImage, mask: &Mask, x: i32, y: i32) -> bool {
    in_image(img, x, y) && !mask.is_masked(x, y)
}

/// Masked patch distance between the windows around `(tx,ty)` and `(sx,sy)`.
///
/// Mean squared per-channel (RGB) difference. Sample pairs where either side is
/// out of bounds or masked are skipped; `f32::INFINITY` if nothing is left.
pub fn patch_distance(
    img: &RgbaImage,
    mask: &Mask,
    tx: i32,
    ty: i32,
    sx: i32,
    sy: i32,
    half: i32,
) -> f32 {
    let mut ssd = 0.0f32;
    let mut count = 0usize;
    for dy in -half..=half {
        for dx in -half..=half {
            let (ax, ay) = (tx + dx, ty + dy);
            let (bx, by) = (sx + dx, sy + dy);
            if !is_valid_source(img, mask, ax, ay) || !is_valid_source(img, mask, bx, by) {
                continue;
            }
            let pa = img.get_pixel(ax as u32, ay as u32);
            let pb = img.get_pixel(bx as u32, by as u32);
            for c in 0..3usize {
                let d = pa.0[c] as f32 - pb.0[c] as f32;
                ssd += d * d;
            }
            count += 1;
        }
    }
    if count == 0 {
        f32::INFINITY
    } else {
        ssd / (count * 3) as f32
    }
}

// -- PRNG -----------------------------------------------------------------------

/// Per-pixel LCG so results are deterministic regardless of thread scheduling.
#[derive(Clone, Copy)]
struct Lcg(u64);

impl Lcg {
    fn seeded(seed: u64, x: i32, y: i32, salt: u64) -> Self {
        let mut s = seed
            ^ (x as u64).wrapping_mul(6364136223846793005)
            ^ (y as u64).wrapping_mul(982451653)
            ^ salt.wrapping_mul(1234567891);
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        Lcg(s)
    }

    /// Uniform in [0, 1).
    fn next_unit(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform in [-1, 1).
    fn next_signed(&mut self) -> f32 {
        self.next_unit() * 2.0 - 1.0
    }
}

// -- Search ---------------------------------------------------------------------

/// Stepwise PatchMatch runner. [`compute_nnf`] drives it end to end.
pub struct PatchMatch<'a> {
    img: &'a RgbaImage,
    mask: &'a Mask,
    params: PatchMatchParams,
    half: i32,
    radius: f32,
    field: NearestNeighborField,
    /// Masked pixel coordinates in row-major order.
    order: Vec<(i32, i32)>,
}

impl<'a> PatchMatch<'a> {
    pub fn new(img: &'a RgbaImage, mask: &'a Mask, params: PatchMatchParams) -> Self {
        let bounds = mask
            .bounds()
            .intersect(&MaskRect::new(0, 0, img.width(), img.height()));
        let field = NearestNeighborField::new(mask, bounds);
        let order = field.iter().map(|(x, y, _)| (x, y)).collect();
        Self {
            img,
            mask,
            params,
            half: params.half(),
            radius: params.radius_for(img),
            field,
            order,
        }
    }

    pub fn field(&self) -> &NearestNeighborField {
        &self.field
    }

    pub fn into_field(self) -> NearestNeighborField {
        self.field
    }

    /// Random offsets within the search radius, resampled until the target is valid.
    pub fn initialize(&mut self) {
        let (img, mask, half, radius) = (self.img, self.mask, self.half, self.radius);
        let seed = self.params.seed;
        let b = self.field.bounds;
        let width = b.width as usize;
        if width == 0 {
            return;
        }
        let masked = &self.field.masked;

        self.field
            .entries
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(row, entries)| {
                let y = b.y + row as i32;
                for (col, entry) in entries.iter_mut().enumerate() {
                    if !masked[row * width + col] {
                        *entry = NnfEntry::IDENTITY;
                        continue;
                    }
                    let x = b.x + col as i32;
                    let mut rng = Lcg::seeded(seed, x, y, 0);
                    let mut found = None;
                    for _ in 0..MAX_INIT_ATTEMPTS {
                        let dx = (rng.next_signed() * radius).round() as i32;
                        let dy = (rng.next_signed() * radius).round() as i32;
                        if (dx != 0 || dy != 0) && is_valid_source(img, mask, x + dx, y + dy) {
                            found = Some((dx, dy));
                            break;
                        }
                    }
                    let found = found.or_else(|| nearest_valid_offset(img, mask, x, y));
                    *entry = match found {
                        Some((dx, dy)) => NnfEntry {
                            dx,
                            dy,
                            distance: patch_distance(img, mask, x, y, x + dx, y + dy, half),
                        },
                        None => NnfEntry::UNRESOLVED,
                    };
                }
            });
    }

    /// One serpentine propagation pass. Even iterations scan forward and pull
    /// from left/up; odd iterations scan backward and pull from right/down.
    pub fn propagate(&mut self, iter: usize) {
        let forward = iter.is_multiple_of(2);
        let neighbours: [(i32, i32); 2] = if forward {
            [(-1, 0), (0, -1)]
        } else {
            [(1, 0), (0, 1)]
        };

        for step in 0..self.order.len() {
            let (x, y) = if forward {
                self.order[step]
            } else {
                self.order[self.order.len() - 1 - step]
            };
            let Some(idx) = self.field.index(x, y) else {
                continue;
            };
            let mut best = self.field.entries[idx];

            for (ndx, ndy) in neighbours {
                let Some(ni) = self.field.index(x + ndx, y + ndy) else {
                    continue;
                };
                if !self.field.masked[ni] {
                    continue;
                }
                let cand = self.field.entries[ni];
                if !cand.distance.is_finite() && cand.dx == 0 && cand.dy == 0 {
                    continue;
                }
                let (sx, sy) = (x + cand.dx, y + cand.dy);
                if !is_valid_source(self.img, self.mask, sx, sy) {
                    continue;
                }
                let d = patch_distance(self.img, self.mask, x, y, sx, sy, self.half);
                if d < best.distance {
                    best = NnfEntry {
                        dx: cand.dx,
                        dy: cand.dy,
                        distance: d,
                    };
                }
            }

            self.field.entries[idx] = best;
        }
    }

    /// Random search around each current best with a halving window.
    /// Entries only ever change on strict improvement.
    pub fn random_search(&mut self, iter: usize) {
        let (img, mask, half, radius) = (self.img, self.mask, self.half, self.radius);
        let seed = self.params.seed;
        let b = self.field.bounds;
        let width = b.width as usize;
        if width == 0 {
            return;
        }
        let masked = &self.field.masked;

        self.field
            .entries
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(row, entries)| {
                let y = b.y + row as i32;
                for (col, entry) in entries.iter_mut().enumerate() {
                    if !masked[row * width + col] {
                        continue;
                    }
                    let x = b.x + col as i32;
                    let mut rng = Lcg::seeded(seed, x, y, iter as u64 + 1);
                    let mut best = *entry;
                    let mut search_r = radius;
                    while search_r >= 1.0 {
                        let sx = x + best.dx + (rng.next_signed() * search_r).round() as i32;
                        let sy = y + best.dy + (rng.next_signed() * search_r).round() as i32;
                        if is_valid_source(img, mask, sx, sy) {
                            let d = patch_distance(img, mask, x, y, sx, sy, half);
                            if d < best.distance {
                                best = NnfEntry {
                                    dx: sx - x,
                                    dy: sy - y,
                                    distance: d,
                                };
                            }
                        }
                        search_r *= 0.5;
                    }
                    *entry = best;
                }
            });
    }

    /// Propagation followed by random search.
    pub fn iterate(&mut self, iter: usize) {
        self.propagate(iter);
        self.random_search(iter);
    }
}

/// Closest unmasked in-image pixel by square rings, as an offset.
fn nearest_valid_offset(img: &RgbaImage, mask: &Mask, x: i32, y: i32) -> Option<(i32, i32)> {
    let max_ring = img.width().max(img.height()) as i32;
    for ring in 1..=max_ring {
        for d in -ring..=ring {
            for (dx, dy) in [(d, -ring), (d, ring), (-ring, d), (ring, d)] {
                if is_valid_source(img, mask, x + dx, y + dy) {
                    return Some((dx, dy));
                }
            }
        }
    }
    None
}

/// Full PatchMatch: initialise, then `params.iterations` rounds of
/// propagation + random search. Approximate; no global optimum guarantee.
pub fn compute_nnf(img: &RgbaImage, mask: &Mask, params: PatchMatchParams) -> NearestNeighborField {
    let mut pm = PatchMatch::new(img, mask, params);
    pm.initialize();
    for iter in 0..params.iterations {
        pm.iterate(iter);
    }
    crate::log_info!(
        "PatchMatch: {} masked px, {} iterations, mean distance {:.2}",
        pm.order.len(),
        params.iterations,
        pm.field.mean_distance()
    );
    pm.into_field()
}
