// ============================================================================
// Spot removal: fast local averaging for small masks
// ============================================================================
//
// Onion peeling: each pass fills the masked pixels that can see at least one
// known neighbour within `radius`, and those pixels become known for the next
// pass. The whole operation works on a copy and is time-boxed: running past the
// budget aborts mid-computation and leaves the caller's buffer untouched.

use std::fmt;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};

use super::region_fill::FillReport;
use super::stroke_mask::{Mask, MaskRect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotRemovalError {
    Timeout { elapsed_ms: u64, budget_ms: u64 },
}

impl fmt::Display for SpotRemovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpotRemovalError::Timeout { elapsed_ms, budget_ms } => write!(
                f,
                "spot removal exceeded its {} ms budget ({} ms elapsed)",
                budget_ms, elapsed_ms
            ),
        }
    }
}

impl std::error::Error for SpotRemovalError {}

/// Replace masked pixels with the inverse-distance weighted average of known
/// neighbours, blended by `weight × opacity`.
pub fn spot_remove(
    img: &mut RgbaImage,
    mask: &Mask,
    radius: u32,
    opacity: f32,
    budget: Duration,
) -> Result<FillReport, SpotRemovalError> {
    let start = Instant::now();
    let timeout = |start: Instant| SpotRemovalError::Timeout {
        elapsed_ms: start.elapsed().as_millis() as u64,
        budget_ms: budget.as_millis() as u64,
    };

    let b = mask
        .bounds()
        .intersect(&MaskRect::new(0, 0, img.width(), img.height()));
    let mut pending: Vec<(i32, i32, f32)> = mask.iter().filter(|(x, y, _)| b.contains(*x, *y)).collect();
    let outside = mask.area() - pending.len();
    if pending.is_empty() {
        return Ok(FillReport {
            filled: 0,
            skipped: outside,
        });
    }

    let width = b.width as usize;
    let slot = |x: i32, y: i32| (y - b.y) as usize * width + (x - b.x) as usize;
    let mut known = vec![false; b.area() as usize];
    let r = radius.max(1) as i32;
    let opacity = opacity.clamp(0.0, 1.0);
    let mut out = img.clone();
    let mut filled = 0usize;

    while !pending.is_empty() {
        let mut updates: Vec<(i32, i32, Rgba<u8>)> = Vec::new();
        let mut still_pending = Vec::with_capacity(pending.len());

        for &(x, y, w) in &pending {
            if start.elapsed() >= budget {
                crate::log_warn!("Spot removal aborted after {} ms", start.elapsed().as_millis());
                return Err(timeout(start));
            }

            let mut sum = [0.0f32; 4];
            let mut total = 0.0f32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let d2 = (dx * dx + dy * dy) as f32;
                    if d2 == 0.0 || d2 > (r * r) as f32 {
                        continue;
                    }
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= img.width() as i32 || ny >= img.height() as i32 {
                        continue;
                    }
                    let usable = !mask.is_masked(nx, ny) || (b.contains(nx, ny) && known[slot(nx, ny)]);
                    if !usable {
                        continue;
                    }
                    let p = out.get_pixel(nx as u32, ny as u32);
                    let k = 1.0 / (1.0 + d2);
                    for c in 0..4 {
                        sum[c] += p.0[c] as f32 * k;
                    }
                    total += k;
                }
            }

            if total <= 0.0 {
                still_pending.push((x, y, w));
                continue;
            }
            let t = w * opacity;
            let tp = out.get_pixel(x as u32, y as u32);
            let mut px = [0u8; 4];
            for c in 0..4 {
                let avg = sum[c] / total;
                px[c] = (tp.0[c] as f32 + (avg - tp.0[c] as f32) * t).round().clamp(0.0, 255.0) as u8;
            }
            updates.push((x, y, Rgba(px)));
        }

        if updates.is_empty() {
            break;
        }
        for (x, y, px) in updates {
            out.put_pixel(x as u32, y as u32, px);
            known[slot(x, y)] = true;
            filled += 1;
        }
        pending = still_pending;
    }

    *img = out;
    Ok(FillReport {
        filled,
        skipped: pending.len() + outside,
    })
}
