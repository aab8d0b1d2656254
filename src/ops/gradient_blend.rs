// ============================================================================
// Gradient-domain seam removal (membrane relaxation)
// ============================================================================

use image::{Rgba, RgbaImage};

use super::stroke_mask::{Mask, MaskRect};

/// Stop early once no channel moves by more than this in a sweep.
const CONVERGED_DELTA: f32 = 0.01;

/// Relax masked pixels toward the average of their 4-neighbours.
///
/// Gauss-Seidel sweeps: masked neighbours contribute their current iterate,
/// unmasked neighbours their fixed value from `img`, out-of-image neighbours
/// nothing. Only RGB is relaxed; alpha is kept. Returns the sweeps performed.
pub fn blend_gradient(img: &mut RgbaImage, mask: &Mask, iterations: usize) -> usize {
    let b = mask
        .bounds()
        .intersect(&MaskRect::new(0, 0, img.width(), img.height()));
    if b.is_empty() || iterations == 0 {
        return 0;
    }

    let width = b.width as usize;
    let idx = |x: i32, y: i32| (y - b.y) as usize * width + (x - b.x) as usize;

    let mut current: Vec<[f32; 3]> = Vec::with_capacity(b.area() as usize);
    let mut masked: Vec<bool> = Vec::with_capacity(b.area() as usize);
    for y in b.y..b.bottom() {
        for x in b.x..b.right() {
            let p = img.get_pixel(x as u32, y as u32);
            current.push([p.0[0] as f32, p.0[1] as f32, p.0[2] as f32]);
            masked.push(mask.is_masked(x, y));
        }
    }
    if !masked.iter().any(|&m| m) {
        return 0;
    }

    let (w, h) = (img.width() as i32, img.height() as i32);
    let mut sweeps = 0;
    for _ in 0..iterations {
        sweeps += 1;
        let mut max_delta = 0.0f32;
        for y in b.y..b.bottom() {
            for x in b.x..b.right() {
                let i = idx(x, y);
                if !masked[i] {
                    continue;
                }
                let mut sum = [0.0f32; 3];
                let mut n = 0u32;
                for (nx, ny) in [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)] {
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    let v = if b.contains(nx, ny) && masked[idx(nx, ny)] {
                        current[idx(nx, ny)]
                    } else {
                        let p = img.get_pixel(nx as u32, ny as u32);
                        [p.0[0] as f32, p.0[1] as f32, p.0[2] as f32]
                    };
                    for c in 0..3 {
                        sum[c] += v[c];
                    }
                    n += 1;
                }
                if n == 0 {
                    continue;
                }
                for c in 0..3 {
                    let next = sum[c] / n as f32;
                    max_delta = max_delta.max((next - current[i][c]).abs());
                    current[i][c] = next;
                }
            }
        }
        if max_delta < CONVERGED_DELTA {
            break;
        }
    }

    for y in b.y..b.bottom() {
        for x in b.x..b.right() {
            let i = idx(x, y);
            if !masked[i] {
                continue;
            }
            let alpha = img.get_pixel(x as u32, y as u32).0[3];
            let v = current[i];
            img.put_pixel(
                x as u32,
                y as u32,
                Rgba([
                    v[0].round().clamp(0.0, 255.0) as u8,
                    v[1].round().clamp(0.0, 255.0) as u8,
                    v[2].round().clamp(0.0, 255.0) as u8,
                    alpha,
                ]),
            );
        }
    }
    sweeps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: i32, y: i32, size: u32) -> Mask {
        Mask::from_weights(MaskRect::new(x, y, size, size), vec![1.0; (size * size) as usize]).unwrap()
    }

    #[test]
    fn flat_image_is_a_fixed_point() {
        let mut img = RgbaImage::from_pixel(30, 30, Rgba([128, 128, 128, 255]));
        let original = img.clone();
        let sweeps = blend_gradient(&mut img, &square(10, 10, 8), 50);
        assert_eq!(sweeps, 1);
        assert_eq!(img, original);
    }

    #[test]
    fn hole_relaxes_to_linear_ramp() {
        let ramp = |x: u32| (x * 6) as u8;
        let mut img = RgbaImage::from_fn(40, 24, |x, _| Rgba([ramp(x), ramp(x), ramp(x), 255]));
        let mask = square(14, 8, 8);
        for (x, y, _) in mask.iter() {
            img.put_pixel(x as u32, y as u32, Rgba([0, 0, 0, 255]));
        }
        blend_gradient(&mut img, &mask, 1000);
        for (x, y, _) in mask.iter() {
            let got = img.get_pixel(x as u32, y as u32).0[0] as i32;
            let want = ramp(x as u32) as i32;
            assert!((got - want).abs() <= 2, "({x},{y}) got {got} want {want}");
        }
    }

    #[test]
    fn unmasked_pixels_are_untouched() {
        let mut img = RgbaImage::from_fn(20, 20, |x, y| Rgba([(x * 10) as u8, (y * 10) as u8, 0, 200]));
        let original = img.clone();
        let mask = square(5, 5, 4);
        blend_gradient(&mut img, &mask, 20);
        for (x, y, p) in img.enumerate_pixels() {
            if !mask.is_masked(x as i32, y as i32) {
                assert_eq!(p, original.get_pixel(x, y));
            } else {
                assert_eq!(p.0[3], 200);
            }
        }
    }

    #[test]
    fn zero_iterations_do_nothing() {
        let mut img = RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 4]));
        assert_eq!(blend_gradient(&mut img, &square(2, 2, 3), 0), 0);
    }
}
