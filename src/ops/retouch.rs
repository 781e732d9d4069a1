// ============================================================================
// RETOUCH - spot heal (blur + radial feather blend)
// ============================================================================

use image::{RgbaImage, imageops};

use crate::error::{EngineError, EngineResult};
use crate::ops::filters::gaussian_blur_rgba;

pub const MIN_HEAL_RADIUS: f32 = 2.0;

/// Per-pass blur kernel radius for a brush of radius `r`: `max(1, floor(0.6 r))`.
pub fn heal_kernel_radius(radius: f32) -> u32 {
    ((radius * 0.6).floor() as u32).max(1)
}

/// Heal the disc of `radius` around (cx, cy) in place.
///
/// The disc is replaced by a blurred copy of itself, weighted
/// `(1 - d/r)^2` so the centre is fully healed and the rim untouched.
/// Only RGB is blended; alpha never changes. Returns the number of pixels
/// inside the footprint (0 when the disc misses the buffer).
pub fn spot_heal(img: &mut RgbaImage, cx: f32, cy: f32, radius: f32) -> EngineResult<usize> {
    if !(radius >= MIN_HEAL_RADIUS) || !radius.is_finite() {
        return Err(EngineError::InvalidParameter(format!(
            "heal radius {} (minimum {})",
            radius, MIN_HEAL_RADIUS
        )));
    }
    if !cx.is_finite() || !cy.is_finite() {
        return Err(EngineError::InvalidParameter(format!("heal centre ({}, {})", cx, cy)));
    }
    let (w, h) = img.dimensions();
    let kr = heal_kernel_radius(radius).min(w.max(h));

    // Footprint bbox, then padded by the kernel so the blur sees real
    // neighbours around the disc.
    let fx0 = (cx - radius).floor().max(0.0) as u32;
    let fy0 = (cy - radius).floor().max(0.0) as u32;
    let fx1 = ((cx + radius).ceil().max(0.0) as u32).min(w);
    let fy1 = ((cy + radius).ceil().max(0.0) as u32).min(h);
    if fx0 >= fx1 || fy0 >= fy1 {
        return Ok(0);
    }
    let px0 = fx0.saturating_sub(kr);
    let py0 = fy0.saturating_sub(kr);
    let px1 = fx1.saturating_add(kr).min(w);
    let py1 = fy1.saturating_add(kr).min(h);

    let patch = imageops::crop_imm(img, px0, py0, px1 - px0, py1 - py0).to_image();
    let blurred = gaussian_blur_rgba(&patch, kr);

    let mut touched = 0;
    for y in fy0..fy1 {
        for x in fx0..fx1 {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            let t = (dx * dx + dy * dy).sqrt() / radius;
            if t >= 1.0 {
                continue;
            }
            let wgt = (1.0 - t) * (1.0 - t);
            let soft = blurred.get_pixel(x - px0, y - py0);
            let p = img.get_pixel_mut(x, y);
            for c in 0..3 {
                let v = p[c] as f32 * (1.0 - wgt) + soft[c] as f32 * wgt;
                p[c] = v.round().clamp(0.0, 255.0) as u8;
            }
            touched += 1;
        }
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn speckled() -> RgbaImage {
        let mut img = RgbaImage::from_pixel(40, 40, Rgba([100, 100, 100, 200]));
        img.put_pixel(20, 20, Rgba([255, 0, 0, 90]));
        img
    }

    #[test]
    fn kernel_radius_rule() {
        assert_eq!(heal_kernel_radius(2.0), 1);
        assert_eq!(heal_kernel_radius(10.0), 6);
        assert_eq!(heal_kernel_radius(25.0), 15);
    }

    #[test]
    fn blemish_is_pulled_toward_its_surroundings() {
        let mut img = speckled();
        let touched = spot_heal(&mut img, 20.5, 20.5, 8.0).unwrap();
        assert!(touched > 150);
        let p = img.get_pixel(20, 20);
        assert!(p[0] < 160, "red channel still {}", p[0]);
        assert!(p[1] > 60, "green channel still {}", p[1]);
    }

    #[test]
    fn alpha_is_never_touched() {
        let mut img = speckled();
        let before = img.clone();
        spot_heal(&mut img, 20.5, 20.5, 8.0).unwrap();
        for (a, b) in before.pixels().zip(img.pixels()) {
            assert_eq!(a[3], b[3]);
        }
        assert_eq!(img.get_pixel(20, 20)[3], 90);
    }

    #[test]
    fn pixels_outside_the_disc_are_unchanged() {
        let mut img = speckled();
        img.put_pixel(5, 5, Rgba([0, 255, 0, 255]));
        spot_heal(&mut img, 20.5, 20.5, 8.0).unwrap();
        assert_eq!(*img.get_pixel(5, 5), Rgba([0, 255, 0, 255]));
        assert_eq!(*img.get_pixel(29, 20), Rgba([100, 100, 100, 200]));
    }

    #[test]
    fn uniform_area_stays_uniform() {
        let mut img = RgbaImage::from_pixel(16, 16, Rgba([30, 60, 90, 255]));
        let before = img.clone();
        spot_heal(&mut img, 8.0, 8.0, 5.0).unwrap();
        assert_eq!(img, before);
    }

    #[test]
    fn tiny_radius_is_rejected_and_offscreen_is_a_noop() {
        let mut img = speckled();
        assert!(spot_heal(&mut img, 20.0, 20.0, 1.5).is_err());
        assert_eq!(spot_heal(&mut img, -100.0, -100.0, 5.0).unwrap(), 0);
        assert_eq!(img, speckled());
    }

    #[test]
    fn huge_radius_heals_the_whole_buffer() {
        let mut img = speckled();
        let before = img.clone();
        let touched = spot_heal(&mut img, 5.0, 5.0, 1e10).unwrap();
        assert_eq!(touched, (img.width() * img.height()) as usize);
        assert_ne!(img, before);
        assert!(img.pixels().zip(before.pixels()).all(|(a, b)| a[3] == b[3]));
    }
}
