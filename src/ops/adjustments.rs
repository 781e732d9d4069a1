// ============================================================================
// ADJUSTMENT PIPELINE - brightness → contrast → saturation/hue → invert
// ============================================================================
//
// Pure function over an RGBA8 buffer. The stage order is fixed. Alpha
// passes through every stage untouched. Rows are processed in parallel
// via rayon.
// ============================================================================

use image::RgbaImage;
use rayon::prelude::*;

use crate::project::Adjustments;

/// Run the pipeline and return a new buffer.
pub fn apply_adjustments(src: &RgbaImage, params: &Adjustments) -> RgbaImage {
    let mut out = src.clone();
    apply_adjustments_in_place(&mut out, params);
    out
}

/// Run the pipeline over `img` in place. Identity parameters return
/// without touching a single pixel.
pub fn apply_adjustments_in_place(img: &mut RgbaImage, params: &Adjustments) {
    if params.is_identity() {
        return;
    }
    let w = img.width() as usize;
    if w == 0 || img.height() == 0 {
        return;
    }
    let stage = PixelStage::new(params);
    let stride = w * 4;
    let raw: &mut [u8] = img.as_mut();
    raw.par_chunks_mut(stride).for_each(|row| {
        for px in row.chunks_exact_mut(4) {
            let (r, g, b) = stage.apply(px[0] as f32, px[1] as f32, px[2] as f32);
            px[0] = to_channel(r);
            px[1] = to_channel(g);
            px[2] = to_channel(b);
        }
    });
}

/// Contrast multiplier for `contrast` in -1..=1 (scaled to the classic
/// -255..=255 range before use).
pub fn contrast_factor(contrast: f32) -> f32 {
    let c = (contrast * 255.0).clamp(-255.0, 255.0);
    (259.0 * (c + 255.0)) / (255.0 * (259.0 - c))
}

/// Precomputed per-call constants for the per-pixel transform.
struct PixelStage {
    brightness_offset: f32,
    contrast: Option<f32>,
    sat_factor: f32,
    hue_shift: f32,
    hsl: bool,
    invert: bool,
}

impl PixelStage {
    fn new(params: &Adjustments) -> Self {
        Self {
            brightness_offset: 255.0 * params.brightness,
            contrast: (params.contrast != 0.0).then(|| contrast_factor(params.contrast)),
            sat_factor: 1.0 + params.saturation,
            hue_shift: params.hue / 360.0,
            hsl: params.saturation != 0.0 || params.hue != 0.0,
            invert: params.invert,
        }
    }

    fn apply(&self, r: f32, g: f32, b: f32) -> (f32, f32, f32) {
        let (mut r, mut g, mut b) = (
            r + self.brightness_offset,
            g + self.brightness_offset,
            b + self.brightness_offset,
        );

        if let Some(cf) = self.contrast {
            r = cf * (r - 128.0) + 128.0;
            g = cf * (g - 128.0) + 128.0;
            b = cf * (b - 128.0) + 128.0;
        }

        if self.hsl {
            let (h, s, l) = rgb_to_hsl(
                r.clamp(0.0, 255.0) / 255.0,
                g.clamp(0.0, 255.0) / 255.0,
                b.clamp(0.0, 255.0) / 255.0,
            );
            let nh = (h + self.hue_shift).rem_euclid(1.0);
            let ns = (s * self.sat_factor).clamp(0.0, 1.0);
            let (nr, ng, nb) = hsl_to_rgb(nh, ns, l);
            r = nr * 255.0;
            g = ng * 255.0;
            b = nb * 255.0;
        }

        if self.invert {
            r = 255.0 - r.clamp(0.0, 255.0);
            g = 255.0 - g.clamp(0.0, 255.0);
            b = 255.0 - b.clamp(0.0, 255.0);
        }

        (r, g, b)
    }
}

#[inline]
fn to_channel(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

// ============================================================================
// COLOR SPACE HELPERS
// ============================================================================

/// RGB (0..1) → HSL (H: 0..1, S: 0..1, L: 0..1)
pub fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };

    let h = if (max - r).abs() < 1e-6 {
        let mut h = (g - b) / d;
        if h < 0.0 { h += 6.0; }
        h / 6.0
    } else if (max - g).abs() < 1e-6 {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    };

    (h, s, l)
}

/// HSL (H: 0..1, S: 0..1, L: 0..1) → RGB (0..1)
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s.abs() < 1e-6 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 { return p + (q - p) * 6.0 * t; }
    if t < 1.0 / 2.0 { return q; }
    if t < 2.0 / 3.0 { return p + (q - p) * (2.0 / 3.0 - t) * 6.0; }
    p
}
