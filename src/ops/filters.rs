// ============================================================================
// IMAGE FILTERS - separable Gaussian blur on RGBA and grayscale buffers
// ============================================================================

use image::{GrayImage, RgbaImage};
use rayon::prelude::*;

/// Largest radius `build_gaussian_kernel` honours.
pub const MAX_KERNEL_RADIUS: u32 = 1 << 16;

/// Build a normalised 1-D Gaussian kernel with `2 * radius + 1` taps
/// (radius capped at [`MAX_KERNEL_RADIUS`]). Sigma is half the radius so
/// the kernel is truncated at two sigmas.
pub fn build_gaussian_kernel(radius: u32) -> Vec<f32> {
    let radius = radius.min(MAX_KERNEL_RADIUS);
    if radius == 0 {
        return vec![1.0];
    }
    let sigma = (radius as f32 / 2.0).max(0.5);
    let r = radius as i32;
    let s2 = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-r..=r).map(|i| (-(i * i) as f32 / s2).exp()).collect();
    let sum: f32 = kernel.iter().sum();
    let inv = 1.0 / sum;
    for v in &mut kernel {
        *v *= inv;
    }
    kernel
}

/// Kernels wider than the image only repeat clamped edge samples.
fn effective_radius(radius: u32, w: u32, h: u32) -> u32 {
    radius.min(w.max(h))
}

/// Gaussian blur of all four channels (alpha included).
pub fn gaussian_blur_rgba(src: &RgbaImage, radius: u32) -> RgbaImage {
    let (w, h) = src.dimensions();
    if radius == 0 || w == 0 || h == 0 {
        return src.clone();
    }
    let data = blur_interleaved(src.as_raw(), w as usize, h as usize, 4, effective_radius(radius, w, h));
    RgbaImage::from_raw(w, h, data).unwrap_or_else(|| src.clone())
}

/// Gaussian blur of a single-channel mask.
pub fn gaussian_blur_gray(src: &GrayImage, radius: u32) -> GrayImage {
    let (w, h) = src.dimensions();
    if radius == 0 || w == 0 || h == 0 {
        return src.clone();
    }
    let data = blur_interleaved(src.as_raw(), w as usize, h as usize, 1, effective_radius(radius, w, h));
    GrayImage::from_raw(w, h, data).unwrap_or_else(|| src.clone())
}

/// Horizontal pass then vertical pass, rows in parallel, edges clamped.
fn blur_interleaved(src: &[u8], w: usize, h: usize, channels: usize, radius: u32) -> Vec<u8> {
    let kernel = build_gaussian_kernel(radius);
    let kr = kernel.len() / 2;
    let stride = w * channels;

    let buf_in: Vec<f32> = src.iter().map(|&b| b as f32).collect();

    // --- Horizontal pass ---
    let mut buf_h = vec![0.0f32; stride * h];
    buf_h.par_chunks_mut(stride).enumerate().for_each(|(y, row_out)| {
        let row_in = &buf_in[y * stride..(y + 1) * stride];
        for x in 0..w {
            for c in 0..channels {
                let mut acc = 0.0f32;
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sx = (x as isize + ki as isize - kr as isize).clamp(0, w as isize - 1) as usize;
                    acc += row_in[sx * channels + c] * kv;
                }
                row_out[x * channels + c] = acc;
            }
        }
    });

    // --- Vertical pass ---
    let mut out = vec![0u8; stride * h];
    out.par_chunks_mut(stride).enumerate().for_each(|(y, row_out)| {
        for i in 0..stride {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize + ki as isize - kr as isize).clamp(0, h as isize - 1) as usize;
                acc += buf_h[sy * stride + i] * kv;
            }
            row_out[i] = acc.round().clamp(0.0, 255.0) as u8;
        }
    });

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    #[test]
    fn kernel_is_normalised_and_symmetric() {
        for radius in [1, 2, 5, 12] {
            let k = build_gaussian_kernel(radius);
            assert_eq!(k.len(), radius as usize * 2 + 1);
            let sum: f32 = k.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            for i in 0..k.len() / 2 {
                assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn uniform_buffers_are_unchanged() {
        let rgba = RgbaImage::from_pixel(9, 7, Rgba([12, 200, 77, 255]));
        assert_eq!(gaussian_blur_rgba(&rgba, 3), rgba);
        let gray = GrayImage::from_pixel(9, 7, Luma([140]));
        assert_eq!(gaussian_blur_gray(&gray, 4), gray);
    }

    #[test]
    fn hard_edge_becomes_a_ramp() {
        let mask = GrayImage::from_fn(20, 1, |x, _| Luma([if x < 10 { 255 } else { 0 }]));
        let out = gaussian_blur_gray(&mask, 3);
        assert_eq!(out.get_pixel(0, 0)[0], 255);
        assert_eq!(out.get_pixel(19, 0)[0], 0);
        let left = out.get_pixel(9, 0)[0];
        let right = out.get_pixel(10, 0)[0];
        assert!(left < 255 && left > 128, "left of edge = {left}");
        assert!(right > 0 && right < 128, "right of edge = {right}");
    }

    #[test]
    fn oversized_radius_is_capped_to_the_image() {
        let gray = GrayImage::from_pixel(8, 8, Luma([255]));
        assert_eq!(gaussian_blur_gray(&gray, 3_000_000_000), gray);
        let rgba = RgbaImage::from_pixel(5, 3, Rgba([9, 90, 180, 255]));
        assert_eq!(gaussian_blur_rgba(&rgba, u32::MAX), rgba);
        assert_eq!(build_gaussian_kernel(u32::MAX).len(), MAX_KERNEL_RADIUS as usize * 2 + 1);
    }
}
