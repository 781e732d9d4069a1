// ============================================================================
// FLOOD FILL - scanline span fill, 4-connected
// ============================================================================
//
// One core walks the region reachable from the seed and returns a flat
// membership mask; the paint and magic-wand entry points both sit on it.
// ============================================================================

use image::{GrayImage, Rgba, RgbaImage};

/// Per-channel match: every one of R, G, B, A within `tol` of the seed.
#[inline(always)]
fn matches(p: &[u8], seed: [u8; 4], tol: u8) -> bool {
    p[0].abs_diff(seed[0]) <= tol
        && p[1].abs_diff(seed[1]) <= tol
        && p[2].abs_diff(seed[2]) <= tol
        && p[3].abs_diff(seed[3]) <= tol
}

/// Seed coordinates as buffer indices, `None` when outside.
fn seed_in_bounds(img: &RgbaImage, x: i32, y: i32) -> Option<(usize, usize)> {
    if x < 0 || y < 0 || x as u32 >= img.width() || y as u32 >= img.height() {
        return None;
    }
    Some((x as usize, y as usize))
}

/// Region reachable from (sx, sy). Returns a `w * h` mask (1 = member) and
/// the member count.
///
/// Each popped seed is widened west then east into a full run; the rows
/// directly above and below get one pushed seed per matching sub-run.
fn scan_region(raw: &[u8], w: usize, h: usize, sx: usize, sy: usize, tol: u8) -> (Vec<u8>, usize) {
    let mut region = vec![0u8; w * h];
    let px = |i: usize| &raw[i * 4..i * 4 + 4];
    let s = px(sy * w + sx);
    let seed = [s[0], s[1], s[2], s[3]];

    let mut count = 0usize;
    let mut stack: Vec<(usize, usize)> = Vec::with_capacity(256);
    stack.push((sx, sy));

    while let Some((x, y)) = stack.pop() {
        let row = y * w;
        if region[row + x] != 0 || !matches(px(row + x), seed, tol) {
            continue;
        }

        let mut lx = x;
        while lx > 0 && region[row + lx - 1] == 0 && matches(px(row + lx - 1), seed, tol) {
            lx -= 1;
        }
        let mut rx = x;
        while rx + 1 < w && region[row + rx + 1] == 0 && matches(px(row + rx + 1), seed, tol) {
            rx += 1;
        }

        for i in row + lx..=row + rx {
            region[i] = 1;
        }
        count += rx - lx + 1;

        for ny in [y.wrapping_sub(1), y + 1] {
            if ny >= h {
                continue;
            }
            let nrow = ny * w;
            let mut in_run = false;
            for nx in lx..=rx {
                let open = region[nrow + nx] == 0 && matches(px(nrow + nx), seed, tol);
                if open && !in_run {
                    stack.push((nx, ny));
                }
                in_run = open;
            }
        }
    }

    (region, count)
}

/// Paint the region around (x, y) with `color` in place.
///
/// Returns how many pixels were written. Out-of-bounds seeds and a fill
/// colour identical to the seed pixel both return 0 without scanning.
pub fn flood_fill(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>, tolerance: u8) -> usize {
    let Some((sx, sy)) = seed_in_bounds(img, x, y) else {
        return 0;
    };
    if *img.get_pixel(sx as u32, sy as u32) == color {
        return 0;
    }

    let (w, h) = (img.width() as usize, img.height() as usize);
    let (region, count) = scan_region(img.as_raw(), w, h, sx, sy, tolerance);

    let raw: &mut [u8] = img.as_mut();
    for (i, member) in region.iter().enumerate() {
        if *member != 0 {
            raw[i * 4..i * 4 + 4].copy_from_slice(&color.0);
        }
    }
    count
}

/// Magic-wand variant: takes ownership of a buffer and returns the reached
/// region as a 0/1 mask of the same size. The buffer is consumed.
pub fn flood_mask(img: RgbaImage, x: i32, y: i32, tolerance: u8) -> GrayImage {
    let (w, h) = img.dimensions();
    let Some((sx, sy)) = seed_in_bounds(&img, x, y) else {
        return GrayImage::new(w, h);
    };
    let (region, _) = scan_region(img.as_raw(), w as usize, h as usize, sx, sy, tolerance);
    GrayImage::from_raw(w, h, region).unwrap_or_else(|| GrayImage::new(w, h))
}
