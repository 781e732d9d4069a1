// ============================================================================
// MASK ENGINE - one grayscale reveal/hide buffer per raster layer
// ============================================================================
//
// 255 = fully revealed, 0 = fully hidden. Buffers are created lazily, sized
// to the canvas, and keyed by layer id. Every mutator re-encodes the buffer
// into the layer's `mask` field before returning: that encoded field is the
// copy that survives serialization.
// ============================================================================

use std::collections::HashMap;

use image::{GrayImage, Luma, imageops};

use crate::error::{EngineError, EngineResult};
use crate::io::{decode_gray, encode_gray_png_or_empty};
use crate::project::{LayerId, Point, Project, RasterProps};

const REVEAL: u8 = 255;
const HIDE: u8 = 0;

struct MaskSlot {
    pixels: GrayImage,
    /// Bumped on every mutation; doubles as the content fingerprint.
    revision: u64,
}

#[derive(Default)]
pub struct MaskEngine {
    masks: HashMap<LayerId, MaskSlot>,
    next_revision: u64,
}

impl MaskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The layer's mask, created on first access.
    ///
    /// A new buffer is restored from the layer's encoded `mask` field when
    /// that decodes, otherwise filled white (black when `mask_inverted`).
    pub fn get_or_create(&mut self, project: &Project, layer_id: LayerId) -> EngineResult<&mut GrayImage> {
        Ok(&mut self.slot(project, layer_id)?.pixels)
    }

    /// Read-only view of an existing mask (never creates one).
    pub fn mask(&self, layer_id: LayerId) -> Option<&GrayImage> {
        self.masks.get(&layer_id).map(|s| &s.pixels)
    }

    /// Content fingerprint of an existing mask.
    pub fn revision(&self, layer_id: LayerId) -> Option<u64> {
        self.masks.get(&layer_id).map(|s| s.revision)
    }

    /// Flat fill: white when `reveal`, black otherwise.
    pub fn fill(&mut self, project: &mut Project, layer_id: LayerId, reveal: bool) -> EngineResult<()> {
        let value = if reveal { REVEAL } else { HIDE };
        self.mutate(project, layer_id, |mask| {
            for p in mask.pixels_mut() {
                p[0] = value;
            }
            true
        })
    }

    /// `v' = 255 - v` for every pixel.
    pub fn invert(&mut self, project: &mut Project, layer_id: LayerId) -> EngineResult<()> {
        self.mutate(project, layer_id, |mask| {
            for p in mask.pixels_mut() {
                p[0] = 255 - p[0];
            }
            true
        })
    }

    /// Stamp a soft round brush of diameter `size` centred on (x, y).
    ///
    /// Coverage falls off linearly from 1 at the centre to 0 at the rim and
    /// is blended over the existing value, so repeated dabs accumulate.
    /// A footprint entirely outside the canvas is a no-op.
    pub fn stroke_soft(
        &mut self,
        project: &mut Project,
        layer_id: LayerId,
        x: f32,
        y: f32,
        size: f32,
        reveal: bool,
    ) -> EngineResult<()> {
        let radius = size / 2.0;
        if !(radius > 0.0) || !x.is_finite() || !y.is_finite() {
            return Ok(());
        }
        let target = if reveal { REVEAL } else { HIDE } as f32;
        self.mutate(project, layer_id, |mask| {
            let (w, h) = mask.dimensions();
            let min_x = (x - radius).floor().max(0.0) as u32;
            let min_y = (y - radius).floor().max(0.0) as u32;
            let max_x = ((x + radius).ceil().max(0.0) as u32).min(w);
            let max_y = ((y + radius).ceil().max(0.0) as u32).min(h);
            let mut touched = false;
            for py in min_y..max_y {
                for px in min_x..max_x {
                    let dx = px as f32 + 0.5 - x;
                    let dy = py as f32 + 0.5 - y;
                    let dist = (dx * dx + dy * dy).sqrt();
                    if dist >= radius {
                        continue;
                    }
                    let coverage = 1.0 - dist / radius;
                    let cur = mask.get_pixel(px, py)[0] as f32;
                    let v = cur + (target - cur) * coverage;
                    mask.put_pixel(px, py, Luma([v.round().clamp(0.0, 255.0) as u8]));
                    touched = true;
                }
            }
            touched
        })
    }

    /// Rasterize each polygon in order with a flat white (reveal) or black
    /// fill; overlapping polygons simply union.
    pub fn from_polygons(
        &mut self,
        project: &mut Project,
        layer_id: LayerId,
        polygons: &[Vec<Point>],
        reveal: bool,
    ) -> EngineResult<()> {
        let value = if reveal { REVEAL } else { HIDE };
        self.mutate(project, layer_id, |mask| {
            let mut touched = false;
            for poly in polygons {
                touched |= fill_polygon(mask, poly, value) > 0;
            }
            touched
        })
    }

    /// Re-fit every mask to the current canvas: content is kept at (0,0),
    /// clipped or padded with the layer's default fill. Masks whose layer
    /// no longer exists (or is no longer raster) are dropped.
    pub fn resize(&mut self, project: &mut Project) {
        let (w, h) = project.dimensions();
        let ids: Vec<LayerId> = self.masks.keys().copied().collect();
        for id in ids {
            let inverted = match project.raster(id) {
                Ok(r) => r.mask_inverted,
                Err(_) => {
                    self.masks.remove(&id);
                    continue;
                }
            };
            let resized = match self.masks.get_mut(&id) {
                Some(slot) if slot.pixels.dimensions() != (w, h) => {
                    let mut fresh = GrayImage::from_pixel(w, h, Luma([default_value(inverted)]));
                    imageops::replace(&mut fresh, &slot.pixels, 0, 0);
                    slot.pixels = fresh;
                    self.next_revision += 1;
                    slot.revision = self.next_revision;
                    true
                }
                _ => false,
            };
            if resized {
                self.persist(project, id);
            }
        }
    }

    /// Destroy the mask together with its layer.
    pub fn remove(&mut self, layer_id: LayerId) {
        self.masks.remove(&layer_id);
    }

    /// Drop every live buffer. They are rebuilt from the encoded fields on
    /// next access.
    pub fn clear(&mut self) {
        self.masks.clear();
    }

    // ---- internals ---------------------------------------------------------

    fn slot(&mut self, project: &Project, layer_id: LayerId) -> EngineResult<&mut MaskSlot> {
        let raster = project.raster(layer_id)?;
        let (w, h) = project.dimensions();
        if w == 0 || h == 0 {
            return Err(EngineError::InvalidDimensions(format!("{}x{}", w, h)));
        }
        if !self.masks.contains_key(&layer_id) {
            let pixels = restore_or_default(raster, w, h);
            self.next_revision += 1;
            self.masks.insert(layer_id, MaskSlot { pixels, revision: self.next_revision });
        }
        self.masks.get_mut(&layer_id).ok_or(EngineError::LayerNotFound(layer_id))
    }

    /// Run `op` on the mask; when it reports a change, bump the revision
    /// and re-encode into the layer.
    fn mutate(
        &mut self,
        project: &mut Project,
        layer_id: LayerId,
        op: impl FnOnce(&mut GrayImage) -> bool,
    ) -> EngineResult<()> {
        let changed = {
            let slot = self.slot(project, layer_id)?;
            op(&mut slot.pixels)
        };
        if changed {
            self.next_revision += 1;
            if let Some(slot) = self.masks.get_mut(&layer_id) {
                slot.revision = self.next_revision;
            }
            self.persist(project, layer_id);
        }
        Ok(())
    }

    fn persist(&self, project: &mut Project, layer_id: LayerId) {
        let Some(slot) = self.masks.get(&layer_id) else { return };
        let encoded = encode_gray_png_or_empty(&slot.pixels);
        if let Ok(raster) = project.raster_mut(layer_id) {
            raster.mask = if encoded.is_empty() { None } else { Some(encoded) };
        }
    }
}

fn default_value(inverted: bool) -> u8 {
    if inverted { HIDE } else { REVEAL }
}

fn restore_or_default(raster: &RasterProps, w: u32, h: u32) -> GrayImage {
    let mut pixels = GrayImage::from_pixel(w, h, Luma([default_value(raster.mask_inverted)]));
    if let Some(bytes) = raster.mask.as_deref() {
        match decode_gray(bytes) {
            Ok(stored) => imageops::replace(&mut pixels, &stored, 0, 0),
            Err(e) => {
                crate::log_warn!("Stored mask unreadable, using default: {}", e);
            }
        }
    }
    pixels
}

/// Scanline polygon fill with pixel-centre sampling (even-odd per row).
/// Closes the polygon implicitly. Returns the number of pixels written.
pub fn fill_polygon(mask: &mut GrayImage, points: &[Point], value: u8) -> usize {
    let n = points.len();
    if n < 3 {
        return 0;
    }
    let (w, h) = mask.dimensions();
    let min_y = points.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
    let max_y = points.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max);
    if !min_y.is_finite() || !max_y.is_finite() {
        return 0;
    }
    let y_start = (min_y - 0.5).ceil().max(0.0) as u32;
    let y_end = ((max_y - 0.5).ceil().max(0.0) as u32).min(h);

    let mut written = 0;
    let mut nodes: Vec<f32> = Vec::with_capacity(8);
    for y in y_start..y_end {
        let yf = y as f32 + 0.5;
        nodes.clear();
        for i in 0..n {
            let a = points[i];
            let b = points[(i + 1) % n];
            if (a.y <= yf && b.y > yf) || (b.y <= yf && a.y > yf) {
                let t = (yf - a.y) / (b.y - a.y);
                nodes.push(a.x + t * (b.x - a.x));
            }
        }
        nodes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        for pair in nodes.chunks_exact(2) {
            // pixel x is inside when its centre x + 0.5 lies in [left, right)
            let x0 = (pair[0] - 0.5).ceil().max(0.0) as u32;
            let x1 = ((pair[1] - 0.5).ceil().max(0.0) as u32).min(w);
            for x in x0..x1 {
                mask.put_pixel(x, y, Luma([value]));
                written += 1;
            }
        }
    }
    written
}
