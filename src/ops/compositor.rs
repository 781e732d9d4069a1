// ============================================================================
// COMPOSITOR - per-layer render cache, layer blending, flatten / thumbnail
// ============================================================================
//
// A rendered layer is surface -> mask (destination-in) -> adjustments, in
// that order. Results are cached by layer id; an entry is reused only while
// its RenderKey still matches, so nothing ever has to invalidate it.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::canvas::RasterSurfaceManager;
use crate::error::EngineResult;
use crate::ops::adjustments::apply_adjustments_in_place;
use crate::ops::mask::MaskEngine;
use crate::project::{BlendMode, Layer, LayerContent, LayerId, Project, Transform};

pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 256;

/// Draws layers the engine cannot rasterize itself (text, shapes).
///
/// `scale` is the factor the whole flatten is rendered at; positions, sizes
/// and font metrics must be multiplied by it.
pub trait OverlayRenderer {
    fn render_layer(&self, layer: &Layer, scale: f32, target: &mut RgbaImage);
}

/// Skips every non-raster layer.
pub struct NoOverlay;

impl OverlayRenderer for NoOverlay {
    fn render_layer(&self, _layer: &Layer, _scale: f32, _target: &mut RgbaImage) {}
}

/// Everything a rendered layer depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RenderKey {
    width: u32,
    height: u32,
    surface_rev: u64,
    mask_enabled: bool,
    mask_rev: Option<u64>,
    adjustments: [u32; 5],
}

#[derive(Default)]
pub struct Compositor {
    cache: HashMap<LayerId, (RenderKey, Arc<RgbaImage>)>,
    /// Times the adjustment pipeline actually ran (cache misses with
    /// non-identity parameters).
    pipeline_runs: usize,
}

impl Compositor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline_runs(&self) -> usize {
        self.pipeline_runs
    }

    /// Rendered pixels of one raster layer, from cache when still valid.
    pub fn render(
        &mut self,
        project: &Project,
        layer_id: LayerId,
        surfaces: &mut RasterSurfaceManager,
        masks: &mut MaskEngine,
    ) -> EngineResult<Arc<RgbaImage>> {
        let raster = project.raster(layer_id)?;
        let (surface, surface_rev) = surfaces.view(layer_id, project)?;

        let mask_rev = if raster.mask_enabled {
            masks.get_or_create(project, layer_id)?;
            masks.revision(layer_id)
        } else {
            None
        };
        let key = RenderKey {
            width: surface.width(),
            height: surface.height(),
            surface_rev,
            mask_enabled: raster.mask_enabled,
            mask_rev,
            adjustments: raster.adjustments.cache_bits(),
        };
        if let Some((cached_key, img)) = self.cache.get(&layer_id)
            && *cached_key == key
        {
            return Ok(Arc::clone(img));
        }

        let mut out = surface.clone();
        if raster.mask_enabled
            && let Some(mask) = masks.mask(layer_id)
        {
            destination_in(&mut out, mask);
        }
        if !raster.adjustments.is_identity() {
            apply_adjustments_in_place(&mut out, &raster.adjustments);
            self.pipeline_runs += 1;
        }

        let out = Arc::new(out);
        self.cache.insert(layer_id, (key, Arc::clone(&out)));
        Ok(out)
    }

    pub fn remove(&mut self, layer_id: LayerId) {
        self.cache.remove(&layer_id);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Composite every visible layer, bottom-most first, onto the project
    /// background at `scale` (output size `canvas * scale`, at least 1x1).
    pub fn flatten(
        &mut self,
        project: &Project,
        surfaces: &mut RasterSurfaceManager,
        masks: &mut MaskEngine,
        overlay: &dyn OverlayRenderer,
        scale: f32,
    ) -> EngineResult<RgbaImage> {
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        let out_w = ((project.width as f32 * scale).round() as u32).max(1);
        let out_h = ((project.height as f32 * scale).round() as u32).max(1);
        let mut out = RgbaImage::from_pixel(out_w, out_h, Rgba(project.background));

        for layer in project.layers.iter().rev() {
            if !layer.visible || layer.opacity <= 0.0 {
                continue;
            }
            match &layer.content {
                LayerContent::Raster(_) => {
                    let rendered = self.render(project, layer.id, surfaces, masks)?;
                    composite_layer(&mut out, &rendered, &layer.transform, scale, layer.opacity, layer.blend_mode);
                }
                LayerContent::Text(_) | LayerContent::Shape(_) => {
                    overlay.render_layer(layer, scale, &mut out);
                }
            }
        }
        Ok(out)
    }

    /// Flatten scaled so the width is at most `max_width`. Never upscales.
    pub fn render_thumbnail(
        &mut self,
        project: &Project,
        surfaces: &mut RasterSurfaceManager,
        masks: &mut MaskEngine,
        overlay: &dyn OverlayRenderer,
        max_width: u32,
    ) -> EngineResult<RgbaImage> {
        let scale = thumbnail_scale(project.width, max_width);
        self.flatten(project, surfaces, masks, overlay, scale)
    }
}

pub fn thumbnail_scale(canvas_width: u32, max_width: u32) -> f32 {
    if canvas_width == 0 || max_width == 0 {
        return 1.0;
    }
    (max_width as f32 / canvas_width as f32).min(1.0)
}

/// `alpha' = alpha * mask / 255`; colour untouched.
fn destination_in(img: &mut RgbaImage, mask: &image::GrayImage) {
    let (mw, mh) = mask.dimensions();
    let w = img.width() as usize;
    if w == 0 {
        return;
    }
    let raw: &mut [u8] = img.as_mut();
    raw.par_chunks_mut(w * 4).enumerate().for_each(|(y, row)| {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let m = if (x as u32) < mw && (y as u32) < mh {
                mask.get_pixel(x as u32, y as u32)[0] as u32
            } else {
                0
            };
            px[3] = ((px[3] as u32 * m + 127) / 255) as u8;
        }
    });
}

/// Inverse-map every output pixel through `scale` and the layer transform,
/// nearest-neighbour sample the layer, and blend it in.
fn composite_layer(
    out: &mut RgbaImage,
    layer: &RgbaImage,
    transform: &Transform,
    scale: f32,
    opacity: f32,
    mode: BlendMode,
) {
    let (lw, lh) = (layer.width() as f32, layer.height() as f32);
    let w = out.width() as usize;
    let raw: &mut [u8] = out.as_mut();
    raw.par_chunks_mut(w * 4).enumerate().for_each(|(oy, row)| {
        let cy = (oy as f32 + 0.5) / scale;
        for (ox, px) in row.chunks_exact_mut(4).enumerate() {
            let cx = (ox as f32 + 0.5) / scale;
            let Some((lx, ly)) = transform.to_local(cx, cy) else { continue };
            if lx < 0.0 || ly < 0.0 || lx >= lw || ly >= lh {
                continue;
            }
            let top = *layer.get_pixel(lx as u32, ly as u32);
            let base = Rgba([px[0], px[1], px[2], px[3]]);
            px.copy_from_slice(&blend_pixel(base, top, mode, opacity).0);
        }
    });
}

/// Blend `top` over `base` with the layer's mode and opacity
/// (non-premultiplied, source-over alpha).
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel - nothing to blend
    if top[3] == 0 {
        return base;
    }

    // Fast path: Normal blend, full opacity, fully opaque top pixel - just overwrite
    if mode == BlendMode::Normal && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;

    let (r, g, b) = match mode {
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        BlendMode::Screen => (
            1.0 - (1.0 - base_r) * (1.0 - top_r),
            1.0 - (1.0 - base_g) * (1.0 - top_g),
            1.0 - (1.0 - base_b) * (1.0 - top_b),
        ),
        BlendMode::Overlay => (
            overlay_channel(base_r, top_r),
            overlay_channel(base_g, top_g),
            overlay_channel(base_b, top_b),
        ),
        BlendMode::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        BlendMode::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
        BlendMode::Difference => ((base_r - top_r).abs(), (base_g - top_g).abs(), (base_b - top_b).abs()),
        BlendMode::Additive => (
            (base_r + top_r).min(1.0),
            (base_g + top_g).min(1.0),
            (base_b + top_b).min(1.0),
        ),
    };

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    Rgba([
        (out_r * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_g * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_b * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}
