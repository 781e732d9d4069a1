// ============================================================================
// RASTER SURFACES - one RGBA8 buffer per raster layer, sized to the canvas
// ============================================================================
//
// Surfaces are created on first access. A layer with a source gets its
// pixels decoded on the rayon pool; the blank buffer is usable right away
// and the decoded image lands on the next `poll_decodes()`.
// ============================================================================

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::error::{EngineError, EngineResult};
use crate::io::{EncodedSurfaces, decode_rgba, encode_rgba_png_or_empty};
use crate::project::{LayerId, Project, SourceRef};

struct SurfaceSlot {
    pixels: RgbaImage,
    /// Bumped on every mutable access; part of the render cache key.
    revision: u64,
    /// Ticket of the decode still owed to this slot, if any.
    pending_decode: Option<u64>,
}

/// Result delivered from a background source decode.
struct DecodedSource {
    layer_id: LayerId,
    ticket: u64,
    /// Fitted image plus its top-left offset on the canvas.
    result: Result<(RgbaImage, i64, i64), String>,
}

pub struct RasterSurfaceManager {
    surfaces: HashMap<LayerId, SurfaceSlot>,
    next_revision: u64,
    next_ticket: u64,
    pending: usize,
    decode_sender: mpsc::Sender<DecodedSource>,
    decode_receiver: mpsc::Receiver<DecodedSource>,
}

impl Default for RasterSurfaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterSurfaceManager {
    pub fn new() -> Self {
        let (decode_sender, decode_receiver) = mpsc::channel();
        Self {
            surfaces: HashMap::new(),
            next_revision: 0,
            next_ticket: 0,
            pending: 0,
            decode_sender,
            decode_receiver,
        }
    }

    /// Mutable surface for `layer_id`, allocated on first access.
    ///
    /// Counts as a modification: the revision is bumped so any cached
    /// render of this layer goes stale.
    pub fn get(&mut self, layer_id: LayerId, project: &Project) -> EngineResult<&mut RgbaImage> {
        self.ensure(layer_id, project)?;
        let revision = self.bump();
        let slot = self.surfaces.get_mut(&layer_id).ok_or(EngineError::LayerNotFound(layer_id))?;
        slot.revision = revision;
        Ok(&mut slot.pixels)
    }

    /// Run `op` on the surface; the revision is bumped only when it
    /// reports a non-zero number of changed pixels.
    pub fn edit(
        &mut self,
        layer_id: LayerId,
        project: &Project,
        op: impl FnOnce(&mut RgbaImage) -> usize,
    ) -> EngineResult<usize> {
        self.ensure(layer_id, project)?;
        let slot = self.surfaces.get_mut(&layer_id).ok_or(EngineError::LayerNotFound(layer_id))?;
        let changed = op(&mut slot.pixels);
        if changed > 0 {
            self.next_revision += 1;
            slot.revision = self.next_revision;
        }
        Ok(changed)
    }

    /// Read access plus the current revision. Allocates like `get` but
    /// leaves the revision alone.
    pub fn view(&mut self, layer_id: LayerId, project: &Project) -> EngineResult<(&RgbaImage, u64)> {
        self.ensure(layer_id, project)?;
        let slot = self.surfaces.get(&layer_id).ok_or(EngineError::LayerNotFound(layer_id))?;
        Ok((&slot.pixels, slot.revision))
    }

    /// Existing surface, never allocates.
    pub fn surface(&self, layer_id: LayerId) -> Option<&RgbaImage> {
        self.surfaces.get(&layer_id).map(|s| &s.pixels)
    }

    pub fn revision(&self, layer_id: LayerId) -> Option<u64> {
        self.surfaces.get(&layer_id).map(|s| s.revision)
    }

    /// Install an already-decoded buffer as the layer's pixels. It is drawn
    /// at (0,0) into a canvas-sized surface (clipped or transparent-padded).
    /// Any decode still in flight for this layer is abandoned.
    pub fn attach(&mut self, layer_id: LayerId, image: RgbaImage, project: &Project) -> EngineResult<()> {
        project.raster(layer_id)?;
        let (w, h) = checked_canvas(project)?;
        let pixels = if image.dimensions() == (w, h) {
            image
        } else {
            let mut fitted = RgbaImage::new(w, h);
            imageops::replace(&mut fitted, &image, 0, 0);
            fitted
        };
        let revision = self.bump();
        if let Some(old) = self.surfaces.insert(layer_id, SurfaceSlot { pixels, revision, pending_decode: None })
            && old.pending_decode.is_some()
        {
            crate::log_info!("Source decode for layer {} superseded by attach", layer_id);
        }
        Ok(())
    }

    /// Re-fit every surface to the current canvas size. Content stays at
    /// (0,0) and is clipped or padded, never rescaled.
    pub fn resize(&mut self, project: &Project) {
        let (w, h) = project.dimensions();
        let mut revision = self.next_revision;
        for slot in self.surfaces.values_mut() {
            if slot.pixels.dimensions() == (w, h) {
                continue;
            }
            let mut fresh = RgbaImage::new(w, h);
            imageops::replace(&mut fresh, &slot.pixels, 0, 0);
            slot.pixels = fresh;
            revision += 1;
            slot.revision = revision;
        }
        self.next_revision = revision;
    }

    /// Destroy a layer's surface (pending decodes for it are dropped on arrival).
    pub fn remove(&mut self, layer_id: LayerId) {
        self.surfaces.remove(&layer_id);
    }

    /// Drop every surface. The next access re-creates them from each
    /// layer's source.
    pub fn clear(&mut self) {
        self.surfaces.clear();
    }

    /// PNG-encode every live surface for a snapshot, ordered by layer id.
    /// The project is left alone. Surfaces still waiting on their decode
    /// are skipped; their source already describes them.
    pub fn encode_surfaces(&self) -> EncodedSurfaces {
        let mut encoded: EncodedSurfaces = self
            .surfaces
            .iter()
            .filter(|(_, slot)| slot.pending_decode.is_none())
            .map(|(id, slot)| (*id, encode_rgba_png_or_empty(&slot.pixels)))
            .filter(|(_, bytes)| !bytes.is_empty())
            .collect();
        encoded.sort_by_key(|(id, _)| *id);
        encoded
    }

    /// Re-create a layer's surface from pixels captured by
    /// `encode_surfaces`. The buffer starts blank and the decode lands on
    /// the rayon pool like any source decode.
    pub fn restore_encoded(&mut self, layer_id: LayerId, bytes: Vec<u8>, project: &Project) -> EngineResult<()> {
        project.raster(layer_id)?;
        let (w, h) = checked_canvas(project)?;
        let ticket = self.spawn_decode(layer_id, bytes, w, h);
        let revision = self.bump();
        self.surfaces.insert(
            layer_id,
            SurfaceSlot { pixels: RgbaImage::new(w, h), revision, pending_decode: Some(ticket) },
        );
        Ok(())
    }

    /// Colour under canvas point (x, y): the first visible raster layer, in
    /// array order (topmost first), whose pixel there is not fully
    /// transparent. Layers without a live surface count as empty.
    pub fn sample_color_at(&self, project: &Project, x: f32, y: f32) -> Option<Rgba<u8>> {
        for layer in &project.layers {
            if !layer.visible || !layer.is_raster() {
                continue;
            }
            let Some(slot) = self.surfaces.get(&layer.id) else { continue };
            let Some((lx, ly)) = layer.transform.to_local(x, y) else { continue };
            if lx < 0.0 || ly < 0.0 || lx >= slot.pixels.width() as f32 || ly >= slot.pixels.height() as f32 {
                continue;
            }
            let p = *slot.pixels.get_pixel(lx as u32, ly as u32);
            if p[3] > 0 {
                return Some(p);
            }
        }
        None
    }

    // ---- async source decode ----------------------------------------------

    pub fn pending_decodes(&self) -> usize {
        self.pending
    }

    /// Apply every decode that has finished. Returns how many landed.
    pub fn poll_decodes(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(done) = self.decode_receiver.try_recv() {
            self.pending = self.pending.saturating_sub(1);
            applied += self.apply_decode(done) as usize;
        }
        applied
    }

    /// Block until no decode is outstanding or `timeout` passes between two
    /// arrivals. Returns how many landed.
    pub fn wait_for_decodes(&mut self, timeout: Duration) -> usize {
        let mut applied = 0;
        while self.pending > 0 {
            match self.decode_receiver.recv_timeout(timeout) {
                Ok(done) => {
                    self.pending -= 1;
                    applied += self.apply_decode(done) as usize;
                }
                Err(_) => {
                    crate::log_warn!("Timed out waiting for {} source decode(s)", self.pending);
                    break;
                }
            }
        }
        applied
    }

    // ---- internals ---------------------------------------------------------

    fn bump(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    fn ensure(&mut self, layer_id: LayerId, project: &Project) -> EngineResult<()> {
        let raster = project.raster(layer_id)?;
        if self.surfaces.contains_key(&layer_id) {
            return Ok(());
        }
        let (w, h) = checked_canvas(project)?;

        let pending_decode = match &raster.source {
            Some(source) => match project.resolve_source(source) {
                Some(bytes) => Some(self.spawn_decode(layer_id, bytes.to_vec(), w, h)),
                None => {
                    if let SourceRef::Asset(key) = source {
                        crate::log_warn!("Layer {} references missing asset '{}'", layer_id, key);
                    }
                    None
                }
            },
            None => None,
        };

        let revision = self.bump();
        self.surfaces.insert(
            layer_id,
            SurfaceSlot { pixels: RgbaImage::new(w, h), revision, pending_decode },
        );
        Ok(())
    }

    fn spawn_decode(&mut self, layer_id: LayerId, bytes: Vec<u8>, canvas_w: u32, canvas_h: u32) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.pending += 1;
        let sender = self.decode_sender.clone();
        rayon::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                decode_and_fit(&bytes, canvas_w, canvas_h)
            }))
            .unwrap_or_else(|_| Err("decoder panicked".to_string()));
            let _ = sender.send(DecodedSource { layer_id, ticket, result });
        });
        ticket
    }

    fn apply_decode(&mut self, done: DecodedSource) -> bool {
        let Some(slot) = self.surfaces.get_mut(&done.layer_id) else {
            return false;
        };
        if slot.pending_decode != Some(done.ticket) {
            return false;
        }
        slot.pending_decode = None;
        match done.result {
            Ok((image, x, y)) => {
                imageops::overlay(&mut slot.pixels, &image, x, y);
                self.next_revision += 1;
                slot.revision = self.next_revision;
                true
            }
            Err(e) => {
                crate::log_warn!("Source decode failed for layer {}: {}", done.layer_id, e);
                false
            }
        }
    }
}

fn checked_canvas(project: &Project) -> EngineResult<(u32, u32)> {
    let (w, h) = project.dimensions();
    if w == 0 || h == 0 {
        return Err(EngineError::InvalidDimensions(format!("{}x{}", w, h)));
    }
    Ok((w, h))
}

/// Decode and scale to fit inside the canvas (aspect preserved, centred).
fn decode_and_fit(bytes: &[u8], canvas_w: u32, canvas_h: u32) -> Result<(RgbaImage, i64, i64), String> {
    let img = decode_rgba(bytes).map_err(|e| e.to_string())?;
    let (iw, ih) = img.dimensions();
    if iw == 0 || ih == 0 {
        return Err("empty image".to_string());
    }
    let scale = (canvas_w as f32 / iw as f32).min(canvas_h as f32 / ih as f32);
    let nw = ((iw as f32 * scale).round() as u32).clamp(1, canvas_w);
    let nh = ((ih as f32 * scale).round() as u32).clamp(1, canvas_h);
    let img = if (nw, nh) == (iw, ih) {
        img
    } else {
        imageops::resize(&img, nw, nh, FilterType::Triangle)
    };
    let x = (canvas_w as i64 - img.width() as i64) / 2;
    let y = (canvas_h as i64 - img.height() as i64) / 2;
    Ok((img, x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::encode_rgba_png;
    use crate::project::{Layer, Transform};

    const WAIT: Duration = Duration::from_secs(10);

    fn project_with_layer(w: u32, h: u32) -> (Project, LayerId) {
        let mut project = Project::new(w, h);
        let layer = Layer::new_raster("Layer 1");
        let id = layer.id;
        project.layers.push(layer);
        (project, id)
    }

    #[test]
    fn surfaces_are_lazy_and_canvas_sized() {
        let (project, id) = project_with_layer(12, 7);
        let mut surfaces = RasterSurfaceManager::new();
        assert!(surfaces.surface(id).is_none());
        let s = surfaces.get(id, &project).unwrap();
        assert_eq!(s.dimensions(), (12, 7));
        assert!(s.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn get_bumps_revision_view_does_not() {
        let (project, id) = project_with_layer(4, 4);
        let mut surfaces = RasterSurfaceManager::new();
        let (_, r0) = surfaces.view(id, &project).unwrap();
        let (_, r1) = surfaces.view(id, &project).unwrap();
        assert_eq!(r0, r1);
        surfaces.get(id, &project).unwrap();
        assert!(surfaces.revision(id).unwrap() > r1);
    }

    #[test]
    fn non_raster_and_unknown_layers_are_errors() {
        let (project, _) = project_with_layer(4, 4);
        let mut surfaces = RasterSurfaceManager::new();
        assert!(surfaces.get(uuid::Uuid::new_v4(), &project).is_err());
    }

    #[test]
    fn source_is_decoded_and_fitted() {
        let (mut project, id) = project_with_layer(20, 10);
        let src = RgbaImage::from_pixel(10, 10, Rgba([0, 200, 0, 255]));
        project.raster_mut(id).unwrap().source = Some(SourceRef::Embedded(encode_rgba_png(&src).unwrap()));

        let mut surfaces = RasterSurfaceManager::new();
        surfaces.get(id, &project).unwrap();
        assert_eq!(surfaces.pending_decodes(), 1);
        assert_eq!(surfaces.wait_for_decodes(WAIT), 1);

        let s = surfaces.surface(id).unwrap();
        // 10x10 fits a 20x10 canvas unscaled, centred horizontally
        assert_eq!(s.get_pixel(4, 5)[3], 0);
        assert_eq!(*s.get_pixel(5, 5), Rgba([0, 200, 0, 255]));
        assert_eq!(*s.get_pixel(14, 0), Rgba([0, 200, 0, 255]));
        assert_eq!(s.get_pixel(15, 5)[3], 0);
    }

    #[test]
    fn source_from_asset_map() {
        let (mut project, id) = project_with_layer(4, 4);
        let src = RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]));
        project.assets.insert("photo".into(), encode_rgba_png(&src).unwrap());
        project.raster_mut(id).unwrap().source = Some(SourceRef::Asset("photo".into()));

        let mut surfaces = RasterSurfaceManager::new();
        surfaces.get(id, &project).unwrap();
        surfaces.wait_for_decodes(WAIT);
        assert_eq!(surfaces.surface(id).unwrap(), &src);
    }

    #[test]
    fn bad_source_leaves_a_blank_surface() {
        let (mut project, id) = project_with_layer(6, 6);
        project.raster_mut(id).unwrap().source = Some(SourceRef::Embedded(b"not a png".to_vec()));
        let mut surfaces = RasterSurfaceManager::new();
        surfaces.get(id, &project).unwrap();
        assert_eq!(surfaces.wait_for_decodes(WAIT), 0);
        assert_eq!(surfaces.pending_decodes(), 0);
        assert!(surfaces.surface(id).unwrap().pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn attach_supersedes_an_inflight_decode() {
        let (mut project, id) = project_with_layer(4, 4);
        let src = RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        project.raster_mut(id).unwrap().source = Some(SourceRef::Embedded(encode_rgba_png(&src).unwrap()));
        let mut surfaces = RasterSurfaceManager::new();
        surfaces.get(id, &project).unwrap();
        let blue = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255]));
        surfaces.attach(id, blue.clone(), &project).unwrap();
        surfaces.wait_for_decodes(WAIT);
        assert_eq!(surfaces.surface(id).unwrap(), &blue);
    }

    #[test]
    fn resize_clips_and_pads_without_scaling() {
        let (mut project, id) = project_with_layer(4, 4);
        let mut surfaces = RasterSurfaceManager::new();
        surfaces.attach(id, RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255])), &project).unwrap();
        project.width = 6;
        project.height = 2;
        surfaces.resize(&project);
        let s = surfaces.surface(id).unwrap();
        assert_eq!(s.dimensions(), (6, 2));
        assert_eq!(*s.get_pixel(3, 1), Rgba([9, 9, 9, 255]));
        assert_eq!(s.get_pixel(4, 0)[3], 0);
    }

    #[test]
    fn sample_prefers_topmost_opaque_pixel() {
        let mut project = Project::new(4, 4);
        let top = Layer::new_raster("Top");
        let bottom = Layer::new_raster("Bottom");
        let (top_id, bottom_id) = (top.id, bottom.id);
        project.layers.push(top);
        project.layers.push(bottom);

        let mut surfaces = RasterSurfaceManager::new();
        let mut top_px = RgbaImage::new(4, 4);
        top_px.put_pixel(1, 1, Rgba([255, 0, 0, 255]));
        surfaces.attach(top_id, top_px, &project).unwrap();
        surfaces.attach(bottom_id, RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255])), &project).unwrap();

        assert_eq!(surfaces.sample_color_at(&project, 1.5, 1.5), Some(Rgba([255, 0, 0, 255])));
        assert_eq!(surfaces.sample_color_at(&project, 3.0, 3.0), Some(Rgba([0, 0, 255, 255])));
        assert_eq!(surfaces.sample_color_at(&project, 9.0, 9.0), None);

        project.layer_mut(top_id).unwrap().transform = Transform { x: 2.0, ..Transform::default() };
        assert_eq!(surfaces.sample_color_at(&project, 3.5, 1.5), Some(Rgba([255, 0, 0, 255])));

        project.layer_mut(bottom_id).unwrap().visible = false;
        assert_eq!(surfaces.sample_color_at(&project, 0.5, 0.5), None);
    }

    #[test]
    fn encoded_surfaces_restore_pixels_without_touching_the_project() {
        let (project, id) = project_with_layer(5, 5);
        let before = project.clone();
        let mut surfaces = RasterSurfaceManager::new();
        let img = RgbaImage::from_fn(5, 5, |x, y| Rgba([x as u8 * 40, y as u8 * 40, 7, 255]));
        surfaces.attach(id, img.clone(), &project).unwrap();
        let encoded = surfaces.encode_surfaces();
        assert_eq!(encoded.len(), 1);
        assert_eq!(project, before);

        let mut fresh = RasterSurfaceManager::new();
        for (layer_id, bytes) in encoded {
            fresh.restore_encoded(layer_id, bytes, &project).unwrap();
        }
        assert_eq!(fresh.wait_for_decodes(WAIT), 1);
        assert_eq!(fresh.surface(id).unwrap(), &img);
    }

    #[test]
    fn pending_decodes_are_not_captured() {
        let (mut project, id) = project_with_layer(4, 4);
        let src = RgbaImage::from_pixel(4, 4, Rgba([3, 3, 3, 255]));
        project.raster_mut(id).unwrap().source = Some(SourceRef::Embedded(encode_rgba_png(&src).unwrap()));
        let mut surfaces = RasterSurfaceManager::new();
        surfaces.view(id, &project).unwrap();
        assert!(surfaces.encode_surfaces().is_empty());
        surfaces.wait_for_decodes(WAIT);
        assert_eq!(surfaces.encode_surfaces().len(), 1);
    }
}
