// ============================================================================
// ENGINE - the interactive-thread facade over one open project
// ============================================================================
//
// Owns the project plus every per-layer manager. Callers address layers by
// id only and never see the caches. Flood fill, mask and adjustment work
// run synchronously here; selection refinement and spot heal go to the
// worker and come back through `poll_worker()`.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use image::{GrayImage, Rgba, RgbaImage};
use uuid::Uuid;

use crate::canvas::RasterSurfaceManager;
use crate::error::{EngineError, EngineResult};
use crate::history::{Checkpoint, CheckpointManager};
use crate::ops::compositor::{Compositor, NoOverlay, OverlayRenderer};
use crate::ops::fill::{flood_fill, flood_mask};
use crate::ops::mask::MaskEngine;
use crate::ops::selection::RefineParams;
use crate::project::{Adjustments, Layer, LayerId, Point, Project};
use crate::settings::EngineSettings;
use crate::worker::{EditWorker, Operation, RequestId, WorkerReply, WorkerRequest, WorkerResponse};

/// What a finished worker job turned into on the interactive thread.
#[derive(Debug)]
pub enum EngineEvent {
    /// A refined selection mask, handed over to the caller.
    SelectionReady { request: RequestId, mask: GrayImage },
    /// A spot heal landed on the layer's surface.
    HealApplied { request: RequestId, layer_id: LayerId },
    /// The job failed; nothing was changed.
    Failed { request: RequestId, reason: String },
}

pub struct Engine {
    project: Project,
    surfaces: RasterSurfaceManager,
    masks: MaskEngine,
    compositor: Compositor,
    checkpoints: CheckpointManager,
    worker: EditWorker,
    settings: EngineSettings,
    overlay: Box<dyn OverlayRenderer>,
    /// Layer and surface revision each in-flight heal was computed from.
    heal_bases: HashMap<RequestId, (LayerId, u64)>,
}

impl Engine {
    pub fn new(project: Project) -> Self {
        Self::with_settings(project, EngineSettings::default())
    }

    pub fn with_settings(project: Project, settings: EngineSettings) -> Self {
        Self {
            project,
            surfaces: RasterSurfaceManager::new(),
            masks: MaskEngine::new(),
            compositor: Compositor::new(),
            checkpoints: CheckpointManager::new(),
            worker: EditWorker::new(),
            settings,
            overlay: Box::new(NoOverlay),
            heal_bases: HashMap::new(),
        }
    }

    /// Renderer used for text and shape layers when flattening.
    pub fn set_overlay_renderer(&mut self, overlay: Box<dyn OverlayRenderer>) {
        self.overlay = overlay;
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // Layers and canvas
    // ------------------------------------------------------------------------

    /// Insert a layer at `index` (clamped; 0 = top, `None` = bottom).
    pub fn add_layer(&mut self, layer: Layer, index: Option<usize>) -> LayerId {
        let id = layer.id;
        let index = index.unwrap_or(self.project.layers.len()).min(self.project.layers.len());
        self.project.layers.insert(index, layer);
        id
    }

    /// New empty raster layer on top of the stack.
    pub fn add_raster_layer(&mut self, name: impl Into<String>) -> LayerId {
        self.add_layer(Layer::new_raster(name), Some(0))
    }

    /// Remove a layer together with its surface, mask and cached render.
    pub fn remove_layer(&mut self, layer_id: LayerId) -> bool {
        let Some(index) = self.project.layer_index(layer_id) else {
            return false;
        };
        self.project.layers.remove(index);
        self.surfaces.remove(layer_id);
        self.masks.remove(layer_id);
        self.compositor.remove(layer_id);
        true
    }

    pub fn layer_mut(&mut self, layer_id: LayerId) -> EngineResult<&mut Layer> {
        self.project.layer_mut(layer_id).ok_or(EngineError::LayerNotFound(layer_id))
    }

    /// Change the canvas size. Surfaces and masks keep their content at
    /// (0,0), clipped or padded.
    pub fn resize_canvas(&mut self, width: u32, height: u32) -> EngineResult<()> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidDimensions(format!("{}x{}", width, height)));
        }
        self.project.width = width;
        self.project.height = height;
        self.surfaces.resize(&self.project);
        self.masks.resize(&mut self.project);
        crate::log_info!("Canvas resized to {}x{}", width, height);
        Ok(())
    }

    pub fn set_adjustments(&mut self, layer_id: LayerId, adjustments: Adjustments) -> EngineResult<()> {
        self.project.raster_mut(layer_id)?.adjustments = adjustments;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Surfaces
    // ------------------------------------------------------------------------

    /// Mutable pixels of a raster layer (allocated on first access).
    pub fn surface_mut(&mut self, layer_id: LayerId) -> EngineResult<&mut RgbaImage> {
        self.surfaces.get(layer_id, &self.project)
    }

    pub fn surface(&self, layer_id: LayerId) -> Option<&RgbaImage> {
        self.surfaces.surface(layer_id)
    }

    /// Hand a decoded RGBA8 buffer to a raster layer.
    pub fn attach_pixels(&mut self, layer_id: LayerId, pixels: RgbaImage) -> EngineResult<()> {
        self.surfaces.attach(layer_id, pixels, &self.project)
    }

    /// Colour under a canvas point, topmost visible raster layer first.
    /// Missing surfaces are created first; pixels whose source decode has
    /// not landed yet read as transparent.
    pub fn sample_color_at(&mut self, x: f32, y: f32) -> Option<Rgba<u8>> {
        self.surfaces.poll_decodes();
        for layer in &self.project.layers {
            if layer.visible && layer.is_raster() {
                let _ = self.surfaces.view(layer.id, &self.project);
            }
        }
        self.surfaces.sample_color_at(&self.project, x, y)
    }

    pub fn poll_decodes(&mut self) -> usize {
        self.surfaces.poll_decodes()
    }

    pub fn wait_for_decodes(&mut self, timeout: Duration) -> usize {
        self.surfaces.wait_for_decodes(timeout)
    }

    // ------------------------------------------------------------------------
    // Masks
    // ------------------------------------------------------------------------

    pub fn set_mask_enabled(&mut self, layer_id: LayerId, enabled: bool) -> EngineResult<()> {
        self.project.raster_mut(layer_id)?.mask_enabled = enabled;
        Ok(())
    }

    pub fn mask(&mut self, layer_id: LayerId) -> EngineResult<&GrayImage> {
        Ok(&*self.masks.get_or_create(&self.project, layer_id)?)
    }

    pub fn mask_fill(&mut self, layer_id: LayerId, reveal: bool) -> EngineResult<()> {
        self.masks.fill(&mut self.project, layer_id, reveal)
    }

    pub fn mask_invert(&mut self, layer_id: LayerId) -> EngineResult<()> {
        self.masks.invert(&mut self.project, layer_id)
    }

    pub fn mask_stroke_soft(&mut self, layer_id: LayerId, x: f32, y: f32, size: f32, reveal: bool) -> EngineResult<()> {
        self.masks.stroke_soft(&mut self.project, layer_id, x, y, size, reveal)
    }

    pub fn mask_from_polygons(&mut self, layer_id: LayerId, polygons: &[Vec<Point>], reveal: bool) -> EngineResult<()> {
        self.masks.from_polygons(&mut self.project, layer_id, polygons, reveal)
    }

    // ------------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------------

    pub fn render_layer(&mut self, layer_id: LayerId) -> EngineResult<Arc<RgbaImage>> {
        self.compositor.render(&self.project, layer_id, &mut self.surfaces, &mut self.masks)
    }

    pub fn flatten(&mut self, scale: f32) -> EngineResult<RgbaImage> {
        self.compositor
            .flatten(&self.project, &mut self.surfaces, &mut self.masks, self.overlay.as_ref(), scale)
    }

    pub fn thumbnail(&mut self) -> EngineResult<RgbaImage> {
        self.compositor.render_thumbnail(
            &self.project,
            &mut self.surfaces,
            &mut self.masks,
            self.overlay.as_ref(),
            self.settings.thumbnail_max_width,
        )
    }

    /// Number of times the adjustment pipeline has actually run.
    pub fn pipeline_runs(&self) -> usize {
        self.compositor.pipeline_runs()
    }

    // ------------------------------------------------------------------------
    // Flood fill
    // ------------------------------------------------------------------------

    /// Paint-bucket fill on the layer's surface. Returns the number of
    /// pixels changed; out-of-bounds seeds and same-colour fills change
    /// nothing.
    pub fn flood_fill(
        &mut self,
        layer_id: LayerId,
        x: i32,
        y: i32,
        color: Rgba<u8>,
        tolerance: Option<u8>,
    ) -> EngineResult<usize> {
        let tolerance = tolerance.unwrap_or(self.settings.fill_tolerance);
        self.surfaces
            .edit(layer_id, &self.project, |img| flood_fill(img, x, y, color, tolerance))
    }

    /// Magic wand: 0/1 mask of the region around (x, y), computed on a
    /// copy of the layer's pixels.
    pub fn magic_wand(&mut self, layer_id: LayerId, x: i32, y: i32, tolerance: Option<u8>) -> EngineResult<GrayImage> {
        let tolerance = tolerance.unwrap_or(self.settings.fill_tolerance);
        let (pixels, _) = self.surfaces.view(layer_id, &self.project)?;
        Ok(flood_mask(pixels.clone(), x, y, tolerance))
    }

    // ------------------------------------------------------------------------
    // Worker jobs
    // ------------------------------------------------------------------------

    /// Queue a selection refinement over the current canvas.
    pub fn request_selection_refine(&mut self, polygons: Vec<Vec<Point>>, feather: f32, amount: f32) -> RequestId {
        let (width, height) = self.project.dimensions();
        self.worker.submit(WorkerRequest::RefineSelection {
            width,
            height,
            polygons,
            params: RefineParams {
                feather,
                amount,
                threshold_bias: self.settings.grow_threshold_bias,
            },
        })
    }

    /// Queue a spot heal. The worker gets its own copy of the surface; the
    /// healed buffer replaces the surface when the reply is applied, unless
    /// the surface was modified in the meantime, in which case the reply
    /// is dropped.
    pub fn request_spot_heal(&mut self, layer_id: LayerId, x: f32, y: f32, radius: f32) -> EngineResult<RequestId> {
        let (pixels, revision) = self.surfaces.view(layer_id, &self.project)?;
        let (width, height) = pixels.dimensions();
        let pixels = pixels.clone();
        let id = self.worker.submit(WorkerRequest::SpotHeal { layer_id, width, height, pixels, x, y, radius });
        self.heal_bases.insert(id, (layer_id, revision));
        Ok(id)
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.worker.in_flight()
    }

    /// Apply every finished, non-stale worker reply.
    pub fn poll_worker(&mut self) -> Vec<EngineEvent> {
        self.worker
            .poll()
            .into_iter()
            .filter_map(|reply| self.apply_reply(reply))
            .collect()
    }

    /// Block for the next worker event (see `EditWorker::wait_next`).
    pub fn wait_worker(&mut self, timeout: Duration) -> Option<EngineEvent> {
        while let Some(reply) = self.worker.wait_next(timeout) {
            if let Some(event) = self.apply_reply(reply) {
                return Some(event);
            }
        }
        None
    }

    fn apply_reply(&mut self, reply: WorkerReply) -> Option<EngineEvent> {
        let request = reply.id;
        let heal_base = self.heal_bases.remove(&request);
        match (reply.operation, reply.response) {
            (_, WorkerResponse::Failed { reason }) => Some(EngineEvent::Failed { request, reason }),
            (Operation::RefineSelection, WorkerResponse::Mask { mask, .. }) => {
                Some(EngineEvent::SelectionReady { request, mask })
            }
            (Operation::SpotHeal(layer_id), WorkerResponse::Pixels { width, height, pixels }) => {
                // replies the worker dropped as stale never come back here
                self.heal_bases.retain(|id, (layer, _)| *layer != layer_id || *id > request);
                let Some((_, base)) = heal_base else {
                    crate::log_info!("Dropping spot heal {} issued before the last restore", request);
                    return None;
                };
                if self.surfaces.revision(layer_id) != Some(base) {
                    crate::log_info!("Dropping spot heal {}: layer {} changed while it ran", request, layer_id);
                    return None;
                }
                if (width, height) != self.project.dimensions() {
                    crate::log_warn!("Spot heal {} no longer matches the canvas size, dropped", request);
                    return None;
                }
                match self.surfaces.attach(layer_id, pixels, &self.project) {
                    Ok(()) => Some(EngineEvent::HealApplied { request, layer_id }),
                    Err(e) => {
                        crate::log_warn!("Spot heal {} could not be applied: {}", request, e);
                        None
                    }
                }
            }
            (operation, _) => Some(EngineEvent::Failed {
                request,
                reason: format!("unexpected reply kind for {:?}", operation),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    /// Snapshot the whole project plus the live surface pixels. The
    /// project itself is not modified.
    pub fn add_checkpoint(&mut self, label: impl Into<String>) -> EngineResult<Uuid> {
        self.surfaces.poll_decodes();
        let surfaces = self.surfaces.encode_surfaces();
        let thumbnail = match self.thumbnail() {
            Ok(t) => Some(t),
            Err(e) => {
                crate::log_warn!("Checkpoint thumbnail failed: {}", e);
                None
            }
        };
        let checkpoint = self.checkpoints.add(label, &self.project, &surfaces, thumbnail.as_ref())?;
        Ok(checkpoint.id)
    }

    /// Replace the live project with a checkpoint's. Unknown ids and
    /// corrupt snapshots leave everything untouched and return `false`.
    pub fn restore_checkpoint(&mut self, id: Uuid) -> bool {
        let Some((project, pixels)) = self.checkpoints.restore(id) else {
            return false;
        };
        self.project = project;
        self.surfaces.clear();
        self.masks.clear();
        self.compositor.clear();
        self.heal_bases.clear();
        for (layer_id, bytes) in pixels {
            if let Err(e) = self.surfaces.restore_encoded(layer_id, bytes, &self.project) {
                crate::log_warn!("Checkpoint pixels for layer {} not restored: {}", layer_id, e);
            }
        }
        crate::log_info!("Restored checkpoint {}", id);
        true
    }

    pub fn rename_checkpoint(&mut self, id: Uuid, label: impl Into<String>) -> bool {
        self.checkpoints.rename(id, label)
    }

    pub fn delete_checkpoint(&mut self, id: Uuid) -> bool {
        self.checkpoints.delete(id)
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        self.checkpoints.list()
    }
}
