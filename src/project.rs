use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Stable layer identity. Every per-layer buffer and cache entry is keyed
/// by this, never by where the `Layer` value happens to live.
pub type LayerId = Uuid;

// ============================================================================
// PROJECT
// ============================================================================

/// Single open document.
///
/// `layers[0]` is the topmost layer; the last entry is the bottommost.
/// Compositing walks the list in reverse so index 0 is painted last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    /// Canvas background (RGBA8), painted under every layer.
    pub background: [u8; 4],
    pub layers: Vec<Layer>,
    /// Embedded encoded images addressable by `SourceRef::Asset`.
    pub assets: BTreeMap<String, Vec<u8>>,
}

impl Project {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            dpi: 72,
            background: [255, 255, 255, 255],
            layers: Vec::new(),
            assets: BTreeMap::new(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    pub fn layer_index(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    /// Raster properties of `id`, or an error naming why they are unavailable.
    pub fn raster(&self, id: LayerId) -> EngineResult<&RasterProps> {
        let layer = self.layer(id).ok_or(EngineError::LayerNotFound(id))?;
        layer.raster().ok_or(EngineError::NotRaster(id))
    }

    pub fn raster_mut(&mut self, id: LayerId) -> EngineResult<&mut RasterProps> {
        let layer = self.layer_mut(id).ok_or(EngineError::LayerNotFound(id))?;
        layer.raster_mut().ok_or(EngineError::NotRaster(id))
    }

    /// Encoded bytes behind a source reference.
    pub fn resolve_source<'a>(&'a self, source: &'a SourceRef) -> Option<&'a [u8]> {
        match source {
            SourceRef::Embedded(bytes) => Some(bytes.as_slice()),
            SourceRef::Asset(key) => self.assets.get(key).map(|b| b.as_slice()),
        }
    }
}

// ============================================================================
// LAYER
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub visible: bool,
    pub locked: bool,
    /// 0.0..=1.0
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub transform: Transform,
    pub content: LayerContent,
}

impl Layer {
    pub fn new_raster(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            visible: true,
            locked: false,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            transform: Transform::default(),
            content: LayerContent::Raster(RasterProps::default()),
        }
    }

    pub fn new_text(name: impl Into<String>, text: TextProps) -> Self {
        Self {
            content: LayerContent::Text(text),
            ..Self::new_raster(name)
        }
    }

    pub fn new_shape(name: impl Into<String>, shape: ShapeProps) -> Self {
        Self {
            content: LayerContent::Shape(shape),
            ..Self::new_raster(name)
        }
    }

    pub fn raster(&self) -> Option<&RasterProps> {
        match &self.content {
            LayerContent::Raster(r) => Some(r),
            _ => None,
        }
    }

    pub fn raster_mut(&mut self) -> Option<&mut RasterProps> {
        match &mut self.content {
            LayerContent::Raster(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_raster(&self) -> bool {
        matches!(self.content, LayerContent::Raster(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerContent {
    Raster(RasterProps),
    /// Laid out and drawn by an external renderer.
    Text(TextProps),
    /// Laid out and drawn by an external renderer.
    Shape(ShapeProps),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RasterProps {
    pub source: Option<SourceRef>,
    pub adjustments: Adjustments,
    pub mask_enabled: bool,
    /// A freshly created mask starts black (hidden) instead of white.
    pub mask_inverted: bool,
    /// PNG-encoded grayscale mask. This field, not the live buffer, is what
    /// survives serialization.
    pub mask: Option<Vec<u8>>,
}

/// Where a raster layer's initial pixels come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SourceRef {
    /// Self-contained encoded image (PNG, JPEG, ...).
    Embedded(Vec<u8>),
    /// Key into `Project::assets`.
    Asset(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextProps {
    pub text: String,
    pub font_family: String,
    pub font_size: f32,
    pub color: [u8; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShapeProps {
    pub kind: ShapeKind,
    pub width: f32,
    pub height: f32,
    pub fill: [u8; 4],
    pub stroke: [u8; 4],
    pub stroke_width: f32,
}

// ============================================================================
// TRANSFORM
// ============================================================================

/// Layer placement: translate to (x, y), rotate (degrees), then scale.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub rotation: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, scale: 1.0, rotation: 0.0 }
    }
}

impl Transform {
    pub fn is_identity(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.scale == 1.0 && self.rotation == 0.0
    }

    /// Map a canvas-space point into the layer's local pixel space.
    /// Returns `None` for a degenerate (zero or negative) scale.
    pub fn to_local(&self, px: f32, py: f32) -> Option<(f32, f32)> {
        if self.scale <= 0.0 || !self.scale.is_finite() {
            return None;
        }
        let dx = px - self.x;
        let dy = py - self.y;
        let (sin, cos) = (-self.rotation.to_radians()).sin_cos();
        let lx = dx * cos - dy * sin;
        let ly = dx * sin + dy * cos;
        Some((lx / self.scale, ly / self.scale))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

// ============================================================================
// BLEND MODE
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Difference,
    Additive,
}

impl BlendMode {
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::Difference,
            BlendMode::Additive,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Overlay => "Overlay",
            BlendMode::Darken => "Darken",
            BlendMode::Lighten => "Lighten",
            BlendMode::Difference => "Difference",
            BlendMode::Additive => "Additive",
        }
    }
}

// ============================================================================
// ADJUSTMENT PARAMETERS
// ============================================================================

/// Non-destructive color adjustment applied when a raster layer is rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Adjustments {
    /// -1.0..=1.0
    pub brightness: f32,
    /// -1.0..=1.0
    pub contrast: f32,
    /// -1.0..=1.0
    pub saturation: f32,
    /// -180.0..=180.0 degrees
    pub hue: f32,
    pub invert: bool,
}

impl Adjustments {
    pub fn is_identity(&self) -> bool {
        self.brightness == 0.0
            && self.contrast == 0.0
            && self.saturation == 0.0
            && self.hue == 0.0
            && !self.invert
    }

    /// Bit-exact fingerprint for cache keys (`f32` is not `Eq`/`Hash`).
    pub fn cache_bits(&self) -> [u32; 5] {
        [
            self.brightness.to_bits(),
            self.contrast.to_bits(),
            self.saturation.to_bits(),
            self.hue.to_bits(),
            self.invert as u32,
        ]
    }
}
