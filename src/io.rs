// ============================================================================
// ENCODING - PNG persistence for masks / thumbnails / sources, and the
// binary project snapshot used by checkpoints
// ============================================================================

use image::codecs::png::PngEncoder;
use image::{ColorType, GrayImage, ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::project::{LayerId, Project};

/// Magic tag stored at the front of every snapshot.
const SNAPSHOT_MAGIC: &str = "RSS1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted snapshots.
const MAX_CANVAS_DIM: u32 = 32_768;

pub fn encode_rgba_png(img: &RgbaImage) -> EngineResult<Vec<u8>> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(img.as_raw(), img.width(), img.height(), ColorType::Rgba8)
        .map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(out)
}

pub fn encode_gray_png(img: &GrayImage) -> EngineResult<Vec<u8>> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(img.as_raw(), img.width(), img.height(), ColorType::L8)
        .map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(out)
}

/// Fail-closed PNG encode: an empty vector stands in for an unencodable
/// buffer so save/checkpoint flows keep going without it.
pub fn encode_rgba_png_or_empty(img: &RgbaImage) -> Vec<u8> {
    match encode_rgba_png(img) {
        Ok(bytes) => bytes,
        Err(e) => {
            crate::log_warn!("PNG encode failed ({}x{}): {}", img.width(), img.height(), e);
            Vec::new()
        }
    }
}

/// Fail-closed counterpart of [`encode_gray_png`].
pub fn encode_gray_png_or_empty(img: &GrayImage) -> Vec<u8> {
    match encode_gray_png(img) {
        Ok(bytes) => bytes,
        Err(e) => {
            crate::log_warn!("Mask encode failed ({}x{}): {}", img.width(), img.height(), e);
            Vec::new()
        }
    }
}

/// Decode any supported encoded image to RGBA8.
pub fn decode_rgba(bytes: &[u8]) -> EngineResult<RgbaImage> {
    if bytes.is_empty() {
        return Err(EngineError::Decode("empty buffer".into()));
    }
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

/// Decode any supported encoded image to 8-bit grayscale.
pub fn decode_gray(bytes: &[u8]) -> EngineResult<GrayImage> {
    if bytes.is_empty() {
        return Err(EngineError::Decode("empty buffer".into()));
    }
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

// ============================================================================
// PROJECT SNAPSHOT
// ============================================================================

/// Live pixels of raster layers, PNG-encoded, keyed by layer.
pub type EncodedSurfaces = Vec<(LayerId, Vec<u8>)>;

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    magic: String,
    project: Project,
    surfaces: EncodedSurfaces,
}

/// Serialize a full project (layers, sources, encoded masks) together
/// with the live surface pixels. The project itself is stored as given.
pub fn serialize_project(project: &Project, surfaces: &[(LayerId, Vec<u8>)]) -> EngineResult<Vec<u8>> {
    let file = SnapshotFile {
        magic: SNAPSHOT_MAGIC.to_string(),
        project: project.clone(),
        surfaces: surfaces.to_vec(),
    };
    Ok(bincode::serialize(&file)?)
}

/// Parse a snapshot produced by [`serialize_project`]. Any structural
/// problem is an error; nothing is partially returned.
pub fn deserialize_project(raw: &[u8]) -> EngineResult<(Project, EncodedSurfaces)> {
    let file: SnapshotFile = bincode::deserialize(raw)?;
    if file.magic != SNAPSHOT_MAGIC {
        return Err(EngineError::Snapshot(format!("Unknown magic '{}'", file.magic)));
    }
    let project = file.project;
    if project.width == 0
        || project.height == 0
        || project.width > MAX_CANVAS_DIM
        || project.height > MAX_CANVAS_DIM
    {
        return Err(EngineError::Snapshot(format!(
            "Canvas {}x{} out of range",
            project.width, project.height
        )));
    }
    if let Some((id, _)) = file.surfaces.iter().find(|(id, _)| project.raster(*id).is_err()) {
        return Err(EngineError::Snapshot(format!("Pixels stored for unknown layer {}", id)));
    }
    Ok((project, file.surfaces))
}
