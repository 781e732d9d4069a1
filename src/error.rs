//! Error types for the editing engine.
//!
//! Only caller mistakes surface as errors. Degraded outcomes that must stay
//! silent (blank surface after a failed decode, missing thumbnail, ignored
//! corrupt checkpoint) are logged and swallowed at the call site instead.

use thiserror::Error;

use crate::project::LayerId;

#[derive(Error, Debug)]
pub enum EngineError {
    /// No layer with this id exists in the project.
    #[error("Layer not found: {0}")]
    LayerNotFound(LayerId),

    /// The layer exists but is a text or shape layer.
    #[error("Layer {0} is not a raster layer")]
    NotRaster(LayerId),

    /// Buffer or canvas dimensions that cannot be used (zero, or mismatched).
    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// Operation parameter outside its accepted range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// Project snapshot could not be (de)serialized.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<image::ImageError> for EngineError {
    fn from(e: image::ImageError) -> Self {
        EngineError::Decode(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for EngineError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        EngineError::Snapshot(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
