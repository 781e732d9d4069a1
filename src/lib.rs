//! Layered raster editing engine: per-layer surfaces and masks,
//! non-destructive adjustments, cached compositing, flood fill, selection
//! refinement, spot heal and whole-project checkpoints.

pub mod logger;

pub mod canvas;
pub mod cli;
pub mod engine;
pub mod error;
pub mod history;
pub mod io;
pub mod ops;
pub mod project;
pub mod settings;
pub mod worker;

pub use engine::{Engine, EngineEvent};
pub use error::{EngineError, EngineResult};
pub use project::{Adjustments, BlendMode, Layer, LayerId, Point, Project};
pub use settings::EngineSettings;
