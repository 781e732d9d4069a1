pub mod adjustments;
pub mod compositor;
pub mod fill;
pub mod filters;
pub mod mask;
pub mod retouch;
pub mod selection;
