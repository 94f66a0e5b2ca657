//! Shared geometry and damage primitives
//!
//! Used by the output helpers, the renderers and the backends alike.

pub mod geometry;
pub mod region;

pub use geometry::{Point, Rect, Size, Transform};
pub use region::Region;
