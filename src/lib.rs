//! Area presentation runtime
//!
//! Turns a continuously updated scene into committed frames on one or more
//! outputs: buffer pools with format negotiation, per-output damage history,
//! layer routing for mirrored outputs and a single-threaded frame scheduler.

pub mod backend;
pub mod compositor;
pub mod config;
pub mod error;
pub mod render;
pub mod shared;

pub use compositor::output::{OutputEvent, OutputFlags, OutputHelper, OutputId, OutputOptions};
pub use compositor::{FrameDone, FrameScheduler};
pub use error::OutputError;
