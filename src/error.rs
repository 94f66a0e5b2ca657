//! Error types of the compositing core
//!
//! Every variant is recoverable at output level except renderer
//! initialization, which aborts the compositor.

use thiserror::Error;

use crate::backend::{AllocError, CommitError, Fourcc};
use crate::compositor::layer::LayerId;
use crate::render::RenderError;

#[derive(Debug, Error)]
pub enum OutputError {
    /// No buffer layout works for both the renderer and the display
    #[error("no compatible buffer format for {code}")]
    FormatNegotiationFailed { code: Fourcc },

    /// The backend refused a test or real commit
    #[error("commit rejected: {0}")]
    CommitRejected(#[from] CommitError),

    /// The output cannot host a layer on a hardware plane
    #[error("layer {layer} unsupported on this output")]
    LayerUnsupported { layer: LayerId },

    /// Swapchain exhausted or mismatched; retry next cycle
    #[error("no render target available")]
    RenderTargetUnavailable,

    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] AllocError),

    #[error("rendering failed: {0}")]
    Render(#[from] RenderError),
}

impl OutputError {
    /// Whether the output should simply be retried on the next cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OutputError::RenderTargetUnavailable | OutputError::CommitRejected(_)
        )
    }
}
