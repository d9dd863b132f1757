//! Library error type for fallible external interactions.
//!
//! Conditions that indicate client or core bugs (unknown ids, reference
//! count underflows, size mismatches, invalid conversions) are fatal and
//! panic with a detailed diagnostic instead of surfacing here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JitError {
    /// The backend compiler/linker rejected the generated program. The
    /// full IR is attached so the diagnostic is self-contained.
    #[error("backend compilation failed ({backend}): {message}\n--- kernel IR ---\n{ir}")]
    CompileFailed {
        backend: &'static str,
        message: String,
        ir: String,
    },

    #[error("kernel launch failed: {0}")]
    LaunchFailed(String),

    #[error("memory allocation of {bytes} bytes ({kind}) failed")]
    AllocFailed { kind: &'static str, bytes: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, JitError>;
