use thiserror::Error;

use crate::dtype::DataType;

/// Error type shared by all Lumen crates.
///
/// `Cancelled` is not a failure: it reports a clean stop requested through
/// the progress callback and is surfaced as its own variant so callers can
/// tell it apart from real errors.
#[derive(Debug, Error)]
pub enum LumenError {
    /// The engine cannot execute an operation with these shapes/types.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Dimension mismatch between connected tensors or ops.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Data type not handled by the requested code path.
    #[error("unsupported data type: {0}")]
    UnsupportedDType(DataType),

    /// Graph misused: op added after finalize, run before finalize, source
    /// from another graph, and similar fail-fast conditions.
    #[error("invalid graph state: {0}")]
    InvalidState(String),

    /// A required constant tensor (weight/bias) is missing from the map.
    #[error("missing constant tensor: {0}")]
    MissingConstant(String),

    /// A scratch buffer smaller than the planned arena was supplied.
    #[error("scratch buffer too small: need {required} bytes, got {actual}")]
    ScratchTooSmall { required: usize, actual: usize },

    /// Byte-range access outside a buffer.
    #[error("out of bounds: offset {offset} + {len} bytes exceeds buffer of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    /// A kernel reported a failure during execution. Fatal.
    #[error("kernel failed: {0}")]
    KernelFailed(String),

    /// Clean stop requested via the progress callback.
    #[error("execution cancelled")]
    Cancelled,
}
