//! Error types for tandem-core operations

use tandem_backends::BackendError;

/// Result type for tandem-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running a network
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A network needs at least one layer
    #[error("network layout has no layers")]
    EmptyLayout,

    /// Appended layer does not consume what the previous layer produces
    #[error("layer {layer} expects {actual} inputs but the previous layer produces {expected}")]
    ShapeMismatch {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    /// Layer or network dimensions are unusable
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Batch size of zero or too large to address
    #[error("invalid batch size {0}")]
    InvalidBatchSize(usize),

    /// Batch, node or weight index outside its range
    #[error("{what} index {index} out of range (len {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// `set_weights` called with the wrong number of weights
    #[error("expected {expected} weights, got {actual}")]
    WeightCountMismatch { expected: usize, actual: usize },

    /// A NaN or infinite value reached a backward pass
    #[error("non-finite input {value} at index {index} of layer {layer}")]
    NonFiniteInput { layer: usize, index: usize, value: f32 },

    /// Kernel compilation or device failure
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Error {
    pub(crate) fn invalid_shape(msg: impl Into<String>) -> Self {
        Self::InvalidShape(msg.into())
    }

    pub(crate) fn check_index(what: &'static str, index: usize, len: usize) -> Result<()> {
        if index < len {
            Ok(())
        } else {
            Err(Self::IndexOutOfRange { what, index, len })
        }
    }
}
