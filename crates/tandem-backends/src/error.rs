//! Error types for kernel compilation and device operations

use crate::kernel::{BindingId, ScalarType, UniformId};

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors raised while compiling or running kernels
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// An expression or statement has the wrong scalar type
    #[error("type mismatch in {context}: expected {expected}, got {actual}")]
    TypeMismatch {
        context: &'static str,
        expected: ScalarType,
        actual: ScalarType,
    },

    /// The kernel references a binding its module does not declare
    #[error("kernel references undeclared binding {0}")]
    UnknownBinding(BindingId),

    /// The kernel references a uniform its module does not declare
    #[error("kernel references undeclared uniform {0}")]
    UnknownUniform(UniformId),

    /// A store or atomic add targets a read-only binding
    #[error("binding `{0}` is read-only")]
    ReadOnlyBinding(&'static str),

    /// A load reads from a write-only binding
    #[error("binding `{0}` is write-only")]
    WriteOnlyBinding(&'static str),

    /// A local is read before its declaration
    #[error("local `{0}` used before declaration")]
    UndeclaredLocal(String),

    /// Uniform values passed to a dispatch do not match the declarations
    #[error("uniform `{name}` expects {expected}, got {actual:?}")]
    UniformMismatch {
        name: &'static str,
        expected: ScalarType,
        actual: Option<ScalarType>,
    },

    /// Invalid buffer handle
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(u64),

    /// Host transfer range does not fit the buffer
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// A kernel invocation touched an element outside its binding
    #[error("kernel `{kernel}` accessed {binding}[{index}] but the buffer holds {len} elements")]
    KernelOutOfBounds {
        kernel: String,
        binding: BindingId,
        index: i64,
        len: usize,
    },

    /// Dispatch geometry is unusable
    #[error("invalid launch: {0}")]
    InvalidLaunch(String),

    /// The dedicated worker pool could not be created
    #[error("failed to build device thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl BackendError {
    pub fn type_mismatch(context: &'static str, expected: ScalarType, actual: ScalarType) -> Self {
        Self::TypeMismatch {
            context,
            expected,
            actual,
        }
    }

    pub fn invalid_launch(msg: impl Into<String>) -> Self {
        Self::InvalidLaunch(msg.into())
    }
}
