//! Compute devices: buffer storage plus kernel compilation and dispatch.
//!
//! ```text
//! ┌──────────────┐  compile(module)   ┌────────────────┐
//! │ network      │ ─────────────────► │ ComputeDevice  │
//! │ engine       │  dispatch(kernel,  │  ├ buffers     │
//! │              │   extent, ...)     │  └ workers     │
//! │              │ ◄───── barrier ─── │                │
//! └──────────────┘                    └────────────────┘
//! ```
//!
//! Dispatches run every invocation of the extent (rounded up to whole
//! workgroups) in unspecified order. Nothing written by one dispatch is
//! guaranteed visible to the next until [`ComputeDevice::barrier`] returns.

pub mod memory;
pub mod rayon_device;

pub use memory::DeviceBuffer;
pub use rayon_device::RayonDevice;

use std::env;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kernel::{BindingId, CompiledKernel, KernelModule, Scalar};
use crate::launch::GridDim;

/// Opaque handle to a device-resident `f32` buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Attaches a buffer to a binding slot for one dispatch.
///
/// The same buffer may be attached to several slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub binding: BindingId,
    pub buffer: BufferHandle,
}

impl BufferBinding {
    pub const fn new(binding: BindingId, buffer: BufferHandle) -> Self {
        Self { binding, buffer }
    }
}

/// Device construction options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Worker threads for a dedicated pool; `None` uses the global pool.
    pub threads: Option<usize>,
}

impl DeviceConfig {
    /// Read `TANDEM_DEVICE_THREADS`; unset, empty, zero or unparsable values
    /// select the global pool.
    pub fn from_env() -> Self {
        let threads = env::var("TANDEM_DEVICE_THREADS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|&threads| threads > 0);
        Self { threads }
    }
}

/// Storage and execution interface the parallel network backend runs on.
pub trait ComputeDevice: Send + Sync + fmt::Debug {
    /// Stable identifier, part of every kernel cache key.
    fn kind(&self) -> &'static str;

    /// Allocate a zero-initialized buffer of `len` floats.
    fn allocate(&self, label: &str, len: usize) -> Result<BufferHandle>;

    fn free(&self, handle: BufferHandle) -> Result<()>;

    fn buffer_len(&self, handle: BufferHandle) -> Result<usize>;

    /// Host-to-device copy into `[offset, offset + data.len())`.
    fn write(&self, handle: BufferHandle, offset: usize, data: &[f32]) -> Result<()>;

    /// Device-to-host copy of the first `out.len()` elements.
    fn read(&self, handle: BufferHandle, out: &mut [f32]) -> Result<()>;

    fn fill(&self, handle: BufferHandle, value: f32) -> Result<()>;

    fn compile(&self, module: &KernelModule) -> Result<Arc<CompiledKernel>>;

    /// Run `kernel` over `extent`. Returns once every invocation finished.
    fn dispatch(
        &self,
        kernel: &CompiledKernel,
        extent: GridDim,
        uniforms: &[Scalar],
        bindings: &[BufferBinding],
    ) -> Result<()>;

    /// Make all writes of completed dispatches visible to later ones.
    fn barrier(&self);

    /// Read a whole buffer into a new vector.
    fn read_vec(&self, handle: BufferHandle) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.buffer_len(handle)?];
        self.read(handle, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn config_reads_thread_count() {
        env::set_var("TANDEM_DEVICE_THREADS", "3");
        assert_eq!(DeviceConfig::from_env().threads, Some(3));
        env::set_var("TANDEM_DEVICE_THREADS", "0");
        assert_eq!(DeviceConfig::from_env().threads, None);
        env::set_var("TANDEM_DEVICE_THREADS", "many");
        assert_eq!(DeviceConfig::from_env().threads, None);
        env::remove_var("TANDEM_DEVICE_THREADS");
        assert_eq!(DeviceConfig::from_env(), DeviceConfig::default());
    }
}
