//! Kernel language and compute devices for tandem
//!
//! This crate provides:
//! - **Kernel IR**: a typed expression/statement language built with [`KernelBuilder`]
//! - **Emission**: GLSL-flavoured compute source, which doubles as the kernel identity
//! - **Compilation**: lowering of modules into closure trees that run on any [`KernelMemory`]
//! - **Devices**: the [`ComputeDevice`] interface and the multi-threaded [`RayonDevice`]
//! - **Kernel cache**: process-wide reuse of compiled kernels
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Layer / activation                     │
//! │             (formulas written once per kind)            │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ KernelBuilder
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   KernelModule                          │
//! │        bindings + uniforms + workgroup + body           │
//! └──────────┬──────────────────────────────┬───────────────┘
//!            │ compile                      │ emit
//!            ▼                              ▼
//!   ┌──────────────────┐          ┌──────────────────┐
//!   │  CompiledKernel  │          │   source text    │
//!   │ sequential / par │          │   (cache key)    │
//!   └──────────────────┘          └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use tandem_backends::{
//!     Access, Axis, BindingId, BufferBinding, ComputeDevice, Expr, GridDim, KernelBuilder,
//!     KernelModule, RayonDevice, WorkgroupSize,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! const DATA: BindingId = BindingId(0);
//!
//! let mut k = KernelBuilder::new();
//! let i = k.let_int("i", Expr::invocation(Axis::X));
//! k.store(DATA, i.clone(), Expr::load(DATA, i) * 2.0f32);
//! let module = KernelModule::new("double", WorkgroupSize::for_1d(4, 256))
//!     .binding(DATA, "data", Access::ReadWrite)
//!     .with_body(k.finish());
//!
//! let device = RayonDevice::new();
//! let kernel = device.compile(&module)?;
//! let data = device.allocate("data", 4)?;
//! device.write(data, 0, &[1.0, 2.0, 3.0, 4.0])?;
//! device.dispatch(&kernel, GridDim::linear(4), &[], &[BufferBinding::new(DATA, data)])?;
//! device.barrier();
//! assert_eq!(device.read_vec(data)?, vec![2.0, 4.0, 6.0, 8.0]);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod device;
pub mod error;
pub mod kernel;
pub mod launch;

pub use cache::{KernelCache, KernelKey, KernelKind};
pub use device::{BufferBinding, BufferHandle, ComputeDevice, DeviceBuffer, DeviceConfig, RayonDevice};
pub use error::{BackendError, Result};
pub use kernel::{
    as_cells, compile, Access, Axis, BindingId, CompiledKernel, Expr, Frame, KernelBuilder, KernelMemory,
    KernelModule, Scalar, ScalarType, SliceMemory, UniformId, Var,
};
pub use launch::{GridDim, LaunchConfig, WorkgroupSize};
