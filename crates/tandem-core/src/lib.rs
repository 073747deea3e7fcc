//! # tandem-core - one network, two engines
//!
//! Layers, layouts and the training loop of a small feed-forward network
//! engine. The same network definition runs on two backends:
//!
//! - [`CpuNetwork`]: every kernel runs invocation by invocation on the
//!   calling thread over plain vectors. This is the reference.
//! - [`GpuNetwork`]: kernels are dispatched over a
//!   [`tandem_backends::ComputeDevice`] in parallel, with atomic gradient
//!   scatter and a barrier between phases.
//!
//! Both execute kernels built from the same per-layer formula (see
//! [`kernels`]), so they agree on activations and weight updates up to float
//! summation order.
//!
//! ## Architecture
//!
//! ```text
//!   Layer ──► NetworkLayout ──► Network<B: Backend>
//!   (formula)   (offsets)          │  bind_layer() ─► LayerWindow
//!                                  ├─ CpuBackend  (run_sequential)
//!                                  └─ GpuBackend  (KernelCache + device.dispatch)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tandem_core::activation::Identity;
//! use tandem_core::layers::FullyConnected;
//! use tandem_core::{CpuNetwork, LearningParams, NetworkLayout};
//!
//! let layout = NetworkLayout::new().with_layer(FullyConnected::new(1, 1, Identity)?)?;
//! let mut network = CpuNetwork::new(layout, 1)?;
//! network.set_weights(&[0.0])?;
//! network.set_input(0, 0, 1.0)?;
//! network.set_target(0, 0, 2.0)?;
//!
//! let params = LearningParams::new(0.5, false);
//! for _ in 0..20 {
//!     network.learn(&params, false)?;
//! }
//! assert!((network.inspect_weights()?[0] - 2.0).abs() < 1e-3);
//! # Ok::<(), tandem_core::Error>(())
//! ```

pub mod activation;
pub mod error;
pub mod kernels;
pub mod layers;
pub mod layout;
pub mod network;
pub mod params;

pub use error::{Error, Result};
pub use layout::NetworkLayout;
pub use network::{Backend, CpuNetwork, GpuNetwork, LayerWindow, Network};
pub use params::LearningParams;
