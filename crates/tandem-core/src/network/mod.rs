//! Backend-agnostic training loop.
//!
//! A [`Network`] owns five flat buffers and walks the layer chain of its
//! [`NetworkLayout`]. Before every layer phase it binds the layer, producing
//! a [`LayerWindow`] that says where the layer's inputs, outputs and weights
//! live inside those buffers. The backend only ever sees windows; it never
//! reasons about layer positions itself.
//!
//! ```text
//!   learn():  predict ─► clear ─► evaluate(last) ─► backward(last) ─► … ─► backward(first)
//!   predict(): prepare inputs ─► forward(first) ─► … ─► forward(last)
//! ```

mod cpu;
mod gpu;

pub use cpu::{CpuBackend, CpuNetwork};
pub use gpu::{kernel_cache, DeviceTensor, GpuBackend, GpuNetwork};

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tandem_backends::{CompiledKernel, GridDim, KernelKind, KernelModule, Scalar};
use tandem_tracing::perf_span;

use crate::error::{Error, Result};
use crate::kernels::{
    self, BUFFER_SIZE, GRADIENT, INPUT_OFFSET, LEARNING_RATE, NUM_INPUTS, NUM_OUTPUTS, OUTPUT_OFFSET, UNIFORM_COUNT,
    WEIGHT_OFFSET,
};
use crate::layers::{Layer, LayerOffsets};
use crate::layout::NetworkLayout;
use crate::params::LearningParams;

/// The five buffers of a network, in backend-specific form.
#[derive(Debug)]
pub struct NetworkBuffers<T> {
    /// `batch * num_inputs`, batch-major.
    pub inputs: T,
    pub weights: T,
    /// `batch * num_nodes`; each layer's outputs are a contiguous block.
    pub activated: T,
    /// `batch * num_outputs`, batch-major.
    pub targets: T,
    /// Same shape as `activated`.
    pub deltas: T,
}

/// Where a layer reads layer inputs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// The network's `inputs` buffer; only the first layer.
    External,
    /// The previous layer's block of `activated`.
    Activated,
}

/// A `stride`-wide row per batch entry, starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferWindow {
    pub base: usize,
    pub stride: usize,
    /// `batch * stride`
    pub extent: usize,
}

impl BufferWindow {
    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.extent
    }
}

/// Physical placement of one layer for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerWindow {
    pub layer: usize,
    pub batch_size: usize,
    pub source: InputSource,
    pub input: BufferWindow,
    pub output: BufferWindow,
    pub weight_base: usize,
    pub num_weights: usize,
}

impl LayerWindow {
    /// Resolve the window of `layer` placed at `offsets` for `batch_size` rows.
    ///
    /// # Panics
    ///
    /// If the layout produced offsets whose output block does not directly
    /// follow the input block.
    pub fn bind(index: usize, layer: &dyn Layer, offsets: &LayerOffsets, batch_size: usize) -> Self {
        let source = if offsets.input < 0 {
            InputSource::External
        } else {
            InputSource::Activated
        };
        let input_base = usize::try_from(offsets.input).map_or(0, |nodes| nodes * batch_size);
        let input = BufferWindow {
            base: input_base,
            stride: layer.num_inputs(),
            extent: batch_size * layer.num_inputs(),
        };
        let output = BufferWindow {
            base: offsets.output * batch_size,
            stride: layer.num_outputs(),
            extent: batch_size * layer.num_outputs(),
        };

        match source {
            InputSource::External => assert_eq!(output.base, 0, "first layer must start the node space"),
            InputSource::Activated => assert_eq!(
                output.base,
                input.base + input.extent,
                "layer {index} outputs must follow its inputs"
            ),
        }

        Self {
            layer: index,
            batch_size,
            source,
            input,
            output,
            weight_base: offsets.weight,
            num_weights: layer.num_weights(),
        }
    }

    pub fn is_first(&self) -> bool {
        self.source == InputSource::External
    }

    /// Uniform values of every layer phase.
    pub fn uniforms(&self, learning_rate: f32) -> [Scalar; UNIFORM_COUNT] {
        let mut values = [Scalar::Int(0); UNIFORM_COUNT];
        values[usize::from(INPUT_OFFSET.0)] = int(self.input.base);
        values[usize::from(OUTPUT_OFFSET.0)] = int(self.output.base);
        values[usize::from(WEIGHT_OFFSET.0)] = int(self.weight_base);
        values[usize::from(NUM_INPUTS.0)] = int(self.input.stride);
        values[usize::from(NUM_OUTPUTS.0)] = int(self.output.stride);
        values[usize::from(LEARNING_RATE.0)] = Scalar::Float(learning_rate);
        values[usize::from(GRADIENT.0)] = Scalar::Bool(!self.is_first());
        values[usize::from(BUFFER_SIZE.0)] = int(self.input.extent);
        values
    }
}

/// Buffer sizes are validated against `i32` when a network is built.
fn int(value: usize) -> Scalar {
    Scalar::Int(i32::try_from(value).unwrap_or(i32::MAX))
}

/// First non-finite value of a layer's input window, as an error.
pub(crate) fn check_finite(layer: usize, values: &[f32]) -> Result<()> {
    match values.iter().position(|value| !value.is_finite()) {
        Some(index) => Err(Error::NonFiniteInput {
            layer,
            index,
            value: values[index],
        }),
        None => Ok(()),
    }
}

/// Uniform values of the clear kernel.
pub(crate) fn clear_uniforms(len: usize) -> [Scalar; UNIFORM_COUNT] {
    let mut values = [Scalar::Int(0); UNIFORM_COUNT];
    values[usize::from(LEARNING_RATE.0)] = Scalar::Float(0.0);
    values[usize::from(GRADIENT.0)] = Scalar::Bool(false);
    values[usize::from(BUFFER_SIZE.0)] = int(len);
    values
}

/// Compiled kernels of one layer, with the grid each one is dispatched over.
#[derive(Debug, Clone)]
pub struct LayerKernels {
    pub forward: Arc<CompiledKernel>,
    pub activation: Option<Arc<CompiledKernel>>,
    pub activation_backward: Option<Arc<CompiledKernel>>,
    pub backward: Arc<CompiledKernel>,
    pub forward_grid: GridDim,
    pub activation_grid: GridDim,
    pub backward_grid: GridDim,
}

/// Everything a backend needs to know to obtain one kernel.
pub(crate) struct KernelRequest<'a> {
    pub kind: KernelKind,
    pub module: &'a KernelModule,
    pub extent: usize,
    pub interdependent: bool,
}

impl LayerKernels {
    pub(crate) fn resolve<F>(layer: &dyn Layer, batch_size: usize, mut obtain: F) -> Result<Self>
    where
        F: FnMut(KernelRequest<'_>) -> Result<Arc<CompiledKernel>>,
    {
        let modules = kernels::LayerModules::new(layer, batch_size);
        let activation = layer.activation();
        let interdependent = activation.has_interdependencies();
        let outputs = layer.num_outputs();

        let forward = obtain(KernelRequest {
            kind: KernelKind::Forward,
            module: &modules.forward,
            extent: outputs,
            interdependent: false,
        })?;
        let mut optional = |kind, module: Option<&KernelModule>| {
            module
                .map(|module| {
                    obtain(KernelRequest {
                        kind,
                        module,
                        extent: outputs,
                        interdependent,
                    })
                })
                .transpose()
        };
        let activation_kernel = optional(KernelKind::Activation, modules.activation.as_ref())?;
        let activation_backward = optional(KernelKind::ActivationBackward, modules.activation_backward.as_ref())?;
        let backward = obtain(KernelRequest {
            kind: KernelKind::Backward,
            module: &modules.backward,
            extent: layer.num_weights(),
            interdependent: false,
        })?;

        let (ax, ay) = kernels::activation_grid(activation, batch_size, outputs);
        Ok(Self {
            forward,
            activation: activation_kernel,
            activation_backward,
            backward,
            forward_grid: GridDim::from_sizes(batch_size, outputs)?,
            activation_grid: GridDim::from_sizes(ax, ay)?,
            backward_grid: GridDim::from_sizes(layer.num_weights(), 1)?,
        })
    }
}

/// Execution strategy of a [`Network`].
///
/// Every phase receives the network's buffers and the window of the layer
/// being processed. Calls arrive in the order documented on the module.
pub trait Backend: fmt::Debug {
    type Tensor: fmt::Debug;

    fn name(&self) -> &'static str;

    /// A zeroed buffer of `len` floats.
    fn allocate(&self, label: &'static str, len: usize) -> Result<Self::Tensor>;

    /// Stage external input `index` (batch-major).
    fn set_input(&mut self, buffers: &mut NetworkBuffers<Self::Tensor>, index: usize, value: f32) -> Result<()>;

    /// Stage target `index` (batch-major).
    fn set_target(&mut self, buffers: &mut NetworkBuffers<Self::Tensor>, index: usize, value: f32) -> Result<()>;

    /// Make staged inputs visible to kernels.
    fn prepare_inputs(&mut self, buffers: &mut NetworkBuffers<Self::Tensor>) -> Result<()>;

    fn prepare_targets(&mut self, buffers: &mut NetworkBuffers<Self::Tensor>) -> Result<()>;

    fn clear_deltas(&mut self, buffers: &mut NetworkBuffers<Self::Tensor>) -> Result<()>;

    /// Raw sums of the window's outputs, then the activation.
    fn forward(&mut self, buffers: &mut NetworkBuffers<Self::Tensor>, window: &LayerWindow) -> Result<()>;

    /// `delta = target - activated` over the window's outputs; returns the
    /// RMS error when `needs_error` is set.
    fn evaluate(
        &mut self,
        buffers: &mut NetworkBuffers<Self::Tensor>,
        window: &LayerWindow,
        needs_error: bool,
    ) -> Result<f32>;

    /// Reject non-finite values the layer's backward would read.
    fn check_inputs(&self, buffers: &NetworkBuffers<Self::Tensor>, window: &LayerWindow) -> Result<()>;

    /// Activation derivative, weight update, then optional normalization
    /// of the input deltas.
    fn backward(
        &mut self,
        buffers: &mut NetworkBuffers<Self::Tensor>,
        window: &LayerWindow,
        params: &LearningParams,
    ) -> Result<()>;

    fn read(&self, tensor: &Self::Tensor) -> Result<Vec<f32>>;

    fn write(&mut self, tensor: &mut Self::Tensor, offset: usize, values: &[f32]) -> Result<()>;
}

/// A layer chain bound to buffers for one batch size.
#[derive(Debug)]
pub struct Network<B: Backend> {
    layout: Arc<NetworkLayout>,
    batch_size: usize,
    backend: B,
    buffers: NetworkBuffers<B::Tensor>,
}

fn buffer_len(count: usize, batch_size: usize) -> Result<usize> {
    count
        .checked_mul(batch_size)
        .filter(|&len| i32::try_from(len).is_ok())
        .ok_or(Error::InvalidBatchSize(batch_size))
}

impl<B: Backend> Network<B> {
    /// Validate `layout` and `batch_size`, build the backend with
    /// `make_backend`, and allocate zeroed buffers.
    pub fn with_backend<F>(layout: impl Into<Arc<NetworkLayout>>, batch_size: usize, make_backend: F) -> Result<Self>
    where
        F: FnOnce(&NetworkLayout, usize) -> Result<B>,
    {
        let layout = layout.into();
        if layout.is_empty() {
            return Err(Error::EmptyLayout);
        }
        if batch_size == 0 {
            return Err(Error::InvalidBatchSize(batch_size));
        }
        let num_inputs = buffer_len(layout.num_inputs(), batch_size)?;
        let num_nodes = buffer_len(layout.num_nodes(), batch_size)?;
        let num_outputs = buffer_len(layout.num_outputs(), batch_size)?;
        let num_weights = buffer_len(layout.num_weights(), 1)?;

        let backend = make_backend(&*layout, batch_size)?;
        let buffers = NetworkBuffers {
            inputs: backend.allocate("inputs", num_inputs)?,
            weights: backend.allocate("weights", num_weights)?,
            activated: backend.allocate("activated", num_nodes)?,
            targets: backend.allocate("targets", num_outputs)?,
            deltas: backend.allocate("deltas", num_nodes)?,
        };
        tracing::debug!(
            backend = backend.name(),
            batch_size,
            layers = layout.len(),
            nodes = layout.num_nodes(),
            weights = layout.num_weights(),
            "network created"
        );

        Ok(Self {
            layout,
            batch_size,
            backend,
            buffers,
        })
    }

    pub fn layout(&self) -> &Arc<NetworkLayout> {
        &self.layout
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Window of layer `index`, or `None` past the last layer.
    pub fn bind_layer(&self, index: usize) -> Option<LayerWindow> {
        self.layout
            .layer(index)
            .map(|(layer, offsets)| LayerWindow::bind(index, layer, offsets, self.batch_size))
    }

    pub fn set_input(&mut self, bi: usize, ni: usize, value: f32) -> Result<()> {
        let num_inputs = self.layout.num_inputs();
        Error::check_index("batch", bi, self.batch_size)?;
        Error::check_index("input", ni, num_inputs)?;
        self.backend.set_input(&mut self.buffers, bi * num_inputs + ni, value)
    }

    pub fn set_target(&mut self, bi: usize, no: usize, value: f32) -> Result<()> {
        let num_outputs = self.layout.num_outputs();
        Error::check_index("batch", bi, self.batch_size)?;
        Error::check_index("output", no, num_outputs)?;
        self.backend.set_target(&mut self.buffers, bi * num_outputs + no, value)
    }

    /// Run every layer forward on the staged inputs.
    #[tracing::instrument(level = "debug", skip_all, fields(backend = self.backend.name(), batch = self.batch_size))]
    pub fn predict(&mut self) -> Result<()> {
        let _span = perf_span!("predict", layers = self.layout.len());
        self.backend.prepare_inputs(&mut self.buffers)?;
        for (index, (layer, offsets)) in self.layout.layers().enumerate() {
            let window = LayerWindow::bind(index, layer, offsets, self.batch_size);
            self.backend.forward(&mut self.buffers, &window)?;
        }
        Ok(())
    }

    /// One training step: predict, evaluate against the staged targets, and
    /// move every weight. Returns the RMS error of the prediction (see
    /// [`Backend::evaluate`] for when it is computed).
    #[tracing::instrument(level = "debug", skip_all, fields(backend = self.backend.name(), batch = self.batch_size))]
    pub fn learn(&mut self, params: &LearningParams, needs_error: bool) -> Result<f32> {
        self.predict()?;

        let _span = perf_span!("learn_backward", learning_rate = params.learning_rate);
        self.backend.clear_deltas(&mut self.buffers)?;
        self.backend.prepare_targets(&mut self.buffers)?;

        let last = self.layout.len() - 1;
        let window = self.bind_layer(last).ok_or(Error::EmptyLayout)?;
        let error = self.backend.evaluate(&mut self.buffers, &window, needs_error)?;

        let windows: Vec<_> = self
            .layout
            .layers()
            .enumerate()
            .map(|(index, (layer, offsets))| LayerWindow::bind(index, layer, offsets, self.batch_size))
            .collect();
        for window in windows.iter().rev() {
            self.backend.check_inputs(&self.buffers, window)?;
            self.backend.backward(&mut self.buffers, window, params)?;
        }
        tracing::trace!(error, "learn step finished");
        Ok(error)
    }

    /// Draw every weight uniformly from `[-f/2, f/2)` with
    /// `f = 2 / sqrt(fan_in)` of its layer. Equal seeds give equal weights on
    /// every backend.
    pub fn initialize_weights(&mut self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut weights = Vec::with_capacity(self.layout.num_weights());
        for (layer, _) in self.layout.layers() {
            let factor = 2.0 / (layer.num_inputs_per_node() as f32).sqrt();
            weights.extend((0..layer.num_weights()).map(|_| (rng.gen::<f32>() - 0.5) * factor));
        }
        self.backend.write(&mut self.buffers.weights, 0, &weights)
    }

    pub fn set_weights(&mut self, weights: &[f32]) -> Result<()> {
        let expected = self.layout.num_weights();
        if weights.len() != expected {
            return Err(Error::WeightCountMismatch {
                expected,
                actual: weights.len(),
            });
        }
        self.backend.write(&mut self.buffers.weights, 0, weights)
    }

    pub fn inspect_weights(&self) -> Result<Vec<f32>> {
        self.backend.read(&self.buffers.weights)
    }

    pub fn inspect_deltas(&self) -> Result<Vec<f32>> {
        self.backend.read(&self.buffers.deltas)
    }

    pub fn inspect_activated(&self) -> Result<Vec<f32>> {
        self.backend.read(&self.buffers.activated)
    }

    /// Activated values of the last layer, `batch * num_outputs`, batch-major.
    pub fn inspect_outputs(&self) -> Result<Vec<f32>> {
        let window = self.bind_layer(self.layout.len() - 1).ok_or(Error::EmptyLayout)?;
        let mut activated = self.backend.read(&self.buffers.activated)?;
        activated.truncate(window.output.base + window.output.extent);
        Ok(activated.split_off(window.output.base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{Identity, Sigmoid};
    use crate::layers::FullyConnected;

    fn two_layer_layout() -> NetworkLayout {
        NetworkLayout::new()
            .with_layer(FullyConnected::new(3, 4, Sigmoid).unwrap())
            .unwrap()
            .with_layer(FullyConnected::new(4, 2, Identity).unwrap())
            .unwrap()
    }

    #[test]
    fn windows_scale_offsets_by_batch() {
        let network = CpuNetwork::new(two_layer_layout(), 5).unwrap();

        let first = network.bind_layer(0).unwrap();
        assert!(first.is_first());
        assert_eq!(first.input.range(), 0..15);
        assert_eq!(first.output.range(), 0..20);

        let second = network.bind_layer(1).unwrap();
        assert_eq!(second.source, InputSource::Activated);
        assert_eq!(second.input.range(), 0..20);
        assert_eq!(second.output.range(), 20..30);
        assert_eq!(second.weight_base, 12);
        assert!(network.bind_layer(2).is_none());
    }

    #[test]
    fn uniforms_carry_the_window() {
        let network = CpuNetwork::new(two_layer_layout(), 5).unwrap();
        let uniforms = network.bind_layer(1).unwrap().uniforms(0.5);
        assert_eq!(uniforms[usize::from(INPUT_OFFSET.0)], Scalar::Int(0));
        assert_eq!(uniforms[usize::from(OUTPUT_OFFSET.0)], Scalar::Int(20));
        assert_eq!(uniforms[usize::from(WEIGHT_OFFSET.0)], Scalar::Int(12));
        assert_eq!(uniforms[usize::from(NUM_INPUTS.0)], Scalar::Int(4));
        assert_eq!(uniforms[usize::from(NUM_OUTPUTS.0)], Scalar::Int(2));
        assert_eq!(uniforms[usize::from(LEARNING_RATE.0)], Scalar::Float(0.5));
        assert_eq!(uniforms[usize::from(GRADIENT.0)], Scalar::Bool(true));
        assert_eq!(uniforms[usize::from(BUFFER_SIZE.0)], Scalar::Int(20));

        let first = network.bind_layer(0).unwrap().uniforms(0.5);
        assert_eq!(first[usize::from(GRADIENT.0)], Scalar::Bool(false));
    }

    #[test]
    fn construction_validates_inputs() {
        assert!(matches!(CpuNetwork::new(NetworkLayout::new(), 1), Err(Error::EmptyLayout)));
        assert!(matches!(
            CpuNetwork::new(two_layer_layout(), 0),
            Err(Error::InvalidBatchSize(0))
        ));
        assert!(matches!(
            CpuNetwork::new(two_layer_layout(), usize::MAX / 2),
            Err(Error::InvalidBatchSize(_))
        ));
    }
}
