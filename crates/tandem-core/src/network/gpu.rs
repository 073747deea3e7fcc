//! Parallel backend over a [`ComputeDevice`].
//!
//! Kernels come from process-wide caches, one per phase, so every network
//! with the same layer shapes and batch size shares compiled kernels. Each
//! phase is one dispatch followed by a device barrier.

use std::fmt;
use std::sync::Arc;

use tandem_backends::{
    BufferBinding, BufferHandle, CompiledKernel, ComputeDevice, GridDim, KernelCache, KernelKey, KernelKind,
    KernelModule, RayonDevice, Scalar,
};
use tandem_tracing::perf_span;

use super::{check_finite, clear_uniforms, Backend, InputSource, KernelRequest, LayerKernels, LayerWindow, Network, NetworkBuffers};
use crate::error::{Error, Result};
use crate::kernels::{self, ACTIVATED, DELTAS, INPUTS, TARGETS, WEIGHTS};
use crate::layout::NetworkLayout;
use crate::params::LearningParams;

static CLEAR_KERNELS: KernelCache = KernelCache::new();
static FORWARD_KERNELS: KernelCache = KernelCache::new();
static ACTIVATION_KERNELS: KernelCache = KernelCache::new();
static ACTIVATION_BACKWARD_KERNELS: KernelCache = KernelCache::new();
static EVALUATE_KERNELS: KernelCache = KernelCache::new();
static BACKWARD_KERNELS: KernelCache = KernelCache::new();
static NORMALIZE_KERNELS: KernelCache = KernelCache::new();

/// Process-wide cache holding kernels of `kind`.
pub fn kernel_cache(kind: KernelKind) -> &'static KernelCache {
    match kind {
        KernelKind::Clear => &CLEAR_KERNELS,
        KernelKind::Forward => &FORWARD_KERNELS,
        KernelKind::Activation => &ACTIVATION_KERNELS,
        KernelKind::ActivationBackward => &ACTIVATION_BACKWARD_KERNELS,
        KernelKind::Evaluate => &EVALUATE_KERNELS,
        KernelKind::Backward => &BACKWARD_KERNELS,
        KernelKind::Normalize => &NORMALIZE_KERNELS,
    }
}

/// Parallel network running on a compute device.
pub type GpuNetwork = Network<GpuBackend>;

impl Network<GpuBackend> {
    /// Network on a [`RayonDevice`] configured from the environment.
    pub fn new(layout: impl Into<Arc<NetworkLayout>>, batch_size: usize) -> Result<Self> {
        let device: Arc<dyn ComputeDevice> = Arc::new(RayonDevice::from_env()?);
        Self::with_device(layout, batch_size, device)
    }

    pub fn with_device(
        layout: impl Into<Arc<NetworkLayout>>,
        batch_size: usize,
        device: Arc<dyn ComputeDevice>,
    ) -> Result<Self> {
        Self::with_backend(layout, batch_size, |layout, batch_size| {
            GpuBackend::new(device, layout, batch_size)
        })
    }

    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.backend().device
    }
}

/// Device buffer owned by a network; freed on drop.
pub struct DeviceTensor {
    handle: BufferHandle,
    len: usize,
    device: Arc<dyn ComputeDevice>,
}

impl DeviceTensor {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .field("device", &self.device.kind())
            .finish()
    }
}

impl Drop for DeviceTensor {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.handle) {
            tracing::warn!(handle = %self.handle, error = %err, "failed to free device buffer");
        }
    }
}

#[derive(Debug)]
pub struct GpuBackend {
    device: Arc<dyn ComputeDevice>,
    layers: Vec<LayerKernels>,
    clear: Arc<CompiledKernel>,
    evaluate: Arc<CompiledKernel>,
    evaluate_grid: GridDim,
    normalize: Arc<CompiledKernel>,
    staged_inputs: Vec<f32>,
    staged_targets: Vec<f32>,
}

fn cached(device: &dyn ComputeDevice, batch_size: usize, request: KernelRequest<'_>) -> Result<Arc<CompiledKernel>> {
    let key = KernelKey {
        kind: request.kind,
        device: device.kind(),
        batch_size,
        extent: request.extent,
        source: Arc::from(request.module.source()),
        interdependent: request.interdependent,
    };
    Ok(kernel_cache(request.kind).get_or_try_insert(&key, || device.compile(request.module))?)
}

fn request(kind: KernelKind, module: &KernelModule, extent: usize) -> KernelRequest<'_> {
    KernelRequest {
        kind,
        module,
        extent,
        interdependent: false,
    }
}

impl GpuBackend {
    pub fn new(device: Arc<dyn ComputeDevice>, layout: &NetworkLayout, batch_size: usize) -> Result<Self> {
        let layers = layout
            .layers()
            .map(|(layer, _)| {
                LayerKernels::resolve(layer, batch_size, |request| cached(device.as_ref(), batch_size, request))
            })
            .collect::<Result<Vec<_>>>()?;

        let outputs = layout.num_outputs();
        let deltas = layout.num_nodes() * batch_size;
        let clear = cached(
            device.as_ref(),
            batch_size,
            request(KernelKind::Clear, &kernels::clear_module(deltas), deltas),
        )?;
        let evaluate = cached(
            device.as_ref(),
            batch_size,
            request(KernelKind::Evaluate, &kernels::evaluate_module(batch_size, outputs), outputs),
        )?;
        let normalize = cached(
            device.as_ref(),
            batch_size,
            request(KernelKind::Normalize, &kernels::normalize_module(), 1),
        )?;

        Ok(Self {
            layers,
            clear,
            evaluate,
            evaluate_grid: GridDim::from_sizes(batch_size, outputs)?,
            normalize,
            staged_inputs: vec![0.0; layout.num_inputs() * batch_size],
            staged_targets: vec![0.0; outputs * batch_size],
            device,
        })
    }

    /// Kernels of layer `index`, shared with every equally shaped network.
    pub fn layer_kernels(&self, index: usize) -> Option<&LayerKernels> {
        self.layers.get(index)
    }

    fn kernels(&self, window: &LayerWindow) -> Result<&LayerKernels> {
        self.layers.get(window.layer).ok_or(Error::IndexOutOfRange {
            what: "layer",
            index: window.layer,
            len: self.layers.len(),
        })
    }

    fn run(
        &self,
        kernel: &CompiledKernel,
        grid: GridDim,
        uniforms: &[Scalar],
        bindings: &[BufferBinding],
    ) -> Result<()> {
        self.device.dispatch(kernel, grid, uniforms, bindings)?;
        self.device.barrier();
        Ok(())
    }
}

fn bindings(buffers: &NetworkBuffers<DeviceTensor>, source: InputSource) -> [BufferBinding; 5] {
    let inputs = match source {
        InputSource::External => &buffers.inputs,
        InputSource::Activated => &buffers.activated,
    };
    [
        BufferBinding::new(WEIGHTS, buffers.weights.handle),
        BufferBinding::new(INPUTS, inputs.handle),
        BufferBinding::new(ACTIVATED, buffers.activated.handle),
        BufferBinding::new(TARGETS, buffers.targets.handle),
        BufferBinding::new(DELTAS, buffers.deltas.handle),
    ]
}

fn stage(staged: &mut [f32], index: usize, value: f32) -> Result<()> {
    let len = staged.len();
    let slot = staged.get_mut(index).ok_or(Error::IndexOutOfRange {
        what: "staging",
        index,
        len,
    })?;
    *slot = value;
    Ok(())
}

impl Backend for GpuBackend {
    type Tensor = DeviceTensor;

    fn name(&self) -> &'static str {
        "gpu"
    }

    fn allocate(&self, label: &'static str, len: usize) -> Result<DeviceTensor> {
        let handle = self.device.allocate(label, len)?;
        Ok(DeviceTensor {
            handle,
            len,
            device: Arc::clone(&self.device),
        })
    }

    fn set_input(&mut self, _buffers: &mut NetworkBuffers<DeviceTensor>, index: usize, value: f32) -> Result<()> {
        stage(&mut self.staged_inputs, index, value)
    }

    fn set_target(&mut self, _buffers: &mut NetworkBuffers<DeviceTensor>, index: usize, value: f32) -> Result<()> {
        stage(&mut self.staged_targets, index, value)
    }

    fn prepare_inputs(&mut self, buffers: &mut NetworkBuffers<DeviceTensor>) -> Result<()> {
        self.device.write(buffers.inputs.handle, 0, &self.staged_inputs)?;
        Ok(())
    }

    fn prepare_targets(&mut self, buffers: &mut NetworkBuffers<DeviceTensor>) -> Result<()> {
        self.device.write(buffers.targets.handle, 0, &self.staged_targets)?;
        Ok(())
    }

    fn clear_deltas(&mut self, buffers: &mut NetworkBuffers<DeviceTensor>) -> Result<()> {
        let len = buffers.deltas.len;
        let grid = GridDim::from_sizes(len, 1)?;
        self.run(&self.clear, grid, &clear_uniforms(len), &bindings(buffers, InputSource::Activated))
    }

    fn forward(&mut self, buffers: &mut NetworkBuffers<DeviceTensor>, window: &LayerWindow) -> Result<()> {
        let _span = perf_span!("gpu_forward", layer = window.layer);
        let kernels = self.kernels(window)?;
        let uniforms = window.uniforms(0.0);
        let bindings = bindings(buffers, window.source);
        self.run(&kernels.forward, kernels.forward_grid, &uniforms, &bindings)?;
        if let Some(activation) = &kernels.activation {
            self.run(activation, kernels.activation_grid, &uniforms, &bindings)?;
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        buffers: &mut NetworkBuffers<DeviceTensor>,
        window: &LayerWindow,
        needs_error: bool,
    ) -> Result<f32> {
        let uniforms = window.uniforms(0.0);
        self.run(&self.evaluate, self.evaluate_grid, &uniforms, &bindings(buffers, window.source))?;
        if !needs_error {
            return Ok(0.0);
        }

        let deltas = self.device.read_vec(buffers.deltas.handle)?;
        let sum: f64 = deltas[window.output.range()]
            .iter()
            .map(|&delta| f64::from(delta) * f64::from(delta))
            .sum();
        Ok((sum / window.batch_size as f64).sqrt() as f32)
    }

    /// External inputs are checked on the host copy; hidden activations
    /// are read back from the device.
    fn check_inputs(&self, buffers: &NetworkBuffers<DeviceTensor>, window: &LayerWindow) -> Result<()> {
        match window.source {
            InputSource::External => check_finite(window.layer, &self.staged_inputs),
            InputSource::Activated => {
                let activated = self.device.read_vec(buffers.activated.handle)?;
                check_finite(window.layer, &activated[window.input.range()])
            }
        }
    }

    fn backward(
        &mut self,
        buffers: &mut NetworkBuffers<DeviceTensor>,
        window: &LayerWindow,
        params: &LearningParams,
    ) -> Result<()> {
        let _span = perf_span!("gpu_backward", layer = window.layer);
        let kernels = self.kernels(window)?;
        let uniforms = window.uniforms(params.learning_rate);
        let bindings = bindings(buffers, window.source);
        if let Some(activation_backward) = &kernels.activation_backward {
            self.run(activation_backward, kernels.activation_grid, &uniforms, &bindings)?;
        }
        self.run(&kernels.backward, kernels.backward_grid, &uniforms, &bindings)?;
        if params.normalize && !window.is_first() {
            self.run(&self.normalize, GridDim::linear(1), &uniforms, &bindings)?;
        }
        Ok(())
    }

    fn read(&self, tensor: &DeviceTensor) -> Result<Vec<f32>> {
        Ok(self.device.read_vec(tensor.handle)?)
    }

    fn write(&mut self, tensor: &mut DeviceTensor, offset: usize, values: &[f32]) -> Result<()> {
        self.device.write(tensor.handle, offset, values)?;
        Ok(())
    }
}
