//! Single-threaded backend over host vectors.
//!
//! Kernels are compiled once per layer when the network is built and run
//! with [`CompiledKernel::run_sequential`], one invocation after another.

use std::sync::Arc;

use tandem_backends::{as_cells, compile, CompiledKernel, GridDim, Scalar, SliceMemory};

use super::{check_finite, Backend, InputSource, LayerKernels, LayerWindow, Network, NetworkBuffers};
use crate::error::{Error, Result};
use crate::kernels::{self, ACTIVATED, DELTAS, INPUTS, TARGETS, WEIGHTS};
use crate::layout::NetworkLayout;
use crate::params::LearningParams;

/// Scalar reference network.
pub type CpuNetwork = Network<CpuBackend>;

impl Network<CpuBackend> {
    pub fn new(layout: impl Into<Arc<NetworkLayout>>, batch_size: usize) -> Result<Self> {
        Self::with_backend(layout, batch_size, CpuBackend::new)
    }
}

#[derive(Debug)]
pub struct CpuBackend {
    layers: Vec<LayerKernels>,
    evaluate: CompiledKernel,
    evaluate_grid: GridDim,
    normalize: CompiledKernel,
}

impl CpuBackend {
    pub fn new(layout: &NetworkLayout, batch_size: usize) -> Result<Self> {
        let layers = layout
            .layers()
            .map(|(layer, _)| {
                LayerKernels::resolve(layer, batch_size, |request| {
                    tracing::debug!(kernel = request.module.name.as_str(), "compiling");
                    Ok(Arc::new(compile(request.module)?))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = layout.num_outputs();

        Ok(Self {
            layers,
            evaluate: compile(&kernels::evaluate_module(batch_size, outputs))?,
            evaluate_grid: GridDim::from_sizes(batch_size, outputs)?,
            normalize: compile(&kernels::normalize_module())?,
        })
    }

    fn kernels(&self, window: &LayerWindow) -> Result<&LayerKernels> {
        self.layers.get(window.layer).ok_or(Error::IndexOutOfRange {
            what: "layer",
            index: window.layer,
            len: self.layers.len(),
        })
    }
}

/// Bind all five buffers; a non-first layer reads its inputs from `activated`.
fn memory(buffers: &mut NetworkBuffers<Vec<f32>>, source: InputSource) -> SliceMemory<'_> {
    let NetworkBuffers {
        inputs,
        weights,
        activated,
        targets,
        deltas,
    } = buffers;
    let activated = as_cells(activated);
    let inputs = match source {
        InputSource::External => as_cells(inputs),
        InputSource::Activated => activated,
    };
    SliceMemory::new()
        .bind(WEIGHTS, as_cells(weights))
        .bind(INPUTS, inputs)
        .bind(ACTIVATED, activated)
        .bind(TARGETS, as_cells(targets))
        .bind(DELTAS, as_cells(deltas))
}

fn run(kernel: &CompiledKernel, grid: GridDim, uniforms: &[Scalar], memory: &SliceMemory<'_>) -> Result<()> {
    tracing::trace!(kernel = kernel.name(), %grid, "run");
    kernel.run_sequential(grid, uniforms, memory)?;
    memory.check(kernel.name())?;
    Ok(())
}

fn write_into(tensor: &mut [f32], index: usize, value: f32) -> Result<()> {
    let len = tensor.len();
    let slot = tensor.get_mut(index).ok_or(Error::IndexOutOfRange {
        what: "buffer",
        index,
        len,
    })?;
    *slot = value;
    Ok(())
}

impl Backend for CpuBackend {
    type Tensor = Vec<f32>;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn allocate(&self, _label: &'static str, len: usize) -> Result<Vec<f32>> {
        Ok(vec![0.0; len])
    }

    fn set_input(&mut self, buffers: &mut NetworkBuffers<Vec<f32>>, index: usize, value: f32) -> Result<()> {
        write_into(&mut buffers.inputs, index, value)
    }

    fn set_target(&mut self, buffers: &mut NetworkBuffers<Vec<f32>>, index: usize, value: f32) -> Result<()> {
        write_into(&mut buffers.targets, index, value)
    }

    fn prepare_inputs(&mut self, _buffers: &mut NetworkBuffers<Vec<f32>>) -> Result<()> {
        Ok(())
    }

    fn prepare_targets(&mut self, _buffers: &mut NetworkBuffers<Vec<f32>>) -> Result<()> {
        Ok(())
    }

    fn clear_deltas(&mut self, buffers: &mut NetworkBuffers<Vec<f32>>) -> Result<()> {
        buffers.deltas.fill(0.0);
        Ok(())
    }

    fn forward(&mut self, buffers: &mut NetworkBuffers<Vec<f32>>, window: &LayerWindow) -> Result<()> {
        let kernels = self.kernels(window)?;
        let uniforms = window.uniforms(0.0);
        let memory = memory(buffers, window.source);
        run(&kernels.forward, kernels.forward_grid, &uniforms, &memory)?;
        if let Some(activation) = &kernels.activation {
            run(activation, kernels.activation_grid, &uniforms, &memory)?;
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        buffers: &mut NetworkBuffers<Vec<f32>>,
        window: &LayerWindow,
        _needs_error: bool,
    ) -> Result<f32> {
        let uniforms = window.uniforms(0.0);
        run(&self.evaluate, self.evaluate_grid, &uniforms, &memory(buffers, window.source))?;

        let sum: f64 = buffers.deltas[window.output.range()]
            .iter()
            .map(|&delta| f64::from(delta) * f64::from(delta))
            .sum();
        Ok((sum / window.batch_size as f64).sqrt() as f32)
    }

    fn check_inputs(&self, buffers: &NetworkBuffers<Vec<f32>>, window: &LayerWindow) -> Result<()> {
        let values = match window.source {
            InputSource::External => &buffers.inputs[..],
            InputSource::Activated => &buffers.activated[window.input.range()],
        };
        check_finite(window.layer, values)
    }

    fn backward(
        &mut self,
        buffers: &mut NetworkBuffers<Vec<f32>>,
        window: &LayerWindow,
        params: &LearningParams,
    ) -> Result<()> {
        let kernels = self.kernels(window)?;
        let uniforms = window.uniforms(params.learning_rate);
        let memory = memory(buffers, window.source);
        if let Some(activation_backward) = &kernels.activation_backward {
            run(activation_backward, kernels.activation_grid, &uniforms, &memory)?;
        }
        run(&kernels.backward, kernels.backward_grid, &uniforms, &memory)?;
        if params.normalize && !window.is_first() {
            run(&self.normalize, GridDim::linear(1), &uniforms, &memory)?;
        }
        Ok(())
    }

    fn read(&self, tensor: &Vec<f32>) -> Result<Vec<f32>> {
        Ok(tensor.clone())
    }

    fn write(&mut self, tensor: &mut Vec<f32>, offset: usize, values: &[f32]) -> Result<()> {
        let end = offset.checked_add(values.len()).filter(|&end| end <= tensor.len());
        let Some(end) = end else {
            return Err(Error::IndexOutOfRange {
                what: "buffer",
                index: offset.saturating_add(values.len()),
                len: tensor.len(),
            });
        };
        tensor[offset..end].copy_from_slice(values);
        Ok(())
    }
}
