use tandem_backends::{Expr, KernelBuilder};

use super::{require_positive, shape_product, Layer, WeightUpdate};
use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::kernels::{input, set_out_sum, weight};

/// Convolution along a series of `series_size` samples with
/// `in_attributes` channels each.
///
/// Inputs are laid out channel-major (`attribute * series_size + sample`),
/// outputs likewise with `outputs_per_kernel` samples per output channel.
/// Padded layers keep the series length and clamp reads to the edge sample.
#[derive(Debug)]
pub struct Conv1d {
    series_size: usize,
    in_attributes: usize,
    kernel_size: usize,
    pad_ends: bool,
    out_attributes: usize,
    outputs_per_kernel: usize,
    offset: i32,
    weights_per_kernel: usize,
    num_inputs: usize,
    num_outputs: usize,
    num_weights: usize,
    activation: Box<dyn Activation>,
}

impl Conv1d {
    pub fn new(
        series_size: usize,
        in_attributes: usize,
        kernel_size: usize,
        pad_ends: bool,
        out_attributes: usize,
        activation: impl Activation + 'static,
    ) -> Result<Self> {
        require_positive("conv1d series size", series_size)?;
        require_positive("conv1d input attributes", in_attributes)?;
        require_positive("conv1d kernel size", kernel_size)?;
        require_positive("conv1d output attributes", out_attributes)?;
        if !pad_ends && kernel_size > series_size {
            return Err(Error::invalid_shape(format!(
                "conv1d kernel of {kernel_size} does not fit an unpadded series of {series_size}"
            )));
        }

        let outputs_per_kernel = if pad_ends {
            series_size
        } else {
            series_size - kernel_size + 1
        };
        let num_inputs = shape_product("conv1d inputs", &[series_size, in_attributes])?;
        let weights_per_kernel = shape_product("conv1d kernel", &[kernel_size, in_attributes])?;
        let num_weights = shape_product("conv1d weights", &[weights_per_kernel, out_attributes])?;
        let num_outputs = shape_product("conv1d outputs", &[outputs_per_kernel, out_attributes])?;
        let offset = if pad_ends {
            -i32::try_from(kernel_size / 2).map_err(|_| Error::invalid_shape("conv1d kernel too large"))?
        } else {
            0
        };

        Ok(Self {
            series_size,
            in_attributes,
            kernel_size,
            pad_ends,
            out_attributes,
            outputs_per_kernel,
            offset,
            weights_per_kernel,
            num_inputs,
            num_outputs,
            num_weights,
            activation: Box::new(activation),
        })
    }

    pub fn series_size(&self) -> usize {
        self.series_size
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn pad_ends(&self) -> bool {
        self.pad_ends
    }

    pub fn out_attributes(&self) -> usize {
        self.out_attributes
    }
}

impl Layer for Conv1d {
    fn name(&self) -> &'static str {
        "conv1d"
    }

    fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    fn num_weights(&self) -> usize {
        self.num_weights
    }

    fn num_inputs_per_node(&self) -> usize {
        self.weights_per_kernel
    }

    fn activation(&self) -> &dyn Activation {
        self.activation.as_ref()
    }

    fn emit_forward(&self, k: &mut KernelBuilder, bi: &Expr, no: &Expr) {
        let series_index = k.let_int("seriesIndex", no % self.outputs_per_kernel);
        let out_attr = k.let_int("outAttrIndex", no / self.outputs_per_kernel);
        let conv_sum = k.var_float("convSum", 0.0f32);
        k.for_range("niY", 0, self.in_attributes, |k, ni_y| {
            k.for_range("ci", 0, self.kernel_size, |k, ci| {
                let weight_index = k.let_int(
                    "weightIndex",
                    &out_attr * self.weights_per_kernel + &ni_y * self.kernel_size + &ci,
                );
                let mut sample = &series_index + self.offset + &ci;
                if self.pad_ends {
                    sample = sample.clamp(0, self.series_size - 1);
                }
                let ni_x = k.let_int("niX", sample);
                let ni = k.let_int("ni", &ni_y * self.series_size + ni_x);
                k.accumulate(conv_sum, input(bi, ni) * weight(weight_index));
            });
        });
        set_out_sum(k, bi, no, conv_sum);
    }

    fn emit_backward(&self, k: &mut KernelBuilder, wi: &Expr, batch_size: usize) {
        let local_x = k.let_int("localWeightX", wi % self.kernel_size);
        let in_attr = k.let_int("inAttrIndex", (wi / self.kernel_size) % self.in_attributes);
        let out_attr = k.let_int("outAttrIndex", wi / self.weights_per_kernel);
        let update = WeightUpdate::begin(k, wi);
        k.for_range("bi", 0, batch_size, |k, bi| {
            k.for_range("noi", 0, self.outputs_per_kernel, |k, noi| {
                let sample = k.let_int(
                    "nii",
                    (&noi + &local_x + self.offset).clamp(0, self.series_size - 1),
                );
                let ni = k.let_int("ni", &in_attr * self.series_size + sample);
                let no = k.let_int("no", &out_attr * self.outputs_per_kernel + &noi);
                update.contribute(k, &bi, &ni, &no);
            });
        });
        update.finish(k, wi);
    }
}
