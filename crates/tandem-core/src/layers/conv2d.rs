use tandem_backends::{Expr, KernelBuilder};

use super::{require_positive, shape_product, Layer, WeightUpdate};
use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::kernels::{input, set_out_sum, weight};

/// Convolution over a `width x height` image with `in_attributes` channels.
///
/// Pixels are row-major inside each channel plane and planes are stacked
/// channel-major, on both the input and the output side. With a height and
/// kernel height of 1 this computes exactly what [`super::Conv1d`] does, in
/// the same summation order.
#[derive(Debug)]
pub struct Conv2d {
    series_size: (usize, usize),
    in_attributes: usize,
    kernel_size: (usize, usize),
    pad_ends: bool,
    out_attributes: usize,
    outputs_per_kernel: (usize, usize),
    offset: (i32, i32),
    weights_per_kernel: usize,
    num_inputs: usize,
    num_outputs: usize,
    num_weights: usize,
    activation: Box<dyn Activation>,
}

fn padding_offset(kernel: usize) -> Result<i32> {
    i32::try_from(kernel / 2)
        .map(|half| -half)
        .map_err(|_| Error::invalid_shape("conv2d kernel too large"))
}

impl Conv2d {
    pub fn new(
        series_size: (usize, usize),
        in_attributes: usize,
        kernel_size: (usize, usize),
        pad_ends: bool,
        out_attributes: usize,
        activation: impl Activation + 'static,
    ) -> Result<Self> {
        let (sx, sy) = series_size;
        let (kx, ky) = kernel_size;
        for (what, value) in [
            ("conv2d width", sx),
            ("conv2d height", sy),
            ("conv2d input attributes", in_attributes),
            ("conv2d kernel width", kx),
            ("conv2d kernel height", ky),
            ("conv2d output attributes", out_attributes),
        ] {
            require_positive(what, value)?;
        }
        if !pad_ends && (kx > sx || ky > sy) {
            return Err(Error::invalid_shape(format!(
                "conv2d kernel {kx}x{ky} does not fit an unpadded {sx}x{sy} image"
            )));
        }

        let outputs_per_kernel = if pad_ends {
            series_size
        } else {
            (sx - kx + 1, sy - ky + 1)
        };
        let offset = if pad_ends {
            (padding_offset(kx)?, padding_offset(ky)?)
        } else {
            (0, 0)
        };
        let num_inputs = shape_product("conv2d inputs", &[sx, sy, in_attributes])?;
        let weights_per_kernel = shape_product("conv2d kernel", &[kx, ky, in_attributes])?;
        let num_weights = shape_product("conv2d weights", &[weights_per_kernel, out_attributes])?;
        let num_outputs = shape_product(
            "conv2d outputs",
            &[outputs_per_kernel.0, outputs_per_kernel.1, out_attributes],
        )?;

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

    pub fn series_size(&self) -> (usize, usize) {
        self.series_size
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        self.kernel_size
    }

    /// Output image size of one output channel.
    pub fn output_size(&self) -> (usize, usize) {
        self.outputs_per_kernel
    }

    pub fn out_attributes(&self) -> usize {
        self.out_attributes
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &'static str {
        "conv2d"
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
        let (sx, sy) = self.series_size;
        let (kx, ky) = self.kernel_size;
        let (ox, oy) = self.outputs_per_kernel;
        let plane = ox * oy;

        let series_index = k.let_int("seriesIndex", no % plane);
        let series_x = k.let_int("seriesIndexX", &series_index % ox);
        let series_y = k.let_int("seriesIndexY", &series_index / ox);
        let out_attr = k.let_int("outAttrIndex", no / plane);
        let conv_sum = k.var_float("convSum", 0.0f32);
        k.for_range("ai", 0, self.in_attributes, |k, ai| {
            k.for_range("ciy", 0, ky, |k, ciy| {
                k.for_range("cix", 0, kx, |k, cix| {
                    let weight_index = k.let_int(
                        "weightIndex",
                        &out_attr * self.weights_per_kernel + &ai * (kx * ky) + &ciy * kx + &cix,
                    );
                    let mut nx = &series_x + self.offset.0 + &cix;
                    let mut ny = &series_y + self.offset.1 + &ciy;
                    if self.pad_ends {
                        nx = nx.clamp(0, sx - 1);
                        ny = ny.clamp(0, sy - 1);
                    }
                    let nix = k.let_int("nix", nx);
                    let niy = k.let_int("niy", ny);
                    let ni = k.let_int("ni", &ai * (sx * sy) + niy * sx + nix);
                    k.accumulate(conv_sum, input(bi, ni) * weight(weight_index));
                });
            });
        });
        set_out_sum(k, bi, no, conv_sum);
    }

    fn emit_backward(&self, k: &mut KernelBuilder, wi: &Expr, batch_size: usize) {
        let (sx, sy) = self.series_size;
        let (kx, ky) = self.kernel_size;
        let (ox, oy) = self.outputs_per_kernel;

        let local_xy = k.let_int("localWeightXY", wi % (kx * ky));
        let local_x = k.let_int("localWeightX", &local_xy % kx);
        let local_y = k.let_int("localWeightY", &local_xy / kx);
        let in_attr = k.let_int("inAttrIndex", (wi / (kx * ky)) % self.in_attributes);
        let out_attr = k.let_int("outAttrIndex", wi / self.weights_per_kernel);
        let update = WeightUpdate::begin(k, wi);
        k.for_range("bi", 0, batch_size, |k, bi| {
            k.for_range("noiy", 0, oy, |k, noiy| {
                k.for_range("noix", 0, ox, |k, noix| {
                    let nix = k.let_int("niix", (&noix + &local_x + self.offset.0).clamp(0, sx - 1));
                    let niy = k.let_int("niiy", (&noiy + &local_y + self.offset.1).clamp(0, sy - 1));
                    let ni = k.let_int("ni", &in_attr * (sx * sy) + niy * sx + nix);
                    let no = k.let_int("no", &out_attr * (ox * oy) + &noiy * ox + &noix);
                    update.contribute(k, &bi, &ni, &no);
                });
            });
        });
        update.finish(k, wi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Identity;

    #[test]
    fn unpadded_image_shrinks_on_both_axes() {
        let layer = Conv2d::new((7, 5), 2, (3, 3), false, 4, Identity).unwrap();
        assert_eq!(layer.output_size(), (5, 3));
        assert_eq!(layer.num_inputs(), 7 * 5 * 2);
        assert_eq!(layer.num_outputs(), 5 * 3 * 4);
        assert_eq!(layer.num_weights(), 9 * 2 * 4);
        assert_eq!(layer.num_inputs_per_node(), 18);
    }

    #[test]
    fn padded_image_keeps_its_size() {
        let layer = Conv2d::new((6, 4), 1, (3, 3), true, 1, Identity).unwrap();
        assert_eq!(layer.output_size(), (6, 4));
    }

    #[test]
    fn oversized_kernel_needs_padding() {
        assert!(Conv2d::new((4, 2), 1, (3, 3), false, 1, Identity).is_err());
        assert!(Conv2d::new((4, 2), 1, (3, 3), true, 1, Identity).is_ok());
        assert!(Conv2d::new((4, 0), 1, (1, 1), true, 1, Identity).is_err());
    }
}
