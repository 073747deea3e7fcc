use tandem_backends::{Expr, KernelBuilder};

use super::{require_positive, shape_product, Layer, WeightUpdate};
use crate::activation::Activation;
use crate::error::Result;
use crate::kernels::{input, set_out_sum, weight};

/// Dense layer: every output sums every input.
///
/// Weight `no * num_inputs + ni` connects input `ni` to output `no`.
#[derive(Debug)]
pub struct FullyConnected {
    num_inputs: usize,
    num_outputs: usize,
    num_weights: usize,
    activation: Box<dyn Activation>,
}

impl FullyConnected {
    pub fn new(num_inputs: usize, num_outputs: usize, activation: impl Activation + 'static) -> Result<Self> {
        require_positive("fully connected inputs", num_inputs)?;
        require_positive("fully connected outputs", num_outputs)?;
        let num_weights = shape_product("fully connected weights", &[num_inputs, num_outputs])?;
        Ok(Self {
            num_inputs,
            num_outputs,
            num_weights,
            activation: Box::new(activation),
        })
    }
}

impl Layer for FullyConnected {
    fn name(&self) -> &'static str {
        "fully_connected"
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
        self.num_inputs
    }

    fn activation(&self) -> &dyn Activation {
        self.activation.as_ref()
    }

    fn emit_forward(&self, k: &mut KernelBuilder, bi: &Expr, no: &Expr) {
        let sum = k.var_float("sum", 0.0f32);
        let num_inputs = self.num_inputs;
        k.for_range("ni", 0, num_inputs, |k, ni| {
            let weight_index = k.let_int("weightIndex", no * num_inputs + &ni);
            k.accumulate(sum, weight(weight_index) * input(bi, ni));
        });
        set_out_sum(k, bi, no, sum);
    }

    fn emit_backward(&self, k: &mut KernelBuilder, wi: &Expr, batch_size: usize) {
        let ni = k.let_int("ni", wi % self.num_inputs);
        let no = k.let_int("no", wi / self.num_inputs);
        let update = WeightUpdate::begin(k, wi);
        k.for_range("bi", 0, batch_size, |k, bi| update.contribute(k, &bi, &ni, &no));
        update.finish(k, wi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{Identity, Sigmoid};
    use crate::error::Error;

    #[test]
    fn shape_follows_inputs_and_outputs() {
        let layer = FullyConnected::new(784, 10, Sigmoid).unwrap();
        assert_eq!(layer.num_inputs(), 784);
        assert_eq!(layer.num_outputs(), 10);
        assert_eq!(layer.num_weights(), 7840);
        assert_eq!(layer.num_inputs_per_node(), 784);
        assert_eq!(layer.activation().name(), "sigmoid");
    }

    #[test]
    fn zero_sized_layers_are_rejected() {
        assert!(matches!(FullyConnected::new(0, 3, Identity), Err(Error::InvalidShape(_))));
        assert!(matches!(FullyConnected::new(3, 0, Identity), Err(Error::InvalidShape(_))));
    }

    #[test]
    fn weight_count_must_be_addressable() {
        assert!(FullyConnected::new(1 << 16, 1 << 16, Identity).is_err());
    }
}
