//! Layer variants.
//!
//! A layer is an immutable shape plus two kernel formulas: the forward sum
//! of one output for one batch row, and the update of one weight across the
//! whole batch. Both are written against the helpers in [`crate::kernels`]
//! and therefore address whatever window the network binds.

mod conv1d;
mod conv2d;
mod fully_connected;

pub use conv1d::Conv1d;
pub use conv2d::Conv2d;
pub use fully_connected::FullyConnected;

use std::fmt;

use tandem_backends::{Expr, KernelBuilder, Var};

use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::kernels;

pub trait Layer: fmt::Debug + Send + Sync {
    /// Short identifier used in kernel names.
    fn name(&self) -> &'static str;

    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;

    fn num_weights(&self) -> usize;

    /// Fan-in of one output node; scales weight initialization.
    fn num_inputs_per_node(&self) -> usize;

    fn activation(&self) -> &dyn Activation;

    /// Store the raw sum of output `no` for batch row `bi` with
    /// [`crate::kernels::set_out_sum`].
    fn emit_forward(&self, k: &mut KernelBuilder, bi: &Expr, no: &Expr);

    /// Move weight `wi` by `learningRate * sum(input * delta)` over the
    /// batch and, when the `gradient` uniform is set, scatter
    /// `original * delta` into the input deltas.
    fn emit_backward(&self, k: &mut KernelBuilder, wi: &Expr, batch_size: usize);
}

/// Placement of a layer inside a [`crate::NetworkLayout`], in nodes and weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerOffsets {
    /// Negative for the first layer, whose inputs live outside `activated`.
    pub input: isize,
    pub output: usize,
    pub weight: usize,
}

/// Checked product of shape factors; every result must be addressable
/// with the kernels' `int` indices.
pub(crate) fn shape_product(what: &str, factors: &[usize]) -> Result<usize> {
    let product = factors
        .iter()
        .try_fold(1usize, |acc, &factor| acc.checked_mul(factor))
        .filter(|&product| i32::try_from(product).is_ok());
    product.ok_or_else(|| Error::invalid_shape(format!("{what} {factors:?} does not fit the index range")))
}

pub(crate) fn require_positive(what: &str, value: usize) -> Result<usize> {
    if value == 0 {
        Err(Error::invalid_shape(format!("{what} must be positive")))
    } else {
        Ok(value)
    }
}

/// Per-weight accumulator shared by every backward formula.
///
/// `begin` reads the original weight, `contribute` adds one
/// `(batch row, input, output)` term and scatters the input delta when the
/// `gradient` uniform is set, `finish` stores the moved weight.
pub(crate) struct WeightUpdate {
    original: Expr,
    delta_weight: Var,
}

impl WeightUpdate {
    pub(crate) fn begin(k: &mut KernelBuilder, wi: &Expr) -> Self {
        let original = k.let_float("originalWeight", kernels::weight(wi));
        let delta_weight = k.var_float("deltaWeight", 0.0f32);
        Self { original, delta_weight }
    }

    pub(crate) fn contribute(&self, k: &mut KernelBuilder, bi: &Expr, ni: &Expr, no: &Expr) {
        let input = k.let_float("inputI", kernels::input(bi, ni));
        let delta = k.let_float("delta", kernels::out_delta(bi, no));
        k.accumulate(self.delta_weight, &input * &delta);
        let scattered = &self.original * &delta;
        k.if_then(kernels::gradient(), |k| kernels::add_in_delta(k, bi, ni, scattered));
    }

    pub(crate) fn finish(self, k: &mut KernelBuilder, wi: &Expr) {
        kernels::update_weight(k, wi, &self.original, self.delta_weight);
    }
}
