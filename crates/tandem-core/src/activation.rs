//! Activation functions.
//!
//! An activation contributes two kernel fragments: a forward transform of
//! raw sums in `activated`, and a backward rescaling of `deltas` by the local
//! derivative. Element-wise activations write [`Activation::emit_forward`] /
//! [`Activation::emit_backward`]; row-wide ones override the `_row` variants
//! and report [`Activation::has_interdependencies`], which makes the parallel
//! backend dispatch one invocation per batch row.

use std::fmt;

use tandem_backends::{as_cells, Expr, GridDim, KernelBuilder, Scalar, SliceMemory};

use crate::error::Result;
use crate::kernels::{self, ACTIVATED, DELTAS, UNIFORM_COUNT};

pub trait Activation: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn has_interdependencies(&self) -> bool {
        false
    }

    /// Forward leaves sums unchanged, so the phase can be skipped.
    fn forward_is_identity(&self) -> bool {
        false
    }

    /// Backward leaves deltas unchanged, so the phase can be skipped.
    fn backward_is_identity(&self) -> bool {
        false
    }

    /// Transform `activated[i]` in place.
    fn emit_forward(&self, k: &mut KernelBuilder, i: &Expr);

    /// Multiply `deltas[i]` by the derivative at `activated[i]`.
    fn emit_backward(&self, k: &mut KernelBuilder, i: &Expr);

    fn emit_forward_row(&self, k: &mut KernelBuilder, i0: &Expr, i1: &Expr) {
        k.for_range("i", i0, i1, |k, i| self.emit_forward(k, &i));
    }

    fn emit_backward_row(&self, k: &mut KernelBuilder, i0: &Expr, i1: &Expr) {
        k.for_range("i", i0, i1, |k, i| self.emit_backward(k, &i));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Identity;

impl Activation for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn forward_is_identity(&self) -> bool {
        true
    }

    fn backward_is_identity(&self) -> bool {
        true
    }

    fn emit_forward(&self, _k: &mut KernelBuilder, _i: &Expr) {}

    fn emit_backward(&self, _k: &mut KernelBuilder, _i: &Expr) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sigmoid;

impl Activation for Sigmoid {
    fn name(&self) -> &'static str {
        "sigmoid"
    }

    fn emit_forward(&self, k: &mut KernelBuilder, i: &Expr) {
        let value = Expr::load(ACTIVATED, i);
        k.store(ACTIVATED, i, 1.0f32 / (1.0f32 + (-value).exp()));
    }

    fn emit_backward(&self, k: &mut KernelBuilder, i: &Expr) {
        let value = k.let_float("value", Expr::load(ACTIVATED, i));
        k.store(DELTAS, i, Expr::load(DELTAS, i) * (&value * (1.0f32 - value.clone())));
    }
}

/// `max(v, v * leak)`; the derivative is `leak` below zero and 1 above.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyRelu {
    pub leak: f32,
}

impl LeakyRelu {
    pub fn new(leak: f32) -> Self {
        Self { leak }
    }
}

impl Default for LeakyRelu {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl Activation for LeakyRelu {
    fn name(&self) -> &'static str {
        "leaky_relu"
    }

    fn emit_forward(&self, k: &mut KernelBuilder, i: &Expr) {
        let value = k.let_float("value", Expr::load(ACTIVATED, i));
        k.store(ACTIVATED, i, value.clone().max(value * self.leak));
    }

    fn emit_backward(&self, k: &mut KernelBuilder, i: &Expr) {
        let leak = self.leak;
        k.if_then(Expr::load(ACTIVATED, i).less_than(0.0f32), |k| {
            k.store(DELTAS, i, Expr::load(DELTAS, i) * leak);
        });
    }
}

/// Row-wise softmax, `exp` capped at `1e30` before normalizing.
///
/// The default backward is a no-op: it is only correct when training
/// against a cross-entropy loss, whose gradient with respect to the
/// pre-softmax sums is exactly the `target - output` delta the engine
/// already produces. Use [`SoftMax::with_jacobian`] for any other loss.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SoftMax {
    jacobian: bool,
}

/// Upper bound on `exp(v)` so a row sum stays finite.
const SOFTMAX_EXP_CAP: f32 = 1e30;

impl SoftMax {
    pub fn new() -> Self {
        Self { jacobian: false }
    }

    /// Softmax whose backward applies the full Jacobian,
    /// `d_i <- a_i * (d_i - sum_j a_j * d_j)`.
    pub fn with_jacobian() -> Self {
        Self { jacobian: true }
    }

    pub fn uses_jacobian(&self) -> bool {
        self.jacobian
    }
}

impl Activation for SoftMax {
    fn name(&self) -> &'static str {
        if self.jacobian {
            "softmax_jacobian"
        } else {
            "softmax"
        }
    }

    fn has_interdependencies(&self) -> bool {
        true
    }

    fn backward_is_identity(&self) -> bool {
        !self.jacobian
    }

    fn emit_forward(&self, k: &mut KernelBuilder, i: &Expr) {
        let end = i + 1;
        self.emit_forward_row(k, i, &end);
    }

    fn emit_backward(&self, k: &mut KernelBuilder, i: &Expr) {
        let end = i + 1;
        self.emit_backward_row(k, i, &end);
    }

    fn emit_forward_row(&self, k: &mut KernelBuilder, i0: &Expr, i1: &Expr) {
        let sum = k.var_float("sum", 0.0f32);
        k.for_range("i", i0, i1, |k, i| {
            k.accumulate(sum, Expr::load(ACTIVATED, i).exp().min(SOFTMAX_EXP_CAP));
        });
        let factor = k.let_float("factor", 1.0f32 / sum.get());
        k.for_range("i", i0, i1, |k, i| {
            k.store(ACTIVATED, &i, Expr::load(ACTIVATED, &i).exp().min(SOFTMAX_EXP_CAP) * &factor);
        });
    }

    fn emit_backward_row(&self, k: &mut KernelBuilder, i0: &Expr, i1: &Expr) {
        if !self.jacobian {
            // Cross-entropy pairing: the delta is already the gradient of the sums.
            return;
        }
        let dot = k.var_float("dot", 0.0f32);
        k.for_range("i", i0, i1, |k, i| {
            k.accumulate(dot, Expr::load(ACTIVATED, &i) * Expr::load(DELTAS, &i));
        });
        k.for_range("i", i0, i1, |k, i| {
            k.store(
                DELTAS,
                &i,
                Expr::load(ACTIVATED, &i) * (Expr::load(DELTAS, &i) - dot.get()),
            );
        });
    }
}

fn row_uniforms() -> [Scalar; UNIFORM_COUNT] {
    [Scalar::Int(0); UNIFORM_COUNT]
}

fn grid(activation: &dyn Activation, len: usize) -> Result<GridDim> {
    let (x, y) = kernels::activation_grid(activation, 1, len);
    Ok(GridDim::from_sizes(x, y)?)
}

/// Run the forward transform over `values`, treated as one row.
pub fn apply_forward(activation: &dyn Activation, values: &mut [f32]) -> Result<()> {
    let Some(module) = kernels::activation_module(activation, 1, values.len()) else {
        return Ok(());
    };
    let kernel = tandem_backends::compile(&module)?;
    let grid = grid(activation, values.len())?;
    let memory = SliceMemory::new().bind(ACTIVATED, as_cells(values));
    kernel.run_sequential(grid, &row_uniforms(), &memory)?;
    memory.check(kernel.name())?;
    Ok(())
}

/// Rescale `deltas` by the derivative at `activated`, treated as one row.
pub fn apply_backward(activation: &dyn Activation, activated: &mut [f32], deltas: &mut [f32]) -> Result<()> {
    let Some(module) = kernels::activation_backward_module(activation, 1, deltas.len()) else {
        return Ok(());
    };
    let kernel = tandem_backends::compile(&module)?;
    let grid = grid(activation, deltas.len())?;
    let memory = SliceMemory::new()
        .bind(ACTIVATED, as_cells(activated))
        .bind(DELTAS, as_cells(deltas));
    kernel.run_sequential(grid, &row_uniforms(), &memory)?;
    memory.check(kernel.name())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sigmoid_values_and_derivative() {
        let mut values = vec![0.0, 2.0, -2.0];
        apply_forward(&Sigmoid, &mut values).unwrap();
        assert_relative_eq!(values[0], 0.5);
        assert_relative_eq!(values[1], 1.0 / (1.0 + (-2.0f32).exp()), max_relative = 1e-6);
        assert_relative_eq!(values[1] + values[2], 1.0, max_relative = 1e-6);

        let mut deltas = vec![1.0, 2.0, 1.0];
        apply_backward(&Sigmoid, &mut values, &mut deltas).unwrap();
        assert_relative_eq!(deltas[0], 0.25);
    }

    #[test]
    fn leaky_relu_scales_negative_side() {
        let relu = LeakyRelu::default();
        let mut values = vec![3.0, -2.0, 0.0];
        apply_forward(&relu, &mut values).unwrap();
        assert_eq!(values, vec![3.0, -0.1, 0.0]);

        let mut deltas = vec![1.0, 1.0, 1.0];
        apply_backward(&relu, &mut values, &mut deltas).unwrap();
        assert_eq!(deltas, vec![1.0, 0.05, 1.0]);
    }

    #[test]
    fn identity_is_a_no_op() {
        let mut values = vec![-1.0, 7.5];
        apply_forward(&Identity, &mut values).unwrap();
        assert_eq!(values, vec![-1.0, 7.5]);
    }

    #[test]
    fn softmax_normalizes_the_row() {
        let mut values = vec![1.0, 2.0, 3.0, 4.0];
        apply_forward(&SoftMax::new(), &mut values).unwrap();
        assert_relative_eq!(values.iter().sum::<f32>(), 1.0, max_relative = 1e-6);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_relative_eq!(values[3] / values[2], 1.0f32.exp(), max_relative = 1e-5);
    }

    #[test]
    fn softmax_caps_huge_sums() {
        let mut values = vec![200.0, 0.0];
        apply_forward(&SoftMax::new(), &mut values).unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
        assert_relative_eq!(values[0], 1.0, max_relative = 1e-6);
    }

    #[test]
    fn softmax_cross_entropy_backward_keeps_deltas() {
        let mut activated = vec![0.2, 0.8];
        let mut deltas = vec![0.5, -0.5];
        apply_backward(&SoftMax::new(), &mut activated, &mut deltas).unwrap();
        assert_eq!(deltas, vec![0.5, -0.5]);
    }

    #[test]
    fn softmax_jacobian_backward() {
        let mut activated = vec![0.25, 0.75];
        let mut deltas = vec![1.0, 0.0];
        apply_backward(&SoftMax::with_jacobian(), &mut activated, &mut deltas).unwrap();
        // dot = 0.25
        assert_relative_eq!(deltas[0], 0.25 * 0.75);
        assert_relative_eq!(deltas[1], 0.75 * -0.25);
    }
}
