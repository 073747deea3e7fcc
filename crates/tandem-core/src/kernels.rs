//! Kernel interface shared by the layer formulas and both backends.
//!
//! Every phase of a training step is a [`KernelModule`] built here. Layer and
//! activation formulas only see the helpers below, which resolve a logical
//! `(batch, node)` pair to a physical index through the offset uniforms.
//!
//! | binding | buffer |
//! |---|---|
//! | 0 | weights |
//! | 1 | layer inputs (external inputs or `activated`) |
//! | 2 | activated |
//! | 3 | targets |
//! | 4 | deltas |

use tandem_backends::{
    Access, Axis, BindingId, Expr, KernelBuilder, KernelModule, ScalarType, UniformId, WorkgroupSize,
};

use crate::activation::Activation;
use crate::layers::Layer;

pub const WEIGHTS: BindingId = BindingId(0);
pub const INPUTS: BindingId = BindingId(1);
pub const ACTIVATED: BindingId = BindingId(2);
pub const TARGETS: BindingId = BindingId(3);
pub const DELTAS: BindingId = BindingId(4);

pub const INPUT_OFFSET: UniformId = UniformId(0);
pub const OUTPUT_OFFSET: UniformId = UniformId(1);
pub const WEIGHT_OFFSET: UniformId = UniformId(2);
pub const NUM_INPUTS: UniformId = UniformId(3);
pub const NUM_OUTPUTS: UniformId = UniformId(4);
pub const LEARNING_RATE: UniformId = UniformId(5);
pub const GRADIENT: UniformId = UniformId(6);
pub const BUFFER_SIZE: UniformId = UniformId(7);

/// Length of the uniform array passed to every dispatch.
pub const UNIFORM_COUNT: usize = 8;

/// Lanes of the clear kernel's workgroup.
pub const CLEAR_WORKGROUP: u32 = 512;
/// Lanes of 1D workgroups for all other phases.
pub const LINEAR_WORKGROUP: u32 = 256;

/// Physical index of input `ni` of batch row `bi`.
pub fn in_index(bi: &Expr, ni: impl Into<Expr>) -> Expr {
    bi * Expr::uniform(NUM_INPUTS) + ni + Expr::uniform(INPUT_OFFSET)
}

/// Physical index of output `no` of batch row `bi`.
pub fn out_index(bi: &Expr, no: impl Into<Expr>) -> Expr {
    bi * Expr::uniform(NUM_OUTPUTS) + no + Expr::uniform(OUTPUT_OFFSET)
}

pub fn input(bi: &Expr, ni: impl Into<Expr>) -> Expr {
    Expr::load(INPUTS, in_index(bi, ni))
}

/// Weight `wi` of the bound layer.
pub fn weight(wi: impl Into<Expr>) -> Expr {
    Expr::load(WEIGHTS, wi.into() + Expr::uniform(WEIGHT_OFFSET))
}

pub fn out_delta(bi: &Expr, no: impl Into<Expr>) -> Expr {
    Expr::load(DELTAS, out_index(bi, no))
}

pub fn learning_rate() -> Expr {
    Expr::uniform(LEARNING_RATE)
}

/// True for every layer but the first, whose input deltas have nowhere to go.
pub fn gradient() -> Expr {
    Expr::uniform(GRADIENT)
}

pub fn set_out_sum(k: &mut KernelBuilder, bi: &Expr, no: impl Into<Expr>, value: impl Into<Expr>) {
    k.store(ACTIVATED, out_index(bi, no), value);
}

/// Scatter `value` into the delta of input `ni`; many weights share a slot.
pub fn add_in_delta(k: &mut KernelBuilder, bi: &Expr, ni: impl Into<Expr>, value: impl Into<Expr>) {
    k.atomic_add(DELTAS, in_index(bi, ni), value);
}

/// `weight[wi] = original + learningRate * delta_weight`
pub fn update_weight(k: &mut KernelBuilder, wi: &Expr, original: &Expr, delta_weight: impl Into<Expr>) {
    let delta_weight: Expr = delta_weight.into();
    k.store(
        WEIGHTS,
        wi + Expr::uniform(WEIGHT_OFFSET),
        original + learning_rate() * delta_weight,
    );
}

fn with_layer_uniforms(module: KernelModule) -> KernelModule {
    module
        .uniform(INPUT_OFFSET, "inputOffset", ScalarType::Int)
        .uniform(OUTPUT_OFFSET, "outputOffset", ScalarType::Int)
        .uniform(WEIGHT_OFFSET, "weightOffset", ScalarType::Int)
        .uniform(NUM_INPUTS, "numInputs", ScalarType::Int)
        .uniform(NUM_OUTPUTS, "numOutputs", ScalarType::Int)
}

/// One invocation per `(batch row, output)`.
pub fn forward_module(layer: &dyn Layer, batch_size: usize) -> KernelModule {
    let mut k = KernelBuilder::new();
    let bi = k.let_int("bi", Expr::invocation(Axis::X));
    let no = k.let_int("no", Expr::invocation(Axis::Y));
    k.return_if(
        bi.clone()
            .greater_equal(batch_size)
            .or(no.clone().greater_equal(Expr::uniform(NUM_OUTPUTS))),
    );
    layer.emit_forward(&mut k, &bi, &no);

    let workgroup = WorkgroupSize::for_2d(batch_size, layer.num_outputs());
    with_layer_uniforms(KernelModule::new(format!("forward_{}", layer.name()), workgroup))
        .binding(WEIGHTS, "weights", Access::ReadOnly)
        .binding(INPUTS, "inputs", Access::ReadOnly)
        .binding(ACTIVATED, "activated", Access::WriteOnly)
        .with_body(k.finish())
}

/// One invocation per weight of the layer.
pub fn backward_module(layer: &dyn Layer, batch_size: usize) -> KernelModule {
    let mut k = KernelBuilder::new();
    let wi = k.let_int("weightIndex", Expr::invocation(Axis::X));
    k.return_if(wi.clone().greater_equal(layer.num_weights()));
    layer.emit_backward(&mut k, &wi, batch_size);

    let workgroup = WorkgroupSize::for_1d(layer.num_weights(), LINEAR_WORKGROUP);
    with_layer_uniforms(KernelModule::new(format!("backward_{}", layer.name()), workgroup))
        .uniform(LEARNING_RATE, "learningRate", ScalarType::Float)
        .uniform(GRADIENT, "gradient", ScalarType::Bool)
        .binding(WEIGHTS, "weights", Access::ReadWrite)
        .binding(INPUTS, "inputs", Access::ReadOnly)
        .binding(DELTAS, "deltas", Access::ReadWrite)
        .with_body(k.finish())
}

/// Invocation grid of an activation phase: whole rows for interdependent
/// activations, single elements otherwise.
pub fn activation_grid(activation: &dyn Activation, batch_size: usize, num_outputs: usize) -> (usize, usize) {
    if activation.has_interdependencies() {
        (batch_size, 1)
    } else {
        (batch_size, num_outputs)
    }
}

fn activation_body<F>(activation: &dyn Activation, batch_size: usize, num_outputs: usize, emit: F) -> KernelBuilder
where
    F: FnOnce(&mut KernelBuilder, &Expr, &Expr),
{
    let mut k = KernelBuilder::new();
    let bi = k.let_int("bi", Expr::invocation(Axis::X));
    if activation.has_interdependencies() {
        k.return_if(bi.clone().greater_equal(batch_size));
        let i0 = k.let_int("i0", &bi * num_outputs + Expr::uniform(OUTPUT_OFFSET));
        let i1 = k.let_int("i1", &i0 + num_outputs);
        emit(&mut k, &i0, &i1);
    } else {
        let no = k.let_int("no", Expr::invocation(Axis::Y));
        k.return_if(
            bi.clone()
                .greater_equal(batch_size)
                .or(no.clone().greater_equal(num_outputs)),
        );
        let i = k.let_int("i", &bi * num_outputs + no + Expr::uniform(OUTPUT_OFFSET));
        let end = &i + 1;
        emit(&mut k, &i, &end);
    }
    k
}

fn activation_workgroup(activation: &dyn Activation, batch_size: usize, num_outputs: usize) -> WorkgroupSize {
    if activation.has_interdependencies() {
        WorkgroupSize::for_1d(batch_size, LINEAR_WORKGROUP)
    } else {
        WorkgroupSize::for_2d(batch_size, num_outputs)
    }
}

/// In-place activation of the bound layer's outputs; `None` for identity.
pub fn activation_module(activation: &dyn Activation, batch_size: usize, num_outputs: usize) -> Option<KernelModule> {
    if activation.forward_is_identity() {
        return None;
    }
    let interdependent = activation.has_interdependencies();
    let k = activation_body(activation, batch_size, num_outputs, |k, i0, i1| {
        if interdependent {
            activation.emit_forward_row(k, i0, i1);
        } else {
            activation.emit_forward(k, i0);
        }
    });
    let workgroup = activation_workgroup(activation, batch_size, num_outputs);
    Some(
        KernelModule::new(format!("activation_{}", activation.name()), workgroup)
            .uniform(OUTPUT_OFFSET, "outputOffset", ScalarType::Int)
            .binding(ACTIVATED, "activated", Access::ReadWrite)
            .with_body(k.finish()),
    )
}

/// Derivative correction of the bound layer's output deltas; `None` when
/// the activation leaves deltas untouched.
pub fn activation_backward_module(
    activation: &dyn Activation,
    batch_size: usize,
    num_outputs: usize,
) -> Option<KernelModule> {
    if activation.backward_is_identity() {
        return None;
    }
    let interdependent = activation.has_interdependencies();
    let k = activation_body(activation, batch_size, num_outputs, |k, i0, i1| {
        if interdependent {
            activation.emit_backward_row(k, i0, i1);
        } else {
            activation.emit_backward(k, i0);
        }
    });
    let workgroup = activation_workgroup(activation, batch_size, num_outputs);
    Some(
        KernelModule::new(format!("activation_backward_{}", activation.name()), workgroup)
            .uniform(OUTPUT_OFFSET, "outputOffset", ScalarType::Int)
            .binding(ACTIVATED, "activated", Access::ReadOnly)
            .binding(DELTAS, "deltas", Access::ReadWrite)
            .with_body(k.finish()),
    )
}

/// `delta = target - activated` over the last layer's outputs.
pub fn evaluate_module(batch_size: usize, num_outputs: usize) -> KernelModule {
    let mut k = KernelBuilder::new();
    let bi = k.let_int("bi", Expr::invocation(Axis::X));
    let no = k.let_int("no", Expr::invocation(Axis::Y));
    k.return_if(
        bi.clone()
            .greater_equal(batch_size)
            .or(no.clone().greater_equal(num_outputs)),
    );
    let index = k.let_int("index", &bi * num_outputs + no);
    let out = k.let_int("out", &index + Expr::uniform(OUTPUT_OFFSET));
    k.store(
        DELTAS,
        out.clone(),
        Expr::load(TARGETS, index) - Expr::load(ACTIVATED, out),
    );

    KernelModule::new("evaluate", WorkgroupSize::for_2d(batch_size, num_outputs))
        .uniform(OUTPUT_OFFSET, "outputOffset", ScalarType::Int)
        .binding(TARGETS, "targets", Access::ReadOnly)
        .binding(ACTIVATED, "activated", Access::ReadOnly)
        .binding(DELTAS, "deltas", Access::WriteOnly)
        .with_body(k.finish())
}

/// Zero `deltas[0..bufferSize)`.
pub fn clear_module(len: usize) -> KernelModule {
    let mut k = KernelBuilder::new();
    let index = k.let_int("index", Expr::invocation(Axis::X));
    k.return_if(index.clone().greater_equal(Expr::uniform(BUFFER_SIZE)));
    k.store(DELTAS, index, 0.0f32);

    KernelModule::new("clear", WorkgroupSize::for_1d(len, CLEAR_WORKGROUP))
        .uniform(BUFFER_SIZE, "bufferSize", ScalarType::Int)
        .binding(DELTAS, "deltas", Access::WriteOnly)
        .with_body(k.finish())
}

/// Rescale `deltas[inputOffset..inputOffset + bufferSize)` so the largest
/// magnitude becomes the learning rate. Runs as a single invocation.
pub fn normalize_module() -> KernelModule {
    let mut k = KernelBuilder::new();
    let i0 = k.let_int("i0", Expr::uniform(INPUT_OFFSET));
    let i1 = k.let_int("i1", &i0 + Expr::uniform(BUFFER_SIZE));
    k.return_if(Expr::uniform(BUFFER_SIZE).less_than(2));
    let abs_max = k.var_float("absMax", 1e-30f32);
    k.for_range("i", &i0, &i1, |k, i| {
        k.assign(abs_max, abs_max.get().max(Expr::load(DELTAS, i).abs()));
    });
    let multiplier = k.let_float("multiplier", learning_rate() / abs_max.get());
    k.for_range("i", &i0, &i1, |k, i| {
        k.store(DELTAS, &i, Expr::load(DELTAS, &i) * &multiplier);
    });

    KernelModule::new("normalize", WorkgroupSize::new(1, 1))
        .uniform(INPUT_OFFSET, "inputOffset", ScalarType::Int)
        .uniform(BUFFER_SIZE, "bufferSize", ScalarType::Int)
        .uniform(LEARNING_RATE, "learningRate", ScalarType::Float)
        .binding(DELTAS, "deltas", Access::ReadWrite)
        .with_body(k.finish())
}

/// All per-layer modules of one layer at one batch size.
#[derive(Debug, Clone)]
pub struct LayerModules {
    pub forward: KernelModule,
    pub activation: Option<KernelModule>,
    pub activation_backward: Option<KernelModule>,
    pub backward: KernelModule,
}

impl LayerModules {
    pub fn new(layer: &dyn Layer, batch_size: usize) -> Self {
        let activation = layer.activation();
        Self {
            forward: forward_module(layer, batch_size),
            activation: activation_module(activation, batch_size, layer.num_outputs()),
            activation_backward: activation_backward_module(activation, batch_size, layer.num_outputs()),
            backward: backward_module(layer, batch_size),
        }
    }
}
