//! Type checking and lowering of kernel modules into closure trees.
//!
//! Every expression node becomes a boxed closure specialised for its scalar
//! type, so running a kernel never matches on the IR again. Integer
//! arithmetic wraps and division by zero yields zero, mirroring what GPU
//! drivers do instead of trapping.

use std::fmt;
use std::sync::Arc;

use super::builder::{KernelModule, LocalDecl};
use super::ir::{BinaryOp, Expr, Stmt, UnaryOp};
use super::memory::KernelMemory;
use super::{BindingDecl, BindingId, LocalId, Scalar, ScalarType, UniformDecl, UniformId, MAX_BINDINGS};
use crate::error::{BackendError, Result};
use crate::launch::{GridDim, WorkgroupSize};

/// Per-invocation local storage.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    ints: Vec<i32>,
    floats: Vec<f32>,
    bools: Vec<bool>,
}

struct Env<'a> {
    invocation: [i32; 2],
    uniforms: &'a [Scalar],
    memory: &'a dyn KernelMemory,
}

enum Flow {
    Next,
    Return,
}

type IntFn = Box<dyn Fn(&Frame, &Env<'_>) -> i32 + Send + Sync>;
type FloatFn = Box<dyn Fn(&Frame, &Env<'_>) -> f32 + Send + Sync>;
type BoolFn = Box<dyn Fn(&Frame, &Env<'_>) -> bool + Send + Sync>;
type StmtFn = Box<dyn Fn(&mut Frame, &Env<'_>) -> Flow + Send + Sync>;

fn int_fn(f: impl Fn(&Frame, &Env<'_>) -> i32 + Send + Sync + 'static) -> IntFn {
    Box::new(f)
}

fn float_fn(f: impl Fn(&Frame, &Env<'_>) -> f32 + Send + Sync + 'static) -> FloatFn {
    Box::new(f)
}

fn bool_fn(f: impl Fn(&Frame, &Env<'_>) -> bool + Send + Sync + 'static) -> BoolFn {
    Box::new(f)
}

fn stmt_fn(f: impl Fn(&mut Frame, &Env<'_>) -> Flow + Send + Sync + 'static) -> StmtFn {
    Box::new(f)
}

/// A kernel ready to run on any [`KernelMemory`].
pub struct CompiledKernel {
    name: String,
    source: Arc<str>,
    workgroup: WorkgroupSize,
    uniforms: Vec<UniformDecl>,
    frame_shape: [usize; 3],
    body: Vec<StmtFn>,
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("name", &self.name)
            .field("workgroup", &self.workgroup)
            .field("uniforms", &self.uniforms.len())
            .field("statements", &self.body.len())
            .finish()
    }
}

impl CompiledKernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source text the kernel was compiled from.
    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    pub fn workgroup(&self) -> WorkgroupSize {
        self.workgroup
    }

    pub fn new_frame(&self) -> Frame {
        let [ints, floats, bools] = self.frame_shape;
        Frame {
            ints: vec![0; ints],
            floats: vec![0.0; floats],
            bools: vec![false; bools],
        }
    }

    /// Verify that `values` provides every declared uniform with its type.
    pub fn check_uniforms(&self, values: &[Scalar]) -> Result<()> {
        for decl in &self.uniforms {
            let actual = values.get(decl.id.0 as usize).map(Scalar::ty);
            if actual != Some(decl.ty) {
                return Err(BackendError::UniformMismatch {
                    name: decl.name,
                    expected: decl.ty,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Run a single invocation. `frame` must come from [`Self::new_frame`].
    pub fn invoke(&self, frame: &mut Frame, invocation: [u32; 2], uniforms: &[Scalar], memory: &dyn KernelMemory) {
        let env = Env {
            invocation: [invocation[0] as i32, invocation[1] as i32],
            uniforms,
            memory,
        };
        for stmt in &self.body {
            if let Flow::Return = stmt(frame, &env) {
                break;
            }
        }
    }

    /// Run every invocation of `grid` in order on the calling thread.
    ///
    /// Only the grid itself is visited; the kernel's own bounds guard is
    /// never needed for the overshoot lanes a device would add.
    pub fn run_sequential(&self, grid: GridDim, uniforms: &[Scalar], memory: &dyn KernelMemory) -> Result<()> {
        self.check_uniforms(uniforms)?;
        let mut frame = self.new_frame();
        for y in 0..grid.y {
            for x in 0..grid.x {
                self.invoke(&mut frame, [x, y], uniforms, memory);
            }
        }
        Ok(())
    }
}

/// Type-check `module` and lower it into a [`CompiledKernel`].
pub fn compile(module: &KernelModule) -> Result<CompiledKernel> {
    validate_interface(module)?;

    let mut counts = [0usize; 3];
    let slots = module
        .body
        .locals
        .iter()
        .map(|decl| {
            let counter = &mut counts[type_slot(decl.ty)];
            let slot = *counter;
            *counter += 1;
            slot
        })
        .collect();

    let mut lowering = Lowering {
        module,
        slots,
        declared: vec![false; module.body.locals.len()],
    };
    let body = lowering.block(&module.body.stmts)?;

    tracing::debug!(
        kernel = %module.name,
        locals = module.body.locals.len(),
        statements = body.len(),
        "compiled kernel"
    );

    Ok(CompiledKernel {
        name: module.name.clone(),
        source: Arc::from(module.source()),
        workgroup: module.workgroup,
        uniforms: module.uniforms.clone(),
        frame_shape: counts,
        body,
    })
}

fn validate_interface(module: &KernelModule) -> Result<()> {
    for decl in &module.bindings {
        if decl.id.0 as usize >= MAX_BINDINGS {
            return Err(BackendError::UnknownBinding(decl.id));
        }
    }
    if module.workgroup.x == 0 || module.workgroup.y == 0 {
        return Err(BackendError::invalid_launch(format!(
            "kernel `{}` declares an empty workgroup",
            module.name
        )));
    }
    Ok(())
}

fn type_slot(ty: ScalarType) -> usize {
    match ty {
        ScalarType::Int => 0,
        ScalarType::Float => 1,
        ScalarType::Bool => 2,
    }
}

fn expect_type(context: &'static str, expected: ScalarType, actual: ScalarType) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(BackendError::type_mismatch(context, expected, actual))
    }
}

struct Lowering<'m> {
    module: &'m KernelModule,
    slots: Vec<usize>,
    declared: Vec<bool>,
}

impl Lowering<'_> {
    fn decl(&self, id: LocalId) -> Result<(&LocalDecl, usize)> {
        let index = id.0 as usize;
        let decl = self
            .module
            .body
            .locals
            .get(index)
            .ok_or_else(|| BackendError::UndeclaredLocal(format!("#{index}")))?;
        Ok((decl, self.slots[index]))
    }

    fn local(&self, id: LocalId) -> Result<(&LocalDecl, usize)> {
        let (decl, slot) = self.decl(id)?;
        if !self.declared[id.0 as usize] {
            return Err(BackendError::UndeclaredLocal(decl.name.clone()));
        }
        Ok((decl, slot))
    }

    fn uniform(&self, id: UniformId, expected: ScalarType) -> Result<usize> {
        let decl = self.module.find_uniform(id).ok_or(BackendError::UnknownUniform(id))?;
        expect_type("uniform", expected, decl.ty)?;
        Ok(id.0 as usize)
    }

    fn binding(&self, id: BindingId) -> Result<&BindingDecl> {
        self.module.find_binding(id).ok_or(BackendError::UnknownBinding(id))
    }

    fn type_of(&self, expr: &Expr) -> Result<ScalarType> {
        Ok(match expr {
            Expr::Literal(value) => value.ty(),
            Expr::Local(id) => self.local(*id)?.0.ty,
            Expr::Uniform(id) => self.module.find_uniform(*id).ok_or(BackendError::UnknownUniform(*id))?.ty,
            Expr::Invocation(_) => ScalarType::Int,
            Expr::Unary(UnaryOp::Exp, _) => ScalarType::Float,
            Expr::Unary(_, operand) => self.type_of(operand)?,
            Expr::Binary(op, _, _) if op.is_comparison() || op.is_logical() => ScalarType::Bool,
            Expr::Binary(_, lhs, _) => self.type_of(lhs)?,
            Expr::Clamp { value, .. } => self.type_of(value)?,
            Expr::Select { if_true, .. } => self.type_of(if_true)?,
            Expr::Load { .. } => ScalarType::Float,
        })
    }

    fn int(&self, expr: &Expr) -> Result<IntFn> {
        Ok(match expr {
            Expr::Literal(Scalar::Int(value)) => {
                let value = *value;
                int_fn(move |_, _| value)
            }
            Expr::Local(id) => {
                let (decl, slot) = self.local(*id)?;
                expect_type("local", ScalarType::Int, decl.ty)?;
                int_fn(move |frame, _| frame.ints[slot])
            }
            Expr::Uniform(id) => {
                let index = self.uniform(*id, ScalarType::Int)?;
                int_fn(move |_, env| match env.uniforms.get(index) {
                    Some(Scalar::Int(value)) => *value,
                    _ => 0,
                })
            }
            Expr::Invocation(axis) => {
                let axis = axis.index();
                int_fn(move |_, env| env.invocation[axis])
            }
            Expr::Unary(UnaryOp::Neg, operand) => {
                let operand = self.int(operand)?;
                int_fn(move |frame, env| operand(frame, env).wrapping_neg())
            }
            Expr::Unary(UnaryOp::Abs, operand) => {
                let operand = self.int(operand)?;
                int_fn(move |frame, env| operand(frame, env).wrapping_abs())
            }
            Expr::Binary(op, lhs, rhs) if !op.is_comparison() && !op.is_logical() => {
                let (a, b) = (self.int(lhs)?, self.int(rhs)?);
                match op {
                    BinaryOp::Add => int_fn(move |f, e| a(f, e).wrapping_add(b(f, e))),
                    BinaryOp::Sub => int_fn(move |f, e| a(f, e).wrapping_sub(b(f, e))),
                    BinaryOp::Mul => int_fn(move |f, e| a(f, e).wrapping_mul(b(f, e))),
                    BinaryOp::Div => int_fn(move |f, e| a(f, e).checked_div(b(f, e)).unwrap_or(0)),
                    BinaryOp::Rem => int_fn(move |f, e| a(f, e).checked_rem(b(f, e)).unwrap_or(0)),
                    BinaryOp::Min => int_fn(move |f, e| a(f, e).min(b(f, e))),
                    _ => int_fn(move |f, e| a(f, e).max(b(f, e))),
                }
            }
            Expr::Clamp { value, min, max } => {
                let (value, lo, hi) = (self.int(value)?, self.int(min)?, self.int(max)?);
                int_fn(move |f, e| value(f, e).max(lo(f, e)).min(hi(f, e)))
            }
            Expr::Select {
                cond,
                if_true,
                if_false,
            } => {
                let (cond, a, b) = (self.bool(cond)?, self.int(if_true)?, self.int(if_false)?);
                int_fn(move |f, e| if cond(f, e) { a(f, e) } else { b(f, e) })
            }
            other => {
                return Err(BackendError::type_mismatch(
                    "int expression",
                    ScalarType::Int,
                    self.type_of(other)?,
                ))
            }
        })
    }

    fn float(&self, expr: &Expr) -> Result<FloatFn> {
        Ok(match expr {
            Expr::Literal(Scalar::Float(value)) => {
                let value = *value;
                float_fn(move |_, _| value)
            }
            Expr::Local(id) => {
                let (decl, slot) = self.local(*id)?;
                expect_type("local", ScalarType::Float, decl.ty)?;
                float_fn(move |frame, _| frame.floats[slot])
            }
            Expr::Uniform(id) => {
                let index = self.uniform(*id, ScalarType::Float)?;
                float_fn(move |_, env| match env.uniforms.get(index) {
                    Some(Scalar::Float(value)) => *value,
                    _ => 0.0,
                })
            }
            Expr::Unary(op, operand) => {
                let operand = self.float(operand)?;
                match op {
                    UnaryOp::Neg => float_fn(move |f, e| -operand(f, e)),
                    UnaryOp::Exp => float_fn(move |f, e| operand(f, e).exp()),
                    UnaryOp::Abs => float_fn(move |f, e| operand(f, e).abs()),
                }
            }
            Expr::Binary(BinaryOp::Rem, _, _) => {
                return Err(BackendError::type_mismatch("remainder", ScalarType::Int, ScalarType::Float));
            }
            Expr::Binary(op, lhs, rhs) if !op.is_comparison() && !op.is_logical() => {
                let (a, b) = (self.float(lhs)?, self.float(rhs)?);
                match op {
                    BinaryOp::Add => float_fn(move |f, e| a(f, e) + b(f, e)),
                    BinaryOp::Sub => float_fn(move |f, e| a(f, e) - b(f, e)),
                    BinaryOp::Mul => float_fn(move |f, e| a(f, e) * b(f, e)),
                    BinaryOp::Div => float_fn(move |f, e| a(f, e) / b(f, e)),
                    BinaryOp::Min => float_fn(move |f, e| a(f, e).min(b(f, e))),
                    _ => float_fn(move |f, e| a(f, e).max(b(f, e))),
                }
            }
            Expr::Clamp { value, min, max } => {
                let (value, lo, hi) = (self.float(value)?, self.float(min)?, self.float(max)?);
                float_fn(move |f, e| value(f, e).max(lo(f, e)).min(hi(f, e)))
            }
            Expr::Select {
                cond,
                if_true,
                if_false,
            } => {
                let (cond, a, b) = (self.bool(cond)?, self.float(if_true)?, self.float(if_false)?);
                float_fn(move |f, e| if cond(f, e) { a(f, e) } else { b(f, e) })
            }
            Expr::Load { binding, index } => {
                let decl = self.binding(*binding)?;
                if !decl.access.can_read() {
                    return Err(BackendError::WriteOnlyBinding(decl.name));
                }
                let (binding, index) = (*binding, self.int(index)?);
                float_fn(move |f, e| e.memory.load(binding, index(f, e)))
            }
            other => {
                return Err(BackendError::type_mismatch(
                    "float expression",
                    ScalarType::Float,
                    self.type_of(other)?,
                ))
            }
        })
    }

    fn bool(&self, expr: &Expr) -> Result<BoolFn> {
        Ok(match expr {
            Expr::Literal(Scalar::Bool(value)) => {
                let value = *value;
                bool_fn(move |_, _| value)
            }
            Expr::Local(id) => {
                let (decl, slot) = self.local(*id)?;
                expect_type("local", ScalarType::Bool, decl.ty)?;
                bool_fn(move |frame, _| frame.bools[slot])
            }
            Expr::Uniform(id) => {
                let index = self.uniform(*id, ScalarType::Bool)?;
                bool_fn(move |_, env| matches!(env.uniforms.get(index), Some(Scalar::Bool(true))))
            }
            Expr::Binary(op @ (BinaryOp::And | BinaryOp::Or), lhs, rhs) => {
                let (a, b) = (self.bool(lhs)?, self.bool(rhs)?);
                if *op == BinaryOp::And {
                    bool_fn(move |f, e| a(f, e) && b(f, e))
                } else {
                    bool_fn(move |f, e| a(f, e) || b(f, e))
                }
            }
            Expr::Binary(op, lhs, rhs) if op.is_comparison() => self.comparison(*op, lhs, rhs)?,
            Expr::Select {
                cond,
                if_true,
                if_false,
            } => {
                let (cond, a, b) = (self.bool(cond)?, self.bool(if_true)?, self.bool(if_false)?);
                bool_fn(move |f, e| if cond(f, e) { a(f, e) } else { b(f, e) })
            }
            other => {
                return Err(BackendError::type_mismatch(
                    "bool expression",
                    ScalarType::Bool,
                    self.type_of(other)?,
                ))
            }
        })
    }

    fn comparison(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<BoolFn> {
        let lhs_type = self.type_of(lhs)?;
        let rhs_type = self.type_of(rhs)?;
        expect_type("comparison", lhs_type, rhs_type)?;

        Ok(match lhs_type {
            ScalarType::Int => {
                let (a, b) = (self.int(lhs)?, self.int(rhs)?);
                match op {
                    BinaryOp::Lt => bool_fn(move |f, e| a(f, e) < b(f, e)),
                    BinaryOp::Le => bool_fn(move |f, e| a(f, e) <= b(f, e)),
                    BinaryOp::Gt => bool_fn(move |f, e| a(f, e) > b(f, e)),
                    BinaryOp::Ge => bool_fn(move |f, e| a(f, e) >= b(f, e)),
                    _ => bool_fn(move |f, e| a(f, e) == b(f, e)),
                }
            }
            ScalarType::Float => {
                let (a, b) = (self.float(lhs)?, self.float(rhs)?);
                match op {
                    BinaryOp::Lt => bool_fn(move |f, e| a(f, e) < b(f, e)),
                    BinaryOp::Le => bool_fn(move |f, e| a(f, e) <= b(f, e)),
                    BinaryOp::Gt => bool_fn(move |f, e| a(f, e) > b(f, e)),
                    BinaryOp::Ge => bool_fn(move |f, e| a(f, e) >= b(f, e)),
                    _ => bool_fn(move |f, e| a(f, e) == b(f, e)),
                }
            }
            ScalarType::Bool if op == BinaryOp::Eq => {
                let (a, b) = (self.bool(lhs)?, self.bool(rhs)?);
                bool_fn(move |f, e| a(f, e) == b(f, e))
            }
            ScalarType::Bool => {
                return Err(BackendError::type_mismatch("ordered comparison", ScalarType::Int, ScalarType::Bool))
            }
        })
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Vec<StmtFn>> {
        stmts.iter().map(|stmt| self.stmt(stmt)).collect()
    }

    fn assignment(&self, ty: ScalarType, slot: usize, value: &Expr) -> Result<StmtFn> {
        Ok(match ty {
            ScalarType::Int => {
                let value = self.int(value)?;
                stmt_fn(move |frame, env| {
                    let v = value(&*frame, env);
                    frame.ints[slot] = v;
                    Flow::Next
                })
            }
            ScalarType::Float => {
                let value = self.float(value)?;
                stmt_fn(move |frame, env| {
                    let v = value(&*frame, env);
                    frame.floats[slot] = v;
                    Flow::Next
                })
            }
            ScalarType::Bool => {
                let value = self.bool(value)?;
                stmt_fn(move |frame, env| {
                    let v = value(&*frame, env);
                    frame.bools[slot] = v;
                    Flow::Next
                })
            }
        })
    }

    fn writable(&self, binding: BindingId) -> Result<()> {
        let decl = self.binding(binding)?;
        if decl.access.can_write() {
            Ok(())
        } else {
            Err(BackendError::ReadOnlyBinding(decl.name))
        }
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<StmtFn> {
        Ok(match stmt {
            Stmt::Declare { local, init } => {
                let (ty, slot) = {
                    let (decl, slot) = self.decl(*local)?;
                    (decl.ty, slot)
                };
                // The initializer cannot see the local it initializes.
                let lowered = self.assignment(ty, slot, init)?;
                self.declared[local.0 as usize] = true;
                lowered
            }
            Stmt::Assign { local, value } => {
                let (ty, slot) = {
                    let (decl, slot) = self.local(*local)?;
                    (decl.ty, slot)
                };
                self.assignment(ty, slot, value)?
            }
            Stmt::Store { binding, index, value } => {
                self.writable(*binding)?;
                let (binding, index, value) = (*binding, self.int(index)?, self.float(value)?);
                stmt_fn(move |frame, env| {
                    let (i, v) = (index(&*frame, env), value(&*frame, env));
                    env.memory.store(binding, i, v);
                    Flow::Next
                })
            }
            Stmt::AtomicAdd { binding, index, value } => {
                self.writable(*binding)?;
                let (binding, index, value) = (*binding, self.int(index)?, self.float(value)?);
                stmt_fn(move |frame, env| {
                    let (i, v) = (index(&*frame, env), value(&*frame, env));
                    env.memory.atomic_add(binding, i, v);
                    Flow::Next
                })
            }
            Stmt::For {
                local,
                start,
                end,
                body,
            } => {
                let (ty, slot) = {
                    let (decl, slot) = self.decl(*local)?;
                    (decl.ty, slot)
                };
                expect_type("loop counter", ScalarType::Int, ty)?;
                let (start, end) = (self.int(start)?, self.int(end)?);
                self.declared[local.0 as usize] = true;
                let body = self.block(body)?;
                stmt_fn(move |frame, env| {
                    let mut i = start(&*frame, env);
                    let end = end(&*frame, env);
                    while i < end {
                        frame.ints[slot] = i;
                        for stmt in &body {
                            if let Flow::Return = stmt(&mut *frame, env) {
                                return Flow::Return;
                            }
                        }
                        i += 1;
                    }
                    Flow::Next
                })
            }
            Stmt::If { cond, then } => {
                let cond = self.bool(cond)?;
                let then = self.block(then)?;
                stmt_fn(move |frame, env| {
                    if cond(&*frame, env) {
                        for stmt in &then {
                            if let Flow::Return = stmt(&mut *frame, env) {
                                return Flow::Return;
                            }
                        }
                    }
                    Flow::Next
                })
            }
            Stmt::Return => stmt_fn(|_, _| Flow::Return),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::{as_cells, SliceMemory};
    use crate::kernel::{Access, Axis, KernelBuilder};

    const INPUT: BindingId = BindingId(0);
    const OUTPUT: BindingId = BindingId(1);
    const COUNT: UniformId = UniformId(0);
    const SCALE: UniformId = UniformId(1);

    fn module(build: impl FnOnce(&mut KernelBuilder)) -> KernelModule {
        let mut k = KernelBuilder::new();
        build(&mut k);
        KernelModule::new("probe", WorkgroupSize::new(4, 1))
            .binding(INPUT, "input", Access::ReadOnly)
            .binding(OUTPUT, "output", Access::ReadWrite)
            .uniform(COUNT, "count", ScalarType::Int)
            .uniform(SCALE, "scale", ScalarType::Float)
            .with_body(k.finish())
    }

    #[test]
    fn runs_guarded_scaled_copy() {
        let kernel = compile(&module(|k| {
            let i = k.let_int("i", Expr::invocation(Axis::X));
            k.return_if(i.clone().greater_equal(Expr::uniform(COUNT)));
            k.store(OUTPUT, i.clone(), Expr::load(INPUT, i) * Expr::uniform(SCALE));
        }))
        .unwrap();

        let mut input = vec![1.0, 2.0, 3.0];
        let mut output = vec![0.0; 3];
        let memory = SliceMemory::new()
            .bind(INPUT, as_cells(&mut input))
            .bind(OUTPUT, as_cells(&mut output));
        let uniforms = [Scalar::Int(3), Scalar::Float(0.5)];

        // The fourth lane is an overshoot lane and must return early.
        kernel.run_sequential(GridDim::new(4, 1), &uniforms, &memory).unwrap();
        memory.check(kernel.name()).unwrap();
        assert_eq!(output, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn loops_accumulate_and_return_early() {
        let kernel = compile(&module(|k| {
            let sum = k.var_float("sum", 0.0f32);
            k.for_range("i", 0, Expr::uniform(COUNT), |k, i| {
                k.accumulate(sum, Expr::load(INPUT, i));
            });
            k.store(OUTPUT, 0, sum.get());
            k.return_if(true);
            k.store(OUTPUT, 1, 99.0f32);
        }))
        .unwrap();

        let mut input = vec![1.0, 2.0, 4.0];
        let mut output = vec![0.0; 2];
        let memory = SliceMemory::new()
            .bind(INPUT, as_cells(&mut input))
            .bind(OUTPUT, as_cells(&mut output));
        kernel
            .run_sequential(GridDim::new(1, 1), &[Scalar::Int(3), Scalar::Float(1.0)], &memory)
            .unwrap();
        assert_eq!(output, vec![7.0, 0.0]);
    }

    #[test]
    fn integer_division_by_zero_yields_zero() {
        let kernel = compile(&module(|k| {
            let q = k.let_int("q", Expr::uniform(COUNT) / 0);
            k.if_then(q.equals(0), |k| k.store(OUTPUT, 0, 1.0f32));
        }))
        .unwrap();

        let mut input = vec![0.0];
        let mut output = vec![0.0];
        let memory = SliceMemory::new()
            .bind(INPUT, as_cells(&mut input))
            .bind(OUTPUT, as_cells(&mut output));
        kernel
            .run_sequential(GridDim::new(1, 1), &[Scalar::Int(7), Scalar::Float(1.0)], &memory)
            .unwrap();
        assert_eq!(output, vec![1.0]);
    }

    #[test]
    fn rejects_store_to_read_only_binding() {
        let result = compile(&module(|k| k.store(INPUT, 0, 1.0f32)));
        assert!(matches!(result, Err(BackendError::ReadOnlyBinding("input"))));
    }

    #[test]
    fn rejects_mixed_arithmetic() {
        let result = compile(&module(|k| {
            k.let_float("x", Expr::uniform(SCALE) + Expr::uniform(COUNT));
        }));
        assert!(matches!(result, Err(BackendError::TypeMismatch { .. })));
    }

    #[test]
    fn rejects_undeclared_uniform() {
        let result = compile(&module(|k| {
            k.let_int("x", Expr::uniform(UniformId(5)));
        }));
        assert!(matches!(result, Err(BackendError::UnknownUniform(UniformId(5)))));
    }

    #[test]
    fn uniform_values_are_checked_against_declarations() {
        let kernel = compile(&module(|_| {})).unwrap();
        assert!(kernel.check_uniforms(&[Scalar::Int(1), Scalar::Float(1.0)]).is_ok());
        assert!(matches!(
            kernel.check_uniforms(&[Scalar::Float(1.0), Scalar::Float(1.0)]),
            Err(BackendError::UniformMismatch { name: "count", .. })
        ));
        assert!(matches!(
            kernel.check_uniforms(&[Scalar::Int(1)]),
            Err(BackendError::UniformMismatch { actual: None, .. })
        ));
    }

    #[test]
    fn compiled_source_matches_emitted_text() {
        let module = module(|k| {
            k.store(OUTPUT, 0, 1.0f32);
        });
        let kernel = compile(&module).unwrap();
        assert_eq!(&**kernel.source(), module.source().as_str());
    }
}
