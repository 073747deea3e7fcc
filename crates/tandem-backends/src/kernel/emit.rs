//! Rendering kernels as GLSL-flavoured compute source.
//!
//! The text is deterministic for a given module, which is what makes it
//! usable as a cache key.

use std::fmt::Write;

use super::builder::{KernelBody, KernelModule};
use super::ir::{BinaryOp, Expr, Stmt, UnaryOp};
use super::{Access, Axis, BindingId, LocalId, Scalar, UniformId};

const INDENT: &str = "    ";

/// Render a full compute module: header, interface, and `main`.
pub fn module_source(module: &KernelModule) -> String {
    let mut out = String::new();
    out.push_str("#version 450\n");
    if uses_atomic_add(&module.body.stmts) {
        out.push_str("#extension GL_EXT_shader_atomic_float : require\n");
    }
    let _ = writeln!(
        out,
        "layout(local_size_x = {}, local_size_y = {}, local_size_z = 1) in;",
        module.workgroup.x, module.workgroup.y
    );

    for decl in &module.bindings {
        let qualifier = match decl.access {
            Access::ReadOnly => "readonly ",
            Access::WriteOnly => "writeonly ",
            Access::ReadWrite => "",
        };
        let _ = writeln!(
            out,
            "layout(std430, binding = {}) {}buffer {} {{ float {}[]; }};",
            decl.id.0,
            qualifier,
            block_name(decl.name),
            decl.name
        );
    }
    for decl in &module.uniforms {
        let _ = writeln!(out, "uniform {} {};", decl.ty, decl.name);
    }

    out.push_str("void main() {\n");
    let names = Names { module, body: &module.body };
    for stmt in &module.body.stmts {
        names.stmt(&mut out, stmt, 1);
    }
    out.push_str("}\n");
    out
}

/// Render only the statements of `body`, resolving names against `module`.
pub fn body_source(module: &KernelModule, body: &KernelBody) -> String {
    let mut out = String::new();
    let names = Names { module, body };
    for stmt in &body.stmts {
        names.stmt(&mut out, stmt, 0);
    }
    out
}

fn uses_atomic_add(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| match stmt {
        Stmt::AtomicAdd { .. } => true,
        Stmt::For { body, .. } => uses_atomic_add(body),
        Stmt::If { then, .. } => uses_atomic_add(then),
        _ => false,
    })
}

fn block_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("{}{}Buffer", first.to_ascii_uppercase(), chars.as_str()),
        None => "Buffer".to_string(),
    }
}

struct Names<'a> {
    module: &'a KernelModule,
    body: &'a KernelBody,
}

impl Names<'_> {
    fn local(&self, id: LocalId) -> &str {
        self.body
            .locals
            .get(id.0 as usize)
            .map(|decl| decl.name.as_str())
            .unwrap_or("<undeclared>")
    }

    fn binding(&self, id: BindingId) -> &str {
        self.module.find_binding(id).map(|decl| decl.name).unwrap_or("<unbound>")
    }

    fn uniform(&self, id: UniformId) -> &str {
        self.module.find_uniform(id).map(|decl| decl.name).unwrap_or("<undeclared>")
    }

    fn stmt(&self, out: &mut String, stmt: &Stmt, depth: usize) {
        let pad = INDENT.repeat(depth);
        match stmt {
            Stmt::Declare { local, init } => {
                let ty = self
                    .body
                    .locals
                    .get(local.0 as usize)
                    .map(|decl| decl.ty.glsl_name())
                    .unwrap_or("float");
                let _ = writeln!(out, "{pad}{ty} {} = {};", self.local(*local), self.expr(init));
            }
            Stmt::Assign { local, value } => {
                let _ = writeln!(out, "{pad}{} = {};", self.local(*local), self.expr(value));
            }
            Stmt::Store { binding, index, value } => {
                let _ = writeln!(
                    out,
                    "{pad}{}[{}] = {};",
                    self.binding(*binding),
                    self.expr(index),
                    self.expr(value)
                );
            }
            Stmt::AtomicAdd { binding, index, value } => {
                let _ = writeln!(
                    out,
                    "{pad}atomicAdd({}[{}], {});",
                    self.binding(*binding),
                    self.expr(index),
                    self.expr(value)
                );
            }
            Stmt::For { local, start, end, body } => {
                let name = self.local(*local);
                let _ = writeln!(
                    out,
                    "{pad}for (int {name} = {}; {name} < {}; {name}++) {{",
                    self.expr(start),
                    self.expr(end)
                );
                for inner in body {
                    self.stmt(out, inner, depth + 1);
                }
                let _ = writeln!(out, "{pad}}}");
            }
            Stmt::If { cond, then } => {
                if let [Stmt::Return] = then.as_slice() {
                    let _ = writeln!(out, "{pad}if ({}) return;", self.expr(cond));
                } else {
                    let _ = writeln!(out, "{pad}if ({}) {{", self.expr(cond));
                    for inner in then {
                        self.stmt(out, inner, depth + 1);
                    }
                    let _ = writeln!(out, "{pad}}}");
                }
            }
            Stmt::Return => {
                let _ = writeln!(out, "{pad}return;");
            }
        }
    }

    fn expr(&self, expr: &Expr) -> String {
        self.expr_prec(expr, 0)
    }

    /// Render `expr`, parenthesizing when its precedence is below `min_prec`.
    fn expr_prec(&self, expr: &Expr, min_prec: u8) -> String {
        let (text, prec) = match expr {
            Expr::Literal(value) => (literal(*value), PRIMARY),
            Expr::Local(id) => (self.local(*id).to_string(), PRIMARY),
            Expr::Uniform(id) => (self.uniform(*id).to_string(), PRIMARY),
            Expr::Invocation(axis) => {
                let field = match axis {
                    Axis::X => "x",
                    Axis::Y => "y",
                };
                (format!("int(gl_GlobalInvocationID.{field})"), PRIMARY)
            }
            Expr::Unary(UnaryOp::Neg, operand) => (format!("-{}", self.expr_prec(operand, UNARY)), UNARY),
            Expr::Unary(UnaryOp::Exp, operand) => (format!("exp({})", self.expr(operand)), PRIMARY),
            Expr::Unary(UnaryOp::Abs, operand) => (format!("abs({})", self.expr(operand)), PRIMARY),
            Expr::Binary(BinaryOp::Min, lhs, rhs) => (format!("min({}, {})", self.expr(lhs), self.expr(rhs)), PRIMARY),
            Expr::Binary(BinaryOp::Max, lhs, rhs) => (format!("max({}, {})", self.expr(lhs), self.expr(rhs)), PRIMARY),
            Expr::Binary(op, lhs, rhs) => {
                let prec = precedence(*op);
                let text = format!(
                    "{} {} {}",
                    self.expr_prec(lhs, prec),
                    operator(*op),
                    self.expr_prec(rhs, prec + 1)
                );
                (text, prec)
            }
            Expr::Clamp { value, min, max } => (
                format!("clamp({}, {}, {})", self.expr(value), self.expr(min), self.expr(max)),
                PRIMARY,
            ),
            Expr::Select {
                cond,
                if_true,
                if_false,
            } => (
                format!(
                    "{} ? {} : {}",
                    self.expr_prec(cond, 1),
                    self.expr_prec(if_true, 1),
                    self.expr_prec(if_false, 1)
                ),
                0,
            ),
            Expr::Load { binding, index } => (format!("{}[{}]", self.binding(*binding), self.expr(index)), PRIMARY),
        };

        if prec < min_prec {
            format!("({text})")
        } else {
            text
        }
    }
}

const UNARY: u8 = 7;
const PRIMARY: u8 = 8;

fn precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Eq => 3,
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
        BinaryOp::Add | BinaryOp::Sub => 5,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
        BinaryOp::Min | BinaryOp::Max => PRIMARY,
    }
}

fn operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::Eq => "==",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Min => "min",
        BinaryOp::Max => "max",
    }
}

fn literal(value: Scalar) -> String {
    match value {
        Scalar::Int(v) => v.to_string(),
        // `{:?}` always keeps a decimal point or exponent.
        Scalar::Float(v) => format!("{v:?}"),
        Scalar::Bool(v) => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelBuilder, ScalarType};
    use crate::launch::WorkgroupSize;

    const VALUES: BindingId = BindingId(0);
    const OUT: BindingId = BindingId(1);
    const COUNT: UniformId = UniformId(0);

    fn module(body: KernelBody) -> KernelModule {
        KernelModule::new("test", WorkgroupSize::new(64, 1))
            .binding(VALUES, "values", Access::ReadOnly)
            .binding(OUT, "out", Access::ReadWrite)
            .uniform(COUNT, "count", ScalarType::Int)
            .with_body(body)
    }

    #[test]
    fn renders_interface_and_main() {
        let mut k = KernelBuilder::new();
        let i = k.let_int("i", Expr::invocation(Axis::X));
        k.return_if(i.clone().greater_equal(Expr::uniform(COUNT)));
        k.store(OUT, i.clone(), Expr::load(VALUES, i) * 2.0f32);
        let source = module(k.finish()).source();

        assert!(source.starts_with("#version 450\n"));
        assert!(source.contains("layout(local_size_x = 64, local_size_y = 1, local_size_z = 1) in;"));
        assert!(source.contains("layout(std430, binding = 0) readonly buffer ValuesBuffer { float values[]; };"));
        assert!(source.contains("uniform int count;"));
        assert!(source.contains("    int i = int(gl_GlobalInvocationID.x);\n"));
        assert!(source.contains("    if (i >= count) return;\n"));
        assert!(source.contains("    out[i] = values[i] * 2.0;\n"));
        assert!(!source.contains("GL_EXT_shader_atomic_float"));
    }

    #[test]
    fn parenthesizes_by_precedence() {
        let mut k = KernelBuilder::new();
        let a = k.let_int("a", 1);
        let b = k.let_int("b", 2);
        k.let_int("c", (a.clone() + b.clone()) * 3);
        k.let_int("d", a.clone() - (b.clone() - 1));
        k.let_int("e", a * 3 + b);
        let text = body_source(&module(KernelBody::default()), &k.finish());

        assert!(text.contains("int c = (a + b) * 3;"));
        assert!(text.contains("int d = a - (b - 1);"));
        assert!(text.contains("int e = a * 3 + b;"));
    }

    #[test]
    fn atomic_add_requests_float_atomics() {
        let mut k = KernelBuilder::new();
        k.for_range("i", 0, Expr::uniform(COUNT), |k, i| {
            k.atomic_add(OUT, 0, Expr::load(VALUES, i));
        });
        let source = module(k.finish()).source();
        assert!(source.contains("#extension GL_EXT_shader_atomic_float : require"));
        assert!(source.contains("for (int i = 0; i < count; i++) {"));
        assert!(source.contains("atomicAdd(out[0], values[i]);"));
    }

    #[test]
    fn float_literals_keep_their_point() {
        assert_eq!(literal(Scalar::Float(1.0)), "1.0");
        assert_eq!(literal(Scalar::Float(0.05)), "0.05");
        assert_eq!(literal(Scalar::Float(1e30)), "1e30");
    }
}
