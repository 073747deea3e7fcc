//! Ergonomic construction of kernel bodies and modules.

use std::collections::HashMap;

use super::ir::{Expr, Stmt};
use super::{emit, Access, BindingDecl, BindingId, LocalId, ScalarType, UniformDecl, UniformId};
use crate::launch::WorkgroupSize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDecl {
    pub name: String,
    pub ty: ScalarType,
}

/// A mutable local; read it with [`Var::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(LocalId);

impl Var {
    pub fn get(self) -> Expr {
        Expr::Local(self.0)
    }
}

impl From<Var> for Expr {
    fn from(var: Var) -> Self {
        var.get()
    }
}

/// Statements plus the local table they index into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelBody {
    pub locals: Vec<LocalDecl>,
    pub stmts: Vec<Stmt>,
}

/// Records statements as the kernel formula is written.
///
/// Local names are made unique (`i`, `i_1`, ...) so rendered source never
/// shadows.
#[derive(Debug)]
pub struct KernelBuilder {
    locals: Vec<LocalDecl>,
    blocks: Vec<Vec<Stmt>>,
    names: HashMap<String, usize>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            locals: Vec::new(),
            blocks: vec![Vec::new()],
            names: HashMap::new(),
        }
    }

    fn push(&mut self, stmt: Stmt) {
        if let Some(block) = self.blocks.last_mut() {
            block.push(stmt);
        }
    }

    fn new_local(&mut self, name: &str, ty: ScalarType) -> LocalId {
        let count = self.names.entry(name.to_string()).or_insert(0);
        let unique = if *count == 0 {
            name.to_string()
        } else {
            format!("{name}_{count}")
        };
        *count += 1;
        let id = LocalId(self.locals.len() as u16);
        self.locals.push(LocalDecl { name: unique, ty });
        id
    }

    fn declare(&mut self, name: &str, ty: ScalarType, init: Expr) -> LocalId {
        let local = self.new_local(name, ty);
        self.push(Stmt::Declare { local, init });
        local
    }

    /// Declare an immutable `int` and return an expression reading it.
    pub fn let_int(&mut self, name: &str, init: impl Into<Expr>) -> Expr {
        Expr::Local(self.declare(name, ScalarType::Int, init.into()))
    }

    /// Declare an immutable `float` and return an expression reading it.
    pub fn let_float(&mut self, name: &str, init: impl Into<Expr>) -> Expr {
        Expr::Local(self.declare(name, ScalarType::Float, init.into()))
    }

    pub fn let_bool(&mut self, name: &str, init: impl Into<Expr>) -> Expr {
        Expr::Local(self.declare(name, ScalarType::Bool, init.into()))
    }

    /// Declare a mutable `float` accumulator.
    pub fn var_float(&mut self, name: &str, init: impl Into<Expr>) -> Var {
        Var(self.declare(name, ScalarType::Float, init.into()))
    }

    pub fn assign(&mut self, var: Var, value: impl Into<Expr>) {
        self.push(Stmt::Assign {
            local: var.0,
            value: value.into(),
        });
    }

    /// `var = var + value`
    pub fn accumulate(&mut self, var: Var, value: impl Into<Expr>) {
        let value: Expr = value.into();
        self.assign(var, var.get() + value);
    }

    pub fn store(&mut self, binding: BindingId, index: impl Into<Expr>, value: impl Into<Expr>) {
        self.push(Stmt::Store {
            binding,
            index: index.into(),
            value: value.into(),
        });
    }

    pub fn atomic_add(&mut self, binding: BindingId, index: impl Into<Expr>, value: impl Into<Expr>) {
        self.push(Stmt::AtomicAdd {
            binding,
            index: index.into(),
            value: value.into(),
        });
    }

    /// `for (int name = start; name < end; name++) { body }`
    pub fn for_range<F>(&mut self, name: &str, start: impl Into<Expr>, end: impl Into<Expr>, body: F)
    where
        F: FnOnce(&mut Self, Expr),
    {
        let local = self.new_local(name, ScalarType::Int);
        let (start, end) = (start.into(), end.into());
        self.blocks.push(Vec::new());
        body(self, Expr::Local(local));
        let body = self.blocks.pop().unwrap_or_default();
        self.push(Stmt::For {
            local,
            start,
            end,
            body,
        });
    }

    pub fn if_then<F>(&mut self, cond: impl Into<Expr>, body: F)
    where
        F: FnOnce(&mut Self),
    {
        let cond = cond.into();
        self.blocks.push(Vec::new());
        body(self);
        let then = self.blocks.pop().unwrap_or_default();
        self.push(Stmt::If { cond, then });
    }

    /// `if (cond) return;`
    pub fn return_if(&mut self, cond: impl Into<Expr>) {
        self.push(Stmt::If {
            cond: cond.into(),
            then: vec![Stmt::Return],
        });
    }

    pub fn finish(mut self) -> KernelBody {
        let stmts = self.blocks.drain(..).next().unwrap_or_default();
        KernelBody {
            locals: self.locals,
            stmts,
        }
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A complete compute kernel: interface declarations plus a body.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelModule {
    pub name: String,
    pub bindings: Vec<BindingDecl>,
    pub uniforms: Vec<UniformDecl>,
    pub workgroup: WorkgroupSize,
    pub body: KernelBody,
}

impl KernelModule {
    pub fn new(name: impl Into<String>, workgroup: WorkgroupSize) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
            uniforms: Vec::new(),
            workgroup,
            body: KernelBody::default(),
        }
    }

    pub fn binding(mut self, id: BindingId, name: &'static str, access: Access) -> Self {
        self.bindings.push(BindingDecl { id, name, access });
        self
    }

    pub fn uniform(mut self, id: UniformId, name: &'static str, ty: ScalarType) -> Self {
        self.uniforms.push(UniformDecl { id, name, ty });
        self
    }

    pub fn with_body(mut self, body: KernelBody) -> Self {
        self.body = body;
        self
    }

    pub fn find_binding(&self, id: BindingId) -> Option<&BindingDecl> {
        self.bindings.iter().find(|decl| decl.id == id)
    }

    pub fn find_uniform(&self, id: UniformId) -> Option<&UniformDecl> {
        self.uniforms.iter().find(|decl| decl.id == id)
    }

    /// Full GLSL-flavoured source of the module.
    pub fn source(&self) -> String {
        emit::module_source(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_blocks_are_closed_in_order() {
        let mut k = KernelBuilder::new();
        let sum = k.var_float("sum", 0.0f32);
        k.for_range("i", 0, 4, |k, i| {
            k.if_then(i.clone().greater_than(1), |k| k.accumulate(sum, 1.0f32));
        });
        let body = k.finish();

        assert_eq!(body.stmts.len(), 2);
        match &body.stmts[1] {
            Stmt::For { body, .. } => assert!(matches!(body[0], Stmt::If { .. })),
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn repeated_names_are_suffixed() {
        let mut k = KernelBuilder::new();
        k.let_int("i", 1);
        k.let_int("i", 2);
        k.let_int("i", 3);
        let body = k.finish();
        let names: Vec<_> = body.locals.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["i", "i_1", "i_2"]);
    }
}
