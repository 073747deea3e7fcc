//! A small typed kernel language.
//!
//! Kernels are written once against [`KernelBuilder`] and then either
//! rendered to GLSL-flavoured compute source ([`emit`]) or lowered into an
//! executable closure tree ([`compile`]). The rendered text is the identity of
//! a kernel (it keys the [`crate::cache::KernelCache`]); the closure tree is
//! what a device runs.
//!
//! ```text
//!   KernelBuilder ──► KernelBody ──► KernelModule ──┬──► emit::module_source()  (text)
//!                                                   └──► compile::compile()     (CompiledKernel)
//! ```

pub mod builder;
pub mod compile;
pub mod emit;
pub mod ir;
pub mod memory;

pub use builder::{KernelBody, KernelBuilder, KernelModule, LocalDecl, Var};
pub use compile::{compile, CompiledKernel, Frame};
pub use ir::{BinaryOp, Expr, Stmt, UnaryOp};
pub use memory::{as_cells, KernelMemory, MemoryFault, SliceMemory};

use std::fmt;

/// Upper bound on binding slots a module may declare.
pub const MAX_BINDINGS: usize = 8;

/// Scalar types of the kernel language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Int,
    Float,
    Bool,
}

impl ScalarType {
    pub fn glsl_name(self) -> &'static str {
        match self {
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::Bool => "bool",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.glsl_name())
    }
}

/// A typed scalar value, used for literals and uniform values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i32),
    Float(f32),
    Bool(bool),
}

impl Scalar {
    pub fn ty(&self) -> ScalarType {
        match self {
            Scalar::Int(_) => ScalarType::Int,
            Scalar::Float(_) => ScalarType::Float,
            Scalar::Bool(_) => ScalarType::Bool,
        }
    }
}

/// Storage-buffer binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u8);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding#{}", self.0)
    }
}

/// Uniform slot; dispatch values are indexed by this number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformId(pub u8);

impl fmt::Display for UniformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uniform#{}", self.0)
    }
}

/// Index into a [`KernelBody`]'s local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(pub(crate) u16);

/// Axis of the global invocation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub(crate) fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
        }
    }
}

/// Buffer access qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn can_read(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingDecl {
    pub id: BindingId,
    pub name: &'static str,
    pub access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformDecl {
    pub id: UniformId,
    pub name: &'static str,
    pub ty: ScalarType,
}
