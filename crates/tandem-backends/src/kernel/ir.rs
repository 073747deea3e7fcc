//! Expression and statement trees.

use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

use super::{Axis, BindingId, LocalId, Scalar, UniformId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Exp,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Scalar),
    Local(LocalId),
    Uniform(UniformId),
    Invocation(Axis),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Clamp {
        value: Box<Expr>,
        min: Box<Expr>,
        max: Box<Expr>,
    },
    Select {
        cond: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    Load {
        binding: BindingId,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Declare {
        local: LocalId,
        init: Expr,
    },
    Assign {
        local: LocalId,
        value: Expr,
    },
    Store {
        binding: BindingId,
        index: Expr,
        value: Expr,
    },
    AtomicAdd {
        binding: BindingId,
        index: Expr,
        value: Expr,
    },
    /// `for (int local = start; local < end; local++)`
    For {
        local: LocalId,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
    },
    Return,
}

impl Expr {
    pub fn uniform(id: UniformId) -> Self {
        Expr::Uniform(id)
    }

    pub fn invocation(axis: Axis) -> Self {
        Expr::Invocation(axis)
    }

    pub fn load(binding: BindingId, index: impl Into<Expr>) -> Self {
        Expr::Load {
            binding,
            index: Box::new(index.into()),
        }
    }

    pub fn select(cond: impl Into<Expr>, if_true: impl Into<Expr>, if_false: impl Into<Expr>) -> Self {
        Expr::Select {
            cond: Box::new(cond.into()),
            if_true: Box::new(if_true.into()),
            if_false: Box::new(if_false.into()),
        }
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: impl Into<Expr>) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs.into()))
    }

    fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary(op, Box::new(operand))
    }

    pub fn min(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Min, self, other)
    }

    pub fn max(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Max, self, other)
    }

    /// GLSL `clamp`: `min(max(self, lo), hi)`.
    pub fn clamp(self, lo: impl Into<Expr>, hi: impl Into<Expr>) -> Self {
        Expr::Clamp {
            value: Box::new(self),
            min: Box::new(lo.into()),
            max: Box::new(hi.into()),
        }
    }

    pub fn exp(self) -> Self {
        Self::unary(UnaryOp::Exp, self)
    }

    pub fn abs(self) -> Self {
        Self::unary(UnaryOp::Abs, self)
    }

    pub fn less_than(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Lt, self, other)
    }

    pub fn less_equal(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Le, self, other)
    }

    pub fn greater_than(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Gt, self, other)
    }

    pub fn greater_equal(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Ge, self, other)
    }

    pub fn equals(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Eq, self, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::And, self, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Or, self, other)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Literal(Scalar::Int(value))
    }
}

/// Shape constants are validated to fit `i32` before they reach a kernel.
impl From<usize> for Expr {
    fn from(value: usize) -> Self {
        Expr::Literal(Scalar::Int(i32::try_from(value).unwrap_or(i32::MAX)))
    }
}

impl From<f32> for Expr {
    fn from(value: f32) -> Self {
        Expr::Literal(Scalar::Float(value))
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Literal(Scalar::Bool(value))
    }
}

impl From<&Expr> for Expr {
    fn from(value: &Expr) -> Self {
        value.clone()
    }
}

macro_rules! arithmetic_ops {
    ($($trait:ident $method:ident $op:ident),+ $(,)?) => {$(
        impl<R: Into<Expr>> $trait<R> for Expr {
            type Output = Expr;

            fn $method(self, rhs: R) -> Expr {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }

        impl<R: Into<Expr>> $trait<R> for &Expr {
            type Output = Expr;

            fn $method(self, rhs: R) -> Expr {
                Expr::binary(BinaryOp::$op, self.clone(), rhs)
            }
        }

        impl $trait<Expr> for i32 {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary(BinaryOp::$op, Expr::from(self), rhs)
            }
        }

        impl $trait<Expr> for f32 {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary(BinaryOp::$op, Expr::from(self), rhs)
            }
        }
    )+};
}

arithmetic_ops! {
    Add add Add,
    Sub sub Sub,
    Mul mul Mul,
    Div div Div,
    Rem rem Rem,
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self)
    }
}
