//! Deferred expressions, evaluated against a table by [`crate::eval`].
//!
//! ```ignore
//! let centered = col("x") - call("mean", [col("x")]);
//! let big = col("x").gt(lit(10)).and(col("y").is_na());
//! ```

use std::ops::{Add, Div, Mul, Neg, Not, Rem, Sub};

use polars::prelude::Series;

use crate::ops::{BinOp, UnaryOp};
use crate::value::ScalarValue;

#[derive(Debug, Clone)]
pub enum Expr {
    /// Column reference: `x`, or a nesting prefix `df` of `df$a`
    Col(String),

    /// Literal scalar
    Lit(ScalarValue),

    /// Bare vector with no table provenance: `c(1, 2)`
    Values(Series),

    /// Registered function call: `name(operand, args...)`
    Call { function: String, args: Vec<Expr> },

    /// Binary operation: `a + b`, `a == b`
    BinaryOp(Box<Expr>, BinOp, Box<Expr>),

    /// Unary operation: `-x`, `!x`
    UnaryOp(UnaryOp, Box<Expr>),

    /// `if_else(condition, yes, no)`
    IfElse {
        condition: Box<Expr>,
        yes: Box<Expr>,
        no: Box<Expr>,
    },

    /// Group size: `n()`
    N,
}

pub fn col(name: impl Into<String>) -> Expr {
    Expr::Col(name.into())
}

pub fn lit(value: impl Into<ScalarValue>) -> Expr {
    Expr::Lit(value.into())
}

pub fn values(series: Series) -> Expr {
    Expr::Values(series)
}

/// Call a registered function; the first argument is the dispatch operand.
pub fn call(function: impl Into<String>, args: impl IntoIterator<Item = Expr>) -> Expr {
    Expr::Call {
        function: function.into(),
        args: args.into_iter().collect(),
    }
}

pub fn n() -> Expr {
    Expr::N
}

pub fn if_else(condition: Expr, yes: Expr, no: Expr) -> Expr {
    Expr::IfElse {
        condition: Box::new(condition),
        yes: Box::new(yes),
        no: Box::new(no),
    }
}

impl Expr {
    pub fn binop(self, op: BinOp, rhs: Expr) -> Self {
        Expr::BinaryOp(Box::new(self), op, Box::new(rhs))
    }

    pub fn eq(self, rhs: Expr) -> Self {
        self.binop(BinOp::Eq, rhs)
    }

    pub fn neq(self, rhs: Expr) -> Self {
        self.binop(BinOp::Ne, rhs)
    }

    pub fn lt(self, rhs: Expr) -> Self {
        self.binop(BinOp::Lt, rhs)
    }

    pub fn lt_eq(self, rhs: Expr) -> Self {
        self.binop(BinOp::Le, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Self {
        self.binop(BinOp::Gt, rhs)
    }

    pub fn gt_eq(self, rhs: Expr) -> Self {
        self.binop(BinOp::Ge, rhs)
    }

    pub fn and(self, rhs: Expr) -> Self {
        self.binop(BinOp::And, rhs)
    }

    pub fn or(self, rhs: Expr) -> Self {
        self.binop(BinOp::Or, rhs)
    }

    /// `name(self, args...)`
    pub fn apply(self, function: impl Into<String>, args: impl IntoIterator<Item = Expr>) -> Self {
        call(function, std::iter::once(self).chain(args))
    }

    pub fn is_na(self) -> Self {
        self.apply("is_na", [])
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                self.binop($op, rhs)
            }
        }
    };
}

impl_binop!(Add, add, BinOp::Add);
impl_binop!(Sub, sub, BinOp::Sub);
impl_binop!(Mul, mul, BinOp::Mul);
impl_binop!(Div, div, BinOp::Div);
impl_binop!(Rem, rem, BinOp::Mod);

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::UnaryOp(UnaryOp::Neg, Box::new(self))
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::UnaryOp(UnaryOp::Not, Box::new(self))
    }
}

impl From<ScalarValue> for Expr {
    fn from(value: ScalarValue) -> Self {
        Expr::Lit(value)
    }
}
