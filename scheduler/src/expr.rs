// expr.rs — Schedule expressions and their evaluation
//
// Split factors and explicit bounds are written as small integer expressions
// over pipeline parameters. They are built once with the schedule and
// evaluated at every execution against the parameter values bound at that
// time.
//
// Preconditions: none.
// Postconditions: `evaluate` returns the same value for the same bindings.
// Failure modes: a parameter with no assigned value yields `UnboundParameter`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── AST ─────────────────────────────────────────────────────────────────────

/// An integer expression over named pipeline parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Integer literal.
    Const(i64),
    /// Reference to a runtime parameter by name.
    Param(String),
    /// Binary operation.
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Binary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl BinOp {
    /// Apply the operator to two concrete values.
    ///
    /// Arithmetic wraps on overflow. Division rounds toward negative infinity
    /// for positive divisors (Euclidean) and yields 0 for a zero divisor.
    pub fn apply(self, lhs: i64, rhs: i64) -> i64 {
        match self {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::Div => {
                if rhs == 0 {
                    0
                } else {
                    lhs.wrapping_div_euclid(rhs)
                }
            }
            BinOp::Min => lhs.min(rhs),
            BinOp::Max => lhs.max(rhs),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Min => "min",
            BinOp::Max => "max",
        }
    }
}

impl Expr {
    pub fn constant(value: i64) -> Self {
        Expr::Const(value)
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expr::Param(name.into())
    }

    pub fn binary(op: BinOp, lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Self {
        Expr::Binary(op, Box::new(lhs.into()), Box::new(rhs.into()))
    }

    pub fn min(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Min, self, other)
    }

    pub fn max(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Max, self, other)
    }

    /// Fold the expression to a literal if it references no parameters.
    pub fn const_value(&self) -> Option<i64> {
        match self {
            Expr::Const(n) => Some(*n),
            Expr::Param(_) => None,
            Expr::Binary(op, lhs, rhs) => Some(op.apply(lhs.const_value()?, rhs.const_value()?)),
        }
    }

    /// Names of all parameters the expression depends on, sorted.
    pub fn parameters(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_parameters(&mut names);
        names
    }

    fn collect_parameters<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Const(_) => {}
            Expr::Param(name) => {
                names.insert(name.as_str());
            }
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_parameters(names);
                rhs.collect_parameters(names);
            }
        }
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Const(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Const(i64::from(value))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(n) => write!(f, "{n}"),
            Expr::Param(name) => write!(f, "{name}"),
            Expr::Binary(op @ (BinOp::Min | BinOp::Max), lhs, rhs) => {
                write!(f, "{}({lhs}, {rhs})", op.symbol())
            }
            Expr::Binary(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

macro_rules! impl_expr_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expr>> ops::$trait<R> for Expr {
            type Output = Expr;

            fn $method(self, rhs: R) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

impl_expr_op!(Add, add, BinOp::Add);
impl_expr_op!(Sub, sub, BinOp::Sub);
impl_expr_op!(Mul, mul, BinOp::Mul);
impl_expr_op!(Div, div, BinOp::Div);

// ── Parameter bindings ──────────────────────────────────────────────────────

/// Concrete parameter values for one execution.
///
/// Mutable between executions, read-only while an execution is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamBindings {
    values: BTreeMap<String, i64>,
}

impl ParamBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: i64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    pub fn remove(&mut self, name: &str) -> Option<i64> {
        self.values.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<S: Into<String>> FromIterator<(S, i64)> for ParamBindings {
    fn from_iter<I: IntoIterator<Item = (S, i64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────────

/// Evaluation failure. Not routed through the error handler: an unbound
/// parameter is a programming error in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("parameter '{0}' has no assigned value")]
    UnboundParameter(String),
}

/// Evaluate `expr` under `bindings`.
pub fn evaluate(expr: &Expr, bindings: &ParamBindings) -> Result<i64, EvalError> {
    match expr {
        Expr::Const(n) => Ok(*n),
        Expr::Param(name) => bindings
            .get(name)
            .ok_or_else(|| EvalError::UnboundParameter(name.clone())),
        Expr::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, bindings)?;
            let rhs = evaluate(rhs, bindings)?;
            Ok(op.apply(lhs, rhs))
        }
    }
}
