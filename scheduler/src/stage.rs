// stage.rs — In-memory stage definitions
//
// A stage is a named computation over ordered dimensions (first dimension
// innermost). Its definition is a small value expression that may read other
// stages through unit-stride accesses `var + offset`; that access pattern is
// all the bound verifier needs to derive required regions.
//
// Preconditions: producers are defined before their consumers.
// Postconditions: `Stages` assigns IDs in definition order, so ID order is a
//                 topological order of the stage graph.
// Failure modes: calls to undefined stages, accesses through unknown
//                dimensions and arity mismatches are rejected at definition.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;
use std::ops;

use crate::error::{Result, RuntimeError};
use crate::expr::BinOp;
use crate::id::{IdAllocator, StageId};

/// Element type stored by every stage.
pub type Value = i64;

/// Size in bytes of one stored element.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<Value>();

// ── Definitions ─────────────────────────────────────────────────────────────

/// One coordinate of a call: the consumer's dimension `var` shifted by
/// `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub var: String,
    pub offset: i64,
}

impl Access {
    pub fn at(var: impl Into<String>) -> Self {
        Self::offset(var, 0)
    }

    pub fn offset(var: impl Into<String>, offset: i64) -> Self {
        Access {
            var: var.into(),
            offset,
        }
    }
}

/// Value expression defining a stage at one point of its domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definition {
    Const(Value),
    Param(String),
    Var(String),
    Call { stage: String, args: Vec<Access> },
    Binary(BinOp, Box<Definition>, Box<Definition>),
}

impl Definition {
    pub fn var(name: impl Into<String>) -> Self {
        Definition::Var(name.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Definition::Param(name.into())
    }

    pub fn call(stage: impl Into<String>, args: impl IntoIterator<Item = Access>) -> Self {
        Definition::Call {
            stage: stage.into(),
            args: args.into_iter().collect(),
        }
    }

    pub fn binary(op: BinOp, lhs: impl Into<Definition>, rhs: impl Into<Definition>) -> Self {
        Definition::Binary(op, Box::new(lhs.into()), Box::new(rhs.into()))
    }

    pub fn min(self, other: impl Into<Definition>) -> Self {
        Definition::binary(BinOp::Min, self, other)
    }

    pub fn max(self, other: impl Into<Definition>) -> Self {
        Definition::binary(BinOp::Max, self, other)
    }

    /// Visit every call site in the definition, outermost first.
    pub fn for_each_call<'a>(&'a self, visit: &mut impl FnMut(&'a str, &'a [Access])) {
        match self {
            Definition::Const(_) | Definition::Param(_) | Definition::Var(_) => {}
            Definition::Call { stage, args } => visit(stage, args),
            Definition::Binary(_, lhs, rhs) => {
                lhs.for_each_call(visit);
                rhs.for_each_call(visit);
            }
        }
    }

    fn for_each_var<'a>(&'a self, visit: &mut impl FnMut(&'a str)) {
        match self {
            Definition::Const(_) | Definition::Param(_) => {}
            Definition::Var(name) => visit(name),
            Definition::Call { args, .. } => args.iter().for_each(|a| visit(&a.var)),
            Definition::Binary(_, lhs, rhs) => {
                lhs.for_each_var(visit);
                rhs.for_each_var(visit);
            }
        }
    }
}

impl From<Value> for Definition {
    fn from(value: Value) -> Self {
        Definition::Const(value)
    }
}

impl From<i32> for Definition {
    fn from(value: i32) -> Self {
        Definition::Const(Value::from(value))
    }
}

macro_rules! impl_definition_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Definition>> ops::$trait<R> for Definition {
            type Output = Definition;

            fn $method(self, rhs: R) -> Definition {
                Definition::binary($op, self, rhs)
            }
        }
    };
}

impl_definition_op!(Add, add, BinOp::Add);
impl_definition_op!(Sub, sub, BinOp::Sub);
impl_definition_op!(Mul, mul, BinOp::Mul);
impl_definition_op!(Div, div, BinOp::Div);

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Definition::Const(n) => write!(f, "{n}"),
            Definition::Param(name) | Definition::Var(name) => write!(f, "{name}"),
            Definition::Call { stage, args } => {
                write!(f, "{stage}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match arg.offset {
                        0 => write!(f, "{}", arg.var)?,
                        o if o > 0 => write!(f, "{} + {o}", arg.var)?,
                        o => write!(f, "{} - {}", arg.var, o.unsigned_abs())?,
                    }
                }
                write!(f, ")")
            }
            Definition::Binary(op @ (BinOp::Min | BinOp::Max), lhs, rhs) => {
                let name = if *op == BinOp::Min { "min" } else { "max" };
                write!(f, "{name}({lhs}, {rhs})")
            }
            Definition::Binary(op, lhs, rhs) => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    _ => "/",
                };
                write!(f, "({lhs} {sym} {rhs})")
            }
        }
    }
}

// ── Stages ──────────────────────────────────────────────────────────────────

/// A named computation over one or more dimensions.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    /// Dimension names, innermost first.
    pub dims: Vec<String>,
    pub definition: Definition,
}

impl Stage {
    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == name)
    }
}

/// Stage table indexed by `StageId`.
#[derive(Debug, Default)]
pub struct Stages {
    ids: IdAllocator,
    stages: Vec<Stage>,
    by_name: HashMap<String, StageId>,
}

impl Stages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage. Every stage it calls must already be defined, with a
    /// matching number of dimensions, and every access must go through one of
    /// the new stage's own dimensions.
    pub fn define(
        &mut self,
        name: impl Into<String>,
        dims: &[&str],
        definition: Definition,
    ) -> Result<StageId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(RuntimeError::InvalidDefinition {
                stage: name,
                reason: "stage is already defined".to_string(),
            });
        }
        if dims.is_empty() {
            return Err(RuntimeError::InvalidDefinition {
                stage: name,
                reason: "a stage needs at least one dimension".to_string(),
            });
        }

        let mut failure = None;
        definition.for_each_var(&mut |var| {
            if failure.is_none() && !dims.contains(&var) {
                failure = Some(RuntimeError::UnknownVariable {
                    stage: name.clone(),
                    var: var.to_string(),
                });
            }
        });
        definition.for_each_call(&mut |callee, args| {
            if failure.is_some() {
                return;
            }
            match self.get(callee) {
                None => failure = Some(RuntimeError::UnknownStage(callee.to_string())),
                Some(producer) if producer.dims.len() != args.len() => {
                    failure = Some(RuntimeError::InvalidDefinition {
                        stage: name.clone(),
                        reason: format!(
                            "call to '{}' passes {} coordinates but it has {} dimensions",
                            callee,
                            args.len(),
                            producer.dims.len()
                        ),
                    });
                }
                Some(_) => {}
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }

        let id = self.ids.alloc_stage();
        self.by_name.insert(name.clone(), id);
        self.stages.push(Stage {
            id,
            name,
            dims: dims.iter().map(|d| d.to_string()).collect(),
            definition,
        });
        Ok(id)
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.by_name.get(name).map(|id| &self.stages[id.index()])
    }

    pub fn by_id(&self, id: StageId) -> &Stage {
        &self.stages[id.index()]
    }

    pub fn lookup(&self, name: &str) -> Result<&Stage> {
        self.get(name)
            .ok_or_else(|| RuntimeError::UnknownStage(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn last(&self) -> Option<&Stage> {
        self.stages.last()
    }
}
