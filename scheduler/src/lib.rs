// stagebound — Storage placement and bound verification for staged pipelines
//
// Library root. A pipeline is a set of stages, each a pointwise definition
// over named dimensions that may read earlier stages. A schedule descriptor
// decides where each stage is computed, how loops are split, and which
// explicit bounds a stage declares. Executing the pipeline verifies declared
// bounds per compute-scope instance, places storage on the stack or through
// replaceable allocator hooks, and routes failures to a replaceable error
// handler.

pub mod config;
pub mod diag;
pub mod error;
pub mod expr;
pub mod hooks;
pub mod id;
pub mod pipeline;
mod realize;
pub mod region;
pub mod schedule;
pub mod stage;
pub mod storage;
pub mod verify;

pub use config::RuntimeConfig;
pub use diag::Diagnostic;
pub use error::{Result, RuntimeError};
pub use expr::{evaluate, Expr, ParamBindings};
pub use hooks::{AllocatorHooks, ErrorHandler, UserContext};
pub use pipeline::{Pipeline, Realization};
pub use schedule::ScheduleDescriptor;
pub use stage::{Access, Definition};
pub use storage::{AllocationCounts, Placement};
