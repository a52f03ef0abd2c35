// error.rs — Error types for stage definition, scheduling and execution
//
// Programming errors (unknown names, malformed schedules, bad extents) are
// returned to the caller. Bounds and allocation failures are reported to the
// installed error handler first and carried here so they can be rendered as
// diagnostics.

use thiserror::Error;

use crate::expr::EvalError;
use crate::verify::BoundsViolation;

/// Failures surfaced by the pipeline API.
///
/// `BoundsInsufficient` and `AllocationFailure` are also delivered to the
/// installed error handler before execution returns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// A schedule expression referenced a parameter with no value.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Declared bounds do not cover the region consumers read.
    #[error("{0}")]
    BoundsInsufficient(BoundsViolation),

    /// The allocate hook returned no storage.
    #[error("failed to allocate {bytes} bytes for {stage}")]
    AllocationFailure { stage: String, bytes: usize },

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("stage '{stage}' has no dimension or loop variable named '{var}'")]
    UnknownVariable { stage: String, var: String },

    #[error("invalid definition of '{stage}': {reason}")]
    InvalidDefinition { stage: String, reason: String },

    #[error("invalid schedule for '{stage}': {reason}")]
    InvalidSchedule { stage: String, reason: String },

    /// An explicit bound evaluated to a negative extent.
    #[error("bound on {stage} in {dim} has negative extent {extent}")]
    NegativeExtent {
        stage: String,
        dim: String,
        extent: i64,
    },

    #[error("split factor for {stage}.{var} must be positive, got {factor}")]
    NonPositiveSplitFactor {
        stage: String,
        var: String,
        factor: i64,
    },

    #[error("pipeline has no stages")]
    NoOutput,

    #[error("output '{stage}' has {expected} dimensions but {given} extents were requested")]
    OutputRank {
        stage: String,
        expected: usize,
        given: usize,
    },

    /// A realized stage was read outside the region it was computed over.
    #[error("{stage} read at {coords:?}, outside its realized region")]
    UnrealizedAccess { stage: String, coords: Vec<i64> },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_errors_convert_transparently() {
        let err: RuntimeError = EvalError::UnboundParameter("p".to_string()).into();
        assert_eq!(err.to_string(), "parameter 'p' has no assigned value");
    }

    #[test]
    fn allocation_failure_message() {
        let err = RuntimeError::AllocationFailure {
            stage: "f".to_string(),
            bytes: 80,
        };
        assert_eq!(err.to_string(), "failed to allocate 80 bytes for f");
    }
}
