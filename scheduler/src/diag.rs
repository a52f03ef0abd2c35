// diag.rs — Diagnostics delivered to error handlers
//
// Failures that go through the installed error handler are first turned into
// a `Diagnostic`: a stable code, a level, the exact message text and an
// optional hint. Programming errors stay `RuntimeError`s and are returned to
// the caller instead.
//
// Preconditions: none (types only).
// Postconditions: `Diagnostic::message` is the error's `Display` text.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::error::RuntimeError;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0500`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Declared bounds do not cover the required region.
    pub const BOUNDS_INSUFFICIENT: DiagCode = DiagCode("E0500");
    /// The allocate hook returned no storage.
    pub const ALLOCATION_FAILURE: DiagCode = DiagCode("E0501");
    /// A vectorize request could not be honored.
    pub const VECTORIZE_NOT_HONORED: DiagCode = DiagCode("W0510");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    pub hint: Option<String>,
    /// Stage the diagnostic is about, if any.
    pub stage: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            message: message.into(),
            hint: None,
            stage: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(err: &RuntimeError) -> Self {
        let diag = Diagnostic::error(err.to_string());
        match err {
            RuntimeError::BoundsInsufficient(v) => diag
                .with_code(codes::BOUNDS_INSUFFICIENT)
                .with_stage(v.stage.clone())
                .with_hint(format!(
                    "widen the explicit bound on {} in {} or shrink the consumer's tile",
                    v.stage, v.dim
                )),
            RuntimeError::AllocationFailure { stage, .. } => diag
                .with_code(codes::ALLOCATION_FAILURE)
                .with_stage(stage.clone()),
            _ => diag,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
