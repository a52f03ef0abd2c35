// config.rs — Runtime configuration
//
// Knobs that change how an execution is carried out but never what it
// computes. Loadable from JSON; missing fields take their defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::storage::STACK_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Largest buffer placed on the stack, in bytes. Values above the
    /// inline stack capacity are clamped to it.
    pub stack_limit_bytes: usize,
    /// Run loops marked parallel on the rayon pool. When false they run
    /// serially.
    pub parallel: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stack_limit_bytes: STACK_CAPACITY,
            parallel: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    pub fn effective_stack_limit(&self) -> usize {
        self.stack_limit_bytes.min(STACK_CAPACITY)
    }
}
