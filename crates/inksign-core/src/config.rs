//! Engine configuration.

use crate::field::ValidationRules;
use serde::{Deserialize, Serialize};

/// Attempts for operations that re-read and retry on a version conflict.
pub const DEFAULT_COMMIT_ATTEMPTS: usize = 3;

/// Tunables for [`crate::engine::Engine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimums applied to submitted values.
    pub validation: ValidationRules,
    /// How often administrative operations (activate, decline, void, setup)
    /// re-read the envelope after losing a compare-and-swap. Submissions never
    /// retry; the caller's expected version is authoritative.
    pub commit_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validation: ValidationRules::default(),
            commit_attempts: DEFAULT_COMMIT_ATTEMPTS,
        }
    }
}
