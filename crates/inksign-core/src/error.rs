//! Engine error taxonomy.

use crate::envelope::{EnvelopeId, EnvelopeStatus, SignerId};
use crate::field::{FieldId, ValidationError};
use crate::geometry::OutOfBoundsError;
use crate::render::RenderError;
use crate::storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Why a value in a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldRejection {
    #[error("no such field in this envelope")]
    UnknownField,
    #[error("field is assigned to another signer")]
    NotAssigned,
    #[error("field is already filled")]
    AlreadyFilled,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// A rejected value and its field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field_id: FieldId,
    pub reason: FieldRejection,
}

/// Every rejection found in one submission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "field {}: {}", err.field_id, err.reason)?;
        }
        Ok(())
    }
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("field placement rejected: {0}")]
    OutOfBounds(#[from] OutOfBoundsError),
    #[error("invalid envelope setup: {0}")]
    InvalidSetup(String),
    #[error("envelope cannot be activated: {0}")]
    IncompleteSetup(String),
    #[error("signer {signer} must wait for {} earlier signer(s)", waiting_on.len())]
    OrderViolation {
        signer: SignerId,
        waiting_on: Vec<SignerId>,
    },
    #[error("version conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },
    #[error("cannot {action} an envelope that is {status}")]
    InvalidState {
        status: EnvelopeStatus,
        action: &'static str,
    },
    #[error("render failed: {0}")]
    Render(#[from] RenderError),
    #[error("artifact not ready: envelope is {status}")]
    NotReady { status: EnvelopeStatus },
    #[error("envelope not found: {0}")]
    NotFound(EnvelopeId),
    #[error("unknown signer: {0}")]
    UnknownSigner(SignerId),
    #[error("unknown signing token")]
    UnknownToken,
    #[error("document rejected: {0}")]
    Document(String),
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionMismatch { expected, found } => {
                EngineError::Conflict { expected, found }
            }
            other => EngineError::Storage(other),
        }
    }
}

impl EngineError {
    /// Stable machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::OutOfBounds(_) => "out_of_bounds",
            EngineError::InvalidSetup(_) => "invalid_setup",
            EngineError::IncompleteSetup(_) => "incomplete_setup",
            EngineError::OrderViolation { .. } => "order_violation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::Render(_) => "render",
            EngineError::NotReady { .. } => "not_ready",
            EngineError::NotFound(_) => "not_found",
            EngineError::UnknownSigner(_) => "unknown_signer",
            EngineError::UnknownToken => "unknown_token",
            EngineError::Document(_) => "document",
            EngineError::Storage(_) => "storage",
        }
    }

    /// Whether the caller can succeed by retrying (after correcting input,
    /// waiting, or re-reading).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::OrderViolation { .. }
                | EngineError::Conflict { .. }
                | EngineError::NotReady { .. }
        )
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
