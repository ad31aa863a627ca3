//! Append-only audit trail.

use crate::envelope::{EnvelopeId, SignerId};
use crate::field::FieldId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    SignerAdded,
    FieldPlaced,
    Sent,
    Opened,
    FieldFilled,
    SignerCompleted,
    Completed,
    Declined,
    Voided,
}

/// Caller identity and transport metadata for one request.
///
/// The engine records this; it does not authenticate it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub identity: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ip_address: None,
            user_agent: None,
        }
    }

    /// Context for actions the engine takes on its own behalf.
    pub fn system() -> Self {
        Self::new("system")
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub envelope_id: EnvelopeId,
    /// Envelope version produced by the operation that wrote this entry.
    pub version: u64,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<FieldId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_id: Option<SignerId>,
    /// Recorded identity of whoever triggered the action.
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(
        envelope_id: EnvelopeId,
        version: u64,
        action: AuditAction,
        ctx: &RequestContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope_id,
            version,
            action,
            field_id: None,
            signer_id: None,
            actor: ctx.identity.clone(),
            timestamp,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            detail: None,
        }
    }

    pub fn for_field(mut self, field_id: FieldId) -> Self {
        self.field_id = Some(field_id);
        self
    }

    pub fn for_signer(mut self, signer_id: SignerId) -> Self {
        self.signer_id = Some(signer_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("entry belongs to envelope {found}, log is for {expected}")]
    WrongEnvelope {
        expected: EnvelopeId,
        found: EnvelopeId,
    },
    #[error("entry version {found} is older than the last recorded version {last}")]
    OutOfOrder { last: u64, found: u64 },
}

/// The audit trail of one envelope. Entries can only be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    envelope_id: EnvelopeId,
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn new(envelope_id: EnvelopeId) -> Self {
        Self {
            envelope_id,
            entries: Vec::new(),
        }
    }

    pub fn envelope_id(&self) -> EnvelopeId {
        self.envelope_id
    }

    /// Append a batch. The whole batch is rejected if any entry is for another
    /// envelope or would move the version backwards.
    pub fn append(&mut self, batch: &[AuditEntry]) -> Result<(), AuditError> {
        let mut last = self.last_version();
        for entry in batch {
            if entry.envelope_id != self.envelope_id {
                return Err(AuditError::WrongEnvelope {
                    expected: self.envelope_id,
                    found: entry.envelope_id,
                });
            }
            if entry.version < last {
                return Err(AuditError::OutOfOrder {
                    last,
                    found: entry.version,
                });
            }
            last = entry.version;
        }
        self.entries.extend_from_slice(batch);
        Ok(())
    }

    pub fn last_version(&self) -> u64 {
        self.entries.last().map(|e| e.version).unwrap_or(0)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries recorded for a field.
    pub fn for_field(&self, field_id: FieldId) -> impl Iterator<Item = &AuditEntry> {
        self.entries
            .iter()
            .filter(move |e| e.field_id == Some(field_id))
    }

    pub fn into_entries(self) -> Vec<AuditEntry> {
        self.entries
    }
}
