//! The envelope aggregate and its lifecycle.
//!
//! ```text
//! Draft ──activate──▶ Sent ──first submission──▶ InProgress ──last required field──▶ Completed
//!   │                  │                             │
//!   └──────────────────┴──────decline / void─────────┴──▶ Declined | Voided
//! ```
//!
//! Every method here is pure: it mutates the in-memory aggregate and returns
//! the audit entries the caller must persist alongside it. Persistence,
//! rendering and notification are the engine's job.

use crate::audit::{AuditAction, AuditEntry, RequestContext};
use crate::document::DocumentInfo;
use crate::error::{EngineError, EngineResult, FieldError, FieldRejection, ValidationErrors};
use crate::field::{Field, FieldId, FieldSpec, FieldValue, RawValue, ValidationRules, validate};
use crate::geometry::{PageDims, to_page_space};
use crate::storage::BlobKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

pub type EnvelopeId = Uuid;
pub type SignerId = Uuid;

/// Whether signers must sign in sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMode {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Draft,
    Sent,
    InProgress,
    Completed,
    Declined,
    Voided,
}

impl EnvelopeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnvelopeStatus::Completed | EnvelopeStatus::Declined | EnvelopeStatus::Voided
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeStatus::Draft => "draft",
            EnvelopeStatus::Sent => "sent",
            EnvelopeStatus::InProgress => "in_progress",
            EnvelopeStatus::Completed => "completed",
            EnvelopeStatus::Declined => "declined",
            EnvelopeStatus::Voided => "voided",
        }
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerStatus {
    Pending,
    Signed,
    Declined,
}

/// Who a signer is, as verified by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signer {
    pub id: SignerId,
    pub envelope_id: EnvelopeId,
    pub identity: Identity,
    /// Position in sequential mode; `None` means any order.
    pub sequence: Option<u32>,
    pub status: SignerStatus,
    pub signed_at: Option<DateTime<Utc>>,
    /// Opaque token for the signer's signing link.
    pub access_token: String,
}

/// A signer to add to an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSigner {
    #[serde(default = "Uuid::new_v4")]
    pub id: SignerId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub sequence: Option<u32>,
}

impl NewSigner {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    fn into_signer(self, envelope_id: EnvelopeId) -> Signer {
        Signer {
            id: self.id,
            envelope_id,
            identity: Identity {
                name: self.name,
                email: self.email,
            },
            sequence: self.sequence,
            status: SignerStatus::Pending,
            signed_at: None,
            access_token: Uuid::new_v4().simple().to_string(),
        }
    }
}

/// What a successful submission changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub audit: Vec<AuditEntry>,
    pub filled: Vec<FieldId>,
    /// The envelope moved from Sent to InProgress.
    pub opened: bool,
    /// The submitting signer became Signed.
    pub signer_completed: bool,
    /// Every required field is now filled; the envelope is Completed.
    pub completed: bool,
}

/// A document, its signers and their fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub document_key: BlobKey,
    /// Page geometry recorded from the document at creation.
    pub pages: Vec<PageDims>,
    pub signers: Vec<Signer>,
    pub fields: Vec<Field>,
    pub order_mode: OrderMode,
    pub status: EnvelopeStatus,
    /// Optimistic concurrency token; bumped by every mutation.
    pub version: u64,
    /// Content hash of the rendered artifact, once completed.
    pub artifact_hash: Option<String>,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A signer as shown to the sender: everything but the access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerView {
    pub id: SignerId,
    pub identity: Identity,
    pub sequence: Option<u32>,
    pub status: SignerStatus,
    pub signed_at: Option<DateTime<Utc>>,
}

/// An envelope without signing tokens, for responses outside the store.
/// Tokens only leave through signer notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeView {
    pub id: EnvelopeId,
    pub document_key: BlobKey,
    pub pages: Vec<PageDims>,
    pub signers: Vec<SignerView>,
    pub fields: Vec<Field>,
    pub order_mode: OrderMode,
    pub status: EnvelopeStatus,
    pub version: u64,
    pub artifact_hash: Option<String>,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Envelope> for EnvelopeView {
    fn from(envelope: Envelope) -> Self {
        Self {
            id: envelope.id,
            document_key: envelope.document_key,
            pages: envelope.pages,
            signers: envelope
                .signers
                .into_iter()
                .map(|s| SignerView {
                    id: s.id,
                    identity: s.identity,
                    sequence: s.sequence,
                    status: s.status,
                    signed_at: s.signed_at,
                })
                .collect(),
            fields: envelope.fields,
            order_mode: envelope.order_mode,
            status: envelope.status,
            version: envelope.version,
            artifact_hash: envelope.artifact_hash,
            decline_reason: envelope.decline_reason,
            created_at: envelope.created_at,
            updated_at: envelope.updated_at,
        }
    }
}

impl Envelope {
    /// Create a Draft envelope, validating every placement against the
    /// document's pages.
    pub fn create(
        document: &DocumentInfo,
        signers: Vec<NewSigner>,
        fields: Vec<FieldSpec>,
        order_mode: OrderMode,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> EngineResult<(Envelope, Vec<AuditEntry>)> {
        let id = Uuid::new_v4();
        let mut envelope = Envelope {
            id,
            document_key: document.key.clone(),
            pages: document.pages.clone(),
            signers: Vec::with_capacity(signers.len()),
            fields: Vec::with_capacity(fields.len()),
            order_mode,
            status: EnvelopeStatus::Draft,
            version: 1,
            artifact_hash: None,
            decline_reason: None,
            created_at: now,
            updated_at: now,
        };

        for signer in signers {
            envelope.check_new_signer(&signer)?;
            envelope.signers.push(signer.into_signer(id));
        }
        for spec in fields {
            envelope.check_placement(&spec, document)?;
            envelope.fields.push(spec.into_field(id));
        }

        let entry = AuditEntry::new(id, envelope.version, AuditAction::Created, ctx, now).with_detail(
            format!(
                "{} signer(s), {} field(s), {:?} order",
                envelope.signers.len(),
                envelope.fields.len(),
                order_mode
            ),
        );
        Ok((envelope, vec![entry]))
    }

    /// The document this envelope was created on.
    pub fn document(&self) -> DocumentInfo {
        DocumentInfo::new(self.document_key.clone(), self.pages.clone())
    }

    pub fn signer(&self, signer_id: SignerId) -> Option<&Signer> {
        self.signers.iter().find(|s| s.id == signer_id)
    }

    fn signer_mut(&mut self, signer_id: SignerId) -> Option<&mut Signer> {
        self.signers.iter_mut().find(|s| s.id == signer_id)
    }

    pub fn signer_by_token(&self, token: &str) -> Option<&Signer> {
        self.signers.iter().find(|s| s.access_token == token)
    }

    pub fn field(&self, field_id: FieldId) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == field_id)
    }

    /// Fields assigned to a signer.
    pub fn fields_for(&self, signer_id: SignerId) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(move |f| f.signer_id == signer_id)
    }

    fn has_required_fields(&self, signer_id: SignerId) -> bool {
        self.fields_for(signer_id).any(|f| f.required)
    }

    fn signer_requirements_met(&self, signer_id: SignerId) -> bool {
        self.fields_for(signer_id).all(|f| !f.required || f.is_filled())
    }

    /// Required fields still waiting for a value.
    pub fn required_remaining(&self) -> usize {
        self.fields
            .iter()
            .filter(|f| f.required && !f.is_filled())
            .count()
    }

    /// Whether every required field is filled.
    pub fn is_complete(&self) -> bool {
        self.required_remaining() == 0
    }

    fn ensure_status(&self, allowed: &[EnvelopeStatus], action: &'static str) -> EngineResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                status: self.status,
                action,
            })
        }
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    fn check_new_signer(&self, signer: &NewSigner) -> EngineResult<()> {
        if self.signer(signer.id).is_some() {
            return Err(EngineError::InvalidSetup(format!(
                "duplicate signer id {}",
                signer.id
            )));
        }
        if self.order_mode == OrderMode::Sequential {
            let Some(sequence) = signer.sequence else {
                return Err(EngineError::InvalidSetup(format!(
                    "signer {} needs a sequence number in sequential mode",
                    signer.email
                )));
            };
            if self.signers.iter().any(|s| s.sequence == Some(sequence)) {
                return Err(EngineError::InvalidSetup(format!(
                    "sequence {} is used by more than one signer",
                    sequence
                )));
            }
        }
        Ok(())
    }

    fn check_placement(&self, spec: &FieldSpec, document: &DocumentInfo) -> EngineResult<()> {
        if let Some(id) = spec.id {
            if self.field(id).is_some() {
                return Err(EngineError::InvalidSetup(format!("duplicate field id {}", id)));
            }
        }
        if self.signer(spec.signer_id).is_none() {
            return Err(EngineError::InvalidSetup(format!(
                "field references unknown signer {}",
                spec.signer_id
            )));
        }
        let dims = document.page(spec.page_index)?;
        to_page_space(&spec.rect, dims)?;
        Ok(())
    }

    /// Add a signer while the envelope is still a Draft.
    pub fn add_signer(
        &mut self,
        signer: NewSigner,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> EngineResult<(SignerId, Vec<AuditEntry>)> {
        self.ensure_status(&[EnvelopeStatus::Draft], "add a signer to")?;
        self.check_new_signer(&signer)?;

        let signer_id = signer.id;
        self.signers.push(signer.into_signer(self.id));
        self.bump(now);
        let entry = AuditEntry::new(self.id, self.version, AuditAction::SignerAdded, ctx, now)
            .for_signer(signer_id);
        Ok((signer_id, vec![entry]))
    }

    /// Place a field while the envelope is still a Draft.
    pub fn place_field(
        &mut self,
        spec: FieldSpec,
        document: &DocumentInfo,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> EngineResult<(FieldId, Vec<AuditEntry>)> {
        self.ensure_status(&[EnvelopeStatus::Draft], "place a field on")?;
        self.check_placement(&spec, document)?;

        let field = spec.into_field(self.id);
        let field_id = field.id;
        let signer_id = field.signer_id;
        self.fields.push(field);
        self.bump(now);
        let entry = AuditEntry::new(self.id, self.version, AuditAction::FieldPlaced, ctx, now)
            .for_field(field_id)
            .for_signer(signer_id);
        Ok((field_id, vec![entry]))
    }

    /// Draft → Sent.
    pub fn activate(&mut self, ctx: &RequestContext, now: DateTime<Utc>) -> EngineResult<Vec<AuditEntry>> {
        self.ensure_status(&[EnvelopeStatus::Draft], "activate")?;

        if self.signers.is_empty() {
            return Err(EngineError::IncompleteSetup("envelope has no signers".into()));
        }
        if self.fields.is_empty() {
            return Err(EngineError::IncompleteSetup("envelope has no fields".into()));
        }
        if let Some(field) = self.fields.iter().find(|f| self.signer(f.signer_id).is_none()) {
            return Err(EngineError::IncompleteSetup(format!(
                "field {} is assigned to unknown signer {}",
                field.id, field.signer_id
            )));
        }
        if self.fields.iter().any(|f| f.required) {
            if let Some(idle) = self
                .signers
                .iter()
                .find(|s| self.fields_for(s.id).next().is_none())
            {
                return Err(EngineError::IncompleteSetup(format!(
                    "signer {} has no assigned fields",
                    idle.identity
                )));
            }
        }

        self.status = EnvelopeStatus::Sent;
        self.bump(now);
        Ok(vec![AuditEntry::new(self.id, self.version, AuditAction::Sent, ctx, now)])
    }

    /// Signers with a smaller sequence who still owe required fields.
    fn blocking_signers(&self, signer: &Signer) -> Vec<SignerId> {
        if self.order_mode != OrderMode::Sequential {
            return Vec::new();
        }
        let Some(sequence) = signer.sequence else {
            return Vec::new();
        };
        self.signers
            .iter()
            .filter(|s| s.sequence.is_some_and(|other| other < sequence))
            .filter(|s| s.status != SignerStatus::Signed && self.has_required_fields(s.id))
            .map(|s| s.id)
            .collect()
    }

    /// Whether a pending signer is not waiting on anyone earlier in sequence.
    pub fn may_submit(&self, signer_id: SignerId) -> bool {
        self.signer(signer_id).is_some_and(|signer| {
            signer.status == SignerStatus::Pending && self.blocking_signers(signer).is_empty()
        })
    }

    /// Apply a signer's values. All-or-nothing: on error the envelope is
    /// unchanged.
    pub fn submit(
        &mut self,
        signer_id: SignerId,
        values: &BTreeMap<FieldId, RawValue>,
        expected_version: u64,
        rules: &ValidationRules,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> EngineResult<Submission> {
        if self.version != expected_version {
            return Err(EngineError::Conflict {
                expected: expected_version,
                found: self.version,
            });
        }
        self.ensure_status(&[EnvelopeStatus::Sent, EnvelopeStatus::InProgress], "submit fields to")?;

        let signer = self
            .signer(signer_id)
            .ok_or(EngineError::UnknownSigner(signer_id))?;
        let waiting_on = self.blocking_signers(signer);
        if !waiting_on.is_empty() {
            return Err(EngineError::OrderViolation {
                signer: signer_id,
                waiting_on,
            });
        }

        let mut accepted: Vec<(FieldId, FieldValue)> = Vec::with_capacity(values.len());
        let mut errors = Vec::new();
        for (&field_id, raw) in values {
            match self.check_value(signer_id, field_id, raw, rules) {
                Ok(value) => accepted.push((field_id, value)),
                Err(reason) => errors.push(FieldError { field_id, reason }),
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation(ValidationErrors(errors)));
        }

        // Validation passed; from here on nothing can fail.
        self.bump(now);
        let version = self.version;
        let mut audit = Vec::new();

        let opened = self.status == EnvelopeStatus::Sent;
        if opened {
            self.status = EnvelopeStatus::InProgress;
            audit.push(
                AuditEntry::new(self.id, version, AuditAction::Opened, ctx, now).for_signer(signer_id),
            );
        }

        let mut filled = Vec::with_capacity(accepted.len());
        for (field_id, value) in accepted {
            if let Some(field) = self.fields.iter_mut().find(|f| f.id == field_id) {
                field.value = Some(value);
                field.filled_at = Some(now);
                filled.push(field_id);
                audit.push(
                    AuditEntry::new(self.id, version, AuditAction::FieldFilled, ctx, now)
                        .for_field(field_id)
                        .for_signer(signer_id),
                );
            }
        }

        let mut signer_completed = false;
        if self.signer_requirements_met(signer_id) {
            if let Some(signer) = self.signer_mut(signer_id) {
                if signer.status == SignerStatus::Pending {
                    signer.status = SignerStatus::Signed;
                    signer.signed_at = Some(now);
                    signer_completed = true;
                }
            }
            if signer_completed {
                audit.push(
                    AuditEntry::new(self.id, version, AuditAction::SignerCompleted, ctx, now)
                        .for_signer(signer_id),
                );
            }
        }

        let completed = self.is_complete();
        if completed {
            self.status = EnvelopeStatus::Completed;
            audit.push(AuditEntry::new(self.id, version, AuditAction::Completed, ctx, now));
        }

        Ok(Submission {
            audit,
            filled,
            opened,
            signer_completed,
            completed,
        })
    }

    fn check_value(
        &self,
        signer_id: SignerId,
        field_id: FieldId,
        raw: &RawValue,
        rules: &ValidationRules,
    ) -> Result<FieldValue, FieldRejection> {
        let field = self.field(field_id).ok_or(FieldRejection::UnknownField)?;
        if field.signer_id != signer_id {
            return Err(FieldRejection::NotAssigned);
        }
        if field.is_filled() {
            return Err(FieldRejection::AlreadyFilled);
        }
        Ok(validate(&field.kind, field.required, raw, rules)?)
    }

    /// Any non-terminal state → Declined.
    pub fn decline(
        &mut self,
        signer_id: SignerId,
        reason: &str,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<AuditEntry>> {
        if self.status.is_terminal() {
            return Err(EngineError::InvalidState {
                status: self.status,
                action: "decline",
            });
        }
        let signer = self
            .signer_mut(signer_id)
            .ok_or(EngineError::UnknownSigner(signer_id))?;
        signer.status = SignerStatus::Declined;

        self.status = EnvelopeStatus::Declined;
        self.decline_reason = Some(reason.to_string());
        self.bump(now);
        let entry = AuditEntry::new(self.id, self.version, AuditAction::Declined, ctx, now)
            .for_signer(signer_id)
            .with_detail(reason);
        Ok(vec![entry])
    }

    /// Any non-terminal state → Voided (administrative cancel).
    pub fn void(
        &mut self,
        actor_id: &str,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<AuditEntry>> {
        if self.status.is_terminal() {
            return Err(EngineError::InvalidState {
                status: self.status,
                action: "void",
            });
        }
        self.status = EnvelopeStatus::Voided;
        self.bump(now);
        let entry = AuditEntry::new(self.id, self.version, AuditAction::Voided, ctx, now)
            .with_detail(format!("voided by {}", actor_id));
        Ok(vec![entry])
    }

    /// Distinct signer ids that own at least one field.
    pub fn signers_with_fields(&self) -> HashSet<SignerId> {
        self.fields.iter().map(|f| f.signer_id).collect()
    }
}
