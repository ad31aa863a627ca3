//! The signing-workflow engine.
//!
//! Every operation is a short read-validate-write transaction on one envelope.
//! Writers race through [`EnvelopeStore::commit`]; the loser sees
//! [`EngineError::Conflict`]. Completion renders the final artifact under a
//! per-envelope lock, at most once per content hash.

use crate::audit::{AuditEntry, RequestContext};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::document::DocumentInfo;
use crate::envelope::{Envelope, EnvelopeId, EnvelopeStatus, NewSigner, OrderMode, Signer, SignerId};
use crate::error::{EngineError, EngineResult};
use crate::field::{Field, FieldId, FieldSpec, RawValue};
use crate::notify::{Event, LogNotifier, Notifier};
use crate::render::{Compositor, RenderRequest, RenderedArtifact, content_hash};
use crate::storage::{BlobStore, EnvelopeStore, MemoryBlobStore, MemoryEnvelopeStore, StorageError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// What a signer sees when opening their link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningView {
    pub envelope_id: EnvelopeId,
    pub status: EnvelopeStatus,
    pub version: u64,
    pub document_key: String,
    pub signer: Signer,
    /// Fields assigned to this signer.
    pub fields: Vec<Field>,
    /// Whether the signer may submit now (sequential order permitting).
    pub can_submit: bool,
}

pub struct Engine {
    envelopes: Arc<dyn EnvelopeStore>,
    documents: Arc<dyn BlobStore>,
    artifacts: Arc<dyn BlobStore>,
    compositor: Arc<dyn Compositor>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    finalize_locks: DashMap<EnvelopeId, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(
        envelopes: Arc<dyn EnvelopeStore>,
        documents: Arc<dyn BlobStore>,
        artifacts: Arc<dyn BlobStore>,
        compositor: Arc<dyn Compositor>,
    ) -> Self {
        Self {
            envelopes,
            documents,
            artifacts,
            compositor,
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            finalize_locks: DashMap::new(),
        }
    }

    /// Engine backed by in-memory stores.
    pub fn in_memory(compositor: Arc<dyn Compositor>) -> Self {
        Self::new(
            Arc::new(MemoryEnvelopeStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryBlobStore::new()),
            compositor,
        )
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn load(&self, id: EnvelopeId) -> EngineResult<Envelope> {
        self.envelopes.load(id).map_err(|e| match e {
            StorageError::NotFound(_) => EngineError::NotFound(id),
            other => other.into(),
        })
    }

    fn notify(&self, event: Event) {
        if let Err(e) = self.notifier.notify(&event) {
            log::warn!(
                "Failed to deliver {} for envelope {}: {}",
                event.name(),
                event.envelope_id(),
                e
            );
        }
    }

    /// Load, apply `op`, commit. Retries from a fresh read when another writer
    /// got there first.
    fn update<T>(
        &self,
        id: EnvelopeId,
        mut op: impl FnMut(&mut Envelope, DateTime<Utc>) -> EngineResult<(T, Vec<AuditEntry>)>,
    ) -> EngineResult<(Envelope, T)> {
        let attempts = self.config.commit_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut envelope = self.load(id)?;
            let expected = envelope.version;
            let (out, audit) = op(&mut envelope, self.clock.now())?;
            match self.envelopes.commit(&envelope, expected, &audit) {
                Ok(()) => return Ok((envelope, out)),
                Err(StorageError::VersionMismatch { found, .. }) if attempt < attempts => {
                    log::debug!(
                        "Envelope {} moved from version {} to {}, retrying ({}/{})",
                        id,
                        expected,
                        found,
                        attempt,
                        attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Store a document and derive its page geometry. Malformed documents are
    /// rejected here, before any envelope references them.
    pub fn upload_document(&self, bytes: &[u8]) -> EngineResult<DocumentInfo> {
        let pages = self.compositor.inspect(bytes).map_err(|e| {
            log::debug!("Rejected upload of {} bytes: {}", bytes.len(), e);
            EngineError::Document(e.to_string())
        })?;
        if pages.is_empty() {
            return Err(EngineError::Document("document has no pages".to_string()));
        }
        let key = self.documents.put(bytes)?;
        log::info!("Stored document {} ({} pages)", key, pages.len());
        Ok(DocumentInfo::new(key, pages))
    }

    /// Page geometry of a stored document.
    pub fn document_info(&self, key: &str) -> EngineResult<DocumentInfo> {
        let bytes = self.document(key)?;
        let pages = self
            .compositor
            .inspect(&bytes)
            .map_err(|e| EngineError::Document(e.to_string()))?;
        Ok(DocumentInfo::new(key.to_string(), pages))
    }

    /// The original, unsigned document bytes.
    pub fn document(&self, key: &str) -> EngineResult<Vec<u8>> {
        self.documents.get(key).map_err(|e| match e {
            StorageError::NotFound(_) => EngineError::Document(format!("unknown document {}", key)),
            other => other.into(),
        })
    }

    pub fn create_envelope(
        &self,
        document_key: &str,
        signers: Vec<NewSigner>,
        fields: Vec<FieldSpec>,
        order_mode: OrderMode,
        ctx: &RequestContext,
    ) -> EngineResult<Envelope> {
        let document = self.document_info(document_key)?;
        let (envelope, audit) = Envelope::create(&document, signers, fields, order_mode, ctx, self.clock.now())?;
        self.envelopes.insert(&envelope, &audit)?;
        log::info!(
            "Created envelope {} on document {} for {} signer(s)",
            envelope.id,
            document_key,
            envelope.signers.len()
        );
        Ok(envelope)
    }

    pub fn add_signer(
        &self,
        envelope_id: EnvelopeId,
        signer: NewSigner,
        ctx: &RequestContext,
    ) -> EngineResult<Envelope> {
        let (envelope, _) = self.update(envelope_id, |envelope, now| {
            envelope.add_signer(signer.clone(), ctx, now)
        })?;
        Ok(envelope)
    }

    pub fn place_field(
        &self,
        envelope_id: EnvelopeId,
        spec: FieldSpec,
        ctx: &RequestContext,
    ) -> EngineResult<(Envelope, FieldId)> {
        self.update(envelope_id, |envelope, now| {
            let document = envelope.document();
            envelope.place_field(spec.clone(), &document, ctx, now)
        })
    }

    pub fn activate(&self, envelope_id: EnvelopeId, ctx: &RequestContext) -> EngineResult<Envelope> {
        let (envelope, _) = self.update(envelope_id, |envelope, now| {
            envelope.activate(ctx, now).map(|audit| ((), audit))
        })?;
        log::info!("Envelope {} sent to {} signer(s)", envelope.id, envelope.signers.len());
        self.notify(Event::activated(&envelope));
        Ok(envelope)
    }

    /// Apply a signer's values.
    ///
    /// `expected_version` must match the stored version; on mismatch nothing
    /// is applied and the caller has to re-read. When the submission fills the
    /// last required field the artifact is rendered before anything is
    /// committed, so a failed render leaves the envelope as it was.
    pub fn submit_fields(
        &self,
        envelope_id: EnvelopeId,
        signer_id: SignerId,
        values: &BTreeMap<FieldId, RawValue>,
        expected_version: u64,
        ctx: &RequestContext,
    ) -> EngineResult<Envelope> {
        let mut envelope = self.load(envelope_id)?;
        let submission = envelope
            .submit(
                signer_id,
                values,
                expected_version,
                &self.config.validation,
                ctx,
                self.clock.now(),
            )
            .inspect_err(|e| {
                log::debug!("Rejected submission by {} on envelope {}: {}", signer_id, envelope_id, e);
            })?;

        if submission.completed {
            let artifact = self.with_finalize_lock(envelope_id, || {
                let stored = self.load(envelope_id)?;
                if stored.version != expected_version {
                    return Err(EngineError::Conflict {
                        expected: expected_version,
                        found: stored.version,
                    });
                }
                let artifact = self.render_cached(&envelope)?;
                envelope.artifact_hash = Some(artifact.hash.clone());
                self.envelopes.commit(&envelope, expected_version, &submission.audit)?;
                Ok(artifact)
            })?;
            log::info!(
                "Envelope {} completed, artifact {} ({} bytes)",
                envelope_id,
                artifact.hash,
                artifact.bytes.len()
            );
            if submission.signer_completed {
                self.notify(Event::SignerCompleted { envelope_id, signer_id });
            }
            self.notify(Event::EnvelopeCompleted {
                envelope_id,
                artifact_hash: artifact.hash,
            });
            return Ok(envelope);
        }

        self.envelopes.commit(&envelope, expected_version, &submission.audit)?;
        log::info!(
            "Signer {} filled {} field(s) on envelope {} (version {})",
            signer_id,
            submission.filled.len(),
            envelope_id,
            envelope.version
        );
        if submission.signer_completed {
            self.notify(Event::SignerCompleted { envelope_id, signer_id });
        }
        Ok(envelope)
    }

    pub fn decline(
        &self,
        envelope_id: EnvelopeId,
        signer_id: SignerId,
        reason: &str,
        ctx: &RequestContext,
    ) -> EngineResult<Envelope> {
        let (envelope, _) = self.update(envelope_id, |envelope, now| {
            envelope.decline(signer_id, reason, ctx, now).map(|audit| ((), audit))
        })?;
        log::info!("Envelope {} declined by {}", envelope_id, signer_id);
        self.notify(Event::EnvelopeDeclined {
            envelope_id,
            signer_id,
            reason: reason.to_string(),
        });
        Ok(envelope)
    }

    pub fn void(&self, envelope_id: EnvelopeId, actor_id: &str, ctx: &RequestContext) -> EngineResult<Envelope> {
        let (envelope, _) = self.update(envelope_id, |envelope, now| {
            envelope.void(actor_id, ctx, now).map(|audit| ((), audit))
        })?;
        log::info!("Envelope {} voided by {}", envelope_id, actor_id);
        self.notify(Event::EnvelopeVoided {
            envelope_id,
            actor: actor_id.to_string(),
        });
        Ok(envelope)
    }

    pub fn get_state(&self, envelope_id: EnvelopeId) -> EngineResult<Envelope> {
        self.load(envelope_id)
    }

    /// The signed artifact of a completed envelope.
    pub fn get_artifact(&self, envelope_id: EnvelopeId) -> EngineResult<RenderedArtifact> {
        let envelope = self.load(envelope_id)?;
        if envelope.status != EnvelopeStatus::Completed {
            return Err(EngineError::NotReady {
                status: envelope.status,
            });
        }
        if let Some(hash) = &envelope.artifact_hash {
            match self.artifacts.get(hash) {
                Ok(bytes) => {
                    return Ok(RenderedArtifact {
                        hash: hash.clone(),
                        bytes,
                    });
                }
                Err(StorageError::NotFound(_)) => {
                    log::warn!("Artifact {} for envelope {} is missing, re-rendering", hash, envelope_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.finalize(envelope_id)
    }

    /// Render (or fetch from cache) the artifact of a completed envelope.
    /// Safe to call repeatedly: the output is identical every time.
    pub fn finalize(&self, envelope_id: EnvelopeId) -> EngineResult<RenderedArtifact> {
        self.with_finalize_lock(envelope_id, || {
            let envelope = self.load(envelope_id)?;
            if envelope.status != EnvelopeStatus::Completed {
                return Err(EngineError::NotReady {
                    status: envelope.status,
                });
            }
            let artifact = self.render_cached(&envelope)?;
            if envelope.artifact_hash.as_deref() != Some(artifact.hash.as_str()) {
                log::warn!(
                    "Envelope {} recorded artifact {:?} but renders to {}",
                    envelope_id,
                    envelope.artifact_hash,
                    artifact.hash
                );
            }
            Ok(artifact)
        })
    }

    pub fn audit_trail(&self, envelope_id: EnvelopeId) -> EngineResult<Vec<AuditEntry>> {
        self.envelopes.audit_log(envelope_id).map_err(|e| match e {
            StorageError::NotFound(_) => EngineError::NotFound(envelope_id),
            other => other.into(),
        })
    }

    /// Resolve a signing token to the signer and their fields.
    pub fn signing_view(&self, token: &str) -> EngineResult<SigningView> {
        let (envelope, signer_id) = self
            .envelopes
            .find_signer_by_token(token)?
            .ok_or(EngineError::UnknownToken)?;
        let signer = envelope
            .signer(signer_id)
            .cloned()
            .ok_or(EngineError::UnknownSigner(signer_id))?;
        let fields = envelope.fields_for(signer_id).cloned().collect();
        let can_submit = matches!(envelope.status, EnvelopeStatus::Sent | EnvelopeStatus::InProgress)
            && envelope.may_submit(signer_id);
        Ok(SigningView {
            envelope_id: envelope.id,
            status: envelope.status,
            version: envelope.version,
            document_key: envelope.document_key.clone(),
            signer,
            fields,
            can_submit,
        })
    }

    pub fn list_envelopes(&self) -> EngineResult<Vec<EnvelopeId>> {
        Ok(self.envelopes.list()?)
    }

    /// Run `op` holding the envelope's finalize lock. The lock entry is
    /// dropped again once no other caller holds or waits on it.
    fn with_finalize_lock<T>(&self, envelope_id: EnvelopeId, op: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
        let lock = self
            .finalize_locks
            .entry(envelope_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op()
        };
        drop(lock);
        self.finalize_locks
            .remove_if(&envelope_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Fetch the artifact for this envelope's content hash, rendering it only
    /// if the cache does not have it.
    fn render_cached(&self, envelope: &Envelope) -> EngineResult<RenderedArtifact> {
        let hash = content_hash(envelope);
        match self.artifacts.get(&hash) {
            Ok(bytes) => {
                log::debug!("Artifact {} served from cache", hash);
                return Ok(RenderedArtifact { hash, bytes });
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let document = self.documents.get(&envelope.document_key)?;
        let bytes = self
            .compositor
            .render(&RenderRequest::for_envelope(envelope, &document))
            .inspect_err(|e| {
                log::error!(
                    "Render failed for envelope {} on validated input: {}",
                    envelope.id,
                    e
                );
            })?;
        self.artifacts.put_at(&hash, &bytes)?;
        Ok(RenderedArtifact { hash, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::clock::FixedClock;
    use crate::field::FieldKind;
    use crate::geometry::{NormalizedRect, PageDims};
    use crate::notify::{NotifyError, RecordingNotifier};
    use crate::render::RenderError;
    use crate::stroke::Stroke;
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    /// Accepts `FAKE<n>` documents with `n` letter pages; renders a summary.
    #[derive(Default)]
    struct FakeCompositor {
        renders: AtomicUsize,
        inspections: AtomicUsize,
        fail: AtomicBool,
    }

    impl Compositor for FakeCompositor {
        fn inspect(&self, document: &[u8]) -> Result<Vec<PageDims>, RenderError> {
            self.inspections.fetch_add(1, Ordering::SeqCst);
            match document {
                [b'F', b'A', b'K', b'E', n] => Ok(vec![PageDims::letter(); (*n - b'0') as usize]),
                _ => Err(RenderError::InvalidDocument("not a fake document".to_string())),
            }
        }

        fn render(&self, request: &RenderRequest<'_>) -> Result<Vec<u8>, RenderError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RenderError::InvalidDocument("boom".to_string()));
            }
            self.renders.fetch_add(1, Ordering::SeqCst);
            let filled = request.fields.iter().filter(|f| f.is_filled()).count();
            Ok(format!("rendered {} with {} fields", request.document_key, filled).into_bytes())
        }
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn notify(&self, _event: &Event) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("smtp down".to_string()))
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        compositor: Arc<FakeCompositor>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let compositor = Arc::new(FakeCompositor::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(FixedClock::new(
            DateTime::parse_from_rfc3339("2025-06-01T09:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ));
        let engine = Engine::in_memory(compositor.clone())
            .with_notifier(notifier.clone())
            .with_clock(clock);
        Harness {
            engine: Arc::new(engine),
            compositor,
            notifier,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("owner@example.com")
    }

    fn rect(y: f64) -> NormalizedRect {
        NormalizedRect::new(0.1, y, 0.3, 0.08)
    }

    fn signature() -> RawValue {
        RawValue::Strokes(vec![Stroke::from_xy(&[(0.0, 0.0), (4.0, 2.0), (8.0, 0.5)])])
    }

    /// Envelope with one required signature per signer, already activated.
    fn sent_envelope(h: &Harness, mode: OrderMode, count: usize) -> (Envelope, Vec<(SignerId, FieldId)>) {
        let doc = h.engine.upload_document(b"FAKE2").unwrap();
        let mut signers = Vec::new();
        let mut fields = Vec::new();
        let mut pairs = Vec::new();
        for i in 0..count {
            let signer = NewSigner::new(format!("Signer {}", i), format!("s{}@example.com", i))
                .with_sequence(i as u32 + 1);
            let field_id = uuid::Uuid::new_v4();
            fields.push(
                FieldSpec::new(FieldKind::Signature, i % 2, rect(0.1 * (i + 1) as f64), signer.id).with_id(field_id),
            );
            pairs.push((signer.id, field_id));
            signers.push(signer);
        }
        let envelope = h
            .engine
            .create_envelope(&doc.key, signers, fields, mode, &ctx())
            .unwrap();
        let envelope = h.engine.activate(envelope.id, &ctx()).unwrap();
        (envelope, pairs)
    }

    fn one(field: FieldId, value: RawValue) -> BTreeMap<FieldId, RawValue> {
        BTreeMap::from([(field, value)])
    }

    #[test]
    fn test_upload_rejects_malformed_document() {
        let h = harness();
        let result = h.engine.upload_document(b"%PDF-garbage");
        assert!(matches!(result, Err(EngineError::Document(_))));
        let result = h.engine.upload_document(b"FAKE0");
        assert!(matches!(result, Err(EngineError::Document(_))));
    }

    #[test]
    fn test_create_on_unknown_document() {
        let h = harness();
        let result = h
            .engine
            .create_envelope("missing", vec![], vec![], OrderMode::Parallel, &ctx());
        assert!(matches!(result, Err(EngineError::Document(_))));
    }

    #[test]
    fn test_full_parallel_flow() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Parallel, 2);
        assert_eq!(envelope.status, EnvelopeStatus::Sent);
        assert!(matches!(
            h.engine.get_artifact(envelope.id),
            Err(EngineError::NotReady { status: EnvelopeStatus::Sent })
        ));

        let (b, b_field) = pairs[1];
        let after_b = h
            .engine
            .submit_fields(envelope.id, b, &one(b_field, signature()), envelope.version, &ctx())
            .unwrap();
        assert_eq!(after_b.status, EnvelopeStatus::InProgress);
        assert_eq!(after_b.version, envelope.version + 1);

        let (a, a_field) = pairs[0];
        let done = h
            .engine
            .submit_fields(envelope.id, a, &one(a_field, signature()), after_b.version, &ctx())
            .unwrap();
        assert_eq!(done.status, EnvelopeStatus::Completed);
        assert!(done.artifact_hash.is_some());

        let artifact = h.engine.get_artifact(envelope.id).unwrap();
        assert_eq!(Some(artifact.hash.clone()), done.artifact_hash);
        assert_eq!(artifact.bytes, format!("rendered {} with 2 fields", done.document_key).into_bytes());

        let names: Vec<_> = h.notifier.events().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["envelope_activated", "signer_completed", "signer_completed", "envelope_completed"]
        );
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Parallel, 1);
        let (signer, field) = pairs[0];
        h.engine
            .submit_fields(envelope.id, signer, &one(field, signature()), envelope.version, &ctx())
            .unwrap();

        let first = h.engine.finalize(envelope.id).unwrap();
        let second = h.engine.finalize(envelope.id).unwrap();
        assert_eq!(first, second);
        assert_eq!(h.compositor.renders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalize_locks_are_released() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Parallel, 1);
        let (signer, field) = pairs[0];
        h.engine
            .submit_fields(envelope.id, signer, &one(field, signature()), envelope.version, &ctx())
            .unwrap();
        assert!(h.engine.finalize_locks.is_empty());

        h.engine.finalize(envelope.id).unwrap();
        assert!(h.engine.finalize_locks.is_empty());

        let (pending, _) = sent_envelope(&h, OrderMode::Parallel, 1);
        assert!(h.engine.finalize(pending.id).is_err());
        assert!(h.engine.finalize_locks.is_empty());
    }

    #[test]
    fn test_corrupt_image_is_rejected_at_submission() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Parallel, 2);
        let (a, a_field) = pairs[0];
        let (b, b_field) = pairs[1];

        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(b"garbage after the signature");
        let url = format!("data:image/png;base64,{}", STANDARD.encode(&bytes));
        let result = h
            .engine
            .submit_fields(envelope.id, a, &one(a_field, url.as_str().into()), envelope.version, &ctx());
        match result {
            Err(EngineError::Validation(errors)) => {
                assert_eq!(errors.0.len(), 1);
                assert_eq!(errors.0[0].field_id, a_field);
            }
            other => panic!("expected a validation error, got {:?}", other),
        }
        assert_eq!(h.engine.get_state(envelope.id).unwrap(), envelope);

        let after_b = h
            .engine
            .submit_fields(envelope.id, b, &one(b_field, signature()), envelope.version, &ctx())
            .unwrap();
        let done = h
            .engine
            .submit_fields(envelope.id, a, &one(a_field, signature()), after_b.version, &ctx())
            .unwrap();
        assert_eq!(done.status, EnvelopeStatus::Completed);
    }

    #[test]
    fn test_place_field_uses_recorded_pages() {
        let h = harness();
        let doc = h.engine.upload_document(b"FAKE2").unwrap();
        let signer = NewSigner::new("Ada", "ada@example.com");
        let signer_id = signer.id;
        let envelope = h
            .engine
            .create_envelope(&doc.key, vec![signer], vec![], OrderMode::Parallel, &ctx())
            .unwrap();
        assert_eq!(envelope.pages, doc.pages);
        let inspected = h.compositor.inspections.load(Ordering::SeqCst);

        h.engine
            .place_field(envelope.id, FieldSpec::new(FieldKind::Date, 1, rect(0.2), signer_id), &ctx())
            .unwrap();
        let off_document = FieldSpec::new(FieldKind::Date, 2, rect(0.2), signer_id);
        assert!(matches!(
            h.engine.place_field(envelope.id, off_document, &ctx()),
            Err(EngineError::OutOfBounds(_))
        ));
        assert_eq!(h.compositor.inspections.load(Ordering::SeqCst), inspected);
    }

    #[test]
    fn test_sequential_order_through_engine() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Sequential, 2);
        let (a, a_field) = pairs[0];
        let (b, b_field) = pairs[1];

        let result = h
            .engine
            .submit_fields(envelope.id, b, &one(b_field, signature()), envelope.version, &ctx());
        assert!(matches!(result, Err(EngineError::OrderViolation { .. })));
        assert_eq!(h.engine.get_state(envelope.id).unwrap().version, envelope.version);

        let view = h
            .engine
            .signing_view(&envelope.signer(b).unwrap().access_token)
            .unwrap();
        assert!(!view.can_submit);

        let after_a = h
            .engine
            .submit_fields(envelope.id, a, &one(a_field, signature()), envelope.version, &ctx())
            .unwrap();
        let view = h
            .engine
            .signing_view(&envelope.signer(b).unwrap().access_token)
            .unwrap();
        assert!(view.can_submit);
        assert_eq!(view.fields.len(), 1);
        assert_eq!(view.fields[0].id, b_field);

        let done = h
            .engine
            .submit_fields(envelope.id, b, &one(b_field, signature()), after_a.version, &ctx())
            .unwrap();
        assert_eq!(done.status, EnvelopeStatus::Completed);
    }

    #[test]
    fn test_concurrent_submissions_one_wins() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Parallel, 3);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = pairs[..2]
            .iter()
            .copied()
            .map(|(signer, field)| {
                let engine = h.engine.clone();
                let barrier = barrier.clone();
                let version = envelope.version;
                let id = envelope.id;
                thread::spawn(move || {
                    barrier.wait();
                    engine.submit_fields(id, signer, &one(field, signature()), version, &RequestContext::new("racer"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::Conflict { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);

        let state = h.engine.get_state(envelope.id).unwrap();
        assert_eq!(state.version, envelope.version + 1);
        assert_eq!(state.fields.iter().filter(|f| f.is_filled()).count(), 1);
    }

    #[test]
    fn test_concurrent_completions_render_once() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Parallel, 1);
        let (signer, field) = pairs[0];
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = h.engine.clone();
                let barrier = barrier.clone();
                let (id, version) = (envelope.id, envelope.version);
                thread::spawn(move || {
                    barrier.wait();
                    engine.submit_fields(id, signer, &one(field, signature()), version, &RequestContext::new("racer"))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(h.compositor.renders.load(Ordering::SeqCst), 1);

        let completions = h
            .engine
            .audit_trail(envelope.id)
            .unwrap()
            .iter()
            .filter(|e| e.action == AuditAction::Completed)
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn test_render_failure_persists_nothing() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Parallel, 1);
        let (signer, field) = pairs[0];
        h.compositor.fail.store(true, Ordering::SeqCst);

        let result = h
            .engine
            .submit_fields(envelope.id, signer, &one(field, signature()), envelope.version, &ctx());
        assert!(matches!(result, Err(EngineError::Render(_))));
        let state = h.engine.get_state(envelope.id).unwrap();
        assert_eq!(state, envelope);
        assert_eq!(h.engine.audit_trail(envelope.id).unwrap().len(), 2);

        h.compositor.fail.store(false, Ordering::SeqCst);
        let done = h
            .engine
            .submit_fields(envelope.id, signer, &one(field, signature()), envelope.version, &ctx())
            .unwrap();
        assert_eq!(done.status, EnvelopeStatus::Completed);
    }

    #[test]
    fn test_notification_failure_does_not_roll_back() {
        let compositor = Arc::new(FakeCompositor::default());
        let engine = Engine::in_memory(compositor).with_notifier(Arc::new(FailingNotifier));
        let doc = engine.upload_document(b"FAKE1").unwrap();
        let signer = NewSigner::new("Ada", "ada@example.com");
        let fields = vec![FieldSpec::new(FieldKind::Initial, 0, rect(0.5), signer.id)];
        let envelope = engine
            .create_envelope(&doc.key, vec![signer], fields, OrderMode::Parallel, &ctx())
            .unwrap();
        let envelope = engine.activate(envelope.id, &ctx()).unwrap();
        assert_eq!(engine.get_state(envelope.id).unwrap().status, EnvelopeStatus::Sent);
    }

    #[test]
    fn test_decline_and_void() {
        let h = harness();
        let (envelope, pairs) = sent_envelope(&h, OrderMode::Parallel, 2);
        let declined = h
            .engine
            .decline(envelope.id, pairs[0].0, "terms changed", &ctx())
            .unwrap();
        assert_eq!(declined.status, EnvelopeStatus::Declined);
        assert!(matches!(
            h.engine.void(envelope.id, "admin", &ctx()),
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(
            h.engine.finalize(envelope.id),
            Err(EngineError::NotReady { status: EnvelopeStatus::Declined })
        ));
        assert!(h
            .notifier
            .events()
            .iter()
            .any(|e| matches!(e, Event::EnvelopeDeclined { reason, .. } if reason == "terms changed")));
    }

    #[test]
    fn test_setup_through_engine() {
        let h = harness();
        let doc = h.engine.upload_document(b"FAKE1").unwrap();
        let envelope = h
            .engine
            .create_envelope(&doc.key, vec![], vec![], OrderMode::Parallel, &ctx())
            .unwrap();
        assert!(matches!(
            h.engine.activate(envelope.id, &ctx()),
            Err(EngineError::IncompleteSetup(_))
        ));

        let signer = NewSigner::new("Ada", "ada@example.com");
        let signer_id = signer.id;
        h.engine.add_signer(envelope.id, signer, &ctx()).unwrap();
        let bad = FieldSpec::new(FieldKind::Date, 0, NormalizedRect::new(0.9, 0.9, 0.3, 0.3), signer_id);
        assert!(matches!(
            h.engine.place_field(envelope.id, bad, &ctx()),
            Err(EngineError::OutOfBounds(_))
        ));
        let (_, field_id) = h
            .engine
            .place_field(envelope.id, FieldSpec::new(FieldKind::Date, 0, rect(0.2), signer_id), &ctx())
            .unwrap();
        let sent = h.engine.activate(envelope.id, &ctx()).unwrap();
        assert_eq!(sent.version, 4);
        assert!(sent.field(field_id).is_some());

        let actions: Vec<_> = h
            .engine
            .audit_trail(envelope.id)
            .unwrap()
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Created,
                AuditAction::SignerAdded,
                AuditAction::FieldPlaced,
                AuditAction::Sent
            ]
        );
    }

    #[test]
    fn test_unknown_envelope_and_token() {
        let h = harness();
        let id = uuid::Uuid::new_v4();
        assert!(matches!(h.engine.get_state(id), Err(EngineError::NotFound(_))));
        assert!(matches!(h.engine.audit_trail(id), Err(EngineError::NotFound(_))));
        assert!(matches!(h.engine.signing_view("nope"), Err(EngineError::UnknownToken)));
    }
}
