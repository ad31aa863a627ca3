//! InkSign Core Library
//!
//! The signing-workflow engine: envelopes and their lifecycle, field placement
//! and validation, coordinate mapping, the audit trail, and the storage and
//! compositor seams the engine runs against.

pub mod audit;
pub mod clock;
pub mod config;
pub mod document;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod field;
pub mod geometry;
pub mod notify;
pub mod render;
pub mod storage;
pub mod stroke;

pub use audit::{AuditAction, AuditEntry, AuditLog, RequestContext};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use document::DocumentInfo;
pub use engine::{Engine, SigningView};
pub use envelope::{
    Envelope, EnvelopeId, EnvelopeStatus, EnvelopeView, Identity, NewSigner, OrderMode, Signer, SignerId,
    SignerStatus, SignerView, Submission,
};
pub use error::{EngineError, EngineResult, FieldError, FieldRejection, ValidationErrors};
pub use field::{
    Field, FieldId, FieldKind, FieldSpec, FieldValue, ImageFormat, RawValue, SignatureInput, StampOptions,
    ValidationError, ValidationRules, validate,
};
pub use geometry::{
    EPSILON, FieldFrame, NormalizedRect, OutOfBoundsError, PageDims, PageViewport, Rotation, to_normalized,
    to_page_space,
};
pub use notify::{Event, LogNotifier, Notifier, NotifyError, RecordingNotifier, SigningLink};
pub use render::{Compositor, RenderError, RenderRequest, RenderedArtifact, content_hash};
pub use storage::{
    BlobKey, BlobStore, EnvelopeStore, FileBlobStore, FileEnvelopeStore, MemoryBlobStore, MemoryEnvelopeStore,
    StorageError, StorageResult,
};
pub use stroke::{Stroke, StrokePoint};
