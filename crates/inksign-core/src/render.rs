//! Compositor abstraction and render cache keys.

use crate::envelope::{Envelope, Signer};
use crate::field::Field;
use crate::geometry::{OutOfBoundsError, PageDims};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Compositor errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    #[error("Page {page_index} out of range (document has {page_count} pages)")]
    PageOutOfRange { page_index: usize, page_count: usize },
    #[error("Field placement: {0}")]
    Placement(#[from] OutOfBoundsError),
    #[error("Rasterization failed: {0}")]
    Raster(String),
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Everything a compositor needs to produce a signed artifact.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub document_key: &'a str,
    /// The original document bytes, untouched.
    pub document: &'a [u8],
    pub fields: &'a [Field],
    pub signers: &'a [Signer],
}

impl<'a> RenderRequest<'a> {
    pub fn for_envelope(envelope: &'a Envelope, document: &'a [u8]) -> Self {
        Self {
            document_key: &envelope.document_key,
            document,
            fields: &envelope.fields,
            signers: &envelope.signers,
        }
    }

    pub fn signer(&self, field: &Field) -> Option<&'a Signer> {
        self.signers.iter().find(|s| s.id == field.signer_id)
    }
}

/// Final flattened document bytes keyed by [`content_hash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    pub hash: String,
    pub bytes: Vec<u8>,
}

/// Document inspection and compositing.
///
/// Implementations must be deterministic: the same request always yields the
/// same bytes.
pub trait Compositor: Send + Sync {
    /// Parse a document and report the native dimensions of every page.
    fn inspect(&self, document: &[u8]) -> Result<Vec<PageDims>, RenderError>;

    /// Draw every filled field onto the document and return the new bytes.
    fn render(&self, request: &RenderRequest<'_>) -> Result<Vec<u8>, RenderError>;
}

/// SHA-256 over the canonical JSON of everything that affects the render.
///
/// Object keys are sorted (serde_json maps are ordered) and fields are sorted
/// by id, so the hash does not depend on insertion order.
pub fn content_hash(envelope: &Envelope) -> String {
    let mut fields: Vec<&Field> = envelope.fields.iter().collect();
    fields.sort_by_key(|f| f.id);

    let fields: Vec<_> = fields
        .into_iter()
        .map(|f| {
            let signer = envelope.signer(f.signer_id).map(|s| &s.identity);
            json!({
                "id": f.id,
                "kind": f.kind,
                "page": f.page_index,
                "rect": f.rect,
                "value": f.value,
                "signer": signer,
                "stamp": f.stamp,
                "filled_at": f.filled_at,
            })
        })
        .collect();

    let canonical = json!({
        "document_key": envelope.document_key,
        "fields": fields,
    });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RequestContext;
    use crate::document::DocumentInfo;
    use crate::envelope::{NewSigner, OrderMode};
    use crate::field::{FieldKind, FieldSpec, FieldValue};
    use crate::geometry::NormalizedRect;
    use chrono::Utc;

    fn envelope() -> Envelope {
        let document = DocumentInfo::new("doc-key".to_string(), vec![PageDims::letter()]);
        let signer = NewSigner::new("Ada", "ada@example.com");
        let fields = vec![
            FieldSpec::new(FieldKind::Signature, 0, NormalizedRect::new(0.1, 0.1, 0.2, 0.1), signer.id),
            FieldSpec::new(FieldKind::Checkbox, 0, NormalizedRect::new(0.5, 0.5, 0.05, 0.05), signer.id),
        ];
        Envelope::create(&document, vec![signer], fields, OrderMode::Parallel, &RequestContext::system(), Utc::now())
            .unwrap()
            .0
    }

    #[test]
    fn test_hash_ignores_field_order_and_version() {
        let env = envelope();
        let mut reordered = env.clone();
        reordered.fields.reverse();
        reordered.version += 7;
        reordered.updated_at = Utc::now();
        assert_eq!(content_hash(&env), content_hash(&reordered));
        assert_eq!(content_hash(&env).len(), 64);
    }

    #[test]
    fn test_hash_tracks_values() {
        let env = envelope();
        let mut filled = env.clone();
        filled.fields[1].value = Some(FieldValue::Checkbox(true));
        assert_ne!(content_hash(&env), content_hash(&filled));

        let mut renamed = env.clone();
        renamed.signers[0].identity.name = "Ada L.".to_string();
        assert_ne!(content_hash(&env), content_hash(&renamed));
    }
}
