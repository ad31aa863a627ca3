//! Storage abstraction for documents, artifacts and envelopes.

mod file;
mod memory;

pub use file::{FileBlobStore, FileEnvelopeStore};
pub use memory::{MemoryBlobStore, MemoryEnvelopeStore};

use crate::audit::AuditEntry;
use crate::envelope::{Envelope, EnvelopeId, SignerId};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Key of a stored blob. Content-addressed keys are lowercase SHA-256 hex.
pub type BlobKey = String;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u64, found: u64 },
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// SHA-256 hex digest of some bytes.
pub fn content_key(bytes: &[u8]) -> BlobKey {
    format!("{:x}", Sha256::digest(bytes))
}

/// Byte storage for original documents and rendered artifacts.
///
/// Implementations can keep blobs in memory, on the local filesystem or in a
/// remote object store.
pub trait BlobStore: Send + Sync {
    /// Read a blob.
    fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Write a blob under an explicit key, replacing any previous value.
    fn put_at(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Check if a blob exists.
    fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Delete a blob. Deleting a missing blob is not an error.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// List all keys.
    fn list(&self) -> StorageResult<Vec<BlobKey>>;

    /// Store bytes under their content hash and return the key.
    fn put(&self, bytes: &[u8]) -> StorageResult<BlobKey> {
        let key = content_key(bytes);
        if !self.exists(&key)? {
            self.put_at(&key, bytes)?;
        }
        Ok(key)
    }
}

/// Persistence for envelope aggregates and their audit trails.
///
/// `commit` is the only way to change a stored envelope: it compares the stored
/// version with `expected_version` and, when they match, replaces the envelope
/// and appends the audit entries as one step.
pub trait EnvelopeStore: Send + Sync {
    /// Store a new envelope with its first audit entries.
    fn insert(&self, envelope: &Envelope, audit: &[AuditEntry]) -> StorageResult<()>;

    /// Load the current envelope.
    fn load(&self, id: EnvelopeId) -> StorageResult<Envelope>;

    /// Compare-and-swap the envelope and append audit entries.
    fn commit(&self, envelope: &Envelope, expected_version: u64, audit: &[AuditEntry]) -> StorageResult<()>;

    /// All audit entries of an envelope, oldest first.
    fn audit_log(&self, id: EnvelopeId) -> StorageResult<Vec<AuditEntry>>;

    /// List all envelope ids.
    fn list(&self) -> StorageResult<Vec<EnvelopeId>>;

    /// Find the envelope and signer a signing token belongs to.
    fn find_signer_by_token(&self, token: &str) -> StorageResult<Option<(Envelope, SignerId)>> {
        for id in self.list()? {
            let envelope = self.load(id)?;
            if let Some(signer_id) = envelope.signer_by_token(token).map(|s| s.id) {
                return Ok(Some((envelope, signer_id)));
            }
        }
        Ok(None)
    }
}

/// Check a commit against the stored version.
fn check_version(stored: &Envelope, expected_version: u64, next: &Envelope) -> StorageResult<()> {
    if stored.version != expected_version {
        return Err(StorageError::VersionMismatch {
            expected: expected_version,
            found: stored.version,
        });
    }
    if next.version <= stored.version {
        return Err(StorageError::Other(format!(
            "commit must advance the version past {}, got {}",
            stored.version, next.version
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key() {
        assert_eq!(
            content_key(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_put_is_content_addressed() {
        let store = MemoryBlobStore::new();
        let a = store.put(b"hello").unwrap();
        let b = store.put(b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.get(&a).unwrap(), b"hello");
    }
}
