//! In-memory storage implementations.

use super::{BlobKey, BlobStore, EnvelopeStore, StorageError, StorageResult, check_version};
use crate::audit::{AuditEntry, AuditLog};
use crate::envelope::{Envelope, EnvelopeId};
use std::collections::HashMap;
use std::sync::RwLock;

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("Lock error: {}", e))
}

/// In-memory blob storage for testing and ephemeral use.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let blobs = self.blobs.read().map_err(lock_error)?;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn put_at(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let mut blobs = self.blobs.write().map_err(lock_error)?;
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        let blobs = self.blobs.read().map_err(lock_error)?;
        Ok(blobs.contains_key(key))
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let mut blobs = self.blobs.write().map_err(lock_error)?;
        blobs.remove(key);
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<BlobKey>> {
        let blobs = self.blobs.read().map_err(lock_error)?;
        Ok(blobs.keys().cloned().collect())
    }
}

/// In-memory envelope storage. One lock covers envelopes and audit logs, so a
/// commit is atomic.
#[derive(Default)]
pub struct MemoryEnvelopeStore {
    envelopes: RwLock<HashMap<EnvelopeId, (Envelope, AuditLog)>>,
}

impl MemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnvelopeStore for MemoryEnvelopeStore {
    fn insert(&self, envelope: &Envelope, audit: &[AuditEntry]) -> StorageResult<()> {
        let mut envelopes = self.envelopes.write().map_err(lock_error)?;
        if envelopes.contains_key(&envelope.id) {
            return Err(StorageError::Other(format!(
                "Envelope already exists: {}",
                envelope.id
            )));
        }
        let mut log = AuditLog::new(envelope.id);
        log.append(audit)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        envelopes.insert(envelope.id, (envelope.clone(), log));
        Ok(())
    }

    fn load(&self, id: EnvelopeId) -> StorageResult<Envelope> {
        let envelopes = self.envelopes.read().map_err(lock_error)?;
        envelopes
            .get(&id)
            .map(|(envelope, _)| envelope.clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    fn commit(&self, envelope: &Envelope, expected_version: u64, audit: &[AuditEntry]) -> StorageResult<()> {
        let mut envelopes = self.envelopes.write().map_err(lock_error)?;
        let (stored, log) = envelopes
            .get_mut(&envelope.id)
            .ok_or_else(|| StorageError::NotFound(envelope.id.to_string()))?;
        check_version(stored, expected_version, envelope)?;
        log.append(audit)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        *stored = envelope.clone();
        Ok(())
    }

    fn audit_log(&self, id: EnvelopeId) -> StorageResult<Vec<AuditEntry>> {
        let envelopes = self.envelopes.read().map_err(lock_error)?;
        envelopes
            .get(&id)
            .map(|(_, log)| log.entries().to_vec())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    fn list(&self) -> StorageResult<Vec<EnvelopeId>> {
        let envelopes = self.envelopes.read().map_err(lock_error)?;
        Ok(envelopes.keys().copied().collect())
    }
}
