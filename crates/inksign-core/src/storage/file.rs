//! File-based storage implementations.

use super::{BlobKey, BlobStore, EnvelopeStore, StorageError, StorageResult, check_version};
use crate::audit::{AuditEntry, AuditLog};
use crate::envelope::{Envelope, EnvelopeId};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Replace anything that is not safe in a file name.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn ensure_dir(path: &Path) -> StorageResult<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            StorageError::Io(format!("Failed to create storage directory {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

/// Write `bytes` to a sibling temp file of `path` and return the temp path.
fn stage(path: &Path, bytes: &[u8]) -> StorageResult<PathBuf> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .map_err(|e| StorageError::Io(format!("Failed to write {}: {}", tmp.display(), e)))?;
    Ok(tmp)
}

fn publish(staged: &Path, path: &Path) -> StorageResult<()> {
    fs::rename(staged, path)
        .map_err(|e| StorageError::Io(format!("Failed to move {} into place: {}", path.display(), e)))
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let staged = stage(path, bytes)?;
    publish(&staged, path)
}

/// Stems of files in `dir` with the given extension.
fn list_stems(dir: &Path, extension: &str) -> StorageResult<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let entries = fs::read_dir(dir)
        .map_err(|e| StorageError::Io(format!("Failed to read directory: {}", e)))?;

    let mut stems = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == extension).unwrap_or(false) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
    }
    Ok(stems)
}

/// Blob storage as one file per key.
pub struct FileBlobStore {
    base_path: PathBuf,
}

impl FileBlobStore {
    /// Create a store rooted at `base_path`, creating the directory if needed.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        ensure_dir(&base_path)?;
        Ok(Self { base_path })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.blob", sanitize(key)))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(key);
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        fs::read(&path).map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))
    }

    fn put_at(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        write_atomic(&self.blob_path(key), bytes)
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.blob_path(key).exists())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.blob_path(key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| StorageError::Io(format!("Failed to delete {}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<BlobKey>> {
        list_stems(&self.base_path, "blob")
    }
}

/// Envelope storage: `{id}.json` holds the envelope, `{id}.audit.jsonl` its
/// audit trail, one JSON entry per line.
pub struct FileEnvelopeStore {
    base_path: PathBuf,
    /// Serializes writers so compare-and-swap is atomic within this process.
    write_lock: Mutex<()>,
}

impl FileEnvelopeStore {
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        ensure_dir(&base_path)?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn envelope_path(&self, id: EnvelopeId) -> PathBuf {
        self.base_path.join(format!("{}.json", sanitize(&id.to_string())))
    }

    fn audit_path(&self, id: EnvelopeId) -> PathBuf {
        self.base_path.join(format!("{}.audit.jsonl", sanitize(&id.to_string())))
    }

    /// Persist an envelope together with its audit batch. The envelope is
    /// staged first and only moved into place after the audit lines are
    /// written; on any failure the audit file is cut back to its old length
    /// and the stored envelope is left as it was.
    fn persist(&self, envelope: &Envelope, audit: &[AuditEntry]) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(envelope)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let path = self.envelope_path(envelope.id);
        let audit_len = self.audit_len(envelope.id)?;
        let staged = stage(&path, &json)?;

        let result = self
            .append_audit(envelope.id, audit)
            .and_then(|()| publish(&staged, &path));
        if result.is_err() {
            self.roll_back(envelope.id, &staged, audit_len);
        }
        result
    }

    fn audit_len(&self, id: EnvelopeId) -> StorageResult<u64> {
        let path = self.audit_path(id);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::Io(format!("Failed to stat {}: {}", path.display(), e))),
        }
    }

    fn roll_back(&self, id: EnvelopeId, staged: &Path, audit_len: u64) {
        if let Err(e) = fs::remove_file(staged) {
            if e.kind() != ErrorKind::NotFound {
                log::warn!("Failed to remove staged {}: {}", staged.display(), e);
            }
        }
        let path = self.audit_path(id);
        let truncated = OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_len(audit_len));
        match truncated {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::error!(
                "Failed to roll {} back to {} bytes: {}",
                path.display(),
                audit_len,
                e
            ),
        }
    }

    fn append_audit(&self, id: EnvelopeId, entries: &[AuditEntry]) -> StorageResult<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            buf.push(b'\n');
        }
        let path = self.audit_path(id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::Io(format!("Failed to open {}: {}", path.display(), e)))?;
        file.write_all(&buf)
            .map_err(|e| StorageError::Io(format!("Failed to append to {}: {}", path.display(), e)))
    }

    fn read_audit(&self, id: EnvelopeId) -> StorageResult<AuditLog> {
        let path = self.audit_path(id);
        let mut log = AuditLog::new(id);
        if !path.exists() {
            return Ok(log);
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        let entries = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<AuditEntry>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e)))?;
        log.append(&entries)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(log)
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| StorageError::Other(format!("Lock error: {}", e)))
    }
}

impl EnvelopeStore for FileEnvelopeStore {
    fn insert(&self, envelope: &Envelope, audit: &[AuditEntry]) -> StorageResult<()> {
        let _guard = self.lock()?;
        if self.envelope_path(envelope.id).exists() {
            return Err(StorageError::Other(format!(
                "Envelope already exists: {}",
                envelope.id
            )));
        }
        // Validate the batch before touching disk.
        AuditLog::new(envelope.id)
            .append(audit)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        self.persist(envelope, audit)
    }

    fn load(&self, id: EnvelopeId) -> StorageResult<Envelope> {
        let path = self.envelope_path(id);
        if !path.exists() {
            return Err(StorageError::NotFound(id.to_string()));
        }
        let json = fs::read_to_string(&path)
            .map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&json)
            .map_err(|e| StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e)))
    }

    fn commit(&self, envelope: &Envelope, expected_version: u64, audit: &[AuditEntry]) -> StorageResult<()> {
        let _guard = self.lock()?;
        let stored = self.load(envelope.id)?;
        check_version(&stored, expected_version, envelope)?;

        let mut log = self.read_audit(envelope.id)?;
        log.append(audit)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        self.persist(envelope, audit)
    }

    fn audit_log(&self, id: EnvelopeId) -> StorageResult<Vec<AuditEntry>> {
        if !self.envelope_path(id).exists() {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(self.read_audit(id)?.into_entries())
    }

    fn list(&self) -> StorageResult<Vec<EnvelopeId>> {
        // `{id}.audit.jsonl` has extension "jsonl", so only envelopes match.
        Ok(list_stems(&self.base_path, "json")?
            .iter()
            .filter_map(|stem| stem.parse().ok())
            .collect())
    }
}
