//! In-process versioned store
//!
//! Mirrors the optimistic-write behaviour of the remote backends: every entry
//! carries a version, and a write only lands if the version it observed is
//! still current. Test hooks can simulate an unreachable store or a
//! concurrent writer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{sanitize_key, BlobCodec, CredentialStore, StorageError};

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    blob: String,
}

/// Credential store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    codec: BlobCodec,
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
    pending_conflicts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: BlobCodec) -> Self {
        Self {
            codec,
            ..Self::default()
        }
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Encoded blob as it sits in the store
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries()
            .get(&sanitize_key(key))
            .map(|entry| entry.blob.clone())
    }

    /// Make every operation fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` writes lose the race against another writer
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected {
                status: 503,
                message: "memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn current_version(&self, path: &str) -> Option<u64> {
        self.entries().get(path).map(|entry| entry.version)
    }

    /// Commit `blob` if `observed` still matches the stored version
    fn commit(&self, key: &str, path: String, observed: Option<u64>, blob: String) -> Result<(), StorageError> {
        let mut entries = self.entries();

        let raced = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if raced {
            let entry = entries.entry(path.clone()).or_insert_with(|| Entry {
                version: 0,
                blob: String::new(),
            });
            entry.version += 1;
        }

        let current = entries.get(&path).map(|entry| entry.version);
        if current != observed {
            return Err(StorageError::Conflict(key.to_string()));
        }

        let version = observed.map_or(1, |v| v + 1);
        entries.insert(path, Entry { version, blob });
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        let blob = self.entries().get(&sanitize_key(key)).map(|e| e.blob.clone());
        blob.map(|b| self.codec.decode(&b)).transpose()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        let path = sanitize_key(key);
        let observed = self.current_version(&path);
        self.commit(key, path, observed, self.codec.encode(value))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        Ok(self.entries().remove(&sanitize_key(key)).is_some())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = MemoryStore::new();
        assert!(store.get("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::with_codec(BlobCodec::rot13());
        store.set("/keys/", r#"["hf_a"]"#).await.unwrap();

        assert_eq!(store.get("keys").await.unwrap().as_deref(), Some(r#"["hf_a"]"#));
        assert_ne!(store.raw("keys").as_deref(), Some(r#"["hf_a"]"#));
        assert_eq!(store.write_count(), 1);

        assert!(store.delete("keys").await.unwrap());
        assert!(!store.delete("keys").await.unwrap());
        assert!(store.get("keys").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_conflict_rejects_stale_write() {
        let store = MemoryStore::new();
        store.set("keys", "[]").await.unwrap();
        store.inject_conflicts(1);

        let err = store.set("keys", "[null]").await.unwrap_err();
        assert!(err.is_conflict());

        store.set("keys", "[null]").await.unwrap();
        assert_eq!(store.get("keys").await.unwrap().as_deref(), Some("[null]"));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("keys").await,
            Err(StorageError::Rejected { status: 503, .. })
        ));
    }
}
