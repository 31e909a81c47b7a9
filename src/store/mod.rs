//! Credential store
//!
//! Durable get/set/delete of an opaque string blob by logical key. Keys are
//! sanitized into a safe path alphabet before they reach the backing store,
//! and blobs pass through a [`BlobCodec`] on the way in and out.
//!
//! Two backends are provided:
//! - [`GitHubContentStore`]: a repository file per key, written with
//!   optimistic concurrency on the file's blob sha
//! - [`MemoryStore`]: an in-process versioned map with the same semantics,
//!   for local runs and tests

mod codec;
mod github;
mod memory;

pub use codec::{BlobCodec, TextTransform};
pub use github::{GitHubConfig, GitHubContentStore};
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by a credential store
///
/// "Not found" is never an error: reads return `None` and deletes return
/// `false` for missing keys.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("Write conflict on '{0}': version marker is stale")]
    Conflict(String),

    #[error("Unexpected content at '{path}': {detail}")]
    UnexpectedContent { path: String, detail: String },

    #[error("Failed to decode stored blob: {0}")]
    Decode(String),

    #[error("Persisted credential pool is corrupt: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Whether the failure was a stale optimistic write that may succeed
    /// after re-reading the version marker
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Blob store addressed by logical key
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read the blob stored under `key`, or `None` if absent
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Create or replace the blob stored under `key`
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Returns `false` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Map a logical key to a path the backing store accepts
///
/// Leading and trailing `/` are stripped and every character outside
/// `[A-Za-z0-9-_/.]` becomes `_`.
pub fn sanitize_key(key: &str) -> String {
    key.trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_separators() {
        assert_eq!(sanitize_key("/pools/hf/"), "pools/hf");
        assert_eq!(sanitize_key("///keys"), "keys");
    }

    #[test]
    fn test_sanitize_replaces_disallowed_characters() {
        assert_eq!(sanitize_key("hf keys:v2"), "hf_keys_v2");
        assert_eq!(sanitize_key("a?b#c"), "a_b_c");
        assert_eq!(sanitize_key("huggingface_api_keys"), "huggingface_api_keys");
    }

    #[test]
    fn test_sanitize_keeps_inner_separators_and_dots() {
        assert_eq!(sanitize_key("state/pool.json"), "state/pool.json");
    }

    #[test]
    fn test_conflict_classification() {
        assert!(StorageError::Conflict("k".into()).is_conflict());
        assert!(!StorageError::Decode("bad".into()).is_conflict());
    }
}
