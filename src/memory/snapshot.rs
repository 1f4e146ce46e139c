//! Durable persistence for the memory store.
//!
//! Messages, the embedding index, tier state and the user profile are
//! written together as one versioned MessagePack snapshot under a single
//! blob key. The file blob store replaces that blob atomically, so a crash
//! mid-write leaves the previous snapshot intact.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::tier::TierConfig;
use super::types::{StoredMessage, TextEmbedding, UserContext};
use crate::error::{MemoryError, Result};
use crate::fs_util::{atomic_write, set_secure_dir_permissions};

pub const SNAPSHOT_KEY: &str = "memory.snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Key to bytes persistence.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob. A missing blob is `Ok(None)`, not an error.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a blob in full.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Blob store backed by one file per key inside a directory.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(MemoryError::Storage(format!("invalid blob key: {key:?}")));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoryError::Storage(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            MemoryError::Storage(format!("failed to create {}: {e}", self.dir.display()))
        })?;
        set_secure_dir_permissions(&self.dir)?;
        atomic_write(&path, bytes)
            .await
            .map_err(|e| MemoryError::Storage(format!("failed to write {}: {e}", path.display())))
    }
}

/// Process-local blob store, used in tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| MemoryError::Storage("blob store lock poisoned".into()))?;
        Ok(blobs.get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| MemoryError::Storage("blob store lock poisoned".into()))?;
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Borrowed view written on every mutation, avoiding a deep clone of the index.
#[derive(Serialize)]
pub struct SnapshotRef<'a> {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub messages: &'a [StoredMessage],
    pub embeddings: &'a HashMap<String, TextEmbedding>,
    pub tier: &'a TierConfig,
    pub user_context: Option<&'a UserContext>,
}

/// Owned snapshot read back at startup.
#[derive(Debug, Deserialize)]
pub struct MemorySnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub embeddings: HashMap<String, TextEmbedding>,
    #[serde(default)]
    pub tier: Option<TierConfig>,
    #[serde(default)]
    pub user_context: Option<UserContext>,
}

/// Counts of records dropped while reconciling a loaded snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub orphaned_embeddings: usize,
    pub messages_without_embedding: usize,
}

pub fn encode(snapshot: &SnapshotRef<'_>) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(snapshot).map_err(|e| MemoryError::Serialization(e.to_string()))
}

/// Only the version field, read before committing to the full layout.
#[derive(Deserialize)]
struct SnapshotHeader {
    version: u32,
}

/// Result of reading a persisted snapshot.
#[derive(Debug)]
pub enum Decoded {
    Current(MemorySnapshot),
    /// Written by an incompatible format version. The bytes were not parsed
    /// further.
    Unsupported { version: u32 },
}

/// Blob key under which an unsupported snapshot is kept before the store
/// writes a fresh one.
pub fn preserved_key(version: u32) -> String {
    format!("{SNAPSHOT_KEY}.v{version}")
}

pub fn decode(bytes: &[u8]) -> Result<Decoded> {
    let header: SnapshotHeader =
        rmp_serde::from_slice(bytes).map_err(|e| MemoryError::Serialization(e.to_string()))?;
    if header.version != SNAPSHOT_VERSION {
        warn!(
            expected = SNAPSHOT_VERSION,
            found = header.version,
            "unsupported snapshot version"
        );
        return Ok(Decoded::Unsupported {
            version: header.version,
        });
    }

    let snapshot: MemorySnapshot =
        rmp_serde::from_slice(bytes).map_err(|e| MemoryError::Serialization(e.to_string()))?;
    Ok(Decoded::Current(snapshot))
}

impl MemorySnapshot {
    /// Drop message embeddings whose message is gone and messages whose
    /// embedding is gone. User-fact embeddings are always kept.
    pub fn reconcile(&mut self) -> Reconciled {
        let mut report = Reconciled::default();

        let before = self.messages.len();
        let embeddings = &self.embeddings;
        self.messages.retain(|stored| {
            embeddings
                .get(&stored.embedding_id)
                .is_some_and(|e| e.kind.is_message())
        });
        report.messages_without_embedding = before - self.messages.len();

        let referenced: std::collections::HashSet<&str> = self
            .messages
            .iter()
            .map(|stored| stored.embedding_id.as_str())
            .collect();
        let orphaned: Vec<String> = self
            .embeddings
            .iter()
            .filter(|(id, e)| e.kind.is_message() && !referenced.contains(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &orphaned {
            self.embeddings.remove(id);
        }
        report.orphaned_embeddings = orphaned.len();

        if report != Reconciled::default() {
            debug!(?report, "reconciled snapshot");
        }
        report
    }
}
