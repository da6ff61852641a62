//! Durable persistence for active window state.
//!
//! The active window tier serializes its window after every mutation
//! and hands the bytes here; on cold start it reads them back. The
//! payload is opaque to the store.

use async_trait::async_trait;
use std::path::PathBuf;
use strata_core::error::StoreError;
use strata_core::session::SessionId;
use tracing::debug;

/// One durable blob per session.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Backend name for logs and response metadata.
    fn name(&self) -> &str;

    /// Persist the latest checkpoint, replacing any previous one.
    async fn write(&self, session: &SessionId, payload: &[u8]) -> Result<(), StoreError>;

    /// Read the latest checkpoint, `None` if the session has none.
    async fn read(&self, session: &SessionId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Drop the session's checkpoint. Deleting a missing one is not an
    /// error.
    async fn delete(&self, session: &SessionId) -> Result<(), StoreError>;
}

// ── File-backed store ────────────────────────────────────────────────

/// One file per session under a spool directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session: &SessionId) -> PathBuf {
        // Session ids are caller-supplied; flatten anything that is not
        // filename-safe so they cannot escape the spool directory.
        let safe: String = session
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.ckpt"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, session: &SessionId, payload: &[u8]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Unavailable(format!("checkpoint dir: {e}")))?;

        let path = self.path_for(session);
        // Write-then-rename so a crash mid-write never leaves a torn
        // checkpoint behind.
        let tmp = path.with_extension("ckpt.tmp");
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| StoreError::Unavailable(format!("checkpoint write: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("checkpoint rename: {e}")))?;

        debug!(session_id = %session, bytes = payload.len(), "Checkpoint written");
        Ok(())
    }

    async fn read(&self, session: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(session)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Unavailable(format!("checkpoint read: {e}"))),
        }
    }

    async fn delete(&self, session: &SessionId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(session)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Unavailable(format!("checkpoint delete: {e}"))),
        }
    }
}

impl std::fmt::Debug for FileCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCheckpointStore")
            .field("dir", &self.dir.display())
            .finish()
    }
}

// ── No-op store ──────────────────────────────────────────────────────

/// Discards checkpoints. For deployments that accept losing the active
/// window on restart, and for tests that do not exercise durability.
#[derive(Debug, Default)]
pub struct NoopCheckpointStore;

impl NoopCheckpointStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CheckpointStore for NoopCheckpointStore {
    fn name(&self) -> &str {
        "none"
    }

    async fn write(&self, _session: &SessionId, _payload: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn read(&self, _session: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }

    async fn delete(&self, _session: &SessionId) -> Result<(), StoreError> {
        Ok(())
    }
}
