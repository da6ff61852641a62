//! SQLite-backed checkpoint store.
//!
//! One row per session in a single database file, WAL-journaled so
//! checkpoint writes never block hydration reads.

use crate::checkpoint::CheckpointStore;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use strata_core::error::StoreError;
use strata_core::session::SessionId;
use tracing::{debug, info};

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Unavailable(format!("invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite checkpoint store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                session_id TEXT PRIMARY KEY,
                payload    BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(format!("checkpoints table: {e}")))?;

        debug!("SQLite checkpoint migrations complete");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn write(&self, session: &SessionId, payload: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (session_id, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session.as_str())
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::RequestFailed(format!("checkpoint write: {e}")))?;

        debug!(session_id = %session, bytes = payload.len(), "Checkpoint written");
        Ok(())
    }

    async fn read(&self, session: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT payload FROM checkpoints WHERE session_id = ?1")
            .bind(session.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::RequestFailed(format!("checkpoint read: {e}")))?;

        match row {
            Some(row) => {
                let payload: Vec<u8> = row
                    .try_get("payload")
                    .map_err(|e| StoreError::Serialization(format!("payload column: {e}")))?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, session: &SessionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?1")
            .bind(session.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::RequestFailed(format!("checkpoint delete: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteCheckpointStore {
        SqliteCheckpointStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let store = test_store().await;
        let session = SessionId::from("session-1");

        assert_eq!(store.read(&session).await.unwrap(), None);
        store.write(&session, b"window state").await.unwrap();
        assert_eq!(
            store.read(&session).await.unwrap(),
            Some(b"window state".to_vec())
        );
    }

    #[tokio::test]
    async fn write_replaces_previous_checkpoint() {
        let store = test_store().await;
        let session = SessionId::from("session-1");

        store.write(&session, b"first").await.unwrap();
        store.write(&session, b"second").await.unwrap();
        assert_eq!(store.read(&session).await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn sessions_do_not_share_checkpoints() {
        let store = test_store().await;
        store
            .write(&SessionId::from("a"), b"alpha")
            .await
            .unwrap();
        store.write(&SessionId::from("b"), b"beta").await.unwrap();

        assert_eq!(
            store.read(&SessionId::from("a")).await.unwrap(),
            Some(b"alpha".to_vec())
        );
        assert_eq!(
            store.read(&SessionId::from("b")).await.unwrap(),
            Some(b"beta".to_vec())
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = test_store().await;
        let session = SessionId::from("session-1");

        store.delete(&session).await.unwrap();
        store.write(&session, b"payload").await.unwrap();
        store.delete(&session).await.unwrap();
        assert_eq!(store.read(&session).await.unwrap(), None);
    }
}
