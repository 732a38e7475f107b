//! PostgreSQL implementation of the shared state store.
//!
//! Dedup claims are `INSERT .. ON CONFLICT DO NOTHING`, thread documents
//! are JSONB rows guarded by a revision column, and merges run as a single
//! transaction so a crash can never leave a half-merged pair visible.
//! Every operation is wrapped in a bounded timeout; a timeout surfaces as
//! a transient failure and the message falls back to broker redelivery.

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;

use crate::models::{DeadLetter, DedupEntry, ThreadDocument, ThreadKey};
use crate::store::{ClaimOutcome, PutOutcome, StateStore, StoreError};

#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgStateStore {
    pub fn new(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn claim_inner(&self, entry: &DedupEntry) -> Result<ClaimOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"INSERT INTO dedup_entries (fingerprint, worker_epoch, message_id, claimed_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (fingerprint) DO NOTHING"#,
        )
        .bind(&entry.fingerprint.digest)
        .bind(entry.worker_epoch)
        .bind(&entry.message_id)
        .bind(entry.claimed_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            log::trace!("claimed fingerprint {}", entry.fingerprint);
            return Ok(ClaimOutcome::Claimed);
        }

        // Entries are immutable after creation, so this read cannot race
        // with a mutation of the winning claim.
        let (message_id,): (String,) =
            sqlx::query_as("SELECT message_id FROM dedup_entries WHERE fingerprint = $1")
                .bind(&entry.fingerprint.digest)
                .fetch_one(&self.pool)
                .await?;

        Ok(ClaimOutcome::AlreadyClaimed(message_id))
    }

    async fn get_thread_inner(&self, key: &ThreadKey) -> Result<Option<ThreadDocument>, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT document FROM threads WHERE key = $1")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((document,)) => Ok(Some(serde_json::from_value(document)?)),
            None => Ok(None),
        }
    }

    async fn put_thread_inner(
        &self,
        doc: &ThreadDocument,
        indexed_ids: &[String],
    ) -> Result<PutOutcome, StoreError> {
        let document = serde_json::to_value(doc)?;
        let mut tx = self.pool.begin().await?;

        let applied = if doc.revision == 1 {
            sqlx::query(
                r#"INSERT INTO threads (key, revision, document)
                   VALUES ($1, 1, $2)
                   ON CONFLICT (key) DO NOTHING"#,
            )
            .bind(doc.key.as_str())
            .bind(&document)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"UPDATE threads
                   SET revision = $2, document = $3, updated_at = NOW()
                   WHERE key = $1 AND revision = $2 - 1"#,
            )
            .bind(doc.key.as_str())
            .bind(doc.revision)
            .bind(&document)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if applied == 0 {
            tx.rollback().await?;
            return Ok(PutOutcome::Conflict);
        }

        sync_index(&mut tx, doc.key.as_str(), indexed_ids).await?;

        tx.commit().await?;
        Ok(PutOutcome::Applied)
    }

    async fn merge_threads_inner(
        &self,
        absorbing: &ThreadDocument,
        indexed_ids: &[String],
        absorbed_key: &ThreadKey,
        absorbed_revision: i64,
    ) -> Result<PutOutcome, StoreError> {
        let document = serde_json::to_value(absorbing)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"UPDATE threads
               SET revision = $2, document = $3, updated_at = NOW()
               WHERE key = $1 AND revision = $2 - 1"#,
        )
        .bind(absorbing.key.as_str())
        .bind(absorbing.revision)
        .bind(&document)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(PutOutcome::Conflict);
        }

        let deleted = sqlx::query("DELETE FROM threads WHERE key = $1 AND revision = $2")
            .bind(absorbed_key.as_str())
            .bind(absorbed_revision)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Ok(PutOutcome::Conflict);
        }

        // Repoint the absorbed thread's index entries. Copy-then-delete
        // instead of UPDATE: a shared slot may already be indexed under
        // the absorbing key.
        sqlx::query(
            r#"INSERT INTO message_index (message_id, thread_key)
               SELECT message_id, $2 FROM message_index WHERE thread_key = $1
               ON CONFLICT DO NOTHING"#,
        )
        .bind(absorbed_key.as_str())
        .bind(absorbing.key.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM message_index WHERE thread_key = $1")
            .bind(absorbed_key.as_str())
            .execute(&mut *tx)
            .await?;

        sync_index(&mut tx, absorbing.key.as_str(), indexed_ids).await?;

        tx.commit().await?;
        Ok(PutOutcome::Applied)
    }

    async fn lookup_message_inner(&self, message_id: &str) -> Result<Vec<ThreadKey>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT thread_key FROM message_index WHERE message_id = $1 ORDER BY thread_key",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(key,)| ThreadKey(key)).collect())
    }

    async fn record_dead_letter_inner(&self, dead_letter: &DeadLetter) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO dead_letters (source_id, reason, payload, recorded_at)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(&dead_letter.source_id)
        .bind(&dead_letter.reason)
        .bind(&dead_letter.payload)
        .bind(dead_letter.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_thread_keys_inner(&self) -> Result<Vec<ThreadKey>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM threads ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(key,)| ThreadKey(key)).collect())
    }
}

/// Insert index entries for the document's slots (first writer wins; merge
/// is the only operation that rewrites existing entries).
async fn sync_index(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    thread_key: &str,
    indexed_ids: &[String],
) -> Result<(), StoreError> {
    sqlx::query(
        r#"INSERT INTO message_index (message_id, thread_key)
           SELECT unnest($1::text[]), $2
           ON CONFLICT DO NOTHING"#,
    )
    .bind(indexed_ids)
    .bind(thread_key)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

impl StateStore for PgStateStore {
    async fn claim_fingerprint(&self, entry: &DedupEntry) -> Result<ClaimOutcome, StoreError> {
        self.bounded(self.claim_inner(entry)).await
    }

    async fn get_thread(&self, key: &ThreadKey) -> Result<Option<ThreadDocument>, StoreError> {
        self.bounded(self.get_thread_inner(key)).await
    }

    async fn put_thread(
        &self,
        doc: &ThreadDocument,
        indexed_ids: &[String],
    ) -> Result<PutOutcome, StoreError> {
        self.bounded(self.put_thread_inner(doc, indexed_ids)).await
    }

    async fn merge_threads(
        &self,
        absorbing: &ThreadDocument,
        indexed_ids: &[String],
        absorbed_key: &ThreadKey,
        absorbed_revision: i64,
    ) -> Result<PutOutcome, StoreError> {
        self.bounded(self.merge_threads_inner(absorbing, indexed_ids, absorbed_key, absorbed_revision))
            .await
    }

    async fn lookup_message(&self, message_id: &str) -> Result<Vec<ThreadKey>, StoreError> {
        self.bounded(self.lookup_message_inner(message_id)).await
    }

    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), StoreError> {
        self.bounded(self.record_dead_letter_inner(dead_letter)).await
    }

    async fn list_thread_keys(&self) -> Result<Vec<ThreadKey>, StoreError> {
        self.bounded(self.list_thread_keys_inner()).await
    }
}
