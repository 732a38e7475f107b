//! Shared state store client interface.
//!
//! The store is the only mutable resource shared between workers, so every
//! mutation it exposes is an atomic conditional operation: set-if-absent
//! for dedup claims, revision-guarded puts for thread documents, and a
//! single-transaction absorb for merges. Nothing here hands out locks that
//! survive a round trip.
//!
//! The trait is consumed generically (workers are spawned tasks), so every
//! method promises a `Send` future.

use std::future::Future;

use thiserror::Error;

use crate::models::{DeadLetter, DedupEntry, ThreadDocument, ThreadKey};

pub mod postgres;

pub use postgres::PgStateStore;

/// Result of a set-if-absent dedup claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This worker now owns the fingerprint and proceeds to threading.
    Claimed,
    /// The fingerprint was claimed earlier; the message id it resolved to.
    AlreadyClaimed(String),
}

/// Result of a revision-conditional thread write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PutOutcome {
    Applied,
    /// The stored revision moved; re-read and retry.
    Conflict,
}

/// Store failures, classified so the worker state machine can tell
/// redeliverable conditions from bugs.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the failure is worth leaving the message unacknowledged for
    /// broker redelivery rather than dead-lettering.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout => true,
            StoreError::Database(err) => !matches!(err, sqlx::Error::RowNotFound),
            StoreError::Serialization(_) => false,
        }
    }
}

/// Narrow client interface over the externally shared store.
///
/// Implementations: [`PgStateStore`] for production, the in-memory store in
/// `test_support` for unit tests.
pub trait StateStore: Send + Sync + 'static {
    /// Set-if-absent dedup claim: one indivisible check-then-set.
    ///
    /// Returns [`ClaimOutcome::AlreadyClaimed`] with the existing entry's
    /// message id when the fingerprint was claimed before. Entries are
    /// immutable after creation, so reading the loser back separately is
    /// race-free.
    fn claim_fingerprint(
        &self,
        entry: &DedupEntry,
    ) -> impl Future<Output = Result<ClaimOutcome, StoreError>> + Send;

    /// Read a thread document by key.
    fn get_thread(
        &self,
        key: &ThreadKey,
    ) -> impl Future<Output = Result<Option<ThreadDocument>, StoreError>> + Send;

    /// Revision-conditional upsert of a thread document.
    ///
    /// `doc.revision == 1` inserts if absent; otherwise the write applies
    /// only when the stored revision is `doc.revision - 1`. The message
    /// index entries for `indexed_ids` (members and placeholder slots) are
    /// synchronized in the same transaction.
    fn put_thread(
        &self,
        doc: &ThreadDocument,
        indexed_ids: &[String],
    ) -> impl Future<Output = Result<PutOutcome, StoreError>> + Send;

    /// Absorb `absorbed_key` into `absorbing` in one transaction: write the
    /// combined document (conditional on both expected revisions), delete
    /// the absorbed document, and rewrite its index entries to the
    /// absorbing key. The only operation that deletes a thread.
    fn merge_threads(
        &self,
        absorbing: &ThreadDocument,
        indexed_ids: &[String],
        absorbed_key: &ThreadKey,
        absorbed_revision: i64,
    ) -> impl Future<Output = Result<PutOutcome, StoreError>> + Send;

    /// Look up every thread holding a slot (member or placeholder) for a
    /// message id. More than one key means those threads share ancestry
    /// and must merge.
    fn lookup_message(
        &self,
        message_id: &str,
    ) -> impl Future<Output = Result<Vec<ThreadKey>, StoreError>> + Send;

    /// Record a terminal, non-retried classification for manual inspection.
    fn record_dead_letter(
        &self,
        dead_letter: &DeadLetter,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Presentation boundary: all canonical thread keys, sorted.
    fn list_thread_keys(&self) -> impl Future<Output = Result<Vec<ThreadKey>, StoreError>> + Send;
}
