//! Queue consumption interface.
//!
//! Pull-based, one message at a time per worker, with explicit
//! acknowledgment. A pulled message is held under a time-bounded lease;
//! ack removes it, release returns it early, and lease expiry redelivers
//! it if the worker crashes. `delivery_count` feeds the poison-message
//! guard in the worker.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::models::QueueEnvelope;

pub mod postgres;

pub use postgres::PgQueue;

/// One leased message as seen by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: i64,
    pub envelope: QueueEnvelope,
    /// How many times this message has been delivered, this one included.
    pub delivery_count: i32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue operation timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("envelope serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Message queue boundary: at-least-once delivery, explicit ack.
///
/// Implementations: [`PgQueue`] for production, the in-memory queue in
/// `test_support` for unit tests.
pub trait MessageQueue: Send + Sync + 'static {
    /// Producer boundary: append one envelope, returning its id.
    fn enqueue(
        &self,
        envelope: &QueueEnvelope,
    ) -> impl Future<Output = Result<i64, QueueError>> + Send;

    /// Claim the next deliverable message under `lease`, or `None` when
    /// the queue is empty.
    fn pull(
        &self,
        lease: Duration,
    ) -> impl Future<Output = Result<Option<Delivery>, QueueError>> + Send;

    /// Acknowledge successful processing; the message is gone for good.
    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Return a message to the deliverable pool after `delay`.
    fn release(
        &self,
        delivery: &Delivery,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Unacknowledged messages, leased ones included. Used by the producer
    /// boundary to wait for a drain before exporting.
    fn pending_count(&self) -> impl Future<Output = Result<i64, QueueError>> + Send;
}
