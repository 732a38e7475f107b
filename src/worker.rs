//! Worker: the unit of concurrency.
//!
//! Each worker runs a single-threaded consumption loop with no in-process
//! state shared with its siblings; all coordination happens through the
//! store and the broker. One delivery moves through an explicit state
//! machine:
//!
//! ```text
//! Received → Claimed | Duplicate | Malformed → Acked
//! Received → TransientFailure → Redelivered (released with backoff)
//! ```
//!
//! Malformed records are acknowledged and dead-lettered instead of
//! retried. Transient failures leave the message to the broker, except on
//! the final permitted delivery attempt, where the poison-message guard
//! dead-letters it so one bad input cannot circulate forever. Shutdown is
//! a drain: the current delivery finishes, no new pulls start.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{Delivery, MessageQueue};
use crate::config::BraidConfig;
use crate::dedup::DedupResolver;
use crate::error::ProcessError;
use crate::fingerprint;
use crate::models::{DeadLetter, QueueEnvelope, ThreadKey};
use crate::normalizer;
use crate::store::{ClaimOutcome, StateStore};
use crate::threading::ThreadAssembler;

/// Terminal, acknowledged outcomes of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// This worker owned the content and attached it.
    Claimed(ThreadKey),
    /// The content was claimed earlier; the message id it resolved to.
    Duplicate(String),
}

pub struct Worker<S, Q> {
    id: usize,
    store: Arc<S>,
    queue: Arc<Q>,
    dedup: DedupResolver<S>,
    assembler: ThreadAssembler<S>,
    config: BraidConfig,
}

impl<S: StateStore, Q: MessageQueue> Worker<S, Q> {
    pub fn new(
        id: usize,
        store: Arc<S>,
        queue: Arc<Q>,
        worker_epoch: Uuid,
        config: BraidConfig,
    ) -> Self {
        let dedup = DedupResolver::new(Arc::clone(&store), worker_epoch, config.claim_retries);
        let assembler = ThreadAssembler::new(Arc::clone(&store), config.attach_retries);
        Self {
            id,
            store,
            queue,
            dedup,
            assembler,
            config,
        }
    }

    /// Run the consumption loop until `shutdown` fires, then drain.
    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("worker {}: started", self.id);

        loop {
            let pulled = tokio::select! {
                _ = shutdown.cancelled() => break,
                pulled = self.queue.pull(self.config.queue_lease) => pulled,
            };

            match pulled {
                Ok(Some(delivery)) => {
                    // In-flight work finishes even if shutdown fires now.
                    self.handle_delivery(delivery).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    log::error!("worker {}: pull failed: {}", self.id, err);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        log::info!("worker {}: drained, stopping", self.id);
    }

    /// Drive one delivery through the state machine to a terminal state.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let source_id = delivery.envelope.source_id.clone();

        match self.process(&delivery.envelope).await {
            Ok(MessageOutcome::Claimed(key)) => {
                log::debug!("worker {}: {} attached to thread {}", self.id, source_id, key);
                self.ack(&delivery).await;
            }
            Ok(MessageOutcome::Duplicate(existing)) => {
                log::debug!(
                    "worker {}: {} is a duplicate of {}, acknowledged",
                    self.id,
                    source_id,
                    existing
                );
                self.ack(&delivery).await;
            }
            Err(ProcessError::Malformed(reason)) => {
                log::info!("worker {}: {} dead-lettered: {}", self.id, source_id, reason);
                self.dead_letter(&delivery, &reason).await;
            }
            Err(ProcessError::Transient(reason)) => {
                if delivery.delivery_count >= self.config.max_deliveries {
                    let reason = format!(
                        "delivery budget exhausted after {} attempts: {}",
                        delivery.delivery_count, reason
                    );
                    log::warn!("worker {}: {} dead-lettered: {}", self.id, source_id, reason);
                    self.dead_letter(&delivery, &reason).await;
                } else {
                    let delay = self.backoff(delivery.delivery_count);
                    log::debug!(
                        "worker {}: {} failed transiently ({}), releasing for {:?}",
                        self.id,
                        source_id,
                        reason,
                        delay
                    );
                    if let Err(err) = self.queue.release(&delivery, delay).await {
                        // Lease expiry will redeliver regardless.
                        log::error!("worker {}: release of {} failed: {}", self.id, source_id, err);
                    }
                }
            }
        }
    }

    /// Normalize, fingerprint, claim, attach.
    async fn process(&self, envelope: &QueueEnvelope) -> Result<MessageOutcome, ProcessError> {
        let record = normalizer::normalize(envelope.raw.as_bytes())?;
        let fp = fingerprint::fingerprint(&record)?;
        let hint = fingerprint::thread_hint(&record);
        let node_id = record.node_id(&fp);

        match self.dedup.try_claim(&fp, &node_id).await? {
            ClaimOutcome::Claimed => {
                let key = self.assembler.attach(&node_id, &record, &fp, &hint).await?;
                Ok(MessageOutcome::Claimed(key))
            }
            ClaimOutcome::AlreadyClaimed(existing) => {
                // A claim with no thread slot means the original claimant
                // died between claiming and attaching. Attach is idempotent
                // under the claimed id, so this redelivery completes it.
                if self.store.lookup_message(&existing).await?.is_empty() {
                    log::info!(
                        "worker {}: completing interrupted attach for {}",
                        self.id,
                        existing
                    );
                    let key = self.assembler.attach(&existing, &record, &fp, &hint).await?;
                    Ok(MessageOutcome::Claimed(key))
                } else {
                    Ok(MessageOutcome::Duplicate(existing))
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(err) = self.queue.ack(delivery).await {
            // The lease expires and the message redelivers; dedup makes
            // the replay a no-op.
            log::error!(
                "worker {}: ack of {} failed: {}",
                self.id,
                delivery.envelope.source_id,
                err
            );
        }
    }

    /// Record the dead letter, then acknowledge. If the record itself
    /// fails the message stays leased and redelivery retries both steps.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        let dead_letter = DeadLetter {
            source_id: delivery.envelope.source_id.clone(),
            reason: reason.to_string(),
            payload: delivery.envelope.raw.clone(),
            recorded_at: Utc::now(),
        };

        match self.store.record_dead_letter(&dead_letter).await {
            Ok(()) => self.ack(delivery).await,
            Err(err) => {
                log::error!(
                    "worker {}: failed to record dead letter for {}: {}",
                    self.id,
                    delivery.envelope.source_id,
                    err
                );
            }
        }
    }

    /// Exponential backoff with jitter, capped.
    fn backoff(&self, delivery_count: i32) -> std::time::Duration {
        let exponent = delivery_count.max(1) as u32 - 1;
        let base = self.config.backoff_base.saturating_mul(1u32 << exponent.min(16));
        let capped = base.min(self.config.backoff_cap);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64 / 2);
        capped + std::time::Duration::from_millis(jitter_ms)
    }
}
