//! Dedup resolver over the store's set-if-absent primitive.
//!
//! The claim is a single atomic conditional operation; there is no read
//! before the write, so concurrent workers racing on the same fingerprint
//! (a redelivered message, or two textually distinct records normalizing
//! to identical content) resolve to exactly one `Claimed`. This is what
//! turns at-least-once delivery into at-most-once semantic effect.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::models::{DedupEntry, MessageFingerprint};
use crate::store::{ClaimOutcome, StateStore, StoreError};

pub struct DedupResolver<S> {
    store: Arc<S>,
    /// Identity of this worker process instance, stamped into claims.
    worker_epoch: Uuid,
    /// Bounded in-process retries for transient store failures before the
    /// message falls back to broker redelivery.
    max_retries: u32,
}

impl<S: StateStore> DedupResolver<S> {
    pub fn new(store: Arc<S>, worker_epoch: Uuid, max_retries: u32) -> Self {
        Self {
            store,
            worker_epoch,
            max_retries,
        }
    }

    /// Claim a fingerprint, resolving it to `message_id`.
    ///
    /// Idempotent under redelivery: a second claim of the same fingerprint
    /// returns [`ClaimOutcome::AlreadyClaimed`] with the originally
    /// resolved message id.
    pub async fn try_claim(
        &self,
        fingerprint: &MessageFingerprint,
        message_id: &str,
    ) -> Result<ClaimOutcome, StoreError> {
        let entry = DedupEntry {
            fingerprint: fingerprint.clone(),
            worker_epoch: self.worker_epoch,
            message_id: message_id.to_string(),
            claimed_at: Utc::now(),
        };

        let mut attempt = 0;
        loop {
            match self.store.claim_fingerprint(&entry).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() && attempt + 1 < self.max_retries => {
                    attempt += 1;
                    log::debug!(
                        "claim of {} failed transiently (attempt {}/{}): {}",
                        fingerprint,
                        attempt,
                        self.max_retries,
                        err
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
