//! Thread assembler: attaches a claimed message to its canonical thread.
//!
//! Each attach is one logical atomic update performed compare-and-retry
//! style: read the current document, compute the new membership, write
//! conditionally on the revision still being current, retry (bounded) on
//! conflict. Key resolution is deterministic: a thread already holding a
//! slot for this message claims it, otherwise the nearest resolvable
//! ancestor wins, otherwise the subject+sender fallback key is created
//! get-or-create.
//!
//! When resolution surfaces more than one thread for the same slot (the
//! late-shared-ancestor case), the threads merge first: the one with the
//! earlier root timestamp absorbs the other (ties toward the smaller key),
//! via the store's single-transaction merge primitive.

use std::sync::Arc;

use thiserror::Error;

use crate::models::{EmailRecord, MessageFingerprint, ThreadDocument, ThreadHint, ThreadKey, ThreadMember};
use crate::store::{PutOutcome, StateStore, StoreError};
use crate::threading::tree;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("attach retries exhausted after {0} conflicts")]
    RetriesExhausted(u32),
}

impl AttachError {
    /// Conflict-retry exhaustion is transient by definition: another
    /// worker kept winning, so redelivery will get a quieter moment.
    pub fn is_transient(&self) -> bool {
        match self {
            AttachError::Store(err) => err.is_transient(),
            AttachError::RetriesExhausted(_) => true,
        }
    }
}

pub struct ThreadAssembler<S> {
    store: Arc<S>,
    max_retries: u32,
}

impl<S: StateStore> ThreadAssembler<S> {
    pub fn new(store: Arc<S>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Attach the record to its canonical thread and return the resolved
    /// key. Idempotent: reattaching a node that is already a member with
    /// the same fingerprint is a no-op.
    pub async fn attach(
        &self,
        node_id: &str,
        record: &EmailRecord,
        fingerprint: &MessageFingerprint,
        hint: &ThreadHint,
    ) -> Result<ThreadKey, AttachError> {
        let mut conflicts = 0;

        while conflicts < self.max_retries {
            match self.try_attach(node_id, record, fingerprint, hint).await? {
                Some(key) => return Ok(key),
                None => {
                    conflicts += 1;
                    log::debug!(
                        "attach conflict for {} (attempt {}/{})",
                        node_id,
                        conflicts,
                        self.max_retries
                    );
                }
            }
        }

        Err(AttachError::RetriesExhausted(self.max_retries))
    }

    /// One compare-and-retry round. `None` means a conditional write lost
    /// to a concurrent worker and the round must be replayed from a fresh
    /// read.
    async fn try_attach(
        &self,
        node_id: &str,
        record: &EmailRecord,
        fingerprint: &MessageFingerprint,
        hint: &ThreadHint,
    ) -> Result<Option<ThreadKey>, AttachError> {
        let candidates = self.resolve_candidates(node_id, hint).await?;

        let mut doc = if candidates.is_empty() {
            match self.store.get_thread(&hint.fallback).await? {
                Some(doc) => doc,
                None => ThreadDocument::new(hint.fallback.clone()),
            }
        } else if candidates.len() == 1 {
            match self.store.get_thread(&candidates[0]).await? {
                Some(doc) => doc,
                // The index pointed at a thread a concurrent merge just
                // absorbed; replay against the rewritten index.
                None => return Ok(None),
            }
        } else {
            match self.merge_candidates(&candidates).await? {
                Some(doc) => doc,
                None => return Ok(None),
            }
        };

        if let Some(existing) = doc.members.get(node_id) {
            if existing.fingerprint != *fingerprint {
                log::warn!(
                    "message id {} already present in thread {} with different content, keeping first",
                    node_id,
                    doc.key
                );
            }
            return Ok(Some(doc.key));
        }

        let is_new = doc.members.is_empty() && doc.revision == 1;
        doc.members.insert(
            node_id.to_string(),
            ThreadMember {
                message_id: node_id.to_string(),
                fingerprint: fingerprint.clone(),
                parent_refs: record.parent_refs.clone(),
                timestamp: record.timestamp,
                subject: record.subject.clone(),
                sender: record.sender.clone(),
            },
        );
        if !is_new {
            doc.revision += 1;
        }

        let indexed_ids = tree::rebuild(&doc.members).node_ids();
        match self.store.put_thread(&doc, &indexed_ids).await? {
            PutOutcome::Applied => Ok(Some(doc.key)),
            PutOutcome::Conflict => Ok(None),
        }
    }

    /// Every thread with a claim on this message: threads already holding
    /// a slot (member or placeholder) for the node id itself, plus the
    /// threads of the nearest ancestor that resolves at all. Farther
    /// ancestors are deliberately not consulted; a contradiction they
    /// would reveal triggers a merge when it actually surfaces.
    async fn resolve_candidates(
        &self,
        node_id: &str,
        hint: &ThreadHint,
    ) -> Result<Vec<ThreadKey>, StoreError> {
        let mut candidates = self.store.lookup_message(node_id).await?;

        for ancestor in &hint.ancestors {
            let keys = self.store.lookup_message(ancestor).await?;
            if !keys.is_empty() {
                for key in keys {
                    if !candidates.contains(&key) {
                        candidates.push(key);
                    }
                }
                break;
            }
        }

        Ok(candidates)
    }

    /// Merge all candidate threads into the one with the earliest root
    /// timestamp (ties toward the lexicographically smaller key) and
    /// return the surviving document. `None` replays the round.
    async fn merge_candidates(
        &self,
        candidates: &[ThreadKey],
    ) -> Result<Option<ThreadDocument>, AttachError> {
        let mut docs = Vec::with_capacity(candidates.len());
        for key in candidates {
            match self.store.get_thread(key).await? {
                Some(doc) => docs.push(doc),
                // Already absorbed by a concurrent merge.
                None => return Ok(None),
            }
        }

        docs.sort_by_key(|doc| (doc.root_timestamp(), doc.key.clone()));
        let mut absorbing = docs.remove(0);

        for absorbed in docs {
            log::info!(
                "merging thread {} into {} (shared ancestry)",
                absorbed.key,
                absorbing.key
            );

            let mut combined = absorbing.clone();
            combined.revision += 1;
            for (id, member) in &absorbed.members {
                combined.members.entry(id.clone()).or_insert_with(|| member.clone());
            }

            let indexed_ids = tree::rebuild(&combined.members).node_ids();
            match self
                .store
                .merge_threads(&combined, &indexed_ids, &absorbed.key, absorbed.revision)
                .await?
            {
                PutOutcome::Applied => absorbing = combined,
                PutOutcome::Conflict => return Ok(None),
            }
        }

        Ok(Some(absorbing))
    }
}
