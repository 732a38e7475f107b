//! Core data model for the deduplication-and-threading pipeline.
//!
//! `EmailRecord` is the worker-local, transient output of the normalizer.
//! `MessageFingerprint` and `ThreadHint` are derived from it by the
//! fingerprint engine. Everything else (`DedupEntry`, `ThreadDocument`,
//! `DeadLetter`) is owned by the shared state store and only ever read,
//! proposed, or conditionally updated by workers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One parsed input message, produced by the normalizer.
///
/// `parent_refs` lists ancestor message ids oldest-first, exactly as read
/// from the `References`/`In-Reply-To` headers. It may be empty or name
/// messages that are never delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailRecord {
    /// External Message-ID, if the record carried a usable one.
    pub message_id: Option<String>,
    /// Ancestor message ids, oldest-first.
    pub parent_refs: Vec<String>,
    pub subject: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub body_text: String,
}

impl EmailRecord {
    /// The identity this record's node carries inside a thread.
    ///
    /// Records without a usable Message-ID get a synthetic id derived from
    /// the fingerprint digest, so redelivery resolves to the same node.
    pub fn node_id(&self, fingerprint: &MessageFingerprint) -> String {
        match &self.message_id {
            Some(id) => id.clone(),
            None => format!("braid-{}@synthetic", &fingerprint.digest[..16]),
        }
    }
}

/// Content-derived identity of an email record; the dedup key.
///
/// Equal fingerprints mean equal substantive content regardless of subject
/// prefixes, casing, whitespace, or quoted-reply echoes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageFingerprint {
    /// Lowercase hex SHA-256 over the normalized (subject, sender, body).
    pub digest: String,
}

impl std::fmt::Display for MessageFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.digest)
    }
}

/// Candidate thread identities for a record, derived without touching state.
///
/// `ancestors` is `parent_refs` reversed: nearest ancestor first. Deciding
/// which candidate resolves against already-processed state belongs to the
/// thread assembler; this struct only carries the candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadHint {
    /// Ancestor message ids, nearest first, deduplicated.
    pub ancestors: Vec<String>,
    /// Deterministic fallback key for when no ancestor resolves.
    pub fallback: ThreadKey,
}

/// Canonical thread identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadKey(pub String);

impl ThreadKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One member record inside a thread document.
///
/// The document stores members plus their raw ancestor chains; the tree
/// (placeholders, parent links, children, roots) is recomputed from this
/// set on every mutation, so the materialized tree is a pure function of
/// membership and arrival order cannot influence it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMember {
    pub message_id: String,
    pub fingerprint: MessageFingerprint,
    /// Ancestor message ids, oldest-first, as carried by the record.
    pub parent_refs: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub sender: String,
}

/// The persisted form of a canonical thread: key, conditional-put revision,
/// and the member set keyed by message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadDocument {
    pub key: ThreadKey,
    /// Monotonically increasing; a put is conditional on `revision - 1`
    /// being the stored value (or on absence when `revision == 1`).
    pub revision: i64,
    pub members: BTreeMap<String, ThreadMember>,
}

impl ThreadDocument {
    /// A fresh, empty document at revision 1.
    pub fn new(key: ThreadKey) -> Self {
        Self {
            key,
            revision: 1,
            members: BTreeMap::new(),
        }
    }

    /// Earliest member timestamp; the merge tie-break value.
    ///
    /// The true root may still be a placeholder, in which case the earliest
    /// real message stands in for it, the same way a phantom root borrows
    /// its metadata from its first real descendant.
    pub fn root_timestamp(&self) -> Option<DateTime<Utc>> {
        self.members.values().map(|m| m.timestamp).min()
    }
}

/// One message's materialized position inside a thread tree.
///
/// Placeholder nodes (referenced ancestors that have not arrived) have no
/// fingerprint and no timestamp; a pending node is a real node whose
/// recorded parent is still a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadNode {
    pub message_id: String,
    pub fingerprint: Option<MessageFingerprint>,
    pub parent_message_id: Option<String>,
    pub children: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ThreadNode {
    pub fn is_placeholder(&self) -> bool {
        self.fingerprint.is_none()
    }
}

/// Persisted marker that a fingerprint has been claimed.
///
/// Created exactly once per distinct fingerprint via set-if-absent; never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub fingerprint: MessageFingerprint,
    /// Identity of the worker process instance that won the claim.
    pub worker_epoch: Uuid,
    /// Node id the claimed content resolved to.
    pub message_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// The producer-side payload: one raw record prior to normalization.
///
/// `source_id` is an opaque producer-side name used only in logs and
/// dead-letter records; it plays no role in identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub source_id: String,
    pub raw: String,
}

/// Terminal classification of an unprocessable input, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_id: String,
    pub reason: String,
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
}
