//! Per-message error taxonomy.
//!
//! Everything that can go wrong while processing one delivery collapses
//! into two classes: `Malformed` (terminal, acknowledged, dead-lettered)
//! and `Transient` (unacknowledged, redelivered by the broker). Structural
//! conflicts never reach this type: the tree's cycle guard resolves them
//! in place. Fatal configuration failures only exist at startup, in the
//! binaries.

use thiserror::Error;

use crate::fingerprint::FingerprintError;
use crate::normalizer::NormalizeError;
use crate::store::StoreError;
use crate::threading::AttachError;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The record cannot be processed and never will be; acknowledged and
    /// dead-lettered with the reason.
    #[error("malformed record: {0}")]
    Malformed(String),
    /// A failure redelivery can heal; the message stays unacknowledged.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<NormalizeError> for ProcessError {
    fn from(err: NormalizeError) -> Self {
        ProcessError::Malformed(err.to_string())
    }
}

impl From<FingerprintError> for ProcessError {
    fn from(err: FingerprintError) -> Self {
        ProcessError::Malformed(err.to_string())
    }
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            ProcessError::Transient(err.to_string())
        } else {
            ProcessError::Malformed(err.to_string())
        }
    }
}

impl From<AttachError> for ProcessError {
    fn from(err: AttachError) -> Self {
        if err.is_transient() {
            ProcessError::Transient(err.to_string())
        } else {
            ProcessError::Malformed(err.to_string())
        }
    }
}
