//! Errors raised while turning detections into resolved identities.

use thiserror::Error;

use crate::db::StoreError;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The caller gave up on this resolution; its unit of work was rolled back.
    #[error("resolution cancelled")]
    Cancelled,
    #[error("gave up after {0} conflicting attempts")]
    ConflictRetriesExhausted(u32),
}

/// Why a pipeline event produced no resolution.
///
/// Every drop releases the track's buffer entry so a later sample can emit.
#[derive(Debug, Error)]
pub enum DropReason {
    #[error("feature extraction timed out")]
    ExtractionTimeout,
    #[error("feature extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("resolution timed out")]
    ResolveTimeout,
    #[error("resolution task failed: {0}")]
    ResolveTaskFailed(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}
