//! Error types for the sync engine and its collaborators.

use sync_types::ProtocolError;
use thiserror::Error;

/// Failure reported by a subscriber or snapshot provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Subscribing to invalidations failed.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Fetching a snapshot failed.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// Failure reported by a snapshot applier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("apply failed: {0}")]
pub struct ApplyError(pub String);

impl ApplyError {
    /// Create an apply error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by [`RevisionSync`](crate::RevisionSync).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// `start()` was called on an engine that has been stopped.
    #[error("start() called after stop()")]
    Stopped,

    /// Subscribing to invalidations failed.
    #[error("subscribe error: {0}")]
    Subscribe(TransportError),

    /// Fetching a snapshot failed (after any retries).
    #[error("snapshot error: {0}")]
    Snapshot(TransportError),

    /// The applier rejected a snapshot.
    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Malformed topic, revision or event.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A timer or task needed a tokio runtime and none was running.
    #[error("no tokio runtime available")]
    NoRuntime,
}
