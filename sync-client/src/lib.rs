//! # sync-client
//!
//! Async revision sync engine for the statesync invalidation-pull protocol.
//!
//! Applications use [`RevisionSync`] to keep a local replica of one topic in
//! step with a remote source of truth. Invalidations only say "topic X is at
//! revision Y now"; the engine pulls a full snapshot when that is newer than
//! what it has applied.
//!
//! ## Features
//!
//! - **Single-flight refresh**: any burst of invalidations costs at most two fetches
//! - **Revision gating**: stale, duplicate and out-of-order events are dropped
//! - **Throttle/debounce**: optional timer-driven rate limiting ([`ThrottledHandler`])
//! - **Retry**: bounded exponential backoff around any provider ([`with_retry`])
//! - **Transport abstraction**: pluggable subscriber/provider/applier traits
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{MemoryApplier, MemoryTransport, RevisionSync};
//! use sync_types::Revision;
//!
//! let transport = MemoryTransport::new(Revision::new(1), "hello".to_string());
//! let applier = MemoryApplier::new();
//! let sync = RevisionSync::builder("settings", transport.clone(), transport.clone(), applier)
//!     .label("window-1")
//!     .build()?;
//!
//! sync.start().await?;
//! assert_eq!(sync.local_revision().to_string(), "1");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod report;
pub mod retry;
pub mod throttle;
pub mod transport;

pub use config::{ConfigError, SyncSettings};
pub use engine::{RefreshPredicate, RevisionSync, RevisionSyncBuilder};
pub use error::{ApplyError, SyncError, TransportError};
pub use report::{emit, ErrorCallback, SyncErrorContext, SyncPhase};
pub use retry::{with_retry, with_retry_reporting, RetryAttempt, RetryCallback, RetryingProvider};
pub use throttle::ThrottledHandler;
pub use transport::{
    InvalidationHandler, InvalidationSubscriber, MemoryApplier, MemoryTransport, SnapshotApplier,
    SnapshotProvider, Unsubscribe,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate is a handful of plain field
/// updates, so the data behind a poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
