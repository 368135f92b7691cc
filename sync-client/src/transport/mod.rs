//! Collaborator contracts for the sync engine.
//!
//! The engine never talks to a network or a store directly. It depends on
//! three narrow traits:
//! - [`InvalidationSubscriber`] delivers raw invalidation payloads
//! - [`SnapshotProvider`] fetches the current full snapshot
//! - [`SnapshotApplier`] writes a validated snapshot into local state
//!
//! Delivery may be out of order, duplicated or lossy; the engine's revision
//! gate is the only defence it relies on.
//!
//! # Example
//!
//! ```ignore
//! let transport = MemoryTransport::new(Revision::ZERO, Settings::default());
//! let unsubscribe = transport.subscribe(Arc::new(|payload| println!("{payload}"))).await?;
//! transport.publish(&topic, Revision::new(1));
//! unsubscribe();
//! ```

mod memory;

pub use memory::{MemoryApplier, MemoryTransport};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use sync_types::{Snapshot, SnapshotEnvelope};

use crate::{ApplyError, TransportError};

/// Callback receiving untyped invalidation payloads.
///
/// Payloads are validated by the engine, not by the transport.
pub type InvalidationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Tears down a subscription. Called at most once.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Source of invalidation notifications.
#[async_trait]
pub trait InvalidationSubscriber: Send + Sync {
    /// Register `handler` for every invalidation on this channel.
    ///
    /// The channel may carry other topics; filtering is the caller's job.
    async fn subscribe(&self, handler: InvalidationHandler) -> Result<Unsubscribe, TransportError>;
}

/// Pull side: fetches the current snapshot.
#[async_trait]
pub trait SnapshotProvider<T: Send + 'static>: Send + Sync {
    /// Fetch the provider's current view. Must not serve a cached copy.
    async fn get_snapshot(&self) -> Result<SnapshotEnvelope<T>, TransportError>;
}

/// Writes validated snapshots into local state.
#[async_trait]
pub trait SnapshotApplier<T: Send + 'static>: Send + Sync {
    /// Replace local state with `snapshot`.
    ///
    /// Must tolerate being called again with the same or a newer snapshot.
    async fn apply(&self, snapshot: Snapshot<T>) -> Result<(), ApplyError>;
}

#[async_trait]
impl<S: InvalidationSubscriber + ?Sized> InvalidationSubscriber for Arc<S> {
    async fn subscribe(&self, handler: InvalidationHandler) -> Result<Unsubscribe, TransportError> {
        (**self).subscribe(handler).await
    }
}

#[async_trait]
impl<T: Send + 'static, P: SnapshotProvider<T> + ?Sized> SnapshotProvider<T> for Arc<P> {
    async fn get_snapshot(&self) -> Result<SnapshotEnvelope<T>, TransportError> {
        (**self).get_snapshot().await
    }
}

#[async_trait]
impl<T: Send + 'static, A: SnapshotApplier<T> + ?Sized> SnapshotApplier<T> for Arc<A> {
    async fn apply(&self, snapshot: Snapshot<T>) -> Result<(), ApplyError> {
        (**self).apply(snapshot).await
    }
}
