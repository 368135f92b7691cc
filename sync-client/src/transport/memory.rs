//! In-process transport and applier.
//!
//! [`MemoryTransport`] is both the invalidation channel and the snapshot
//! provider, so several engines can share one instance the way browser
//! windows share one backend. [`MemoryApplier`] records what it was given.
//! Both allow forcing failures and delays for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_types::{InvalidationEvent, Revision, Snapshot, SnapshotEnvelope, Topic};

use super::{InvalidationHandler, InvalidationSubscriber, SnapshotApplier, SnapshotProvider, Unsubscribe};
use crate::{lock, ApplyError, TransportError};

/// Shared in-memory source of truth plus invalidation bus.
///
/// Clones share state.
pub struct MemoryTransport<T> {
    inner: Arc<Mutex<MemoryTransportInner<T>>>,
}

struct MemoryTransportInner<T> {
    snapshot: SnapshotEnvelope<T>,
    latest: Revision,
    handlers: Vec<(u64, InvalidationHandler)>,
    next_handler_id: u64,
    fetch_delay: Duration,
    fetch_failures: VecDeque<String>,
    fail_next_subscribe: Option<String>,
    fetch_count: usize,
    subscribe_count: usize,
    closed: bool,
}

impl<T> MemoryTransport<T> {
    /// Create a transport serving `data` at `revision`.
    pub fn new(revision: Revision, data: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryTransportInner {
                snapshot: SnapshotEnvelope::new(revision, data),
                latest: revision,
                handlers: Vec::new(),
                next_handler_id: 0,
                fetch_delay: Duration::ZERO,
                fetch_failures: VecDeque::new(),
                fail_next_subscribe: None,
                fetch_count: 0,
                subscribe_count: 0,
                closed: false,
            })),
        }
    }

    /// Replace the served snapshot without notifying anyone.
    pub fn set_snapshot(&self, revision: Revision, data: T) {
        let mut inner = lock(&self.inner);
        inner.snapshot = SnapshotEnvelope::new(revision, data);
        inner.latest = revision;
    }

    /// Serve a raw envelope, e.g. one with a malformed revision.
    pub fn set_envelope(&self, envelope: SnapshotEnvelope<T>) {
        lock(&self.inner).snapshot = envelope;
    }

    /// Store `data` at the next revision and publish an invalidation.
    pub fn commit(&self, topic: &Topic, data: T) -> Revision {
        let revision = {
            let mut inner = lock(&self.inner);
            let revision = inner.latest.next();
            inner.snapshot = SnapshotEnvelope::new(revision, data);
            inner.latest = revision;
            revision
        };
        self.publish(topic, revision);
        revision
    }

    /// Revision of the last snapshot set through this transport.
    pub fn latest(&self) -> Revision {
        lock(&self.inner).latest
    }

    /// Deliver `payload` to every subscriber, as is.
    pub fn emit(&self, payload: Value) {
        let handlers: Vec<_> = lock(&self.inner)
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(payload.clone());
        }
    }

    /// Deliver a well-formed invalidation for `topic` at `revision`.
    pub fn publish(&self, topic: &Topic, revision: Revision) {
        self.emit(InvalidationEvent::new(topic.clone(), revision).to_value());
    }

    /// Shut the bus down: drop every subscriber and fail later
    /// subscribes and fetches with [`TransportError::Closed`].
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.handlers.clear();
    }

    /// Delay every fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        lock(&self.inner).fetch_delay = delay;
    }

    /// Cause the next fetch to fail. Calls queue up.
    pub fn fail_next_fetch(&self, error: &str) {
        lock(&self.inner).fetch_failures.push_back(error.to_string());
    }

    /// Cause the next subscribe to fail.
    pub fn fail_next_subscribe(&self, error: &str) {
        lock(&self.inner).fail_next_subscribe = Some(error.to_string());
    }

    /// Number of fetches so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        lock(&self.inner).fetch_count
    }

    /// Number of subscribe calls so far, failed ones included.
    pub fn subscribe_count(&self) -> usize {
        lock(&self.inner).subscribe_count
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).handlers.len()
    }
}

impl<T> Clone for MemoryTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for MemoryTransport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("MemoryTransport")
            .field("revision", &inner.snapshot.revision)
            .field("subscribers", &inner.handlers.len())
            .field("fetch_count", &inner.fetch_count)
            .finish()
    }
}

#[async_trait]
impl<T: Send + 'static> InvalidationSubscriber for MemoryTransport<T> {
    async fn subscribe(&self, handler: InvalidationHandler) -> Result<Unsubscribe, TransportError> {
        let mut inner = lock(&self.inner);
        inner.subscribe_count += 1;

        if inner.closed {
            return Err(TransportError::Closed);
        }
        if let Some(error) = inner.fail_next_subscribe.take() {
            return Err(TransportError::SubscribeFailed(error));
        }

        let id = inner.next_handler_id;
        inner.next_handler_id += 1;
        inner.handlers.push((id, handler));

        let shared = Arc::clone(&self.inner);
        Ok(Box::new(move || {
            lock(&shared).handlers.retain(|(handler_id, _)| *handler_id != id);
        }))
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> SnapshotProvider<T> for MemoryTransport<T> {
    async fn get_snapshot(&self) -> Result<SnapshotEnvelope<T>, TransportError> {
        let (outcome, delay) = {
            let mut inner = lock(&self.inner);
            inner.fetch_count += 1;
            let outcome = if inner.closed {
                Err(TransportError::Closed)
            } else {
                match inner.fetch_failures.pop_front() {
                    Some(error) => Err(TransportError::FetchFailed(error)),
                    None => Ok(inner.snapshot.clone()),
                }
            };
            (outcome, inner.fetch_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

/// Applier that records every snapshot it receives.
///
/// Clones share state.
pub struct MemoryApplier<T> {
    inner: Arc<Mutex<MemoryApplierInner<T>>>,
}

struct MemoryApplierInner<T> {
    applied: Vec<Snapshot<T>>,
    failures: VecDeque<String>,
    apply_delay: Duration,
}

impl<T> MemoryApplier<T> {
    /// Create an empty applier.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryApplierInner {
                applied: Vec::new(),
                failures: VecDeque::new(),
                apply_delay: Duration::ZERO,
            })),
        }
    }

    /// Number of successful applies.
    pub fn applied_count(&self) -> usize {
        lock(&self.inner).applied.len()
    }

    /// Revisions applied so far, in order.
    pub fn applied_revisions(&self) -> Vec<Revision> {
        lock(&self.inner)
            .applied
            .iter()
            .map(|snapshot| snapshot.revision)
            .collect()
    }

    /// Cause the next apply to fail. Calls queue up.
    pub fn fail_next_apply(&self, error: &str) {
        lock(&self.inner).failures.push_back(error.to_string());
    }

    /// Delay every apply by `delay`.
    pub fn set_apply_delay(&self, delay: Duration) {
        lock(&self.inner).apply_delay = delay;
    }
}

impl<T: Clone> MemoryApplier<T> {
    /// Every applied snapshot, in order.
    pub fn applied(&self) -> Vec<Snapshot<T>> {
        lock(&self.inner).applied.clone()
    }

    /// The most recently applied snapshot.
    pub fn last_applied(&self) -> Option<Snapshot<T>> {
        lock(&self.inner).applied.last().cloned()
    }
}

impl<T> Default for MemoryApplier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MemoryApplier<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for MemoryApplier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryApplier")
            .field("applied", &lock(&self.inner).applied.len())
            .finish()
    }
}

#[async_trait]
impl<T: Send + 'static> SnapshotApplier<T> for MemoryApplier<T> {
    async fn apply(&self, snapshot: Snapshot<T>) -> Result<(), ApplyError> {
        let delay = lock(&self.inner).apply_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = lock(&self.inner);
        if let Some(error) = inner.failures.pop_front() {
            return Err(ApplyError(error));
        }
        inner.applied.push(snapshot);
        Ok(())
    }
}
