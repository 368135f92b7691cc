//! RevisionSync - the revision-gated sync engine.
//!
//! One engine follows one topic. It subscribes to invalidations, pulls a
//! snapshot when an event announces a newer revision, and hands snapshots
//! that are newer than local state to the applier.
//!
//! # Architecture
//!
//! Decisions come from sync-core (refresh gate, admission, throttle state
//! machine); this module performs the I/O around them.
//!
//! ```text
//! Subscriber → handle_invalidation → admit → (ThrottledHandler) → refresh
//!                                                                    ↓
//!                                         Provider → verify → gate → Applier
//! ```
//!
//! Engine state sits behind a `std::sync::Mutex` that is never held across
//! an await. `stopped` is an atomic checked after every await.
//!
//! # Example
//!
//! ```ignore
//! let sync = RevisionSync::builder("settings", transport.clone(), transport.clone(), applier)
//!     .throttle(ThrottleOptions::debounce(50))
//!     .on_error(|ctx| eprintln!("{}: {}", ctx.phase, ctx.error))
//!     .build()?;
//!
//! sync.start().await?;
//! // ... later
//! sync.stop();
//! ```

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use sync_core::{admit, Admission, GateEntry, LocalRevision, RefreshGate, ThrottleOptions};
use sync_types::{InvalidationEvent, Revision, Topic};
use tokio::runtime::Handle;
use tracing::Instrument;

use crate::report::{emit, ErrorCallback, SyncErrorContext, SyncPhase};
use crate::throttle::ThrottledHandler;
use crate::transport::{
    InvalidationHandler, InvalidationSubscriber, SnapshotApplier, SnapshotProvider, Unsubscribe,
};
use crate::{lock, SyncError};

/// Domain filter deciding whether an admitted event should refresh.
pub type RefreshPredicate = Arc<dyn Fn(&InvalidationEvent) -> bool + Send + Sync>;

/// Handle to a sync engine for one topic.
///
/// Clones refer to the same engine. Once [`stop`](Self::stop) is called the
/// engine is dead for good; build a new one to resume.
pub struct RevisionSync<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Send + 'static> {
    topic: Topic,
    label: Option<String>,
    subscriber: Box<dyn InvalidationSubscriber>,
    provider: Box<dyn SnapshotProvider<T>>,
    applier: Box<dyn SnapshotApplier<T>>,
    should_refresh: Option<RefreshPredicate>,
    on_error: Option<ErrorCallback>,
    throttle: Option<ThrottledHandler>,
    span: tracing::Span,
    stopped: AtomicBool,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    started: bool,
    local: LocalRevision,
    gate: RefreshGate,
    unsubscribe: Option<Unsubscribe>,
}

/// Builder for [`RevisionSync`].
pub struct RevisionSyncBuilder<T: Send + 'static> {
    topic: String,
    label: Option<String>,
    subscriber: Box<dyn InvalidationSubscriber>,
    provider: Box<dyn SnapshotProvider<T>>,
    applier: Box<dyn SnapshotApplier<T>>,
    should_refresh: Option<RefreshPredicate>,
    on_error: Option<ErrorCallback>,
    throttle: Option<ThrottleOptions>,
}

impl<T: Send + 'static> RevisionSyncBuilder<T> {
    /// Only refresh for events accepted by `predicate`.
    ///
    /// Runs after topic and stale checks.
    pub fn should_refresh(
        mut self,
        predicate: impl Fn(&InvalidationEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_refresh = Some(Arc::new(predicate));
        self
    }

    /// Observe every reported error.
    pub fn on_error(
        mut self,
        callback: impl Fn(&SyncErrorContext<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Observe every reported error through a shared callback.
    pub fn on_error_shared(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Rate-limit invalidation-triggered refreshes.
    ///
    /// Options resolving to passthrough mode leave the engine unthrottled.
    pub fn throttle(mut self, options: ThrottleOptions) -> Self {
        self.throttle = Some(options);
        self
    }

    /// Tag every log record of this engine (e.g. a window id).
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Validate the topic and create the engine.
    pub fn build(self) -> Result<RevisionSync<T>, SyncError> {
        let topic = Topic::new(self.topic)?;

        let span = tracing::debug_span!(
            "revision_sync",
            topic = %topic,
            label = tracing::field::Empty
        );
        if let Some(label) = &self.label {
            span.record("label", label.as_str());
        }

        let throttle_options = self
            .throttle
            .filter(|options| options.mode() != sync_core::ThrottleMode::Passthrough);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| {
            let throttle = throttle_options.map(|options| {
                let weak = weak.clone();
                ThrottledHandler::new(&options, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.spawn_refresh();
                    }
                })
            });

            Inner {
                topic,
                label: self.label,
                subscriber: self.subscriber,
                provider: self.provider,
                applier: self.applier,
                should_refresh: self.should_refresh,
                on_error: self.on_error,
                throttle,
                span,
                stopped: AtomicBool::new(false),
                state: Mutex::new(EngineState::default()),
            }
        });

        Ok(RevisionSync { inner })
    }
}

impl<T: Send + 'static> RevisionSync<T> {
    /// Start building an engine for `topic`.
    pub fn builder<S, P, A>(
        topic: impl Into<String>,
        subscriber: S,
        provider: P,
        applier: A,
    ) -> RevisionSyncBuilder<T>
    where
        S: InvalidationSubscriber + 'static,
        P: SnapshotProvider<T> + 'static,
        A: SnapshotApplier<T> + 'static,
    {
        RevisionSyncBuilder {
            topic: topic.into(),
            label: None,
            subscriber: Box::new(subscriber),
            provider: Box::new(provider),
            applier: Box::new(applier),
            should_refresh: None,
            on_error: None,
            throttle: None,
        }
    }

    /// Subscribe to invalidations, then run the initial refresh.
    ///
    /// A no-op while already started. Fails with [`SyncError::Stopped`]
    /// after [`stop`](Self::stop) without touching the transport. If the
    /// initial refresh fails the subscription is torn down and the engine
    /// is back to not-started.
    pub async fn start(&self) -> Result<(), SyncError> {
        let span = self.inner.span.clone();
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.is_stopped() {
            let err = SyncError::Stopped;
            inner.report(SyncErrorContext::new(SyncPhase::Start, &err));
            return Err(err);
        }

        {
            let mut state = lock(&inner.state);
            if state.started {
                return Ok(());
            }
            state.started = true;
        }
        tracing::debug!("starting");

        let unsubscribe = match inner.subscriber.subscribe(self.invalidation_handler()).await {
            Ok(unsubscribe) => unsubscribe,
            Err(err) => {
                lock(&inner.state).started = false;
                let err = SyncError::Subscribe(err);
                inner.report(SyncErrorContext::new(SyncPhase::Subscribe, &err));
                return Err(err);
            }
        };

        if inner.is_stopped() {
            // stop() ran while subscribing and found nothing to tear down.
            unsubscribe();
            return Ok(());
        }
        lock(&inner.state).unsubscribe = Some(unsubscribe);
        tracing::debug!("subscribed");

        if let Err(err) = inner.refresh().await {
            let unsubscribe = {
                let mut state = lock(&inner.state);
                state.started = false;
                state.unsubscribe.take()
            };
            if let Some(unsubscribe) = unsubscribe {
                unsubscribe();
            }
            return Err(err);
        }

        tracing::debug!("started");
        Ok(())
    }

    /// Stop for good. Idempotent, never fails.
    ///
    /// Unsubscribes and cancels throttle timers. A fetch already in flight
    /// is not aborted, but its result is never applied.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _enter = inner.span.enter();
        tracing::debug!("stopped");

        let unsubscribe = lock(&inner.state).unsubscribe.take();
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
        if let Some(throttle) = &inner.throttle {
            throttle.dispose();
        }
    }

    /// Fetch and apply the current snapshot now.
    ///
    /// Works before `start()`, and is a successful no-op after `stop()`.
    /// While another refresh is running this only queues one more round and
    /// returns immediately.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let span = self.inner.span.clone();
        self.inner.refresh().instrument(span).await
    }

    /// Revision of the last applied snapshot, `Revision::ZERO` if none.
    pub fn local_revision(&self) -> Revision {
        lock(&self.inner.state).local.current()
    }

    /// At least one snapshot has been applied.
    pub fn has_applied_snapshot(&self) -> bool {
        lock(&self.inner.state).local.has_applied()
    }

    /// `start()` succeeded and `stop()` has not been called.
    pub fn is_running(&self) -> bool {
        !self.inner.is_stopped() && lock(&self.inner.state).started
    }

    /// `stop()` has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// The topic this engine follows.
    pub fn topic(&self) -> &Topic {
        &self.inner.topic
    }

    /// The log label, if any.
    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// The throttle driver, if one is configured.
    pub fn throttle(&self) -> Option<&ThrottledHandler> {
        self.inner.throttle.as_ref()
    }

    fn invalidation_handler(&self) -> InvalidationHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |payload: Value| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_invalidation(payload);
            }
        })
    }
}

impl<T: Send + 'static> Clone for RevisionSync<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for RevisionSync<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("RevisionSync")
            .field("topic", &self.inner.topic)
            .field("label", &self.inner.label)
            .field("local_revision", &state.local.current())
            .field("started", &state.started)
            .field("stopped", &self.inner.is_stopped())
            .finish()
    }
}

impl<T: Send + 'static> Inner<T> {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn local_revision(&self) -> Revision {
        lock(&self.state).local.current()
    }

    fn report(&self, ctx: SyncErrorContext<'_>) {
        emit(self.on_error.as_ref(), &ctx.with_topic(&self.topic));
    }

    async fn refresh(self: &Arc<Self>) -> Result<(), SyncError> {
        match self.claim_refresh() {
            Some(claim) => claim.run().await,
            None => Ok(()),
        }
    }

    /// Enter the refresh gate synchronously.
    ///
    /// `None` if stopped or if a refresh is already in flight, in which case
    /// one more round has been queued on it.
    fn claim_refresh(self: &Arc<Self>) -> Option<InFlight<T>> {
        if self.is_stopped() {
            tracing::debug!("refresh skipped (stopped)");
            return None;
        }

        let entry = lock(&self.state).gate.begin();
        if entry == GateEntry::Coalesced {
            tracing::debug!("refresh coalesced (in-flight)");
            return None;
        }
        tracing::debug!("refresh started");
        Some(InFlight {
            inner: Arc::clone(self),
            active: true,
        })
    }

    /// Fetch, validate, compare, apply. One pass of the refresh loop.
    async fn refresh_round(&self) -> Result<(), SyncError> {
        let envelope = match self.provider.get_snapshot().await {
            Ok(envelope) => envelope,
            Err(err) => {
                let err = SyncError::Snapshot(err);
                self.report(
                    SyncErrorContext::new(SyncPhase::GetSnapshot, &err)
                        .with_local_revision(self.local_revision()),
                );
                return Err(err);
            }
        };

        let snapshot = match envelope.verify() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let err = SyncError::Protocol(err);
                self.report(
                    SyncErrorContext::new(SyncPhase::Protocol, &err)
                        .with_local_revision(self.local_revision()),
                );
                return Err(err);
            }
        };

        if self.is_stopped() {
            return Ok(());
        }

        let local = lock(&self.state).local;
        let revision = snapshot.revision;
        if !local.accepts(revision) {
            tracing::debug!(
                snapshot_revision = %revision,
                local_revision = %local.current(),
                "snapshot skipped (not newer)"
            );
            return Ok(());
        }

        // A stop() landing between the check above and this call does not
        // cancel the apply; only the commit below is skipped.
        if let Err(err) = self.applier.apply(snapshot).await {
            let err = SyncError::Apply(err);
            self.report(
                SyncErrorContext::new(SyncPhase::Apply, &err)
                    .with_local_revision(local.current())
                    .with_snapshot_revision(revision),
            );
            return Err(err);
        }

        if self.is_stopped() {
            tracing::debug!(revision = %revision, "apply finished after stop, not committed");
            return Ok(());
        }
        lock(&self.state).local.advance(revision);
        tracing::debug!(revision = %revision, "applied snapshot");
        Ok(())
    }

    fn handle_invalidation(self: &Arc<Self>, payload: Value) {
        if self.is_stopped() {
            return;
        }
        let _enter = self.span.enter();

        let event = match InvalidationEvent::from_value(&payload) {
            Ok(event) => event,
            Err(err) => {
                let err = SyncError::Protocol(err);
                self.report(
                    SyncErrorContext::new(SyncPhase::Protocol, &err)
                        .with_source_event(&payload)
                        .with_local_revision(self.local_revision()),
                );
                return;
            }
        };

        let local = self.local_revision();
        match admit(&event, &self.topic, local) {
            Admission::Refresh => {}
            Admission::OtherTopic => return,
            Admission::Stale => {
                tracing::debug!(
                    event_revision = %event.revision,
                    local_revision = %local,
                    "invalidation skipped (not newer)"
                );
                return;
            }
        }

        if let Some(predicate) = &self.should_refresh {
            if !predicate(&event) {
                tracing::debug!(event_revision = %event.revision, "invalidation skipped (should_refresh)");
                return;
            }
        }

        tracing::debug!(
            event_revision = %event.revision,
            source_id = event.source_id.as_deref(),
            "invalidation triggered refresh"
        );
        match &self.throttle {
            Some(throttle) => {
                if let Err(err) = throttle.trigger() {
                    self.report(
                        SyncErrorContext::new(SyncPhase::Throttle, &err)
                            .with_source_event(&payload)
                            .with_event_revision(event.revision)
                            .with_local_revision(local),
                    );
                }
            }
            None => self.spawn_refresh_for(Some((&payload, &event))),
        }
    }

    fn spawn_refresh(self: &Arc<Self>) {
        self.spawn_refresh_for(None);
    }

    /// Run a refresh in the background; its errors were already reported.
    ///
    /// The gate is entered before spawning, so a synchronous burst of
    /// triggers coalesces even when the provider never suspends.
    fn spawn_refresh_for(self: &Arc<Self>, cause: Option<(&Value, &InvalidationEvent)>) {
        match Handle::try_current() {
            Ok(handle) => {
                let Some(claim) = self.claim_refresh() else {
                    return;
                };
                let span = self.span.clone();
                handle.spawn(
                    async move {
                        if let Err(err) = claim.run().await {
                            tracing::debug!(error = %err, "background refresh failed");
                        }
                    }
                    .instrument(span),
                );
            }
            Err(_) => {
                let err = SyncError::NoRuntime;
                let mut ctx = SyncErrorContext::new(SyncPhase::Invalidation, &err)
                    .with_local_revision(self.local_revision());
                if let Some((payload, event)) = cause {
                    ctx = ctx
                        .with_source_event(payload)
                        .with_event_revision(event.revision);
                    if let Some(source_id) = event.source_id.as_deref() {
                        ctx = ctx.with_source_id(source_id);
                    }
                }
                self.report(ctx);
            }
        }
    }
}

impl<T: Send + 'static> Drop for Inner<T> {
    fn drop(&mut self) {
        let unsubscribe = lock(&self.state).unsubscribe.take();
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
        if let Some(throttle) = &self.throttle {
            throttle.dispose();
        }
    }
}

/// Ownership of the refresh gate.
///
/// Releases the gate if a round fails or the claim is dropped unfinished,
/// including a spawned task that never got polled.
struct InFlight<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    active: bool,
}

impl<T: Send + 'static> InFlight<T> {
    /// Run rounds until no further request was queued.
    async fn run(mut self) -> Result<(), SyncError> {
        loop {
            lock(&self.inner.state).gate.next_round();
            self.inner.refresh_round().await?;

            let again = lock(&self.inner.state)
                .gate
                .finish_round(self.inner.is_stopped());
            if !again {
                self.active = false;
                return Ok(());
            }
            tracing::debug!("refresh re-running for queued request");
        }
    }
}

impl<T: Send + 'static> Drop for InFlight<T> {
    fn drop(&mut self) {
        if self.active {
            lock(&self.inner.state).gate.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApplyError, MemoryApplier, MemoryTransport, TransportError};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use sync_types::SnapshotEnvelope;
    use tokio::time::sleep;

    type Phases = Arc<Mutex<Vec<SyncPhase>>>;

    fn topic() -> Topic {
        Topic::new("settings").unwrap()
    }

    fn setup(
        revision: u64,
        data: &str,
    ) -> (MemoryTransport<String>, MemoryApplier<String>, Phases) {
        (
            MemoryTransport::new(Revision::new(revision), data.to_string()),
            MemoryApplier::new(),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    fn engine(
        transport: &MemoryTransport<String>,
        applier: &MemoryApplier<String>,
        phases: &Phases,
    ) -> RevisionSyncBuilder<String> {
        let sink = Arc::clone(phases);
        RevisionSync::builder("settings", transport.clone(), transport.clone(), applier.clone())
            .on_error(move |ctx: &SyncErrorContext<'_>| sink.lock().unwrap().push(ctx.phase))
    }

    fn seen_phases(phases: &Phases) -> Vec<SyncPhase> {
        phases.lock().unwrap().clone()
    }

    /// Let spawned refresh tasks run to completion.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // ===========================================
    // Construction
    // ===========================================

    #[test]
    fn blank_topic_is_rejected() {
        let (transport, applier, _) = setup(0, "");
        let result = RevisionSync::builder("  ", transport.clone(), transport, applier).build();
        assert!(matches!(
            result,
            Err(SyncError::Protocol(sync_types::ProtocolError::EmptyTopic))
        ));
    }

    #[test]
    fn new_engine_has_nothing_applied() {
        let (transport, applier, phases) = setup(1, "x");
        let sync = engine(&transport, &applier, &phases).label("w1").build().unwrap();
        assert_eq!(sync.local_revision(), Revision::ZERO);
        assert!(!sync.has_applied_snapshot());
        assert!(!sync.is_running());
        assert_eq!(sync.label(), Some("w1"));
        assert_eq!(sync.topic().as_str(), "settings");
    }

    // ===========================================
    // Lifecycle
    // ===========================================

    #[tokio::test]
    async fn start_subscribes_then_applies_initial_snapshot() {
        let (transport, applier, phases) = setup(1, "hello");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        sync.start().await.unwrap();

        assert!(sync.is_running());
        assert_eq!(transport.subscriber_count(), 1);
        assert_eq!(applier.applied_count(), 1);
        assert_eq!(applier.last_applied().unwrap().data, "hello");
        assert_eq!(sync.local_revision(), Revision::new(1));
        assert!(seen_phases(&phases).is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (transport, applier, phases) = setup(1, "hello");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        sync.start().await.unwrap();
        sync.start().await.unwrap();

        assert_eq!(transport.subscribe_count(), 1);
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn subscribe_failure_skips_refresh() {
        let (transport, applier, phases) = setup(1, "hello");
        transport.fail_next_subscribe("bus down");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let result = sync.start().await;

        assert!(matches!(result, Err(SyncError::Subscribe(_))));
        assert_eq!(transport.fetch_count(), 0);
        assert!(!sync.is_running());
        assert_eq!(seen_phases(&phases), vec![SyncPhase::Subscribe]);
    }

    #[tokio::test]
    async fn initial_refresh_failure_unsubscribes() {
        let (transport, applier, phases) = setup(1, "hello");
        transport.fail_next_fetch("503");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let result = sync.start().await;

        assert_eq!(
            result,
            Err(SyncError::Snapshot(TransportError::FetchFailed("503".into())))
        );
        assert_eq!(transport.subscriber_count(), 0);
        assert!(!sync.is_running());
        assert_eq!(seen_phases(&phases), vec![SyncPhase::GetSnapshot]);
    }

    #[tokio::test]
    async fn start_after_stop_fails_without_touching_transport() {
        let (transport, applier, phases) = setup(1, "hello");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        sync.stop();
        sync.stop();
        let result = sync.start().await;

        assert_eq!(result, Err(SyncError::Stopped));
        assert_eq!(transport.subscribe_count(), 0);
        assert_eq!(transport.fetch_count(), 0);
        assert_eq!(seen_phases(&phases), vec![SyncPhase::Start]);
    }

    #[tokio::test]
    async fn stop_unsubscribes() {
        let (transport, applier, phases) = setup(1, "hello");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        sync.start().await.unwrap();
        sync.stop();

        assert_eq!(transport.subscriber_count(), 0);
        assert!(sync.is_stopped());
        assert!(!sync.is_running());
    }

    #[tokio::test]
    async fn dropping_the_engine_unsubscribes() {
        let (transport, applier, phases) = setup(1, "hello");
        let sync = engine(&transport, &applier, &phases).build().unwrap();
        sync.start().await.unwrap();
        assert_eq!(transport.subscriber_count(), 1);

        drop(sync);
        assert_eq!(transport.subscriber_count(), 0);
    }

    // ===========================================
    // Refresh
    // ===========================================

    #[tokio::test]
    async fn refresh_works_before_start() {
        let (transport, applier, phases) = setup(3, "x");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        sync.refresh().await.unwrap();

        assert_eq!(sync.local_revision(), Revision::new(3));
        assert_eq!(transport.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn refresh_after_stop_is_noop() {
        let (transport, applier, phases) = setup(3, "x");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        sync.stop();
        sync.refresh().await.unwrap();

        assert_eq!(transport.fetch_count(), 0);
        assert_eq!(applier.applied_count(), 0);
    }

    #[tokio::test]
    async fn zero_revision_is_applied_once() {
        let (transport, applier, phases) = setup(0, "empty");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        sync.refresh().await.unwrap();
        sync.refresh().await.unwrap();

        assert_eq!(applier.applied_count(), 1);
        assert!(sync.has_applied_snapshot());
        assert_eq!(sync.local_revision(), Revision::ZERO);
    }

    #[tokio::test]
    async fn older_snapshot_is_skipped() {
        let (transport, applier, phases) = setup(5, "new");
        let sync = engine(&transport, &applier, &phases).build().unwrap();
        sync.refresh().await.unwrap();

        transport.set_snapshot(Revision::new(4), "old".into());
        sync.refresh().await.unwrap();

        assert_eq!(applier.applied_count(), 1);
        assert_eq!(sync.local_revision(), Revision::new(5));
    }

    #[tokio::test]
    async fn non_canonical_snapshot_revision_is_a_protocol_error() {
        let (transport, applier, phases) = setup(1, "x");
        transport.set_envelope(SnapshotEnvelope::new("007", "bad".to_string()));
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let result = sync.refresh().await;

        assert!(matches!(result, Err(SyncError::Protocol(_))));
        assert_eq!(applier.applied_count(), 0);
        assert_eq!(seen_phases(&phases), vec![SyncPhase::Protocol]);

        // Not fatal to the engine.
        transport.set_snapshot(Revision::new(8), "good".into());
        sync.refresh().await.unwrap();
        assert_eq!(sync.local_revision(), Revision::new(8));
    }

    #[tokio::test]
    async fn apply_failure_propagates_and_keeps_revision() {
        let (transport, applier, phases) = setup(2, "x");
        applier.fail_next_apply("store locked");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let result = sync.refresh().await;

        assert_eq!(result, Err(SyncError::Apply(ApplyError::new("store locked"))));
        assert_eq!(sync.local_revision(), Revision::ZERO);
        assert_eq!(seen_phases(&phases), vec![SyncPhase::Apply]);

        sync.refresh().await.unwrap();
        assert_eq!(sync.local_revision(), Revision::new(2));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_coalesce() {
        let (transport, applier, phases) = setup(1, "x");
        transport.set_fetch_delay(Duration::from_millis(100));
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let first = tokio::spawn({
            let sync = sync.clone();
            async move { sync.refresh().await }
        });
        tokio::task::yield_now().await;

        for _ in 0..10 {
            sync.refresh().await.unwrap();
        }
        first.await.unwrap().unwrap();

        assert_eq!(transport.fetch_count(), 2);
        assert_eq!(applier.applied_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_fetch_prevents_apply() {
        let (transport, applier, phases) = setup(1, "x");
        transport.set_fetch_delay(Duration::from_millis(100));
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let pending = tokio::spawn({
            let sync = sync.clone();
            async move { sync.refresh().await }
        });
        sleep(Duration::from_millis(50)).await;
        sync.stop();

        pending.await.unwrap().unwrap();
        assert_eq!(applier.applied_count(), 0);
        assert_eq!(sync.local_revision(), Revision::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_apply_does_not_commit() {
        let (transport, applier, phases) = setup(4, "x");
        applier.set_apply_delay(Duration::from_millis(100));
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let pending = tokio::spawn({
            let sync = sync.clone();
            async move { sync.refresh().await }
        });
        sleep(Duration::from_millis(50)).await;
        sync.stop();

        pending.await.unwrap().unwrap();
        assert_eq!(sync.local_revision(), Revision::ZERO);
    }

    // ===========================================
    // Invalidation Handling
    // ===========================================

    #[tokio::test]
    async fn invalidation_triggers_refresh() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases).build().unwrap();
        sync.start().await.unwrap();

        transport.commit(&topic(), "b".into());
        settle().await;

        assert_eq!(sync.local_revision(), Revision::new(2));
        assert_eq!(applier.last_applied().unwrap().data, "b");
    }

    #[tokio::test]
    async fn synchronous_burst_coalesces_without_fetch_delay() {
        let (transport, applier, phases) = setup(0, "v0");
        let sync = engine(&transport, &applier, &phases).build().unwrap();
        sync.start().await.unwrap();
        assert_eq!(transport.fetch_count(), 1);

        for i in 1..=10 {
            transport.commit(&topic(), format!("v{}", i));
        }
        settle().await;

        // The spawned round starts after the whole burst, so one fetch covers it.
        assert_eq!(transport.fetch_count(), 2);
        assert_eq!(applier.applied_count(), 2);
        assert_eq!(sync.local_revision(), Revision::new(10));
        assert!(seen_phases(&phases).is_empty());
    }

    #[test]
    fn dropped_claim_releases_the_gate() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let claim = sync.inner.claim_refresh();
        assert!(claim.is_some());
        assert!(sync.inner.claim_refresh().is_none(), "second entry coalesces");

        drop(claim);
        assert_eq!(lock(&sync.inner.state).gate, RefreshGate::default());
        assert!(sync.inner.claim_refresh().is_some());
    }

    #[tokio::test]
    async fn malformed_events_are_reported_and_dropped() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases).build().unwrap();
        sync.start().await.unwrap();

        transport.emit(json!({ "topic": "", "revision": "2" }));
        transport.emit(json!({ "topic": "settings", "revision": "02" }));
        transport.emit(json!({ "topic": "settings", "revision": 2 }));
        transport.emit(json!("settings"));
        settle().await;

        assert_eq!(seen_phases(&phases), vec![SyncPhase::Protocol; 4]);
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn protocol_report_carries_raw_event() {
        let (transport, applier, _) = setup(1, "a");
        let raw = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&raw);
        let sync = RevisionSync::builder("settings", transport.clone(), transport.clone(), applier)
            .on_error(move |ctx: &SyncErrorContext<'_>| {
                *sink.lock().unwrap() = ctx.source_event.cloned();
            })
            .build()
            .unwrap();
        sync.start().await.unwrap();

        transport.emit(json!({ "topic": "settings", "revision": "-1" }));

        assert_eq!(
            *raw.lock().unwrap(),
            Some(json!({ "topic": "settings", "revision": "-1" }))
        );
    }

    #[tokio::test]
    async fn other_topics_are_ignored() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases).build().unwrap();
        sync.start().await.unwrap();

        transport.publish(&Topic::new("other").unwrap(), Revision::new(99));
        settle().await;

        assert_eq!(transport.fetch_count(), 1);
        assert!(seen_phases(&phases).is_empty());
    }

    #[tokio::test]
    async fn predicate_filters_events() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases)
            .should_refresh(|event| event.source_id.as_deref() != Some("self"))
            .build()
            .unwrap();
        sync.start().await.unwrap();

        transport.emit(
            InvalidationEvent::new(topic(), Revision::new(2))
                .with_source_id("self")
                .to_value(),
        );
        settle().await;
        assert_eq!(transport.fetch_count(), 1);

        transport.emit(
            InvalidationEvent::new(topic(), Revision::new(2))
                .with_source_id("peer")
                .to_value(),
        );
        settle().await;
        assert_eq!(transport.fetch_count(), 2);
    }

    #[tokio::test]
    async fn invalidation_refresh_errors_are_reported_not_fatal() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases).build().unwrap();
        sync.start().await.unwrap();

        transport.fail_next_fetch("503");
        transport.publish(&topic(), Revision::new(2));
        settle().await;
        assert_eq!(seen_phases(&phases), vec![SyncPhase::GetSnapshot]);

        transport.commit(&topic(), "c".into());
        settle().await;
        assert_eq!(sync.local_revision(), Revision::new(2));
    }

    #[test]
    fn invalidation_without_runtime_is_reported() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases).build().unwrap();

        let handler = sync.invalidation_handler();
        handler(json!({ "topic": "settings", "revision": "5" }));

        assert_eq!(seen_phases(&phases), vec![SyncPhase::Invalidation]);
    }

    #[test]
    fn throttle_without_runtime_is_reported() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases)
            .throttle(ThrottleOptions::debounce(50))
            .build()
            .unwrap();

        let handler = sync.invalidation_handler();
        handler(json!({ "topic": "settings", "revision": "5" }));

        assert_eq!(seen_phases(&phases), vec![SyncPhase::Throttle]);
    }

    #[test]
    fn panicking_error_callback_is_contained() {
        let (transport, applier, _) = setup(1, "a");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let sync = RevisionSync::builder("settings", transport.clone(), transport, applier)
            .on_error(move |_: &SyncErrorContext<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                panic!("observer bug");
            })
            .build()
            .unwrap();

        let handler = sync.invalidation_handler();
        handler(json!({ "topic": "" }));
        handler(json!({ "topic": "" }));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // ===========================================
    // Throttled Engine
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn debounced_engine_fetches_once_per_burst() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases)
            .throttle(ThrottleOptions::debounce(50))
            .build()
            .unwrap();
        sync.start().await.unwrap();

        for i in 0..5 {
            transport.commit(&topic(), format!("v{}", i));
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.fetch_count(), 1);
        assert!(sync.throttle().unwrap().has_pending());

        sleep(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(transport.fetch_count(), 2);
        assert_eq!(sync.local_revision(), Revision::new(6));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_disposes_throttle_timers() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases)
            .throttle(ThrottleOptions::debounce(50))
            .build()
            .unwrap();
        sync.start().await.unwrap();

        transport.commit(&topic(), "b".into());
        sync.stop();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(transport.fetch_count(), 1);
        assert!(!sync.throttle().unwrap().has_pending());
    }

    #[test]
    fn passthrough_options_install_no_throttle() {
        let (transport, applier, phases) = setup(1, "a");
        let sync = engine(&transport, &applier, &phases)
            .throttle(ThrottleOptions::default())
            .build()
            .unwrap();
        assert!(sync.throttle().is_none());
    }
}
