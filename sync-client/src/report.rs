//! Error reporting.
//!
//! Every failure the engine observes goes through [`emit`]: it is logged with
//! `tracing` and then handed to the caller's error callback, if any. A
//! panicking callback is caught and logged; it never unwinds into the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use sync_types::{Revision, Topic};

use crate::SyncError;

/// Where in the sync lifecycle an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    /// `start()` was refused.
    Start,
    /// Subscribing to invalidations failed.
    Subscribe,
    /// An accepted invalidation could not be turned into a refresh.
    Invalidation,
    /// A refresh failed for a reason not tagged more precisely.
    Refresh,
    /// The snapshot provider failed.
    GetSnapshot,
    /// The applier failed.
    Apply,
    /// Malformed topic, revision or event.
    Protocol,
    /// The throttle driver could not schedule a timer.
    Throttle,
}

impl SyncPhase {
    /// Wire name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Start => "start",
            SyncPhase::Subscribe => "subscribe",
            SyncPhase::Invalidation => "invalidation",
            SyncPhase::Refresh => "refresh",
            SyncPhase::GetSnapshot => "getSnapshot",
            SyncPhase::Apply => "apply",
            SyncPhase::Protocol => "protocol",
            SyncPhase::Throttle => "throttle",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one reported error.
///
/// Only `phase` and `error` are always present; the rest is best-effort
/// triage context.
#[derive(Debug, Clone)]
pub struct SyncErrorContext<'a> {
    /// Failing phase.
    pub phase: SyncPhase,
    /// Engine topic.
    pub topic: Option<&'a Topic>,
    /// The error itself.
    pub error: &'a SyncError,
    /// Raw invalidation payload, for protocol errors.
    pub source_event: Option<&'a Value>,
    /// Local revision when the error happened.
    pub local_revision: Option<Revision>,
    /// Revision carried by the triggering event.
    pub event_revision: Option<Revision>,
    /// Revision of the fetched snapshot.
    pub snapshot_revision: Option<Revision>,
    /// Source id of the triggering event.
    pub source_id: Option<&'a str>,
    /// 1-based attempt number (retry reporting).
    pub attempt: Option<u32>,
    /// Another attempt follows (retry reporting).
    pub will_retry: Option<bool>,
    /// Delay before the next attempt (retry reporting).
    pub next_delay: Option<Duration>,
}

impl<'a> SyncErrorContext<'a> {
    /// Context with only a phase and an error.
    pub fn new(phase: SyncPhase, error: &'a SyncError) -> Self {
        Self {
            phase,
            topic: None,
            error,
            source_event: None,
            local_revision: None,
            event_revision: None,
            snapshot_revision: None,
            source_id: None,
            attempt: None,
            will_retry: None,
            next_delay: None,
        }
    }

    /// Set the topic.
    pub fn with_topic(mut self, topic: &'a Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Set the raw source event.
    pub fn with_source_event(mut self, event: &'a Value) -> Self {
        self.source_event = Some(event);
        self
    }

    /// Set the local revision.
    pub fn with_local_revision(mut self, revision: Revision) -> Self {
        self.local_revision = Some(revision);
        self
    }

    /// Set the event revision.
    pub fn with_event_revision(mut self, revision: Revision) -> Self {
        self.event_revision = Some(revision);
        self
    }

    /// Set the snapshot revision.
    pub fn with_snapshot_revision(mut self, revision: Revision) -> Self {
        self.snapshot_revision = Some(revision);
        self
    }

    /// Set the source id.
    pub fn with_source_id(mut self, source_id: &'a str) -> Self {
        self.source_id = Some(source_id);
        self
    }

    /// Set retry details.
    pub fn with_retry(mut self, attempt: u32, next_delay: Duration) -> Self {
        self.attempt = Some(attempt);
        self.will_retry = Some(true);
        self.next_delay = Some(next_delay);
        self
    }
}

/// Caller-supplied error observer.
pub type ErrorCallback = Arc<dyn Fn(&SyncErrorContext<'_>) + Send + Sync>;

/// Log an error and hand it to `callback`.
///
/// Retry notices (`will_retry == Some(true)`) log at warn level, everything
/// else at error level.
pub fn emit(callback: Option<&ErrorCallback>, ctx: &SyncErrorContext<'_>) {
    let topic = ctx.topic.map(Topic::as_str).unwrap_or_default();
    if ctx.will_retry == Some(true) {
        tracing::warn!(
            topic,
            phase = %ctx.phase,
            attempt = ctx.attempt,
            next_delay_ms = ctx.next_delay.map(|d| d.as_millis() as u64),
            error = %ctx.error,
            "{} retry scheduled",
            ctx.phase
        );
    } else {
        tracing::error!(
            topic,
            phase = %ctx.phase,
            local_revision = ctx.local_revision.map(Revision::value),
            error = %ctx.error,
            "{} error",
            ctx.phase
        );
    }

    let Some(callback) = callback else {
        return;
    };
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
        tracing::error!(
            topic,
            panic = panic_message(panic.as_ref()),
            "on_error callback panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
