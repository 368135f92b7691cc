//! Refresh coalescing and revision gating.
//!
//! [`RefreshGate`] collapses any burst of refresh requests into one running
//! execution plus at most one follow-up round. [`LocalRevision`] tracks what
//! has been applied, and [`admit`] decides what to do with a validated
//! invalidation event.

use sync_types::{InvalidationEvent, Revision, Topic};

/// Outcome of asking the gate to start a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEntry {
    /// Nothing was in flight; the caller now owns the refresh loop.
    Run,
    /// A refresh is in flight; it will run one more round for this request.
    Coalesced,
}

/// Single-flight state: one refresh in flight, at most one queued.
///
/// The queue is a flag, not a counter. Any number of requests arriving
/// during one round produce exactly one extra round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshGate {
    in_flight: bool,
    queued: bool,
}

impl RefreshGate {
    /// Create an idle gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a refresh.
    pub fn begin(&mut self) -> GateEntry {
        if self.in_flight {
            self.queued = true;
            GateEntry::Coalesced
        } else {
            self.in_flight = true;
            self.queued = false;
            GateEntry::Run
        }
    }

    /// Start a round: requests from here on queue another round.
    pub fn next_round(&mut self) {
        self.queued = false;
    }

    /// End a round. Returns `true` if the loop must run again.
    ///
    /// When this returns `false` the gate is idle again; deciding and
    /// clearing happen in one step so a request cannot slip in between.
    pub fn finish_round(&mut self, stopped: bool) -> bool {
        if self.queued && !stopped {
            return true;
        }
        self.in_flight = false;
        self.queued = false;
        false
    }

    /// Leave the loop after a failed round.
    pub fn abort(&mut self) {
        self.in_flight = false;
        self.queued = false;
    }

    /// A refresh loop is running.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Another round has been requested.
    pub fn queued(&self) -> bool {
        self.queued
    }
}

/// The last applied revision of one engine.
///
/// `Revision::ZERO` doubles as "nothing applied", so a separate flag records
/// whether any snapshot went through. A first snapshot at `"0"` is real and
/// must still be applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalRevision {
    revision: Revision,
    applied: bool,
}

impl LocalRevision {
    /// Nothing applied yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current applied revision, `ZERO` if none.
    pub fn current(&self) -> Revision {
        self.revision
    }

    /// At least one snapshot has been applied.
    pub fn has_applied(&self) -> bool {
        self.applied
    }

    /// Whether a fetched snapshot at `revision` should be applied.
    pub fn accepts(&self, revision: Revision) -> bool {
        !self.applied || revision > self.revision
    }

    /// Record an applied snapshot. Never moves backwards.
    pub fn advance(&mut self, revision: Revision) {
        if !self.applied || revision > self.revision {
            self.revision = revision;
        }
        self.applied = true;
    }
}

/// What to do with a validated invalidation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Newer than local state: refresh.
    Refresh,
    /// Belongs to another topic sharing the channel.
    OtherTopic,
    /// At or below the local revision (duplicate or out of order).
    Stale,
}

/// Decide whether `event` should trigger a refresh of `topic`.
///
/// Topic matching is exact. The stale check compares against the current
/// revision only, so an event at `"0"` is stale even before anything has
/// been applied; the initial refresh on start covers that case.
pub fn admit(event: &InvalidationEvent, topic: &Topic, local: Revision) -> Admission {
    if event.topic != *topic {
        Admission::OtherTopic
    } else if event.revision <= local {
        Admission::Stale
    } else {
        Admission::Refresh
    }
}
