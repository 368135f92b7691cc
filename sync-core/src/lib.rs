//! # sync-core
//!
//! Pure logic for statesync (no I/O, instant tests).
//!
//! This crate implements the decision-making parts of the invalidation-pull
//! protocol without any timers, tasks or network access:
//! - [`ThrottleController`] - debounce/throttle state machine over injected time
//! - [`RetryPolicy`] - exponential backoff schedule for snapshot fetches
//! - [`RefreshGate`] - single-flight coalescing of refresh requests
//! - [`LocalRevision`] and [`admit`] - revision gating of snapshots and events
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input (including the
//! current `Instant`) and produce output without side effects. The actual
//! timers and I/O live in `sync-client`, which interprets the actions
//! produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod refresh;
pub mod throttle;

pub use backoff::RetryPolicy;
pub use refresh::{admit, Admission, GateEntry, LocalRevision, RefreshGate};
pub use throttle::{
    ThrottleAction, ThrottleController, ThrottleMode, ThrottleOptions, TimerKind, TimerToken,
};
