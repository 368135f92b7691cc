//! # sync-types
//!
//! Wire types for the statesync invalidation-pull protocol.
//!
//! This crate provides the foundational types used across all statesync crates:
//! - [`Revision`], [`Topic`] - Ordering and identity types
//! - [`InvalidationEvent`] - "Topic X changed to at least revision Y" hint
//! - [`SnapshotEnvelope`], [`Snapshot`] - Full state as of a revision
//! - [`ProtocolError`] - Trust-boundary violations
//!
//! Everything here is JSON-friendly: revisions travel as canonical decimal
//! strings so they survive transports whose numbers lose `u64` precision.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod messages;

pub use envelope::{Snapshot, SnapshotEnvelope};
pub use error::ProtocolError;
pub use ids::{compare_revisions, is_canonical, is_canonical_value, Revision, Topic, MAX_REVISION};
pub use messages::InvalidationEvent;
