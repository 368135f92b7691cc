//! Error types for statesync wire types.

use thiserror::Error;

/// Malformed data crossing the trust boundary.
///
/// Raised whenever a topic, revision or invalidation payload fails
/// validation. Values that produce this error are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Topic was empty or whitespace only.
    #[error("topic must be a non-empty string")]
    EmptyTopic,

    /// Topic field missing or not a string.
    #[error("topic is missing or not a string")]
    MissingTopic,

    /// Revision is not a canonical decimal u64 string.
    #[error("non-canonical revision: {0}")]
    NonCanonicalRevision(String),

    /// Invalidation payload is not a JSON object.
    #[error("invalidation payload is not an object: {0}")]
    NotAnObject(String),
}
