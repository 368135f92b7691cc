//! Identity and ordering types for statesync.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::ProtocolError;

/// Decimal form of `u64::MAX`, the largest admissible revision.
pub const MAX_REVISION: &str = "18446744073709551615";

/// Check whether `value` is a canonical revision string.
///
/// Canonical means `^(0|[1-9][0-9]*)$` and numerically within `u64`.
///
/// ```
/// use statesync_types::is_canonical;
///
/// assert!(is_canonical("0"));
/// assert!(is_canonical("18446744073709551615"));
/// assert!(!is_canonical("01"));
/// assert!(!is_canonical("18446744073709551616"));
/// ```
pub fn is_canonical(value: &str) -> bool {
    let bytes = value.as_bytes();
    match bytes {
        [] => false,
        [b'0'] => true,
        [b'0', ..] => false,
        _ => {
            bytes.len() <= MAX_REVISION.len()
                && bytes.iter().all(u8::is_ascii_digit)
                && (bytes.len() < MAX_REVISION.len() || value <= MAX_REVISION)
        }
    }
}

/// Same as [`is_canonical`] for an arbitrary JSON value.
///
/// Non-strings are never canonical, even numbers that look right.
pub fn is_canonical_value(value: &Value) -> bool {
    value.as_str().is_some_and(is_canonical)
}

/// Compare two revision strings using the canonical ordering.
///
/// Longer strings represent larger numbers (no leading zeros assumed),
/// equal lengths compare lexicographically. No numeric parsing happens,
/// so this works on any canonical input.
///
/// ```
/// use statesync_types::compare_revisions;
/// use std::cmp::Ordering;
///
/// assert_eq!(compare_revisions("9", "10"), Ordering::Less);
/// assert_eq!(compare_revisions("42", "42"), Ordering::Equal);
/// assert_eq!(compare_revisions("100", "99"), Ordering::Greater);
/// ```
pub fn compare_revisions(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// A validated state version.
///
/// Every canonical decimal string maps to exactly one `u64`, so the value is
/// stored numerically. On the wire it is always the canonical string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(u64);

impl Revision {
    /// The "nothing applied yet" sentinel, `"0"`.
    pub const ZERO: Revision = Revision(0);

    /// Create a revision from a raw `u64`.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw `u64` value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Next revision (saturating, never wraps to zero).
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Parse a canonical revision string.
    ///
    /// This is the admission gate for every revision entering the system.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        if !is_canonical(value) {
            return Err(ProtocolError::NonCanonicalRevision(format!("{:?}", value)));
        }
        value
            .parse::<u64>()
            .map(Self)
            .map_err(|_| ProtocolError::NonCanonicalRevision(format!("{:?}", value)))
    }

    /// Parse a revision out of an untyped JSON value.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        match value.as_str() {
            Some(raw) => Self::parse(raw),
            None => Err(ProtocolError::NonCanonicalRevision(value.to_string())),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Revision({})", self.0)
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Revision> for u64 {
    fn from(rev: Revision) -> Self {
        rev.0
    }
}

impl std::str::FromStr for Revision {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Revision::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a synchronized resource.
///
/// Must be non-empty after trimming whitespace. The original string is
/// kept verbatim; topic matching is exact.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Create a topic, rejecting empty or whitespace-only names.
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ProtocolError::EmptyTopic);
        }
        Ok(Self(name))
    }

    /// Get the topic name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Topic {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Topic {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl PartialEq<str> for Topic {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({:?})", self.0)
    }
}
