//! Snapshot envelopes - full state for a topic as of one revision.

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Revision};

/// A snapshot as returned by a snapshot provider.
///
/// The revision is still untrusted text at this point; call
/// [`SnapshotEnvelope::verify`] before handing the data to anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEnvelope<T> {
    /// String representation of the revision (canonical `u64` decimal).
    pub revision: String,
    /// The state payload.
    pub data: T,
}

impl<T> SnapshotEnvelope<T> {
    /// Create an envelope from any revision-like value.
    pub fn new(revision: impl ToString, data: T) -> Self {
        Self {
            revision: revision.to_string(),
            data,
        }
    }

    /// Validate the revision, yielding a [`Snapshot`].
    pub fn verify(self) -> Result<Snapshot<T>, ProtocolError> {
        let revision = Revision::parse(&self.revision)?;
        Ok(Snapshot {
            revision,
            data: self.data,
        })
    }
}

/// A snapshot whose revision passed canonical-form validation.
///
/// This is the only shape appliers ever see. It is applied whole or not
/// at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    /// The revision this state corresponds to.
    pub revision: Revision,
    /// The state payload.
    pub data: T,
}

impl<T> From<Snapshot<T>> for SnapshotEnvelope<T> {
    fn from(snapshot: Snapshot<T>) -> Self {
        Self {
            revision: snapshot.revision.to_string(),
            data: snapshot.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_canonical() {
        let snapshot = SnapshotEnvelope::new("7", "hello").verify().unwrap();
        assert_eq!(snapshot.revision, Revision::new(7));
        assert_eq!(snapshot.data, "hello");
    }

    #[test]
    fn verify_rejects_non_canonical() {
        let envelope = SnapshotEnvelope::new("007", ());
        assert!(matches!(
            envelope.verify(),
            Err(ProtocolError::NonCanonicalRevision(_))
        ));
    }

    #[test]
    fn envelope_serialize_shape() {
        let envelope = SnapshotEnvelope::new(1, 42);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"revision\":\"1\""));
        assert!(json.contains("\"data\":42"));
    }

    #[test]
    fn snapshot_converts_back_to_envelope() {
        let snapshot = Snapshot {
            revision: Revision::new(9),
            data: vec![1, 2, 3],
        };
        let envelope: SnapshotEnvelope<Vec<i32>> = snapshot.clone().into();
        assert_eq!(envelope.revision, "9");
        assert_eq!(envelope.verify().unwrap(), snapshot);
    }
}
