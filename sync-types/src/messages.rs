//! Protocol messages for statesync.
//!
//! An invalidation carries no state. It only says "topic X changed to at
//! least revision Y"; consumers pull a snapshot if they care.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProtocolError, Revision, Topic};

/// A validated invalidation notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    /// Topic that changed.
    pub topic: Topic,
    /// Revision the topic changed to (at least).
    pub revision: Revision,
    /// Identifier of the emitter (window, process), informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Emitter wall clock in milliseconds since the Unix epoch, not trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
}

impl InvalidationEvent {
    /// Create an event with no optional metadata.
    pub fn new(topic: Topic, revision: Revision) -> Self {
        Self {
            topic,
            revision,
            source_id: None,
            timestamp_ms: None,
        }
    }

    /// Attach a source identifier.
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Attach an emitter timestamp.
    pub fn with_timestamp_ms(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Validate an untyped payload delivered by a transport.
    ///
    /// `topic` must be a non-blank string and `revision` a canonical
    /// revision string. `sourceId` is kept only if it is a string and
    /// `timestampMs` only if it is a non-negative integer; anything else in
    /// those fields is dropped rather than rejected.
    pub fn from_value(payload: &Value) -> Result<Self, ProtocolError> {
        let fields = payload
            .as_object()
            .ok_or_else(|| ProtocolError::NotAnObject(payload.to_string()))?;

        let topic = match fields.get("topic").and_then(Value::as_str) {
            Some(raw) => Topic::new(raw)?,
            None => return Err(ProtocolError::MissingTopic),
        };

        let revision = match fields.get("revision") {
            Some(raw) => Revision::from_value(raw)?,
            None => return Err(ProtocolError::NonCanonicalRevision("undefined".into())),
        };

        Ok(Self {
            topic,
            revision,
            source_id: fields
                .get("sourceId")
                .and_then(Value::as_str)
                .map(str::to_owned),
            timestamp_ms: fields.get("timestampMs").and_then(Value::as_u64),
        })
    }

    /// Convert to the untyped JSON shape transports carry.
    pub fn to_value(&self) -> Value {
        let mut fields = serde_json::Map::new();
        fields.insert("topic".into(), Value::String(self.topic.to_string()));
        fields.insert("revision".into(), Value::String(self.revision.to_string()));
        if let Some(source_id) = &self.source_id {
            fields.insert("sourceId".into(), Value::String(source_id.clone()));
        }
        if let Some(ts) = self.timestamp_ms {
            fields.insert("timestampMs".into(), Value::from(ts));
        }
        Value::Object(fields)
    }
}

impl From<InvalidationEvent> for Value {
    fn from(event: InvalidationEvent) -> Self {
        event.to_value()
    }
}
