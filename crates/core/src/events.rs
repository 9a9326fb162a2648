// Change Event Protocol
//
// This module defines the event schema surfaced to stream subscribers.
// Every event has the same structure: type, timestamp, optional payload.
// Timestamps are assigned by the relay, never by the change source.

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::{DecodeError, RelayError};
use crate::source::{ChangeKind, ChangeNotification};

// ============================================================================
// Event Type
// ============================================================================

/// Tag carried in the `type` field of every event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// First event of every stream
    Connected,
    /// A row was inserted
    Inserted,
    /// A row was updated
    Updated,
    /// A row was deleted
    Deleted,
    /// Liveness signal with no payload
    Heartbeat,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Connected => "connected",
            ChangeType::Inserted => "inserted",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
            ChangeType::Heartbeat => "heartbeat",
        }
    }

    /// Domain events reflect a row change and must carry a payload
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            ChangeType::Inserted | ChangeType::Updated | ChangeType::Deleted
        )
    }
}

impl From<ChangeKind> for ChangeType {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Insert => ChangeType::Inserted,
            ChangeKind::Update => ChangeType::Updated,
            ChangeKind::Delete => ChangeType::Deleted,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ChangeEvent
// ============================================================================

/// One notification surfaced to stream subscribers.
///
/// Wire shape:
/// ```text
/// {"type":"inserted","timestamp":"2024-01-01T00:00:01.000Z","payload":{"id":42}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ChangeEvent {
    /// Event tag
    #[serde(rename = "type")]
    pub event_type: ChangeType,

    /// When the relay emitted the event (RFC 3339, millisecond precision)
    #[serde(with = "timestamp_millis")]
    pub timestamp: DateTime<Utc>,

    /// Row data for inserted/updated/deleted events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub payload: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn connected(timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: ChangeType::Connected,
            timestamp,
            payload: None,
        }
    }

    pub fn heartbeat(timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: ChangeType::Heartbeat,
            timestamp,
            payload: None,
        }
    }

    /// Map an upstream notification to a domain event.
    ///
    /// Deletes carry the old row; inserts and updates carry the new one.
    pub fn from_notification(
        notification: &ChangeNotification,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, RelayError> {
        let payload = match notification.kind {
            ChangeKind::Insert | ChangeKind::Update => notification.record.clone(),
            ChangeKind::Delete => notification.old_record.clone(),
        };

        let event = Self {
            event_type: notification.kind.into(),
            timestamp,
            payload,
        };
        event.validate()?;
        Ok(event)
    }

    /// Enforce payload presence: required for domain events, absent otherwise
    pub fn validate(&self) -> Result<(), RelayError> {
        match (self.event_type.is_domain(), self.payload.is_some()) {
            (true, false) => Err(RelayError::serialization(format!(
                "'{}' event requires a payload",
                self.event_type
            ))),
            (false, true) => Err(RelayError::serialization(format!(
                "'{}' event must not carry a payload",
                self.event_type
            ))),
            _ => Ok(()),
        }
    }

    /// Parse and validate the JSON body of one frame
    pub fn parse(json: &str) -> Result<Self, RelayError> {
        let event: ChangeEvent = serde_json::from_str(json)?;
        event.validate()?;
        Ok(event)
    }

    /// Decode the payload into a typed entity.
    ///
    /// Fails on shape mismatch instead of yielding partially-filled data.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let payload = self
            .payload
            .as_ref()
            .ok_or(DecodeError::MissingPayload(self.event_type.as_str()))?;
        Ok(T::deserialize(payload)?)
    }
}

// ============================================================================
// MonotonicClock
// ============================================================================

/// Per-connection clock whose readings never go backwards.
///
/// Readings are truncated to milliseconds before comparison so the
/// serialized timestamps are non-decreasing too.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&mut self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    /// Feed a wall-clock reading; returns the reading clamped to the last one
    pub fn observe(&mut self, reading: DateTime<Utc>) -> DateTime<Utc> {
        let reading = reading.trunc_subsecs(3);
        let next = match self.last {
            Some(last) if last > reading => last,
            _ => reading,
        };
        self.last = Some(next);
        next
    }
}

/// Serde support for timestamps as RFC 3339 with millisecond precision
mod timestamp_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
