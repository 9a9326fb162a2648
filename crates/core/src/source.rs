// Change Source
//
// The relay consumes row-level change notifications through the
// ChangeSource trait. A source hands out one SourceHandle per relay
// connection; the handle owns the subscription and releases it exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::RelayError;
use crate::topic::Topic;

// ============================================================================
// ChangeNotification
// ============================================================================

/// Row operation reported by the upstream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Upstream change payload.
///
/// ```text
/// {"table":"orders","type":"INSERT","record":{"id":42},"old_record":null}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ChangeNotification {
    /// Source table; filled from the channel when omitted
    #[serde(default)]
    pub table: String,

    /// Row operation
    #[serde(rename = "type")]
    pub kind: ChangeKind,

    /// New row (INSERT/UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub record: Option<serde_json::Value>,

    /// Previous row (UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub old_record: Option<serde_json::Value>,
}

impl ChangeNotification {
    /// Decode a raw upstream payload received on `channel_table`.
    pub fn decode(channel_table: &str, raw: &str) -> Result<Self, RelayError> {
        let mut notification: ChangeNotification = serde_json::from_str(raw)?;

        if notification.table.is_empty() {
            notification.table = channel_table.to_string();
        } else if notification.table != channel_table {
            return Err(RelayError::serialization(format!(
                "notification for table '{}' received on channel for '{}'",
                notification.table, channel_table
            )));
        }

        notification.check_shape()?;
        Ok(notification)
    }

    fn check_shape(&self) -> Result<(), RelayError> {
        for (name, value) in [("record", &self.record), ("old_record", &self.old_record)] {
            if let Some(value) = value {
                if !value.is_object() {
                    return Err(RelayError::serialization(format!(
                        "'{}' must be a JSON object",
                        name
                    )));
                }
            }
        }

        match self.kind {
            ChangeKind::Insert | ChangeKind::Update if self.record.is_none() => Err(
                RelayError::serialization(format!("{:?} notification without record", self.kind)),
            ),
            ChangeKind::Delete if self.old_record.is_none() => Err(RelayError::serialization(
                "DELETE notification without old_record",
            )),
            _ => Ok(()),
        }
    }

    /// Row the topic filters are evaluated against
    pub fn filter_row(&self) -> Option<&serde_json::Value> {
        match self.kind {
            ChangeKind::Delete => self.old_record.as_ref(),
            ChangeKind::Insert | ChangeKind::Update => self.record.as_ref(),
        }
    }
}

/// Item delivered to a subscriber
#[derive(Debug, Clone)]
pub enum FeedItem {
    /// A decoded change that matched one of the subscriber's topics
    Change(Arc<ChangeNotification>),
    /// Upstream sent something that could not be decoded
    Malformed { table: String, reason: String },
}

// ============================================================================
// ChangeSource trait
// ============================================================================

/// Capability to subscribe to row-level changes
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Register interest in `topics`.
    ///
    /// Must fail with [`RelayError::UpstreamUnavailable`] when the upstream
    /// refuses; the relay then emits no stream at all.
    async fn subscribe(&self, topics: &[Topic]) -> Result<SourceHandle, RelayError>;
}

// ============================================================================
// SourceHandle
// ============================================================================

type Release = Box<dyn FnOnce() + Send + Sync>;

/// One live subscription.
///
/// `unsubscribe` is idempotent; dropping the handle unsubscribes as well.
pub struct SourceHandle {
    receiver: mpsc::Receiver<FeedItem>,
    release: Option<Release>,
}

impl SourceHandle {
    pub fn new(receiver: mpsc::Receiver<FeedItem>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            receiver,
            release: Some(Box::new(release)),
        }
    }

    /// Next item, or `None` once the upstream ended or the handle was released
    pub async fn recv(&mut self) -> Option<FeedItem> {
        if self.release.is_none() {
            return None;
        }
        self.receiver.recv().await
    }

    /// Release the subscription. Only the first call has an effect.
    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            self.receiver.close();
            release();
        }
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("active", &self.is_active())
            .finish()
    }
}
