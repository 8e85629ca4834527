//! Core domain model for the event tracker.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single event as delivered by the remote event API.
///
/// Ids are opaque and source-assigned; the source is trusted to return them in
/// ascending order within a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only cursor log. The newest row by `updated_at` is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_event_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Identifier of a posted notification, used to thread replies and attach reactions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub ts: String,
}

impl MessageHandle {
    pub fn new(ts: impl Into<String>) -> Self {
        Self { ts: ts.into() }
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Success,
    Failure,
}

impl Reaction {
    /// Emoji name understood by the chat channel.
    pub fn name(self) -> &'static str {
        match self {
            Reaction::Success => "white_check_mark",
            Reaction::Failure => "x",
        }
    }
}

/// Per-event failure context posted as a threaded reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

impl ErrorDetail {
    pub fn new(event_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp: Utc::now(),
            error: error.into(),
        }
    }
}
