/// Shared data model for the chat engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Symmetric identifier of a 1:1 thread.
///
/// `between(a, b)` and `between(b, a)` produce the same key, so a conversation
/// is addressed identically no matter which side started it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    low: String,
    high: String,
}

impl ConversationKey {
    pub fn between(a: &str, b: &str) -> Self {
        if a <= b {
            Self { low: a.to_string(), high: b.to_string() }
        } else {
            Self { low: b.to_string(), high: a.to_string() }
        }
    }

    /// The participant that is not `me`; `None` if `me` is not part of this thread
    pub fn peer_of(&self, me: &str) -> Option<&str> {
        if self.low == me {
            Some(&self.high)
        } else if self.high == me {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn involves(&self, id: &str) -> bool {
        self.low == id || self.high == id
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dm:{}:{}", self.low, self.high)
    }
}

/// Delivery state of a timeline entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Locally authored, not yet acknowledged
    Pending,
    /// Confirmed by the server
    Sent,
    /// Transport rejected the send or the server refused it
    Failed,
}

/// One chat message.
///
/// While `Pending`, `id` is the client generated local id and `timestamp` is
/// the local wall clock. After confirmation both are server values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_key: ConversationKey,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub originated_locally: bool,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }
}

/// Process-wide connection state, owned by the transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}
