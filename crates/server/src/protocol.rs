//! Client wire protocol
//!
//! JSON text frames over the WebSocket. Inbound frames are tagged
//! commands; outbound frames are either control messages or stream
//! envelopes whose `type` is derived from the originating stream name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    Ping,
    Subscribe {
        streams: Vec<String>,
    },
    Unsubscribe {
        streams: Vec<String>,
    },
    Request {
        resource: String,
    },
    Action {
        action: String,
        #[serde(rename = "recommendationId")]
        recommendation_id: String,
    },
}

/// Control messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
        streams: Vec<String>,
    },
    Pong,
    Subscribed {
        streams: Vec<String>,
    },
    Unsubscribed {
        streams: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl ControlMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"internal serialization failure"}"#.to_string()
        })
    }
}

/// The normalized unit broadcast to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// Source log entry id; absent on request replies
    #[serde(rename = "streamId", skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

impl StreamEnvelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"internal serialization failure"}"#.to_string()
        })
    }
}

/// Fixed stream-name to message-type table. Unmapped streams broadcast
/// as "unknown" rather than being dropped.
pub fn message_type_for_stream(stream: &str) -> &'static str {
    match stream {
        "metrics.calculated" => "metrics",
        "recommendations.ready" => "recommendations",
        "automation.status" => "automation",
        "system.health" => "system",
        "gaps.identified" => "gaps",
        _ => "unknown",
    }
}

/// Map a client-facing action name to the verb carried on the requests
/// stream.
pub fn action_verb(action: &str) -> Option<&'static str> {
    match action {
        "approve-recommendation" => Some("approve"),
        "reject-recommendation" => Some("reject"),
        _ => None,
    }
}
