//! Wire frames exchanged with the bus hub.
//!
//! One JSON object per line. Frames are tagged with `"type"` so a reader can
//! tell replies, hub errors and inbound requests apart on the same stream.

use super::{Priority, RequestId, Token};
use serde::{Deserialize, Serialize};

/// Frames sent from a client to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Register under `name`; `app_id` is set for application clients.
    Register {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<String>,
    },

    SetPriority { priority: Priority },

    /// Outbound method call.
    Call {
        token: Token,
        uri: String,
        payload: String,
        /// Hub may forget the call after the first reply.
        one_reply: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        /// Caller the hub should attribute this call to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<String>,
    },

    Cancel { token: Token },

    /// Informational; the client enforces the deadline itself.
    SetTimeout { token: Token, timeout_ms: u64 },

    RegisterCategory {
        category: String,
        methods: Vec<String>,
    },

    /// Reply to an inbound request.
    Reply { request: RequestId, payload: String },

    /// Push to a subscribed inbound request.
    SubscriptionReply { request: RequestId, payload: String },

    Unregister,
}

/// Frames sent from the hub to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    /// Registration accepted.
    Registered { unique_name: String },

    /// Registration or protocol failure.
    Error { code: i32, message: String },

    /// Reply payload for an outbound call.
    Response { token: Token, payload: String },

    /// Transport-level failure for an outbound call.
    HubError {
        token: Token,
        error: String,
        #[serde(default = "empty_object")]
        payload: String,
    },

    /// Someone called one of our registered methods.
    Request {
        request: RequestId,
        category: String,
        method: String,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },

    /// A remote subscriber went away.
    SubscriptionCancelled { request: RequestId },
}

fn empty_object() -> String {
    "{}".to_string()
}

impl ClientFrame {
    /// Encode as a single line without the trailing newline.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl HubFrame {
    /// Decode one line received from the hub.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
