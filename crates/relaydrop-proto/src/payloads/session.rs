//! Session management payload types.

use serde::{Deserialize, Serialize};

/// Client handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the client speaks.
    pub version: u8,

    /// Stable participant identity, kept across reconnects.
    ///
    /// When absent the relay uses the connection's session id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub participant_id: Option<u64>,
}

/// Relay handshake response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Per-connection id assigned by the relay.
    pub session_id: u64,

    /// Participant id the relay will use for this connection.
    pub participant_id: u64,
}

/// Graceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Human-readable reason.
    pub reason: String,
}
