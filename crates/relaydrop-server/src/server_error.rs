//! Driver error types.
//!
//! Errors that abort processing of a single event. Room-level failures a
//! participant caused are NOT surfaced here: the driver answers those with an
//! error frame and keeps going.

use std::fmt;

use crate::room_manager::RoomError;

/// Errors that can occur while the driver processes an event.
#[derive(Debug)]
pub enum ServerError {
    /// Session not found in registry.
    ///
    /// Occurs when a frame arrives for a session that was already closed.
    /// Transient - the client reconnects.
    SessionNotFound(u64),

    /// Room operation failed outside a participant request.
    Room(RoomError),

    /// Session-layer failure (bad handshake, unexpected frame).
    ///
    /// Fatal for that connection; other connections are unaffected.
    ConnectionFailed {
        /// Session that failed
        session_id: u64,
        /// Error message
        reason: String,
    },

    /// Frame encoding error.
    ///
    /// Failed to encode a response. Indicates a bug.
    Protocol(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::Room(err) => write!(f, "room error: {err}"),
            Self::ConnectionFailed { session_id, reason } => {
                write!(f, "connection failed for session {session_id}: {reason}")
            },
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Room(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RoomError> for ServerError {
    fn from(err: RoomError) -> Self {
        Self::Room(err)
    }
}

impl From<relaydrop_proto::ProtocolError> for ServerError {
    fn from(err: relaydrop_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let err = ServerError::SessionNotFound(42);
        assert_eq!(err.to_string(), "session not found: 42");

        let err = ServerError::ConnectionFailed { session_id: 1, reason: "timeout".to_string() };
        assert_eq!(err.to_string(), "connection failed for session 1: timeout");

        let err = ServerError::Room(RoomError::RoomNotFound("abc".to_string()));
        assert_eq!(err.to_string(), "room error: Room not found: abc");
    }

    #[test]
    fn room_error_is_source() {
        use std::error::Error;

        let err = ServerError::from(RoomError::NotPermitted("x".to_string()));
        assert!(err.source().is_some());
        assert!(ServerError::Protocol("bad".to_string()).source().is_none());
    }
}
