//! Error types for the RelayDrop core.
//!
//! Two layers: connection errors (handshake, timeouts, state transitions) and
//! transfer errors (rooms, manifests, chunk addressing). Transfer errors are
//! the taxonomy surfaced to participants; only transport loss is transient.

use std::{io, time::Duration};

use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors that can occur during connection state machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Invalid state transition attempted
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: ConnectionState,
        /// Operation that was attempted
        operation: String,
    },

    /// Received unexpected frame for current state
    #[error("unexpected frame: received opcode {opcode:#06x} in state {state:?}")]
    UnexpectedFrame {
        /// Current state when frame was received
        state: ConnectionState,
        /// Opcode of the unexpected frame
        opcode: u16,
    },

    /// Handshake did not complete within timeout
    #[error("handshake timeout after {elapsed:?}")]
    HandshakeTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Connection idle timeout exceeded
    #[error("idle timeout after {elapsed:?}")]
    IdleTimeout {
        /// How long connection was idle
        elapsed: Duration,
    },

    /// Unsupported protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid payload for opcode
    #[error("invalid payload: expected {expected} for opcode {opcode:#06x}")]
    InvalidPayload {
        /// Expected payload type
        expected: &'static str,
        /// Opcode that was received
        opcode: u16,
    },

    /// Protocol error from frame parsing/validation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying transport error
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Protocol violations (invalid frames, unsupported versions) are never
    /// transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. } | Self::IdleTimeout { .. })
    }
}

/// Boundary conversion for async I/O APIs.
impl From<ConnectionError> for io::Error {
    fn from(err: ConnectionError) -> Self {
        let kind = match &err {
            ConnectionError::HandshakeTimeout { .. } | ConnectionError::IdleTimeout { .. } => {
                io::ErrorKind::TimedOut
            },
            ConnectionError::InvalidState { .. }
            | ConnectionError::UnexpectedFrame { .. }
            | ConnectionError::UnsupportedVersion(_)
            | ConnectionError::Protocol(_)
            | ConnectionError::InvalidPayload { .. } => io::ErrorKind::InvalidData,
            ConnectionError::Transport(_) => io::ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<relaydrop_proto::ProtocolError> for ConnectionError {
    fn from(err: relaydrop_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Transfer-level failures.
///
/// None of these are fatal to a process: room errors are reported to the
/// requesting participant, malformed references are dropped, and transport
/// loss is recovered by reconnecting and resuming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Room code is already held by another active room.
    #[error("room code already in use: {room}")]
    DuplicateRoomCode {
        /// Conflicting code
        room: String,
    },

    /// No active room has this code.
    #[error("room not found: {room}")]
    RoomNotFound {
        /// Requested code
        room: String,
    },

    /// Assembly requested before every chunk is stored.
    #[error("file {file_index} incomplete: {received}/{total} chunks")]
    IncompleteFile {
        /// Manifest index of the file
        file_index: u32,
        /// Chunks held
        received: u32,
        /// Chunks required
        total: u32,
    },

    /// The channel to the relay was lost.
    #[error("transport disconnected: {reason}")]
    TransportDisconnected {
        /// Why the transport went away
        reason: String,
    },

    /// A message referenced a file outside the manifest.
    #[error("unknown file index {file_index} (manifest has {file_count} files)")]
    UnknownFileIndex {
        /// Index that was referenced
        file_index: u32,
        /// Number of files in the manifest
        file_count: usize,
    },

    /// A message referenced a chunk past the end of its file.
    #[error("chunk {chunk_index} out of range for file {file_index} ({total} chunks)")]
    UnknownChunkIndex {
        /// Manifest index of the file
        file_index: u32,
        /// Chunk index that was referenced
        chunk_index: u32,
        /// Chunks in the file
        total: u32,
    },

    /// Manifest is empty, not densely indexed, or names a file too large to
    /// chunk.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Room code is not 1-16 ASCII alphanumeric characters.
    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),
}

impl TransferError {
    /// Returns true if the operation can succeed after reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportDisconnected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_errors_are_transient() {
        assert!(
            ConnectionError::HandshakeTimeout { elapsed: Duration::from_secs(31) }.is_transient()
        );

        assert!(ConnectionError::IdleTimeout { elapsed: Duration::from_secs(61) }.is_transient());
    }

    #[test]
    fn protocol_violations_are_fatal() {
        assert!(
            !ConnectionError::UnexpectedFrame { state: ConnectionState::Init, opcode: 0x03 }
                .is_transient()
        );
        assert!(!ConnectionError::UnsupportedVersion(99).is_transient());
        assert!(!ConnectionError::Protocol("test error".to_string()).is_transient());
        assert!(!ConnectionError::Transport("network error".to_string()).is_transient());
    }

    #[test]
    fn only_disconnect_is_transient_transfer_error() {
        assert!(TransferError::TransportDisconnected { reason: "reset".into() }.is_transient());

        assert!(!TransferError::RoomNotFound { room: "abc".into() }.is_transient());
        assert!(!TransferError::DuplicateRoomCode { room: "abc".into() }.is_transient());
        assert!(
            !TransferError::IncompleteFile { file_index: 0, received: 2, total: 3 }.is_transient()
        );
        assert!(!TransferError::UnknownFileIndex { file_index: 4, file_count: 1 }.is_transient());
    }

    #[test]
    fn io_error_kind_for_timeouts() {
        let err: io::Error = ConnectionError::IdleTimeout { elapsed: Duration::from_secs(61) }.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
