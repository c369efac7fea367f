//! Operation codes.
//!
//! Grouped by range: `0x00xx` session layer, `0x01xx` room lifecycle,
//! `0x02xx` chunk transfer.

/// Message kind carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client handshake
    Hello = 0x0001,
    /// Relay handshake response
    HelloReply = 0x0002,
    /// Keepalive request
    Ping = 0x0003,
    /// Keepalive response
    Pong = 0x0004,
    /// Graceful disconnect
    Goodbye = 0x0005,
    /// Non-fatal error notice
    Error = 0x0006,

    /// Sender asks the relay to create a room
    CreateRoom = 0x0100,
    /// Relay acknowledges room creation
    RoomCreated = 0x0101,
    /// Receiver asks to join a room
    JoinRoom = 0x0102,
    /// Relay delivers the manifest to a receiver
    FileList = 0x0103,
    /// Participant leaves a room
    LeaveRoom = 0x0104,
    /// Relay announces the room was destroyed
    RoomClosed = 0x0105,

    /// Sender pushes a chunk into the room
    ChunkTransfer = 0x0200,
    /// Relay forwards a chunk to a receiver
    ReceiveChunk = 0x0201,
    /// Receiver reports held indexes for one file
    RequestMissingChunks = 0x0202,
    /// Relay forwards a resend request to the sender
    SendMissingChunks = 0x0203,
    /// Receiver confirms full receipt of a file
    ConfirmFileReceived = 0x0204,
    /// Relay forwards a confirmation to the sender
    FileConfirmed = 0x0205,
}

impl Opcode {
    /// Every assigned opcode, in wire order.
    pub const ALL: [Self; 18] = [
        Self::Hello,
        Self::HelloReply,
        Self::Ping,
        Self::Pong,
        Self::Goodbye,
        Self::Error,
        Self::CreateRoom,
        Self::RoomCreated,
        Self::JoinRoom,
        Self::FileList,
        Self::LeaveRoom,
        Self::RoomClosed,
        Self::ChunkTransfer,
        Self::ReceiveChunk,
        Self::RequestMissingChunks,
        Self::SendMissingChunks,
        Self::ConfirmFileReceived,
        Self::FileConfirmed,
    ];

    /// Raw wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a raw wire value. `None` if unassigned.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        let opcode = match value {
            0x0001 => Self::Hello,
            0x0002 => Self::HelloReply,
            0x0003 => Self::Ping,
            0x0004 => Self::Pong,
            0x0005 => Self::Goodbye,
            0x0006 => Self::Error,
            0x0100 => Self::CreateRoom,
            0x0101 => Self::RoomCreated,
            0x0102 => Self::JoinRoom,
            0x0103 => Self::FileList,
            0x0104 => Self::LeaveRoom,
            0x0105 => Self::RoomClosed,
            0x0200 => Self::ChunkTransfer,
            0x0201 => Self::ReceiveChunk,
            0x0202 => Self::RequestMissingChunks,
            0x0203 => Self::SendMissingChunks,
            0x0204 => Self::ConfirmFileReceived,
            0x0205 => Self::FileConfirmed,
            _ => return None,
        };
        Some(opcode)
    }

    /// Session-layer opcodes are handled by the connection state machine,
    /// everything else by the room/transfer layer.
    #[must_use]
    pub const fn is_session(self) -> bool {
        matches!(self, Self::Hello | Self::HelloReply | Self::Ping | Self::Pong | Self::Goodbye)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_opcodes() {
        for opcode in Opcode::ALL {
            assert_eq!(Opcode::from_u16(opcode.to_u16()), Some(opcode));
        }
    }

    #[test]
    fn unassigned_values_rejected() {
        assert_eq!(Opcode::from_u16(0x0000), None);
        assert_eq!(Opcode::from_u16(0x0007), None);
        assert_eq!(Opcode::from_u16(0xFFFF), None);
    }

    #[test]
    fn session_opcodes() {
        assert!(Opcode::Ping.is_session());
        assert!(!Opcode::Error.is_session());
        assert!(!Opcode::ChunkTransfer.is_session());
    }
}
