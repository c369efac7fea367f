//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary, payloads use CBOR. The `Payload` enum covers
//! session management (Hello, Ping, etc.), room lifecycle (create, join,
//! leave) and chunk transfer.
//!
//! The relay decodes only what it must validate and route; chunk bytes are
//! re-wrapped without inspection.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). Round-trip encoding must produce identical values.

pub mod room;
pub mod session;
pub mod transfer;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads
///
/// The payload type is determined by the `Opcode` in the frame header,
/// so we serialize only the inner struct content (no variant tag in CBOR).
///
/// # Invariants
///
/// - Opcode Uniqueness: Each payload variant corresponds to exactly one
///   `Opcode`. The `opcode()` method returns a unique opcode for each variant.
///
/// - Serialization Consistency: Encoding a `Payload` and then decoding it with
///   the same opcode MUST produce an equivalent value.
///
/// # Security
///
/// - No Variant Tag: the frame header's `opcode` field already identifies the
///   payload type, so a mismatched opcode/payload pair fails to decode instead
///   of being reinterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Session Management
    /// Initial handshake
    Hello(session::Hello),
    /// Relay response to Hello
    HelloReply(session::HelloReply),
    /// Ping for keepalive
    Ping,
    /// Pong response
    Pong,
    /// Graceful disconnect
    Goodbye(session::Goodbye),
    /// Error notice
    Error(ErrorPayload),

    // Room Lifecycle
    /// Sender creates or reattaches to a room
    CreateRoom(room::CreateRoom),
    /// Relay acknowledges room creation
    RoomCreated(room::RoomCreated),
    /// Receiver joins a room
    JoinRoom(room::JoinRoom),
    /// Manifest delivered to a receiver
    FileList(room::FileList),
    /// Participant leaves a room
    LeaveRoom(room::LeaveRoom),
    /// Room destroyed
    RoomClosed(room::RoomClosed),

    // Chunk Transfer
    /// Sender pushes a chunk
    ChunkTransfer(transfer::ChunkTransfer),
    /// Relay delivers a chunk
    ReceiveChunk(transfer::ReceiveChunk),
    /// Receiver reports held indexes
    RequestMissingChunks(transfer::RequestMissingChunks),
    /// Resend request forwarded to the sender
    SendMissingChunks(transfer::SendMissingChunks),
    /// Receiver confirms a complete file
    ConfirmFileReceived(transfer::ConfirmFileReceived),
    /// Confirmation forwarded to the sender
    FileConfirmed(transfer::FileConfirmed),
}

/// Error payload for error frames.
///
/// Error frames are notices: the connection stays open and the offending
/// request is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
    /// Optional retry-after duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_after: Option<u64>,
}

impl ErrorPayload {
    /// Frame was rejected by the relay.
    pub const FRAME_REJECTED: u16 = 0x0001;
    /// Room does not exist.
    pub const ROOM_NOT_FOUND: u16 = 0x0002;
    /// Room code already in use by another sender.
    pub const DUPLICATE_ROOM_CODE: u16 = 0x0003;
    /// Invalid payload format.
    pub const INVALID_PAYLOAD: u16 = 0x0004;
    /// File index outside the room's manifest.
    pub const UNKNOWN_FILE_INDEX: u16 = 0x0005;
    /// Participant may not perform this operation in this room.
    pub const NOT_PERMITTED: u16 = 0x0006;
    /// Room sender is disconnected; retry later.
    pub const SENDER_UNAVAILABLE: u16 = 0x0007;

    /// Create a frame rejection error.
    pub fn frame_rejected(reason: impl Into<String>) -> Self {
        Self { code: Self::FRAME_REJECTED, message: reason.into(), retry_after: None }
    }

    /// Create a room not found error.
    pub fn room_not_found() -> Self {
        Self {
            code: Self::ROOM_NOT_FOUND,
            message: "room not found".to_string(),
            retry_after: None,
        }
    }

    /// Create a duplicate room code error.
    pub fn duplicate_room_code(room: &str) -> Self {
        Self {
            code: Self::DUPLICATE_ROOM_CODE,
            message: format!("room code already in use: {room}"),
            retry_after: None,
        }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self { code: Self::INVALID_PAYLOAD, message: msg.into(), retry_after: None }
    }

    /// Create an unknown file index error.
    pub fn unknown_file_index(file_index: u32, file_count: usize) -> Self {
        Self {
            code: Self::UNKNOWN_FILE_INDEX,
            message: format!("file index {file_index} out of range ({file_count} files)"),
            retry_after: None,
        }
    }

    /// Create a not permitted error.
    pub fn not_permitted(msg: impl Into<String>) -> Self {
        Self { code: Self::NOT_PERMITTED, message: msg.into(), retry_after: None }
    }

    /// Create a sender unavailable error with a retry hint.
    pub fn sender_unavailable(retry_after_secs: u64) -> Self {
        Self {
            code: Self::SENDER_UNAVAILABLE,
            message: "sender unavailable".to_string(),
            retry_after: Some(retry_after_secs),
        }
    }
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::HelloReply(_) => Opcode::HelloReply,
            Self::Ping => Opcode::Ping,
            Self::Pong => Opcode::Pong,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Error(_) => Opcode::Error,
            Self::CreateRoom(_) => Opcode::CreateRoom,
            Self::RoomCreated(_) => Opcode::RoomCreated,
            Self::JoinRoom(_) => Opcode::JoinRoom,
            Self::FileList(_) => Opcode::FileList,
            Self::LeaveRoom(_) => Opcode::LeaveRoom,
            Self::RoomClosed(_) => Opcode::RoomClosed,
            Self::ChunkTransfer(_) => Opcode::ChunkTransfer,
            Self::ReceiveChunk(_) => Opcode::ReceiveChunk,
            Self::RequestMissingChunks(_) => Opcode::RequestMissingChunks,
            Self::SendMissingChunks(_) => Opcode::SendMissingChunks,
            Self::ConfirmFileReceived(_) => Opcode::ConfirmFileReceived,
            Self::FileConfirmed(_) => Opcode::FileConfirmed,
        }
    }

    /// Room code this payload addresses, if any.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        match self {
            Self::Hello(_)
            | Self::HelloReply(_)
            | Self::Ping
            | Self::Pong
            | Self::Goodbye(_)
            | Self::Error(_) => None,
            Self::CreateRoom(p) => Some(&p.room),
            Self::RoomCreated(p) => Some(&p.room),
            Self::JoinRoom(p) => Some(&p.room),
            Self::FileList(p) => Some(&p.room),
            Self::LeaveRoom(p) => Some(&p.room),
            Self::RoomClosed(p) => Some(&p.room),
            Self::ChunkTransfer(p) => Some(&p.room),
            Self::ReceiveChunk(p) => Some(&p.room),
            Self::RequestMissingChunks(p) => Some(&p.room),
            Self::SendMissingChunks(p) => Some(&p.room),
            Self::ConfirmFileReceived(p) => Some(&p.room),
            Self::FileConfirmed(p) => Some(&p.room),
        }
    }

    /// Encode payload to buffer
    ///
    /// Serializes only the inner struct, NOT the variant tag.
    ///
    /// Does not enforce [`FrameHeader::MAX_PAYLOAD_SIZE`]; that happens in
    /// [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ping | Self::Pong => Ok(()), // Zero-byte payloads
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::CreateRoom(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RoomCreated(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::JoinRoom(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::FileList(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::LeaveRoom(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RoomClosed(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ChunkTransfer(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ReceiveChunk(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RequestMissingChunks(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SendMissingChunks(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ConfirmFileReceived(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::FileConfirmed(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload from bytes based on opcode
    ///
    /// The size check runs before CBOR parsing so oversized input never
    /// reaches the parser.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::Hello => Self::Hello(cbor(bytes)?),
            Opcode::HelloReply => Self::HelloReply(cbor(bytes)?),
            Opcode::Ping => Self::Ping,
            Opcode::Pong => Self::Pong,
            Opcode::Goodbye => Self::Goodbye(cbor(bytes)?),
            Opcode::Error => Self::Error(cbor(bytes)?),
            Opcode::CreateRoom => Self::CreateRoom(cbor(bytes)?),
            Opcode::RoomCreated => Self::RoomCreated(cbor(bytes)?),
            Opcode::JoinRoom => Self::JoinRoom(cbor(bytes)?),
            Opcode::FileList => Self::FileList(cbor(bytes)?),
            Opcode::LeaveRoom => Self::LeaveRoom(cbor(bytes)?),
            Opcode::RoomClosed => Self::RoomClosed(cbor(bytes)?),
            Opcode::ChunkTransfer => Self::ChunkTransfer(cbor(bytes)?),
            Opcode::ReceiveChunk => Self::ReceiveChunk(cbor(bytes)?),
            Opcode::RequestMissingChunks => Self::RequestMissingChunks(cbor(bytes)?),
            Opcode::SendMissingChunks => Self::SendMissingChunks(cbor(bytes)?),
            Opcode::ConfirmFileReceived => Self::ConfirmFileReceived(cbor(bytes)?),
            Opcode::FileConfirmed => Self::FileConfirmed(cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame
    ///
    /// Encodes the payload, stamps the matching opcode into `header` and sets
    /// `payload_size`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Parse payload from a raw transport frame
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the header opcode is unassigned
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    /// - `ProtocolError::PayloadTooLarge` if payload exceeds maximum size
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or_else(|| ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}

fn cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn round_trip(payload: Payload) {
        let frame = payload.clone().into_frame(FrameHeader::new(Opcode::Ping)).unwrap();
        assert_eq!(frame.header.opcode_enum(), Some(payload.opcode()));

        let decoded = Payload::from_frame(&frame).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn payload_ping_has_empty_body() {
        let frame = Payload::Ping.into_frame(FrameHeader::new(Opcode::Ping)).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(Payload::from_frame(&frame).unwrap(), Payload::Ping);
    }

    #[test]
    fn payload_error_round_trip() {
        round_trip(Payload::Error(ErrorPayload::sender_unavailable(5)));
        round_trip(Payload::Error(ErrorPayload::room_not_found()));
    }

    #[test]
    fn payload_room_round_trip() {
        round_trip(Payload::CreateRoom(room::CreateRoom {
            room: "k3x9qa".to_string(),
            files: vec![
                room::FileSpec { name: "a.bin".to_string(), size: 600_000 },
                room::FileSpec { name: "empty".to_string(), size: 0 },
            ],
        }));
        round_trip(Payload::FileList(room::FileList {
            room: "k3x9qa".to_string(),
            files: vec![room::FileEntry { index: 0, name: "a.bin".to_string(), size: 1 }],
        }));
    }

    #[test]
    fn payload_chunk_round_trip() {
        round_trip(Payload::ChunkTransfer(transfer::ChunkTransfer {
            room: "k3x9qa".to_string(),
            file_index: 2,
            chunk_index: 9,
            chunk: Bytes::from_static(b"chunk bytes"),
            recipient: Some(4),
        }));
    }

    #[test]
    fn room_not_found_message() {
        let err = ErrorPayload::room_not_found();
        assert_eq!(err.code, ErrorPayload::ROOM_NOT_FOUND);
        assert_eq!(err.message, "room not found");
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut frame = Payload::Ping.into_frame(FrameHeader::new(Opcode::Ping)).unwrap();
        frame.header.opcode = 0x7777u16.to_be_bytes();

        assert_eq!(Payload::from_frame(&frame), Err(ProtocolError::UnknownOpcode(0x7777)));
    }

    #[test]
    fn mismatched_opcode_fails_to_decode() {
        let frame = Payload::JoinRoom(room::JoinRoom { room: "abc".to_string() })
            .into_frame(FrameHeader::new(Opcode::JoinRoom))
            .unwrap();

        let result = Payload::decode(Opcode::ChunkTransfer, &frame.payload);
        assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
    }

    #[test]
    fn room_accessor() {
        let payload = Payload::LeaveRoom(room::LeaveRoom { room: "r1".to_string() });
        assert_eq!(payload.room(), Some("r1"));
        assert_eq!(Payload::Pong.room(), None);
    }
}
