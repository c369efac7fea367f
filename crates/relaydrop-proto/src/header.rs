//! Frame header implementation with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 32-byte structure serialized as raw binary
//! (Big Endian). The relay reads opcode, sender and recipient directly from
//! these bytes and forwards frames without touching the CBOR payload unless it
//! needs the room code.

// zerocopy derives expand to unsafe trait impls
#![allow(unsafe_code)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 32-byte frame header (Big Endian network byte order)
///
/// Fields are stored as raw byte arrays so the struct has alignment 1 and
/// every 32-byte pattern is a valid value.
///
/// # Security
///
/// The `#[repr(C, packed)]` layout with zerocopy traits makes it safe to cast
/// untrusted network bytes. Structural checks (magic, version, payload size)
/// happen in [`FrameHeader::from_bytes`]; `sender_id` is only trustworthy on
/// frames the relay has stamped.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    // Protocol identification (8 bytes: 0-7)
    magic: [u8; 4],             // 0x52445250 ("RDRP" in ASCII)
    version: u8,                // 0x01
    reserved: u8,               // must be zero
    pub(crate) opcode: [u8; 2], // u16 operation code

    // Request/payload metadata (8 bytes: 8-15)
    request_id: [u8; 4],              // u32 client nonce
    pub(crate) payload_size: [u8; 4], // u32 payload length

    // Routing (16 bytes: 16-31)
    sender_id: [u8; 8],    // u64 origin participant
    recipient_id: [u8; 8], // u64 target participant, 0 = none
}

impl FrameHeader {
    /// Size of the serialized header (32 bytes)
    pub const SIZE: usize = 32;

    /// Magic number: "RDRP" in ASCII (0x52445250)
    pub const MAGIC: u32 = 0x5244_5250;

    /// Current protocol version
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (16 MB)
    pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

    /// Create a new header with the specified opcode.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&Self::MAGIC.to_be_bytes());
        bytes[4] = Self::VERSION;
        bytes[6..8].copy_from_slice(&opcode.to_u16().to_be_bytes());

        Self::read_from_bytes(&bytes)
            .ok()
            .unwrap_or_else(|| unreachable!("buffer is exactly SIZE bytes"))
    }

    /// Parse header from network bytes (zero-copy, safe)
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if buffer is shorter than 32 bytes
    /// - `ProtocolError::InvalidMagic` if magic number is invalid
    /// - `ProtocolError::UnsupportedVersion` if protocol version is unsupported
    /// - `ProtocolError::PayloadTooLarge` if payload size exceeds maximum
    ///
    /// Cheapest checks run first so garbage input fails fast.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Protocol magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Reserved byte, zero in this version.
    #[must_use]
    pub fn reserved(&self) -> u8 {
        self.reserved
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Client-assigned nonce for request/response correlation.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        u32::from_be_bytes(self.request_id)
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Participant that originated the frame (stamped by the relay).
    #[must_use]
    pub fn sender_id(&self) -> u64 {
        u64::from_be_bytes(self.sender_id)
    }

    /// Target participant. `None` when the frame is not targeted.
    #[must_use]
    pub fn recipient_id(&self) -> Option<u64> {
        match u64::from_be_bytes(self.recipient_id) {
            0 => None,
            id => Some(id),
        }
    }

    /// Set client request nonce for response correlation.
    pub fn set_request_id(&mut self, request_id: u32) {
        self.request_id = request_id.to_be_bytes();
    }

    /// Update origin participant.
    pub fn set_sender_id(&mut self, sender_id: u64) {
        self.sender_id = sender_id.to_be_bytes();
    }

    /// Set or clear the target participant.
    pub fn set_recipient_id(&mut self, recipient_id: Option<u64>) {
        self.recipient_id = recipient_id.unwrap_or(0).to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("request_id", &self.request_id())
            .field("sender_id", &self.sender_id())
            .field("recipient_id", &self.recipient_id())
            .field("payload_size", &self.payload_size())
            .finish_non_exhaustive()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}
