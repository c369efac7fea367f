//! RelayDrop wire protocol.
//!
//! Every message on the persistent channel is a [`Frame`]: a fixed 32-byte
//! binary [`FrameHeader`] followed by a CBOR payload. The relay routes on the
//! header alone where it can (opcode, sender, recipient) and only decodes the
//! payload to read the room code.
//!
//! # Layers
//!
//! - [`FrameHeader`]: zero-copy, big-endian, validated on parse
//! - [`Frame`]: header + raw payload bytes, no deserialization
//! - [`Payload`]: typed messages, one variant per [`Opcode`]
//!
//! This crate performs no I/O.

#![deny(missing_docs)]

pub mod errors;
mod frame;
mod header;
mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::{ErrorPayload, Payload};

/// ALPN protocol identifier negotiated on every QUIC connection.
pub const ALPN_PROTOCOL: &[u8] = b"relaydrop/1";
