//! Chunk transfer payload types.
//!
//! Chunk bytes travel as CBOR byte strings. Indexes are `u32`: at 256 KiB per
//! chunk that addresses files up to 1 PiB.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sender pushes one chunk into a room.
///
/// Without a `recipient` the relay fans the chunk out to every receiver;
/// with one it is delivered to that participant only (targeted resend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTransfer {
    /// Room code.
    pub room: String,
    /// Manifest index of the file.
    pub file_index: u32,
    /// Chunk index within the file.
    pub chunk_index: u32,
    /// Raw chunk bytes.
    pub chunk: Bytes,
    /// Target participant for a resend.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub recipient: Option<u64>,
}

/// Relay delivers one chunk to a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveChunk {
    /// Room code.
    pub room: String,
    /// Manifest index of the file.
    pub file_index: u32,
    /// Chunk index within the file.
    pub chunk_index: u32,
    /// Raw chunk bytes.
    pub chunk: Bytes,
}

/// Receiver reports which chunk indexes it already holds for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMissingChunks {
    /// Room code.
    pub room: String,
    /// Manifest index of the file.
    pub file_index: u32,
    /// Chunk indexes already held.
    pub received_indexes: Vec<u32>,
}

/// Relay forwards a resend request to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMissingChunks {
    /// Room code.
    pub room: String,
    /// Manifest index of the file.
    pub file_index: u32,
    /// Chunk indexes the receiver already holds.
    pub received_indexes: Vec<u32>,
    /// Participant that asked.
    pub recipient: u64,
}

/// Receiver confirms it holds every chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmFileReceived {
    /// Room code.
    pub room: String,
    /// Manifest index of the file.
    pub file_index: u32,
}

/// Relay forwards a confirmation to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfirmed {
    /// Room code.
    pub room: String,
    /// Manifest index of the file.
    pub file_index: u32,
    /// Participant that confirmed.
    pub recipient: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_encodes_as_byte_string() {
        let msg = ChunkTransfer {
            room: "abc123".to_string(),
            file_index: 0,
            chunk_index: 1,
            chunk: Bytes::from(vec![0xAB; 1024]),
            recipient: None,
        };

        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&msg, &mut encoded).unwrap();

        // A byte string costs a few bytes of overhead, an integer array would
        // cost up to two bytes per element.
        assert!(encoded.len() < 1024 + 64);

        let decoded: ChunkTransfer = ciborium::de::from_reader(&encoded[..]).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn recipient_omitted_when_absent() {
        let untargeted = ChunkTransfer {
            room: "r".to_string(),
            file_index: 0,
            chunk_index: 0,
            chunk: Bytes::new(),
            recipient: None,
        };
        let targeted = ChunkTransfer { recipient: Some(7), ..untargeted.clone() };

        let mut a = Vec::new();
        let mut b = Vec::new();
        ciborium::ser::into_writer(&untargeted, &mut a).unwrap();
        ciborium::ser::into_writer(&targeted, &mut b).unwrap();
        assert!(a.len() < b.len());

        let decoded: ChunkTransfer = ciborium::de::from_reader(&a[..]).unwrap();
        assert_eq!(decoded.recipient, None);
    }
}
