//! Room lifecycle payload types.
//!
//! Rooms are addressed by a short code chosen by the sender. The relay
//! validates the code; on the wire it is a plain string.

use serde::{Deserialize, Serialize};

/// A file offered by the sender, before the relay assigns indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// File name as shown to receivers.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// A manifest entry as delivered to receivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Position in the manifest (dense, starting at 0).
    pub index: u32,
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Sender asks the relay to create (or reattach to) a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoom {
    /// Room code.
    pub room: String,
    /// Files in manifest order.
    pub files: Vec<FileSpec>,
}

/// Relay acknowledges room creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreated {
    /// Room code.
    pub room: String,
}

/// Receiver asks to join a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoom {
    /// Room code.
    pub room: String,
}

/// Relay delivers the manifest to a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    /// Room code.
    pub room: String,
    /// Manifest entries in index order.
    pub files: Vec<FileEntry>,
}

/// Participant leaves a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRoom {
    /// Room code.
    pub room: String,
}

/// Relay announces the room was destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomClosed {
    /// Room code.
    pub room: String,
    /// Why the room closed.
    pub reason: String,
}
