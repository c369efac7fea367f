//! Durable chunk storage for receivers.
//!
//! One keyed table: `(room, file_index, chunk_index) → chunk bytes`. The room
//! code is part of the key, so two rooms that both have a file 0 never see
//! each other's chunks, and leaving a room purges exactly that room.
//!
//! Next to the chunks, each room records the fingerprint of the manifest its
//! chunks were stored under. A room code reused for a different transfer
//! shows up as a fingerprint mismatch on the next join, even in a new process.
//!
//! The trait is synchronous. A successful `put_chunk` means the chunk is
//! durable for that backend; receivers recompute progress only after it
//! returns `Ok`.

mod chaotic;
mod memory;
mod redb;

use bytes::Bytes;
pub use chaotic::ChaoticChunkStore;
pub use memory::MemoryChunkStore;
use relaydrop_core::RoomCode;
use thiserror::Error;

pub use self::redb::RedbChunkStore;

/// Chunk store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend I/O failed; the operation did not take effect.
    #[error("store I/O error: {0}")]
    Io(String),

    /// A chunk expected to be present is missing.
    #[error("chunk not found: {0}")]
    NotFound(String),

    /// Stored bytes could not be interpreted.
    #[error("store corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Keyed chunk storage.
///
/// Must be Clone (a session and its coordinators share one store), Send +
/// Sync, and synchronous. Clones access the same underlying data.
///
/// # Invariants
///
/// - `put_chunk` is an idempotent upsert: storing a key twice leaves one
///   entry holding the last payload.
/// - After `put_chunk` returns `Ok`, the chunk is visible to every read and
///   survives a restart for durable backends.
/// - Enumeration is in ascending `chunk_index` order.
pub trait ChunkStore: Clone + Send + Sync + 'static {
    /// Store one chunk, overwriting any previous payload for the key.
    fn put_chunk(
        &self,
        room: &RoomCode,
        file_index: u32,
        chunk_index: u32,
        payload: &[u8],
    ) -> Result<(), StoreError>;

    /// Held chunk indexes for a file, ascending.
    fn chunk_indexes(&self, room: &RoomCode, file_index: u32) -> Result<Vec<u32>, StoreError>;

    /// Number of distinct chunks held for a file.
    fn received_count(&self, room: &RoomCode, file_index: u32) -> Result<u32, StoreError> {
        Ok(self.chunk_indexes(room, file_index)?.len() as u32)
    }

    /// One chunk's payload. `None` if not held.
    fn load_chunk(
        &self,
        room: &RoomCode,
        file_index: u32,
        chunk_index: u32,
    ) -> Result<Option<Bytes>, StoreError>;

    /// Every held chunk of a file as `(chunk_index, payload)`, ascending.
    fn load_file(&self, room: &RoomCode, file_index: u32)
    -> Result<Vec<(u32, Bytes)>, StoreError>;

    /// Fingerprint of the manifest the room's chunks belong to. `None` if
    /// none was recorded.
    fn manifest_fingerprint(&self, room: &RoomCode) -> Result<Option<Vec<u8>>, StoreError>;

    /// Record the room's manifest fingerprint, replacing any previous one.
    fn set_manifest_fingerprint(&self, room: &RoomCode, fingerprint: &[u8])
    -> Result<(), StoreError>;

    /// Remove every chunk of a room and its manifest fingerprint. Returns the
    /// number of chunks removed.
    fn purge_room(&self, room: &RoomCode) -> Result<usize, StoreError>;
}

/// Persistent key: `[room_len:u8][room bytes][file_index:u32 BE][chunk_index:u32 BE]`.
///
/// The length prefix keeps a room's key range from overlapping any other
/// room whose code starts with the same characters.
pub(crate) fn encode_chunk_key(room: &RoomCode, file_index: u32, chunk_index: u32) -> Vec<u8> {
    let mut key = room.key_prefix();
    key.extend_from_slice(&file_index.to_be_bytes());
    key.extend_from_slice(&chunk_index.to_be_bytes());
    key
}

/// Chunk index from the last four bytes of a persistent key.
pub(crate) fn decode_chunk_index(key: &[u8]) -> Result<u32, StoreError> {
    key.len()
        .checked_sub(4)
        .and_then(|start| key.get(start..))
        .and_then(|tail| <[u8; 4]>::try_from(tail).ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| StoreError::Corrupted(format!("chunk key too short: {} bytes", key.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_key_layout() {
        let room = RoomCode::parse("ab").unwrap();
        let key = encode_chunk_key(&room, 1, 0x0102_0304);

        assert_eq!(key, vec![2, b'a', b'b', 0, 0, 0, 1, 1, 2, 3, 4]);
        assert_eq!(decode_chunk_index(&key), Ok(0x0102_0304));
    }

    #[test]
    fn room_prefixes_do_not_overlap() {
        let short = RoomCode::parse("ab").unwrap();
        let long = RoomCode::parse("abc").unwrap();

        let short_max = encode_chunk_key(&short, u32::MAX, u32::MAX);
        let long_min = encode_chunk_key(&long, 0, 0);
        assert!(short_max < long_min);
        assert!(!long_min.starts_with(&short.key_prefix()));
    }

    #[test]
    fn short_key_is_corruption() {
        assert!(matches!(decode_chunk_index(&[1, 2]), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn only_io_is_transient() {
        assert!(StoreError::Io("disk".to_string()).is_transient());
        assert!(!StoreError::Corrupted("bad".to_string()).is_transient());
        assert!(!StoreError::NotFound("x".to_string()).is_transient());
    }
}
