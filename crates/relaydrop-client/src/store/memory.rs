//! In-memory chunk store for tests and simulation.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use relaydrop_core::RoomCode;

use super::{ChunkStore, StoreError};

type ChunkKey = (RoomCode, u32, u32);

#[derive(Default)]
struct State {
    chunks: BTreeMap<ChunkKey, Bytes>,
    fingerprints: BTreeMap<RoomCode, Vec<u8>>,
}

/// In-memory chunk store.
///
/// A single ordered map keyed by `(room, file_index, chunk_index)`, so per-file
/// enumeration is a range scan. Clones share the map.
#[derive(Clone, Default)]
pub struct MemoryChunkStore {
    state: Arc<Mutex<State>>,
}

impl MemoryChunkStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total chunks held across all rooms.
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.chunks.len()).unwrap_or(0)
    }

    /// Whether the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Io("chunk map lock poisoned".to_string()))
    }

    fn file_range(
        room: &RoomCode,
        file_index: u32,
    ) -> std::ops::RangeInclusive<ChunkKey> {
        (room.clone(), file_index, 0)..=(room.clone(), file_index, u32::MAX)
    }
}

impl std::fmt::Debug for MemoryChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChunkStore").field("chunks", &self.len()).finish()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put_chunk(
        &self,
        room: &RoomCode,
        file_index: u32,
        chunk_index: u32,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        self.lock()?
            .chunks
            .insert((room.clone(), file_index, chunk_index), Bytes::copy_from_slice(payload));
        Ok(())
    }

    fn chunk_indexes(&self, room: &RoomCode, file_index: u32) -> Result<Vec<u32>, StoreError> {
        let state = self.lock()?;
        Ok(state.chunks.range(Self::file_range(room, file_index)).map(|((_, _, c), _)| *c).collect())
    }

    fn received_count(&self, room: &RoomCode, file_index: u32) -> Result<u32, StoreError> {
        let state = self.lock()?;
        Ok(state.chunks.range(Self::file_range(room, file_index)).count() as u32)
    }

    fn load_chunk(
        &self,
        room: &RoomCode,
        file_index: u32,
        chunk_index: u32,
    ) -> Result<Option<Bytes>, StoreError> {
        Ok(self.lock()?.chunks.get(&(room.clone(), file_index, chunk_index)).cloned())
    }

    fn load_file(
        &self,
        room: &RoomCode,
        file_index: u32,
    ) -> Result<Vec<(u32, Bytes)>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .chunks
            .range(Self::file_range(room, file_index))
            .map(|((_, _, c), payload)| (*c, payload.clone()))
            .collect())
    }

    fn manifest_fingerprint(&self, room: &RoomCode) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.fingerprints.get(room).cloned())
    }

    fn set_manifest_fingerprint(
        &self,
        room: &RoomCode,
        fingerprint: &[u8],
    ) -> Result<(), StoreError> {
        self.lock()?.fingerprints.insert(room.clone(), fingerprint.to_vec());
        Ok(())
    }

    fn purge_room(&self, room: &RoomCode) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        state.fingerprints.remove(room);

        let before = state.chunks.len();
        state.chunks.retain(|(r, _, _), _| r != room);
        Ok(before - state.chunks.len())
    }
}
