//! Chaotic chunk store for fault injection testing
//!
//! Wraps another store and fails operations at a configured rate. A failed
//! write never reaches the inner store, so a failure reported to the caller
//! always means the chunk is not held.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use relaydrop_core::RoomCode;

use super::{ChunkStore, StoreError};

const DEFAULT_SEED: u64 = 0x5EED_C0DE_D00D_F00D;

/// Chunk store wrapper that randomly injects I/O failures.
///
/// Seeded, so a failing run replays exactly with the same seed and the same
/// operation sequence.
#[derive(Clone)]
pub struct ChaoticChunkStore<S: ChunkStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaCha8Rng>>,
    operation_count: Arc<AtomicUsize>,
}

impl<S: ChunkStore> ChaoticChunkStore<S> {
    /// Create a chaotic wrapper with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wrapped store, bypassing fault injection.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Operations attempted so far, failed ones included.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn maybe_fail(&self, op: &str) -> Result<(), StoreError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let fail = match self.rng.lock() {
            Ok(mut rng) => rng.gen_bool(self.failure_rate),
            Err(_) => return Err(StoreError::Io("chaos rng lock poisoned".to_string())),
        };

        if fail { Err(StoreError::Io(format!("injected failure: {op}"))) } else { Ok(()) }
    }
}

impl<S: ChunkStore> std::fmt::Debug for ChaoticChunkStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaoticChunkStore")
            .field("failure_rate", &self.failure_rate)
            .field("operation_count", &self.operation_count())
            .finish_non_exhaustive()
    }
}

impl<S: ChunkStore> ChunkStore for ChaoticChunkStore<S> {
    fn put_chunk(
        &self,
        room: &RoomCode,
        file_index: u32,
        chunk_index: u32,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        self.maybe_fail("put_chunk")?;
        self.inner.put_chunk(room, file_index, chunk_index, payload)
    }

    fn chunk_indexes(&self, room: &RoomCode, file_index: u32) -> Result<Vec<u32>, StoreError> {
        self.maybe_fail("chunk_indexes")?;
        self.inner.chunk_indexes(room, file_index)
    }

    fn load_chunk(
        &self,
        room: &RoomCode,
        file_index: u32,
        chunk_index: u32,
    ) -> Result<Option<Bytes>, StoreError> {
        self.maybe_fail("load_chunk")?;
        self.inner.load_chunk(room, file_index, chunk_index)
    }

    fn load_file(
        &self,
        room: &RoomCode,
        file_index: u32,
    ) -> Result<Vec<(u32, Bytes)>, StoreError> {
        self.maybe_fail("load_file")?;
        self.inner.load_file(room, file_index)
    }

    fn manifest_fingerprint(&self, room: &RoomCode) -> Result<Option<Vec<u8>>, StoreError> {
        self.maybe_fail("manifest_fingerprint")?;
        self.inner.manifest_fingerprint(room)
    }

    fn set_manifest_fingerprint(
        &self,
        room: &RoomCode,
        fingerprint: &[u8],
    ) -> Result<(), StoreError> {
        self.maybe_fail("set_manifest_fingerprint")?;
        self.inner.set_manifest_fingerprint(room, fingerprint)
    }

    fn purge_room(&self, room: &RoomCode) -> Result<usize, StoreError> {
        self.maybe_fail("purge_room")?;
        self.inner.purge_room(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChunkStore;

    #[test]
    fn zero_rate_never_fails() {
        let store = ChaoticChunkStore::new(MemoryChunkStore::new(), 0.0);
        let room = RoomCode::parse("abc").unwrap();

        for chunk in 0..50 {
            store.put_chunk(&room, 0, chunk, b"x").unwrap();
        }

        assert_eq!(store.received_count(&room, 0).unwrap(), 50);
        assert_eq!(store.operation_count(), 51);
    }

    #[test]
    fn full_rate_always_fails_without_side_effects() {
        let store = ChaoticChunkStore::new(MemoryChunkStore::new(), 1.0);
        let room = RoomCode::parse("abc").unwrap();

        let err = store.put_chunk(&room, 0, 0, b"x").unwrap_err();
        assert!(err.is_transient());
        assert!(store.inner().is_empty());
    }

    #[test]
    fn same_seed_same_failures() {
        let room = RoomCode::parse("abc").unwrap();
        let run = |seed| {
            let store = ChaoticChunkStore::with_seed(MemoryChunkStore::new(), 0.3, seed);
            (0..100).map(|c| store.put_chunk(&room, 0, c, b"x").is_ok()).collect::<Vec<_>>()
        };

        assert_eq!(run(7), run(7));
    }

    #[test]
    #[should_panic(expected = "failure_rate must be between 0.0 and 1.0")]
    fn rejects_out_of_range_rate() {
        let _ = ChaoticChunkStore::new(MemoryChunkStore::new(), 1.5);
    }
}
