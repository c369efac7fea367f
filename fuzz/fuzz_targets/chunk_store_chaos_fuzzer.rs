//! Fuzz target for ChunkStore under injected failures
//!
//! Runs arbitrary store operations through `ChaoticChunkStore` and mirrors
//! every operation that reported success in a plain model.
//!
//! # Invariants
//!
//! - A failed write leaves the store unchanged
//! - A successful write is visible to every later read
//! - Enumeration is ascending and matches the model
//! - Purging one room never touches another
//! - A room's manifest fingerprint is the last one set, until the room is purged

#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use relaydrop_client::{ChaoticChunkStore, ChunkStore, MemoryChunkStore};
use relaydrop_core::RoomCode;

const ROOMS: [&str; 3] = ["a", "ab", "b"];

#[derive(Debug, Arbitrary)]
struct Scenario {
    chaos_seed: u64,
    /// 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<StoreOp>,
}

#[derive(Debug, Arbitrary)]
enum StoreOp {
    Put { room: u8, file: u8, chunk: u8, payload: Vec<u8> },
    Load { room: u8, file: u8, chunk: u8 },
    LoadFile { room: u8, file: u8 },
    Purge { room: u8 },
    SetFingerprint { room: u8, fingerprint: Vec<u8> },
    Fingerprint { room: u8 },
}

type Model = BTreeMap<(usize, u32, u32), Bytes>;
type FingerprintModel = BTreeMap<usize, Vec<u8>>;

fn room(slot: u8) -> (usize, RoomCode) {
    let i = slot as usize % ROOMS.len();
    (i, RoomCode::parse(ROOMS[i]).expect("fixed codes are valid"))
}

fuzz_target!(|scenario: Scenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let store = ChaoticChunkStore::with_seed(MemoryChunkStore::new(), failure_rate, scenario.chaos_seed);
    let mut model = Model::new();
    let mut fingerprints = FingerprintModel::new();

    for op in scenario.operations {
        match op {
            StoreOp::Put { room: slot, file, chunk, payload } => {
                let (i, code) = room(slot);
                let key = (i, u32::from(file % 4), u32::from(chunk));
                if store.put_chunk(&code, key.1, key.2, &payload).is_ok() {
                    model.insert(key, Bytes::from(payload));
                }
            },
            StoreOp::Load { room: slot, file, chunk } => {
                let (i, code) = room(slot);
                let key = (i, u32::from(file % 4), u32::from(chunk));
                if let Ok(loaded) = store.load_chunk(&code, key.1, key.2) {
                    assert_eq!(loaded.as_ref(), model.get(&key));
                }
            },
            StoreOp::LoadFile { room: slot, file } => {
                let (i, code) = room(slot);
                let file = u32::from(file % 4);
                if let Ok(chunks) = store.load_file(&code, file) {
                    let expected: Vec<(u32, Bytes)> = model
                        .iter()
                        .filter(|((r, f, _), _)| *r == i && *f == file)
                        .map(|((_, _, c), payload)| (*c, payload.clone()))
                        .collect();
                    assert_eq!(chunks, expected);
                }
            },
            StoreOp::Purge { room: slot } => {
                let (i, code) = room(slot);
                if let Ok(removed) = store.purge_room(&code) {
                    let before = model.len();
                    model.retain(|(r, _, _), _| *r != i);
                    fingerprints.remove(&i);
                    assert_eq!(removed, before - model.len());
                }
            },
            StoreOp::SetFingerprint { room: slot, fingerprint } => {
                let (i, code) = room(slot);
                if store.set_manifest_fingerprint(&code, &fingerprint).is_ok() {
                    fingerprints.insert(i, fingerprint);
                }
            },
            StoreOp::Fingerprint { room: slot } => {
                let (i, code) = room(slot);
                if let Ok(stored) = store.manifest_fingerprint(&code) {
                    assert_eq!(stored.as_ref(), fingerprints.get(&i));
                }
            },
        }
    }

    // The unwrapped store must agree with the model exactly
    for (i, name) in ROOMS.iter().enumerate() {
        let code = RoomCode::parse(name).expect("fixed codes are valid");
        let stored = store.inner().manifest_fingerprint(&code).expect("memory store never fails");
        assert_eq!(stored.as_ref(), fingerprints.get(&i));

        for file in 0..4 {
            let held = store.inner().chunk_indexes(&code, file).expect("memory store never fails");
            let expected: Vec<u32> =
                model.keys().filter(|(r, f, _)| *r == i && *f == file).map(|(_, _, c)| *c).collect();
            assert_eq!(held, expected);
        }
    }
});
