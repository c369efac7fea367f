//! Property-based tests for a sender and receiver wired back to back.
//!
//! No relay sits in between: every `ChunkTransfer` the sender emits is turned
//! into the `ReceiveChunk` the relay would forward. Delivery order is shuffled
//! and chunks are duplicated, so these tests check the properties that must
//! hold regardless of what the network does:
//! - A file is complete exactly when every chunk index has been stored
//! - Assembled files are byte-identical to the source
//! - Progress never goes backwards
//! - Each file is confirmed exactly once per join
//! - A resumed receiver asks only for what it does not hold

use std::collections::BTreeSet;

use proptest::prelude::*;
use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;
use relaydrop_client::{
    ClientAction, MemoryChunkStore, MemorySource, ReceiverCoordinator, RoomCode, SenderConfig,
    SenderCoordinator, TransferEvent,
};
use relaydrop_core::CHUNK_SIZE;
use relaydrop_proto::{
    Payload,
    payloads::{
        room::FileEntry,
        transfer::{ReceiveChunk, RequestMissingChunks},
    },
};

const ROOM: &str = "prop42";

fn room() -> RoomCode {
    RoomCode::parse(ROOM).unwrap()
}

fn file_data(file: usize, size: u64) -> Vec<u8> {
    (0..size).map(|i| ((i * 31 + file as u64 * 7) % 251) as u8).collect()
}

fn source(sizes: &[u64]) -> MemorySource {
    sizes
        .iter()
        .enumerate()
        .fold(MemorySource::new(), |src, (i, size)| src.with_file(format!("f{i}.bin"), file_data(i, *size)))
}

fn sender(sizes: &[u64]) -> SenderCoordinator<MemorySource> {
    SenderCoordinator::new(room(), source(sizes), SenderConfig::default()).unwrap()
}

fn entries(sender: &SenderCoordinator<MemorySource>) -> Vec<FileEntry> {
    sender
        .manifest()
        .files()
        .iter()
        .map(|f| FileEntry { index: f.index, name: f.name.clone(), size: f.byte_size })
        .collect()
}

/// Drain the sender's queue, flushing every chunk as soon as it is emitted.
fn drain(sender: &mut SenderCoordinator<MemorySource>) -> Vec<ReceiveChunk> {
    let mut chunks = Vec::new();
    loop {
        let actions = sender.poll_chunks().unwrap();
        let mut emitted = false;
        for action in actions {
            if let ClientAction::SendChunk { frame, bytes } = action {
                let Payload::ChunkTransfer(ct) = Payload::from_frame(&frame).unwrap() else {
                    panic!("chunk frame without a chunk payload");
                };
                chunks.push(ReceiveChunk {
                    room: ct.room,
                    file_index: ct.file_index,
                    chunk_index: ct.chunk_index,
                    chunk: ct.chunk,
                });
                sender.chunk_flushed(bytes);
                emitted = true;
            }
        }
        if !emitted {
            return chunks;
        }
    }
}

fn requests(actions: &[ClientAction]) -> Vec<RequestMissingChunks> {
    actions
        .iter()
        .filter_map(|a| match a {
            ClientAction::Send(frame) => match Payload::from_frame(frame).unwrap() {
                Payload::RequestMissingChunks(req) => Some(req),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn confirmations(actions: &[ClientAction]) -> usize {
    actions
        .iter()
        .filter(|a| match a {
            ClientAction::Send(frame) => {
                matches!(Payload::from_frame(frame), Ok(Payload::ConfirmFileReceived(_)))
            },
            _ => false,
        })
        .count()
}

fn shuffled_with_duplicates(mut chunks: Vec<ReceiveChunk>, seed: u64) -> Vec<ReceiveChunk> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let duplicates: Vec<ReceiveChunk> =
        chunks.iter().filter(|_| rng.gen_bool(0.3)).cloned().collect();
    chunks.extend(duplicates);
    chunks.shuffle(&mut rng);
    chunks
}

fn file_sizes() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1..=(3 * CHUNK_SIZE + 17), 1..=3)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_any_delivery_order_completes(sizes in file_sizes(), seed in any::<u64>()) {
        let mut sender = sender(&sizes);
        sender.start_transfer();
        let delivery = shuffled_with_duplicates(drain(&mut sender), seed);

        let mut receiver = ReceiverCoordinator::new(MemoryChunkStore::new(), room());
        receiver.on_joined_room(&entries(&sender)).unwrap();

        let mut last_aggregate = 0.0;
        let mut confirmed = 0;
        let mut completes = 0;
        for chunk in &delivery {
            let actions = receiver.on_chunk_received(chunk).unwrap();
            confirmed += confirmations(&actions);

            for action in &actions {
                match action {
                    ClientAction::Notify(TransferEvent::FileProgress { aggregate, .. }) => {
                        prop_assert!(*aggregate >= last_aggregate);
                        last_aggregate = *aggregate;
                    },
                    ClientAction::Notify(TransferEvent::TransferComplete { .. }) => completes += 1,
                    _ => {},
                }
            }
        }

        prop_assert_eq!(confirmed, sizes.len());
        prop_assert_eq!(completes, 1);
        prop_assert!((receiver.aggregate_progress().unwrap() - 100.0).abs() < 1e-9);

        for (i, size) in sizes.iter().enumerate() {
            let index = i as u32;
            prop_assert!(receiver.is_file_complete(index).unwrap());
            prop_assert_eq!(receiver.assemble_file(index).unwrap().to_vec(), file_data(i, *size));
        }
    }

    #[test]
    fn prop_resume_requests_exact_complement(
        sizes in file_sizes(),
        seed in any::<u64>(),
        keep in 0.0f64..1.0,
    ) {
        let mut first_sender = sender(&sizes);
        first_sender.start_transfer();
        let all = drain(&mut first_sender);

        let store = MemoryChunkStore::new();
        let mut receiver = ReceiverCoordinator::new(store.clone(), room());
        receiver.on_joined_room(&entries(&first_sender)).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut held: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); sizes.len()];
        for chunk in all.iter().filter(|_| rng.gen_bool(keep)) {
            receiver.on_chunk_received(chunk).unwrap();
            held[chunk.file_index as usize].insert(chunk.chunk_index);
        }

        // Restart: fresh coordinator over the same store, fresh sender.
        let mut resumed = ReceiverCoordinator::new(store, room());
        let join = resumed.on_joined_room(&entries(&first_sender)).unwrap();
        let mut sender = sender(&sizes);

        for req in requests(&join) {
            let held_here = &held[req.file_index as usize];
            prop_assert_eq!(req.received_indexes.iter().copied().collect::<BTreeSet<_>>(), held_here.clone());
            sender.handle_missing_chunks_request(req.file_index, &req.received_indexes, 7).unwrap();
        }

        let resent = drain(&mut sender);
        for chunk in &resent {
            prop_assert!(!held[chunk.file_index as usize].contains(&chunk.chunk_index));
            resumed.on_chunk_received(chunk).unwrap();
        }

        for i in 0..sizes.len() {
            prop_assert!(resumed.is_file_complete(i as u32).unwrap());
        }
    }

    #[test]
    fn prop_repeated_requests_queue_once(sizes in file_sizes(), repeats in 1usize..5) {
        let mut sender = sender(&sizes);
        let total: usize =
            sender.manifest().files().iter().map(|f| f.total_chunks() as usize).sum();

        let mut queued = 0;
        for _ in 0..repeats {
            for i in 0..sizes.len() {
                queued += sender.handle_missing_chunks_request(i as u32, &[], 9).unwrap();
            }
        }

        prop_assert_eq!(queued, total);
        prop_assert_eq!(sender.queued_len(), total);
    }
}
