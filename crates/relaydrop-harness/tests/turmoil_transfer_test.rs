//! End-to-end transfers over turmoil's simulated TCP.
//!
//! The relay runs as a turmoil host through [`SimServer::serve`]; each
//! participant is a [`SimPeer`] doing real frame I/O.

use std::{collections::BTreeSet, time::Duration};

use relaydrop_client::{ClientConfig, ClientEvent, MemoryChunkStore, MemorySource, TransferEvent};
use relaydrop_core::RoomCode;
use relaydrop_harness::{SimEnv, SimPeer, SimServer};
use relaydrop_proto::ErrorPayload;

const RELAY: &str = "relay:7400";
const TICK: Duration = Duration::from_millis(100);

type Peer = SimPeer<MemoryChunkStore, MemorySource>;

fn files() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("photo.raw", (0..700_000u32).map(|i| (i % 253) as u8).collect()),
        ("notes.txt", b"turmoil relay".to_vec()),
    ]
}

fn source() -> MemorySource {
    files().into_iter().fold(MemorySource::new(), |s, (name, data)| s.with_file(name, data))
}

fn room() -> RoomCode {
    RoomCode::parse("tcp123").unwrap()
}

fn simulation() -> turmoil::Sim<'static> {
    let mut sim = turmoil::Builder::new().simulation_duration(Duration::from_secs(120)).build();

    sim.host("relay", || async {
        SimServer::bind("0.0.0.0:7400").await?.serve(TICK).await?;
        Ok(())
    });

    sim
}

async fn connect(seed: u64) -> std::io::Result<Peer> {
    Peer::connect(RELAY, SimEnv::with_seed(seed), MemoryChunkStore::new(), ClientConfig::default()).await
}

/// Share the files, start streaming and wait for `receivers` confirmations
/// of every file.
async fn run_sender(receivers: usize) -> std::io::Result<()> {
    let mut sender = connect(1).await?;
    sender.command(ClientEvent::CreateRoom { room: Some(room()), source: source() }).await?;
    sender.command(ClientEvent::StartTransfer).await?;

    let mut confirmed = BTreeSet::new();
    while confirmed.len() < files().len() {
        if let TransferEvent::FileConfirmed { file_index, confirmations, .. } =
            sender.next_event(TICK).await?
        {
            if confirmations == receivers {
                confirmed.insert(file_index);
            }
        }
    }
    Ok(())
}

/// Join, retrying while the room does not exist yet, and wait for every
/// file.
async fn run_receiver(seed: u64, delay: Duration) -> std::io::Result<Peer> {
    tokio::time::sleep(delay).await;
    let mut receiver = connect(seed).await?;
    receiver.command(ClientEvent::JoinRoom { room: room() }).await?;

    loop {
        match receiver.next_event(TICK).await? {
            TransferEvent::Error { code: ErrorPayload::ROOM_NOT_FOUND, .. } => {
                tokio::time::sleep(Duration::from_millis(250)).await;
                receiver.command(ClientEvent::JoinRoom { room: room() }).await?;
            },
            TransferEvent::TransferComplete { .. } => return Ok(receiver),
            _ => {},
        }
    }
}

fn assert_received(receiver: &Peer) {
    let coordinator = receiver.client().receiver().unwrap();
    for (index, (name, data)) in files().into_iter().enumerate() {
        let file = coordinator.manifest().unwrap().file(index as u32).unwrap();
        assert_eq!(file.name, name);
        assert_eq!(coordinator.assemble_file(index as u32).unwrap().as_ref(), data.as_slice());
    }
}

#[test]
fn transfer_reaches_every_receiver() {
    let mut sim = simulation();

    sim.client("sender", async {
        run_sender(2).await?;
        Ok(())
    });

    sim.client("early", async {
        let receiver = run_receiver(2, Duration::from_millis(50)).await?;
        assert_received(&receiver);
        Ok(())
    });

    // Joins after streaming started and recovers everything by request
    sim.client("late", async {
        let receiver = run_receiver(3, Duration::from_secs(5)).await?;
        assert_received(&receiver);
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn receiver_joining_before_room_exists_retries() {
    let mut sim = simulation();

    sim.client("receiver", async {
        let receiver = run_receiver(4, Duration::ZERO).await?;
        assert_received(&receiver);
        Ok(())
    });

    sim.client("sender", async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        run_sender(1).await?;
        Ok(())
    });

    sim.run().unwrap();
}
