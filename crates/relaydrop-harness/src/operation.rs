//! Operations for model runs and fuzzing.
//!
//! Operations represent everything a test can do to a [`SimWorld`]. They are
//! generated by proptest or `arbitrary` and applied in sequence; the world's
//! invariants must hold after every one of them.

use std::time::Duration;

use arbitrary::Arbitrary;
use relaydrop_client::{ClientEvent, MemorySource};
use relaydrop_core::RoomCode;

use crate::{SimWorld, WorldError};

/// Participant index, reduced modulo the world's participant count.
pub type PeerId = u8;

/// Room slot, reduced modulo [`ROOM_SLOTS`].
pub type RoomSlot = u8;

/// Distinct room codes operations can name.
pub const ROOM_SLOTS: u8 = 3;

/// A single action against a [`SimWorld`].
#[derive(Debug, Clone, Arbitrary)]
pub enum WorldOp {
    /// Open a connection.
    Connect {
        /// Participant
        peer: PeerId,
    },

    /// Close a connection without automatic reconnect.
    Disconnect {
        /// Participant
        peer: PeerId,
    },

    /// Share the slot's files under the slot's code.
    CreateRoom {
        /// Participant
        peer: PeerId,
        /// Room slot
        room: RoomSlot,
    },

    /// Join the slot's room.
    JoinRoom {
        /// Participant
        peer: PeerId,
        /// Room slot
        room: RoomSlot,
    },

    /// Start streaming as the sender.
    StartTransfer {
        /// Participant
        peer: PeerId,
    },

    /// Leave the current room.
    LeaveRoom {
        /// Participant
        peer: PeerId,
    },

    /// Deliver up to this many queued frames.
    Deliver {
        /// Frame count
        frames: u8,
    },

    /// Advance virtual time, ticking the relay and every client.
    AdvanceTime {
        /// Milliseconds to advance
        millis: u16,
    },

    /// Reconnect every participant that lost its connection.
    ReconnectLost,
}

impl WorldOp {
    /// Apply to `world`.
    ///
    /// Commands a client rejects in its current state (joining twice,
    /// leaving without a room) are not failures.
    pub fn apply(&self, world: &mut SimWorld) -> Result<(), WorldError> {
        let count = world.participant_count();
        if count == 0 {
            return Ok(());
        }
        let peer = |p: PeerId| usize::from(p) % count;

        let result = match *self {
            Self::Connect { peer: p } => world.connect(peer(p)),
            Self::Disconnect { peer: p } => world.disconnect(peer(p)),
            Self::CreateRoom { peer: p, room } => {
                let event =
                    ClientEvent::CreateRoom { room: Some(slot_code(room)), source: slot_source(room) };
                world.command(peer(p), event)
            },
            Self::JoinRoom { peer: p, room } => {
                world.command(peer(p), ClientEvent::JoinRoom { room: slot_code(room) })
            },
            Self::StartTransfer { peer: p } => world.command(peer(p), ClientEvent::StartTransfer),
            Self::LeaveRoom { peer: p } => world.command(peer(p), ClientEvent::LeaveRoom),
            Self::Deliver { frames } => world.run_until_idle(usize::from(frames)).map(|_| ()),
            Self::AdvanceTime { millis } => world.advance(Duration::from_millis(u64::from(millis))),
            Self::ReconnectLost => world.reconnect_lost(),
        };

        match result {
            Err(WorldError::Rejected { .. }) => Ok(()),
            other => other,
        }
    }
}

/// Room code for a slot.
///
/// # Panics
///
/// Never; slot codes are short alphanumeric strings.
#[allow(clippy::expect_used)]
pub fn slot_code(room: RoomSlot) -> RoomCode {
    RoomCode::parse(&format!("slot{}", room % ROOM_SLOTS)).expect("slot codes are valid")
}

/// Files shared under a slot. Fixed per slot, so a reused code always
/// carries the same manifest.
pub fn slot_source(room: RoomSlot) -> MemorySource {
    let slot = usize::from(room % ROOM_SLOTS);
    let fill = |seed: usize, len: usize| (0..len).map(|i| (i * 31 + seed) as u8).collect::<Vec<_>>();

    MemorySource::new()
        .with_file(format!("slot{slot}-a.bin"), fill(slot, 300_000 + slot * 70_000))
        .with_file(format!("slot{slot}-b.bin"), fill(slot + 7, 1 + slot * 4_000))
}
