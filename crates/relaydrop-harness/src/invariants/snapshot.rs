//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture the relay's rooms and every participant's view at one
//! point in time. Invariants operate on snapshots rather than live state so
//! each check sees one consistent picture.

use std::collections::BTreeSet;

use relaydrop_core::RoomCode;

/// Snapshot of the whole simulated system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldSnapshot {
    /// Rooms active at the relay.
    pub rooms: Vec<RoomSnapshot>,
    /// Per-participant state.
    pub participants: Vec<ParticipantSnapshot>,
}

impl WorldSnapshot {
    /// Snapshot with no rooms and no participants.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Relay room with `code`.
    pub fn room(&self, code: &RoomCode) -> Option<&RoomSnapshot> {
        self.rooms.iter().find(|r| &r.code == code)
    }
}

/// Relay-side state of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    /// Room code.
    pub code: RoomCode,
    /// Participant id of the sender.
    pub sender: u64,
    /// Current receivers.
    pub receivers: BTreeSet<u64>,
    /// `totalChunks` per file, by file index.
    pub total_chunks: Vec<u32>,
    /// Confirmation set per file, by file index.
    pub confirmed: Vec<BTreeSet<u64>>,
}

/// What a participant is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantRole {
    /// In no room.
    Idle,
    /// Sharing files.
    Sending,
    /// Receiving files.
    Receiving,
}

/// One participant's observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantSnapshot {
    /// Stable participant id.
    pub participant_id: u64,
    /// Current role.
    pub role: ParticipantRole,
    /// Room of the current role.
    pub room: Option<RoomCode>,
    /// `totalChunks` per file of the manifest this participant holds.
    pub total_chunks: Option<Vec<u32>>,
    /// Chunk indexes in the store for the current room, per file. Read past
    /// any fault injection.
    pub held: Vec<Vec<u32>>,
    /// Confirmation sets as seen by a sender, per file.
    pub sender_confirmed: Vec<BTreeSet<u64>>,
    /// Every aggregate progress value reported since the last join of a new
    /// manifest.
    pub progress_history: Vec<f64>,
    /// Files reported complete in the current room.
    pub completed: BTreeSet<u32>,
    /// Every `(room, file)` ever reported complete.
    pub ever_completed: BTreeSet<(RoomCode, u32)>,
}

impl ParticipantSnapshot {
    /// Idle participant with nothing recorded.
    pub fn idle(participant_id: u64) -> Self {
        Self {
            participant_id,
            role: ParticipantRole::Idle,
            room: None,
            total_chunks: None,
            held: Vec::new(),
            sender_confirmed: Vec::new(),
            progress_history: Vec::new(),
            completed: BTreeSet::new(),
            ever_completed: BTreeSet::new(),
        }
    }

    /// Whether every chunk of `file_index` is held.
    pub fn holds_file(&self, file_index: usize) -> bool {
        match (&self.total_chunks, self.held.get(file_index)) {
            (Some(totals), Some(held)) => {
                totals.get(file_index).is_some_and(|total| held.len() == *total as usize)
            },
            _ => false,
        }
    }
}
