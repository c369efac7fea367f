//! Room Manager
//!
//! Owns every active [`RoomSession`], keyed by room code. Rooms share no
//! mutable state with each other; the driver serializes all mutations, so a
//! join, leave or disconnect on one room is applied atomically.
//!
//! Rooms must be explicitly created (no lazy creation): a join for an unknown
//! code fails and leaves no trace.

use std::{collections::BTreeMap, time::Duration};

use relaydrop_core::{RoomCode, TransferManifest, env::Environment};

use crate::room::{DisconnectOutcome, LeaveOutcome, RoomSession};

/// Result of a `create_room` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new room was created.
    Created,
    /// The original sender reattached to its surviving room.
    Reattached {
        /// Receivers that should get the manifest again
        receivers: Vec<u64>,
    },
}

/// Errors from RoomManager operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// Room code already held by another sender or manifest
    #[error("Room code already in use: {0}")]
    DuplicateRoomCode(RoomCode),

    /// Room does not exist
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// File index outside the manifest
    #[error("Unknown file index {file_index} ({file_count} files)")]
    UnknownFileIndex {
        /// Referenced index
        file_index: u32,
        /// Files in the manifest
        file_count: usize,
    },

    /// Chunk index past the end of its file
    #[error("Chunk {chunk_index} out of range for file {file_index} ({total} chunks)")]
    UnknownChunkIndex {
        /// File the chunk belongs to
        file_index: u32,
        /// Referenced chunk
        chunk_index: u32,
        /// Chunks in the file
        total: u32,
    },

    /// Participant may not perform this operation
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Sender is detached; the request can be retried
    #[error("Sender unavailable, retry after {retry_after:?}")]
    SenderUnavailable {
        /// Remaining sender grace period
        retry_after: Duration,
    },

    /// Malformed request (bad code, empty manifest)
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Active rooms, keyed by code.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
pub struct RoomManager<I = std::time::Instant> {
    rooms: BTreeMap<RoomCode, RoomSession<I>>,
}

impl<I> RoomManager<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Create a new RoomManager
    pub fn new() -> Self {
        Self { rooms: BTreeMap::new() }
    }

    /// Check if a room exists
    pub fn has_room(&self, code: &RoomCode) -> bool {
        self.rooms.contains_key(code)
    }

    /// Room state. `None` if the room does not exist.
    pub fn room(&self, code: &RoomCode) -> Option<&RoomSession<I>> {
        self.rooms.get(code)
    }

    /// Number of active rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Every active room, in code order.
    pub fn rooms(&self) -> impl Iterator<Item = &RoomSession<I>> + '_ {
        self.rooms.values()
    }

    /// Create a room, or reattach its original sender.
    ///
    /// A `create_room` for an existing code succeeds only when it comes from
    /// the room's sender with an identical manifest; that is how a sender
    /// resumes after losing its transport.
    pub fn create_room<E: Environment<Instant = I>>(
        &mut self,
        code: RoomCode,
        manifest: TransferManifest,
        sender: u64,
        env: &E,
    ) -> Result<CreateOutcome, RoomError> {
        if let Some(room) = self.rooms.get_mut(&code) {
            room.reattach(sender, &manifest)?;
            return Ok(CreateOutcome::Reattached { receivers: room.receivers().collect() });
        }

        let room = RoomSession::new(code.clone(), manifest, sender, env.now());
        self.rooms.insert(code, room);
        Ok(CreateOutcome::Created)
    }

    /// Add `receiver` to the room and return the room for manifest delivery.
    pub fn join_room(
        &mut self,
        code: &RoomCode,
        receiver: u64,
    ) -> Result<&RoomSession<I>, RoomError> {
        let room = self.room_mut(code)?;
        room.join(receiver)?;
        Ok(room)
    }

    /// Remove `participant` from the room. A closing room is dropped.
    pub fn leave_room(
        &mut self,
        code: &RoomCode,
        participant: u64,
    ) -> Result<LeaveOutcome, RoomError> {
        let outcome = self.room_mut(code)?.leave(participant)?;

        if matches!(outcome, LeaveOutcome::RoomClosed { .. }) {
            self.rooms.remove(code);
        }

        Ok(outcome)
    }

    /// Validate a chunk push. See [`RoomSession::check_chunk`].
    pub fn route_chunk(
        &self,
        code: &RoomCode,
        participant: u64,
        file_index: u32,
        chunk_index: u32,
    ) -> Result<(), RoomError> {
        self.room_ref(code)?.check_chunk(participant, file_index, chunk_index)
    }

    /// Validate a resend request and return the sender it goes to.
    pub fn route_missing_request<E: Environment<Instant = I>>(
        &self,
        code: &RoomCode,
        participant: u64,
        file_index: u32,
        grace: Duration,
        env: &E,
    ) -> Result<u64, RoomError> {
        let room = self.room_ref(code)?;
        room.check_request(participant, file_index, env.now(), grace)?;
        Ok(room.sender())
    }

    /// Record a confirmation. Returns the sender and the set size.
    pub fn record_confirmation(
        &mut self,
        code: &RoomCode,
        participant: u64,
        file_index: u32,
    ) -> Result<(u64, usize), RoomError> {
        let room = self.room_mut(code)?;
        let count = room.record_confirmation(participant, file_index)?;
        Ok((room.sender(), count))
    }

    /// Apply loss of `participant`'s transport to one room.
    pub fn participant_disconnected<E: Environment<Instant = I>>(
        &mut self,
        code: &RoomCode,
        participant: u64,
        env: &E,
    ) -> DisconnectOutcome {
        self.rooms
            .get_mut(code)
            .map_or(DisconnectOutcome::NotMember, |room| room.disconnect(participant, env.now()))
    }

    /// Close and drop every room whose sender stayed detached past `grace`.
    ///
    /// Returns each closed code with the receivers that were present.
    pub fn expire_detached<E: Environment<Instant = I>>(
        &mut self,
        grace: Duration,
        env: &E,
    ) -> Vec<(RoomCode, Vec<u64>)> {
        let now = env.now();

        let expired: Vec<RoomCode> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.grace_expired(now, grace))
            .map(|(code, _)| code.clone())
            .collect();

        let mut closed = Vec::with_capacity(expired.len());
        for code in expired {
            if let Some(mut room) = self.rooms.remove(&code) {
                let receivers = room.close();
                closed.push((code, receivers));
            }
        }

        closed
    }

    fn room_ref(&self, code: &RoomCode) -> Result<&RoomSession<I>, RoomError> {
        self.rooms.get(code).ok_or_else(|| RoomError::RoomNotFound(code.to_string()))
    }

    fn room_mut(&mut self, code: &RoomCode) -> Result<&mut RoomSession<I>, RoomError> {
        self.rooms.get_mut(code).ok_or_else(|| RoomError::RoomNotFound(code.to_string()))
    }
}

impl<I> Default for RoomManager<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I> std::fmt::Debug for RoomManager<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager").field("room_count", &self.rooms.len()).finish()
    }
}
