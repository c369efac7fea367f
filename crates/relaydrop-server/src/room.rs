//! Room session state machine.
//!
//! One `RoomSession` per active room code. It owns everything the relay knows
//! about a transfer: the fixed manifest, the sender, the receiver set, and the
//! confirmation sets. It knows nothing about chunk contents or who holds what;
//! progress lives entirely on the receivers.
//!
//! # State Machine
//!
//! ```text
//!            create              join              sender leave / grace expiry
//! (absent) ─────────> Created ─────────> Joined ──────────────────────────────> Closed
//!                        ^                  │
//!                        └──────────────────┘
//!                         last receiver leaves
//! ```
//!
//! The absent (`Empty`) state is represented by the room not being present in
//! the [`crate::RoomManager`]. `Closed` rooms are removed from the manager
//! immediately, which makes their code reusable.
//!
//! # Sender detachment
//!
//! Losing the sender's transport does not close the room. The sender is
//! *detached* and may reattach by re-creating the room with the same code and
//! manifest. The room closes only if the sender leaves explicitly or stays
//! detached past the grace period.

use std::{collections::BTreeSet, ops::Sub, time::Duration};

use relaydrop_core::{ConfirmationAggregator, RoomCode, TransferError, TransferManifest};

use crate::room_manager::RoomError;

/// Lifecycle state of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Manifest fixed, no receivers
    Created,
    /// At least one receiver present
    Joined,
    /// Sender left or never came back; no further operations allowed
    Closed,
}

/// Result of a participant leaving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The sender left and the room is now closed.
    RoomClosed {
        /// Receivers that were still present
        receivers: Vec<u64>,
    },
    /// A receiver left; the room continues.
    ReceiverLeft {
        /// Receivers remaining in the room
        remaining: usize,
    },
}

/// Effect of a participant's transport going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The sender was detached; room state is kept for reattachment.
    SenderDetached,
    /// A receiver's membership was removed.
    ReceiverRemoved,
    /// The participant was not in the room.
    NotMember,
}

/// Relay-owned state of one room.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
#[derive(Debug, Clone)]
pub struct RoomSession<I> {
    code: RoomCode,
    manifest: TransferManifest,
    /// Participant id of the sender
    sender: u64,
    /// Set while the sender's transport is gone
    detached_at: Option<I>,
    receivers: BTreeSet<u64>,
    confirmations: ConfirmationAggregator,
    state: RoomState,
    created_at: I,
}

impl<I> RoomSession<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// New room in `Created` state with the sender attached.
    pub fn new(code: RoomCode, manifest: TransferManifest, sender: u64, now: I) -> Self {
        Self {
            code,
            manifest,
            sender,
            detached_at: None,
            receivers: BTreeSet::new(),
            confirmations: ConfirmationAggregator::new(),
            state: RoomState::Created,
            created_at: now,
        }
    }

    /// Room code.
    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    /// Manifest fixed at creation.
    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    /// Participant id of the sender.
    pub fn sender(&self) -> u64 {
        self.sender
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RoomState {
        self.state
    }

    /// When the room was created.
    pub fn created_at(&self) -> I {
        self.created_at
    }

    /// Whether the sender's transport is currently attached.
    pub fn is_sender_attached(&self) -> bool {
        self.detached_at.is_none()
    }

    /// Whether `participant` is a receiver in this room.
    pub fn is_receiver(&self, participant: u64) -> bool {
        self.receivers.contains(&participant)
    }

    /// Receivers in ascending id order.
    pub fn receivers(&self) -> impl Iterator<Item = u64> + '_ {
        self.receivers.iter().copied()
    }

    /// Number of receivers.
    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Confirmation sets recorded for this room.
    pub fn confirmations(&self) -> &ConfirmationAggregator {
        &self.confirmations
    }

    /// Add a receiver. Returns `true` if it was not already present.
    ///
    /// # Errors
    ///
    /// - `RoomError::RoomNotFound` if the room is closed
    /// - `RoomError::NotPermitted` if the sender tries to join its own room
    pub fn join(&mut self, receiver: u64) -> Result<bool, RoomError> {
        self.ensure_open()?;

        if receiver == self.sender {
            return Err(RoomError::NotPermitted("sender cannot join its own room".to_string()));
        }

        let added = self.receivers.insert(receiver);
        self.state = RoomState::Joined;
        Ok(added)
    }

    /// Remove a participant.
    ///
    /// The sender leaving closes the room; a receiver leaving only removes
    /// that membership.
    ///
    /// # Errors
    ///
    /// - `RoomError::RoomNotFound` if the room is closed
    /// - `RoomError::NotPermitted` if `participant` is not a member
    pub fn leave(&mut self, participant: u64) -> Result<LeaveOutcome, RoomError> {
        self.ensure_open()?;

        if participant == self.sender {
            let receivers = self.close();
            return Ok(LeaveOutcome::RoomClosed { receivers });
        }

        if !self.receivers.remove(&participant) {
            return Err(RoomError::NotPermitted("not a member of this room".to_string()));
        }

        if self.receivers.is_empty() {
            self.state = RoomState::Created;
        }

        Ok(LeaveOutcome::ReceiverLeft { remaining: self.receivers.len() })
    }

    /// Apply loss of `participant`'s transport.
    pub fn disconnect(&mut self, participant: u64, now: I) -> DisconnectOutcome {
        if self.state == RoomState::Closed {
            return DisconnectOutcome::NotMember;
        }

        if participant == self.sender {
            if self.detached_at.is_none() {
                self.detached_at = Some(now);
            }
            return DisconnectOutcome::SenderDetached;
        }

        if self.receivers.remove(&participant) {
            if self.receivers.is_empty() {
                self.state = RoomState::Created;
            }
            return DisconnectOutcome::ReceiverRemoved;
        }

        DisconnectOutcome::NotMember
    }

    /// Reattach the sender after a reconnect.
    ///
    /// Succeeds only for the original sender presenting an identical
    /// manifest. Reattaching an already attached sender is a no-op.
    ///
    /// # Errors
    ///
    /// - `RoomError::DuplicateRoomCode` for any other participant or manifest
    pub fn reattach(&mut self, sender: u64, manifest: &TransferManifest) -> Result<(), RoomError> {
        if self.state == RoomState::Closed
            || sender != self.sender
            || manifest != &self.manifest
        {
            return Err(RoomError::DuplicateRoomCode(self.code.clone()));
        }

        self.detached_at = None;
        Ok(())
    }

    /// Time left before a detached sender forfeits the room.
    ///
    /// `None` while the sender is attached.
    pub fn remaining_grace(&self, now: I, grace: Duration) -> Option<Duration> {
        self.detached_at.map(|at| grace.saturating_sub(now - at))
    }

    /// Whether the sender has been detached for at least `grace`.
    pub fn grace_expired(&self, now: I, grace: Duration) -> bool {
        self.detached_at.is_some_and(|at| now - at >= grace)
    }

    /// Validate a chunk push from `participant`.
    ///
    /// # Errors
    ///
    /// - `RoomError::NotPermitted` if `participant` is not the sender
    /// - `RoomError::UnknownFileIndex` / `RoomError::UnknownChunkIndex` if
    ///   the chunk is outside the manifest
    pub fn check_chunk(
        &self,
        participant: u64,
        file_index: u32,
        chunk_index: u32,
    ) -> Result<(), RoomError> {
        self.ensure_open()?;

        if participant != self.sender {
            return Err(RoomError::NotPermitted("only the sender may push chunks".to_string()));
        }

        self.manifest.check_chunk(file_index, chunk_index).map_err(RoomError::from)
    }

    /// Validate a receiver request (resend or confirmation) for `file_index`.
    ///
    /// # Errors
    ///
    /// - `RoomError::NotPermitted` if `participant` is not a receiver
    /// - `RoomError::UnknownFileIndex` if the file is outside the manifest
    /// - `RoomError::SenderUnavailable` while the sender is detached
    pub fn check_request(
        &self,
        participant: u64,
        file_index: u32,
        now: I,
        grace: Duration,
    ) -> Result<(), RoomError> {
        self.ensure_member(participant, file_index)?;

        if let Some(retry_after) = self.remaining_grace(now, grace) {
            return Err(RoomError::SenderUnavailable { retry_after });
        }

        Ok(())
    }

    /// Record that `participant` holds all of `file_index`.
    ///
    /// Returns the number of distinct receivers that confirmed the file.
    /// Recording succeeds while the sender is detached; forwarding is the
    /// caller's concern.
    ///
    /// # Errors
    ///
    /// - `RoomError::NotPermitted` if `participant` is not a receiver
    /// - `RoomError::UnknownFileIndex` if the file is outside the manifest
    pub fn record_confirmation(
        &mut self,
        participant: u64,
        file_index: u32,
    ) -> Result<usize, RoomError> {
        self.ensure_member(participant, file_index)?;
        Ok(self.confirmations.record_confirmation(file_index, participant))
    }

    /// Close the room. Returns the receivers that were present.
    pub fn close(&mut self) -> Vec<u64> {
        self.state = RoomState::Closed;
        self.confirmations.clear();
        std::mem::take(&mut self.receivers).into_iter().collect()
    }

    fn ensure_open(&self) -> Result<(), RoomError> {
        if self.state == RoomState::Closed {
            return Err(RoomError::RoomNotFound(self.code.to_string()));
        }
        Ok(())
    }

    fn ensure_member(&self, participant: u64, file_index: u32) -> Result<(), RoomError> {
        self.ensure_open()?;

        if !self.receivers.contains(&participant) {
            return Err(RoomError::NotPermitted("not a receiver in this room".to_string()));
        }

        self.manifest.require_file(file_index).map_err(RoomError::from)?;
        Ok(())
    }
}

impl From<TransferError> for RoomError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::UnknownFileIndex { file_index, file_count } => {
                Self::UnknownFileIndex { file_index, file_count }
            },
            TransferError::UnknownChunkIndex { file_index, chunk_index, total } => {
                Self::UnknownChunkIndex { file_index, chunk_index, total }
            },
            TransferError::RoomNotFound { room } => Self::RoomNotFound(room),
            other => Self::InvalidPayload(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use relaydrop_proto::payloads::room::FileSpec;

    use super::*;

    const SENDER: u64 = 1;

    fn room(t0: Instant) -> RoomSession<Instant> {
        let manifest =
            TransferManifest::from_specs(&[FileSpec { name: "a.bin".to_string(), size: 600_000 }])
                .unwrap();
        RoomSession::new(RoomCode::parse("abc123").unwrap(), manifest, SENDER, t0)
    }

    #[test]
    fn join_and_leave_cycle_states() {
        let t0 = Instant::now();
        let mut room = room(t0);
        assert_eq!(room.state(), RoomState::Created);

        assert!(room.join(2).unwrap());
        assert!(!room.join(2).unwrap());
        assert_eq!(room.state(), RoomState::Joined);

        assert_eq!(room.leave(2).unwrap(), LeaveOutcome::ReceiverLeft { remaining: 0 });
        assert_eq!(room.state(), RoomState::Created);
    }

    #[test]
    fn sender_leave_closes_room() {
        let mut room = room(Instant::now());
        room.join(2).unwrap();
        room.join(3).unwrap();

        assert_eq!(room.leave(SENDER).unwrap(), LeaveOutcome::RoomClosed { receivers: vec![2, 3] });
        assert_eq!(room.state(), RoomState::Closed);
        assert!(matches!(room.join(4), Err(RoomError::RoomNotFound(_))));
    }

    #[test]
    fn sender_cannot_join_own_room() {
        let mut room = room(Instant::now());
        assert!(matches!(room.join(SENDER), Err(RoomError::NotPermitted(_))));
    }

    #[test]
    fn only_sender_pushes_chunks() {
        let mut room = room(Instant::now());
        room.join(2).unwrap();

        assert!(room.check_chunk(SENDER, 0, 2).is_ok());
        assert!(matches!(room.check_chunk(2, 0, 0), Err(RoomError::NotPermitted(_))));
        assert!(matches!(
            room.check_chunk(SENDER, 0, 3),
            Err(RoomError::UnknownChunkIndex { chunk_index: 3, total: 3, .. })
        ));
        assert!(matches!(
            room.check_chunk(SENDER, 1, 0),
            Err(RoomError::UnknownFileIndex { file_index: 1, file_count: 1 })
        ));
    }

    #[test]
    fn detached_sender_reports_remaining_grace() {
        let t0 = Instant::now();
        let grace = Duration::from_secs(60);
        let mut room = room(t0);
        room.join(2).unwrap();

        assert_eq!(room.disconnect(SENDER, t0), DisconnectOutcome::SenderDetached);
        assert!(!room.is_sender_attached());

        let later = t0 + Duration::from_secs(20);
        assert!(matches!(
            room.check_request(2, 0, later, grace),
            Err(RoomError::SenderUnavailable { retry_after }) if retry_after == Duration::from_secs(40)
        ));
        assert!(!room.grace_expired(later, grace));
        assert!(room.grace_expired(t0 + grace, grace));
    }

    #[test]
    fn reattach_requires_same_sender_and_manifest() {
        let t0 = Instant::now();
        let mut room = room(t0);
        room.disconnect(SENDER, t0);

        let other =
            TransferManifest::from_specs(&[FileSpec { name: "b.bin".to_string(), size: 1 }])
                .unwrap();
        assert!(matches!(room.reattach(SENDER, &other), Err(RoomError::DuplicateRoomCode(_))));

        let same = room.manifest().clone();
        assert!(matches!(room.reattach(99, &same), Err(RoomError::DuplicateRoomCode(_))));

        room.reattach(SENDER, &same).unwrap();
        assert!(room.is_sender_attached());
    }

    #[test]
    fn receiver_disconnect_removes_membership_only() {
        let t0 = Instant::now();
        let mut room = room(t0);
        room.join(2).unwrap();
        room.record_confirmation(2, 0).unwrap();

        assert_eq!(room.disconnect(2, t0), DisconnectOutcome::ReceiverRemoved);
        assert_eq!(room.state(), RoomState::Created);
        assert!(room.is_sender_attached());
        assert_eq!(room.confirmations().confirmation_count(0), 1);
        assert_eq!(room.disconnect(7, t0), DisconnectOutcome::NotMember);
    }

    #[test]
    fn confirmations_require_membership() {
        let mut room = room(Instant::now());
        room.join(2).unwrap();

        assert_eq!(room.record_confirmation(2, 0).unwrap(), 1);
        assert_eq!(room.record_confirmation(2, 0).unwrap(), 1);
        assert!(matches!(room.record_confirmation(3, 0), Err(RoomError::NotPermitted(_))));
        assert!(matches!(room.record_confirmation(2, 5), Err(RoomError::UnknownFileIndex { .. })));
    }
}
