//! Standard invariant checks.
//!
//! These invariants capture transfer properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use super::{Invariant, InvariantKind, InvariantResult, ParticipantRole, Violation, WorldSnapshot};

/// Stored chunk indexes are always inside the manifest.
///
/// Out-of-range chunks must be dropped before they reach the store.
pub struct ChunksWithinManifest;

impl Invariant for ChunksWithinManifest {
    fn kind(&self) -> InvariantKind {
        InvariantKind::ChunksWithinManifest
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for p in &state.participants {
            let Some(totals) = &p.total_chunks else { continue };

            for (file_index, held) in p.held.iter().enumerate() {
                let total = totals.get(file_index).copied().unwrap_or(0);
                if let Some(bad) = held.iter().find(|c| **c >= total) {
                    return Err(Violation {
                        invariant: self.kind(),
                        message: format!(
                            "participant {} holds chunk {bad} of file {file_index}, total {total}",
                            p.participant_id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Confirmations are backed by complete files.
///
/// Every receiver in a relay confirmation set has reported that file
/// complete, and a receiver still in the room holds every chunk of each file
/// it reported complete. A receiver that left keeps its relay confirmation
/// while its store is purged.
pub struct ConfirmedMeansComplete;

impl Invariant for ConfirmedMeansComplete {
    fn kind(&self) -> InvariantKind {
        InvariantKind::ConfirmedMeansComplete
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for room in &state.rooms {
            for (file_index, confirmers) in room.confirmed.iter().enumerate() {
                let key = (room.code.clone(), file_index as u32);
                for confirmer in confirmers {
                    let Some(p) = state.participants.iter().find(|p| p.participant_id == *confirmer)
                    else {
                        continue;
                    };

                    if !p.ever_completed.contains(&key) {
                        return Err(Violation {
                            invariant: self.kind(),
                            message: format!(
                                "room {}: participant {confirmer} confirmed file {file_index} \
                                 without completing it",
                                room.code
                            ),
                        });
                    }
                }
            }
        }

        for p in state.participants.iter().filter(|p| p.role == ParticipantRole::Receiving) {
            if let Some(file_index) = p.completed.iter().find(|f| !p.holds_file(**f as usize)) {
                return Err(Violation {
                    invariant: self.kind(),
                    message: format!(
                        "participant {} reported file {file_index} complete holding {:?}",
                        p.participant_id,
                        p.held.get(*file_index as usize)
                    ),
                });
            }
        }

        Ok(())
    }
}

/// The sender of a room never appears in its confirmation sets.
pub struct SenderNeverConfirms;

impl Invariant for SenderNeverConfirms {
    fn kind(&self) -> InvariantKind {
        InvariantKind::SenderNeverConfirms
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for room in &state.rooms {
            if let Some(file_index) = room.confirmed.iter().position(|set| set.contains(&room.sender))
            {
                return Err(Violation {
                    invariant: self.kind(),
                    message: format!("room {}: sender confirmed file {file_index}", room.code),
                });
            }
        }
        Ok(())
    }
}

/// Aggregate progress never decreases within one join.
///
/// Progress is derived from the store, which only grows while a receiver
/// stays in a room.
pub struct ProgressMonotonic;

impl Invariant for ProgressMonotonic {
    fn kind(&self) -> InvariantKind {
        InvariantKind::ProgressMonotonic
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for p in &state.participants {
            for window in p.progress_history.windows(2) {
                if window[1] < window[0] {
                    return Err(Violation {
                        invariant: self.kind(),
                        message: format!(
                            "participant {}: progress decreased {:.2} → {:.2}",
                            p.participant_id, window[0], window[1]
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A sender's confirmation view never runs ahead of the relay.
///
/// Every receiver the sender counts for a file is in the relay's set for
/// that file. The sender may lag while `file_confirmed` is in flight. A room
/// recreated under the same code by someone else is not this sender's room.
pub struct SenderViewWithinRelay;

impl Invariant for SenderViewWithinRelay {
    fn kind(&self) -> InvariantKind {
        InvariantKind::SenderViewWithinRelay
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for p in state.participants.iter().filter(|p| p.role == ParticipantRole::Sending) {
            let Some(code) = &p.room else { continue };
            let Some(room) = state.room(code).filter(|r| r.sender == p.participant_id) else {
                continue;
            };

            for (file_index, seen) in p.sender_confirmed.iter().enumerate() {
                let relay = room.confirmed.get(file_index);
                if let Some(extra) = seen.iter().find(|r| !relay.is_some_and(|set| set.contains(r))) {
                    return Err(Violation {
                        invariant: self.kind(),
                        message: format!(
                            "room {code}: sender counts {extra} for file {file_index}, relay does not"
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use relaydrop_core::RoomCode;

    use super::*;
    use crate::invariants::{ParticipantSnapshot, RoomSnapshot};

    fn code() -> RoomCode {
        RoomCode::parse("abc").unwrap()
    }

    fn receiver(id: u64, held: Vec<u32>) -> ParticipantSnapshot {
        ParticipantSnapshot {
            role: ParticipantRole::Receiving,
            room: Some(code()),
            total_chunks: Some(vec![3]),
            held: vec![held],
            ..ParticipantSnapshot::idle(id)
        }
    }

    fn room(confirmed: &[u64]) -> RoomSnapshot {
        RoomSnapshot {
            code: code(),
            sender: 1,
            receivers: BTreeSet::from([2]),
            total_chunks: vec![3],
            confirmed: vec![confirmed.iter().copied().collect()],
        }
    }

    #[test]
    fn out_of_range_chunk_is_a_violation() {
        let state = WorldSnapshot { rooms: vec![], participants: vec![receiver(2, vec![0, 3])] };
        assert!(ChunksWithinManifest.check(&state).is_err());
    }

    #[test]
    fn confirmation_without_completion_is_a_violation() {
        let state =
            WorldSnapshot { rooms: vec![room(&[2])], participants: vec![receiver(2, vec![0, 1, 2])] };
        assert!(ConfirmedMeansComplete.check(&state).is_err());

        let mut completed = receiver(2, vec![0, 1, 2]);
        completed.completed.insert(0);
        completed.ever_completed.insert((code(), 0));
        let state = WorldSnapshot { rooms: vec![room(&[2])], participants: vec![completed] };
        assert!(ConfirmedMeansComplete.check(&state).is_ok());
    }

    #[test]
    fn completed_file_with_missing_chunks_is_a_violation() {
        let mut p = receiver(2, vec![0, 2]);
        p.completed.insert(0);
        p.ever_completed.insert((code(), 0));
        let state = WorldSnapshot { rooms: vec![], participants: vec![p] };
        assert!(ConfirmedMeansComplete.check(&state).is_err());
    }

    #[test]
    fn sender_confirmation_is_a_violation() {
        let state = WorldSnapshot { rooms: vec![room(&[1])], participants: vec![] };
        assert!(SenderNeverConfirms.check(&state).is_err());
    }

    #[test]
    fn decreasing_progress_is_a_violation() {
        let mut p = receiver(2, vec![]);
        p.progress_history = vec![0.0, 50.0, 33.3];
        let state = WorldSnapshot { rooms: vec![], participants: vec![p] };
        assert!(ProgressMonotonic.check(&state).is_err());
    }

    #[test]
    fn sender_ahead_of_relay_is_a_violation() {
        let sender = ParticipantSnapshot {
            role: ParticipantRole::Sending,
            room: Some(code()),
            sender_confirmed: vec![BTreeSet::from([2])],
            ..ParticipantSnapshot::idle(1)
        };
        let state = WorldSnapshot { rooms: vec![room(&[])], participants: vec![sender] };
        assert!(SenderViewWithinRelay.check(&state).is_err());
    }
}
