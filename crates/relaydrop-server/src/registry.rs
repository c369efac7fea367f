//! Connection registry for session and room subscription tracking.
//!
//! The registry maintains bidirectional mappings: room → sessions (for
//! fan-out) and session → rooms (for cleanup on disconnect), plus a reverse
//! index from participant id to its live session.
//!
//! Room membership itself is owned by [`crate::RoomManager`] and keyed by
//! participant id, which survives reconnects. The registry only knows which
//! *connection* currently carries each participant.

use std::collections::{BTreeMap, BTreeSet};

use relaydrop_core::RoomCode;

/// Information about a registered session.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Participant carried by this session (after the handshake)
    pub participant_id: Option<u64>,
    /// Whether the session has completed the handshake
    pub authenticated: bool,
}

impl SessionInfo {
    /// Create a new unauthenticated session info.
    pub fn new() -> Self {
        Self { participant_id: None, authenticated: false }
    }

    /// Create an authenticated session info for `participant_id`.
    pub fn authenticated(participant_id: u64) -> Self {
        Self { participant_id: Some(participant_id), authenticated: true }
    }
}

/// Registry for tracking sessions and room subscriptions.
///
/// - Sessions in a room (for broadcast)
/// - Rooms a session is in (for cleanup)
/// - Session for a participant (for targeted delivery)
/// - One session per participant
///
/// Ordered maps keep fan-out order stable, so a seeded simulation replays
/// identically.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Session ID → session info
    sessions: BTreeMap<u64, SessionInfo>,
    /// Room code → set of subscribed session IDs
    room_subscriptions: BTreeMap<RoomCode, BTreeSet<u64>>,
    /// Session ID → set of subscribed room codes
    session_rooms: BTreeMap<u64, BTreeSet<RoomCode>>,
    /// Participant ID → session ID (reverse index)
    participant_sessions: BTreeMap<u64, u64>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session.
    ///
    /// Returns `false` if the session already exists, or if `info` names a
    /// participant already bound to another session.
    pub fn register_session(&mut self, session_id: u64, info: SessionInfo) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }

        if let Some(participant_id) = info.participant_id {
            if self.participant_sessions.contains_key(&participant_id) {
                return false;
            }
            self.participant_sessions.insert(participant_id, session_id);
        }

        self.sessions.insert(session_id, info);
        self.session_rooms.insert(session_id, BTreeSet::new());
        true
    }

    /// Unregister a session and remove all its room subscriptions.
    ///
    /// Returns the session info if it existed, along with the rooms it was in.
    pub fn unregister_session(
        &mut self,
        session_id: u64,
    ) -> Option<(SessionInfo, BTreeSet<RoomCode>)> {
        let info = self.sessions.remove(&session_id)?;
        let rooms = self.session_rooms.remove(&session_id).unwrap_or_default();

        if let Some(participant_id) = info.participant_id {
            // Only drop the index entry if it still points here
            if self.participant_sessions.get(&participant_id) == Some(&session_id) {
                self.participant_sessions.remove(&participant_id);
            }
        }

        for room in &rooms {
            if let Some(subscribers) = self.room_subscriptions.get_mut(room) {
                subscribers.remove(&session_id);
                if subscribers.is_empty() {
                    self.room_subscriptions.remove(room);
                }
            }
        }

        Some((info, rooms))
    }

    /// Session metadata. `None` if session doesn't exist.
    pub fn session(&self, session_id: u64) -> Option<&SessionInfo> {
        self.sessions.get(&session_id)
    }

    /// Check if a session is registered.
    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Participant carried by `session_id`, once authenticated.
    pub fn participant_for_session(&self, session_id: u64) -> Option<u64> {
        self.sessions.get(&session_id).and_then(|info| info.participant_id)
    }

    /// Bind an authenticated participant to a session.
    ///
    /// Returns `false` if the session doesn't exist or the participant is
    /// bound to another live session. The driver evicts the stale session
    /// before calling this on reconnect.
    pub fn authenticate(&mut self, session_id: u64, participant_id: u64) -> bool {
        let Some(old_info) = self.sessions.get(&session_id).cloned() else {
            return false;
        };

        if let Some(&existing) = self.participant_sessions.get(&participant_id) {
            if existing != session_id {
                return false;
            }
        }

        if let Some(old_participant) = old_info.participant_id {
            self.participant_sessions.remove(&old_participant);
        }

        self.participant_sessions.insert(participant_id, session_id);
        self.sessions.insert(session_id, SessionInfo::authenticated(participant_id));
        true
    }

    /// Subscribe a session to a room.
    ///
    /// Returns `false` if the session is not registered.
    pub fn subscribe(&mut self, session_id: u64, room: &RoomCode) -> bool {
        if !self.sessions.contains_key(&session_id) {
            return false;
        }

        self.room_subscriptions.entry(room.clone()).or_default().insert(session_id);
        self.session_rooms.entry(session_id).or_default().insert(room.clone());
        true
    }

    /// Unsubscribe a session from a room.
    ///
    /// Returns `true` if the session was subscribed and is now unsubscribed.
    pub fn unsubscribe(&mut self, session_id: u64, room: &RoomCode) -> bool {
        let removed_from_room =
            self.room_subscriptions.get_mut(room).is_some_and(|s| s.remove(&session_id));

        let removed_from_session =
            self.session_rooms.get_mut(&session_id).is_some_and(|r| r.remove(room));

        if self.room_subscriptions.get(room).is_some_and(BTreeSet::is_empty) {
            self.room_subscriptions.remove(room);
        }

        removed_from_room && removed_from_session
    }

    /// Drop every subscription to `room`. Returns the sessions that were in it.
    pub fn remove_room(&mut self, room: &RoomCode) -> Vec<u64> {
        let sessions: Vec<u64> =
            self.room_subscriptions.remove(room).into_iter().flatten().collect();

        for session_id in &sessions {
            if let Some(rooms) = self.session_rooms.get_mut(session_id) {
                rooms.remove(room);
            }
        }

        sessions
    }

    /// Check if a session is subscribed to a room.
    pub fn is_subscribed(&self, session_id: u64, room: &RoomCode) -> bool {
        self.room_subscriptions.get(room).is_some_and(|s| s.contains(&session_id))
    }

    /// All sessions subscribed to a room.
    pub fn sessions_in_room<'a>(
        &'a self,
        room: &RoomCode,
    ) -> impl Iterator<Item = u64> + use<'a> {
        self.room_subscriptions.get(room).into_iter().flat_map(|s| s.iter().copied())
    }

    /// All rooms a session is subscribed to.
    pub fn rooms_for_session(&self, session_id: u64) -> impl Iterator<Item = &RoomCode> + '_ {
        self.session_rooms.get(&session_id).into_iter().flat_map(BTreeSet::iter)
    }

    /// Live session carrying `participant_id`.
    pub fn session_for_participant(&self, participant_id: u64) -> Option<u64> {
        self.participant_sessions.get(&participant_id).copied()
    }

    /// Total number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions subscribed to a room.
    pub fn room_session_count(&self, room: &RoomCode) -> usize {
        self.room_subscriptions.get(room).map_or(0, BTreeSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    #[test]
    fn register_and_lookup_session() {
        let mut registry = ConnectionRegistry::new();

        assert!(registry.register_session(1, SessionInfo::new()));
        assert!(registry.has_session(1));
        assert!(!registry.has_session(2));

        let info = registry.session(1).unwrap();
        assert!(!info.authenticated);
        assert!(info.participant_id.is_none());
    }

    #[test]
    fn register_duplicate_session_fails() {
        let mut registry = ConnectionRegistry::new();

        assert!(registry.register_session(1, SessionInfo::new()));
        assert!(!registry.register_session(1, SessionInfo::new()));
    }

    #[test]
    fn subscribe_and_lookup() {
        let mut registry = ConnectionRegistry::new();
        let room = code("abc123");

        registry.register_session(1, SessionInfo::new());
        registry.register_session(2, SessionInfo::new());

        assert!(registry.subscribe(1, &room));
        assert!(registry.subscribe(2, &room));
        assert!(registry.is_subscribed(1, &room));

        let mut sessions: Vec<_> = registry.sessions_in_room(&room).collect();
        sessions.sort_unstable();
        assert_eq!(sessions, vec![1, 2]);
    }

    #[test]
    fn subscribe_unregistered_session_fails() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.subscribe(999, &code("abc123")));
    }

    #[test]
    fn unsubscribe_removes_from_both_maps() {
        let mut registry = ConnectionRegistry::new();
        let room = code("abc123");

        registry.register_session(1, SessionInfo::new());
        registry.subscribe(1, &room);

        assert!(registry.unsubscribe(1, &room));
        assert!(!registry.is_subscribed(1, &room));
        assert_eq!(registry.sessions_in_room(&room).count(), 0);
        assert_eq!(registry.rooms_for_session(1).count(), 0);
    }

    #[test]
    fn unregister_session_removes_all_subscriptions() {
        let mut registry = ConnectionRegistry::new();
        let room1 = code("room1");
        let room2 = code("room2");

        registry.register_session(1, SessionInfo::new());
        registry.register_session(2, SessionInfo::new());

        registry.subscribe(1, &room1);
        registry.subscribe(1, &room2);
        registry.subscribe(2, &room1);

        let (_, rooms) = registry.unregister_session(1).unwrap();
        assert_eq!(rooms.len(), 2);
        assert!(rooms.contains(&room1));
        assert!(rooms.contains(&room2));

        assert_eq!(registry.sessions_in_room(&room1).collect::<Vec<_>>(), vec![2]);
        assert_eq!(registry.room_session_count(&room2), 0);
    }

    #[test]
    fn remove_room_clears_both_directions() {
        let mut registry = ConnectionRegistry::new();
        let room = code("gone");

        registry.register_session(1, SessionInfo::new());
        registry.register_session(2, SessionInfo::new());
        registry.subscribe(1, &room);
        registry.subscribe(2, &room);

        let mut removed = registry.remove_room(&room);
        removed.sort_unstable();
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(registry.room_session_count(&room), 0);
        assert_eq!(registry.rooms_for_session(1).count(), 0);
    }

    #[test]
    fn authenticate_binds_participant() {
        let mut registry = ConnectionRegistry::new();

        registry.register_session(200, SessionInfo::new());
        registry.register_session(300, SessionInfo::authenticated(99));

        assert!(registry.authenticate(200, 42));
        assert_eq!(registry.session_for_participant(42), Some(200));
        assert_eq!(registry.session_for_participant(99), Some(300));
        assert_eq!(registry.participant_for_session(200), Some(42));
        assert_eq!(registry.session_for_participant(999), None);
    }

    #[test]
    fn one_session_per_participant() {
        let mut registry = ConnectionRegistry::new();

        assert!(registry.register_session(1, SessionInfo::authenticated(42)));
        assert!(!registry.register_session(2, SessionInfo::authenticated(42)));
        assert_eq!(registry.session_for_participant(42), Some(1));

        registry.register_session(3, SessionInfo::new());
        assert!(!registry.authenticate(3, 42));
        assert_eq!(registry.session_for_participant(42), Some(1));
    }

    #[test]
    fn participant_moves_to_new_session_after_unregister() {
        let mut registry = ConnectionRegistry::new();

        registry.register_session(1, SessionInfo::authenticated(42));
        registry.register_session(2, SessionInfo::new());

        registry.unregister_session(1);
        assert_eq!(registry.session_for_participant(42), None);

        assert!(registry.authenticate(2, 42));
        assert_eq!(registry.session_for_participant(42), Some(2));
    }
}
