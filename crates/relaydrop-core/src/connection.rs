//! Session layer state machine.
//!
//! Manages connection lifecycle, heartbeats, timeouts, and graceful shutdown.
//! Methods take time as input and return actions for the driver to execute,
//! so the same state machine runs on both ends of a relay connection.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  Hello   ┌──────────┐   HelloReply    ┌───────────────┐
//! │ Init │─────────>│ Pending  │────────────────>│ Authenticated │
//! └──────┘          └──────────┘                 └───────────────┘
//!                        │                               │
//!                        │ Timeout/Goodbye               │ Goodbye/Timeout
//!                        ↓                               ↓
//!                   ┌────────┐                      ┌────────┐
//!                   │ Closed │<─────────────────────│ Closed │
//!                   └────────┘                      └────────┘
//! ```
//!
//! The relay side skips `Pending`: it answers Hello from `Init` directly.
//! Room and transfer opcodes never reach this state machine.

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

use relaydrop_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::session::{Goodbye, Hello, HelloReply},
};

use crate::error::ConnectionError;

/// Protocol version spoken in Hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Time allowed to complete the Hello/HelloReply handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time allowed without any activity before the connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which the connection sends Ping frames while authenticated.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send this frame to the peer
    SendFrame(Frame),

    /// Close the connection with this reason
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state - no handshake started
    Init,
    /// Hello sent, waiting for HelloReply
    Pending,
    /// Handshake complete
    Authenticated,
    /// Connection closed (graceful or error)
    Closed,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for completing handshake
    pub handshake_timeout: Duration,
    /// Idle timeout before disconnecting
    pub idle_timeout: Duration,
    /// Heartbeat interval (should be < idle_timeout / 2)
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Connection state machine
///
/// Manages lifecycle, timeouts, and heartbeats for a single connection. Pure:
/// no I/O and no stored environment.
///
/// Generic over `Instant` so simulations can drive it with virtual time.
#[derive(Debug, Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: ConnectionState,
    config: ConnectionConfig,
    last_activity: I,
    last_heartbeat: Option<I>,
    /// Per-connection id assigned by the relay
    session_id: Option<u64>,
    /// Stable identity presented in Hello (or assigned by the relay)
    participant_id: Option<u64>,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new connection in [`ConnectionState::Init`] state
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Init,
            config,
            last_activity: now,
            last_heartbeat: None,
            session_id: None,
            participant_id: None,
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session ID assigned by the relay. `None` before the handshake.
    #[must_use]
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Participant identity. `None` before the handshake.
    ///
    /// On the relay this is the id the client presented in Hello, falling
    /// back to the session id when the client sent none.
    #[must_use]
    pub fn participant_id(&self) -> Option<u64> {
        self.participant_id
    }

    /// Maximum time allowed for handshake completion.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout
    }

    /// Assign session ID (relay use only, before handling Hello).
    pub fn set_session_id(&mut self, session_id: u64) {
        self.session_id = Some(session_id);
    }

    /// Initiate handshake (client use).
    ///
    /// Transitions to Pending state and returns SendFrame(Hello) action.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if not in Init state
    pub fn send_hello(
        &mut self,
        participant_id: Option<u64>,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state != ConnectionState::Init {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "send_hello".to_string(),
            });
        }

        self.state = ConnectionState::Pending;
        self.last_activity = now;

        let hello = Payload::Hello(Hello { version: PROTOCOL_VERSION, participant_id });
        let frame = hello.into_frame(FrameHeader::new(Opcode::Hello))?;

        Ok(vec![ConnectionAction::SendFrame(frame)])
    }

    /// Mark connection as closed.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Mark connection as active (call when receiving frames).
    pub fn update_activity(&mut self, now: I) {
        self.last_activity = now;
    }

    /// Elapsed time since last activity, if timeout exceeded. `None` otherwise.
    #[must_use]
    pub fn check_timeout(&self, now: I) -> Option<Duration> {
        let elapsed = now - self.last_activity;

        let timeout = match self.state {
            ConnectionState::Init | ConnectionState::Pending => self.config.handshake_timeout,
            ConnectionState::Authenticated => self.config.idle_timeout,
            ConnectionState::Closed => return None,
        };

        if elapsed > timeout { Some(elapsed) } else { None }
    }

    /// Process periodic maintenance (timeouts and heartbeats).
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        if let Some(elapsed) = self.check_timeout(now) {
            let reason = match self.state {
                ConnectionState::Init | ConnectionState::Pending => {
                    format!("handshake timeout after {elapsed:?}")
                },
                _ => format!("idle timeout after {elapsed:?}"),
            };

            self.close();
            return vec![ConnectionAction::Close { reason }];
        }

        if self.state != ConnectionState::Authenticated {
            return Vec::new();
        }

        let should_send = match self.last_heartbeat {
            None => true,
            Some(last) => now - last >= self.config.heartbeat_interval,
        };

        if should_send {
            self.last_heartbeat = Some(now);
            let ping = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());
            return vec![ConnectionAction::SendFrame(ping)];
        }

        Vec::new()
    }

    /// Process incoming session-layer frame and update state.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::UnexpectedFrame` if opcode invalid for current state
    /// - `ConnectionError::InvalidPayload` if the payload does not match
    /// - `ConnectionError::UnsupportedVersion` if Hello version ≠ 1
    /// - `ConnectionError::Protocol` if the relay has not set a session id
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.last_activity = now;

        let Some(opcode) = frame.header.opcode_enum() else {
            return Err(ConnectionError::UnexpectedFrame {
                state: self.state,
                opcode: frame.header.opcode(),
            });
        };

        match (self.state, opcode) {
            // Relay: receive Hello in Init state
            (ConnectionState::Init, Opcode::Hello) => {
                let Payload::Hello(hello) = Payload::from_frame(frame)? else {
                    return Err(ConnectionError::InvalidPayload {
                        expected: "Hello",
                        opcode: Opcode::Hello.to_u16(),
                    });
                };

                if hello.version != PROTOCOL_VERSION {
                    return Err(ConnectionError::UnsupportedVersion(hello.version));
                }

                let Some(session_id) = self.session_id else {
                    return Err(ConnectionError::Protocol(
                        "relay must set session_id before handling Hello".to_string(),
                    ));
                };

                let participant_id =
                    hello.participant_id.filter(|id| *id != 0).unwrap_or(session_id);
                self.participant_id = Some(participant_id);
                self.state = ConnectionState::Authenticated;

                let reply = Payload::HelloReply(HelloReply { session_id, participant_id });
                let frame = reply.into_frame(FrameHeader::new(Opcode::HelloReply))?;

                Ok(vec![ConnectionAction::SendFrame(frame)])
            },

            // Client: receive HelloReply in Pending state
            (ConnectionState::Pending, Opcode::HelloReply) => {
                let Payload::HelloReply(reply) = Payload::from_frame(frame)? else {
                    return Err(ConnectionError::InvalidPayload {
                        expected: "HelloReply",
                        opcode: Opcode::HelloReply.to_u16(),
                    });
                };

                self.state = ConnectionState::Authenticated;
                self.session_id = Some(reply.session_id);
                self.participant_id = Some(reply.participant_id);

                Ok(vec![])
            },

            (ConnectionState::Authenticated, Opcode::Ping) => {
                let pong = Frame::new(FrameHeader::new(Opcode::Pong), Vec::new());
                Ok(vec![ConnectionAction::SendFrame(pong)])
            },

            // Activity already updated
            (ConnectionState::Authenticated, Opcode::Pong) => Ok(vec![]),

            (state, Opcode::Goodbye) if state != ConnectionState::Closed => {
                let Payload::Goodbye(goodbye) = Payload::from_frame(frame)? else {
                    return Err(ConnectionError::InvalidPayload {
                        expected: "Goodbye",
                        opcode: Opcode::Goodbye.to_u16(),
                    });
                };

                self.state = ConnectionState::Closed;

                let reply = Payload::Goodbye(Goodbye { reason: "ack".to_string() });
                let frame = reply.into_frame(FrameHeader::new(Opcode::Goodbye))?;

                Ok(vec![ConnectionAction::SendFrame(frame), ConnectionAction::Close {
                    reason: format!("peer goodbye: {}", goodbye.reason),
                }])
            },

            (state, opcode) => {
                Err(ConnectionError::UnexpectedFrame { state, opcode: opcode.to_u16() })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_frame(version: u8, participant_id: Option<u64>) -> Frame {
        Payload::Hello(Hello { version, participant_id })
            .into_frame(FrameHeader::new(Opcode::Hello))
            .unwrap()
    }

    fn authenticated_client(t0: Instant) -> Connection {
        let mut conn = Connection::new(t0, ConnectionConfig::default());
        conn.send_hello(Some(77), t0).unwrap();
        let reply = Payload::HelloReply(HelloReply { session_id: 12345, participant_id: 77 });
        let reply_frame = reply.into_frame(FrameHeader::new(Opcode::HelloReply)).unwrap();
        conn.handle_frame(&reply_frame, t0).unwrap();
        conn
    }

    #[test]
    fn client_lifecycle() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());

        assert_eq!(conn.state(), ConnectionState::Init);
        assert_eq!(conn.session_id(), None);

        let actions = conn.send_hello(Some(77), t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Pending);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ConnectionAction::SendFrame(_)));

        let reply = Payload::HelloReply(HelloReply { session_id: 12345, participant_id: 77 });
        let reply_frame = reply.into_frame(FrameHeader::new(Opcode::HelloReply)).unwrap();
        let actions = conn.handle_frame(&reply_frame, t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.session_id(), Some(12345));
        assert_eq!(conn.participant_id(), Some(77));
        assert!(actions.is_empty());

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn send_hello_twice_is_invalid() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, ConnectionConfig::default());
        conn.send_hello(None, t0).unwrap();

        let result = conn.send_hello(None, t0);
        assert!(matches!(result, Err(ConnectionError::InvalidState { .. })));
    }

    #[test]
    fn handle_ping_responds_with_pong() {
        let t0 = Instant::now();
        let mut conn = authenticated_client(t0);

        let ping_frame = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());
        let actions = conn.handle_frame(&ping_frame, t0).unwrap();

        match actions.as_slice() {
            [ConnectionAction::SendFrame(frame)] => {
                assert_eq!(frame.header.opcode_enum(), Some(Opcode::Pong));
                assert!(frame.payload.is_empty());
            },
            other => panic!("expected a single Pong, got {other:?}"),
        }
    }

    #[test]
    fn pong_refreshes_idle_deadline() {
        let t0 = Instant::now();
        let mut conn = authenticated_client(t0);

        let pong_frame = Frame::new(FrameHeader::new(Opcode::Pong), Vec::new());
        let t1 = t0 + Duration::from_secs(30);
        assert!(conn.handle_frame(&pong_frame, t1).unwrap().is_empty());

        // 70s after start, but only 40s after the Pong
        let t2 = t1 + Duration::from_secs(40);
        assert!(conn.check_timeout(t2).is_none());
    }

    #[test]
    fn ping_before_handshake_is_unexpected() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, ConnectionConfig::default());

        let ping_frame = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());
        let result = conn.handle_frame(&ping_frame, t0);
        assert!(matches!(result, Err(ConnectionError::UnexpectedFrame { .. })));
    }

    #[test]
    fn relay_handle_hello_keeps_participant_id() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, ConnectionConfig::default());
        conn.set_session_id(0x1234_5678_9ABC_DEF0);

        let actions = conn.handle_frame(&hello_frame(1, Some(42)), t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.participant_id(), Some(42));

        let [ConnectionAction::SendFrame(frame)] = actions.as_slice() else {
            panic!("expected HelloReply");
        };
        let Payload::HelloReply(reply) = Payload::from_frame(frame).unwrap() else {
            panic!("expected HelloReply payload");
        };
        assert_eq!(reply.session_id, 0x1234_5678_9ABC_DEF0);
        assert_eq!(reply.participant_id, 42);
    }

    #[test]
    fn relay_assigns_session_id_as_participant_when_absent() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, ConnectionConfig::default());
        conn.set_session_id(9);

        conn.handle_frame(&hello_frame(1, None), t0).unwrap();
        assert_eq!(conn.participant_id(), Some(9));
    }

    #[test]
    fn relay_hello_without_session_id() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, ConnectionConfig::default());

        let result = conn.handle_frame(&hello_frame(1, None), t0);
        assert!(matches!(result, Err(ConnectionError::Protocol(_))));
    }

    #[test]
    fn relay_hello_unsupported_version() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, ConnectionConfig::default());
        conn.set_session_id(12345);

        let result = conn.handle_frame(&hello_frame(99, None), t0);
        assert!(matches!(result, Err(ConnectionError::UnsupportedVersion(99))));
    }

    #[test]
    fn goodbye_acks_and_closes() {
        let t0 = Instant::now();
        let mut conn = authenticated_client(t0);

        let goodbye = Payload::Goodbye(Goodbye { reason: "client shutdown".to_string() });
        let goodbye_frame = goodbye.into_frame(FrameHeader::new(Opcode::Goodbye)).unwrap();

        let actions = conn.handle_frame(&goodbye_frame, t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], ConnectionAction::SendFrame(_)));
        assert!(matches!(actions[1], ConnectionAction::Close { .. }));
    }

    #[test]
    fn room_opcodes_are_not_session_frames() {
        let t0 = Instant::now();
        let mut conn = authenticated_client(t0);

        let frame = Frame::new(FrameHeader::new(Opcode::Error), Vec::new());
        let result = conn.handle_frame(&frame, t0);
        assert!(matches!(result, Err(ConnectionError::UnexpectedFrame { .. })));
        assert_eq!(conn.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn tick_sends_heartbeat_then_times_out() {
        let t0 = Instant::now();
        let mut conn = authenticated_client(t0);

        let actions = conn.tick(t0);
        assert!(matches!(actions.as_slice(), [ConnectionAction::SendFrame(_)]));

        // Heartbeat interval not elapsed
        assert!(conn.tick(t0 + Duration::from_secs(5)).is_empty());

        let late = t0 + DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1);
        let actions = conn.tick(late);
        assert!(matches!(actions.as_slice(), [ConnectionAction::Close { .. }]));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn handshake_timeout_closes_unauthenticated() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, ConnectionConfig::default());

        let late = t0 + DEFAULT_HANDSHAKE_TIMEOUT + Duration::from_secs(1);
        let actions = conn.tick(late);

        let [ConnectionAction::Close { reason }] = actions.as_slice() else {
            panic!("expected Close");
        };
        assert!(reason.starts_with("handshake timeout"));
    }
}
