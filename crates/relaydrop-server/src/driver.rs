//! Relay driver.
//!
//! Ties together connection state machines, the RoomManager (room lifecycle
//! and validation) and the ConnectionRegistry (session ↔ participant ↔ room
//! mapping). Pure: the runtime feeds [`ServerEvent`]s and executes the
//! returned [`ServerAction`]s.
//!
//! The relay is stateless with respect to transfer progress. Chunk payloads
//! are re-wrapped and forwarded; nothing about them is stored.

use std::{collections::BTreeMap, time::Duration};

use relaydrop_core::{
    RoomCode, TransferManifest,
    connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState},
    env::Environment,
};
use relaydrop_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::{
        ErrorPayload,
        room::{CreateRoom, FileList, JoinRoom, LeaveRoom, RoomClosed, RoomCreated},
        transfer::{
            ChunkTransfer, ConfirmFileReceived, FileConfirmed, ReceiveChunk,
            RequestMissingChunks, SendMissingChunks,
        },
    },
};

use crate::{
    registry::{ConnectionRegistry, SessionInfo},
    room::{DisconnectOutcome, LeaveOutcome, RoomSession},
    room_manager::{CreateOutcome, RoomError, RoomManager},
    server_error::ServerError,
};

/// How long a detached sender may take to reattach before its room closes.
pub const DEFAULT_SENDER_GRACE: Duration = Duration::from_secs(60);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connection configuration (timeouts, heartbeat interval)
    pub connection: ConnectionConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Time a detached sender has to reattach
    pub sender_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_connections: 10_000,
            sender_grace: DEFAULT_SENDER_GRACE,
        }
    }
}

/// Events that the server driver processes.
///
/// These are produced by the external runtime (simulation or production).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime
        session_id: u64,
    },

    /// A frame was received from a connection
    FrameReceived {
        /// Connection that sent the frame
        session_id: u64,
        /// The received frame
        frame: Frame,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Connection that was closed
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for timeouts, heartbeats and sender grace expiry
    Tick,
}

/// Actions that the server driver produces.
///
/// These are executed by runtime-specific code (production or simulation).
#[derive(Debug, Clone)]
pub enum ServerAction {
    /// Send a frame to a specific session
    SendToSession {
        /// Target session ID
        session_id: u64,
        /// Frame to send
        frame: Frame,
    },

    /// Send a frame to every session subscribed to a room
    BroadcastToRoom {
        /// Target room
        room: RoomCode,
        /// Frame to broadcast
        frame: Frame,
        /// Optional session to exclude from broadcast
        exclude_session: Option<u64>,
    },

    /// Close a connection
    CloseConnection {
        /// Session to close
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
    },
}

/// Log levels for server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Why a session's rooms are being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Graceful Goodbye: the participant leaves every room
    Left,
    /// Transport loss: senders detach, receivers drop out
    Lost,
}

/// Action-based relay driver.
///
/// Orchestrates connection management, room operations, and frame routing.
pub struct ServerDriver<E: Environment> {
    /// Connection state machines (session_id → Connection)
    connections: BTreeMap<u64, Connection<E::Instant>>,
    /// Session/participant/room registry
    registry: ConnectionRegistry,
    /// Room lifecycle and validation
    room_manager: RoomManager<E::Instant>,
    /// Environment (time, RNG)
    env: E,
    /// Server configuration
    config: ServerConfig,
}

impl<E: Environment> ServerDriver<E> {
    /// Create a new server driver.
    pub fn new(env: E, config: ServerConfig) -> Self {
        Self {
            connections: BTreeMap::new(),
            registry: ConnectionRegistry::new(),
            room_manager: RoomManager::new(),
            env,
            config,
        }
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, ServerError> {
        match event {
            ServerEvent::ConnectionAccepted { session_id } => {
                Ok(self.handle_connection_accepted(session_id))
            },
            ServerEvent::FrameReceived { session_id, frame } => {
                self.handle_frame_received(session_id, &frame)
            },
            ServerEvent::ConnectionClosed { session_id, reason } => {
                Ok(self.release_session(session_id, &reason, Departure::Lost))
            },
            ServerEvent::Tick => Ok(self.handle_tick()),
        }
    }

    /// Handle a new connection being accepted.
    fn handle_connection_accepted(&mut self, session_id: u64) -> Vec<ServerAction> {
        let now = self.env.now();

        if self.connections.len() >= self.config.max_connections {
            return vec![ServerAction::CloseConnection {
                session_id,
                reason: "max connections exceeded".to_string(),
            }];
        }

        if !self.registry.register_session(session_id, SessionInfo::new()) {
            return vec![ServerAction::CloseConnection {
                session_id,
                reason: "duplicate session id".to_string(),
            }];
        }

        let mut conn = Connection::new(now, self.config.connection.clone());
        conn.set_session_id(session_id);
        self.connections.insert(session_id, conn);

        vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("connection accepted, session_id={session_id}"),
        }]
    }

    /// Handle a frame received from a connection.
    fn handle_frame_received(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let now = self.env.now();
        let opcode = frame.header.opcode_enum();

        let conn = self
            .connections
            .get_mut(&session_id)
            .ok_or(ServerError::SessionNotFound(session_id))?;

        match opcode {
            Some(Opcode::Hello | Opcode::Ping | Opcode::Pong | Opcode::Goodbye) => {
                // Session-layer frames
                let conn_actions = conn.handle_frame(frame, now).map_err(|e| {
                    ServerError::ConnectionFailed { session_id, reason: e.to_string() }
                })?;
                let participant = conn.participant_id();

                let mut actions = Vec::new();

                if opcode == Some(Opcode::Hello) {
                    if let Some(participant) = participant {
                        actions.extend(self.bind_participant(session_id, participant));
                    }
                }

                for action in conn_actions {
                    actions.push(match action {
                        ConnectionAction::SendFrame(f) => {
                            ServerAction::SendToSession { session_id, frame: f }
                        },
                        ConnectionAction::Close { reason } => {
                            ServerAction::CloseConnection { session_id, reason }
                        },
                    });
                }

                if opcode == Some(Opcode::Goodbye) {
                    actions.extend(self.release_session(session_id, "goodbye", Departure::Left));
                }

                Ok(actions)
            },

            Some(Opcode::Error) => {
                conn.update_activity(now);
                Ok(vec![ServerAction::Log {
                    level: LogLevel::Debug,
                    message: format!("ignoring error notice from session {session_id}"),
                }])
            },

            _ => {
                // Room and transfer frames
                conn.update_activity(now);
                let authenticated = conn.state() == ConnectionState::Authenticated;

                let participant = self
                    .registry
                    .participant_for_session(session_id)
                    .filter(|_| authenticated);

                let Some(participant) = participant else {
                    let error = ServerError::ConnectionFailed {
                        session_id,
                        reason: "handshake required".to_string(),
                    };
                    return Ok(self.make_error_response(session_id, frame, &error));
                };

                Ok(self.handle_room_frame(session_id, participant, frame))
            },
        }
    }

    /// Bind the participant presented in Hello to this session.
    ///
    /// A participant reconnecting before its old transport was declared dead
    /// evicts the old session first, as if that transport had been lost.
    fn bind_participant(&mut self, session_id: u64, participant: u64) -> Vec<ServerAction> {
        let mut actions = Vec::new();

        if let Some(old) = self.registry.session_for_participant(participant) {
            if old != session_id {
                let reason = "superseded by a newer session";
                actions.extend(self.release_session(old, reason, Departure::Lost));
                actions.push(ServerAction::CloseConnection {
                    session_id: old,
                    reason: reason.to_string(),
                });
            }
        }

        self.registry.authenticate(session_id, participant);

        actions.push(ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("session {session_id} authenticated as participant {participant}"),
        });

        actions
    }

    /// Decode and dispatch a room or transfer frame.
    fn handle_room_frame(
        &mut self,
        session_id: u64,
        participant: u64,
        frame: &Frame,
    ) -> Vec<ServerAction> {
        let request_id = frame.header.request_id();

        let result = match Payload::from_frame(frame) {
            Ok(Payload::CreateRoom(req)) => {
                self.handle_create_room(session_id, participant, request_id, req)
            },
            Ok(Payload::JoinRoom(req)) => {
                self.handle_join_room(session_id, participant, request_id, &req)
            },
            Ok(Payload::LeaveRoom(req)) => self.handle_leave_room(session_id, participant, &req),
            Ok(Payload::ChunkTransfer(req)) => {
                self.handle_chunk_transfer(session_id, participant, req)
            },
            Ok(Payload::RequestMissingChunks(req)) => self.handle_missing_request(participant, req),
            Ok(Payload::ConfirmFileReceived(req)) => self.handle_confirmation(participant, &req),
            Ok(other) => Err(ServerError::Room(RoomError::NotPermitted(format!(
                "opcode {:#06x} is relay-to-client only",
                other.opcode().to_u16()
            )))),
            Err(e) => Err(ServerError::Room(RoomError::InvalidPayload(e.to_string()))),
        };

        match result {
            Ok(actions) => actions,
            Err(e) => self.make_error_response(session_id, frame, &e),
        }
    }

    fn handle_create_room(
        &mut self,
        session_id: u64,
        participant: u64,
        request_id: u32,
        req: CreateRoom,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let code =
            RoomCode::parse(&req.room).map_err(|e| RoomError::InvalidPayload(e.to_string()))?;
        let manifest = TransferManifest::from_specs(&req.files)
            .map_err(|e| RoomError::InvalidPayload(e.to_string()))?;
        let file_count = manifest.len();
        let entries = manifest.to_entries();

        let outcome =
            self.room_manager.create_room(code.clone(), manifest, participant, &self.env)?;
        self.registry.subscribe(session_id, &code);

        let created = Payload::RoomCreated(RoomCreated { room: code.to_string() });
        let mut actions = vec![ServerAction::SendToSession {
            session_id,
            frame: build_frame(created, request_id, 0, None)?,
        }];

        match outcome {
            CreateOutcome::Created => {
                actions.push(ServerAction::Log {
                    level: LogLevel::Info,
                    message: format!(
                        "room {code} created by participant {participant} ({file_count} files)"
                    ),
                });
            },
            CreateOutcome::Reattached { receivers } => {
                // Receivers re-run their join logic and request what they lack
                let file_list = Payload::FileList(FileList { room: code.to_string(), files: entries });
                actions.push(ServerAction::BroadcastToRoom {
                    room: code.clone(),
                    frame: build_frame(file_list, 0, participant, None)?,
                    exclude_session: Some(session_id),
                });
                actions.push(ServerAction::Log {
                    level: LogLevel::Info,
                    message: format!(
                        "sender reattached to room {code}, replaying manifest to {} receivers",
                        receivers.len()
                    ),
                });

                // Confirmations recorded while detached never reached the sender
                if let Some(room) = self.room_manager.room(&code) {
                    for file in room.manifest().files() {
                        let Some(confirmed) = room.confirmations().confirmed_by(file.index) else {
                            continue;
                        };
                        for recipient in confirmed.iter() {
                            let replay = Payload::FileConfirmed(FileConfirmed {
                                room: code.to_string(),
                                file_index: file.index,
                                recipient,
                            });
                            actions.push(ServerAction::SendToSession {
                                session_id,
                                frame: build_frame(replay, 0, recipient, Some(participant))?,
                            });
                        }
                    }
                }
            },
        }

        Ok(actions)
    }

    fn handle_join_room(
        &mut self,
        session_id: u64,
        participant: u64,
        request_id: u32,
        req: &JoinRoom,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let code = lookup_code(&req.room)?;

        let room = self.room_manager.join_room(&code, participant)?;
        let files = room.manifest().to_entries();
        let sender = room.sender();
        let receivers = room.receiver_count();

        self.registry.subscribe(session_id, &code);

        let file_list = Payload::FileList(FileList { room: code.to_string(), files });

        Ok(vec![
            ServerAction::SendToSession {
                session_id,
                frame: build_frame(file_list, request_id, sender, Some(participant))?,
            },
            ServerAction::Log {
                level: LogLevel::Info,
                message: format!(
                    "participant {participant} joined room {code} ({receivers} receivers)"
                ),
            },
        ])
    }

    fn handle_leave_room(
        &mut self,
        session_id: u64,
        participant: u64,
        req: &LeaveRoom,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let code = lookup_code(&req.room)?;

        match self.room_manager.leave_room(&code, participant)? {
            LeaveOutcome::RoomClosed { receivers } => {
                Ok(self.close_room_notices(&code, &receivers, "sender left"))
            },
            LeaveOutcome::ReceiverLeft { remaining } => {
                self.registry.unsubscribe(session_id, &code);
                Ok(vec![ServerAction::Log {
                    level: LogLevel::Debug,
                    message: format!(
                        "participant {participant} left room {code} ({remaining} receivers remain)"
                    ),
                }])
            },
        }
    }

    fn handle_chunk_transfer(
        &mut self,
        session_id: u64,
        participant: u64,
        req: ChunkTransfer,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let code = lookup_code(&req.room)?;
        self.room_manager.route_chunk(&code, participant, req.file_index, req.chunk_index)?;

        let chunk = Payload::ReceiveChunk(ReceiveChunk {
            room: code.to_string(),
            file_index: req.file_index,
            chunk_index: req.chunk_index,
            chunk: req.chunk,
        });

        let Some(target) = req.recipient else {
            return Ok(vec![ServerAction::BroadcastToRoom {
                frame: build_frame(chunk, 0, participant, None)?,
                room: code,
                exclude_session: Some(session_id),
            }]);
        };

        let is_receiver = self.room_manager.room(&code).is_some_and(|r| r.is_receiver(target));
        let target_session = self.registry.session_for_participant(target).filter(|_| is_receiver);

        match target_session {
            Some(target_session) => Ok(vec![ServerAction::SendToSession {
                session_id: target_session,
                frame: build_frame(chunk, 0, participant, Some(target))?,
            }]),
            None => Ok(vec![ServerAction::Log {
                level: LogLevel::Debug,
                message: format!(
                    "dropping chunk {}/{} for absent receiver {target} in room {code}",
                    req.file_index, req.chunk_index
                ),
            }]),
        }
    }

    fn handle_missing_request(
        &mut self,
        participant: u64,
        req: RequestMissingChunks,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let code = lookup_code(&req.room)?;
        let sender = self.room_manager.route_missing_request(
            &code,
            participant,
            req.file_index,
            self.config.sender_grace,
            &self.env,
        )?;

        let sender_session = self.sender_session(&code, sender)?;
        let held = req.received_indexes.len();

        let forward = Payload::SendMissingChunks(SendMissingChunks {
            room: code.to_string(),
            file_index: req.file_index,
            received_indexes: req.received_indexes,
            recipient: participant,
        });

        Ok(vec![
            ServerAction::SendToSession {
                session_id: sender_session,
                frame: build_frame(forward, 0, participant, Some(sender))?,
            },
            ServerAction::Log {
                level: LogLevel::Debug,
                message: format!(
                    "resend request in room {code} for file {} from {participant} ({held} held)",
                    req.file_index
                ),
            },
        ])
    }

    fn handle_confirmation(
        &mut self,
        participant: u64,
        req: &ConfirmFileReceived,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let code = lookup_code(&req.room)?;
        let (sender, count) =
            self.room_manager.record_confirmation(&code, participant, req.file_index)?;

        let sender_session = self.sender_session(&code, sender)?;

        let forward = Payload::FileConfirmed(FileConfirmed {
            room: code.to_string(),
            file_index: req.file_index,
            recipient: participant,
        });

        Ok(vec![
            ServerAction::SendToSession {
                session_id: sender_session,
                frame: build_frame(forward, 0, participant, Some(sender))?,
            },
            ServerAction::Log {
                level: LogLevel::Info,
                message: format!(
                    "file {} in room {code} confirmed by {participant} ({count} receivers)",
                    req.file_index
                ),
            },
        ])
    }

    /// Live session of an attached sender, or `SenderUnavailable`.
    fn sender_session(&self, code: &RoomCode, sender: u64) -> Result<u64, RoomError> {
        let now = self.env.now();
        let grace = self.config.sender_grace;

        let room = self.room_manager.room(code);
        if let Some(retry_after) = room.and_then(|r| r.remaining_grace(now, grace)) {
            return Err(RoomError::SenderUnavailable { retry_after });
        }

        self.registry
            .session_for_participant(sender)
            .ok_or(RoomError::SenderUnavailable { retry_after: grace })
    }

    /// Tell remaining receivers the room is gone and drop its subscriptions.
    fn close_room_notices(
        &mut self,
        code: &RoomCode,
        receivers: &[u64],
        reason: &str,
    ) -> Vec<ServerAction> {
        self.registry.remove_room(code);

        let mut actions = Vec::with_capacity(receivers.len() + 1);

        let closed = Payload::RoomClosed(RoomClosed {
            room: code.to_string(),
            reason: reason.to_string(),
        });

        match build_frame(closed, 0, 0, None) {
            Ok(frame) => {
                for receiver in receivers {
                    if let Some(session_id) = self.registry.session_for_participant(*receiver) {
                        actions.push(ServerAction::SendToSession {
                            session_id,
                            frame: frame.clone(),
                        });
                    }
                }
            },
            Err(e) => actions.push(ServerAction::Log {
                level: LogLevel::Error,
                message: format!("failed to encode RoomClosed: {e}"),
            }),
        }

        actions.push(ServerAction::Log {
            level: LogLevel::Info,
            message: format!("room {code} closed: {reason}"),
        });

        actions
    }

    /// Forget a session and apply its departure to every room it was in.
    fn release_session(
        &mut self,
        session_id: u64,
        reason: &str,
        departure: Departure,
    ) -> Vec<ServerAction> {
        if let Some(mut conn) = self.connections.remove(&session_id) {
            conn.close();
        }

        let Some((info, rooms)) = self.registry.unregister_session(session_id) else {
            return Vec::new();
        };

        let mut actions = vec![ServerAction::Log {
            level: LogLevel::Info,
            message: format!(
                "connection {session_id} closed: {reason}, was in {} rooms",
                rooms.len()
            ),
        }];

        let Some(participant) = info.participant_id else {
            return actions;
        };

        for code in rooms {
            match departure {
                Departure::Left => {
                    if let Ok(LeaveOutcome::RoomClosed { receivers }) =
                        self.room_manager.leave_room(&code, participant)
                    {
                        actions.extend(self.close_room_notices(&code, &receivers, "sender left"));
                    }
                },
                Departure::Lost => {
                    match self.room_manager.participant_disconnected(&code, participant, &self.env)
                    {
                        DisconnectOutcome::SenderDetached => actions.push(ServerAction::Log {
                            level: LogLevel::Info,
                            message: format!("sender of room {code} detached"),
                        }),
                        DisconnectOutcome::ReceiverRemoved => actions.push(ServerAction::Log {
                            level: LogLevel::Debug,
                            message: format!("receiver {participant} dropped from room {code}"),
                        }),
                        DisconnectOutcome::NotMember => {},
                    }
                },
            }
        }

        actions
    }

    /// Handle periodic tick: connection timeouts, heartbeats, sender grace.
    fn handle_tick(&mut self) -> Vec<ServerAction> {
        let now = self.env.now();
        let mut actions = Vec::new();

        for (&session_id, conn) in &mut self.connections {
            for action in conn.tick(now) {
                actions.push(match action {
                    ConnectionAction::SendFrame(f) => {
                        ServerAction::SendToSession { session_id, frame: f }
                    },
                    ConnectionAction::Close { reason } => {
                        ServerAction::CloseConnection { session_id, reason }
                    },
                });
            }
        }

        for (code, receivers) in self.room_manager.expire_detached(self.config.sender_grace, &self.env)
        {
            actions.extend(self.close_room_notices(&code, &receivers, "sender did not return"));
        }

        actions
    }

    /// Error frame for a rejected request, plus a log line.
    fn make_error_response(
        &self,
        session_id: u64,
        frame: &Frame,
        error: &ServerError,
    ) -> Vec<ServerAction> {
        let error_payload = match error {
            ServerError::Room(room_err) => match room_err {
                RoomError::RoomNotFound(_) => ErrorPayload::room_not_found(),
                RoomError::DuplicateRoomCode(code) => ErrorPayload::duplicate_room_code(code.as_str()),
                RoomError::UnknownFileIndex { file_index, file_count } => {
                    ErrorPayload::unknown_file_index(*file_index, *file_count)
                },
                RoomError::NotPermitted(msg) => ErrorPayload::not_permitted(msg.clone()),
                RoomError::SenderUnavailable { retry_after } => {
                    ErrorPayload::sender_unavailable(retry_after_secs(*retry_after))
                },
                RoomError::UnknownChunkIndex { .. } | RoomError::InvalidPayload(_) => {
                    ErrorPayload::invalid_payload(room_err.to_string())
                },
            },
            ServerError::Protocol(msg) => ErrorPayload::invalid_payload(msg.clone()),
            _ => ErrorPayload::frame_rejected(error.to_string()),
        };

        let error_msg = error_payload.message.clone();
        let request_id = frame.header.request_id();

        match build_frame(Payload::Error(error_payload), request_id, 0, None) {
            Ok(frame) => vec![ServerAction::SendToSession { session_id, frame }, ServerAction::Log {
                level: LogLevel::Warn,
                message: format!("request from session {session_id} rejected: {error_msg}"),
            }],
            Err(e) => vec![ServerAction::Log {
                level: LogLevel::Error,
                message: format!("failed to encode error response: {e}"),
            }],
        }
    }

    /// All sessions subscribed to a room.
    pub fn sessions_in_room<'a>(
        &'a self,
        room: &RoomCode,
    ) -> impl Iterator<Item = u64> + use<'a, E> {
        self.registry.sessions_in_room(room)
    }

    /// Live session carrying `participant_id`.
    pub fn session_for_participant(&self, participant_id: u64) -> Option<u64> {
        self.registry.session_for_participant(participant_id)
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Room exists.
    pub fn has_room(&self, room: &RoomCode) -> bool {
        self.room_manager.has_room(room)
    }

    /// Room state. `None` if the room doesn't exist.
    pub fn room(&self, room: &RoomCode) -> Option<&RoomSession<E::Instant>> {
        self.room_manager.room(room)
    }

    /// Number of active rooms.
    pub fn room_count(&self) -> usize {
        self.room_manager.room_count()
    }

    /// Every active room, in code order.
    pub fn rooms(&self) -> impl Iterator<Item = &RoomSession<E::Instant>> + '_ {
        self.room_manager.rooms()
    }

    /// Driver configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl<E: Environment> std::fmt::Debug for ServerDriver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("connection_count", &self.connections.len())
            .field("session_count", &self.registry.session_count())
            .field("room_count", &self.room_manager.room_count())
            .finish()
    }
}

/// Room codes that fail to parse cannot name an existing room.
fn lookup_code(room: &str) -> Result<RoomCode, RoomError> {
    RoomCode::parse(room).map_err(|_| RoomError::RoomNotFound(room.to_string()))
}

/// Encode `payload` with routing fields stamped into the header.
fn build_frame(
    payload: Payload,
    request_id: u32,
    sender_id: u64,
    recipient: Option<u64>,
) -> Result<Frame, ServerError> {
    let mut header = FrameHeader::new(payload.opcode());
    header.set_request_id(request_id);
    header.set_sender_id(sender_id);
    header.set_recipient_id(recipient);
    Ok(payload.into_frame(header)?)
}

/// Whole seconds, rounded up, never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Instant,
    };

    use relaydrop_core::connection::PROTOCOL_VERSION;
    use relaydrop_proto::payloads::{room::FileSpec, session::Hello};

    use super::*;

    #[derive(Clone)]
    struct TestEnv {
        base: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self { base: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            use rand::RngCore;
            rand::thread_rng().fill_bytes(buffer);
        }
    }

    fn frame(payload: Payload) -> Frame {
        payload.into_frame(FrameHeader::new(Opcode::Ping)).unwrap()
    }

    fn connect(server: &mut ServerDriver<TestEnv>, session_id: u64, participant: u64) {
        server.process_event(ServerEvent::ConnectionAccepted { session_id }).unwrap();
        let hello = frame(Payload::Hello(Hello {
            version: PROTOCOL_VERSION,
            participant_id: Some(participant),
        }));
        server.process_event(ServerEvent::FrameReceived { session_id, frame: hello }).unwrap();
    }

    fn send(server: &mut ServerDriver<TestEnv>, session_id: u64, payload: Payload) -> Vec<ServerAction> {
        server.process_event(ServerEvent::FrameReceived { session_id, frame: frame(payload) }).unwrap()
    }

    fn create(room: &str) -> Payload {
        Payload::CreateRoom(CreateRoom {
            room: room.to_string(),
            files: vec![FileSpec { name: "a.bin".to_string(), size: 600_000 }],
        })
    }

    fn errors(actions: &[ServerAction]) -> Vec<ErrorPayload> {
        actions
            .iter()
            .filter_map(|a| match a {
                ServerAction::SendToSession { frame, .. } => match Payload::from_frame(frame) {
                    Ok(Payload::Error(e)) => Some(e),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    #[test]
    fn server_accepts_connection() {
        let mut server = ServerDriver::new(TestEnv::new(), ServerConfig::default());

        let actions =
            server.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();

        assert_eq!(server.connection_count(), 1);
        assert!(matches!(actions[0], ServerAction::Log { level: LogLevel::Debug, .. }));
    }

    #[test]
    fn server_rejects_when_max_connections_exceeded() {
        let config = ServerConfig { max_connections: 2, ..Default::default() };
        let mut server = ServerDriver::new(TestEnv::new(), config);

        server.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();
        server.process_event(ServerEvent::ConnectionAccepted { session_id: 2 }).unwrap();

        let actions =
            server.process_event(ServerEvent::ConnectionAccepted { session_id: 3 }).unwrap();

        assert_eq!(server.connection_count(), 2);
        assert!(matches!(actions[0], ServerAction::CloseConnection { .. }));
    }

    #[test]
    fn room_frames_require_handshake() {
        let mut server = ServerDriver::new(TestEnv::new(), ServerConfig::default());
        server.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();

        let actions = send(&mut server, 1, create("abc"));

        assert_eq!(errors(&actions)[0].code, ErrorPayload::FRAME_REJECTED);
        assert!(!server.has_room(&code("abc")));
    }

    #[test]
    fn create_room_acks_and_subscribes_sender() {
        let mut server = ServerDriver::new(TestEnv::new(), ServerConfig::default());
        connect(&mut server, 1, 100);

        let actions = send(&mut server, 1, create("ABC"));

        assert!(server.has_room(&code("abc")));
        assert_eq!(server.sessions_in_room(&code("abc")).collect::<Vec<_>>(), vec![1]);
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::SendToSession { session_id: 1, frame }
                if frame.header.opcode_enum() == Some(Opcode::RoomCreated)
        )));
    }

    #[test]
    fn empty_manifest_is_invalid_payload() {
        let mut server = ServerDriver::new(TestEnv::new(), ServerConfig::default());
        connect(&mut server, 1, 100);

        let actions = send(
            &mut server,
            1,
            Payload::CreateRoom(CreateRoom { room: "abc".to_string(), files: vec![] }),
        );

        assert_eq!(errors(&actions)[0].code, ErrorPayload::INVALID_PAYLOAD);
        assert_eq!(server.room_count(), 0);
    }

    #[test]
    fn file_too_large_to_chunk_is_invalid_payload() {
        let mut server = ServerDriver::new(TestEnv::new(), ServerConfig::default());
        connect(&mut server, 1, 100);

        let huge = FileSpec { name: "huge.bin".to_string(), size: 1 << 50 };
        let actions = send(
            &mut server,
            1,
            Payload::CreateRoom(CreateRoom { room: "abc".to_string(), files: vec![huge] }),
        );

        assert_eq!(errors(&actions)[0].code, ErrorPayload::INVALID_PAYLOAD);
        assert!(!server.has_room(&code("abc")));
    }

    #[test]
    fn goodbye_from_sender_closes_room() {
        let mut server = ServerDriver::new(TestEnv::new(), ServerConfig::default());
        connect(&mut server, 1, 100);
        connect(&mut server, 2, 200);
        send(&mut server, 1, create("abc"));
        send(&mut server, 2, Payload::JoinRoom(JoinRoom { room: "abc".to_string() }));

        let goodbye = Payload::Goodbye(relaydrop_proto::payloads::session::Goodbye {
            reason: "done".to_string(),
        });
        let actions = send(&mut server, 1, goodbye);

        assert!(!server.has_room(&code("abc")));
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::SendToSession { session_id: 2, frame }
                if frame.header.opcode_enum() == Some(Opcode::RoomClosed)
        )));
    }

    #[test]
    fn sender_grace_expiry_closes_room_on_tick() {
        let env = TestEnv::new();
        let mut server = ServerDriver::new(env.clone(), ServerConfig::default());
        connect(&mut server, 1, 100);
        connect(&mut server, 2, 200);
        send(&mut server, 1, create("abc"));
        send(&mut server, 2, Payload::JoinRoom(JoinRoom { room: "abc".to_string() }));

        server
            .process_event(ServerEvent::ConnectionClosed {
                session_id: 1,
                reason: "reset".to_string(),
            })
            .unwrap();
        assert!(server.has_room(&code("abc")));

        env.advance(Duration::from_secs(30));
        server.process_event(ServerEvent::Tick).unwrap();
        assert!(server.has_room(&code("abc")));

        // Keep the receiver's connection alive across the idle timeout
        server
            .process_event(ServerEvent::FrameReceived {
                session_id: 2,
                frame: Frame::new(FrameHeader::new(Opcode::Pong), Vec::new()),
            })
            .unwrap();

        env.advance(Duration::from_secs(31));
        let actions = server.process_event(ServerEvent::Tick).unwrap();
        assert!(!server.has_room(&code("abc")));
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::SendToSession { session_id: 2, frame }
                if frame.header.opcode_enum() == Some(Opcode::RoomClosed)
        )));
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(40)), 40);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
