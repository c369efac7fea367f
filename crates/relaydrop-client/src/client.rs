//! Client state machine.
//!
//! The `Client` owns one participant's view of the world: its stable
//! participant id, the session-layer [`Connection`], and at most one room role
//! (sender or receiver). It never touches a socket; the runtime feeds it
//! [`ClientEvent`]s and executes the returned [`ClientAction`]s.
//!
//! # Reconnect
//!
//! The room role survives a disconnect. Once the next handshake completes the
//! client replays it: a sender re-sends `create_room` (reattach), a receiver
//! re-sends `join_room`, and the relay's `file_list` drives the resume.
//! Commands issued before the first handshake use the same path, so they
//! wait for authentication without a separate queue.

use relaydrop_core::{
    Environment, RoomCode,
    connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState},
};
use relaydrop_proto::{
    ErrorPayload, Frame, FrameHeader, Payload,
    payloads::{
        room::{CreateRoom, FileList, JoinRoom, LeaveRoom, RoomClosed},
        transfer::{FileConfirmed, SendMissingChunks},
    },
};

use crate::{
    error::ClientError,
    event::{ClientAction, ClientEvent, LogLevel, TransferEvent},
    receiver::ReceiverCoordinator,
    sender::{SenderConfig, SenderCoordinator},
    source::FileSource,
    store::ChunkStore,
};

/// Fresh codes tried after the relay reports a generated code in use.
pub const MAX_CODE_RETRIES: u32 = 3;

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Handshake, idle and heartbeat timing
    pub connection: ConnectionConfig,
    /// Sender emission window
    pub sender: SenderConfig,
}

struct SendingRole<F: FileSource> {
    coordinator: SenderCoordinator<F>,
    /// Code came from `RoomCode::generate` and may be replaced on conflict
    generated_code: bool,
    code_retries: u32,
    /// The relay has acknowledged the room at least once
    created: bool,
    start_requested: bool,
    started: bool,
}

enum Role<S: ChunkStore, F: FileSource> {
    Idle,
    Sending(SendingRole<F>),
    Receiving(ReceiverCoordinator<S>),
}

/// One participant of a RelayDrop transfer.
///
/// Generic over the environment `E`, the chunk store `S` used when
/// receiving, and the file source `F` used when sending.
pub struct Client<E: Environment, S: ChunkStore, F: FileSource> {
    env: E,
    store: S,
    config: ClientConfig,
    /// Presented in every Hello; stable across reconnects
    participant_id: u64,
    connection: Option<Connection<E::Instant>>,
    role: Role<S, F>,
    next_request_id: u32,
}

impl<E: Environment, S: ChunkStore, F: FileSource> Client<E, S, F> {
    /// Create a client with a fresh random participant id.
    pub fn new(env: E, store: S, config: ClientConfig) -> Self {
        let participant_id = env.random_id();
        Self {
            env,
            store,
            config,
            participant_id,
            connection: None,
            role: Role::Idle,
            next_request_id: 1,
        }
    }

    /// Stable participant id presented to the relay.
    pub fn participant_id(&self) -> u64 {
        self.participant_id
    }

    /// Whether the handshake with the relay has completed.
    pub fn is_authenticated(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.state() == ConnectionState::Authenticated)
    }

    /// Room of the current role, if any.
    pub fn room(&self) -> Option<&RoomCode> {
        match &self.role {
            Role::Idle => None,
            Role::Sending(s) => Some(s.coordinator.room()),
            Role::Receiving(r) => Some(r.room()),
        }
    }

    /// Sender coordinator, when sending.
    pub fn sender(&self) -> Option<&SenderCoordinator<F>> {
        match &self.role {
            Role::Sending(s) => Some(&s.coordinator),
            _ => None,
        }
    }

    /// Receiver coordinator, when receiving.
    pub fn receiver(&self) -> Option<&ReceiverCoordinator<S>> {
        match &self.role {
            Role::Receiving(r) => Some(r),
            _ => None,
        }
    }

    /// Chunk store shared with receiver coordinators.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process an event and return resulting actions.
    pub fn handle(&mut self, event: ClientEvent<F>) -> Result<Vec<ClientAction>, ClientError> {
        match event {
            ClientEvent::Connected => self.handle_connected(),
            ClientEvent::FrameReceived(frame) => {
                self.handle_frame(&frame).or_else(|e| self.resync_after(e))
            },
            ClientEvent::ChunkFlushed { bytes } => {
                if let Role::Sending(s) = &mut self.role {
                    s.coordinator.chunk_flushed(bytes);
                }
                self.poll_sender().or_else(|e| self.resync_after(e))
            },
            ClientEvent::Disconnected { reason } => Ok(self.handle_disconnected(reason)),
            ClientEvent::Tick => self.handle_tick().or_else(|e| self.resync_after(e)),
            ClientEvent::CreateRoom { room, source } => self.handle_create_room(room, source),
            ClientEvent::JoinRoom { room } => self.handle_join_room(room),
            ClientEvent::StartTransfer => self.handle_start_transfer(),
            ClientEvent::LeaveRoom => self.handle_leave_room(),
        }
    }

    /// A transient local failure while applying relay input leaves the role
    /// out of step with the relay. Closing the connection makes the next
    /// handshake replay the role, which rebuilds it from the store.
    fn resync_after(&mut self, error: ClientError) -> Result<Vec<ClientAction>, ClientError> {
        if !error.is_transient() {
            return Err(error);
        }

        let Some(connection) = self.connection.as_mut() else {
            return Err(error);
        };
        connection.close();

        Ok(vec![
            log(LogLevel::Warn, format!("{error}, reconnecting to resync")),
            ClientAction::Close { reason: format!("local failure: {error}") },
        ])
    }

    fn handle_connected(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        let now = self.env.now();
        let mut connection = Connection::new(now, self.config.connection.clone());
        let actions = connection.send_hello(Some(self.participant_id), now)?;
        self.connection = Some(connection);

        Ok(convert_connection_actions(actions))
    }

    fn handle_frame(&mut self, frame: &Frame) -> Result<Vec<ClientAction>, ClientError> {
        let Some(opcode) = frame.header.opcode_enum() else {
            return Ok(vec![log(
                LogLevel::Warn,
                format!("ignoring frame with unknown opcode {:#06x}", frame.header.opcode()),
            )]);
        };

        let now = self.env.now();
        let Some(connection) = self.connection.as_mut() else {
            return Ok(vec![log(LogLevel::Debug, format!("{opcode:?} received while disconnected"))]);
        };
        connection.update_activity(now);

        if opcode.is_session() {
            let was_authenticated = connection.state() == ConnectionState::Authenticated;

            let actions = match connection.handle_frame(frame, now) {
                Ok(actions) => actions,
                Err(e) => {
                    connection.close();
                    return Ok(vec![
                        log(LogLevel::Warn, format!("session error: {e}")),
                        ClientAction::Close { reason: e.to_string() },
                    ]);
                },
            };

            let mut out = convert_connection_actions(actions);
            if !was_authenticated && self.is_authenticated() {
                out.push(ClientAction::Notify(TransferEvent::Connected {
                    participant_id: self.participant_id,
                }));
                out.extend(self.replay_role()?);
            }
            return Ok(out);
        }

        if !self.is_authenticated() {
            return Ok(vec![log(LogLevel::Warn, format!("{opcode:?} received before handshake"))]);
        }

        match Payload::from_frame(frame)? {
            Payload::Error(err) => self.handle_error_notice(err),
            Payload::RoomCreated(created) => self.handle_room_created(&created.room),
            Payload::FileList(list) => self.handle_file_list(&list),
            Payload::RoomClosed(closed) => Ok(self.handle_room_closed(closed)),
            Payload::ReceiveChunk(chunk) => match &mut self.role {
                Role::Receiving(receiver) => receiver.on_chunk_received(&chunk),
                _ => Ok(vec![log(LogLevel::Debug, "chunk received while not receiving".to_string())]),
            },
            Payload::SendMissingChunks(req) => self.handle_send_missing(&req),
            Payload::FileConfirmed(confirmed) => Ok(self.handle_file_confirmed(&confirmed)),
            other => Ok(vec![log(
                LogLevel::Debug,
                format!("ignoring unexpected {:?}", other.opcode()),
            )]),
        }
    }

    /// Re-announce the current role after a handshake.
    fn replay_role(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        let payload = match &self.role {
            Role::Idle => return Ok(Vec::new()),
            Role::Sending(s) => create_room_payload(&s.coordinator),
            Role::Receiving(r) if r.is_closed() => return Ok(Vec::new()),
            Role::Receiving(r) => Payload::JoinRoom(JoinRoom { room: r.room().to_string() }),
        };

        Ok(vec![ClientAction::Send(self.control_frame(payload)?)])
    }

    fn handle_error_notice(&mut self, err: ErrorPayload) -> Result<Vec<ClientAction>, ClientError> {
        let mut actions = vec![log(LogLevel::Warn, format!("relay error {}: {}", err.code, err.message))];

        match &mut self.role {
            Role::Sending(s) if err.code == ErrorPayload::DUPLICATE_ROOM_CODE && !s.created => {
                if s.generated_code && s.code_retries < MAX_CODE_RETRIES {
                    s.code_retries += 1;
                    let room = RoomCode::generate(&self.env);
                    actions.push(log(
                        LogLevel::Info,
                        format!(
                            "room code {} taken, retrying with {room} ({}/{MAX_CODE_RETRIES})",
                            s.coordinator.room(),
                            s.code_retries
                        ),
                    ));
                    s.coordinator.set_room(room);
                    let payload = create_room_payload(&s.coordinator);
                    actions.push(ClientAction::Send(self.control_frame(payload)?));
                    return Ok(actions);
                }
                self.role = Role::Idle;
            },
            Role::Sending(s) if err.code == ErrorPayload::DUPLICATE_ROOM_CODE => {
                // Our room expired while we were away and the code was reused
                let room = s.coordinator.room().clone();
                self.role = Role::Idle;
                actions.push(ClientAction::Notify(TransferEvent::RoomClosed {
                    room,
                    reason: "room code taken while disconnected".to_string(),
                }));
            },
            Role::Receiving(r) if err.code == ErrorPayload::ROOM_NOT_FOUND => {
                if r.manifest().is_some() {
                    actions.extend(r.on_room_closed(&err.message));
                } else {
                    self.role = Role::Idle;
                }
            },
            _ => {},
        }

        actions.push(ClientAction::Notify(TransferEvent::Error { code: err.code, message: err.message }));
        Ok(actions)
    }

    fn handle_room_created(&mut self, room: &str) -> Result<Vec<ClientAction>, ClientError> {
        let Role::Sending(s) = &mut self.role else {
            return Ok(vec![log(LogLevel::Debug, format!("room_created for {room} while not sending"))]);
        };

        if room != s.coordinator.room().as_str() {
            return Ok(vec![log(LogLevel::Warn, format!("room_created for unknown room {room}"))]);
        }

        let mut actions = Vec::new();
        if s.created {
            s.coordinator.clear_confirmations();
            actions.push(log(LogLevel::Info, format!("reattached to room {room}")));
        } else {
            s.created = true;
            actions.push(log(LogLevel::Info, format!("room {room} created")));
            actions.push(ClientAction::Notify(TransferEvent::RoomCreated {
                room: s.coordinator.room().clone(),
            }));
        }

        if s.start_requested && !s.started {
            s.started = true;
            let queued = s.coordinator.start_transfer();
            actions.push(log(LogLevel::Info, format!("transfer started, {queued} chunks queued")));
        }

        actions.extend(self.poll_sender()?);
        Ok(actions)
    }

    fn handle_file_list(&mut self, list: &FileList) -> Result<Vec<ClientAction>, ClientError> {
        match &mut self.role {
            Role::Receiving(r) if r.room().as_str() == list.room => r.on_joined_room(&list.files),
            _ => Ok(vec![log(LogLevel::Debug, format!("ignoring file_list for {}", list.room))]),
        }
    }

    fn handle_room_closed(&mut self, closed: RoomClosed) -> Vec<ClientAction> {
        match &mut self.role {
            Role::Receiving(r) if r.room().as_str() == closed.room => r.on_room_closed(&closed.reason),
            Role::Sending(s) if s.coordinator.room().as_str() == closed.room => {
                let room = s.coordinator.room().clone();
                self.role = Role::Idle;
                vec![ClientAction::Notify(TransferEvent::RoomClosed { room, reason: closed.reason })]
            },
            _ => vec![log(LogLevel::Debug, format!("ignoring room_closed for {}", closed.room))],
        }
    }

    fn handle_send_missing(&mut self, req: &SendMissingChunks) -> Result<Vec<ClientAction>, ClientError> {
        let Role::Sending(s) = &mut self.role else {
            return Ok(vec![log(LogLevel::Debug, "resend request while not sending".to_string())]);
        };

        if req.room != s.coordinator.room().as_str() {
            return Ok(vec![log(LogLevel::Warn, format!("resend request for unknown room {}", req.room))]);
        }

        let mut actions = match s.coordinator.handle_missing_chunks_request(
            req.file_index,
            &req.received_indexes,
            req.recipient,
        ) {
            Ok(queued) => vec![log(
                LogLevel::Debug,
                format!("queued {queued} chunks of file {} for {}", req.file_index, req.recipient),
            )],
            Err(e) => vec![log(LogLevel::Warn, format!("dropping resend request: {e}"))],
        };

        actions.extend(self.poll_sender()?);
        Ok(actions)
    }

    fn handle_file_confirmed(&mut self, confirmed: &FileConfirmed) -> Vec<ClientAction> {
        let Role::Sending(s) = &mut self.role else {
            return vec![log(LogLevel::Debug, "confirmation while not sending".to_string())];
        };

        match s.coordinator.record_confirmation(confirmed.file_index, confirmed.recipient) {
            Ok(confirmations) => vec![ClientAction::Notify(TransferEvent::FileConfirmed {
                room: s.coordinator.room().clone(),
                file_index: confirmed.file_index,
                recipient: confirmed.recipient,
                confirmations,
            })],
            Err(e) => vec![log(LogLevel::Warn, format!("dropping confirmation: {e}"))],
        }
    }

    fn handle_disconnected(&mut self, reason: String) -> Vec<ClientAction> {
        self.connection = None;
        if let Role::Sending(s) = &mut self.role {
            s.coordinator.reset();
        }

        vec![
            log(LogLevel::Info, format!("disconnected: {reason}")),
            ClientAction::Notify(TransferEvent::Disconnected { reason }),
        ]
    }

    fn handle_tick(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        let now = self.env.now();
        let Some(connection) = self.connection.as_mut() else {
            return Ok(Vec::new());
        };

        let mut actions = convert_connection_actions(connection.tick(now));
        if !self.is_authenticated() {
            return Ok(actions);
        }

        if let Role::Receiving(r) = &mut self.role {
            actions.extend(r.on_tick()?);
        }
        actions.extend(self.poll_sender()?);

        Ok(actions)
    }

    fn handle_create_room(
        &mut self,
        room: Option<RoomCode>,
        source: F,
    ) -> Result<Vec<ClientAction>, ClientError> {
        self.require_idle("create a room")?;

        let generated_code = room.is_none();
        let room = room.unwrap_or_else(|| RoomCode::generate(&self.env));
        let coordinator = SenderCoordinator::new(room, source, self.config.sender.clone())?;

        let payload = create_room_payload(&coordinator);
        self.role = Role::Sending(SendingRole {
            coordinator,
            generated_code,
            code_retries: 0,
            created: false,
            start_requested: false,
            started: false,
        });

        self.send_or_defer(payload)
    }

    fn handle_join_room(&mut self, room: RoomCode) -> Result<Vec<ClientAction>, ClientError> {
        self.require_idle("join a room")?;

        let payload = Payload::JoinRoom(JoinRoom { room: room.to_string() });
        self.role = Role::Receiving(ReceiverCoordinator::new(self.store.clone(), room));

        self.send_or_defer(payload)
    }

    fn handle_start_transfer(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        let Role::Sending(s) = &mut self.role else {
            return Err(ClientError::InvalidState("start_transfer requires a sending room".to_string()));
        };

        s.start_requested = true;
        if s.started {
            return Ok(vec![log(LogLevel::Debug, "transfer already started".to_string())]);
        }
        if !s.created {
            return Ok(vec![log(
                LogLevel::Debug,
                "transfer will start once the relay accepts the room".to_string(),
            )]);
        }

        s.started = true;
        let queued = s.coordinator.start_transfer();
        let mut actions = vec![log(LogLevel::Info, format!("transfer started, {queued} chunks queued"))];
        actions.extend(self.poll_sender()?);
        Ok(actions)
    }

    fn handle_leave_room(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        let (room, purged, announce) = match std::mem::replace(&mut self.role, Role::Idle) {
            Role::Idle => return Err(ClientError::InvalidState("not in a room".to_string())),
            Role::Sending(s) => (s.coordinator.room().clone(), 0, true),
            Role::Receiving(mut r) => {
                let announce = !r.is_closed();
                match r.leave() {
                    Ok(purged) => (r.room().clone(), purged, announce),
                    Err(e) => {
                        // Still in the room; the caller may retry
                        self.role = Role::Receiving(r);
                        return Err(e);
                    },
                }
            },
        };

        let mut actions = Vec::new();
        if announce && self.is_authenticated() {
            let frame = self.control_frame(Payload::LeaveRoom(LeaveRoom { room: room.to_string() }))?;
            actions.push(ClientAction::Send(frame));
        }

        actions.push(log(LogLevel::Info, format!("left room {room}, purged {purged} chunks")));
        actions.push(ClientAction::Notify(TransferEvent::Left { room, purged }));
        Ok(actions)
    }

    fn poll_sender(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        if !self.is_authenticated() {
            return Ok(Vec::new());
        }

        match &mut self.role {
            Role::Sending(s) if s.created => s.coordinator.poll_chunks(),
            _ => Ok(Vec::new()),
        }
    }

    fn require_idle(&self, operation: &str) -> Result<(), ClientError> {
        match self.room() {
            None => Ok(()),
            Some(room) => {
                Err(ClientError::InvalidState(format!("cannot {operation}: already in room {room}")))
            },
        }
    }

    fn send_or_defer(&mut self, payload: Payload) -> Result<Vec<ClientAction>, ClientError> {
        if self.is_authenticated() {
            return Ok(vec![ClientAction::Send(self.control_frame(payload)?)]);
        }

        Ok(vec![log(LogLevel::Debug, format!("{:?} deferred until connected", payload.opcode()))])
    }

    /// Frame a control payload with a fresh request id and our participant id.
    fn control_frame(&mut self, payload: Payload) -> Result<Frame, ClientError> {
        let mut header = FrameHeader::new(payload.opcode());
        header.set_request_id(self.next_request_id);
        header.set_sender_id(self.participant_id);
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);

        Ok(payload.into_frame(header)?)
    }
}

impl<E: Environment, S: ChunkStore, F: FileSource> std::fmt::Debug for Client<E, S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("participant_id", &self.participant_id)
            .field("authenticated", &self.is_authenticated())
            .field("room", &self.room())
            .finish_non_exhaustive()
    }
}

fn create_room_payload<F: FileSource>(coordinator: &SenderCoordinator<F>) -> Payload {
    Payload::CreateRoom(CreateRoom {
        room: coordinator.room().to_string(),
        files: coordinator.manifest().to_specs(),
    })
}

fn convert_connection_actions(actions: Vec<ConnectionAction>) -> Vec<ClientAction> {
    actions
        .into_iter()
        .map(|action| match action {
            ConnectionAction::SendFrame(frame) => ClientAction::Send(frame),
            ConnectionAction::Close { reason } => ClientAction::Close { reason },
        })
        .collect()
}

fn log(level: LogLevel, message: String) -> ClientAction {
    ClientAction::Log { level, message }
}
