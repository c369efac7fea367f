//! In-process transfer world for property and chaos testing.
//!
//! A `SimWorld` wires one relay [`ServerDriver`] to any number of [`Client`]s
//! without sockets or tasks. Frames sit in per-endpoint queues and
//! [`SimWorld::step`] delivers one of them, chosen by a seeded RNG, so every
//! interleaving is reproducible from the seed.
//!
//! Faults are injected on the relay → client path (connection loss,
//! duplicated and reordered chunks) and in each participant's chunk store.
//! Lost connections are re-established by [`SimWorld::reconnect_lost`], and
//! the client's role replay drives the resume.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    time::Duration,
};

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use relaydrop_client::{
    ChaoticChunkStore, ChunkStore, Client, ClientAction, ClientConfig, ClientError, ClientEvent,
    LogLevel as ClientLogLevel, MemoryChunkStore, MemorySource, TransferEvent, TransferManifest,
};
use relaydrop_core::{FileDescriptor, RoomCode};
use relaydrop_proto::{Frame, Opcode};
use relaydrop_server::{DriverConfig, LogLevel, ServerAction, ServerDriver, ServerEvent};

use crate::{
    SimEnv,
    invariants::{ParticipantRole, ParticipantSnapshot, RoomSnapshot, WorldSnapshot},
};

/// Client type every participant of a [`SimWorld`] runs.
pub type WorldClient = Client<SimEnv, ChaoticChunkStore<MemoryChunkStore>, MemorySource>;

/// Frame deliveries per [`SimWorld::run_until_idle`] call in
/// [`SimWorld::settle_until`].
const MAX_STEPS_PER_ROUND: usize = 100_000;

/// Virtual time between settle rounds.
const SETTLE_TICK: Duration = Duration::from_secs(1);

/// Fault injection rates, each in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultConfig {
    /// A relay frame is lost together with the receiving connection
    pub drop_rate: f64,
    /// A `receive_chunk` is delivered twice
    pub duplicate_rate: f64,
    /// A `receive_chunk` overtakes chunks already queued
    pub reorder_rate: f64,
    /// Each chunk store operation fails
    pub store_failure_rate: f64,
}

impl FaultConfig {
    /// No faults.
    pub const NONE: Self =
        Self { drop_rate: 0.0, duplicate_rate: 0.0, reorder_rate: 0.0, store_failure_rate: 0.0 };

    /// Every fault at a rate a transfer still converges under.
    pub fn lossy() -> Self {
        Self { drop_rate: 0.01, duplicate_rate: 0.1, reorder_rate: 0.25, store_failure_rate: 0.05 }
    }

    fn validate(&self) {
        for (name, rate) in [
            ("drop_rate", self.drop_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("reorder_rate", self.reorder_rate),
            ("store_failure_rate", self.store_failure_rate),
        ] {
            assert!((0.0..=1.0).contains(&rate), "{name} must be between 0.0 and 1.0, got {rate}");
        }
    }
}

/// Why a [`SimWorld`] operation failed.
#[derive(Debug)]
pub enum WorldError {
    /// A participant rejected an application command.
    Rejected {
        /// Participant index
        participant: usize,
        /// The client's reason
        error: ClientError,
    },
    /// The relay driver failed.
    Relay(String),
}

impl std::fmt::Display for WorldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { participant, error } => {
                write!(f, "participant {participant} rejected command: {error}")
            },
            Self::Relay(msg) => write!(f, "relay failed: {msg}"),
        }
    }
}

impl std::error::Error for WorldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected { error, .. } => Some(error),
            Self::Relay(_) => None,
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::NONE
    }
}

struct Participant {
    client: WorldClient,
    session: Option<u64>,
    /// Relay frames not yet delivered
    inbox: VecDeque<Frame>,
    /// Reconnect after a connection loss
    auto_reconnect: bool,
    events: Vec<TransferEvent>,
    /// Aggregate progress since the last join of a new manifest
    progress_history: Vec<f64>,
    joined_manifest: Option<TransferManifest>,
    /// Files reported complete since the last join of a new manifest
    completed: BTreeSet<u32>,
    ever_completed: BTreeSet<(RoomCode, u32)>,
}

impl Participant {
    fn record(&mut self, event: TransferEvent) {
        match &event {
            TransferEvent::Joined { manifest, progress, .. } => {
                if self.joined_manifest.as_ref() != Some(manifest) {
                    self.progress_history.clear();
                    self.completed.clear();
                    self.joined_manifest = Some(manifest.clone());
                }
                self.progress_history.push(*progress);
            },
            TransferEvent::FileProgress { aggregate, .. } => self.progress_history.push(*aggregate),
            TransferEvent::FileComplete { room, file_index } => {
                self.completed.insert(*file_index);
                self.ever_completed.insert((room.clone(), *file_index));
            },
            TransferEvent::Left { .. } => {
                self.progress_history.clear();
                self.completed.clear();
                self.joined_manifest = None;
            },
            _ => {},
        }
        self.events.push(event);
    }
}

enum Work {
    Relay(ServerAction),
    Client(usize, ClientAction),
}

/// Relay plus participants, driven one frame at a time.
pub struct SimWorld {
    env: SimEnv,
    relay: ServerDriver<SimEnv>,
    participants: Vec<Participant>,
    /// Session id → participant index
    sessions: HashMap<u64, usize>,
    /// Client frames not yet processed by the relay, in send order
    relay_inbox: VecDeque<(u64, Frame)>,
    faults: FaultConfig,
    /// Scheduling and fault decisions; separate from the environment RNG so
    /// ids and codes do not shift when fault rates change
    rng: ChaCha8Rng,
    client_config: ClientConfig,
    next_session: u64,
}

impl SimWorld {
    /// Fault-free world.
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, FaultConfig::NONE)
    }

    /// World with the given fault rates.
    pub fn with_faults(seed: u64, faults: FaultConfig) -> Self {
        Self::with_config(seed, faults, DriverConfig::default(), ClientConfig::default())
    }

    /// World with explicit relay and client configuration.
    ///
    /// # Panics
    ///
    /// Panics if a fault rate is outside `[0.0, 1.0]`.
    pub fn with_config(
        seed: u64,
        faults: FaultConfig,
        relay_config: DriverConfig,
        client_config: ClientConfig,
    ) -> Self {
        faults.validate();
        let env = SimEnv::with_seed(seed);

        Self {
            relay: ServerDriver::new(env.clone(), relay_config),
            env,
            participants: Vec::new(),
            sessions: HashMap::new(),
            relay_inbox: VecDeque::new(),
            faults,
            rng: ChaCha8Rng::seed_from_u64(seed ^ 0xfa17),
            client_config,
            next_session: 1,
        }
    }

    /// Add a disconnected participant and return its index.
    pub fn add_participant(&mut self) -> usize {
        let store = ChaoticChunkStore::with_seed(
            MemoryChunkStore::new(),
            self.faults.store_failure_rate,
            self.rng.next_u64(),
        );
        let client = Client::new(self.env.clone(), store, self.client_config.clone());

        self.participants.push(Participant {
            client,
            session: None,
            inbox: VecDeque::new(),
            auto_reconnect: false,
            events: Vec::new(),
            progress_history: Vec::new(),
            joined_manifest: None,
            completed: BTreeSet::new(),
            ever_completed: BTreeSet::new(),
        });
        self.participants.len() - 1
    }

    /// Number of participants.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Participant's client.
    pub fn client(&self, who: usize) -> &WorldClient {
        &self.participants[who].client
    }

    /// Whether the participant has a live connection.
    pub fn is_connected(&self, who: usize) -> bool {
        self.participants[who].session.is_some()
    }

    /// Every transfer event the participant has emitted.
    pub fn events(&self, who: usize) -> &[TransferEvent] {
        &self.participants[who].events
    }

    /// Relay driver, for assertions.
    pub fn relay(&self) -> &ServerDriver<SimEnv> {
        &self.relay
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Open a connection for a participant and start its handshake.
    ///
    /// The participant reconnects automatically after later connection loss.
    pub fn connect(&mut self, who: usize) -> Result<(), WorldError> {
        self.participants[who].auto_reconnect = true;
        if self.participants[who].session.is_some() {
            return Ok(());
        }

        let session_id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(session_id, who);
        self.participants[who].session = Some(session_id);

        let mut work = VecDeque::new();
        self.relay_event(ServerEvent::ConnectionAccepted { session_id }, &mut work)?;
        self.client_event(who, ClientEvent::Connected, &mut work);
        self.drain(work)
    }

    /// Close a participant's connection. It stays offline until
    /// [`Self::connect`].
    pub fn disconnect(&mut self, who: usize) -> Result<(), WorldError> {
        self.participants[who].auto_reconnect = false;
        let Some(session_id) = self.participants[who].session else {
            return Ok(());
        };

        let mut work = VecDeque::new();
        self.close_session(session_id, "disconnected".to_string(), &mut work)?;
        self.drain(work)
    }

    /// Feed an application command to a participant.
    pub fn command(&mut self, who: usize, event: ClientEvent<MemorySource>) -> Result<(), WorldError> {
        let actions = self.participants[who]
            .client
            .handle(event)
            .map_err(|error| WorldError::Rejected { participant: who, error })?;

        self.drain(actions.into_iter().map(|a| Work::Client(who, a)).collect())
    }

    /// Deliver one queued frame. Returns false when nothing is queued.
    pub fn step(&mut self) -> Result<bool, WorldError> {
        let mut ready: Vec<Option<usize>> = Vec::new();
        if !self.relay_inbox.is_empty() {
            ready.push(None);
        }
        ready.extend(
            self.participants.iter().enumerate().filter(|(_, p)| !p.inbox.is_empty()).map(|(i, _)| Some(i)),
        );

        if ready.is_empty() {
            return Ok(false);
        }

        let mut work = VecDeque::new();
        match ready[self.rng.gen_range(0..ready.len())] {
            None => {
                if let Some((session_id, frame)) = self.relay_inbox.pop_front() {
                    self.relay_event(ServerEvent::FrameReceived { session_id, frame }, &mut work)?;
                }
            },
            Some(who) => {
                if let Some(frame) = self.participants[who].inbox.pop_front() {
                    self.client_event(who, ClientEvent::FrameReceived(frame), &mut work);
                }
            },
        }

        self.drain(work)?;
        Ok(true)
    }

    /// Deliver frames until every queue is empty or `max_steps` were taken.
    /// Returns the number of frames delivered.
    pub fn run_until_idle(&mut self, max_steps: usize) -> Result<usize, WorldError> {
        let mut steps = 0;
        while steps < max_steps && self.step()? {
            steps += 1;
        }
        Ok(steps)
    }

    /// Move virtual time forward and tick the relay and every client.
    pub fn advance(&mut self, by: Duration) -> Result<(), WorldError> {
        self.env.advance(by);

        let mut work = VecDeque::new();
        self.relay_event(ServerEvent::Tick, &mut work)?;
        for who in 0..self.participants.len() {
            self.client_event(who, ClientEvent::Tick, &mut work);
        }
        self.drain(work)
    }

    /// Reconnect every participant that lost its connection involuntarily.
    pub fn reconnect_lost(&mut self) -> Result<(), WorldError> {
        for who in 0..self.participants.len() {
            let p = &self.participants[who];
            if p.auto_reconnect && p.session.is_none() {
                self.connect(who)?;
            }
        }
        Ok(())
    }

    /// Run rounds of delivery, reconnect and a one-second tick until `done`
    /// holds after delivery. Returns whether it did within `max_rounds`.
    pub fn settle_until(
        &mut self,
        max_rounds: usize,
        mut done: impl FnMut(&Self) -> bool,
    ) -> Result<bool, WorldError> {
        for _ in 0..max_rounds {
            self.run_until_idle(MAX_STEPS_PER_ROUND)?;
            if done(self) {
                return Ok(true);
            }
            self.reconnect_lost()?;
            self.advance(SETTLE_TICK)?;
        }
        self.run_until_idle(MAX_STEPS_PER_ROUND)?;
        Ok(done(self))
    }

    /// Observable state of the relay and every participant.
    ///
    /// Store contents are read past fault injection.
    pub fn snapshot(&self) -> WorldSnapshot {
        let rooms = self
            .relay
            .rooms()
            .map(|room| RoomSnapshot {
                code: room.code().clone(),
                sender: room.sender(),
                receivers: room.receivers().collect(),
                total_chunks: totals(room.manifest()),
                confirmed: room
                    .manifest()
                    .files()
                    .iter()
                    .map(|f| {
                        room.confirmations()
                            .confirmed_by(f.index)
                            .map(|set| set.iter().collect())
                            .unwrap_or_default()
                    })
                    .collect(),
            })
            .collect();

        let participants = self.participants.iter().map(participant_snapshot).collect();

        WorldSnapshot { rooms, participants }
    }

    fn drain(&mut self, mut work: VecDeque<Work>) -> Result<(), WorldError> {
        while let Some(item) = work.pop_front() {
            match item {
                Work::Relay(action) => self.execute_relay(action, &mut work)?,
                Work::Client(who, action) => self.execute_client(who, action, &mut work)?,
            }
        }
        Ok(())
    }

    fn relay_event(&mut self, event: ServerEvent, work: &mut VecDeque<Work>) -> Result<(), WorldError> {
        let actions =
            self.relay.process_event(event).map_err(|e| WorldError::Relay(e.to_string()))?;
        work.extend(actions.into_iter().map(Work::Relay));
        Ok(())
    }

    /// Client failures are reported as events, the way a session runtime
    /// would, and never stop the world.
    fn client_event(&mut self, who: usize, event: ClientEvent<MemorySource>, work: &mut VecDeque<Work>) {
        let p = &mut self.participants[who];
        match p.client.handle(event) {
            Ok(actions) => work.extend(actions.into_iter().map(|a| Work::Client(who, a))),
            Err(e) => {
                tracing::debug!(participant = who, "client error: {e}");
                p.record(TransferEvent::Error { code: 0, message: e.to_string() });
            },
        }
    }

    fn execute_relay(&mut self, action: ServerAction, work: &mut VecDeque<Work>) -> Result<(), WorldError> {
        match action {
            ServerAction::SendToSession { session_id, frame } => {
                self.deliver(session_id, frame, work)?;
            },
            ServerAction::BroadcastToRoom { room, frame, exclude_session } => {
                let sessions: Vec<u64> = self
                    .relay
                    .sessions_in_room(&room)
                    .filter(|s| Some(*s) != exclude_session)
                    .collect();
                for session_id in sessions {
                    self.deliver(session_id, frame.clone(), work)?;
                }
            },
            ServerAction::CloseConnection { session_id, reason } => {
                self.close_session(session_id, reason, work)?;
            },
            ServerAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!(target: "relay", "{message}"),
                LogLevel::Info => tracing::info!(target: "relay", "{message}"),
                LogLevel::Warn => tracing::warn!(target: "relay", "{message}"),
                LogLevel::Error => tracing::error!(target: "relay", "{message}"),
            },
        }
        Ok(())
    }

    fn execute_client(
        &mut self,
        who: usize,
        action: ClientAction,
        work: &mut VecDeque<Work>,
    ) -> Result<(), WorldError> {
        match action {
            ClientAction::Send(frame) => self.send_to_relay(who, frame),
            ClientAction::SendChunk { frame, bytes } => {
                self.send_to_relay(who, frame);
                // Queued frames count as written
                self.client_event(who, ClientEvent::ChunkFlushed { bytes }, work);
            },
            ClientAction::Notify(event) => self.participants[who].record(event),
            ClientAction::Log { level, message } => match level {
                ClientLogLevel::Debug => tracing::debug!(participant = who, "{message}"),
                ClientLogLevel::Info => tracing::info!(participant = who, "{message}"),
                ClientLogLevel::Warn => tracing::warn!(participant = who, "{message}"),
                ClientLogLevel::Error => tracing::error!(participant = who, "{message}"),
            },
            ClientAction::Close { reason } => {
                if let Some(session_id) = self.participants[who].session {
                    self.close_session(session_id, reason, work)?;
                }
            },
        }
        Ok(())
    }

    fn send_to_relay(&mut self, who: usize, frame: Frame) {
        match self.participants[who].session {
            Some(session_id) => self.relay_inbox.push_back((session_id, frame)),
            None => tracing::debug!(participant = who, "not connected, frame dropped"),
        }
    }

    /// Queue a relay frame for a session's participant, applying faults.
    fn deliver(&mut self, session_id: u64, frame: Frame, work: &mut VecDeque<Work>) -> Result<(), WorldError> {
        let Some(&who) = self.sessions.get(&session_id) else {
            return Ok(());
        };

        if self.rng.gen_bool(self.faults.drop_rate) {
            return self.close_session(session_id, "injected frame loss".to_string(), work);
        }

        let is_chunk = frame.header.opcode_enum() == Some(Opcode::ReceiveChunk);
        let copies = if is_chunk && self.rng.gen_bool(self.faults.duplicate_rate) { 2 } else { 1 };

        for _ in 0..copies {
            let inbox = &mut self.participants[who].inbox;
            if is_chunk && self.rng.gen_bool(self.faults.reorder_rate) {
                // Never ahead of a control frame; chunks only race each other
                let floor = inbox
                    .iter()
                    .rposition(|f| f.header.opcode_enum() != Some(Opcode::ReceiveChunk))
                    .map_or(0, |i| i + 1);
                let at = self.rng.gen_range(floor..=inbox.len());
                inbox.insert(at, frame.clone());
            } else {
                inbox.push_back(frame.clone());
            }
        }
        Ok(())
    }

    /// Tear down a session on both ends. Undelivered frames are lost.
    fn close_session(
        &mut self,
        session_id: u64,
        reason: String,
        work: &mut VecDeque<Work>,
    ) -> Result<(), WorldError> {
        let Some(who) = self.sessions.remove(&session_id) else {
            return Ok(());
        };

        let p = &mut self.participants[who];
        p.session = None;
        p.inbox.clear();
        self.relay_inbox.retain(|(s, _)| *s != session_id);

        self.client_event(who, ClientEvent::Disconnected { reason: reason.clone() }, work);
        self.relay_event(ServerEvent::ConnectionClosed { session_id, reason }, work)
    }
}

impl std::fmt::Debug for SimWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimWorld")
            .field("participants", &self.participants.len())
            .field("rooms", &self.relay.room_count())
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

fn totals(manifest: &TransferManifest) -> Vec<u32> {
    manifest.files().iter().map(FileDescriptor::total_chunks).collect()
}

fn participant_snapshot(p: &Participant) -> ParticipantSnapshot {
    let client = &p.client;
    let mut snap = ParticipantSnapshot::idle(client.participant_id());
    snap.progress_history = p.progress_history.clone();
    snap.completed = p.completed.clone();
    snap.ever_completed = p.ever_completed.clone();

    if let Some(sender) = client.sender() {
        snap.role = ParticipantRole::Sending;
        snap.room = Some(sender.room().clone());
        snap.total_chunks = Some(totals(sender.manifest()));
        snap.sender_confirmed = sender
            .manifest()
            .files()
            .iter()
            .map(|f| {
                sender
                    .confirmations()
                    .confirmed_by(f.index)
                    .map(|set| set.iter().collect())
                    .unwrap_or_default()
            })
            .collect();
    } else if let Some(receiver) = client.receiver() {
        snap.role = ParticipantRole::Receiving;
        snap.room = Some(receiver.room().clone());

        if let Some(manifest) = receiver.manifest() {
            let store = client.store().inner();
            snap.total_chunks = Some(totals(manifest));
            snap.held = manifest
                .files()
                .iter()
                .map(|f| store.chunk_indexes(receiver.room(), f.index).unwrap_or_default())
                .collect();
        }
    }

    snap
}
