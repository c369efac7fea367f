//! Participant runtime.
//!
//! A [`Session`] owns one [`Client`], one relay connection at a time and a
//! tick timer. It executes the client's actions against the transport,
//! publishes [`TransferEvent`]s to subscribers and reconnects with a fixed
//! backoff when the connection drops. Room state lives in the client, so a
//! reconnect resumes the current role without caller involvement.

use std::time::Duration;

use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    Client, ClientAction, ClientConfig, ClientError, ClientEvent, ChunkStore, FileSource, LogLevel,
    RoomCode, SystemEnv, TransferEvent,
    transport::{self, ConnectedClient, Inbound, Outbound, TransportError},
};

/// Subscriber buffer. Slow subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 256;

/// Reconnect behaviour after the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed connects before the session gives up
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 10, backoff: Duration::from_secs(1) }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay address (`host:port`)
    pub server_addr: String,
    /// Reconnect behaviour
    pub reconnect: ReconnectPolicy,
    /// Period of [`ClientEvent::Tick`]
    pub tick_interval: Duration,
    /// Client state machine configuration
    pub client: ClientConfig,
}

impl SessionConfig {
    /// Defaults for `server_addr`.
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            reconnect: ReconnectPolicy::default(),
            tick_interval: Duration::from_secs(1),
            client: ClientConfig::default(),
        }
    }
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every reconnect attempt failed.
    #[error("gave up after {attempts} connection attempts: {last}")]
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
        /// Last transport error
        last: TransportError,
    },

    /// The session task is no longer running.
    #[error("session closed")]
    Closed,

    /// The session task panicked or was cancelled.
    #[error("session task failed: {0}")]
    Task(String),
}

enum Command<F> {
    Client(ClientEvent<F>),
    Shutdown,
}

/// Why a connection's event loop returned.
enum Exit {
    Shutdown,
    Disconnected(String),
}

/// Handle to a running session.
///
/// Dropping the handle stops the session after the current event.
pub struct SessionHandle<F> {
    commands: mpsc::UnboundedSender<Command<F>>,
    events: broadcast::Sender<TransferEvent>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl<F: FileSource> SessionHandle<F> {
    /// Share `source` in a room, generating a code when `room` is `None`.
    pub fn create_room(&self, room: Option<RoomCode>, source: F) -> Result<(), SessionError> {
        self.command(ClientEvent::CreateRoom { room, source })
    }

    /// Join `room` as a receiver.
    pub fn join_room(&self, room: RoomCode) -> Result<(), SessionError> {
        self.command(ClientEvent::JoinRoom { room })
    }

    /// Start streaming once the room exists.
    pub fn start_transfer(&self) -> Result<(), SessionError> {
        self.command(ClientEvent::StartTransfer)
    }

    /// Leave the current room.
    pub fn leave_room(&self) -> Result<(), SessionError> {
        self.command(ClientEvent::LeaveRoom)
    }

    /// Receive every [`TransferEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Stop the session and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), SessionError> {
        // The task may already have exited; its result is what matters
        let _ = self.commands.send(Command::Shutdown);
        self.task.await.map_err(|e| SessionError::Task(e.to_string()))?
    }

    fn command(&self, event: ClientEvent<F>) -> Result<(), SessionError> {
        self.commands.send(Command::Client(event)).map_err(|_| SessionError::Closed)
    }
}

impl<F> std::fmt::Debug for SessionHandle<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("finished", &self.task.is_finished()).finish()
    }
}

/// Participant runtime on tokio with [`SystemEnv`].
pub struct Session<S: ChunkStore, F: FileSource> {
    client: Client<SystemEnv, S, F>,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<Command<F>>,
    events: broadcast::Sender<TransferEvent>,
}

impl<S: ChunkStore, F: FileSource> Session<S, F> {
    /// Spawn a session on the current tokio runtime.
    ///
    /// Connecting starts immediately. Commands issued before the handshake
    /// completes are held by the client and sent once authenticated.
    pub fn spawn(store: S, config: SessionConfig) -> SessionHandle<F> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let session = Self {
            client: Client::new(SystemEnv::new(), store, config.client.clone()),
            config,
            commands: command_rx,
            events: event_tx.clone(),
        };

        let task = tokio::spawn(session.run());
        SessionHandle { commands: command_tx, events: event_tx, task }
    }

    async fn run(mut self) -> Result<(), SessionError> {
        let mut attempts = 0u32;

        loop {
            let transport = match transport::connect(&self.config.server_addr).await {
                Ok(transport) => {
                    attempts = 0;
                    transport
                },
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(attempt = attempts, "connect to {} failed: {e}", self.config.server_addr);
                    if attempts >= self.config.reconnect.max_attempts {
                        self.publish(TransferEvent::Disconnected { reason: e.to_string() });
                        return Err(SessionError::ReconnectExhausted { attempts, last: e });
                    }
                    if let Exit::Shutdown = self.backoff().await {
                        return Ok(());
                    }
                    continue;
                },
            };

            match self.drive(transport).await {
                Exit::Shutdown => return Ok(()),
                Exit::Disconnected(reason) => {
                    tracing::info!("disconnected: {reason}");
                    self.dispatch(ClientEvent::Disconnected { reason }, None).await;
                    if let Exit::Shutdown = self.backoff().await {
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Wait out the reconnect delay while still accepting commands.
    async fn backoff(&mut self) -> Exit {
        let delay = tokio::time::sleep(self.config.reconnect.backoff);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                () = &mut delay => return Exit::Disconnected(String::new()),
                command = self.commands.recv() => match command {
                    Some(Command::Client(event)) => {
                        self.dispatch(event, None).await;
                    },
                    Some(Command::Shutdown) | None => return Exit::Shutdown,
                },
            }
        }
    }

    /// Run one connection until it drops or the session is shut down.
    async fn drive(&mut self, mut transport: ConnectedClient) -> Exit {
        tracing::info!(remote = %transport.remote_addr(), "connected");

        if let Some(reason) = self.dispatch(ClientEvent::Connected, Some(&transport)).await {
            transport.close(&reason);
            return Exit::Disconnected(reason);
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut flushed_seen = 0u64;
        let mut writer_alive = true;

        loop {
            let event = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Client(event)) => event,
                    Some(Command::Shutdown) | None => {
                        transport.close("shutdown");
                        return Exit::Shutdown;
                    },
                },
                inbound = transport.from_server.recv() => match inbound {
                    Some(Inbound::Frame(frame)) => ClientEvent::FrameReceived(frame),
                    Some(Inbound::Closed { reason }) => {
                        transport.close(&reason);
                        return Exit::Disconnected(reason);
                    },
                    None => return Exit::Disconnected("transport stopped".to_string()),
                },
                changed = transport.flushed.changed(), if writer_alive => {
                    if changed.is_err() {
                        // Writer ended; the closure arrives on from_server
                        writer_alive = false;
                        continue;
                    }
                    let total = *transport.flushed.borrow_and_update();
                    let bytes = total - flushed_seen;
                    flushed_seen = total;
                    ClientEvent::ChunkFlushed { bytes }
                },
                _ = ticker.tick() => ClientEvent::Tick,
            };

            if let Some(reason) = self.dispatch(event, Some(&transport)).await {
                transport.close(&reason);
                return Exit::Disconnected(reason);
            }
        }
    }

    /// Feed one event to the client and execute its actions.
    ///
    /// Returns the reason if the client asked to close the connection.
    async fn dispatch(
        &mut self,
        event: ClientEvent<F>,
        transport: Option<&ConnectedClient>,
    ) -> Option<String> {
        let actions = match self.client.handle(event) {
            Ok(actions) => actions,
            Err(e) => {
                self.report(&e);
                return None;
            },
        };

        let mut close = None;
        for action in actions {
            match action {
                ClientAction::Send(frame) => {
                    Self::transmit(transport, Outbound::Control(frame)).await;
                },
                ClientAction::SendChunk { frame, bytes } => {
                    Self::transmit(transport, Outbound::Chunk { frame, bytes }).await;
                },
                ClientAction::Notify(event) => self.publish(event),
                ClientAction::Log { level, message } => log(level, &message),
                ClientAction::Close { reason } => close = Some(reason),
            }
        }

        close
    }

    /// Queue a frame, waiting while the transport queue is full.
    async fn transmit(transport: Option<&ConnectedClient>, outbound: Outbound) {
        match transport {
            Some(transport) => {
                if transport.to_server.send(outbound).await.is_err() {
                    tracing::debug!("transport writer gone, frame dropped");
                }
            },
            None => tracing::debug!("not connected, frame dropped"),
        }
    }

    fn publish(&self, event: TransferEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn report(&self, error: &ClientError) {
        tracing::warn!("client error: {error}");
        self.publish(TransferEvent::Error { code: 0, message: error.to_string() });
    }
}

fn log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!("{message}"),
        LogLevel::Info => tracing::info!("{message}"),
        LogLevel::Warn => tracing::warn!("{message}"),
        LogLevel::Error => tracing::error!("{message}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{MemoryChunkStore, MemorySource};

    #[test]
    fn reconnect_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.backoff, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let mut config = SessionConfig::new("not an address");
        config.reconnect = ReconnectPolicy { max_attempts: 3, backoff: Duration::from_millis(10) };

        let handle = Session::<MemoryChunkStore, MemorySource>::spawn(MemoryChunkStore::new(), config);
        let mut events = handle.subscribe();

        let result = handle.task.await;
        assert!(matches!(result, Ok(Err(SessionError::ReconnectExhausted { attempts: 3, .. }))));
        assert!(matches!(events.try_recv(), Ok(TransferEvent::Disconnected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff() {
        let mut config = SessionConfig::new("not an address");
        config.reconnect = ReconnectPolicy { max_attempts: 100, backoff: Duration::from_secs(60) };

        let handle = Session::<MemoryChunkStore, MemorySource>::spawn(MemoryChunkStore::new(), config);
        handle.join_room(RoomCode::parse("abc123").unwrap()).unwrap();

        assert!(handle.shutdown().await.is_ok());
    }
}
