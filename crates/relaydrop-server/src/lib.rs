//! RelayDrop relay.
//!
//! The relay binds one sender to any number of receivers around a room code
//! and forwards chunks and control messages between them. It keeps room
//! membership, the manifest and confirmation sets, and nothing about transfer
//! progress.
//!
//! # Architecture
//!
//! [`ServerDriver`] is Sans-IO: it turns [`ServerEvent`]s into
//! [`ServerAction`]s and never touches a socket. [`Server`] is the production
//! runtime that feeds it from Quinn connections and executes the actions.
//!
//! Outbound frames for each session go through a bounded queue. A connection
//! reader waits for the queues it fed to drain before reading on, so a slow
//! receiver slows its sender instead of growing relay memory.
//!
//! # Components
//!
//! - [`ServerDriver`]: event → action orchestrator (pure logic, no I/O)
//! - [`RoomManager`] / [`RoomSession`]: room lifecycle and validation
//! - [`ConnectionRegistry`]: session ↔ participant ↔ room mapping
//! - [`Server`]: production runtime
//! - [`QuinnTransport`]: QUIC transport via Quinn

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod outbox;
mod registry;
pub mod room;
mod room_manager;
mod server_error;
mod transport;

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
pub use driver::{
    DEFAULT_SENDER_GRACE, LogLevel, ServerAction, ServerConfig as DriverConfig, ServerDriver,
    ServerEvent,
};
pub use error::ServerError;
use outbox::{Outbox, OutboxReceiver, QueueError};
pub use outbox::{OUTBOUND_QUEUE_FRAMES, SLOW_CONSUMER_TIMEOUT};
use quinn::{RecvStream, SendStream};
pub use registry::{ConnectionRegistry, SessionInfo};
use relaydrop_core::env::Environment;
pub use relaydrop_core::SystemEnv;
use relaydrop_proto::{Frame, FrameHeader};
pub use room::{DisconnectOutcome, LeaveOutcome, RoomSession, RoomState};
pub use room_manager::{CreateOutcome, RoomError, RoomManager};
pub use server_error::ServerError as DriverError;
use tokio::sync::{Mutex, RwLock};
pub use transport::{QuinnConnection, QuinnTransport};

/// How often the runtime feeds [`ServerEvent::Tick`] to the driver.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

type SharedDriver = Arc<Mutex<ServerDriver<SystemEnv>>>;

/// Per-connection handles shared by all connection tasks.
struct SharedState {
    /// Session ID to QUIC connection (for closing)
    connections: RwLock<HashMap<u64, QuinnConnection>>,
    /// Session ID to its writer task queue.
    ///
    /// Every frame for a session goes through this one queue, so frames
    /// arrive in the order the driver produced them.
    outbound: RwLock<HashMap<u64, Outbox>>,
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<PathBuf>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<PathBuf>,
    /// Driver configuration (timeouts, limits, sender grace)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            driver: DriverConfig::default(),
        }
    }
}

/// Production relay.
///
/// Wraps [`ServerDriver`] with Quinn QUIC transport and the system
/// environment.
pub struct Server {
    driver: ServerDriver<SystemEnv>,
    transport: QuinnTransport,
    env: SystemEnv,
}

impl Server {
    /// Create and bind a new relay.
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let driver = ServerDriver::new(env.clone(), config.driver);

        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )?;

        Ok(Self { driver, transport, env })
    }

    /// Local address the relay is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Run the relay, accepting connections until the endpoint closes.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!(addr = %self.transport.local_addr()?, "relay starting");

        let env = self.env;
        let driver: SharedDriver = Arc::new(Mutex::new(self.driver));
        let shared = Arc::new(SharedState {
            connections: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
        });

        tokio::spawn(run_ticks(Arc::clone(&driver), Arc::clone(&shared)));

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let driver = Arc::clone(&driver);
                    let shared = Arc::clone(&shared);
                    let session_id = env.random_id();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(session_id, conn, driver, shared).await {
                            tracing::warn!(session_id, "connection error: {e}");
                        }
                    });
                },
                Err(ServerError::Transport(msg)) if msg == "endpoint closed" => {
                    tracing::info!("endpoint closed, relay stopping");
                    return Ok(());
                },
                Err(e) => tracing::warn!("accept error: {e}"),
            }
        }
    }
}

/// Periodic timeouts, heartbeats and sender grace expiry.
async fn run_ticks(driver: SharedDriver, shared: Arc<SharedState>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(e) = dispatch(&driver, &shared, ServerEvent::Tick).await {
            tracing::error!("tick failed: {e}");
        }
    }
}

/// Handle a single QUIC connection for its whole lifetime.
async fn handle_connection(
    session_id: u64,
    conn: QuinnConnection,
    driver: SharedDriver,
    shared: Arc<SharedState>,
) -> Result<(), ServerError> {
    tracing::debug!(session_id, remote = %conn.remote_addr(), "new connection");

    shared.connections.write().await.insert(session_id, conn.clone());
    dispatch(&driver, &shared, ServerEvent::ConnectionAccepted { session_id }).await?;

    let reason = match conn.accept_bi().await {
        Ok((send, recv)) => {
            let (outbox, rx) = Outbox::new();
            shared.outbound.write().await.insert(session_id, outbox);
            tokio::spawn(write_frames(session_id, send, rx));

            read_frames(session_id, recv, &driver, &shared).await
        },
        Err(e) => e.to_string(),
    };

    shared.connections.write().await.remove(&session_id);
    shared.outbound.write().await.remove(&session_id);

    dispatch(&driver, &shared, ServerEvent::ConnectionClosed { session_id, reason }).await?;
    Ok(())
}

/// Read frames until the stream ends. Returns why it ended.
async fn read_frames(
    session_id: u64,
    mut recv: RecvStream,
    driver: &SharedDriver,
    shared: &SharedState,
) -> String {
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE);

    loop {
        buf.clear();
        buf.resize(FrameHeader::SIZE, 0);

        if let Err(e) = recv.read_exact(&mut buf[..]).await {
            return format!("read failed: {e}");
        }

        let payload_size = match FrameHeader::from_bytes(&buf) {
            Ok(header) => header.payload_size() as usize,
            Err(e) => return format!("invalid frame header: {e}"),
        };

        if payload_size > 0 {
            buf.resize(FrameHeader::SIZE + payload_size, 0);
            if let Err(e) = recv.read_exact(&mut buf[FrameHeader::SIZE..]).await {
                return format!("payload read failed: {e}");
            }
        }

        let frame = match Frame::decode(&buf) {
            Ok(frame) => frame,
            Err(e) => return format!("frame decode failed: {e}"),
        };

        match dispatch(driver, shared, ServerEvent::FrameReceived { session_id, frame }).await {
            Ok(fed) => wait_for_writers(shared, &fed).await,
            Err(ServerError::Driver(DriverError::ConnectionFailed { reason, .. })) => {
                close_connection(shared, session_id, &reason).await;
                return reason;
            },
            Err(e) => tracing::warn!(session_id, "frame processing error: {e}"),
        }
    }
}

/// Hold a reader until every queue it just fed is back under
/// [`OUTBOUND_QUEUE_FRAMES`].
///
/// A queue that does not drain within [`SLOW_CONSUMER_TIMEOUT`] has its
/// connection closed; that participant resumes after reconnecting.
async fn wait_for_writers(shared: &SharedState, sessions: &BTreeSet<u64>) {
    for &session_id in sessions {
        let Some(outbox) = shared.outbound.read().await.get(&session_id).cloned() else {
            continue;
        };

        let drained =
            tokio::time::timeout(SLOW_CONSUMER_TIMEOUT, outbox.drained_to(OUTBOUND_QUEUE_FRAMES));
        if drained.await.is_err() {
            tracing::warn!(session_id, backlog = outbox.backlog(), "outbound queue stalled");
            close_connection(shared, session_id, "outbound queue stalled").await;
        }
    }
}

/// Drain a session's queue onto its QUIC stream.
async fn write_frames(session_id: u64, mut send: SendStream, mut rx: OutboxReceiver) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = send.write_all(&bytes).await {
            tracing::debug!(session_id, "write failed: {e}");
            rx.close();
            return;
        }
    }

    if let Err(e) = send.finish() {
        tracing::debug!(session_id, "finish failed: {e}");
    }
}

/// Feed one event to the driver and execute the resulting actions.
/// Returns the sessions that had frames queued.
///
/// Broadcasts are resolved to sessions while the driver lock is held, so
/// room membership and delivery see the same state.
async fn dispatch(
    driver: &SharedDriver,
    shared: &SharedState,
    event: ServerEvent,
) -> Result<BTreeSet<u64>, ServerError> {
    let mut driver = driver.lock().await;
    let actions = driver.process_event(event)?;
    execute_actions(&driver, actions, shared).await
}

/// Execute server actions. Returns the sessions that had frames queued.
async fn execute_actions(
    driver: &ServerDriver<SystemEnv>,
    actions: Vec<ServerAction>,
    shared: &SharedState,
) -> Result<BTreeSet<u64>, ServerError> {
    let mut fed = BTreeSet::new();

    for action in actions {
        match action {
            ServerAction::SendToSession { session_id, frame } => {
                let bytes = Bytes::from(frame.to_vec()?);
                if enqueue(shared, session_id, bytes).await {
                    fed.insert(session_id);
                }
            },

            ServerAction::BroadcastToRoom { room, frame, exclude_session } => {
                let bytes = Bytes::from(frame.to_vec()?);
                let sessions: Vec<u64> = driver
                    .sessions_in_room(&room)
                    .filter(|s| Some(*s) != exclude_session)
                    .collect();

                for session_id in sessions {
                    if enqueue(shared, session_id, bytes.clone()).await {
                        fed.insert(session_id);
                    }
                }
            },

            ServerAction::CloseConnection { session_id, reason } => {
                close_connection(shared, session_id, &reason).await;
            },

            ServerAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Error => tracing::error!("{message}"),
            },
        }
    }

    Ok(fed)
}

/// Queue a frame for a session. Returns whether it was queued.
///
/// A queue at hard capacity belongs to a consumer that stopped reading; its
/// connection is closed rather than the frame silently lost.
async fn enqueue(shared: &SharedState, session_id: u64, bytes: Bytes) -> bool {
    let pushed = match shared.outbound.read().await.get(&session_id) {
        Some(outbox) => outbox.push(bytes),
        None => {
            tracing::debug!(session_id, "no outbound stream, dropping frame");
            return false;
        },
    };

    match pushed {
        Ok(()) => true,
        Err(QueueError::Closed) => {
            tracing::debug!(session_id, "writer gone, dropping frame");
            false
        },
        Err(QueueError::Overflow) => {
            close_connection(shared, session_id, "outbound queue overflow").await;
            false
        },
    }
}

async fn close_connection(shared: &SharedState, session_id: u64, reason: &str) {
    tracing::info!(session_id, "closing connection: {reason}");
    shared.outbound.write().await.remove(&session_id);
    if let Some(conn) = shared.connections.write().await.remove(&session_id) {
        conn.close(reason);
    }
}
