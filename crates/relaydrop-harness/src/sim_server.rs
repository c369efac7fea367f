//! Simulation relay for testing with turmoil.
//!
//! `SimServer` wraps `ServerDriver` for integration with turmoil's
//! deterministic network. It uses `SimEnv` for the action-based core, turmoil
//! TCP for networking, and one reader task per connection feeding a single
//! event queue, so the driver sees frames in a reproducible order.

use std::{
    collections::{HashMap, VecDeque},
    io,
    time::Duration,
};

use relaydrop_core::{Environment, RoomCode};
use relaydrop_proto::Frame;
use relaydrop_server::{DriverConfig, LogLevel, ServerAction, ServerDriver, ServerEvent};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
};
use turmoil::net::{TcpListener, TcpStream};

use crate::{SimEnv, read_frame, write_frame};

/// Something a connection reader observed.
enum Inbound {
    Frame { session_id: u64, frame: Frame },
    Closed { session_id: u64, reason: String },
}

/// Simulation relay for testing with turmoil.
///
/// Tests either drive it step by step ([`Self::accept_connection`],
/// [`Self::process_frame`], [`Self::tick`]) or hand it to a turmoil host with
/// [`Self::serve`].
pub struct SimServer {
    /// The action-based relay driver
    driver: ServerDriver<SimEnv>,
    env: SimEnv,
    listener: TcpListener,
    /// Write halves by session
    writers: HashMap<u64, WriteHalf<TcpStream>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
}

impl SimServer {
    /// Create and bind a new simulation relay.
    pub async fn bind(address: &str) -> io::Result<Self> {
        Self::bind_with(address, SimEnv::new(), DriverConfig::default()).await
    }

    /// Create and bind with a specific environment and driver config.
    pub async fn bind_with(address: &str, env: SimEnv, config: DriverConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let driver = ServerDriver::new(env.clone(), config);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Self { driver, env, listener, writers: HashMap::new(), inbound_tx, inbound_rx })
    }

    /// Accept a new connection and return its session id.
    ///
    /// This method blocks until a connection is available.
    pub async fn accept_connection(&mut self) -> io::Result<u64> {
        let (stream, _addr) = self.listener.accept().await?;
        let session_id = self.env.random_id();

        let (reader, writer) = tokio::io::split(stream);
        self.writers.insert(session_id, writer);
        tokio::spawn(read_connection(session_id, reader, self.inbound_tx.clone()));

        self.dispatch(ServerEvent::ConnectionAccepted { session_id }).await?;
        Ok(session_id)
    }

    /// Wait for the next frame or closure from any connection and process it.
    pub async fn process_next(&mut self) -> io::Result<()> {
        match self.inbound_rx.recv().await {
            Some(Inbound::Frame { session_id, frame }) => self.process_frame(session_id, frame).await,
            Some(Inbound::Closed { session_id, reason }) => {
                self.connection_closed(session_id, reason).await
            },
            None => Err(io::Error::other("inbound queue closed")),
        }
    }

    /// Process a frame as if `session_id` had sent it.
    pub async fn process_frame(&mut self, session_id: u64, frame: Frame) -> io::Result<()> {
        self.dispatch(ServerEvent::FrameReceived { session_id, frame }).await
    }

    /// Advance virtual time by `elapsed`, then process a tick.
    pub async fn tick(&mut self, elapsed: Duration) -> io::Result<()> {
        self.env.advance(elapsed);
        self.dispatch(ServerEvent::Tick).await
    }

    /// Accept connections and process frames forever, ticking every
    /// `tick_interval` of simulated time.
    pub async fn serve(mut self, tick_interval: Duration) -> io::Result<()> {
        let mut ticker = tokio::time::interval(tick_interval);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let session_id = self.env.random_id();
                    let (reader, writer) = tokio::io::split(stream);
                    self.writers.insert(session_id, writer);
                    tokio::spawn(read_connection(session_id, reader, self.inbound_tx.clone()));
                    self.dispatch(ServerEvent::ConnectionAccepted { session_id }).await?;
                },
                inbound = self.inbound_rx.recv() => match inbound {
                    Some(Inbound::Frame { session_id, frame }) => {
                        self.process_frame(session_id, frame).await?;
                    },
                    Some(Inbound::Closed { session_id, reason }) => {
                        self.connection_closed(session_id, reason).await?;
                    },
                    None => return Ok(()),
                },
                _ = ticker.tick() => self.tick(tick_interval).await?,
            }
        }
    }

    async fn connection_closed(&mut self, session_id: u64, reason: String) -> io::Result<()> {
        if self.writers.remove(&session_id).is_none() {
            // Already closed by the relay
            return Ok(());
        }
        self.dispatch(ServerEvent::ConnectionClosed { session_id, reason }).await
    }

    async fn dispatch(&mut self, event: ServerEvent) -> io::Result<()> {
        let actions = self.driver.process_event(event).map_err(|e| io::Error::other(e.to_string()))?;
        self.execute_actions(actions).await
    }

    /// Execute relay actions.
    ///
    /// A closed session is reported back to the driver and its reaction is
    /// executed in turn.
    async fn execute_actions(&mut self, actions: Vec<ServerAction>) -> io::Result<()> {
        let mut pending = VecDeque::from(actions);

        while let Some(action) = pending.pop_front() {
            match action {
                ServerAction::SendToSession { session_id, frame } => {
                    self.send_frame(session_id, &frame).await;
                },

                ServerAction::BroadcastToRoom { room, frame, exclude_session } => {
                    let sessions: Vec<u64> = self
                        .driver
                        .sessions_in_room(&room)
                        .filter(|s| Some(*s) != exclude_session)
                        .collect();
                    for session_id in sessions {
                        self.send_frame(session_id, &frame).await;
                    }
                },

                ServerAction::CloseConnection { session_id, reason } => {
                    if let Some(mut writer) = self.writers.remove(&session_id) {
                        // FIN lets the peer's reader see the close
                        let _ = writer.shutdown().await;
                        let more = self
                            .driver
                            .process_event(ServerEvent::ConnectionClosed { session_id, reason })
                            .map_err(|e| io::Error::other(e.to_string()))?;
                        pending.extend(more);
                    }
                },

                ServerAction::Log { level, message } => log(level, &message),
            }
        }

        Ok(())
    }

    /// Send a frame to a specific session. Write failures surface later as a
    /// closed connection from the reader.
    async fn send_frame(&mut self, session_id: u64, frame: &Frame) {
        if let Some(writer) = self.writers.get_mut(&session_id)
            && let Err(e) = write_frame(writer, frame).await
        {
            tracing::debug!(session_id, "write failed: {e}");
        }
    }

    /// Whether a room is active.
    pub fn has_room(&self, room: &RoomCode) -> bool {
        self.driver.has_room(room)
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.driver.connection_count()
    }

    /// Underlying driver for test assertions.
    pub fn driver(&self) -> &ServerDriver<SimEnv> {
        &self.driver
    }

    /// Shared simulation environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }
}

async fn read_connection(
    session_id: u64,
    mut reader: ReadHalf<TcpStream>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if inbound.send(Inbound::Frame { session_id, frame }).is_err() {
                    return;
                }
            },
            Err(e) => {
                let _ = inbound.send(Inbound::Closed { session_id, reason: e.to_string() });
                return;
            },
        }
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
mod tests {
    use relaydrop_core::connection::PROTOCOL_VERSION;
    use relaydrop_proto::{
        FrameHeader, Opcode, Payload,
        payloads::session::Hello,
    };

    use super::*;

    #[test]
    fn sim_server_binds() {
        let mut sim = turmoil::Builder::new().build();

        sim.host("relay", || async {
            let server = SimServer::bind("0.0.0.0:4433").await?;
            assert_eq!(server.connection_count(), 0);
            Ok(())
        });

        sim.run().unwrap();
    }

    #[test]
    fn sim_server_answers_hello() {
        let mut sim = turmoil::Builder::new().build();

        sim.host("relay", || async {
            let mut server = SimServer::bind("0.0.0.0:4433").await?;
            server.accept_connection().await?;
            server.process_next().await?;
            assert_eq!(server.connection_count(), 1);
            // Keep the host alive until the client has read its reply
            server.process_next().await?;
            Ok(())
        });

        sim.client("alice", async {
            let stream = TcpStream::connect("relay:4433").await?;
            let (mut reader, mut writer) = tokio::io::split(stream);

            let hello = Payload::Hello(Hello { version: PROTOCOL_VERSION, participant_id: Some(7) })
                .into_frame(FrameHeader::new(Opcode::Hello))
                .unwrap();
            write_frame(&mut writer, &hello).await?;

            let reply = read_frame(&mut reader).await?;
            match Payload::from_frame(&reply).unwrap() {
                Payload::HelloReply(reply) => assert_eq!(reply.participant_id, 7),
                other => panic!("expected HelloReply, got {other:?}"),
            }
            Ok(())
        });

        sim.run().unwrap();
    }
}
