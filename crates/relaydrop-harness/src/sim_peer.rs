//! Simulated participant for turmoil tests.
//!
//! `SimPeer` runs a [`Client`] over a turmoil TCP stream: a reader task feeds
//! inbound frames into a queue, and the peer executes client actions inline.
//! Tests drive it with commands and wait for [`TransferEvent`]s.

use std::{collections::VecDeque, io, time::Duration};

use relaydrop_client::{
    ChunkStore, Client, ClientAction, ClientConfig, ClientEvent, FileSource, LogLevel,
    TransferEvent,
};
use relaydrop_proto::Frame;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
};
use turmoil::net::TcpStream;

use crate::{SimEnv, read_frame, write_frame};

/// One participant connected to a [`crate::SimServer`].
pub struct SimPeer<S: ChunkStore, F: FileSource> {
    client: Client<SimEnv, S, F>,
    env: SimEnv,
    writer: WriteHalf<TcpStream>,
    inbound: mpsc::UnboundedReceiver<io::Result<Frame>>,
    /// Events not yet returned to the test
    events: VecDeque<TransferEvent>,
}

impl<S: ChunkStore, F: FileSource> SimPeer<S, F> {
    /// Connect to `address` and start the handshake.
    pub async fn connect(
        address: &str,
        env: SimEnv,
        store: S,
        config: ClientConfig,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (reader, writer) = tokio::io::split(stream);

        let (tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(read_frames(reader, tx));

        let client = Client::new(env.clone(), store, config);
        let mut peer = Self { client, env, writer, inbound, events: VecDeque::new() };
        peer.handle(ClientEvent::Connected).await?;
        Ok(peer)
    }

    /// The participant's client, for assertions.
    pub fn client(&self) -> &Client<SimEnv, S, F> {
        &self.client
    }

    /// Feed an application command.
    pub async fn command(&mut self, event: ClientEvent<F>) -> io::Result<()> {
        self.handle(event).await
    }

    /// Next transfer event, processing frames and ticking every `tick` while
    /// waiting.
    pub async fn next_event(&mut self, tick: Duration) -> io::Result<TransferEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }

            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(Ok(frame)) => self.deliver(ClientEvent::FrameReceived(frame)).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                },
                () = tokio::time::sleep(tick) => {
                    self.env.advance(tick);
                    self.deliver(ClientEvent::Tick).await?;
                },
            }
        }
    }

    /// Skip events until one matches `wanted`, and return it.
    pub async fn wait_for(
        &mut self,
        tick: Duration,
        mut wanted: impl FnMut(&TransferEvent) -> bool,
    ) -> io::Result<TransferEvent> {
        loop {
            let event = self.next_event(tick).await?;
            if wanted(&event) {
                return Ok(event);
            }
        }
    }

    /// Client failures while processing relay input become
    /// [`TransferEvent::Error`] rather than ending the test.
    async fn deliver(&mut self, event: ClientEvent<F>) -> io::Result<()> {
        match self.client.handle(event) {
            Ok(actions) => self.execute(actions).await,
            Err(e) => {
                self.events.push_back(TransferEvent::Error { code: 0, message: e.to_string() });
                Ok(())
            },
        }
    }

    async fn handle(&mut self, event: ClientEvent<F>) -> io::Result<()> {
        let actions = self.client.handle(event).map_err(|e| io::Error::other(e.to_string()))?;
        self.execute(actions).await
    }

    async fn execute(&mut self, actions: Vec<ClientAction>) -> io::Result<()> {
        let mut pending = VecDeque::from(actions);

        while let Some(action) = pending.pop_front() {
            match action {
                ClientAction::Send(frame) => write_frame(&mut self.writer, &frame).await?,
                ClientAction::SendChunk { frame, bytes } => {
                    write_frame(&mut self.writer, &frame).await?;
                    let more = self
                        .client
                        .handle(ClientEvent::ChunkFlushed { bytes })
                        .map_err(|e| io::Error::other(e.to_string()))?;
                    pending.extend(more);
                },
                ClientAction::Notify(event) => self.events.push_back(event),
                ClientAction::Log { level, message } => match level {
                    LogLevel::Debug => tracing::debug!("{message}"),
                    LogLevel::Info => tracing::info!("{message}"),
                    LogLevel::Warn => tracing::warn!("{message}"),
                    LogLevel::Error => tracing::error!("{message}"),
                },
                ClientAction::Close { reason } => {
                    tracing::debug!("closing: {reason}");
                    self.writer.shutdown().await?;
                },
            }
        }

        Ok(())
    }
}

impl<S: ChunkStore, F: FileSource> std::fmt::Debug for SimPeer<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPeer")
            .field("client", &self.client)
            .field("pending_events", &self.events.len())
            .finish_non_exhaustive()
    }
}

async fn read_frames(mut reader: ReadHalf<TcpStream>, tx: mpsc::UnboundedSender<io::Result<Frame>>) {
    loop {
        let result = read_frame(&mut reader).await;
        let failed = result.is_err();
        if tx.send(result).is_err() || failed {
            return;
        }
    }
}
