//! `relaydrop send`: share files in a room until every receiver confirmed them.

use std::path::PathBuf;

use relaydrop_client::{
    FileSource, FsSource, MemoryChunkStore, RoomCode, TransferEvent,
    session::{Session, SessionConfig},
};
use relaydrop_proto::payloads::ErrorPayload;
use tokio::sync::broadcast::error::RecvError;

use crate::CliError;

/// Options for [`run_send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Files to share, in manifest order
    pub files: Vec<PathBuf>,
    /// Requested room code. Generated when `None`.
    pub room: Option<RoomCode>,
    /// Stream every chunk once the room exists instead of waiting for
    /// missing-chunk requests
    pub start: bool,
    /// Receivers that must confirm every file before the command returns
    pub receivers: usize,
}

/// What the send loop should do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStep {
    /// Keep waiting.
    Continue,
    /// The relay accepted the room for the first time.
    Created(RoomCode),
    /// Every file has the required number of confirmations.
    Finished,
    /// The room is gone or could not be created.
    Failed(String),
}

/// Follows confirmations for one shared room.
#[derive(Debug)]
pub struct SendTracker {
    receivers: usize,
    confirmations: Vec<usize>,
    room: Option<RoomCode>,
}

impl SendTracker {
    /// Track `file_count` files, each needing `receivers` confirmations.
    pub fn new(file_count: usize, receivers: usize) -> Self {
        Self { receivers, confirmations: vec![0; file_count], room: None }
    }

    /// Room accepted by the relay, once known.
    pub fn room(&self) -> Option<&RoomCode> {
        self.room.as_ref()
    }

    /// Confirmation count per file.
    pub fn confirmations(&self) -> &[usize] {
        &self.confirmations
    }

    /// Apply one session event.
    pub fn observe(&mut self, event: &TransferEvent) -> SendStep {
        match event {
            TransferEvent::RoomCreated { room } if self.room.is_none() => {
                self.room = Some(room.clone());
                if self.is_finished() {
                    return SendStep::Finished;
                }
                SendStep::Created(room.clone())
            },
            TransferEvent::FileConfirmed { file_index, confirmations, .. } => {
                if let Some(count) = self.confirmations.get_mut(*file_index as usize) {
                    *count = (*count).max(*confirmations);
                }
                if self.room.is_some() && self.is_finished() {
                    SendStep::Finished
                } else {
                    SendStep::Continue
                }
            },
            TransferEvent::RoomClosed { room, reason } => {
                SendStep::Failed(format!("room {room} closed: {reason}"))
            },
            TransferEvent::Error { code, message }
                if *code == ErrorPayload::DUPLICATE_ROOM_CODE && self.room.is_none() =>
            {
                SendStep::Failed(format!("room code unavailable: {message}"))
            },
            _ => SendStep::Continue,
        }
    }

    fn is_finished(&self) -> bool {
        self.confirmations.iter().all(|&count| count >= self.receivers)
    }
}

/// Share `options.files` through the relay in `config`.
///
/// Returns once every file has `options.receivers` confirmations, or on
/// Ctrl-C. The room is left before returning either way.
pub async fn run_send(options: SendOptions, config: SessionConfig) -> Result<(), CliError> {
    let source = FsSource::open(options.files.as_slice())?;
    let mut tracker = SendTracker::new(source.specs().len(), options.receivers);

    let session = Session::<MemoryChunkStore, FsSource>::spawn(MemoryChunkStore::new(), config);
    let mut events = session.subscribe();
    session.create_room(options.room, source)?;
    if options.start {
        session.start_transfer()?;
    }

    let outcome = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break Ok(());
            },
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event subscriber lagged");
                continue;
            },
            Err(RecvError::Closed) => break Err(CliError::Failed("session ended".to_string())),
        };

        log_event(&event);
        match tracker.observe(&event) {
            SendStep::Continue => {},
            SendStep::Created(room) => {
                tracing::info!(room = %room, "room ready, share this code with receivers");
            },
            SendStep::Finished => {
                tracing::info!(receivers = options.receivers, "every file confirmed");
                break Ok(());
            },
            SendStep::Failed(reason) => break Err(CliError::Failed(reason)),
        }
    };

    if tracker.room().is_some() {
        let _ = session.leave_room();
    }
    session.shutdown().await?;
    outcome
}

fn log_event(event: &TransferEvent) {
    match event {
        TransferEvent::Connected { participant_id } => {
            tracing::info!(participant_id, "connected to relay");
        },
        TransferEvent::SendProgress { file_index, progress, .. } => {
            tracing::debug!(file_index, progress, "sending");
        },
        TransferEvent::FileConfirmed { file_index, recipient, confirmations, .. } => {
            tracing::info!(file_index, recipient, confirmations, "file confirmed");
        },
        TransferEvent::Error { code, message } => tracing::warn!(code, "{message}"),
        TransferEvent::Disconnected { reason } => tracing::warn!("disconnected: {reason}"),
        _ => tracing::trace!(?event),
    }
}
