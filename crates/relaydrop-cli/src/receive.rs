//! `relaydrop receive`: join a room and write its files to a directory.
//!
//! Chunks land in a durable [`RedbChunkStore`] first. A file is written out
//! as soon as every chunk of it is stored; when the whole manifest is on disk
//! the room is left, which purges the stored chunks. An interrupted receive
//! keeps its store, so running the same command again resumes.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use relaydrop_client::{
    MemorySource, RedbChunkStore, RoomCode, TransferEvent, TransferManifest,
    session::{Session, SessionConfig, SessionHandle},
};
use relaydrop_core::FileDescriptor;
use relaydrop_proto::payloads::ErrorPayload;
use tokio::sync::broadcast::{Receiver, error::RecvError};

use crate::{CliError, output};

/// How long to wait for the relay to acknowledge a leave.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for [`run_receive`].
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Room to join
    pub room: RoomCode,
    /// Directory the files are written to
    pub out: PathBuf,
    /// Chunk store location. Defaults to a hidden file in `out` that is
    /// removed after a complete transfer.
    pub store: Option<PathBuf>,
}

impl ReceiveOptions {
    /// Default store path for `room` under `out`.
    pub fn default_store_path(out: &Path, room: &RoomCode) -> PathBuf {
        out.join(format!(".relaydrop-{room}.redb"))
    }
}

/// What the receive loop should do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveStep {
    /// Every chunk of this file is stored; write it out.
    WriteFile(FileDescriptor),
    /// Every file has been handed out for writing.
    Finished,
    /// The room does not exist or closed before the transfer completed.
    Failed(String),
}

/// Follows one joined room and decides when each file can be written.
#[derive(Debug)]
pub struct ReceiveTracker {
    manifest: Option<TransferManifest>,
    written: BTreeSet<u32>,
    finished: bool,
}

impl ReceiveTracker {
    /// Tracker with no manifest yet.
    pub fn new() -> Self {
        Self { manifest: None, written: BTreeSet::new(), finished: false }
    }

    /// Manifest from the most recent join.
    pub fn manifest(&self) -> Option<&TransferManifest> {
        self.manifest.as_ref()
    }

    /// Apply one session event.
    pub fn observe(&mut self, event: &TransferEvent) -> Vec<ReceiveStep> {
        match event {
            TransferEvent::Joined { manifest, .. } => {
                self.manifest = Some(manifest.clone());
                Vec::new()
            },
            TransferEvent::FileComplete { file_index, .. } => {
                self.write(*file_index).map(ReceiveStep::WriteFile).into_iter().collect()
            },
            TransferEvent::TransferComplete { .. } if !self.finished => {
                let Some(manifest) = &self.manifest else {
                    return Vec::new();
                };
                let remaining: Vec<u32> = manifest
                    .files()
                    .iter()
                    .map(|f| f.index)
                    .filter(|i| !self.written.contains(i))
                    .collect();

                let mut steps: Vec<ReceiveStep> = remaining
                    .into_iter()
                    .filter_map(|i| self.write(i))
                    .map(ReceiveStep::WriteFile)
                    .collect();
                self.finished = true;
                steps.push(ReceiveStep::Finished);
                steps
            },
            TransferEvent::RoomClosed { room, reason } if !self.finished => {
                vec![ReceiveStep::Failed(format!("room {room} closed: {reason}"))]
            },
            TransferEvent::Error { code, message }
                if *code == ErrorPayload::ROOM_NOT_FOUND && self.manifest.is_none() =>
            {
                vec![ReceiveStep::Failed(format!("room not found: {message}"))]
            },
            _ => Vec::new(),
        }
    }

    fn write(&mut self, file_index: u32) -> Option<FileDescriptor> {
        let file = self.manifest.as_ref()?.file(file_index)?.clone();
        self.written.insert(file_index).then_some(file)
    }
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Join `options.room` through the relay in `config` and write every file
/// to `options.out`.
pub async fn run_receive(options: ReceiveOptions, config: SessionConfig) -> Result<(), CliError> {
    fs::create_dir_all(&options.out)?;
    let default_store = options.store.is_none();
    let store_path = options
        .store
        .clone()
        .unwrap_or_else(|| ReceiveOptions::default_store_path(&options.out, &options.room));

    let store = RedbChunkStore::open(&store_path)?;
    tracing::debug!(path = %store_path.display(), "chunk store opened");

    let session = Session::<RedbChunkStore, MemorySource>::spawn(store.clone(), config);
    let mut events = session.subscribe();
    session.join_room(options.room.clone())?;

    let mut tracker = ReceiveTracker::new();
    let outcome = 'events: loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(path = %store_path.display(), "interrupted, received chunks kept for resume");
                break Ok(false);
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
        for step in tracker.observe(&event) {
            match step {
                ReceiveStep::WriteFile(file) => {
                    if let Err(e) = output::write_file(&store, &options.room, &file, &options.out) {
                        break 'events Err(e);
                    }
                },
                ReceiveStep::Finished => {
                    tracing::info!(room = %options.room, "transfer complete");
                    break 'events Ok(true);
                },
                ReceiveStep::Failed(reason) => break 'events Err(CliError::Failed(reason)),
            }
        }
    };

    let complete = matches!(outcome, Ok(true));
    if complete {
        leave(&session, &mut events).await;
    }
    session.shutdown().await?;
    drop(store);

    if complete && default_store {
        fs::remove_file(&store_path)?;
    }
    outcome.map(|_| ())
}

/// Leave the room and wait briefly for the chunk purge to be reported.
async fn leave(session: &SessionHandle<MemorySource>, events: &mut Receiver<TransferEvent>) {
    if session.leave_room().is_err() {
        return;
    }

    let left = tokio::time::timeout(LEAVE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(TransferEvent::Left { purged, .. }) => return Some(purged),
                Ok(_) | Err(RecvError::Lagged(_)) => {},
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match left {
        Ok(Some(purged)) => tracing::debug!(purged, "left room"),
        Ok(None) | Err(_) => tracing::warn!("leave not acknowledged"),
    }
}

fn log_event(event: &TransferEvent) {
    match event {
        TransferEvent::Connected { participant_id } => {
            tracing::info!(participant_id, "connected to relay");
        },
        TransferEvent::Joined { room, manifest, progress } => {
            tracing::info!(
                room = %room,
                files = manifest.len(),
                bytes = manifest.total_bytes(),
                progress,
                "joined room"
            );
        },
        TransferEvent::FileProgress { file_index, progress, aggregate, .. } => {
            tracing::debug!(file_index, progress, aggregate, "receiving");
        },
        TransferEvent::FileComplete { file_index, .. } => tracing::info!(file_index, "file received"),
        TransferEvent::Error { code, message } => tracing::warn!(code, "{message}"),
        TransferEvent::Disconnected { reason } => tracing::warn!("disconnected: {reason}"),
        _ => tracing::trace!(?event),
    }
}
