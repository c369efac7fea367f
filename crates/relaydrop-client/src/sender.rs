//! Sender side of a transfer.
//!
//! Emission is windowed: chunks wait in a queue and leave it only while the
//! bytes handed to the transport but not yet reported flushed stay within
//! [`SenderConfig::window_bytes`]. The runtime reports each flush with
//! [`SenderCoordinator::chunk_flushed`], which opens the window again.
//!
//! Resends are receiver-driven. A [`SenderCoordinator::handle_missing_chunks_request`]
//! queues exactly the complement of what the receiver holds, addressed to that
//! receiver only.

use std::collections::{BTreeSet, HashSet, VecDeque};

use relaydrop_core::{
    CHUNK_SIZE, ConfirmationAggregator, RoomCode, TransferError, TransferManifest,
    progress::file_progress,
};
use relaydrop_proto::{FrameHeader, Opcode, Payload, payloads::transfer::ChunkTransfer};

use crate::{
    error::ClientError,
    event::{ClientAction, LogLevel, TransferEvent},
    source::FileSource,
};

/// Default window: eight chunks in flight.
pub const DEFAULT_WINDOW_BYTES: u64 = 8 * CHUNK_SIZE;

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum chunk bytes handed to the transport and not yet flushed.
    pub window_bytes: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self { window_bytes: DEFAULT_WINDOW_BYTES }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct QueuedChunk {
    /// `None` fans out to every receiver
    recipient: Option<u64>,
    file_index: u32,
    chunk_index: u32,
}

/// Drives the sender role for one room.
pub struct SenderCoordinator<F: FileSource> {
    room: RoomCode,
    manifest: TransferManifest,
    source: F,
    config: SenderConfig,
    queue: VecDeque<QueuedChunk>,
    /// Set of queued entries, for dedup
    queued: HashSet<QueuedChunk>,
    outstanding: u64,
    /// Distinct chunk indexes emitted per file
    emitted: Vec<BTreeSet<u32>>,
    confirmations: ConfirmationAggregator,
}

impl<F: FileSource> SenderCoordinator<F> {
    /// Build the manifest from `source` and prepare to share it in `room`.
    ///
    /// # Errors
    ///
    /// `TransferError::InvalidManifest` if the source has no files.
    pub fn new(room: RoomCode, source: F, config: SenderConfig) -> Result<Self, ClientError> {
        let manifest = TransferManifest::from_specs(&source.specs())?;
        let emitted = vec![BTreeSet::new(); manifest.len()];

        Ok(Self {
            room,
            manifest,
            source,
            config,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            outstanding: 0,
            emitted,
            confirmations: ConfirmationAggregator::new(),
        })
    }

    /// Room this coordinator shares into.
    pub fn room(&self) -> &RoomCode {
        &self.room
    }

    /// Move to a different code. Only meaningful before the relay has
    /// accepted the room.
    pub(crate) fn set_room(&mut self, room: RoomCode) {
        self.room = room;
    }

    /// Manifest derived from the source.
    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    /// Receivers' confirmations so far.
    pub fn confirmations(&self) -> &ConfirmationAggregator {
        &self.confirmations
    }

    /// Chunks waiting for window space.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Bytes emitted and not yet reported flushed.
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding
    }

    /// Queue every chunk of every file, ascending, for all receivers.
    ///
    /// Returns the number of chunks queued. Chunks already queued for
    /// broadcast are not queued twice.
    pub fn start_transfer(&mut self) -> usize {
        let mut count = 0;
        for file in self.manifest.files() {
            for chunk_index in 0..file.total_chunks() {
                let entry =
                    QueuedChunk { recipient: None, file_index: file.index, chunk_index };
                if self.queued.insert(entry) {
                    self.queue.push_back(entry);
                    count += 1;
                }
            }
        }
        count
    }

    /// Queue the chunks of `file_index` that `recipient` does not hold.
    ///
    /// `missing = {0..totalChunks-1} \ received`, ascending. A chunk already
    /// waiting for broadcast or already queued for this recipient is skipped.
    ///
    /// # Errors
    ///
    /// `TransferError::UnknownFileIndex` if the file is not in the manifest.
    pub fn handle_missing_chunks_request(
        &mut self,
        file_index: u32,
        received: &[u32],
        recipient: u64,
    ) -> Result<usize, ClientError> {
        let missing = self.manifest.require_file(file_index)?.missing_chunks(received);

        let mut count = 0;
        for chunk_index in missing {
            let broadcast = QueuedChunk { recipient: None, file_index, chunk_index };
            let targeted = QueuedChunk { recipient: Some(recipient), ..broadcast };

            if self.queued.contains(&broadcast) || !self.queued.insert(targeted) {
                continue;
            }

            self.queue.push_back(targeted);
            count += 1;
        }

        Ok(count)
    }

    /// Dequeue as many chunks as the window allows and build their frames.
    ///
    /// One chunk always goes out when nothing is outstanding, so a window
    /// smaller than a chunk still makes progress. Each emitted chunk yields a
    /// [`ClientAction::SendChunk`]; a [`TransferEvent::SendProgress`] follows
    /// for each file that advanced.
    ///
    /// A chunk the source cannot read is reported through a log and a
    /// [`TransferEvent::Error`] and dropped; the receiver re-requests it on
    /// its next join.
    pub fn poll_chunks(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        let mut actions = Vec::new();
        let mut advanced = BTreeSet::new();

        while let Some(next) = self.queue.front().copied() {
            let file = self.manifest.require_file(next.file_index)?;
            let range = file.chunk_range(next.chunk_index).ok_or(
                TransferError::UnknownChunkIndex {
                    file_index: next.file_index,
                    chunk_index: next.chunk_index,
                    total: file.total_chunks(),
                },
            )?;
            let len = range.end - range.start;

            if self.outstanding > 0 && self.outstanding + len > self.config.window_bytes {
                break;
            }

            self.queue.pop_front();
            self.queued.remove(&next);

            let chunk = match self.source.read_range(next.file_index, range) {
                Ok(chunk) => chunk,
                Err(e) => {
                    let message =
                        format!("reading chunk {}/{} failed: {e}", next.file_index, next.chunk_index);
                    actions.push(ClientAction::Log { level: LogLevel::Error, message: message.clone() });
                    actions.push(ClientAction::Notify(TransferEvent::Error { code: 0, message }));
                    continue;
                },
            };
            let frame = Payload::ChunkTransfer(ChunkTransfer {
                room: self.room.to_string(),
                file_index: next.file_index,
                chunk_index: next.chunk_index,
                chunk,
                recipient: next.recipient,
            })
            .into_frame(FrameHeader::new(Opcode::ChunkTransfer))?;

            self.outstanding += len;
            if let Some(emitted) = self.emitted.get_mut(next.file_index as usize)
                && emitted.insert(next.chunk_index)
            {
                advanced.insert(next.file_index);
            }

            actions.push(ClientAction::SendChunk { frame, bytes: len });
        }

        for file_index in advanced {
            actions.push(ClientAction::Notify(TransferEvent::SendProgress {
                room: self.room.clone(),
                file_index,
                progress: self.send_progress(file_index),
            }));
        }

        Ok(actions)
    }

    /// The transport wrote `bytes` of chunk data.
    pub fn chunk_flushed(&mut self, bytes: u64) {
        self.outstanding = self.outstanding.saturating_sub(bytes);
    }

    /// Drop queued chunks and release the window after a disconnect.
    ///
    /// Receivers request their complement again once the sender reattaches.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.queued.clear();
        self.outstanding = 0;
    }

    /// Forget every confirmation. The relay replays the ones it holds when
    /// the sender reattaches.
    pub fn clear_confirmations(&mut self) {
        self.confirmations.clear();
    }

    /// Percentage of a file's distinct chunks emitted at least once.
    pub fn send_progress(&self, file_index: u32) -> f64 {
        match (self.manifest.file(file_index), self.emitted.get(file_index as usize)) {
            (Some(file), Some(emitted)) => file_progress(file, emitted.len() as u32),
            _ => 0.0,
        }
    }

    /// Record that `recipient` holds all of `file_index`. Returns how many
    /// distinct receivers have confirmed the file.
    ///
    /// # Errors
    ///
    /// `TransferError::UnknownFileIndex` if the file is not in the manifest.
    pub fn record_confirmation(
        &mut self,
        file_index: u32,
        recipient: u64,
    ) -> Result<usize, ClientError> {
        self.manifest.require_file(file_index)?;
        Ok(self.confirmations.record_confirmation(file_index, recipient))
    }
}

impl<F: FileSource> std::fmt::Debug for SenderCoordinator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderCoordinator")
            .field("room", &self.room)
            .field("files", &self.manifest.len())
            .field("queued", &self.queue.len())
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}
