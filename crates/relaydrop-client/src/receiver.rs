//! Receiver side of a transfer.
//!
//! Every chunk goes through the [`ChunkStore`] before anything else happens:
//! a chunk counts toward progress only after `put_chunk` returns `Ok`, and a
//! failed write is remembered and re-requested on the next tick.
//!
//! Only chunk indexes inside the current manifest count. Chunks left in the
//! store under another manifest are purged at join, found by comparing the
//! stored manifest fingerprint.
//!
//! Confirmation is sent once per file per join. A rejoin (after reconnect or
//! a sender reattach) starts a fresh round, so a confirmation lost with the
//! old connection is sent again.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
};

use bytes::{Bytes, BytesMut};
use relaydrop_core::{
    FileDescriptor, RoomCode, TransferError, TransferManifest,
    progress::{aggregate_progress, file_progress, is_complete},
};
use relaydrop_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::{
        room::FileEntry,
        transfer::{ConfirmFileReceived, ReceiveChunk, RequestMissingChunks},
    },
};

use crate::{
    error::ClientError,
    event::{ClientAction, LogLevel, TransferEvent},
    store::{ChunkStore, StoreError},
};

/// Drives the receiver role for one room.
pub struct ReceiverCoordinator<S: ChunkStore> {
    store: S,
    room: RoomCode,
    /// `None` until the first `file_list`
    manifest: Option<TransferManifest>,
    /// Files confirmed during the current join
    confirmed: BTreeSet<u32>,
    /// Chunks whose write failed, by file
    failed_writes: BTreeMap<u32, BTreeSet<u32>>,
    /// Stored in-range chunks per file, read at join and updated on each
    /// successful write
    held: Vec<BTreeSet<u32>>,
    closed: bool,
}

impl<S: ChunkStore> ReceiverCoordinator<S> {
    /// Receiver for `room`, storing into `store`.
    pub fn new(store: S, room: RoomCode) -> Self {
        Self {
            store,
            room,
            manifest: None,
            confirmed: BTreeSet::new(),
            failed_writes: BTreeMap::new(),
            held: Vec::new(),
            closed: false,
        }
    }

    /// Room being received.
    pub fn room(&self) -> &RoomCode {
        &self.room
    }

    /// Manifest, once the relay has delivered it.
    pub fn manifest(&self) -> Option<&TransferManifest> {
        self.manifest.as_ref()
    }

    /// The relay closed the room.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle a `file_list`: adopt the manifest and request what is missing.
    ///
    /// For each file, complete files are confirmed and the rest get a
    /// `request_missing_chunks` listing the indexes already held. If the
    /// store's manifest fingerprint for the room is missing or different,
    /// the room code was reused for another transfer (or the chunks predate
    /// the fingerprint) and the room is purged first.
    pub fn on_joined_room(&mut self, files: &[FileEntry]) -> Result<Vec<ClientAction>, ClientError> {
        let manifest = TransferManifest::from_entries(files)?;
        let mut actions = Vec::new();

        let fingerprint = manifest.fingerprint();
        if self.store.manifest_fingerprint(&self.room)?.as_deref() != Some(fingerprint.as_slice()) {
            let purged = self.store.purge_room(&self.room)?;
            if purged > 0 {
                actions.push(log(
                    LogLevel::Warn,
                    format!("room {} manifest changed, purged {purged} stale chunks", self.room),
                ));
            }
            self.store.set_manifest_fingerprint(&self.room, &fingerprint)?;
        }

        self.manifest = Some(manifest.clone());
        self.confirmed.clear();
        self.failed_writes.clear();
        self.held.clear();
        self.closed = false;

        for file in manifest.files() {
            let held = held_chunks(&self.store, &self.room, file)?;
            self.held.push(held.iter().copied().collect());

            if is_complete(file, held.len() as u32) {
                actions.extend(self.confirm(file.index)?);
            } else {
                actions.push(ClientAction::Send(self.request_missing(file.index, held)?));
            }
        }

        let progress = aggregate_progress(&manifest, |i| self.held_count(i));

        actions.insert(0, ClientAction::Notify(TransferEvent::Joined {
            room: self.room.clone(),
            manifest: manifest.clone(),
            progress,
        }));

        if self.confirmed.len() == manifest.len() {
            actions.push(ClientAction::Notify(TransferEvent::TransferComplete {
                room: self.room.clone(),
            }));
        }

        Ok(actions)
    }

    /// Handle a `receive_chunk`.
    ///
    /// Chunks for another room, before the manifest, with unknown indexes or
    /// with the wrong length are logged and dropped. A store failure is
    /// logged and the chunk re-requested on the next tick.
    pub fn on_chunk_received(&mut self, chunk: &ReceiveChunk) -> Result<Vec<ClientAction>, ClientError> {
        let file = match self.validate(chunk) {
            Ok(file) => file.clone(),
            Err(reason) => {
                return Ok(vec![log(
                    LogLevel::Warn,
                    format!(
                        "dropping chunk {}/{} for room {}: {reason}",
                        chunk.file_index, chunk.chunk_index, chunk.room
                    ),
                )]);
            },
        };

        if let Err(e) = self.store.put_chunk(&self.room, file.index, chunk.chunk_index, &chunk.chunk) {
            self.failed_writes.entry(file.index).or_default().insert(chunk.chunk_index);
            return Ok(vec![log(
                LogLevel::Warn,
                format!("storing chunk {}/{} failed: {e}", file.index, chunk.chunk_index),
            )]);
        }

        if let Some(failed) = self.failed_writes.get_mut(&file.index) {
            failed.remove(&chunk.chunk_index);
        }
        if let Some(held) = self.held.get_mut(file.index as usize) {
            held.insert(chunk.chunk_index);
        }

        let received = self.held_count(file.index);
        let aggregate = self
            .manifest
            .as_ref()
            .map_or(0.0, |manifest| aggregate_progress(manifest, |i| self.held_count(i)));
        let mut actions = vec![ClientAction::Notify(TransferEvent::FileProgress {
            room: self.room.clone(),
            file_index: file.index,
            progress: file_progress(&file, received),
            aggregate,
        })];

        if is_complete(&file, received) && !self.confirmed.contains(&file.index) {
            actions.extend(self.confirm(file.index)?);

            if self.manifest.as_ref().is_some_and(|m| self.confirmed.len() == m.len()) {
                actions.push(ClientAction::Notify(TransferEvent::TransferComplete {
                    room: self.room.clone(),
                }));
            }
        }

        Ok(actions)
    }

    /// Re-request chunks whose write failed.
    pub fn on_tick(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        if self.closed || self.manifest.is_none() {
            return Ok(Vec::new());
        }

        let files: Vec<u32> = std::mem::take(&mut self.failed_writes)
            .into_iter()
            .filter(|(_, chunks)| !chunks.is_empty())
            .map(|(file_index, _)| file_index)
            .collect();

        let mut actions = Vec::with_capacity(files.len());
        for file_index in files {
            let Some(file) = self.manifest.as_ref().and_then(|m| m.file(file_index)) else {
                continue;
            };
            let held = held_chunks(&self.store, &self.room, file)?;
            actions.push(ClientAction::Send(self.request_missing(file_index, held)?));
        }

        Ok(actions)
    }

    /// The relay destroyed the room. Stored chunks stay until [`Self::leave`].
    pub fn on_room_closed(&mut self, reason: &str) -> Vec<ClientAction> {
        self.closed = true;
        vec![ClientAction::Notify(TransferEvent::RoomClosed {
            room: self.room.clone(),
            reason: reason.to_string(),
        })]
    }

    /// Purge every stored chunk of this room. Returns the number removed.
    pub fn leave(&mut self) -> Result<usize, ClientError> {
        let purged = self.store.purge_room(&self.room)?;
        self.held.clear();
        self.closed = true;
        Ok(purged)
    }

    /// Progress of one file from the store. 0 before the manifest is known.
    pub fn file_progress(&self, file_index: u32) -> Result<f64, ClientError> {
        let Some(file) = self.manifest.as_ref().and_then(|m| m.file(file_index)) else {
            return Ok(0.0);
        };
        Ok(file_progress(file, held_chunks(&self.store, &self.room, file)?.len() as u32))
    }

    /// Mean progress over the manifest. 0 before the manifest is known.
    pub fn aggregate_progress(&self) -> Result<f64, ClientError> {
        let Some(manifest) = &self.manifest else {
            return Ok(0.0);
        };

        let counts = manifest
            .files()
            .iter()
            .map(|f| held_chunks(&self.store, &self.room, f).map(|held| held.len() as u32))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(aggregate_progress(manifest, |i| counts.get(i as usize).copied().unwrap_or(0)))
    }

    /// Whether every chunk of `file_index` is stored.
    pub fn is_file_complete(&self, file_index: u32) -> Result<bool, ClientError> {
        let file = self.require_manifest()?.require_file(file_index)?;
        Ok(is_complete(file, held_chunks(&self.store, &self.room, file)?.len() as u32))
    }

    /// Concatenate a complete file's chunks in ascending order.
    ///
    /// # Errors
    ///
    /// `TransferError::IncompleteFile` if any chunk is missing.
    pub fn assemble_file(&self, file_index: u32) -> Result<Bytes, ClientError> {
        let file = self.require_manifest()?.require_file(file_index)?;
        let total = file.total_chunks();
        let mut chunks = self.store.load_file(&self.room, file_index)?;
        chunks.retain(|(chunk_index, _)| *chunk_index < total);

        if chunks.len() < total as usize {
            return Err(TransferError::IncompleteFile {
                file_index,
                received: chunks.len() as u32,
                total,
            }
            .into());
        }

        let mut out = BytesMut::with_capacity(chunks.iter().map(|(_, payload)| payload.len()).sum());
        for (_, payload) in chunks {
            out.extend_from_slice(&payload);
        }

        if out.len() as u64 != file.byte_size {
            return Err(StoreError::Corrupted(format!(
                "file {file_index} assembled to {} bytes, expected {}",
                out.len(),
                file.byte_size
            ))
            .into());
        }

        Ok(out.freeze())
    }

    /// Stream a complete file to `out`. Returns the bytes written.
    pub fn write_file(&self, file_index: u32, out: &mut impl Write) -> Result<u64, ClientError> {
        let file = self.require_manifest()?.require_file(file_index)?;
        write_stored_file(&self.store, &self.room, file, out)
    }

    fn held_count(&self, file_index: u32) -> u32 {
        self.held.get(file_index as usize).map_or(0, |held| held.len() as u32)
    }

    fn require_manifest(&self) -> Result<&TransferManifest, ClientError> {
        self.manifest
            .as_ref()
            .ok_or_else(|| ClientError::InvalidState(format!("no manifest for room {}", self.room)))
    }

    fn validate(&self, chunk: &ReceiveChunk) -> Result<&FileDescriptor, String> {
        if chunk.room != self.room.as_str() {
            return Err(format!("not our room ({})", self.room));
        }

        let Some(manifest) = &self.manifest else {
            return Err("manifest not received yet".to_string());
        };

        manifest.check_chunk(chunk.file_index, chunk.chunk_index).map_err(|e| e.to_string())?;
        let file = manifest.require_file(chunk.file_index).map_err(|e| e.to_string())?;

        let expected = file.chunk_len(chunk.chunk_index).unwrap_or(0);
        if chunk.chunk.len() != expected {
            return Err(format!("length {} != expected {expected}", chunk.chunk.len()));
        }

        Ok(file)
    }

    fn confirm(&mut self, file_index: u32) -> Result<Vec<ClientAction>, ClientError> {
        if !self.confirmed.insert(file_index) {
            return Ok(Vec::new());
        }

        let frame = Payload::ConfirmFileReceived(ConfirmFileReceived {
            room: self.room.to_string(),
            file_index,
        })
        .into_frame(FrameHeader::new(Opcode::ConfirmFileReceived))?;

        Ok(vec![
            ClientAction::Send(frame),
            ClientAction::Notify(TransferEvent::FileComplete { room: self.room.clone(), file_index }),
        ])
    }

    fn request_missing(&self, file_index: u32, held: Vec<u32>) -> Result<Frame, ClientError> {
        Ok(Payload::RequestMissingChunks(RequestMissingChunks {
            room: self.room.to_string(),
            file_index,
            received_indexes: held,
        })
        .into_frame(FrameHeader::new(Opcode::RequestMissingChunks))?)
    }
}

impl<S: ChunkStore> std::fmt::Debug for ReceiverCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverCoordinator")
            .field("room", &self.room)
            .field("files", &self.manifest.as_ref().map(TransferManifest::len))
            .field("confirmed", &self.confirmed)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Stored chunk indexes of `file` inside its chunk range, ascending.
fn held_chunks<S: ChunkStore>(
    store: &S,
    room: &RoomCode,
    file: &FileDescriptor,
) -> Result<Vec<u32>, StoreError> {
    let total = file.total_chunks();
    let mut held = store.chunk_indexes(room, file.index)?;
    held.retain(|chunk_index| *chunk_index < total);
    Ok(held)
}

/// Stream the stored chunks of `file` to `out` in ascending order.
///
/// Reads one chunk at a time, so the file never has to fit in memory.
///
/// # Errors
///
/// - `TransferError::IncompleteFile` if any chunk is missing, checked before
///   anything is written
/// - `StoreError::Corrupted` if the chunks add up to anything but
///   `file.byte_size`
pub fn write_stored_file<S: ChunkStore>(
    store: &S,
    room: &RoomCode,
    file: &FileDescriptor,
    out: &mut impl Write,
) -> Result<u64, ClientError> {
    let total = file.total_chunks();
    let received = held_chunks(store, room, file)?.len() as u32;
    if received < total {
        return Err(TransferError::IncompleteFile { file_index: file.index, received, total }.into());
    }

    let mut written = 0u64;
    for chunk_index in 0..total {
        let payload = store.load_chunk(room, file.index, chunk_index)?.ok_or_else(|| {
            StoreError::NotFound(format!("room {room} file {} chunk {chunk_index}", file.index))
        })?;
        out.write_all(&payload)?;
        written += payload.len() as u64;
    }
    out.flush()?;

    if written != file.byte_size {
        return Err(StoreError::Corrupted(format!(
            "file {} wrote {written} bytes, expected {}",
            file.index, file.byte_size
        ))
        .into());
    }

    Ok(written)
}

fn log(level: LogLevel, message: String) -> ClientAction {
    ClientAction::Log { level, message }
}
