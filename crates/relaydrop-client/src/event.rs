//! Client events and actions.

use relaydrop_core::{RoomCode, TransferManifest};
use relaydrop_proto::Frame;

/// Events the caller feeds into the client.
///
/// The caller is responsible for:
/// - Reporting transport connects and disconnects
/// - Receiving frames from the network
/// - Reporting when chunk frames have been written (releases window space)
/// - Driving time forward via ticks
/// - Forwarding application commands
///
/// Generic over `F`, the [`crate::FileSource`] a sender shares files from.
#[derive(Debug)]
pub enum ClientEvent<F> {
    /// Transport is up. The client starts the handshake.
    Connected,

    /// Frame received from the relay.
    FrameReceived(Frame),

    /// A chunk frame returned in [`ClientAction::SendChunk`] was written.
    ChunkFlushed {
        /// The `bytes` value from that action.
        bytes: u64,
    },

    /// Transport lost. Room state is kept and replayed on the next connect.
    Disconnected {
        /// Why the transport went away.
        reason: String,
    },

    /// Time tick for timeouts, heartbeats and retries.
    Tick,

    /// Share the files of `source` in a new room.
    CreateRoom {
        /// Room code to use. A code is generated when `None`.
        room: Option<RoomCode>,
        /// File data for the manifest and every chunk.
        source: F,
    },

    /// Join an existing room as a receiver.
    JoinRoom {
        /// Room to join.
        room: RoomCode,
    },

    /// Start streaming every chunk to the room's receivers.
    StartTransfer,

    /// Leave the current room. A receiver purges its stored chunks.
    LeaveRoom,
}

/// Severity for [`ClientAction::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Actions the client produces for the caller to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Send a control frame to the relay.
    Send(Frame),

    /// Send a chunk frame. Report [`ClientEvent::ChunkFlushed`] with `bytes`
    /// once it has been written.
    SendChunk {
        /// Chunk frame
        frame: Frame,
        /// Window bytes this chunk occupies
        bytes: u64,
    },

    /// Deliver a transfer event to subscribers.
    Notify(TransferEvent),

    /// Log message.
    Log {
        /// Severity
        level: LogLevel,
        /// Message
        message: String,
    },

    /// Close the transport.
    Close {
        /// Reason for closing
        reason: String,
    },
}

/// Transfer progress and lifecycle, for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Handshake complete.
    Connected {
        /// Our stable participant id
        participant_id: u64,
    },

    /// The relay accepted our room.
    RoomCreated {
        /// Room code to share with receivers
        room: RoomCode,
    },

    /// Manifest received (on first join and every rejoin).
    Joined {
        /// Room joined
        room: RoomCode,
        /// Files in the room
        manifest: TransferManifest,
        /// Aggregate progress from chunks already held
        progress: f64,
    },

    /// Sender emitted chunks of a file.
    SendProgress {
        /// Room
        room: RoomCode,
        /// File index
        file_index: u32,
        /// Percentage of distinct chunks emitted
        progress: f64,
    },

    /// Receiver stored a chunk.
    FileProgress {
        /// Room
        room: RoomCode,
        /// File index
        file_index: u32,
        /// Percentage of this file held
        progress: f64,
        /// Mean progress over all files
        aggregate: f64,
    },

    /// Every chunk of a file is stored.
    FileComplete {
        /// Room
        room: RoomCode,
        /// File index
        file_index: u32,
    },

    /// Every file of the manifest is stored.
    TransferComplete {
        /// Room
        room: RoomCode,
    },

    /// A receiver confirmed a file.
    FileConfirmed {
        /// Room
        room: RoomCode,
        /// File index
        file_index: u32,
        /// Confirming receiver
        recipient: u64,
        /// Distinct receivers that have confirmed this file
        confirmations: usize,
    },

    /// The room was destroyed by the relay.
    RoomClosed {
        /// Room
        room: RoomCode,
        /// Reason given by the relay
        reason: String,
    },

    /// Error notice from the relay or a local failure.
    Error {
        /// Relay error code, 0 for local errors
        code: u16,
        /// Message
        message: String,
    },

    /// Transport lost.
    Disconnected {
        /// Why
        reason: String,
    },

    /// We left the room.
    Left {
        /// Room
        room: RoomCode,
        /// Stored chunks purged
        purged: usize,
    },
}
