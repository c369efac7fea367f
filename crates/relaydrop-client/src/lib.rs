//! Client
//!
//! Action-based participant state machine for the RelayDrop protocol. A
//! participant is either the sender of a room (slices files into chunks and
//! answers resend requests) or one of its receivers (stores chunks durably,
//! tracks progress, requests what it is missing and confirms complete files).
//!
//! # Architecture
//!
//! The client follows the same Sans-IO and Action-Based patterns as
//! [`relaydrop_core`]. It receives events ([`ClientEvent`]), processes them
//! through pure state machine logic, and returns actions ([`ClientAction`]) for
//! the caller to execute. The only I/O below the runtime is the
//! [`ChunkStore`], which is synchronous: a chunk counts as received only once
//! the store has accepted it.
//!
//! # Components
//!
//! - [`Client`]: top-level state machine, one room role at a time
//! - [`SenderCoordinator`]: windowed chunk emission and targeted resends
//! - [`ReceiverCoordinator`]: storage, progress, resume and confirmation
//! - [`ChunkStore`]: durable chunk storage ([`RedbChunkStore`],
//!   [`MemoryChunkStore`], [`ChaoticChunkStore`])
//! - [`FileSource`]: sender file data ([`FsSource`], [`MemorySource`])
//!
//! # Transport (optional)
//!
//! With the `transport` feature enabled, this crate also provides:
//! - [`transport::connect`]: QUIC connection to a relay
//! - [`session::Session`]: per-participant runtime with reconnect and event
//!   subscription

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
mod error;
mod event;
mod receiver;
mod sender;
mod source;
mod store;

#[cfg(feature = "transport")]
pub mod session;
#[cfg(feature = "transport")]
pub mod transport;

pub use client::{Client, ClientConfig, MAX_CODE_RETRIES};
pub use error::ClientError;
pub use event::{ClientAction, ClientEvent, LogLevel, TransferEvent};
pub use receiver::{ReceiverCoordinator, write_stored_file};
pub use relaydrop_core::{Environment, RoomCode, SystemEnv, TransferManifest};
pub use sender::{DEFAULT_WINDOW_BYTES, SenderConfig, SenderCoordinator};
pub use source::{FileSource, FsSource, MemorySource, SourceError};
pub use store::{
    ChaoticChunkStore, ChunkStore, MemoryChunkStore, RedbChunkStore, StoreError,
};
