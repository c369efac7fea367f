//! Shared RelayDrop state machines and domain types.
//!
//! Everything here is pure: no sockets, no files. The relay and the client
//! both build on these pieces.
//!
//! - [`manifest`]: files, chunk counts and byte ranges
//! - [`room_code`]: validated room codes
//! - [`confirmation`]: per-file confirmation sets
//! - [`progress`]: progress as a function of stored chunks
//! - [`connection`]: Hello/Ping/Goodbye session layer
//! - [`env`]: time and randomness, swappable for simulation

pub mod confirmation;
pub mod connection;
pub mod env;
pub mod error;
pub mod manifest;
pub mod progress;
pub mod room_code;
mod system_env;

pub use confirmation::{ConfirmationAggregator, ConfirmationSet};
pub use env::Environment;
pub use error::{ConnectionError, TransferError};
pub use manifest::{CHUNK_SIZE, FileDescriptor, MAX_FILE_SIZE, TransferManifest};
pub use room_code::RoomCode;
pub use system_env::SystemEnv;
