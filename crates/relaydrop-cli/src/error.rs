//! CLI error type.

use relaydrop_client::{ClientError, SourceError, StoreError, session::SessionError};
use relaydrop_core::TransferError;
use thiserror::Error;

/// Errors that end a `relaydrop` command.
#[derive(Debug, Error)]
pub enum CliError {
    /// The session runtime failed or gave up reconnecting.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A file to send could not be opened.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The chunk store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Assembling a received file failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Invalid room code or manifest.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The relay announced a file name that is not a plain file name.
    #[error("refusing to write unsafe file name {0:?}")]
    UnsafeFileName(String),

    /// Writing output failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transfer ended without completing.
    #[error("transfer failed: {0}")]
    Failed(String),
}
