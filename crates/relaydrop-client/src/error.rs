//! Client error types.

use relaydrop_core::{ConnectionError, TransferError};
use relaydrop_proto::ProtocolError;
use thiserror::Error;

use crate::{source::SourceError, store::StoreError};

/// Errors returned by [`crate::Client::handle`] and the coordinators.
///
/// Most wire-level problems (chunks for the wrong room, unknown indexes) are
/// logged and dropped rather than returned; these errors mean the caller asked
/// for something impossible or a local resource failed.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Command not valid in the current role or connection state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transfer-level failure (room codes, manifests, incomplete files).
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Local chunk store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Sender file source failure.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Session layer failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Frame or payload encoding failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Writing an assembled file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Returns true if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transfer(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            Self::Connection(e) => e.is_transient(),
            _ => false,
        }
    }
}
