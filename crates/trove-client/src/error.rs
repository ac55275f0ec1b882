//! Client error types.

use std::io;

use thiserror::Error;
use trove_types::{FaultKind, RemoteError};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server could not be reached within the retry budget.
    #[error("cannot reach server: {0}")]
    Connection(String),

    /// The server answered with a fault.
    #[error("server error: {0}")]
    Remote(#[from] RemoteError),

    /// The server sent something this client does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session ended while a request was outstanding.
    #[error("session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// The fault kind, with transport failures reported as `Connection`.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::Remote(e) => e.kind,
            Self::Connection(_) | Self::Closed | Self::Io(_) => FaultKind::Connection,
            Self::Protocol(_) => FaultKind::Internal,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
