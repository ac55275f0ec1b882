//! Hotplug error types.

use std::io;

use thiserror::Error;
use trove_client::ClientError;

#[derive(Debug, Error)]
pub enum HotplugError {
    /// A mountinfo line did not have the expected shape.
    #[error("malformed mountinfo line {line}: {reason}")]
    Mountinfo { line: usize, reason: String },

    /// The server rejected or could not receive a report.
    #[error("report failed: {0}")]
    Report(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl HotplugError {
    pub fn mountinfo(line: usize, reason: impl Into<String>) -> Self {
        Self::Mountinfo {
            line,
            reason: reason.into(),
        }
    }
}

pub type HotplugResult<T> = Result<T, HotplugError>;
