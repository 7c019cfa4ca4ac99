use crate::protocol::codec::{Opcode, Status};
use crate::transport::TransportError;
use thiserror::Error;

/// Convenient result type for `qdlflash-lib`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("manifest parse error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device rejected {command}: {status}")]
    Device { command: Opcode, status: Status },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timeout while {0}")]
    Timeout(String),

    #[error("unrecognized device: {0}")]
    UnrecognizedDevice(String),

    #[error("checksum mismatch for `{name}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for `{name}`: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("CRC mismatch: expected {expected:#010X}, got {actual:#010X}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("not enough storage space: {0}")]
    StorageSpace(String),

    #[error("download of `{url}` failed: {reason}")]
    Download { url: String, reason: String },

    #[error("partition table error: {0}")]
    PartitionTable(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("operation aborted")]
    Aborted,
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn partition_table(msg: impl Into<String>) -> Self {
        Self::PartitionTable(msg.into())
    }

    pub fn download(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Download {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Wraps an I/O error raised while staging image data, promoting
    /// "disk full" conditions to [`Error::StorageSpace`].
    pub fn storage(err: std::io::Error) -> Self {
        if crate::utils::Utils::is_storage_full(&err) {
            Self::StorageSpace(err.to_string())
        } else {
            Self::Io(err)
        }
    }

    /// True when the underlying cause is the device going away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Disconnected))
    }
}
