//! Error taxonomy for the transfer engine.

use std::io;
use std::path::PathBuf;

use crate::transfer::pipeline::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    // Precondition failures, raised before any network I/O.
    #[error("source file not found: {}", .0.display())]
    MissingSource(PathBuf),

    #[error("empty path")]
    EmptyPath,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    // Transport failures.
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(io::Error),

    // Wire-level failures.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rejected by receiver: {0}")]
    Rejected(String),

    // Integrity and cryptography.
    #[error("integrity check failed for {file_name}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        file_name: String,
        expected: String,
        actual: String,
    },

    #[error("decryption failed: {0}")]
    Decryption(#[from] CryptoError),

    #[error("resume state error: {0}")]
    ResumeState(String),

    #[error("{failed} of {total} files failed, first error: {first}")]
    Batch {
        failed: usize,
        total: usize,
        first: String,
    },
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        // Decoders surface cipher failures through io::Error; unwrap them here
        // so callers can tell a bad password from a broken socket.
        if err
            .get_ref()
            .is_some_and(|inner| inner.downcast_ref::<CryptoError>().is_some())
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(crypto) = inner.downcast::<CryptoError>() {
                    return TransferError::Decryption(*crypto);
                }
            }
            return TransferError::Decryption(CryptoError::Authentication);
        }
        TransferError::Io(err)
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Protocol(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransferError::Io(io::Error::other(err))
    }
}
