//! Error kinds callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context attached; these
//! are the root causes that can be recovered with `downcast_ref`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::pipe::PipeError;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The key's extension does not name a supported compression codec.
    #[error("unknown extension for {key}")]
    UnsupportedCodec { key: String },

    /// A walked node collapsed to an empty archive name.
    #[error("unexpected path: {}", path.display())]
    UnexpectedPath { path: PathBuf },

    /// An archive entry name that cannot be mapped under the target root.
    #[error("incorrect path in archive entry: {name:?}")]
    InvalidEntryName { name: String },

    #[error("transfer cancelled")]
    Cancelled,

    /// A sequential sink received a write that was not contiguous.
    #[error("non-sequential write: expected offset {expected}, got {got}")]
    NonSequentialWrite { expected: u64, got: u64 },

    #[error("no such key: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    #[error("invalid object key: {key:?}")]
    InvalidKey { key: String },

    #[error("missing configuration value: {field}")]
    MissingConfig { field: &'static str },
}

// Never map to `Interrupted`: `io::copy` retries those forever.
impl From<TransferError> for io::Error {
    fn from(err: TransferError) -> Self {
        let kind = match err {
            TransferError::NonSequentialWrite { .. } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Finds a `TransferError` anywhere in the chain, including one wrapped
/// inside an `io::Error` by a codec or the tar layer.
pub fn find_transfer_error(err: &anyhow::Error) -> Option<&TransferError> {
    err.chain().find_map(|cause| {
        cause.downcast_ref::<TransferError>().or_else(|| {
            cause
                .downcast_ref::<io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<TransferError>())
        })
    })
}

/// Finds a `PipeError` anywhere in the chain.
pub fn find_pipe_error(err: &anyhow::Error) -> Option<&PipeError> {
    err.chain().find_map(|cause| {
        cause.downcast_ref::<PipeError>().or_else(|| {
            cause
                .downcast_ref::<io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<PipeError>())
        })
    })
}

/// True when the error is, or was caused by, a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(find_transfer_error(err), Some(TransferError::Cancelled))
        || matches!(find_pipe_error(err), Some(PipeError::Cancelled))
}
