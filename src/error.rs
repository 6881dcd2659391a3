//! Error kinds the session pipeline distinguishes.
//!
//! Everything else in the crate travels as `anyhow::Error`.

use thiserror::Error;

/// A source could not be opened: missing file, undecodable container, busy or
/// missing device.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source {origin} unavailable: {reason}")]
    Unavailable { origin: String, reason: String },
}

impl SourceError {
    pub fn unavailable(origin: impl ToString, reason: impl ToString) -> Self {
        SourceError::Unavailable {
            origin: origin.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// The external detector raised. Fatal to the session.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("detector '{backend}' failed: {message}")]
    Backend { backend: String, message: String },
}

/// One frame failed to compress. The session skips it and carries on.
#[derive(Error, Debug)]
#[error("frame {sequence} could not be encoded: {reason}")]
pub struct EncodeError {
    pub sequence: u64,
    pub reason: String,
}

/// The client went away while a chunk was being written.
#[derive(Error, Debug)]
#[error("client disconnected: {0}")]
pub struct ClientDisconnected(#[from] pub std::io::Error);
