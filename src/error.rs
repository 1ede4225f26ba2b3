use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::connection::SessionState;

/// Errors reported synchronously to the caller, before or outside of an exchange.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Error occurred during I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error occurred during JSON serialization or deserialization.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed request input, detected before any connection is attempted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The configuration file could not be loaded.
    #[error("Config error in {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// Error related to the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A transport-layer fault that ended an exchange before a reply was captured.
///
/// This is carried inside [`crate::Outcome::TransportError`] rather than returned as an `Err`, so
/// that callers always receive exactly one terminal outcome per exchange.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connecting failed: refused, unreachable, or the host could not be resolved.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// The envelope could not be serialized.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Writing the request to the connection failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// The connection errored while waiting for the reply.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// No terminal event arrived within the caller-supplied deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The session already left `Idle`; sessions never reconnect.
    #[error("session already used (state: {0})")]
    Reused(SessionState),
}

pub type Result<T> = std::result::Result<T, RpcError>;
