//! Error types for the multiplexing engine.
//!
//! # Design
//! Binding, resolution and timeout failures are fatal to the batch being
//! dispatched and propagate to the caller. `UnsupportedScheme` is also raised
//! while building an Alt-Svc alternate connection, where the session recovers
//! from it locally and never surfaces it.

use std::time::Duration;

use thiserror::Error;

use crate::origin::Origin;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by connections, the pool and sessions.
#[derive(Debug, Error)]
pub enum Error {
    /// No channel could be bound for the origin.
    #[error("no channel available for {origin}: {reason}")]
    ConnectionUnavailable { origin: Origin, reason: String },

    /// The readiness wait expired while work was still pending.
    #[error("timed out after {timeout:?} waiting for data")]
    Timeout { timeout: Duration },

    /// The origin's scheme has no transport.
    #[error("{origin}: unsupported URI scheme")]
    UnsupportedScheme { origin: Origin },

    /// The caller handed in something unusable, e.g. an empty batch.
    #[error("usage error: {0}")]
    Usage(String),

    /// The pool went idle while responses were still outstanding.
    #[error("reactor stalled with {pending} response(s) outstanding")]
    Stalled { pending: usize },

    /// Hostname resolution failed.
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("invalid URI: {0}")]
    InvalidUri(#[from] url::ParseError),

    #[error("invalid options: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
