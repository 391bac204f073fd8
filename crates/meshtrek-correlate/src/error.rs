//! Correlation error types
//!
//! [`DiscardReason`] is a normal outcome: the trace is dropped, counted and
//! the run continues. [`EngineError`] aborts a run.

use meshtrek_core::StoreError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which side of a hop a connection lookup was for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Downstream,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Downstream => write!(f, "downstream"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

/// Why a trace was dropped instead of written
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscardReason {
    #[error("no response fragment for stream {stream_id} in {service}")]
    MissingResponse { service: String, stream_id: u64 },

    #[error("no downstream connection fragment for connection {connection_id} in {service}")]
    MissingConnection { service: String, connection_id: u32 },

    #[error("no upstream connection fragment for connection {connection_id} in {service}")]
    MissingUpstreamConnection { service: String, connection_id: u32 },

    #[error("{count} HTTP/1 {side} connection fragments matched, at most 2 can be merged")]
    UnsupportedMultiConnection { side: Side, count: usize },

    #[error("trace has {found} hops, expected one of {expected:?}")]
    LengthMismatch { found: usize, expected: Vec<usize> },
}

impl DiscardReason {
    /// Missing-connection variant for the given side.
    pub fn missing_connection(side: Side, service: &str, connection_id: u32) -> Self {
        let service = service.to_string();
        match side {
            Side::Downstream => DiscardReason::MissingConnection {
                service,
                connection_id,
            },
            Side::Upstream => DiscardReason::MissingUpstreamConnection {
                service,
                connection_id,
            },
        }
    }

    /// Stable label used as the statistics key
    pub fn label(&self) -> &'static str {
        match self {
            DiscardReason::MissingResponse { .. } => "missing_response",
            DiscardReason::MissingConnection { .. } => "missing_connection",
            DiscardReason::MissingUpstreamConnection { .. } => "missing_upstream_connection",
            DiscardReason::UnsupportedMultiConnection { .. } => "unsupported_multi_connection",
            DiscardReason::LengthMismatch { .. } => "length_mismatch",
        }
    }
}

/// Errors that abort a correlation run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to list log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("entry file {0} not found")]
    EntryNotFound(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("trace sink failed: {0}")]
    Sink(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    pub fn sink<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EngineError::Sink(Box::new(err))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
