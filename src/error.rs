use std::io;

use thiserror::Error;

use crate::models::dto::ErrorKind;

/// A record that cannot be applied. Dropped without touching graph state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record: {field} {reason}")]
pub struct MalformedRecord {
    pub field: &'static str,
    pub reason: String,
}

impl MalformedRecord {
    pub fn missing(field: &'static str) -> Self {
        Self {
            field,
            reason: "is missing".into(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Malformed(#[from] MalformedRecord),
    /// Fatal to the aggregator instance; it stays faulted until reset.
    #[error("aggregator invariant violated: {0}")]
    Invariant(String),
    #[error("aggregator is faulted ({0}); reset required")]
    Faulted(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("invalid source request: {0}")]
    InvalidRequest(String),
    /// Non-fatal: one record is lost, the source keeps running.
    #[error(transparent)]
    Malformed(#[from] MalformedRecord),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SourceError::Malformed(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SourceError::SourceUnavailable(_) | SourceError::Io(_) => ErrorKind::SourceUnavailable,
            SourceError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SourceError::Malformed(_) => ErrorKind::MalformedRecord,
        }
    }

    /// Message shown to viewers, phrased so they can act on it.
    pub fn remediation(&self) -> String {
        match self {
            SourceError::PermissionDenied(detail) => format!(
                "Permission denied ({detail}). Packet capture needs elevated privileges: \
                 run the server with sudo or grant the capture binary cap_net_raw."
            ),
            SourceError::SourceUnavailable(detail) => format!(
                "Failed to start packet capture ({detail}). Check the tshark installation \
                 and the interface name."
            ),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind {
        addr: std::net::SocketAddr,
        reason: String,
    },
    #[error("server stopped with error: {0}")]
    Serve(String),
}
