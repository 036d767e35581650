//! Error taxonomy for the monitoring core.
//!
//! Fetch and notification failures are per-cycle and never end a monitor;
//! source failures are absorbed by the reconciler.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("invalid xpath {xpath:?}: {reason}")]
    InvalidXPath { xpath: String, reason: String },
    #[error("extraction task failed: {0}")]
    Worker(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {0}")]
    Status(u16),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_connect() {
            Self::Request(format!("connection failed: {err}"))
        } else {
            Self::Request(err.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid address {address:?}: {reason}")]
    Address { address: String, reason: String },
    #[error("could not build message: {0}")]
    Message(String),
    #[error("mail transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot read target file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed target file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid target in {path}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },
}
