use std::str::Utf8Error;

use thiserror::Error;

use crate::session::SessionId;

pub type Result<T> = std::result::Result<T, RegError>;

#[derive(Error, Debug)]
pub enum RegError {
    #[error("Could not connect to {0}: {1}")]
    ConnectFailed(String, String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Malformed bundle: {0}")]
    MalformedBundle(String),
    #[error("Invalid size header: {0:?}")]
    InvalidSizeHeader(String),
    #[error("Transfer ended after {received} of {announced} bytes")]
    TruncatedTransfer { received: u64, announced: u64 },
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),
    #[error("Session {0} is not ready for a response")]
    SessionNotReady(SessionId),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<Utf8Error> for RegError {
    fn from(e: Utf8Error) -> Self {
        Self::MalformedBundle(e.to_string())
    }
}

impl From<toml::de::Error> for RegError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RegError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::ConnectionError("operation timed out".to_owned())
    }
}
