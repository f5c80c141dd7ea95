use std::time::Duration;
use thiserror::Error;

use publisher_signer::SignerError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("signer error: {0}")]
    Signer(#[from] SignerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid duration: {0}")]
    Duration(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("not authorized to query the registry, check the configured RegistryAuth")]
    Unauthorized,
    #[error("registry returned an error: {0}")]
    Rejected(String),
    #[error("failed to decode registry response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid auth header: {0}")]
    InvalidHeader(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("read failed: {0}")]
    Read(#[from] ReadError),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
}

/// Reasons a websocket read loop stops
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("timed out after {0:?} waiting for next message")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("non-text websocket message received")]
    NonText,
    #[error("transport error: {0}")]
    Transport(tokio_tungstenite::tungstenite::Error),
}

/// Write failures. The kinds only differ in how they are logged; every one
/// of them ends the write loop.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection reset: {0}")]
    Reset(String),
    #[error("write failed: {0}")]
    Other(String),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValueError {
    #[error("value cannot be an empty string")]
    EmptyString,
    #[error("failed to convert {0:?} to a decimal (magnitude limit is about 7.9e28)")]
    NotDecimal(String),
    #[error("unsupported type for value: {0}")]
    UnsupportedType(&'static str),
}
