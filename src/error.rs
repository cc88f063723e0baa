//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize or deserialize: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Failed to serialize or deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cryptography error: {0}")]
    Crypto(#[from] ed25519_dalek::SignatureError),

    #[error("Invalid identity key file")]
    InvalidKeyFile,

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Failed to initiate connection to {0}: {1}")]
    ConnectFailed(SocketAddr, #[source] quinn::ConnectError),

    #[error("Connection to {0} failed during establishment: {1}")]
    ConnectionEstablishFailed(SocketAddr, #[source] quinn::ConnectionError),

    #[error("An established connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("Failed to write to network stream: {0}")]
    WriteStream(#[from] quinn::WriteError),

    #[error("API server error: {0}")]
    ApiServer(#[from] axum::Error),

    #[error("webhook delivery failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Structural problem with a write body. Surfaced to REST as 400.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Key absent or tombstoned. Surfaced to REST as 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Watcher creation conflict. Surfaced to REST as 409.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Backing-store write failed; the write is considered not accepted.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The engine's command channel was dropped (only on shutdown).
    #[error("engine is no longer running")]
    EngineGone,
}

impl Error {
    /// Maps a core error onto its REST status code.
    /// Returns `None` for error kinds that must never reach the REST layer
    /// (`Transport`, `Persistence`, and anything else, which are fatal or
    /// internally retried instead).
    pub fn rest_status(&self) -> Option<u16> {
        match self {
            Error::Validation(_) => Some(400),
            Error::NotFound(_) => Some(404),
            Error::AlreadyExists(_) => Some(409),
            _ => None,
        }
    }
}
