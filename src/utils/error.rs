//! The `error` module defines the error type shared by every part of `popcast`.
//!
//! Errors fall into four groups: configuration errors (fatal at startup),
//! transport errors (Redis, WebSocket, I/O), protocol errors (a connection sent
//! something we cannot decode) and lifecycle errors (the broker or client was
//! already shut down).

use thiserror::Error;

/// Errors produced by brokers, clients, the transport and configuration.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Configuration could not be loaded or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration was loaded but failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Redis command or connection failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// WebSocket handshake or framing failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A consumer connection could not be written to.
    #[error("connection error: {0}")]
    Connection(String),

    /// A command or payload could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// A subscription pattern is not a valid glob.
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// The broker has been stopped and no longer accepts requests.
    #[error("broker is stopped")]
    Stopped,

    /// `serve` was called on a broker that is already serving (or has served).
    #[error("broker is already serving")]
    AlreadyServing,

    /// The client facade was closed.
    #[error("client is closed")]
    ClientClosed,
}

pub type Result<T> = std::result::Result<T, BroadcastError>;
