// Common types for the streaming module

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur during streaming operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Source error: {0}")]
    Source(String),

    #[error("Session failed: {0}")]
    SessionFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not connected")]
    NotConnected,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Parse(e.to_string())
    }
}

/// Wall-clock time as fractional unix seconds
pub fn now_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_micros() as f64 / 1_000_000.0
}

/// Client-side connection lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// At least one valid message has been framed on this connection
    Streaming,
    /// Terminal for the current attempt; the owner may re-enter `Connecting`
    Failed,
}

impl ConnectionState {
    /// Whether `next` is a legal edge from `self`.
    ///
    /// Any state may drop to `Disconnected` (explicit stop).
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) | (Failed, Connecting) => true,
            (Connecting, Connected) | (Connecting, Failed) => true,
            (Connected, Streaming) | (Connected, Failed) => true,
            (Streaming, Failed) => true,
            _ => false,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single endpoint and where it currently is in its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub endpoint: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

impl Connection {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: ConnectionState::Disconnected,
            last_error: None,
        }
    }
}

/// Emitted on every connection state transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub endpoint: String,
    pub state: ConnectionState,
    /// Human-readable status line (e.g. the refusal reason)
    pub detail: Option<String>,
    pub timestamp: f64,
}
