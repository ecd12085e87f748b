use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plugin discovery failed: {0}")]
    Discovery(String),

    #[error("No route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error(
        "{} of {attempted} plugins failed to start (generation {generation} published): {}",
        failures.len(),
        failures.join("; ")
    )]
    ReloadPartialFailure {
        generation: u64,
        attempted: usize,
        failures: Vec<String>,
    },

    #[error("Failed to bind listener on {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Reasons a plugin process is refused before any RPC is attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no handshake line within {0:?}")]
    Timeout(Duration),

    #[error("plugin exited before completing the handshake")]
    ProcessExited,

    #[error("malformed handshake line: {0}")]
    Malformed(String),

    #[error("protocol version mismatch: expected {expected}, plugin speaks {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("magic cookie mismatch")]
    CookieMismatch,

    #[error("unsupported transport kind '{0}'")]
    UnsupportedTransport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Plugin reported an error: {0}")]
    Remote(String),

    /// Refused before anything was written; the channel is unaffected.
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
}

impl TransportError {
    /// Whether the failure says anything about the health of the channel itself.
    /// A remote error is a well-formed reply and an oversized frame is never
    /// sent, so both leave the plugin usable.
    pub fn is_channel_failure(&self) -> bool {
        !matches!(
            self,
            TransportError::Remote(_) | TransportError::FrameTooLarge { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("failed to spawn {path}: {reason}")]
    SpawnFailed { path: String, reason: String },

    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("route retrieval failed: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid route '{pattern}': {reason}")]
    InvalidRoute { pattern: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

impl warp::reject::Reject for HostError {}
