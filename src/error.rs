//! Error types for wireplay
//!
//! Each pipeline stage has its own structured error domain; the top-level
//! [`WireplayError`] aggregates them so a single `Result` alias can flow
//! through the whole capture/replay pipeline.

use thiserror::Error;

/// Result type alias for wireplay operations
pub type Result<T> = std::result::Result<T, WireplayError>;

/// Structured wire-protocol error domain
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("message truncated: wanted {wanted} bytes, had {had}")]
    Truncated { wanted: usize, had: usize },
    #[error("unsupported compressor id: {0}")]
    UnsupportedCompressor(u8),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("{0}")]
    Message(String),
}

impl ProtocolError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn truncated(wanted: usize, had: usize) -> Self {
        Self::Truncated { wanted, had }
    }

    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for ProtocolError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Structured packet-capture error domain
#[derive(Debug, Error, Clone)]
pub enum CaptureError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("not a capture file: bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported link type: {0}")]
    UnsupportedLinkType(u32),
    #[error("{0}")]
    Message(String),
}

impl CaptureError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Structured playback-file error domain
#[derive(Debug, Error, Clone)]
pub enum PlaybackError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("unsupported playback file version: {0}")]
    UnsupportedVersion(i32),
    #[error("corrupt playback document: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Message(String),
}

impl PlaybackError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Structured replay/player error domain
#[derive(Debug, Error, Clone)]
pub enum PlayerError {
    #[error("connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },
    #[error("dispatch failed on connection {connection}: {detail}")]
    DispatchFailed { connection: u64, detail: String },
    #[error("{task}: {detail}")]
    TaskFailed { task: String, detail: String },
    #[error("{0}")]
    Message(String),
}

impl PlayerError {
    pub fn connect_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn dispatch_failed(connection: u64, detail: impl Into<String>) -> Self {
        Self::DispatchFailed {
            connection,
            detail: detail.into(),
        }
    }

    pub fn task_failed(task: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TaskFailed {
            task: task.into(),
            detail: detail.into(),
        }
    }
}

/// Main error type for wireplay
#[derive(Debug, Error)]
pub enum WireplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Player error: {0}")]
    Player(#[from] PlayerError),

    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Interrupted")]
    Interrupted,
}

impl WireplayError {
    /// Create a protocol error with operation context
    pub fn protocol(operation: &str, detail: impl Into<String>) -> Self {
        WireplayError::Protocol(ProtocolError::operation(operation, detail))
    }

    /// Create a capture error with operation context
    pub fn capture(operation: &str, detail: impl Into<String>) -> Self {
        WireplayError::Capture(CaptureError::operation(operation, detail))
    }

    /// Create a playback error with operation context
    pub fn playback(operation: &str, detail: impl Into<String>) -> Self {
        WireplayError::Playback(PlaybackError::operation(operation, detail))
    }

    /// Create a configuration error
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        WireplayError::Config(format!("{}: {}", setting, reason.into()))
    }

    /// True if this error should abort the whole run rather than skip one op
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireplayError::Io(_)
                | WireplayError::Capture(_)
                | WireplayError::Config(_)
                | WireplayError::Interrupted
        )
    }
}
