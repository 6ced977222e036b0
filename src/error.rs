use thiserror::Error;

/// Errors raised while decoding wire payloads or validating request fields
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Malformed or out-of-range request field
    #[error("Invalid parameter `{field}`: {message}")]
    InvalidParameter { field: &'static str, message: String },

    /// Codestream classification failed (no SOC marker found)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Frame buffer shorter than the fixed 9-byte header
    #[error("Frame too short: need at least {required} bytes, got {actual}")]
    FrameTooShort { required: usize, actual: usize },

    /// Declared payload length exceeds the buffered bytes
    #[error("Truncated frame payload: declared {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },

    /// Frame type byte outside the 0x01..=0x08 range
    #[error("Unknown frame type: 0x{0:02X}")]
    UnknownFrameType(u8),

    /// Data-bin class byte with no corresponding bin class
    #[error("Unknown bin class: {0}")]
    UnknownBinClass(u8),
}

/// Errors surfaced by the client transport
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Operation requires an open connection
    #[error("Not connected")]
    NotConnected,

    /// The peer or a local close completed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// No response arrived within the request timeout
    #[error("Request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Operation invoked in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Concurrent request limit reached
    #[error("Too many concurrent requests: limit is {max}")]
    TooManyRequests { max: usize },

    /// Reconnection gave up
    #[error("Max reconnect attempts reached ({attempts})")]
    MaxReconnectAttempts { attempts: u32 },

    /// Underlying channel failure or invalid response framing
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP fallback answered with a non-success status
    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    /// The server answered with an error frame
    #[error("Server error: {0}")]
    Server(String),

    /// Operation terminated by caller or state change
    #[error("Cancelled")]
    Cancelled,

    /// Wire payload could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors raised by session lifecycle operations
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// No session established yet
    #[error("No session")]
    NoSession,

    /// Channel id not registered with the server
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Session already closed
    #[error("Session is closed")]
    Closed,

    /// Operation invoked in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Errors answered by the server request engine
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// Server is not in the running state
    #[error("Server is not running")]
    NotRunning,

    /// Request priority queue at capacity
    #[error("Request queue full: capacity {capacity}")]
    QueueFull { capacity: usize },

    /// Bandwidth budget exhausted (maps to HTTP 503 with Retry-After)
    #[error("Throttled: retry after {retry_after_secs} s")]
    Throttled { retry_after_secs: u32 },

    /// Requested image is not registered
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// Request field validation failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Session prerequisite missing or broken
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Host did not plug in a required collaborator
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}

/// Errors from the persistent key-value store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Underlying filesystem or I/O failure
    #[error("Store I/O error: {0}")]
    Io(String),

    /// Key not present in the store
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Snapshot (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(err.to_string())
        } else {
            StoreError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
