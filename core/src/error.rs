use thiserror::Error;

/// Failure reported by the BLE transport collaborator.
///
/// Any of these on a write marks the owning session as closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bluetooth permission denied")]
    PermissionDenied,

    #[error("bluetooth adapter is off")]
    BluetoothOff,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("device disconnected")]
    Disconnected,
}

/// Why a file transfer ended without a complete file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    #[error("frame checksum retries exhausted after {retries} attempts")]
    ChecksumRetriesExhausted { retries: u32 },

    #[error("received {received} of {expected} bytes")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("remote cancelled the transfer")]
    RemoteCancelled,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("remote did not stage the file: {answer:?}")]
    NotStaged { answer: String },

    #[error("CRC32 mismatch: local {local:08x}, remote {remote:08x}")]
    CrcMismatch { local: u32, remote: u32 },
}

/// Error type for command transactions and transfers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No complete answer within the tag's budget. `partial` holds whatever
    /// arrived and is empty when the remote stayed silent.
    #[error("timeout waiting for {tag} answer ({} bytes received)", .partial.len())]
    Timeout { tag: String, partial: Vec<u8> },

    #[error("logger rejected {tag}: {answer}")]
    Protocol { tag: String, answer: String },

    #[error("unexpected {tag} answer: {answer:?}")]
    UnexpectedAnswer { tag: String, answer: String },

    #[error("transfer failed: {0}")]
    TransferFailed(#[from] TransferFailure),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("no hardware family matches device {address} ({name:?})")]
    UnsupportedDevice { address: String, name: String },

    #[error("session closed")]
    SessionClosed,
}

impl EngineError {
    /// Timeouts are the only outcome worth repeating unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }
}

/// Error raised while decoding a typed answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnswerError {
    #[error("malformed {tag} answer: {message}")]
    Malformed { tag: String, message: String },

    #[error("{tag} answer declares {declared} bytes but carries {actual}")]
    LengthMismatch {
        tag: String,
        declared: usize,
        actual: usize,
    },
}

impl AnswerError {
    pub fn tag(&self) -> &str {
        match self {
            AnswerError::Malformed { tag, .. } | AnswerError::LengthMismatch { tag, .. } => tag,
        }
    }
}

impl From<AnswerError> for EngineError {
    fn from(err: AnswerError) -> Self {
        EngineError::UnexpectedAnswer {
            tag: err.tag().to_string(),
            answer: err.to_string(),
        }
    }
}

/// Error type for configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
