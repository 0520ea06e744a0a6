use std::fmt;

/// Main error type for the kestrel controller core
#[derive(Debug)]
pub enum KestrelError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Transport layer errors (socket setup, writes to closed channels)
    Transport(String),

    /// OpenFlow protocol violations (bad framing, unexpected messages,
    /// unsolicited or mismatched role replies)
    Protocol(String),

    /// Handshake failures and timeouts
    Handshake(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Errors surfaced by the external storage/sync collaborators
    Storage(String),

    /// Internal lock poisoning or queue errors
    Concurrency(String),
}

impl fmt::Display for KestrelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KestrelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KestrelError::Transport(msg) => write!(f, "Transport error: {}", msg),
            KestrelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KestrelError::Handshake(msg) => write!(f, "Handshake error: {}", msg),
            KestrelError::Io(err) => write!(f, "I/O error: {}", err),
            KestrelError::Storage(msg) => write!(f, "Storage error: {}", msg),
            KestrelError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
        }
    }
}

impl std::error::Error for KestrelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KestrelError::Io(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, KestrelError>;

// Conversions from common error types
impl From<std::io::Error> for KestrelError {
    fn from(err: std::io::Error) -> Self {
        KestrelError::Io(err)
    }
}

impl From<String> for KestrelError {
    fn from(err: String) -> Self {
        KestrelError::Config(err)
    }
}

impl KestrelError {
    /// Whether this error is fatal to the controller process. Only storage
    /// failures observed by the update loop terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KestrelError::Storage(_))
    }

    /// Get the error kind identifier
    pub fn error_kind(&self) -> &'static str {
        match self {
            KestrelError::Config(_) => "configuration_error",
            KestrelError::Transport(_) => "transport_error",
            KestrelError::Protocol(_) => "protocol_error",
            KestrelError::Handshake(_) => "handshake_error",
            KestrelError::Io(_) => "io_error",
            KestrelError::Storage(_) => "storage_error",
            KestrelError::Concurrency(_) => "concurrency_error",
        }
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::KestrelError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KestrelError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::KestrelError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KestrelError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($msg:expr) => {
        $crate::error::KestrelError::Protocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KestrelError::Protocol(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! handshake_error {
    ($msg:expr) => {
        $crate::error::KestrelError::Handshake($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KestrelError::Handshake(format!($fmt, $($arg)*))
    };
}
