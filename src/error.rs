use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Machine-readable failure classification shared by every public API.
///
/// Callers (and tests) branch on the code, never on the message text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Network,
    Persistence,
    Sync,
    Config,
    DatabaseCorruption,
    Timeout,
    Cancelled,
    RetryExhausted,
    AuthFailed,
    CryptoError,
    VersionMismatch,
    SecurityModeMismatch,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Network => "NETWORK_ERROR",
            ErrorCode::Persistence => "PERSISTENCE_ERROR",
            ErrorCode::Sync => "SYNC_ERROR",
            ErrorCode::Config => "CONFIG_ERROR",
            ErrorCode::DatabaseCorruption => "DATABASE_CORRUPTION",
            ErrorCode::Timeout => "TIMEOUT_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::CryptoError => "CRYPTO_ERROR",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
            ErrorCode::SecurityModeMismatch => "SECURITY_MODE_MISMATCH",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether the retry policy may re-attempt an operation failing with this code.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::Network | ErrorCode::Timeout | ErrorCode::Persistence
        )
    }
}

#[derive(Clone, Debug)]
pub struct EntglError {
    pub code: ErrorCode,
    message: String,
    source: Option<Arc<EntglError>>,
}

impl EntglError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(code: ErrorCode, message: impl Into<String>, source: EntglError) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }

    /// The error that exhausted the retry policy, when this is `RETRY_EXHAUSTED`.
    pub fn cause(&self) -> Option<&EntglError> {
        self.source.as_deref()
    }
}

impl Display for EntglError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for EntglError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|inner| inner.as_ref() as &(dyn Error + 'static))
    }
}

pub type EntglResult<T> = Result<T, EntglError>;

pub fn network_error(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::Network, message)
}

pub fn persistence_error(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::Persistence, message)
}

pub fn sync_error(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::Sync, message)
}

pub fn config_error(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::Config, message)
}

pub fn corruption_error(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::DatabaseCorruption, message)
}

pub fn timeout_error(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::Timeout, message)
}

pub fn cancelled(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::Cancelled, message)
}

pub fn auth_failed(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::AuthFailed, message)
}

pub fn crypto_error(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::CryptoError, message)
}

pub fn version_mismatch(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::VersionMismatch, message)
}

pub fn security_mode_mismatch(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::SecurityModeMismatch, message)
}

pub fn internal_error(message: impl Into<String>) -> EntglError {
    EntglError::new(ErrorCode::Internal, message)
}

pub fn retry_exhausted(operation: &str, attempts: u32, last: EntglError) -> EntglError {
    EntglError::with_source(
        ErrorCode::RetryExhausted,
        format!("operation `{operation}` failed after {attempts} attempts"),
        last,
    )
}

impl From<std::io::Error> for EntglError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                timeout_error(format!("i/o timed out: {err}"))
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::AddrNotAvailable => network_error(format!("transport failure: {err}")),
            _ => persistence_error(format!("i/o failure: {err}")),
        }
    }
}

impl From<serde_json::Error> for EntglError {
    fn from(err: serde_json::Error) -> Self {
        persistence_error(format!("json serialization failed: {err}"))
    }
}
