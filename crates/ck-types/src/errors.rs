use thiserror::Error;

/// Main error type for CandleKeep
#[derive(Error, Debug)]
pub enum CkError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid date range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the upstream market-data source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("session expired: {message}")]
    SessionExpired { message: String },

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("network failure: {message}")]
    Network { message: String },

    #[error("api error{}: {message}", code_suffix(.code))]
    Api { code: Option<String>, message: String },

    #[error("undecodable response: {message}")]
    Decode { message: String },
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" {c}")).unwrap_or_default()
}

/// Errors raised by the storage engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("transient storage failure: {message}")]
    Transient { message: String },

    #[error("constraint violation: {message}")]
    Constraint { message: String },

    #[error("database error: {message}")]
    Database { message: String },

    #[error("corrupt row: {message}")]
    Corruption { message: String },
}

/// A single upstream record that could not be normalized into a candle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field '{field}'")]
    MissingField { field: &'static str },

    #[error("field '{field}' is not a number: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field '{field}' is not finite: {value}")]
    NonFinite { field: &'static str, value: String },

    #[error("field '{field}' has more than {max_scale} decimal places: {value}")]
    ExcessPrecision {
        field: &'static str,
        value: String,
        max_scale: u32,
    },

    #[error("unparseable timestamp: {value}")]
    InvalidTimestamp { value: String },
}

/// Result type alias for CandleKeep operations
pub type CkResult<T> = Result<T, CkError>;

/// Result type alias for storage engine operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Classification used by the retry policy.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, SourceError::RateLimited { .. } | SourceError::Network { .. })
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }
}

impl Retryable for CkError {
    fn is_retryable(&self) -> bool {
        match self {
            CkError::Source(e) => e.is_retryable(),
            CkError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl CkError {
    /// Errors that abort a whole run rather than a single window.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CkError::Source(SourceError::Auth { .. }))
    }

    /// Short machine-friendly label used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CkError::Source(SourceError::Auth { .. }) => "auth",
            CkError::Source(SourceError::SessionExpired { .. }) => "session_expired",
            CkError::Source(SourceError::RateLimited { .. }) => "rate_limited",
            CkError::Source(SourceError::Network { .. }) => "network",
            CkError::Source(SourceError::Api { .. }) => "api",
            CkError::Source(SourceError::Decode { .. }) => "decode",
            CkError::Storage(StorageError::Transient { .. }) => "storage_transient",
            CkError::Storage(_) => "storage",
            CkError::InvalidRange { .. } => "invalid_range",
            CkError::Config(_) => "config",
            CkError::Cancelled => "cancelled",
            CkError::Io(_) => "io",
            CkError::Serialization(_) => "serialization",
            CkError::Validation(_) => "validation",
            CkError::Internal(_) => "internal",
        }
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::CkError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::CkError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::CkError::Config(format!($($arg)*))
    };
}
