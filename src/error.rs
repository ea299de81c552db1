use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A structured engine error carrying a machine-readable code plus context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code, e.g. `INTEGRITY/HASH_MISMATCH`.
    pub code: String,
    /// Human friendly message suitable for operator logs.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

/// Error codes used across the engine. Kept as constants so call sites and
/// tests agree on spelling.
pub mod codes {
    pub const MALFORMED_KEY: &str = "KEYS/MALFORMED";
    pub const OWNER_NOT_FOUND: &str = "OWNER/NOT_FOUND";
    pub const STORE_TRANSIENT: &str = "STORE/TRANSIENT";
    pub const STORE_PERMANENT: &str = "STORE/PERMANENT";
    pub const STORE_TIMEOUT: &str = "STORE/TIMEOUT";
    pub const HASH_MISMATCH: &str = "INTEGRITY/HASH_MISMATCH";
    pub const VALIDATION_FAILED: &str = "VALIDATION/FAILED";
    pub const RUN_CANCELLED: &str = "RUN/CANCELLED";
    pub const RUN_ACTIVE: &str = "RUN/ACTIVE";
    pub const BACKUP_FAILED: &str = "BACKUP/FAILED";
    pub const POINTER_REJECTED: &str = "POINTER/REJECTED";
    pub const TRACKER: &str = "TRACKER/SQL";
}

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// Transient errors are retried by the batch processor; everything else
    /// fails the item immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code.as_str(),
            codes::STORE_TRANSIENT | codes::STORE_TIMEOUT
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        AppError::new("IO/GENERIC", error.to_string())
            .with_context("kind", format!("{:?}", error.kind()))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        AppError::new(codes::TRACKER, error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::new("JSON/GENERIC", error.to_string())
    }
}
