use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error detail attached to session-scoped failures.
///
/// Validation and commit may produce several of these at once; single
/// operations record the last one on the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub xpath: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, xpath: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            xpath: xpath.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Peer disconnected: {0}")]
    Disconnect(String),

    #[error("Malformed message: {0}")]
    MalformedMsg(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Bad element: {0}")]
    BadElement(String),

    #[error("Validation failed ({} error(s))", .0.len())]
    ValidationFailed(Vec<ErrorInfo>),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Data already exists: {0}")]
    DataExists(String),

    #[error("Data missing: {0}")]
    DataMissing(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Locked: {0}")]
    Locked(String),

    #[error("Timed out: {0}")]
    TimedOut(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Flatten into the error list a session records, regardless of variant.
    pub fn error_infos(&self) -> Vec<ErrorInfo> {
        match self {
            DbError::ValidationFailed(errors) => errors.clone(),
            other => vec![ErrorInfo::new(other.to_string(), "")],
        }
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::Unauthorized(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Internal(err.to_string())
    }
}
