use thiserror::Error;

/// Error taxonomy for the settings engine.
///
/// Every kind maps to one failure mode a caller can act on; internal
/// failures (poisoned locks, malformed snapshots) fold into
/// `Corruption` rather than getting their own variant, since a caller
/// can't usefully distinguish them.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("time skew detected: {0}")]
    TimeSkew(String),

    #[error("bad state: {0}")]
    BadState(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

impl<T> From<std::sync::PoisonError<T>> for SettingsError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SettingsError::Corruption(format!("poisoned lock: {err}"))
    }
}
