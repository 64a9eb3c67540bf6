//! Error type shared by the local backend and the federated learning primitives.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("backend `{0}` is not supported by the local backend")]
    Unsupported(String),
    #[error("unknown backend type `{0}`")]
    UnknownBackend(String),
    #[error("{kind} `{key}` not found")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} already registered: {detail}")]
    AlreadyExists { kind: &'static str, detail: String },
    #[error("organization `{organization}` is not authorized to {action}")]
    PermissionDenied { organization: String, action: String },
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("round {round} aborted: {reason}")]
    RoundAborted { round: u64, reason: String },
    #[error("data format error in {path}: {reason}")]
    DataFormat { path: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl PlatformError {
    pub fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { what, reason: reason.into() }
    }

    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound { kind, key: key.into() }
    }
}

pub type Result<T, E = PlatformError> = std::result::Result<T, E>;
