use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RbError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("K8s RB definition ({name}/{version}) not found")]
    DefinitionNotFound { name: String, version: String },

    #[error("archive {} does not exist", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("manifest {0} is missing from the extracted archive")]
    ManifestMissing(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("K8s rb profile name is empty! Either define profile name to use or choose default")]
    EmptyProfileName,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{method} {url} failed with status {status}: {body}")]
    Http {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("archive compression failed: {0}")]
    Compression(String),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("malformed inventory record: {0}")]
    MalformedInventoryRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("telemetry initialization error: {0}")]
    Telemetry(String),

    #[error("unexpected error: {0}")]
    Other(String),
}

/// Coarse classification used by callers deciding whether to abort a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Validation,
    Transport,
    Timeout,
    Compression,
    Other,
}

impl RbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RbError::DefinitionNotFound { .. }
            | RbError::ArtifactNotFound(_)
            | RbError::ManifestMissing(_) => ErrorKind::NotFound,
            RbError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            RbError::EmptyProfileName
            | RbError::Validation(_)
            | RbError::MalformedInventoryRecord(_)
            | RbError::Config(_) => ErrorKind::Validation,
            RbError::Transport(_) | RbError::Http { .. } | RbError::Io(_) => ErrorKind::Transport,
            RbError::Timeout(_) => ErrorKind::Timeout,
            RbError::Compression(_) => ErrorKind::Compression,
            RbError::HealthCheckFailed(_)
            | RbError::Yaml(_)
            | RbError::Json(_)
            | RbError::Telemetry(_)
            | RbError::Other(_) => ErrorKind::Other,
        }
    }

    /// Errors that leave a target undefined and must abort the current operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RbError::AlreadyExists(_) | RbError::MalformedInventoryRecord(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RbError>;
