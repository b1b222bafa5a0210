use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmediaError>;

/// Error reported by an out-of-band controller transport.
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum VmediaError {
    #[error("Shared file system {share} is not available: {reason}")]
    SharedFilesystemUnavailable { share: PathBuf, reason: String },
    #[error("{operation} failed: {source}")]
    Staging {
        operation: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to fetch image {reference}: {reason}")]
    ImageFetch { reference: String, reason: String },
    #[error("Failed to build {artifact}: {reason}")]
    ArtifactBuild { artifact: String, reason: String },
    #[error("Missing parameter: {0}")]
    MissingParameter(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{operation} failed: {source}")]
    OutOfBand {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("Node {0} not found")]
    NodeNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("{0}")]
    Message(String),
}

impl VmediaError {
    /// Name of the controller operation that failed, if any.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            VmediaError::OutOfBand { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for VmediaError {
    fn from(err: anyhow::Error) -> Self {
        VmediaError::Message(format!("{err:#}"))
    }
}
