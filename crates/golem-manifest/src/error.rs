//! Error types for manifest persistence.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("unknown server '{name}'")]
    UnknownServer { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
