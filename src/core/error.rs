use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeelsonError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Validation error: {message}")]
    ValidationError { message: String, fields: Vec<String> },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    /// Raised when a recomputed audit hash disagrees with the stored one.
    /// Never repaired automatically.
    #[error("Audit chain integrity failure for {kind}/{id} at sequence {sequence}")]
    ChainIntegrityError {
        kind: String,
        id: String,
        sequence: u64,
    },
}

impl KeelsonError {
    /// Validation failure that is not tied to a particular field.
    pub fn invalid(message: impl Into<String>) -> Self {
        KeelsonError::ValidationError {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Validation failure for one field path.
    pub fn invalid_field(path: &str, message: impl Into<String>) -> Self {
        KeelsonError::ValidationError {
            message: format!("{}: {}", path, message.into()),
            fields: vec![path.to_string()],
        }
    }

    /// Field paths named by a validation failure, empty for every other variant.
    pub fn fields(&self) -> &[String] {
        match self {
            KeelsonError::ValidationError { fields, .. } => fields,
            _ => &[],
        }
    }
}
