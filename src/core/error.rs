use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Index schema version {found} is incompatible with expected version {expected}")]
    SchemaVersion { found: String, expected: String },

    #[error("Content hash mismatch on unchanged file(s): {}", display_paths(.paths))]
    Integrity { paths: Vec<PathBuf> },

    #[error("Indexed file(s) missing from disk: {}", display_paths(.paths))]
    MissingFile { paths: Vec<PathBuf> },

    #[error("Unsupported query parameter: {0}")]
    UnsupportedQuery(String),

    #[error("Failed to decode {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Invalid progress setting: {0}")]
    InvalidProgress(String),

    #[error("Directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("No record with identity '{0}'")]
    NotFound(String),
}

impl Error {
    pub(crate) fn decode(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
