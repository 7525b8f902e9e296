use thiserror::Error;

/// Errors surfaced by the export pipeline.
///
/// The last five variants map one-to-one onto the terminal failure markers an
/// export can leave behind on the source collection; everything else is an
/// unexpected failure that clears all markers on the way out.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Source store error: {0}")]
    Store(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Member path collision: {0}")]
    PathCollision(String),

    #[error("Dataset creation rejected: {0}")]
    DatasetRejected(String),

    #[error("No deposit target: {0}")]
    DatasetUnknown(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Upload corrupted: {0}")]
    UploadCorrupted(String),

    #[error("Review request failed: {0}")]
    ReviewFailed(String),
}
