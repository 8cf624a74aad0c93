//! Error types for the export bridge.

use thiserror::Error;

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for scene loading, export and delivery.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Failed to read or parse a ZIP archive.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Failed to parse JSON data.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to read or process an image.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error talking to the delivery endpoint.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Nothing was selected for export.
    #[error("Nothing selected to export")]
    EmptySelection,

    /// A run is already in flight.
    #[error("An export is already in progress")]
    AlreadyExporting,

    /// A named scene entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A mesh data block still has users and can not be removed.
    #[error("Mesh '{name}' still has {users} user(s)")]
    MeshInUse { name: String, users: usize },

    /// Mesh data failed validation.
    #[error("Corrupt mesh '{name}': {reason}")]
    CorruptMesh { name: String, reason: String },

    /// Invalid scene description.
    #[error("Invalid scene: {0}")]
    InvalidScene(String),

    /// Export options out of range.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Failed to encode the asset.
    #[error("Export error: {0}")]
    Export(String),

    /// Every image mode of the fallback chain failed.
    #[error("GLB export failed after {attempts} attempt(s): {last}")]
    SerializationFailed { attempts: usize, last: String },

    /// A stage panicked; teardown still ran.
    #[error("Stage '{stage}' aborted: {message}")]
    StagePanicked { stage: String, message: String },
}
