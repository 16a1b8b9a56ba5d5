//! Persistent storage
//!
//! Server settings, the models directory and small file utilities.

use std::path::PathBuf;
use thiserror::Error;

pub mod models;
pub mod offset;
pub mod settings;

pub use models::{resolve_model_path, scan_models_directory, ModelInfo};
pub use offset::find_offset_in_file;
pub use settings::{load_settings, load_settings_from, save_settings_to, ServerSettings};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
}

/// Get the application data directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\illama\illama\data`
/// - macOS: `/Users/{user}/Library/Application Support/com.illama.illama`
/// - Linux: `/home/{user}/.local/share/illama`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "illama", "illama")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Default location of `.gguf` files
pub fn default_models_dir() -> PathBuf {
    get_data_dir()
        .map(|d| d.join("models"))
        .unwrap_or_else(|_| PathBuf::from("./models"))
}
