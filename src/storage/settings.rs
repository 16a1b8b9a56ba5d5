//! Settings storage
//!
//! Persistent defaults for the server. Command-line flags override them.

use crate::inference::ModelParams;
use crate::storage::{default_models_dir, get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Smallest context window the server will run with
pub const MIN_CONTEXT_SIZE: u32 = 64;

/// Server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Model loaded when none is given on the command line
    pub default_model: Option<String>,
    /// Context window size in tokens
    pub context_size: u32,
    /// Tokens evaluated per forward pass
    pub batch_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Evaluation threads (None = llama.cpp default)
    pub threads: Option<i32>,
    /// Create contexts with embedding output
    pub embedding: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            models_directory: default_models_dir(),
            default_model: None,
            context_size: 2048,
            batch_size: 512,
            gpu_layers: 0,
            threads: None,
            embedding: false,
        }
    }
}

impl ServerSettings {
    /// Brings out-of-range values back to usable ones
    pub fn validate(&mut self) {
        if self.context_size == 0 {
            self.context_size = 2048;
        }
        self.context_size = self.context_size.max(MIN_CONTEXT_SIZE);
        if self.batch_size == 0 {
            self.batch_size = 512;
        }
        self.batch_size = self.batch_size.min(self.context_size);

        if matches!(self.threads, Some(n) if n <= 0) {
            self.threads = None;
        }
        if self.default_model.as_deref().is_some_and(str::is_empty) {
            self.default_model = None;
        }
    }

    /// Parameters for loading `model_path` with these settings
    pub fn model_params(&self, model_path: PathBuf) -> ModelParams {
        ModelParams {
            model_path,
            n_ctx: self.context_size,
            n_batch: self.batch_size,
            n_gpu_layers: self.gpu_layers,
            n_threads: self.threads,
            embedding: self.embedding,
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the default location
pub fn load_settings() -> ServerSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            ServerSettings::default()
        }
    }
}

/// Load settings from `path`
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings_from(path: &Path) -> ServerSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            ServerSettings::default()
        }
    }
}

fn load_settings_internal(path: &Path) -> Result<ServerSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(ServerSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: ServerSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!(path = %path.display(), "Loaded settings from disk");
    Ok(settings)
}

/// Save settings to `path`, creating parent directories
pub fn save_settings_to(path: &Path, settings: &ServerSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!(path = %path.display(), "Saved settings to disk");
    Ok(())
}
