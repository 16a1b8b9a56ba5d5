//! Inference errors

use thiserror::Error;

use crate::inference::model::ModelError;

/// Errors that can occur while loading a model or running generation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Model was not loaded with embeddings enabled")]
    EmbeddingUnsupported,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cannot {operation} while {phase}")]
    InvalidState {
        operation: &'static str,
        phase: &'static str,
    },

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::InvalidRequest(e.to_string())
    }
}
