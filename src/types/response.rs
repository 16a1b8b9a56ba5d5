//! Response types
//!
//! Values produced by generation and the JSON shapes delivered to clients.

use serde::{Deserialize, Serialize};

use crate::inference::Token;
use crate::types::request::SamplingParams;

/// One candidate considered at a generation step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenProb {
    pub token: Token,
    pub prob: f32,
}

/// A produced token plus the top candidates considered at that step
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionTokenOutput {
    pub token: Token,
    /// Ordered by descending probability; empty when `n_probs == 0`
    pub probs: Vec<TokenProb>,
}

impl CompletionTokenOutput {
    pub fn new(token: Token, probs: Vec<TokenProb>) -> Self {
        Self { token, probs }
    }
}

/// Why a completion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced its end-of-sequence token
    Eos,
    /// A configured stop string appeared
    Word,
    /// The token budget ran out
    Limit,
    /// The caller raised the cancel flag
    Cancelled,
}

/// An incremental piece of streamed output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub stop: bool,
}

impl StreamChunk {
    pub fn partial(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            stop: false,
        }
    }
}

/// A candidate rendered as text for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProbReport {
    pub tok_str: String,
    pub prob: f32,
}

/// Per-token probability report attached to the final response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionProbability {
    pub content: String,
    pub probs: Vec<TokenProbReport>,
}

/// Final result of a completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text; empty for streamed completions since chunks carried it
    pub content: String,
    pub stop: bool,
    pub model: String,
    pub prompt: String,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub stopping_word: String,
    pub stop_reason: Option<StopReason>,
    pub generation_settings: SamplingParams,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub completion_probabilities: Vec<CompletionProbability>,
}

/// Result of the embedding entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// Result of the tokenize entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizeResponse {
    pub tokens: Vec<Token>,
}

/// Result of the detokenize entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetokenizeResponse {
    pub content: String,
}
