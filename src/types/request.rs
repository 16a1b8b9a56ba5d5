//! Request types
//!
//! Completion, embedding and tokenizer requests as they arrive over the wire.
//! Unknown fields are ignored and every field has a default.

use serde::{Deserialize, Deserializer, Serialize};

use crate::inference::EngineError;

/// Sampling parameters applied at every generation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature (<= 0.0 selects greedy sampling)
    pub temperature: f32,
    /// Top-k sampling parameter (<= 0 = disabled)
    pub top_k: i32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Locally typical sampling parameter (1.0 = disabled)
    pub typical_p: f32,
    /// Repetition penalty applied over the last `repeat_last_n` tokens
    pub repeat_penalty: f32,
    /// Size of the penalty window (-1 = whole context, 0 = disabled)
    pub repeat_last_n: i32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Mirostat mode (0 = off, 1 = v1, 2 = v2)
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// Random seed (-1 = random)
    pub seed: i64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            typical_p: 1.0,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            seed: -1,
        }
    }
}

impl SamplingParams {
    /// Returns true when sampling always picks the most likely token
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// A completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionRequest {
    /// Prompt text
    pub prompt: String,
    /// Maximum number of tokens to predict (-1 = unbounded)
    pub n_predict: i32,
    /// Number of prompt tokens kept when the context overflows (-1 = all)
    pub n_keep: i32,
    /// Number of top candidates reported per generated token
    pub n_probs: usize,
    /// Stop strings; generation ends when any of them appears
    #[serde(deserialize_with = "one_or_many")]
    pub stop: Vec<String>,
    /// Deliver text incrementally instead of once at the end
    pub stream: bool,
    #[serde(flatten)]
    pub sampling: SamplingParams,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            n_predict: -1,
            n_keep: 0,
            n_probs: 0,
            stop: Vec::new(),
            stream: false,
            sampling: SamplingParams::default(),
        }
    }
}

impl CompletionRequest {
    /// Creates a request for `prompt` with default parameters
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a request from JSON
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let mut request: CompletionRequest = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    /// Rejects parameter combinations generation cannot honor.
    ///
    /// Empty stop strings are dropped rather than rejected.
    pub fn validate(&mut self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidRequest(msg));

        if self.n_predict < -1 {
            return invalid(format!("n_predict must be >= -1, got {}", self.n_predict));
        }
        if self.n_keep < -1 {
            return invalid(format!("n_keep must be >= -1, got {}", self.n_keep));
        }
        let s = &self.sampling;
        if s.temperature < 0.0 || s.temperature.is_nan() {
            return invalid(format!("temperature must be >= 0, got {}", s.temperature));
        }
        if !(s.top_p > 0.0 && s.top_p <= 1.0) {
            return invalid(format!("top_p must be in (0, 1], got {}", s.top_p));
        }
        if !(0..=2).contains(&s.mirostat) {
            return invalid(format!("mirostat must be 0, 1 or 2, got {}", s.mirostat));
        }
        if s.repeat_last_n < -1 {
            return invalid(format!(
                "repeat_last_n must be >= -1, got {}",
                s.repeat_last_n
            ));
        }

        self.stop.retain(|word| !word.is_empty());
        Ok(())
    }
}

/// Request body for the embedding entry point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingRequest {
    pub content: String,
}

/// Request body for the tokenize entry point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizeRequest {
    pub content: String,
}

/// Request body for the detokenize entry point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetokenizeRequest {
    pub tokens: Vec<i32>,
}

/// Accepts either a single string or a list of strings
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(word) => vec![word],
        OneOrMany::Many(words) => words,
    })
}
