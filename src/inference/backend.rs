//! Model backend seam
//!
//! Generation logic only sees these traits. A [`ModelBackend`] is the loaded
//! model (vocabulary and weights); an [`InferenceSession`] borrows it and owns
//! the per-run state the forward pass needs (KV cache, sampler history).

use crate::inference::model::LoadedModelInfo;
use crate::inference::EngineError;
use crate::types::{CompletionTokenOutput, SamplingParams, TokenProb};

/// Vocabulary index of a token
pub type Token = i32;

/// A loaded model
pub trait ModelBackend: Send {
    fn info(&self) -> &LoadedModelInfo;

    /// Context window sessions are created with
    fn n_ctx(&self) -> usize {
        self.info().n_ctx as usize
    }

    /// Maximum tokens evaluated per forward pass
    fn n_batch(&self) -> usize {
        self.info().n_batch.max(1) as usize
    }

    fn bos_token(&self) -> Token;

    fn eos_token(&self) -> Token;

    /// True for tokens that end generation (EOS, end-of-turn, ...)
    fn is_end_of_generation(&self, token: Token) -> bool {
        token == self.eos_token()
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError>;

    /// Raw bytes of a token's text; may be an incomplete UTF-8 sequence
    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError>;

    /// Lossy text of a token, for reporting
    fn token_to_piece(&self, token: Token) -> String {
        self.token_to_bytes(token)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    /// Starts a session with an empty KV cache.
    ///
    /// `embeddings` requests embedding output; it fails with
    /// [`EngineError::EmbeddingUnsupported`] if the model was not loaded for it.
    fn new_session(
        &self,
        sampling: &SamplingParams,
        embeddings: bool,
    ) -> Result<Box<dyn InferenceSession + '_>, EngineError>;
}

/// Forward-pass and sampling state for one run
pub trait InferenceSession {
    /// Evaluates `tokens` at positions `n_past..n_past + tokens.len()`
    fn eval(&mut self, tokens: &[Token], n_past: usize) -> Result<(), EngineError>;

    /// Drops everything evaluated so far
    fn clear(&mut self);

    /// Samples the next token from the logits of the last evaluated token.
    ///
    /// `last_n_tokens` is the repetition penalty window, oldest first.
    fn sample(
        &mut self,
        last_n_tokens: &[Token],
        n_probs: usize,
    ) -> Result<CompletionTokenOutput, EngineError>;

    /// Embedding of the evaluated sequence
    fn embedding(&mut self) -> Result<Vec<f32>, EngineError>;
}

/// Softmax over `logits`, returning the `n` most likely candidates
pub fn top_probs(logits: &[f32], n: usize) -> Vec<TokenProb> {
    if n == 0 || logits.is_empty() {
        return Vec::new();
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();

    let mut ranked: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    ranked
        .into_iter()
        .take(n)
        .map(|(i, logit)| TokenProb {
            token: i as Token,
            prob: (logit - max).exp() / sum,
        })
        .collect()
}
