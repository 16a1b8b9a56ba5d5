//! Deterministic backend for tests
//!
//! Prompt text tokenizes to one token per byte. Generation replays a fixed
//! script of vocabulary pieces, then emits EOS (or loops, when cycling).

use std::sync::{Arc, Mutex};

use crate::inference::backend::{InferenceSession, ModelBackend, Token};
use crate::inference::model::LoadedModelInfo;
use crate::inference::EngineError;
use crate::types::{CompletionTokenOutput, SamplingParams, TokenProb};

pub(crate) const BOS: Token = 1;
pub(crate) const EOS: Token = 2;
const FIRST_PIECE: Token = 3;
const BYTE_BASE: Token = 1000;

/// Everything the model was asked to evaluate, as `(n_past, tokens)` calls
pub(crate) type EvalLog = Arc<Mutex<Vec<(usize, Vec<Token>)>>>;

pub(crate) struct ScriptedModel {
    info: LoadedModelInfo,
    pieces: Vec<Vec<u8>>,
    cycle: bool,
    pub(crate) evals: EvalLog,
    pub(crate) windows: Arc<Mutex<Vec<Vec<Token>>>>,
}

impl ScriptedModel {
    pub(crate) fn new(pieces: &[&str]) -> Self {
        Self::from_bytes(pieces.iter().map(|p| p.as_bytes().to_vec()).collect())
    }

    pub(crate) fn from_bytes(pieces: Vec<Vec<u8>>) -> Self {
        Self {
            info: LoadedModelInfo {
                path: "scripted.gguf".to_string(),
                vocab_size: BYTE_BASE + 256,
                embedding_dim: 4,
                train_context_length: 4096,
                n_ctx: 512,
                n_batch: 64,
                param_count: 0,
                size_bytes: 0,
                embedding: false,
            },
            pieces,
            cycle: false,
            evals: Arc::default(),
            windows: Arc::default(),
        }
    }

    /// Repeats the script forever instead of ending with EOS
    pub(crate) fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }

    pub(crate) fn with_context(mut self, n_ctx: u32, n_batch: u32) -> Self {
        self.info.n_ctx = n_ctx;
        self.info.n_batch = n_batch;
        self
    }

    pub(crate) fn with_embeddings(mut self) -> Self {
        self.info.embedding = true;
        self
    }

    fn scripted_token(&self, step: usize) -> Token {
        let len = self.pieces.len();
        if self.cycle && len > 0 {
            FIRST_PIECE + (step % len) as Token
        } else if step < len {
            FIRST_PIECE + step as Token
        } else {
            EOS
        }
    }
}

impl ModelBackend for ScriptedModel {
    fn info(&self) -> &LoadedModelInfo {
        &self.info
    }

    fn bos_token(&self) -> Token {
        BOS
    }

    fn eos_token(&self) -> Token {
        EOS
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| BYTE_BASE + Token::from(b)));
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        match token {
            BOS | EOS => Ok(Vec::new()),
            t if t >= BYTE_BASE && t < BYTE_BASE + 256 => Ok(vec![(t - BYTE_BASE) as u8]),
            t if t >= FIRST_PIECE && ((t - FIRST_PIECE) as usize) < self.pieces.len() => {
                Ok(self.pieces[(t - FIRST_PIECE) as usize].clone())
            }
            t => Err(EngineError::Tokenization(format!("unknown token {t}"))),
        }
    }

    fn new_session(
        &self,
        _sampling: &SamplingParams,
        embeddings: bool,
    ) -> Result<Box<dyn InferenceSession + '_>, EngineError> {
        if embeddings && !self.info.embedding {
            return Err(EngineError::EmbeddingUnsupported);
        }
        Ok(Box::new(ScriptedSession {
            model: self,
            position: 0,
            step: 0,
        }))
    }
}

struct ScriptedSession<'a> {
    model: &'a ScriptedModel,
    position: usize,
    step: usize,
}

impl InferenceSession for ScriptedSession<'_> {
    fn eval(&mut self, tokens: &[Token], n_past: usize) -> Result<(), EngineError> {
        if n_past != self.position {
            return Err(EngineError::Inference(format!(
                "eval at {n_past} but cache holds {} tokens",
                self.position
            )));
        }
        if n_past + tokens.len() > self.model.n_ctx() {
            return Err(EngineError::Inference("context overflow".to_string()));
        }
        if tokens.len() > self.model.n_batch() {
            return Err(EngineError::Inference("batch overflow".to_string()));
        }
        if let Ok(mut log) = self.model.evals.lock() {
            log.push((n_past, tokens.to_vec()));
        }
        self.position += tokens.len();
        Ok(())
    }

    fn clear(&mut self) {
        self.position = 0;
    }

    fn sample(
        &mut self,
        last_n_tokens: &[Token],
        n_probs: usize,
    ) -> Result<CompletionTokenOutput, EngineError> {
        if self.position == 0 {
            return Err(EngineError::Inference("no logits".to_string()));
        }
        if let Ok(mut windows) = self.model.windows.lock() {
            windows.push(last_n_tokens.to_vec());
        }

        let token = self.model.scripted_token(self.step);
        self.step += 1;

        let probs = [
            TokenProb { token, prob: 0.75 },
            TokenProb {
                token: EOS,
                prob: 0.25,
            },
        ]
        .into_iter()
        .take(n_probs)
        .collect();
        Ok(CompletionTokenOutput::new(token, probs))
    }

    fn embedding(&mut self) -> Result<Vec<f32>, EngineError> {
        if !self.model.info.embedding {
            return Err(EngineError::EmbeddingUnsupported);
        }
        let dim = self.model.info.embedding_dim as usize;
        Ok((0..dim).map(|i| (self.position + i) as f32).collect())
    }
}
