//! llama.cpp backend
//!
//! The only module that talks to llama-cpp-2. The backend is process-wide and
//! initialized once; each session owns a fresh `LlamaContext` borrowed from
//! the loaded model.

use std::num::NonZeroU32;
use std::sync::OnceLock;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::backend::{top_probs, InferenceSession, ModelBackend, Token};
use crate::inference::model::{validate_gguf, LoadedModelInfo, ModelParams};
use crate::inference::EngineError;
use crate::types::{CompletionTokenOutput, SamplingParams};

static LLAMA_BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn backend() -> Result<&'static LlamaBackend, EngineError> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    });
    result
        .as_ref()
        .map_err(|e| EngineError::BackendInit(e.clone()))
}

/// A GGUF model loaded through llama.cpp
pub struct LlamaModelBackend {
    model: LlamaModel,
    info: LoadedModelInfo,
    params: ModelParams,
}

impl LlamaModelBackend {
    /// Validates the file header, then loads the weights
    pub fn load(params: &ModelParams) -> Result<Self, EngineError> {
        let header = validate_gguf(&params.model_path)?;
        tracing::debug!(
            version = header.version,
            tensors = header.tensor_count,
            "GGUF header validated"
        );

        let backend = backend()?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.n_gpu_layers);
        let model = LlamaModel::load_from_file(backend, &params.model_path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        let n_ctx = if params.n_ctx == 0 {
            model.n_ctx_train()
        } else {
            params.n_ctx
        };
        let info = LoadedModelInfo {
            path: params.model_path.to_string_lossy().to_string(),
            vocab_size: model.n_vocab(),
            embedding_dim: model.n_embd(),
            train_context_length: model.n_ctx_train(),
            n_ctx,
            n_batch: params.n_batch.clamp(1, n_ctx.max(1)),
            param_count: model.n_params() as u64,
            size_bytes: model.size() as u64,
            embedding: params.embedding,
        };

        if info.n_ctx > info.train_context_length {
            tracing::warn!(
                n_ctx = info.n_ctx,
                n_ctx_train = info.train_context_length,
                "Context size exceeds what the model was trained on"
            );
        }

        Ok(Self {
            model,
            info,
            params: params.clone(),
        })
    }

    fn context_params(&self, embeddings: bool) -> Result<LlamaContextParams, EngineError> {
        let n_ctx = NonZeroU32::new(self.info.n_ctx)
            .ok_or_else(|| EngineError::ContextCreate("context size must be non-zero".into()))?;
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(self.info.n_batch)
            .with_embeddings(embeddings);
        if let Some(threads) = self.params.n_threads {
            ctx_params = ctx_params
                .with_n_threads(threads)
                .with_n_threads_batch(threads);
        }
        Ok(ctx_params)
    }

    fn build_sampler(&self, sampling: &SamplingParams) -> LlamaSampler {
        let seed = resolve_seed(sampling.seed);
        let mut chain = vec![LlamaSampler::penalties(
            penalty_last_n(sampling.repeat_last_n, self.info.n_ctx),
            sampling.repeat_penalty,
            sampling.frequency_penalty,
            sampling.presence_penalty,
        )];

        if sampling.is_greedy() {
            chain.push(LlamaSampler::greedy());
        } else {
            match sampling.mirostat {
                1 => {
                    chain.push(LlamaSampler::temp(sampling.temperature));
                    chain.push(LlamaSampler::mirostat(
                        self.model.n_vocab(),
                        seed,
                        sampling.mirostat_tau,
                        sampling.mirostat_eta,
                        100,
                    ));
                }
                2 => {
                    chain.push(LlamaSampler::temp(sampling.temperature));
                    chain.push(LlamaSampler::mirostat_v2(
                        seed,
                        sampling.mirostat_tau,
                        sampling.mirostat_eta,
                    ));
                }
                _ => {
                    chain.push(LlamaSampler::top_k(sampling.top_k));
                    chain.push(LlamaSampler::typical(sampling.typical_p, 1));
                    chain.push(LlamaSampler::top_p(sampling.top_p, 1));
                    chain.push(LlamaSampler::temp(sampling.temperature));
                    chain.push(LlamaSampler::dist(seed));
                }
            }
        }

        LlamaSampler::chain_simple(chain)
    }
}

impl ModelBackend for LlamaModelBackend {
    fn info(&self) -> &LoadedModelInfo {
        &self.info
    }

    fn bos_token(&self) -> Token {
        self.model.token_bos().0
    }

    fn eos_token(&self) -> Token {
        self.model.token_eos().0
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| EngineError::Tokenization(e.to_string()))
    }

    fn new_session(
        &self,
        sampling: &SamplingParams,
        embeddings: bool,
    ) -> Result<Box<dyn InferenceSession + '_>, EngineError> {
        if embeddings && !self.info.embedding {
            return Err(EngineError::EmbeddingUnsupported);
        }

        let ctx = self
            .model
            .new_context(backend()?, self.context_params(embeddings)?)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        Ok(Box::new(LlamaSession {
            ctx,
            sampler: self.build_sampler(sampling),
            primed: false,
            last_logits: None,
        }))
    }
}

struct LlamaSession<'a> {
    ctx: LlamaContext<'a>,
    sampler: LlamaSampler,
    /// Whether the penalty window has been fed to the sampler
    primed: bool,
    /// Batch index holding logits of the last evaluated token
    last_logits: Option<i32>,
}

impl InferenceSession for LlamaSession<'_> {
    fn eval(&mut self, tokens: &[Token], n_past: usize) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Ok(());
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken(token), (n_past + i) as i32, &[0], i == last)
                .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
        }

        self.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode: {e}")))?;
        self.last_logits = Some(batch.n_tokens() - 1);
        Ok(())
    }

    fn clear(&mut self) {
        self.ctx.clear_kv_cache();
        self.last_logits = None;
    }

    fn sample(
        &mut self,
        last_n_tokens: &[Token],
        n_probs: usize,
    ) -> Result<CompletionTokenOutput, EngineError> {
        let idx = self
            .last_logits
            .ok_or_else(|| EngineError::Inference("no logits to sample from".into()))?;

        if !self.primed {
            for &token in last_n_tokens {
                self.sampler.accept(LlamaToken(token));
            }
            self.primed = true;
        }

        let probs = if n_probs > 0 {
            top_probs(self.ctx.get_logits_ith(idx), n_probs)
        } else {
            Vec::new()
        };

        // sample() also accepts the token into the chain
        let token = self.sampler.sample(&self.ctx, idx);
        Ok(CompletionTokenOutput::new(token.0, probs))
    }

    fn embedding(&mut self) -> Result<Vec<f32>, EngineError> {
        let idx = self
            .last_logits
            .ok_or_else(|| EngineError::Inference("nothing evaluated".into()))?;

        let embedding = match self.ctx.embeddings_seq_ith(0) {
            Ok(pooled) => pooled.to_vec(),
            Err(_) => self
                .ctx
                .embeddings_ith(idx)
                .map_err(|e| EngineError::Inference(format!("Failed to read embeddings: {e}")))?
                .to_vec(),
        };
        Ok(embedding)
    }
}

/// Penalty window for the sampler; llama.cpp treats negative sizes as 0, so
/// -1 is expanded to the whole context here
fn penalty_last_n(repeat_last_n: i32, n_ctx: u32) -> i32 {
    if repeat_last_n == -1 {
        i32::try_from(n_ctx).unwrap_or(i32::MAX)
    } else {
        repeat_last_n.max(0)
    }
}

/// A negative seed asks for a fresh random one
fn resolve_seed(seed: i64) -> u32 {
    if seed < 0 {
        rand_seed()
    } else {
        seed as u32
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_fails_validation() {
        let params = ModelParams {
            model_path: "/nonexistent/model.gguf".into(),
            ..ModelParams::default()
        };
        let result = LlamaModelBackend::load(&params);
        assert!(matches!(result, Err(EngineError::ModelValidation(_))));
    }

    #[test]
    fn test_load_rejects_non_gguf() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"definitely not a gguf model file").unwrap();

        let params = ModelParams {
            model_path: file.path().to_path_buf(),
            ..ModelParams::default()
        };
        assert!(matches!(
            LlamaModelBackend::load(&params),
            Err(EngineError::ModelValidation(_))
        ));
    }

    #[test]
    fn test_penalty_window_covers_context() {
        assert_eq!(penalty_last_n(-1, 2048), 2048);
        assert_eq!(penalty_last_n(64, 2048), 64);
        assert_eq!(penalty_last_n(0, 2048), 0);
    }

    #[test]
    fn test_resolve_seed() {
        assert_eq!(resolve_seed(42), 42);
        assert_eq!(resolve_seed(0), 0);
        // Random, just must not panic
        let _ = resolve_seed(-1);
    }
}
