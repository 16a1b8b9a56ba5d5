//! Generation context
//!
//! One context exists per loaded model and is reused for every request:
//! `rewind → configure → load_prompt → begin_completion → do_completion`.
//! The model lives apart from the mutable generation state so a run can
//! borrow the model while it updates counters and buffers.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::inference::backend::{ModelBackend, Token};
use crate::inference::model::{LoadedModelInfo, ModelParams};
use crate::inference::stop::StopMatcher;
use crate::inference::EngineError;
use crate::types::{
    CompletionProbability, CompletionRequest, CompletionResponse, CompletionTokenOutput,
    StopReason, TokenProbReport,
};

/// Where a context is in its request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PromptLoaded,
    Generating,
    Stopped,
}

impl Phase {
    fn describe(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::PromptLoaded => "prompt loaded",
            Phase::Generating => "generating",
            Phase::Stopped => "stopped",
        }
    }
}

/// Mutable per-request generation state
#[derive(Debug)]
pub(crate) struct GenerationState {
    pub(crate) phase: Phase,
    pub(crate) request: CompletionRequest,
    pub(crate) stop_matcher: StopMatcher,

    /// Recent tokens for repetition penalties, oldest first
    pub(crate) last_n_tokens: VecDeque<Token>,
    pub(crate) last_n_capacity: usize,
    /// Prompt plus generated tokens; `embd[..n_past]` are evaluated
    pub(crate) embd: Vec<Token>,

    pub(crate) generated_text: String,
    /// Bytes of an incomplete UTF-8 character not yet in `generated_text`
    pub(crate) pending_bytes: Vec<u8>,
    pub(crate) generated_token_probs: Vec<CompletionTokenOutput>,
    /// Byte offset in `generated_text` where each recorded token's text starts
    pub(crate) token_text_offsets: Vec<usize>,

    pub(crate) num_prompt_tokens: usize,
    pub(crate) num_tokens_predicted: usize,
    pub(crate) n_past: usize,
    /// Remaining budget; negative means unbounded
    pub(crate) n_remain: i64,
    pub(crate) n_keep: usize,

    pub(crate) truncated: bool,
    pub(crate) stopped_eos: bool,
    pub(crate) stopped_word: bool,
    pub(crate) stopped_limit: bool,
    pub(crate) cancelled: bool,
    pub(crate) has_next_token: bool,
    pub(crate) stream: bool,
    pub(crate) stopping_word: String,
    /// Bytes still missing from the character in `pending_bytes`
    pub(crate) multibyte_pending: usize,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            request: CompletionRequest::default(),
            stop_matcher: StopMatcher::default(),
            last_n_tokens: VecDeque::new(),
            last_n_capacity: 0,
            embd: Vec::new(),
            generated_text: String::new(),
            pending_bytes: Vec::new(),
            generated_token_probs: Vec::new(),
            token_text_offsets: Vec::new(),
            num_prompt_tokens: 0,
            num_tokens_predicted: 0,
            n_past: 0,
            n_remain: 0,
            n_keep: 0,
            truncated: false,
            stopped_eos: false,
            stopped_word: false,
            stopped_limit: false,
            cancelled: false,
            has_next_token: false,
            stream: false,
            stopping_word: String::new(),
            multibyte_pending: 0,
        }
    }
}

impl GenerationState {
    pub(crate) fn expect_phase(
        &self,
        expected: Phase,
        operation: &'static str,
    ) -> Result<(), EngineError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                phase: self.phase.describe(),
            })
        }
    }

    /// Pushes a token into the penalty window, evicting the oldest
    pub(crate) fn remember(&mut self, token: Token) {
        if self.last_n_capacity == 0 {
            return;
        }
        if self.last_n_tokens.len() >= self.last_n_capacity {
            self.last_n_tokens.pop_front();
        }
        self.last_n_tokens.push_back(token);
    }

    pub(crate) fn stop_reason(&self) -> Option<StopReason> {
        if self.stopped_eos {
            Some(StopReason::Eos)
        } else if self.stopped_word {
            Some(StopReason::Word)
        } else if self.stopped_limit {
            Some(StopReason::Limit)
        } else if self.cancelled {
            Some(StopReason::Cancelled)
        } else {
            None
        }
    }
}

/// A loaded model plus the state of the request it is serving
pub struct GenerationContext {
    model: Option<Box<dyn ModelBackend>>,
    pub(crate) state: GenerationState,
}

impl GenerationContext {
    /// Creates a context with no model; every operation fails until a load succeeds
    pub fn new() -> Self {
        Self {
            model: None,
            state: GenerationState::default(),
        }
    }

    /// Creates a context around an already loaded model
    pub fn with_model(model: Box<dyn ModelBackend>) -> Self {
        Self {
            model: Some(model),
            state: GenerationState::default(),
        }
    }

    /// Loads a model through `load`, replacing any previous one.
    ///
    /// On failure the context is left without a model.
    pub fn load_model_with<F>(
        &mut self,
        params: &ModelParams,
        load: F,
    ) -> Result<LoadedModelInfo, EngineError>
    where
        F: FnOnce(&ModelParams) -> Result<Box<dyn ModelBackend>, EngineError>,
    {
        self.model = None;
        self.state = GenerationState::default();

        match load(params) {
            Ok(model) => {
                let info = model.info().clone();
                info!(
                    path = %info.path,
                    n_ctx = info.n_ctx,
                    n_vocab = info.vocab_size,
                    embedding = info.embedding,
                    "Model loaded"
                );
                self.model = Some(model);
                Ok(info)
            }
            Err(e) => {
                tracing::error!(path = %params.model_path.display(), "Failed to load model: {e}");
                Err(e)
            }
        }
    }

    /// Loads a GGUF model with llama.cpp
    #[cfg(feature = "llama")]
    pub fn load_model(&mut self, params: &ModelParams) -> Result<LoadedModelInfo, EngineError> {
        self.load_model_with(params, |p| {
            crate::inference::llama::LlamaModelBackend::load(p)
                .map(|m| Box::new(m) as Box<dyn ModelBackend>)
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model.as_deref().map(|m| m.info())
    }

    pub(crate) fn model(&self) -> Result<&dyn ModelBackend, EngineError> {
        self.model.as_deref().ok_or(EngineError::NoModelLoaded)
    }

    /// Borrows the model and the mutable state at the same time
    pub(crate) fn split(&mut self) -> Result<(&dyn ModelBackend, &mut GenerationState), EngineError> {
        let model = self.model.as_deref().ok_or(EngineError::NoModelLoaded)?;
        Ok((model, &mut self.state))
    }

    /// Clears the previous request's text, flags and counters.
    ///
    /// Idempotent; the model stays loaded.
    pub fn rewind(&mut self) {
        let state = &mut self.state;
        state.phase = Phase::Idle;
        state.last_n_tokens.clear();
        state.embd.clear();
        state.generated_text.clear();
        state.pending_bytes.clear();
        state.generated_token_probs.clear();
        state.token_text_offsets.clear();
        state.num_prompt_tokens = 0;
        state.num_tokens_predicted = 0;
        state.n_past = 0;
        state.n_remain = 0;
        state.n_keep = 0;
        state.truncated = false;
        state.stopped_eos = false;
        state.stopped_word = false;
        state.stopped_limit = false;
        state.cancelled = false;
        state.has_next_token = false;
        state.stopping_word.clear();
        state.multibyte_pending = 0;
    }

    /// Installs the parameters of the next request
    pub fn configure(&mut self, request: CompletionRequest) -> Result<(), EngineError> {
        self.model()?;
        let state = &mut self.state;
        state.expect_phase(Phase::Idle, "configure a request")?;

        state.stream = request.stream;
        state.stop_matcher = StopMatcher::new(request.stop.iter().cloned());
        state.request = request;
        Ok(())
    }

    /// Tokenizes the configured prompt into the pending token list.
    ///
    /// A prompt that does not fit the context keeps its first `n_keep` tokens
    /// and drops whole blocks after them, so the most recent tokens survive.
    pub fn load_prompt(&mut self) -> Result<(), EngineError> {
        let (model, state) = self.split()?;
        state.expect_phase(Phase::Idle, "load a prompt")?;

        let n_ctx = model.n_ctx().max(1);
        let mut tokens = model.tokenize(&state.request.prompt, true)?;
        state.num_prompt_tokens = tokens.len();

        let n_keep = usize::try_from(state.request.n_keep).unwrap_or(tokens.len());
        state.n_keep = n_keep.min(n_ctx.saturating_sub(4));

        state.last_n_capacity = match state.request.sampling.repeat_last_n {
            -1 => n_ctx,
            n => n.max(0) as usize,
        };
        let seed_from = tokens.len().saturating_sub(state.last_n_capacity);
        state.last_n_tokens = tokens[seed_from..].iter().copied().collect();

        if tokens.len() >= n_ctx {
            let n_left = ((n_ctx - state.n_keep) / 2).max(1);
            let erased_blocks = tokens
                .len()
                .saturating_sub(state.n_keep + n_left + 1)
                / n_left;
            let resume_at = state.n_keep + erased_blocks * n_left;

            let mut kept = tokens[..state.n_keep].to_vec();
            kept.extend_from_slice(&tokens[resume_at..]);

            warn!(
                n_ctx,
                n_keep = state.n_keep,
                n_left,
                num_prompt_tokens = tokens.len(),
                kept = kept.len(),
                "Prompt truncated to fit the context window"
            );
            state.truncated = true;
            tokens = kept;
        }

        debug!(
            num_prompt_tokens = state.num_prompt_tokens,
            prompt = crate::truncate_str(&state.request.prompt, 80),
            "Prompt loaded"
        );
        state.embd = tokens;
        state.n_past = 0;
        state.phase = Phase::PromptLoaded;
        Ok(())
    }

    /// Arms the generation loop with the request's token budget
    pub fn begin_completion(&mut self) -> Result<(), EngineError> {
        self.model()?;
        let state = &mut self.state;
        state.expect_phase(Phase::PromptLoaded, "begin a completion")?;

        state.n_remain = i64::from(state.request.n_predict);
        state.has_next_token = state.n_remain != 0;
        if state.n_remain == 0 {
            state.stopped_limit = true;
        }
        state.phase = Phase::Generating;

        debug!(
            n_remain = state.n_remain,
            n_stop_words = state.request.stop.len(),
            stream = state.stream,
            "Completion started"
        );
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn generated_text(&self) -> &str {
        &self.state.generated_text
    }

    pub fn generated_token_probs(&self) -> &[CompletionTokenOutput] {
        &self.state.generated_token_probs
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.state.num_prompt_tokens
    }

    pub fn num_tokens_predicted(&self) -> usize {
        self.state.num_tokens_predicted
    }

    pub fn n_past(&self) -> usize {
        self.state.n_past
    }

    pub fn n_remain(&self) -> i64 {
        self.state.n_remain
    }

    pub fn has_next_token(&self) -> bool {
        self.state.has_next_token
    }

    pub fn truncated(&self) -> bool {
        self.state.truncated
    }

    pub fn stopped_eos(&self) -> bool {
        self.state.stopped_eos
    }

    pub fn stopped_word(&self) -> bool {
        self.state.stopped_word
    }

    pub fn stopped_limit(&self) -> bool {
        self.state.stopped_limit
    }

    pub fn stopping_word(&self) -> &str {
        &self.state.stopping_word
    }

    pub fn multibyte_pending(&self) -> usize {
        self.state.multibyte_pending
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.stop_reason()
    }

    /// Summarizes the finished request
    pub fn response(&self) -> Result<CompletionResponse, EngineError> {
        let model = self.model()?;
        let state = &self.state;

        let completion_probabilities = if state.request.n_probs > 0 {
            state
                .generated_token_probs
                .iter()
                .map(|output| CompletionProbability {
                    content: model.token_to_piece(output.token),
                    probs: output
                        .probs
                        .iter()
                        .map(|p| TokenProbReport {
                            tok_str: model.token_to_piece(p.token),
                            prob: p.prob,
                        })
                        .collect(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(CompletionResponse {
            content: if state.stream {
                String::new()
            } else {
                state.generated_text.clone()
            },
            stop: true,
            model: model.info().path.clone(),
            prompt: state.request.prompt.clone(),
            tokens_predicted: state.num_tokens_predicted,
            tokens_evaluated: state.num_prompt_tokens,
            truncated: state.truncated,
            stopped_eos: state.stopped_eos,
            stopped_word: state.stopped_word,
            stopped_limit: state.stopped_limit,
            stopping_word: state.stopping_word.clone(),
            stop_reason: state.stop_reason(),
            generation_settings: state.request.sampling.clone(),
            completion_probabilities,
        })
    }
}

impl Default for GenerationContext {
    fn default() -> Self {
        Self::new()
    }
}
