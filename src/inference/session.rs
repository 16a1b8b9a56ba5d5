//! Shared session handle
//!
//! Every caller shares one [`GenerationContext`] behind a mutex, so requests
//! run one at a time and each starts from a rewound context. A panic in one
//! request poisons the lock; the next request recovers it, since rewinding
//! restores a consistent state.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::inference::backend::Token;
use crate::inference::context::GenerationContext;
use crate::inference::model::LoadedModelInfo;
use crate::inference::streaming::{CancelFlag, ChannelSink, CompletionSink, StreamToken};
use crate::inference::EngineError;
use crate::types::{
    CompletionRequest, CompletionResponse, DetokenizeResponse, EmbeddingResponse,
    TokenizeResponse,
};

/// Cheaply clonable handle to the shared generation context
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<GenerationContext>>,
}

/// A completion running on a worker thread
pub struct CompletionStream {
    /// Chunks as they are confirmed, then `Done` or `Error`
    pub tokens: Receiver<StreamToken>,
    /// Raise to stop generation after the current token
    pub cancel: CancelFlag,
    /// Yields the final response once generation ends
    pub handle: JoinHandle<Result<CompletionResponse, EngineError>>,
}

impl SessionHandle {
    pub fn new(ctx: GenerationContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ctx)),
        }
    }

    /// Loads a GGUF model and wraps it in a fresh handle
    #[cfg(feature = "llama")]
    pub fn load(params: &crate::inference::model::ModelParams) -> Result<Self, EngineError> {
        let mut ctx = GenerationContext::new();
        ctx.load_model(params)?;
        Ok(Self::new(ctx))
    }

    fn lock(&self) -> MutexGuard<'_, GenerationContext> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering generation context after a panicked request");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Number of handles sharing this context
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn model_info(&self) -> Option<LoadedModelInfo> {
        self.lock().model_info().cloned()
    }

    /// Parses a JSON request and runs it to completion
    pub fn completion(
        &self,
        json: &str,
        sink: &mut dyn CompletionSink,
    ) -> Result<CompletionResponse, EngineError> {
        let request = CompletionRequest::from_json(json)?;
        self.complete(request, sink, None)
    }

    /// Runs one request through the full lifecycle
    pub fn complete(
        &self,
        mut request: CompletionRequest,
        sink: &mut dyn CompletionSink,
        cancel: Option<&CancelFlag>,
    ) -> Result<CompletionResponse, EngineError> {
        request.validate()?;

        let span = info_span!("completion", id = %Uuid::new_v4());
        let _enter = span.enter();

        let mut ctx = self.lock();
        ctx.rewind();
        ctx.configure(request)?;
        ctx.load_prompt()?;
        ctx.begin_completion()?;
        ctx.do_completion(sink, cancel)?;
        let response = ctx.response()?;

        info!(
            tokens_evaluated = response.tokens_evaluated,
            tokens_predicted = response.tokens_predicted,
            stop_reason = ?response.stop_reason,
            truncated = response.truncated,
            "Completion done"
        );
        Ok(response)
    }

    /// Runs a streaming completion on a worker thread.
    ///
    /// Dropping the receiver cancels generation at the next token.
    pub fn stream(&self, mut request: CompletionRequest) -> CompletionStream {
        request.stream = true;
        let (tx, tokens) = mpsc::channel();
        let cancel = CancelFlag::new();

        let session = self.clone();
        let worker_cancel = cancel.clone();
        let handle = thread::spawn(move || {
            let mut sink = ChannelSink::new(tx.clone(), worker_cancel.clone());
            let result = session.complete(request, &mut sink, Some(&worker_cancel));
            let last = match &result {
                Ok(_) => StreamToken::Done,
                Err(e) => StreamToken::Error(e.to_string()),
            };
            if tx.send(last).is_err() {
                debug!("Stream receiver gone before completion finished");
            }
            result
        });

        CompletionStream {
            tokens,
            cancel,
            handle,
        }
    }

    /// Embeds `content` without generating
    pub fn embedding(&self, content: &str) -> Result<EmbeddingResponse, EngineError> {
        let span = info_span!("embedding", id = %Uuid::new_v4());
        let _enter = span.enter();

        let mut ctx = self.lock();
        ctx.rewind();
        ctx.configure(CompletionRequest::new(content))?;
        ctx.load_prompt()?;
        let embedding = ctx.get_embedding();
        ctx.rewind();
        Ok(EmbeddingResponse {
            embedding: embedding?,
        })
    }

    /// Tokenizes `content` without a leading BOS
    pub fn tokenize(&self, content: &str) -> Result<TokenizeResponse, EngineError> {
        let ctx = self.lock();
        let tokens = ctx.model()?.tokenize(content, false)?;
        Ok(TokenizeResponse { tokens })
    }

    pub fn detokenize(&self, tokens: &[Token]) -> Result<DetokenizeResponse, EngineError> {
        let ctx = self.lock();
        let model = ctx.model()?;
        let mut bytes = Vec::new();
        for &token in tokens {
            bytes.extend(model.token_to_bytes(token)?);
        }
        Ok(DetokenizeResponse {
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
