//! Embedding extraction
//!
//! Evaluates the loaded prompt and reads back the pooled embedding vector.

use tracing::{debug, warn};

use crate::inference::context::{GenerationContext, Phase};
use crate::inference::EngineError;

impl GenerationContext {
    /// Returns the embedding vector of the loaded prompt.
    ///
    /// The model must have been loaded with embeddings enabled. Generation
    /// state is left untouched, so the prompt can still be completed after.
    pub fn get_embedding(&mut self) -> Result<Vec<f32>, EngineError> {
        let (model, state) = self.split()?;
        state.expect_phase(Phase::PromptLoaded, "compute an embedding")?;

        if !model.info().embedding {
            warn!("Embedding requested but the model was loaded without embedding support");
            return Err(EngineError::EmbeddingUnsupported);
        }

        let mut tokens = state.embd.clone();
        if tokens.is_empty() {
            tokens.push(model.bos_token());
        }

        let mut session = model.new_session(&state.request.sampling, true)?;
        for (i, chunk) in tokens.chunks(model.n_batch()).enumerate() {
            session.eval(chunk, i * model.n_batch())?;
        }

        let embedding = session.embedding()?;
        debug!(
            n_tokens = tokens.len(),
            dim = embedding.len(),
            "Computed embedding"
        );
        Ok(embedding)
    }
}
