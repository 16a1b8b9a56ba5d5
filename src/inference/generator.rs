//! Single-step token generation
//!
//! The only place that runs the forward pass. It never looks at text; stop
//! strings and UTF-8 reassembly belong to the completion driver.

use tracing::{debug, error, warn};

use crate::inference::backend::{InferenceSession, ModelBackend};
use crate::inference::context::GenerationState;
use crate::inference::EngineError;
use crate::types::CompletionTokenOutput;

impl GenerationState {
    /// Evaluates pending tokens, samples one token and updates the counters.
    ///
    /// Sets `stopped_eos` on an end-of-generation token and `stopped_limit`
    /// when a bounded budget reaches zero; either clears `has_next_token`.
    pub(crate) fn next_token(
        &mut self,
        model: &dyn ModelBackend,
        session: &mut dyn InferenceSession,
    ) -> Result<CompletionTokenOutput, EngineError> {
        let n_ctx = model.n_ctx().max(1);

        if self.embd.is_empty() {
            self.embd.push(model.bos_token());
        }

        if self.embd.len() >= n_ctx {
            self.shift_context();
            session.clear();
        }

        while self.n_past < self.embd.len() {
            let n_eval = (self.embd.len() - self.n_past).min(model.n_batch());
            let batch = &self.embd[self.n_past..self.n_past + n_eval];
            if let Err(e) = session.eval(batch, self.n_past) {
                error!(n_past = self.n_past, n_eval, "Failed to evaluate tokens: {e}");
                self.has_next_token = false;
                return Err(e);
            }
            self.n_past += n_eval;
        }

        let output = match session.sample(self.last_n_tokens.make_contiguous(), self.request.n_probs) {
            Ok(output) => output,
            Err(e) => {
                error!("Failed to sample: {e}");
                self.has_next_token = false;
                return Err(e);
            }
        };

        self.remember(output.token);
        self.num_tokens_predicted += 1;
        self.embd.push(output.token);
        if self.n_remain > 0 {
            self.n_remain -= 1;
        }

        if model.is_end_of_generation(output.token) {
            debug!(
                tokens_predicted = self.num_tokens_predicted,
                "End of generation token encountered"
            );
            self.stopped_eos = true;
            self.has_next_token = false;
        } else if self.n_remain == 0 {
            debug!(
                tokens_predicted = self.num_tokens_predicted,
                "Token budget exhausted"
            );
            self.stopped_limit = true;
            self.has_next_token = false;
        }

        Ok(output)
    }

    /// Keeps the first `n_keep` tokens plus the newer half of the rest.
    ///
    /// The KV cache is dropped, so everything kept is evaluated again.
    fn shift_context(&mut self) {
        let n_keep = self.n_keep.min(self.embd.len());
        let n_left = self.embd.len() - n_keep;
        let n_tail = (n_left / 2).max(1);

        let mut kept = self.embd[..n_keep].to_vec();
        kept.extend_from_slice(&self.embd[self.embd.len() - n_tail..]);

        warn!(
            n_keep,
            n_discarded = self.embd.len() - kept.len(),
            "Context window full, discarding older tokens"
        );
        self.embd = kept;
        self.n_past = 0;
        self.truncated = true;
    }
}
