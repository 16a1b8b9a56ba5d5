//! Completion driver
//!
//! Runs the generation loop: one token at a time, reassembling UTF-8 across
//! token boundaries, checking stop strings, and handing confirmed text to the
//! sink. Text that might still turn into a stop string is held back until a
//! later token settles it.

use tracing::debug;

use crate::inference::backend::{InferenceSession, ModelBackend};
use crate::inference::context::{GenerationContext, GenerationState, Phase};
use crate::inference::stop::StopType;
use crate::inference::streaming::{CancelFlag, CompletionSink};
use crate::inference::EngineError;

/// Extra tokens allowed past the budget to finish a split character
const MAX_BUDGET_EXTENSION: usize = 3;

impl GenerationContext {
    /// Generates until EOS, a stop string, the budget, or cancellation.
    ///
    /// Streaming requests hand each confirmed chunk to `sink` as it appears;
    /// otherwise `sink` receives the whole text once at the end.
    pub fn do_completion(
        &mut self,
        sink: &mut dyn CompletionSink,
        cancel: Option<&CancelFlag>,
    ) -> Result<(), EngineError> {
        let (model, state) = self.split()?;
        state.expect_phase(Phase::Generating, "run a completion")?;

        let result = model
            .new_session(&state.request.sampling, false)
            .and_then(|mut session| state.drive(model, session.as_mut(), sink, cancel));

        if result.is_err() {
            state.has_next_token = false;
        }
        state.phase = Phase::Stopped;
        result
    }
}

impl GenerationState {
    pub(crate) fn drive(
        &mut self,
        model: &dyn ModelBackend,
        session: &mut dyn InferenceSession,
        sink: &mut dyn CompletionSink,
        cancel: Option<&CancelFlag>,
    ) -> Result<(), EngineError> {
        // Bytes of generated_text already handed to the sink
        let mut sent = 0;
        // Bytes appended since the last stop string check
        let mut unchecked = 0;
        let mut extensions = 0;

        while self.has_next_token {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                debug!(
                    tokens_predicted = self.num_tokens_predicted,
                    "Generation cancelled by caller"
                );
                self.cancelled = true;
                self.has_next_token = false;
                break;
            }

            let output = self.next_token(model, session)?;
            if self.stopped_eos {
                break;
            }

            let bytes = model.token_to_bytes(output.token)?;
            self.token_text_offsets.push(self.generated_text.len());
            self.generated_token_probs.push(output);
            unchecked += self.append_token_bytes(&bytes);

            if self.multibyte_pending > 0 {
                if self.stopped_limit && extensions < MAX_BUDGET_EXTENSION {
                    extensions += 1;
                    debug!(
                        missing = self.multibyte_pending,
                        "Extending budget to finish a split character"
                    );
                    self.stopped_limit = false;
                    self.has_next_token = true;
                    self.n_remain += 1;
                }
                if self.has_next_token {
                    continue;
                }
            }
            if unchecked == 0 {
                continue;
            }

            let tail = &self.generated_text[sent..];
            let full = self
                .stop_matcher
                .find(tail, unchecked, StopType::Full)
                .map(|m| (sent + m.offset, m.word.to_owned()));
            let partial = match full {
                Some(_) => None,
                None => self
                    .stop_matcher
                    .find(tail, unchecked, StopType::Partial)
                    .map(|m| sent + m.offset),
            };
            unchecked = 0;

            if let Some((at, word)) = full {
                self.apply_full_stop(at, word);
            }

            if self.stream {
                let end = match partial {
                    Some(at) if self.has_next_token => at,
                    _ => self.generated_text.len(),
                };
                if end > sent {
                    sink.on_chunk(&self.generated_text[sent..end]);
                    sent = end;
                }
            }
        }

        if !self.pending_bytes.is_empty() {
            debug!(
                bytes = self.pending_bytes.len(),
                "Dropping an unfinished character at end of generation"
            );
            self.pending_bytes.clear();
            self.multibyte_pending = 0;

            // Tokens that only fed the dropped bytes produced no text
            let keep = self
                .token_text_offsets
                .partition_point(|&offset| offset < self.generated_text.len());
            self.token_text_offsets.truncate(keep);
            self.generated_token_probs.truncate(keep);
        }

        if self.stream {
            // Anything still held back was never confirmed as a stop string
            if sent < self.generated_text.len() {
                sink.on_chunk(&self.generated_text[sent..]);
            }
        } else if !self.generated_text.is_empty() {
            sink.on_chunk(&self.generated_text);
        }

        debug!(
            tokens_predicted = self.num_tokens_predicted,
            stop_reason = ?self.stop_reason(),
            "Completion finished"
        );
        Ok(())
    }

    /// Appends token bytes, committing every complete character.
    ///
    /// Returns the number of bytes added to `generated_text`. A trailing
    /// incomplete character stays in `pending_bytes`; invalid bytes become
    /// U+FFFD.
    pub(crate) fn append_token_bytes(&mut self, bytes: &[u8]) -> usize {
        let before = self.generated_text.len();
        self.pending_bytes.extend_from_slice(bytes);

        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(text) => {
                    self.generated_text.push_str(text);
                    self.pending_bytes.clear();
                    self.multibyte_pending = 0;
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.generated_text
                        .push_str(&String::from_utf8_lossy(&self.pending_bytes[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            self.generated_text.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + invalid);
                        }
                        None => {
                            self.pending_bytes.drain(..valid);
                            self.multibyte_pending = missing_utf8_bytes(&self.pending_bytes);
                            break;
                        }
                    }
                }
            }
        }

        self.generated_text.len() - before
    }

    /// Ends generation at a confirmed stop string starting at byte `at`
    fn apply_full_stop(&mut self, at: usize, word: String) {
        debug!(stopping_word = %word.escape_debug(), offset = at, "Stop string matched");

        self.generated_text.truncate(at);
        let keep = self.token_text_offsets.partition_point(|&offset| offset < at);
        self.token_text_offsets.truncate(keep);
        self.generated_token_probs.truncate(keep);

        self.stopping_word = word;
        self.stopped_word = true;
        // A stop string in the last budgeted token is reported as the stop word
        self.stopped_limit = false;
        self.has_next_token = false;
    }
}

/// Bytes still needed to complete the character `partial` begins
fn missing_utf8_bytes(partial: &[u8]) -> usize {
    let expected = match partial.first() {
        Some(b) if b & 0xE0 == 0xC0 => 2,
        Some(b) if b & 0xF0 == 0xE0 => 3,
        Some(b) if b & 0xF8 == 0xF0 => 4,
        _ => return 0,
    };
    expected - partial.len().min(expected)
}
