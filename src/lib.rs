//! illama server library
//!
//! Streaming text generation on top of a loaded llama.cpp model: prompt
//! loading, token-by-token generation with stop strings and length limits,
//! incremental delivery of complete UTF-8 text, and embeddings.

pub mod inference;
pub mod server;
pub mod storage;
pub mod types;

pub use inference::{
    CancelFlag, CompletionSink, EngineError, GenerationContext, SessionHandle, StreamToken,
};
pub use server::{run_server_with, Launch};
#[cfg(feature = "llama")]
pub use server::run_server;

/// Largest char boundary of `s` that is `<= index`, never panics.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut end = index;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Safely truncate a string at a char boundary, for log previews.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    &s[..floor_char_boundary(s, max_bytes)]
}
