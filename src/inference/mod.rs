//! Inference engine
//!
//! Model loading, the per-model generation context and everything that runs
//! a request through it: prompt loading, token generation, stop detection,
//! streaming and embeddings.

pub mod backend;
mod completion;
pub mod context;
mod embedding;
pub mod error;
mod generator;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
#[cfg(test)]
pub(crate) mod scripted;
pub mod session;
pub mod stop;
pub mod streaming;

pub use backend::{InferenceSession, ModelBackend, Token};
pub use context::{GenerationContext, Phase};
pub use error::EngineError;
pub use model::{validate_gguf, LoadedModelInfo, ModelError, ModelParams, GGUF_MAGIC};
pub use session::{CompletionStream, SessionHandle};
pub use stop::{StopMatch, StopMatcher, StopType};
pub use streaming::{CancelFlag, ChannelSink, CompletionSink, StreamToken};
