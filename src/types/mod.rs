//! Wire types
//!
//! Requests consumed and responses produced by the session entry points.

pub mod request;
pub mod response;

pub use request::{
    CompletionRequest, DetokenizeRequest, EmbeddingRequest, SamplingParams, TokenizeRequest,
};
pub use response::{
    CompletionProbability, CompletionResponse, CompletionTokenOutput, DetokenizeResponse,
    EmbeddingResponse, StopReason, StreamChunk, TokenProb, TokenProbReport, TokenizeResponse,
};
