//! Streaming output
//!
//! Sinks receive generated text as it is confirmed. Every chunk handed to a
//! sink is complete UTF-8 and chunks arrive in generation order, on the thread
//! running the completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Receives confirmed chunks of generated text
pub trait CompletionSink {
    fn on_chunk(&mut self, chunk: &str);
}

impl<F: FnMut(&str)> CompletionSink for F {
    fn on_chunk(&mut self, chunk: &str) {
        self(chunk)
    }
}

/// Represents an item emitted by a background completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A confirmed chunk of generated text
    Token(String),
    /// Generation completed successfully
    Done,
    /// An error occurred during generation
    Error(String),
}

impl StreamToken {
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }
}

/// Forwards chunks into a channel as [`StreamToken::Token`]
pub struct ChannelSink {
    tx: Sender<StreamToken>,
    cancel: CancelFlag,
}

impl ChannelSink {
    /// `cancel` is raised once the receiver hangs up
    pub fn new(tx: Sender<StreamToken>, cancel: CancelFlag) -> Self {
        Self { tx, cancel }
    }
}

impl CompletionSink for ChannelSink {
    fn on_chunk(&mut self, chunk: &str) {
        if self.tx.send(StreamToken::Token(chunk.to_owned())).is_err() {
            tracing::debug!("Receiver dropped, cancelling generation");
            self.cancel.cancel();
        }
    }
}

/// Cooperative cancellation, checked once per generated token
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_stream_token_variants() {
        let token = StreamToken::Token("hello".to_string());
        assert!(token.is_token());
        assert_eq!(token.as_token(), Some("hello"));

        assert!(StreamToken::Done.is_done());
        assert!(StreamToken::Error("boom".to_string()).is_error());
        assert_eq!(StreamToken::Done.as_token(), None);
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |chunk: &str| seen.push(chunk.to_string());
            sink.on_chunk("a");
            sink.on_chunk("b");
        }
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_channel_sink_cancels_when_receiver_gone() {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelFlag::new();
        let mut sink = ChannelSink::new(tx, cancel.clone());

        sink.on_chunk("first");
        assert_eq!(rx.recv().unwrap(), StreamToken::Token("first".to_string()));
        assert!(!cancel.is_cancelled());

        drop(rx);
        sink.on_chunk("second");
        assert!(cancel.is_cancelled());
    }
}
