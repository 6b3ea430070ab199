//! # Engine Contracts
//!
//! The session core talks to three external capabilities, each behind a trait:
//!
//! - **Transcription**: a streaming speech-to-text connection. A factory opens
//!   one handle per utterance window; the handle accepts PCM frames and the
//!   engine pushes [`TranscriptEvent`]s into the sink it was given.
//! - **Synthesis**: text-to-speech. A factory starts one job per reply; audio
//!   arrives as [`SynthesisEvent`]s and the handle can only be closed.
//! - **Chat**: a single request/response completion with a system prompt.
//!
//! Events flow through unbounded `mpsc` channels, so an engine adapter never
//! blocks on the session and the session never runs engine callbacks on the
//! engine's own task.

pub mod chat;
pub mod local;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use chat::build_chat_model;
pub use local::{LocalSynthesizer, LocalTranscriber};

/// PCM format negotiated with the transcription engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl AudioFormat {
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bit_depth as u32 / 8)
    }
}

/// Lifecycle of one transcription handle.
///
/// `Starting → Streaming → Stopping → Stopped`. Audio is only accepted while
/// the handle is starting or streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriberState {
    Starting,
    Streaming,
    Stopping,
    Stopped,
}

impl TranscriberState {
    pub fn accepts_audio(self) -> bool {
        matches!(self, TranscriberState::Starting | TranscriberState::Streaming)
    }
}

impl fmt::Display for TranscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TranscriberState::Starting => "starting",
            TranscriberState::Streaming => "streaming",
            TranscriberState::Stopping => "stopping",
            TranscriberState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Interim hypothesis for the sentence in progress.
    Partial(String),
    /// A sentence boundary with its final text.
    SentenceEnd(String),
    /// The engine finished after a stop request. Carries whatever text it
    /// settled on, which may be empty.
    Completed(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    Audio(Bytes),
    Complete,
    Failed(String),
}

pub type TranscriptSink = mpsc::UnboundedSender<TranscriptEvent>;
pub type SynthesisSink = mpsc::UnboundedSender<SynthesisEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("failed to connect to engine: {0}")]
    Connect(String),

    #[error("engine request failed: {0}")]
    Request(String),

    #[error("engine connection is closed")]
    Closed,
}

/// A live streaming-recognition connection.
#[async_trait]
pub trait TranscriberHandle: Send + Sync {
    fn state(&self) -> TranscriberState;

    async fn send(&self, frame: Bytes) -> Result<(), EngineError>;

    /// Ask the engine to finish the current utterance. The engine answers
    /// with [`TranscriptEvent::Completed`].
    async fn stop(&self) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait TranscriberFactory: Send + Sync {
    async fn start(
        &self,
        format: AudioFormat,
        events: TranscriptSink,
    ) -> Result<Arc<dyn TranscriberHandle>, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub sample_rate: u32,
}

/// A running synthesis job. Closing it stops further audio events.
#[async_trait]
pub trait SynthesisHandle: Send + Sync {
    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait SynthesizerFactory: Send + Sync {
    async fn start(
        &self,
        request: SynthesisRequest,
        events: SynthesisSink,
    ) -> Result<Arc<dyn SynthesisHandle>, EngineError>;
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce one reply to `user_text` with `system_prompt` as the persona.
    async fn reply(&self, system_prompt: &str, user_text: &str) -> Result<String, EngineError>;
}

/// The engines a session registry drives.
#[derive(Clone)]
pub struct EngineSet {
    pub transcriber: Arc<dyn TranscriberFactory>,
    pub synthesizer: Arc<dyn SynthesizerFactory>,
    pub chat: Arc<dyn ChatModel>,
}
