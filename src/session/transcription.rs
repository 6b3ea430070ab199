//! Transcription control.
//!
//! Each transcriber handle covers one utterance window. Starting a window
//! tears down the previous handle, opens a new one, arms keep-alive and
//! spawns a pump task that drains the engine's event channel. Events are
//! tagged with the window's utterance number; once a newer window exists,
//! late events from the old engine are discarded.
//!
//! The first sentence end of a window (or, failing that, the engine's
//! completion) claims the window's single AI turn and asks the engine to
//! stop. A new window only opens on an explicit `start_transcriber`.

use super::context::Session;
use super::registry::SessionRegistry;
use crate::engines::{TranscriberHandle, TranscriptEvent};
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::Outbound;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

impl SessionRegistry {
    /// Open a new utterance window, replacing any running transcriber.
    pub async fn start_transcription(self: &Arc<Self>, session: &Arc<Session>) -> VoiceResult<()> {
        let _lifecycle = session.lifecycle.lock().await;
        if session.is_closed() {
            return Err(VoiceError::SessionNotActive);
        }

        if let Some(previous) = session.take_transcriber() {
            self.keep_alive.cancel(session.id());
            self.close_transcriber(session.id(), previous).await;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = self
            .engines
            .transcriber
            .start(self.audio_format, events_tx)
            .await?;

        let utterance = session.install_transcriber(handle.clone());
        self.keep_alive.register(session.id(), handle, Instant::now());

        let registry = self.clone();
        let session_id = session.id().to_string();
        tokio::spawn(async move {
            registry.pump_transcript_events(session_id, utterance, events_rx).await;
        });

        info!(session_id = %session.id(), utterance, "Transcriber started");
        Ok(())
    }

    /// Client-requested restart of transcription.
    pub async fn restart_transcription(self: &Arc<Self>, session: &Arc<Session>) -> VoiceResult<()> {
        self.start_transcription(session).await?;
        session.send(Outbound::status(session.id(), "transcriber started, listening"));
        Ok(())
    }

    /// Stop the transcriber of `session_id` if it still belongs to
    /// `utterance`. A restart that already replaced it wins.
    pub(crate) async fn stop_transcription(&self, session_id: &str, utterance: u64) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let _lifecycle = session.lifecycle.lock().await;
        if session.utterance() != utterance {
            debug!(session_id = %session_id, utterance, "Transcriber already replaced, skipping stop");
            return;
        }

        if let Some(handle) = session.take_transcriber() {
            self.keep_alive.cancel(session_id);
            self.close_transcriber(session_id, handle).await;
        }
    }

    /// Stop then close a handle. Failures are logged; the handle is released
    /// either way.
    pub(crate) async fn close_transcriber(&self, session_id: &str, handle: Arc<dyn TranscriberHandle>) {
        if handle.state().accepts_audio() {
            if let Err(e) = handle.stop().await {
                warn!(session_id = %session_id, error = %e, "Failed to stop transcriber");
            }
        }
        if handle.state() != crate::engines::TranscriberState::Stopped {
            if let Err(e) = handle.close().await {
                warn!(session_id = %session_id, error = %e, "Failed to close transcriber");
            }
        }
        debug!(session_id = %session_id, "Transcriber released");
    }

    async fn pump_transcript_events(
        self: Arc<Self>,
        session_id: String,
        utterance: u64,
        mut events: mpsc::UnboundedReceiver<TranscriptEvent>,
    ) {
        while let Some(event) = events.recv().await {
            self.on_transcript_event(&session_id, utterance, event);
        }
        debug!(session_id = %session_id, utterance, "Transcript event stream closed");
    }

    pub(crate) fn on_transcript_event(self: &Arc<Self>, session_id: &str, utterance: u64, event: TranscriptEvent) {
        let Some(session) = self.get(session_id) else {
            debug!(session_id = %session_id, "Transcript event for ended session");
            return;
        };
        if session.utterance() != utterance {
            debug!(session_id = %session_id, utterance, current = session.utterance(), "Ignoring stale transcript event");
            return;
        }

        match event {
            TranscriptEvent::Partial(text) => {
                if !text.trim().is_empty() {
                    session.send(Outbound::Transcription {
                        session_id: session_id.to_string(),
                        text,
                        is_final: false,
                    });
                }
            }
            TranscriptEvent::SentenceEnd(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return;
                }
                session.send(Outbound::Transcription {
                    session_id: session_id.to_string(),
                    text: text.clone(),
                    is_final: true,
                });

                if session.claim_ai_turn(utterance) {
                    info!(session_id = %session_id, utterance, "Sentence complete, starting AI turn");
                    let registry = self.clone();
                    let id = session_id.to_string();
                    tokio::spawn(async move {
                        registry.stop_transcription(&id, utterance).await;
                    });
                    self.spawn_ai_turn(session_id, &text);
                }
            }
            TranscriptEvent::Completed(text) => {
                session.send(Outbound::status(session_id, "transcription complete"));
                let text = text.trim();
                if session.claim_ai_turn(utterance) && !text.is_empty() {
                    info!(session_id = %session_id, utterance, "Transcription completed without a sentence end, starting AI turn");
                    self.spawn_ai_turn(session_id, text);
                }
            }
            TranscriptEvent::Failed(reason) => {
                warn!(session_id = %session_id, reason = %reason, "Transcription failed");
                session.send(Outbound::error(Some(session_id), format!("transcription failed: {}", reason)));
            }
        }
    }
}
