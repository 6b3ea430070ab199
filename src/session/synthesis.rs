//! AI turns and speech output.
//!
//! An AI turn narrates its progress to the client with status messages:
//! `thinking` while the chat model runs, then the reply itself, then
//! `synthesizing` while audio streams back. Synthesized audio is forwarded
//! as binary frames as it arrives and, on completion, once more as a single
//! base64 `audio_synthesis` message.
//!
//! A session holds at most one synthesis job. Starting a new one closes the
//! old one, and audio from a job that is no longer current is discarded.

use super::context::Session;
use super::registry::SessionRegistry;
use crate::engines::{SynthesisEvent, SynthesisHandle, SynthesisRequest};
use crate::error::VoiceResult;
use crate::protocol::Outbound;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::BytesMut;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

impl SessionRegistry {
    /// Run an AI turn for `user_text` in the background.
    pub(crate) fn spawn_ai_turn(self: &Arc<Self>, session_id: &str, user_text: &str) {
        let registry = self.clone();
        let session_id = session_id.to_string();
        let user_text = user_text.to_string();
        tokio::spawn(async move {
            registry.run_ai_turn(&session_id, &user_text).await;
        });
    }

    async fn run_ai_turn(self: &Arc<Self>, session_id: &str, user_text: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        self.stats.ai_turns.fetch_add(1, Ordering::Relaxed);
        session.send(Outbound::status(session_id, "thinking"));

        let persona = session.persona();
        let reply = match self.engines.chat.reply(&persona.personality, user_text).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Chat model failed");
                session.send(Outbound::error(Some(session_id), format!("AI reply failed: {}", e)));
                return;
            }
        };

        // The session may have ended while the model was thinking.
        let Some(session) = self.get(session_id) else {
            info!(session_id = %session_id, "Session ended during AI turn, discarding reply");
            return;
        };

        session.send(Outbound::AiResponse {
            session_id: session_id.to_string(),
            text: reply.clone(),
            is_streaming: false,
        });
        session.send(Outbound::status(session_id, "synthesizing"));

        if let Err(e) = self.speak(&session, &reply).await {
            warn!(session_id = %session_id, error = %e, "Failed to start synthesis");
            session.send(Outbound::error(Some(session_id), format!("speech synthesis failed: {}", e)));
        }
    }

    /// Start synthesizing `text` in the session's current voice.
    pub async fn speak(self: &Arc<Self>, session: &Arc<Session>, text: &str) -> VoiceResult<()> {
        let persona = session.persona();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let request = SynthesisRequest {
            text: text.to_string(),
            voice: persona.voice.clone(),
            sample_rate: self.synthesis_sample_rate,
        };

        let handle = self.engines.synthesizer.start(request, events_tx).await?;
        if let Some(previous) = session.replace_synthesizer(handle.clone()) {
            debug!(session_id = %session.id(), "Replacing running synthesis");
            if let Err(e) = previous.close().await {
                warn!(session_id = %session.id(), error = %e, "Failed to close previous synthesis");
            }
        }

        let session = session.clone();
        tokio::spawn(async move {
            forward_synthesis(session, handle, events_rx).await;
        });
        Ok(())
    }

    /// Cancel the session's synthesis job, if any.
    pub async fn cancel_synthesis(&self, session: &Session) {
        let Some(handle) = session.take_synthesizer() else {
            session.send(Outbound::status(session.id(), "no speech synthesis running"));
            return;
        };

        match handle.close().await {
            Ok(()) => {
                info!(session_id = %session.id(), "Speech synthesis stopped");
                session.send(Outbound::status(session.id(), "speech synthesis stopped"));
            }
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Failed to stop speech synthesis");
                session.send(Outbound::error(Some(session.id()), format!("failed to stop speech synthesis: {}", e)));
            }
        }
    }
}

async fn forward_synthesis(
    session: Arc<Session>,
    handle: Arc<dyn SynthesisHandle>,
    mut events: mpsc::UnboundedReceiver<SynthesisEvent>,
) {
    let mut aggregate = BytesMut::new();

    while let Some(event) = events.recv().await {
        if !session.is_current_synthesizer(&handle) {
            debug!(session_id = %session.id(), "Synthesis cancelled, discarding remaining audio");
            return;
        }

        match event {
            SynthesisEvent::Audio(audio) => {
                aggregate.extend_from_slice(&audio);
                session.send_binary(audio);
            }
            SynthesisEvent::Complete => {
                session.send(Outbound::AudioSynthesis {
                    session_id: session.id().to_string(),
                    audio: BASE64.encode(&aggregate),
                    is_complete: true,
                });
                session.send(Outbound::status(session.id(), "speech synthesis complete"));
                break;
            }
            SynthesisEvent::Failed(reason) => {
                warn!(session_id = %session.id(), reason = %reason, "Speech synthesis failed");
                session.send(Outbound::error(Some(session.id()), format!("speech synthesis failed: {}", reason)));
                break;
            }
        }
    }

    if session.clear_synthesizer_if(&handle) {
        if let Err(e) = handle.close().await {
            warn!(session_id = %session.id(), error = %e, "Failed to close finished synthesis");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engines::testing::{eventually, settle, FakeChat, Fakes};
    use crate::engines::{SynthesisEvent, TranscriptEvent};
    use crate::protocol::ClientFrame;
    use crate::session::registry::tests::{drain, registry};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Semaphore};

    #[tokio::test]
    async fn test_ai_turn_narrates_and_streams_audio() {
        let fakes = Fakes::new();
        let registry = registry(&fakes);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.create_session("s1", tx, "shakespeare").await.unwrap();
        drain(&mut rx);

        fakes.transcriber.latest().emit(TranscriptEvent::SentenceEnd("to be?".to_string()));
        eventually(|| fakes.synthesizer.started() == 1).await;

        let job = fakes.synthesizer.latest();
        assert_eq!(job.request.text, "Indeed, a fine question.");
        assert_eq!(job.request.voice, "mature-male");

        job.emit(SynthesisEvent::Audio(Bytes::from_static(&[1, 2])));
        job.emit(SynthesisEvent::Audio(Bytes::from_static(&[3])));
        job.emit(SynthesisEvent::Complete);
        eventually(|| job.close_count() == 1).await;

        let mut binary = Vec::new();
        let mut texts = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                ClientFrame::Binary(audio) => binary.push(audio),
                ClientFrame::Text(text) => texts.push(serde_json::from_str::<crate::protocol::Envelope>(&text).unwrap()),
            }
        }
        assert_eq!(binary, vec![Bytes::from_static(&[1, 2]), Bytes::from_static(&[3])]);

        let kinds: Vec<_> = texts
            .iter()
            .map(|e| (e.kind.clone().unwrap(), e.status.clone()))
            .collect();
        let position = |kind: &str, status: Option<&str>| {
            kinds
                .iter()
                .position(|(k, s)| k == kind && s.as_deref() == status)
                .unwrap_or_else(|| panic!("missing {} {:?}", kind, status))
        };
        assert!(position("status", Some("thinking")) < position("ai_response", None));
        assert!(position("ai_response", None) < position("status", Some("synthesizing")));
        assert!(position("status", Some("synthesizing")) < position("audio_synthesis", None));

        let synthesis = texts.iter().find(|e| e.kind.as_deref() == Some("audio_synthesis")).unwrap();
        assert_eq!(synthesis.is_complete, Some(true));
        assert_eq!(synthesis.data.as_deref(), Some(BASE64.encode([1u8, 2, 3]).as_str()));
    }

    #[tokio::test]
    async fn test_stop_tts_cancels_and_discards_audio() {
        let fakes = Fakes::new();
        let registry = registry(&fakes);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = registry.create_session("s1", tx, "default").await.unwrap();

        registry.speak(&session, "a long answer").await.unwrap();
        let job = fakes.synthesizer.latest();
        registry.cancel_synthesis(&session).await;
        assert_eq!(job.close_count(), 1);
        assert!(!session.is_synthesizing());
        drain(&mut rx);

        job.emit(SynthesisEvent::Audio(Bytes::from_static(&[9, 9])));
        job.emit(SynthesisEvent::Complete);
        settle().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(job.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_tts_without_synthesis() {
        let fakes = Fakes::new();
        let registry = registry(&fakes);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = registry.create_session("s1", tx, "default").await.unwrap();
        drain(&mut rx);

        registry.cancel_synthesis(&session).await;
        let sent = drain(&mut rx);
        assert_eq!(sent[0].status.as_deref(), Some("no speech synthesis running"));
    }

    #[tokio::test]
    async fn test_new_synthesis_replaces_running_one() {
        let fakes = Fakes::new();
        let registry = registry(&fakes);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.create_session("s1", tx, "default").await.unwrap();

        registry.speak(&session, "first").await.unwrap();
        let first = fakes.synthesizer.latest();
        registry.speak(&session, "second").await.unwrap();

        assert_eq!(first.close_count(), 1);
        assert_eq!(fakes.synthesizer.started(), 2);
        assert!(session.is_synthesizing());
    }

    #[tokio::test]
    async fn test_reply_after_session_ended_is_discarded() {
        let gate = Arc::new(Semaphore::new(0));
        let fakes = Fakes::with_chat(FakeChat::gated("too late", gate.clone()));
        let registry = registry(&fakes);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.create_session("s1", tx, "default").await.unwrap();

        registry.process_text(&session, "are you there?").await.unwrap();
        eventually(|| fakes.chat.call_count() == 1).await;

        registry.end_session("s1").await;
        gate.add_permits(1);
        settle().await;

        assert_eq!(fakes.synthesizer.started(), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_reported() {
        let fakes = Fakes::new();
        let registry = registry(&fakes);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = registry.create_session("s1", tx, "default").await.unwrap();
        registry.speak(&session, "hi").await.unwrap();
        drain(&mut rx);

        let job = fakes.synthesizer.latest();
        job.emit(SynthesisEvent::Failed("voice not found".to_string()));
        eventually(|| !session.is_synthesizing()).await;

        let sent = drain(&mut rx);
        assert_eq!(sent[0].error.as_deref(), Some("speech synthesis failed: voice not found"));
    }
}
