//! Per-session state.
//!
//! A [`Session`] is shared between the connection loop, engine event pumps
//! and background timers. Quick field updates go through a `parking_lot`
//! mutex that is never held across an await; transcription start, stop and
//! restart additionally serialise on an async `lifecycle` lock.

use crate::engines::{SynthesisHandle, TranscriberHandle};
use crate::persona::Persona;
use crate::protocol::{ClientFrame, Outbound};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

struct SessionInner {
    persona: Arc<Persona>,
    transcriber: Option<Arc<dyn TranscriberHandle>>,
    /// Bumped each time a transcriber is installed. Engine events carry the
    /// utterance they were produced for and are ignored once it moves on.
    utterance: u64,
    ai_triggered: bool,
    synthesizer: Option<Arc<dyn SynthesisHandle>>,
    last_activity: Instant,
}

pub struct Session {
    id: String,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    inner: Mutex<SessionInner>,
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("persona", &inner.persona.id)
            .field("utterance", &inner.utterance)
            .field("transcribing", &inner.transcriber.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(id: String, outbound: mpsc::UnboundedSender<ClientFrame>, persona: Arc<Persona>) -> Self {
        Self {
            id,
            outbound,
            inner: Mutex::new(SessionInner {
                persona,
                transcriber: None,
                utterance: 0,
                ai_triggered: false,
                synthesizer: None,
                last_activity: Instant::now(),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Queue a message for the client. A closed transport is not an error:
    /// the session is about to be torn down anyway.
    pub fn send(&self, message: Outbound) {
        if self.outbound.send(message.into()).is_err() {
            debug!(session_id = %self.id, "Transport closed, dropping outbound message");
        }
    }

    pub fn send_binary(&self, audio: Bytes) {
        if self.outbound.send(ClientFrame::Binary(audio)).is_err() {
            debug!(session_id = %self.id, "Transport closed, dropping audio frame");
        }
    }

    pub fn is_transport_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    pub fn persona(&self) -> Arc<Persona> {
        self.inner.lock().persona.clone()
    }

    /// Swap the persona, returning the previous one.
    pub fn set_persona(&self, persona: Arc<Persona>) -> Arc<Persona> {
        std::mem::replace(&mut self.inner.lock().persona, persona)
    }

    pub fn transcriber(&self) -> Option<Arc<dyn TranscriberHandle>> {
        self.inner.lock().transcriber.clone()
    }

    pub fn utterance(&self) -> u64 {
        self.inner.lock().utterance
    }

    pub fn ai_triggered(&self) -> bool {
        self.inner.lock().ai_triggered
    }

    /// Install a fresh transcriber and open a new utterance window.
    /// Returns the utterance number its events must carry.
    pub(crate) fn install_transcriber(&self, handle: Arc<dyn TranscriberHandle>) -> u64 {
        let mut inner = self.inner.lock();
        inner.transcriber = Some(handle);
        inner.utterance += 1;
        inner.ai_triggered = false;
        inner.utterance
    }

    pub(crate) fn take_transcriber(&self) -> Option<Arc<dyn TranscriberHandle>> {
        self.inner.lock().transcriber.take()
    }

    /// Claim the single AI turn of `utterance`. Only the first caller for the
    /// current utterance wins.
    pub(crate) fn claim_ai_turn(&self, utterance: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.utterance != utterance || inner.ai_triggered {
            return false;
        }
        inner.ai_triggered = true;
        true
    }

    #[cfg(test)]
    pub fn is_synthesizing(&self) -> bool {
        self.inner.lock().synthesizer.is_some()
    }

    pub(crate) fn replace_synthesizer(&self, handle: Arc<dyn SynthesisHandle>) -> Option<Arc<dyn SynthesisHandle>> {
        self.inner.lock().synthesizer.replace(handle)
    }

    pub(crate) fn take_synthesizer(&self) -> Option<Arc<dyn SynthesisHandle>> {
        self.inner.lock().synthesizer.take()
    }

    pub(crate) fn is_current_synthesizer(&self, handle: &Arc<dyn SynthesisHandle>) -> bool {
        self.inner
            .lock()
            .synthesizer
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    /// Clear the synthesizer slot if it still holds `handle`.
    pub(crate) fn clear_synthesizer_if(&self, handle: &Arc<dyn SynthesisHandle>) -> bool {
        let mut inner = self.inner.lock();
        if inner
            .synthesizer
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            inner.synthesizer = None;
            return true;
        }
        false
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::testing::Fakes;
    use crate::engines::{AudioFormat, TranscriberFactory};
    use crate::persona::PersonaStore;

    fn session() -> (Session, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let personas = PersonaStore::with_builtin("default");
        (Session::new("s1".to_string(), tx, personas.resolve("default")), rx)
    }

    #[tokio::test]
    async fn test_ai_turn_claimed_once_per_utterance() {
        let (session, _rx) = session();
        let fakes = Fakes::new();
        let (events, _) = mpsc::unbounded_channel();
        let format = AudioFormat { sample_rate: 16_000, channels: 1, bit_depth: 16 };

        let first = session.install_transcriber(fakes.transcriber.start(format, events.clone()).await.unwrap());
        assert!(session.claim_ai_turn(first));
        assert!(!session.claim_ai_turn(first));

        let second = session.install_transcriber(fakes.transcriber.start(format, events).await.unwrap());
        assert!(!session.claim_ai_turn(first));
        assert!(session.claim_ai_turn(second));
    }

    #[test]
    fn test_persona_swap_returns_previous() {
        let (session, _rx) = session();
        let personas = PersonaStore::with_builtin("default");
        let previous = session.set_persona(personas.resolve("einstein"));
        assert_eq!(previous.id, "default");
        assert_eq!(session.persona().id, "einstein");
    }

    #[test]
    fn test_send_after_transport_closed_is_silent() {
        let (session, rx) = session();
        assert!(session.is_transport_open());
        drop(rx);
        assert!(!session.is_transport_open());
        session.send(Outbound::status("s1", "hello"));
    }
}
