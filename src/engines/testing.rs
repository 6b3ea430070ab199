//! Scripted engines for tests.
//!
//! Each fake records how the session core drove it and lets the test push
//! engine events by hand, so timing-dependent flows become deterministic.

use super::{
    AudioFormat, ChatModel, EngineError, EngineSet, SynthesisEvent, SynthesisHandle,
    SynthesisRequest, SynthesisSink, SynthesizerFactory, TranscriberFactory, TranscriberHandle,
    TranscriberState, TranscriptEvent, TranscriptSink,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub struct FakeTranscriber {
    state: Mutex<TranscriberState>,
    events: TranscriptSink,
    pub frames: Mutex<Vec<Bytes>>,
    pub stops: AtomicUsize,
    pub closes: AtomicUsize,
    fail_teardown: bool,
}

impl FakeTranscriber {
    pub fn emit(&self, event: TranscriptEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_state(&self, state: TranscriberState) {
        *self.state.lock() = state;
    }

    pub fn frame_sizes(&self) -> Vec<usize> {
        self.frames.lock().iter().map(Bytes::len).collect()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriberHandle for FakeTranscriber {
    fn state(&self) -> TranscriberState {
        *self.state.lock()
    }

    async fn send(&self, frame: Bytes) -> Result<(), EngineError> {
        if !self.state().accepts_audio() {
            return Err(EngineError::Closed);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_state(TranscriberState::Stopping);
        if self.fail_teardown {
            return Err(EngineError::Request("stop refused".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.set_state(TranscriberState::Stopped);
        if self.fail_teardown {
            return Err(EngineError::Request("close refused".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTranscriberFactory {
    pub handles: Mutex<Vec<Arc<FakeTranscriber>>>,
    pub fail_start: AtomicBool,
    pub fail_teardown: AtomicBool,
    /// When set, each start waits for a permit before connecting.
    pub start_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeTranscriberFactory {
    pub fn started(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn handle(&self, index: usize) -> Arc<FakeTranscriber> {
        self.handles.lock()[index].clone()
    }

    pub fn latest(&self) -> Arc<FakeTranscriber> {
        self.handles.lock().last().cloned().expect("no transcriber started")
    }
}

#[async_trait]
impl TranscriberFactory for FakeTranscriberFactory {
    async fn start(
        &self,
        _format: AudioFormat,
        events: TranscriptSink,
    ) -> Result<Arc<dyn TranscriberHandle>, EngineError> {
        let gate = self.start_gate.lock().clone();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.map_err(|_| EngineError::Closed)?;
            permit.forget();
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Connect("engine unavailable".to_string()));
        }
        let handle = Arc::new(FakeTranscriber {
            state: Mutex::new(TranscriberState::Streaming),
            events,
            frames: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_teardown: self.fail_teardown.load(Ordering::SeqCst),
        });
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }
}

pub struct FakeSynthesis {
    pub request: SynthesisRequest,
    events: SynthesisSink,
    pub closes: AtomicUsize,
}

impl FakeSynthesis {
    pub fn emit(&self, event: SynthesisEvent) {
        let _ = self.events.send(event);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisHandle for FakeSynthesis {
    async fn close(&self) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSynthesizerFactory {
    pub jobs: Mutex<Vec<Arc<FakeSynthesis>>>,
}

impl FakeSynthesizerFactory {
    pub fn started(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn latest(&self) -> Arc<FakeSynthesis> {
        self.jobs.lock().last().cloned().expect("no synthesis started")
    }
}

#[async_trait]
impl SynthesizerFactory for FakeSynthesizerFactory {
    async fn start(
        &self,
        request: SynthesisRequest,
        events: SynthesisSink,
    ) -> Result<Arc<dyn SynthesisHandle>, EngineError> {
        let job = Arc::new(FakeSynthesis {
            request,
            events,
            closes: AtomicUsize::new(0),
        });
        self.jobs.lock().push(job.clone());
        Ok(job)
    }
}

/// Records every prompt and answers with a fixed reply. With a gate set, each
/// call waits for a permit before answering.
pub struct FakeChat {
    pub calls: Mutex<Vec<(String, String)>>,
    reply: String,
    gate: Option<Arc<Semaphore>>,
}

impl FakeChat {
    pub fn new(reply: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            reply: reply.to_string(),
            gate: None,
        }
    }

    pub fn gated(reply: &str, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(reply)
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn last_call(&self) -> Option<(String, String)> {
        self.calls.lock().last().cloned()
    }
}

#[async_trait]
impl ChatModel for FakeChat {
    async fn reply(&self, system_prompt: &str, user_text: &str) -> Result<String, EngineError> {
        self.calls
            .lock()
            .push((system_prompt.to_string(), user_text.to_string()));
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| EngineError::Closed)?;
            permit.forget();
        }
        Ok(self.reply.clone())
    }
}

pub struct Fakes {
    pub transcriber: Arc<FakeTranscriberFactory>,
    pub synthesizer: Arc<FakeSynthesizerFactory>,
    pub chat: Arc<FakeChat>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with_chat(FakeChat::new("Indeed, a fine question."))
    }

    pub fn with_chat(chat: FakeChat) -> Self {
        Self {
            transcriber: Arc::new(FakeTranscriberFactory::default()),
            synthesizer: Arc::new(FakeSynthesizerFactory::default()),
            chat: Arc::new(chat),
        }
    }

    pub fn engine_set(&self) -> EngineSet {
        EngineSet {
            transcriber: self.transcriber.clone(),
            synthesizer: self.synthesizer.clone(),
            chat: self.chat.clone(),
        }
    }
}

/// Poll `condition` until it holds, yielding to spawned tasks in between.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Let spawned tasks run without waiting for a specific outcome.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
