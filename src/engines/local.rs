//! # Local Engines
//!
//! Self-contained transcription and synthesis engines that need no external
//! service. They let the full voice loop run end to end on a developer
//! machine:
//!
//! - [`LocalTranscriber`] tracks speech energy. Voiced audio produces interim
//!   results; a stretch of silence after speech closes the sentence. It does
//!   not recognise words, so the transcript describes the utterance instead.
//! - [`LocalSynthesizer`] renders a short tone whose length follows the reply
//!   text, streamed in 100ms chunks.

use super::{
    AudioFormat, EngineError, SynthesisEvent, SynthesisHandle, SynthesisRequest, SynthesisSink,
    SynthesizerFactory, TranscriberFactory, TranscriberHandle, TranscriberState, TranscriptEvent,
    TranscriptSink,
};
use crate::audio::processor::{frame_duration_ms, rms_level, sine_pcm};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// RMS level above which a frame counts as speech.
const SPEECH_LEVEL: f32 = 0.02;
/// Trailing silence that ends a sentence.
const SENTENCE_GAP_MS: f64 = 700.0;
const PARTIAL_EVERY_MS: f64 = 500.0;

#[derive(Debug, Default)]
pub struct LocalTranscriber;

#[async_trait]
impl TranscriberFactory for LocalTranscriber {
    async fn start(
        &self,
        format: AudioFormat,
        events: TranscriptSink,
    ) -> Result<Arc<dyn TranscriberHandle>, EngineError> {
        debug!(sample_rate = format.sample_rate, "Starting local transcriber");
        Ok(Arc::new(LocalTranscription {
            format,
            events,
            progress: Mutex::new(Progress::default()),
        }))
    }
}

struct LocalTranscription {
    format: AudioFormat,
    events: TranscriptSink,
    progress: Mutex<Progress>,
}

#[derive(Debug)]
struct Progress {
    state: TranscriberState,
    voiced_ms: f64,
    silence_ms: f64,
    since_partial_ms: f64,
    last_sentence: Option<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: TranscriberState::Starting,
            voiced_ms: 0.0,
            silence_ms: 0.0,
            since_partial_ms: 0.0,
            last_sentence: None,
        }
    }
}

fn describe(voiced_ms: f64) -> String {
    format!("[{:.1}s of speech]", voiced_ms / 1000.0)
}

impl LocalTranscription {
    fn emit(&self, event: TranscriptEvent) {
        // The receiver goes away once the session drops this handle.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TranscriberHandle for LocalTranscription {
    fn state(&self) -> TranscriberState {
        self.progress.lock().state
    }

    async fn send(&self, frame: Bytes) -> Result<(), EngineError> {
        let mut progress = self.progress.lock();
        if !progress.state.accepts_audio() {
            return Err(EngineError::Closed);
        }
        progress.state = TranscriberState::Streaming;

        let duration = frame_duration_ms(frame.len(), self.format);
        if rms_level(&frame) >= SPEECH_LEVEL {
            progress.voiced_ms += duration;
            progress.silence_ms = 0.0;
            progress.since_partial_ms += duration;
            if progress.since_partial_ms >= PARTIAL_EVERY_MS {
                progress.since_partial_ms = 0.0;
                self.emit(TranscriptEvent::Partial(describe(progress.voiced_ms)));
            }
        } else if progress.voiced_ms > 0.0 {
            progress.silence_ms += duration;
            if progress.silence_ms >= SENTENCE_GAP_MS {
                let sentence = describe(progress.voiced_ms);
                progress.voiced_ms = 0.0;
                progress.silence_ms = 0.0;
                progress.since_partial_ms = 0.0;
                progress.last_sentence = Some(sentence.clone());
                self.emit(TranscriptEvent::SentenceEnd(sentence));
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let mut progress = self.progress.lock();
        if !progress.state.accepts_audio() {
            return Ok(());
        }
        progress.state = TranscriberState::Stopping;

        let text = if progress.voiced_ms > 0.0 {
            describe(progress.voiced_ms)
        } else {
            progress.last_sentence.clone().unwrap_or_default()
        };
        self.emit(TranscriptEvent::Completed(text));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.progress.lock().state = TranscriberState::Stopped;
        Ok(())
    }
}

pub struct LocalSynthesizer {
    chunk_interval: Duration,
}

impl LocalSynthesizer {
    pub fn new(chunk_interval: Duration) -> Self {
        Self { chunk_interval }
    }
}

struct LocalSynthesisJob {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SynthesisHandle for LocalSynthesisJob {
    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Pitch derived from the voice name so personas sound distinct.
fn voice_pitch(voice: &str) -> f32 {
    let spread = voice.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32)) % 160;
    140.0 + spread as f32
}

#[async_trait]
impl SynthesizerFactory for LocalSynthesizer {
    async fn start(
        &self,
        request: SynthesisRequest,
        events: SynthesisSink,
    ) -> Result<Arc<dyn SynthesisHandle>, EngineError> {
        if request.sample_rate == 0 {
            return Err(EngineError::Connect("sample rate must be greater than 0".to_string()));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let job_closed = closed.clone();
        let interval = self.chunk_interval;

        tokio::spawn(async move {
            let total_ms = (request.text.chars().count() as u64 * 60).clamp(300, 15_000);
            let chunk_samples = (request.sample_rate / 10) as usize;
            let chunks = total_ms.div_ceil(100);
            let pitch = voice_pitch(&request.voice);
            let mut phase = 0.0f32;

            for _ in 0..chunks {
                if job_closed.load(Ordering::SeqCst) {
                    debug!("Local synthesis closed early");
                    return;
                }
                let pcm = sine_pcm(pitch, 0.2, chunk_samples, request.sample_rate, &mut phase);
                if events.send(SynthesisEvent::Audio(Bytes::from(pcm))).is_err() {
                    return;
                }
                tokio::time::sleep(interval).await;
            }

            if !job_closed.load(Ordering::SeqCst) {
                let _ = events.send(SynthesisEvent::Complete);
            }
        });

        Ok(Arc::new(LocalSynthesisJob { closed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn format() -> AudioFormat {
        AudioFormat { sample_rate: 16_000, channels: 1, bit_depth: 16 }
    }

    fn speech(ms: usize) -> Bytes {
        let mut phase = 0.0;
        Bytes::from(sine_pcm(300.0, 0.3, ms * 16, 16_000, &mut phase))
    }

    fn silence(ms: usize) -> Bytes {
        Bytes::from(vec![0u8; ms * 32])
    }

    #[tokio::test]
    async fn test_speech_then_silence_ends_sentence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = LocalTranscriber.start(format(), tx).await.unwrap();
        assert_eq!(handle.state(), TranscriberState::Starting);

        for _ in 0..6 {
            handle.send(speech(100)).await.unwrap();
        }
        assert_eq!(handle.state(), TranscriberState::Streaming);
        for _ in 0..8 {
            handle.send(silence(100)).await.unwrap();
        }

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(TranscriptEvent::Partial(_))));
        assert_eq!(events.last(), Some(&TranscriptEvent::SentenceEnd("[0.6s of speech]".to_string())));
    }

    #[tokio::test]
    async fn test_stop_then_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = LocalTranscriber.start(format(), tx).await.unwrap();
        handle.send(speech(200)).await.unwrap();

        handle.stop().await.unwrap();
        assert_eq!(handle.state(), TranscriberState::Stopping);
        assert_eq!(rx.try_recv().unwrap(), TranscriptEvent::Completed("[0.2s of speech]".to_string()));
        assert_eq!(handle.send(speech(100)).await, Err(EngineError::Closed));

        handle.close().await.unwrap();
        assert_eq!(handle.state(), TranscriberState::Stopped);
    }

    #[tokio::test]
    async fn test_synthesizer_streams_then_completes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let synthesizer = LocalSynthesizer::new(Duration::from_millis(1));
        let request = SynthesisRequest {
            text: "hi".to_string(),
            voice: "neutral".to_string(),
            sample_rate: 16_000,
        };
        synthesizer.start(request, tx).await.unwrap();

        let mut audio_chunks = 0;
        while let Some(event) = rx.recv().await {
            match event {
                SynthesisEvent::Audio(pcm) => {
                    assert_eq!(pcm.len(), 3200);
                    audio_chunks += 1;
                }
                SynthesisEvent::Complete => break,
                SynthesisEvent::Failed(reason) => panic!("synthesis failed: {}", reason),
            }
        }
        // Short replies are padded to 300ms
        assert_eq!(audio_chunks, 3);
    }

    #[tokio::test]
    async fn test_closed_synthesis_stops_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let synthesizer = LocalSynthesizer::new(Duration::from_millis(5));
        let request = SynthesisRequest {
            text: "a much longer reply that would take several seconds to speak".to_string(),
            voice: "neutral".to_string(),
            sample_rate: 16_000,
        };
        let job = synthesizer.start(request, tx).await.unwrap();
        job.close().await.unwrap();

        let mut saw_complete = false;
        while let Some(event) = rx.recv().await {
            if event == SynthesisEvent::Complete {
                saw_complete = true;
            }
        }
        assert!(!saw_complete);
    }
}
