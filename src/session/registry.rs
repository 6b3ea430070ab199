//! # Session Registry
//!
//! The registry owns every live voice session and the shared machinery they
//! use: engine factories, the persona store, the fragment reassembler and the
//! keep-alive scheduler. Sessions are keyed by id in a `DashMap`, so lookups
//! from connection loops, engine pumps and timers never contend on a single
//! lock.
//!
//! The session controllers are split across sibling modules as further
//! `impl SessionRegistry` blocks:
//! - `transcription`: transcriber start/stop and recognition events
//! - `synthesis`: AI turns and speech output
//! - `reaper`: inactivity expiry
//! - `connection`: per-connection dispatch of client frames

use super::context::Session;
use super::keepalive::KeepAliveScheduler;
use crate::audio::chunks::{ChunkFragment, ChunkReassembler};
use crate::audio::processor::AudioProcessor;
use crate::config::SessionConfig;
use crate::engines::{AudioFormat, EngineSet};
use crate::error::{VoiceError, VoiceResult};
use crate::persona::PersonaStore;
use crate::protocol::{ChunkMeta, ClientFrame, Outbound};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifetime counters exposed on the metrics endpoint.
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub(crate) created: AtomicU64,
    pub(crate) ended: AtomicU64,
    pub(crate) reaped: AtomicU64,
    pub(crate) ai_turns: AtomicU64,
    pub(crate) audio_frames: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_ended: u64,
    pub sessions_reaped: u64,
    pub ai_turns: u64,
    pub audio_frames: u64,
    pub pending_chunk_sets: usize,
    pub keep_alive_entries: usize,
}

pub struct SessionRegistry {
    pub(crate) sessions: DashMap<String, Arc<Session>>,
    pub(crate) chunks: ChunkReassembler,
    pub(crate) keep_alive: Arc<KeepAliveScheduler>,
    pub(crate) engines: EngineSet,
    pub(crate) personas: Arc<PersonaStore>,
    pub(crate) config: SessionConfig,
    pub(crate) audio_format: AudioFormat,
    pub(crate) synthesis_sample_rate: u32,
    pub(crate) processor: AudioProcessor,
    pub(crate) stats: RegistryStats,
    /// Slots taken against `max_concurrent_sessions`. Reserved before a
    /// session is inserted and released when it is removed.
    slots: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        audio_format: AudioFormat,
        synthesis_sample_rate: u32,
        engines: EngineSet,
        personas: Arc<PersonaStore>,
    ) -> Self {
        let processor = AudioProcessor::new(
            audio_format,
            config.min_audio_frame_bytes,
            config.keep_alive_frame_bytes,
        );
        let keep_alive = Arc::new(KeepAliveScheduler::new(
            config.keep_alive_interval(),
            processor.silence_frame(),
        ));

        Self {
            sessions: DashMap::new(),
            chunks: ChunkReassembler::new(config.missing_fragment_policy),
            keep_alive,
            engines,
            personas,
            config,
            audio_format,
            synthesis_sample_rate,
            processor,
            stats: RegistryStats::default(),
            slots: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    #[cfg(test)]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn keep_alive(&self) -> &Arc<KeepAliveScheduler> {
        &self.keep_alive
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            active_sessions: self.sessions.len(),
            sessions_created: self.stats.created.load(Ordering::Relaxed),
            sessions_ended: self.stats.ended.load(Ordering::Relaxed),
            sessions_reaped: self.stats.reaped.load(Ordering::Relaxed),
            ai_turns: self.stats.ai_turns.load(Ordering::Relaxed),
            audio_frames: self.stats.audio_frames.load(Ordering::Relaxed),
            pending_chunk_sets: self.chunks.pending_count(),
            keep_alive_entries: self.keep_alive.len(),
        }
    }

    /// Register a session and open its first transcription window.
    ///
    /// A transcriber that fails to start is reported to the client but does
    /// not undo the session; the client can retry with `start_transcriber`.
    pub async fn create_session(
        self: &Arc<Self>,
        session_id: &str,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        persona_id: &str,
    ) -> VoiceResult<Arc<Session>> {
        let persona = self.personas.resolve(persona_id);
        let session = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => return Err(VoiceError::SessionExists(session_id.to_string())),
            Entry::Vacant(slot) => {
                if !self.reserve_slot() {
                    warn!(session_id = %session_id, limit = self.config.max_concurrent_sessions, "Session limit reached");
                    return Err(VoiceError::SessionLimit(self.config.max_concurrent_sessions));
                }
                let session = Arc::new(Session::new(session_id.to_string(), outbound, persona.clone()));
                slot.insert(session.clone());
                session
            }
        };
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %session_id, persona = %persona.id, "Voice session created");

        match self.start_transcription(&session).await {
            Ok(()) => session.send(Outbound::status(
                session_id,
                format!("session started with {}, ready to listen", persona.name),
            )),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Transcriber failed to start for new session");
                session.send(Outbound::error(Some(session_id), format!("failed to start transcription: {}", e)));
            }
        }
        Ok(session)
    }

    /// Tear a session down. Safe to call for unknown or already-ended ids.
    ///
    /// Transcriber stop/close failures are logged and never abort teardown.
    /// A synthesis job that is already running is left to finish on its own.
    pub async fn end_session(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            debug!(session_id = %session_id, "End requested for unknown session");
            return false;
        };
        self.teardown(session).await;
        true
    }

    /// End `session` only if it is still the registered session for its id.
    /// A newer session that reuses the id is left alone.
    pub async fn end_exact_session(&self, session: &Arc<Session>) -> bool {
        let Some((_, session)) = self
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
        else {
            debug!(session_id = %session.id(), "Session already ended or replaced");
            return false;
        };
        self.teardown(session).await;
        true
    }

    /// Whether `session` is the live registered session for its id.
    pub fn is_current(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .get(session.id())
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), session))
    }

    fn reserve_slot(&self) -> bool {
        let limit = self.config.max_concurrent_sessions;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| (taken < limit).then_some(taken + 1))
            .is_ok()
    }

    async fn teardown(&self, session: Arc<Session>) {
        let session_id = session.id();
        self.slots.fetch_sub(1, Ordering::AcqRel);
        session.mark_closed();
        self.keep_alive.cancel(session_id);

        {
            let _lifecycle = session.lifecycle.lock().await;
            if let Some(handle) = session.take_transcriber() {
                self.close_transcriber(session_id, handle).await;
            }
            // A start that raced the removal may have registered after the
            // first cancel.
            self.keep_alive.cancel(session_id);
        }

        let purged = self.chunks.purge_session(session_id);
        if session.is_transport_open() {
            session.send(Outbound::status(session_id, "session ended"));
        }
        self.stats.ended.fetch_add(1, Ordering::Relaxed);
        let lasted_secs = (chrono::Utc::now() - session.created_at()).num_seconds();
        info!(session_id = %session_id, lasted_secs, purged_chunk_sets = purged, "Voice session ended");
    }

    /// End every live session, e.g. on server shutdown.
    pub async fn shutdown(&self) -> usize {
        let ids = self.session_ids();
        for id in &ids {
            self.end_session(id).await;
        }
        ids.len()
    }

    /// Forward a PCM frame to the session's transcriber.
    pub async fn feed_audio(&self, session: &Session, frame: Bytes) -> VoiceResult<()> {
        let Some(handle) = session.transcriber() else {
            return Err(VoiceError::EngineState(crate::engines::TranscriberState::Stopped));
        };
        let state = handle.state();
        if !state.accepts_audio() {
            return Err(VoiceError::EngineState(state));
        }
        if !self.processor.admit(&frame) {
            debug!(
                session_id = %session.id(),
                bytes = frame.len(),
                duration_ms = self.processor.duration_ms(&frame),
                "Dropping undersized audio frame"
            );
            return Ok(());
        }

        handle.send(frame).await?;
        session.touch();
        self.stats.audio_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Handle the payload of an `audio_chunk` message.
    pub async fn accept_audio_chunk(
        &self,
        session: &Session,
        data: &str,
        chunk: Option<ChunkMeta>,
    ) -> VoiceResult<()> {
        let data = data.trim();
        if data.is_empty() {
            return Err(VoiceError::Protocol("audio data is empty".to_string()));
        }
        let bytes = BASE64
            .decode(data)
            .map_err(|e| VoiceError::Protocol(format!("invalid base64 audio: {}", e)))?;

        match chunk {
            None => self.feed_audio(session, Bytes::from(bytes)).await,
            Some(meta) => {
                let fragment = ChunkFragment {
                    chunk_id: meta.chunk_id,
                    index: meta.index,
                    total: meta.total,
                    bytes: Bytes::from(bytes),
                };
                match self.chunks.accept(session.id(), fragment)? {
                    Some(merged) => self.feed_audio(session, merged).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Switch the persona used for future replies. The transcriber keeps
    /// running untouched.
    pub fn change_persona(&self, session: &Session, persona_id: &str) -> VoiceResult<()> {
        let persona_id = persona_id.trim();
        if persona_id.is_empty() {
            return Err(VoiceError::Protocol("character is required".to_string()));
        }

        let next = self.personas.resolve(persona_id);
        let previous = session.set_persona(next.clone());
        info!(session_id = %session.id(), from = %previous.id, to = %next.id, "Persona changed");
        session.send(Outbound::status(
            session.id(),
            format!("character switched from {} to {}", previous.name, next.name),
        ));
        Ok(())
    }

    /// Take typed text as a finished utterance.
    pub async fn process_text(self: &Arc<Self>, session: &Session, text: &str) -> VoiceResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Protocol("text is empty".to_string()));
        }

        // Typing can take a while; keep the recognition connection warm.
        if let Some(handle) = session.transcriber() {
            if handle.state().accepts_audio() {
                if let Err(e) = handle.send(self.processor.silence_frame()).await {
                    warn!(session_id = %session.id(), error = %e, "Keep-alive before text turn failed");
                }
            }
        }

        self.spawn_ai_turn(session.id(), text);
        Ok(())
    }
}
