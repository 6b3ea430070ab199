//! Keep-alive for idle transcription connections.
//!
//! Streaming engines drop connections that go quiet, so every live
//! transcriber is fed a short frame of silence once per interval. One shared
//! scheduler serves all sessions: [`KeepAliveScheduler::tick`] sends whatever
//! is due, and [`KeepAliveScheduler::spawn`] drives it from a single tokio
//! interval.
//!
//! An entry is dropped, without sending, as soon as its handle stops
//! accepting audio. A failed send drops it too.

use crate::engines::TranscriberHandle;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct KeepAliveEntry {
    handle: Arc<dyn TranscriberHandle>,
    next_due: Instant,
}

pub struct KeepAliveScheduler {
    entries: DashMap<String, KeepAliveEntry>,
    interval: Duration,
    frame: Bytes,
}

impl KeepAliveScheduler {
    pub fn new(interval: Duration, frame: Bytes) -> Self {
        Self {
            entries: DashMap::new(),
            interval,
            frame,
        }
    }

    /// Schedule keep-alive for a session's transcriber, replacing any
    /// previous registration. The first frame is due one interval from `now`.
    pub fn register(&self, session_id: &str, handle: Arc<dyn TranscriberHandle>, now: Instant) {
        self.entries.insert(
            session_id.to_string(),
            KeepAliveEntry {
                handle,
                next_due: now + self.interval,
            },
        );
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        self.entries.remove(session_id).is_some()
    }

    #[cfg(test)]
    pub fn is_scheduled(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Send frames for every entry due at `now`. Returns how many were sent.
    pub async fn tick(&self, now: Instant) -> usize {
        let due: Vec<(String, Arc<dyn TranscriberHandle>)> = self
            .entries
            .iter()
            .filter(|entry| entry.next_due <= now)
            .map(|entry| (entry.key().clone(), entry.handle.clone()))
            .collect();

        let mut sent = 0;
        for (session_id, handle) in due {
            let state = handle.state();
            if !state.accepts_audio() {
                debug!(session_id = %session_id, state = %state, "Transcriber no longer accepts audio, cancelling keep-alive");
                self.cancel_if_current(&session_id, &handle);
                continue;
            }

            match handle.send(self.frame.clone()).await {
                Ok(()) => {
                    sent += 1;
                    if let Some(mut entry) = self.entries.get_mut(&session_id) {
                        if Arc::ptr_eq(&entry.handle, &handle) {
                            entry.next_due = now + self.interval;
                        }
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Keep-alive send failed, cancelling keep-alive");
                    self.cancel_if_current(&session_id, &handle);
                }
            }
        }
        sent
    }

    /// Remove the entry only if it still refers to `handle`; a restart may
    /// have registered a new transcriber in the meantime.
    fn cancel_if_current(&self, session_id: &str, handle: &Arc<dyn TranscriberHandle>) {
        self.entries
            .remove_if(session_id, |_, entry| Arc::ptr_eq(&entry.handle, handle));
    }

    pub fn spawn(self: Arc<Self>, tick: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick(Instant::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::testing::{FakeTranscriber, FakeTranscriberFactory};
    use crate::engines::{AudioFormat, TranscriberFactory, TranscriberState};
    use tokio::sync::mpsc;

    async fn fake_handle(factory: &FakeTranscriberFactory) -> Arc<FakeTranscriber> {
        let (events, _) = mpsc::unbounded_channel();
        let format = AudioFormat { sample_rate: 16_000, channels: 1, bit_depth: 16 };
        factory.start(format, events).await.unwrap();
        factory.latest()
    }

    fn scheduler() -> KeepAliveScheduler {
        KeepAliveScheduler::new(Duration::from_secs(10), Bytes::from(vec![0u8; 320]))
    }

    #[tokio::test]
    async fn test_sends_silence_when_due() {
        let factory = FakeTranscriberFactory::default();
        let handle = fake_handle(&factory).await;
        let scheduler = scheduler();
        let start = Instant::now();
        scheduler.register("s1", handle.clone(), start);

        assert_eq!(scheduler.tick(start + Duration::from_secs(5)).await, 0);
        assert_eq!(scheduler.tick(start + Duration::from_secs(10)).await, 1);
        assert_eq!(handle.frame_sizes(), vec![320]);

        // Next frame is due a full interval after the last send
        assert_eq!(scheduler.tick(start + Duration::from_secs(15)).await, 0);
        assert_eq!(scheduler.tick(start + Duration::from_secs(20)).await, 1);
    }

    #[tokio::test]
    async fn test_stops_without_sending_once_transcriber_stops() {
        let factory = FakeTranscriberFactory::default();
        let handle = fake_handle(&factory).await;
        let scheduler = scheduler();
        let start = Instant::now();
        scheduler.register("s1", handle.clone(), start);

        handle.set_state(TranscriberState::Stopping);
        assert_eq!(scheduler.tick(start + Duration::from_secs(11)).await, 0);
        assert!(handle.frame_sizes().is_empty());
        assert!(!scheduler.is_scheduled("s1"));
    }

    #[tokio::test]
    async fn test_register_replaces_previous_handle() {
        let factory = FakeTranscriberFactory::default();
        let old = fake_handle(&factory).await;
        let new = fake_handle(&factory).await;
        let scheduler = scheduler();
        let start = Instant::now();

        scheduler.register("s1", old.clone(), start);
        scheduler.register("s1", new.clone(), start);
        assert_eq!(scheduler.len(), 1);

        scheduler.tick(start + Duration::from_secs(10)).await;
        assert!(old.frame_sizes().is_empty());
        assert_eq!(new.frame_sizes().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let factory = FakeTranscriberFactory::default();
        let handle = fake_handle(&factory).await;
        let scheduler = scheduler();
        let start = Instant::now();
        scheduler.register("s1", handle.clone(), start);

        assert!(scheduler.cancel("s1"));
        assert!(!scheduler.cancel("s1"));
        assert_eq!(scheduler.tick(start + Duration::from_secs(30)).await, 0);
        assert!(scheduler.is_empty());
    }
}
