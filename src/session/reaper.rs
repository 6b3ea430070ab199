//! Inactivity expiry.
//!
//! Every inbound frame refreshes a session's `last_activity`. A periodic
//! sweep ends sessions that have been idle for longer than the configured
//! timeout, through the same path as an explicit `end_session`.

use super::registry::SessionRegistry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info};

impl SessionRegistry {
    /// End every session idle for longer than the timeout as of `now`.
    /// Returns the number of sessions ended.
    pub async fn reap_expired(&self, now: Instant) -> usize {
        let timeout = self.config.timeout();
        let expired: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().last_activity()) > timeout)
            .map(|entry| entry.value().clone())
            .collect();

        let mut reaped = 0;
        for session in expired {
            info!(session_id = %session.id(), timeout_secs = timeout.as_secs(), "Session inactive, ending it");
            if self.end_exact_session(&session).await {
                reaped += 1;
            }
        }

        if reaped > 0 {
            self.stats.reaped.fetch_add(reaped as u64, Ordering::Relaxed);
        } else {
            debug!(active = self.session_count(), "Reaper sweep found no expired sessions");
        }
        reaped
    }
}

pub fn spawn_reaper(registry: Arc<SessionRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(registry.config().reap_interval());
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.reap_expired(Instant::now()).await;
        }
    })
}
