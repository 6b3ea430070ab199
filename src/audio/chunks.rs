//! # Chunked Audio Reassembly
//!
//! Clients may split one logical audio buffer into indexed fragments sent as
//! separate `audio_chunk` messages. Fragments are grouped by
//! `(session id, chunk id)` and held until the number of distinct fragments
//! received equals the declared total; the set is then merged in index order
//! and removed.
//!
//! ## Ordering and Duplicates
//! Fragments may arrive in any order. Re-sending an index before the set is
//! complete replaces the earlier payload. Once a set completes, a fragment
//! with the same chunk id starts a new set.
//!
//! ## Missing Fragments
//! How out-of-range indices are handled depends on [`MissingFragmentPolicy`].
//! Incomplete sets are released when their session ends.

use crate::error::{VoiceError, VoiceResult};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFragmentPolicy {
    /// Store fragments with any index. A set completes once it holds
    /// `total` fragments; indices outside `0..total` are then dropped and the
    /// gaps they leave are skipped during the merge.
    #[default]
    BestEffort,
    /// Reject fragments whose index falls outside `0..total`, so a complete
    /// set always covers every index.
    Strict,
}

/// One indexed piece of a logical audio buffer.
#[derive(Debug, Clone)]
pub struct ChunkFragment {
    pub chunk_id: String,
    pub index: u32,
    pub total: u32,
    pub bytes: Bytes,
}

#[derive(Debug)]
struct PendingChunk {
    total: u32,
    fragments: BTreeMap<u32, Bytes>,
}

impl PendingChunk {
    fn merge(self, session_id: &str, chunk_id: &str) -> Bytes {
        let capacity = self.fragments.values().map(Bytes::len).sum();
        let mut merged = BytesMut::with_capacity(capacity);

        for index in 0..self.total {
            match self.fragments.get(&index) {
                Some(bytes) => merged.extend_from_slice(bytes),
                None => warn!(
                    session_id = %session_id,
                    chunk_id = %chunk_id,
                    index,
                    "Fragment missing from completed chunk set, skipping"
                ),
            }
        }

        let dropped = self.fragments.range(self.total..).count();
        if dropped > 0 {
            warn!(
                session_id = %session_id,
                chunk_id = %chunk_id,
                dropped,
                "Dropped fragments with out-of-range indices"
            );
        }

        merged.freeze()
    }
}

/// Buffers fragments for all sessions.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    pending: DashMap<(String, String), PendingChunk>,
    policy: MissingFragmentPolicy,
}

impl ChunkReassembler {
    pub fn new(policy: MissingFragmentPolicy) -> Self {
        Self {
            pending: DashMap::new(),
            policy,
        }
    }

    /// Store a fragment. Returns the merged buffer when this fragment
    /// completes its set, `None` while fragments are still outstanding.
    pub fn accept(&self, session_id: &str, fragment: ChunkFragment) -> VoiceResult<Option<Bytes>> {
        let ChunkFragment { chunk_id, index, total, bytes } = fragment;

        if chunk_id.trim().is_empty() {
            return Err(VoiceError::Protocol("chunkId must not be empty".to_string()));
        }
        if total == 0 {
            return Err(VoiceError::Protocol("totalChunks must be greater than 0".to_string()));
        }
        if self.policy == MissingFragmentPolicy::Strict && index >= total {
            return Err(VoiceError::Protocol(format!(
                "chunkIndex {} is out of range for {} chunks",
                index, total
            )));
        }

        let key = (session_id.to_string(), chunk_id);
        let complete = {
            let mut pending = self.pending.entry(key.clone()).or_insert_with(|| PendingChunk {
                total,
                fragments: BTreeMap::new(),
            });

            if pending.total != total {
                return Err(VoiceError::Protocol(format!(
                    "totalChunks changed from {} to {} for chunk {}",
                    pending.total, total, key.1
                )));
            }

            pending.fragments.insert(index, bytes);
            pending.fragments.len() >= pending.total as usize
        };

        if !complete {
            debug!(session_id = %session_id, chunk_id = %key.1, index, total, "Buffered audio fragment");
            return Ok(None);
        }

        // Another fragment of the same set may have completed it first.
        let Some(((_, chunk_id), pending)) = self.pending.remove(&key) else {
            return Ok(None);
        };
        let merged = pending.merge(session_id, &chunk_id);
        debug!(session_id = %session_id, chunk_id = %chunk_id, bytes = merged.len(), "Reassembled audio chunk");
        Ok(Some(merged))
    }

    /// Drop every incomplete set belonging to `session_id`.
    pub fn purge_session(&self, session_id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(owner, _), _| owner != session_id);
        before.saturating_sub(self.pending.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
