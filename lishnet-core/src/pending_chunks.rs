//! Pending chunks tracker with retry bookkeeping
//!
//! One entry per digest a transfer still has to fetch. Each entry counts the
//! attempts made and the retries left, so the fetch loop knows which peer to
//! ask next and when to give up on a chunk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

use crate::digest::ChunkId;

#[derive(Debug, thiserror::Error)]
#[error("Retries exhausted for chunk {digest} after {attempts} attempts: {reason}")]
pub struct RetriesExhausted {
    pub digest: ChunkId,
    pub attempts: u32,
    pub reason: String,
}

struct PendingChunk {
    retries_left: u32,
    attempts: u32,
    start_time: Instant,
}

struct PendingChunksState {
    pending: HashMap<ChunkId, PendingChunk>,
    max_retries: u32,
    retry_interval: Duration,
}

/// Shared across the concurrent fetch tasks of one transfer
#[derive(Clone)]
pub struct PendingChunks {
    state: Arc<Mutex<PendingChunksState>>,
}

impl PendingChunks {
    pub fn with_config(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(PendingChunksState {
                pending: HashMap::new(),
                max_retries,
                retry_interval,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, PendingChunksState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn retry_interval(&self) -> Duration {
        self.state().retry_interval
    }

    /// Start tracking a digest; a digest already tracked keeps its counters
    pub fn add(&self, digest: ChunkId) -> bool {
        let mut state = self.state();
        if state.pending.contains_key(&digest) {
            return false;
        }
        let retries_left = state.max_retries;
        trace!("Tracking pending chunk {}", digest.short());
        state.pending.insert(
            digest,
            PendingChunk {
                retries_left,
                attempts: 0,
                start_time: Instant::now(),
            },
        );
        true
    }

    /// Record a new request for `digest`; returns the attempt number
    pub fn begin_attempt(&self, digest: &ChunkId) -> Option<u32> {
        let mut state = self.state();
        let pending = state.pending.get_mut(digest)?;
        pending.attempts += 1;
        Some(pending.attempts)
    }

    /// Record a failed attempt
    ///
    /// Returns `Err` once the retries for this chunk are used up.
    pub fn record_failure(
        &self,
        digest: &ChunkId,
        reason: impl Into<String>,
    ) -> Result<u32, RetriesExhausted> {
        let reason = reason.into();
        let mut state = self.state();
        let Some(pending) = state.pending.get_mut(digest) else {
            return Err(RetriesExhausted {
                digest: digest.clone(),
                attempts: 0,
                reason,
            });
        };

        if pending.retries_left == 0 {
            warn!(
                "Giving up on chunk {} after {} attempts: {}",
                digest.short(),
                pending.attempts,
                reason
            );
            return Err(RetriesExhausted {
                digest: digest.clone(),
                attempts: pending.attempts,
                reason,
            });
        }
        pending.retries_left -= 1;
        trace!(
            "Chunk {} failed ({}), {} retries left",
            digest.short(),
            reason,
            pending.retries_left
        );
        Ok(pending.retries_left)
    }

    /// Stop tracking a fetched digest; returns how long it was pending
    pub fn complete(&self, digest: &ChunkId) -> Option<Duration> {
        let pending = self.state().pending.remove(digest)?;
        let duration = pending.start_time.elapsed();
        if duration > Duration::from_secs(10) {
            warn!(
                "Chunk {} took {} ms over {} attempts",
                digest.short(),
                duration.as_millis(),
                pending.attempts
            );
        }
        Some(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ChecksumAlgorithm;

    fn digest(data: &[u8]) -> ChunkId {
        ChecksumAlgorithm::Sha256.digest(data)
    }

    #[test]
    fn test_add_is_idempotent() {
        let pending = PendingChunks::with_config(3, Duration::ZERO);
        let d = digest(b"a");
        assert!(pending.add(d.clone()));
        assert_eq!(pending.begin_attempt(&d), Some(1));
        assert!(!pending.add(d.clone()));
        // counters survive the second add
        assert_eq!(pending.begin_attempt(&d), Some(2));
    }

    #[test]
    fn test_retry_exhaustion() {
        let pending = PendingChunks::with_config(2, Duration::ZERO);
        let d = digest(b"a");
        pending.add(d.clone());

        pending.begin_attempt(&d);
        assert_eq!(pending.record_failure(&d, "mismatch").unwrap(), 1);
        pending.begin_attempt(&d);
        assert_eq!(pending.record_failure(&d, "mismatch").unwrap(), 0);
        pending.begin_attempt(&d);
        let err = pending.record_failure(&d, "mismatch").unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.digest, d);
        assert_eq!(err.reason, "mismatch");
    }

    #[test]
    fn test_zero_retries_fails_first_attempt() {
        let pending = PendingChunks::with_config(0, Duration::ZERO);
        let d = digest(b"a");
        pending.add(d.clone());
        assert_eq!(pending.begin_attempt(&d), Some(1));
        assert_eq!(pending.record_failure(&d, "timeout").unwrap_err().attempts, 1);
    }

    #[test]
    fn test_complete_removes() {
        let pending = PendingChunks::with_config(1, Duration::from_millis(50));
        assert_eq!(pending.retry_interval(), Duration::from_millis(50));
        let a = digest(b"a");
        let b = digest(b"b");
        pending.add(a.clone());
        pending.add(b.clone());

        assert!(pending.complete(&a).is_some());
        assert!(pending.complete(&a).is_none());
        assert_eq!(pending.begin_attempt(&a), None);
        assert_eq!(pending.begin_attempt(&b), Some(1));
    }

    #[test]
    fn test_unknown_digest_failure_is_exhausted() {
        let pending = PendingChunks::with_config(3, Duration::ZERO);
        assert!(pending.record_failure(&digest(b"x"), "gone").is_err());
        assert_eq!(pending.begin_attempt(&digest(b"x")), None);
    }
}
