//! Write-behind queue: DB mutations are enqueued as JSON jobs on a cache
//! list and applied in batches by a background flusher. Failed batches go
//! to a dead-letter list; fresh dead letters are replayed, stale ones are
//! discarded. Delivery is at-least-once, so every applier must be an
//! idempotent upsert.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::CacheClient;
use crate::keys::{WRITE_DLQ_KEY, WRITE_QUEUE_KEY};

/// Dead letters older than this are discarded instead of replayed.
pub const DLQ_MAX_AGE_SECS: i64 = 24 * 3_600;

/// Base flush batch size; grows with queue depth up to the cap.
const BATCH_BASE: usize = 100;
const BATCH_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Message,
    ToolCall,
    BalanceOp,
    File,
    UserStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedWrite {
    #[serde(rename = "type")]
    pub kind: WriteKind,
    pub data: Value,
    /// Unix seconds at enqueue time.
    pub queued_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
}

/// What the DLQ scan decided for one entry.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReplayDecision {
    /// Strip retry metadata and push back to the main queue.
    Replay,
    Discard,
}

pub(crate) fn classify_dead_letter(write: &QueuedWrite, now: i64) -> ReplayDecision {
    if now - write.queued_at < DLQ_MAX_AGE_SECS {
        ReplayDecision::Replay
    } else {
        ReplayDecision::Discard
    }
}

pub(crate) fn batch_size_for_depth(depth: usize) -> usize {
    depth.max(BATCH_BASE).min(BATCH_CAP)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub replayed: usize,
    pub discarded: usize,
}

/// Handle over the queue and DLQ lists. Cheap to clone via the shared
/// cache client reference.
pub struct WriteQueue {
    cache: std::sync::Arc<CacheClient>,
}

impl WriteQueue {
    pub fn new(cache: std::sync::Arc<CacheClient>) -> Self {
        Self { cache }
    }

    /// Enqueue one mutation. Returns false (after a warning) when the
    /// cache is unavailable — the caller decides whether to write through
    /// synchronously instead.
    pub async fn enqueue(&self, kind: WriteKind, data: Value) -> bool {
        let write = QueuedWrite {
            kind,
            data,
            queued_at: chrono::Utc::now().timestamp(),
            retry_count: None,
            retry_after: None,
        };
        let Ok(payload) = serde_json::to_vec(&write) else {
            warn!(?kind, "write-behind payload failed to serialize");
            return false;
        };
        let ok = self.cache.rpush(WRITE_QUEUE_KEY, &payload).await;
        if !ok {
            warn!(?kind, "write-behind enqueue skipped, cache unavailable");
        }
        ok
    }

    pub async fn depth(&self) -> u64 {
        self.cache.llen(WRITE_QUEUE_KEY).await.unwrap_or(0)
    }

    pub async fn dlq_depth(&self) -> u64 {
        self.cache.llen(WRITE_DLQ_KEY).await.unwrap_or(0)
    }

    /// Pop up to one batch of queued writes. Batch size is dynamic: at
    /// least the base, at most the cap, scaled to current depth so a
    /// backlog drains faster.
    pub async fn pop_batch(&self) -> Vec<QueuedWrite> {
        let depth = self.depth().await as usize;
        let limit = batch_size_for_depth(depth);

        let mut batch = Vec::new();
        while batch.len() < limit {
            let Some(bytes) = self.cache.lpop(WRITE_QUEUE_KEY).await else {
                break;
            };
            match serde_json::from_slice::<QueuedWrite>(&bytes) {
                Ok(write) => batch.push(write),
                Err(e) => warn!(error = %e, "dropping malformed write-behind entry"),
            }
        }
        if !batch.is_empty() {
            debug!(count = batch.len(), limit, "write-behind batch popped");
        }
        batch
    }

    /// Move a failed write to the dead-letter list with an incremented
    /// retry count.
    pub async fn push_dead_letter(&self, mut write: QueuedWrite) {
        write.retry_count = Some(write.retry_count.unwrap_or(0) + 1);
        write.retry_after = Some(chrono::Utc::now().timestamp() + 60);
        if let Ok(payload) = serde_json::to_vec(&write) {
            if !self.cache.rpush(WRITE_DLQ_KEY, &payload).await {
                warn!(kind = ?write.kind, "dead letter lost, cache unavailable");
            }
        }
    }

    /// Scan the DLQ once: replay fresh entries (stripped of retry
    /// metadata), discard entries older than `DLQ_MAX_AGE_SECS`.
    pub async fn replay_dlq(&self) -> ReplayStats {
        let mut stats = ReplayStats::default();
        let depth = self.dlq_depth().await;
        if depth == 0 {
            return stats;
        }

        let now = chrono::Utc::now().timestamp();
        for _ in 0..depth {
            let Some(bytes) = self.cache.lpop(WRITE_DLQ_KEY).await else {
                break;
            };
            let Ok(mut write) = serde_json::from_slice::<QueuedWrite>(&bytes) else {
                warn!("dropping malformed dead letter");
                stats.discarded += 1;
                continue;
            };
            match classify_dead_letter(&write, now) {
                ReplayDecision::Replay => {
                    write.retry_count = None;
                    write.retry_after = None;
                    if let Ok(payload) = serde_json::to_vec(&write) {
                        self.cache.rpush(WRITE_QUEUE_KEY, &payload).await;
                    }
                    stats.replayed += 1;
                }
                ReplayDecision::Discard => {
                    warn!(
                        kind = ?write.kind,
                        age_secs = now - write.queued_at,
                        "discarding expired dead letter"
                    );
                    stats.discarded += 1;
                }
            }
        }

        if stats.replayed > 0 || stats.discarded > 0 {
            info!(
                replayed = stats.replayed,
                discarded = stats.discarded,
                "dead-letter replay pass complete"
            );
        }
        stats
    }
}
