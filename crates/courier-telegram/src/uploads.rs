//! In-flight upload tracking per chat.
//!
//! Media handlers register an upload before any download/upload work; the
//! batch processor waits for the chat to drain before running, so a photo's
//! caption never races ahead of the photo. Keyed by chat id because it is
//! known before any database work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use courier_core::config::UPLOAD_DRAIN_TIMEOUT_SECS;

#[derive(Default)]
struct ChatUploads {
    pending: usize,
    drained: Arc<Notify>,
}

/// One mutex guards both the counters and the notify handles.
#[derive(Default)]
pub struct UploadTracker {
    chats: Mutex<HashMap<i64, ChatUploads>>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an upload as starting. Must be paired with `finish_upload`,
    /// also on the failure path.
    pub async fn start_upload(&self, chat_id: i64) {
        let mut chats = self.chats.lock().await;
        let entry = chats.entry(chat_id).or_default();
        entry.pending += 1;
        debug!(chat_id, pending = entry.pending, "upload started");
    }

    /// Mark an upload as finished; wakes waiters when the chat drains.
    pub async fn finish_upload(&self, chat_id: i64) {
        let mut chats = self.chats.lock().await;
        let entry = chats.entry(chat_id).or_default();
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending == 0 {
            entry.drained.notify_waiters();
            debug!(chat_id, "all uploads complete");
        }
    }

    pub async fn pending_count(&self, chat_id: i64) -> usize {
        self.chats
            .lock()
            .await
            .get(&chat_id)
            .map(|c| c.pending)
            .unwrap_or(0)
    }

    /// Wait for the chat's uploads to drain. Returns true on drain, false
    /// on timeout — the caller proceeds either way; a tardy upload must
    /// not block text processing.
    pub async fn wait_for_uploads(&self, chat_id: i64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = {
                let chats = self.chats.lock().await;
                match chats.get(&chat_id) {
                    None => return true,
                    Some(c) if c.pending == 0 => return true,
                    Some(c) => Arc::clone(&c.drained),
                }
            };

            // Register interest before re-checking so a drain between the
            // check and the wait is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_count(chat_id).await == 0 {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let pending = self.pending_count(chat_id).await;
                if pending == 0 {
                    return true;
                }
                warn!(chat_id, pending, "upload drain timed out, proceeding");
                return false;
            }
        }
    }

    /// Wait with the default timeout.
    pub async fn wait_default(&self, chat_id: i64) -> bool {
        self.wait_for_uploads(chat_id, Duration::from_secs(UPLOAD_DRAIN_TIMEOUT_SECS))
            .await
    }

    /// Drop all state for a chat and unblock any waiters.
    pub async fn reset(&self, chat_id: i64) {
        let mut chats = self.chats.lock().await;
        if let Some(entry) = chats.remove(&chat_id) {
            entry.drained.notify_waiters();
        }
        debug!(chat_id, "upload tracker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_uploads_returns_immediately() {
        let tracker = UploadTracker::new();
        assert!(tracker.wait_for_uploads(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_resolves_when_uploads_drain() {
        let tracker = Arc::new(UploadTracker::new());
        tracker.start_upload(1).await;
        tracker.start_upload(1).await;

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_uploads(1, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.finish_upload(1).await;
        assert!(!waiter.is_finished(), "one upload still pending");

        tracker.finish_upload(1).await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_returns_false_and_does_not_hang() {
        let tracker = UploadTracker::new();
        tracker.start_upload(1).await;
        let drained = tracker.wait_for_uploads(1, Duration::from_millis(50)).await;
        assert!(!drained);
        assert_eq!(tracker.pending_count(1).await, 1);
    }

    #[tokio::test]
    async fn chats_are_independent() {
        let tracker = UploadTracker::new();
        tracker.start_upload(1).await;
        assert!(tracker.wait_for_uploads(2, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn finish_without_start_is_harmless() {
        let tracker = UploadTracker::new();
        tracker.finish_upload(1).await;
        assert_eq!(tracker.pending_count(1).await, 0);
        assert!(tracker.wait_for_uploads(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn reset_unblocks_waiters() {
        let tracker = Arc::new(UploadTracker::new());
        tracker.start_upload(1).await;
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_uploads(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.reset(1).await;
        assert!(waiter.await.unwrap());
    }
}
