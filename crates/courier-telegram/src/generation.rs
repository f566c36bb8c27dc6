//! Active-generation tracking for mid-stream cancellation.
//!
//! One token per (chat, user, topic); `/stop` cancels it and the turn loop
//! breaks at its next poll. Starting a new generation replaces any stale
//! entry for the same key.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type GenKey = (i64, i64, i64);

#[derive(Default)]
pub struct GenerationTracker {
    active: DashMap<GenKey, CancellationToken>,
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a generation; returns the token the turn loop polls.
    pub fn start(&self, chat_id: i64, user_id: i64, topic_id: i64) -> CancellationToken {
        let key = (chat_id, user_id, topic_id);
        let token = CancellationToken::new();
        if self.active.insert(key, token.clone()).is_some() {
            warn!(chat_id, user_id, topic_id, "replacing active generation");
        }
        debug!(
            chat_id,
            user_id,
            topic_id,
            active = self.active.len(),
            "generation started"
        );
        token
    }

    /// Request cancellation. Returns whether a generation was found.
    pub fn cancel(&self, chat_id: i64, user_id: i64, topic_id: i64) -> bool {
        match self.active.get(&(chat_id, user_id, topic_id)) {
            Some(token) => {
                token.cancel();
                debug!(chat_id, user_id, topic_id, "generation cancelled");
                true
            }
            None => false,
        }
    }

    /// Stop tracking after the turn finishes (normally or cancelled).
    pub fn cleanup(&self, chat_id: i64, user_id: i64, topic_id: i64) {
        self.active.remove(&(chat_id, user_id, topic_id));
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_the_issued_token() {
        let tracker = GenerationTracker::new();
        let token = tracker.start(1, 2, 0);
        assert!(!token.is_cancelled());
        assert!(tracker.cancel(1, 2, 0));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_returns_false() {
        let tracker = GenerationTracker::new();
        assert!(!tracker.cancel(9, 9, 9));
    }

    #[test]
    fn start_replaces_previous() {
        let tracker = GenerationTracker::new();
        let old = tracker.start(1, 2, 0);
        let new = tracker.start(1, 2, 0);
        assert!(tracker.cancel(1, 2, 0));
        assert!(new.is_cancelled());
        assert!(!old.is_cancelled(), "replaced token is detached");
    }

    #[test]
    fn cleanup_removes_entry() {
        let tracker = GenerationTracker::new();
        tracker.start(1, 2, 0);
        assert_eq!(tracker.active_count(), 1);
        tracker.cleanup(1, 2, 0);
        assert_eq!(tracker.active_count(), 0);
        assert!(!tracker.cancel(1, 2, 0));
    }

    #[test]
    fn topics_tracked_separately() {
        let tracker = GenerationTracker::new();
        let main = tracker.start(1, 2, 0);
        let topic = tracker.start(1, 2, 7);
        assert!(tracker.cancel(1, 2, 7));
        assert!(topic.is_cancelled());
        assert!(!main.is_cancelled());
    }
}
