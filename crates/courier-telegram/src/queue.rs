//! Per-thread message batching.
//!
//! Telegram splits long messages into parts that arrive within ~200 ms of
//! each other, and users fire follow-ups while a batch is processing. Each
//! thread gets a buffer and a debounce timer: parts collapse into one
//! batch, messages arriving mid-processing form the next batch, and no two
//! batches for the same thread ever run concurrently. A failed batch is
//! retried exactly once.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::config::BATCH_DEBOUNCE_MS;

/// One inbound Telegram message, reduced to what the pipeline needs.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub user_id: i64,
    /// External forum topic id; 0 outside forums.
    pub topic_id: i64,
    pub text: String,
    /// Provider file ids of media already ingested for this message.
    pub file_ids: Vec<String>,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// Callback invoked with each debounced batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn process(&self, thread_id: i64, batch: Vec<InboundMessage>) -> courier_core::Result<()>;
}

#[derive(Default)]
struct ThreadQueue {
    buffer: Vec<InboundMessage>,
    processing: bool,
    timer: Option<JoinHandle<()>>,
}

pub struct MessageQueueManager {
    queues: DashMap<i64, Arc<Mutex<ThreadQueue>>>,
    handler: Arc<dyn BatchHandler>,
    /// Weak self-handle so debounce timers can call back into the manager.
    self_ref: Weak<MessageQueueManager>,
}

impl MessageQueueManager {
    pub fn new(handler: Arc<dyn BatchHandler>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            queues: DashMap::new(),
            handler,
            self_ref: weak.clone(),
        })
    }

    fn queue(&self, thread_id: i64) -> Arc<Mutex<ThreadQueue>> {
        self.queues
            .entry(thread_id)
            .or_default()
            .value()
            .clone()
    }

    /// Add a message. Debounces the batch timer; messages arriving while a
    /// batch is processing are held for the follow-on batch.
    pub async fn add_message(&self, thread_id: i64, message: InboundMessage) {
        let queue = self.queue(thread_id);
        let mut state = queue.lock().await;

        if state.processing {
            state.buffer.push(message);
            info!(
                thread_id,
                buffered = state.buffer.len(),
                "message accumulated during processing"
            );
            return;
        }

        state.buffer.push(message);

        // More parts may be coming: restart the debounce window.
        if let Some(timer) = state.timer.take() {
            timer.abort();
            debug!(thread_id, "debounce timer rescheduled");
        }

        let manager = self.self_ref.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(BATCH_DEBOUNCE_MS)).await;
            if let Some(manager) = manager.upgrade() {
                manager.fire(thread_id).await;
            }
        }));

        debug!(
            thread_id,
            batch_size = state.buffer.len(),
            "message scheduled"
        );
    }

    /// Timer expiry: snapshot the buffer and process it.
    async fn fire(&self, thread_id: i64) {
        let queue = self.queue(thread_id);
        let batch = {
            let mut state = queue.lock().await;
            state.timer = None;
            // A batch started between scheduling and expiry; the buffered
            // messages will ride the follow-on pass.
            if state.processing {
                return;
            }
            std::mem::take(&mut state.buffer)
        };

        if batch.is_empty() {
            warn!(thread_id, "debounce fired on empty buffer");
            return;
        }

        info!(thread_id, batch_size = batch.len(), "batch ready");
        self.process_batch(thread_id, batch).await;
    }

    /// Run one batch (plus follow-on batches) under the processing flag.
    /// The flag guarantees at most one batch per thread at any instant.
    async fn process_batch(&self, thread_id: i64, mut batch: Vec<InboundMessage>) {
        let queue = self.queue(thread_id);
        queue.lock().await.processing = true;

        loop {
            if let Err(e) = self.handler.process(thread_id, batch.clone()).await {
                warn!(thread_id, error = %e, "batch failed, retrying once");
                if let Err(retry_err) = self.handler.process(thread_id, batch.clone()).await {
                    error!(thread_id, error = %retry_err, "batch retry failed, giving up");
                }
            }

            // Messages that arrived while processing become the next batch.
            let next = {
                let mut state = queue.lock().await;
                if state.buffer.is_empty() {
                    state.processing = false;
                    None
                } else {
                    Some(std::mem::take(&mut state.buffer))
                }
            };
            match next {
                Some(follow_on) => {
                    info!(
                        thread_id,
                        batch_size = follow_on.len(),
                        "processing follow-on batch"
                    );
                    batch = follow_on;
                }
                None => break,
            }
        }
    }

    /// Queue statistics for diagnostics.
    pub async fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.queues.iter() {
            stats.total_threads += 1;
            let state = entry.value().lock().await;
            if state.processing {
                stats.processing_threads += 1;
            }
            if !state.buffer.is_empty() {
                stats.waiting_threads += 1;
            }
        }
        stats
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_threads: usize,
    pub processing_threads: usize,
    pub waiting_threads: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    fn msg(id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: 1,
            message_id: id,
            user_id: 7,
            topic_id: 0,
            text: text.to_string(),
            file_ids: vec![],
            received_at: chrono::Utc::now(),
        }
    }

    /// Records batches; optionally fails the first N calls or stalls.
    struct Recorder {
        batches: TokioMutex<Vec<Vec<InboundMessage>>>,
        fail_first: AtomicUsize,
        stall_ms: u64,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Self::with(0, 0)
        }

        fn with(fail_first: usize, stall_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                batches: TokioMutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
                stall_ms,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        async fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().await.iter().map(|b| b.len()).collect()
        }
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        async fn process(
            &self,
            _thread_id: i64,
            batch: Vec<InboundMessage>,
        ) -> courier_core::Result<()> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            if self.stall_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.stall_ms)).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(courier_core::CourierError::Internal("induced".into()));
            }
            self.batches.lock().await.push(batch);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn split_parts_collapse_into_one_batch() {
        let recorder = Recorder::new();
        let manager = MessageQueueManager::new(recorder.clone());

        manager.add_message(1, msg(1, "part one")).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.add_message(1, msg(2, "part two")).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(recorder.batch_sizes().await, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_beyond_debounce_makes_two_batches() {
        let recorder = Recorder::new();
        let manager = MessageQueueManager::new(recorder.clone());

        manager.add_message(1, msg(1, "first")).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        manager.add_message(1, msg(2, "second")).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(recorder.batch_sizes().await, vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn message_during_processing_joins_next_batch() {
        let recorder = Recorder::with(0, 500);
        let manager = MessageQueueManager::new(recorder.clone());

        manager.add_message(1, msg(1, "slow batch")).await;
        // Let the debounce fire and processing begin (stalls 500ms).
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.add_message(1, msg(2, "arrives mid-processing")).await;
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        let sizes = recorder.batch_sizes().await;
        assert_eq!(sizes, vec![1, 1], "second message lands in a follow-on batch");
        // Never two batches at once for the thread.
        assert_eq!(recorder.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_retried_exactly_once() {
        let recorder = Recorder::with(1, 0);
        let manager = MessageQueueManager::new(recorder.clone());

        manager.add_message(1, msg(1, "flaky")).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        // First call failed, retry succeeded: one recorded batch.
        assert_eq!(recorder.batch_sizes().await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_give_up() {
        let recorder = Recorder::with(2, 0);
        let manager = MessageQueueManager::new(recorder.clone());

        manager.add_message(1, msg(1, "doomed")).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(recorder.batch_sizes().await.is_empty());

        // The queue is healthy afterwards.
        manager.add_message(1, msg(2, "fresh")).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(recorder.batch_sizes().await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn threads_are_independent() {
        let recorder = Recorder::new();
        let manager = MessageQueueManager::new(recorder.clone());

        manager.add_message(1, msg(1, "thread one")).await;
        manager.add_message(2, msg(2, "thread two")).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(recorder.batch_sizes().await, vec![1, 1]);
        let stats = manager.stats().await;
        assert_eq!(stats.total_threads, 2);
        assert_eq!(stats.processing_threads, 0);
    }
}
