//! Per-user concurrency limiting.
//!
//! Each user gets a semaphore of `max_concurrent` slots with FIFO waiters.
//! Waiting beyond the queue timeout fails with `ConcurrencyLimit`; the
//! permit releases its slot on drop, including on panic/error paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use courier_core::CourierError;

#[derive(Debug)]
struct UserSlots {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    active: AtomicUsize,
}

pub struct UserConcurrencyLimiter {
    users: DashMap<i64, Arc<UserSlots>>,
    max_concurrent: usize,
    queue_timeout: Duration,
}

/// RAII slot: dropping it releases the user's slot.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    slots: Arc<UserSlots>,
    pub queue_position: usize,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.slots.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UserConcurrencyLimiter {
    pub fn new(max_concurrent: usize, queue_timeout: Duration) -> Self {
        Self {
            users: DashMap::new(),
            max_concurrent: max_concurrent.max(1),
            queue_timeout,
        }
    }

    fn slots(&self, user_id: i64) -> Arc<UserSlots> {
        self.users
            .entry(user_id)
            .or_insert_with(|| {
                Arc::new(UserSlots {
                    semaphore: Arc::new(Semaphore::new(self.max_concurrent)),
                    waiting: AtomicUsize::new(0),
                    active: AtomicUsize::new(0),
                })
            })
            .value()
            .clone()
    }

    /// Acquire a slot for this user. Immediate acquisition reports queue
    /// position 0; otherwise the position reflects how many were already
    /// waiting. Fails after `queue_timeout`.
    pub async fn acquire(
        &self,
        user_id: i64,
        thread_id: i64,
    ) -> Result<ConcurrencyPermit, CourierError> {
        let slots = self.slots(user_id);

        // Fast path: a free slot right now.
        if let Ok(permit) = Arc::clone(&slots.semaphore).try_acquire_owned() {
            slots.active.fetch_add(1, Ordering::SeqCst);
            debug!(user_id, thread_id, "slot acquired immediately");
            return Ok(ConcurrencyPermit {
                _permit: permit,
                slots,
                queue_position: 0,
            });
        }

        let queue_position = slots.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        debug!(user_id, thread_id, queue_position, "queued for slot");

        let acquired = tokio::time::timeout(
            self.queue_timeout,
            Arc::clone(&slots.semaphore).acquire_owned(),
        )
        .await;
        slots.waiting.fetch_sub(1, Ordering::SeqCst);

        match acquired {
            Ok(Ok(permit)) => {
                slots.active.fetch_add(1, Ordering::SeqCst);
                Ok(ConcurrencyPermit {
                    _permit: permit,
                    slots,
                    queue_position,
                })
            }
            Ok(Err(_closed)) => Err(CourierError::Internal(
                "concurrency semaphore closed".into(),
            )),
            Err(_) => Err(CourierError::ConcurrencyLimit {
                user_id,
                queue_position,
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    pub fn active_count(&self, user_id: i64) -> usize {
        self.users
            .get(&user_id)
            .map(|s| s.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
