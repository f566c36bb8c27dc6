//! In-process metrics recording surface.
//!
//! Exposition (Prometheus, logs, dashboards) lives outside this workspace;
//! components record onto a process-scoped `Metrics` handle that is
//! constructed once at startup and passed through the app context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// True while the cache circuit breaker is open.
    pub cache_circuit_open: AtomicBool,
    pub write_queue_enqueued: AtomicU64,
    pub write_queue_flushed: AtomicU64,
    pub write_queue_dead_lettered: AtomicU64,
    pub display_edits_sent: AtomicU64,
    pub turns_completed: AtomicU64,
    pub turns_cancelled: AtomicU64,
    /// Per-tool count of paid-tool pre-check rejections.
    tool_precheck_rejected: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_op(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_cache_circuit_open(&self, open: bool) {
        self.cache_circuit_open.store(open, Ordering::Relaxed);
    }

    pub fn record_tool_precheck_rejected(&self, tool_name: &str) {
        let mut map = self
            .tool_precheck_rejected
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        *map.entry(tool_name.to_string()).or_insert(0) += 1;
    }

    pub fn tool_precheck_rejected_count(&self, tool_name: &str) -> u64 {
        self.tool_precheck_rejected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(tool_name)
            .copied()
            .unwrap_or(0)
    }
}
