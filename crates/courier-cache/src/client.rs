//! Redis client with connection management and a circuit breaker.
//!
//! Every operation returns `Option`/`bool`: a failure, a timeout, and an
//! open circuit all look like a miss. Higher layers fall through to the
//! database; no cache condition is ever an error for callers.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use courier_core::config::CacheConfig;
use courier_core::metrics::Metrics;

/// Consecutive failures before the circuit opens.
const FAILURE_THRESHOLD: u32 = 3;
/// How long the circuit stays open before a half-open probe.
const RESET_TIMEOUT: Duration = Duration::from_secs(5);
/// Connect/read timeout applied to every operation.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Circuit breaker state machine.
///
/// Closed → (3 failures) → Open for 5 s → half-open: the next call is a
/// probe; success closes, failure reopens.
#[derive(Debug, Default)]
pub(crate) struct Breaker {
    failures: u32,
    open_until: Option<Instant>,
}

impl Breaker {
    /// True while calls should be skipped. Expiry flips to half-open:
    /// the breaker reports closed once and the probe's outcome decides.
    pub(crate) fn is_open(&mut self, now: Instant) -> bool {
        match self.open_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.open_until = None;
                debug!("cache circuit half-open, probing");
                false
            }
            None => false,
        }
    }

    pub(crate) fn record_success(&mut self) -> bool {
        let was_tripped = self.failures > 0 || self.open_until.is_some();
        self.failures = 0;
        self.open_until = None;
        was_tripped
    }

    /// Returns true when this failure opened the circuit.
    pub(crate) fn record_failure(&mut self, now: Instant) -> bool {
        self.failures += 1;
        if self.failures >= FAILURE_THRESHOLD {
            self.open_until = Some(now + RESET_TIMEOUT);
            return true;
        }
        false
    }
}

pub struct CacheClient {
    /// None when the initial connection failed: the process still runs,
    /// every cache op is a miss until restart.
    conn: Option<ConnectionManager>,
    breaker: Mutex<Breaker>,
    metrics: Arc<Metrics>,
}

impl CacheClient {
    /// Connect to the cache. A failed initial connection does not abort
    /// startup: the client degrades to all-miss behavior.
    pub async fn connect(cfg: &CacheConfig, metrics: Arc<Metrics>) -> courier_core::Result<Self> {
        let url = cfg.url()?;
        let redacted = format!("redis://{}:{}/{}", cfg.host, cfg.port, cfg.db);
        info!(url = %redacted, "cache connecting");

        let client = redis::Client::open(url)
            .map_err(|e| courier_core::CourierError::Config(e.to_string()))?;
        let conn = match ConnectionManager::new(client).await {
            Ok(conn) => {
                info!(url = %redacted, "cache connected");
                Some(conn)
            }
            Err(e) => {
                warn!(url = %redacted, error = %e, "cache unavailable, degrading to all-miss");
                metrics.set_cache_circuit_open(true);
                None
            }
        };

        Ok(Self {
            conn,
            breaker: Mutex::new(Breaker::default()),
            metrics,
        })
    }

    /// A client with no backing store: every read misses, every write is a
    /// no-op. Used when the cache is disabled and in tests.
    pub fn disconnected(metrics: Arc<Metrics>) -> Self {
        Self {
            conn: None,
            breaker: Mutex::new(Breaker::default()),
            metrics,
        }
    }

    fn circuit_allows(&self) -> bool {
        let mut breaker = self.breaker.lock().unwrap_or_else(|p| p.into_inner());
        !breaker.is_open(Instant::now())
    }

    fn note_success(&self) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|p| p.into_inner());
        if breaker.record_success() {
            info!("cache circuit closed");
            self.metrics.set_cache_circuit_open(false);
        }
    }

    fn note_failure(&self) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|p| p.into_inner());
        if breaker.record_failure(Instant::now()) {
            warn!(
                threshold = FAILURE_THRESHOLD,
                reset_secs = RESET_TIMEOUT.as_secs(),
                "cache circuit opened"
            );
            self.metrics.set_cache_circuit_open(true);
        }
    }

    /// Run one redis future under the breaker and the op timeout.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        if !self.circuit_allows() {
            return None;
        }
        match tokio::time::timeout(OP_TIMEOUT, fut).await {
            Ok(Ok(value)) => {
                self.note_success();
                Some(value)
            }
            Ok(Err(e)) => {
                warn!(op, error = %e, "cache operation failed");
                self.note_failure();
                None
            }
            Err(_) => {
                warn!(op, timeout_secs = OP_TIMEOUT.as_secs(), "cache operation timed out");
                self.note_failure();
                None
            }
        }
    }

    pub async fn ping(&self) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        self.run("ping", async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .is_some()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut conn = self.conn.clone()?;
        let key = key.to_string();
        let value: Option<Vec<u8>> = self
            .run("get", async move { conn.get(&key).await })
            .await
            .flatten();
        self.metrics.record_cache_op(value.is_some());
        value
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "cache entry failed to deserialize, dropping");
                self.delete(key).await;
                None
            }
        }
    }

    pub async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        let key = key.to_string();
        let value = value.to_vec();
        self.run("setex", async move {
            conn.set_ex::<_, _, ()>(&key, value, ttl_secs).await
        })
        .await
        .is_some()
    }

    pub async fn set_json_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set_with_ttl(key, &bytes, ttl_secs).await,
            Err(e) => {
                warn!(key, error = %e, "cache value failed to serialize");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        let key = key.to_string();
        self.run("del", async move { conn.del::<_, ()>(&key).await })
            .await
            .is_some()
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        let key = key.to_string();
        self.run("expire", async move {
            conn.expire::<_, ()>(&key, ttl_secs as i64).await
        })
        .await
        .is_some()
    }

    pub async fn rpush(&self, key: &str, value: &[u8]) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        let key = key.to_string();
        let value = value.to_vec();
        self.run("rpush", async move {
            conn.rpush::<_, _, ()>(&key, value).await
        })
        .await
        .is_some()
    }

    pub async fn lpop(&self, key: &str) -> Option<Vec<u8>> {
        let mut conn = self.conn.clone()?;
        let key = key.to_string();
        self.run("lpop", async move {
            conn.lpop::<_, Option<Vec<u8>>>(&key, None).await
        })
        .await
        .flatten()
    }

    pub async fn llen(&self, key: &str) -> Option<u64> {
        let mut conn = self.conn.clone()?;
        let key = key.to_string();
        self.run("llen", async move { conn.llen(&key).await }).await
    }

    /// Pipelined multi-get: one roundtrip for N keys. `None` means the
    /// whole pipeline was unavailable, not a per-key miss.
    pub async fn mget(&self, cache_keys: &[String]) -> Option<Vec<Option<Vec<u8>>>> {
        if cache_keys.is_empty() {
            return Some(Vec::new());
        }
        let mut conn = self.conn.clone()?;
        let cache_keys = cache_keys.to_vec();
        self.run("mget", async move {
            let mut pipe = redis::pipe();
            for key in &cache_keys {
                pipe.get(key);
            }
            pipe.query_async::<Vec<Option<Vec<u8>>>>(&mut conn).await
        })
        .await
    }

    /// Pipelined SETEX of several entries in one roundtrip.
    pub async fn set_many(&self, entries: &[(String, Vec<u8>, u64)]) -> bool {
        if entries.is_empty() {
            return true;
        }
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        let entries = entries.to_vec();
        self.run("pipeline_set", async move {
            let mut pipe = redis::pipe();
            for (key, value, ttl) in &entries {
                pipe.set_ex(key, value.as_slice(), *ttl).ignore();
            }
            pipe.query_async::<()>(&mut conn).await
        })
        .await
        .is_some()
    }
}
