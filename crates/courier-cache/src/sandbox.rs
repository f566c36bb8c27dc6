//! Per-thread sandbox metadata cache. Lets `execute_python` reuse a warm
//! sandbox across tool calls instead of paying cold-start every time.

use serde::{Deserialize, Serialize};

use crate::client::CacheClient;
use crate::keys::{sandbox_key, SANDBOX_TTL};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMeta {
    pub sandbox_id: String,
    pub created_at: i64,
    pub last_used: i64,
}

pub async fn get_sandbox(cache: &CacheClient, thread_id: i64) -> Option<SandboxMeta> {
    cache.get_json(&sandbox_key(thread_id)).await
}

pub async fn store_sandbox(cache: &CacheClient, thread_id: i64, sandbox_id: &str) -> bool {
    let now = chrono::Utc::now().timestamp();
    let meta = SandboxMeta {
        sandbox_id: sandbox_id.to_string(),
        created_at: now,
        last_used: now,
    };
    cache
        .set_json_with_ttl(&sandbox_key(thread_id), &meta, SANDBOX_TTL)
        .await
}

/// Bump `last_used` and reset the TTL after a successful execution.
pub async fn refresh_sandbox(cache: &CacheClient, thread_id: i64) -> bool {
    let Some(mut meta) = get_sandbox(cache, thread_id).await else {
        return false;
    };
    meta.last_used = chrono::Utc::now().timestamp();
    cache
        .set_json_with_ttl(&sandbox_key(thread_id), &meta, SANDBOX_TTL)
        .await
}

pub async fn clear_sandbox(cache: &CacheClient, thread_id: i64) -> bool {
    cache.delete(&sandbox_key(thread_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trips() {
        let meta = SandboxMeta {
            sandbox_id: "sbx_abc123".into(),
            created_at: 1_700_000_000,
            last_used: 1_700_000_100,
        };
        let bytes = serde_json::to_vec(&meta).unwrap();
        let back: SandboxMeta = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.sandbox_id, "sbx_abc123");
        assert_eq!(back.last_used, 1_700_000_100);
    }
}
