//! Pipelined warm-context reads: user, thread, messages, and files for one
//! conversation in a single cache roundtrip.

use serde_json::Value;
use tracing::debug;

use crate::client::CacheClient;
use crate::keys;

/// Batch-fetched context. Each slot is `None` on a miss (or when the cache
/// is unavailable, which looks the same).
#[derive(Debug, Default)]
pub struct ThreadWarmContext {
    pub user: Option<Value>,
    pub thread: Option<Value>,
    pub messages: Option<Vec<Value>>,
    pub files: Option<Vec<Value>>,
    pub cache_hits: u32,
    pub cache_misses: u32,
}

/// Envelope for list-valued cache entries, so a cached empty list is
/// distinguishable from a miss.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ListEnvelope {
    items: Vec<Value>,
    cached_at: i64,
}

/// Fetch user/thread/messages/files in one pipelined MGET.
pub async fn warm_thread_context(
    cache: &CacheClient,
    user_id: i64,
    chat_id: i64,
    topic_id: Option<i64>,
    thread_id: i64,
) -> ThreadWarmContext {
    let cache_keys = vec![
        keys::user_key(user_id),
        keys::thread_key(chat_id, user_id, topic_id),
        keys::messages_key(thread_id),
        keys::files_key(thread_id),
    ];

    let Some(slots) = cache.mget(&cache_keys).await else {
        return ThreadWarmContext {
            cache_misses: 4,
            ..Default::default()
        };
    };

    fn parse_slot(slot: Option<Option<Vec<u8>>>) -> Option<Value> {
        serde_json::from_slice(&slot.flatten()?).ok()
    }

    let mut ctx = ThreadWarmContext::default();
    let mut slots = slots.into_iter();

    let parsed = [
        parse_slot(slots.next()),
        parse_slot(slots.next()),
        parse_slot(slots.next()),
        parse_slot(slots.next()),
    ];
    for slot in &parsed {
        if slot.is_some() {
            ctx.cache_hits += 1;
        } else {
            ctx.cache_misses += 1;
        }
    }
    let [user, thread, messages, files] = parsed;

    ctx.user = user;
    ctx.thread = thread;
    ctx.messages = messages
        .and_then(|v| serde_json::from_value::<ListEnvelope>(v).ok())
        .map(|e| e.items);
    ctx.files = files
        .and_then(|v| serde_json::from_value::<ListEnvelope>(v).ok())
        .map(|e| e.items);

    debug!(
        user_id,
        thread_id,
        hits = ctx.cache_hits,
        misses = ctx.cache_misses,
        "warm context fetched"
    );
    ctx
}

/// Write any provided context slots back in one pipelined SETEX pass.
pub async fn cache_thread_context(
    cache: &CacheClient,
    user_id: i64,
    chat_id: i64,
    topic_id: Option<i64>,
    thread_id: i64,
    user: Option<&Value>,
    thread: Option<&Value>,
    messages: Option<&[Value]>,
    files: Option<&[Value]>,
) -> bool {
    let now = chrono::Utc::now().timestamp();
    let mut entries: Vec<(String, Vec<u8>, u64)> = Vec::new();

    if let Some(u) = user {
        if let Ok(bytes) = serde_json::to_vec(u) {
            entries.push((keys::user_key(user_id), bytes, keys::USER_TTL));
        }
    }
    if let Some(t) = thread {
        if let Ok(bytes) = serde_json::to_vec(t) {
            entries.push((
                keys::thread_key(chat_id, user_id, topic_id),
                bytes,
                keys::THREAD_TTL,
            ));
        }
    }
    if let Some(msgs) = messages {
        let envelope = ListEnvelope {
            items: msgs.to_vec(),
            cached_at: now,
        };
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            entries.push((keys::messages_key(thread_id), bytes, keys::MESSAGES_TTL));
        }
    }
    if let Some(fs) = files {
        let envelope = ListEnvelope {
            items: fs.to_vec(),
            cached_at: now,
        };
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            entries.push((keys::files_key(thread_id), bytes, keys::FILES_TTL));
        }
    }

    if entries.is_empty() {
        return true;
    }
    cache.set_many(&entries).await
}
