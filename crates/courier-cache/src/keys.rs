//! Cache key builders and TTLs. Keys are opaque strings everywhere else;
//! this module is the only place that knows their shape.

pub const USER_TTL: u64 = 60;
pub const THREAD_TTL: u64 = 600;
pub const MESSAGES_TTL: u64 = 300;
pub const FILES_TTL: u64 = 3_600;
pub const FILE_BYTES_TTL: u64 = 3_600;
pub const SANDBOX_TTL: u64 = 3_600;

/// Bytes above this are not worth caching.
pub const FILE_BYTES_MAX: usize = 5 * 1024 * 1024;

pub const WRITE_QUEUE_KEY: &str = "write_queue";
pub const WRITE_DLQ_KEY: &str = "write_dlq";

pub fn user_key(user_id: i64) -> String {
    format!("user:{user_id}")
}

/// Thread cache key. A missing forum topic maps to `0` so private chats
/// and the main group thread share one slot shape.
pub fn thread_key(chat_id: i64, user_id: i64, topic_id: Option<i64>) -> String {
    format!("thread:{chat_id}:{user_id}:{}", topic_id.unwrap_or(0))
}

pub fn messages_key(thread_id: i64) -> String {
    format!("messages:{thread_id}")
}

pub fn files_key(thread_id: i64) -> String {
    format!("files:{thread_id}")
}

pub fn file_bytes_key(transport_file_id: &str) -> String {
    format!("file:bytes:{transport_file_id}")
}

pub fn sandbox_key(thread_id: i64) -> String {
    format!("sandbox:{thread_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_key_defaults_topic_to_zero() {
        assert_eq!(thread_key(-100123, 42, None), "thread:-100123:42:0");
        assert_eq!(thread_key(-100123, 42, Some(7)), "thread:-100123:42:7");
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(user_key(5), "user:5");
        assert_eq!(messages_key(9), "messages:9");
        assert_eq!(files_key(9), "files:9");
        assert_eq!(file_bytes_key("AgACAgQ"), "file:bytes:AgACAgQ");
        assert_eq!(sandbox_key(3), "sandbox:3");
    }
}
