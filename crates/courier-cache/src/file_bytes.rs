//! Byte-slab cache for downloaded media, keyed by the transport file id.
//! Only bodies under the ceiling are cached; larger files always re-fetch.

use tracing::debug;

use crate::client::CacheClient;
use crate::keys::{file_bytes_key, FILE_BYTES_MAX, FILE_BYTES_TTL};

pub async fn get_file_bytes(cache: &CacheClient, transport_file_id: &str) -> Option<Vec<u8>> {
    cache.get(&file_bytes_key(transport_file_id)).await
}

/// Cache the bytes when they fit under the ceiling. Returns whether the
/// bytes were actually stored.
pub async fn store_file_bytes(
    cache: &CacheClient,
    transport_file_id: &str,
    bytes: &[u8],
) -> bool {
    if bytes.len() > FILE_BYTES_MAX {
        debug!(
            transport_file_id,
            size = bytes.len(),
            ceiling = FILE_BYTES_MAX,
            "file too large to cache"
        );
        return false;
    }
    cache
        .set_with_ttl(&file_bytes_key(transport_file_id), bytes, FILE_BYTES_TTL)
        .await
}
