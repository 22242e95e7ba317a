use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use http::HeaderMap;
use tokio::sync::RwLock;

use crate::entry::CacheEntry;
use crate::keylock::{shard_index, UrlLock, SHARD_COUNT};

/// Sharded key→entries index with freshness lookup and scheduled eviction.
///
/// Each insertion gets a monotonic id; the eviction task re-looks the entry
/// up by that id under the key lock and the shard lock, so an entry that
/// was replaced or purged in the meantime is simply skipped.
#[derive(Clone)]
pub struct HttpCache {
    inner: Arc<Inner>,
}

struct Inner {
    shards: Vec<RwLock<HashMap<String, Vec<Stored>>>>,
    locks: Arc<UrlLock>,
    next_id: AtomicU64,
}

struct Stored {
    id: u64,
    entry: Arc<CacheEntry>,
}

impl HttpCache {
    pub fn new(locks: Arc<UrlLock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shards: (0..SHARD_COUNT)
                    .map(|_| RwLock::new(HashMap::new()))
                    .collect(),
                locks,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the first fresh entry for `key` whose Vary-selected headers
    /// agree with `request_headers`. Expired entries are left for the
    /// eviction tasks.
    pub async fn get(&self, key: &str, request_headers: &HeaderMap) -> Option<Arc<CacheEntry>> {
        let shard = self.inner.shards[shard_index(key)].read().await;
        let bucket = shard.get(key)?;
        let now = Instant::now();
        bucket
            .iter()
            .filter(|stored| stored.entry.is_fresh(now))
            .find(|stored| stored.entry.matches_vary(request_headers))
            .map(|stored| Arc::clone(&stored.entry))
    }

    /// Inserts `entry`, replacing the first entry of the same Vary class in
    /// place. The displaced entry is cleaned in the background; an eviction
    /// task is scheduled for the new entry's expiration.
    pub async fn put(&self, key: String, entry: Arc<CacheEntry>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let displaced = {
            let mut shard = self.inner.shards[shard_index(&key)].write().await;
            let bucket = shard.entry(key.clone()).or_default();
            let stored = Stored {
                id,
                entry: Arc::clone(&entry),
            };
            match bucket
                .iter_mut()
                .find(|old| old.entry.matches_vary(&entry.request_headers))
            {
                Some(slot) => Some(std::mem::replace(slot, stored)),
                None => {
                    bucket.push(stored);
                    None
                }
            }
        };
        if let Some(old) = displaced {
            tokio::spawn(async move {
                if let Err(err) = old.entry.response.clean().await {
                    log::warn!("cleanup of replaced cache entry failed: {err:#}");
                }
            });
        }
        tokio::spawn(expire(
            Arc::clone(&self.inner),
            key,
            id,
            entry.expiration,
        ));
    }
}

async fn expire(inner: Arc<Inner>, key: String, id: u64, when: Instant) {
    tokio::time::sleep_until(when.into()).await;
    let guard = inner.locks.acquire(&key).await;
    let removed = {
        let mut shard = inner.shards[shard_index(&key)].write().await;
        let mut removed = None;
        if let Some(bucket) = shard.get_mut(&key) {
            if let Some(pos) = bucket.iter().position(|stored| stored.id == id) {
                removed = Some(bucket.remove(pos).entry);
            }
            if bucket.is_empty() {
                shard.remove(&key);
            }
        }
        removed
    };
    drop(guard);
    if let Some(entry) = removed {
        if let Err(err) = entry.response.clean().await {
            log::warn!("eviction cleanup failed for {key}: {err:#}");
        }
    }
}
