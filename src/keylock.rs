use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub const SHARD_COUNT: usize = 256;

/// Shard index shared by the key locks and the entry index, so a key's lock
/// and its entries always live in shards selected the same way.
pub fn shard_index(key: &str) -> usize {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.finalize() as usize % SHARD_COUNT
}

/// Per-key mutual exclusion, sharded to keep lock registration cheap.
///
/// A key's mutex persists in its shard for the life of the process, which
/// bounds memory by the number of distinct keys ever seen.
pub struct UrlLock {
    shards: Vec<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl UrlLock {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Returns a held guard for `key`; dropping the guard releases it.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut shard = self.shards[shard_index(key)]
                .lock()
                .expect("key lock shard");
            Arc::clone(
                shard
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

impl Default for UrlLock {
    fn default() -> Self {
        Self::new()
    }
}
