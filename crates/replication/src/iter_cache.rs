// Copyright 2024 tison <wander4096@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;

use laser_storage::WalReader;
use siphasher::sip::SipHasher13;

struct CachedReader {
    reader: WalReader,
    last_used_ms: u64,
}

/// Caches one WAL reader per `(next expected sequence, follower)` so a
/// follower's next pull continues where the previous one left off instead of
/// re-positioning in the log.
#[derive(Default)]
pub(crate) struct IterCache {
    readers: Mutex<HashMap<u64, CachedReader>>,
}

impl IterCache {
    pub fn take(&self, seq_no: u64, node_hash: i64) -> Option<WalReader> {
        let key = cache_key(seq_no, node_hash);
        let mut readers = self.lock();
        readers.remove(&key).map(|cached| cached.reader)
    }

    pub fn put(&self, next_seq: u64, node_hash: i64, reader: WalReader, now_ms: u64) {
        let key = cache_key(next_seq, node_hash);
        let mut readers = self.lock();
        readers.insert(
            key,
            CachedReader {
                reader,
                last_used_ms: now_ms,
            },
        );
    }

    /// Drops readers idle for longer than `idle_ms`; returns how many.
    pub fn evict_idle(&self, idle_ms: u64, now_ms: u64) -> usize {
        let mut readers = self.lock();
        let before = readers.len();
        readers.retain(|_, cached| cached.last_used_ms + idle_ms >= now_ms);
        before - readers.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CachedReader>> {
        self.readers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn cache_key(seq_no: u64, node_hash: i64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(seq_no, node_hash as u64);
    hasher.write_u64(seq_no);
    hasher.write_i64(node_hash);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use laser_storage::LogStore;
    use laser_storage::StoreOptions;
    use laser_storage::WriteBatch;

    use super::*;

    fn store_with_writes(dir: &std::path::Path, n: u8) -> LogStore {
        let store = LogStore::open(dir, StoreOptions::default()).unwrap();
        for i in 0..n {
            let mut batch = WriteBatch::new();
            batch.put(vec![i], vec![i]);
            store.write(&batch, 1).unwrap();
        }
        store
    }

    #[test]
    fn test_take_put_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_writes(dir.path(), 3);
        let cache = IterCache::default();

        assert!(cache.take(1, 42).is_none());
        let reader = store.wal_reader(1).unwrap();
        cache.put(1, 42, reader, 1000);
        assert_eq!(cache.len(), 1);

        // wrong follower misses
        assert!(cache.take(1, 43).is_none());
        let mut reader = cache.take(1, 42).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().first_seq, 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_evict_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_writes(dir.path(), 2);
        let cache = IterCache::default();
        cache.put(1, 1, store.wal_reader(1).unwrap(), 1000);
        cache.put(1, 2, store.wal_reader(1).unwrap(), 5000);

        assert_eq!(cache.evict_idle(2000, 4000), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
