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

use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::Condvar;
use std::sync::Mutex;

use siphasher::sip::SipHasher13;

struct LockBucket {
    held: Mutex<HashSet<Vec<u8>>>,
    cv: Condvar,
}

impl LockBucket {
    fn new() -> LockBucket {
        LockBucket {
            held: Mutex::new(HashSet::new()),
            cv: Condvar::new(),
        }
    }

    fn lock(&self, key: &[u8]) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while held.contains(key) {
            held = self
                .cv
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        held.insert(key.to_vec());
    }

    fn unlock(&self, key: &[u8]) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(key);
        drop(held);
        self.cv.notify_all();
    }
}

/// Serialises read-modify-write sequences on one encoded key. The keyspace is
/// split over a fixed number of buckets by hash; the bucket count is policy
/// and configurable at construction.
pub struct LockManager {
    buckets: Vec<LockBucket>,
}

impl LockManager {
    pub fn new(bucket_count: usize) -> LockManager {
        let bucket_count = bucket_count.max(1);
        LockManager {
            buckets: (0..bucket_count).map(|_| LockBucket::new()).collect(),
        }
    }

    /// Blocks while another guard holds `key`; never fails.
    pub fn lock<'a>(&'a self, key: &[u8]) -> KeyGuard<'a> {
        let bucket = self.bucket(key);
        bucket.lock(key);
        KeyGuard {
            bucket,
            key: key.to_vec(),
        }
    }

    fn bucket(&self, key: &[u8]) -> &LockBucket {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(key);
        let index = (hasher.finish() as usize) % self.buckets.len();
        &self.buckets[index]
    }
}

/// Releases its key on every exit path, including unwinds.
pub struct KeyGuard<'a> {
    bucket: &'a LockBucket,
    key: Vec<u8>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.bucket.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_relock_after_release() {
        let manager = LockManager::new(16);
        {
            let _guard = manager.lock(b"key");
        }
        let _guard = manager.lock(b"key");
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let manager = LockManager::new(16);
        let _a = manager.lock(b"a");
        let _b = manager.lock(b"b");
    }

    #[test]
    fn test_contended_key_serialises() {
        let manager = Arc::new(LockManager::new(4));
        let hold = Duration::from_millis(100);

        let guard = manager.lock(b"hot");
        let started = Instant::now();
        let manager_clone = manager.clone();
        let waiter = std::thread::spawn(move || {
            let _guard = manager_clone.lock(b"hot");
            started.elapsed()
        });

        std::thread::sleep(hold);
        drop(guard);
        let waited = waiter.join().unwrap();
        assert!(waited >= hold);
    }

    #[test]
    fn test_unwinding_releases_the_key() {
        let manager = Arc::new(LockManager::new(4));
        let manager_clone = manager.clone();
        let result = std::thread::spawn(move || {
            let _guard = manager_clone.lock(b"poisoned");
            panic!("unwind with the guard held");
        })
        .join();
        assert!(result.is_err());

        // the key is free again
        let _guard = manager.lock(b"poisoned");
    }

    #[test]
    fn test_many_threads_increment_under_lock() {
        let manager = Arc::new(LockManager::new(8));
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let _guard = manager.lock(b"shared");
                    let mut counter = counter.lock().unwrap();
                    *counter += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
    }
}
