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

use std::collections::BTreeMap;
use std::sync::Arc;

use laser_codec::CounterValue;
use laser_codec::decode_value_header;
use laser_codec::ListIndexKey;
use laser_codec::ListMeta;
use laser_codec::MapFieldKey;
use laser_codec::MapMeta;
use laser_codec::RawStringValue;
use laser_codec::RecordKey;
use laser_codec::SetMemberKey;
use laser_codec::SetMeta;
use laser_codec::ValueTag;
use laser_codec::ZSetBucket;
use laser_codec::ZSetMeta;
use laser_codec::ZSetScoreKey;
use laser_protos::Status;
use laser_replication::ReplicationDb;
use laser_runtime::current_time_ms;
use laser_storage::WriteBatch;

use crate::key_lock::LockManager;

#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Explicit TTL in milliseconds; 0 falls back to the table default.
    pub ttl_ms: u64,
    /// Only write when no alive value exists.
    pub not_exists: bool,
}

/// The six-type command surface over one replicated partition store.
///
/// Every read honours the stored expiration; every read-modify-write holds
/// the root key's lock for its whole duration. Writes that create or fully
/// replace a value stamp the per-table default TTL unless the caller passes
/// one explicitly.
pub struct KvEngine {
    db: Arc<ReplicationDb>,
    locks: Arc<LockManager>,
    ttl_default_ms: u64,
}

impl KvEngine {
    pub fn new(db: Arc<ReplicationDb>, locks: Arc<LockManager>, ttl_default_ms: u64) -> KvEngine {
        KvEngine {
            db,
            locks,
            ttl_default_ms,
        }
    }

    pub fn db(&self) -> &Arc<ReplicationDb> {
        &self.db
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    // string

    pub fn get(&self, key: &RecordKey) -> Result<Vec<u8>, Status> {
        let raw = self.db.read(&key.encode())?;
        let value = RawStringValue::decode(&raw)?;
        if is_expired(value.expire_ms) {
            return Err(Status::KeyExpire);
        }
        Ok(value.value)
    }

    pub fn set(&self, key: &RecordKey, data: &[u8]) -> Result<(), Status> {
        let mut value = RawStringValue::new(data.to_vec());
        value.expire_ms = self.auto_expire();
        let mut batch = WriteBatch::new();
        batch.put(key.encode(), value.encode());
        self.db.write(&batch).map(|_| ())
    }

    pub fn setx(&self, key: &RecordKey, data: &[u8], options: SetOptions) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        if options.not_exists {
            match self.db.read(&root) {
                Ok(raw) => {
                    let old = RawStringValue::decode(&raw)?;
                    if !is_expired(old.expire_ms) {
                        return Err(Status::KeyExists);
                    }
                }
                Err(Status::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        let mut value = RawStringValue::new(data.to_vec());
        value.expire_ms = self.expire_from(options.ttl_ms);
        let mut batch = WriteBatch::new();
        batch.put(root, value.encode());
        self.db.write(&batch).map(|_| ())
    }

    pub fn mset(&self, pairs: &[(RecordKey, Vec<u8>)]) -> Result<(), Status> {
        let mut batch = WriteBatch::new();
        let mut guards = Vec::with_capacity(pairs.len());
        for (key, data) in pairs {
            let root = key.encode();
            guards.push(self.locks.lock(&root));
            let mut value = RawStringValue::new(data.clone());
            value.expire_ms = self.auto_expire();
            batch.put(root, value.encode());
        }
        self.db.write(&batch).map(|_| ())
    }

    /// `not_exists` silently skips keys that are alive instead of failing the
    /// whole call.
    pub fn msetx(&self, pairs: &[(RecordKey, Vec<u8>)], options: SetOptions) -> Result<(), Status> {
        let mut batch = WriteBatch::new();
        let mut guards = Vec::with_capacity(pairs.len());
        for (key, data) in pairs {
            let root = key.encode();
            guards.push(self.locks.lock(&root));
            if options.not_exists {
                match self.db.read(&root) {
                    Ok(raw) => match RawStringValue::decode(&raw) {
                        Ok(old) if !is_expired(old.expire_ms) => continue,
                        Ok(_) => {}
                        Err(_) => continue,
                    },
                    Err(Status::NotFound) => {}
                    Err(_) => continue,
                }
            }
            let mut value = RawStringValue::new(data.clone());
            value.expire_ms = self.expire_from(options.ttl_ms);
            batch.put(root, value.encode());
        }
        self.db.write(&batch).map(|_| ())
    }

    pub fn append(&self, key: &RecordKey, suffix: &[u8]) -> Result<u32, Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let mut data = match self.db.read(&root) {
            Ok(raw) => RawStringValue::decode(&raw)?.value,
            Err(Status::NotFound) => Vec::new(),
            Err(err) => return Err(err),
        };
        data.extend_from_slice(suffix);
        let length = data.len() as u32;

        let mut value = RawStringValue::new(data);
        value.expire_ms = self.auto_expire();
        let mut batch = WriteBatch::new();
        batch.put(root, value.encode());
        self.db.write(&batch)?;
        Ok(length)
    }

    /// Existence probe; expired and undecodable values count as absent.
    pub fn exist(&self, key: &RecordKey) -> Result<bool, Status> {
        match self.db.read(&key.encode()) {
            Ok(raw) => match decode_value_header(&raw) {
                Ok(header) => Ok(!is_expired(header.expire_ms)),
                Err(_) => Ok(false),
            },
            Err(Status::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // counter

    pub fn incr(&self, key: &RecordKey, step: i64) -> Result<i64, Status> {
        self.counter_by_step(key, step)
    }

    pub fn decr(&self, key: &RecordKey, step: i64) -> Result<i64, Status> {
        self.counter_by_step(key, -step)
    }

    fn counter_by_step(&self, key: &RecordKey, step: i64) -> Result<i64, Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let mut count = match self.db.read(&root) {
            Ok(raw) => CounterValue::decode(&raw)?.value,
            Err(Status::NotFound) => 0,
            Err(err) => return Err(err),
        };
        count += step;

        let mut value = CounterValue::new(count);
        value.expire_ms = self.auto_expire();
        let mut batch = WriteBatch::new();
        batch.put(root, value.encode());
        self.db.write(&batch)?;
        Ok(count)
    }

    // common

    /// Deletes the root and, for composite types, every child row under its
    /// prefix in the same atomic batch.
    pub fn delete(&self, key: &RecordKey) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);
        self.db.delete_key(key)
    }

    pub fn expire(&self, key: &RecordKey, delta_ms: u64) -> Result<(), Status> {
        self.expire_at(key, current_time_ms() + delta_ms)
    }

    /// Rewrites the stored expiration of the root and, for composite types,
    /// of every child row, so compaction can collect them independently.
    pub fn expire_at(&self, key: &RecordKey, timestamp_ms: u64) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let raw = self.db.read(&root)?;
        let header = decode_value_header(&raw)?;
        let mut batch = WriteBatch::new();
        match header.tag {
            ValueTag::RawString => {
                let mut value = RawStringValue::decode(&raw)?;
                value.expire_ms = timestamp_ms;
                batch.put(root, value.encode());
            }
            ValueTag::Counter => {
                let mut value = CounterValue::decode(&raw)?;
                value.expire_ms = timestamp_ms;
                batch.put(root, value.encode());
            }
            ValueTag::Map => {
                let mut meta = MapMeta::decode(&raw)?;
                meta.expire_ms = timestamp_ms;
                batch.put(root, meta.encode());
                self.expire_raw_children(&mut batch, key, timestamp_ms);
            }
            ValueTag::List => {
                let mut meta = ListMeta::decode(&raw)?;
                meta.expire_ms = timestamp_ms;
                batch.put(root, meta.encode());
                self.expire_raw_children(&mut batch, key, timestamp_ms);
            }
            ValueTag::Set => {
                let mut meta = SetMeta::decode(&raw)?;
                meta.expire_ms = timestamp_ms;
                batch.put(root, meta.encode());
                self.expire_raw_children(&mut batch, key, timestamp_ms);
            }
            ValueTag::ZSet => {
                let mut meta = ZSetMeta::decode(&raw)?;
                meta.expire_ms = timestamp_ms;
                batch.put(root, meta.encode());
                for (child, value) in self.db.scan_prefix(&key.composite_prefix()) {
                    let Ok(mut bucket) = ZSetBucket::decode(&value) else {
                        continue;
                    };
                    bucket.expire_ms = timestamp_ms;
                    batch.put(child, bucket.encode());
                }
            }
        }
        self.db.write(&batch).map(|_| ())
    }

    fn expire_raw_children(&self, batch: &mut WriteBatch, key: &RecordKey, timestamp_ms: u64) {
        for (child, value) in self.db.scan_prefix(&key.composite_prefix()) {
            let Ok(mut item) = RawStringValue::decode(&value) else {
                continue;
            };
            item.expire_ms = timestamp_ms;
            batch.put(child, item.encode());
        }
    }

    /// −2 when the key does not exist, −1 when it never expires, otherwise
    /// the remaining lifetime in milliseconds.
    pub fn ttl(&self, key: &RecordKey) -> Result<i64, Status> {
        let raw = match self.db.read(&key.encode()) {
            Ok(raw) => raw,
            Err(Status::NotFound) => return Ok(-2),
            Err(err) => return Err(err),
        };
        let header = decode_value_header(&raw)?;
        if header.expire_ms == 0 {
            return Ok(-1);
        }
        let now = current_time_ms();
        Ok(header.expire_ms.saturating_sub(now) as i64)
    }

    // hash

    pub fn hset(&self, key: &RecordKey, field: &[u8], data: &[u8]) -> Result<(), Status> {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_vec(), data.to_vec());
        self.hmset(key, &fields)
    }

    pub fn hmset(&self, key: &RecordKey, fields: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let mut meta = match self.db.read(&root) {
            Ok(raw) => MapMeta::decode(&raw)?,
            Err(Status::NotFound) => MapMeta::default(),
            Err(err) => return Err(err),
        };
        // every hash write refreshes the root's expiration
        meta.expire_ms = self.auto_expire();

        let mut batch = WriteBatch::new();
        for (field, data) in fields {
            let field_key = MapFieldKey::new(key, field.clone()).encode();
            if !self.db.exist(&field_key) {
                meta.size += 1;
            }
            let mut value = RawStringValue::new(data.clone());
            value.expire_ms = self.auto_expire();
            batch.put(field_key, value.encode());
        }
        batch.put(root, meta.encode());
        self.db.write(&batch).map(|_| ())
    }

    pub fn hget(&self, key: &RecordKey, field: &[u8]) -> Result<Vec<u8>, Status> {
        self.read_map_meta(key)?;
        let raw = self.db.read(&MapFieldKey::new(key, field.to_vec()).encode())?;
        Ok(RawStringValue::decode(&raw)?.value)
    }

    pub fn hgetall(&self, key: &RecordKey) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Status> {
        self.read_map_meta(key)?;
        let mut entries = Vec::new();
        for (child, value) in self.db.scan_prefix(&key.composite_prefix()) {
            let Ok(field_key) = MapFieldKey::decode(&child) else {
                continue;
            };
            let Ok(value) = RawStringValue::decode(&value) else {
                continue;
            };
            entries.push((field_key.field, value.value));
        }
        Ok(entries)
    }

    pub fn hkeys(&self, key: &RecordKey) -> Result<Vec<Vec<u8>>, Status> {
        self.read_map_meta(key)?;
        let mut fields = Vec::new();
        for (child, _) in self.db.scan_prefix(&key.composite_prefix()) {
            let field_key = MapFieldKey::decode(&child)?;
            fields.push(field_key.field);
        }
        Ok(fields)
    }

    pub fn hlen(&self, key: &RecordKey) -> Result<u32, Status> {
        Ok(self.read_map_meta(key)?.size)
    }

    pub fn hdel(&self, key: &RecordKey, field: &[u8]) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let raw = self.db.read(&root)?;
        let mut meta = MapMeta::decode(&raw)?;
        let field_key = MapFieldKey::new(key, field.to_vec()).encode();
        // requires the field row to be present
        self.db.read(&field_key)?;

        let mut batch = WriteBatch::new();
        batch.delete(field_key);
        meta.size = meta.size.saturating_sub(1);
        batch.put(root, meta.encode());
        self.db.write(&batch).map(|_| ())
    }

    fn read_map_meta(&self, key: &RecordKey) -> Result<MapMeta, Status> {
        let raw = self.db.read(&key.encode())?;
        let meta = MapMeta::decode(&raw)?;
        if is_expired(meta.expire_ms) {
            return Err(Status::KeyExpire);
        }
        Ok(meta)
    }

    // list

    pub fn push_front(&self, key: &RecordKey, data: &[u8]) -> Result<(), Status> {
        self.list_push(key, data, true)
    }

    pub fn push_back(&self, key: &RecordKey, data: &[u8]) -> Result<(), Status> {
        self.list_push(key, data, false)
    }

    fn list_push(&self, key: &RecordKey, data: &[u8], front: bool) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let mut meta = match self.db.read(&root) {
            Ok(raw) => ListMeta::decode(&raw)?,
            Err(Status::NotFound) => ListMeta::default(),
            Err(err) => return Err(err),
        };
        meta.expire_ms = self.auto_expire();

        let index = if front {
            meta.push_front()
        } else {
            meta.push_back()
        };

        let mut batch = WriteBatch::new();
        batch.put(root, meta.encode());
        let mut value = RawStringValue::new(data.to_vec());
        value.expire_ms = self.auto_expire();
        batch.put(ListIndexKey::new(key, index).encode(), value.encode());
        self.db.write(&batch).map(|_| ())
    }

    pub fn pop_front(&self, key: &RecordKey) -> Result<Vec<u8>, Status> {
        self.list_pop(key, true)
    }

    pub fn pop_back(&self, key: &RecordKey) -> Result<Vec<u8>, Status> {
        self.list_pop(key, false)
    }

    fn list_pop(&self, key: &RecordKey, front: bool) -> Result<Vec<u8>, Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let raw = self.db.read(&root)?;
        let mut meta = ListMeta::decode(&raw)?;
        if is_expired(meta.expire_ms) {
            return Err(Status::KeyExpire);
        }
        if meta.size() == 0 {
            return Err(Status::Empty);
        }

        let index = if front {
            meta.pop_front()
        } else {
            meta.pop_back()
        };
        let item_key = ListIndexKey::new(key, index).encode();
        let item_raw = self.db.read(&item_key)?;
        let item = RawStringValue::decode(&item_raw)?;

        let mut batch = WriteBatch::new();
        batch.put(root, meta.encode());
        batch.delete(item_key);
        self.db.write(&batch)?;
        Ok(item.value)
    }

    /// Non-negative `index` counts from the front, negative from the back.
    pub fn lindex(&self, key: &RecordKey, index: i64) -> Result<Vec<u8>, Status> {
        let meta = self.read_list_meta(key)?;
        let target = if index >= 0 {
            meta.start + index + 1
        } else {
            meta.end + index
        };
        let raw = self.db.read(&ListIndexKey::new(key, target).encode())?;
        Ok(RawStringValue::decode(&raw)?.value)
    }

    /// Values from offset `start` to `end` inclusive; `end == 0` means the
    /// whole live range.
    pub fn lrange(&self, key: &RecordKey, start: u64, end: u64) -> Result<Vec<Vec<u8>>, Status> {
        let meta = self.read_list_meta(key)?;
        let target_start = meta.start + start as i64 + 1;
        let mut target_end = meta.end - 1;
        if end > 0 {
            if end <= start {
                return Err(Status::InvalidArgument);
            }
            target_end = meta.start + end as i64;
        }
        if target_start > meta.end || target_end > meta.end {
            return Err(Status::InvalidArgument);
        }

        let mut items = Vec::new();
        for (child, value) in self.db.scan_prefix(&key.composite_prefix()) {
            let Ok(index_key) = ListIndexKey::decode(&child) else {
                continue;
            };
            if index_key.index < target_start || index_key.index > target_end {
                continue;
            }
            let Ok(value) = RawStringValue::decode(&value) else {
                continue;
            };
            items.push((index_key.index, value.value));
        }
        // byte order interleaves the sign classes; restore index order
        items.sort_by_key(|(index, _)| *index);
        Ok(items.into_iter().map(|(_, value)| value).collect())
    }

    pub fn llen(&self, key: &RecordKey) -> Result<i64, Status> {
        Ok(self.read_list_meta(key)?.size())
    }

    fn read_list_meta(&self, key: &RecordKey) -> Result<ListMeta, Status> {
        let raw = self.db.read(&key.encode())?;
        let meta = ListMeta::decode(&raw)?;
        if is_expired(meta.expire_ms) {
            return Err(Status::KeyExpire);
        }
        Ok(meta)
    }

    // set

    pub fn sadd(&self, key: &RecordKey, member: &[u8]) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let member_key = SetMemberKey::new(key, member.to_vec()).encode();
        let mut batch = WriteBatch::new();
        match self.db.read(&root) {
            Ok(raw) => {
                let mut meta = SetMeta::decode(&raw)?;
                if self.db.exist(&member_key) {
                    return Ok(());
                }
                meta.size += 1;
                batch.put(root, meta.encode());
            }
            Err(Status::NotFound) => {
                let meta = SetMeta {
                    size: 1,
                    expire_ms: self.auto_expire(),
                };
                batch.put(root, meta.encode());
            }
            Err(err) => return Err(err),
        }
        let mut value = RawStringValue::new(Vec::new());
        value.expire_ms = self.auto_expire();
        batch.put(member_key, value.encode());
        self.db.write(&batch).map(|_| ())
    }

    pub fn has_member(&self, key: &RecordKey, member: &[u8]) -> Result<bool, Status> {
        self.read_set_meta(key)?;
        Ok(self
            .db
            .exist(&SetMemberKey::new(key, member.to_vec()).encode()))
    }

    pub fn members(&self, key: &RecordKey) -> Result<Vec<Vec<u8>>, Status> {
        self.read_set_meta(key)?;
        let mut members = Vec::new();
        for (child, _) in self.db.scan_prefix(&key.composite_prefix()) {
            let Ok(member_key) = SetMemberKey::decode(&child) else {
                continue;
            };
            members.push(member_key.member);
        }
        Ok(members)
    }

    pub fn scard(&self, key: &RecordKey) -> Result<u32, Status> {
        Ok(self.read_set_meta(key)?.size)
    }

    pub fn sdel(&self, key: &RecordKey, member: &[u8]) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let raw = self.db.read(&root)?;
        let mut meta = SetMeta::decode(&raw)?;
        let member_key = SetMemberKey::new(key, member.to_vec()).encode();
        self.db.read(&member_key)?;

        let mut batch = WriteBatch::new();
        meta.size = meta.size.saturating_sub(1);
        batch.put(root, meta.encode());
        batch.delete(member_key);
        self.db.write(&batch).map(|_| ())
    }

    fn read_set_meta(&self, key: &RecordKey) -> Result<SetMeta, Status> {
        let raw = self.db.read(&key.encode())?;
        let meta = SetMeta::decode(&raw)?;
        if is_expired(meta.expire_ms) {
            return Err(Status::KeyExpire);
        }
        Ok(meta)
    }

    // sorted set

    /// Members group under their score's bucket; the meta counts buckets.
    /// Re-adding an existing (score, member) pair only refreshes expiry.
    pub fn zadd(&self, key: &RecordKey, member_scores: &BTreeMap<Vec<u8>, i64>) -> Result<(), Status> {
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let mut meta = match self.db.read(&root) {
            Ok(raw) => ZSetMeta::decode(&raw)?,
            Err(Status::NotFound) => ZSetMeta::default(),
            Err(err) => return Err(err),
        };

        let mut pending: BTreeMap<i64, ZSetBucket> = BTreeMap::new();
        for (member, score) in member_scores {
            let bucket = match pending.remove(score) {
                Some(bucket) => Some(bucket),
                None => {
                    let bucket_key = ZSetScoreKey::new(key, *score).encode();
                    match self.db.read(&bucket_key) {
                        Ok(raw) => Some(ZSetBucket::decode(&raw)?),
                        Err(Status::NotFound) => None,
                        Err(err) => return Err(err),
                    }
                }
            };
            let mut bucket = match bucket {
                Some(bucket) => bucket,
                None => {
                    meta.size += 1;
                    ZSetBucket::default()
                }
            };
            if !bucket.contains(member) {
                bucket.add_member(member.clone());
            }
            bucket.expire_ms = self.auto_expire();
            pending.insert(*score, bucket);
        }

        meta.expire_ms = self.auto_expire();
        let mut batch = WriteBatch::new();
        batch.put(root, meta.encode());
        for (score, bucket) in pending {
            batch.put(ZSetScoreKey::new(key, score).encode(), bucket.encode());
        }
        self.db.write(&batch).map(|_| ())
    }

    /// `(score, member)` pairs with `min ≤ score ≤ max` in ascending score
    /// order.
    pub fn zrange_by_score(
        &self,
        key: &RecordKey,
        min: i64,
        max: i64,
    ) -> Result<Vec<(i64, Vec<u8>)>, Status> {
        if min > max {
            return Ok(Vec::new());
        }
        self.read_zset_meta(key)?;

        let mut pairs = Vec::new();
        for (child, value) in self.zset_scan(key, min, max) {
            let Ok(score_key) = ZSetScoreKey::decode(&child) else {
                continue;
            };
            let Ok(bucket) = ZSetBucket::decode(&value) else {
                continue;
            };
            for member in bucket.members {
                pairs.push((score_key.score, member));
            }
        }
        Ok(pairs)
    }

    /// Deletes every score bucket in `[min, max]`; returns how many. The root
    /// goes too once no bucket remains.
    pub fn zrem_range_by_score(&self, key: &RecordKey, min: i64, max: i64) -> Result<i64, Status> {
        if min > max {
            return Ok(0);
        }
        let root = key.encode();
        let _guard = self.locks.lock(&root);

        let raw = self.db.read(&root)?;
        let mut meta = ZSetMeta::decode(&raw)?;
        if is_expired(meta.expire_ms) {
            return Err(Status::KeyExpire);
        }

        let mut batch = WriteBatch::new();
        let mut removed = 0i64;
        for (child, _) in self.zset_scan(key, min, max) {
            batch.delete(child);
            removed += 1;
        }
        meta.size = meta.size.saturating_sub(removed as u32);
        if meta.size == 0 {
            batch.delete(root);
        } else {
            batch.put(root, meta.encode());
        }
        self.db.write(&batch)?;
        Ok(removed)
    }

    /// Big-endian score suffixes put the negative class after the
    /// non-negative one in byte order; a numeric range spanning zero is two
    /// byte-range scans stitched negatives-first.
    fn zset_scan(&self, key: &RecordKey, min: i64, max: i64) -> Vec<(Vec<u8>, Vec<u8>)> {
        let encode = |score: i64| ZSetScoreKey::new(key, score).encode();
        if max < 0 || min >= 0 {
            self.db.scan_range(&encode(min), &encode(max))
        } else {
            let mut rows = self.db.scan_range(&encode(min), &encode(-1));
            rows.extend(self.db.scan_range(&encode(0), &encode(max)));
            rows
        }
    }

    fn read_zset_meta(&self, key: &RecordKey) -> Result<ZSetMeta, Status> {
        let raw = self.db.read(&key.encode())?;
        let meta = ZSetMeta::decode(&raw)?;
        if is_expired(meta.expire_ms) {
            return Err(Status::KeyExpire);
        }
        Ok(meta)
    }

    fn auto_expire(&self) -> u64 {
        if self.ttl_default_ms == 0 {
            0
        } else {
            current_time_ms() + self.ttl_default_ms
        }
    }

    fn expire_from(&self, ttl_ms: u64) -> u64 {
        if ttl_ms > 0 {
            current_time_ms() + ttl_ms
        } else {
            self.auto_expire()
        }
    }
}

fn is_expired(expire_ms: u64) -> bool {
    expire_ms != 0 && expire_ms <= current_time_ms()
}

#[cfg(test)]
mod tests {
    use laser_protos::entity::DbRole;
    use laser_replication::ReplicationOptions;
    use laser_storage::LogStore;
    use laser_storage::StoreOptions;

    use super::*;

    fn engine(dir: &std::path::Path) -> KvEngine {
        engine_with_ttl(dir, 0)
    }

    fn engine_with_ttl(dir: &std::path::Path, ttl_default_ms: u64) -> KvEngine {
        let store = LogStore::open(dir, StoreOptions::default()).unwrap();
        let db = Arc::new(ReplicationDb::new(
            store,
            ReplicationOptions::new(1, DbRole::Leader, "base-1"),
        ));
        KvEngine::new(db, Arc::new(LockManager::new(64)), ttl_default_ms)
    }

    fn record(pk: &str, col: &str) -> RecordKey {
        RecordKey::new(vec![pk.as_bytes().to_vec()], vec![col.as_bytes().to_vec()])
    }

    #[test]
    fn test_string_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("u", "age");

        engine.set(&key, b"data").unwrap();
        assert_eq!(engine.get(&key).unwrap(), b"data");
        assert!(engine.exist(&key).unwrap());

        engine.delete(&key).unwrap();
        assert!(!engine.exist(&key).unwrap());
        assert_eq!(engine.get(&key).unwrap_err(), Status::NotFound);

        let options = SetOptions {
            not_exists: true,
            ..Default::default()
        };
        engine.setx(&key, b"first", options).unwrap();
        assert_eq!(
            engine.setx(&key, b"second", options).unwrap_err(),
            Status::KeyExists
        );
        assert_eq!(engine.get(&key).unwrap(), b"first");
    }

    #[test]
    fn test_counter_steps() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("counter", "hits");

        assert_eq!(engine.incr(&key, 1).unwrap(), 1);
        assert_eq!(engine.incr(&key, 1000).unwrap(), 1001);
        assert_eq!(engine.decr(&key, 1).unwrap(), 1000);
        assert_eq!(engine.decr(&key, 3000).unwrap(), -2000);

        // a raw string is not a counter
        let other = record("counter", "str");
        engine.set(&other, b"nope").unwrap();
        assert_eq!(engine.incr(&other, 1).unwrap_err(), Status::InvalidArgument);
    }

    #[test]
    fn test_append_and_msetx() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("s", "a");

        assert_eq!(engine.append(&key, b"head").unwrap(), 4);
        assert_eq!(engine.append(&key, b"+tail").unwrap(), 9);
        assert_eq!(engine.get(&key).unwrap(), b"head+tail");

        let pairs = vec![
            (record("m", "1"), b"one".to_vec()),
            (record("m", "2"), b"two".to_vec()),
        ];
        engine.mset(&pairs).unwrap();
        assert_eq!(engine.get(&record("m", "1")).unwrap(), b"one");

        // msetx with not_exists skips the alive key and writes the new one
        let pairs = vec![
            (record("m", "1"), b"changed".to_vec()),
            (record("m", "3"), b"three".to_vec()),
        ];
        engine
            .msetx(
                &pairs,
                SetOptions {
                    not_exists: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(engine.get(&record("m", "1")).unwrap(), b"one");
        assert_eq!(engine.get(&record("m", "3")).unwrap(), b"three");
    }

    #[test]
    fn test_hash_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("h", "dict");

        engine.hset(&key, b"test", b"xxxx").unwrap();
        assert_eq!(engine.hlen(&key).unwrap(), 1);

        let mut fields = BTreeMap::new();
        for i in 0..10 {
            fields.insert(
                format!("test{i}").into_bytes(),
                format!("xxxx{i}").into_bytes(),
            );
        }
        engine.hmset(&key, &fields).unwrap();
        assert_eq!(engine.hlen(&key).unwrap(), 11);

        assert_eq!(engine.hget(&key, b"test3").unwrap(), b"xxxx3");
        assert_eq!(
            engine.hget(&key, b"missing").unwrap_err(),
            Status::NotFound
        );

        let keys = engine.hkeys(&key).unwrap();
        assert_eq!(keys.len(), 11);
        // stored order: "test" sorts ahead of "test0".."test9"
        assert_eq!(keys[0], b"test");
        assert_eq!(keys[1], b"test0");
        assert_eq!(keys[10], b"test9");

        let all = engine.hgetall(&key).unwrap();
        assert_eq!(all.len(), 11);
        assert_eq!(all[0], (b"test".to_vec(), b"xxxx".to_vec()));

        engine.hdel(&key, b"test").unwrap();
        assert_eq!(engine.hlen(&key).unwrap(), 10);
        assert_eq!(engine.hdel(&key, b"test").unwrap_err(), Status::NotFound);

        // overwriting an existing field keeps the size
        engine.hset(&key, b"test5", b"rewritten").unwrap();
        assert_eq!(engine.hlen(&key).unwrap(), 10);
        assert_eq!(engine.hget(&key, b"test5").unwrap(), b"rewritten");
    }

    #[test]
    fn test_list_indexing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("l", "queue");

        for i in 0..100 {
            engine
                .push_front(&key, format!("xxxx{i}").as_bytes())
                .unwrap();
        }
        assert_eq!(engine.llen(&key).unwrap(), 100);
        assert_eq!(engine.lindex(&key, 98).unwrap(), b"xxxx1");
        assert_eq!(engine.lindex(&key, -2).unwrap(), b"xxxx1");
        assert_eq!(engine.lindex(&key, 0).unwrap(), b"xxxx99");
        assert_eq!(engine.lindex(&key, 100).unwrap_err(), Status::NotFound);

        let all = engine.lrange(&key, 0, 0).unwrap();
        assert_eq!(all.len(), 100);
        assert_eq!(all[0], b"xxxx99");
        assert_eq!(all[99], b"xxxx0");

        let slice = engine.lrange(&key, 0, 2).unwrap();
        assert_eq!(slice, vec![b"xxxx99".to_vec(), b"xxxx98".to_vec()]);
        assert_eq!(
            engine.lrange(&key, 3, 2).unwrap_err(),
            Status::InvalidArgument
        );

        // pops return the reverse insertion order
        for i in (0..100).rev() {
            let popped = engine.pop_front(&key).unwrap();
            assert_eq!(popped, format!("xxxx{i}").into_bytes());
        }
        assert_eq!(engine.pop_front(&key).unwrap_err(), Status::Empty);
        assert_eq!(engine.pop_back(&key).unwrap_err(), Status::Empty);
    }

    #[test]
    fn test_list_push_back_and_pop_back() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("l", "deque");

        engine.push_back(&key, b"a").unwrap();
        engine.push_back(&key, b"b").unwrap();
        engine.push_front(&key, b"z").unwrap();
        assert_eq!(engine.llen(&key).unwrap(), 3);
        assert_eq!(engine.lindex(&key, 0).unwrap(), b"z");
        assert_eq!(engine.lindex(&key, 2).unwrap(), b"b");

        assert_eq!(engine.pop_back(&key).unwrap(), b"b");
        assert_eq!(engine.pop_front(&key).unwrap(), b"z");
        assert_eq!(engine.pop_back(&key).unwrap(), b"a");
        assert_eq!(engine.llen(&key).unwrap(), 0);
    }

    #[test]
    fn test_set_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("s", "tags");

        engine.sadd(&key, b"red").unwrap();
        engine.sadd(&key, b"blue").unwrap();
        engine.sadd(&key, b"red").unwrap();
        assert_eq!(engine.scard(&key).unwrap(), 2);
        assert!(engine.has_member(&key, b"red").unwrap());
        assert!(!engine.has_member(&key, b"green").unwrap());

        let members = engine.members(&key).unwrap();
        assert_eq!(members.len(), 2);

        engine.sdel(&key, b"red").unwrap();
        assert_eq!(engine.scard(&key).unwrap(), 1);
        assert_eq!(engine.sdel(&key, b"red").unwrap_err(), Status::NotFound);
    }

    #[test]
    fn test_zset_negative_scores() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("z", "ranks");

        let mut scores = BTreeMap::new();
        scores.insert(b"negative_two_million".to_vec(), -2_000_000i64);
        scores.insert(b"negative_one_million".to_vec(), -1_000_000i64);
        scores.insert(b"three".to_vec(), 3i64);
        scores.insert(b"four".to_vec(), 4i64);
        engine.zadd(&key, &scores).unwrap();

        let pairs = engine.zrange_by_score(&key, -2_000_000, 0).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], (-2_000_000, b"negative_two_million".to_vec()));
        assert_eq!(pairs[1], (-1_000_000, b"negative_one_million".to_vec()));

        let pairs = engine.zrange_by_score(&key, -3_000_000, 4).unwrap();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[2], (3, b"three".to_vec()));
        assert_eq!(pairs[3], (4, b"four".to_vec()));

        let removed = engine
            .zrem_range_by_score(&key, -1_000_000, -1_000_000)
            .unwrap();
        assert_eq!(removed, 1);
        let pairs = engine.zrange_by_score(&key, -3_000_000, 4).unwrap();
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|(score, _)| *score != -1_000_000));

        engine.expire_at(&key, current_time_ms() + 5).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(
            engine.zrange_by_score(&key, -3_000_000, 4).unwrap_err(),
            Status::KeyExpire
        );
    }

    #[test]
    fn test_zset_same_score_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("z", "buckets");

        let mut scores = BTreeMap::new();
        scores.insert(b"a".to_vec(), 7i64);
        scores.insert(b"b".to_vec(), 7i64);
        engine.zadd(&key, &scores).unwrap();

        // one bucket holds both members
        let pairs = engine.zrange_by_score(&key, 7, 7).unwrap();
        assert_eq!(pairs.len(), 2);

        // re-adding an existing member does not duplicate it
        let mut again = BTreeMap::new();
        again.insert(b"a".to_vec(), 7i64);
        engine.zadd(&key, &again).unwrap();
        assert_eq!(engine.zrange_by_score(&key, 7, 7).unwrap().len(), 2);

        // removing the only bucket deletes the root
        assert_eq!(engine.zrem_range_by_score(&key, 0, 10).unwrap(), 1);
        assert_eq!(
            engine.zrange_by_score(&key, 0, 10).unwrap_err(),
            Status::NotFound
        );
    }

    #[test]
    fn test_fan_out_delete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("h", "wide");

        let mut fields = BTreeMap::new();
        for i in 0..20 {
            fields.insert(format!("f{i}").into_bytes(), b"v".to_vec());
        }
        engine.hmset(&key, &fields).unwrap();
        assert_eq!(engine.db().store().num_keys(), 21);

        engine.delete(&key).unwrap();
        assert_eq!(engine.db().store().num_keys(), 0);
        assert!(engine
            .db()
            .scan_prefix(&key.composite_prefix())
            .is_empty());
    }

    #[test]
    fn test_ttl_and_expire() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("t", "soon");

        assert_eq!(engine.ttl(&key).unwrap(), -2);
        engine.set(&key, b"v").unwrap();
        assert_eq!(engine.ttl(&key).unwrap(), -1);

        engine.expire(&key, 60_000).unwrap();
        let remaining = engine.ttl(&key).unwrap();
        assert!(remaining > 0 && remaining <= 60_000);

        engine.expire_at(&key, current_time_ms() + 5).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(engine.get(&key).unwrap_err(), Status::KeyExpire);
        assert!(!engine.exist(&key).unwrap());
        assert_eq!(engine.ttl(&key).unwrap(), 0);

        // an expired value can be replaced by a not_exists set
        engine
            .setx(
                &key,
                b"fresh",
                SetOptions {
                    not_exists: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(engine.get(&key).unwrap(), b"fresh");
    }

    #[test]
    fn test_default_ttl_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_ttl(dir.path(), 60_000);
        let key = record("t", "auto");

        engine.set(&key, b"v").unwrap();
        let remaining = engine.ttl(&key).unwrap();
        assert!(remaining > 0 && remaining <= 60_000);

        // an explicit ttl overrides the default
        let other = record("t", "explicit");
        engine
            .setx(
                &other,
                b"v",
                SetOptions {
                    ttl_ms: 500_000,
                    not_exists: false,
                },
            )
            .unwrap();
        let remaining = engine.ttl(&other).unwrap();
        assert!(remaining > 60_000 && remaining <= 500_000);
    }

    #[test]
    fn test_hset_refreshes_root_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_ttl(dir.path(), 60_000);
        let key = record("h", "refresh");

        engine.hset(&key, b"f1", b"v").unwrap();
        // push the expiration far beyond the table default
        engine
            .expire_at(&key, current_time_ms() + 600_000)
            .unwrap();
        assert!(engine.ttl(&key).unwrap() > 60_000);

        // writing into the existing hash pulls it back to the default
        engine.hset(&key, b"f2", b"v").unwrap();
        let remaining = engine.ttl(&key).unwrap();
        assert!(remaining > 0 && remaining <= 60_000);
        assert_eq!(engine.hlen(&key).unwrap(), 2);
    }

    #[test]
    fn test_expire_at_rewrites_children() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = record("h", "kids");

        engine.hset(&key, b"f", b"v").unwrap();
        let stamp = current_time_ms() + 60_000;
        engine.expire_at(&key, stamp).unwrap();

        for (_, value) in engine.db().scan_prefix(&key.composite_prefix()) {
            let child = RawStringValue::decode(&value).unwrap();
            assert_eq!(child.expire_ms, stamp);
        }
    }
}
