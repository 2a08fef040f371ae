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
use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;

use laser_protos::Status;

use crate::batch::BatchOp;
use crate::batch::WriteBatch;
use crate::table::read_table_file;
use crate::table::TableWriter;
use crate::wal::parse_segment_file_name;
use crate::wal::read_segment;
use crate::wal::WalRecord;
use crate::wal::WalWriter;
use crate::CompactionFilter;

const CURRENT_FILE: &str = "CURRENT";

#[derive(Clone, Default)]
pub struct StoreOptions {
    /// WAL segments rotate once they grow past this many bytes; 0 uses the
    /// built-in default.
    pub wal_segment_bytes: u64,
    pub compaction_filter: Option<Arc<dyn CompactionFilter>>,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("wal_segment_bytes", &self.wal_segment_bytes)
            .field(
                "compaction_filter",
                &self.compaction_filter.as_ref().map(|filter| filter.name()),
            )
            .finish()
    }
}

impl StoreOptions {
    fn segment_bytes(&self) -> u64 {
        if self.wal_segment_bytes == 0 {
            4 * 1024 * 1024
        } else {
            self.wal_segment_bytes
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// The requested sequence is below the oldest retained WAL batch; the
    /// caller must fall back to base replication.
    #[error("wal truncated before sequence {0}")]
    Truncated(u64),
    #[error(transparent)]
    Status(#[from] Status),
}

struct WalState {
    writer: Option<WalWriter>,
    tail: VecDeque<WalRecord>,
    /// First sequence still served by `wal_reader`; `latest + 1` when the
    /// tail is empty.
    oldest_seq: u64,
}

struct Shared {
    memtable: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    wal: Mutex<WalState>,
    latest_seq: AtomicU64,
    persisted_seq: AtomicU64,
}

/// A persistent, byte-ordered store with a sequence-numbered WAL tail.
///
/// Writers serialize on the WAL mutex, apply their batch to the live table
/// under its write lock, and only then publish the new latest sequence, so a
/// batch is always visible atomically and sequences are assigned in write
/// order.
pub struct LogStore {
    dir: PathBuf,
    options: StoreOptions,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("dir", &self.dir)
            .field("latest_seq", &self.latest_sequence())
            .finish()
    }
}

impl LogStore {
    pub fn open(dir: impl Into<PathBuf>, options: StoreOptions) -> Result<LogStore, Status> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|err| {
            log::error!(err:?; "failed to create store dir: {}", dir.display());
            Status::from_io(&err)
        })?;

        let mut memtable = BTreeMap::new();
        let mut persisted = 0u64;
        let current = dir.join(CURRENT_FILE);
        if current.exists() {
            let name = std::fs::read_to_string(&current)
                .map_err(|err| Status::from_io(&err))?
                .trim()
                .to_string();
            let (records, seq) = read_table_file(&dir.join(&name))?;
            memtable = records.into_iter().collect();
            persisted = seq;
        }

        let mut latest = persisted;
        let mut tail = VecDeque::new();
        for (_, path) in list_segments(&dir)? {
            for record in read_segment(&path)? {
                if record.last_seq() <= persisted {
                    continue;
                }
                let batch = WriteBatch::decode(&record.payload)?;
                apply_batch(&mut memtable, &batch);
                latest = record.last_seq();
                tail.push_back(record);
            }
        }
        let oldest_seq = tail.front().map(|r| r.first_seq).unwrap_or(latest + 1);
        let writer = WalWriter::create(&dir, latest + 1)?;

        Ok(LogStore {
            dir,
            options,
            shared: Arc::new(Shared {
                memtable: RwLock::new(memtable),
                wal: Mutex::new(WalState {
                    writer: Some(writer),
                    tail,
                    oldest_seq,
                }),
                latest_seq: AtomicU64::new(latest),
                persisted_seq: AtomicU64::new(persisted),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_sequence(&self) -> u64 {
        self.shared.latest_seq.load(Ordering::SeqCst)
    }

    pub fn persisted_sequence(&self) -> u64 {
        self.shared.persisted_seq.load(Ordering::SeqCst)
    }

    pub fn oldest_wal_sequence(&self) -> u64 {
        self.lock_wal().oldest_seq
    }

    /// Appends one atomic batch and returns the store's latest sequence, the
    /// sequence of the batch's last record.
    pub fn write(&self, batch: &WriteBatch, write_ms: u64) -> Result<u64, Status> {
        if batch.is_empty() {
            return Ok(self.latest_sequence());
        }
        let mut wal = self.lock_wal();
        self.write_locked(&mut wal, batch, write_ms)
    }

    /// Applies a serialized batch received from the replication stream at the
    /// sequence it must occupy. A batch whose `first_seq` is at or below the
    /// latest sequence was already applied and is skipped, which makes
    /// at-least-once delivery safe to re-apply; a `first_seq` beyond the next
    /// expected sequence is a gap and is rejected.
    pub fn apply_replicated(
        &self,
        payload: &[u8],
        write_ms: u64,
        first_seq: u64,
    ) -> Result<u64, Status> {
        let batch = WriteBatch::decode(payload)?;
        let mut wal = self.lock_wal();
        let latest = self.shared.latest_seq.load(Ordering::SeqCst);
        if first_seq <= latest {
            log::debug!("skipping re-delivered batch at sequence {first_seq}, latest {latest}");
            return Ok(latest);
        }
        if first_seq != latest + 1 {
            log::error!("replicated batch at sequence {first_seq} leaves a gap after {latest}");
            return Err(Status::InvalidArgument);
        }
        if batch.is_empty() {
            return Ok(latest);
        }
        self.write_locked(&mut wal, &batch, write_ms)
    }

    fn write_locked(
        &self,
        wal: &mut WalState,
        batch: &WriteBatch,
        write_ms: u64,
    ) -> Result<u64, Status> {
        let first_seq = self.shared.latest_seq.load(Ordering::SeqCst) + 1;
        let record = WalRecord {
            first_seq,
            count: batch.len() as u32,
            write_ms,
            payload: batch.encode(),
        };

        let writer = wal.writer.as_mut().ok_or(Status::ShutdownInProgress)?;
        writer.append(&record)?;
        if writer.written() >= self.options.segment_bytes() {
            wal.writer = Some(WalWriter::create(&self.dir, record.next_seq())?);
        }

        {
            let mut memtable = self.write_memtable();
            apply_batch(&mut memtable, batch);
        }

        let last = record.last_seq();
        wal.tail.push_back(record);
        self.shared.latest_seq.store(last, Ordering::SeqCst);
        Ok(last)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.read_memtable().get(key).cloned()
    }

    pub fn exist(&self, key: &[u8]) -> bool {
        self.read_memtable().contains_key(key)
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let memtable = self.read_memtable();
        memtable
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Byte-ordered scan over `[from, to]`, both bounds inclusive.
    pub fn scan_range(&self, from: &[u8], to: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        if from > to {
            return Vec::new();
        }
        let memtable = self.read_memtable();
        memtable
            .range::<[u8], _>((Bound::Included(from), Bound::Included(to)))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn num_keys(&self) -> u64 {
        self.read_memtable().len() as u64
    }

    /// Opens a WAL tail reader positioned at `from_seq`. The reader observes
    /// batches appended after it was created.
    pub fn wal_reader(&self, from_seq: u64) -> Result<WalReader, WalError> {
        let wal = self.lock_wal();
        if from_seq < wal.oldest_seq {
            return Err(WalError::Truncated(from_seq));
        }
        Ok(WalReader {
            shared: self.shared.clone(),
            next_seq: from_seq,
        })
    }

    /// Drops WAL batches entirely below `seq` and deletes fully covered
    /// segment files. Readers positioned below `seq` observe truncation.
    pub fn truncate_wal_before(&self, seq: u64) -> Result<(), Status> {
        {
            let mut wal = self.lock_wal();
            while wal.tail.front().is_some_and(|r| r.last_seq() < seq) {
                wal.tail.pop_front();
            }
            if wal.oldest_seq < seq {
                wal.oldest_seq = seq;
            }
        }
        self.prune_segments(seq)
    }

    /// Persists the live table without running the compaction filter.
    pub fn flush(&self) -> Result<(), Status> {
        self.persist(false)
    }

    /// Rewrites the live table, dropping records the compaction filter
    /// rejects, then prunes the WAL below the persisted sequence.
    pub fn compact(&self) -> Result<(), Status> {
        self.persist(true)?;
        self.truncate_wal_before(self.persisted_sequence() + 1)
    }

    /// Snapshots the live keyspace into `dir` as an openable store image.
    pub fn checkpoint(&self, dir: &Path) -> Result<(), Status> {
        std::fs::create_dir_all(dir).map_err(|err| Status::from_io(&err))?;
        let wal = self.lock_wal();
        let seq = self.shared.latest_seq.load(Ordering::SeqCst);
        let name = table_file_name(seq);
        let mut writer = TableWriter::create(&dir.join(&name))?;
        {
            let memtable = self.read_memtable();
            for (key, value) in memtable.iter() {
                writer.add(key, value)?;
            }
        }
        writer.finish(seq)?;
        write_current(dir, &name)?;
        drop(wal);
        Ok(())
    }

    /// Merges an external table file into the live set and persists.
    pub fn ingest_table_file(&self, path: &Path) -> Result<(), Status> {
        let (records, _) = read_table_file(path)?;
        {
            let wal = self.lock_wal();
            let mut memtable = self.write_memtable();
            for (key, value) in records {
                memtable.insert(key, value);
            }
            drop(wal);
        }
        self.flush()
    }

    /// Writes the live keyspace to an external table file at `path`.
    pub fn dump_table_file(&self, path: &Path) -> Result<(), Status> {
        let wal = self.lock_wal();
        let seq = self.shared.latest_seq.load(Ordering::SeqCst);
        let mut writer = TableWriter::create(path)?;
        {
            let memtable = self.read_memtable();
            for (key, value) in memtable.iter() {
                writer.add(key, value)?;
            }
        }
        writer.finish(seq)?;
        drop(wal);
        Ok(())
    }

    pub fn close(&self) -> Result<(), Status> {
        self.persist(false)?;
        self.lock_wal().writer = None;
        Ok(())
    }

    pub fn property(&self, name: &str) -> u64 {
        match name {
            "store.num-keys" => self.num_keys(),
            "store.latest-sequence" => self.latest_sequence(),
            "store.oldest-wal-sequence" => self.oldest_wal_sequence(),
            "store.wal-batches" => self.lock_wal().tail.len() as u64,
            "store.approximate-bytes" => {
                let memtable = self.read_memtable();
                memtable
                    .iter()
                    .map(|(key, value)| (key.len() + value.len()) as u64)
                    .sum()
            }
            _ => 0,
        }
    }

    pub fn property_keys() -> &'static [&'static str] {
        &[
            "store.num-keys",
            "store.latest-sequence",
            "store.oldest-wal-sequence",
            "store.wal-batches",
            "store.approximate-bytes",
        ]
    }

    fn persist(&self, apply_filter: bool) -> Result<(), Status> {
        let wal = self.lock_wal();
        let seq = self.shared.latest_seq.load(Ordering::SeqCst);
        let name = table_file_name(seq);
        let path = self.dir.join(&name);
        let mut writer = TableWriter::create(&path)?;

        let filter = if apply_filter {
            self.options.compaction_filter.clone()
        } else {
            None
        };
        let mut dropped = Vec::new();
        {
            let memtable = self.read_memtable();
            for (key, value) in memtable.iter() {
                if let Some(ref filter) = filter {
                    if filter.filter(key, value) {
                        dropped.push(key.clone());
                        continue;
                    }
                }
                writer.add(key, value)?;
            }
        }
        writer.finish(seq)?;
        write_current(&self.dir, &name)?;
        self.shared.persisted_seq.store(seq, Ordering::SeqCst);

        if !dropped.is_empty() {
            log::debug!("compaction filter dropped {} records: {}", dropped.len(), self.dir.display());
            let mut memtable = self.write_memtable();
            for key in dropped {
                memtable.remove(&key);
            }
        }
        drop(wal);
        self.remove_stale_tables(&name)
    }

    fn remove_stale_tables(&self, keep: &str) -> Result<(), Status> {
        let entries = std::fs::read_dir(&self.dir).map_err(|err| Status::from_io(&err))?;
        for entry in entries {
            let entry = entry.map_err(|err| Status::from_io(&err))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("table-") && name.ends_with(".tab") && name != keep {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    log::warn!(err:?; "failed to remove stale table file: {name}");
                }
            }
        }
        Ok(())
    }

    fn prune_segments(&self, below_seq: u64) -> Result<(), Status> {
        let segments = list_segments(&self.dir)?;
        // A segment is covered by [its name, next segment's name); the last
        // one is the active writer and always stays.
        for pair in segments.windows(2) {
            let (_, ref path) = pair[0];
            let (next_seq, _) = pair[1];
            if next_seq <= below_seq {
                if let Err(err) = std::fs::remove_file(path) {
                    log::warn!(err:?; "failed to prune wal segment: {}", path.display());
                }
            }
        }
        Ok(())
    }

    fn lock_wal(&self) -> MutexGuard<'_, WalState> {
        self.shared.wal.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_memtable(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.shared
            .memtable
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write_memtable(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.shared
            .memtable
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// A cursor over the WAL tail. Unlike a point-in-time snapshot it keeps
/// reading batches appended after it was opened, which lets the leader cache
/// one reader per follower across pulls.
pub struct WalReader {
    shared: Arc<Shared>,
    next_seq: u64,
}

impl WalReader {
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn next(&mut self) -> Result<Option<WalRecord>, WalError> {
        let wal = self.shared.wal.lock().unwrap_or_else(|e| e.into_inner());
        if self.next_seq < wal.oldest_seq {
            return Err(WalError::Truncated(self.next_seq));
        }
        let idx = wal.tail.partition_point(|r| r.first_seq < self.next_seq);
        match wal.tail.get(idx) {
            Some(record) => {
                self.next_seq = record.next_seq();
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }
}

/// Deletes a store directory entirely; used for ephemeral side stores.
pub fn destroy_store(dir: &Path) -> Result<(), Status> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            log::error!(err:?; "failed to destroy store: {}", dir.display());
            Err(Status::from_io(&err))
        }
    }
}

fn table_file_name(seq: u64) -> String {
    format!("table-{seq:020}.tab")
}

fn write_current(dir: &Path, name: &str) -> Result<(), Status> {
    let tmp = dir.join("CURRENT.tmp");
    std::fs::write(&tmp, format!("{name}\n")).map_err(|err| Status::from_io(&err))?;
    std::fs::rename(&tmp, dir.join(CURRENT_FILE)).map_err(|err| Status::from_io(&err))?;
    Ok(())
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, Status> {
    let mut segments = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|err| Status::from_io(&err))?;
    for entry in entries {
        let entry = entry.map_err(|err| Status::from_io(&err))?;
        if let Some(seq) = parse_segment_file_name(&entry.file_name().to_string_lossy()) {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort();
    Ok(segments)
}

fn apply_batch(memtable: &mut BTreeMap<Vec<u8>, Vec<u8>>, batch: &WriteBatch) {
    for op in batch.ops() {
        match op {
            BatchOp::Put { key, value } => {
                memtable.insert(key.clone(), value.clone());
            }
            BatchOp::Delete { key } => {
                memtable.remove(key);
            }
        }
    }
}
