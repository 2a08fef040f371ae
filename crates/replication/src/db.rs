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
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use laser_codec::decode_value_header;
use laser_codec::RecordKey;
use laser_codec::ValueTag;
use laser_protos::config::ReplicationConfig;
use laser_protos::entity::DbRole;
use laser_protos::rpc::ReplicateRequest;
use laser_protos::rpc::ReplicateResponse;
use laser_protos::rpc::ReplicateType;
use laser_protos::rpc::ReplicateUpdate;
use laser_protos::rpc::ReplicateWdtRequest;
use laser_protos::rpc::ReplicateWdtResponse;
use laser_protos::Status;
use laser_runtime::current_time_ms;
use laser_storage::LogStore;
use laser_storage::WalError;
use laser_storage::WriteBatch;
use tokio::sync::Notify;

use crate::iter_cache::IterCache;
use crate::meter::MinuteMeter;
use crate::transport::FsSnapshotTransport;
use crate::transport::SnapshotTransport;

/// The replication surface of one partition DB. Behind a trait so the RPC
/// routing table and tests can swap implementations without inheritance.
pub trait ReplicationLog: Send + Sync {
    fn db_hash(&self) -> i64;

    fn latest_sequence(&self) -> u64;

    fn handle_replicate(
        &self,
        request: ReplicateRequest,
    ) -> BoxFuture<'_, Result<ReplicateResponse, Status>>;

    fn handle_replicate_wdt(
        &self,
        request: ReplicateWdtRequest,
    ) -> BoxFuture<'_, Result<ReplicateWdtResponse, Status>>;
}

pub struct ReplicationOptions {
    pub shard_id: u32,
    pub db_hash: i64,
    pub node_hash: i64,
    pub client_address: String,
    pub replicator_service_name: String,
    pub base_version: String,
    pub role: DbRole,
    pub config: ReplicationConfig,
    pub transport: Arc<dyn SnapshotTransport>,
}

impl ReplicationOptions {
    pub fn new(db_hash: i64, role: DbRole, base_version: impl Into<String>) -> ReplicationOptions {
        ReplicationOptions {
            shard_id: 0,
            db_hash,
            node_hash: 0,
            client_address: String::new(),
            replicator_service_name: "laser-replicator".to_string(),
            base_version: base_version.into(),
            role,
            config: ReplicationConfig::default(),
            transport: Arc::new(FsSnapshotTransport),
        }
    }
}

struct ReplicaState {
    role: DbRole,
    base_version: String,
}

/// One partition's store plus its replication state machine.
///
/// As leader it serves the WAL tail and base snapshots; as follower it
/// rejects writes and is driven by the pull task. Transitions between the
/// roles drop role-specific state so nothing leaks across.
pub struct ReplicationDb {
    store: LogStore,
    state: RwLock<ReplicaState>,
    shard_id: u32,
    db_hash: i64,
    node_hash: i64,
    client_address: String,
    replicator_service_name: String,
    config: ReplicationConfig,
    transport: Arc<dyn SnapshotTransport>,

    leader_max_seq: AtomicU64,
    force_base_replication: AtomicBool,
    write_notify: Notify,
    clients: Mutex<HashMap<i64, String>>,
    iter_cache: IterCache,
    checkpoint_refs: Mutex<u32>,

    apply_rate: MinuteMeter,
    seq_diff_rate: MinuteMeter,
    write_kps: MinuteMeter,
    read_kps: MinuteMeter,
    write_bytes: MinuteMeter,
    read_bytes: MinuteMeter,
}

impl std::fmt::Debug for ReplicationDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationDb")
            .field("db_hash", &self.db_hash)
            .field("shard_id", &self.shard_id)
            .field("role", &self.role())
            .field("base_version", &self.base_version())
            .finish()
    }
}

impl ReplicationDb {
    pub fn new(store: LogStore, options: ReplicationOptions) -> ReplicationDb {
        ReplicationDb {
            store,
            state: RwLock::new(ReplicaState {
                role: options.role,
                base_version: options.base_version,
            }),
            shard_id: options.shard_id,
            db_hash: options.db_hash,
            node_hash: options.node_hash,
            client_address: options.client_address,
            replicator_service_name: options.replicator_service_name,
            config: options.config,
            transport: options.transport,
            leader_max_seq: AtomicU64::new(0),
            force_base_replication: AtomicBool::new(false),
            write_notify: Notify::new(),
            clients: Mutex::new(HashMap::new()),
            iter_cache: IterCache::default(),
            checkpoint_refs: Mutex::new(0),
            apply_rate: MinuteMeter::new(),
            seq_diff_rate: MinuteMeter::new(),
            write_kps: MinuteMeter::new(),
            read_kps: MinuteMeter::new(),
            write_bytes: MinuteMeter::new(),
            read_bytes: MinuteMeter::new(),
        }
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn node_hash(&self) -> i64 {
        self.node_hash
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn replicator_service_name(&self) -> &str {
        &self.replicator_service_name
    }

    pub fn role(&self) -> DbRole {
        self.read_state().role
    }

    pub fn base_version(&self) -> String {
        self.read_state().base_version.clone()
    }

    pub fn set_base_version(&self, version: impl Into<String>) {
        self.write_state().base_version = version.into();
    }

    /// Swaps the role, dropping state the new role must not inherit: a fresh
    /// follower clears the leader-side iterator cache, a fresh leader forgets
    /// its follower address book.
    pub fn set_role(&self, role: DbRole) {
        let mut state = self.write_state();
        if state.role == role {
            return;
        }
        log::info!("db {} role changed to {role}", self.db_hash);
        state.role = role;
        drop(state);
        match role {
            DbRole::Follower => self.iter_cache.clear(),
            DbRole::Leader => self.lock_clients().clear(),
        }
    }

    pub fn leader_max_seq(&self) -> u64 {
        self.leader_max_seq.load(Ordering::SeqCst)
    }

    pub fn latest_sequence(&self) -> u64 {
        self.store.latest_sequence()
    }

    pub fn force_base_replication(&self) {
        if self
            .force_base_replication
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            log::info!(
                "db {} version {} force base replication flag is set",
                self.db_hash,
                self.base_version()
            );
        }
    }

    pub(crate) fn take_force_base_replication(&self) -> bool {
        self.force_base_replication.swap(false, Ordering::SeqCst)
    }

    /// Leader-side write. Every mutation of the typed engine funnels through
    /// here so followers can never diverge via local writes.
    pub fn write(&self, batch: &WriteBatch) -> Result<u64, Status> {
        if self.role() == DbRole::Follower {
            return Err(Status::WriteInFollower);
        }
        self.write_kps.mark(batch.len() as u64);
        self.write_bytes.mark(batch.data_size() as u64);
        let seq = self.store.write(batch, current_time_ms())?;
        self.write_notify.notify_waiters();
        Ok(seq)
    }

    /// Follower-side apply of one replicated batch at its expected sequence,
    /// preserving the leader's write timestamp. Bypasses the role check by
    /// design; the store skips batches it has already applied.
    pub fn apply_update(&self, payload: &[u8], write_ms: u64, first_seq: u64) -> Result<u64, Status> {
        let before = self.store.latest_sequence();
        let seq = self.store.apply_replicated(payload, write_ms, first_seq)?;
        self.apply_rate.mark(seq.saturating_sub(before));
        self.write_notify.notify_waiters();
        Ok(seq)
    }

    pub fn read(&self, key: &[u8]) -> Result<Vec<u8>, Status> {
        self.read_kps.mark(1);
        match self.store.get(key) {
            Some(value) => {
                self.read_bytes.mark(value.len() as u64);
                Ok(value)
            }
            None => Err(Status::NotFound),
        }
    }

    pub fn exist(&self, key: &[u8]) -> bool {
        self.store.exist(key)
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.store.scan_prefix(prefix)
    }

    pub fn scan_range(&self, from: &[u8], to: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.store.scan_range(from, to)
    }

    /// Deletes a root record; for composite types every child row under the
    /// root's prefix goes in the same atomic batch.
    pub fn delete_key(&self, key: &RecordKey) -> Result<(), Status> {
        let root = key.encode();
        let Some(value) = self.store.get(&root) else {
            return Ok(());
        };
        let header = decode_value_header(&value)?;

        let mut batch = WriteBatch::new();
        if matches!(
            header.tag,
            ValueTag::Map | ValueTag::List | ValueTag::Set | ValueTag::ZSet
        ) {
            for (child, _) in self.store.scan_prefix(&key.composite_prefix()) {
                batch.delete(child);
            }
        }
        batch.delete(root);
        self.write(&batch).map(|_| ())
    }

    /// Serves one follower pull: validates role and base version, waits
    /// bounded for the log to advance past the follower's sequence, then
    /// collects WAL batches under the size and count budgets.
    pub async fn handle_replicate(
        &self,
        request: ReplicateRequest,
    ) -> Result<ReplicateResponse, Status> {
        if self.role() == DbRole::Follower {
            return Err(Status::RoleError);
        }

        let version = self.base_version();
        if request.version != version {
            log::info!(
                "db {} follower version {} differs from local {version}; replying for base switch",
                request.db_hash,
                request.version
            );
            return Ok(ReplicateResponse {
                version,
                updates: Vec::new(),
                max_seq_no: self.store.latest_sequence(),
                timestamp: current_time_ms() as i64,
            });
        }

        self.lock_clients()
            .insert(request.node_hash, request.client_address.clone());

        let max_wait_ms = request.max_wait_ms.min(self.config.max_server_wait_ms);
        self.wait_for_sequence(request.seq_no, Duration::from_millis(max_wait_ms))
            .await;

        let expected_seq = request.seq_no + 1;
        let mut reader = match self.iter_cache.take(expected_seq, request.node_hash) {
            Some(reader) => reader,
            None => self
                .store
                .wal_reader(expected_seq)
                .map_err(|err| self.map_wal_error(err))?,
        };

        let max_size = effective_budget(request.max_size, self.config.max_size_per_response);
        let max_count = effective_budget(request.max_count, self.config.max_updates_per_response);
        let mut updates = Vec::new();
        let mut size = 0u64;
        while (updates.len() as u64) < max_count && size < max_size {
            match reader.next() {
                Ok(Some(record)) => {
                    size += record.payload.len() as u64;
                    updates.push(ReplicateUpdate {
                        raw_data: BASE64_STANDARD.encode(&record.payload),
                        timestamp: record.write_ms as i64,
                    });
                }
                Ok(None) => break,
                Err(err) => return Err(self.map_wal_error(err)),
            }
        }

        let next_seq = reader.next_seq();
        self.iter_cache
            .put(next_seq, request.node_hash, reader, current_time_ms());

        Ok(ReplicateResponse {
            version,
            updates,
            max_seq_no: self.store.latest_sequence(),
            timestamp: current_time_ms() as i64,
        })
    }

    /// Ships a whole base snapshot to the follower-provided transfer URL.
    /// Concurrent followers share one checkpoint through a reference count;
    /// the checkpoint directory is removed when the last transfer finishes.
    pub async fn handle_replicate_wdt(
        &self,
        request: ReplicateWdtRequest,
    ) -> Result<ReplicateWdtResponse, Status> {
        let checkpoint_path = self.checkpoint_dir();
        {
            let mut refs = self.lock_checkpoint_refs();
            if !checkpoint_path.exists() {
                self.store.checkpoint(&checkpoint_path)?;
            }
            *refs += 1;
        }
        log::info!(
            "sending base snapshot for db {} version {} to {}",
            request.db_hash,
            request.version,
            request.wdt_url
        );

        let transport = self.transport.clone();
        let url = request.wdt_url.clone();
        let src = checkpoint_path.clone();
        let send = tokio::task::spawn_blocking(move || transport.send(&url, &src));
        let timeout = Duration::from_millis(self.config.snapshot_abort_timeout_ms);
        let result = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                log::error!(err:? = join_err; "snapshot sender task failed: db {}", self.db_hash);
                Err(Status::SourceReadError)
            }
            Err(_) => {
                log::error!("snapshot transfer timed out: db {}", self.db_hash);
                Err(Status::Aborted)
            }
        };

        {
            let mut refs = self.lock_checkpoint_refs();
            *refs = refs.saturating_sub(1);
            if *refs == 0 && checkpoint_path.exists() {
                if let Err(err) = std::fs::remove_dir_all(&checkpoint_path) {
                    log::error!(err:?; "failed to remove checkpoint: db {}", self.db_hash);
                }
            }
        }

        result.map_err(|err| {
            log::error!("snapshot send failed for db {}: {err}", self.db_hash);
            if err == Status::Aborted {
                Status::Aborted
            } else {
                Status::SourceReadError
            }
        })?;
        Ok(ReplicateWdtResponse { send_success: true })
    }

    pub fn build_pull_request(&self) -> ReplicateRequest {
        ReplicateRequest {
            db_hash: self.db_hash,
            seq_no: self.store.latest_sequence(),
            max_wait_ms: self.config.max_server_wait_ms,
            max_size: self.config.max_size_per_response,
            max_count: self.config.max_updates_per_response,
            replicate_type: ReplicateType::Forward,
            version: self.base_version(),
            node_hash: self.node_hash,
            client_address: self.client_address.clone(),
            timestamp: current_time_ms() as i64,
        }
    }

    pub fn set_leader_max_seq(&self, seq: u64) {
        self.leader_max_seq.store(seq, Ordering::SeqCst);
    }

    /// The throughput-scaled window rule: once the sequence gap cannot be
    /// closed within the configured window at the observed apply rate, give
    /// up on log shipping.
    pub fn reach_max_seq_diff_limit(&self, leader_max_seq: u64) -> bool {
        let latest = self.store.latest_sequence();
        let gap = leader_max_seq.abs_diff(latest);
        self.seq_diff_rate.mark(gap);

        let diff_rate = self.seq_diff_rate.minute_rate();
        let apply_rate = self.apply_rate.minute_rate();
        if diff_rate != 0 && apply_rate != 0 {
            let limit = apply_rate.saturating_mul(self.config.seq_diff_time_window_secs);
            if diff_rate > limit {
                log::info!(
                    "db {} version {} reached max seq diff limit: diff_rate {diff_rate} apply_rate {apply_rate}",
                    self.db_hash,
                    self.base_version()
                );
                return true;
            }
        }
        false
    }

    pub fn evict_idle_cached_iters(&self) -> usize {
        self.iter_cache
            .evict_idle(self.config.iter_idle_ms, current_time_ms())
    }

    pub fn cached_iters(&self) -> usize {
        self.iter_cache.len()
    }

    pub fn followers(&self) -> HashMap<i64, String> {
        self.lock_clients().clone()
    }

    /// Sequence and lag figures for the partition meta surface.
    pub fn meta_info(&self) -> (u64, u64) {
        let seq_no = self.store.latest_sequence();
        let lag = if self.role() == DbRole::Follower {
            self.leader_max_seq().saturating_sub(seq_no)
        } else {
            0
        };
        (seq_no, lag)
    }

    pub fn property(&self, name: &str) -> u64 {
        match name {
            "replication.apply-kps-min-1" => self.apply_rate.minute_rate(),
            "replication.seq-no-diff-min-1" => self.seq_diff_rate.minute_rate(),
            "replication.write-kps-min-1" => self.write_kps.minute_rate(),
            "replication.read-kps-min-1" => self.read_kps.minute_rate(),
            "replication.write-bytes-min-1" => self.write_bytes.minute_rate(),
            "replication.read-bytes-min-1" => self.read_bytes.minute_rate(),
            "replication.replicate-lag" => self.meta_info().1,
            other => self.store.property(other),
        }
    }

    pub fn property_keys() -> Vec<&'static str> {
        let mut keys = vec![
            "replication.apply-kps-min-1",
            "replication.seq-no-diff-min-1",
            "replication.write-kps-min-1",
            "replication.read-kps-min-1",
            "replication.write-bytes-min-1",
            "replication.read-bytes-min-1",
            "replication.replicate-lag",
        ];
        keys.extend_from_slice(LogStore::property_keys());
        keys
    }

    pub fn apply_rate_meter(&self) -> &MinuteMeter {
        &self.apply_rate
    }

    pub fn seq_diff_meter(&self) -> &MinuteMeter {
        &self.seq_diff_rate
    }

    pub fn close(&self) -> Result<(), Status> {
        self.iter_cache.clear();
        self.store.close()
    }

    fn checkpoint_dir(&self) -> PathBuf {
        match self.store.dir().parent() {
            Some(parent) => parent.join("checkpoint"),
            None => self.store.dir().join("checkpoint"),
        }
    }

    async fn wait_for_sequence(&self, seq_no: u64, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.store.latest_sequence() > seq_no {
                return;
            }
            let notified = self.write_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.store.latest_sequence() > seq_no {
                return;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            if remaining.is_zero() {
                return;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return;
            }
        }
    }

    fn map_wal_error(&self, err: WalError) -> Status {
        match err {
            WalError::Truncated(seq) => {
                log::info!(
                    "db {} wal removed below sequence {seq}; follower must base replicate",
                    self.db_hash
                );
                Status::SourceWalLogRemoved
            }
            WalError::Status(status) => {
                log::error!("db {} wal read error: {status}", self.db_hash);
                Status::SourceReadError
            }
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ReplicaState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ReplicaState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<i64, String>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_checkpoint_refs(&self) -> std::sync::MutexGuard<'_, u32> {
        self.checkpoint_refs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl ReplicationLog for ReplicationDb {
    fn db_hash(&self) -> i64 {
        self.db_hash
    }

    fn latest_sequence(&self) -> u64 {
        ReplicationDb::latest_sequence(self)
    }

    fn handle_replicate(
        &self,
        request: ReplicateRequest,
    ) -> BoxFuture<'_, Result<ReplicateResponse, Status>> {
        ReplicationDb::handle_replicate(self, request).boxed()
    }

    fn handle_replicate_wdt(
        &self,
        request: ReplicateWdtRequest,
    ) -> BoxFuture<'_, Result<ReplicateWdtResponse, Status>> {
        ReplicationDb::handle_replicate_wdt(self, request).boxed()
    }
}

fn effective_budget(requested: u64, configured: u64) -> u64 {
    if requested == 0 {
        configured
    } else {
        requested.min(configured)
    }
}

#[cfg(test)]
mod tests {
    use laser_storage::StoreOptions;

    use super::*;

    fn leader_db(dir: &std::path::Path) -> ReplicationDb {
        let store = LogStore::open(dir, StoreOptions::default()).unwrap();
        ReplicationDb::new(store, ReplicationOptions::new(1, DbRole::Leader, "base-1"))
    }

    fn put_batch(key: &[u8], value: &[u8]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), value.to_vec());
        batch
    }

    #[test]
    fn test_write_rejected_on_follower() {
        let dir = tempfile::tempdir().unwrap();
        let db = leader_db(dir.path());
        db.write(&put_batch(b"k", b"v")).unwrap();

        db.set_role(DbRole::Follower);
        assert_eq!(
            db.write(&put_batch(b"k2", b"v2")).unwrap_err(),
            Status::WriteInFollower
        );
        // the store is unchanged
        assert_eq!(db.latest_sequence(), 1);
        assert!(!db.exist(b"k2"));

        // but replicated applies still land
        db.apply_update(&put_batch(b"k2", b"v2").encode(), 123, 2).unwrap();
        assert_eq!(db.latest_sequence(), 2);
    }

    #[test]
    fn test_apply_update_skips_redelivered_batches() {
        let dir = tempfile::tempdir().unwrap();
        let db = leader_db(dir.path());
        db.set_role(DbRole::Follower);

        let payload = put_batch(b"k", b"v").encode();
        assert_eq!(db.apply_update(&payload, 1, 1).unwrap(), 1);
        // at-least-once delivery: the same batch arriving again is a no-op
        assert_eq!(db.apply_update(&payload, 1, 1).unwrap(), 1);
        assert_eq!(db.latest_sequence(), 1);

        // a batch that would leave a sequence gap is rejected
        assert_eq!(
            db.apply_update(&payload, 1, 5).unwrap_err(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn test_role_change_drops_role_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = leader_db(dir.path());
        db.write(&put_batch(b"k", b"v")).unwrap();

        let reader = db.store().wal_reader(1).unwrap();
        db.iter_cache.put(1, 7, reader, current_time_ms());
        assert_eq!(db.cached_iters(), 1);

        db.set_role(DbRole::Follower);
        assert_eq!(db.cached_iters(), 0);

        db.lock_clients().insert(7, "addr".to_string());
        db.set_role(DbRole::Leader);
        assert!(db.followers().is_empty());
    }

    #[test]
    fn test_delete_key_fans_out_composite_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = leader_db(dir.path());

        let key = RecordKey::new(vec![b"pk".to_vec()], vec![b"col".to_vec()]);
        let mut batch = WriteBatch::new();
        let meta = laser_codec::MapMeta {
            size: 2,
            expire_ms: 0,
        };
        batch.put(key.encode(), meta.encode());
        for field in [&b"f1"[..], b"f2"] {
            let child = laser_codec::MapFieldKey::new(&key, field.to_vec());
            batch.put(child.encode(), laser_codec::RawStringValue::new(b"v".to_vec()).encode());
        }
        db.write(&batch).unwrap();
        assert_eq!(db.store().num_keys(), 3);

        db.delete_key(&key).unwrap();
        assert_eq!(db.store().num_keys(), 0);
        assert!(db.scan_prefix(&key.composite_prefix()).is_empty());

        // deleting a missing root is a no-op
        db.delete_key(&key).unwrap();
    }

    #[test]
    fn test_force_base_replication_flag() {
        let dir = tempfile::tempdir().unwrap();
        let db = leader_db(dir.path());
        assert!(!db.take_force_base_replication());
        db.force_base_replication();
        db.force_base_replication();
        assert!(db.take_force_base_replication());
        assert!(!db.take_force_base_replication());
    }

    #[test]
    fn test_meta_info_lag() {
        let dir = tempfile::tempdir().unwrap();
        let db = leader_db(dir.path());
        db.write(&put_batch(b"k", b"v")).unwrap();
        assert_eq!(db.meta_info(), (1, 0));

        db.set_role(DbRole::Follower);
        db.set_leader_max_seq(5);
        assert_eq!(db.meta_info(), (1, 4));
    }

    #[test]
    fn test_handle_replicate_role_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = leader_db(dir.path());
        db.write(&put_batch(b"k", b"v")).unwrap();

        laser_runtime::test_runtime().block_on(async {
            // version mismatch returns the leader's version and no updates
            let mut request = db.build_pull_request();
            request.version = "other".to_string();
            request.seq_no = 0;
            let response = db.handle_replicate(request).await.unwrap();
            assert_eq!(response.version, "base-1");
            assert!(response.updates.is_empty());

            // follower role refuses to serve
            db.set_role(DbRole::Follower);
            let request = db.build_pull_request();
            assert_eq!(
                db.handle_replicate(request).await.unwrap_err(),
                Status::RoleError
            );
        });
    }
}
