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

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use laser_codec::ExpireFilter;
use laser_engine::KvEngine;
use laser_engine::LockManager;
use laser_protos::config::ServerConfig;
use laser_protos::entity::DbRole;
use laser_protos::entity::PartitionMetaInfo;
use laser_protos::rpc::ReplicateWdtRequest;
use laser_protos::Status;
use laser_replication::start_pull_task;
use laser_replication::PullTask;
use laser_replication::ReplicationDb;
use laser_replication::ReplicationOptions;
use laser_replication::ReplicatorClient;
use laser_replication::SnapshotTransport;
use laser_storage::LogStore;
use laser_storage::StoreOptions;

use crate::meta_store::VersionMetaStore;
use crate::partition::node_hash;
use crate::partition::Partition;
use crate::replicator_manager::ReplicatorManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Unloaded,
    LoadingBase,
    Ready,
    LoadingDelta,
}

/// Everything a handler borrows from the node it runs on.
pub(crate) struct HandlerContext {
    pub config: Arc<ServerConfig>,
    pub meta_store: Arc<VersionMetaStore>,
    pub replicator_manager: Arc<ReplicatorManager>,
    pub client: Arc<dyn ReplicatorClient>,
    pub transport: Arc<dyn SnapshotTransport>,
    pub locks: Arc<LockManager>,
    pub advertise_addr: String,
}

/// Owns one partition's engine and replication state.
///
/// Drives the `UNLOADED → LOADING_BASE → READY → LOADING_DELTA` lifecycle:
/// mount reopens the recorded base version, base and delta file arrivals run
/// on the loader pool, and a follower that cannot catch up through the log
/// swaps its whole data directory for a leader snapshot.
pub struct PartitionHandler {
    partition: Partition,
    shard_id: u32,
    ttl_default_ms: u64,
    role: RwLock<DbRole>,
    state: RwLock<PartitionState>,
    db: RwLock<Option<Arc<ReplicationDb>>>,
    engine: RwLock<Option<Arc<KvEngine>>>,
    pull_task: Mutex<Option<PullTask>>,
    // serialises base replication against base/delta ingest
    load_lock: tokio::sync::Mutex<()>,
    ctx: HandlerContext,
}

impl PartitionHandler {
    pub(crate) fn new(
        partition: Partition,
        shard_id: u32,
        ttl_default_ms: u64,
        ctx: HandlerContext,
    ) -> Arc<PartitionHandler> {
        Arc::new(PartitionHandler {
            partition,
            shard_id,
            ttl_default_ms,
            role: RwLock::new(DbRole::Follower),
            state: RwLock::new(PartitionState::Unloaded),
            db: RwLock::new(None),
            engine: RwLock::new(None),
            pull_task: Mutex::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            ctx,
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn role(&self) -> DbRole {
        *self.role.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PartitionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn engine(&self) -> Option<Arc<KvEngine>> {
        self.engine.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn db(&self) -> Option<Arc<ReplicationDb>> {
        self.db.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Opens the partition at its recorded base version (or empty when none
    /// is recorded; the replication machinery then fetches the current base
    /// from the leader via the first version mismatch).
    pub fn mount(self: &Arc<Self>, role: DbRole) -> Result<(), Status> {
        log::info!("mounting partition {} as {role}", self.partition);
        self.set_state(PartitionState::Unloaded);
        *self.role.write().unwrap_or_else(|e| e.into_inner()) = role;

        let version = self
            .ctx
            .meta_store
            .load_version(&self.partition)
            .unwrap_or_default();
        if let Err(err) = self.open_db(&version, role) {
            log::error!("failed to mount partition {}: {err}", self.partition);
            self.set_state(PartitionState::Unloaded);
            return Err(err);
        }
        self.set_state(PartitionState::Ready);
        Ok(())
    }

    pub fn unmount(&self) {
        log::info!("unmounting partition {}", self.partition);
        self.stop_pull();
        self.close_db();
        self.set_state(PartitionState::Unloaded);
    }

    pub fn set_role(self: &Arc<Self>, role: DbRole) {
        if self.role() == role {
            return;
        }
        *self.role.write().unwrap_or_else(|e| e.into_inner()) = role;
        if let Some(db) = self.db() {
            db.set_role(role);
        }
        match role {
            DbRole::Follower => self.start_pull(),
            DbRole::Leader => self.stop_pull(),
        }
    }

    /// Leader side: ingests a locally delivered base file for `version`.
    pub async fn load_base(self: &Arc<Self>, version: &str) -> Result<(), Status> {
        let _guard = self.load_lock.lock().await;
        let Some(engine) = self.engine() else {
            return Err(Status::SourceDbRemoved);
        };
        let file = self.base_file_path(version);
        log::info!(
            "loading base {version} for partition {} from {}",
            self.partition,
            file.display()
        );
        self.set_state(PartitionState::LoadingBase);

        let result = engine.ingest_base(&file);
        match result {
            Ok(()) => {
                if let Err(err) = self.ctx.meta_store.update_version(&self.partition, version) {
                    log::error!("failed to record base version {version}: {err}");
                }
                if let Some(db) = self.db() {
                    db.set_base_version(version);
                }
                self.set_state(PartitionState::Ready);
                Ok(())
            }
            Err(err) => {
                log::error!(
                    "base ingest failed for partition {} version {version}: {err}",
                    self.partition
                );
                self.set_state(PartitionState::Ready);
                Err(err)
            }
        }
    }

    /// Applies delta files in order on top of `base_version`; a mismatching
    /// base means a newer base supersedes these deltas and they are ignored.
    pub async fn load_delta(&self, base_version: &str, delta_versions: &[String]) {
        let _guard = self.load_lock.lock().await;
        let Some(engine) = self.engine() else {
            return;
        };
        if let Some(db) = self.db() {
            if db.base_version() != base_version {
                log::info!(
                    "ignoring deltas for stale base {base_version} on partition {}",
                    self.partition
                );
                return;
            }
        }
        self.set_state(PartitionState::LoadingDelta);
        for delta in delta_versions {
            let file = self.delta_file_path(base_version, delta);
            let tempdb = self
                .partition_root()
                .join(format!("tempdb-{}", uuid::Uuid::new_v4()));
            if let Err(err) = engine.ingest_delta(&file, &tempdb) {
                log::error!(
                    "delta ingest failed for partition {} file {}: {err}",
                    self.partition,
                    file.display()
                );
            }
        }
        self.set_state(PartitionState::Ready);
    }

    /// Follower side: fetches the leader's base snapshot for `version` into
    /// a staging directory, swaps it in for the data directory, and reopens.
    pub async fn handle_version_update(self: &Arc<Self>, version: &str) {
        let _guard = self.load_lock.lock().await;
        log::info!(
            "partition {} switching to base version {version} via snapshot transfer",
            self.partition
        );
        self.set_state(PartitionState::LoadingBase);
        self.stop_pull();

        match self.fetch_base_from_leader(version).await {
            Ok(()) => {
                if let Err(err) = self.ctx.meta_store.update_version(&self.partition, version) {
                    log::error!("failed to record base version {version}: {err}");
                }
                let role = self.role();
                match self.open_db(version, role) {
                    Ok(()) => self.set_state(PartitionState::Ready),
                    Err(err) => {
                        log::error!(
                            "failed to reopen partition {} after base switch: {err}",
                            self.partition
                        );
                        self.set_state(PartitionState::Unloaded);
                    }
                }
            }
            Err(err) => {
                log::error!(
                    "base replication failed for partition {} version {version}: {err}",
                    self.partition
                );
                // keep serving the old base; the pull loop will re-trigger
                if self.role() == DbRole::Follower && self.db().is_some() {
                    self.start_pull();
                }
                self.set_state(PartitionState::Ready);
            }
        }
    }

    pub fn force_base_replication(&self) {
        if let Some(db) = self.db() {
            db.force_base_replication();
        }
    }

    pub fn get_property(&self, name: &str) -> u64 {
        self.db().map(|db| db.property(name)).unwrap_or(0)
    }

    pub fn property_keys() -> Vec<&'static str> {
        ReplicationDb::property_keys()
    }

    pub fn meta_info(&self) -> PartitionMetaInfo {
        let (seq_no, replicate_lag) = self
            .db()
            .map(|db| db.meta_info())
            .unwrap_or_default();
        PartitionMetaInfo {
            database_name: self.partition.database.clone(),
            table_name: self.partition.table.clone(),
            partition_id: self.partition.partition_id,
            hash: self.partition.partition_hash(),
            role: self.role(),
            base_version: self
                .db()
                .map(|db| db.base_version())
                .unwrap_or_default(),
            seq_no,
            replicate_lag,
        }
    }

    fn open_db(self: &Arc<Self>, version: &str, role: DbRole) -> Result<(), Status> {
        let store_options = StoreOptions {
            wal_segment_bytes: self.ctx.config.store.wal_segment_bytes,
            compaction_filter: Some(Arc::new(ExpireFilter)),
        };
        let store = LogStore::open(self.data_dir(), store_options)?;

        let node = &self.ctx.config.node;
        let mut options =
            ReplicationOptions::new(self.partition.partition_hash(), role, version);
        options.shard_id = self.shard_id;
        options.node_hash = node_hash(&node.group_name, node.node_id);
        options.client_address = self.ctx.advertise_addr.clone();
        options.replicator_service_name = node.service_name.clone();
        options.config = self.ctx.config.replication.clone();
        options.transport = self.ctx.transport.clone();

        let db = Arc::new(ReplicationDb::new(store, options));
        let engine = Arc::new(KvEngine::new(
            db.clone(),
            self.ctx.locks.clone(),
            self.ttl_default_ms,
        ));
        self.ctx.replicator_manager.register(db.clone());
        *self.db.write().unwrap_or_else(|e| e.into_inner()) = Some(db);
        *self.engine.write().unwrap_or_else(|e| e.into_inner()) = Some(engine);

        if role == DbRole::Follower {
            self.start_pull();
        }
        Ok(())
    }

    fn close_db(&self) {
        self.ctx
            .replicator_manager
            .deregister(self.partition.partition_hash());
        if let Some(db) = self.db.write().unwrap_or_else(|e| e.into_inner()).take() {
            if let Err(err) = db.close() {
                log::error!("failed to close partition {}: {err}", self.partition);
            }
        }
        *self.engine.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn start_pull(self: &Arc<Self>) {
        let Some(db) = self.db() else {
            return;
        };
        self.stop_pull();

        let weak = Arc::downgrade(self);
        let on_update_version = Arc::new(move |_db_hash: i64, version: String| {
            let Some(handler) = weak.upgrade() else {
                return;
            };
            let _ = laser_runtime::loader_runtime().spawn(async move {
                handler.handle_version_update(&version).await;
            });
        });

        let task = start_pull_task(
            db,
            self.ctx.client.clone(),
            on_update_version,
            laser_runtime::replicator_runtime(),
        );
        *self.pull_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    fn stop_pull(&self) {
        if let Some(task) = self
            .pull_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.stop();
        }
    }

    async fn fetch_base_from_leader(self: &Arc<Self>, version: &str) -> Result<(), Status> {
        let staging = self
            .partition_root()
            .join(format!("staging-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&staging).map_err(|err| Status::from_io(&err))?;
        let url = self.ctx.transport.receive_target(&staging)?;

        let request = ReplicateWdtRequest {
            db_hash: self.partition.partition_hash(),
            version: version.to_string(),
            wdt_url: url,
        };
        let node = &self.ctx.config.node;
        let response = self
            .ctx
            .client
            .replicate_wdt(&node.service_name, self.shard_id, request)
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(err);
            }
        };
        if !response.send_success {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(Status::SourceReadError);
        }

        // swap the received snapshot in for the live data directory
        self.close_db();
        let data = self.data_dir();
        let discarded = self
            .partition_root()
            .join(format!("discarded-{}", uuid::Uuid::new_v4()));
        if data.exists() {
            std::fs::rename(&data, &discarded).map_err(|err| Status::from_io(&err))?;
        }
        std::fs::rename(&staging, &data).map_err(|err| Status::from_io(&err))?;
        if let Err(err) = std::fs::remove_dir_all(&discarded) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!(err:?; "failed to remove discarded data dir for {}", self.partition);
            }
        }
        Ok(())
    }

    fn set_state(&self, state: PartitionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub(crate) fn partition_root(&self) -> PathBuf {
        let node = &self.ctx.config.node;
        node.data_root
            .join(&node.group_name)
            .join(node.node_id.to_string())
            .join(&self.partition.database)
            .join(&self.partition.table)
            .join(self.partition.partition_id.to_string())
    }

    fn data_dir(&self) -> PathBuf {
        self.partition_root().join("data")
    }

    fn base_file_path(&self, version: &str) -> PathBuf {
        self.source_root()
            .join(version)
            .join("base")
            .join(format!("partition-{}", self.partition.partition_id))
    }

    fn delta_file_path(&self, base_version: &str, delta_version: &str) -> PathBuf {
        self.source_root()
            .join(base_version)
            .join(format!("delta-{delta_version}"))
            .join(format!("partition-{}", self.partition.partition_id))
    }

    fn source_root(&self) -> PathBuf {
        self.ctx
            .config
            .node
            .data_root
            .join("source_data")
            .join(&self.partition.database)
            .join(&self.partition.table)
    }
}

impl Drop for PartitionHandler {
    fn drop(&mut self) {
        self.stop_pull();
    }
}
