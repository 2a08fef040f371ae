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
use std::convert::Infallible;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::RwLock;
use std::sync::Weak;
use std::time::Duration;

use laser_codec::RecordKey;
use laser_engine::KvEngine;
use laser_engine::LockManager;
use laser_protos::config::ServerConfig;
use laser_protos::entity::DbRole;
use laser_protos::entity::PartitionMetaInfo;
use laser_protos::entity::ServiceInfo;
use laser_protos::entity::ServiceStatus;
use laser_protos::entity::ShardMetaInfo;
use laser_protos::Status;
use laser_replication::ReplicatorClient;
use laser_replication::SnapshotTransport;
use laser_runtime::schedule_once;
use laser_runtime::schedule_with_fixed_delay;
use laser_runtime::ScheduledTask;
use laser_runtime::TaskFn;

use crate::config_feed::ConfigFeed;
use crate::meta_store::VersionMetaStore;
use crate::partition::table_hash;
use crate::partition::Partition;
use crate::partition_handler::HandlerContext;
use crate::partition_handler::PartitionHandler;
use crate::partition_manager::PartitionDiff;
use crate::partition_manager::PartitionManager;
use crate::registry::ShardRegistry;
use crate::replicator_manager::ReplicatorManager;
use crate::table_monitor::TableMonitor;

/// The top-level owner of everything partition-shaped on one node: wires the
/// configuration feed through the partition manager into handlers, routes
/// external base/delta triggers, and publishes shard availability to the
/// registry. Constructed once in `start` and passed by `Arc`.
pub struct DatabaseManager {
    config: Arc<ServerConfig>,
    feed: ConfigFeed,
    partition_manager: Arc<PartitionManager>,
    replicator_manager: Arc<ReplicatorManager>,
    registry: Arc<dyn ShardRegistry>,
    client: Arc<dyn ReplicatorClient>,
    transport: Arc<dyn SnapshotTransport>,
    locks: Arc<LockManager>,
    meta_store: OnceLock<Arc<VersionMetaStore>>,
    handlers: RwLock<HashMap<i64, Arc<PartitionHandler>>>,
    table_monitors: RwLock<HashMap<u64, Arc<TableMonitor>>>,
    unavailable_shards: RwLock<Vec<u32>>,
    advertise_addr: RwLock<String>,
    available_scheduled: AtomicBool,
    available_published: Arc<AtomicBool>,
    tasks: Mutex<Vec<ScheduledTask<()>>>,
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("advertise_addr", &self.advertise_addr())
            .finish()
    }
}

impl DatabaseManager {
    pub fn new(
        config: ServerConfig,
        registry: Arc<dyn ShardRegistry>,
        client: Arc<dyn ReplicatorClient>,
        transport: Arc<dyn SnapshotTransport>,
    ) -> Arc<DatabaseManager> {
        let node = &config.node;
        let partition_manager = Arc::new(PartitionManager::new(
            node.group_name.clone(),
            node.node_id,
            node.total_shards,
        ));
        let locks = Arc::new(LockManager::new(config.engine.lock_buckets));
        Arc::new(DatabaseManager {
            config: Arc::new(config),
            feed: ConfigFeed::new(),
            partition_manager,
            replicator_manager: Arc::new(ReplicatorManager::new()),
            registry,
            client,
            transport,
            locks,
            meta_store: OnceLock::new(),
            handlers: RwLock::new(HashMap::new()),
            table_monitors: RwLock::new(HashMap::new()),
            unavailable_shards: RwLock::new(Vec::new()),
            advertise_addr: RwLock::new(String::new()),
            available_scheduled: AtomicBool::new(false),
            available_published: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Hooks the configuration feed to the partition manager, starts the
    /// iterator-cache reaper, and applies the initial configuration.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.partition_manager
            .subscribe(Arc::new(move |diff: PartitionDiff| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_partitions_update(diff);
                }
            }));

        // configuration watcher: every published view is diffed on the
        // loader pool since mounting does file work
        let weak = Arc::downgrade(self);
        let mut rx = self.feed.subscribe();
        let watcher = laser_runtime::loader_runtime().spawn(async move {
            while rx.changed().await.is_ok() {
                let view = rx.borrow_and_update().clone();
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let apply = laser_runtime::loader_runtime().spawn_blocking(move || {
                    manager.partition_manager.apply(&view);
                });
                let _ = apply.await;
            }
        });
        // keep the watcher cancellable at shutdown
        self.push_task(wrap_join_handle("config-watcher", watcher));

        let reaper = schedule_with_fixed_delay(
            "iter-cache-reaper",
            laser_runtime::timer_runtime(),
            None,
            Duration::from_millis(self.config.replication.iter_idle_ms),
            IterCacheReaper {
                manager: Arc::downgrade(self),
            },
        );
        self.push_task(reaper);

        let initial = &self.config.initial;
        self.feed
            .publish(initial.shard_list.clone(), initial.tables.clone());
    }

    pub fn shutdown(&self) {
        for task in self.lock_tasks().drain(..) {
            task.cancel();
        }
        let handlers: Vec<_> = {
            let mut map = self.handlers.write().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, handler)| handler).collect()
        };
        for handler in handlers {
            handler.unmount();
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_feed(&self) -> &ConfigFeed {
        &self.feed
    }

    pub fn partition_manager(&self) -> &Arc<PartitionManager> {
        &self.partition_manager
    }

    pub fn replicator_manager(&self) -> &Arc<ReplicatorManager> {
        &self.replicator_manager
    }

    pub fn set_advertise_addr(&self, addr: impl Into<String>) {
        *self
            .advertise_addr
            .write()
            .unwrap_or_else(|e| e.into_inner()) = addr.into();
    }

    pub fn advertise_addr(&self) -> String {
        self.advertise_addr
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn on_partitions_update(self: &Arc<Self>, diff: PartitionDiff) {
        if self.meta_store.get().is_none() {
            let node = &self.config.node;
            let meta_dir = node
                .data_root
                .join(&node.group_name)
                .join(node.node_id.to_string())
                .join("meta");
            match VersionMetaStore::open(&meta_dir) {
                Ok(meta) => {
                    let _ = self.meta_store.set(Arc::new(meta));
                }
                Err(err) => {
                    log::error!("failed to open version meta store: {err}");
                    return;
                }
            }
        }
        self.schedule_set_available();

        for (partition, shard_id, role) in &diff.mounts {
            let handler = self.get_or_create_handler(partition, *shard_id);
            if handler.mount(*role).is_err() {
                continue;
            }
            let monitor = self.get_or_create_monitor(&partition.database, &partition.table);
            match role {
                DbRole::Leader => monitor.add_partition(partition.partition_id),
                DbRole::Follower => monitor.remove_partition(partition.partition_id),
            }
        }

        for (partition, role) in &diff.role_changes {
            if let Some(handler) = self.handler(partition) {
                handler.set_role(*role);
            }
            let monitor = self.get_or_create_monitor(&partition.database, &partition.table);
            match role {
                DbRole::Leader => monitor.add_partition(partition.partition_id),
                DbRole::Follower => monitor.remove_partition(partition.partition_id),
            }
        }

        for partition in &diff.unmounts {
            let monitor = self.get_or_create_monitor(&partition.database, &partition.table);
            monitor.remove_partition(partition.partition_id);
            let handler = {
                let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
                handlers.remove(&partition.partition_hash())
            };
            if let Some(handler) = handler {
                handler.unmount();
            }
        }

        self.update_server_shard();
    }

    /// Recomputes the availability the routing registry sees: desired shards
    /// minus the manually disabled ones.
    pub fn update_server_shard(&self) {
        let addr = self.advertise_addr();
        let Some((host, port)) = split_host_port(&addr) else {
            return;
        };
        let unavailable = self
            .unavailable_shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let filter = |shards: Vec<u32>| -> Vec<u32> {
            shards
                .into_iter()
                .filter(|shard| !unavailable.contains(shard))
                .collect()
        };

        let is_edge = self.partition_manager.is_edge_node();
        let info = ServiceInfo {
            service_name: self.config.node.service_name.clone(),
            host,
            port,
            protocol: "http".to_string(),
            available_shard_list: filter(self.partition_manager.leader_shard_list()),
            follower_available_shard_list: filter(self.partition_manager.follower_shard_list()),
            is_edge_node: is_edge,
            partition_list: if is_edge {
                self.partition_manager.partition_hash_list()
            } else {
                Vec::new()
            },
            status: if self.available_published.load(Ordering::SeqCst) {
                ServiceStatus::Available
            } else {
                ServiceStatus::Unavailable
            },
        };
        self.registry.publish(info);
    }

    fn schedule_set_available(&self) {
        if self.available_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = Duration::from_secs(self.config.replication.delay_set_available_secs);
        let registry = self.registry.clone();
        let service_name = self.config.node.service_name.clone();
        let addr = self.advertise_addr();
        let published = self.available_published.clone();
        let task = schedule_once(
            "delay-set-available",
            laser_runtime::timer_runtime(),
            delay,
            async move {
                published.store(true, Ordering::SeqCst);
                if let Some((host, port)) = split_host_port(&addr) {
                    registry.set_status(&service_name, &host, port, ServiceStatus::Available);
                    log::info!("published AVAILABLE for {service_name} at {host}:{port}");
                }
            },
        );
        self.push_task(task);
    }

    pub fn set_unavailable_shards(&self, shard_ids: Vec<u32>) {
        *self
            .unavailable_shards
            .write()
            .unwrap_or_else(|e| e.into_inner()) = shard_ids;
        self.update_server_shard();
    }

    fn get_or_create_handler(
        self: &Arc<Self>,
        partition: &Partition,
        shard_id: u32,
    ) -> Arc<PartitionHandler> {
        let hash = partition.partition_hash();
        {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(handler) = handlers.get(&hash) {
                return handler.clone();
            }
        }

        let ttl_default_ms = self
            .feed
            .current()
            .table(&partition.database, &partition.table)
            .map(|schema| schema.ttl_default_ms)
            .unwrap_or(0);
        let meta_store = self
            .meta_store
            .get()
            .expect("meta store initialized before handlers")
            .clone();
        let handler = PartitionHandler::new(
            partition.clone(),
            shard_id,
            ttl_default_ms,
            HandlerContext {
                config: self.config.clone(),
                meta_store,
                replicator_manager: self.replicator_manager.clone(),
                client: self.client.clone(),
                transport: self.transport.clone(),
                locks: self.locks.clone(),
                advertise_addr: self.advertise_addr(),
            },
        );

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(hash).or_insert(handler).clone()
    }

    pub fn handler(&self, partition: &Partition) -> Option<Arc<PartitionHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&partition.partition_hash()).cloned()
    }

    fn get_or_create_monitor(&self, database: &str, table: &str) -> Arc<TableMonitor> {
        let hash = table_hash(database, table);
        {
            let monitors = self
                .table_monitors
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(monitor) = monitors.get(&hash) {
                return monitor.clone();
            }
        }
        let mut monitors = self
            .table_monitors
            .write()
            .unwrap_or_else(|e| e.into_inner());
        monitors
            .entry(hash)
            .or_insert_with(|| Arc::new(TableMonitor::new(database, table)))
            .clone()
    }

    /// File-distributor hook: a new base version landed for a table.
    pub fn trigger_base(self: &Arc<Self>, database: &str, table: &str, version: &str) {
        let monitor = self.get_or_create_monitor(database, table);
        for partition_id in monitor.partitions() {
            let partition = Partition::new(database, table, partition_id);
            let Some(handler) = self.handler(&partition) else {
                continue;
            };
            let version = version.to_string();
            let _ = laser_runtime::loader_runtime().spawn(async move {
                let _ = handler.load_base(&version).await;
            });
        }
    }

    /// File-distributor hook: delta files landed on top of `base_version`.
    pub fn trigger_delta(
        self: &Arc<Self>,
        database: &str,
        table: &str,
        base_version: &str,
        delta_versions: Vec<String>,
    ) {
        let monitor = self.get_or_create_monitor(database, table);
        for partition_id in monitor.partitions() {
            let partition = Partition::new(database, table, partition_id);
            let Some(handler) = self.handler(&partition) else {
                continue;
            };
            let base_version = base_version.to_string();
            let delta_versions = delta_versions.clone();
            let _ = laser_runtime::loader_runtime().spawn(async move {
                handler.load_delta(&base_version, &delta_versions).await;
            });
        }
    }

    pub fn trigger_force_base_replication(&self, database: &str, table: &str) {
        let Some(schema) = self.feed.current().table(database, table) else {
            return;
        };
        for partition_id in 0..schema.partition_count {
            let partition = Partition::new(database, table, partition_id);
            if let Some(handler) = self.handler(&partition) {
                handler.force_base_replication();
            }
        }
    }

    /// Routes one record key to the engine of the partition that owns it.
    pub fn engine_for(
        &self,
        database: &str,
        table: &str,
        key: &RecordKey,
    ) -> Result<Arc<KvEngine>, Status> {
        let schema = self
            .feed
            .current()
            .table(database, table)
            .ok_or(Status::NotFound)?;
        let partition_id =
            ((key.key_hash() as u64) % u64::from(schema.partition_count.max(1))) as u32;
        let partition = Partition::new(database, table, partition_id);
        let handler = self.handler(&partition).ok_or(Status::NotFound)?;
        handler.engine().ok_or(Status::SourceDbRemoved)
    }

    pub fn table_meta_info(&self, database: &str, table: &str) -> Vec<PartitionMetaInfo> {
        let Some(schema) = self.feed.current().table(database, table) else {
            return Vec::new();
        };
        let mut infos = Vec::new();
        for partition_id in 0..schema.partition_count {
            let partition = Partition::new(database, table, partition_id);
            if let Some(handler) = self.handler(&partition) {
                infos.push(handler.meta_info());
            }
        }
        infos
    }

    pub fn shard_meta_info(&self) -> Vec<ShardMetaInfo> {
        let unavailable = self
            .unavailable_shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let handlers: Vec<_> = {
            let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };

        let mut shards: HashMap<(u32, DbRole), ShardMetaInfo> = HashMap::new();
        for shard_id in self.partition_manager.leader_shard_list() {
            shards.insert((shard_id, DbRole::Leader), empty_shard(shard_id, DbRole::Leader, &unavailable));
        }
        for shard_id in self.partition_manager.follower_shard_list() {
            shards.insert(
                (shard_id, DbRole::Follower),
                empty_shard(shard_id, DbRole::Follower, &unavailable),
            );
        }
        for handler in handlers {
            let key = (handler.shard_id(), handler.role());
            if let Some(shard) = shards.get_mut(&key) {
                shard.partitions.push(handler.meta_info());
            }
        }
        let mut infos: Vec<_> = shards.into_values().collect();
        infos.sort_by_key(|shard| (shard.shard_id, shard.role == DbRole::Follower));
        infos
    }

    /// Drops persisted version records of partitions no schema declares
    /// anymore; returns what was removed.
    pub fn clean_unused_partitions(&self) -> Vec<PartitionMetaInfo> {
        let Some(meta_store) = self.meta_store.get() else {
            return Vec::new();
        };
        let view = self.feed.current();
        let mut removed = Vec::new();
        for (partition, version) in meta_store.list() {
            let declared = view
                .table(&partition.database, &partition.table)
                .is_some_and(|schema| partition.partition_id < schema.partition_count);
            if declared || self.handler(&partition).is_some() {
                continue;
            }
            match meta_store.delete_version(&partition) {
                Ok(true) => removed.push(PartitionMetaInfo {
                    database_name: partition.database.clone(),
                    table_name: partition.table.clone(),
                    partition_id: partition.partition_id,
                    hash: partition.partition_hash(),
                    role: DbRole::Leader,
                    base_version: version,
                    seq_no: 0,
                    replicate_lag: 0,
                }),
                Ok(false) => {}
                Err(err) => log::error!("failed to drop version record for {partition}: {err}"),
            }
        }
        removed
    }

    fn push_task(&self, task: ScheduledTask<()>) {
        self.lock_tasks().push(task);
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledTask<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn empty_shard(shard_id: u32, role: DbRole, unavailable: &[u32]) -> ShardMetaInfo {
    ShardMetaInfo {
        shard_id,
        role,
        status: if unavailable.contains(&shard_id) {
            ServiceStatus::Unavailable
        } else {
            ServiceStatus::Available
        },
        partitions: Vec::new(),
    }
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

struct IterCacheReaper {
    manager: Weak<DatabaseManager>,
}

impl TaskFn for IterCacheReaper {
    type Error = Infallible;

    async fn call(&mut self) -> Result<(), Infallible> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        let handlers: Vec<_> = {
            let map = manager.handlers.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        for handler in handlers {
            if let Some(db) = handler.db() {
                let evicted = db.evict_idle_cached_iters();
                if evicted > 0 {
                    log::debug!("evicted {evicted} idle cached wal readers");
                }
            }
        }
        Ok(())
    }
}

fn wrap_join_handle(name: &str, handle: laser_runtime::JoinHandle<()>) -> ScheduledTask<()> {
    // a JoinHandle dropped on the floor keeps running; keep it cancellable
    // alongside the scheduled tasks
    ScheduledTask::from_handle(name, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("127.0.0.1:8866"),
            Some(("127.0.0.1".to_string(), 8866))
        );
        assert!(split_host_port("nonsense").is_none());
        assert!(split_host_port("host:notaport").is_none());
    }
}
