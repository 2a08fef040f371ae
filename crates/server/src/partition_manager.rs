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
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use laser_protos::entity::DbRole;

use crate::config_feed::ClusterView;
use crate::partition::Partition;

/// What one configuration tick changes on this node, reported as a single
/// notification so the routing registry can be updated atomically.
#[derive(Debug, Default)]
pub struct PartitionDiff {
    pub mounts: Vec<(Partition, u32, DbRole)>,
    pub unmounts: Vec<Partition>,
    pub role_changes: Vec<(Partition, DbRole)>,
}

impl PartitionDiff {
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.unmounts.is_empty() && self.role_changes.is_empty()
    }
}

type DesiredSet = HashMap<i64, (Partition, u32, DbRole)>;

/// Diffs the configuration's desired partition placement against what is
/// mounted and tells the subscriber what to mount, unmount, or re-role.
pub struct PartitionManager {
    group_name: String,
    node_id: u32,
    total_shards: u32,
    mounted: RwLock<DesiredSet>,
    leader_shards: RwLock<Vec<u32>>,
    follower_shards: RwLock<Vec<u32>>,
    is_edge_node: AtomicBool,
    callback: RwLock<Option<Arc<dyn Fn(PartitionDiff) + Send + Sync>>>,
}

impl PartitionManager {
    pub fn new(group_name: impl Into<String>, node_id: u32, total_shards: u32) -> PartitionManager {
        PartitionManager {
            group_name: group_name.into(),
            node_id,
            total_shards,
            mounted: RwLock::new(HashMap::new()),
            leader_shards: RwLock::new(Vec::new()),
            follower_shards: RwLock::new(Vec::new()),
            is_edge_node: AtomicBool::new(false),
            callback: RwLock::new(None),
        }
    }

    pub fn subscribe(&self, callback: Arc<dyn Fn(PartitionDiff) + Send + Sync>) {
        *self.callback.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Applies one configuration snapshot and notifies the subscriber with
    /// the resulting diff.
    pub fn apply(&self, view: &ClusterView) {
        let desired = self.desired_partitions(view);

        let diff = {
            let mut mounted = self.mounted.write().unwrap_or_else(|e| e.into_inner());
            let mut diff = PartitionDiff::default();
            for (hash, (partition, shard_id, role)) in &desired {
                match mounted.get(hash) {
                    None => diff
                        .mounts
                        .push((partition.clone(), *shard_id, *role)),
                    Some((_, _, old_role)) if old_role != role => {
                        diff.role_changes.push((partition.clone(), *role))
                    }
                    Some(_) => {}
                }
            }
            for (hash, (partition, _, _)) in mounted.iter() {
                if !desired.contains_key(hash) {
                    diff.unmounts.push(partition.clone());
                }
            }
            *mounted = desired;
            diff
        };

        *self.leader_shards.write().unwrap_or_else(|e| e.into_inner()) =
            view.shard_list.leader_shards.clone();
        *self
            .follower_shards
            .write()
            .unwrap_or_else(|e| e.into_inner()) = view.shard_list.follower_shards.clone();
        self.is_edge_node
            .store(view.shard_list.is_edge_node, Ordering::SeqCst);

        if diff.is_empty() {
            return;
        }
        log::info!(
            "partition placement changed: {} mounts, {} unmounts, {} role changes",
            diff.mounts.len(),
            diff.unmounts.len(),
            diff.role_changes.len()
        );
        let callback = self
            .callback
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(diff);
        }
    }

    fn desired_partitions(&self, view: &ClusterView) -> DesiredSet {
        let mut desired = DesiredSet::new();
        let edge_binding = format!("{}#{}", self.group_name, self.node_id);

        for schema in view.tables.values() {
            if view.shard_list.is_edge_node && !schema.edge_nodes.contains(&edge_binding) {
                continue;
            }
            for partition_id in 0..schema.partition_count {
                let partition =
                    Partition::new(&schema.database, &schema.table, partition_id);
                let hash = partition.partition_hash();
                if view.shard_list.is_edge_node
                    && !view.shard_list.edge_partition_hashes.is_empty()
                    && !view.shard_list.edge_partition_hashes.contains(&hash)
                {
                    continue;
                }
                let shard_id = partition.shard_id(self.total_shards);
                let role = if view.shard_list.leader_shards.contains(&shard_id) {
                    DbRole::Leader
                } else if view.shard_list.follower_shards.contains(&shard_id) {
                    DbRole::Follower
                } else {
                    continue;
                };
                desired.insert(hash, (partition, shard_id, role));
            }
        }
        desired
    }

    pub fn leader_shard_list(&self) -> Vec<u32> {
        self.leader_shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn follower_shard_list(&self) -> Vec<u32> {
        self.follower_shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn partition_hash_list(&self) -> Vec<i64> {
        self.mounted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn mounted_partitions(&self) -> Vec<(Partition, u32, DbRole)> {
        self.mounted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn is_edge_node(&self) -> bool {
        self.is_edge_node.load(Ordering::SeqCst)
    }
}
