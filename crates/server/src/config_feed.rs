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
use std::sync::Arc;

use laser_protos::entity::NodeShardList;
use laser_protos::entity::TableSchema;
use tokio::sync::watch;

use crate::partition::table_hash;

/// One consistent snapshot of the external configuration: the shard lists
/// this node owns plus every table schema keyed by table hash.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub shard_list: NodeShardList,
    pub tables: HashMap<u64, Arc<TableSchema>>,
}

impl ClusterView {
    pub fn table(&self, database: &str, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(&table_hash(database, table)).cloned()
    }
}

/// Push-model configuration feed. The external control plane (or the admin
/// endpoint standing in for it) publishes; the partition manager observes.
pub struct ConfigFeed {
    tx: watch::Sender<ClusterView>,
}

impl Default for ConfigFeed {
    fn default() -> Self {
        ConfigFeed::new()
    }
}

impl ConfigFeed {
    pub fn new() -> ConfigFeed {
        let (tx, _) = watch::channel(ClusterView::default());
        ConfigFeed { tx }
    }

    pub fn publish(&self, shard_list: NodeShardList, tables: Vec<TableSchema>) {
        let tables = tables
            .into_iter()
            .map(|schema| {
                (
                    table_hash(&schema.database, &schema.table),
                    Arc::new(schema),
                )
            })
            .collect();
        let view = ClusterView { shard_list, tables };
        log::info!(
            "publishing configuration: {} leader shards, {} follower shards, {} tables",
            view.shard_list.leader_shards.len(),
            view.shard_list.follower_shards.len(),
            view.tables.len()
        );
        let _ = self.tx.send(view);
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterView> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ClusterView {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(database: &str, table: &str) -> TableSchema {
        TableSchema {
            database: database.to_string(),
            table: table.to_string(),
            partition_count: 4,
            ttl_default_ms: 0,
            edge_nodes: Vec::new(),
        }
    }

    #[test]
    fn test_publish_and_lookup() {
        let feed = ConfigFeed::new();
        assert!(feed.current().tables.is_empty());

        feed.publish(
            NodeShardList {
                leader_shards: vec![0, 1],
                ..Default::default()
            },
            vec![schema("db", "users"), schema("db", "items")],
        );

        let view = feed.current();
        assert_eq!(view.tables.len(), 2);
        assert_eq!(view.table("db", "users").unwrap().partition_count, 4);
        assert!(view.table("db", "missing").is_none());
    }

    #[test]
    fn test_subscribers_observe_updates() {
        let feed = ConfigFeed::new();
        let mut rx = feed.subscribe();
        feed.publish(NodeShardList::default(), vec![schema("db", "t")]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().tables.len(), 1);
    }
}
