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

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbRole {
    #[serde(rename = "LEADER")]
    Leader,
    #[serde(rename = "FOLLOWER")]
    Follower,
}

impl std::fmt::Display for DbRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbRole::Leader => write!(f, "LEADER"),
            DbRole::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// The shard ownership the configuration feed declares for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShardList {
    pub leader_shards: Vec<u32>,
    pub follower_shards: Vec<u32>,
    #[serde(default)]
    pub is_edge_node: bool,
    /// For edge nodes, partition hashes pinned to this node.
    #[serde(default)]
    pub edge_partition_hashes: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub database: String,
    pub table: String,
    pub partition_count: u32,
    #[serde(default)]
    pub ttl_default_ms: u64,
    /// `group#node` identifiers of the edge nodes this table is bound to.
    #[serde(default)]
    pub edge_nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    #[serde(rename = "AVAILABLE")]
    Available,
    #[serde(rename = "UNAVAILABLE")]
    Unavailable,
}

/// The registration a node publishes to the service-discovery registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub available_shard_list: Vec<u32>,
    pub follower_available_shard_list: Vec<u32>,
    pub is_edge_node: bool,
    pub partition_list: Vec<i64>,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMetaInfo {
    pub database_name: String,
    pub table_name: String,
    pub partition_id: u32,
    pub hash: i64,
    pub role: DbRole,
    pub base_version: String,
    pub seq_no: u64,
    pub replicate_lag: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMetaInfo {
    pub shard_id: u32,
    pub role: DbRole,
    pub status: ServiceStatus,
    pub partitions: Vec<PartitionMetaInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_string(&DbRole::Leader).unwrap(), "\"LEADER\"");
        assert_eq!(
            serde_json::to_string(&ServiceStatus::Unavailable).unwrap(),
            "\"UNAVAILABLE\""
        );
    }

    #[test]
    fn test_shard_list_defaults() {
        let list: NodeShardList = serde_json::from_str(
            r#"{"leader_shards": [0, 1], "follower_shards": [2]}"#,
        )
        .unwrap();
        assert!(!list.is_edge_node);
        assert!(list.edge_partition_hashes.is_empty());
    }
}
