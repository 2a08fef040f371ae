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

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::entity::NodeShardList;
use crate::entity::TableSchema;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RuntimeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_runtime_threads: Option<NonZeroUsize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader_runtime_threads: Option<NonZeroUsize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicator_runtime_threads: Option<NonZeroUsize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StderrAppenderConfig {
    pub filter: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<StderrAppenderConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    pub log: LogConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            log: LogConfig {
                stderr: Some(StderrAppenderConfig {
                    filter: "INFO".to_string(),
                }),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// WAL segments rotate once they grow past this many bytes.
    pub wal_segment_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            wal_segment_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of buckets the per-key lock table is split into.
    pub lock_buckets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { lock_buckets: 1024 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Max wait on the leader before an empty response is returned.
    pub max_server_wait_ms: u64,
    /// Added to the server wait so the client timeout strictly exceeds it.
    pub client_timeout_diff_ms: u64,
    /// Max bytes of WAL updates one response can carry.
    pub max_size_per_response: u64,
    /// Max number of WAL batches one response can carry.
    pub max_updates_per_response: u64,
    /// Delay before the next pull request after an error.
    pub pull_delay_on_error_ms: u64,
    /// Cached WAL readers idle longer than this are evicted.
    pub iter_idle_ms: u64,
    /// Window for the sequence-gap rule that triggers base replication.
    pub seq_diff_time_window_secs: u64,
    /// Abort timeout for one base snapshot transfer.
    pub snapshot_abort_timeout_ms: u64,
    /// Batch size when copying delta rows into the live engine.
    pub delta_batch_load_count: u32,
    /// Whether externally produced ingest files are already in the store's
    /// native table format. When false they use the framed format and are
    /// converted first.
    pub ingest_format_is_table: bool,
    /// Seconds to delay the AVAILABLE publication after the initial mount.
    pub delay_set_available_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            max_server_wait_ms: 10 * 1000,
            client_timeout_diff_ms: 10 * 1000,
            max_size_per_response: 1024 * 1024,
            max_updates_per_response: 500,
            pull_delay_on_error_ms: 5 * 1000,
            iter_idle_ms: 10 * 1000,
            seq_diff_time_window_secs: 5 * 60,
            snapshot_abort_timeout_ms: 60 * 1000,
            delta_batch_load_count: 1000,
            ingest_format_is_table: false,
            delay_set_available_secs: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub group_name: String,
    pub node_id: u32,
    pub data_root: PathBuf,
    pub total_shards: u32,
    pub service_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            group_name: "default".to_string(),
            node_id: 1,
            data_root: PathBuf::from("/tmp/laser"),
            total_shards: 16,
            service_name: "laser".to_string(),
        }
    }
}

/// The shard list and table schemas to apply at startup, standing in for the
/// external configuration feed until the first pushed update arrives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitialConfig {
    pub shard_list: NodeShardList,
    pub tables: Vec<TableSchema>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: String,
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub initial: InitialConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: "0.0.0.0:8866".to_string(),
            node: NodeConfig::default(),
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            replication: ReplicationConfig::default(),
            initial: InitialConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = ReplicationConfig::default();
        assert!(config.client_timeout_diff_ms > 0);
        assert_eq!(config.max_updates_per_response, 500);
        assert_eq!(EngineConfig::default().lock_buckets, 1024);
    }
}
