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

//! One Laser storage node: mounts partitions the configuration assigns to
//! it, drives base and delta ingest, replicates between peers, and serves
//! the typed command surface plus admin over HTTP.

mod error;
pub use error::ServerError;

mod partition;
pub use partition::node_hash;
pub use partition::table_hash;
pub use partition::Partition;

mod config_feed;
pub use config_feed::ClusterView;
pub use config_feed::ConfigFeed;

mod registry;
pub use registry::LocalRegistry;
pub use registry::ShardRegistry;

mod meta_store;
pub use meta_store::VersionMetaStore;

mod table_monitor;

mod replicator_manager;
pub use replicator_manager::HttpReplicatorClient;
pub use replicator_manager::ReplicatorManager;

mod partition_handler;
pub use partition_handler::PartitionHandler;
pub use partition_handler::PartitionState;

mod partition_manager;
pub use partition_manager::PartitionDiff;
pub use partition_manager::PartitionManager;

mod database_manager;
pub use database_manager::DatabaseManager;

mod http;
pub use http::make_router;

mod server;
pub use server::start;
pub use server::start_with_registry;
pub use server::ServerState;
