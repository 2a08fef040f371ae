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
use std::sync::RwLock;

use laser_protos::entity::DbRole;
use laser_protos::entity::ServiceInfo;
use laser_protos::entity::ServiceStatus;

/// The service-discovery registry contract the node publishes itself to and
/// resolves replication peers through. Production deployments plug the real
/// discovery layer in here.
pub trait ShardRegistry: Send + Sync {
    fn publish(&self, info: ServiceInfo);

    fn set_status(&self, service_name: &str, host: &str, port: u16, status: ServiceStatus);

    /// Resolves `host:port` of a node serving `shard_id` in `role`.
    fn lookup(&self, service_name: &str, shard_id: u32, role: DbRole) -> Option<String>;

    fn list(&self, service_name: &str) -> Vec<ServiceInfo>;
}

/// In-process registry; shared between nodes of one process in tests and
/// single-node deployments.
#[derive(Default)]
pub struct LocalRegistry {
    services: RwLock<HashMap<String, HashMap<String, ServiceInfo>>>,
}

impl LocalRegistry {
    pub fn new() -> LocalRegistry {
        LocalRegistry::default()
    }
}

fn node_key(info: &ServiceInfo) -> String {
    format!("{}:{}", info.host, info.port)
}

impl ShardRegistry for LocalRegistry {
    fn publish(&self, info: ServiceInfo) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services
            .entry(info.service_name.clone())
            .or_default()
            .insert(node_key(&info), info);
    }

    fn set_status(&self, service_name: &str, host: &str, port: u16, status: ServiceStatus) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if let Some(nodes) = services.get_mut(service_name) {
            if let Some(info) = nodes.get_mut(&format!("{host}:{port}")) {
                info.status = status;
            }
        }
    }

    fn lookup(&self, service_name: &str, shard_id: u32, role: DbRole) -> Option<String> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        let nodes = services.get(service_name)?;
        for info in nodes.values() {
            let shards = match role {
                DbRole::Leader => &info.available_shard_list,
                DbRole::Follower => &info.follower_available_shard_list,
            };
            if shards.contains(&shard_id) {
                return Some(format!("{}:{}", info.host, info.port));
            }
        }
        None
    }

    fn list(&self, service_name: &str) -> Vec<ServiceInfo> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services
            .get(service_name)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(host: &str, port: u16, leaders: Vec<u32>, followers: Vec<u32>) -> ServiceInfo {
        ServiceInfo {
            service_name: "laser".to_string(),
            host: host.to_string(),
            port,
            protocol: "http".to_string(),
            available_shard_list: leaders,
            follower_available_shard_list: followers,
            is_edge_node: false,
            partition_list: Vec::new(),
            status: ServiceStatus::Available,
        }
    }

    #[test]
    fn test_publish_lookup_by_role() {
        let registry = LocalRegistry::new();
        registry.publish(info("10.0.0.1", 8866, vec![0, 1], vec![2]));
        registry.publish(info("10.0.0.2", 8866, vec![2, 3], vec![0]));

        assert_eq!(
            registry.lookup("laser", 0, DbRole::Leader).unwrap(),
            "10.0.0.1:8866"
        );
        assert_eq!(
            registry.lookup("laser", 3, DbRole::Leader).unwrap(),
            "10.0.0.2:8866"
        );
        assert_eq!(
            registry.lookup("laser", 0, DbRole::Follower).unwrap(),
            "10.0.0.2:8866"
        );
        assert!(registry.lookup("laser", 9, DbRole::Leader).is_none());
        assert!(registry.lookup("other", 0, DbRole::Leader).is_none());
    }

    #[test]
    fn test_republish_replaces_shards() {
        let registry = LocalRegistry::new();
        registry.publish(info("10.0.0.1", 8866, vec![0], vec![]));
        registry.publish(info("10.0.0.1", 8866, vec![5], vec![]));

        assert!(registry.lookup("laser", 0, DbRole::Leader).is_none());
        assert_eq!(
            registry.lookup("laser", 5, DbRole::Leader).unwrap(),
            "10.0.0.1:8866"
        );
        assert_eq!(registry.list("laser").len(), 1);
    }

    #[test]
    fn test_set_status() {
        let registry = LocalRegistry::new();
        registry.publish(info("10.0.0.1", 8866, vec![0], vec![]));
        registry.set_status("laser", "10.0.0.1", 8866, ServiceStatus::Unavailable);
        let infos = registry.list("laser");
        assert_eq!(infos[0].status, ServiceStatus::Unavailable);
    }
}
