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
use std::sync::RwLock;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use laser_protos::config::ReplicationConfig;
use laser_protos::entity::DbRole;
use laser_protos::rpc::ErrorResponse;
use laser_protos::rpc::ReplicateRequest;
use laser_protos::rpc::ReplicateResponse;
use laser_protos::rpc::ReplicateWdtRequest;
use laser_protos::rpc::ReplicateWdtResponse;
use laser_protos::Status;
use laser_replication::ReplicationLog;
use laser_replication::ReplicatorClient;

use crate::registry::ShardRegistry;

/// Routes inbound replication RPCs to the partition DB they address.
#[derive(Default)]
pub struct ReplicatorManager {
    dbs: RwLock<HashMap<i64, Arc<dyn ReplicationLog>>>,
}

impl ReplicatorManager {
    pub fn new() -> ReplicatorManager {
        ReplicatorManager::default()
    }

    pub fn register(&self, db: Arc<dyn ReplicationLog>) {
        let mut dbs = self.dbs.write().unwrap_or_else(|e| e.into_inner());
        dbs.insert(db.db_hash(), db);
    }

    pub fn deregister(&self, db_hash: i64) {
        let mut dbs = self.dbs.write().unwrap_or_else(|e| e.into_inner());
        dbs.remove(&db_hash);
    }

    pub fn get(&self, db_hash: i64) -> Option<Arc<dyn ReplicationLog>> {
        let dbs = self.dbs.read().unwrap_or_else(|e| e.into_inner());
        dbs.get(&db_hash).cloned()
    }

    pub async fn handle_replicate(
        &self,
        request: ReplicateRequest,
    ) -> Result<ReplicateResponse, Status> {
        let db = self
            .get(request.db_hash)
            .ok_or(Status::SourceDbRemoved)?;
        db.handle_replicate(request).await
    }

    pub async fn handle_replicate_wdt(
        &self,
        request: ReplicateWdtRequest,
    ) -> Result<ReplicateWdtResponse, Status> {
        let db = self
            .get(request.db_hash)
            .ok_or(Status::SourceDbRemoved)?;
        db.handle_replicate_wdt(request).await
    }
}

/// Resolves the leader for `(service, shard)` through the registry and sends
/// the replication RPCs over HTTP. The client timeout strictly exceeds the
/// leader's bounded wait.
pub struct HttpReplicatorClient {
    registry: Arc<dyn ShardRegistry>,
    client: reqwest::Client,
    snapshot_timeout: Duration,
}

impl HttpReplicatorClient {
    pub fn new(
        registry: Arc<dyn ShardRegistry>,
        config: &ReplicationConfig,
    ) -> Result<HttpReplicatorClient, Status> {
        let timeout =
            Duration::from_millis(config.max_server_wait_ms + config.client_timeout_diff_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                log::error!(err:?; "failed to build replicator http client");
                Status::Error
            })?;
        Ok(HttpReplicatorClient {
            registry,
            client,
            snapshot_timeout: Duration::from_millis(
                config.snapshot_abort_timeout_ms + config.client_timeout_diff_ms,
            ),
        })
    }

    async fn post_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        service_name: &str,
        shard_id: u32,
        path: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, Status> {
        let Some(addr) = self.registry.lookup(service_name, shard_id, DbRole::Leader) else {
            log::warn!("no leader for service {service_name} shard {shard_id}");
            return Err(Status::SourceDbRemoved);
        };
        let url = format!("http://{addr}{path}");
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|err| {
                log::warn!(err:?; "replication rpc failed: {url}");
                if err.is_timeout() {
                    Status::TimedOut
                } else {
                    Status::IoError
                }
            })?;

        if response.status().is_success() {
            return response.json::<Resp>().await.map_err(|err| {
                log::error!(err:?; "undecodable replication response: {url}");
                Status::SourceReadError
            });
        }

        let payload = response.bytes().await.map_err(|_| Status::IoError)?;
        match serde_json::from_slice::<ErrorResponse>(&payload) {
            Ok(envelope) => Err(envelope.code),
            Err(_) => Err(Status::Error),
        }
    }
}

impl ReplicatorClient for HttpReplicatorClient {
    fn replicate(
        &self,
        service_name: &str,
        shard_id: u32,
        request: ReplicateRequest,
    ) -> BoxFuture<'_, Result<ReplicateResponse, Status>> {
        let service_name = service_name.to_string();
        let timeout = self.client_timeout(request.max_wait_ms);
        async move {
            self.post_json(&service_name, shard_id, "/v1/replicate", &request, timeout)
                .await
        }
        .boxed()
    }

    fn replicate_wdt(
        &self,
        service_name: &str,
        shard_id: u32,
        request: ReplicateWdtRequest,
    ) -> BoxFuture<'_, Result<ReplicateWdtResponse, Status>> {
        let service_name = service_name.to_string();
        let timeout = self.snapshot_timeout;
        async move {
            self.post_json(
                &service_name,
                shard_id,
                "/v1/replicate_wdt",
                &request,
                timeout,
            )
            .await
        }
        .boxed()
    }
}

impl HttpReplicatorClient {
    fn client_timeout(&self, max_wait_ms: u64) -> Duration {
        // keep strictly above the server-side bounded wait
        Duration::from_millis(max_wait_ms) + Duration::from_secs(10)
    }
}

#[cfg(test)]
mod tests {
    use laser_replication::ReplicationDb;
    use laser_replication::ReplicationOptions;
    use laser_storage::LogStore;
    use laser_storage::StoreOptions;

    use super::*;

    #[test]
    fn test_register_route_and_deregister() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), StoreOptions::default()).unwrap();
        let db = Arc::new(ReplicationDb::new(
            store,
            ReplicationOptions::new(77, DbRole::Leader, "v1"),
        ));

        let manager = ReplicatorManager::new();
        manager.register(db.clone());
        assert!(manager.get(77).is_some());

        laser_runtime::test_runtime().block_on(async {
            let mut request = db.build_pull_request();
            request.db_hash = 99;
            let err = manager.handle_replicate(request).await.unwrap_err();
            assert_eq!(err, Status::SourceDbRemoved);

            let request = db.build_pull_request();
            let response = manager.handle_replicate(request).await.unwrap();
            assert_eq!(response.version, "v1");
        });

        manager.deregister(77);
        assert!(manager.get(77).is_none());
    }
}
