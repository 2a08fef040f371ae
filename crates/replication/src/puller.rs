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

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use laser_protos::rpc::ReplicateRequest;
use laser_protos::rpc::ReplicateResponse;
use laser_protos::rpc::ReplicateWdtRequest;
use laser_protos::rpc::ReplicateWdtResponse;
use laser_protos::Status;
use laser_runtime::JoinHandle;
use laser_runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::db::ReplicationDb;

/// Sends one replicate request to the partition's current leader, resolved
/// by service name and shard. The server crate provides the HTTP
/// implementation; tests substitute in-process stubs.
pub trait ReplicatorClient: Send + Sync {
    fn replicate(
        &self,
        service_name: &str,
        shard_id: u32,
        request: ReplicateRequest,
    ) -> BoxFuture<'_, Result<ReplicateResponse, Status>>;

    /// Asks the leader to ship a base snapshot to the follower-provided
    /// transfer URL.
    fn replicate_wdt(
        &self,
        service_name: &str,
        shard_id: u32,
        request: ReplicateWdtRequest,
    ) -> BoxFuture<'_, Result<ReplicateWdtResponse, Status>> {
        let _ = (service_name, shard_id, request);
        async { Err(Status::NotSupported) }.boxed()
    }
}

/// Invoked when the follower must abandon log shipping and fetch a new base:
/// `(db_hash, version)`.
pub type UpdateVersionCallback = Arc<dyn Fn(i64, String) + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
pub enum PullOutcome {
    /// Updates applied (possibly zero); pull again immediately.
    Continue { applied: usize },
    /// Transient error; pull again after the error delay.
    Delay,
    /// Stop pulling and hand the named version to the partition layer for
    /// base replication.
    UpdateVersion { version: String },
}

/// One round of the follower pull loop, separated from the task so tests can
/// drive the state machine deterministically.
pub async fn pull_once(db: &ReplicationDb, client: &dyn ReplicatorClient) -> PullOutcome {
    if db.take_force_base_replication() {
        return PullOutcome::UpdateVersion {
            version: db.base_version(),
        };
    }

    let request = db.build_pull_request();
    let mut next_seq = request.seq_no + 1;
    let response = client
        .replicate(db.replicator_service_name(), db.shard_id(), request)
        .await;

    let response = match response {
        Ok(response) => response,
        Err(Status::SourceWalLogRemoved) => {
            log::info!("leader wal removed; falling back to base replication");
            return PullOutcome::UpdateVersion {
                version: db.base_version(),
            };
        }
        Err(err) => {
            log::error!("pull from upstream failed: {err}");
            return PullOutcome::Delay;
        }
    };

    if response.version != db.base_version() {
        log::info!(
            "base version updated from {} to {}",
            db.base_version(),
            response.version
        );
        return PullOutcome::UpdateVersion {
            version: response.version,
        };
    }

    db.set_leader_max_seq(response.max_seq_no);
    let mut applied = 0usize;
    for update in &response.updates {
        let payload = match BASE64_STANDARD.decode(&update.raw_data) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!(err:?; "undecodable update payload from leader");
                return PullOutcome::Delay;
            }
        };
        match db.apply_update(&payload, update.timestamp.max(0) as u64, next_seq) {
            Ok(seq) => next_seq = seq + 1,
            Err(err) => {
                log::error!("failed to apply update on follower: {err}");
                return PullOutcome::Delay;
            }
        }
        applied += 1;
    }

    if db.reach_max_seq_diff_limit(response.max_seq_no) {
        return PullOutcome::UpdateVersion {
            version: response.version,
        };
    }
    PullOutcome::Continue { applied }
}

/// The owned follower task: pulls, applies, and retires itself when a base
/// switch is required, reporting through `on_update_version`.
pub struct PullTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PullTask {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

pub fn start_pull_task(
    db: Arc<ReplicationDb>,
    client: Arc<dyn ReplicatorClient>,
    on_update_version: UpdateVersionCallback,
    runtime: &Runtime,
) -> PullTask {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let delay = Duration::from_millis(db.config().pull_delay_on_error_ms);
    let db_hash = <ReplicationDb as crate::ReplicationLog>::db_hash(&db);

    let handle = runtime.spawn(async move {
        log::info!("pull task started for db {db_hash}");
        loop {
            let outcome = tokio::select! {
                _ = task_token.cancelled() => break,
                outcome = pull_once(&db, client.as_ref()) => outcome,
            };
            match outcome {
                PullOutcome::Continue { .. } => continue,
                PullOutcome::Delay => {
                    tokio::select! {
                        _ = task_token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                PullOutcome::UpdateVersion { version } => {
                    on_update_version(db_hash, version);
                    break;
                }
            }
        }
        log::info!("pull task stopped for db {db_hash}");
    });

    PullTask { token, handle }
}
