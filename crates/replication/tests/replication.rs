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

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use laser_protos::config::ReplicationConfig;
use laser_protos::entity::DbRole;
use laser_protos::rpc::ReplicateRequest;
use laser_protos::rpc::ReplicateResponse;
use laser_protos::Status;
use laser_replication::pull_once;
use laser_replication::start_pull_task;
use laser_replication::PullOutcome;
use laser_replication::ReplicationDb;
use laser_replication::ReplicationOptions;
use laser_replication::ReplicatorClient;
use laser_storage::LogStore;
use laser_storage::StoreOptions;
use laser_storage::WriteBatch;

fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        max_server_wait_ms: 50,
        pull_delay_on_error_ms: 20,
        ..Default::default()
    }
}

fn make_db(dir: &std::path::Path, role: DbRole, version: &str) -> Arc<ReplicationDb> {
    let store = LogStore::open(dir, StoreOptions::default()).unwrap();
    let mut options = ReplicationOptions::new(42, role, version);
    options.config = test_config();
    Arc::new(ReplicationDb::new(store, options))
}

struct LocalClient {
    leader: Arc<ReplicationDb>,
}

impl ReplicatorClient for LocalClient {
    fn replicate(
        &self,
        _service_name: &str,
        _shard_id: u32,
        request: ReplicateRequest,
    ) -> BoxFuture<'_, Result<ReplicateResponse, Status>> {
        async move { self.leader.handle_replicate(request).await }.boxed()
    }
}

/// A leader that must never be contacted.
struct UnreachableClient;

impl ReplicatorClient for UnreachableClient {
    fn replicate(
        &self,
        _service_name: &str,
        _shard_id: u32,
        _request: ReplicateRequest,
    ) -> BoxFuture<'_, Result<ReplicateResponse, Status>> {
        async move { Err(Status::SourceDbRemoved) }.boxed()
    }
}

fn write_keys(db: &ReplicationDb, range: std::ops::Range<u32>, batch_size: u32) {
    let mut pending = WriteBatch::new();
    for i in range {
        pending.put(format!("key-{i:05}").into_bytes(), format!("value-{i}").into_bytes());
        if pending.len() as u32 == batch_size {
            db.write(&pending).unwrap();
            pending = WriteBatch::new();
        }
    }
    if !pending.is_empty() {
        db.write(&pending).unwrap();
    }
}

async fn converge(follower: &ReplicationDb, leader: &ReplicationDb, client: &dyn ReplicatorClient) -> usize {
    let mut pulls = 0;
    while follower.latest_sequence() < leader.latest_sequence() {
        pulls += 1;
        assert!(pulls < 1000, "follower failed to converge");
        match pull_once(follower, client).await {
            PullOutcome::Continue { .. } => {}
            other => panic!("unexpected pull outcome: {other:?}"),
        }
    }
    pulls
}

#[test]
fn test_replication_success() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();
    let leader = make_db(leader_dir.path(), DbRole::Leader, "base-1");
    let follower = make_db(follower_dir.path(), DbRole::Follower, "base-1");
    let client = LocalClient {
        leader: leader.clone(),
    };

    write_keys(&leader, 0..100, 1);
    assert_eq!(leader.latest_sequence(), 100);

    laser_runtime::test_runtime().block_on(async {
        converge(&follower, &leader, &client).await;
    });

    assert_eq!(follower.latest_sequence(), 100);
    for i in 0..100 {
        let key = format!("key-{i:05}").into_bytes();
        assert_eq!(
            follower.read(&key).unwrap(),
            format!("value-{i}").into_bytes()
        );
    }
}

#[test]
fn test_replication_batch_success() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();
    let leader = make_db(leader_dir.path(), DbRole::Leader, "base-1");
    let follower = {
        let store = LogStore::open(follower_dir.path(), StoreOptions::default()).unwrap();
        let mut options = ReplicationOptions::new(42, DbRole::Follower, "base-1");
        options.config = ReplicationConfig {
            max_updates_per_response: 4,
            ..test_config()
        };
        Arc::new(ReplicationDb::new(store, options))
    };
    let client = LocalClient {
        leader: leader.clone(),
    };

    write_keys(&leader, 0..1001, 100);
    assert_eq!(leader.latest_sequence(), 1001);

    let pulls = laser_runtime::test_runtime()
        .block_on(async { converge(&follower, &leader, &client).await });

    // 11 batches under a 4-updates-per-pull budget
    assert!(pulls <= 4, "expected few pulls, took {pulls}");
    assert_eq!(follower.latest_sequence(), 1001);
    assert_eq!(follower.store().num_keys(), 1001);
}

#[test]
fn test_version_mismatch_triggers_base_replication() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();
    let leader = make_db(leader_dir.path(), DbRole::Leader, "base-2");
    let follower = make_db(follower_dir.path(), DbRole::Follower, "other");
    let client = LocalClient {
        leader: leader.clone(),
    };

    write_keys(&leader, 0..10, 1);

    laser_runtime::test_runtime().block_on(async {
        // the leader answers with its own version and no updates
        let outcome = pull_once(&follower, &client).await;
        assert_eq!(
            outcome,
            PullOutcome::UpdateVersion {
                version: "base-2".to_string()
            }
        );
        assert_eq!(follower.latest_sequence(), 0);
    });
}

#[test]
fn test_wal_gc_triggers_base_replication_exactly_once() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();
    let leader = make_db(leader_dir.path(), DbRole::Leader, "base-1");
    let follower = make_db(follower_dir.path(), DbRole::Follower, "base-1");

    write_keys(&leader, 0..10, 1);
    leader.store().truncate_wal_before(8).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let client = Arc::new(LocalClient {
        leader: leader.clone(),
    });

    laser_runtime::test_runtime().block_on(async {
        let task = start_pull_task(
            follower.clone(),
            client,
            Arc::new(move |db_hash, version| {
                assert_eq!(db_hash, 42);
                assert_eq!(version, "base-1");
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
            laser_runtime::test_runtime(),
        );
        task.join().await;
    });

    // on_update_version fired exactly once and the task retired itself
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(follower.latest_sequence(), 0);
}

#[test]
fn test_force_base_replication_skips_the_leader() {
    let follower_dir = tempfile::tempdir().unwrap();
    let follower = make_db(follower_dir.path(), DbRole::Follower, "base-1");
    follower.force_base_replication();

    laser_runtime::test_runtime().block_on(async {
        let outcome = pull_once(&follower, &UnreachableClient).await;
        assert_eq!(
            outcome,
            PullOutcome::UpdateVersion {
                version: "base-1".to_string()
            }
        );
        // the flag is one-shot; the next failure is a plain delay
        let outcome = pull_once(&follower, &UnreachableClient).await;
        assert_eq!(outcome, PullOutcome::Delay);
    });
}

#[test]
fn test_leader_iter_cache_is_reused_across_pulls() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();
    let leader = make_db(leader_dir.path(), DbRole::Leader, "base-1");
    let follower = make_db(follower_dir.path(), DbRole::Follower, "base-1");
    let client = LocalClient {
        leader: leader.clone(),
    };

    laser_runtime::test_runtime().block_on(async {
        write_keys(&leader, 0..5, 1);
        converge(&follower, &leader, &client).await;
        assert_eq!(leader.cached_iters(), 1);

        write_keys(&leader, 5..10, 1);
        converge(&follower, &leader, &client).await;
        assert_eq!(leader.cached_iters(), 1);
        assert_eq!(follower.latest_sequence(), 10);
    });
}

#[test]
fn test_seq_gap_window_rule() {
    let follower_dir = tempfile::tempdir().unwrap();
    let follower = make_db(follower_dir.path(), DbRole::Follower, "base-1");

    // no apply rate observed yet: the rule never fires
    assert!(!follower.reach_max_seq_diff_limit(1_000_000_000));

    // a tiny apply rate against an enormous gap trips the window rule
    follower.apply_rate_meter().mark(1);
    assert!(follower.reach_max_seq_diff_limit(1_000_000_000));
}

#[test]
fn test_snapshot_transfer_to_follower_url() {
    let leader_dir = tempfile::tempdir().unwrap();
    let staging_dir = tempfile::tempdir().unwrap();

    // the partition layout keeps the engine under <partition>/data with the
    // checkpoint directory as a sibling
    let leader = {
        let store = LogStore::open(leader_dir.path().join("data"), StoreOptions::default()).unwrap();
        let mut options = ReplicationOptions::new(42, DbRole::Leader, "base-1");
        options.config = test_config();
        Arc::new(ReplicationDb::new(store, options))
    };
    write_keys(&leader, 0..50, 10);

    laser_runtime::test_runtime().block_on(async {
        let request = laser_protos::rpc::ReplicateWdtRequest {
            db_hash: 42,
            version: "base-1".to_string(),
            wdt_url: format!("file://{}", staging_dir.path().display()),
        };
        let response = leader.handle_replicate_wdt(request).await.unwrap();
        assert!(response.send_success);
    });

    // the shared checkpoint is removed once the last transfer completes
    assert!(!leader_dir.path().join("checkpoint").exists());

    // the received snapshot opens as a store identical to the leader
    let copy = LogStore::open(staging_dir.path(), StoreOptions::default()).unwrap();
    assert_eq!(copy.latest_sequence(), leader.latest_sequence());
    assert_eq!(copy.num_keys(), 50);
    assert_eq!(
        copy.get(b"key-00049").unwrap(),
        b"value-49".to_vec()
    );
}
