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

//! Asynchronous single-leader replication for one partition.
//!
//! The leader serves its WAL tail to pulling followers and ships whole
//! base snapshots when a follower cannot catch up through the log. Followers
//! run an owned pull task that applies batches strictly in order.

mod db;
pub use db::ReplicationDb;
pub use db::ReplicationLog;
pub use db::ReplicationOptions;

mod iter_cache;

mod meter;
pub use meter::MinuteMeter;

mod puller;
pub use puller::start_pull_task;
pub use puller::pull_once;
pub use puller::PullOutcome;
pub use puller::PullTask;
pub use puller::ReplicatorClient;
pub use puller::UpdateVersionCallback;

mod transport;
pub use transport::FsSnapshotTransport;
pub use transport::SnapshotTransport;
