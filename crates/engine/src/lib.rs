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

//! The typed command surface of one partition: strings, counters, hashes,
//! lists, sets and sorted sets with TTL semantics, built from the codec and
//! the replicated log store. Read-modify-write sequences serialize on the
//! per-key lock table.

mod key_lock;
pub use key_lock::KeyGuard;
pub use key_lock::LockManager;

mod engine;
pub use engine::KvEngine;
pub use engine::SetOptions;

mod ingest;
pub use ingest::EMPTY_TABLE_KEY;
pub use ingest::EMPTY_TABLE_VALUE;
