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

//! The ordered key-value store every partition runs on.
//!
//! One [`LogStore`] holds a byte-ordered live table, a write-ahead log that
//! assigns monotonically increasing sequence numbers to every record, and a
//! persisted table file. The WAL tail is readable since an arbitrary
//! sequence, which is what leader-to-follower log shipping consumes.

mod batch;
pub use batch::BatchOp;
pub use batch::WriteBatch;

mod table;
pub use table::read_table_file;
pub use table::TableWriter;

mod wal;
pub use wal::WalRecord;

mod store;
pub use store::destroy_store;
pub use store::LogStore;
pub use store::StoreOptions;
pub use store::WalError;
pub use store::WalReader;

/// Decides whether a record is dropped when the live table is rewritten.
///
/// The store invokes it without interpreting key or value bytes; the typed
/// layer registers a filter that understands the encoded expiration header.
pub trait CompactionFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Returns true when the record should be removed.
    fn filter(&self, key: &[u8], value: &[u8]) -> bool;
}
