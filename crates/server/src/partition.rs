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

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// One shard of one table. The partition hash is stable across builds and
/// platforms; it addresses the partition in replication RPCs and, modulo the
/// shard count, routes it to nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub database: String,
    pub table: String,
    pub partition_id: u32,
}

impl Partition {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        partition_id: u32,
    ) -> Partition {
        Partition {
            database: database.into(),
            table: table.into(),
            partition_id,
        }
    }

    pub fn partition_hash(&self) -> i64 {
        let mut hasher = SipHasher13::new_with_keys(u64::from(self.partition_id), 0);
        hasher.write(self.database.as_bytes());
        hasher.write(self.table.as_bytes());
        hasher.finish() as i64
    }

    pub fn shard_id(&self, total_shards: u32) -> u32 {
        ((self.partition_hash() as u64) % u64::from(total_shards.max(1))) as u32
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.database, self.table, self.partition_id)
    }
}

pub fn table_hash(database: &str, table: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(database.as_bytes());
    let seed = hasher.finish();
    let mut hasher = SipHasher13::new_with_keys(seed, 0);
    hasher.write(table.as_bytes());
    hasher.finish()
}

pub fn node_hash(group_name: &str, node_id: u32) -> i64 {
    let mut hasher = SipHasher13::new_with_keys(u64::from(node_id), 0);
    hasher.write(group_name.as_bytes());
    hasher.finish() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_hash_is_stable_and_discriminating() {
        let partition = Partition::new("db", "table", 3);
        assert_eq!(partition.partition_hash(), partition.partition_hash());

        let other_id = Partition::new("db", "table", 4);
        assert_ne!(partition.partition_hash(), other_id.partition_hash());

        let other_table = Partition::new("db", "table2", 3);
        assert_ne!(partition.partition_hash(), other_table.partition_hash());
    }

    #[test]
    fn test_shard_id_is_in_range() {
        for id in 0..64 {
            let partition = Partition::new("db", "table", id);
            assert!(partition.shard_id(10) < 10);
        }
    }

    #[test]
    fn test_table_and_node_hash() {
        assert_eq!(table_hash("a", "b"), table_hash("a", "b"));
        assert_ne!(table_hash("a", "b"), table_hash("b", "a"));
        assert_ne!(node_hash("group", 1), node_hash("group", 2));
    }
}
