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

use std::collections::BTreeSet;
use std::sync::Mutex;

/// Tracks which leader partitions of one table react to externally delivered
/// base and delta files. The file distributor's trigger calls fan out over
/// this set.
pub(crate) struct TableMonitor {
    database: String,
    table: String,
    partitions: Mutex<BTreeSet<u32>>,
}

impl TableMonitor {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> TableMonitor {
        TableMonitor {
            database: database.into(),
            table: table.into(),
            partitions: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn add_partition(&self, partition_id: u32) {
        let mut partitions = self.lock();
        if partitions.insert(partition_id) {
            log::info!(
                "watching base/delta files for {}/{} partition {partition_id}",
                self.database,
                self.table
            );
        }
    }

    pub fn remove_partition(&self, partition_id: u32) {
        self.lock().remove(&partition_id);
    }

    pub fn partitions(&self) -> Vec<u32> {
        self.lock().iter().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.partitions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_partitions() {
        let monitor = TableMonitor::new("db", "t");
        monitor.add_partition(3);
        monitor.add_partition(1);
        monitor.add_partition(3);
        assert_eq!(monitor.partitions(), vec![1, 3]);

        monitor.remove_partition(3);
        assert_eq!(monitor.partitions(), vec![1]);
        monitor.remove_partition(9);
        assert_eq!(monitor.partitions(), vec![1]);
    }
}
