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

use std::path::Path;

use laser_protos::Status;
use laser_storage::LogStore;
use laser_storage::StoreOptions;
use laser_storage::WriteBatch;
use serde::Deserialize;
use serde::Serialize;

use crate::partition::Partition;

const VERSION_KEY_PREFIX: &str = "version#";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRecord {
    database: String,
    table: String,
    partition_id: u32,
    version: String,
}

/// Node-wide persisted record of which base version every partition holds,
/// so a restart can remount partitions without refetching their bases.
pub struct VersionMetaStore {
    store: LogStore,
}

impl VersionMetaStore {
    pub fn open(dir: &Path) -> Result<VersionMetaStore, Status> {
        let store = LogStore::open(dir, StoreOptions::default())?;
        Ok(VersionMetaStore { store })
    }

    pub fn load_version(&self, partition: &Partition) -> Option<String> {
        let raw = self.store.get(version_key(partition).as_bytes())?;
        match serde_json::from_slice::<VersionRecord>(&raw) {
            Ok(record) => Some(record.version),
            Err(err) => {
                log::warn!(err:?; "undecodable version record for {partition}");
                None
            }
        }
    }

    pub fn update_version(&self, partition: &Partition, version: &str) -> Result<(), Status> {
        let record = VersionRecord {
            database: partition.database.clone(),
            table: partition.table.clone(),
            partition_id: partition.partition_id,
            version: version.to_string(),
        };
        let raw = serde_json::to_vec(&record).map_err(|err| {
            log::error!(err:?; "failed to serialize version record for {partition}");
            Status::Error
        })?;
        let mut batch = WriteBatch::new();
        batch.put(version_key(partition).into_bytes(), raw);
        self.store.write(&batch, laser_runtime::current_time_ms())?;
        self.store.flush()
    }

    /// Removes the record; returns whether one existed.
    pub fn delete_version(&self, partition: &Partition) -> Result<bool, Status> {
        let key = version_key(partition);
        if !self.store.exist(key.as_bytes()) {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        batch.delete(key.into_bytes());
        self.store.write(&batch, laser_runtime::current_time_ms())?;
        self.store.flush()?;
        Ok(true)
    }

    pub fn list(&self) -> Vec<(Partition, String)> {
        let mut records = Vec::new();
        for (_, raw) in self.store.scan_prefix(VERSION_KEY_PREFIX.as_bytes()) {
            let Ok(record) = serde_json::from_slice::<VersionRecord>(&raw) else {
                continue;
            };
            records.push((
                Partition::new(record.database, record.table, record.partition_id),
                record.version,
            ));
        }
        records
    }
}

fn version_key(partition: &Partition) -> String {
    format!(
        "{VERSION_KEY_PREFIX}{:016x}#{:08}",
        crate::partition::table_hash(&partition.database, &partition.table),
        partition.partition_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_round_trip_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let partition = Partition::new("db", "users", 3);
        {
            let meta = VersionMetaStore::open(dir.path()).unwrap();
            assert!(meta.load_version(&partition).is_none());
            meta.update_version(&partition, "base-7").unwrap();
            assert_eq!(meta.load_version(&partition).unwrap(), "base-7");
            meta.update_version(&partition, "base-8").unwrap();
        }

        let meta = VersionMetaStore::open(dir.path()).unwrap();
        assert_eq!(meta.load_version(&partition).unwrap(), "base-8");
        assert_eq!(meta.list().len(), 1);

        assert!(meta.delete_version(&partition).unwrap());
        assert!(!meta.delete_version(&partition).unwrap());
        assert!(meta.load_version(&partition).is_none());
    }

    #[test]
    fn test_partitions_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let meta = VersionMetaStore::open(dir.path()).unwrap();
        meta.update_version(&Partition::new("db", "t", 0), "v0").unwrap();
        meta.update_version(&Partition::new("db", "t", 1), "v1").unwrap();
        meta.update_version(&Partition::new("db", "u", 0), "v2").unwrap();

        assert_eq!(meta.list().len(), 3);
        assert_eq!(
            meta.load_version(&Partition::new("db", "t", 1)).unwrap(),
            "v1"
        );
    }
}
