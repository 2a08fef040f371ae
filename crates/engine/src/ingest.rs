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

//! Batch ingest of externally produced base and delta files.
//!
//! Externally produced files arrive in the framed mapreduce output format
//! `frame_len(4 BE) ‖ key_len(4 BE) ‖ key ‖ val_len(4 BE) ‖ val` and are
//! converted to the store's table format first; values are wrapped as raw
//! strings on the way through. Delta files detour through an ephemeral side
//! store so composite records can be replaced root-by-root under their lock.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use laser_codec::decode_value_header;
use laser_codec::KeyShape;
use laser_codec::RawStringValue;
use laser_codec::RecordKey;
use laser_codec::ValueTag;
use laser_protos::Status;
use laser_storage::destroy_store;
use laser_storage::LogStore;
use laser_storage::StoreOptions;
use laser_storage::TableWriter;
use laser_storage::WriteBatch;
use scopeguard::defer;

use crate::engine::KvEngine;

/// Sentinel row written when an externally produced base file is empty, so
/// ingestion always lands a non-empty table.
pub const EMPTY_TABLE_KEY: &[u8] = b"EMPTY_TABLE_KEY";
pub const EMPTY_TABLE_VALUE: &[u8] = b"EMPTY_TABLE_VALUE";

const CONVERT_FILE_SUFFIX: &str = "_table";

impl KvEngine {
    /// Ingests one externally produced base file into the live store.
    pub fn ingest_base(&self, ingest_file: &Path) -> Result<(), Status> {
        let already_table = self.db().config().ingest_format_is_table;
        let final_file = pre_ingest(ingest_file, already_table);
        defer! {
            post_ingest(ingest_file, already_table);
        }
        self.db().store().ingest_table_file(&final_file?)
    }

    /// Ingests one delta file: plain rows are copied in batches, composite
    /// roots are replaced wholesale under their key lock.
    pub fn ingest_delta(&self, ingest_file: &Path, tempdb_dir: &Path) -> Result<(), Status> {
        destroy_store(tempdb_dir)?;
        let side = LogStore::open(tempdb_dir, StoreOptions::default())?;
        let tempdb = tempdb_dir.to_path_buf();
        defer! {
            if let Err(err) = destroy_store(&tempdb) {
                log::error!("failed to destroy delta side store: {err}");
            }
        }

        let already_table = self.db().config().ingest_format_is_table;
        let final_file = pre_ingest(ingest_file, already_table);
        defer! {
            post_ingest(ingest_file, already_table);
        }
        side.ingest_table_file(&final_file?)?;

        let batch_limit = self.db().config().delta_batch_load_count.max(1) as usize;
        let mut batch = WriteBatch::new();
        let mut composite_roots = Vec::new();
        for (key, value) in side.scan_prefix(&[KeyShape::Default as u8]) {
            let Ok(header) = decode_value_header(&value) else {
                log::warn!("skipping undecodable delta row");
                continue;
            };
            match header.tag {
                ValueTag::RawString | ValueTag::Counter => {
                    batch.put(key, value);
                    if batch.len() >= batch_limit {
                        self.db().write(&batch)?;
                        batch = WriteBatch::new();
                    }
                }
                _ => composite_roots.push((key, value)),
            }
        }
        if !batch.is_empty() {
            self.db().write(&batch)?;
        }

        for (root_bytes, root_value) in composite_roots {
            let Ok(root) = RecordKey::decode(&root_bytes) else {
                log::warn!("skipping delta root with undecodable key");
                continue;
            };
            let _guard = self.locks().lock(&root_bytes);
            if let Err(err) = self.db().delete_key(&root) {
                log::error!("failed to clear delta root: {err}");
                continue;
            }
            let mut replace = WriteBatch::new();
            for (child, value) in side.scan_prefix(&root.composite_prefix()) {
                replace.put(child, value);
            }
            replace.put(root_bytes, root_value);
            if let Err(err) = self.db().write(&replace) {
                log::error!("failed to apply delta root: {err}");
            }
        }
        Ok(())
    }

    /// Dumps the live keyspace to an external table file.
    pub fn dump_table(&self, path: &Path) -> Result<(), Status> {
        self.db().store().dump_table_file(path)
    }
}

fn pre_ingest(ingest_file: &Path, already_table: bool) -> Result<PathBuf, Status> {
    if already_table {
        return Ok(ingest_file.to_path_buf());
    }
    let converted = converted_file_name(ingest_file);
    convert_framed_file(ingest_file, &converted)?;
    Ok(converted)
}

/// Removes consumed input so a restart does not re-ingest it; an empty marker
/// file is left in the original's place.
fn post_ingest(ingest_file: &Path, already_table: bool) {
    if already_table {
        if ingest_file.exists() {
            if let Err(err) = std::fs::remove_file(ingest_file) {
                log::warn!(err:?; "failed to remove ingested file: {}", ingest_file.display());
            }
        }
        return;
    }

    if ingest_file.exists() {
        if let Err(err) = std::fs::remove_file(ingest_file) {
            log::warn!(err:?; "failed to remove ingest source: {}", ingest_file.display());
        }
        if let Err(err) = File::create(ingest_file) {
            log::warn!(err:?; "failed to leave ingest marker: {}", ingest_file.display());
        }
    }
    let converted = converted_file_name(ingest_file);
    if converted.exists() {
        if let Err(err) = std::fs::remove_file(&converted) {
            log::warn!(err:?; "failed to remove converted file: {}", converted.display());
        }
    }
}

fn converted_file_name(ingest_file: &Path) -> PathBuf {
    let mut name = ingest_file.as_os_str().to_os_string();
    name.push(CONVERT_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Converts the framed external format into a table file, wrapping every
/// value as a raw string. An empty input turns into the sentinel row.
fn convert_framed_file(input: &Path, output: &Path) -> Result<(), Status> {
    let mut file = File::open(input).map_err(|err| {
        log::error!(err:?; "failed to open ingest file: {}", input.display());
        Status::from_io(&err)
    })?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|err| Status::from_io(&err))?;

    let mut writer = TableWriter::create(output)?;
    if data.is_empty() {
        writer.add(EMPTY_TABLE_KEY, &RawStringValue::new(EMPTY_TABLE_VALUE.to_vec()).encode())?;
        return writer.finish(0);
    }

    let mut offset = 0usize;
    while offset < data.len() {
        let frame_len = read_u32_be(&data, &mut offset)? as usize;
        let frame_end = offset.checked_add(frame_len).ok_or(Status::Error)?;
        if frame_end > data.len() {
            return Err(Status::Error);
        }
        let key = read_framed_bytes(&data, &mut offset, frame_end)?;
        let value = read_framed_bytes(&data, &mut offset, frame_end)?;
        if offset != frame_end {
            return Err(Status::Error);
        }
        writer.add(&key, &RawStringValue::new(value).encode())?;
    }
    writer.finish(0)
}

fn read_u32_be(data: &[u8], offset: &mut usize) -> Result<u32, Status> {
    let end = offset.checked_add(4).ok_or(Status::Error)?;
    let slice = data.get(*offset..end).ok_or(Status::Error)?;
    *offset = end;
    Ok(BigEndian::read_u32(slice))
}

fn read_framed_bytes(data: &[u8], offset: &mut usize, limit: usize) -> Result<Vec<u8>, Status> {
    let len = read_u32_be(data, offset)? as usize;
    let end = offset.checked_add(len).ok_or(Status::Error)?;
    if end > limit {
        return Err(Status::Error);
    }
    let bytes = data.get(*offset..end).ok_or(Status::Error)?.to_vec();
    *offset = end;
    Ok(bytes)
}
