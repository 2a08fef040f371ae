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

use std::fs::File;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use laser_protos::Status;

// Table files are the store's external-file format: the persisted live set,
// checkpoints, dumps, and converted ingest files all use it.
//
// magic(4) ‖ version(4 LE) ‖ records ‖ count(8 LE) ‖ max_seq(8 LE) ‖
// crc32(4 LE, records region) ‖ magic(4)
//
// record: key_len(4 LE) ‖ key ‖ val_len(4 LE) ‖ val
const TABLE_MAGIC: &[u8; 4] = b"LSTB";
const TABLE_VERSION: u32 = 1;
const FOOTER_LEN: usize = 24;
const HEADER_LEN: usize = 8;

pub struct TableWriter {
    writer: BufWriter<File>,
    path: std::path::PathBuf,
    count: u64,
    crc: crc32fast::Hasher,
}

impl TableWriter {
    pub fn create(path: &Path) -> Result<TableWriter, Status> {
        let file = File::create(path).map_err(|err| {
            log::error!(err:?; "failed to create table file: {}", path.display());
            Status::from_io(&err)
        })?;
        let mut writer = BufWriter::new(file);
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(TABLE_MAGIC);
        LittleEndian::write_u32(&mut header[4..8], TABLE_VERSION);
        writer
            .write_all(&header)
            .map_err(|err| Status::from_io(&err))?;
        Ok(TableWriter {
            writer,
            path: path.to_path_buf(),
            count: 0,
            crc: crc32fast::Hasher::new(),
        })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), Status> {
        let mut scratch = [0u8; 4];
        let mut record = Vec::with_capacity(8 + key.len() + value.len());
        LittleEndian::write_u32(&mut scratch, key.len() as u32);
        record.extend_from_slice(&scratch);
        record.extend_from_slice(key);
        LittleEndian::write_u32(&mut scratch, value.len() as u32);
        record.extend_from_slice(&scratch);
        record.extend_from_slice(value);

        self.writer.write_all(&record).map_err(|err| {
            log::error!(err:?; "failed to write table record: {}", self.path.display());
            Status::from_io(&err)
        })?;
        self.crc.update(&record);
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Seals the file, stamping the sequence number the records are current
    /// up to.
    pub fn finish(mut self, max_seq: u64) -> Result<(), Status> {
        let mut footer = [0u8; FOOTER_LEN];
        LittleEndian::write_u64(&mut footer[0..8], self.count);
        LittleEndian::write_u64(&mut footer[8..16], max_seq);
        LittleEndian::write_u32(&mut footer[16..20], self.crc.finalize());
        footer[20..24].copy_from_slice(TABLE_MAGIC);
        self.writer
            .write_all(&footer)
            .map_err(|err| Status::from_io(&err))?;
        self.writer.flush().map_err(|err| Status::from_io(&err))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|err| Status::from_io(&err))?;
        Ok(())
    }
}

/// Loads a whole table file, validating magic, CRC, and record count.
pub fn read_table_file(path: &Path) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, u64), Status> {
    let mut file = File::open(path).map_err(|err| {
        log::error!(err:?; "failed to open table file: {}", path.display());
        Status::from_io(&err)
    })?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|err| Status::from_io(&err))?;

    if data.len() < HEADER_LEN + FOOTER_LEN
        || &data[0..4] != TABLE_MAGIC
        || LittleEndian::read_u32(&data[4..8]) != TABLE_VERSION
    {
        return Err(Status::Corruption);
    }
    let footer_start = data.len() - FOOTER_LEN;
    let footer = &data[footer_start..];
    if &footer[20..24] != TABLE_MAGIC {
        return Err(Status::Corruption);
    }
    let count = LittleEndian::read_u64(&footer[0..8]);
    let max_seq = LittleEndian::read_u64(&footer[8..16]);
    let expected_crc = LittleEndian::read_u32(&footer[16..20]);

    let records_region = &data[HEADER_LEN..footer_start];
    if crc32fast::hash(records_region) != expected_crc {
        return Err(Status::Corruption);
    }

    let mut records = Vec::with_capacity(count as usize);
    let mut offset = 0usize;
    while offset < records_region.len() {
        let key = read_sized(records_region, &mut offset)?;
        let value = read_sized(records_region, &mut offset)?;
        records.push((key, value));
    }
    if records.len() as u64 != count {
        return Err(Status::Corruption);
    }
    Ok((records, max_seq))
}

fn read_sized(data: &[u8], offset: &mut usize) -> Result<Vec<u8>, Status> {
    let end = offset.checked_add(4).ok_or(Status::Corruption)?;
    let len = LittleEndian::read_u32(data.get(*offset..end).ok_or(Status::Corruption)?) as usize;
    *offset = end;
    let end = offset.checked_add(len).ok_or(Status::Corruption)?;
    let bytes = data.get(*offset..end).ok_or(Status::Corruption)?.to_vec();
    *offset = end;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table-1.tab");

        let mut writer = TableWriter::create(&path).unwrap();
        writer.add(b"a", b"1").unwrap();
        writer.add(b"b", b"").unwrap();
        writer.add(b"c", b"333").unwrap();
        writer.finish(17).unwrap();

        let (records, max_seq) = read_table_file(&path).unwrap();
        assert_eq!(max_seq, 17);
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], (b"b".to_vec(), b"".to_vec()));
    }

    #[test]
    fn test_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table-0.tab");
        TableWriter::create(&path).unwrap().finish(0).unwrap();

        let (records, max_seq) = read_table_file(&path).unwrap();
        assert!(records.is_empty());
        assert_eq!(max_seq, 0);
    }

    #[test]
    fn test_corrupt_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table-2.tab");
        let mut writer = TableWriter::create(&path).unwrap();
        writer.add(b"key", b"value").unwrap();
        writer.finish(3).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data[HEADER_LEN + 2] ^= 0x01;
        std::fs::write(&path, &data).unwrap();
        assert_eq!(read_table_file(&path).unwrap_err(), Status::Corruption);
    }

    #[test]
    fn test_not_a_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus");
        std::fs::write(&path, b"not a table at all").unwrap();
        assert_eq!(read_table_file(&path).unwrap_err(), Status::Corruption);
    }
}
