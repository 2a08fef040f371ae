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
use std::path::PathBuf;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use laser_protos::Status;

/// One appended write batch. `first_seq` is the sequence of the batch's first
/// record; the batch occupies `[first_seq, first_seq + count - 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub first_seq: u64,
    pub count: u32,
    pub write_ms: u64,
    pub payload: Vec<u8>,
}

impl WalRecord {
    pub fn last_seq(&self) -> u64 {
        self.first_seq + u64::from(self.count) - 1
    }

    pub fn next_seq(&self) -> u64 {
        self.first_seq + u64::from(self.count)
    }
}

// frame: len(4 LE) ‖ crc32(4 LE) ‖ first_seq(8 LE) ‖ count(4 LE) ‖
//        write_ms(8 LE) ‖ payload; crc covers everything after itself.
const FRAME_HEADER_LEN: usize = 8;
const BODY_FIXED_LEN: usize = 20;

fn encode_record(record: &WalRecord) -> Vec<u8> {
    let body_len = BODY_FIXED_LEN + record.payload.len();
    let mut buf = vec![0u8; FRAME_HEADER_LEN + body_len];
    LittleEndian::write_u32(&mut buf[0..4], body_len as u32);
    LittleEndian::write_u64(&mut buf[8..16], record.first_seq);
    LittleEndian::write_u32(&mut buf[16..20], record.count);
    LittleEndian::write_u64(&mut buf[20..28], record.write_ms);
    buf[28..].copy_from_slice(&record.payload);
    let crc = crc32fast::hash(&buf[8..]);
    LittleEndian::write_u32(&mut buf[4..8], crc);
    buf
}

pub(crate) fn segment_file_name(first_seq: u64) -> String {
    format!("wal-{first_seq:020}.log")
}

pub(crate) fn parse_segment_file_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("wal-")?.strip_suffix(".log")?;
    rest.parse::<u64>().ok()
}

pub(crate) struct WalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl WalWriter {
    pub fn create(dir: &Path, first_seq: u64) -> Result<WalWriter, Status> {
        let path = dir.join(segment_file_name(first_seq));
        let file = File::create(&path).map_err(|err| {
            log::error!(err:?; "failed to create wal segment: {}", path.display());
            Status::from_io(&err)
        })?;
        Ok(WalWriter {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<(), Status> {
        let frame = encode_record(record);
        self.writer.write_all(&frame).map_err(|err| {
            log::error!(err:?; "failed to append wal record: {}", self.path.display());
            Status::from_io(&err)
        })?;
        self.writer.flush().map_err(|err| Status::from_io(&err))?;
        self.written += frame.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Reads every intact record of a segment. A torn or corrupt tail ends the
/// scan instead of failing recovery.
pub(crate) fn read_segment(path: &Path) -> Result<Vec<WalRecord>, Status> {
    let mut file = File::open(path).map_err(|err| Status::from_io(&err))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|err| Status::from_io(&err))?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset + FRAME_HEADER_LEN <= data.len() {
        let body_len = LittleEndian::read_u32(&data[offset..offset + 4]) as usize;
        let crc = LittleEndian::read_u32(&data[offset + 4..offset + 8]);
        let body_start = offset + FRAME_HEADER_LEN;
        let body_end = body_start + body_len;
        if body_len < BODY_FIXED_LEN || body_end > data.len() {
            log::warn!("dropping torn wal tail at offset {offset}: {}", path.display());
            break;
        }
        let body = &data[body_start..body_end];
        if crc32fast::hash(body) != crc {
            log::warn!("dropping corrupt wal tail at offset {offset}: {}", path.display());
            break;
        }
        records.push(WalRecord {
            first_seq: LittleEndian::read_u64(&body[0..8]),
            count: LittleEndian::read_u32(&body[8..12]),
            write_ms: LittleEndian::read_u64(&body[12..20]),
            payload: body[BODY_FIXED_LEN..].to_vec(),
        });
        offset = body_end;
    }
    Ok(records)
}
