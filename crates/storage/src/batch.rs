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

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use laser_protos::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// An atomic multi-record write. The serialized form is also the raw batch
/// payload shipped to followers, so it must stay stable:
/// `count(4 LE)` then per record `op(1) ‖ key_len(4 LE) ‖ key` and for puts
/// `val_len(4 LE) ‖ val`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch { ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn data_size(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => 9 + key.len() + value.len(),
                BatchOp::Delete { key } => 5 + key.len(),
            })
            .sum::<usize>()
            + 4
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data_size());
        let mut scratch = [0u8; 4];
        LittleEndian::write_u32(&mut scratch, self.ops.len() as u32);
        buf.extend_from_slice(&scratch);
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    buf.push(OP_PUT);
                    LittleEndian::write_u32(&mut scratch, key.len() as u32);
                    buf.extend_from_slice(&scratch);
                    buf.extend_from_slice(key);
                    LittleEndian::write_u32(&mut scratch, value.len() as u32);
                    buf.extend_from_slice(&scratch);
                    buf.extend_from_slice(value);
                }
                BatchOp::Delete { key } => {
                    buf.push(OP_DELETE);
                    LittleEndian::write_u32(&mut scratch, key.len() as u32);
                    buf.extend_from_slice(&scratch);
                    buf.extend_from_slice(key);
                }
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<WriteBatch, Status> {
        let mut offset = 0usize;
        let count = read_u32(data, &mut offset)? as usize;
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            let op = *data.get(offset).ok_or(Status::Corruption)?;
            offset += 1;
            let key = read_bytes(data, &mut offset)?;
            match op {
                OP_PUT => {
                    let value = read_bytes(data, &mut offset)?;
                    ops.push(BatchOp::Put { key, value });
                }
                OP_DELETE => ops.push(BatchOp::Delete { key }),
                _ => return Err(Status::Corruption),
            }
        }
        if offset != data.len() {
            return Err(Status::Corruption);
        }
        Ok(WriteBatch { ops })
    }
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, Status> {
    let end = offset.checked_add(4).ok_or(Status::Corruption)?;
    let slice = data.get(*offset..end).ok_or(Status::Corruption)?;
    *offset = end;
    Ok(LittleEndian::read_u32(slice))
}

fn read_bytes(data: &[u8], offset: &mut usize) -> Result<Vec<u8>, Status> {
    let len = read_u32(data, offset)? as usize;
    let end = offset.checked_add(len).ok_or(Status::Corruption)?;
    let slice = data.get(*offset..end).ok_or(Status::Corruption)?;
    *offset = end;
    Ok(slice.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut batch = WriteBatch::new();
        batch.put(b"alpha".to_vec(), b"1".to_vec());
        batch.delete(b"beta".to_vec());
        batch.put(b"".to_vec(), b"".to_vec());

        let encoded = batch.encode();
        let decoded = WriteBatch::decode(&encoded).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let mut batch = WriteBatch::new();
        batch.put(b"key".to_vec(), b"value".to_vec());
        let encoded = batch.encode();

        for cut in 1..encoded.len() {
            assert_eq!(
                WriteBatch::decode(&encoded[..cut]).unwrap_err(),
                Status::Corruption
            );
        }
    }

    #[test]
    fn test_decode_rejects_trailing_garbage() {
        let mut encoded = WriteBatch::new().encode();
        encoded.push(0xff);
        assert_eq!(WriteBatch::decode(&encoded).unwrap_err(), Status::Corruption);
    }
}
