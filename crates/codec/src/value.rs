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

use crate::key::pack_bytes;
use crate::key::pack_u32;
use crate::key::read_bytes;
use crate::key::read_u32;
use crate::key::read_u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    RawString = 1,
    Counter = 2,
    Map = 3,
    List = 4,
    Set = 5,
    ZSet = 6,
}

impl ValueTag {
    pub fn from_u8(value: u8) -> Result<ValueTag, Status> {
        match value {
            1 => Ok(ValueTag::RawString),
            2 => Ok(ValueTag::Counter),
            3 => Ok(ValueTag::Map),
            4 => Ok(ValueTag::List),
            5 => Ok(ValueTag::Set),
            6 => Ok(ValueTag::ZSet),
            _ => Err(Status::InvalidArgument),
        }
    }
}

/// The leading `type-tag(1) ‖ expire-ms(8 LE)` every stored value carries.
/// `expire_ms == 0` means the value never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueHeader {
    pub tag: ValueTag,
    pub expire_ms: u64,
}

/// Decodes only the shared header; used by the compaction filter and by
/// operations that dispatch on the stored type without reading the payload.
pub fn decode_value_header(data: &[u8]) -> Result<ValueHeader, Status> {
    let mut offset = 0usize;
    let header = read_header(data, &mut offset)?;
    Ok(header)
}

fn read_header(data: &[u8], offset: &mut usize) -> Result<ValueHeader, Status> {
    let tag = ValueTag::from_u8(read_u8(data, offset)?)?;
    let end = offset.checked_add(8).ok_or(Status::InvalidArgument)?;
    let slice = data.get(*offset..end).ok_or(Status::InvalidArgument)?;
    *offset = end;
    Ok(ValueHeader {
        tag,
        expire_ms: LittleEndian::read_u64(slice),
    })
}

fn encode_header(buf: &mut Vec<u8>, tag: ValueTag, expire_ms: u64) {
    buf.push(tag as u8);
    let mut scratch = [0u8; 8];
    LittleEndian::write_u64(&mut scratch, expire_ms);
    buf.extend_from_slice(&scratch);
}

fn expect_tag(data: &[u8], offset: &mut usize, expected: ValueTag) -> Result<u64, Status> {
    let header = read_header(data, offset)?;
    if header.tag != expected {
        return Err(Status::InvalidArgument);
    }
    Ok(header.expire_ms)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStringValue {
    pub value: Vec<u8>,
    pub expire_ms: u64,
}

impl RawStringValue {
    pub fn new(value: impl Into<Vec<u8>>) -> RawStringValue {
        RawStringValue {
            value: value.into(),
            expire_ms: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13 + self.value.len());
        encode_header(&mut buf, ValueTag::RawString, self.expire_ms);
        if !self.value.is_empty() {
            pack_bytes(&mut buf, &self.value);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<RawStringValue, Status> {
        let mut offset = 0usize;
        let expire_ms = expect_tag(data, &mut offset, ValueTag::RawString)?;
        let value = if offset == data.len() {
            Vec::new()
        } else {
            let bytes = read_bytes(data, &mut offset)?;
            if offset != data.len() {
                return Err(Status::InvalidArgument);
            }
            bytes
        };
        Ok(RawStringValue { value, expire_ms })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub value: i64,
    pub expire_ms: u64,
}

impl CounterValue {
    pub fn new(value: i64) -> CounterValue {
        CounterValue {
            value,
            expire_ms: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        encode_header(&mut buf, ValueTag::Counter, self.expire_ms);
        let mut scratch = [0u8; 8];
        LittleEndian::write_i64(&mut scratch, self.value);
        buf.extend_from_slice(&scratch);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<CounterValue, Status> {
        let mut offset = 0usize;
        let expire_ms = expect_tag(data, &mut offset, ValueTag::Counter)?;
        let end = offset.checked_add(8).ok_or(Status::InvalidArgument)?;
        let slice = data.get(offset..end).ok_or(Status::InvalidArgument)?;
        if end != data.len() {
            return Err(Status::InvalidArgument);
        }
        Ok(CounterValue {
            value: LittleEndian::read_i64(slice),
            expire_ms,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapMeta {
    pub size: u32,
    pub expire_ms: u64,
}

impl MapMeta {
    pub fn encode(&self) -> Vec<u8> {
        encode_sized_meta(ValueTag::Map, self.size, self.expire_ms)
    }

    pub fn decode(data: &[u8]) -> Result<MapMeta, Status> {
        let (size, expire_ms) = decode_sized_meta(data, ValueTag::Map)?;
        Ok(MapMeta { size, expire_ms })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetMeta {
    pub size: u32,
    pub expire_ms: u64,
}

impl SetMeta {
    pub fn encode(&self) -> Vec<u8> {
        encode_sized_meta(ValueTag::Set, self.size, self.expire_ms)
    }

    pub fn decode(data: &[u8]) -> Result<SetMeta, Status> {
        let (size, expire_ms) = decode_sized_meta(data, ValueTag::Set)?;
        Ok(SetMeta { size, expire_ms })
    }
}

/// ZSet meta counts live score buckets, not members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZSetMeta {
    pub size: u32,
    pub expire_ms: u64,
}

impl ZSetMeta {
    pub fn encode(&self) -> Vec<u8> {
        encode_sized_meta(ValueTag::ZSet, self.size, self.expire_ms)
    }

    pub fn decode(data: &[u8]) -> Result<ZSetMeta, Status> {
        let (size, expire_ms) = decode_sized_meta(data, ValueTag::ZSet)?;
        Ok(ZSetMeta { size, expire_ms })
    }
}

fn encode_sized_meta(tag: ValueTag, size: u32, expire_ms: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13);
    encode_header(&mut buf, tag, expire_ms);
    pack_u32(&mut buf, size);
    buf
}

fn decode_sized_meta(data: &[u8], tag: ValueTag) -> Result<(u32, u64), Status> {
    let mut offset = 0usize;
    let expire_ms = expect_tag(data, &mut offset, tag)?;
    let size = read_u32(data, &mut offset)?;
    if offset != data.len() {
        return Err(Status::InvalidArgument);
    }
    Ok((size, expire_ms))
}

/// List meta. `start` and `end` are exclusive fenceposts: the live indices
/// are `(start, end)` and the list is empty exactly when `start == end`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMeta {
    pub start: i64,
    pub end: i64,
    pub expire_ms: u64,
}

impl ListMeta {
    pub fn size(&self) -> i64 {
        debug_assert!(self.end >= self.start);
        if self.end == self.start {
            0
        } else {
            self.end - self.start - 1
        }
    }

    /// Returns the index the new front element is stored at.
    pub fn push_front(&mut self) -> i64 {
        if self.start == self.end {
            self.end += 1;
        }
        let index = self.start;
        self.start -= 1;
        index
    }

    /// Returns the index the new back element is stored at.
    pub fn push_back(&mut self) -> i64 {
        if self.start == self.end {
            self.start -= 1;
        }
        let index = self.end;
        self.end += 1;
        index
    }

    /// Returns the index of the element removed from the front.
    pub fn pop_front(&mut self) -> i64 {
        self.start += 1;
        self.start
    }

    /// Returns the index of the element removed from the back.
    pub fn pop_back(&mut self) -> i64 {
        self.end -= 1;
        self.end
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(25);
        encode_header(&mut buf, ValueTag::List, self.expire_ms);
        let mut scratch = [0u8; 8];
        LittleEndian::write_i64(&mut scratch, self.start);
        buf.extend_from_slice(&scratch);
        LittleEndian::write_i64(&mut scratch, self.end);
        buf.extend_from_slice(&scratch);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<ListMeta, Status> {
        let mut offset = 0usize;
        let expire_ms = expect_tag(data, &mut offset, ValueTag::List)?;
        let end_offset = offset.checked_add(16).ok_or(Status::InvalidArgument)?;
        let slice = data.get(offset..end_offset).ok_or(Status::InvalidArgument)?;
        if end_offset != data.len() {
            return Err(Status::InvalidArgument);
        }
        Ok(ListMeta {
            start: LittleEndian::read_i64(&slice[0..8]),
            end: LittleEndian::read_i64(&slice[8..16]),
            expire_ms,
        })
    }
}

/// The member list stored under one score bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZSetBucket {
    pub members: Vec<Vec<u8>>,
    pub expire_ms: u64,
}

impl ZSetBucket {
    pub fn contains(&self, member: &[u8]) -> bool {
        self.members.iter().any(|m| m == member)
    }

    pub fn add_member(&mut self, member: impl Into<Vec<u8>>) {
        self.members.push(member.into());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_header(&mut buf, ValueTag::ZSet, self.expire_ms);
        pack_u32(&mut buf, self.members.len() as u32);
        for member in &self.members {
            pack_bytes(&mut buf, member);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<ZSetBucket, Status> {
        let mut offset = 0usize;
        let expire_ms = expect_tag(data, &mut offset, ValueTag::ZSet)?;
        let count = read_u32(data, &mut offset)? as usize;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(read_bytes(data, &mut offset)?);
        }
        if offset != data.len() {
            return Err(Status::InvalidArgument);
        }
        Ok(ZSetBucket { members, expire_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_string_round_trip() {
        let mut value = RawStringValue::new(b"data".to_vec());
        value.expire_ms = 1700000000000;
        assert_eq!(RawStringValue::decode(&value.encode()).unwrap(), value);

        let empty = RawStringValue::new(Vec::new());
        let decoded = RawStringValue::decode(&empty.encode()).unwrap();
        assert!(decoded.value.is_empty());
        assert_eq!(decoded.expire_ms, 0);
    }

    #[test]
    fn test_counter_round_trip() {
        for value in [i64::MIN, -2000, 0, 1001, i64::MAX] {
            let counter = CounterValue::new(value);
            assert_eq!(CounterValue::decode(&counter.encode()).unwrap(), counter);
        }
    }

    #[test]
    fn test_tag_mismatch_is_rejected() {
        let counter = CounterValue::new(5).encode();
        assert_eq!(
            RawStringValue::decode(&counter).unwrap_err(),
            Status::InvalidArgument
        );
        let string = RawStringValue::new(b"x".to_vec()).encode();
        assert_eq!(
            CounterValue::decode(&string).unwrap_err(),
            Status::InvalidArgument
        );
        assert_eq!(
            MapMeta::decode(&SetMeta::default().encode()).unwrap_err(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn test_header_decode() {
        let mut value = RawStringValue::new(b"v".to_vec());
        value.expire_ms = 42;
        let header = decode_value_header(&value.encode()).unwrap();
        assert_eq!(header.tag, ValueTag::RawString);
        assert_eq!(header.expire_ms, 42);

        assert!(decode_value_header(&[9, 0, 0]).is_err());
    }

    #[test]
    fn test_sized_meta_round_trips() {
        let map = MapMeta {
            size: 10,
            expire_ms: 5,
        };
        assert_eq!(MapMeta::decode(&map.encode()).unwrap(), map);

        let set = SetMeta {
            size: 3,
            expire_ms: 0,
        };
        assert_eq!(SetMeta::decode(&set.encode()).unwrap(), set);

        let zset = ZSetMeta {
            size: 4,
            expire_ms: 9,
        };
        assert_eq!(ZSetMeta::decode(&zset.encode()).unwrap(), zset);
    }

    #[test]
    fn test_list_meta_push_pop_rules() {
        let mut meta = ListMeta::default();
        assert_eq!(meta.size(), 0);

        // push_front on an empty list stores at index 0
        assert_eq!(meta.push_front(), 0);
        assert_eq!((meta.start, meta.end), (-1, 1));
        assert_eq!(meta.size(), 1);

        assert_eq!(meta.push_front(), -1);
        assert_eq!(meta.push_back(), 1);
        assert_eq!(meta.size(), 3);

        // pops return the index that was occupied
        assert_eq!(meta.pop_front(), -1);
        assert_eq!(meta.pop_back(), 1);
        assert_eq!(meta.pop_front(), 0);
        assert_eq!(meta.size(), 0);
        assert_eq!(meta.start, meta.end);

        // push_back on an empty list stores at the shared fencepost
        let mut meta = ListMeta::default();
        assert_eq!(meta.push_back(), 0);
        assert_eq!((meta.start, meta.end), (-1, 1));

        let round = ListMeta::decode(&meta.encode()).unwrap();
        assert_eq!(round, meta);
    }

    #[test]
    fn test_zset_bucket_round_trip() {
        let mut bucket = ZSetBucket::default();
        bucket.add_member(b"one".to_vec());
        bucket.add_member(b"two".to_vec());
        bucket.expire_ms = 77;

        assert!(bucket.contains(b"one"));
        assert!(!bucket.contains(b"three"));
        assert_eq!(ZSetBucket::decode(&bucket.encode()).unwrap(), bucket);
    }
}
