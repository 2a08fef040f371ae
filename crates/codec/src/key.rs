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

use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use laser_protos::Status;
use siphasher::sip::SipHasher13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    Default = 1,
    Composite = 2,
    TtlSort = 3,
}

impl KeyShape {
    fn from_u8(value: u8) -> Result<KeyShape, Status> {
        match value {
            1 => Ok(KeyShape::Default),
            2 => Ok(KeyShape::Composite),
            3 => Ok(KeyShape::TtlSort),
            _ => Err(Status::InvalidArgument),
        }
    }
}

/// The root key of a logical record: a primary-key tuple plus a column tuple.
///
/// Its `COMPOSITE`-shaped encoding is a byte-prefix of every child row's key,
/// which is what prefix deletes and per-type iteration rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RecordKey {
    primary_keys: Vec<Vec<u8>>,
    columns: Vec<Vec<u8>>,
}

impl RecordKey {
    pub fn new<P, C>(primary_keys: P, columns: C) -> RecordKey
    where
        P: IntoIterator,
        P::Item: Into<Vec<u8>>,
        C: IntoIterator,
        C::Item: Into<Vec<u8>>,
    {
        RecordKey {
            primary_keys: primary_keys.into_iter().map(Into::into).collect(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn primary_keys(&self) -> &[Vec<u8>] {
        &self.primary_keys
    }

    pub fn columns(&self) -> &[Vec<u8>] {
        &self.columns
    }

    /// A stable 64-bit hash of the primary-key tuple, chained so that both
    /// part order and part boundaries matter. Routing depends on this value
    /// being identical across builds and platforms.
    pub fn key_hash(&self) -> i64 {
        let mut result: i64 = 0;
        for part in &self.primary_keys {
            let mut hasher = SipHasher13::new_with_keys(result as u64, 0);
            hasher.write(part);
            result = hasher.finish() as i64;
        }
        result
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_shape(KeyShape::Default)
    }

    /// The byte-prefix shared by every COMPOSITE child of this root.
    pub fn composite_prefix(&self) -> Vec<u8> {
        self.encode_with_shape(KeyShape::Composite)
    }

    fn encode_with_shape(&self, shape: KeyShape) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(shape as u8);
        pack_u32(&mut buf, self.primary_keys.len() as u32);
        for part in &self.primary_keys {
            pack_bytes(&mut buf, part);
        }
        pack_u32(&mut buf, self.columns.len() as u32);
        for part in &self.columns {
            pack_bytes(&mut buf, part);
        }
        buf
    }

    fn encoded_len(&self) -> usize {
        9 + self
            .primary_keys
            .iter()
            .chain(self.columns.iter())
            .map(|part| 4 + part.len())
            .sum::<usize>()
    }

    pub fn decode(data: &[u8]) -> Result<RecordKey, Status> {
        let mut offset = 0usize;
        let (shape, key) = Self::decode_base(data, &mut offset)?;
        if shape != KeyShape::Default || offset != data.len() {
            return Err(Status::InvalidArgument);
        }
        Ok(key)
    }

    fn decode_base(data: &[u8], offset: &mut usize) -> Result<(KeyShape, RecordKey), Status> {
        let shape = KeyShape::from_u8(read_u8(data, offset)?)?;
        let n_pk = read_u32(data, offset)? as usize;
        let mut primary_keys = Vec::with_capacity(n_pk);
        for _ in 0..n_pk {
            primary_keys.push(read_bytes(data, offset)?);
        }
        let n_col = read_u32(data, offset)? as usize;
        let mut columns = Vec::with_capacity(n_col);
        for _ in 0..n_col {
            columns.push(read_bytes(data, offset)?);
        }
        Ok((
            shape,
            RecordKey {
                primary_keys,
                columns,
            },
        ))
    }
}

/// Hash field row key: composite prefix plus a length-prefixed field name.
/// An empty field is encoded without a suffix so it doubles as the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapFieldKey {
    pub key: RecordKey,
    pub field: Vec<u8>,
}

impl MapFieldKey {
    pub fn new(key: &RecordKey, field: impl Into<Vec<u8>>) -> MapFieldKey {
        MapFieldKey {
            key: key.clone(),
            field: field.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.key.composite_prefix();
        if !self.field.is_empty() {
            pack_bytes(&mut buf, &self.field);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<MapFieldKey, Status> {
        let (key, suffix) = decode_composite(data)?;
        let field = decode_optional_bytes(suffix)?;
        Ok(MapFieldKey { key, field })
    }
}

/// Set member row key; same layout as a hash field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMemberKey {
    pub key: RecordKey,
    pub member: Vec<u8>,
}

impl SetMemberKey {
    pub fn new(key: &RecordKey, member: impl Into<Vec<u8>>) -> SetMemberKey {
        SetMemberKey {
            key: key.clone(),
            member: member.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.key.composite_prefix();
        if !self.member.is_empty() {
            pack_bytes(&mut buf, &self.member);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<SetMemberKey, Status> {
        let (key, suffix) = decode_composite(data)?;
        let member = decode_optional_bytes(suffix)?;
        Ok(SetMemberKey { key, member })
    }
}

/// List element row key; the index suffix is big-endian so elements iterate
/// in index order within a sign class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListIndexKey {
    pub key: RecordKey,
    pub index: i64,
}

impl ListIndexKey {
    pub fn new(key: &RecordKey, index: i64) -> ListIndexKey {
        ListIndexKey {
            key: key.clone(),
            index,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.key.composite_prefix();
        pack_i64_be(&mut buf, self.index);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<ListIndexKey, Status> {
        let (key, suffix) = decode_composite(data)?;
        if suffix.len() != 8 {
            return Err(Status::InvalidArgument);
        }
        Ok(ListIndexKey {
            key,
            index: BigEndian::read_i64(suffix),
        })
    }
}

/// ZSet score-bucket row key; big-endian score suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZSetScoreKey {
    pub key: RecordKey,
    pub score: i64,
}

impl ZSetScoreKey {
    pub fn new(key: &RecordKey, score: i64) -> ZSetScoreKey {
        ZSetScoreKey {
            key: key.clone(),
            score,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.key.composite_prefix();
        pack_i64_be(&mut buf, self.score);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<ZSetScoreKey, Status> {
        let (key, suffix) = decode_composite(data)?;
        if suffix.len() != 8 {
            return Err(Status::InvalidArgument);
        }
        Ok(ZSetScoreKey {
            key,
            score: BigEndian::read_i64(suffix),
        })
    }
}

/// TTL index entry: an ascii-decimal timestamp ahead of the encoded root key
/// so entries sort by expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlSortKey {
    pub key: RecordKey,
    pub timestamp: u64,
}

impl TtlSortKey {
    pub fn new(key: &RecordKey, timestamp: u64) -> TtlSortKey {
        TtlSortKey {
            key: key.clone(),
            timestamp,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![KeyShape::TtlSort as u8];
        pack_bytes(&mut buf, self.timestamp.to_string().as_bytes());
        pack_bytes(&mut buf, &self.key.encode());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<TtlSortKey, Status> {
        let mut offset = 0usize;
        let shape = KeyShape::from_u8(read_u8(data, &mut offset)?)?;
        if shape != KeyShape::TtlSort {
            return Err(Status::InvalidArgument);
        }
        let timestamp_str = read_bytes(data, &mut offset)?;
        let timestamp = std::str::from_utf8(&timestamp_str)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(Status::InvalidArgument)?;
        let key_bytes = read_bytes(data, &mut offset)?;
        if offset != data.len() {
            return Err(Status::InvalidArgument);
        }
        let key = RecordKey::decode(&key_bytes)?;
        Ok(TtlSortKey { key, timestamp })
    }
}

fn decode_composite(data: &[u8]) -> Result<(RecordKey, &[u8]), Status> {
    let mut offset = 0usize;
    let (shape, key) = RecordKey::decode_base(data, &mut offset)?;
    if shape != KeyShape::Composite {
        return Err(Status::InvalidArgument);
    }
    Ok((key, &data[offset..]))
}

fn decode_optional_bytes(suffix: &[u8]) -> Result<Vec<u8>, Status> {
    if suffix.is_empty() {
        return Ok(Vec::new());
    }
    let mut offset = 0usize;
    let bytes = read_bytes(suffix, &mut offset)?;
    if offset != suffix.len() {
        return Err(Status::InvalidArgument);
    }
    Ok(bytes)
}

pub(crate) fn pack_u32(buf: &mut Vec<u8>, value: u32) {
    let mut scratch = [0u8; 4];
    LittleEndian::write_u32(&mut scratch, value);
    buf.extend_from_slice(&scratch);
}

pub(crate) fn pack_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    pack_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn pack_i64_be(buf: &mut Vec<u8>, value: i64) {
    let mut scratch = [0u8; 8];
    BigEndian::write_i64(&mut scratch, value);
    buf.extend_from_slice(&scratch);
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8, Status> {
    let byte = *data.get(*offset).ok_or(Status::InvalidArgument)?;
    *offset += 1;
    Ok(byte)
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, Status> {
    let end = offset.checked_add(4).ok_or(Status::InvalidArgument)?;
    let slice = data.get(*offset..end).ok_or(Status::InvalidArgument)?;
    *offset = end;
    Ok(LittleEndian::read_u32(slice))
}

pub(crate) fn read_bytes(data: &[u8], offset: &mut usize) -> Result<Vec<u8>, Status> {
    let len = read_u32(data, offset)? as usize;
    let end = offset.checked_add(len).ok_or(Status::InvalidArgument)?;
    let slice = data.get(*offset..end).ok_or(Status::InvalidArgument)?;
    *offset = end;
    Ok(slice.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RecordKey {
        RecordKey::new(vec![b"user".to_vec(), b"1001".to_vec()], vec![b"profile".to_vec()])
    }

    #[test]
    fn test_record_key_round_trip() {
        let key = key();
        let encoded = key.encode();
        assert_eq!(encoded[0], KeyShape::Default as u8);
        assert_eq!(RecordKey::decode(&encoded).unwrap(), key);

        let empty = RecordKey::new(Vec::<Vec<u8>>::new(), Vec::<Vec<u8>>::new());
        assert_eq!(RecordKey::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_decode_rejects_truncation_and_shape() {
        let encoded = key().encode();
        for cut in 1..encoded.len() {
            assert!(RecordKey::decode(&encoded[..cut]).is_err());
        }

        let mut wrong_shape = encoded.clone();
        wrong_shape[0] = 9;
        assert_eq!(
            RecordKey::decode(&wrong_shape).unwrap_err(),
            Status::InvalidArgument
        );

        // a composite child must not decode as a root
        let child = MapFieldKey::new(&key(), b"f".to_vec()).encode();
        assert!(RecordKey::decode(&child).is_err());
    }

    #[test]
    fn test_composite_prefix_contains_children() {
        let key = key();
        let prefix = key.composite_prefix();

        let field = MapFieldKey::new(&key, b"field".to_vec()).encode();
        let member = SetMemberKey::new(&key, b"member".to_vec()).encode();
        let index = ListIndexKey::new(&key, -3).encode();
        let score = ZSetScoreKey::new(&key, 42).encode();
        for child in [&field, &member, &index, &score] {
            assert!(child.starts_with(&prefix));
        }

        // the root's own key differs at the shape byte, so a prefix delete
        // over the composite range never touches it
        assert!(!key.encode().starts_with(&prefix));
    }

    #[test]
    fn test_composite_round_trips() {
        let key = key();

        let field = MapFieldKey::new(&key, b"f0".to_vec());
        assert_eq!(MapFieldKey::decode(&field.encode()).unwrap(), field);

        let empty_field = MapFieldKey::new(&key, Vec::new());
        let decoded = MapFieldKey::decode(&empty_field.encode()).unwrap();
        assert!(decoded.field.is_empty());

        let member = SetMemberKey::new(&key, b"m".to_vec());
        assert_eq!(SetMemberKey::decode(&member.encode()).unwrap(), member);

        for index in [i64::MIN, -1, 0, 1, i64::MAX] {
            let index_key = ListIndexKey::new(&key, index);
            assert_eq!(ListIndexKey::decode(&index_key.encode()).unwrap(), index_key);
        }

        for score in [i64::MIN, -2_000_000, -1, 0, 3, i64::MAX] {
            let score_key = ZSetScoreKey::new(&key, score);
            assert_eq!(ZSetScoreKey::decode(&score_key.encode()).unwrap(), score_key);
        }
    }

    #[test]
    fn test_big_endian_suffix_orders_within_sign_class() {
        let key = key();
        let enc = |score: i64| ZSetScoreKey::new(&key, score).encode();

        // non-negative scores ascend in byte order
        assert!(enc(0) < enc(1));
        assert!(enc(1) < enc(3));
        assert!(enc(3) < enc(i64::MAX));
        // negative scores ascend in byte order among themselves
        assert!(enc(i64::MIN) < enc(-2_000_000));
        assert!(enc(-2_000_000) < enc(-1_000_000));
        assert!(enc(-1_000_000) < enc(-1));
        // the negative class sorts after the non-negative class
        assert!(enc(i64::MAX) < enc(-1));
    }

    #[test]
    fn test_ttl_sort_key_round_trip() {
        let key = key();
        let ttl_key = TtlSortKey::new(&key, 1700000000123);
        let encoded = ttl_key.encode();
        assert_eq!(encoded[0], KeyShape::TtlSort as u8);
        assert_eq!(TtlSortKey::decode(&encoded).unwrap(), ttl_key);
    }

    #[test]
    fn test_key_hash_is_stable_and_discriminating() {
        let a = RecordKey::new(vec![b"a".to_vec(), b"b".to_vec()], Vec::<Vec<u8>>::new());
        assert_eq!(a.key_hash(), a.key_hash());

        let reversed = RecordKey::new(vec![b"b".to_vec(), b"a".to_vec()], Vec::<Vec<u8>>::new());
        assert_ne!(a.key_hash(), reversed.key_hash());

        let joined = RecordKey::new(vec![b"ab".to_vec()], Vec::<Vec<u8>>::new());
        assert_ne!(a.key_hash(), joined.key_hash());

        // columns do not participate in routing
        let with_columns = RecordKey::new(vec![b"a".to_vec(), b"b".to_vec()], vec![b"c".to_vec()]);
        assert_eq!(a.key_hash(), with_columns.key_hash());
    }
}
