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

//! Typed key and value encodings.
//!
//! Keys come in three shapes sharing one leading shape byte: `DEFAULT` roots,
//! `COMPOSITE` children (root bytes re-shaped plus a type-specific suffix),
//! and `TTL_SORT` index entries. Values carry a type tag and an expiration
//! stamp ahead of the payload. Integer fields are little-endian except the
//! list-index and zset-score suffixes, which are big-endian so byte order
//! matches numeric order within a sign class.

mod key;
pub use key::ListIndexKey;
pub use key::KeyShape;
pub use key::MapFieldKey;
pub use key::RecordKey;
pub use key::SetMemberKey;
pub use key::TtlSortKey;
pub use key::ZSetScoreKey;

mod value;
pub use value::decode_value_header;
pub use value::CounterValue;
pub use value::ListMeta;
pub use value::MapMeta;
pub use value::RawStringValue;
pub use value::SetMeta;
pub use value::ValueHeader;
pub use value::ValueTag;
pub use value::ZSetBucket;
pub use value::ZSetMeta;

mod filter;
pub use filter::ExpireFilter;

pub(crate) fn current_time_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
