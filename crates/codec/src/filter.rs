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

use laser_storage::CompactionFilter;

use crate::current_time_ms;
use crate::decode_value_header;

/// Drops any record whose stored expiration is due. Registered through the
/// store's options so compaction garbage-collects expired rows without the
/// typed layer driving it.
#[derive(Debug, Default)]
pub struct ExpireFilter;

impl CompactionFilter for ExpireFilter {
    fn name(&self) -> &str {
        "ExpireFilter"
    }

    fn filter(&self, _key: &[u8], value: &[u8]) -> bool {
        let Ok(header) = decode_value_header(value) else {
            return false;
        };
        header.expire_ms != 0 && header.expire_ms <= current_time_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawStringValue;

    #[test]
    fn test_expired_value_is_dropped() {
        let filter = ExpireFilter;

        let mut expired = RawStringValue::new(b"v".to_vec());
        expired.expire_ms = 1;
        assert!(filter.filter(b"k", &expired.encode()));

        let mut alive = RawStringValue::new(b"v".to_vec());
        alive.expire_ms = current_time_ms() + 60_000;
        assert!(!filter.filter(b"k", &alive.encode()));

        let never = RawStringValue::new(b"v".to_vec());
        assert!(!filter.filter(b"k", &never.encode()));
    }

    #[test]
    fn test_undecodable_value_is_kept() {
        let filter = ExpireFilter;
        assert!(!filter.filter(b"k", b"\xff\x00"));
        assert!(!filter.filter(b"k", b""));
    }
}
