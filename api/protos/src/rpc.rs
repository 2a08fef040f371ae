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

use serde::Deserialize;
use serde::Serialize;

use crate::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicateType {
    #[serde(rename = "FORWARD")]
    Forward,
    #[serde(rename = "REVERSE")]
    Reverse,
}

/// A follower's request for the leader's WAL tail.
///
/// `seq_no` is the follower's latest applied sequence number; the leader
/// replies with batches starting at `seq_no + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub db_hash: i64,
    pub seq_no: u64,
    pub max_wait_ms: u64,
    pub max_size: u64,
    pub max_count: u64,
    #[serde(rename = "type")]
    pub replicate_type: ReplicateType,
    pub version: String,
    pub node_hash: i64,
    pub client_address: String,
    pub timestamp: i64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ReplicateUpdate {
    /// One serialized write batch, base64 encoded on the wire.
    pub raw_data: String,
    /// Wall-clock milliseconds the batch was written on the leader.
    pub timestamp: i64,
}

impl std::fmt::Debug for ReplicateUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicateUpdate")
            .field("raw_data_len", &self.raw_data.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub version: String,
    pub updates: Vec<ReplicateUpdate>,
    pub max_seq_no: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateWdtRequest {
    pub db_hash: i64,
    pub version: String,
    pub wdt_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateWdtResponse {
    pub send_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: Status,
    pub message: String,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// One typed command addressed to a partition by its record key. Fields
/// beyond the key are per-command; unused ones are omitted on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvRequest {
    pub database: String,
    pub table: String,
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_scores: Option<std::collections::BTreeMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_exists: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreMember {
    pub score: i64,
    pub member: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_members: Option<Vec<ScoreMember>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerBaseRequest {
    pub database: String,
    pub table: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDeltaRequest {
    pub database: String,
    pub table: String,
    pub base_version: String,
    pub delta_versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceBaseReplicationRequest {
    pub database: String,
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableShardsRequest {
    pub shard_ids: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicate_request_field_names() {
        let request = ReplicateRequest {
            db_hash: 7,
            seq_no: 42,
            max_wait_ms: 1000,
            max_size: 1 << 20,
            max_count: 500,
            replicate_type: ReplicateType::Forward,
            version: "base-1".to_string(),
            node_hash: -3,
            client_address: "127.0.0.1:8000".to_string(),
            timestamp: 12345,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "FORWARD");
        assert_eq!(json["seq_no"], 42);
        assert_eq!(json["db_hash"], 7);
    }

    #[test]
    fn test_wdt_request_field_names() {
        let request = ReplicateWdtRequest {
            db_hash: 1,
            version: "v".to_string(),
            wdt_url: "file:///tmp/stage".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("wdt_url").is_some());
        let response = ReplicateWdtResponse { send_success: true };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["send_success"], true);
    }
}
