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

/// Every fallible operation across the storage engine, the typed command
/// surface, and the replication plane reports one of these kinds. The
/// successful case is the ordinary `Result::Ok`; there is no `OK` variant.
///
/// The serialized names are the wire-level codes carried in error envelopes
/// and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Status {
    // store kinds
    #[serde(rename = "RS_NOT_FOUND")]
    #[error("not found")]
    NotFound,
    #[serde(rename = "RS_CORRUPTION")]
    #[error("corruption detected")]
    Corruption,
    #[serde(rename = "RS_NOT_SUPPORTED")]
    #[error("not supported")]
    NotSupported,
    #[serde(rename = "RS_INVALID_ARGUMENT")]
    #[error("invalid argument")]
    InvalidArgument,
    #[serde(rename = "RS_IO_ERROR")]
    #[error("io error")]
    IoError,
    #[serde(rename = "RS_MERGE_INPROGRESS")]
    #[error("merge in progress")]
    MergeInProgress,
    #[serde(rename = "RS_IN_COMPLETE")]
    #[error("incomplete")]
    Incomplete,
    #[serde(rename = "RS_SHUTDOWN_INPROGRESS")]
    #[error("shutdown in progress")]
    ShutdownInProgress,
    #[serde(rename = "RS_TIMEDOUT")]
    #[error("timed out")]
    TimedOut,
    #[serde(rename = "RS_ABORTED")]
    #[error("aborted")]
    Aborted,
    #[serde(rename = "RS_BUSY")]
    #[error("busy")]
    Busy,
    #[serde(rename = "RS_EXPIRED")]
    #[error("expired")]
    Expired,
    #[serde(rename = "RS_TRYAGAIN")]
    #[error("try again")]
    TryAgain,
    #[serde(rename = "RS_COMPACTION_TOO_LARGE")]
    #[error("compaction too large")]
    CompactionTooLarge,
    #[serde(rename = "RS_ERROR")]
    #[error("store error")]
    Error,

    // logical kinds
    #[serde(rename = "RS_WRITE_IN_FOLLOWER")]
    #[error("write rejected on follower")]
    WriteInFollower,
    #[serde(rename = "RS_KEY_EXISTS")]
    #[error("key already exists")]
    KeyExists,
    #[serde(rename = "RS_KEY_EXPIRE")]
    #[error("key has expired")]
    KeyExpire,
    #[serde(rename = "RS_EMPTY")]
    #[error("empty")]
    Empty,

    // replication kinds
    #[serde(rename = "RP_ROLE_ERROR")]
    #[error("replication role error")]
    RoleError,
    #[serde(rename = "RP_SOURCE_DB_REMOVED")]
    #[error("replication source db removed")]
    SourceDbRemoved,
    #[serde(rename = "RP_SOURCE_WAL_LOG_REMOVED")]
    #[error("replication source wal log removed")]
    SourceWalLogRemoved,
    #[serde(rename = "RP_SOURCE_READ_ERROR")]
    #[error("replication source read error")]
    SourceReadError,
}

impl Status {
    pub fn from_io(err: &std::io::Error) -> Status {
        match err.kind() {
            std::io::ErrorKind::NotFound => Status::NotFound,
            std::io::ErrorKind::InvalidData => Status::Corruption,
            std::io::ErrorKind::TimedOut => Status::TimedOut,
            std::io::ErrorKind::Interrupted => Status::TryAgain,
            _ => Status::IoError,
        }
    }

    /// Replication kinds cross the RPC boundary as typed exceptions; the rest
    /// surface as plain store/logical results.
    pub fn is_replication_error(&self) -> bool {
        matches!(
            self,
            Status::RoleError
                | Status::SourceDbRemoved
                | Status::SourceWalLogRemoved
                | Status::SourceReadError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_are_stable() {
        assert_eq!(
            serde_json::to_string(&Status::NotFound).unwrap(),
            "\"RS_NOT_FOUND\""
        );
        assert_eq!(
            serde_json::to_string(&Status::WriteInFollower).unwrap(),
            "\"RS_WRITE_IN_FOLLOWER\""
        );
        assert_eq!(
            serde_json::to_string(&Status::SourceWalLogRemoved).unwrap(),
            "\"RP_SOURCE_WAL_LOG_REMOVED\""
        );
        let round: Status = serde_json::from_str("\"RS_KEY_EXPIRE\"").unwrap();
        assert_eq!(round, Status::KeyExpire);
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Status::from_io(&err), Status::NotFound);
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(Status::from_io(&err), Status::IoError);
    }
}
