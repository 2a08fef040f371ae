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

use laser_protos::rpc::ErrorResponse;
use laser_protos::Status;
use poem::http::StatusCode;
use poem::IntoResponse;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ServerError(pub String);

/// The JSON error envelope every failing endpoint returns: a wire-stable
/// status code plus a human-readable message.
#[derive(Debug, Clone)]
pub(crate) struct ErrorWithCode {
    inner: ErrorResponse,
}

impl ErrorWithCode {
    pub fn new(code: Status, message: impl Into<String>) -> ErrorWithCode {
        ErrorWithCode {
            inner: ErrorResponse {
                code,
                message: message.into(),
            },
        }
    }
}

pub(crate) fn http_status(code: Status) -> StatusCode {
    match code {
        Status::NotFound | Status::Empty => StatusCode::NOT_FOUND,
        Status::InvalidArgument | Status::NotSupported => StatusCode::BAD_REQUEST,
        Status::KeyExists => StatusCode::CONFLICT,
        Status::KeyExpire | Status::Expired => StatusCode::GONE,
        Status::WriteInFollower | Status::RoleError => StatusCode::FORBIDDEN,
        Status::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        Status::Busy | Status::TryAgain => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ErrorWithCode {
    fn into_response(self) -> poem::Response {
        let status = http_status(self.inner.code);
        let body =
            serde_json::to_string_pretty(&self.inner).expect("error response is always serialize");

        poem::Response::builder()
            .status(status)
            .content_type("application/json")
            .body(body)
    }
}

impl From<ErrorWithCode> for poem::Error {
    fn from(value: ErrorWithCode) -> Self {
        poem::Error::from_response(value.into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(http_status(Status::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status(Status::KeyExists), StatusCode::CONFLICT);
        assert_eq!(http_status(Status::WriteInFollower), StatusCode::FORBIDDEN);
        assert_eq!(
            http_status(Status::SourceWalLogRemoved),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
