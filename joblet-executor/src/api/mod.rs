// Copyright 2024-2025 Joblet Contributors
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

//! The typed control surface the RPC layer mounts: one API struct per
//! area, service errors mapped to status codes, internal detail kept
//! in the logs.

pub mod jobs;
pub mod networks;
pub mod runtimes;
pub mod volumes;
pub mod workflows;

use joblet_common::error::{ErrorKind, JobletError};
use joblet_common::SafeDisplay;
use tracing::error;

/// Status codes in the gRPC numbering, which the wire layer forwards
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Internal = 13,
    Unavailable = 14,
    Unknown = 2,
}

#[derive(Debug)]
pub struct ApiError {
    pub code: StatusCode,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError {
            code: StatusCode::NotFound,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<JobletError> for ApiError {
    fn from(err: JobletError) -> Self {
        let code = match err.kind {
            ErrorKind::Validation => StatusCode::InvalidArgument,
            ErrorKind::NotFound => StatusCode::NotFound,
            ErrorKind::AlreadyExists => StatusCode::AlreadyExists,
            ErrorKind::Conflict => StatusCode::FailedPrecondition,
            ErrorKind::ResourceExhausted => StatusCode::ResourceExhausted,
            ErrorKind::Timeout => StatusCode::DeadlineExceeded,
            ErrorKind::Permission => StatusCode::PermissionDenied,
            ErrorKind::Infrastructure => StatusCode::Internal,
            ErrorKind::BackendUnavailable => StatusCode::Unavailable,
            ErrorKind::Unknown => StatusCode::Unknown,
        };
        if err.severity() >= joblet_common::error::Severity::High {
            error!(kind = %err.kind, "{}", err.to_safe_string());
        }
        ApiError {
            code,
            message: err.to_safe_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn kinds_map_to_the_wire_status_codes() {
        let cases = [
            (JobletError::validation("x"), StatusCode::InvalidArgument),
            (JobletError::not_found("job", "y"), StatusCode::NotFound),
            (JobletError::already_exists("volume", "z"), StatusCode::AlreadyExists),
            (JobletError::conflict("busy"), StatusCode::FailedPrecondition),
            (JobletError::resource_exhausted("loops"), StatusCode::ResourceExhausted),
            (JobletError::timeout("grace"), StatusCode::DeadlineExceeded),
            (JobletError::permission("mount"), StatusCode::PermissionDenied),
            (JobletError::infrastructure("fork"), StatusCode::Internal),
            (JobletError::backend_unavailable("dynamo"), StatusCode::Unavailable),
            (JobletError::unknown("?"), StatusCode::Unknown),
        ];
        for (error, expected) in cases {
            let api_error: ApiError = error.into();
            assert_eq!(api_error.code, expected);
        }
    }

    #[test]
    fn retryable_flag_survives_the_mapping() {
        let api_error: ApiError = JobletError::backend_unavailable("dynamo").into();
        assert!(api_error.retryable);
        let api_error: ApiError = JobletError::validation("bad").into();
        assert!(!api_error.retryable);
    }
}
