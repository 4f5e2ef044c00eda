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

use crate::SafeDisplay;
use std::fmt::Write;
use strum_macros::{Display, EnumIter, EnumString};

/// Category of a failure, shared by every service in the workspace.
///
/// The category decides retry behavior and the status code the control
/// API maps the failure to; the free-form message stays out of both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AlreadyExists,
    Conflict,
    ResourceExhausted,
    Timeout,
    Permission,
    Infrastructure,
    BackendUnavailable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorKind {
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Validation => Severity::Low,
            ErrorKind::NotFound => Severity::Low,
            ErrorKind::AlreadyExists => Severity::Low,
            ErrorKind::Conflict => Severity::Medium,
            ErrorKind::ResourceExhausted => Severity::High,
            ErrorKind::Timeout => Severity::Medium,
            ErrorKind::Permission => Severity::High,
            ErrorKind::Infrastructure => Severity::High,
            ErrorKind::BackendUnavailable => Severity::High,
            ErrorKind::Unknown => Severity::Critical,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ResourceExhausted
                | ErrorKind::Timeout
                | ErrorKind::Infrastructure
                | ErrorKind::BackendUnavailable
        )
    }
}

/// A categorized failure carrying structured context (job id, volume
/// name, operation) collected while it bubbles up the call chain.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobletError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: Vec<(&'static str, String)>,
}

impl JobletError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(entity: &str, name: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{entity} not found: {name}"))
    }

    pub fn already_exists(entity: &str, name: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::AlreadyExists,
            format!("{entity} already exists: {name}"),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infrastructure, message)
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendUnavailable, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_context(mut self, key: &'static str, value: impl std::fmt::Display) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl SafeDisplay for JobletError {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = write!(&mut result, "{}: {}", self.kind, self.message);
        for (key, value) in &self.context {
            let _ = write!(&mut result, " [{key}={value}]");
        }
        result
    }
}

impl From<std::io::Error> for JobletError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => {
                JobletError::new(ErrorKind::NotFound, error.to_string())
            }
            std::io::ErrorKind::PermissionDenied => {
                JobletError::new(ErrorKind::Permission, error.to_string())
            }
            std::io::ErrorKind::TimedOut => JobletError::new(ErrorKind::Timeout, error.to_string()),
            _ => JobletError::new(ErrorKind::Infrastructure, error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;
    use test_r::test;

    #[test]
    fn retryable_kinds_match_the_taxonomy() {
        let retryable: Vec<ErrorKind> = ErrorKind::iter().filter(|k| k.is_retryable()).collect();
        assert_eq!(
            retryable,
            vec![
                ErrorKind::ResourceExhausted,
                ErrorKind::Timeout,
                ErrorKind::Infrastructure,
                ErrorKind::BackendUnavailable,
            ]
        );
    }

    #[test]
    fn context_is_rendered_in_safe_display() {
        let error = JobletError::not_found("volume", "data1")
            .with_context("job_id", "j-1")
            .with_context("operation", "attach");
        assert_eq!(
            error.to_safe_string(),
            "NotFound: volume not found: data1 [job_id=j-1] [operation=attach]"
        );
    }

    #[test]
    fn io_errors_map_to_categories() {
        let error: JobletError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "mount").into();
        assert_eq!(error.kind, ErrorKind::Permission);
        assert!(!error.is_retryable());
    }
}
