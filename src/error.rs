use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the flag lifecycle.
pub type Result<T> = std::result::Result<T, FlagError>;

/// One field violation found while validating flag input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.path, self.message)
    }
}

/// Which counter a rate limit rejection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    Global,
    Tenant,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Global => write!(f, "global"),
            LimitScope::Tenant => write!(f, "tenant"),
        }
    }
}

/// Typed failures of the flag lifecycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlagError {
    #[error("invalid flag payload: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("flag {tenant_id}/{key} already exists")]
    Conflict { tenant_id: String, key: String },

    #[error("{resource} {tenant_id}/{key} not found")]
    NotFound {
        resource: &'static str,
        tenant_id: String,
        key: String,
    },

    #[error("version {version} of flag {tenant_id}/{key} not found in history")]
    VersionNotFound {
        tenant_id: String,
        key: String,
        version: u64,
    },

    #[error("flag {tenant_id}/{key} is at version {actual}, expected {expected}")]
    VersionConflict {
        tenant_id: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("tenant {tenant_id} flag quota exceeded ({used_flags}/{max_flags})")]
    QuotaExceeded {
        tenant_id: String,
        max_flags: usize,
        used_flags: usize,
    },

    #[error("{scope} rate limit exceeded")]
    RateLimitExceeded { scope: LimitScope },

    #[error("store {operation} failed: {message}")]
    TransientStore {
        operation: &'static str,
        message: String,
    },
}

impl FlagError {
    pub fn flag_not_found(tenant_id: &str, key: &str) -> Self {
        FlagError::NotFound {
            resource: "flag",
            tenant_id: tenant_id.to_string(),
            key: key.to_string(),
        }
    }

    pub fn transient(operation: &'static str, message: impl fmt::Display) -> Self {
        FlagError::TransientStore {
            operation,
            message: message.to_string(),
        }
    }

    /// Backend faults may succeed on a later attempt; everything else is
    /// a statement about the request and will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlagError::TransientStore { .. })
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ValidationIssue::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_issue() {
        let err = FlagError::Validation(vec![
            ValidationIssue::new("key", "is required"),
            ValidationIssue::new("rules[0].variant", "must reference an existing variant"),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid flag payload: key is required; rules[0].variant must reference an existing variant"
        );
    }

    #[test]
    fn test_only_store_faults_are_retryable() {
        assert!(FlagError::transient("publish", "disk full").is_retryable());
        assert!(!FlagError::flag_not_found("t", "k").is_retryable());
        assert!(!FlagError::RateLimitExceeded {
            scope: LimitScope::Tenant
        }
        .is_retryable());
    }
}
