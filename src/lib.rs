//! Versioned feature flags.
//!
//! Shared by the control plane and by SDK consumers: the flag data model,
//! the deterministic evaluation engine, payload validation, the monotonic
//! version tracker that makes event delivery safe to duplicate and reorder,
//! and the consumer-side [`FlagClient`].
//!
//! ```
//! use flagplane_lib::{evaluate, EvaluationContext, FeatureFlag};
//!
//! let flag: FeatureFlag = serde_json::from_str(r#"{
//!     "tenantId": "acme", "key": "checkout", "name": "Checkout",
//!     "enabled": true, "variants": {"on": true, "off": false},
//!     "fallthroughVariant": "off",
//!     "rules": [{"id": "us-users", "name": "US users", "variant": "on",
//!                "conditions": [{"attribute": "country", "operator": "eq", "value": "US"}]}],
//!     "version": 1, "createdAt": "2024-05-01T10:00:00Z", "updatedAt": "2024-05-01T10:00:00Z"
//! }"#).unwrap();
//!
//! let ctx = EvaluationContext::with_key("user-1").attribute("country", "US");
//! assert_eq!(evaluate(&flag, &ctx).variant_key, "on");
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod eval;
pub mod flag;
pub mod records;
#[cfg(feature = "remote")]
pub mod remote;
pub mod retry;
pub mod stream;
pub mod tracker;
pub mod validate;

pub use cache::{MonotonicFlagCache, TtlCache};
pub use client::{ClientError, ClientOptions, ConfigSource, FallbackMode, FlagClient};
pub use error::{FlagError, LimitScope, Result, ValidationIssue};
pub use eval::evaluate;
pub use flag::{
    ConfigSnapshot, DistributionEvent, EvaluationContext, EvaluationReason, EvaluationResult,
    EventKind, FeatureFlag, FlagId, FlagInput, FlagVersionRecord, Operator, RulePredicate,
    TargetRule, Variants,
};
pub use records::{
    AuditAction, AuditEntry, Environment, EnvironmentInput, ResourceType, Segment, SegmentInput,
};
#[cfg(feature = "remote")]
pub use remote::{EventFollower, HttpConfigSource};
pub use retry::{compute_backoff_delay, with_retry, with_retry_if, RetryPolicy};
pub use tracker::VersionTracker;
pub use validate::{parse_environment_input, parse_flag_input, parse_segment_input, validate_flag};
