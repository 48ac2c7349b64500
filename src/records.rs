//! Tenant-scoped records kept next to flags: environments, segments and the
//! audit trail of administrative changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flag::RulePredicate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInput {
    pub tenant_id: String,
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: Uuid,
    pub tenant_id: String,
    pub key: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn from_input(input: EnvironmentInput, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            key: input.key,
            name: input.name,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A named, reusable set of predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInput {
    pub tenant_id: String,
    pub key: String,
    pub name: String,
    pub conditions: Vec<RulePredicate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: Uuid,
    pub tenant_id: String,
    pub key: String,
    pub name: String,
    pub conditions: Vec<RulePredicate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    pub fn from_input(input: SegmentInput, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            key: input.key,
            name: input.name,
            conditions: input.conditions,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "flag.created")]
    FlagCreated,
    #[serde(rename = "flag.updated")]
    FlagUpdated,
    #[serde(rename = "flag.published")]
    FlagPublished,
    #[serde(rename = "flag.rolled_back")]
    FlagRolledBack,
    #[serde(rename = "environment.created")]
    EnvironmentCreated,
    #[serde(rename = "segment.created")]
    SegmentCreated,
}

impl AuditAction {
    pub fn resource_type(self) -> ResourceType {
        match self {
            AuditAction::FlagCreated
            | AuditAction::FlagUpdated
            | AuditAction::FlagPublished
            | AuditAction::FlagRolledBack => ResourceType::Flag,
            AuditAction::EnvironmentCreated => ResourceType::Environment,
            AuditAction::SegmentCreated => ResourceType::Segment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Flag,
    Segment,
    Environment,
}

/// One administrative change. `diff` holds the submitted payload, or the
/// versions involved for publish and rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_key: String,
    pub diff: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(tenant_id: &str, actor: &str, action: AuditAction, resource_key: &str, diff: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            actor: actor.to_string(),
            action,
            resource_type: action.resource_type(),
            resource_key: resource_key.to_string(),
            diff: as_diff(diff),
            created_at: Utc::now(),
        }
    }
}

/// Scalars are wrapped so `diff` is always an object.
fn as_diff(payload: Value) -> Value {
    match payload {
        Value::Object(_) => payload,
        other => serde_json::json!({ "value": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audit_entry_wire_shape() {
        let entry = AuditEntry::new(
            "acme",
            "admin-token",
            AuditAction::FlagRolledBack,
            "checkout",
            json!({"targetVersion": 2, "rolledBackVersion": 4}),
        );
        let wire = serde_json::to_value(&entry).unwrap();
        assert_eq!(wire["action"], "flag.rolled_back");
        assert_eq!(wire["resourceType"], "flag");
        assert_eq!(wire["resourceKey"], "checkout");
        assert_eq!(wire["diff"]["rolledBackVersion"], 4);
        assert!(wire["createdAt"].is_string());
    }

    #[test]
    fn test_scalar_diff_is_wrapped() {
        let entry = AuditEntry::new("acme", "a", AuditAction::SegmentCreated, "beta", json!(7));
        assert_eq!(entry.diff, json!({"value": 7}));
        assert_eq!(entry.resource_type, ResourceType::Segment);
    }

    #[test]
    fn test_records_get_distinct_ids() {
        let input = EnvironmentInput {
            tenant_id: "acme".into(),
            key: "staging".into(),
            name: "Staging".into(),
        };
        let now = Utc::now();
        let a = Environment::from_input(input.clone(), now);
        let b = Environment::from_input(input, now);
        assert_ne!(a.id, b.id);
        assert_eq!(a.created_at, a.updated_at);
    }
}
