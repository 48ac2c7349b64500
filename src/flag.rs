use core::fmt;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Variant name to the value it resolves to.
pub type Variants = BTreeMap<String, Value>;

/// Identity of a flag inside the control plane.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlagId {
    pub tenant_id: String,
    pub key: String,
}

impl FlagId {
    pub fn new(tenant_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for FlagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.key)
    }
}

/// Predicate operators. Anything the engine does not know is kept
/// verbatim as `Unknown` and never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Eq,
    Neq,
    In,
    NotIn,
    Contains,
    Gte,
    Lte,
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Unknown(raw) => raw,
        }
    }
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "contains" => Operator::Contains,
            "gte" => Operator::Gte,
            "lte" => Operator::Lte,
            _ => Operator::Unknown(raw),
        }
    }
}

impl From<&str> for Operator {
    fn from(raw: &str) -> Self {
        Operator::from(raw.to_string())
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePredicate {
    pub attribute: String,
    pub operator: Operator,
    pub value: Value,
}

impl RulePredicate {
    pub fn new(attribute: &str, operator: impl Into<Operator>, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.to_string(),
            operator: operator.into(),
            value: value.into(),
        }
    }
}

/// One targeting branch. All conditions must hold, then the rollout gate
/// decides whether the identity is admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<RulePredicate>,
    pub variant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_percentage: Option<f64>,
}

/// Flag content as supplied by an administrator, without the fields the
/// store owns (version and timestamps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagInput {
    pub tenant_id: String,
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    pub variants: Variants,
    pub fallthrough_variant: String,
    #[serde(default)]
    pub rules: Vec<TargetRule>,
}

impl FlagInput {
    pub fn id(&self) -> FlagId {
        FlagId::new(&self.tenant_id, &self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub tenant_id: String,
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub variants: Variants,
    pub fallthrough_variant: String,
    #[serde(default)]
    pub rules: Vec<TargetRule>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    /// Builds a stored flag from admin content.
    pub fn from_input(input: FlagInput, version: u64, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: input.tenant_id,
            key: input.key,
            name: input.name,
            description: input.description,
            enabled: input.enabled,
            variants: input.variants,
            fallthrough_variant: input.fallthrough_variant,
            rules: input.rules,
            version,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> FlagId {
        FlagId::new(&self.tenant_id, &self.key)
    }

    /// The admin-editable part of the flag.
    pub fn content(&self) -> FlagInput {
        FlagInput {
            tenant_id: self.tenant_id.clone(),
            key: self.key.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            variants: self.variants.clone(),
            fallthrough_variant: self.fallthrough_variant.clone(),
            rules: self.rules.clone(),
        }
    }
}

/// Immutable snapshot of a flag as it was made live by a publish or a
/// rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagVersionRecord {
    pub tenant_id: String,
    pub flag_key: String,
    pub version: u64,
    pub flag: FeatureFlag,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "flag.published")]
    FlagPublished,
}

/// Change notification fanned out to consumers. Serialises to
/// `{"type":"flag.published","tenantId":..,"flagKey":..,"version":..,"publishedAt":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub tenant_id: String,
    pub flag_key: String,
    pub version: u64,
    pub published_at: DateTime<Utc>,
}

impl DistributionEvent {
    pub fn published(tenant_id: &str, flag_key: &str, version: u64, at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::FlagPublished,
            tenant_id: tenant_id.to_string(),
            flag_key: flag_key.to_string(),
            version,
            published_at: at,
        }
    }

    /// The event announcing a freshly appended history record.
    pub fn for_record(record: &FlagVersionRecord) -> Self {
        Self::published(
            &record.tenant_id,
            &record.flag_key,
            record.version,
            record.created_at,
        )
    }

    pub fn flag_id(&self) -> FlagId {
        FlagId::new(&self.tenant_id, &self.flag_key)
    }
}

/// Full configuration handed to SDK consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub tenant_id: String,
    pub environment: String,
    pub generated_at: DateTime<Utc>,
    pub flags: Vec<FeatureFlag>,
}

impl ConfigSnapshot {
    pub fn flag(&self, key: &str) -> Option<&FeatureFlag> {
        self.flags.iter().find(|f| f.key == key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..Self::default()
        }
    }

    pub fn with_user_id(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    pub fn attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Identity used for rollout bucketing.
    pub fn identity(&self) -> &str {
        self.key
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or("anonymous")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    RuleMatch,
    Fallthrough,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub flag_key: String,
    pub variant_key: String,
    pub value: Value,
    pub reason: EvaluationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_roundtrips_unknown_verbatim() {
        let op: Operator = serde_json::from_value(json!("starts_with")).unwrap();
        assert_eq!(op, Operator::Unknown("starts_with".into()));
        assert_eq!(serde_json::to_value(&op).unwrap(), json!("starts_with"));

        let op: Operator = serde_json::from_value(json!("not_in")).unwrap();
        assert_eq!(op, Operator::NotIn);
    }

    #[test]
    fn test_distribution_event_wire_shape() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = DistributionEvent::published("tenant-a", "checkout", 3, at);
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "flag.published");
        assert_eq!(wire["tenantId"], "tenant-a");
        assert_eq!(wire["flagKey"], "checkout");
        assert_eq!(wire["version"], 3);
        assert!(wire["publishedAt"].as_str().unwrap().starts_with("2024-05-01T10:00:00"));
        assert_eq!(wire.as_object().unwrap().len(), 5);
    }

    #[test]
    fn test_identity_prefers_key_then_user_id() {
        let mut ctx = EvaluationContext::with_user_id("u-1");
        assert_eq!(ctx.identity(), "u-1");
        ctx.key = Some("k-1".into());
        assert_eq!(ctx.identity(), "k-1");
        assert_eq!(EvaluationContext::new().identity(), "anonymous");
    }

    #[test]
    fn test_flag_json_uses_camel_case() {
        let flag: FeatureFlag = serde_json::from_value(json!({
            "tenantId": "tenant-a",
            "key": "checkout",
            "name": "Checkout",
            "enabled": true,
            "variants": {"on": true, "off": false},
            "fallthroughVariant": "off",
            "rules": [{
                "id": "us-users",
                "name": "US users",
                "conditions": [{"attribute": "country", "operator": "eq", "value": "US"}],
                "variant": "on",
                "rolloutPercentage": 100
            }],
            "version": 1,
            "createdAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(flag.rules[0].rollout_percentage, Some(100.0));
        assert_eq!(flag.rules[0].conditions[0].operator, Operator::Eq);
        assert_eq!(flag.content().id(), FlagId::new("tenant-a", "checkout"));
    }
}
