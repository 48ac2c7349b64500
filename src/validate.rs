//! Payload validation for flags, environments and segments. Every
//! violation is collected into one report so a caller can fix a payload in
//! a single round trip.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{FlagError, Result, ValidationIssue};
use crate::flag::FlagInput;
use crate::records::{EnvironmentInput, SegmentInput};

fn non_empty(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::String(s)) if !s.trim().is_empty())
}

fn as_object<'a>(raw: &'a Value, root: &str) -> Result<&'a Map<String, Value>> {
    match raw {
        Value::Object(fields) => Ok(fields),
        _ => Err(FlagError::Validation(vec![ValidationIssue::new(
            root,
            "must be an object",
        )])),
    }
}

fn check_identity(fields: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
    for field in ["tenantId", "key", "name"] {
        if !non_empty(fields.get(field)) {
            issues.push(ValidationIssue::new(field, "is required"));
        }
    }
}

fn decode_checked<T: DeserializeOwned>(raw: &Value, root: &str, issues: Vec<ValidationIssue>) -> Result<T> {
    if !issues.is_empty() {
        return Err(FlagError::Validation(issues));
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| FlagError::Validation(vec![ValidationIssue::new(root, e.to_string())]))
}

fn check_predicates(predicates: Option<&Value>, path: &str, issues: &mut Vec<ValidationIssue>) {
    let Some(Value::Array(items)) = predicates else {
        issues.push(ValidationIssue::new(path, "must be an array"));
        return;
    };

    for (i, predicate) in items.iter().enumerate() {
        let item_path = format!("{}[{}]", path, i);
        let Value::Object(fields) = predicate else {
            issues.push(ValidationIssue::new(item_path, "must be an object"));
            continue;
        };
        if !non_empty(fields.get("attribute")) {
            issues.push(ValidationIssue::new(format!("{}.attribute", item_path), "is required"));
        }
        if !non_empty(fields.get("operator")) {
            issues.push(ValidationIssue::new(format!("{}.operator", item_path), "is required"));
        }
        if !fields.contains_key("value") {
            issues.push(ValidationIssue::new(format!("{}.value", item_path), "is required"));
        }
    }
}

fn check_rules(rules: &[Value], variants: Option<&Map<String, Value>>, issues: &mut Vec<ValidationIssue>) {
    for (i, rule) in rules.iter().enumerate() {
        let path = format!("rules[{}]", i);
        let Value::Object(fields) = rule else {
            issues.push(ValidationIssue::new(path, "must be an object"));
            continue;
        };
        if !non_empty(fields.get("id")) {
            issues.push(ValidationIssue::new(format!("{}.id", path), "is required"));
        }
        if !non_empty(fields.get("name")) {
            issues.push(ValidationIssue::new(format!("{}.name", path), "is required"));
        }
        check_predicates(fields.get("conditions"), &format!("{}.conditions", path), issues);

        match fields.get("variant") {
            Some(Value::String(v)) if !v.trim().is_empty() => {
                if variants.is_some_and(|vs| !vs.contains_key(v)) {
                    issues.push(ValidationIssue::new(
                        format!("{}.variant", path),
                        "must reference an existing variant",
                    ));
                }
            }
            _ => issues.push(ValidationIssue::new(format!("{}.variant", path), "is required")),
        }

        match fields.get("rolloutPercentage") {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => {
                let pct = n.as_f64().unwrap_or(f64::NAN);
                if !(0.0..=100.0).contains(&pct) {
                    issues.push(ValidationIssue::new(
                        format!("{}.rolloutPercentage", path),
                        "must be between 0 and 100",
                    ));
                }
            }
            Some(_) => issues.push(ValidationIssue::new(
                format!("{}.rolloutPercentage", path),
                "must be a number",
            )),
        }
    }
}

/// Validates a raw JSON flag payload and decodes it.
pub fn parse_flag_input(raw: &Value) -> Result<FlagInput> {
    let fields = as_object(raw, "flag")?;
    let mut issues = Vec::new();
    check_identity(fields, &mut issues);

    let variants = match fields.get("variants") {
        Some(Value::Object(vs)) if !vs.is_empty() => Some(vs),
        _ => {
            issues.push(ValidationIssue::new("variants", "must be a non-empty object"));
            None
        }
    };

    match fields.get("fallthroughVariant") {
        Some(Value::String(v)) if !v.trim().is_empty() => {
            if variants.is_some_and(|vs| !vs.contains_key(v)) {
                issues.push(ValidationIssue::new(
                    "fallthroughVariant",
                    "must reference an existing variant",
                ));
            }
        }
        _ => issues.push(ValidationIssue::new("fallthroughVariant", "is required")),
    }

    match fields.get("rules") {
        Some(Value::Array(rules)) => check_rules(rules, variants, &mut issues),
        _ => issues.push(ValidationIssue::new("rules", "must be an array")),
    }

    if let Some(enabled) = fields.get("enabled") {
        if !enabled.is_boolean() {
            issues.push(ValidationIssue::new("enabled", "must be a boolean"));
        }
    }

    decode_checked(raw, "flag", issues)
}

/// Validates a raw environment payload: `tenantId`, `key` and `name`.
pub fn parse_environment_input(raw: &Value) -> Result<EnvironmentInput> {
    let fields = as_object(raw, "environment")?;
    let mut issues = Vec::new();
    check_identity(fields, &mut issues);
    decode_checked(raw, "environment", issues)
}

/// Validates a raw segment payload. Conditions follow the same rules as a
/// flag rule's conditions.
pub fn parse_segment_input(raw: &Value) -> Result<SegmentInput> {
    let fields = as_object(raw, "segment")?;
    let mut issues = Vec::new();
    check_identity(fields, &mut issues);
    check_predicates(fields.get("conditions"), "conditions", &mut issues);
    decode_checked(raw, "segment", issues)
}

/// Validates typed flag content against the same invariants as
/// [`parse_flag_input`].
pub fn validate_flag(input: &FlagInput) -> Result<()> {
    let raw = serde_json::to_value(input)
        .map_err(|e| FlagError::Validation(vec![ValidationIssue::new("flag", e.to_string())]))?;
    parse_flag_input(&raw).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_payload() -> Value {
        json!({
            "tenantId": "tenant-a",
            "key": "new-homepage",
            "name": "New Homepage",
            "enabled": true,
            "variants": {"on": true, "off": false},
            "fallthroughVariant": "off",
            "rules": [{
                "id": "us-users",
                "name": "US users",
                "conditions": [{"attribute": "country", "operator": "eq", "value": "US"}],
                "variant": "on",
                "rolloutPercentage": 100
            }]
        })
    }

    fn issue_paths(err: FlagError) -> Vec<String> {
        match err {
            FlagError::Validation(issues) => issues.into_iter().map(|i| i.path).collect(),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_payload_decodes() {
        let input = parse_flag_input(&valid_payload()).unwrap();
        assert_eq!(input.key, "new-homepage");
        assert_eq!(input.rules.len(), 1);
        assert!(validate_flag(&input).is_ok());
    }

    #[test]
    fn test_non_object_payload() {
        assert_eq!(issue_paths(parse_flag_input(&json!([1, 2])).unwrap_err()), vec!["flag"]);
    }

    #[test]
    fn test_every_violation_is_reported() {
        let payload = json!({
            "tenantId": "",
            "variants": {"on": true},
            "fallthroughVariant": "off",
            "rules": [
                {"id": "r1", "name": "", "conditions": [{"operator": "eq"}], "variant": "missing", "rolloutPercentage": 150},
                "not-a-rule"
            ]
        });
        let paths = issue_paths(parse_flag_input(&payload).unwrap_err());
        assert_eq!(
            paths,
            vec![
                "tenantId",
                "key",
                "name",
                "fallthroughVariant",
                "rules[0].name",
                "rules[0].conditions[0].attribute",
                "rules[0].conditions[0].value",
                "rules[0].variant",
                "rules[0].rolloutPercentage",
                "rules[1]",
            ]
        );
    }

    #[test]
    fn test_empty_variants_rejected() {
        let mut payload = valid_payload();
        payload["variants"] = json!({});
        let paths = issue_paths(parse_flag_input(&payload).unwrap_err());
        assert_eq!(paths, vec!["variants"]);
    }

    #[test]
    fn test_unknown_operator_is_not_a_validation_error() {
        let mut payload = valid_payload();
        payload["rules"][0]["conditions"][0]["operator"] = json!("matches_regex");
        assert!(parse_flag_input(&payload).is_ok());
    }

    #[test]
    fn test_environment_payload() {
        let input = parse_environment_input(&json!({
            "tenantId": "tenant-a", "key": "staging", "name": "Staging"
        }))
        .unwrap();
        assert_eq!(input.key, "staging");

        let paths = issue_paths(parse_environment_input(&json!({"tenantId": "tenant-a", "key": " "})).unwrap_err());
        assert_eq!(paths, vec!["key", "name"]);
        assert_eq!(issue_paths(parse_environment_input(&json!("staging")).unwrap_err()), vec!["environment"]);
    }

    #[test]
    fn test_segment_payload() {
        let input = parse_segment_input(&json!({
            "tenantId": "tenant-a",
            "key": "beta-testers",
            "name": "Beta testers",
            "conditions": [{"attribute": "plan", "operator": "in", "value": ["beta"]}]
        }))
        .unwrap();
        assert_eq!(input.conditions.len(), 1);

        let paths = issue_paths(
            parse_segment_input(&json!({
                "tenantId": "tenant-a",
                "name": "Beta testers",
                "conditions": [{"attribute": "plan", "value": 1}, 3]
            }))
            .unwrap_err(),
        );
        assert_eq!(paths, vec!["key", "conditions[0].operator", "conditions[1]"]);

        let paths = issue_paths(
            parse_segment_input(&json!({"tenantId": "t", "key": "k", "name": "n"})).unwrap_err(),
        );
        assert_eq!(paths, vec!["conditions"]);
    }

    #[test]
    fn test_typed_validation_catches_dangling_variant() {
        let mut input = parse_flag_input(&valid_payload()).unwrap();
        input.fallthrough_variant = "gone".into();
        let paths = issue_paths(validate_flag(&input).unwrap_err());
        assert_eq!(paths, vec!["fallthroughVariant"]);
    }
}
