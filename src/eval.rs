use std::borrow::Cow;

use serde_json::Value;

use crate::flag::{
    EvaluationContext, EvaluationReason, EvaluationResult, FeatureFlag, Operator, RulePredicate,
    TargetRule,
};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Number of rollout buckets; a percentage point is 100 buckets.
pub const BUCKETS: u32 = 10_000;

/// 32-bit FNV-1a over the UTF-8 bytes of `input`.
pub fn fnv1a32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Deterministic bucket in `[0, 10000)` for a rollout seed.
pub fn stable_bucket(seed: &str) -> u32 {
    fnv1a32(seed) % BUCKETS
}

/// Resolves a context attribute. `userId` and `key` always come from the
/// context fields, so attributes of the same name are never visible.
fn lookup<'a>(context: &'a EvaluationContext, attribute: &str) -> Option<Cow<'a, Value>> {
    let field = match attribute {
        "userId" => &context.user_id,
        "key" => &context.key,
        _ => return context.attributes.get(attribute).map(Cow::Borrowed),
    };
    field.as_ref().map(|v| Cow::Owned(Value::String(v.clone())))
}

/// Strict equality on scalars. Numbers compare by value so `1` equals
/// `1.0`; arrays and objects are never strictly equal to anything.
fn strict_eq(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(Value::String(a)), Value::String(b)) => a == b,
        (Some(Value::Bool(a)), Value::Bool(b)) => a == b,
        (Some(Value::Null), Value::Null) => true,
        _ => false,
    }
}

fn contains_strict(haystack: &Value, needle: Option<&Value>) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| strict_eq(needle, item)),
        _ => false,
    }
}

/// Numeric coercion: booleans become 0/1, null and blank strings 0,
/// numeric strings their value; everything else is NaN and fails any
/// comparison.
fn to_number(value: Option<&Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Some(Value::Array(_)) | Some(Value::Object(_)) => f64::NAN,
    }
}

pub fn predicate_matches(predicate: &RulePredicate, context: &EvaluationContext) -> bool {
    let actual = lookup(context, &predicate.attribute);
    let actual = actual.as_deref();
    let expected = &predicate.value;

    match &predicate.operator {
        Operator::Eq => strict_eq(actual, expected),
        Operator::Neq => !strict_eq(actual, expected),
        Operator::In => contains_strict(expected, actual),
        Operator::NotIn => !contains_strict(expected, actual),
        Operator::Contains => match (actual, expected) {
            (Some(Value::String(a)), Value::String(e)) => a.contains(e.as_str()),
            (Some(array @ Value::Array(_)), _) => contains_strict(array, Some(expected)),
            _ => false,
        },
        Operator::Gte => to_number(actual) >= to_number(Some(expected)),
        Operator::Lte => to_number(actual) <= to_number(Some(expected)),
        Operator::Unknown(_) => false,
    }
}

/// Percentage gate. A rule without a rollout admits everyone.
pub fn rollout_allows(flag_key: &str, rule: &TargetRule, identity: &str) -> bool {
    let Some(percentage) = rule.rollout_percentage else {
        return true;
    };
    let bucket = stable_bucket(&format!("{}:{}:{}", flag_key, rule.id, identity));
    let threshold = (percentage * 100.0).floor();
    f64::from(bucket) < threshold
}

fn rule_matches(rule: &TargetRule, context: &EvaluationContext) -> bool {
    rule.conditions
        .iter()
        .all(|predicate| predicate_matches(predicate, context))
}

fn fallthrough(flag: &FeatureFlag) -> EvaluationResult {
    EvaluationResult {
        flag_key: flag.key.clone(),
        variant_key: flag.fallthrough_variant.clone(),
        value: variant_value(flag, &flag.fallthrough_variant),
        reason: EvaluationReason::Fallthrough,
        matched_rule_id: None,
    }
}

fn variant_value(flag: &FeatureFlag, variant: &str) -> Value {
    flag.variants.get(variant).cloned().unwrap_or(Value::Null)
}

/// Evaluates `flag` for `context`. Pure: no I/O, no clock, no randomness.
pub fn evaluate(flag: &FeatureFlag, context: &EvaluationContext) -> EvaluationResult {
    if !flag.enabled {
        return fallthrough(flag);
    }

    let identity = context.identity();
    for rule in &flag.rules {
        if !rule_matches(rule, context) {
            continue;
        }
        if !rollout_allows(&flag.key, rule, identity) {
            continue;
        }
        return EvaluationResult {
            flag_key: flag.key.clone(),
            variant_key: rule.variant.clone(),
            value: variant_value(flag, &rule.variant),
            reason: EvaluationReason::RuleMatch,
            matched_rule_id: Some(rule.id.clone()),
        };
    }

    fallthrough(flag)
}
