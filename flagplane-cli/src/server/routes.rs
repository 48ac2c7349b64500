use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use flagplane_lib::{
    evaluate, parse_environment_input, parse_flag_input, parse_segment_input, AuditAction,
    AuditEntry, ConfigSnapshot, DistributionEvent, EvaluationContext, EvaluationReason, FlagError,
    FlagVersionRecord,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::auth::Principal;
use super::error::ApiError;
use super::limits::{enforce_quota, quota_usage, TENANT_HEADER};
use super::metrics::{metrics, outcome};
use super::sse::event_stream;
use super::state::AppState;
use super::store::UpdateOptions;

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenantQuery {
    tenant_id: Option<String>,
    environment: Option<String>,
}

// ── Helpers ──────────────────────────────────────────────────

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Tenant from the `x-tenant-id` header, then the body, then `?tenantId=`.
fn resolve_tenant(
    headers: &HeaderMap,
    body_tenant: Option<&str>,
    query_tenant: Option<&str>,
) -> ApiResult<String> {
    let header_tenant = headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok());
    non_empty(header_tenant)
        .or_else(|| non_empty(body_tenant))
        .or_else(|| non_empty(query_tenant))
        .map(String::from)
        .ok_or(ApiError::MissingTenant)
}

/// Optional JSON body. Mutations like publish may be sent without one.
fn optional_json(body: &Bytes) -> ApiResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn expected_version(headers: &HeaderMap) -> ApiResult<Option<u64>> {
    let Some(raw) = headers.get(header::IF_MATCH) else {
        return Ok(None);
    };
    raw.to_str()
        .ok()
        .map(|v| v.trim().trim_matches('"'))
        .and_then(|v| v.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest("If-Match must be a flag version".to_string()))
}

/// Hands the event for a freshly appended history record to the bus.
fn distribute(state: &AppState, record: &FlagVersionRecord) {
    let event = DistributionEvent::for_record(record);
    if let Some(delivered) = state.bus.publish(event) {
        metrics().events_distributed.inc();
        debug!(delivered, "event handed to subscribers");
    }
}

/// Records an administrative change. A failed append is logged and the
/// request still succeeds.
async fn audit(state: &AppState, entry: AuditEntry) {
    let (action, key) = (entry.action, entry.resource_key.clone());
    if let Err(err) = state.store.append_audit(entry).await {
        warn!(?action, resource_key = %key, error = %err, "audit append failed");
    }
}

fn snapshot_etag(snapshot: &ConfigSnapshot) -> ApiResult<String> {
    let encoded = serde_json::to_vec(&snapshot.flags)
        .map_err(|e| ApiError::Internal(format!("encoding snapshot: {}", e)))?;
    let mut hasher = Sha1::new();
    hasher.update(&encoded);
    Ok(format!("\"{:x}\"", hasher.finalize()))
}

// ── Flags ────────────────────────────────────────────────────

pub async fn create_flag(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let input = parse_flag_input(&body)?;
    enforce_quota(
        state.store.as_ref(),
        &input.tenant_id,
        state.config.limits.tenant_flag_quota,
    )
    .await?;

    let result = state.store.create(input).await;
    metrics()
        .flag_mutations
        .with_label_values(&["create", outcome(&result)])
        .inc();
    let flag = result?;

    let entry = AuditEntry::new(&flag.tenant_id, &principal.token, AuditAction::FlagCreated, &flag.key, body);
    audit(&state, entry).await;
    Ok((StatusCode::CREATED, Json(json!({ "flag": flag }))).into_response())
}

pub async fn list_flags(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Value>> {
    let tenant_id = resolve_tenant(&headers, None, query.tenant_id.as_deref())?;
    let flags = state.store.list(&tenant_id).await?;
    Ok(Json(json!({ "flags": flags })))
}

pub async fn get_flag(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Value>> {
    let tenant_id = resolve_tenant(&headers, None, query.tenant_id.as_deref())?;
    let flag = state
        .store
        .get(&tenant_id, &key)
        .await?
        .ok_or_else(|| FlagError::flag_not_found(&tenant_id, &key))?;
    Ok(Json(json!({ "flag": flag })))
}

pub async fn update_flag(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let input = parse_flag_input(&body)?;
    if input.key != key {
        return Err(ApiError::BadRequest(
            "flag key mismatch between path and body".to_string(),
        ));
    }
    let opts = UpdateOptions {
        expected_version: expected_version(&headers)?,
        ..UpdateOptions::default()
    };

    let tenant_id = input.tenant_id.clone();
    let result = state.store.update(&tenant_id, &key, input, opts).await;
    metrics()
        .flag_mutations
        .with_label_values(&["update", outcome(&result)])
        .inc();
    let flag = result?;

    let entry = AuditEntry::new(&tenant_id, &principal.token, AuditAction::FlagUpdated, &key, body);
    audit(&state, entry).await;
    Ok(Json(json!({ "flag": flag })))
}

pub async fn publish_flag(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    let body = optional_json(&body)?;
    let tenant_id = resolve_tenant(
        &headers,
        body.get("tenantId").and_then(Value::as_str),
        query.tenant_id.as_deref(),
    )?;

    let result = state.store.publish(&tenant_id, &key, &principal.token).await;
    metrics()
        .publish_total
        .with_label_values(&[outcome(&result)])
        .inc();
    let record = result?;

    distribute(&state, &record);
    let entry = AuditEntry::new(
        &tenant_id,
        &principal.token,
        AuditAction::FlagPublished,
        &key,
        json!({ "version": record.version }),
    );
    audit(&state, entry).await;
    info!(
        tenant_id = %tenant_id,
        flag_key = %key,
        version = record.version,
        role = %principal.role,
        "publish accepted"
    );
    Ok((StatusCode::CREATED, Json(json!({ "published": record }))).into_response())
}

pub async fn rollback_flag(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let body = optional_json(&body)?;
    let tenant_id = resolve_tenant(
        &headers,
        body.get("tenantId").and_then(Value::as_str),
        query.tenant_id.as_deref(),
    )?;
    let target_version = body
        .get("targetVersion")
        .and_then(Value::as_u64)
        .filter(|v| *v >= 1)
        .ok_or_else(|| ApiError::BadRequest("targetVersion must be a positive number".to_string()))?;

    let result = state
        .store
        .rollback(&tenant_id, &key, target_version, &principal.token)
        .await;
    metrics()
        .rollback_total
        .with_label_values(&[outcome(&result)])
        .inc();
    let record = result?;

    distribute(&state, &record);
    let entry = AuditEntry::new(
        &tenant_id,
        &principal.token,
        AuditAction::FlagRolledBack,
        &key,
        json!({ "targetVersion": target_version, "rolledBackVersion": record.version }),
    );
    audit(&state, entry).await;
    info!(
        tenant_id = %tenant_id,
        flag_key = %key,
        target_version,
        version = record.version,
        role = %principal.role,
        "rollback accepted"
    );
    Ok(Json(json!({ "rolledBack": record })))
}

pub async fn flag_history(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Value>> {
    let tenant_id = resolve_tenant(&headers, None, query.tenant_id.as_deref())?;
    let history = state.store.list_history(&tenant_id, &key).await?;
    Ok(Json(json!({ "history": history })))
}

// ── Environments, segments and audit ─────────────────────────

pub async fn create_environment(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let input = parse_environment_input(&body).map_err(|e| ApiError::invalid("environment", e))?;
    let environment = state.store.create_environment(input).await?;

    let entry = AuditEntry::new(
        &environment.tenant_id,
        &principal.token,
        AuditAction::EnvironmentCreated,
        &environment.key,
        body,
    );
    audit(&state, entry).await;
    Ok((StatusCode::CREATED, Json(json!({ "environment": environment }))).into_response())
}

pub async fn list_environments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Value>> {
    let tenant_id = resolve_tenant(&headers, None, query.tenant_id.as_deref())?;
    let environments = state.store.list_environments(&tenant_id).await?;
    Ok(Json(json!({ "environments": environments })))
}

pub async fn create_segment(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let input = parse_segment_input(&body).map_err(|e| ApiError::invalid("segment", e))?;
    let segment = state.store.create_segment(input).await?;

    let entry = AuditEntry::new(
        &segment.tenant_id,
        &principal.token,
        AuditAction::SegmentCreated,
        &segment.key,
        body,
    );
    audit(&state, entry).await;
    Ok((StatusCode::CREATED, Json(json!({ "segment": segment }))).into_response())
}

pub async fn list_segments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Value>> {
    let tenant_id = resolve_tenant(&headers, None, query.tenant_id.as_deref())?;
    let segments = state.store.list_segments(&tenant_id).await?;
    Ok(Json(json!({ "segments": segments })))
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Value>> {
    let tenant_id = resolve_tenant(&headers, None, query.tenant_id.as_deref())?;
    let events = state.store.list_audit(&tenant_id).await?;
    Ok(Json(json!({ "events": events })))
}

// ── Evaluation and SDK reads ─────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    tenant_id: Option<String>,
    flag_key: Option<String>,
    context: Option<EvaluationContext>,
}

pub async fn evaluate_flag(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EvaluateRequest>,
) -> ApiResult<Json<Value>> {
    let (Some(tenant_id), Some(flag_key), Some(context)) = (
        non_empty(body.tenant_id.as_deref()),
        non_empty(body.flag_key.as_deref()),
        body.context.as_ref(),
    ) else {
        return Err(ApiError::BadRequest(
            "tenantId, flagKey, and context are required".to_string(),
        ));
    };

    let flag = state
        .store
        .get(tenant_id, flag_key)
        .await?
        .ok_or_else(|| FlagError::flag_not_found(tenant_id, flag_key))?;
    let result = evaluate(&flag, context);

    let reason = match result.reason {
        EvaluationReason::RuleMatch => "rule_match",
        EvaluationReason::Fallthrough => "fallthrough",
    };
    metrics().eval_total.with_label_values(&[reason]).inc();
    Ok(Json(json!({ "result": result })))
}

pub async fn sdk_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Response> {
    let tenant_id = resolve_tenant(&headers, None, query.tenant_id.as_deref())?;
    let environment = non_empty(query.environment.as_deref())
        .unwrap_or("default")
        .to_string();

    let flags = state.store.list(&tenant_id).await?;
    let snapshot = ConfigSnapshot {
        tenant_id,
        environment,
        generated_at: Utc::now(),
        flags,
    };
    let etag = snapshot_etag(&snapshot)?;
    metrics()
        .sdk_config_total
        .with_label_values(&[&snapshot.tenant_id])
        .inc();

    let etag_header = HeaderValue::from_str(&etag)
        .map_err(|e| ApiError::Internal(format!("etag header: {}", e)))?;
    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .is_some_and(|v| v.as_bytes() == etag.as_bytes());
    if not_modified {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag_header)]).into_response());
    }
    Ok(([(header::ETAG, etag_header)], Json(snapshot)).into_response())
}

pub async fn tenant_quotas(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant_id = non_empty(Some(tenant_id.as_str()))
        .ok_or(ApiError::MissingTenant)?
        .to_string();
    let quotas = quota_usage(
        state.store.as_ref(),
        &tenant_id,
        state.config.limits.tenant_flag_quota,
    )
    .await?;
    Ok(Json(json!({ "tenantId": tenant_id, "quotas": quotas })))
}

// ── Streaming ────────────────────────────────────────────────

pub async fn events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TenantQuery>,
) -> impl IntoResponse {
    let tenant_id = resolve_tenant(&headers, None, query.tenant_id.as_deref()).ok();
    let subscription = state.bus.subscribe();
    debug!(tenant_id = tenant_id.as_deref().unwrap_or("*"), "sse subscriber connected");
    event_stream(subscription, tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_resolution_order() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            resolve_tenant(&headers, Some("body"), Some("query")).unwrap(),
            "body"
        );
        assert_eq!(resolve_tenant(&headers, None, Some("query")).unwrap(), "query");
        assert!(matches!(
            resolve_tenant(&headers, Some("  "), None),
            Err(ApiError::MissingTenant)
        ));

        headers.insert(TENANT_HEADER, HeaderValue::from_static("header"));
        assert_eq!(
            resolve_tenant(&headers, Some("body"), Some("query")).unwrap(),
            "header"
        );
    }

    #[test]
    fn test_if_match_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(expected_version(&headers).unwrap(), None);
        headers.insert(header::IF_MATCH, HeaderValue::from_static("\"3\""));
        assert_eq!(expected_version(&headers).unwrap(), Some(3));
        headers.insert(header::IF_MATCH, HeaderValue::from_static("latest"));
        assert!(expected_version(&headers).is_err());
    }

    #[test]
    fn test_empty_body_is_null() {
        assert_eq!(optional_json(&Bytes::new()).unwrap(), Value::Null);
        assert!(optional_json(&Bytes::from_static(b"{oops")).is_err());
    }
}
