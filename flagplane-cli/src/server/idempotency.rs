use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Query, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use super::auth::Principal;
use super::error::ApiError;
use super::limits::TENANT_HEADER;
use super::metrics::metrics;
use super::state::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAY_HEADER: &str = "idempotent-replay";

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Result of [`IdempotencyGuard::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    /// The operation ran and its result is now cached.
    Fresh(R),
    /// A cached result from an earlier call with the same key.
    Replayed(R),
}

impl<R> Outcome<R> {
    pub fn into_inner(self) -> R {
        match self {
            Outcome::Fresh(r) | Outcome::Replayed(r) => r,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed(_))
    }
}

struct Entry<R> {
    value: R,
    expires_at: Instant,
}

type Slot<R> = Arc<Mutex<Option<Entry<R>>>>;

struct Slots<R> {
    by_key: HashMap<String, Slot<R>>,
    last_sweep: Instant,
}

/// At-most-once execution of keyed operations within a TTL window.
///
/// Each key has its own async mutex, held across the check, the operation and
/// the caching of its result, so two concurrent calls with one key never both
/// run the operation. Only successful results are cached.
pub struct IdempotencyGuard<R> {
    ttl: Duration,
    slots: StdMutex<Slots<R>>,
}

impl<R: Clone> IdempotencyGuard<R> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: StdMutex::new(Slots {
                by_key: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of keys currently tracked, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.lock_slots().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn execute<F, Fut, E>(&self, key: &str, op: F) -> Result<Outcome<R>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let slot = self.slot(key);
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(Outcome::Replayed(cached.value.clone()));
            }
            *entry = None;
        }

        let value = op().await?;
        *entry = Some(Entry {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(Outcome::Fresh(value))
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Slots<R>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &str) -> Slot<R> {
        let mut slots = self.lock_slots();
        let now = Instant::now();
        if now.duration_since(slots.last_sweep) >= SWEEP_INTERVAL {
            slots.last_sweep = now;
            // A slot somebody else still holds a handle to stays put.
            slots.by_key.retain(|_, slot| {
                if Arc::strong_count(slot) > 1 {
                    return true;
                }
                match slot.try_lock() {
                    Ok(entry) => entry.as_ref().is_some_and(|e| now < e.expires_at),
                    Err(_) => true,
                }
            });
        }
        Arc::clone(slots.by_key.entry(key.to_string()).or_default())
    }
}

// ── HTTP middleware ─────────────────────────────────────────

/// A successful response, buffered so it can be replayed byte for byte.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl CachedResponse {
    fn into_response(self, replay: bool) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        if let Some(content_type) = self.content_type {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }
        if replay {
            response
                .headers_mut()
                .insert(REPLAY_HEADER, HeaderValue::from_static("true"));
        }
        response
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Cache key: caller token, tenant, method, path and the caller supplied key.
pub fn cache_key(
    token: Option<&str>,
    tenant_id: Option<&str>,
    method: &Method,
    path: &str,
    idempotency_key: &str,
) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        token.unwrap_or("anon"),
        tenant_id.unwrap_or("-"),
        method,
        path,
        idempotency_key
    )
}

#[derive(Deserialize)]
struct TenantParam {
    #[serde(rename = "tenantId")]
    tenant_id: Option<String>,
}

/// Tenant a mutation targets, resolved the way the handlers do:
/// `x-tenant-id`, then the `tenantId` field of a JSON body, then `?tenantId=`.
fn request_tenant(parts: &Parts, body: &Bytes) -> Option<String> {
    let non_empty = |v: &str| Some(v.trim().to_string()).filter(|v| !v.is_empty());

    parts
        .headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(non_empty)
        .or_else(|| {
            serde_json::from_slice::<Value>(body)
                .ok()?
                .get("tenantId")?
                .as_str()
                .and_then(non_empty)
        })
        .or_else(|| {
            Query::<TenantParam>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(q)| q.tenant_id)
                .as_deref()
                .and_then(non_empty)
        })
}

/// Replays cached 2xx responses for mutating requests that carry an
/// `Idempotency-Key` header. Must run after authentication so the caller
/// identity is known.
pub async fn idempotency(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let idempotency_key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from);

    let Some(idempotency_key) = idempotency_key.filter(|_| is_mutating(request.method())) else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.config.server.max_body_bytes).await {
        Ok(body) => body,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    let tenant_id = request_tenant(&parts, &body);
    let token = parts.extensions.get::<Principal>().map(|p| p.token.clone());
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let key = cache_key(
        token.as_deref(),
        tenant_id.as_deref(),
        &method,
        &path,
        &idempotency_key,
    );
    let request = Request::from_parts(parts, Body::from(body));

    let outcome = state
        .idempotency
        .execute(&key, || async move {
            let response = next.run(request).await;
            if !response.status().is_success() {
                return Err(response);
            }
            let (parts, body) = response.into_parts();
            match to_bytes(body, usize::MAX).await {
                Ok(bytes) => Ok(CachedResponse {
                    status: parts.status,
                    content_type: parts.headers.get(header::CONTENT_TYPE).cloned(),
                    body: bytes,
                }),
                Err(e) => Err(ApiError::Internal(format!("buffering response: {}", e)).into_response()),
            }
        })
        .await;

    match outcome {
        Ok(Outcome::Fresh(cached)) => cached.into_response(false),
        Ok(Outcome::Replayed(cached)) => {
            metrics().idempotent_replays.inc();
            info!(%method, path = %path, "replayed idempotent response");
            cached.into_response(true)
        }
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_second_call_replays_without_running() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        let runs = AtomicU32::new(0);

        let first = guard
            .execute("k", || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(7)
            })
            .await
            .unwrap();
        let second = guard
            .execute("k", || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(8)
            })
            .await
            .unwrap();

        assert_eq!(first, Outcome::Fresh(7));
        assert_eq!(second, Outcome::Replayed(7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        let err = guard
            .execute("k", || async { Err::<u32, _>("store unavailable") })
            .await
            .unwrap_err();
        assert_eq!(err, "store unavailable");

        let retried = guard
            .execute("k", || async { Ok::<_, &str>(1) })
            .await
            .unwrap();
        assert_eq!(retried, Outcome::Fresh(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let guard = IdempotencyGuard::new(Duration::from_secs(5));
        guard.execute("k", || async { Ok::<_, ()>(1) }).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let replay = guard.execute("k", || async { Ok::<_, ()>(2) }).await.unwrap();
        assert!(replay.is_replay());

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = guard.execute("k", || async { Ok::<_, ()>(3) }).await.unwrap();
        assert_eq!(fresh, Outcome::Fresh(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_swept() {
        let guard = IdempotencyGuard::new(Duration::from_millis(100));
        for key in ["a", "b", "c"] {
            guard.execute(key, || async { Ok::<_, ()>(()) }).await.unwrap();
        }
        assert_eq!(guard.len(), 3);

        tokio::time::advance(Duration::from_secs(2)).await;
        guard.execute("d", || async { Ok::<_, ()>(()) }).await.unwrap();
        assert_eq!(guard.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_calls_run_once() {
        let guard = Arc::new(IdempotencyGuard::new(Duration::from_secs(60)));
        let runs = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    guard
                        .execute("same", || async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok::<_, ()>(runs.fetch_add(1, Ordering::SeqCst))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut fresh = 0;
        for task in tasks {
            let outcome = task.await.unwrap();
            if !outcome.is_replay() {
                fresh += 1;
            }
            assert_eq!(outcome.into_inner(), 0);
        }
        assert_eq!(fresh, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_key_separates_callers_and_tenants() {
        let a = cache_key(Some("admin-token"), Some("acme"), &Method::POST, "/api/flags", "k1");
        let b = cache_key(Some("operator-token"), Some("acme"), &Method::POST, "/api/flags", "k1");
        let c = cache_key(Some("admin-token"), Some("globex"), &Method::POST, "/api/flags", "k1");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            cache_key(None, None, &Method::PUT, "/api/flags/x", "k1"),
            "anon:-:PUT:/api/flags/x:k1"
        );
    }

    fn parts(uri: &str, tenant_header: Option<&str>) -> Parts {
        let mut builder = axum::http::Request::builder().method("POST").uri(uri);
        if let Some(tenant) = tenant_header {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_request_tenant_resolution_order() {
        let body = Bytes::from_static(br#"{"tenantId":"from-body"}"#);
        assert_eq!(
            request_tenant(&parts("/api/flags?tenantId=from-query", Some("from-header")), &body).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            request_tenant(&parts("/api/flags?tenantId=from-query", None), &body).as_deref(),
            Some("from-body")
        );
        assert_eq!(
            request_tenant(&parts("/api/flags?tenantId=from-query", None), &Bytes::new()).as_deref(),
            Some("from-query")
        );
        assert_eq!(request_tenant(&parts("/api/flags", Some(" ")), &Bytes::new()), None);
    }
}
