use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use flagplane_lib::{FlagError, LimitScope};
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use super::error::ApiError;
use super::state::AppState;
use super::store::FlagStore;

pub const TENANT_HEADER: &str = "x-tenant-id";
const ANONYMOUS_TENANT: &str = "anonymous";

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

impl Window {
    fn starting(now: Instant, length: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + length,
        }
    }

    fn roll(&mut self, now: Instant, length: Duration) {
        if now >= self.reset_at {
            *self = Self::starting(now, length);
        }
    }
}

struct Counters {
    global: Window,
    tenants: HashMap<String, Window>,
}

/// Fixed-window request counters, one global and one per tenant.
///
/// A request is admitted only if both windows have room; a rejected request
/// does not consume from either.
pub struct RateLimiter {
    global_limit: u32,
    tenant_limit: u32,
    window: Duration,
    counters: Mutex<Counters>,
}

impl RateLimiter {
    pub fn per_minute(global_limit: u32, tenant_limit: u32) -> Self {
        Self::new(global_limit, tenant_limit, Duration::from_secs(60))
    }

    pub fn new(global_limit: u32, tenant_limit: u32, window: Duration) -> Self {
        Self {
            global_limit,
            tenant_limit,
            window,
            counters: Mutex::new(Counters {
                global: Window::starting(Instant::now(), window),
                tenants: HashMap::new(),
            }),
        }
    }

    pub fn check(&self, tenant_id: &str) -> Result<(), FlagError> {
        let now = Instant::now();
        let mut guard = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counters = &mut *guard;

        if now >= counters.global.reset_at {
            counters.global = Window::starting(now, self.window);
            counters.tenants.retain(|_, w| now < w.reset_at);
        }
        if counters.global.count >= self.global_limit {
            return Err(FlagError::RateLimitExceeded {
                scope: LimitScope::Global,
            });
        }

        let window = self.window;
        let tenant = counters
            .tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| Window::starting(now, window));
        tenant.roll(now, window);
        if tenant.count >= self.tenant_limit {
            return Err(FlagError::RateLimitExceeded {
                scope: LimitScope::Tenant,
            });
        }

        tenant.count += 1;
        counters.global.count += 1;
        Ok(())
    }
}

pub async fn rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let tenant_id = request
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
        .unwrap_or(ANONYMOUS_TENANT);

    if let Err(e) = state.limiter.check(tenant_id) {
        warn!(tenant_id, error = %e, "request rejected");
        return ApiError::from(e).into_response();
    }
    next.run(request).await
}

// ── Tenant flag quota ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub max_flags: usize,
    pub used_flags: usize,
    pub remaining_flags: usize,
}

pub async fn quota_usage(
    store: &dyn FlagStore,
    tenant_id: &str,
    max_flags: usize,
) -> Result<QuotaUsage, FlagError> {
    let used_flags = store.count(tenant_id).await?;
    Ok(QuotaUsage {
        max_flags,
        used_flags,
        remaining_flags: max_flags.saturating_sub(used_flags),
    })
}

/// Fails with `QuotaExceeded` when the tenant has no room for another flag.
///
/// Not atomic with the create that follows; concurrent creates for one
/// tenant can overshoot the quota by at most their number.
pub async fn enforce_quota(
    store: &dyn FlagStore,
    tenant_id: &str,
    max_flags: usize,
) -> Result<(), FlagError> {
    let usage = quota_usage(store, tenant_id, max_flags).await?;
    if usage.remaining_flags == 0 {
        return Err(FlagError::QuotaExceeded {
            tenant_id: tenant_id.to_string(),
            max_flags,
            used_flags: usage.used_flags,
        });
    }
    Ok(())
}
