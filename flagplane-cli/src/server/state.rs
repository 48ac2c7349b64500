use std::sync::Arc;

use super::bus::DistributionBus;
use super::config::FpServerConfig;
use super::idempotency::{CachedResponse, IdempotencyGuard};
use super::limits::RateLimiter;
use super::store::FlagStore;

/// Shared application state for the HTTP server.
pub struct AppState {
    /// Flag Version Store backend (memory or sled).
    pub store: Arc<dyn FlagStore>,
    /// Fan-out of `flag.published` events to SSE subscribers.
    pub bus: DistributionBus,
    /// Cached responses of mutating requests, keyed per caller.
    pub idempotency: IdempotencyGuard<CachedResponse>,
    pub limiter: RateLimiter,
    pub config: FpServerConfig,
}

impl AppState {
    pub fn new(config: FpServerConfig, store: Arc<dyn FlagStore>) -> Self {
        Self {
            store,
            bus: DistributionBus::new(config.server.bus_capacity),
            idempotency: IdempotencyGuard::new(config.idempotency.ttl()),
            limiter: RateLimiter::per_minute(
                config.limits.global_requests_per_minute,
                config.limits.tenant_requests_per_minute,
            ),
            config,
        }
    }
}
