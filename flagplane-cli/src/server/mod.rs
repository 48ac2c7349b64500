pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod limits;
pub mod metrics;
mod routes;
mod sse;
pub mod state;
pub mod store;

use std::process;
use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use self::auth::require_auth;
use self::config::{FpServerConfig, StorageBackend};
use self::idempotency::idempotency;
use self::limits::rate_limit;
use self::metrics::{handle_health_check, handle_metrics, metrics, track_metrics};
use self::routes::{
    create_environment, create_flag, create_segment, evaluate_flag, events, flag_history,
    get_flag, list_audit, list_environments, list_flags, list_segments, publish_flag,
    rollback_flag, sdk_config, tenant_quotas, update_flag,
};
use self::state::AppState;
use self::store::memory::MemoryStore;
use self::store::sled_store::SledStore;
use self::store::FlagStore;

/// Assembles the control plane API.
///
/// `/api/health` and `/api/metrics` are public. Every other route passes
/// rate limiting, then authentication, then the idempotency guard.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/flags", get(list_flags).post(create_flag))
        .route("/api/flags/{key}", get(get_flag).put(update_flag))
        .route("/api/flags/{key}/publish", post(publish_flag))
        .route("/api/flags/{key}/rollback", post(rollback_flag))
        .route("/api/flags/{key}/history", get(flag_history))
        .route("/api/environments", get(list_environments).post(create_environment))
        .route("/api/segments", get(list_segments).post(create_segment))
        .route("/api/audit", get(list_audit))
        .route("/api/evaluate", post(evaluate_flag))
        .route("/api/sdk/config", get(sdk_config))
        .route("/api/tenants/{tenant_id}/quotas", get(tenant_quotas))
        .route("/api/events", get(events))
        .route_layer(from_fn_with_state(Arc::clone(&state), idempotency))
        .route_layer(from_fn_with_state(Arc::clone(&state), require_auth))
        .route_layer(from_fn_with_state(Arc::clone(&state), rate_limit));

    let body_limit = state.config.server.max_body_bytes;
    Router::new()
        .route("/api/health", get(handle_health_check))
        .route("/api/metrics", get(handle_metrics))
        .merge(api)
        .layer(from_fn(track_metrics))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CompressionLayer::new())
        .with_state(state)
}

fn open_store(config: &FpServerConfig) -> Arc<dyn FlagStore> {
    match config.server.storage {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sled => match SledStore::open(&config.server.data_dir) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(data_dir = %config.server.data_dir, error = %e, "failed to open storage");
                process::exit(1);
            }
        },
    }
}

pub async fn run_serve(port_arg: Option<u16>, hostname_arg: Option<String>, config_path: &str) {
    // flagplane.toml, then environment, then CLI flags
    let mut config = FpServerConfig::load(config_path);
    config.apply_env_overrides();
    if let Some(port) = port_arg {
        config.server.port = port;
    }
    if let Some(hostname) = hostname_arg {
        config.server.hostname = hostname;
    }

    let store = open_store(&config);
    metrics()
        .storage_backend
        .with_label_values(&[store.backend()])
        .set(1);

    let addr = format!("{}:{}", config.server.hostname, config.server.port);
    let state = Arc::new(AppState::new(config, store));
    let app = build_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        });
    info!(
        %addr,
        storage = state.store.backend(),
        tokens = state.config.tokens.len(),
        "control plane listening"
    );

    let shutdown_state = Arc::clone(&state);
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    process::exit(1);
                }
            };

        #[cfg(unix)]
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }

        #[cfg(not(unix))]
        ctrl_c.await.ok();

        info!("shutdown signal received, closing event streams");
        // SSE streams never finish on their own.
        shutdown_state.bus.shutdown();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "server error");
            process::exit(1);
        });

    info!("server stopped");
}
