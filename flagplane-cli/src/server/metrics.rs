use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use serde_json::json;

const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

pub struct Metrics {
    registry: Registry,

    pub flag_mutations: IntCounterVec,
    pub publish_total: IntCounterVec,
    pub rollback_total: IntCounterVec,

    pub events_distributed: IntCounter,
    pub sse_active: IntGauge,
    pub sse_total: IntCounter,
    pub sse_events: IntCounterVec,

    pub sdk_config_total: IntCounterVec,
    pub eval_total: IntCounterVec,
    pub idempotent_replays: IntCounter,
    pub storage_backend: IntGaugeVec,

    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
}

/// Registers `collector` and hands it back. Names are static, so a
/// failure here is a programming error.
fn registered<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: prometheus::Result<C>,
) -> C {
    let collector = collector.expect("metric definition is valid");
    registry
        .register(Box::new(collector.clone()))
        .expect("metric names are unique");
    collector
}

fn labelled(name: &str, help: &str) -> Opts {
    Opts::new(format!("fp_{}", name), help)
}

impl Metrics {
    fn register(registry: Registry) -> Self {
        let r = &registry;
        Self {
            flag_mutations: registered(
                r,
                IntCounterVec::new(labelled("flag_mutations_total", "Flag creates and updates"), &["operation", "status"]),
            ),
            publish_total: registered(
                r,
                IntCounterVec::new(labelled("publish_total", "Publish calls by outcome"), &["status"]),
            ),
            rollback_total: registered(
                r,
                IntCounterVec::new(labelled("rollback_total", "Rollback calls by outcome"), &["status"]),
            ),
            events_distributed: registered(
                r,
                IntCounter::with_opts(labelled("events_distributed_total", "flag.published events handed to the bus")),
            ),
            sse_active: registered(
                r,
                IntGauge::with_opts(labelled("sse_active_connections", "Open event stream subscribers")),
            ),
            sse_total: registered(
                r,
                IntCounter::with_opts(labelled("sse_connections_total", "Event stream subscribers since start")),
            ),
            sse_events: registered(
                r,
                IntCounterVec::new(labelled("sse_events_total", "Event stream frames by type"), &["type"]),
            ),
            sdk_config_total: registered(
                r,
                IntCounterVec::new(labelled("sdk_config_total", "Configuration snapshots served by tenant"), &["tenant_id"]),
            ),
            eval_total: registered(
                r,
                IntCounterVec::new(labelled("eval_total", "Server-side evaluations by reason"), &["reason"]),
            ),
            idempotent_replays: registered(
                r,
                IntCounter::with_opts(labelled(
                    "idempotent_replays_total",
                    "Mutating requests answered from the idempotency cache",
                )),
            ),
            storage_backend: registered(
                r,
                IntGaugeVec::new(labelled("storage_backend", "Active flag store (1 = in use)"), &["type"]),
            ),
            http_requests_total: registered(
                r,
                IntCounterVec::new(labelled("http_requests_total", "Requests by route and status"), &["method", "path", "status"]),
            ),
            http_request_duration: registered(
                r,
                HistogramVec::new(
                    HistogramOpts::new("fp_http_request_duration_seconds", "Request latency by route")
                        .buckets(LATENCY_BUCKETS.to_vec()),
                    &["method", "path"],
                ),
            ),
            registry,
        }
    }

    /// Prometheus text exposition of every registered family.
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(|| Metrics::register(Registry::new()))
}

/// `status` label value for a mutation result.
pub fn outcome<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}

/// GET /api/metrics
pub async fn handle_metrics() -> Response {
    match metrics().render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Counts every request and records its latency, labelled by route
/// template so flag keys do not explode the label space.
pub async fn track_metrics(request: Request<Body>, next: Next) -> Response {
    let method = request.method().as_str().to_owned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_owned(), |p| p.as_str().to_owned());

    let started = Instant::now();
    let response = next.run(request).await;

    let m = metrics();
    let status = response.status();
    m.http_requests_total
        .with_label_values(&[method.as_str(), route.as_str(), status.as_str()])
        .inc();
    m.http_request_duration
        .with_label_values(&[method.as_str(), route.as_str()])
        .observe(started.elapsed().as_secs_f64());

    response
}

/// GET /api/health
pub async fn handle_health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "flagplane" }))
}
