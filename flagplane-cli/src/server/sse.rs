use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use flagplane_lib::VersionTracker;
use futures::Stream;
use tracing::{debug, warn};

use super::bus::{Delivery, Subscription};
use super::metrics::metrics;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Keeps the active connection gauge honest however the stream ends.
struct ConnectionGauge;

impl ConnectionGauge {
    fn open() -> Self {
        let m = metrics();
        m.sse_active.inc();
        m.sse_total.inc();
        Self
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        metrics().sse_active.dec();
        debug!("sse subscriber disconnected");
    }
}

/// SSE stream of `flag.published` events for one subscriber.
///
/// Stream format:
/// - On publish: `data: {"type":"flag.published","tenantId":..,"version":..}\n\n`
/// - Every 15s: `:keepalive\n\n`
/// - On shutdown: `event: server_shutdown\ndata: {...}\n\n`, then the stream ends
///
/// Each connection carries its own version watermark so a duplicate or stale
/// event is never written twice. A subscriber that lags behind the bus is
/// disconnected; it reconnects and resyncs from a fresh snapshot.
pub fn event_stream(
    mut subscription: Subscription,
    tenant_id: Option<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let _gauge = ConnectionGauge::open();
        let mut delivered = VersionTracker::new();

        loop {
            match subscription.next().await {
                Delivery::Event(event) => {
                    if tenant_id.as_ref().is_some_and(|t| *t != event.tenant_id) {
                        continue;
                    }
                    if !delivered.observe(&event) {
                        continue;
                    }
                    match serde_json::to_string(&event) {
                        Ok(data) => {
                            metrics().sse_events.with_label_values(&["flag.published"]).inc();
                            yield Ok(Event::default().data(data));
                        }
                        Err(e) => warn!(error = %e, "failed to encode event"),
                    }
                }
                Delivery::Lagged(missed) => {
                    metrics().sse_events.with_label_values(&["lagged"]).inc();
                    warn!(missed, "sse subscriber lagged, closing stream");
                    break;
                }
                Delivery::Closed => {
                    yield Ok(Event::default()
                        .event("server_shutdown")
                        .data("{\"reason\":\"server shutting down\"}"));
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keepalive"),
    )
}
