//! HTTP transport for [`FlagClient`]: fetches snapshots from the control
//! plane and follows its event stream.

use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ConfigSource, FlagClient};
use crate::flag::ConfigSnapshot;
use crate::retry::{compute_backoff_delay, RetryPolicy};
use crate::stream::{message_stream, StreamMessage};

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfigSource {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpConfigSource {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn get(&self, path: &str, tenant_id: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("x-tenant-id", tenant_id)
    }

    /// Follows `/api/events` in the background, feeding every event to
    /// `client`. Refetches the full snapshot each time the stream connects,
    /// the first time included, since events sent before the subscription
    /// existed are never delivered. Reconnects with exponential backoff.
    pub fn follow_events(&self, client: FlagClient, backoff: RetryPolicy) -> EventFollower {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(follow_loop(self.clone(), client, backoff, stop_rx));
        EventFollower { stop, handle }
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self, tenant_id: &str, environment: &str) -> Result<ConfigSnapshot, ClientError> {
        let response = self
            .get("/api/sdk/config", tenant_id)
            .query(&[("environment", environment)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

/// Handle to a running event follower.
pub struct EventFollower {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EventFollower {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "event follower ended abnormally");
        }
    }
}

enum StreamEnd {
    Stopped,
    Disconnected,
}

async fn follow_loop(
    source: HttpConfigSource,
    client: FlagClient,
    backoff: RetryPolicy,
    mut stop: watch::Receiver<bool>,
) {
    let tenant_id = client.options().tenant_id.clone();
    let mut attempt: u32 = 0;

    loop {
        let request = source
            .get("/api/events", &tenant_id)
            .header("accept", "text/event-stream")
            .send();

        let response = tokio::select! {
            result = request => result.and_then(|r| r.error_for_status()),
            _ = stop.changed() => return,
        };

        match response {
            Ok(response) => {
                attempt = 0;
                info!(tenant_id = %tenant_id, "event stream connected");
                if let Err(err) = client.refresh().await {
                    warn!(error = %err, "resync after connect failed");
                }

                if let StreamEnd::Stopped = read_stream(response, &client, &mut stop).await {
                    return;
                }
            }
            Err(err) => warn!(tenant_id = %tenant_id, error = %err, "event stream connection failed"),
        }

        attempt = attempt.saturating_add(1);
        let delay = compute_backoff_delay(attempt, &backoff, rand::random::<f64>());
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting event stream");
        tokio::select! {
            _ = tokio::time::sleep(delay.max(Duration::from_millis(1))) => {}
            _ = stop.changed() => return,
        }
    }
}

async fn read_stream(
    response: reqwest::Response,
    client: &FlagClient,
    stop: &mut watch::Receiver<bool>,
) -> StreamEnd {
    let mut messages = pin!(message_stream(response.bytes_stream()));

    loop {
        let message = tokio::select! {
            message = messages.next() => message,
            _ = stop.changed() => return StreamEnd::Stopped,
        };
        match message {
            Some(Ok(StreamMessage::Event(event))) => {
                if let Err(err) = client.handle_event(&event).await {
                    warn!(
                        flag_key = %event.flag_key,
                        version = event.version,
                        error = %err,
                        "refetch after event failed"
                    );
                }
            }
            Some(Ok(StreamMessage::Shutdown)) => {
                info!("control plane is shutting down, reconnecting");
                return StreamEnd::Disconnected;
            }
            Some(Err(err)) => {
                warn!(error = %err, "event stream read failed");
                return StreamEnd::Disconnected;
            }
            None => return StreamEnd::Disconnected,
        }
    }
}
