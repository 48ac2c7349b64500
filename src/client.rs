//! SDK-side flag client.
//!
//! Holds the latest configuration snapshot for one tenant and environment,
//! refreshes it by polling or on distribution events, and evaluates flags
//! locally without any I/O on the read path.

use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{MonotonicFlagCache, TtlCache};
use crate::eval::evaluate;
use crate::flag::{ConfigSnapshot, DistributionEvent, EvaluationContext, EvaluationResult, FeatureFlag};
use crate::retry::{with_retry_if, RetryPolicy};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("config request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode config snapshot: {0}")]
    Decode(String),

    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Connection problems, throttling and server faults may clear up on
    /// their own; bad payloads and client-side mistakes will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            ClientError::Decode(_) | ClientError::Config(_) => false,
        }
    }
}

/// Where a client fetches its configuration snapshot from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self, tenant_id: &str, environment: &str) -> Result<ConfigSnapshot, ClientError>;
}

/// What to serve once the snapshot can no longer be refreshed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Keep evaluating against the last good snapshot.
    #[default]
    UseStale,
    /// Return the caller's default until a refresh succeeds.
    ServeDefault,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub tenant_id: String,
    pub environment: String,
    /// Zero disables background polling.
    pub poll_interval: Duration,
    pub cache_ttl: Duration,
    pub fallback_mode: FallbackMode,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            environment: "production".to_string(),
            poll_interval: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(60),
            fallback_mode: FallbackMode::UseStale,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct FlagClientBuilder {
    source: Arc<dyn ConfigSource>,
    options: ClientOptions,
}

impl FlagClientBuilder {
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.options.tenant_id = tenant_id.into();
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.options.environment = environment.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.options.poll_interval = interval;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.options.cache_ttl = ttl;
        self
    }

    pub fn fallback_mode(mut self, mode: FallbackMode) -> Self {
        self.options.fallback_mode = mode;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = policy;
        self
    }

    pub fn build(self) -> Result<FlagClient, ClientError> {
        if self.options.tenant_id.trim().is_empty() {
            return Err(ClientError::Config("tenant id is required".into()));
        }
        if self.options.environment.trim().is_empty() {
            return Err(ClientError::Config("environment is required".into()));
        }
        Ok(FlagClient {
            inner: Arc::new(Inner {
                options: self.options,
                source: self.source,
                state: RwLock::new(ClientState::default()),
                refresh_lock: Mutex::new(()),
                poller: std::sync::Mutex::new(None),
            }),
        })
    }
}

#[derive(Default)]
struct ClientState {
    snapshots: TtlCache<String, ConfigSnapshot>,
    flags: MonotonicFlagCache,
    /// Set when the latest refresh attempt failed.
    degraded: bool,
}

struct Poller {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    options: ClientOptions,
    source: Arc<dyn ConfigSource>,
    state: RwLock<ClientState>,
    refresh_lock: Mutex<()>,
    poller: std::sync::Mutex<Option<Poller>>,
}

impl Inner {
    async fn refresh(&self) -> Result<ConfigSnapshot, ClientError> {
        // One fetch at a time; callers queued behind it reuse its result
        // through the cache on their next read.
        let _guard = self.refresh_lock.lock().await;
        let opts = &self.options;
        let source = &self.source;
        let (tenant_id, environment) = (opts.tenant_id.as_str(), opts.environment.as_str());

        let fetched = with_retry_if(
            &opts.retry,
            move || source.fetch(tenant_id, environment),
            ClientError::is_retryable,
        )
        .await;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match fetched {
            Ok(fetched) => {
                // Content older than what is held never replaces it.
                let changed = state.flags.apply_snapshot(&fetched);
                let snapshot = state.flags.overlay(fetched);
                state
                    .snapshots
                    .set(opts.environment.clone(), snapshot.clone(), opts.cache_ttl);
                state.degraded = false;
                info!(
                    tenant_id = %opts.tenant_id,
                    environment = %opts.environment,
                    flags = snapshot.flags.len(),
                    changed = changed.len(),
                    "config snapshot refreshed"
                );
                Ok(snapshot)
            }
            Err(err) => {
                state.degraded = true;
                warn!(
                    tenant_id = %opts.tenant_id,
                    environment = %opts.environment,
                    error = %err,
                    "config snapshot refresh failed"
                );
                Err(err)
            }
        }
    }

    fn evaluate(&self, flag_key: &str, context: &EvaluationContext) -> Option<EvaluationResult> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let (snapshot, fresh) = state.snapshots.get_stale(&self.options.environment)?;
        if self.options.fallback_mode == FallbackMode::ServeDefault && (!fresh || state.degraded) {
            return None;
        }
        Some(evaluate(snapshot.flag(flag_key)?, context))
    }

    fn needs_refresh(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.snapshots.get(&self.options.environment).is_none()
    }
}

/// Cheap to clone; clones share the same snapshot and poller.
#[derive(Clone)]
pub struct FlagClient {
    inner: Arc<Inner>,
}

impl FlagClient {
    pub fn builder(source: impl ConfigSource + 'static) -> FlagClientBuilder {
        FlagClientBuilder {
            source: Arc::new(source),
            options: ClientOptions::default(),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Fetches once, then polls every `poll_interval` until [`FlagClient::stop`].
    pub async fn start(&self) -> Result<ConfigSnapshot, ClientError> {
        let snapshot = self.inner.refresh().await?;

        let period = self.inner.options.poll_interval;
        if period.is_zero() {
            return Ok(snapshot);
        }

        let mut poller = self.inner.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_none() {
            let (stop, stop_rx) = watch::channel(false);
            let handle = tokio::spawn(poll_loop(Arc::downgrade(&self.inner), period, stop_rx));
            *poller = Some(Poller { stop, handle });
        }
        Ok(snapshot)
    }

    /// Stops background polling and waits for the poll task to finish.
    pub async fn stop(&self) {
        let poller = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            let _ = poller.stop.send(true);
            if let Err(err) = poller.handle.await {
                warn!(error = %err, "poll task ended abnormally");
            }
        }
    }

    pub async fn refresh(&self) -> Result<ConfigSnapshot, ClientError> {
        self.inner.refresh().await
    }

    /// The cached snapshot while it is within its TTL.
    pub fn snapshot(&self) -> Option<ConfigSnapshot> {
        let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
        state.snapshots.get(&self.inner.options.environment).cloned()
    }

    pub fn invalidate_snapshot(&self) {
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        state.snapshots.delete(&self.inner.options.environment);
    }

    /// Full evaluation result, or `None` when no usable snapshot holds the
    /// flag.
    pub fn evaluate(&self, flag_key: &str, context: &EvaluationContext) -> Option<EvaluationResult> {
        self.inner.evaluate(flag_key, context)
    }

    pub fn variation(&self, flag_key: &str, context: &EvaluationContext, default: Value) -> Value {
        self.inner
            .evaluate(flag_key, context)
            .map(|result| result.value)
            .unwrap_or(default)
    }

    /// Like [`FlagClient::variation`], refreshing first when the snapshot is
    /// missing or expired.
    pub async fn variation_with_refresh(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        default: Value,
    ) -> Value {
        if self.inner.needs_refresh() {
            if let Err(err) = self.inner.refresh().await {
                debug!(flag_key, error = %err, "serving from fallback after failed refresh");
            }
        }
        self.variation(flag_key, context, default)
    }

    /// Applies flag content pushed directly to the client. Older versions
    /// are ignored. Accepted content also replaces the flag in the held
    /// snapshot without extending its TTL.
    pub fn apply_flag(&self, flag: FeatureFlag) -> bool {
        if flag.tenant_id != self.inner.options.tenant_id {
            return false;
        }
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.flags.apply(flag.clone()) {
            return false;
        }
        if let Some(snapshot) = state.snapshots.peek_mut(&self.inner.options.environment) {
            match snapshot.flags.iter_mut().find(|f| f.key == flag.key) {
                Some(held) => *held = flag,
                None => snapshot.flags.push(flag),
            }
        }
        true
    }

    /// Runs a distribution event through the monotonic guard and refetches
    /// when it announces a newer version. Returns whether a refetch happened.
    pub async fn handle_event(&self, event: &DistributionEvent) -> Result<bool, ClientError> {
        if event.tenant_id != self.inner.options.tenant_id {
            return Ok(false);
        }
        let announced = {
            let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
            state.flags.apply_event(event)
        };
        if !announced {
            debug!(flag_key = %event.flag_key, version = event.version, "ignoring stale event");
            return Ok(false);
        }
        self.inner.refresh().await?;
        Ok(true)
    }

    /// Version of the flag content currently held, `0` when none.
    pub fn flag_version(&self, flag_key: &str) -> u64 {
        let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
        state.flags.version(&self.inner.options.tenant_id, flag_key)
    }
}

async fn poll_loop(inner: Weak<Inner>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately and `start` already fetched.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                if let Err(err) = inner.refresh().await {
                    debug!(error = %err, "background refresh failed");
                }
            }
            _ = stop.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn flag(version: u64, on_value: &str) -> FeatureFlag {
        serde_json::from_value(json!({
            "tenantId": "tenant-a",
            "key": "checkout",
            "name": "Checkout",
            "enabled": true,
            "variants": {"on": on_value, "off": "control"},
            "fallthroughVariant": "on",
            "rules": [],
            "version": version,
            "createdAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap()
    }

    #[derive(Clone)]
    struct FakeSource {
        version: Arc<AtomicU32>,
        edit: Arc<std::sync::Mutex<String>>,
        failing: Arc<AtomicBool>,
        calls: Arc<AtomicU32>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                version: Arc::new(AtomicU32::new(1)),
                edit: Arc::new(std::sync::Mutex::new(String::new())),
                failing: Arc::new(AtomicBool::new(false)),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl ConfigSource for FakeSource {
        async fn fetch(&self, tenant_id: &str, environment: &str) -> Result<ConfigSnapshot, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ClientError::Status {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            let version = self.version.load(Ordering::SeqCst) as u64;
            let edit = self.edit.lock().unwrap().clone();
            Ok(ConfigSnapshot {
                tenant_id: tenant_id.to_string(),
                environment: environment.to_string(),
                generated_at: Utc::now(),
                flags: vec![flag(version, &format!("v{}{}", version, edit))],
            })
        }
    }

    fn client(source: FakeSource, mode: FallbackMode) -> FlagClient {
        FlagClient::builder(source)
            .tenant("tenant-a")
            .environment("production")
            .poll_interval(Duration::ZERO)
            .cache_ttl(Duration::from_secs(60))
            .fallback_mode(mode)
            .retry_policy(RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            })
            .build()
            .unwrap()
    }

    fn ctx() -> EvaluationContext {
        EvaluationContext::with_key("user-1")
    }

    #[test]
    fn test_builder_requires_tenant() {
        let err = FlagClient::builder(FakeSource::new()).build().err();
        assert!(matches!(err, Some(ClientError::Config(_))));
    }

    #[test]
    fn test_error_classification() {
        assert!(ClientError::Transport("reset".into()).is_retryable());
        assert!(ClientError::Status { status: 503, message: String::new() }.is_retryable());
        assert!(ClientError::Status { status: 429, message: String::new() }.is_retryable());
        assert!(!ClientError::Status { status: 403, message: String::new() }.is_retryable());
        assert!(!ClientError::Decode("eof".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_default_before_first_refresh() {
        let client = client(FakeSource::new(), FallbackMode::UseStale);
        assert_eq!(client.variation("checkout", &ctx(), json!("dflt")), json!("dflt"));
        client.refresh().await.unwrap();
        assert_eq!(client.variation("checkout", &ctx(), json!("dflt")), json!("v1"));
        assert_eq!(client.variation("missing", &ctx(), json!("dflt")), json!("dflt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_use_stale_keeps_serving_after_failure() {
        let source = FakeSource::new();
        let client = client(source.clone(), FallbackMode::UseStale);
        client.refresh().await.unwrap();

        source.failing.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(client.refresh().await.is_err());
        assert!(client.snapshot().is_none());
        assert_eq!(client.variation("checkout", &ctx(), json!("dflt")), json!("v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_default_until_refresh_succeeds() {
        let source = FakeSource::new();
        let client = client(source.clone(), FallbackMode::ServeDefault);
        client.refresh().await.unwrap();

        source.failing.store(true, Ordering::SeqCst);
        assert!(client.refresh().await.is_err());
        assert_eq!(client.variation("checkout", &ctx(), json!("dflt")), json!("dflt"));

        source.failing.store(false, Ordering::SeqCst);
        source.version.store(2, Ordering::SeqCst);
        client.refresh().await.unwrap();
        assert_eq!(client.variation("checkout", &ctx(), json!("dflt")), json!("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_variation_with_refresh_fetches_when_expired() {
        let source = FakeSource::new();
        let client = client(source.clone(), FallbackMode::UseStale);
        assert_eq!(
            client.variation_with_refresh("checkout", &ctx(), json!("dflt")).await,
            json!("v1")
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        client.variation_with_refresh("checkout", &ctx(), json!("dflt")).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        source.version.store(2, Ordering::SeqCst);
        assert_eq!(
            client.variation_with_refresh("checkout", &ctx(), json!("dflt")).await,
            json!("v2")
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_events_refetch_only_when_newer() {
        let source = FakeSource::new();
        let client = client(source.clone(), FallbackMode::UseStale);
        client.refresh().await.unwrap();

        source.version.store(2, Ordering::SeqCst);
        let newer = DistributionEvent::published("tenant-a", "checkout", 2, Utc::now());
        assert!(client.handle_event(&newer).await.unwrap());
        assert_eq!(client.flag_version("checkout"), 2);

        assert!(!client.handle_event(&newer).await.unwrap());
        let stale = DistributionEvent::published("tenant-a", "checkout", 1, Utc::now());
        assert!(!client.handle_event(&stale).await.unwrap());
        let foreign = DistributionEvent::published("tenant-b", "checkout", 9, Utc::now());
        assert!(!client.handle_event(&foreign).await.unwrap());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snapshot_never_regresses_pushed_flag() {
        let source = FakeSource::new();
        let client = client(source.clone(), FallbackMode::UseStale);
        client.refresh().await.unwrap();

        assert!(client.apply_flag(flag(5, "pushed")));
        client.refresh().await.unwrap();
        assert_eq!(client.flag_version("checkout"), 5);
        assert_eq!(client.variation("checkout", &ctx(), json!("dflt")), json!("pushed"));
    }

    #[tokio::test]
    async fn test_edit_without_version_bump_reaches_running_client() {
        let source = FakeSource::new();
        let running = client(source.clone(), FallbackMode::UseStale);
        running.refresh().await.unwrap();
        assert_eq!(running.variation("checkout", &ctx(), json!("dflt")), json!("v1"));

        *source.edit.lock().unwrap() = "-edited".to_string();
        running.refresh().await.unwrap();
        let started_later = client(source.clone(), FallbackMode::UseStale);
        started_later.refresh().await.unwrap();

        let held = running.snapshot().unwrap();
        assert_eq!(held.flag("checkout").unwrap().variants["on"], json!("v1-edited"));
        assert_eq!(running.variation("checkout", &ctx(), json!("dflt")), json!("v1-edited"));
        assert_eq!(
            started_later.variation("checkout", &ctx(), json!("dflt")),
            running.variation("checkout", &ctx(), json!("dflt"))
        );
        assert_eq!(running.flag_version("checkout"), 1);
    }

    #[tokio::test]
    async fn test_pushed_flag_is_evaluated_from_snapshot() {
        let source = FakeSource::new();
        let client = client(source.clone(), FallbackMode::UseStale);
        client.refresh().await.unwrap();

        assert!(client.apply_flag(flag(2, "pushed")));
        assert!(!client.apply_flag(flag(1, "older")));
        let held = client.snapshot().unwrap();
        assert_eq!(held.flags.len(), 1);
        assert_eq!(held.flag("checkout").unwrap().version, 2);
        assert_eq!(client.variation("checkout", &ctx(), json!("dflt")), json!("pushed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_refreshes_until_stopped() {
        let source = FakeSource::new();
        let client = FlagClient::builder(source.clone())
            .tenant("tenant-a")
            .poll_interval(Duration::from_secs(30))
            .build()
            .unwrap();
        client.start().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        source.version.store(3, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(client.flag_version("checkout"), 3);
        assert!(source.calls.load(Ordering::SeqCst) >= 2);

        client.stop().await;
        let calls = source.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
    }
}
