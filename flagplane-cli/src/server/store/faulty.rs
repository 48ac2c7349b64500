//! Store wrapper that injects transient faults, for exercising failure paths.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use flagplane_lib::{
    AuditEntry, Environment, EnvironmentInput, FeatureFlag, FlagError, FlagInput,
    FlagVersionRecord, Result, Segment, SegmentInput,
};

use super::memory::MemoryStore;
use super::{FlagStore, UpdateOptions};

/// Fails the next `n` mutations (publish, rollback, update) for flags whose
/// key equals `failing_key`, then delegates.
pub struct FaultyStore {
    pub inner: MemoryStore,
    failing_key: String,
    remaining: AtomicU32,
}

impl FaultyStore {
    pub fn new(failing_key: &str, failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_key: failing_key.to_string(),
            remaining: AtomicU32::new(failures),
        }
    }

    fn inject(&self, key: &str, op: &'static str) -> Result<()> {
        if key != self.failing_key {
            return Ok(());
        }
        let took = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(FlagError::transient(op, "injected fault"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FlagStore for FaultyStore {
    fn backend(&self) -> &'static str {
        "faulty"
    }

    async fn create(&self, input: FlagInput) -> Result<FeatureFlag> {
        self.inner.create(input).await
    }

    async fn update(
        &self,
        tenant_id: &str,
        key: &str,
        input: FlagInput,
        opts: UpdateOptions,
    ) -> Result<FeatureFlag> {
        self.inject(key, "update")?;
        self.inner.update(tenant_id, key, input, opts).await
    }

    async fn get(&self, tenant_id: &str, key: &str) -> Result<Option<FeatureFlag>> {
        self.inner.get(tenant_id, key).await
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<FeatureFlag>> {
        self.inner.list(tenant_id).await
    }

    async fn publish(&self, tenant_id: &str, key: &str, actor: &str) -> Result<FlagVersionRecord> {
        self.inject(key, "publish")?;
        self.inner.publish(tenant_id, key, actor).await
    }

    async fn rollback(
        &self,
        tenant_id: &str,
        key: &str,
        target_version: u64,
        actor: &str,
    ) -> Result<FlagVersionRecord> {
        self.inject(key, "rollback")?;
        self.inner.rollback(tenant_id, key, target_version, actor).await
    }

    async fn list_history(&self, tenant_id: &str, key: &str) -> Result<Vec<FlagVersionRecord>> {
        self.inner.list_history(tenant_id, key).await
    }

    async fn create_environment(&self, input: EnvironmentInput) -> Result<Environment> {
        self.inner.create_environment(input).await
    }

    async fn list_environments(&self, tenant_id: &str) -> Result<Vec<Environment>> {
        self.inner.list_environments(tenant_id).await
    }

    async fn create_segment(&self, input: SegmentInput) -> Result<Segment> {
        self.inner.create_segment(input).await
    }

    async fn list_segments(&self, tenant_id: &str) -> Result<Vec<Segment>> {
        self.inner.list_segments(tenant_id).await
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.inner.append_audit(entry).await
    }

    async fn list_audit(&self, tenant_id: &str) -> Result<Vec<AuditEntry>> {
        self.inner.list_audit(tenant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::store::tests::input;
    use flagplane_lib::{with_retry_if, RetryPolicy};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_fault_on_one_key_leaves_others_intact() {
        let store = FaultyStore::new("checkout", 1);
        store.create(input("tenant-a", "checkout", "off")).await.unwrap();
        store.create(input("tenant-a", "search", "off")).await.unwrap();

        let err = store.publish("tenant-a", "checkout", "admin").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.get("tenant-a", "checkout").await.unwrap().unwrap().version, 1);
        assert!(store.list_history("tenant-a", "checkout").await.unwrap().is_empty());

        let search = store.publish("tenant-a", "search", "admin").await.unwrap();
        assert_eq!(search.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_faults() {
        let store = FaultyStore::new("checkout", 2);
        store.create(input("tenant-a", "checkout", "off")).await.unwrap();

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            jitter_ratio: 0.0,
        };
        let record = with_retry_if(
            &policy,
            || store.publish("tenant-a", "checkout", "admin"),
            FlagError::is_retryable,
        )
        .await
        .unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(store.list_history("tenant-a", "checkout").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let store = FaultyStore::new("checkout", 0);
        let policy = RetryPolicy::default().no_jitter();
        let err = with_retry_if(
            &policy,
            || store.publish("tenant-a", "missing", "admin"),
            FlagError::is_retryable,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FlagError::NotFound { .. }));
    }
}
