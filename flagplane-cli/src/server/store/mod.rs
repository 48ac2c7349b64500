pub mod memory;
pub mod sled_store;

#[cfg(test)]
pub mod faulty;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flagplane_lib::{
    validate_flag, AuditEntry, Environment, EnvironmentInput, FeatureFlag, FlagError, FlagId,
    FlagInput, FlagVersionRecord, Result, Segment, SegmentInput, ValidationIssue,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Extra controls for [`FlagStore::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Fail with `VersionConflict` unless the live version equals this.
    pub expected_version: Option<u64>,
    /// Replace the live version. Reserved for trusted callers.
    pub version_override: Option<u64>,
}

/// Flag Version Store. Owns flags and their append-only publish history,
/// plus the tenant's environments, segments and audit trail.
///
/// Every flag mutation is a read-then-replace on one `(tenant, key)` and
/// must be serialized per key; a failed mutation leaves the key untouched.
/// Environments and segments are plain records: creating one with a key
/// already in use replaces it.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Short backend name, used in logs and metrics.
    fn backend(&self) -> &'static str;

    async fn create(&self, input: FlagInput) -> Result<FeatureFlag>;

    async fn update(
        &self,
        tenant_id: &str,
        key: &str,
        input: FlagInput,
        opts: UpdateOptions,
    ) -> Result<FeatureFlag>;

    async fn get(&self, tenant_id: &str, key: &str) -> Result<Option<FeatureFlag>>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<FeatureFlag>>;

    async fn count(&self, tenant_id: &str) -> Result<usize> {
        Ok(self.list(tenant_id).await?.len())
    }

    async fn publish(&self, tenant_id: &str, key: &str, actor: &str) -> Result<FlagVersionRecord>;

    async fn rollback(
        &self,
        tenant_id: &str,
        key: &str,
        target_version: u64,
        actor: &str,
    ) -> Result<FlagVersionRecord>;

    async fn list_history(&self, tenant_id: &str, key: &str) -> Result<Vec<FlagVersionRecord>>;

    async fn create_environment(&self, input: EnvironmentInput) -> Result<Environment>;

    /// Environments of a tenant, ordered by key.
    async fn list_environments(&self, tenant_id: &str) -> Result<Vec<Environment>>;

    async fn create_segment(&self, input: SegmentInput) -> Result<Segment>;

    /// Segments of a tenant, ordered by key.
    async fn list_segments(&self, tenant_id: &str) -> Result<Vec<Segment>>;

    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;

    /// Audit entries of a tenant, oldest first.
    async fn list_audit(&self, tenant_id: &str) -> Result<Vec<AuditEntry>>;
}

// ── State transitions shared by every backend ───────────────

pub(crate) fn created(input: FlagInput, now: DateTime<Utc>) -> Result<FeatureFlag> {
    validate_flag(&input)?;
    Ok(FeatureFlag::from_input(input, 1, now))
}

pub(crate) fn updated(
    existing: &FeatureFlag,
    input: FlagInput,
    opts: UpdateOptions,
    now: DateTime<Utc>,
) -> Result<FeatureFlag> {
    if input.tenant_id != existing.tenant_id || input.key != existing.key {
        return Err(FlagError::Validation(vec![ValidationIssue::new(
            "key",
            "must match the flag being updated",
        )]));
    }
    validate_flag(&input)?;

    if let Some(expected) = opts.expected_version {
        if expected != existing.version {
            return Err(FlagError::VersionConflict {
                tenant_id: existing.tenant_id.clone(),
                key: existing.key.clone(),
                expected,
                actual: existing.version,
            });
        }
    }

    let mut flag = FeatureFlag::from_input(
        input,
        opts.version_override.unwrap_or(existing.version),
        now,
    );
    flag.created_at = existing.created_at;
    Ok(flag)
}

pub(crate) fn published(
    existing: &FeatureFlag,
    actor: &str,
    now: DateTime<Utc>,
) -> (FeatureFlag, FlagVersionRecord) {
    let mut flag = existing.clone();
    flag.version = existing.version + 1;
    flag.updated_at = now;
    let record = record_for(&flag, actor, now);
    (flag, record)
}

pub(crate) fn rolled_back(
    existing: &FeatureFlag,
    history: &[FlagVersionRecord],
    target_version: u64,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(FeatureFlag, FlagVersionRecord)> {
    let target = history
        .iter()
        .find(|record| record.version == target_version)
        .ok_or_else(|| FlagError::VersionNotFound {
            tenant_id: existing.tenant_id.clone(),
            key: existing.key.clone(),
            version: target_version,
        })?;

    let mut flag = target.flag.clone();
    flag.version = existing.version + 1;
    flag.created_at = existing.created_at;
    flag.updated_at = now;
    let record = record_for(&flag, actor, now);
    Ok((flag, record))
}

fn record_for(flag: &FeatureFlag, actor: &str, now: DateTime<Utc>) -> FlagVersionRecord {
    FlagVersionRecord {
        tenant_id: flag.tenant_id.clone(),
        flag_key: flag.key.clone(),
        version: flag.version,
        flag: flag.clone(),
        actor: actor.to_string(),
        created_at: now,
    }
}

// ── Per-key locking ─────────────────────────────────────────

/// One async mutex per flag. Entries are never removed since flags are
/// never deleted.
#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: StdMutex<HashMap<FlagId, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub(crate) async fn lock(&self, id: &FlagId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
