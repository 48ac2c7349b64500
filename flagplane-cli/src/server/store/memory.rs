use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flagplane_lib::{
    AuditEntry, Environment, EnvironmentInput, FeatureFlag, FlagError, FlagId, FlagInput,
    FlagVersionRecord, Result, Segment, SegmentInput,
};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use super::{created, published, rolled_back, updated, FlagStore, UpdateOptions};

struct FlagEntry {
    flag: FeatureFlag,
    history: Vec<FlagVersionRecord>,
}

#[derive(Default)]
struct Records {
    environments: BTreeMap<(String, String), Environment>,
    segments: BTreeMap<(String, String), Segment>,
    audit: Vec<AuditEntry>,
}

/// In-memory store. The outer map only changes on create; each flag sits
/// behind its own mutex so mutations on different keys never contend.
pub struct MemoryStore {
    flags: RwLock<BTreeMap<FlagId, Arc<Mutex<FlagEntry>>>>,
    records: RwLock<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(BTreeMap::new()),
            records: RwLock::new(Records::default()),
        }
    }

    async fn entry(&self, tenant_id: &str, key: &str) -> Result<Arc<Mutex<FlagEntry>>> {
        let flags = self.flags.read().await;
        flags
            .get(&FlagId::new(tenant_id, key))
            .cloned()
            .ok_or_else(|| FlagError::flag_not_found(tenant_id, key))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, input: FlagInput) -> Result<FeatureFlag> {
        let id = input.id();
        let mut flags = self.flags.write().await;
        if flags.contains_key(&id) {
            return Err(FlagError::Conflict {
                tenant_id: id.tenant_id,
                key: id.key,
            });
        }

        let flag = created(input, Utc::now())?;
        flags.insert(
            id,
            Arc::new(Mutex::new(FlagEntry {
                flag: flag.clone(),
                history: Vec::new(),
            })),
        );
        info!(tenant_id = %flag.tenant_id, flag_key = %flag.key, "flag created");
        Ok(flag)
    }

    async fn update(
        &self,
        tenant_id: &str,
        key: &str,
        input: FlagInput,
        opts: UpdateOptions,
    ) -> Result<FeatureFlag> {
        let entry = self.entry(tenant_id, key).await?;
        let mut entry = entry.lock().await;
        let flag = updated(&entry.flag, input, opts, Utc::now())?;
        entry.flag = flag.clone();
        info!(tenant_id, flag_key = key, version = flag.version, "flag updated");
        Ok(flag)
    }

    async fn get(&self, tenant_id: &str, key: &str) -> Result<Option<FeatureFlag>> {
        match self.entry(tenant_id, key).await {
            Ok(entry) => Ok(Some(entry.lock().await.flag.clone())),
            Err(FlagError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<FeatureFlag>> {
        let entries: Vec<_> = {
            let flags = self.flags.read().await;
            flags
                .iter()
                .filter(|(id, _)| id.tenant_id == tenant_id)
                .map(|(_, entry)| Arc::clone(entry))
                .collect()
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.flag.clone());
        }
        Ok(out)
    }

    async fn count(&self, tenant_id: &str) -> Result<usize> {
        let flags = self.flags.read().await;
        Ok(flags.keys().filter(|id| id.tenant_id == tenant_id).count())
    }

    async fn publish(&self, tenant_id: &str, key: &str, actor: &str) -> Result<FlagVersionRecord> {
        let entry = self.entry(tenant_id, key).await?;
        let mut entry = entry.lock().await;
        let (flag, record) = published(&entry.flag, actor, Utc::now());
        entry.flag = flag;
        entry.history.push(record.clone());
        info!(tenant_id, flag_key = key, version = record.version, actor, "flag published");
        Ok(record)
    }

    async fn rollback(
        &self,
        tenant_id: &str,
        key: &str,
        target_version: u64,
        actor: &str,
    ) -> Result<FlagVersionRecord> {
        let entry = self.entry(tenant_id, key).await?;
        let mut entry = entry.lock().await;
        let (flag, record) =
            rolled_back(&entry.flag, &entry.history, target_version, actor, Utc::now())?;
        entry.flag = flag;
        entry.history.push(record.clone());
        info!(
            tenant_id,
            flag_key = key,
            target_version,
            version = record.version,
            actor,
            "flag rolled back"
        );
        Ok(record)
    }

    async fn list_history(&self, tenant_id: &str, key: &str) -> Result<Vec<FlagVersionRecord>> {
        match self.entry(tenant_id, key).await {
            Ok(entry) => Ok(entry.lock().await.history.clone()),
            Err(FlagError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn create_environment(&self, input: EnvironmentInput) -> Result<Environment> {
        let environment = Environment::from_input(input, Utc::now());
        let id = (environment.tenant_id.clone(), environment.key.clone());
        self.records.write().await.environments.insert(id, environment.clone());
        info!(tenant_id = %environment.tenant_id, key = %environment.key, "environment created");
        Ok(environment)
    }

    async fn list_environments(&self, tenant_id: &str) -> Result<Vec<Environment>> {
        let records = self.records.read().await;
        Ok(records
            .environments
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn create_segment(&self, input: SegmentInput) -> Result<Segment> {
        let segment = Segment::from_input(input, Utc::now());
        let id = (segment.tenant_id.clone(), segment.key.clone());
        self.records.write().await.segments.insert(id, segment.clone());
        info!(tenant_id = %segment.tenant_id, key = %segment.key, "segment created");
        Ok(segment)
    }

    async fn list_segments(&self, tenant_id: &str) -> Result<Vec<Segment>> {
        let records = self.records.read().await;
        Ok(records
            .segments
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.records.write().await.audit.push(entry);
        Ok(())
    }

    async fn list_audit(&self, tenant_id: &str) -> Result<Vec<AuditEntry>> {
        let records = self.records.read().await;
        Ok(records
            .audit
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
