use async_trait::async_trait;
use chrono::Utc;
use flagplane_lib::{
    AuditEntry, Environment, EnvironmentInput, FeatureFlag, FlagError, FlagId, FlagInput,
    FlagVersionRecord, Result, Segment, SegmentInput,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use super::{created, published, rolled_back, updated, FlagStore, KeyLocks, UpdateOptions};

/// Persistent store backed by sled.
///
/// Layout, with NUL-separated segments:
/// - `flag\0{tenant}\0{key}` → live flag JSON
/// - `hist\0{tenant}\0{key}\0{version:020}` → history record JSON
/// - `env\0{tenant}\0{key}` and `seg\0{tenant}\0{key}` → environment and segment JSON
/// - `audit\0{tenant}\0{id:020}` → audit entry JSON, `id` from `generate_id`
///
/// The live flag and its new history record go into one atomic batch.
pub struct SledStore {
    db: sled::Db,
    locks: KeyLocks,
}

impl SledStore {
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            locks: KeyLocks::default(),
        }
    }

    /// Open a sled database at the given directory path.
    pub fn open(data_dir: &str) -> std::result::Result<Self, String> {
        let db = sled::open(data_dir).map_err(|e| format!("failed to open sled db: {}", e))?;
        Ok(Self::new(db))
    }

    fn flag_key(tenant_id: &str, key: &str) -> Vec<u8> {
        format!("flag\0{}\0{}", tenant_id, key).into_bytes()
    }

    fn tenant_prefix(tenant_id: &str) -> Vec<u8> {
        format!("flag\0{}\0", tenant_id).into_bytes()
    }

    fn history_prefix(tenant_id: &str, key: &str) -> Vec<u8> {
        format!("hist\0{}\0{}\0", tenant_id, key).into_bytes()
    }

    fn history_key(tenant_id: &str, key: &str, version: u64) -> Vec<u8> {
        format!("hist\0{}\0{}\0{:020}", tenant_id, key, version).into_bytes()
    }

    fn record_key(kind: &str, tenant_id: &str, key: &str) -> Vec<u8> {
        format!("{}\0{}\0{}", kind, tenant_id, key).into_bytes()
    }

    fn record_prefix(kind: &str, tenant_id: &str) -> Vec<u8> {
        format!("{}\0{}\0", kind, tenant_id).into_bytes()
    }

    fn scan<T: DeserializeOwned>(&self, prefix: Vec<u8>, op: &'static str) -> Result<Vec<T>> {
        self.db
            .scan_prefix(prefix)
            .map(|item| {
                let (_, value) = item.map_err(|e| FlagError::transient(op, e))?;
                decode(&value, op)
            })
            .collect()
    }

    fn read_flag(&self, tenant_id: &str, key: &str, op: &'static str) -> Result<Option<FeatureFlag>> {
        let raw = self
            .db
            .get(Self::flag_key(tenant_id, key))
            .map_err(|e| FlagError::transient(op, e))?;
        raw.map(|bytes| decode(&bytes, op)).transpose()
    }

    fn require_flag(&self, tenant_id: &str, key: &str, op: &'static str) -> Result<FeatureFlag> {
        self.read_flag(tenant_id, key, op)?
            .ok_or_else(|| FlagError::flag_not_found(tenant_id, key))
    }

    fn read_history(&self, tenant_id: &str, key: &str, op: &'static str) -> Result<Vec<FlagVersionRecord>> {
        self.scan(Self::history_prefix(tenant_id, key), op)
    }

    /// Writes the live flag, plus an optional history record, atomically.
    async fn commit(
        &self,
        flag: &FeatureFlag,
        record: Option<&FlagVersionRecord>,
        op: &'static str,
    ) -> Result<()> {
        let mut batch = sled::Batch::default();
        batch.insert(Self::flag_key(&flag.tenant_id, &flag.key), encode(flag, op)?);
        if let Some(record) = record {
            batch.insert(
                Self::history_key(&record.tenant_id, &record.flag_key, record.version),
                encode(record, op)?,
            );
        }
        self.persist(batch, op).await
    }

    /// Applies `batch` atomically, then flushes. The batch is visible to
    /// readers once applied, so a failed flush is only logged.
    async fn persist(&self, batch: sled::Batch, op: &'static str) -> Result<()> {
        self.db
            .apply_batch(batch)
            .map_err(|e| FlagError::transient(op, e))?;
        flushed(self.db.flush_async().await, op);
        Ok(())
    }

    async fn put<T: Serialize>(&self, key: Vec<u8>, value: &T, op: &'static str) -> Result<()> {
        let mut batch = sled::Batch::default();
        batch.insert(key, encode(value, op)?);
        self.persist(batch, op).await
    }
}

fn flushed(result: sled::Result<usize>, op: &'static str) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            warn!(operation = op, error = %e, "flush after write failed");
            false
        }
    }
}

fn encode<T: Serialize>(value: &T, op: &'static str) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| FlagError::transient(op, e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], op: &'static str) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| FlagError::transient(op, format!("corrupt record: {}", e)))
}

#[async_trait]
impl FlagStore for SledStore {
    fn backend(&self) -> &'static str {
        "sled"
    }

    async fn create(&self, input: FlagInput) -> Result<FeatureFlag> {
        let id = input.id();
        let _guard = self.locks.lock(&id).await;
        if self.read_flag(&id.tenant_id, &id.key, "create")?.is_some() {
            return Err(FlagError::Conflict {
                tenant_id: id.tenant_id,
                key: id.key,
            });
        }

        let flag = created(input, Utc::now())?;
        self.commit(&flag, None, "create").await?;
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
        let _guard = self.locks.lock(&FlagId::new(tenant_id, key)).await;
        let existing = self.require_flag(tenant_id, key, "update")?;
        let flag = updated(&existing, input, opts, Utc::now())?;
        self.commit(&flag, None, "update").await?;
        info!(tenant_id, flag_key = key, version = flag.version, "flag updated");
        Ok(flag)
    }

    async fn get(&self, tenant_id: &str, key: &str) -> Result<Option<FeatureFlag>> {
        self.read_flag(tenant_id, key, "get")
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<FeatureFlag>> {
        self.scan(Self::tenant_prefix(tenant_id), "list")
    }

    async fn count(&self, tenant_id: &str) -> Result<usize> {
        let mut count = 0;
        for item in self.db.scan_prefix(Self::tenant_prefix(tenant_id)).keys() {
            item.map_err(|e| FlagError::transient("count", e))?;
            count += 1;
        }
        Ok(count)
    }

    async fn publish(&self, tenant_id: &str, key: &str, actor: &str) -> Result<FlagVersionRecord> {
        let _guard = self.locks.lock(&FlagId::new(tenant_id, key)).await;
        let existing = self.require_flag(tenant_id, key, "publish")?;
        let (flag, record) = published(&existing, actor, Utc::now());
        self.commit(&flag, Some(&record), "publish").await?;
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
        let _guard = self.locks.lock(&FlagId::new(tenant_id, key)).await;
        let existing = self.require_flag(tenant_id, key, "rollback")?;
        let history = self.read_history(tenant_id, key, "rollback")?;
        let (flag, record) = rolled_back(&existing, &history, target_version, actor, Utc::now())?;
        self.commit(&flag, Some(&record), "rollback").await?;
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
        self.read_history(tenant_id, key, "list_history")
    }

    async fn create_environment(&self, input: EnvironmentInput) -> Result<Environment> {
        let environment = Environment::from_input(input, Utc::now());
        let key = Self::record_key("env", &environment.tenant_id, &environment.key);
        self.put(key, &environment, "create_environment").await?;
        info!(tenant_id = %environment.tenant_id, key = %environment.key, "environment created");
        Ok(environment)
    }

    async fn list_environments(&self, tenant_id: &str) -> Result<Vec<Environment>> {
        self.scan(Self::record_prefix("env", tenant_id), "list_environments")
    }

    async fn create_segment(&self, input: SegmentInput) -> Result<Segment> {
        let segment = Segment::from_input(input, Utc::now());
        let key = Self::record_key("seg", &segment.tenant_id, &segment.key);
        self.put(key, &segment, "create_segment").await?;
        info!(tenant_id = %segment.tenant_id, key = %segment.key, "segment created");
        Ok(segment)
    }

    async fn list_segments(&self, tenant_id: &str) -> Result<Vec<Segment>> {
        self.scan(Self::record_prefix("seg", tenant_id), "list_segments")
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        let seq = self
            .db
            .generate_id()
            .map_err(|e| FlagError::transient("append_audit", e))?;
        let key = Self::record_key("audit", &entry.tenant_id, &format!("{:020}", seq));
        self.put(key, &entry, "append_audit").await
    }

    async fn list_audit(&self, tenant_id: &str) -> Result<Vec<AuditEntry>> {
        self.scan(Self::record_prefix("audit", tenant_id), "list_audit")
    }
}
