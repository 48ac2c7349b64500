//! Consumer-side caching: a TTL'd snapshot store and a per-flag
//! monotonic apply guard.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

use crate::flag::{ConfigSnapshot, DistributionEvent, FeatureFlag, FlagId};
use crate::tracker::VersionTracker;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

/// Values with a fixed lifetime measured on the monotonic clock.
///
/// Expired values are not dropped on read so that a caller configured to
/// serve stale data can still reach them through [`TtlCache::get_stale`].
#[derive(Debug, Clone)]
pub struct TtlCache<K, T> {
    entries: HashMap<K, CacheEntry<T>>,
}

impl<K: Eq + Hash, T> Default for TtlCache<K, T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, T> TtlCache<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value if it has not expired yet.
    pub fn get(&self, key: &K) -> Option<&T> {
        self.entries
            .get(key)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| &entry.value)
    }

    /// Returns the value regardless of expiry, with a flag telling whether
    /// it is still fresh.
    pub fn get_stale(&self, key: &K) -> Option<(&T, bool)> {
        self.entries
            .get(key)
            .map(|entry| (&entry.value, Instant::now() < entry.expires_at))
    }

    /// Mutable access regardless of expiry. The expiry is left untouched.
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut T> {
        self.entries.get_mut(key).map(|entry| &mut entry.value)
    }

    pub fn set(&mut self, key: K, value: T, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    pub fn delete(&mut self, key: &K) -> Option<T> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Flags held by one consumer, guarded so that a held flag is never
/// replaced by an older version.
///
/// Two watermarks are kept per flag: the version of the content actually
/// held, and the highest version announced by a distribution event. An
/// event never blocks the content it announces from being applied later.
#[derive(Debug, Default, Clone)]
pub struct MonotonicFlagCache {
    held: VersionTracker,
    announced: VersionTracker,
    flags: HashMap<FlagId, FeatureFlag>,
}

impl MonotonicFlagCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `flag` unless it is older than the held content. Edits keep
    /// the version, so content at the held version replaces it when it
    /// differs and was not updated earlier.
    pub fn apply(&mut self, flag: FeatureFlag) -> bool {
        let id = flag.id();
        let held = self.held.watermark(&flag.tenant_id, &flag.key);
        if flag.version < held {
            return false;
        }
        if let Some(current) = self.flags.get(&id).filter(|_| flag.version == held) {
            if *current == flag || flag.updated_at < current.updated_at {
                return false;
            }
        }
        self.held.mark_version(id.clone(), flag.version);
        self.announced.mark_version(id.clone(), flag.version);
        self.flags.insert(id, flag);
        true
    }

    /// Replaces every flag of `snapshot` with the held content for its key
    /// and appends held flags of the same tenant the snapshot lacks.
    pub fn overlay(&self, mut snapshot: ConfigSnapshot) -> ConfigSnapshot {
        for flag in snapshot.flags.iter_mut() {
            if let Some(held) = self.flags.get(&flag.id()) {
                *flag = held.clone();
            }
        }
        let mut extra: Vec<FeatureFlag> = self
            .flags
            .values()
            .filter(|f| f.tenant_id == snapshot.tenant_id && snapshot.flag(&f.key).is_none())
            .cloned()
            .collect();
        extra.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot.flags.extend(extra);
        snapshot
    }

    /// Applies every flag of a snapshot, returning the keys that changed.
    pub fn apply_snapshot(&mut self, snapshot: &ConfigSnapshot) -> Vec<String> {
        snapshot
            .flags
            .iter()
            .filter(|flag| self.apply((*flag).clone()))
            .map(|flag| flag.key.clone())
            .collect()
    }

    /// Records an announced version. Returns `true` when the event is newer
    /// than both the held content and any earlier announcement, meaning the
    /// consumer should fetch the new content.
    pub fn apply_event(&mut self, event: &DistributionEvent) -> bool {
        let id = event.flag_id();
        if !self.held.should_apply_version(&id, event.version)
            || !self.announced.should_apply_version(&id, event.version)
        {
            return false;
        }
        self.announced.mark_version(id, event.version);
        true
    }

    /// Whether an announced version is still missing from the held content.
    pub fn is_behind(&self, tenant_id: &str, flag_key: &str) -> bool {
        self.announced.watermark(tenant_id, flag_key) > self.held.watermark(tenant_id, flag_key)
    }

    pub fn flag(&self, tenant_id: &str, flag_key: &str) -> Option<&FeatureFlag> {
        self.flags.get(&FlagId::new(tenant_id, flag_key))
    }

    /// Version of the held content, `0` when none is held.
    pub fn version(&self, tenant_id: &str, flag_key: &str) -> u64 {
        self.held.watermark(tenant_id, flag_key)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}
