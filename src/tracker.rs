use std::collections::HashMap;

use crate::flag::{DistributionEvent, FlagId};

/// Per-consumer watermark of the highest flag version applied.
///
/// Delivery may duplicate or reorder events; only a strictly higher
/// version than the watermark is accepted, so the watermark for a key can
/// only ever move forward.
#[derive(Debug, Default, Clone)]
pub struct VersionTracker {
    latest: HashMap<FlagId, u64>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest applied version for a flag, `0` when nothing was applied.
    pub fn watermark(&self, tenant_id: &str, flag_key: &str) -> u64 {
        self.latest
            .get(&FlagId::new(tenant_id, flag_key))
            .copied()
            .unwrap_or(0)
    }

    pub fn should_apply_version(&self, id: &FlagId, version: u64) -> bool {
        version > self.latest.get(id).copied().unwrap_or(0)
    }

    pub fn mark_version(&mut self, id: FlagId, version: u64) {
        let current = self.latest.entry(id).or_insert(0);
        if version > *current {
            *current = version;
        }
    }

    pub fn should_apply(&self, event: &DistributionEvent) -> bool {
        self.should_apply_version(&event.flag_id(), event.version)
    }

    pub fn mark_applied(&mut self, event: &DistributionEvent) {
        self.mark_version(event.flag_id(), event.version);
    }

    /// Checks and marks in one step. Returns whether the event was new.
    pub fn observe(&mut self, event: &DistributionEvent) -> bool {
        if !self.should_apply(event) {
            return false;
        }
        self.mark_applied(event);
        true
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn event(key: &str, version: u64) -> DistributionEvent {
        DistributionEvent::published("tenant-a", key, version, Utc::now())
    }

    #[test]
    fn test_duplicates_and_stale_events_are_dropped() {
        let mut tracker = VersionTracker::new();
        let applied: Vec<u64> = [1, 2, 2, 1, 3]
            .into_iter()
            .map(|v| event("checkout", v))
            .filter(|e| tracker.observe(e))
            .map(|e| e.version)
            .collect();
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(tracker.watermark("tenant-a", "checkout"), 3);
    }

    #[test]
    fn test_default_watermark_is_zero() {
        let tracker = VersionTracker::new();
        assert_eq!(tracker.watermark("tenant-a", "checkout"), 0);
        assert!(tracker.should_apply(&event("checkout", 1)));
        assert!(!tracker.should_apply(&event("checkout", 0)));
    }

    #[test]
    fn test_keys_and_tenants_are_independent() {
        let mut tracker = VersionTracker::new();
        assert!(tracker.observe(&event("checkout", 5)));
        assert!(tracker.observe(&event("search", 1)));
        let other_tenant = DistributionEvent::published("tenant-b", "checkout", 1, Utc::now());
        assert!(tracker.observe(&other_tenant));
        assert_eq!(tracker.watermark("tenant-a", "checkout"), 5);
        assert_eq!(tracker.watermark("tenant-b", "checkout"), 1);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn test_mark_applied_never_lowers() {
        let mut tracker = VersionTracker::new();
        tracker.mark_applied(&event("checkout", 4));
        tracker.mark_applied(&event("checkout", 2));
        assert_eq!(tracker.watermark("tenant-a", "checkout"), 4);
    }

    proptest! {
        #[test]
        fn prop_applied_versions_strictly_increase(versions in prop::collection::vec(0u64..20, 0..60)) {
            let mut tracker = VersionTracker::new();
            let applied: Vec<u64> = versions
                .iter()
                .map(|v| event("checkout", *v))
                .filter(|e| tracker.observe(e))
                .map(|e| e.version)
                .collect();
            prop_assert!(applied.windows(2).all(|w| w[0] < w[1]));
            let max = versions.iter().copied().max().unwrap_or(0);
            prop_assert_eq!(tracker.watermark("tenant-a", "checkout"), max);
        }
    }
}
