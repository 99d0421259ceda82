//! Maintenance cycle reports

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::types::Tier;

/// Per-tier counts for one maintenance cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierReport {
    /// Records whose strength was decayed and written back
    pub decayed: usize,
    /// Records deleted for falling to their forgetting threshold
    pub removed: usize,
    /// Records marked forgotten instead of deleted
    pub forgotten: usize,
    /// Records removed by the tier's own cleanup
    pub cleaned: usize,
    /// Promotion candidates selected from this tier
    pub candidates: usize,
    /// Records moved out of this tier into the next one
    pub consolidated: usize,
}

/// Result of a maintenance cycle.
///
/// Failures of individual steps or candidates are collected in `errors`;
/// the counts reflect whatever completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub tiers: BTreeMap<Tier, TierReport>,
    /// Smoothed pressure per tier after the refresh step
    pub pressure: BTreeMap<Tier, f32>,
    pub errors: Vec<String>,
}

impl MaintenanceReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            tiers: Tier::ALL
                .into_iter()
                .map(|tier| (tier, TierReport::default()))
                .collect(),
            pressure: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn tier(&self, tier: Tier) -> TierReport {
        self.tiers.get(&tier).copied().unwrap_or_default()
    }

    pub(crate) fn tier_mut(&mut self, tier: Tier) -> &mut TierReport {
        self.tiers.entry(tier).or_default()
    }

    pub(crate) fn error(&mut self, context: &str, err: impl std::fmt::Display) {
        tracing::warn!(context, error = %err, "Maintenance step failed");
        self.errors.push(format!("{context}: {err}"));
    }

    pub fn total_decayed(&self) -> usize {
        self.tiers.values().map(|t| t.decayed).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.tiers.values().map(|t| t.removed + t.forgotten).sum()
    }

    pub fn total_consolidated(&self) -> usize {
        self.tiers.values().map(|t| t.consolidated).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_report_has_every_tier() {
        let report = MaintenanceReport::new(Utc::now());
        assert_eq!(report.tiers.len(), 3);
        assert!(report.is_clean());
        assert_eq!(report.tier(Tier::Long), TierReport::default());
    }

    #[test]
    fn test_totals() {
        let mut report = MaintenanceReport::new(Utc::now());
        report.tier_mut(Tier::Medium).decayed = 4;
        report.tier_mut(Tier::Long).decayed = 1;
        report.tier_mut(Tier::Medium).removed = 2;
        report.tier_mut(Tier::Long).forgotten = 1;
        report.tier_mut(Tier::Short).consolidated = 3;
        report.error("decay mtm", "disk gone");

        assert_eq!(report.total_decayed(), 5);
        assert_eq!(report.total_removed(), 3);
        assert_eq!(report.total_consolidated(), 3);
        assert_eq!(report.errors, vec!["decay mtm: disk gone"]);
        assert!(!report.is_clean());
    }
}
