//! In-memory tier store
//!
//! A `DashMap`-backed [`TierStore`] with optional TTL expiry and a soft
//! capacity hint honoured by `cleanup()`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::types::{MemoryRecord, RecordStatus, Tier};
use crate::storage::{RecordFilter, TierStore};

/// Configuration for an in-memory tier
#[derive(Debug, Clone)]
pub struct InMemoryTierConfig {
    /// Records not accessed for this long are removed by cleanup
    pub ttl: Option<Duration>,
    /// Cleanup evicts lowest-priority records while at or above this size
    pub capacity_hint: Option<usize>,
    /// Maximum records evicted by priority in one cleanup call
    pub eviction_batch: usize,
    pub max_strength: f32,
}

impl Default for InMemoryTierConfig {
    fn default() -> Self {
        Self {
            ttl: None,
            capacity_hint: None,
            eviction_batch: 64,
            max_strength: 1.0,
        }
    }
}

impl InMemoryTierConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_capacity_hint(mut self, capacity: usize) -> Self {
        self.capacity_hint = Some(capacity);
        self
    }

    pub fn with_eviction_batch(mut self, batch: usize) -> Self {
        self.eviction_batch = batch;
        self
    }
}

/// Tier store kept entirely in process memory
#[derive(Debug)]
pub struct InMemoryTier {
    tier: Tier,
    records: DashMap<String, MemoryRecord>,
    config: InMemoryTierConfig,
}

impl InMemoryTier {
    pub fn new(tier: Tier) -> Self {
        Self::with_config(tier, InMemoryTierConfig::default())
    }

    pub fn with_config(tier: Tier, config: InMemoryTierConfig) -> Self {
        Self {
            tier,
            records: DashMap::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of every record, forgotten ones included
    pub fn snapshot(&self) -> Vec<MemoryRecord> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }

    /// Keep-priority used when evicting. Lower is evicted first.
    ///
    /// - effective strength scaled by importance
    /// - recency bonus: 0.3 / (1 + hours_since_access / 24)
    fn keep_priority(&self, record: &MemoryRecord) -> f32 {
        let hours_since_access = (Utc::now() - record.last_accessed_at).num_hours().max(0) as f32;
        let recency_bonus = 0.3 / (1.0 + hours_since_access / 24.0);
        record.effective_strength(self.config.max_strength) * (0.5 + record.importance)
            + recency_bonus
    }

    fn remove_where(&self, predicate: impl Fn(&MemoryRecord) -> bool) -> usize {
        let doomed: Vec<String> = self
            .records
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.key().clone())
            .collect();
        doomed
            .iter()
            .filter(|id| self.records.remove(id.as_str()).is_some())
            .count()
    }
}

#[async_trait]
impl TierStore for InMemoryTier {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn count(&self, filter: Option<&RecordFilter>) -> Result<usize> {
        Ok(match filter {
            None => self.records.len(),
            Some(filter) => self.records.iter().filter(|e| filter.matches(e.value())).count(),
        })
    }

    async fn store(&self, mut record: MemoryRecord) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        record.id = id.clone();
        record.tier = self.tier;
        self.records.insert(id.clone(), record);
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<MemoryRecord>> {
        Ok(self.records.get(id).map(|e| e.value().clone()))
    }

    async fn update(&self, record: &MemoryRecord) -> Result<bool> {
        match self.records.get_mut(&record.id) {
            Some(mut entry) => {
                let mut updated = record.clone();
                updated.tier = self.tier;
                *entry = updated;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.remove(id).is_some())
    }

    async fn cleanup(&self) -> Result<usize> {
        let mut removed = self.remove_where(|r| r.status == RecordStatus::Forgotten);

        let cutoff = self
            .config
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        if let Some(cutoff) = cutoff {
            removed += self.remove_where(|r| r.last_accessed_at < cutoff);
        }

        if let Some(capacity) = self.config.capacity_hint {
            let len = self.records.len();
            if len >= capacity {
                let excess = (len + 1 - capacity).min(self.config.eviction_batch);
                let mut ranked: Vec<(String, f32)> = self
                    .records
                    .iter()
                    .map(|e| (e.key().clone(), self.keep_priority(e.value())))
                    .collect();
                ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                removed += ranked
                    .into_iter()
                    .take(excess)
                    .filter(|(id, _)| self.records.remove(id.as_str()).is_some())
                    .count();
            }
        }

        if removed > 0 {
            tracing::debug!(tier = %self.tier, removed, "In-memory tier cleanup");
        }
        Ok(removed)
    }

    async fn query(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<MemoryRecord>> {
        let mut matches: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(limit);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PromotionCriteria;
    use chrono::Duration as ChronoDuration;

    fn record(content: &str, importance: f32) -> MemoryRecord {
        MemoryRecord::new(content, importance)
    }

    #[tokio::test]
    async fn test_store_assigns_id_and_tier() {
        let tier = InMemoryTier::new(Tier::Medium);
        let original = record("hello", 0.5);
        let original_id = original.id.clone();

        let id = tier.store(original).await.unwrap();
        assert_ne!(id, original_id);

        let stored = tier.retrieve(&id).await.unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.tier, Tier::Medium);
        assert_eq!(stored.content, "hello");
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let tier = InMemoryTier::new(Tier::Short);
        let id = tier.store(record("x", 0.5)).await.unwrap();

        let mut stored = tier.retrieve(&id).await.unwrap().unwrap();
        stored.mark_accessed();
        assert!(tier.update(&stored).await.unwrap());
        assert_eq!(tier.retrieve(&id).await.unwrap().unwrap().access_count, 1);

        assert!(tier.delete(&id).await.unwrap());
        assert!(!tier.delete(&id).await.unwrap());
        assert!(!tier.update(&stored).await.unwrap());
        assert!(tier.retrieve(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_count_and_query_filters() {
        let tier = InMemoryTier::new(Tier::Short);
        for importance in [0.1, 0.5, 0.9] {
            tier.store(record("x", importance)).await.unwrap();
        }

        let filter = RecordFilter::new().with_min_importance(0.5);
        assert_eq!(tier.count(None).await.unwrap(), 3);
        assert_eq!(tier.count(Some(&filter)).await.unwrap(), 2);
        assert_eq!(tier.query(&filter, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_purges_forgotten() {
        let tier = InMemoryTier::new(Tier::Medium);
        let id = tier.store(record("x", 0.5)).await.unwrap();
        tier.store(record("y", 0.5)).await.unwrap();

        let mut stored = tier.retrieve(&id).await.unwrap().unwrap();
        stored.status = RecordStatus::Forgotten;
        tier.update(&stored).await.unwrap();

        assert_eq!(tier.count(None).await.unwrap(), 2);
        assert_eq!(tier.count(Some(&RecordFilter::new())).await.unwrap(), 1);
        assert_eq!(tier.cleanup().await.unwrap(), 1);
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_expires_by_ttl() {
        let config = InMemoryTierConfig::default().with_ttl(Duration::from_secs(60));
        let tier = InMemoryTier::with_config(Tier::Short, config);

        let mut stale = record("stale", 0.5);
        stale.last_accessed_at = Utc::now() - ChronoDuration::minutes(5);
        tier.store(stale).await.unwrap();
        tier.store(record("fresh", 0.5)).await.unwrap();

        assert_eq!(tier.cleanup().await.unwrap(), 1);
        let remaining = tier.query(&RecordFilter::new(), 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "fresh");
    }

    #[tokio::test]
    async fn test_cleanup_evicts_lowest_priority_over_capacity() {
        let config = InMemoryTierConfig::default().with_capacity_hint(2);
        let tier = InMemoryTier::with_config(Tier::Short, config);

        let mut weak = record("weak", 0.0);
        weak.strength = 0.1;
        weak.last_accessed_at = Utc::now() - ChronoDuration::days(10);
        tier.store(weak).await.unwrap();
        tier.store(record("strong", 0.9)).await.unwrap();

        // At the hint: one record must go to make room
        assert_eq!(tier.cleanup().await.unwrap(), 1);
        let remaining = tier.query(&RecordFilter::new(), 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "strong");
    }

    #[tokio::test]
    async fn test_promotion_candidates_default_impl() {
        let tier = InMemoryTier::new(Tier::Short);
        tier.store(record("low", 0.1)).await.unwrap();
        tier.store(record("mid", 0.7)).await.unwrap();
        tier.store(record("high", 0.95)).await.unwrap();

        let criteria = PromotionCriteria {
            min_importance: 0.6,
            min_access_count: 100,
            min_strength: 0.0,
            max_strength: 1.0,
        };
        let candidates = tier.promotion_candidates(&criteria, 10).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].content, "high");
        assert_eq!(candidates[1].content, "mid");
    }

    #[tokio::test]
    async fn test_decay_candidates_stalest_first() {
        let tier = InMemoryTier::new(Tier::Long);
        let mut fresh = record("fresh", 0.5);
        fresh.last_decay_at = Utc::now();
        let mut stale = record("stale", 0.5);
        stale.last_decay_at = Utc::now() - ChronoDuration::days(3);
        let mut forgotten = record("forgotten", 0.5);
        forgotten.last_decay_at = Utc::now() - ChronoDuration::days(9);
        forgotten.status = RecordStatus::Forgotten;

        // Inserted newest-decayed first so creation order disagrees
        tier.store(fresh).await.unwrap();
        tier.store(stale).await.unwrap();
        tier.store(forgotten).await.unwrap();

        let batch = tier.decay_candidates(1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].content, "stale");
        assert_eq!(tier.decay_candidates(10).await.unwrap().len(), 2);
    }
}
