//! Tier collaborator contract
//!
//! The engine never owns storage; it drives each tier through the narrow
//! [`TierStore`] capability below. [`InMemoryTier`] is the reference
//! implementation used by the daemon and the tests.

pub mod filter;
pub mod locks;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::memory::types::{MemoryRecord, Tier};

pub use filter::{PromotionCriteria, RecordFilter};
pub use locks::{RecordLockGuard, RecordLocks};
pub use memory::{InMemoryTier, InMemoryTierConfig};

/// Capability contract for a single storage tier
#[async_trait]
pub trait TierStore: Send + Sync {
    /// The tier this store backs
    fn tier(&self) -> Tier;

    /// Number of records, optionally restricted by a filter
    async fn count(&self, filter: Option<&RecordFilter>) -> Result<usize>;

    /// Persist a record and return the identifier assigned to it
    async fn store(&self, record: MemoryRecord) -> Result<String>;

    async fn retrieve(&self, id: &str) -> Result<Option<MemoryRecord>>;

    /// Overwrite an existing record in place; false if it does not exist
    async fn update(&self, record: &MemoryRecord) -> Result<bool>;

    async fn delete(&self, id: &str) -> Result<bool>;

    /// Tier-specific housekeeping; returns the number of records removed
    async fn cleanup(&self) -> Result<usize>;

    async fn query(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Records eligible for promotion out of this tier, best first
    async fn promotion_candidates(
        &self,
        criteria: &PromotionCriteria,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let mut candidates: Vec<(MemoryRecord, f32)> = self
            .query(&RecordFilter::new(), usize::MAX)
            .await?
            .into_iter()
            .filter(|r| criteria.matches(r))
            .map(|r| {
                let priority = criteria.priority(&r);
                (r, priority)
            })
            .collect();

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(candidates.into_iter().take(limit).map(|(r, _)| r).collect())
    }

    /// Active records least recently decayed, stalest first.
    ///
    /// A decay pass bounded by `limit` that takes these each cycle rotates
    /// through the whole tier.
    async fn decay_candidates(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let mut records = self.query(&RecordFilter::new(), usize::MAX).await?;
        records.sort_by(|a, b| {
            a.last_decay_at
                .cmp(&b.last_decay_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        records.truncate(limit);
        Ok(records)
    }
}

/// The three tier collaborators owned by the facade
#[derive(Clone)]
pub struct TierSet {
    pub short: Arc<dyn TierStore>,
    pub medium: Arc<dyn TierStore>,
    pub long: Arc<dyn TierStore>,
}

impl TierSet {
    pub fn new(
        short: Arc<dyn TierStore>,
        medium: Arc<dyn TierStore>,
        long: Arc<dyn TierStore>,
    ) -> Self {
        Self {
            short,
            medium,
            long,
        }
    }

    /// Three empty in-memory tiers
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryTier::new(Tier::Short)),
            Arc::new(InMemoryTier::new(Tier::Medium)),
            Arc::new(InMemoryTier::new(Tier::Long)),
        )
    }

    pub fn get(&self, tier: Tier) -> &Arc<dyn TierStore> {
        match tier {
            Tier::Short => &self.short,
            Tier::Medium => &self.medium,
            Tier::Long => &self.long,
        }
    }
}

impl std::fmt::Debug for TierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierSet").finish_non_exhaustive()
    }
}
