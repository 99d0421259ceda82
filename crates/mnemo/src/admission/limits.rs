//! Hard capacity limits per tier
//!
//! The watchdog runs before every tier write. When a tier is at its
//! `max_items` limit it either rejects the write or asks the tier to clean
//! itself up, a bounded number of times, before giving up.

use std::time::Instant;

use serde::Serialize;

use crate::config::{CapacityOverflow, PerTier, ResourceLimitConfig};
use crate::error::{EngineError, Result};
use crate::memory::types::{MemoryRecord, Tier};
use crate::storage::TierStore;

/// Occupancy of one tier against its configured limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierCapacity {
    pub count: usize,
    pub max_items: usize,
    pub utilization: f32,
}

impl TierCapacity {
    pub fn new(count: usize, max_items: usize) -> Self {
        let utilization = if max_items == 0 {
            1.0
        } else {
            count as f32 / max_items as f32
        };
        Self {
            count,
            max_items,
            utilization,
        }
    }
}

/// Per-tier hard-capacity guard
#[derive(Debug, Clone)]
pub struct ResourceLimitWatchdog {
    limits: PerTier<ResourceLimitConfig>,
}

impl ResourceLimitWatchdog {
    pub fn new(limits: PerTier<ResourceLimitConfig>) -> Self {
        Self { limits }
    }

    pub fn limits(&self, tier: Tier) -> &ResourceLimitConfig {
        self.limits.get(tier)
    }

    /// Current occupancy of `store` against the limit for `tier`
    pub async fn capacity(&self, tier: Tier, store: &dyn TierStore) -> Result<TierCapacity> {
        let count = store.count(None).await?;
        Ok(TierCapacity::new(count, self.limits(tier).max_items))
    }

    /// Make room for one more record in `tier`.
    ///
    /// Under EVICT the tier's `cleanup()` is called up to
    /// `max_eviction_attempts` times; room is considered made once the count
    /// is back within `max_items`.
    ///
    /// # Errors
    /// `CapacityExceeded` under REJECT, or when eviction attempts run out
    pub async fn ensure_capacity(&self, tier: Tier, store: &dyn TierStore) -> Result<()> {
        let limits = self.limits(tier);
        let mut count = store.count(None).await?;
        if count < limits.max_items {
            return Ok(());
        }

        let exceeded = |count| EngineError::CapacityExceeded {
            tier,
            count,
            max_items: limits.max_items,
        };

        match limits.overflow_policy {
            CapacityOverflow::Reject => {
                tracing::debug!(tier = %tier, count, max_items = limits.max_items, "Capacity reject");
                Err(exceeded(count))
            }
            CapacityOverflow::Evict => {
                for attempt in 1..=limits.max_eviction_attempts {
                    let removed = store.cleanup().await?;
                    count = store.count(None).await?;
                    tracing::debug!(
                        tier = %tier,
                        attempt,
                        removed,
                        count,
                        "Eviction attempt"
                    );
                    if count <= limits.max_items {
                        return Ok(());
                    }
                }
                tracing::warn!(
                    tier = %tier,
                    count,
                    max_items = limits.max_items,
                    attempts = limits.max_eviction_attempts,
                    "Eviction attempts exhausted"
                );
                Err(exceeded(count))
            }
        }
    }

    /// Check capacity, then store `record` bounded by `ingest_timeout`.
    ///
    /// On timeout the store call is dropped and `Timeout` is returned; no
    /// partial write is assumed.
    pub async fn store(
        &self,
        tier: Tier,
        store: &dyn TierStore,
        record: MemoryRecord,
    ) -> Result<String> {
        self.ensure_capacity(tier, store).await?;

        let timeout = self.limits(tier).ingest_timeout();
        let started = Instant::now();
        match tokio::time::timeout(timeout, store.store(record)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(tier = %tier, ?timeout, "Ingest timed out");
                Err(EngineError::timeout(
                    format!("ingest into {tier}"),
                    started.elapsed(),
                ))
            }
        }
    }
}
