//! Memory manager facade
//!
//! Binds admission control, consolidation and maintenance to the three tier
//! collaborators. Every tier write goes through backpressure first, and
//! inserts additionally through the resource-limit watchdog.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::admission::{
    BackpressureController, BackpressureSnapshot, ResourceLimitWatchdog,
    TierCapacityPressureAdapter, TierPressureState,
};
use crate::config::Config;
use crate::consolidation::Consolidator;
use crate::error::Result;
use crate::events::{CapacitySnapshot, EventEmitter, EventSink, TracingEventSink};
use crate::maintenance::{MaintenanceOrchestrator, MaintenanceReport};
use crate::memory::types::{ConsolidationOutcome, MemoryRecord, Tier};
use crate::storage::TierSet;

/// Public entry point of the engine
#[derive(Debug)]
pub struct MemoryManager {
    config: Config,
    tiers: TierSet,
    backpressure: Arc<BackpressureController>,
    watchdog: Arc<ResourceLimitWatchdog>,
    pressure: Arc<TierCapacityPressureAdapter>,
    consolidator: Arc<Consolidator>,
    orchestrator: MaintenanceOrchestrator,
}

impl MemoryManager {
    /// Build an engine over `tiers`.
    ///
    /// # Errors
    /// `Config` if the configuration fails validation
    pub fn new(config: Config, tiers: TierSet, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;

        let events = EventEmitter::new(sink);
        let backpressure = Arc::new(BackpressureController::new(&config.backpressure));
        let watchdog = Arc::new(ResourceLimitWatchdog::new(config.resource_limits.clone()));
        let pressure = Arc::new(TierCapacityPressureAdapter::new(
            config.capacity_pressure.clone(),
        )?);
        let consolidator = Arc::new(Consolidator::new(
            &config.consolidation,
            tiers.clone(),
            Arc::clone(&watchdog),
            Arc::clone(&backpressure),
            events.clone(),
        ));
        let orchestrator = MaintenanceOrchestrator::new(
            config.maintenance.clone(),
            &config.strength_model,
            Arc::clone(&consolidator),
            Arc::clone(&watchdog),
            Arc::clone(&backpressure),
            Arc::clone(&pressure),
            events,
        );

        tracing::debug!("Memory manager initialised");
        Ok(Self {
            config,
            tiers,
            backpressure,
            watchdog,
            pressure,
            consolidator,
            orchestrator,
        })
    }

    /// Engine over three empty in-memory tiers, logging events via tracing
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::new(config, TierSet::in_memory(), Arc::new(TracingEventSink))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    /// Store new content in the short tier and return its identifier.
    ///
    /// # Errors
    /// * `Backpressure` / `Timeout` - the short tier is saturated
    /// * `CapacityExceeded` - the short tier is full and eviction did not help
    pub async fn add(
        &self,
        content: impl Into<String>,
        importance: f32,
        metadata: BTreeMap<String, Value>,
    ) -> Result<String> {
        let _permit = self.backpressure.acquire(Tier::Short).await?;
        let record = MemoryRecord::new(content, importance).with_metadata(metadata);
        let id = self
            .watchdog
            .store(Tier::Short, self.tiers.short.as_ref(), record)
            .await?;
        tracing::debug!(memory_id = %id, importance, "Memory added");
        Ok(id)
    }

    /// Find the tier currently holding `id`
    pub async fn locate(&self, id: &str) -> Result<Option<(Tier, MemoryRecord)>> {
        for tier in Tier::ALL {
            if let Some(record) = self.tiers.get(tier).retrieve(id).await? {
                if !record.is_active() {
                    return Ok(None);
                }
                return Ok(Some((tier, record)));
            }
        }
        Ok(None)
    }

    /// Fetch a record, searching short to long, and reinforce it.
    ///
    /// The access bump and reinforcement are written back to the tier.
    /// Forgotten records are never returned.
    pub async fn retrieve(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let Some(tier) = self.locate(id).await?.map(|(tier, _)| tier) else {
            return Ok(None);
        };

        let _permit = self.backpressure.acquire(tier).await?;
        let _lock = self.consolidator.locks().lock(id).await;
        // Moved, deleted or forgotten since it was located
        let Some(mut record) = self.active_in(tier, id).await? else {
            return Ok(None);
        };

        record.mark_accessed();
        self.orchestrator
            .reinforce_on_access(tier, &mut record, Utc::now());
        if !self.tiers.get(tier).update(&record).await? {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Change the importance of a record in place
    pub async fn update_importance(&self, id: &str, importance: f32) -> Result<bool> {
        let Some(tier) = self.locate(id).await?.map(|(tier, _)| tier) else {
            return Ok(false);
        };

        let _permit = self.backpressure.acquire(tier).await?;
        let _lock = self.consolidator.locks().lock(id).await;
        let Some(mut record) = self.active_in(tier, id).await? else {
            return Ok(false);
        };
        record.set_importance(importance);
        self.tiers.get(tier).update(&record).await
    }

    /// Delete a record from whichever tier holds it
    pub async fn delete(&self, id: &str) -> Result<bool> {
        for tier in Tier::ALL {
            let _permit = self.backpressure.acquire(tier).await?;
            let _lock = self.consolidator.locks().lock(id).await;
            if self.tiers.get(tier).delete(id).await? {
                tracing::debug!(memory_id = id, tier = %tier, "Memory deleted");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn active_in(&self, tier: Tier, id: &str) -> Result<Option<MemoryRecord>> {
        Ok(self
            .tiers
            .get(tier)
            .retrieve(id)
            .await?
            .filter(MemoryRecord::is_active))
    }

    /// Move a record between tiers, deduplicating concurrent and recent
    /// identical requests
    pub async fn consolidate(
        &self,
        id: &str,
        source: Tier,
        target: Tier,
    ) -> Result<ConsolidationOutcome> {
        self.consolidator.consolidate(id, source, target).await
    }

    /// Move a record at most once under the caller-chosen `key`
    pub async fn consolidate_idempotent(
        &self,
        key: &str,
        id: &str,
        source: Tier,
        target: Tier,
    ) -> Result<ConsolidationOutcome> {
        self.consolidator
            .consolidate_idempotent(key, id, source, target)
            .await
    }

    /// Run a maintenance cycle now
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.orchestrator.run_cycle().await
    }

    /// Run a maintenance cycle if the minimum interval has elapsed
    pub async fn maybe_run_maintenance(&self) -> Option<MaintenanceReport> {
        self.orchestrator.maybe_run().await
    }

    pub fn pressure_snapshot(&self) -> BTreeMap<Tier, TierPressureState> {
        self.pressure.snapshot()
    }

    pub fn backpressure_snapshot(&self) -> BTreeMap<Tier, BackpressureSnapshot> {
        self.backpressure.snapshot()
    }

    /// Live occupancy of every tier with the last observed pressure
    pub async fn capacity_snapshot(&self) -> Result<CapacitySnapshot> {
        let mut tiers = BTreeMap::new();
        let mut pressure = BTreeMap::new();
        for tier in Tier::ALL {
            let capacity = self
                .watchdog
                .capacity(tier, self.tiers.get(tier).as_ref())
                .await?;
            tiers.insert(tier, capacity);
            pressure.insert(tier, self.pressure.pressure_for(tier));
        }
        Ok(CapacitySnapshot {
            taken_at: Utc::now(),
            tiers,
            pressure,
        })
    }

    /// Record counts per tier
    pub async fn counts(&self) -> Result<HashMap<Tier, usize>> {
        let mut counts = HashMap::new();
        for tier in Tier::ALL {
            counts.insert(tier, self.tiers.get(tier).count(None).await?);
        }
        Ok(counts)
    }
}
