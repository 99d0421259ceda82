//! Periodic maintenance driver
//!
//! One cycle refreshes capacity pressure, lets tiers clean up, decays the
//! medium and long tiers, then promotes candidates one tier up. Individual
//! failures are collected in the report and never abort the cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;

use crate::admission::{BackpressureController, ResourceLimitWatchdog, TierCapacityPressureAdapter};
use crate::config::{MaintenanceConfig, PerTier, StrengthModelConfig};
use crate::consolidation::Consolidator;
use crate::error::Result;
use crate::events::{CapacitySnapshot, EventEmitter};
use crate::maintenance::report::MaintenanceReport;
use crate::memory::strength::StrengthDecayModel;
use crate::memory::types::{MemoryRecord, RecordStatus, Tier};
use crate::storage::{PromotionCriteria, TierStore};

/// Tiers whose records decay during maintenance
const DECAYING_TIERS: [Tier; 2] = [Tier::Medium, Tier::Long];

/// Tiers that promote into the next one
const PROMOTING_TIERS: [Tier; 2] = [Tier::Short, Tier::Medium];

/// Drives decay, forgetting and promotion across the three tiers
#[derive(Debug)]
pub struct MaintenanceOrchestrator {
    config: MaintenanceConfig,
    models: PerTier<StrengthDecayModel>,
    consolidator: Arc<Consolidator>,
    watchdog: Arc<ResourceLimitWatchdog>,
    backpressure: Arc<BackpressureController>,
    pressure: Arc<TierCapacityPressureAdapter>,
    events: EventEmitter,
    /// Start time of the last cycle; held for the duration of a cycle
    last_started: Mutex<Option<Instant>>,
}

impl MaintenanceOrchestrator {
    pub fn new(
        config: MaintenanceConfig,
        strength_model: &PerTier<StrengthModelConfig>,
        consolidator: Arc<Consolidator>,
        watchdog: Arc<ResourceLimitWatchdog>,
        backpressure: Arc<BackpressureController>,
        pressure: Arc<TierCapacityPressureAdapter>,
        events: EventEmitter,
    ) -> Self {
        Self {
            config,
            models: strength_model.map(|c| StrengthDecayModel::new(c.clone())),
            consolidator,
            watchdog,
            backpressure,
            pressure,
            events,
            last_started: Mutex::new(None),
        }
    }

    pub fn model(&self, tier: Tier) -> &StrengthDecayModel {
        self.models.get(tier)
    }

    /// Apply the access reinforcement of `tier` to `record`.
    ///
    /// Only tiers decayed by maintenance fold passive decay in here; for the
    /// rest an access must not cost strength an untouched record keeps.
    pub fn reinforce_on_access(&self, tier: Tier, record: &mut MemoryRecord, now: DateTime<Utc>) {
        let model = self.models.get(tier);
        let amount = model.config().access_reinforcement;
        if DECAYING_TIERS.contains(&tier) {
            model.reinforce_record(record, amount, now);
        } else {
            model.reinforce_only(record, amount, now);
        }
    }

    fn store(&self, tier: Tier) -> &Arc<dyn TierStore> {
        self.consolidator.tiers().get(tier)
    }

    /// Run a cycle now, waiting for any cycle already in progress
    pub async fn run_cycle(&self) -> MaintenanceReport {
        let mut last_started = self.last_started.lock().await;
        *last_started = Some(Instant::now());
        self.cycle().await
    }

    /// Run a cycle unless one is in progress or the last one started less
    /// than `min_interval` ago
    pub async fn maybe_run(&self) -> Option<MaintenanceReport> {
        let Ok(mut last_started) = self.last_started.try_lock() else {
            tracing::debug!("Maintenance cycle already running");
            return None;
        };
        if let Some(at) = *last_started {
            if at.elapsed() < self.config.min_interval() {
                return None;
            }
        }
        *last_started = Some(Instant::now());
        Some(self.cycle().await)
    }

    async fn cycle(&self) -> MaintenanceReport {
        let started = Instant::now();
        let mut report = MaintenanceReport::new(Utc::now());
        self.events.cycle_started(report.started_at).await;

        self.refresh_pressure(&mut report).await;

        for tier in Tier::ALL {
            match self.store(tier).cleanup().await {
                Ok(removed) => report.tier_mut(tier).cleaned += removed,
                Err(err) => report.error(&format!("cleanup {tier}"), err),
            }
        }

        for tier in DECAYING_TIERS {
            if let Err(err) = self.decay_tier(tier, &mut report).await {
                report.error(&format!("decay {tier}"), err);
            }
        }

        // Select from both tiers before moving anything, so a record moves
        // at most one tier per cycle
        let mut selections = Vec::new();
        for source in PROMOTING_TIERS {
            let Some(target) = source.next() else {
                continue;
            };
            match self.candidates(source).await {
                Ok(candidates) => {
                    report.tier_mut(source).candidates = candidates.len();
                    selections.push((source, target, candidates));
                }
                Err(err) => report.error(&format!("candidates {source}"), err),
            }
        }

        for (source, target, candidates) in selections {
            self.promote(source, target, candidates, &mut report).await;
        }

        report.duration = started.elapsed();
        tracing::info!(
            duration_ms = report.duration.as_millis() as u64,
            decayed = report.total_decayed(),
            removed = report.total_removed(),
            consolidated = report.total_consolidated(),
            errors = report.errors.len(),
            "Maintenance cycle finished"
        );
        self.events.cycle_completed(&report).await;
        report
    }

    async fn refresh_pressure(&self, report: &mut MaintenanceReport) {
        let mut capacities = BTreeMap::new();
        for tier in Tier::ALL {
            match self.watchdog.capacity(tier, self.store(tier).as_ref()).await {
                Ok(capacity) => {
                    let pressure = self.pressure.observe(tier, capacity.utilization);
                    report.pressure.insert(tier, pressure);
                    capacities.insert(tier, capacity);
                }
                Err(err) => {
                    report.pressure.insert(tier, self.pressure.pressure_for(tier));
                    report.error(&format!("refresh pressure {tier}"), err);
                }
            }
        }

        let snapshot = CapacitySnapshot {
            taken_at: Utc::now(),
            tiers: capacities,
            pressure: report.pressure.clone(),
        };
        self.events.capacity_snapshot(&snapshot).await;
    }

    /// Decay the `decay_batch_size` records of `tier` that waited longest
    /// since their last decay. Each record is re-read under its lock so a
    /// concurrent access is never overwritten with a stale copy.
    async fn decay_tier(&self, tier: Tier, report: &mut MaintenanceReport) -> Result<()> {
        let _permit = self.backpressure.acquire(tier).await?;
        let store = self.store(tier);
        let model = self.models.get(tier);
        let locks = self.consolidator.locks();

        let candidates = store.decay_candidates(self.config.decay_batch_size).await?;

        for candidate in candidates {
            let _lock = locks.lock(&candidate.id).await;
            let mut record = match store.retrieve(&candidate.id).await {
                Ok(Some(record)) if record.is_active() => record,
                Ok(_) => continue,
                Err(err) => {
                    report.error(&format!("decay {} in {tier}", candidate.id), err);
                    continue;
                }
            };

            let outcome = model.decay_record(&mut record, Utc::now());
            if outcome.forget {
                tracing::debug!(
                    tier = %tier,
                    memory_id = %record.id,
                    strength = outcome.effective_strength,
                    "Forgetting memory"
                );
                match self.forget(store.as_ref(), record).await {
                    Ok(Forgotten::Deleted) => report.tier_mut(tier).removed += 1,
                    Ok(Forgotten::Marked) => report.tier_mut(tier).forgotten += 1,
                    Ok(Forgotten::Gone) => {}
                    Err(err) => report.error(&format!("forget in {tier}"), err),
                }
            } else {
                match store.update(&record).await {
                    Ok(true) => report.tier_mut(tier).decayed += 1,
                    Ok(false) => {}
                    Err(err) => report.error(&format!("decay {} in {tier}", record.id), err),
                }
            }
        }
        Ok(())
    }

    async fn forget(&self, store: &dyn TierStore, mut record: MemoryRecord) -> Result<Forgotten> {
        if self.config.retain_forgotten {
            record.status = RecordStatus::Forgotten;
            return Ok(if store.update(&record).await? {
                Forgotten::Marked
            } else {
                Forgotten::Gone
            });
        }
        Ok(if store.delete(&record.id).await? {
            Forgotten::Deleted
        } else {
            Forgotten::Gone
        })
    }

    /// Promotion predicate for `source`, relaxed by capacity pressure for
    /// the short tier
    pub fn promotion_criteria(&self, source: Tier) -> PromotionCriteria {
        let max_strength = self.models.get(source).max_strength();
        match source {
            Tier::Short => PromotionCriteria {
                min_importance: self.pressure.priority_threshold(
                    source,
                    self.config.stm_priority_threshold,
                    self.config.stm_priority_floor,
                ),
                min_access_count: self.config.stm_min_access_count,
                min_strength: 0.0,
                max_strength,
            },
            _ => PromotionCriteria {
                min_importance: self.config.mtm_min_importance,
                min_access_count: self.config.mtm_min_access_count,
                min_strength: self.config.mtm_min_strength,
                max_strength,
            },
        }
    }

    async fn candidates(&self, source: Tier) -> Result<Vec<MemoryRecord>> {
        let criteria = self.promotion_criteria(source);
        let limit = self
            .pressure
            .batch_size(
                source,
                self.config.consolidation_batch_size,
                self.config.max_batch_multiplier,
            )
            .min(self.config.candidate_limit.max(1));
        tracing::debug!(
            tier = %source,
            min_importance = criteria.min_importance,
            limit,
            "Selecting promotion candidates"
        );
        self.store(source).promotion_candidates(&criteria, limit).await
    }

    async fn promote(
        &self,
        source: Tier,
        target: Tier,
        candidates: Vec<MemoryRecord>,
        report: &mut MaintenanceReport,
    ) {
        let results = join_all(
            candidates
                .iter()
                .map(|record| self.consolidator.consolidate(&record.id, source, target)),
        )
        .await;

        for (record, result) in candidates.iter().zip(results) {
            match result {
                Ok(_) => report.tier_mut(source).consolidated += 1,
                Err(err) => report.error(
                    &format!("consolidate {} {source}->{target}", record.id),
                    err,
                ),
            }
        }
    }
}

enum Forgotten {
    Deleted,
    Marked,
    Gone,
}
