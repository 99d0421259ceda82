//! Cross-tier consolidation
//!
//! A consolidation moves one record from a source tier into a target tier
//! as a three-stage transaction:
//!
//! 1. retrieve the record from the source tier
//! 2. store it, with consolidation metadata merged in, into the target tier
//!    (rolled back by deleting the new target record)
//! 3. delete it from the source tier, which is the commit point
//!
//! Either the record ends up only in the target tier or, after rollback,
//! only in the source tier.

pub mod guard;
pub mod pipeline;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::admission::{BackpressureController, ResourceLimitWatchdog};
use crate::config::ConsolidationConfig;
use crate::error::{EngineError, Result};
use crate::events::{ConsolidationEvent, EventEmitter};
use crate::memory::types::{ConsolidationKey, ConsolidationOutcome, MemoryRecord, Tier};
use crate::storage::{RecordLocks, TierSet};

pub use guard::{ConsolidationInFlightGuard, Reservation, ReservationHandle};
pub use pipeline::{Transaction, TransactionalConsolidationPipeline};

const TRANSACTION_NAME: &str = "consolidate";

/// Runs consolidations for the facade and the maintenance orchestrator
#[derive(Debug)]
pub struct Consolidator {
    tiers: TierSet,
    guard: ConsolidationInFlightGuard,
    pipeline: TransactionalConsolidationPipeline,
    watchdog: Arc<ResourceLimitWatchdog>,
    backpressure: Arc<BackpressureController>,
    locks: Arc<RecordLocks>,
    events: EventEmitter,
}

impl Consolidator {
    pub fn new(
        config: &ConsolidationConfig,
        tiers: TierSet,
        watchdog: Arc<ResourceLimitWatchdog>,
        backpressure: Arc<BackpressureController>,
        events: EventEmitter,
    ) -> Self {
        Self {
            tiers,
            guard: ConsolidationInFlightGuard::new(
                config.dedupe_window(),
                config.dedupe_cache_capacity,
            ),
            pipeline: TransactionalConsolidationPipeline::new(),
            watchdog,
            backpressure,
            locks: Arc::new(RecordLocks::new()),
            events,
        }
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    pub fn guard(&self) -> &ConsolidationInFlightGuard {
        &self.guard
    }

    pub fn pipeline(&self) -> &TransactionalConsolidationPipeline {
        &self.pipeline
    }

    /// Record locks shared with every other writer of these tiers
    pub fn locks(&self) -> &Arc<RecordLocks> {
        &self.locks
    }

    /// Move `memory_id` from `source` to `target`.
    ///
    /// Concurrent calls for the same move share one execution, and a repeat
    /// within the dedupe window returns the earlier outcome.
    pub async fn consolidate(
        &self,
        memory_id: &str,
        source: Tier,
        target: Tier,
    ) -> Result<ConsolidationOutcome> {
        check_direction(memory_id, source, target)?;
        let key = ConsolidationKey::new(memory_id, source, target);
        self.guard
            .run(key, || self.transact(None, memory_id, source, target))
            .await
    }

    /// Move `memory_id` at most once for the lifetime of this engine under
    /// the caller-chosen `key`.
    pub async fn consolidate_idempotent(
        &self,
        key: &str,
        memory_id: &str,
        source: Tier,
        target: Tier,
    ) -> Result<ConsolidationOutcome> {
        check_direction(memory_id, source, target)?;
        self.transact(Some(key), memory_id, source, target).await
    }

    async fn transact(
        &self,
        idempotency_key: Option<&str>,
        memory_id: &str,
        source: Tier,
        target: Tier,
    ) -> Result<ConsolidationOutcome> {
        let started = Instant::now();
        tracing::debug!(memory_id, source = %source, target = %target, "Consolidating memory");

        let result = self
            .admitted_transaction(idempotency_key, memory_id, source, target)
            .await;

        let event = match &result {
            Ok(outcome) => ConsolidationEvent {
                memory_id: memory_id.to_string(),
                source,
                target,
                new_id: Some(outcome.new_id.clone()),
                duration: started.elapsed(),
                success: true,
                error: None,
            },
            Err(err) => ConsolidationEvent {
                memory_id: memory_id.to_string(),
                source,
                target,
                new_id: None,
                duration: started.elapsed(),
                success: false,
                error: Some(err.to_string()),
            },
        };
        self.events.consolidation(&event).await;
        result
    }

    async fn admitted_transaction(
        &self,
        idempotency_key: Option<&str>,
        memory_id: &str,
        source: Tier,
        target: Tier,
    ) -> Result<ConsolidationOutcome> {
        let runner = |tx| self.move_record(tx, memory_id, source, target);

        let outcome = match idempotency_key {
            Some(key) if self.pipeline.is_completed(key) => self.pipeline.run(key, runner).await?,
            Some(key) => {
                let _permit = self.backpressure.acquire(target).await?;
                self.pipeline.run(key, runner).await?
            }
            None => {
                let _permit = self.backpressure.acquire(target).await?;
                self.pipeline.execute(TRANSACTION_NAME, runner).await?
            }
        };

        outcome.ok_or_else(|| EngineError::TransactionFailed {
            transaction: TRANSACTION_NAME.to_string(),
            stage: "runner".to_string(),
            reason: format!("consolidation of {memory_id} produced no result"),
        })
    }

    async fn move_record(
        &self,
        tx: Transaction,
        memory_id: &str,
        source: Tier,
        target: Tier,
    ) -> Result<ConsolidationOutcome> {
        let started = Instant::now();
        let source_store = Arc::clone(self.tiers.get(source));
        let target_store = Arc::clone(self.tiers.get(target));
        let _lock = self.locks.lock(memory_id).await;

        let record = tx
            .step("retrieve_source", async {
                match source_store.retrieve(memory_id).await? {
                    Some(record) if record.is_active() => Ok(record),
                    _ => Err(EngineError::not_found(memory_id, source)),
                }
            })
            .await?;

        let consolidated_at = Utc::now();
        let staged = stage_record(record, source, target, consolidated_at);

        let undo_store = Arc::clone(&target_store);
        let new_id = tx
            .step_with_rollback(
                "store_target",
                self.watchdog.store(target, target_store.as_ref(), staged),
                move |new_id: String| async move {
                    if undo_store.delete(&new_id).await? {
                        Ok(())
                    } else {
                        Err(EngineError::Storage(format!(
                            "target record {new_id} already gone"
                        )))
                    }
                },
            )
            .await?;

        tx.step("delete_source", async {
            if source_store.delete(memory_id).await? {
                Ok(())
            } else {
                Err(EngineError::Storage(format!(
                    "source record {memory_id} disappeared before delete"
                )))
            }
        })
        .await?;

        let duration = started.elapsed();
        tracing::info!(
            memory_id,
            new_id = %new_id,
            source = %source,
            target = %target,
            duration_ms = duration.as_millis() as u64,
            "Memory consolidated"
        );

        Ok(ConsolidationOutcome {
            source_id: memory_id.to_string(),
            new_id,
            source,
            target,
            consolidated_at,
            duration,
        })
    }
}

fn check_direction(memory_id: &str, source: Tier, target: Tier) -> Result<()> {
    if source == target {
        return Err(EngineError::Config(format!(
            "cannot consolidate {memory_id} from {source} into itself"
        )));
    }
    Ok(())
}

/// Copy of `record` bound for `target`, carrying consolidation bookkeeping
fn stage_record(
    mut record: MemoryRecord,
    source: Tier,
    target: Tier,
    consolidated_at: DateTime<Utc>,
) -> MemoryRecord {
    let count = record
        .metadata
        .get("consolidation_count")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        + 1;

    let metadata = &mut record.metadata;
    metadata.insert("source_id".to_string(), Value::from(record.id.clone()));
    metadata.insert("consolidated_from".to_string(), Value::from(source.as_str()));
    metadata.insert(
        "consolidated_at".to_string(),
        Value::from(consolidated_at.to_rfc3339()),
    );
    metadata.insert("consolidation_count".to_string(), Value::from(count));
    record.tier = target;
    record
}
