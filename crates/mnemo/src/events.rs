//! Engine event sink
//!
//! Consolidation outcomes, maintenance cycles and capacity snapshots are
//! published to an [`EventSink`]. Delivery is best effort: the engine goes
//! through [`EventEmitter`], which logs sink failures and never returns them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::admission::TierCapacity;
use crate::error::Result;
use crate::maintenance::MaintenanceReport;
use crate::memory::types::Tier;

const EVENT_TARGET: &str = "mnemo_engine::events";

/// Outcome of a single consolidation attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationEvent {
    pub memory_id: String,
    pub source: Tier,
    pub target: Tier,
    /// Identifier in the target tier, on success
    pub new_id: Option<String>,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// Occupancy and pressure of every tier at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacitySnapshot {
    pub taken_at: DateTime<Utc>,
    pub tiers: BTreeMap<Tier, TierCapacity>,
    pub pressure: BTreeMap<Tier, f32>,
}

/// Receiver for engine events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn consolidation(&self, event: &ConsolidationEvent) -> Result<()>;

    async fn cycle_started(&self, started_at: DateTime<Utc>) -> Result<()>;

    async fn cycle_completed(&self, report: &MaintenanceReport) -> Result<()>;

    async fn capacity_snapshot(&self, snapshot: &CapacitySnapshot) -> Result<()>;
}

/// Emits every event as a structured tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn consolidation(&self, event: &ConsolidationEvent) -> Result<()> {
        if event.success {
            tracing::info!(
                target: EVENT_TARGET,
                memory_id = %event.memory_id,
                source = %event.source,
                target_tier = %event.target,
                new_id = event.new_id.as_deref().unwrap_or_default(),
                duration_ms = event.duration.as_millis() as u64,
                "Consolidated memory"
            );
        } else {
            tracing::warn!(
                target: EVENT_TARGET,
                memory_id = %event.memory_id,
                source = %event.source,
                target_tier = %event.target,
                duration_ms = event.duration.as_millis() as u64,
                error = event.error.as_deref().unwrap_or_default(),
                "Consolidation failed"
            );
        }
        Ok(())
    }

    async fn cycle_started(&self, started_at: DateTime<Utc>) -> Result<()> {
        tracing::info!(target: EVENT_TARGET, %started_at, "Maintenance cycle started");
        Ok(())
    }

    async fn cycle_completed(&self, report: &MaintenanceReport) -> Result<()> {
        tracing::info!(
            target: EVENT_TARGET,
            duration_ms = report.duration.as_millis() as u64,
            decayed = report.total_decayed(),
            removed = report.total_removed(),
            consolidated = report.total_consolidated(),
            errors = report.errors.len(),
            "Maintenance cycle completed"
        );
        Ok(())
    }

    async fn capacity_snapshot(&self, snapshot: &CapacitySnapshot) -> Result<()> {
        for (tier, capacity) in &snapshot.tiers {
            tracing::debug!(
                target: EVENT_TARGET,
                tier = %tier,
                count = capacity.count,
                max_items = capacity.max_items,
                utilization = capacity.utilization,
                pressure = snapshot.pressure.get(tier).copied().unwrap_or_default(),
                "Capacity snapshot"
            );
        }
        Ok(())
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn consolidation(&self, _event: &ConsolidationEvent) -> Result<()> {
        Ok(())
    }

    async fn cycle_started(&self, _started_at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn cycle_completed(&self, _report: &MaintenanceReport) -> Result<()> {
        Ok(())
    }

    async fn capacity_snapshot(&self, _snapshot: &CapacitySnapshot) -> Result<()> {
        Ok(())
    }
}

/// Fire-and-forget front for an [`EventSink`]
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    fn swallow(event: &str, result: Result<()>) {
        if let Err(err) = result {
            tracing::warn!(event, error = %err, "Event sink delivery failed");
        }
    }

    pub async fn consolidation(&self, event: &ConsolidationEvent) {
        Self::swallow("consolidation", self.sink.consolidation(event).await);
    }

    pub async fn cycle_started(&self, started_at: DateTime<Utc>) {
        Self::swallow("cycle_started", self.sink.cycle_started(started_at).await);
    }

    pub async fn cycle_completed(&self, report: &MaintenanceReport) {
        Self::swallow("cycle_completed", self.sink.cycle_completed(report).await);
    }

    pub async fn capacity_snapshot(&self, snapshot: &CapacitySnapshot) {
        Self::swallow(
            "capacity_snapshot",
            self.sink.capacity_snapshot(snapshot).await,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn consolidation(&self, _event: &ConsolidationEvent) -> Result<()> {
            Err(EngineError::Storage("sink down".to_string()))
        }

        async fn cycle_started(&self, _started_at: DateTime<Utc>) -> Result<()> {
            Err(EngineError::Storage("sink down".to_string()))
        }

        async fn cycle_completed(&self, _report: &MaintenanceReport) -> Result<()> {
            Err(EngineError::Storage("sink down".to_string()))
        }

        async fn capacity_snapshot(&self, _snapshot: &CapacitySnapshot) -> Result<()> {
            Err(EngineError::Storage("sink down".to_string()))
        }
    }

    fn event(success: bool) -> ConsolidationEvent {
        ConsolidationEvent {
            memory_id: "m1".to_string(),
            source: Tier::Short,
            target: Tier::Medium,
            new_id: success.then(|| "m2".to_string()),
            duration: Duration::from_millis(3),
            success,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[tokio::test]
    async fn test_emitter_swallows_sink_failures() {
        let emitter = EventEmitter::new(Arc::new(FailingSink));
        emitter.consolidation(&event(true)).await;
        emitter.cycle_started(Utc::now()).await;
        emitter.cycle_completed(&MaintenanceReport::new(Utc::now())).await;
        emitter
            .capacity_snapshot(&CapacitySnapshot {
                taken_at: Utc::now(),
                tiers: BTreeMap::new(),
                pressure: BTreeMap::new(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_all_events() {
        let sink = TracingEventSink;
        assert!(sink.consolidation(&event(true)).await.is_ok());
        assert!(sink.consolidation(&event(false)).await.is_ok());

        let mut tiers = BTreeMap::new();
        tiers.insert(Tier::Short, TierCapacity::new(3, 10));
        let snapshot = CapacitySnapshot {
            taken_at: Utc::now(),
            tiers,
            pressure: BTreeMap::new(),
        };
        assert!(sink.capacity_snapshot(&snapshot).await.is_ok());
    }
}
