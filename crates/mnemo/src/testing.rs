//! Test utilities for the tier engine - fault injection and fixtures
//!
//! This module provides:
//! - [`FlakyTier`], a tier wrapper that injects failures and delays
//! - [`RecordingSink`], an event sink that keeps everything it receives
//! - record fixtures with controlled age and access history

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::events::{CapacitySnapshot, ConsolidationEvent, EventSink};
use crate::maintenance::MaintenanceReport;
use crate::manager::MemoryManager;
use crate::memory::types::{MemoryRecord, Tier};
use crate::storage::{InMemoryTier, PromotionCriteria, RecordFilter, TierSet, TierStore};

/// Tier wrapper that can be told to fail or stall individual operations.
///
/// Every call is counted whether or not it was made to fail.
pub struct FlakyTier {
    inner: Arc<dyn TierStore>,
    fail_store: AtomicBool,
    fail_delete: AtomicBool,
    fail_cleanup: AtomicBool,
    store_delay_ms: AtomicU64,
    delete_delay_ms: AtomicU64,
    update_delay_ms: AtomicU64,
    store_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
    retrieve_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl FlakyTier {
    pub fn new(inner: Arc<dyn TierStore>) -> Self {
        Self {
            inner,
            fail_store: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            store_delay_ms: AtomicU64::new(0),
            delete_delay_ms: AtomicU64::new(0),
            update_delay_ms: AtomicU64::new(0),
            store_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
            retrieve_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Wrap a fresh in-memory tier
    pub fn in_memory(tier: Tier) -> Self {
        Self::new(Arc::new(InMemoryTier::new(tier)))
    }

    pub fn fail_stores(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cleanups(&self, fail: bool) {
        self.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    pub fn delay_stores(&self, delay: Duration) {
        self.store_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn delay_deletes(&self, delay: Duration) {
        self.delete_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stall every `update` before it is applied
    pub fn delay_updates(&self, delay: Duration) {
        self.update_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    async fn pause(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn injected(operation: &str) -> EngineError {
        EngineError::Storage(format!("injected {operation} failure"))
    }
}

#[async_trait]
impl TierStore for FlakyTier {
    fn tier(&self) -> Tier {
        self.inner.tier()
    }

    async fn count(&self, filter: Option<&RecordFilter>) -> Result<usize> {
        self.inner.count(filter).await
    }

    async fn store(&self, record: MemoryRecord) -> Result<String> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.store_delay_ms).await;
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(Self::injected("store"));
        }
        self.inner.store(record).await
    }

    async fn retrieve(&self, id: &str) -> Result<Option<MemoryRecord>> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.retrieve(id).await
    }

    async fn update(&self, record: &MemoryRecord) -> Result<bool> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.update_delay_ms).await;
        self.inner.update(record).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.delete_delay_ms).await;
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(id).await
    }

    async fn cleanup(&self) -> Result<usize> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(Self::injected("cleanup"));
        }
        self.inner.cleanup().await
    }

    async fn query(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.inner.query(filter, limit).await
    }

    async fn promotion_candidates(
        &self,
        criteria: &PromotionCriteria,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.inner.promotion_candidates(criteria, limit).await
    }

    async fn decay_candidates(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.inner.decay_candidates(limit).await
    }
}

/// An event received by [`RecordingSink`]
#[derive(Debug, Clone)]
pub enum RecordedEvent {
    Consolidation(ConsolidationEvent),
    CycleStarted(DateTime<Utc>),
    CycleCompleted(MaintenanceReport),
    Capacity(CapacitySnapshot),
}

/// Event sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: RecordedEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn consolidations(&self) -> Vec<ConsolidationEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Consolidation(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn reports(&self) -> Vec<MaintenanceReport> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::CycleCompleted(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<CapacitySnapshot> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Capacity(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn consolidation(&self, event: &ConsolidationEvent) -> Result<()> {
        self.push(RecordedEvent::Consolidation(event.clone()));
        Ok(())
    }

    async fn cycle_started(&self, started_at: DateTime<Utc>) -> Result<()> {
        self.push(RecordedEvent::CycleStarted(started_at));
        Ok(())
    }

    async fn cycle_completed(&self, report: &MaintenanceReport) -> Result<()> {
        self.push(RecordedEvent::CycleCompleted(report.clone()));
        Ok(())
    }

    async fn capacity_snapshot(&self, snapshot: &CapacitySnapshot) -> Result<()> {
        self.push(RecordedEvent::Capacity(snapshot.clone()));
        Ok(())
    }
}

/// Short-tier record with the given importance
pub fn record(content: &str, importance: f32) -> MemoryRecord {
    MemoryRecord::new(content, importance)
}

/// Record whose decay and reinforcement clocks were last reset `age` ago
pub fn aged_record(content: &str, importance: f32, age: chrono::Duration) -> MemoryRecord {
    let mut record = MemoryRecord::new(content, importance);
    let then = Utc::now() - age;
    record.last_decay_at = then;
    record.last_reinforced_at = then;
    record.last_accessed_at = then;
    record
}

/// Record that has already been accessed `access_count` times
pub fn accessed_record(content: &str, importance: f32, access_count: u64) -> MemoryRecord {
    let mut record = MemoryRecord::new(content, importance);
    record.access_count = access_count;
    record
}

/// Manager over `tiers` with a recording sink attached
pub fn recorded_manager(
    config: Config,
    tiers: TierSet,
) -> Result<(MemoryManager, Arc<RecordingSink>)> {
    let sink = Arc::new(RecordingSink::new());
    let manager = MemoryManager::new(config, tiers, Arc::clone(&sink) as Arc<dyn EventSink>)?;
    Ok((manager, sink))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flaky_tier_injects_and_counts() {
        let tier = FlakyTier::in_memory(Tier::Short);
        let id = tier.store(record("x", 0.5)).await.unwrap();

        tier.fail_deletes(true);
        assert!(tier.delete(&id).await.is_err());
        tier.fail_deletes(false);
        assert!(tier.delete(&id).await.unwrap());

        assert_eq!(tier.store_calls(), 1);
        assert_eq!(tier.delete_calls(), 2);
    }

    #[tokio::test]
    async fn flaky_tier_store_failure_leaves_nothing() {
        let tier = FlakyTier::in_memory(Tier::Medium);
        tier.fail_stores(true);
        assert!(tier.store(record("x", 0.5)).await.is_err());
        assert_eq!(tier.count(None).await.unwrap(), 0);
    }

    #[test]
    fn aged_record_moves_clocks_back() {
        let record = aged_record("x", 0.5, chrono::Duration::hours(2));
        assert!(Utc::now() - record.last_decay_at >= chrono::Duration::hours(2));
        assert_eq!(accessed_record("y", 0.1, 4).access_count, 4);
    }
}
