//! Integration tests for cross-tier consolidation
//!
//! Drives the facade over in-memory tiers, with fault injection on the
//! source or target tier where a test needs a stage to fail.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mnemo_engine::config::{CapacityOverflow, Config};
use mnemo_engine::error::EngineError;
use mnemo_engine::memory::types::Tier;
use mnemo_engine::storage::{InMemoryTier, RecordFilter, TierSet, TierStore};
use mnemo_engine::testing::{FlakyTier, RecordingSink, recorded_manager};
use mnemo_engine::MemoryManager;

/// Test fixture: tiers where short and medium are wrapped for fault injection
fn flaky_tiers() -> (TierSet, Arc<FlakyTier>, Arc<FlakyTier>) {
    let short = Arc::new(FlakyTier::in_memory(Tier::Short));
    let medium = Arc::new(FlakyTier::in_memory(Tier::Medium));
    let tiers = TierSet::new(
        Arc::clone(&short) as Arc<dyn TierStore>,
        Arc::clone(&medium) as Arc<dyn TierStore>,
        Arc::new(InMemoryTier::new(Tier::Long)),
    );
    (tiers, short, medium)
}

fn manager_with(config: Config, tiers: TierSet) -> (Arc<MemoryManager>, Arc<RecordingSink>) {
    let (manager, sink) = recorded_manager(config, tiers).unwrap();
    (Arc::new(manager), sink)
}

async fn add(manager: &MemoryManager, content: &str) -> String {
    manager.add(content, 0.5, BTreeMap::new()).await.unwrap()
}

mod deduplication {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_consolidations_execute_once() {
        let (tiers, _short, medium) = flaky_tiers();
        medium.delay_stores(Duration::from_millis(50));
        let (manager, sink) = manager_with(Config::default(), tiers.clone());
        let id = add(&manager, "shared move").await;

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let id = id.clone();
                tokio::spawn(async move {
                    manager
                        .consolidate(&id, Tier::Short, Tier::Medium)
                        .await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }

        assert_eq!(outcomes[0].new_id, outcomes[1].new_id);
        assert_eq!(medium.store_calls(), 1);
        assert_eq!(tiers.medium.count(None).await.unwrap(), 1);
        assert_eq!(tiers.short.count(None).await.unwrap(), 0);
        assert_eq!(sink.consolidations().len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_within_window_returns_cached_outcome() {
        let (tiers, _short, medium) = flaky_tiers();
        let (manager, sink) = manager_with(Config::default(), tiers);
        let id = add(&manager, "move once").await;

        let first = manager
            .consolidate(&id, Tier::Short, Tier::Medium)
            .await
            .unwrap();
        let second = manager
            .consolidate(&id, Tier::Short, Tier::Medium)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(medium.store_calls(), 1);
        assert_eq!(sink.consolidations().len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_after_window_reports_not_found() {
        let mut config = Config::default();
        config.consolidation.dedupe_window_seconds = 0.02;
        let (manager, _sink) = manager_with(config, TierSet::in_memory());
        let id = add(&manager, "gone after move").await;

        manager
            .consolidate(&id, Tier::Short, Tier::Medium)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let err = manager
            .consolidate(&id, Tier::Short, Tier::Medium)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_idempotent_key_survives_window() {
        let mut config = Config::default();
        config.consolidation.dedupe_window_seconds = 0.01;
        let (manager, _sink) = manager_with(config, TierSet::in_memory());
        let id = add(&manager, "keyed move").await;

        let first = manager
            .consolidate_idempotent("import-42", &id, Tier::Short, Tier::Medium)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = manager
            .consolidate_idempotent("import-42", &id, Tier::Short, Tier::Medium)
            .await
            .unwrap();

        assert_eq!(first, second);
    }
}

mod atomicity {
    use super::*;

    #[tokio::test]
    async fn test_failed_source_delete_rolls_back_target() {
        let (tiers, short, _medium) = flaky_tiers();
        short.fail_deletes(true);
        let (manager, sink) = manager_with(Config::default(), tiers.clone());
        let id = add(&manager, "stay put").await;

        let err = manager
            .consolidate(&id, Tier::Short, Tier::Medium)
            .await
            .unwrap_err();
        match err {
            EngineError::TransactionFailed { stage, .. } => assert_eq!(stage, "delete_source"),
            other => panic!("expected TransactionFailed, got {other:?}"),
        }

        assert!(tiers.short.retrieve(&id).await.unwrap().is_some());
        assert_eq!(tiers.medium.count(None).await.unwrap(), 0);

        let events = sink.consolidations();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);

        // Failures are not cached: a later attempt runs again
        short.fail_deletes(false);
        let outcome = manager
            .consolidate(&id, Tier::Short, Tier::Medium)
            .await
            .unwrap();
        assert!(tiers.medium.retrieve(&outcome.new_id).await.unwrap().is_some());
        assert!(tiers.short.retrieve(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_target_store_leaves_source_untouched() {
        let (tiers, short, medium) = flaky_tiers();
        medium.fail_stores(true);
        let (manager, _sink) = manager_with(Config::default(), tiers.clone());
        let id = add(&manager, "not moved").await;

        let err = manager
            .consolidate(&id, Tier::Short, Tier::Medium)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransactionFailed { ref stage, .. } if stage == "store_target"
        ));
        assert_eq!(short.delete_calls(), 0);
        assert!(tiers.short.retrieve(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_target_is_capacity_exceeded() {
        let mut config = Config::default();
        config.resource_limits.mtm.max_items = 1;
        config.resource_limits.mtm.overflow_policy = CapacityOverflow::Reject;
        let (manager, _sink) = manager_with(config, TierSet::in_memory());

        let first = add(&manager, "first").await;
        let second = add(&manager, "second").await;
        manager
            .consolidate(&first, Tier::Short, Tier::Medium)
            .await
            .unwrap();

        let err = manager
            .consolidate(&second, Tier::Short, Tier::Medium)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { tier: Tier::Medium, .. }));
        assert!(manager.retrieve(&second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_consolidated_record_carries_metadata() {
        let (manager, _sink) = manager_with(Config::default(), TierSet::in_memory());
        let id = add(&manager, "annotated").await;

        let outcome = manager
            .consolidate(&id, Tier::Short, Tier::Medium)
            .await
            .unwrap();
        let moved = manager
            .tiers()
            .medium
            .query(&RecordFilter::new(), 10)
            .await
            .unwrap()
            .remove(0);

        assert_eq!(moved.id, outcome.new_id);
        assert_eq!(moved.metadata["source_id"], serde_json::Value::from(id));
        assert_eq!(moved.metadata["consolidated_from"], serde_json::Value::from("stm"));
        assert_eq!(moved.metadata["consolidation_count"], serde_json::Value::from(1u64));
    }
}
