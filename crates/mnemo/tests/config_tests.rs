//! Integration tests for loading configuration from disk

use std::io::Write;

use mnemo_engine::config::{CapacityOverflow, Config, QueueOverflow};
use mnemo_engine::error::ErrorKind;
use mnemo_engine::MemoryManager;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_merges_partial_tier_tables() {
    let file = write_config(
        r#"
[backpressure.stm]
max_inflight = 2
overflow_policy = "reject"

[resource_limits.ltm]
max_items = 50

[maintenance]
min_interval_seconds = 5.0
retain_forgotten = true

[unrelated_section]
anything = 1
"#,
    );

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.backpressure.stm.max_inflight, 2);
    assert_eq!(config.backpressure.stm.overflow_policy, QueueOverflow::Reject);
    // Unnamed fields keep the tier's own defaults
    assert_eq!(config.backpressure.stm.max_queue, 256);
    assert_eq!(config.backpressure.mtm.max_inflight, 32);

    assert_eq!(config.resource_limits.ltm.max_items, 50);
    assert_eq!(config.resource_limits.ltm.overflow_policy, CapacityOverflow::Evict);
    assert_eq!(config.resource_limits.stm.max_items, 1_000);

    assert_eq!(config.maintenance.min_interval_seconds, 5.0);
    assert!(config.maintenance.retain_forgotten);
    assert_eq!(config.maintenance.consolidation_batch_size, 16);
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_malformed_file_is_config_error() {
    let file = write_config("[backpressure.stm\nmax_inflight = ");
    let err = Config::load(file.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_manager_rejects_invalid_config() {
    let file = write_config(
        r#"
[capacity_pressure]
relief_ratio = 0.9
saturation_ratio = 0.5
"#,
    );
    let config = Config::load(file.path()).unwrap();

    let err = MemoryManager::in_memory(config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_rendered_config_loads_back() {
    let mut config = Config::default();
    config.strength_model.mtm.passive_half_life_seconds = 1_800.0;
    config.consolidation.dedupe_window_seconds = 2.5;

    let file = write_config(&config.to_toml_string().unwrap());
    let loaded = Config::load(file.path()).unwrap();

    assert_eq!(loaded.strength_model.mtm, config.strength_model.mtm);
    assert_eq!(loaded.consolidation, config.consolidation);
    assert_eq!(loaded.backpressure.ltm, config.backpressure.ltm);
}
