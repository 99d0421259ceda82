//! Engine configuration
//!
//! Loaded once at startup from TOML. Every group falls back to documented
//! defaults and unknown keys are ignored. Per-tier tables
//! (`backpressure.stm`, `resource_limits.ltm`, ...) are merged over that
//! tier's own defaults, so a partial table only overrides what it names.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::de::{DeserializeOwned, Error as DeError};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{EngineError, Result};
use crate::memory::types::Tier;

/// Main configuration structure for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-tier admission control
    #[serde(default)]
    pub backpressure: PerTier<BackpressureConfig>,
    /// Per-tier hard capacity guards
    #[serde(default)]
    pub resource_limits: PerTier<ResourceLimitConfig>,
    /// Per-tier strength and decay parameters
    #[serde(default)]
    pub strength_model: PerTier<StrengthModelConfig>,
    /// Capacity pressure smoothing
    #[serde(default)]
    pub capacity_pressure: CapacityPressureConfig,
    /// Maintenance cycle driver
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Consolidation deduplication
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {e}")))
    }

    /// Read and parse a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Serialization(format!("Failed to render config: {e}")))
    }

    /// Reject invalid combinations before any component is built.
    pub fn validate(&self) -> Result<()> {
        self.capacity_pressure.validate()?;
        self.maintenance.validate()?;
        self.consolidation.validate()?;
        for tier in Tier::ALL {
            self.backpressure.get(tier).validate(tier)?;
            self.resource_limits.get(tier).validate(tier)?;
            self.strength_model.get(tier).validate(tier)?;
        }
        Ok(())
    }
}

/// Tier-specific default values
pub trait TierDefaults: Sized {
    fn tier_default(tier: Tier) -> Self;
}

/// One value per tier.
#[derive(Debug, Clone, Serialize)]
pub struct PerTier<T> {
    pub stm: T,
    pub mtm: T,
    pub ltm: T,
}

impl<T> PerTier<T> {
    pub fn get(&self, tier: Tier) -> &T {
        match tier {
            Tier::Short => &self.stm,
            Tier::Medium => &self.mtm,
            Tier::Long => &self.ltm,
        }
    }

    pub fn get_mut(&mut self, tier: Tier) -> &mut T {
        match tier {
            Tier::Short => &mut self.stm,
            Tier::Medium => &mut self.mtm,
            Tier::Long => &mut self.ltm,
        }
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> PerTier<U> {
        PerTier {
            stm: f(&self.stm),
            mtm: f(&self.mtm),
            ltm: f(&self.ltm),
        }
    }
}

impl<T: TierDefaults> Default for PerTier<T> {
    fn default() -> Self {
        Self {
            stm: T::tier_default(Tier::Short),
            mtm: T::tier_default(Tier::Medium),
            ltm: T::tier_default(Tier::Long),
        }
    }
}

impl<'de, T> Deserialize<'de> for PerTier<T>
where
    T: TierDefaults + Serialize + DeserializeOwned,
{
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut out = PerTier::<T>::default();
        for (key, overrides) in raw {
            let Ok(tier) = key.parse::<Tier>() else {
                tracing::debug!(key = %key, "Ignoring unknown tier key in config");
                continue;
            };
            let merged = merge_over_default(T::tier_default(tier), overrides)
                .map_err(|e| D::Error::custom(format!("{key}: {e}")))?;
            *out.get_mut(tier) = merged;
        }
        Ok(out)
    }
}

fn merge_over_default<T>(default: T, overrides: serde_json::Value) -> std::result::Result<T, String>
where
    T: Serialize + DeserializeOwned,
{
    let mut base = serde_json::to_value(default).map_err(|e| e.to_string())?;
    match (&mut base, overrides) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(over)) => {
            for (k, v) in over {
                base_map.insert(k, v);
            }
        }
        _ => return Err("tier section must be a table".to_string()),
    }
    serde_json::from_value(base).map_err(|e| e.to_string())
}

/// What the backpressure gate does once every inflight slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOverflow {
    #[serde(alias = "REJECT")]
    Reject,
    #[serde(alias = "QUEUE")]
    Queue,
}

/// What the resource-limit watchdog does when a tier is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityOverflow {
    #[serde(alias = "REJECT")]
    Reject,
    #[serde(alias = "EVICT")]
    Evict,
}

/// Backpressure limits for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Concurrent operations admitted immediately
    pub max_inflight: usize,
    /// Operations allowed to wait for a slot
    pub max_queue: usize,
    pub overflow_policy: QueueOverflow,
    /// How long a queued operation waits before timing out
    pub wait_timeout_seconds: f64,
}

impl TierDefaults for BackpressureConfig {
    fn tier_default(tier: Tier) -> Self {
        let (max_inflight, max_queue) = match tier {
            Tier::Short => (64, 256),
            Tier::Medium | Tier::Long => (32, 128),
        };
        Self {
            max_inflight,
            max_queue,
            overflow_policy: QueueOverflow::Queue,
            wait_timeout_seconds: 5.0,
        }
    }
}

impl BackpressureConfig {
    pub fn wait_timeout(&self) -> Duration {
        secs(self.wait_timeout_seconds)
    }

    fn validate(&self, tier: Tier) -> Result<()> {
        if self.max_inflight == 0 {
            return Err(EngineError::Config(format!(
                "backpressure.{tier}.max_inflight must be at least 1"
            )));
        }
        check_positive(
            &format!("backpressure.{tier}.wait_timeout_seconds"),
            self.wait_timeout_seconds,
        )
    }
}

/// Hard capacity limits for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimitConfig {
    pub max_items: usize,
    pub overflow_policy: CapacityOverflow,
    /// Cleanup passes before giving up with a capacity error
    pub max_eviction_attempts: u32,
    /// Upper bound on a single store call
    pub ingest_timeout_seconds: f64,
}

impl TierDefaults for ResourceLimitConfig {
    fn tier_default(tier: Tier) -> Self {
        let max_items = match tier {
            Tier::Short => 1_000,
            Tier::Medium => 10_000,
            Tier::Long => 100_000,
        };
        Self {
            max_items,
            overflow_policy: CapacityOverflow::Evict,
            max_eviction_attempts: 3,
            ingest_timeout_seconds: 10.0,
        }
    }
}

impl ResourceLimitConfig {
    pub fn ingest_timeout(&self) -> Duration {
        secs(self.ingest_timeout_seconds)
    }

    fn validate(&self, tier: Tier) -> Result<()> {
        if self.max_items == 0 {
            return Err(EngineError::Config(format!(
                "resource_limits.{tier}.max_items must be at least 1"
            )));
        }
        check_positive(
            &format!("resource_limits.{tier}.ingest_timeout_seconds"),
            self.ingest_timeout_seconds,
        )
    }
}

/// Strength and decay parameters for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrengthModelConfig {
    /// Seconds for passive strength to halve
    pub passive_half_life_seconds: f64,
    /// Seconds for reinforcement to halve
    pub reinforcement_half_life_seconds: f64,
    /// Largest fraction of strength one decay pass may remove (1.0 = uncapped)
    pub max_decay_per_cycle: f32,
    /// Forgetting threshold for a record of zero importance
    pub forgetting_threshold: f32,
    pub max_strength: f32,
    /// Largest reinforcement added by a single call
    pub max_reinforcement_step: f32,
    /// Reinforcement applied on each retrieval
    pub access_reinforcement: f32,
}

impl TierDefaults for StrengthModelConfig {
    fn tier_default(tier: Tier) -> Self {
        let (passive, reinforcement, threshold) = match tier {
            Tier::Short => (3_600.0, 600.0, 0.2),
            Tier::Medium => (86_400.0, 3_600.0, 0.1),
            Tier::Long => (2_592_000.0, 86_400.0, 0.05),
        };
        Self {
            passive_half_life_seconds: passive,
            reinforcement_half_life_seconds: reinforcement,
            max_decay_per_cycle: 1.0,
            forgetting_threshold: threshold,
            max_strength: 1.0,
            max_reinforcement_step: 0.3,
            access_reinforcement: 0.1,
        }
    }
}

impl StrengthModelConfig {
    fn validate(&self, tier: Tier) -> Result<()> {
        check_positive(
            &format!("strength_model.{tier}.passive_half_life_seconds"),
            self.passive_half_life_seconds,
        )?;
        check_positive(
            &format!("strength_model.{tier}.reinforcement_half_life_seconds"),
            self.reinforcement_half_life_seconds,
        )?;
        check_positive(
            &format!("strength_model.{tier}.max_strength"),
            self.max_strength as f64,
        )?;
        check_unit(
            &format!("strength_model.{tier}.max_decay_per_cycle"),
            self.max_decay_per_cycle,
        )?;
        check_unit(
            &format!("strength_model.{tier}.forgetting_threshold"),
            self.forgetting_threshold,
        )?;
        if self.max_reinforcement_step < 0.0 || self.access_reinforcement < 0.0 {
            return Err(EngineError::Config(format!(
                "strength_model.{tier} reinforcement amounts must be non-negative"
            )));
        }
        Ok(())
    }
}

/// Capacity pressure signal parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityPressureConfig {
    /// Utilization at or below which pressure is zero
    #[serde(default = "default_relief_ratio")]
    pub relief_ratio: f32,
    /// Utilization at which pressure saturates at one
    #[serde(default = "default_saturation_ratio")]
    pub saturation_ratio: f32,
    /// Exponential smoothing factor (0 = instant jump, 1 = no change)
    #[serde(default = "default_smoothing")]
    pub smoothing: f32,
}

impl Default for CapacityPressureConfig {
    fn default() -> Self {
        Self {
            relief_ratio: default_relief_ratio(),
            saturation_ratio: default_saturation_ratio(),
            smoothing: default_smoothing(),
        }
    }
}

fn default_relief_ratio() -> f32 {
    0.5
}

fn default_saturation_ratio() -> f32 {
    0.8
}

fn default_smoothing() -> f32 {
    0.3
}

impl CapacityPressureConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        check_unit("capacity_pressure.relief_ratio", self.relief_ratio)?;
        check_unit("capacity_pressure.smoothing", self.smoothing)?;
        if self.saturation_ratio <= self.relief_ratio {
            return Err(EngineError::Config(format!(
                "capacity_pressure.saturation_ratio ({}) must be greater than relief_ratio ({})",
                self.saturation_ratio, self.relief_ratio
            )));
        }
        Ok(())
    }
}

/// Maintenance cycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Calls to `maybe_run` inside this interval are no-ops
    #[serde(default = "default_min_interval_seconds")]
    pub min_interval_seconds: f64,
    /// Consolidations run concurrently per batch at zero pressure
    #[serde(default = "default_consolidation_batch_size")]
    pub consolidation_batch_size: usize,
    /// Batch size multiplier reached at full pressure
    #[serde(default = "default_max_batch_multiplier")]
    pub max_batch_multiplier: f32,
    /// Short-tier promotion threshold at zero pressure
    #[serde(default = "default_stm_priority_threshold")]
    pub stm_priority_threshold: f32,
    /// Short-tier promotion threshold at full pressure
    #[serde(default = "default_stm_priority_floor")]
    pub stm_priority_floor: f32,
    #[serde(default = "default_stm_min_access_count")]
    pub stm_min_access_count: u64,
    #[serde(default = "default_mtm_min_access_count")]
    pub mtm_min_access_count: u64,
    #[serde(default = "default_mtm_min_strength")]
    pub mtm_min_strength: f32,
    /// Medium-tier records at or above this importance promote regardless of access
    #[serde(default = "default_mtm_min_importance")]
    pub mtm_min_importance: f32,
    /// Upper bound on candidates collected per tier per cycle
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    /// Upper bound on records decayed per tier per cycle
    #[serde(default = "default_decay_batch_size")]
    pub decay_batch_size: usize,
    /// Mark forgotten records instead of deleting them
    #[serde(default)]
    pub retain_forgotten: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            min_interval_seconds: default_min_interval_seconds(),
            consolidation_batch_size: default_consolidation_batch_size(),
            max_batch_multiplier: default_max_batch_multiplier(),
            stm_priority_threshold: default_stm_priority_threshold(),
            stm_priority_floor: default_stm_priority_floor(),
            stm_min_access_count: default_stm_min_access_count(),
            mtm_min_access_count: default_mtm_min_access_count(),
            mtm_min_strength: default_mtm_min_strength(),
            mtm_min_importance: default_mtm_min_importance(),
            candidate_limit: default_candidate_limit(),
            decay_batch_size: default_decay_batch_size(),
            retain_forgotten: false,
        }
    }
}

fn default_min_interval_seconds() -> f64 {
    60.0
}

fn default_consolidation_batch_size() -> usize {
    16
}

fn default_max_batch_multiplier() -> f32 {
    4.0
}

fn default_stm_priority_threshold() -> f32 {
    0.6
}

fn default_stm_priority_floor() -> f32 {
    0.35
}

fn default_stm_min_access_count() -> u64 {
    3
}

fn default_mtm_min_access_count() -> u64 {
    5
}

fn default_mtm_min_strength() -> f32 {
    0.5
}

fn default_mtm_min_importance() -> f32 {
    0.8
}

fn default_candidate_limit() -> usize {
    256
}

fn default_decay_batch_size() -> usize {
    1_000
}

impl MaintenanceConfig {
    pub fn min_interval(&self) -> Duration {
        secs(self.min_interval_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.min_interval_seconds < 0.0 || !self.min_interval_seconds.is_finite() {
            return Err(EngineError::Config(
                "maintenance.min_interval_seconds must be a non-negative number".to_string(),
            ));
        }
        if self.consolidation_batch_size == 0 {
            return Err(EngineError::Config(
                "maintenance.consolidation_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_batch_multiplier < 1.0 {
            return Err(EngineError::Config(
                "maintenance.max_batch_multiplier must be at least 1.0".to_string(),
            ));
        }
        check_unit("maintenance.stm_priority_threshold", self.stm_priority_threshold)?;
        check_unit("maintenance.stm_priority_floor", self.stm_priority_floor)?;
        check_unit("maintenance.mtm_min_strength", self.mtm_min_strength)?;
        check_unit("maintenance.mtm_min_importance", self.mtm_min_importance)?;
        if self.stm_priority_floor > self.stm_priority_threshold {
            return Err(EngineError::Config(
                "maintenance.stm_priority_floor must not exceed stm_priority_threshold"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Consolidation deduplication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// How long a successful outcome is replayed to repeat callers
    #[serde(default = "default_dedupe_window_seconds")]
    pub dedupe_window_seconds: f64,
    /// Maximum number of cached outcomes.
    ///
    /// Bounds the window: once more distinct keys than this complete inside
    /// one window, the least recently used outcomes are evicted early and a
    /// repeat of those keys executes again.
    #[serde(default = "default_dedupe_cache_capacity")]
    pub dedupe_cache_capacity: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            dedupe_window_seconds: default_dedupe_window_seconds(),
            dedupe_cache_capacity: default_dedupe_cache_capacity(),
        }
    }
}

fn default_dedupe_window_seconds() -> f64 {
    30.0
}

fn default_dedupe_cache_capacity() -> usize {
    1_024
}

impl ConsolidationConfig {
    pub fn dedupe_window(&self) -> Duration {
        secs(self.dedupe_window_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.dedupe_window_seconds < 0.0 || !self.dedupe_window_seconds.is_finite() {
            return Err(EngineError::Config(
                "consolidation.dedupe_window_seconds must be a non-negative number".to_string(),
            ));
        }
        if self.dedupe_cache_capacity == 0 {
            return Err(EngineError::Config(
                "consolidation.dedupe_cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "{name} must be a positive number, got {value}"
        )))
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}
