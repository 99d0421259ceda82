//! Capacity pressure tracking
//!
//! Turns per-tier utilization into a smoothed 0-1 pressure signal. Pressure
//! is zero at or below `relief_ratio`, one at `saturation_ratio`, linear in
//! between, and blended with the previous value so thresholds derived from
//! it do not flap between cycles.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use crate::config::CapacityPressureConfig;
use crate::error::Result;
use crate::memory::types::Tier;

/// Last observed pressure for a tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPressureState {
    pub utilization_ratio: f32,
    pub smoothed_pressure: f32,
}

/// Per-tier smoothed capacity pressure
#[derive(Debug)]
pub struct TierCapacityPressureAdapter {
    config: CapacityPressureConfig,
    state: Mutex<HashMap<Tier, TierPressureState>>,
}

impl TierCapacityPressureAdapter {
    /// Fails if `saturation_ratio <= relief_ratio` or smoothing is outside [0, 1]
    pub fn new(config: CapacityPressureConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CapacityPressureConfig {
        &self.config
    }

    /// Record a utilization sample and return the new smoothed pressure
    pub fn observe(&self, tier: Tier, utilization_ratio: f32) -> f32 {
        let ratio = if utilization_ratio.is_nan() {
            0.0
        } else {
            utilization_ratio.clamp(0.0, 1.0)
        };
        let target = self.target_pressure(ratio);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state.get(&tier).map_or(0.0, |s| s.smoothed_pressure);
        let smoothed = (self.config.smoothing * previous + (1.0 - self.config.smoothing) * target)
            .clamp(0.0, 1.0);
        state.insert(
            tier,
            TierPressureState {
                utilization_ratio: ratio,
                smoothed_pressure: smoothed,
            },
        );
        smoothed
    }

    fn target_pressure(&self, ratio: f32) -> f32 {
        if ratio <= self.config.relief_ratio {
            return 0.0;
        }
        let span = self.config.saturation_ratio - self.config.relief_ratio;
        ((ratio - self.config.relief_ratio) / span).clamp(0.0, 1.0)
    }

    /// Smoothed pressure, 0 if the tier was never observed
    pub fn pressure_for(&self, tier: Tier) -> f32 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tier)
            .map_or(0.0, |s| s.smoothed_pressure)
    }

    pub fn snapshot(&self) -> BTreeMap<Tier, TierPressureState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(tier, state)| (*tier, *state))
            .collect()
    }

    /// Threshold interpolated from `base` at no pressure to `floor` at full
    /// pressure, widening the candidate pool as the tier fills.
    pub fn priority_threshold(&self, tier: Tier, base: f32, floor: f32) -> f32 {
        let pressure = self.pressure_for(tier);
        base + (floor - base) * pressure
    }

    /// Batch size scaled from `base` up to `base * max_multiplier`, never below 1
    pub fn batch_size(&self, tier: Tier, base: usize, max_multiplier: f32) -> usize {
        let pressure = self.pressure_for(tier);
        let multiplier = 1.0 + (max_multiplier.max(1.0) - 1.0) * pressure;
        ((base as f32 * multiplier).round() as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(relief: f32, saturation: f32, smoothing: f32) -> TierCapacityPressureAdapter {
        TierCapacityPressureAdapter::new(CapacityPressureConfig {
            relief_ratio: relief,
            saturation_ratio: saturation,
            smoothing,
        })
        .unwrap()
    }

    #[test]
    fn test_construction_rejects_inverted_ratios() {
        let result = TierCapacityPressureAdapter::new(CapacityPressureConfig {
            relief_ratio: 0.8,
            saturation_ratio: 0.5,
            smoothing: 0.5,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_unobserved_tier_has_zero_pressure() {
        let adapter = adapter(0.5, 0.8, 0.5);
        assert_eq!(adapter.pressure_for(Tier::Medium), 0.0);
        assert!(adapter.snapshot().is_empty());
    }

    #[test]
    fn test_below_relief_is_zero() {
        let adapter = adapter(0.5, 0.8, 0.0);
        assert_eq!(adapter.observe(Tier::Short, 0.3), 0.0);
        assert_eq!(adapter.observe(Tier::Short, 0.5), 0.0);
    }

    #[test]
    fn test_linear_between_relief_and_saturation() {
        let adapter = adapter(0.5, 0.8, 0.0);
        let pressure = adapter.observe(Tier::Short, 0.65);
        assert!((pressure - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_ratio_is_clamped() {
        let adapter = adapter(0.5, 0.8, 0.0);
        assert_eq!(adapter.observe(Tier::Short, 3.0), 1.0);
        assert_eq!(adapter.snapshot()[&Tier::Short].utilization_ratio, 1.0);
        assert_eq!(adapter.observe(Tier::Short, -1.0), 0.0);
    }

    #[test]
    fn test_smoothing_converges_towards_full_pressure() {
        let adapter = adapter(0.5, 0.8, 0.5);
        let tier: Tier = "stm".parse().unwrap();

        let first = adapter.observe(tier, 0.95);
        assert!(first < 1.0);

        let mut last = first;
        for _ in 0..20 {
            let next = adapter.observe(tier, 0.95);
            assert!(next >= last);
            last = next;
        }
        assert!(last > 0.99);

        let threshold = adapter.priority_threshold(tier, 0.6, 0.35);
        assert!((threshold - 0.35).abs() < 0.01);
    }

    #[test]
    fn test_smoothing_one_never_moves() {
        let adapter = adapter(0.5, 0.8, 1.0);
        assert_eq!(adapter.observe(Tier::Long, 1.0), 0.0);
    }

    #[test]
    fn test_tiers_are_independent() {
        let adapter = adapter(0.5, 0.8, 0.0);
        adapter.observe(Tier::Short, 1.0);
        assert_eq!(adapter.pressure_for(Tier::Short), 1.0);
        assert_eq!(adapter.pressure_for(Tier::Medium), 0.0);
    }

    #[test]
    fn test_priority_threshold_without_pressure_is_base() {
        let adapter = adapter(0.5, 0.8, 0.0);
        assert_eq!(adapter.priority_threshold(Tier::Short, 0.6, 0.35), 0.6);
    }

    #[test]
    fn test_batch_size_scales_with_pressure() {
        let adapter = adapter(0.5, 0.8, 0.0);
        assert_eq!(adapter.batch_size(Tier::Short, 10, 4.0), 10);

        adapter.observe(Tier::Short, 1.0);
        assert_eq!(adapter.batch_size(Tier::Short, 10, 4.0), 40);
        assert_eq!(adapter.batch_size(Tier::Short, 0, 4.0), 1);
    }
}
