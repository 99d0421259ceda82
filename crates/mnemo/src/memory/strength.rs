//! Strength and decay model for memory records
//!
//! Computes a record's current strength from elapsed time and prior
//! reinforcement. The model is side-effect free: it only reports whether a
//! record fell to its forgetting threshold, and removal is left to the
//! maintenance orchestrator.
//!
//! Passive decay halves strength every `passive_half_life_seconds`:
//!
//! `strength * 2^(-elapsed / half_life)`
//!
//! Reinforcement decays the same way on its own, shorter, half-life and is
//! added on top of passive strength, capped at `max_strength`.

use chrono::{DateTime, Utc};

use crate::config::StrengthModelConfig;
use crate::memory::types::MemoryRecord;

/// Inputs to a single decay step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayInput {
    pub strength: f32,
    pub importance: f32,
    pub reinforcement_level: f32,
    /// Seconds since decay was last applied
    pub elapsed_decay_secs: f64,
    /// Seconds since the record was last reinforced
    pub elapsed_reinforcement_secs: f64,
}

/// Result of a single decay step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayOutcome {
    pub strength: f32,
    pub reinforcement_level: f32,
    /// Observable strength after decay
    pub effective_strength: f32,
    /// Whether the record is now at or below its forgetting threshold
    pub forget: bool,
}

/// Time-based strength model for one tier
#[derive(Debug, Clone)]
pub struct StrengthDecayModel {
    config: StrengthModelConfig,
}

impl StrengthDecayModel {
    pub fn new(config: StrengthModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrengthModelConfig {
        &self.config
    }

    pub fn max_strength(&self) -> f32 {
        self.config.max_strength
    }

    /// Apply passive and reinforcement decay.
    ///
    /// Passive loss within one call is limited by `max_decay_per_cycle`.
    /// Negative elapsed times (clock skew) are treated as zero.
    pub fn decay(&self, input: DecayInput) -> DecayOutcome {
        let decayed = input.strength
            * half_life_factor(
                input.elapsed_decay_secs,
                self.config.passive_half_life_seconds,
            );
        let floor = input.strength * (1.0 - self.config.max_decay_per_cycle);
        let strength = decayed.max(floor).clamp(0.0, self.config.max_strength);

        let reinforcement_level = (input.reinforcement_level
            * half_life_factor(
                input.elapsed_reinforcement_secs,
                self.config.reinforcement_half_life_seconds,
            ))
        .max(0.0);

        let effective_strength = self.effective_strength(strength, reinforcement_level);
        DecayOutcome {
            strength,
            reinforcement_level,
            effective_strength,
            forget: effective_strength <= self.forgetting_threshold_for(input.importance),
        }
    }

    /// Add reinforcement, returning the new reinforcement level.
    ///
    /// At most `max_reinforcement_step` is added per call, and the result is
    /// clamped so `strength + reinforcement` never exceeds `max_strength`.
    pub fn apply_reinforcement(&self, strength: f32, reinforcement_level: f32, amount: f32) -> f32 {
        let step = amount.clamp(0.0, self.config.max_reinforcement_step);
        let headroom = (self.config.max_strength - strength).max(0.0);
        (reinforcement_level + step).min(headroom).max(0.0)
    }

    pub fn effective_strength(&self, strength: f32, reinforcement_level: f32) -> f32 {
        (strength + reinforcement_level).min(self.config.max_strength)
    }

    /// Forgetting threshold scaled down by importance.
    ///
    /// Monotonically decreasing: a record of importance 1.0 is never forgotten
    /// while it has any strength left.
    pub fn forgetting_threshold_for(&self, importance: f32) -> f32 {
        self.config.forgetting_threshold * (1.0 - importance.clamp(0.0, 1.0))
    }

    /// Decay a record in place as of `now` and return the outcome
    pub fn decay_record(&self, record: &mut MemoryRecord, now: DateTime<Utc>) -> DecayOutcome {
        let outcome = self.decay(DecayInput {
            strength: record.strength,
            importance: record.importance,
            reinforcement_level: record.reinforcement_level,
            elapsed_decay_secs: elapsed_secs(record.last_decay_at, now),
            elapsed_reinforcement_secs: elapsed_secs(record.last_reinforced_at, now),
        });
        record.strength = outcome.strength;
        record.reinforcement_level = outcome.reinforcement_level;
        record.last_decay_at = now;
        record.last_reinforced_at = now;
        outcome
    }

    /// Reinforce a record in place, settling pending decay first
    pub fn reinforce_record(&self, record: &mut MemoryRecord, amount: f32, now: DateTime<Utc>) {
        self.decay_record(record, now);
        record.reinforcement_level =
            self.apply_reinforcement(record.strength, record.reinforcement_level, amount);
    }

    /// Reinforce a record without settling passive decay.
    ///
    /// For tiers the maintenance cycle does not decay: strength and
    /// `last_decay_at` are left alone so an accessed record never ends up
    /// weaker than an untouched one. Reinforcement still decays on its own
    /// clock before the new amount is added.
    pub fn reinforce_only(&self, record: &mut MemoryRecord, amount: f32, now: DateTime<Utc>) {
        let elapsed = elapsed_secs(record.last_reinforced_at, now);
        let level = record.reinforcement_level
            * half_life_factor(elapsed, self.config.reinforcement_half_life_seconds);
        record.reinforcement_level =
            self.apply_reinforcement(record.strength, level.max(0.0), amount);
        record.last_reinforced_at = now;
    }
}

fn half_life_factor(elapsed_secs: f64, half_life_secs: f64) -> f32 {
    if elapsed_secs <= 0.0 || half_life_secs <= 0.0 {
        return 1.0;
    }
    (-elapsed_secs / half_life_secs).exp2() as f32
}

fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds().max(0) as f64 / 1000.0
}
