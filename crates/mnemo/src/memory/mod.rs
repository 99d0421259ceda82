//! Memory records and their strength model
//!
//! Defines the record that moves between tiers and the time-based model
//! that decays and reinforces it.

pub mod strength;
pub mod types;

pub use strength::{DecayInput, DecayOutcome, StrengthDecayModel};
pub use types::{ConsolidationKey, ConsolidationOutcome, MemoryRecord, RecordStatus, Tier};
