//! Admission control for tier writes
//!
//! Backpressure bounds concurrent and queued operations, the watchdog bounds
//! tier size, and the pressure adapter turns occupancy into a signal the
//! maintenance cycle uses to relax its thresholds.

pub mod backpressure;
pub mod limits;
pub mod pressure;

pub use backpressure::{BackpressureController, BackpressurePermit, BackpressureSnapshot};
pub use limits::{ResourceLimitWatchdog, TierCapacity};
pub use pressure::{TierCapacityPressureAdapter, TierPressureState};
