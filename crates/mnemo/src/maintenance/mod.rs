//! Maintenance cycles: decay, forgetting and promotion

pub mod orchestrator;
pub mod report;

pub use orchestrator::MaintenanceOrchestrator;
pub use report::{MaintenanceReport, TierReport};
