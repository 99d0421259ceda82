//! Mnemo engine - tiered memory consolidation and lifecycle
//!
//! This crate moves memory records between a short, a medium and a long
//! tier. It decides what to promote and what to forget, and protects each
//! tier with admission control while many callers work concurrently.

pub mod admission;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod events;
pub mod maintenance;
pub mod manager;
pub mod memory;
pub mod storage;
pub mod testing;

pub use config::Config;
pub use error::{EngineError, ErrorKind, Result, RetryHint};
pub use manager::MemoryManager;
pub use memory::types::{ConsolidationKey, ConsolidationOutcome, MemoryRecord, Tier};
