//! Memory types for the tier engine
//!
//! Defines the record that moves between tiers, the tier ordering itself,
//! and the identity used to deduplicate consolidations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Storage tier, ordered from fast/short-lived to durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Short-term memory, fast and short-lived
    #[serde(rename = "stm", alias = "short")]
    Short,
    /// Medium-term memory
    #[serde(rename = "mtm", alias = "medium")]
    Medium,
    /// Long-term memory, durable
    #[serde(rename = "ltm", alias = "long")]
    Long,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Short, Tier::Medium, Tier::Long];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Short => "stm",
            Tier::Medium => "mtm",
            Tier::Long => "ltm",
        }
    }

    /// The tier a record is promoted into, if any
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Short => Some(Tier::Medium),
            Tier::Medium => Some(Tier::Long),
            Tier::Long => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stm" | "short" => Ok(Tier::Short),
            "mtm" | "medium" => Ok(Tier::Medium),
            "ltm" | "long" => Ok(Tier::Long),
            other => Err(EngineError::Config(format!("Unknown tier: {other}"))),
        }
    }
}

/// Lifecycle status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    /// Soft-forgotten; purged by the tier's cleanup
    Forgotten,
}

/// The unit moved between tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Identifier assigned by the owning tier
    pub id: String,
    /// Caller-owned payload
    pub content: String,
    /// Passive strength, decays over time
    pub strength: f32,
    /// Caller-supplied importance in [0, 1]
    pub importance: f32,
    /// Transient boost from recent access, decays faster than strength
    pub reinforcement_level: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub last_decay_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
    pub access_count: u64,
    pub tier: Tier,
    pub status: RecordStatus,
    /// Free-form metadata; consolidation merges its bookkeeping in here
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl MemoryRecord {
    /// Create a new short-tier record at full strength
    pub fn new(content: impl Into<String>, importance: f32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            strength: 1.0,
            importance: importance.clamp(0.0, 1.0),
            reinforcement_level: 0.0,
            created_at: now,
            last_accessed_at: now,
            last_decay_at: now,
            last_reinforced_at: now,
            access_count: 0,
            tier: Tier::Short,
            status: RecordStatus::Active,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Observable strength: passive strength plus reinforcement, capped
    pub fn effective_strength(&self, max_strength: f32) -> f32 {
        (self.strength + self.reinforcement_level).min(max_strength)
    }

    /// Mark this record as accessed, updating access count and timestamp
    pub fn mark_accessed(&mut self) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = Utc::now();
    }

    pub fn set_importance(&mut self, importance: f32) {
        self.importance = importance.clamp(0.0, 1.0);
    }

    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }
}

/// Identity of a logical cross-tier move
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsolidationKey {
    pub memory_id: String,
    pub source: Tier,
    pub target: Tier,
}

impl ConsolidationKey {
    pub fn new(memory_id: impl Into<String>, source: Tier, target: Tier) -> Self {
        Self {
            memory_id: memory_id.into(),
            source,
            target,
        }
    }
}

impl fmt::Display for ConsolidationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.memory_id, self.source, self.target)
    }
}

/// Result of a successful consolidation
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationOutcome {
    /// Identifier the record had in the source tier
    pub source_id: String,
    /// Identifier assigned by the target tier
    pub new_id: String,
    pub source: Tier,
    pub target: Tier,
    pub consolidated_at: DateTime<Utc>,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_new_defaults() {
        let record = MemoryRecord::new("hello", 0.4);
        assert_eq!(record.strength, 1.0);
        assert_eq!(record.importance, 0.4);
        assert_eq!(record.reinforcement_level, 0.0);
        assert_eq!(record.access_count, 0);
        assert_eq!(record.tier, Tier::Short);
        assert_eq!(record.status, RecordStatus::Active);
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn test_importance_clamped() {
        let mut record = MemoryRecord::new("x", 1.5);
        assert_eq!(record.importance, 1.0);
        record.set_importance(-0.2);
        assert_eq!(record.importance, 0.0);
    }

    #[test]
    fn test_mark_accessed() {
        let mut record = MemoryRecord::new("x", 0.5);
        let before = record.last_accessed_at;
        record.mark_accessed();
        record.mark_accessed();
        assert_eq!(record.access_count, 2);
        assert!(record.last_accessed_at >= before);
    }

    #[test]
    fn test_effective_strength_capped() {
        let mut record = MemoryRecord::new("x", 0.5);
        record.strength = 0.8;
        record.reinforcement_level = 0.5;
        assert_eq!(record.effective_strength(1.0), 1.0);
        record.reinforcement_level = 0.1;
        assert!((record.effective_strength(1.0) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_tier_ordering_and_next() {
        assert!(Tier::Short < Tier::Medium && Tier::Medium < Tier::Long);
        assert_eq!(Tier::Short.next(), Some(Tier::Medium));
        assert_eq!(Tier::Medium.next(), Some(Tier::Long));
        assert_eq!(Tier::Long.next(), None);
    }

    #[test]
    fn test_tier_parse_both_namings() {
        assert_eq!("stm".parse::<Tier>().unwrap(), Tier::Short);
        assert_eq!("Medium".parse::<Tier>().unwrap(), Tier::Medium);
        assert_eq!("ltm".parse::<Tier>().unwrap(), Tier::Long);
        assert!("hot".parse::<Tier>().is_err());
    }

    #[test]
    fn test_tier_serde_names() {
        assert_eq!(serde_json::to_string(&Tier::Short).unwrap(), "\"stm\"");
        let tier: Tier = serde_json::from_str("\"long\"").unwrap();
        assert_eq!(tier, Tier::Long);
    }

    #[test]
    fn test_record_serialization() {
        let mut record = MemoryRecord::new("Test content", 0.7);
        record
            .metadata
            .insert("topic".to_string(), serde_json::json!("rust"));

        let json = serde_json::to_string(&record).expect("Failed to serialize record");
        let back: MemoryRecord = serde_json::from_str(&json).expect("Failed to deserialize");

        assert_eq!(record.id, back.id);
        assert_eq!(record.content, back.content);
        assert_eq!(back.metadata.get("topic"), Some(&serde_json::json!("rust")));
    }

    #[test]
    fn test_consolidation_key_identity() {
        let a = ConsolidationKey::new("m1", Tier::Short, Tier::Medium);
        let b = ConsolidationKey::new("m1", Tier::Short, Tier::Medium);
        let c = ConsolidationKey::new("m1", Tier::Medium, Tier::Long);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "m1:stm->mtm");
    }
}
