//! Filter types for tier queries
//!
//! Provides the predicates the engine passes to tier collaborators when
//! listing records for decay and promotion.

use chrono::{DateTime, Utc};

use crate::memory::types::MemoryRecord;

/// Filter criteria for tier queries.
///
/// All fields are optional - when `None`, that filter is not applied.
/// Multiple filters are combined with AND logic. Forgotten records are
/// excluded unless `include_forgotten` is set.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Minimum passive strength (inclusive)
    pub min_strength: Option<f32>,
    /// Minimum importance (inclusive)
    pub min_importance: Option<f32>,
    /// Minimum access count (inclusive)
    pub min_access_count: Option<u64>,
    /// Only records last accessed before this time
    pub accessed_before: Option<DateTime<Utc>>,
    pub include_forgotten: bool,
}

impl RecordFilter {
    /// Create a new empty filter (active records only)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_strength(mut self, min_strength: f32) -> Self {
        self.min_strength = Some(min_strength);
        self
    }

    pub fn with_min_importance(mut self, min_importance: f32) -> Self {
        self.min_importance = Some(min_importance);
        self
    }

    pub fn with_min_access_count(mut self, min_access_count: u64) -> Self {
        self.min_access_count = Some(min_access_count);
        self
    }

    pub fn accessed_before(mut self, before: DateTime<Utc>) -> Self {
        self.accessed_before = Some(before);
        self
    }

    pub fn including_forgotten(mut self) -> Self {
        self.include_forgotten = true;
        self
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if !self.include_forgotten && !record.is_active() {
            return false;
        }
        if let Some(min) = self.min_strength {
            if record.strength < min {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if record.importance < min {
                return false;
            }
        }
        if let Some(min) = self.min_access_count {
            if record.access_count < min {
                return false;
            }
        }
        if let Some(before) = self.accessed_before {
            if record.last_accessed_at >= before {
                return false;
            }
        }
        true
    }

    /// Check if this filter is empty (no conditions set)
    pub fn is_empty(&self) -> bool {
        self.min_strength.is_none()
            && self.min_importance.is_none()
            && self.min_access_count.is_none()
            && self.accessed_before.is_none()
            && !self.include_forgotten
    }
}

/// Promotion predicate for a tier.
///
/// A record qualifies when it is important enough OR accessed often
/// enough, and in either case still holds `min_strength`.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionCriteria {
    pub min_importance: f32,
    pub min_access_count: u64,
    /// Minimum observable strength
    pub min_strength: f32,
    pub max_strength: f32,
}

impl PromotionCriteria {
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        record.is_active()
            && record.effective_strength(self.max_strength) >= self.min_strength
            && (record.importance >= self.min_importance
                || record.access_count >= self.min_access_count)
    }

    /// Ordering key for candidates, higher promotes first
    pub fn priority(&self, record: &MemoryRecord) -> f32 {
        let access_scale = (self.min_access_count.max(1) as f32 + 1.0).ln();
        let access = ((record.access_count as f32 + 1.0).ln() / access_scale).min(2.0);
        record.importance + 0.5 * access + 0.25 * record.effective_strength(self.max_strength)
    }
}
