//! Per-tier admission control
//!
//! Each tier gets a semaphore sized to `max_inflight`. When every slot is
//! taken the tier's overflow policy either rejects immediately or parks the
//! caller in a bounded wait queue until a slot frees or `wait_timeout`
//! elapses. Admission returns a [`BackpressurePermit`]; dropping it is the
//! release, so a slot can never be released twice.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{BackpressureConfig, PerTier, QueueOverflow};
use crate::error::{EngineError, Result};
use crate::memory::types::Tier;

/// Inflight and queued counts for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureSnapshot {
    pub inflight: usize,
    pub queued: usize,
    pub max_inflight: usize,
    pub max_queue: usize,
}

#[derive(Debug, Default)]
struct GateCounters {
    inflight: usize,
    queued: usize,
}

#[derive(Debug)]
struct TierGate {
    tier: Tier,
    config: BackpressureConfig,
    semaphore: Arc<Semaphore>,
    counters: Mutex<GateCounters>,
}

impl TierGate {
    fn counters(&self) -> std::sync::MutexGuard<'_, GateCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-tier admission gate bounding concurrent and queued operations
#[derive(Debug)]
pub struct BackpressureController {
    gates: HashMap<Tier, Arc<TierGate>>,
}

impl BackpressureController {
    pub fn new(limits: &PerTier<BackpressureConfig>) -> Self {
        let gates = Tier::ALL
            .into_iter()
            .map(|tier| {
                let config = limits.get(tier).clone();
                let gate = TierGate {
                    tier,
                    semaphore: Arc::new(Semaphore::new(config.max_inflight)),
                    config,
                    counters: Mutex::new(GateCounters::default()),
                };
                (tier, Arc::new(gate))
            })
            .collect();
        Self { gates }
    }

    fn gate(&self, tier: Tier) -> Result<&Arc<TierGate>> {
        self.gates
            .get(&tier)
            .ok_or_else(|| EngineError::Config(format!("No backpressure gate for {tier}")))
    }

    /// Admit one operation on `tier`.
    ///
    /// # Errors
    /// * `Backpressure` - all slots taken under REJECT, or the wait queue is full
    /// * `Timeout` - queued longer than `wait_timeout`
    pub async fn acquire(&self, tier: Tier) -> Result<BackpressurePermit> {
        let gate = Arc::clone(self.gate(tier)?);

        if let Ok(permit) = Arc::clone(&gate.semaphore).try_acquire_owned() {
            return Ok(BackpressurePermit::admit(gate, permit));
        }

        match gate.config.overflow_policy {
            QueueOverflow::Reject => {
                let inflight = gate.counters().inflight;
                tracing::debug!(tier = %tier, inflight, "Backpressure rejected operation");
                Err(EngineError::Backpressure {
                    tier,
                    reason: format!(
                        "{inflight} operations in flight (max {})",
                        gate.config.max_inflight
                    ),
                })
            }
            QueueOverflow::Queue => Self::wait_for_slot(gate).await,
        }
    }

    async fn wait_for_slot(gate: Arc<TierGate>) -> Result<BackpressurePermit> {
        let tier = gate.tier;
        {
            let mut counters = gate.counters();
            if counters.queued >= gate.config.max_queue {
                tracing::debug!(tier = %tier, queued = counters.queued, "Backpressure queue full");
                return Err(EngineError::Backpressure {
                    tier,
                    reason: format!("wait queue full ({} queued)", counters.queued),
                });
            }
            counters.queued += 1;
        }
        // Decrements `queued` however this future ends, including cancellation
        let _queued = QueuedSlot(Arc::clone(&gate));

        let wait = gate.config.wait_timeout();
        match tokio::time::timeout(wait, Arc::clone(&gate.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(BackpressurePermit::admit(Arc::clone(&gate), permit)),
            Ok(Err(_)) => Err(EngineError::Backpressure {
                tier,
                reason: "gate closed".to_string(),
            }),
            Err(_) => {
                tracing::debug!(tier = %tier, ?wait, "Backpressure wait timed out");
                Err(EngineError::timeout(format!("backpressure wait on {tier}"), wait))
            }
        }
    }

    /// Run `operation` while holding a slot on `tier`
    pub async fn run<F, T>(&self, tier: Tier, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.acquire(tier).await?;
        operation.await
    }

    pub fn snapshot(&self) -> BTreeMap<Tier, BackpressureSnapshot> {
        self.gates
            .iter()
            .map(|(tier, gate)| {
                let counters = gate.counters();
                (
                    *tier,
                    BackpressureSnapshot {
                        inflight: counters.inflight,
                        queued: counters.queued,
                        max_inflight: gate.config.max_inflight,
                        max_queue: gate.config.max_queue,
                    },
                )
            })
            .collect()
    }
}

struct QueuedSlot(Arc<TierGate>);

impl Drop for QueuedSlot {
    fn drop(&mut self) {
        let mut counters = self.0.counters();
        counters.queued = counters.queued.saturating_sub(1);
    }
}

/// An admitted operation. Dropping it releases the slot and wakes one waiter.
#[derive(Debug)]
pub struct BackpressurePermit {
    gate: Arc<TierGate>,
    _permit: OwnedSemaphorePermit,
}

impl BackpressurePermit {
    fn admit(gate: Arc<TierGate>, permit: OwnedSemaphorePermit) -> Self {
        gate.counters().inflight += 1;
        Self {
            gate,
            _permit: permit,
        }
    }

    pub fn tier(&self) -> Tier {
        self.gate.tier
    }

    /// Release the slot explicitly
    pub fn release(self) {}
}

impl Drop for BackpressurePermit {
    fn drop(&mut self) {
        let mut counters = self.gate.counters();
        counters.inflight = counters.inflight.saturating_sub(1);
    }
}
