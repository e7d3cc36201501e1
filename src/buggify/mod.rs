//! BUGGIFY - seeded fault injection for the simulated transports
//!
//! A fault point asks whether a named fault fires now. The answer comes
//! from the per-thread [`FaultConfig`] and the caller's
//! [`DeterministicRng`](crate::simulator::DeterministicRng), so a failing
//! seed replays the same faults.
//!
//! ```ignore
//! if buggify!(&mut rng, faults::transport::REPLICA_DISCONNECT) {
//!     return Err(TransportError::Disconnected("buggify".into()));
//! }
//! ```
//!
//! Configuration and counters live in a thread local; simulations run on
//! a current-thread runtime so every fault point of a run sees them.

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use crate::simulator::DeterministicRng;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Checks and hits of one fault point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounter {
    pub checks: u64,
    pub triggers: u64,
}

/// Per-fault counters since the last [`reset_stats`]
#[derive(Debug, Clone, Default)]
pub struct FaultStats {
    counters: BTreeMap<String, FaultCounter>,
}

impl FaultStats {
    pub fn get(&self, fault_id: &str) -> FaultCounter {
        self.counters.get(fault_id).copied().unwrap_or_default()
    }

    pub fn total_triggers(&self) -> u64 {
        self.counters.values().map(|c| c.triggers).sum()
    }

    fn record(&mut self, fault_id: &str, triggered: bool) {
        let counter = self.counters.entry(fault_id.to_string()).or_default();
        counter.checks += 1;
        if triggered {
            counter.triggers += 1;
        }
    }
}

#[derive(Debug, Default)]
struct FaultContext {
    config: FaultConfig,
    stats: FaultStats,
    /// Nesting depth of active suppress guards
    suppressed: usize,
}

thread_local! {
    static CONTEXT: RefCell<FaultContext> = RefCell::new(FaultContext::default());
}

/// Install `config` for fault points on this thread
pub fn set_config(config: FaultConfig) {
    CONTEXT.with(|ctx| ctx.borrow_mut().config = config);
}

pub fn stats() -> FaultStats {
    CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

pub fn reset_stats() {
    CONTEXT.with(|ctx| ctx.borrow_mut().stats = FaultStats::default());
}

/// While alive, no fault fires on this thread. Guards nest.
pub struct SuppressGuard {
    _private: (),
}

impl SuppressGuard {
    pub fn new() -> Self {
        CONTEXT.with(|ctx| ctx.borrow_mut().suppressed += 1);
        SuppressGuard { _private: () }
    }
}

impl Default for SuppressGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            ctx.suppressed = ctx.suppressed.saturating_sub(1);
        });
    }
}

/// Decide whether `fault_id` fires. `probability` overrides the configured one.
pub fn should_fire(rng: &mut DeterministicRng, fault_id: &str, probability: Option<f64>) -> bool {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        let p = if ctx.suppressed > 0 || !ctx.config.enabled {
            0.0
        } else {
            probability
                .map(|p| p.clamp(0.0, 1.0))
                .unwrap_or_else(|| ctx.config.get(fault_id))
        };
        // Draw only for live faults so adding a zero-rate point keeps replays stable
        let triggered = p > 0.0 && (rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0) < p;
        ctx.stats.record(fault_id, triggered);
        triggered
    })
}

/// Fire a fault point: `buggify!(rng, fault_id)` or `buggify!(rng, fault_id, probability)`
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_fire($rng, $fault_id, None)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_fire($rng, $fault_id, Some($prob))
    };
}

/// Guard that keeps every fault point quiet until dropped
#[macro_export]
macro_rules! suppress_buggify {
    () => {
        $crate::buggify::SuppressGuard::new()
    };
}
