//! Fault probabilities

use super::faults;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub enabled: bool,
    probabilities: HashMap<String, f64>,
    /// Scales every configured probability
    pub multiplier: f64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl FaultConfig {
    /// Enabled, no faults configured
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            probabilities: HashMap::new(),
            multiplier: 1.0,
        }
    }

    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            ..Self::new()
        }
    }

    /// Low-rate faults on every path
    pub fn moderate() -> Self {
        Self::new()
            .with(faults::transport::REPLICA_DISCONNECT, 0.01)
            .with(faults::transport::REPLICA_RESPONSE_LOST, 0.01)
            .with(faults::transport::RECOVERY_DISCONNECT, 0.01)
            .with(faults::transport::CHUNK_CORRUPT, 0.01)
            .with(faults::transport::RECOVERY_STALL, 0.005)
            .with(faults::store::CRASH, 0.001)
    }

    /// High-rate faults for short runs
    pub fn chaos() -> Self {
        Self::new()
            .with(faults::transport::REPLICA_DISCONNECT, 0.10)
            .with(faults::transport::REPLICA_RESPONSE_LOST, 0.05)
            .with(faults::transport::RECOVERY_DISCONNECT, 0.05)
            .with(faults::transport::CHUNK_CORRUPT, 0.05)
            .with(faults::transport::RECOVERY_STALL, 0.02)
            .with(faults::store::CRASH, 0.01)
    }

    pub fn with(mut self, fault_id: &str, probability: f64) -> Self {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
        self
    }

    /// Effective probability of `fault_id` (0 when disabled)
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let p = self.probabilities.get(fault_id).copied().unwrap_or(0.0);
        (p * self.multiplier).clamp(0.0, 1.0)
    }
}
