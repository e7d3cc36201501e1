//! Deterministic Simulation Support
//!
//! Seeded randomness plus an in-process cluster fixture. Everything that
//! draws randomness takes a `DeterministicRng` so a failing seed replays
//! the same interleaving.
//!
//! ```text
//! seed ──► DeterministicRng ──► buggify fault points
//!                          └──► workload generator
//!                          └──► SimulatedCluster (primary + replicas)
//! ```

mod cluster;
mod rng;

pub use cluster::{ClusterError, PromotionReport, SimulatedCluster};
pub use rng::DeterministicRng;
