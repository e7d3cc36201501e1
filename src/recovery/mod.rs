//! Recovery - bringing a copy to a consistent, caught-up state
//!
//! ```text
//!            ┌──────────────────┐
//!  store ───►│                  │
//!  peer ────►│ RECOVERING copy  ├──► POST_RECOVERY
//!  snapshot ►│                  │      (or CLOSED with a RecoveryFailure)
//!            └──────────────────┘
//! ```
//!
//! Store and snapshot recovery run inside `IndexShard`. Peer recovery is
//! split between [`RecoverySourceHandler`] on the primary and
//! [`RecoveryTarget`] on the recovering copy, talking through
//! `transport::RecoveryTargetHandler`.
//!
//! A failed recovery is never resumed: the copy is closed and the
//! allocator starts a new one with a fresh `RecoveryState`.

pub mod dst;
mod error;
mod source;
mod state;
mod target;

pub use error::{RecoveryCause, RecoveryFailure};
pub use source::RecoverySourceHandler;
pub use state::{FileRecoveryStats, RecoveryStage, RecoveryState};
pub use target::RecoveryTarget;
