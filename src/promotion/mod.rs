//! Promotion - resynchronizing replicas under a new primary
//!
//! When a replica is promoted it holds every operation the old primary
//! acknowledged (it was in sync), but other replicas may not. The new
//! primary re-broadcasts everything above the old global checkpoint under
//! its new term.
//!
//! ```text
//! update_shard_state(promote)
//!        │  fill gaps, activate primary mode
//!        ▼
//!   ResyncTask ──► ResyncHandle ──mpsc──► PrimaryReplicaSyncer
//!                                              │ batches per target
//!                                              ▼
//!                                        ReplicaClient ──► replicas
//!                                              │
//!   ResyncReceipt ◄──────oneshot───────── ResyncResponse
//! ```

mod syncer;

pub use syncer::{
    spawn_resync_actor, PrimaryReplicaSyncer, ResyncError, ResyncHandle, ResyncReceipt,
    ResyncResponse, ResyncTask,
};
