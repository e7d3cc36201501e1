//! Stateright Model Checking
//!
//! Exhaustive state-space exploration of the checkpoint rules, alongside
//! the DST harness in `recovery::dst` which runs the real code.
//!
//! ## Available Models
//!
//! - `checkpoint`: local and global checkpoint safety under reordering,
//!   late reports and copy removal
//!
//! ## Running Model Checks
//!
//! ```bash
//! cargo test stateright_checkpoint -- --ignored --nocapture
//! ```

pub mod checkpoint;

pub use checkpoint::CheckpointModel;
