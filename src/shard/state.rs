//! Shard lifecycle state machine
//!
//! ```text
//! CREATED ──markAsRecovering──► RECOVERING ──recovery done──► POST_RECOVERY ──start──► STARTED
//!    │                              │                              │                      │
//!    │                              └──recovery failed──┐          │             relocation handoff
//!    ▼                                                  ▼          ▼                      ▼
//!  CLOSED ◄─────────────────────────────────────────────┴──────────┴──────────────── RELOCATED
//! ```
//!
//! `RELOCATED` and `CLOSED` are terminal.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardState {
    Created,
    Recovering,
    PostRecovery,
    Started,
    Relocated,
    Closed,
}

impl ShardState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ShardState::Relocated | ShardState::Closed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(self, next: ShardState) -> bool {
        use ShardState::*;
        match (self, next) {
            (Created, Recovering) => true,
            (Recovering, PostRecovery) => true,
            (PostRecovery, Started) => true,
            (Started, Relocated) => true,
            (Created | Recovering | PostRecovery | Started, Closed) => true,
            _ => false,
        }
    }

    /// Primaries accept client writes only once started
    pub fn allows_primary_writes(self) -> bool {
        self == ShardState::Started
    }

    /// Replicas apply the primary's stream while catching up and once started
    pub fn allows_replica_writes(self) -> bool {
        matches!(
            self,
            ShardState::Recovering | ShardState::PostRecovery | ShardState::Started
        )
    }
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShardState::Created => "CREATED",
            ShardState::Recovering => "RECOVERING",
            ShardState::PostRecovery => "POST_RECOVERY",
            ShardState::Started => "STARTED",
            ShardState::Relocated => "RELOCATED",
            ShardState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Current state plus the reason for the last transition
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ShardState,
    reason: String,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            state: ShardState::Created,
            reason: "created".to_string(),
        }
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(
        &mut self,
        next: ShardState,
        reason: impl Into<String>,
    ) -> Result<ShardState, (ShardState, ShardState)> {
        if !self.state.can_transition_to(next) {
            return Err((self.state, next));
        }
        let previous = self.state;
        self.state = next;
        self.reason = reason.into();
        Ok(previous)
    }

    /// Close from any non-terminal state. Returns false if already terminal.
    pub fn close(&mut self, reason: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ShardState::Closed;
        self.reason = reason.into();
        true
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
