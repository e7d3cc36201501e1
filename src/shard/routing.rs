//! Shard identity and routing entries
//!
//! A `ShardRouting` is the allocator's view of one copy. Its identity part
//! (shard id, allocation id) never changes for the lifetime of the copy;
//! role and state are replaced wholesale on every cluster state update.

use serde::{Deserialize, Serialize};

/// Index name plus partition number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        ShardId {
            index: index.into(),
            shard,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Unique id of one copy of a shard, assigned by the allocator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(String);

impl AllocationId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        debug_assert!(!id.is_empty(), "Precondition: allocation id must not be empty");
        AllocationId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Allocation state of a copy as seen by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingState {
    Initializing,
    Started,
    Relocating,
}

/// Where the copy is expected to get its data from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverySource {
    /// Brand new primary, nothing on disk
    EmptyStore,
    /// Primary reopening its own on-disk data
    ExistingStore,
    /// Replica copying from the active primary
    Peer,
    /// Restore from a repository snapshot
    Snapshot { repository: String, snapshot: String },
}

/// One copy of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub allocation_id: AllocationId,
    pub node_id: String,
    pub primary: bool,
    pub state: RoutingState,
    pub recovery_source: Option<RecoverySource>,
}

impl ShardRouting {
    /// A copy the allocator just placed on `node_id`
    pub fn initializing(
        shard_id: ShardId,
        allocation_id: AllocationId,
        node_id: impl Into<String>,
        primary: bool,
        recovery_source: RecoverySource,
    ) -> Self {
        ShardRouting {
            shard_id,
            allocation_id,
            node_id: node_id.into(),
            primary,
            state: RoutingState::Initializing,
            recovery_source: Some(recovery_source),
        }
    }

    pub fn moved_to_started(&self) -> Self {
        ShardRouting {
            state: RoutingState::Started,
            recovery_source: None,
            ..self.clone()
        }
    }

    pub fn moved_to_relocating(&self) -> Self {
        ShardRouting {
            state: RoutingState::Relocating,
            ..self.clone()
        }
    }

    /// Same copy, promoted to primary
    pub fn promoted_to_primary(&self) -> Self {
        ShardRouting {
            primary: true,
            ..self.clone()
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, RoutingState::Started | RoutingState::Relocating)
    }

    /// True when `other` describes the same physical copy
    pub fn is_same_allocation(&self, other: &ShardRouting) -> bool {
        self.shard_id == other.shard_id && self.allocation_id == other.allocation_id
    }
}

impl std::fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} node={} {} {:?}",
            self.shard_id,
            self.allocation_id,
            self.node_id,
            if self.primary { "primary" } else { "replica" },
            self.state
        )
    }
}

/// All copies of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub shard_id: ShardId,
    copies: Vec<ShardRouting>,
}

impl RoutingTable {
    pub fn new(shard_id: ShardId) -> Self {
        RoutingTable {
            shard_id,
            copies: Vec::new(),
        }
    }

    /// Add or replace the entry for `routing.allocation_id`
    pub fn with(mut self, routing: ShardRouting) -> Self {
        debug_assert_eq!(
            routing.shard_id, self.shard_id,
            "Precondition: routing must belong to this shard"
        );
        self.copies
            .retain(|r| r.allocation_id != routing.allocation_id);
        self.copies.push(routing);
        self
    }

    pub fn without(mut self, allocation_id: &AllocationId) -> Self {
        self.copies.retain(|r| &r.allocation_id != allocation_id);
        self
    }

    pub fn get(&self, allocation_id: &AllocationId) -> Option<&ShardRouting> {
        self.copies.iter().find(|r| &r.allocation_id == allocation_id)
    }

    pub fn contains(&self, allocation_id: &AllocationId) -> bool {
        self.get(allocation_id).is_some()
    }

    pub fn primary(&self) -> Option<&ShardRouting> {
        self.copies.iter().find(|r| r.primary)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &ShardRouting> {
        self.copies.iter().filter(|r| !r.primary)
    }

    pub fn copies(&self) -> &[ShardRouting] {
        &self.copies
    }

    pub fn allocation_ids(&self) -> impl Iterator<Item = &AllocationId> {
        self.copies.iter().map(|r| &r.allocation_id)
    }
}
