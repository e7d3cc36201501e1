//! Named fault injection points

/// Faults on the paths between copies
pub mod transport {
    /// Replica request never reaches the replica
    pub const REPLICA_DISCONNECT: &str = "transport.replica_disconnect";
    /// Replica applied the request but the response was lost
    pub const REPLICA_RESPONSE_LOST: &str = "transport.replica_response_lost";
    /// Any recovery call to the target fails with a disconnect
    pub const RECOVERY_DISCONNECT: &str = "transport.recovery_disconnect";
    /// One byte of a file chunk is flipped in flight
    pub const CHUNK_CORRUPT: &str = "transport.chunk_corrupt";
    /// A recovery call stalls before it reaches the target
    pub const RECOVERY_STALL: &str = "transport.recovery_stall";
}

/// Faults at the storage layer
pub mod store {
    /// A replica node restarts and loses unsynced bytes
    pub const CRASH: &str = "store.crash";
}

pub const ALL_FAULTS: &[&str] = &[
    transport::REPLICA_DISCONNECT,
    transport::REPLICA_RESPONSE_LOST,
    transport::RECOVERY_DISCONNECT,
    transport::CHUNK_CORRUPT,
    transport::RECOVERY_STALL,
    store::CRASH,
];
