/// Chain synchronization for the full node.
///
/// Peaks announced by peers are reached in one of three ways, cheapest
/// first:
///
/// - **Backtrack**: fetch blocks newest-first from the announcing peer until
///   one connects to the local chain
/// - **Batch**: fetch consecutive windows from the announcing peer
/// - **Long sync**: collect peaks, validate a weight proof, then download
///   windows from every peer that holds the target
///
/// ## State Machine
///
/// - **IDLE**: following gossip
/// - **BACKTRACK** / **BATCH**: a short sync is running
/// - **LONG_SYNC**: gossip blocks are ignored until finalization
pub mod backtrack;
pub mod batch;
pub mod config;
pub mod long_sync;
pub mod peer_manager;
pub mod service;
pub mod states;

pub use config::*;
pub use peer_manager::{PeakClaim, PeerManager, SyncPeer};
pub use service::{SyncError, SyncOutcome, SyncService, SyncStats};
pub use states::{LongSyncGuard, SyncSession, SyncState};

#[cfg(test)]
mod tests;
