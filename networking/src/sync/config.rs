/// Sync service configuration.
///
/// Thresholds deciding between backtrack, batch and long sync, plus the
/// timeouts and limits applied to peer requests.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of peak hashes indexed in the peer manager.
pub const MAX_PEAK_INDEX_ENTRIES: usize = 256;

/// Interval at which long sync re-checks collected peaks while waiting.
pub const PEAK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A peak at most this far ahead is fetched block by block from the
    /// announcing peer.
    pub short_sync_blocks_behind_threshold: u32,
    /// A peak this far ahead or more triggers long sync.
    pub sync_blocks_behind_threshold: u32,
    /// Backtrack stops once it reaches this far below the local peak.
    pub backtrack_lookback: u32,
    /// Batch sync restarts this many blocks below the local peak.
    pub batch_start_offset: u32,
    pub max_backtrack_per_peer: u32,
    pub min_peers_for_sync: usize,
    pub max_sync_wait_secs: u64,
    pub request_timeout_secs: u64,
    pub window_timeout_secs: u64,
    pub weight_proof_timeout_secs: u64,
    pub peer_ban_duration_secs: u64,
    /// Fetched windows buffered ahead of validation.
    pub sync_buffer_windows: usize,
    pub max_blocks_per_request: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            short_sync_blocks_behind_threshold: 20,
            sync_blocks_behind_threshold: 300,
            backtrack_lookback: 5,
            batch_start_offset: 6,
            max_backtrack_per_peer: 3,
            min_peers_for_sync: 3,
            max_sync_wait_secs: 30,
            request_timeout_secs: 10,
            window_timeout_secs: 30,
            weight_proof_timeout_secs: 360,
            peer_ban_duration_secs: 600,
            sync_buffer_windows: 4,
            max_blocks_per_request: 32,
        }
    }
}

impl SyncConfig {
    pub fn max_sync_wait(&self) -> Duration {
        Duration::from_secs(self.max_sync_wait_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn window_timeout(&self) -> Duration {
        Duration::from_secs(self.window_timeout_secs)
    }

    pub fn weight_proof_timeout(&self) -> Duration {
        Duration::from_secs(self.weight_proof_timeout_secs)
    }

    pub fn peer_ban_duration(&self) -> Duration {
        Duration::from_secs(self.peer_ban_duration_secs)
    }
}
