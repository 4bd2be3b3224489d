/// Batch synchronization: consecutive windows from one peer, each committed
/// under a single hold of the chain mutation lock.
use containers::Height;
use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{
    service::{SyncError, SyncService},
    states::SyncState,
};
use crate::types::NetworkRequester;

impl<N: NetworkRequester> SyncService<N> {
    /// Returns `Ok(false)` when the first block does not connect to the
    /// local chain. A batch or backtrack already running with the peer
    /// counts as success.
    pub(super) async fn short_sync_batch(
        &self,
        peer_id: PeerId,
        start: Height,
        target: Height,
    ) -> Result<bool, SyncError> {
        {
            let mut peer_manager = self.peer_manager.lock();
            if peer_manager.is_backtrack_syncing(&peer_id) || !peer_manager.try_begin_batch(peer_id)
            {
                return Ok(true);
            }
        }
        self.session.enter(SyncState::Batch);

        let result = self.batch(peer_id, start, target).await;

        self.peer_manager.lock().end_batch(&peer_id);
        self.session.leave(SyncState::Batch);
        result
    }

    async fn batch(&self, peer_id: PeerId, start: Height, target: Height) -> Result<bool, SyncError> {
        if start > 0 {
            let request = self.network.request_block(peer_id, start, false);
            let Ok(Ok(Some(first))) =
                tokio::time::timeout(self.config.request_timeout(), request).await
            else {
                return Err(SyncError::WindowFailed { start, end: start });
            };
            if !self.store().has_block(&first.prev_header_hash()) {
                info!(peer = %peer_id, start, "Batch sync stopped, this is a deep chain");
                return Ok(false);
            }
        }

        let step = self.config.max_blocks_per_request.max(1);
        let mut height = start;
        while height <= target {
            let end = target.min(height.saturating_add(step - 1));
            let request = self.network.request_blocks(peer_id, height, end, true);
            let blocks = match tokio::time::timeout(self.config.window_timeout(), request).await {
                Ok(Ok(Some(blocks))) if !blocks.is_empty() => blocks,
                _ => return Err(SyncError::WindowFailed { start: height, end }),
            };

            let admitted = self
                .admission
                .add_block_batch(blocks, None)
                .await
                .map_err(|source| {
                    self.report_rejection(&source);
                    SyncError::BatchRejected {
                        start: height,
                        end,
                        source,
                    }
                })?;
            if let Some(state_change) = &admitted.state_change {
                self.propagate_peak(state_change, Some(peer_id)).await;
            }
            debug!(peer = %peer_id, start = height, end, added = admitted.added, "Added blocks");

            if end == Height::MAX {
                break;
            }
            height = end + 1;
        }
        Ok(true)
    }
}
