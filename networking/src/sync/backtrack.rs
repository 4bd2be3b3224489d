/// Backtrack synchronization for peaks a few blocks ahead.
///
/// Blocks are requested newest-first from the announcing peer until one
/// connects to the local chain, then admitted oldest-first.
use anyhow::{anyhow, Context, Result};
use containers::{FullBlock, Height, NewPeak};
use libp2p_identity::PeerId;
use tracing::debug;

use super::{service::SyncService, states::SyncState};
use crate::types::NetworkRequester;

impl<N: NetworkRequester> SyncService<N> {
    /// Returns `true` when the peak was reached. Any failure returns `false`
    /// so the caller can escalate.
    pub(super) async fn short_sync_backtrack(
        &self,
        peer_id: PeerId,
        local_height: Option<Height>,
        target: &NewPeak,
    ) -> bool {
        if !self
            .peer_manager
            .lock()
            .try_begin_backtrack(peer_id, self.config.max_backtrack_per_peer)
        {
            debug!(peer = %peer_id, "Too many backtrack syncs with peer");
            return false;
        }
        self.session.enter(SyncState::Backtrack);

        let result = self.backtrack(peer_id, local_height, target).await;

        self.peer_manager.lock().end_backtrack(&peer_id);
        self.session.leave(SyncState::Backtrack);

        match result {
            Ok(found) => found,
            Err(err) => {
                debug!(peer = %peer_id, height = target.height, %err, "Backtrack sync failed");
                false
            }
        }
    }

    async fn backtrack(
        &self,
        peer_id: PeerId,
        local_height: Option<Height>,
        target: &NewPeak,
    ) -> Result<bool> {
        let floor = local_height.map_or(-1, i64::from) - i64::from(self.config.backtrack_lookback);
        // The generator of a block we hold unfinished is spliced in locally.
        let have_unfinished = self
            .unfinished
            .lock()
            .contains(&target.unfinished_reward_block_hash);

        let mut height = target.height;
        let mut blocks: Vec<FullBlock> = Vec::new();
        let mut connected = false;
        while i64::from(height) > floor {
            let include_transactions = !have_unfinished || height != target.height;
            let request = self
                .network
                .request_block(peer_id, height, include_transactions);
            let block = tokio::time::timeout(self.config.request_timeout(), request)
                .await
                .context("block request timed out")??
                .ok_or_else(|| anyhow!("peer has no block at height {height}"))?;

            let connects = height == 0 || self.store().has_block(&block.prev_header_hash());
            blocks.push(block);
            if connects {
                connected = true;
                break;
            }
            height -= 1;
        }

        if !connected {
            debug!(peer = %peer_id, height = target.height, "Backtrack found no fork point");
            return Ok(false);
        }

        debug!(
            peer = %peer_id,
            start = height,
            end = target.height,
            "Backtrack found fork point"
        );
        for block in blocks.into_iter().rev() {
            self.admit_block(block, Some(peer_id)).await?;
        }
        Ok(true)
    }
}
