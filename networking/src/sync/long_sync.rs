/// Long synchronization from a validated weight proof.
///
/// ## Flow
///
/// 1. Wait for peaks from enough peers and pick the heaviest.
/// 2. Ask every connected full node for the header at the target height and
///    remember who holds it.
/// 3. Fetch and validate a weight proof from one of those peers; the
///    verdict gives the fork point.
/// 4. Fetch windows of blocks from the fork point in one task and admit
///    them in another, connected by a bounded channel.
/// 5. Finalize exactly once, whatever the outcome.
use std::time::Duration;

use containers::{FullBlock, Height, NodeType};
use fork_choice::{StateChangeSummary, WeightProofVerdict};
use libp2p_identity::PeerId;
use rand::seq::SliceRandom;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};

use super::{
    config::PEAK_POLL_INTERVAL,
    peer_manager::PeakClaim,
    service::{SyncError, SyncService},
    states::LongSyncGuard,
};
use crate::propagation::NodeEvent;
use crate::types::NetworkRequester;

type Window = (PeerId, Vec<FullBlock>);

fn is_complete_window(blocks: &[FullBlock], start: Height, end: Height) -> bool {
    blocks.len() as u64 == u64::from(end - start) + 1
        && blocks.first().is_some_and(|first| first.height() == start)
        && blocks.last().is_some_and(|last| last.height() == end)
}

impl<N: NetworkRequester> SyncService<N> {
    /// Runs a long sync claimed with `SyncSession::try_begin_long_sync`.
    pub async fn run_long_sync(self) -> Result<(), SyncError> {
        let mut guard = LongSyncGuard::new(&self.session, || {
            self.peer_manager.lock().clear_sync_info();
            self.propagator.emit(NodeEvent::SyncModeChanged(false));
        });

        let result = tokio::select! {
            result = self.long_sync() => result,
            _ = self.shutdown.cancelled() => Err(SyncError::Cancelled),
        };
        match &result {
            Ok(()) => info!("Long sync complete"),
            Err(SyncError::Cancelled) => warn!("Long sync cancelled"),
            Err(err) => error!(%err, "Long sync failed"),
        }

        self.finish_sync().await;
        guard.disarm();
        result
    }

    async fn long_sync(&self) -> Result<(), SyncError> {
        info!(timeout = ?self.config.max_sync_wait(), "Waiting to receive peaks from peers");
        let target = self.wait_for_peaks().await?;
        self.session.set_target(target.clone());
        info!(
            height = target.height,
            weight = %target.weight,
            header_hash = %target.header_hash,
            "Selected sync target"
        );

        self.corroborate_target(&target).await;
        let verdict = self.request_validate_wp(&target).await?;

        self.session.set_sync_mode(true);
        self.propagator.emit(NodeEvent::SyncModeChanged(true));
        self.session.set_fork_point(verdict.fork_point);

        self.store().warmup(verdict.fork_point).await?;
        self.sync_from_fork_point(verdict.fork_point, &target).await
    }

    async fn wait_for_peaks(&self) -> Result<PeakClaim, SyncError> {
        let deadline = Instant::now() + self.config.max_sync_wait();
        loop {
            let peers = {
                let peer_manager = self.peer_manager.lock();
                let peaks = peer_manager.declared_peaks();
                peer_manager.peers_that_have_peaks(&peaks).len()
            };
            if peers >= self.config.min_peers_for_sync || Instant::now() >= deadline {
                debug!(peers, "Finished waiting for peaks");
                break;
            }
            tokio::time::sleep(PEAK_POLL_INTERVAL).await;
        }
        self.peer_manager
            .lock()
            .heaviest_known_peak()
            .ok_or(SyncError::NoPeaks)
    }

    /// Marks every connected full node that serves the target header.
    async fn corroborate_target(&self, target: &PeakClaim) {
        let timeout = self.config.request_timeout();
        let peers = self.network.connected_peers(NodeType::FullNode);
        let requests = peers.into_iter().map(|peer_id| async move {
            let request = self.network.request_block_header(peer_id, target.height);
            (peer_id, tokio::time::timeout(timeout, request).await)
        });
        let responses = futures::future::join_all(requests).await;

        let mut peer_manager = self.peer_manager.lock();
        for (peer_id, response) in responses {
            if let Ok(Ok(Some(header))) = response {
                if header.header_hash() == target.header_hash {
                    peer_manager.mark_peer_has_block(peer_id, target.clone());
                }
            }
        }
    }

    async fn penalize(&self, peer_id: PeerId) {
        self.network
            .close_peer(peer_id, self.config.peer_ban_duration())
            .await;
    }

    async fn request_validate_wp(&self, target: &PeakClaim) -> Result<WeightProofVerdict, SyncError> {
        let peers = self.peers_with_peak(&target.header_hash);
        let chosen = peers.choose(&mut rand::thread_rng()).copied();
        let Some(peer_id) = chosen else {
            return Err(SyncError::NoPeersWithPeak(target.header_hash));
        };
        if let Some(local) = self.store().get_peak() {
            if target.weight <= local.weight {
                return Err(SyncError::AlreadyCaughtUp {
                    weight: local.weight,
                });
            }
        }

        info!(peer = %peer_id, height = target.height, "Requesting weight proof");
        let request = self
            .network
            .request_proof_of_weight(peer_id, target.height, target.header_hash);
        let proof = match tokio::time::timeout(self.config.weight_proof_timeout(), request).await {
            Ok(Ok(Some(proof))) => proof,
            _ => {
                self.penalize(peer_id).await;
                return Err(SyncError::WeightProofUnavailable { peer: peer_id });
            }
        };

        let mismatch = if proof.tip_height() != Some(target.height) {
            Some("height")
        } else if proof.tip_weight() != Some(target.weight) {
            Some("weight")
        } else {
            None
        };
        if let Some(reason) = mismatch {
            self.penalize(peer_id).await;
            return Err(SyncError::WeightProofMismatch {
                peer: peer_id,
                reason,
            });
        }
        if self.admission.in_bad_peak_cache(&proof) {
            self.penalize(peer_id).await;
            return Err(SyncError::BadPeak { peer: peer_id });
        }

        let validator = self.validator.clone();
        let local = self.store().clone();
        let verdict = tokio::task::spawn_blocking(move || {
            validator.validate_weight_proof(&proof, local.as_ref())
        })
        .await
        .map_err(anyhow::Error::new)?;
        match verdict {
            Ok(verdict) if verdict.valid => {
                info!(
                    peers = peers.len(),
                    fork_point = verdict.fork_point,
                    "Weight proof validated"
                );
                Ok(verdict)
            }
            Ok(_) => {
                self.penalize(peer_id).await;
                Err(SyncError::InvalidWeightProof {
                    peer: peer_id,
                    reason: "validation failed".to_owned(),
                })
            }
            Err(err) => {
                self.penalize(peer_id).await;
                Err(SyncError::InvalidWeightProof {
                    peer: peer_id,
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    /// When the fork point is the conservative sub-epoch guess, checks
    /// whether a peer's next block extends our peak directly.
    async fn check_fork_next_block(&self, fork_point: Height, peers: &[PeerId]) -> Height {
        let store = self.store();
        let Some(peak) = store.get_peak() else {
            return fork_point;
        };
        let mut ses_heights = store.sub_epoch_summary_heights();
        if ses_heights.len() <= 2 {
            return fork_point;
        }
        ses_heights.sort_unstable();
        if fork_point != ses_heights[ses_heights.len() - 3] {
            return fork_point;
        }

        for &peer_id in peers {
            let request = self.network.request_block(peer_id, peak.height + 1, true);
            if let Ok(Ok(Some(block))) =
                tokio::time::timeout(self.config.request_timeout(), request).await
            {
                if block.prev_header_hash() == peak.header_hash {
                    debug!(peer = %peer_id, fork_point = peak.height, "Next block extends our peak");
                    return peak.height;
                }
            }
        }
        fork_point
    }

    async fn sync_from_fork_point(&self, fork_point: Height, target: &PeakClaim) -> Result<(), SyncError> {
        let peers = self.peers_with_peak(&target.header_hash);
        let fork_point = self.check_fork_next_block(fork_point, &peers).await;
        self.session.set_fork_point(fork_point);
        info!(fork_point, target = target.height, "Start syncing from fork point");

        let (sender, receiver) = mpsc::channel(self.config.sync_buffer_windows.max(1));
        let (fetched, validated) = tokio::join!(
            self.fetch_windows(fork_point, target, peers, sender),
            self.validate_windows(fork_point, receiver),
        );
        validated?;
        fetched
    }

    async fn fetch_windows(
        &self,
        fork_point: Height,
        target: &PeakClaim,
        mut peers: Vec<PeerId>,
        sender: mpsc::Sender<Window>,
    ) -> Result<(), SyncError> {
        let step = self.config.max_blocks_per_request.max(1);
        let mut start = fork_point;
        while start <= target.height {
            let end = target.height.min(start.saturating_add(step - 1));
            if self.peer_manager.lock().take_peers_changed() {
                peers = self.peers_with_peak(&target.header_hash);
                debug!(peers = peers.len(), "Refreshed sync peers");
            }

            let mut order = peers.clone();
            order.shuffle(&mut rand::thread_rng());
            let mut window = None;
            for peer_id in order {
                let request = self.network.request_blocks(peer_id, start, end, true);
                match tokio::time::timeout(self.config.window_timeout(), request).await {
                    Ok(Ok(Some(blocks))) if is_complete_window(&blocks, start, end) => {
                        window = Some((peer_id, blocks));
                        break;
                    }
                    Ok(Ok(_)) => debug!(peer = %peer_id, start, end, "Peer did not serve window"),
                    _ => {
                        warn!(peer = %peer_id, start, end, "Window request failed");
                        self.network.close_peer(peer_id, Duration::ZERO).await;
                        peers.retain(|peer| *peer != peer_id);
                    }
                }
            }

            let Some(window) = window else {
                error!(start, end, "Failed fetching blocks from peers");
                return Err(SyncError::WindowFailed { start, end });
            };
            if sender.send(window).await.is_err() {
                debug!("Window validation stopped");
                return Ok(());
            }
            if end == target.height {
                break;
            }
            start = end + 1;
        }
        Ok(())
    }

    async fn validate_windows(
        &self,
        fork_point: Height,
        mut receiver: mpsc::Receiver<Window>,
    ) -> Result<(), SyncError> {
        let mut advanced_peak = false;
        while let Some((peer_id, blocks)) = receiver.recv().await {
            let start = blocks.first().map(FullBlock::height).unwrap_or_default();
            let end = blocks.last().map(FullBlock::height).unwrap_or_default();
            let fork_hint = (!advanced_peak).then_some(fork_point);

            match self.admission.add_block_batch(blocks, fork_hint).await {
                Ok(admitted) => advanced_peak |= admitted.state_change.is_some(),
                Err(source) => {
                    self.report_rejection(&source);
                    if source.consensus_code().is_some() {
                        self.penalize(peer_id).await;
                    }
                    return Err(SyncError::BatchRejected { start, end, source });
                }
            }
            info!(start, end, "Added blocks");

            self.propagator.send_peak_to_wallets().await;
            self.store().clean_block_records();
        }
        Ok(())
    }

    /// Clears the session and announces the final peak. Runs once per long
    /// sync.
    async fn finish_sync(&self) {
        let fork_point = self.session.fork_point();
        if !self.session.finish() {
            return;
        }
        self.peer_manager.lock().clear_sync_info();
        self.propagator.emit(NodeEvent::SyncModeChanged(false));
        info!("Long sync done");

        let store = self.store();
        let Some(peak) = store.get_peak() else {
            return;
        };
        let Some(block) = store.get_full_block(&peak.header_hash).await else {
            return;
        };
        let fork_height = fork_point.unwrap_or(peak.height.saturating_sub(1));
        let state_change = StateChangeSummary::for_peak(peak, Some(fork_height));
        self.propagator
            .on_new_peak(&block, &state_change, None, false)
            .await;
    }
}
