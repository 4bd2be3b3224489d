/// Sync service coordinating all synchronization operations.
///
/// Every peak announced by a peer goes through [`SyncService::new_peak`],
/// which picks the cheapest way to reach it:
/// - backtrack: a few blocks fetched newest-first from the announcing peer
/// - batch: consecutive windows from the announcing peer
/// - long sync: weight proof driven catch-up across all peers
use std::collections::HashSet;
use std::sync::Arc;

use chain::ConsensusConstants;
use containers::{Bytes32, FullBlock, Height, NewPeak, NodeType, Weight};
use fork_choice::{
    Admitted, AdmissionError, BlockAdmission, ChainStore, ProofValidator, StateChangeSummary,
    UnfinishedBlockCache,
};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    config::SyncConfig,
    peer_manager::{PeakClaim, PeerManager},
    states::{SyncSession, SyncState},
};
use crate::propagation::{NodeEvent, PeakPropagator};
use crate::types::{NetworkRequester, PeerBlockSource};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no peaks collected from peers")]
    NoPeaks,
    #[error("no connected peer has peak {0}")]
    NoPeersWithPeak(Bytes32),
    #[error("local chain already has weight {weight}")]
    AlreadyCaughtUp { weight: Weight },
    #[error("weight proof from {peer} did not arrive")]
    WeightProofUnavailable { peer: PeerId },
    #[error("weight proof from {peer} does not match the peak: {reason}")]
    WeightProofMismatch { peer: PeerId, reason: &'static str },
    #[error("weight proof from {peer} contains a known bad peak")]
    BadPeak { peer: PeerId },
    #[error("weight proof from {peer} is invalid: {reason}")]
    InvalidWeightProof { peer: PeerId, reason: String },
    #[error("no peer served blocks {start}..={end}")]
    WindowFailed { start: Height, end: Height },
    #[error("blocks {start}..={end} were rejected")]
    BatchRejected {
        start: Height,
        end: Height,
        #[source]
        source: AdmissionError,
    },
    #[error("sync cancelled")]
    Cancelled,
    #[error("chain store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// What `new_peak` did with an announcement.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Already known, or not heavier than the local peak.
    Ignored,
    /// Stored for a long sync that is already running.
    Recorded,
    Backtracked,
    Batched,
    LongSync(JoinHandle<Result<(), SyncError>>),
}

/// Statistics about the sync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub state: SyncState,
    pub sync_mode: bool,
    pub tracked_peers: usize,
    pub peak_height: Option<Height>,
}

/// Sync service coordinating all sync operations.
///
/// Cheap to clone; clones share all state.
pub struct SyncService<N: NetworkRequester> {
    pub(super) config: Arc<SyncConfig>,
    pub(super) constants: Arc<ConsensusConstants>,
    pub(super) network: Arc<N>,
    pub(super) admission: Arc<BlockAdmission>,
    pub(super) validator: Arc<dyn ProofValidator>,
    pub(super) propagator: Arc<PeakPropagator>,
    pub(super) peer_manager: Arc<Mutex<PeerManager>>,
    pub(super) session: Arc<SyncSession>,
    pub(super) unfinished: Arc<Mutex<UnfinishedBlockCache>>,
    pub(super) shutdown: CancellationToken,
}

impl<N: NetworkRequester> Clone for SyncService<N> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            constants: self.constants.clone(),
            network: self.network.clone(),
            admission: self.admission.clone(),
            validator: self.validator.clone(),
            propagator: self.propagator.clone(),
            peer_manager: self.peer_manager.clone(),
            session: self.session.clone(),
            unfinished: self.unfinished.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<N: NetworkRequester> SyncService<N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        constants: ConsensusConstants,
        network: Arc<N>,
        admission: Arc<BlockAdmission>,
        validator: Arc<dyn ProofValidator>,
        propagator: Arc<PeakPropagator>,
        unfinished: Arc<Mutex<UnfinishedBlockCache>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            constants: Arc::new(constants),
            network,
            admission,
            validator,
            propagator,
            peer_manager: Arc::new(Mutex::new(PeerManager::new())),
            session: Arc::new(SyncSession::new()),
            unfinished,
            shutdown,
        }
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn peer_manager(&self) -> &Mutex<PeerManager> {
        &self.peer_manager
    }

    pub fn propagator(&self) -> &Arc<PeakPropagator> {
        &self.propagator
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        self.admission.store()
    }

    pub fn is_sync_mode(&self) -> bool {
        self.session.is_sync_mode()
    }

    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            state: self.session.state(),
            sync_mode: self.session.is_sync_mode(),
            tracked_peers: self.peer_manager.lock().len(),
            peak_height: self.store().get_peak_height(),
        }
    }

    /// Handles a peak announced by `peer_id`.
    pub async fn new_peak(&self, peer_id: PeerId, peak: NewPeak) -> SyncOutcome {
        self.peer_manager.lock().register_peak(
            peer_id,
            PeakClaim {
                header_hash: peak.header_hash,
                height: peak.height,
                weight: peak.weight,
            },
        );

        let store = self.store();
        if store.has_block(&peak.header_hash) {
            return SyncOutcome::Ignored;
        }
        let local = store.get_peak();
        if local.as_ref().is_some_and(|local| peak.weight <= local.weight) {
            debug!(peer = %peer_id, height = peak.height, "Peak is not heavier than ours");
            return SyncOutcome::Ignored;
        }

        if self.session.is_long_sync() {
            if self.session.is_sync_mode() {
                self.request_sync_target(peer_id).await;
            }
            return SyncOutcome::Recorded;
        }

        let local_height = local.as_ref().map(|local| local.height);
        let base = local_height.unwrap_or_default();
        let close = peak.height < base.saturating_add(self.config.sync_blocks_behind_threshold);
        if close
            && peak.height <= base.saturating_add(self.config.short_sync_blocks_behind_threshold)
            && self.short_sync_backtrack(peer_id, local_height, &peak).await
        {
            return SyncOutcome::Backtracked;
        }

        // A young chain is batched from genesis however far ahead the peak is.
        let start = if peak.height < self.constants.weight_proof_recent_blocks {
            Some(0)
        } else if close {
            Some(base.saturating_sub(self.config.batch_start_offset))
        } else {
            None
        };
        if let Some(start) = start {
            match self.short_sync_batch(peer_id, start, peak.height).await {
                Ok(true) => return SyncOutcome::Batched,
                Ok(false) => debug!(peer = %peer_id, start, "Batch sync does not connect"),
                Err(err) => warn!(peer = %peer_id, %err, "Batch sync failed"),
            }
        }

        self.start_long_sync()
    }

    /// Spawns a long sync unless one is already running.
    pub fn start_long_sync(&self) -> SyncOutcome {
        if !self.session.try_begin_long_sync() {
            return SyncOutcome::Recorded;
        }
        SyncOutcome::LongSync(tokio::spawn(self.clone().run_long_sync()))
    }

    /// While syncing, checks whether a newly announcing peer also holds the
    /// sync target so it can serve windows.
    async fn request_sync_target(&self, peer_id: PeerId) {
        let Some(target) = self.session.target() else {
            return;
        };
        if self
            .peer_manager
            .lock()
            .peers_with_peak(&target.header_hash)
            .contains(&peer_id)
        {
            return;
        }
        let request = self.network.request_block(peer_id, target.height, false);
        if let Ok(Ok(Some(block))) = tokio::time::timeout(self.config.request_timeout(), request).await
        {
            if block.header_hash() == target.header_hash {
                debug!(peer = %peer_id, height = target.height, "Peer holds the sync target");
                self.peer_manager.lock().mark_peer_has_block(peer_id, target);
            }
        }
    }

    /// Admits a single block and propagates it when it becomes the peak.
    pub async fn admit_block(
        &self,
        block: FullBlock,
        origin: Option<PeerId>,
    ) -> Result<Admitted, AdmissionError> {
        let result = match origin {
            Some(peer_id) => {
                let source = PeerBlockSource {
                    network: self.network.as_ref(),
                    peer_id,
                    timeout: self.config.request_timeout(),
                };
                self.admission.add_block(block, Some(&source), None).await
            }
            None => self.admission.add_block(block, None, None).await,
        };
        let admitted = result.inspect_err(|err| self.report_rejection(err))?;
        if let Some(state_change) = &admitted.state_change {
            self.propagate_peak(state_change, origin).await;
        }
        Ok(admitted)
    }

    pub(super) fn report_rejection(&self, err: &AdmissionError) {
        if let AdmissionError::Consensus(err) = err {
            self.propagator.emit(NodeEvent::BlockRejected {
                header_hash: err.header_hash,
                code: err.code,
            });
        }
    }

    pub(super) async fn propagate_peak(
        &self,
        state_change: &StateChangeSummary,
        origin: Option<PeerId>,
    ) {
        let header_hash = state_change.peak.header_hash;
        let Some(block) = self.store().get_full_block(&header_hash).await else {
            warn!(%header_hash, "Peak block missing from store");
            return;
        };
        self.propagator
            .on_new_peak(&block, state_change, origin, self.session.is_sync_mode())
            .await;
    }

    /// Connected full nodes that are known to hold `header_hash`, in a
    /// stable order.
    pub(super) fn peers_with_peak(&self, header_hash: &Bytes32) -> Vec<PeerId> {
        let connected: HashSet<PeerId> = self
            .network
            .connected_peers(NodeType::FullNode)
            .into_iter()
            .collect();
        let mut peers: Vec<PeerId> = self
            .peer_manager
            .lock()
            .peers_with_peak(header_hash)
            .into_iter()
            .filter(|peer_id| connected.contains(peer_id))
            .collect();
        peers.sort();
        peers
    }

    pub fn peer_disconnected(&self, peer_id: &PeerId) {
        self.peer_manager.lock().peer_disconnected(peer_id);
        info!(peer = %peer_id, "Peer removed from sync service");
    }

    /// Cancels a running long sync; it still finalizes.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
