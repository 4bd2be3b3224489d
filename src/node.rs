//! Full node facade: routes peer and timelord messages into the sync
//! service, the admission pipeline and the unfinished block cache.

use std::sync::Arc;

use chain::ConsensusConstants;
use containers::{
    ConsensusError, FullBlock, NewInfusionPointVdf, NewPeak, NewUnfinishedBlock,
    NewUnfinishedBlockTimelord, NodeType, ProtocolMessage, UnfinishedBlock,
};
use fork_choice::{
    get_next_difficulty, get_next_sub_slot_iters, Admitted, AdmissionError, BlockAdmission,
    BlockRecords, ChainStore, ProofValidator, UnfinishedBlockCache,
};
use libp2p_identity::PeerId;
use networking::propagation::{MempoolManager, NodeEvent, PeakPropagator, SlotStore};
use networking::sync::{SyncOutcome, SyncService};
use networking::types::{Broadcaster, MessageSource, NetworkRequester, NodeMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;

/// External collaborators a node is built from.
pub struct NodeContext<N: NetworkRequester> {
    pub store: Arc<dyn ChainStore>,
    pub validator: Arc<dyn ProofValidator>,
    pub network: Arc<N>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub mempool: Arc<dyn MempoolManager>,
    pub slots: Arc<dyn SlotStore>,
}

pub struct FullNode<N: NetworkRequester> {
    constants: Arc<ConsensusConstants>,
    sync: SyncService<N>,
    admission: Arc<BlockAdmission>,
    validator: Arc<dyn ProofValidator>,
    unfinished: Arc<Mutex<UnfinishedBlockCache>>,
    propagator: Arc<PeakPropagator>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl<N: NetworkRequester> Clone for FullNode<N> {
    fn clone(&self) -> Self {
        Self {
            constants: self.constants.clone(),
            sync: self.sync.clone(),
            admission: self.admission.clone(),
            validator: self.validator.clone(),
            unfinished: self.unfinished.clone(),
            propagator: self.propagator.clone(),
            broadcaster: self.broadcaster.clone(),
        }
    }
}

impl<N: NetworkRequester> FullNode<N> {
    /// Wires the node together. The receiver yields every [`NodeEvent`].
    pub fn new(
        config: &NodeConfig,
        context: NodeContext<N>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let NodeContext {
            store,
            validator,
            network,
            broadcaster,
            mempool,
            slots,
        } = context;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let unfinished = Arc::new(Mutex::new(UnfinishedBlockCache::new()));
        let admission = Arc::new(BlockAdmission::new(store.clone(), unfinished.clone()));
        let propagator = Arc::new(PeakPropagator::new(
            config.consensus.clone(),
            config.propagation.clone(),
            store,
            mempool,
            slots,
            broadcaster.clone(),
            unfinished.clone(),
            events_tx,
        ));
        let sync = SyncService::new(
            config.sync.clone(),
            config.consensus.clone(),
            network,
            admission.clone(),
            validator.clone(),
            propagator.clone(),
            unfinished.clone(),
            shutdown,
        );

        let node = Self {
            constants: Arc::new(config.consensus.clone()),
            sync,
            admission,
            validator,
            unfinished,
            propagator,
            broadcaster,
        };
        (node, events_rx)
    }

    pub fn sync(&self) -> &SyncService<N> {
        &self.sync
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        self.admission.store()
    }

    pub fn unfinished(&self) -> &Mutex<UnfinishedBlockCache> {
        &self.unfinished
    }

    pub async fn new_peak(&self, peer_id: PeerId, peak: NewPeak) -> SyncOutcome {
        self.sync.new_peak(peer_id, peak).await
    }

    /// Gossiped or requested block. Ignored while syncing; the sync
    /// service fetches what it needs itself.
    pub async fn respond_block(
        &self,
        peer_id: PeerId,
        block: FullBlock,
    ) -> Result<Option<Admitted>, AdmissionError> {
        if self.sync.is_sync_mode() {
            debug!(peer = %peer_id, height = block.height(), "Ignoring block while syncing");
            return Ok(None);
        }
        self.sync.admit_block(block, Some(peer_id)).await.map(Some)
    }

    async fn broadcast(&self, message: ProtocolMessage, node_type: NodeType, except: Option<PeerId>) {
        let description = message.to_string();
        let sent = match except {
            Some(peer_id) => {
                self.broadcaster
                    .send_to_all_except(message, node_type, peer_id)
                    .await
            }
            None => self.broadcaster.send_to_all(message, node_type).await,
        };
        if let Err(err) = sent {
            warn!(message = %description, ?node_type, %err, "Broadcast failed");
        }
    }

    /// Validates and caches an unfinished block, then announces it to full
    /// nodes and timelords. Returns whether it was new.
    pub async fn respond_unfinished_block(
        &self,
        origin: Option<PeerId>,
        block: UnfinishedBlock,
    ) -> Result<bool, AdmissionError> {
        if self.sync.is_sync_mode() {
            return Ok(false);
        }
        let partial_hash = block.partial_hash();
        {
            let mut unfinished = self.unfinished.lock();
            if unfinished.seen(block.raw_hash()) || unfinished.contains(&partial_hash) {
                return Ok(false);
            }
        }

        let store = self.store().clone();
        if store.has_block(&block.header_hash()) {
            debug!(rh = %partial_hash, "Already have the finished block");
            return Ok(false);
        }
        let prev = store.block_record(&block.prev_header_hash());
        if prev.is_none() && store.get_peak().is_some() {
            debug!(rh = %partial_hash, prev = %block.prev_header_hash(), "Parent of unfinished block is unknown");
            return Ok(false);
        }

        let validator = self.validator.clone();
        let (block, prev, result) = tokio::task::spawn_blocking(move || {
            let result = validator.validate_unfinished_block(&block, prev.as_ref());
            (block, prev, result)
        })
        .await
        .map_err(anyhow::Error::new)?;
        if let Some(code) = result.error {
            warn!(rh = %partial_hash, ?code, "Unfinished block is invalid");
            self.propagator.emit(NodeEvent::BlockRejected {
                header_hash: block.header_hash(),
                code,
            });
            return Err(ConsensusError::new(code, block.header_hash()).into());
        }

        let (height, difficulty, sub_slot_iters) = match &prev {
            Some(prev) => (
                prev.height + 1,
                get_next_difficulty(&self.constants, store.as_ref(), prev),
                get_next_sub_slot_iters(&self.constants, prev),
            ),
            None => (
                0,
                self.constants.difficulty_starting,
                self.constants.sub_slot_iters_starting,
            ),
        };
        if !self.unfinished.lock().add(height, block, result) {
            return Ok(false);
        }
        info!(rh = %partial_hash, height, "Added unfinished block");

        let full_node = ProtocolMessage::NewUnfinishedBlock(NewUnfinishedBlock {
            unfinished_reward_hash: partial_hash,
        });
        self.broadcast(full_node, NodeType::FullNode, origin).await;
        let timelord = ProtocolMessage::NewUnfinishedBlockTimelord(NewUnfinishedBlockTimelord {
            unfinished_reward_hash: partial_hash,
            difficulty,
            sub_slot_iters,
        });
        self.broadcast(timelord, NodeType::Timelord, None).await;
        Ok(true)
    }

    /// Completes a cached unfinished block with the timelord's infusion
    /// proofs and admits it. A failed completion re-sends our peak so the
    /// timelord can move on.
    pub async fn new_infusion_point_vdf(
        &self,
        vdf: NewInfusionPointVdf,
    ) -> Result<Option<Admitted>, AdmissionError> {
        let entry = self
            .unfinished
            .lock()
            .get(&vdf.unfinished_reward_hash)
            .cloned();
        let Some(entry) = entry else {
            warn!(rh = %vdf.unfinished_reward_hash, "Infusion point for unknown unfinished block");
            return Ok(None);
        };

        let store = self.store().clone();
        let (height, weight) = if entry.height == 0 {
            (0, u128::from(self.constants.difficulty_starting))
        } else {
            let Some(prev) = store.block_record(&entry.block.prev_header_hash()) else {
                warn!(rh = %vdf.unfinished_reward_hash, "Parent of infused block is gone");
                return Ok(None);
            };
            let difficulty = get_next_difficulty(&self.constants, store.as_ref(), &prev);
            (prev.height + 1, prev.weight + u128::from(difficulty))
        };

        let block = entry.block.into_full_block(
            height,
            weight,
            vdf.challenge_chain_ip_vdf,
            vdf.reward_chain_ip_vdf,
            vdf.infused_challenge_chain_ip_vdf,
        );
        match self.sync.admit_block(block, None).await {
            Ok(admitted) => {
                self.unfinished.lock().remove(&vdf.unfinished_reward_hash);
                debug!(rh = %vdf.unfinished_reward_hash, height, result = ?admitted.result, "Infused block admitted");
                Ok(Some(admitted))
            }
            Err(err) => {
                warn!(rh = %vdf.unfinished_reward_hash, %err, "Infused block rejected");
                self.propagator.send_peak_to_timelords().await;
                Err(err)
            }
        }
    }

    pub fn peer_disconnected(&self, peer_id: &PeerId) {
        self.sync.peer_disconnected(peer_id);
    }

    async fn handle_message(&self, message: NodeMessage) {
        match message {
            NodeMessage::NewPeak { peer_id, peak } => {
                let node = self.clone();
                tokio::spawn(async move {
                    if let SyncOutcome::LongSync(handle) = node.new_peak(peer_id, peak).await {
                        if let Ok(Err(err)) = handle.await {
                            debug!(%err, "Long sync ended");
                        }
                    }
                });
            }
            NodeMessage::RespondBlock { peer_id, block } => {
                if let Err(err) = self.respond_block(peer_id, block).await {
                    warn!(peer = %peer_id, %err, "Block rejected");
                }
            }
            NodeMessage::RespondUnfinishedBlock { peer_id, block } => {
                if let Err(err) = self.respond_unfinished_block(Some(peer_id), block).await {
                    warn!(peer = %peer_id, %err, "Unfinished block rejected");
                }
            }
            NodeMessage::NewInfusionPointVdf { vdf, .. } => {
                if let Err(err) = self.new_infusion_point_vdf(vdf).await {
                    warn!(%err, "Infusion point rejected");
                }
            }
            NodeMessage::PeerDisconnected { peer_id } => self.peer_disconnected(&peer_id),
        }
    }

    /// Dispatches messages until the source closes or `shutdown` fires, then
    /// cancels any running sync.
    pub async fn run<S: MessageSource<NodeMessage>>(&self, mut messages: S, shutdown: CancellationToken) {
        info!("Full node started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = messages.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    debug!(%message, "Node message");
                    self.handle_message(message).await;
                }
            }
        }
        self.sync.shutdown();
        info!("Full node stopped");
    }
}
