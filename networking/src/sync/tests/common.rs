//! Block builders and test doubles for the sync and propagation tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chain::ConsensusConstants;
use containers::{
    BlockRecord, Bytes32, Foliage, FullBlock, HeaderBlock, Height, NewPeak, NodeType,
    ProtocolMessage, RewardChainBlock, SignagePoint, SubEpochSummary, WeightProof,
};
use fork_choice::{BlockAdmission, Blockchain, StructuralValidator, UnfinishedBlockCache};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::propagation::{
    MempoolInclusion, MempoolManager, NodeEvent, PeakPropagator, PropagationConfig,
    SlotPeakResult, SlotStore,
};
use crate::sync::{SyncConfig, SyncService};
use crate::types::{Broadcaster, NetworkRequester};

pub const WEIGHT_STEP: u128 = 10;
pub const ITERS_STEP: u128 = 1_000;

pub fn test_constants() -> ConsensusConstants {
    ConsensusConstants {
        blocks_cache_size: 8,
        weight_proof_recent_blocks: 10,
        ..Default::default()
    }
}

pub fn sync_config() -> SyncConfig {
    SyncConfig {
        short_sync_blocks_behind_threshold: 3,
        sync_blocks_behind_threshold: 12,
        min_peers_for_sync: 1,
        max_sync_wait_secs: 0,
        request_timeout_secs: 1,
        window_timeout_secs: 1,
        weight_proof_timeout_secs: 1,
        max_blocks_per_request: 4,
        ..Default::default()
    }
}

fn block_on(prev: Option<&FullBlock>, tag: &str, weight_step: u128) -> FullBlock {
    let (height, weight, total_iters, prev_block_hash) = match prev {
        Some(prev) => (
            prev.height() + 1,
            prev.weight() + weight_step,
            prev.total_iters() + ITERS_STEP,
            prev.header_hash(),
        ),
        None => (0, weight_step, ITERS_STEP, Bytes32::zero()),
    };
    let reward_chain_block = RewardChainBlock {
        height,
        weight,
        total_iters,
        proof_of_space: Bytes32::sha256(tag.as_bytes()),
        ..Default::default()
    };
    FullBlock {
        foliage: Foliage {
            prev_block_hash,
            reward_block_hash: reward_chain_block.get_unfinished().get_hash(),
            foliage_transaction_block_hash: None,
        },
        reward_chain_block,
        ..Default::default()
    }
}

pub fn genesis() -> FullBlock {
    block_on(None, "genesis", WEIGHT_STEP)
}

/// Genesis plus `len` blocks, oldest first.
pub fn chain(len: usize) -> Vec<FullBlock> {
    let mut blocks = vec![genesis()];
    blocks.extend(fork(&blocks[0], "main", len, WEIGHT_STEP));
    blocks
}

/// `len` blocks on top of `prev`, each adding `weight_step`.
pub fn fork(prev: &FullBlock, tag: &str, len: usize, weight_step: u128) -> Vec<FullBlock> {
    let mut blocks: Vec<FullBlock> = Vec::with_capacity(len);
    for i in 0..len {
        let parent = blocks.last().unwrap_or(prev);
        let block = block_on(Some(parent), &format!("{tag}-{i}"), weight_step);
        blocks.push(block);
    }
    blocks
}

pub fn announce(block: &FullBlock) -> NewPeak {
    NewPeak {
        header_hash: block.header_hash(),
        height: block.height(),
        weight: block.weight(),
        fork_point_with_previous_peak: 0,
        unfinished_reward_block_hash: block.unfinished_reward_hash(),
    }
}

/// Weight proof whose recent chain is the last `recent` blocks of `blocks`.
pub fn weight_proof(blocks: &[FullBlock], recent: usize) -> WeightProof {
    let skip = blocks.len().saturating_sub(recent);
    WeightProof {
        recent_chain_data: blocks[skip..].iter().map(FullBlock::header_block).collect(),
        ..Default::default()
    }
}

/// Network of scripted peers, each serving its own chain.
#[derive(Default)]
pub struct ScriptedNetwork {
    chains: Mutex<HashMap<PeerId, Vec<FullBlock>>>,
    proofs: Mutex<HashMap<PeerId, WeightProof>>,
    failing: Mutex<HashSet<PeerId>>,
    connected: Mutex<Vec<PeerId>>,
    closed: Mutex<Vec<(PeerId, Duration)>>,
    stall_proofs: AtomicBool,
    block_requests: AtomicUsize,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `peer_id` and serves `blocks` from it.
    pub fn serve(&self, peer_id: PeerId, blocks: Vec<FullBlock>) {
        self.chains.lock().insert(peer_id, blocks);
        let mut connected = self.connected.lock();
        if !connected.contains(&peer_id) {
            connected.push(peer_id);
        }
    }

    pub fn serve_proof(&self, peer_id: PeerId, proof: WeightProof) {
        self.proofs.lock().insert(peer_id, proof);
    }

    /// Every request to `peer_id` fails with a connection error.
    pub fn fail(&self, peer_id: PeerId) {
        self.failing.lock().insert(peer_id);
        let mut connected = self.connected.lock();
        if !connected.contains(&peer_id) {
            connected.push(peer_id);
        }
    }

    /// Weight proof requests never complete.
    pub fn stall_proofs(&self) {
        self.stall_proofs.store(true, Ordering::SeqCst);
    }

    pub fn closed(&self) -> Vec<(PeerId, Duration)> {
        self.closed.lock().clone()
    }

    pub fn block_requests(&self) -> usize {
        self.block_requests.load(Ordering::SeqCst)
    }

    fn check(&self, peer_id: &PeerId) -> Result<()> {
        if self.failing.lock().contains(peer_id) {
            bail!("connection reset by {peer_id}");
        }
        Ok(())
    }

    fn block_at(&self, peer_id: &PeerId, height: Height) -> Option<FullBlock> {
        self.chains
            .lock()
            .get(peer_id)?
            .iter()
            .find(|block| block.height() == height)
            .cloned()
    }
}

#[async_trait]
impl NetworkRequester for ScriptedNetwork {
    async fn request_block(
        &self,
        peer_id: PeerId,
        height: Height,
        include_transactions: bool,
    ) -> Result<Option<FullBlock>> {
        self.block_requests.fetch_add(1, Ordering::SeqCst);
        self.check(&peer_id)?;
        Ok(self.block_at(&peer_id, height).map(|block| {
            if include_transactions {
                block
            } else {
                block.without_generator()
            }
        }))
    }

    async fn request_blocks(
        &self,
        peer_id: PeerId,
        start: Height,
        end: Height,
        _include_transactions: bool,
    ) -> Result<Option<Vec<FullBlock>>> {
        self.block_requests.fetch_add(1, Ordering::SeqCst);
        self.check(&peer_id)?;
        Ok((start..=end)
            .map(|height| self.block_at(&peer_id, height))
            .collect())
    }

    async fn request_block_header(
        &self,
        peer_id: PeerId,
        height: Height,
    ) -> Result<Option<HeaderBlock>> {
        self.check(&peer_id)?;
        Ok(self
            .block_at(&peer_id, height)
            .map(|block| block.header_block()))
    }

    async fn request_proof_of_weight(
        &self,
        peer_id: PeerId,
        _total_number_of_blocks: Height,
        _tip: Bytes32,
    ) -> Result<Option<WeightProof>> {
        if self.stall_proofs.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.check(&peer_id)?;
        Ok(self.proofs.lock().get(&peer_id).cloned())
    }

    fn connected_peers(&self, node_type: NodeType) -> Vec<PeerId> {
        match node_type {
            NodeType::FullNode => self.connected.lock().clone(),
            _ => Vec::new(),
        }
    }

    async fn close_peer(&self, peer_id: PeerId, ban: Duration) {
        self.connected.lock().retain(|peer| *peer != peer_id);
        self.closed.lock().push((peer_id, ban));
    }
}

/// Records every message; sends to `failing` node types return an error.
#[derive(Default)]
pub struct RecordingBroadcaster {
    sent: Mutex<Vec<(ProtocolMessage, NodeType, Option<PeerId>)>>,
    failing: Mutex<HashSet<NodeType>>,
}

impl RecordingBroadcaster {
    pub fn fail_for(&self, node_type: NodeType) {
        self.failing.lock().insert(node_type);
    }

    pub fn sent(&self) -> Vec<(ProtocolMessage, NodeType, Option<PeerId>)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, node_type: NodeType) -> Vec<ProtocolMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, to, _)| *to == node_type)
            .map(|(message, _, _)| message.clone())
            .collect()
    }

    fn record(&self, message: ProtocolMessage, node_type: NodeType, except: Option<PeerId>) -> Result<()> {
        if self.failing.lock().contains(&node_type) {
            return Err(anyhow!("{node_type:?} connections are down"));
        }
        self.sent.lock().push((message, node_type, except));
        Ok(())
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn send_to_all(&self, message: ProtocolMessage, node_type: NodeType) -> Result<()> {
        self.record(message, node_type, None)
    }

    async fn send_to_all_except(
        &self,
        message: ProtocolMessage,
        node_type: NodeType,
        except: PeerId,
    ) -> Result<()> {
        self.record(message, node_type, Some(except))
    }
}

/// Counts peaks and returns a fixed set of inclusions for each.
#[derive(Default)]
pub struct CountingMempool {
    inclusions: Vec<MempoolInclusion>,
    peaks: AtomicUsize,
    spent: Mutex<Vec<Bytes32>>,
}

impl CountingMempool {
    pub fn with_inclusions(inclusions: Vec<MempoolInclusion>) -> Self {
        Self {
            inclusions,
            ..Default::default()
        }
    }

    pub fn peaks(&self) -> usize {
        self.peaks.load(Ordering::SeqCst)
    }

    pub fn spent(&self) -> Vec<Bytes32> {
        self.spent.lock().clone()
    }
}

#[async_trait]
impl MempoolManager for CountingMempool {
    async fn new_peak(&self, _peak: &BlockRecord, spent_coin_ids: &[Bytes32]) -> Vec<MempoolInclusion> {
        self.peaks.fetch_add(1, Ordering::SeqCst);
        self.spent.lock().extend_from_slice(spent_coin_ids);
        self.inclusions.clone()
    }
}

/// Slot store that resolves a scripted result and records what it was told.
#[derive(Default)]
pub struct NullSlotStore {
    pub result: SlotPeakResult,
    fork_ancestors: Mutex<Vec<Option<Height>>>,
    clears: AtomicUsize,
}

impl NullSlotStore {
    pub fn fork_ancestors(&self) -> Vec<Option<Height>> {
        self.fork_ancestors.lock().clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl SlotStore for NullSlotStore {
    fn new_peak(
        &self,
        _peak: &BlockRecord,
        _next_difficulty: u64,
        _next_sub_slot_iters: u64,
        _sub_epoch_summary: Option<&SubEpochSummary>,
        fork_ancestor: Option<&BlockRecord>,
    ) -> SlotPeakResult {
        self.fork_ancestors
            .lock()
            .push(fork_ancestor.map(|record| record.height));
        self.result.clone()
    }

    fn new_signage_point(&self, _index: u8, _peak: &BlockRecord, _signage_point: SignagePoint) -> bool {
        true
    }

    fn clear_old_cache_entries(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Fixture {
    pub service: SyncService<ScriptedNetwork>,
    pub network: Arc<ScriptedNetwork>,
    pub store: Arc<Blockchain>,
    pub admission: Arc<BlockAdmission>,
    pub unfinished: Arc<Mutex<UnfinishedBlockCache>>,
    pub propagator: Arc<PeakPropagator>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub mempool: Arc<CountingMempool>,
    pub slots: Arc<NullSlotStore>,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
}

impl Fixture {
    /// Commits `blocks` locally, in order.
    pub async fn load(&self, blocks: &[FullBlock]) {
        for block in blocks {
            self.admission
                .add_block(block.clone(), None, None)
                .await
                .expect("local block is valid");
        }
    }

    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn peak_hash(&self) -> Option<Bytes32> {
        use fork_choice::ChainStore;
        self.store.get_peak().map(|peak| peak.header_hash)
    }
}

pub fn fixture_with(
    mempool: CountingMempool,
    slots: NullSlotStore,
    propagation: PropagationConfig,
) -> Fixture {
    build_fixture(test_constants(), mempool, slots, propagation)
}

/// Fixture on top of non-default consensus constants.
pub fn fixture_with_constants(constants: ConsensusConstants) -> Fixture {
    build_fixture(
        constants,
        CountingMempool::default(),
        NullSlotStore::default(),
        PropagationConfig::default(),
    )
}

fn build_fixture(
    constants: ConsensusConstants,
    mempool: CountingMempool,
    slots: NullSlotStore,
    propagation: PropagationConfig,
) -> Fixture {
    let network = Arc::new(ScriptedNetwork::new());
    let validator = Arc::new(StructuralValidator);
    let store = Arc::new(Blockchain::new(constants.clone(), validator.clone()));
    let unfinished = Arc::new(Mutex::new(UnfinishedBlockCache::new()));
    let admission = Arc::new(BlockAdmission::new(store.clone(), unfinished.clone()));
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let mempool = Arc::new(mempool);
    let slots = Arc::new(slots);
    let (sender, events) = mpsc::unbounded_channel();
    let propagator = Arc::new(PeakPropagator::new(
        constants.clone(),
        propagation,
        store.clone(),
        mempool.clone(),
        slots.clone(),
        broadcaster.clone(),
        unfinished.clone(),
        sender,
    ));
    let service = SyncService::new(
        sync_config(),
        constants,
        network.clone(),
        admission.clone(),
        validator,
        propagator.clone(),
        unfinished.clone(),
        CancellationToken::new(),
    );
    Fixture {
        service,
        network,
        store,
        admission,
        unfinished,
        propagator,
        broadcaster,
        mempool,
        slots,
        events,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(
        CountingMempool::default(),
        NullSlotStore::default(),
        PropagationConfig::default(),
    )
}
