//! Node builder and quiet collaborators for the full node tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chain::ConsensusConstants;
use containers::{
    BlockRecord, Bytes32, Foliage, FullBlock, HeaderBlock, Height, NewInfusionPointVdf, NodeType,
    ProtocolMessage, RewardChainBlock, RewardChainBlockUnfinished, SignagePoint, SubEpochSummary,
    TransactionsInfo, UnfinishedBlock, VdfInfo, WeightProof,
};
use fork_choice::{Blockchain, StructuralValidator};
use full_node::node::NodeContext;
use full_node::{FullNode, NodeConfig};
use libp2p_identity::PeerId;
use networking::propagation::{MempoolInclusion, MempoolManager, NodeEvent, SlotPeakResult, SlotStore};
use networking::types::{Broadcaster, NetworkRequester};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const WEIGHT_STEP: u128 = 10;
pub const ITERS_STEP: u128 = 1_000;

fn tag_hash(tag: &str) -> Bytes32 {
    Bytes32::sha256(tag.as_bytes())
}

fn transactions_info(timestamp: u64, generator: &[u8]) -> TransactionsInfo {
    TransactionsInfo {
        generator_root: Bytes32::sha256(generator),
        timestamp,
        ..Default::default()
    }
}

fn assemble(prev: Option<&FullBlock>, tag: &str, info: Option<TransactionsInfo>) -> FullBlock {
    let (height, weight, total_iters, prev_block_hash) = match prev {
        Some(prev) => (
            prev.height() + 1,
            prev.weight() + WEIGHT_STEP,
            prev.total_iters() + ITERS_STEP,
            prev.header_hash(),
        ),
        None => (0, WEIGHT_STEP, ITERS_STEP, Bytes32::zero()),
    };
    let reward_chain_block = RewardChainBlock {
        height,
        weight,
        total_iters,
        proof_of_space: tag_hash(tag),
        is_transaction_block: info.is_some(),
        ..Default::default()
    };
    let generator = info.as_ref().map(|_| tag.as_bytes().to_vec());
    FullBlock {
        foliage: Foliage {
            prev_block_hash,
            reward_block_hash: reward_chain_block.get_unfinished().get_hash(),
            foliage_transaction_block_hash: info.as_ref().map(TransactionsInfo::get_hash),
        },
        reward_chain_block,
        transactions_info: info,
        transactions_generator: generator,
        ..Default::default()
    }
}

pub fn genesis() -> FullBlock {
    assemble(None, "genesis", None)
}

pub fn child(prev: &FullBlock, tag: &str) -> FullBlock {
    assemble(Some(prev), tag, None)
}

/// Transaction block stamped with `timestamp`; its generator is the tag.
pub fn transaction_child(prev: &FullBlock, tag: &str, timestamp: u64) -> FullBlock {
    assemble(Some(prev), tag, Some(transactions_info(timestamp, tag.as_bytes())))
}

/// Transaction block on top of `prev`, before infusion.
pub fn unfinished_child(prev: &FullBlock, tag: &str, timestamp: u64) -> UnfinishedBlock {
    let info = transactions_info(timestamp, tag.as_bytes());
    let reward_chain_block = RewardChainBlockUnfinished {
        total_iters: prev.total_iters() + ITERS_STEP,
        proof_of_space: tag_hash(tag),
        ..Default::default()
    };
    UnfinishedBlock {
        foliage: Foliage {
            prev_block_hash: prev.header_hash(),
            reward_block_hash: reward_chain_block.get_hash(),
            foliage_transaction_block_hash: Some(info.get_hash()),
        },
        reward_chain_block,
        transactions_info: Some(info),
        transactions_generator: Some(tag.as_bytes().to_vec()),
        ..Default::default()
    }
}

pub fn infusion(unfinished: &UnfinishedBlock) -> NewInfusionPointVdf {
    NewInfusionPointVdf {
        unfinished_reward_hash: unfinished.partial_hash(),
        challenge_chain_ip_vdf: VdfInfo::default(),
        reward_chain_ip_vdf: VdfInfo::default(),
        infused_challenge_chain_ip_vdf: None,
    }
}

/// A network with no full node connections.
#[derive(Default)]
pub struct OfflineNetwork;

#[async_trait]
impl NetworkRequester for OfflineNetwork {
    async fn request_block(&self, _: PeerId, _: Height, _: bool) -> Result<Option<FullBlock>> {
        Ok(None)
    }

    async fn request_blocks(
        &self,
        _: PeerId,
        _: Height,
        _: Height,
        _: bool,
    ) -> Result<Option<Vec<FullBlock>>> {
        Ok(None)
    }

    async fn request_block_header(&self, _: PeerId, _: Height) -> Result<Option<HeaderBlock>> {
        Ok(None)
    }

    async fn request_proof_of_weight(
        &self,
        _: PeerId,
        _: Height,
        _: Bytes32,
    ) -> Result<Option<WeightProof>> {
        Ok(None)
    }

    fn connected_peers(&self, _: NodeType) -> Vec<PeerId> {
        Vec::new()
    }

    async fn close_peer(&self, _: PeerId, _: Duration) {}
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    sent: Mutex<Vec<(ProtocolMessage, NodeType, Option<PeerId>)>>,
}

impl RecordingBroadcaster {
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
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn send_to_all(&self, message: ProtocolMessage, node_type: NodeType) -> Result<()> {
        self.sent.lock().push((message, node_type, None));
        Ok(())
    }

    async fn send_to_all_except(
        &self,
        message: ProtocolMessage,
        node_type: NodeType,
        except: PeerId,
    ) -> Result<()> {
        self.sent.lock().push((message, node_type, Some(except)));
        Ok(())
    }
}

pub struct EmptyMempool;

#[async_trait]
impl MempoolManager for EmptyMempool {
    async fn new_peak(&self, _: &BlockRecord, _: &[Bytes32]) -> Vec<MempoolInclusion> {
        Vec::new()
    }
}

pub struct EmptySlots;

impl SlotStore for EmptySlots {
    fn new_peak(
        &self,
        _: &BlockRecord,
        _: u64,
        _: u64,
        _: Option<&SubEpochSummary>,
        _: Option<&BlockRecord>,
    ) -> SlotPeakResult {
        SlotPeakResult::default()
    }

    fn new_signage_point(&self, _: u8, _: &BlockRecord, _: SignagePoint) -> bool {
        false
    }

    fn clear_old_cache_entries(&self) {}
}

pub fn test_config() -> NodeConfig {
    NodeConfig {
        consensus: ConsensusConstants {
            blocks_cache_size: 8,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct TestNode {
    pub node: FullNode<OfflineNetwork>,
    pub store: Arc<Blockchain>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
    pub shutdown: CancellationToken,
}

impl TestNode {
    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn load(&self, blocks: &[FullBlock]) {
        for block in blocks {
            self.node
                .sync()
                .admit_block(block.clone(), None)
                .await
                .expect("local block is valid");
        }
    }
}

pub fn test_node() -> TestNode {
    let config = test_config();
    let validator = Arc::new(StructuralValidator);
    let store = Arc::new(Blockchain::new(config.consensus.clone(), validator.clone()));
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let shutdown = CancellationToken::new();
    let context = NodeContext {
        store: store.clone(),
        validator,
        network: Arc::new(OfflineNetwork),
        broadcaster: broadcaster.clone(),
        mempool: Arc::new(EmptyMempool),
        slots: Arc::new(EmptySlots),
    };
    let (node, events) = FullNode::new(&config, context, shutdown.clone());
    TestNode {
        node,
        store,
        broadcaster,
        events,
        shutdown,
    }
}
