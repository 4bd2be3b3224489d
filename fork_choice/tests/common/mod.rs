//! Common block builders and test doubles for chain admission tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chain::ConsensusConstants;
use containers::{
    Bytes32, Coin, Foliage, FullBlock, Height, RewardChainBlock, RewardChainBlockUnfinished,
    TransactionsInfo, UnfinishedBlock, VdfInfo,
};
use fork_choice::{BlockAdmission, BlockSource, Blockchain, StructuralValidator, UnfinishedBlockCache};
use parking_lot::Mutex;

pub const WEIGHT_STEP: u128 = 10;
pub const ITERS_STEP: u128 = 1_000;

pub fn test_constants() -> ConsensusConstants {
    ConsensusConstants {
        blocks_cache_size: 8,
        ..Default::default()
    }
}

pub fn blockchain() -> Arc<Blockchain> {
    Arc::new(Blockchain::new(test_constants(), Arc::new(StructuralValidator)))
}

pub struct Harness {
    pub store: Arc<Blockchain>,
    pub unfinished: Arc<Mutex<UnfinishedBlockCache>>,
    pub admission: BlockAdmission,
}

pub fn harness() -> Harness {
    let store = blockchain();
    let unfinished = Arc::new(Mutex::new(UnfinishedBlockCache::new()));
    let admission = BlockAdmission::new(store.clone(), unfinished.clone());
    Harness {
        store,
        unfinished,
        admission,
    }
}

fn tag_hash(tag: &str) -> Bytes32 {
    Bytes32::sha256(tag.as_bytes())
}

fn next_position(prev: Option<&FullBlock>, weight_step: u128) -> (Height, u128, u128, Bytes32) {
    match prev {
        Some(prev) => (
            prev.height() + 1,
            prev.weight() + weight_step,
            prev.total_iters() + ITERS_STEP,
            prev.header_hash(),
        ),
        None => (0, weight_step, ITERS_STEP, Bytes32::zero()),
    }
}

fn assemble(
    prev: Option<&FullBlock>,
    tag: &str,
    weight_step: u128,
    transactions_info: Option<TransactionsInfo>,
    transactions_generator: Option<Vec<u8>>,
) -> FullBlock {
    let (height, weight, total_iters, prev_block_hash) = next_position(prev, weight_step);
    let reward_chain_block = RewardChainBlock {
        height,
        weight,
        total_iters,
        proof_of_space: tag_hash(tag),
        is_transaction_block: transactions_info.is_some(),
        ..Default::default()
    };
    FullBlock {
        foliage: Foliage {
            prev_block_hash,
            reward_block_hash: reward_chain_block.get_unfinished().get_hash(),
            foliage_transaction_block_hash: transactions_info.as_ref().map(TransactionsInfo::get_hash),
        },
        reward_chain_block,
        transactions_info,
        transactions_generator,
        ..Default::default()
    }
}

pub fn genesis() -> FullBlock {
    assemble(None, "genesis", WEIGHT_STEP, None, None)
}

pub fn child(prev: &FullBlock, tag: &str) -> FullBlock {
    assemble(Some(prev), tag, WEIGHT_STEP, None, None)
}

pub fn weighted_child(prev: &FullBlock, tag: &str, weight_step: u128) -> FullBlock {
    assemble(Some(prev), tag, weight_step, None, None)
}

/// `len` blocks on top of `prev`, oldest first.
pub fn extend(prev: &FullBlock, tag: &str, len: usize) -> Vec<FullBlock> {
    let mut blocks: Vec<FullBlock> = Vec::with_capacity(len);
    for i in 0..len {
        let parent = blocks.last().unwrap_or(prev);
        let block = child(parent, &format!("{tag}-{i}"));
        blocks.push(block);
    }
    blocks
}

pub fn coin(tag: &str, amount: u64) -> Coin {
    Coin {
        parent_coin_info: tag_hash(tag),
        puzzle_hash: puzzle_hash(),
        amount,
    }
}

pub fn puzzle_hash() -> Bytes32 {
    tag_hash("puzzle")
}

pub fn transaction_info(additions: Vec<Coin>, removals: Vec<Bytes32>, generator: Option<&[u8]>) -> TransactionsInfo {
    TransactionsInfo {
        generator_root: generator.map(Bytes32::sha256).unwrap_or_else(Bytes32::zero),
        timestamp: 1_000,
        fees: 0,
        cost: 0,
        additions,
        removals,
    }
}

pub fn transaction_child(
    prev: &FullBlock,
    tag: &str,
    additions: Vec<Coin>,
    removals: Vec<Bytes32>,
) -> FullBlock {
    assemble(
        Some(prev),
        tag,
        WEIGHT_STEP,
        Some(transaction_info(additions, removals, None)),
        None,
    )
}

/// Transaction block on top of `prev` in its unfinished form.
pub fn unfinished_child(prev: &FullBlock, tag: &str, generator: Vec<u8>) -> UnfinishedBlock {
    let (_, _, total_iters, prev_block_hash) = next_position(Some(prev), WEIGHT_STEP);
    let info = transaction_info(Vec::new(), Vec::new(), Some(&generator));
    let reward_chain_block = RewardChainBlockUnfinished {
        total_iters,
        proof_of_space: tag_hash(tag),
        ..Default::default()
    };
    UnfinishedBlock {
        foliage: Foliage {
            prev_block_hash,
            reward_block_hash: reward_chain_block.get_hash(),
            foliage_transaction_block_hash: Some(info.get_hash()),
        },
        reward_chain_block,
        transactions_info: Some(info),
        transactions_generator: Some(generator),
        ..Default::default()
    }
}

pub fn complete(unfinished: UnfinishedBlock, prev: &FullBlock) -> FullBlock {
    unfinished.into_full_block(
        prev.height() + 1,
        prev.weight() + WEIGHT_STEP,
        VdfInfo::default(),
        VdfInfo::default(),
        None,
    )
}

/// Serves one scripted block and counts the requests it gets.
#[derive(Default)]
pub struct ScriptedSource {
    pub block: Option<FullBlock>,
    pub calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn serving(block: FullBlock) -> Self {
        Self {
            block: Some(block),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockSource for ScriptedSource {
    async fn fetch_block(&self, _height: Height, _include_transactions: bool) -> Option<FullBlock> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.block.clone()
    }
}
