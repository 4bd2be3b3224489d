use anyhow::{ensure, Result};
use containers::{
    BlockRecord, Bytes32, ConsensusErrorCode, FullBlock, HeaderBlock, Height,
    PreValidationResult, SubEpochSummary, TransactionsInfo, UnfinishedBlock, WeightProof,
};

use crate::helpers::BlockRecords;
use crate::store::ChainStore;

/// Result of checking a peer's weight proof against the local chain.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct WeightProofVerdict {
    pub valid: bool,
    /// Height from which blocks must be downloaded.
    pub fork_point: Height,
    pub summaries: Vec<SubEpochSummary>,
}

/// Proof-of-space, VDF and weight proof verification.
///
/// Implementations are CPU bound and synchronous; callers run them on
/// blocking worker threads.
pub trait ProofValidator: Send + Sync + 'static {
    /// `prev` is the record of the parent, `None` for a genesis candidate.
    fn validate_block(&self, block: &FullBlock, prev: Option<&BlockRecord>) -> PreValidationResult;

    fn validate_unfinished_block(
        &self,
        block: &UnfinishedBlock,
        prev: Option<&BlockRecord>,
    ) -> PreValidationResult;

    /// Checks `proof` and derives the fork point against `local`.
    fn validate_weight_proof(
        &self,
        proof: &WeightProof,
        local: &dyn ChainStore,
    ) -> Result<WeightProofVerdict>;
}

/// Height from which a chain proven by `proof` must be downloaded.
///
/// When a recent proof header is on the local canonical chain, that header
/// is the fork point. Otherwise the local sub-epoch summaries are matched
/// against `summaries` in order, and the fork point is the summary height two
/// sub-epochs before the last match, or genesis when fewer than four match.
pub fn weight_proof_fork_point(
    local: &dyn ChainStore,
    proof: &WeightProof,
    summaries: &[SubEpochSummary],
) -> Height {
    let shared = proof
        .recent_chain_data
        .iter()
        .rev()
        .find(|header| local.height_to_hash(header.height()) == Some(header.header_hash()))
        .map(HeaderBlock::height);
    if let Some(height) = shared {
        return height;
    }

    let ses_heights = local.sub_epoch_summary_heights();
    let mut last_match = 0;
    for (index, (height, received)) in ses_heights.iter().zip(summaries).enumerate() {
        // The newest received summary may still change.
        if index + 1 == summaries.len() {
            break;
        }
        let local_summary = local
            .height_to_hash(*height)
            .and_then(|hash| local.block_record(&hash))
            .and_then(|record| record.sub_epoch_summary_included);
        if local_summary.map(|summary| summary.get_hash()) != Some(received.get_hash()) {
            break;
        }
        last_match = index;
    }
    if last_match > 2 {
        ses_heights[last_match - 2]
    } else {
        0
    }
}

/// Checks the commitments that tie a block together (foliage, transaction
/// info, generator root) and its linkage to the parent. Proof bytes are
/// accepted as given.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

fn check_transactions(
    is_transaction_block: bool,
    foliage_transaction_block_hash: Option<&Bytes32>,
    info: Option<&TransactionsInfo>,
    generator: Option<&Vec<u8>>,
) -> Result<(), ConsensusErrorCode> {
    match (is_transaction_block, info) {
        (false, None) => return Ok(()),
        (true, Some(info)) => {
            if foliage_transaction_block_hash != Some(&info.get_hash()) {
                return Err(ConsensusErrorCode::InvalidFoliageBlockHash);
            }
            let generator_root = generator
                .map(|generator| Bytes32::sha256(generator))
                .unwrap_or_else(Bytes32::zero);
            if generator_root != info.generator_root {
                return Err(ConsensusErrorCode::InvalidTransactionsGeneratorHash);
            }
        }
        _ => return Err(ConsensusErrorCode::InvalidFoliageBlockHash),
    }
    Ok(())
}

fn required_iters(proof_of_space: &Bytes32, sub_slot_iters: u64) -> u64 {
    let mut quality = [0u8; 8];
    quality.copy_from_slice(&proof_of_space.as_bytes()[..8]);
    1 + u64::from_le_bytes(quality) % sub_slot_iters.max(1)
}

impl StructuralValidator {
    fn check_block(
        &self,
        block: &FullBlock,
        prev: Option<&BlockRecord>,
    ) -> Result<u64, ConsensusErrorCode> {
        if block.foliage.reward_block_hash != block.unfinished_reward_hash() {
            return Err(ConsensusErrorCode::InvalidRewardBlockHash);
        }
        if block.reward_chain_block.is_transaction_block != block.is_transaction_block() {
            return Err(ConsensusErrorCode::InvalidFoliageBlockHash);
        }
        check_transactions(
            block.is_transaction_block(),
            block.foliage.foliage_transaction_block_hash.as_ref(),
            block.transactions_info.as_ref(),
            block.transactions_generator.as_ref(),
        )?;

        let sub_slot_iters = match prev {
            None if block.height() != 0 => return Err(ConsensusErrorCode::InvalidPrevBlockHash),
            None => 0,
            Some(prev) => {
                if prev.header_hash != block.prev_header_hash() {
                    return Err(ConsensusErrorCode::InvalidPrevBlockHash);
                }
                if block.height() != prev.height + 1 {
                    return Err(ConsensusErrorCode::InvalidHeight);
                }
                if block.weight() <= prev.weight {
                    return Err(ConsensusErrorCode::InvalidWeight);
                }
                if block.total_iters() <= prev.total_iters {
                    return Err(ConsensusErrorCode::InvalidTotalIters);
                }
                if let (Some(info), Some(prev_timestamp)) =
                    (block.transactions_info.as_ref(), prev.timestamp)
                {
                    if info.timestamp < prev_timestamp {
                        return Err(ConsensusErrorCode::TimestampTooFarInPast);
                    }
                }
                prev.sub_slot_iters
            }
        };

        Ok(required_iters(
            &block.reward_chain_block.proof_of_space,
            sub_slot_iters,
        ))
    }
}

impl ProofValidator for StructuralValidator {
    fn validate_block(&self, block: &FullBlock, prev: Option<&BlockRecord>) -> PreValidationResult {
        match self.check_block(block, prev) {
            Ok(required_iters) => PreValidationResult::valid(required_iters),
            Err(code) => PreValidationResult::invalid(code),
        }
    }

    fn validate_unfinished_block(
        &self,
        block: &UnfinishedBlock,
        prev: Option<&BlockRecord>,
    ) -> PreValidationResult {
        if block.foliage.reward_block_hash != block.partial_hash() {
            return PreValidationResult::invalid(ConsensusErrorCode::InvalidRewardBlockHash);
        }
        if let Err(code) = check_transactions(
            block.is_transaction_block(),
            block.foliage.foliage_transaction_block_hash.as_ref(),
            block.transactions_info.as_ref(),
            block.transactions_generator.as_ref(),
        ) {
            return PreValidationResult::invalid(code);
        }
        if let Some(prev) = prev {
            if prev.header_hash != block.prev_header_hash() {
                return PreValidationResult::invalid(ConsensusErrorCode::InvalidPrevBlockHash);
            }
            if block.total_iters() <= prev.total_iters {
                return PreValidationResult::invalid(ConsensusErrorCode::InvalidTotalIters);
            }
        }
        let sub_slot_iters = prev.map(|prev| prev.sub_slot_iters).unwrap_or_default();
        PreValidationResult::valid(required_iters(
            &block.reward_chain_block.proof_of_space,
            sub_slot_iters,
        ))
    }

    fn validate_weight_proof(
        &self,
        proof: &WeightProof,
        local: &dyn ChainStore,
    ) -> Result<WeightProofVerdict> {
        ensure!(!proof.recent_chain_data.is_empty(), "weight proof has no recent blocks");

        let linked = proof.recent_chain_data.windows(2).all(|pair| {
            pair[1].foliage.prev_block_hash == pair[0].header_hash()
                && pair[1].height() == pair[0].height() + 1
                && pair[1].weight() > pair[0].weight()
        });

        let mut prev_hash = Bytes32::zero();
        let summaries = proof
            .sub_epochs
            .iter()
            .map(|data| {
                let summary = SubEpochSummary {
                    prev_subepoch_summary_hash: prev_hash,
                    reward_chain_hash: data.reward_chain_hash,
                    num_blocks_overflow: data.num_blocks_overflow,
                    new_difficulty: data.new_difficulty,
                    new_sub_slot_iters: data.new_sub_slot_iters,
                };
                prev_hash = summary.get_hash();
                summary
            })
            .collect::<Vec<_>>();

        let fork_point = if linked {
            weight_proof_fork_point(local, proof, &summaries)
        } else {
            0
        };
        Ok(WeightProofVerdict {
            valid: linked,
            fork_point,
            summaries,
        })
    }
}
