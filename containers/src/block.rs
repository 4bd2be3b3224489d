use serde::{Deserialize, Serialize};

use crate::coin::Coin;
use crate::slot::{EndOfSubSlotBundle, SubEpochSummary, VdfInfo};
use crate::types::{Bytes32, HashWriter, Height, Weight};

fn hash_opt_vdf(writer: HashWriter, vdf: Option<&VdfInfo>) -> HashWriter {
    match vdf {
        Some(vdf) => vdf.hash_into(writer.u8(1)),
        None => writer.u8(0),
    }
}

/// Reward chain block before the infusion point is known.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardChainBlockUnfinished {
    pub total_iters: u128,
    pub signage_point_index: u8,
    pub pos_ss_cc_challenge_hash: Bytes32,
    /// Commitment to the proof of space; verified by the proof validator.
    pub proof_of_space: Bytes32,
    pub challenge_chain_sp_vdf: Option<VdfInfo>,
    pub reward_chain_sp_vdf: Option<VdfInfo>,
}

impl RewardChainBlockUnfinished {
    fn hash_into(&self, writer: HashWriter) -> HashWriter {
        let writer = writer
            .u128(self.total_iters)
            .u8(self.signage_point_index)
            .bytes32(&self.pos_ss_cc_challenge_hash)
            .bytes32(&self.proof_of_space);
        let writer = hash_opt_vdf(writer, self.challenge_chain_sp_vdf.as_ref());
        hash_opt_vdf(writer, self.reward_chain_sp_vdf.as_ref())
    }

    /// Key of the unfinished block cache.
    pub fn get_hash(&self) -> Bytes32 {
        self.hash_into(HashWriter::new()).finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardChainBlock {
    pub weight: Weight,
    pub height: Height,
    pub total_iters: u128,
    pub signage_point_index: u8,
    pub pos_ss_cc_challenge_hash: Bytes32,
    pub proof_of_space: Bytes32,
    pub challenge_chain_sp_vdf: Option<VdfInfo>,
    pub reward_chain_sp_vdf: Option<VdfInfo>,
    pub challenge_chain_ip_vdf: VdfInfo,
    pub reward_chain_ip_vdf: VdfInfo,
    pub infused_challenge_chain_ip_vdf: Option<VdfInfo>,
    pub is_transaction_block: bool,
}

impl RewardChainBlock {
    pub fn get_unfinished(&self) -> RewardChainBlockUnfinished {
        RewardChainBlockUnfinished {
            total_iters: self.total_iters,
            signage_point_index: self.signage_point_index,
            pos_ss_cc_challenge_hash: self.pos_ss_cc_challenge_hash,
            proof_of_space: self.proof_of_space,
            challenge_chain_sp_vdf: self.challenge_chain_sp_vdf.clone(),
            reward_chain_sp_vdf: self.reward_chain_sp_vdf.clone(),
        }
    }

    pub fn get_hash(&self) -> Bytes32 {
        let writer = self.get_unfinished().hash_into(
            HashWriter::new().u128(self.weight).u32(self.height),
        );
        let writer = self.challenge_chain_ip_vdf.hash_into(writer);
        let writer = self.reward_chain_ip_vdf.hash_into(writer);
        hash_opt_vdf(writer, self.infused_challenge_chain_ip_vdf.as_ref())
            .bool(self.is_transaction_block)
            .finish()
    }
}

/// Foliage commits to the previous block, the reward chain block and, for
/// transaction blocks, the transaction block contents. Its hash is the
/// header hash of the block.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Foliage {
    pub prev_block_hash: Bytes32,
    pub reward_block_hash: Bytes32,
    pub foliage_transaction_block_hash: Option<Bytes32>,
}

impl Foliage {
    pub fn get_hash(&self) -> Bytes32 {
        HashWriter::new()
            .bytes32(&self.prev_block_hash)
            .bytes32(&self.reward_block_hash)
            .opt_bytes32(self.foliage_transaction_block_hash.as_ref())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionsInfo {
    /// Hash of the generator program; zero when the block carries none.
    pub generator_root: Bytes32,
    pub timestamp: u64,
    pub fees: u64,
    pub cost: u64,
    pub additions: Vec<Coin>,
    pub removals: Vec<Bytes32>,
}

impl TransactionsInfo {
    /// Hash committed to by `Foliage::foliage_transaction_block_hash`.
    pub fn get_hash(&self) -> Bytes32 {
        let mut writer = HashWriter::new()
            .bytes32(&self.generator_root)
            .u64(self.timestamp)
            .u64(self.fees)
            .u64(self.cost)
            .u64(self.additions.len() as u64);
        for coin in &self.additions {
            writer = writer.bytes32(&coin.name());
        }
        writer = writer.u64(self.removals.len() as u64);
        for removal in &self.removals {
            writer = writer.bytes32(removal);
        }
        writer.finish()
    }
}

fn hash_body(
    writer: HashWriter,
    finished_sub_slots: &[EndOfSubSlotBundle],
    transactions_info: Option<&TransactionsInfo>,
    transactions_generator: Option<&Vec<u8>>,
    transactions_generator_ref_list: &[Height],
) -> HashWriter {
    let mut writer = writer.u64(finished_sub_slots.len() as u64);
    for sub_slot in finished_sub_slots {
        writer = writer.bytes32(&sub_slot.get_hash());
    }
    writer = writer.opt_bytes32(transactions_info.map(TransactionsInfo::get_hash).as_ref());
    writer = match transactions_generator {
        Some(generator) => writer.u8(1).bytes(generator),
        None => writer.u8(0),
    };
    writer = writer.u64(transactions_generator_ref_list.len() as u64);
    for height in transactions_generator_ref_list {
        writer = writer.u32(*height);
    }
    writer
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FullBlock {
    pub finished_sub_slots: Vec<EndOfSubSlotBundle>,
    pub reward_chain_block: RewardChainBlock,
    pub foliage: Foliage,
    pub transactions_info: Option<TransactionsInfo>,
    pub transactions_generator: Option<Vec<u8>>,
    pub transactions_generator_ref_list: Vec<Height>,
}

impl FullBlock {
    pub fn header_hash(&self) -> Bytes32 {
        self.foliage.get_hash()
    }

    pub fn prev_header_hash(&self) -> Bytes32 {
        self.foliage.prev_block_hash
    }

    pub fn height(&self) -> Height {
        self.reward_chain_block.height
    }

    pub fn weight(&self) -> Weight {
        self.reward_chain_block.weight
    }

    pub fn total_iters(&self) -> u128 {
        self.reward_chain_block.total_iters
    }

    pub fn is_transaction_block(&self) -> bool {
        self.foliage.foliage_transaction_block_hash.is_some()
    }

    /// Key under which this block's unfinished form is cached.
    pub fn unfinished_reward_hash(&self) -> Bytes32 {
        self.reward_chain_block.get_unfinished().get_hash()
    }

    /// A transaction block whose generator was left out of the message,
    /// typically because the sender knew we hold the unfinished block.
    pub fn is_missing_generator(&self) -> bool {
        self.is_transaction_block()
            && self.transactions_generator.is_none()
            && self
                .transactions_info
                .as_ref()
                .is_some_and(|info| !info.generator_root.is_zero())
    }

    pub fn without_generator(&self) -> FullBlock {
        FullBlock {
            transactions_generator: None,
            transactions_generator_ref_list: Vec::new(),
            ..self.clone()
        }
    }

    pub fn header_block(&self) -> HeaderBlock {
        HeaderBlock {
            finished_sub_slots: self.finished_sub_slots.clone(),
            reward_chain_block: self.reward_chain_block.clone(),
            foliage: self.foliage.clone(),
        }
    }

    /// Hash over the exact contents, used to detect identical rebroadcasts.
    pub fn raw_hash(&self) -> Bytes32 {
        hash_body(
            HashWriter::new()
                .bytes32(&self.header_hash())
                .bytes32(&self.reward_chain_block.get_hash()),
            &self.finished_sub_slots,
            self.transactions_info.as_ref(),
            self.transactions_generator.as_ref(),
            &self.transactions_generator_ref_list,
        )
        .finish()
    }
}

/// A block that is complete except for the infusion point VDFs.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnfinishedBlock {
    pub finished_sub_slots: Vec<EndOfSubSlotBundle>,
    pub reward_chain_block: RewardChainBlockUnfinished,
    pub foliage: Foliage,
    pub transactions_info: Option<TransactionsInfo>,
    pub transactions_generator: Option<Vec<u8>>,
    pub transactions_generator_ref_list: Vec<Height>,
}

impl UnfinishedBlock {
    pub fn partial_hash(&self) -> Bytes32 {
        self.reward_chain_block.get_hash()
    }

    pub fn header_hash(&self) -> Bytes32 {
        self.foliage.get_hash()
    }

    pub fn prev_header_hash(&self) -> Bytes32 {
        self.foliage.prev_block_hash
    }

    pub fn total_iters(&self) -> u128 {
        self.reward_chain_block.total_iters
    }

    pub fn is_transaction_block(&self) -> bool {
        self.foliage.foliage_transaction_block_hash.is_some()
    }

    pub fn raw_hash(&self) -> Bytes32 {
        hash_body(
            HashWriter::new()
                .bytes32(&self.header_hash())
                .bytes32(&self.partial_hash()),
            &self.finished_sub_slots,
            self.transactions_info.as_ref(),
            self.transactions_generator.as_ref(),
            &self.transactions_generator_ref_list,
        )
        .finish()
    }

    /// Attach the infusion point proofs, producing the full block at the
    /// given height and weight.
    pub fn into_full_block(
        self,
        height: Height,
        weight: Weight,
        challenge_chain_ip_vdf: VdfInfo,
        reward_chain_ip_vdf: VdfInfo,
        infused_challenge_chain_ip_vdf: Option<VdfInfo>,
    ) -> FullBlock {
        let is_transaction_block = self.is_transaction_block();
        let unfinished = self.reward_chain_block;
        FullBlock {
            finished_sub_slots: self.finished_sub_slots,
            reward_chain_block: RewardChainBlock {
                weight,
                height,
                total_iters: unfinished.total_iters,
                signage_point_index: unfinished.signage_point_index,
                pos_ss_cc_challenge_hash: unfinished.pos_ss_cc_challenge_hash,
                proof_of_space: unfinished.proof_of_space,
                challenge_chain_sp_vdf: unfinished.challenge_chain_sp_vdf,
                reward_chain_sp_vdf: unfinished.reward_chain_sp_vdf,
                challenge_chain_ip_vdf,
                reward_chain_ip_vdf,
                infused_challenge_chain_ip_vdf,
                is_transaction_block,
            },
            foliage: self.foliage,
            transactions_info: self.transactions_info,
            transactions_generator: self.transactions_generator,
            transactions_generator_ref_list: self.transactions_generator_ref_list,
        }
    }
}

/// Block without its transactions, served for weight proofs and peak checks.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeaderBlock {
    pub finished_sub_slots: Vec<EndOfSubSlotBundle>,
    pub reward_chain_block: RewardChainBlock,
    pub foliage: Foliage,
}

impl HeaderBlock {
    pub fn header_hash(&self) -> Bytes32 {
        self.foliage.get_hash()
    }

    pub fn height(&self) -> Height {
        self.reward_chain_block.height
    }

    pub fn weight(&self) -> Weight {
        self.reward_chain_block.weight
    }
}

/// Consensus metadata of an admitted block.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockRecord {
    pub header_hash: Bytes32,
    pub prev_hash: Bytes32,
    pub height: Height,
    pub weight: Weight,
    pub total_iters: u128,
    pub signage_point_index: u8,
    pub deficit: u8,
    pub sub_slot_iters: u64,
    pub required_iters: u64,
    pub overflow: bool,
    pub first_in_sub_slot: bool,
    pub is_transaction_block: bool,
    pub reward_infusion_new_challenge: Bytes32,
    pub sub_epoch_summary_included: Option<SubEpochSummary>,
    pub timestamp: Option<u64>,
}

impl BlockRecord {
    /// Challenge blocks open a new run of `min_blocks_per_challenge_block`.
    pub fn is_challenge_block(&self, min_blocks_per_challenge_block: u8) -> bool {
        self.deficit == min_blocks_per_challenge_block.saturating_sub(1)
    }

    /// Total iterations at the start of the sub-slot containing the
    /// infusion point.
    pub fn ip_sub_slot_total_iters(&self) -> u128 {
        if self.sub_slot_iters == 0 {
            return self.total_iters;
        }
        self.total_iters - self.total_iters % self.sub_slot_iters as u128
    }
}
