use serde::{Deserialize, Serialize};

pub const SUB_EPOCH_BLOCKS: u32 = 384;
pub const EPOCH_BLOCKS: u32 = 4_608;
pub const SLOT_BLOCKS_TARGET: u32 = 32;
pub const SUB_SLOT_TIME_TARGET: u64 = 600;
pub const MIN_BLOCKS_PER_CHALLENGE_BLOCK: u8 = 16;
pub const MAX_SUB_SLOT_BLOCKS: u32 = 128;
pub const NUM_SPS_SUB_SLOT: u8 = 64;
pub const DIFFICULTY_STARTING: u64 = 7;
pub const DIFFICULTY_CHANGE_MAX_FACTOR: u64 = 3;
pub const SUB_SLOT_ITERS_STARTING: u64 = 1 << 27;
pub const WEIGHT_PROOF_RECENT_BLOCKS: u32 = 1_000;
pub const BLOCKS_CACHE_SIZE: u32 = 4_608 + 128 * 4;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConstants {
    /// Blocks between sub-epoch summaries.
    pub sub_epoch_blocks: u32,
    /// Blocks between difficulty and sub-slot iters adjustments; a multiple
    /// of `sub_epoch_blocks`.
    pub epoch_blocks: u32,
    pub slot_blocks_target: u32,
    /// Target seconds per sub-slot.
    pub sub_slot_time_target: u64,
    pub min_blocks_per_challenge_block: u8,
    pub max_sub_slot_blocks: u32,
    pub num_sps_sub_slot: u8,
    pub difficulty_starting: u64,
    pub difficulty_change_max_factor: u64,
    pub sub_slot_iters_starting: u64,
    /// Height below which a node always syncs from genesis instead of from a
    /// weight proof fork point.
    pub weight_proof_recent_blocks: u32,
    /// Block records kept in memory below the peak.
    pub blocks_cache_size: u32,
}

pub const DEVNET_CONSTANTS: ConsensusConstants = ConsensusConstants {
    sub_epoch_blocks: SUB_EPOCH_BLOCKS,
    epoch_blocks: EPOCH_BLOCKS,
    slot_blocks_target: SLOT_BLOCKS_TARGET,
    sub_slot_time_target: SUB_SLOT_TIME_TARGET,
    min_blocks_per_challenge_block: MIN_BLOCKS_PER_CHALLENGE_BLOCK,
    max_sub_slot_blocks: MAX_SUB_SLOT_BLOCKS,
    num_sps_sub_slot: NUM_SPS_SUB_SLOT,
    difficulty_starting: DIFFICULTY_STARTING,
    difficulty_change_max_factor: DIFFICULTY_CHANGE_MAX_FACTOR,
    sub_slot_iters_starting: SUB_SLOT_ITERS_STARTING,
    weight_proof_recent_blocks: WEIGHT_PROOF_RECENT_BLOCKS,
    blocks_cache_size: BLOCKS_CACHE_SIZE,
};

impl Default for ConsensusConstants {
    fn default() -> Self {
        DEVNET_CONSTANTS
    }
}

impl ConsensusConstants {
    /// Whether a block at `height` closes an epoch, i.e. the next block may
    /// carry a new difficulty.
    pub fn is_epoch_boundary(&self, height: u32) -> bool {
        self.epoch_blocks != 0 && (height + 1) % self.epoch_blocks == 0
    }

    pub fn is_sub_epoch_boundary(&self, height: u32) -> bool {
        self.sub_epoch_blocks != 0 && (height + 1) % self.sub_epoch_blocks == 0
    }

    /// Seconds an epoch should take at the target block rate.
    pub fn epoch_time_target(&self) -> u64 {
        self.epoch_blocks as u64 * self.sub_slot_time_target / self.slot_blocks_target.max(1) as u64
    }
}
