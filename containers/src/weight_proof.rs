use serde::{Deserialize, Serialize};

use crate::block::HeaderBlock;
use crate::types::{Bytes32, Height, Weight};

/// Per sub-epoch data carried by a weight proof.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubEpochData {
    pub reward_chain_hash: Bytes32,
    pub num_blocks_overflow: u8,
    pub new_sub_slot_iters: Option<u64>,
    pub new_difficulty: Option<u64>,
}

/// Compact proof of a remote chain's weight: sub-epoch summaries, sampled
/// segments (opaque here) and the most recent header blocks.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeightProof {
    pub sub_epochs: Vec<SubEpochData>,
    pub sub_epoch_segments: Vec<Vec<u8>>,
    pub recent_chain_data: Vec<HeaderBlock>,
}

impl WeightProof {
    /// Last header block of the proof; it must be the claimed peak.
    pub fn tip(&self) -> Option<&HeaderBlock> {
        self.recent_chain_data.last()
    }

    pub fn tip_height(&self) -> Option<Height> {
        self.tip().map(HeaderBlock::height)
    }

    pub fn tip_weight(&self) -> Option<Weight> {
        self.tip().map(HeaderBlock::weight)
    }
}
