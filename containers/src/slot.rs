//! Proof-of-time checkpoints: VDF outputs, end-of-sub-slot bundles, signage
//! points and sub-epoch summaries.
//!
//! Proof bytes are opaque here. Verifying them belongs to the proof
//! validator.

use serde::{Deserialize, Serialize};

use crate::types::{Bytes32, HashWriter};

/// Output of a verifiable delay function evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VdfInfo {
    pub challenge: Bytes32,
    pub number_of_iterations: u64,
    pub output: Bytes32,
}

impl VdfInfo {
    pub(crate) fn hash_into(&self, writer: HashWriter) -> HashWriter {
        writer
            .bytes32(&self.challenge)
            .u64(self.number_of_iterations)
            .bytes32(&self.output)
    }

    pub fn get_hash(&self) -> Bytes32 {
        self.hash_into(HashWriter::new()).finish()
    }
}

/// Closes a sub-slot on the challenge and reward chains.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndOfSubSlotBundle {
    pub challenge_chain_end_of_slot_vdf: VdfInfo,
    pub reward_chain_end_of_slot_vdf: VdfInfo,
    pub subepoch_summary_hash: Option<Bytes32>,
    pub new_sub_slot_iters: Option<u64>,
    pub new_difficulty: Option<u64>,
}

impl EndOfSubSlotBundle {
    /// Hash of the challenge chain part, which names the sub-slot.
    pub fn challenge_chain_hash(&self) -> Bytes32 {
        self.challenge_chain_end_of_slot_vdf
            .hash_into(HashWriter::new())
            .opt_bytes32(self.subepoch_summary_hash.as_ref())
            .opt_u64(self.new_sub_slot_iters)
            .opt_u64(self.new_difficulty)
            .finish()
    }

    pub fn get_hash(&self) -> Bytes32 {
        self.reward_chain_end_of_slot_vdf
            .hash_into(HashWriter::new().bytes32(&self.challenge_chain_hash()))
            .finish()
    }
}

/// VDF outputs at a signage point of the current sub-slot.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignagePoint {
    pub cc_vdf: Option<VdfInfo>,
    pub rc_vdf: Option<VdfInfo>,
}

impl SignagePoint {
    pub fn is_complete(&self) -> bool {
        self.cc_vdf.is_some() && self.rc_vdf.is_some()
    }
}

/// Summary committed to at every sub-epoch boundary; weight proofs are built
/// from the chain of these.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubEpochSummary {
    pub prev_subepoch_summary_hash: Bytes32,
    pub reward_chain_hash: Bytes32,
    pub num_blocks_overflow: u8,
    pub new_difficulty: Option<u64>,
    pub new_sub_slot_iters: Option<u64>,
}

impl SubEpochSummary {
    pub fn get_hash(&self) -> Bytes32 {
        HashWriter::new()
            .bytes32(&self.prev_subepoch_summary_hash)
            .bytes32(&self.reward_chain_hash)
            .u8(self.num_blocks_overflow)
            .opt_u64(self.new_difficulty)
            .opt_u64(self.new_sub_slot_iters)
            .finish()
    }
}
