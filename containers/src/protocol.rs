//! Payloads exchanged with full nodes, wallets, farmers and timelords.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::block::RewardChainBlock;
use crate::slot::{SubEpochSummary, VdfInfo};
use crate::types::{Bytes32, Height, Weight};

/// Role of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    FullNode,
    Wallet,
    Farmer,
    Timelord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPeak {
    pub header_hash: Bytes32,
    pub height: Height,
    pub weight: Weight,
    pub fork_point_with_previous_peak: Height,
    pub unfinished_reward_block_hash: Bytes32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPeakWallet {
    pub header_hash: Bytes32,
    pub height: Height,
    pub weight: Weight,
    pub fork_point_with_previous_peak: Height,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPeakTimelord {
    pub reward_chain_block: RewardChainBlock,
    pub difficulty: u64,
    pub deficit: u8,
    pub sub_slot_iters: u64,
    pub sub_epoch_summary: Option<SubEpochSummary>,
    pub last_challenge_sb_or_eos_total_iters: u128,
    pub passes_ses_height_but_not_yet_included: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSignagePoint {
    pub challenge_hash: Bytes32,
    pub challenge_chain_sp: Bytes32,
    pub reward_chain_sp: Bytes32,
    pub difficulty: u64,
    pub sub_slot_iters: u64,
    pub signage_point_index: u8,
}

/// Full node gossip announcing either a signage point (`index_from_challenge
/// > 0`) or an end of sub-slot (`index_from_challenge == 0`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSignagePointOrEndOfSubSlot {
    pub prev_challenge_hash: Option<Bytes32>,
    pub challenge_hash: Bytes32,
    pub index_from_challenge: u8,
    pub last_rc_infusion: Bytes32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub transaction_id: Bytes32,
    pub cost: u64,
    pub fees: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUnfinishedBlock {
    pub unfinished_reward_hash: Bytes32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUnfinishedBlockTimelord {
    pub unfinished_reward_hash: Bytes32,
    pub difficulty: u64,
    pub sub_slot_iters: u64,
}

/// Infusion point proofs produced by a timelord for a cached unfinished
/// block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInfusionPointVdf {
    pub unfinished_reward_hash: Bytes32,
    pub challenge_chain_ip_vdf: VdfInfo,
    pub reward_chain_ip_vdf: VdfInfo,
    pub infused_challenge_chain_ip_vdf: Option<VdfInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    NewPeak(NewPeak),
    NewPeakWallet(NewPeakWallet),
    NewPeakTimelord(NewPeakTimelord),
    NewSignagePoint(NewSignagePoint),
    NewSignagePointOrEndOfSubSlot(NewSignagePointOrEndOfSubSlot),
    NewTransaction(NewTransaction),
    NewUnfinishedBlock(NewUnfinishedBlock),
    NewUnfinishedBlockTimelord(NewUnfinishedBlockTimelord),
}

impl Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolMessage::NewPeak(peak) => write!(f, "NewPeak(height={})", peak.height),
            ProtocolMessage::NewPeakWallet(peak) => {
                write!(f, "NewPeakWallet(height={})", peak.height)
            }
            ProtocolMessage::NewPeakTimelord(peak) => write!(
                f,
                "NewPeakTimelord(height={})",
                peak.reward_chain_block.height
            ),
            ProtocolMessage::NewSignagePoint(sp) => {
                write!(f, "NewSignagePoint(index={})", sp.signage_point_index)
            }
            ProtocolMessage::NewSignagePointOrEndOfSubSlot(msg) => write!(
                f,
                "NewSignagePointOrEndOfSubSlot(index={})",
                msg.index_from_challenge
            ),
            ProtocolMessage::NewTransaction(tx) => {
                write!(f, "NewTransaction(id={})", tx.transaction_id)
            }
            ProtocolMessage::NewUnfinishedBlock(block) => {
                write!(f, "NewUnfinishedBlock(rh={})", block.unfinished_reward_hash)
            }
            ProtocolMessage::NewUnfinishedBlockTimelord(block) => write!(
                f,
                "NewUnfinishedBlockTimelord(rh={})",
                block.unfinished_reward_hash
            ),
        }
    }
}
