use serde::{Deserialize, Serialize};

use crate::types::Bytes32;

/// Violated consensus rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ConsensusErrorCode {
    Unknown = 1,
    InvalidPrevBlockHash = 2,
    InvalidHeight = 3,
    InvalidWeight = 4,
    InvalidTotalIters = 5,
    InvalidPospace = 6,
    InvalidCcSpVdf = 7,
    InvalidRcSpVdf = 8,
    InvalidCcIpVdf = 9,
    InvalidRcIpVdf = 10,
    InvalidSubSlotIters = 11,
    InvalidDeficit = 12,
    InvalidFoliageBlockHash = 13,
    InvalidTransactionsGeneratorHash = 14,
    InvalidTransactionsFilterHash = 15,
    InvalidRewardBlockHash = 16,
    DoubleSpend = 17,
    UnknownUnspent = 18,
    TimestampTooFarInPast = 19,
    BlockAlreadyExists = 20,
    BadPeakCached = 21,
}

impl ConsensusErrorCode {
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

/// A block broke a consensus rule. Fatal to the block, never to the node;
/// the delivering peer is expected to be penalized by the caller.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("block {header_hash} violates consensus rule {code:?}")]
pub struct ConsensusError {
    pub code: ConsensusErrorCode,
    pub header_hash: Bytes32,
}

impl ConsensusError {
    pub fn new(code: ConsensusErrorCode, header_hash: Bytes32) -> Self {
        Self { code, header_hash }
    }
}
