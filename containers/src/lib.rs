pub mod block;
pub mod coin;
pub mod error;
pub mod protocol;
pub mod slot;
pub mod types;
pub mod validation;
pub mod weight_proof;

pub use block::{
    BlockRecord, Foliage, FullBlock, HeaderBlock, RewardChainBlock, RewardChainBlockUnfinished,
    TransactionsInfo, UnfinishedBlock,
};
pub use coin::{Coin, CoinRecord};
pub use error::{ConsensusError, ConsensusErrorCode};
pub use protocol::{
    NewInfusionPointVdf, NewPeak, NewPeakTimelord, NewPeakWallet, NewSignagePoint,
    NewSignagePointOrEndOfSubSlot, NewTransaction, NewUnfinishedBlock,
    NewUnfinishedBlockTimelord, NodeType, ProtocolMessage,
};
pub use slot::{EndOfSubSlotBundle, SignagePoint, SubEpochSummary, VdfInfo};
pub use types::{Bytes32, HashWriter, Height, Weight};
pub use validation::PreValidationResult;
pub use weight_proof::{SubEpochData, WeightProof};
