use serde::{Deserialize, Serialize};

use crate::types::{Bytes32, HashWriter, Height};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Coin {
    pub parent_coin_info: Bytes32,
    pub puzzle_hash: Bytes32,
    pub amount: u64,
}

impl Coin {
    /// Coin id.
    pub fn name(&self) -> Bytes32 {
        HashWriter::new()
            .bytes32(&self.parent_coin_info)
            .bytes32(&self.puzzle_hash)
            .u64(self.amount)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinRecord {
    pub coin: Coin,
    pub confirmed_block_index: Height,
    pub spent_block_index: Option<Height>,
}

impl CoinRecord {
    pub fn is_spent(&self) -> bool {
        self.spent_block_index.is_some()
    }
}
