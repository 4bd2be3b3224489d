use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chain::ConsensusConstants;
use containers::{
    BlockRecord, Bytes32, Coin, CoinRecord, ConsensusErrorCode, FullBlock, Height,
    PreValidationResult,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::helpers::{block_to_block_record, find_fork_point, BlockRecords};
use crate::validator::ProofValidator;

/// Outcome of offering a block to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddBlockResult {
    AlreadyHaveBlock,
    DisconnectedBlock,
    InvalidBlock,
    NewPeak,
    AddedAsOrphan,
}

/// What changed when a block became the new peak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeSummary {
    pub peak: BlockRecord,
    /// Height of the last block shared with the previous peak; `None` when
    /// the chains share nothing.
    pub fork_height: Option<Height>,
    pub rolled_back_records: Vec<BlockRecord>,
    /// Coin ids spent by the newly connected blocks.
    pub removals: Vec<Bytes32>,
    pub additions: Vec<CoinRecord>,
}

impl StateChangeSummary {
    /// Summary used to re-announce an unchanged peak.
    pub fn for_peak(peak: BlockRecord, fork_height: Option<Height>) -> Self {
        Self {
            peak,
            fork_height,
            rolled_back_records: Vec::new(),
            removals: Vec::new(),
            additions: Vec::new(),
        }
    }

    /// Folds a later summary into this one: the lowest fork height and the
    /// latest peak win.
    pub fn merge(mut self, later: StateChangeSummary) -> Self {
        self.fork_height = match (self.fork_height, later.fork_height) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };
        self.peak = later.peak;
        self.rolled_back_records.extend(later.rolled_back_records);
        self.removals.extend(later.removals);
        self.additions.extend(later.additions);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveBlockResult {
    pub outcome: AddBlockResult,
    pub error: Option<ConsensusErrorCode>,
    pub state_change: Option<StateChangeSummary>,
}

impl ReceiveBlockResult {
    fn outcome(outcome: AddBlockResult) -> Self {
        Self {
            outcome,
            error: None,
            state_change: None,
        }
    }

    fn invalid(code: ConsensusErrorCode) -> Self {
        Self {
            outcome: AddBlockResult::InvalidBlock,
            error: Some(code),
            state_change: None,
        }
    }
}

/// Durable block and coin storage with the canonical chain view.
///
/// Mutating calls are serialized by the caller; readers may run
/// concurrently with them.
#[async_trait]
pub trait ChainStore: BlockRecords + Send + Sync {
    fn has_block(&self, header_hash: &Bytes32) -> bool;

    async fn get_full_block(&self, header_hash: &Bytes32) -> Option<FullBlock>;

    fn get_peak(&self) -> Option<BlockRecord>;

    fn get_peak_height(&self) -> Option<Height> {
        self.get_peak().map(|peak| peak.height)
    }

    /// Canonical block hash at `height`.
    fn height_to_hash(&self, height: Height) -> Option<Bytes32>;

    async fn receive_block(
        &self,
        block: &FullBlock,
        result: &PreValidationResult,
        fork_hint: Option<Height>,
    ) -> Result<ReceiveBlockResult>;

    /// One result per block, in order. `None` when validation could not run.
    async fn pre_validate_blocks(&self, blocks: &[FullBlock]) -> Option<Vec<PreValidationResult>>;

    /// Loads the records above `fork_point` into the record cache.
    async fn warmup(&self, fork_point: Height) -> Result<()>;

    /// Drops cached records that fell out of the cache window below the peak.
    fn clean_block_records(&self);

    /// Canonical heights whose block included a sub-epoch summary, ascending.
    fn sub_epoch_summary_heights(&self) -> Vec<Height>;
}

#[derive(Default)]
struct ChainData {
    /// In-memory record cache; a subset of `durable_records`.
    records: HashMap<Bytes32, BlockRecord>,
    durable_records: HashMap<Bytes32, BlockRecord>,
    blocks: HashMap<Bytes32, FullBlock>,
    height_to_hash: HashMap<Height, Bytes32>,
    peak: Option<Bytes32>,
    coins: HashMap<Bytes32, CoinRecord>,
    ses_heights: Vec<Height>,
}

impl BlockRecords for ChainData {
    fn block_record(&self, header_hash: &Bytes32) -> Option<BlockRecord> {
        self.records
            .get(header_hash)
            .or_else(|| self.durable_records.get(header_hash))
            .cloned()
    }
}

impl ChainData {
    fn peak_record(&self) -> Option<BlockRecord> {
        self.peak.and_then(|hash| self.block_record(&hash))
    }
}

/// Coin set changes staged on top of the committed coin set.
#[derive(Default)]
struct CoinOverlay {
    changes: HashMap<Bytes32, Option<CoinRecord>>,
    removals: Vec<Bytes32>,
    additions: Vec<CoinRecord>,
}

impl CoinOverlay {
    fn get(&self, base: &HashMap<Bytes32, CoinRecord>, coin_id: &Bytes32) -> Option<CoinRecord> {
        match self.changes.get(coin_id) {
            Some(change) => change.clone(),
            None => base.get(coin_id).cloned(),
        }
    }

    fn rollback(&mut self, base: &HashMap<Bytes32, CoinRecord>, fork_height: Option<Height>) {
        for (coin_id, record) in base {
            let above_fork = |height: Height| fork_height.map_or(true, |fork| height > fork);
            if above_fork(record.confirmed_block_index) {
                self.changes.insert(*coin_id, None);
            } else if record.spent_block_index.is_some_and(above_fork) {
                let mut unspent = record.clone();
                unspent.spent_block_index = None;
                self.changes.insert(*coin_id, Some(unspent));
            }
        }
    }

    fn apply(
        &mut self,
        base: &HashMap<Bytes32, CoinRecord>,
        block: &FullBlock,
    ) -> Result<(), ConsensusErrorCode> {
        let Some(info) = &block.transactions_info else {
            return Ok(());
        };
        let height = block.height();

        for coin in &info.additions {
            let record = CoinRecord {
                coin: coin.clone(),
                confirmed_block_index: height,
                spent_block_index: None,
            };
            self.changes.insert(coin.name(), Some(record.clone()));
            self.additions.push(record);
        }

        for coin_id in &info.removals {
            let mut record = self
                .get(base, coin_id)
                .ok_or(ConsensusErrorCode::UnknownUnspent)?;
            if record.is_spent() {
                return Err(ConsensusErrorCode::DoubleSpend);
            }
            record.spent_block_index = Some(height);
            self.changes.insert(*coin_id, Some(record));
            self.removals.push(*coin_id);
        }

        Ok(())
    }
}

/// In-memory chain state store.
pub struct Blockchain {
    constants: ConsensusConstants,
    validator: Arc<dyn ProofValidator>,
    data: RwLock<ChainData>,
}

impl Blockchain {
    pub fn new(constants: ConsensusConstants, validator: Arc<dyn ProofValidator>) -> Self {
        Self {
            constants,
            validator,
            data: RwLock::new(ChainData::default()),
        }
    }

    pub fn constants(&self) -> &ConsensusConstants {
        &self.constants
    }

    pub fn get_coin_record(&self, coin_id: &Bytes32) -> Option<CoinRecord> {
        self.data.read().coins.get(coin_id).cloned()
    }

    pub fn get_unspent_coins_by_puzzle_hash(&self, puzzle_hash: &Bytes32) -> Vec<Coin> {
        let data = self.data.read();
        let mut coins: Vec<_> = data
            .coins
            .values()
            .filter(|record| !record.is_spent() && record.coin.puzzle_hash == *puzzle_hash)
            .map(|record| record.coin.clone())
            .collect();
        coins.sort_by_key(Coin::name);
        coins
    }

    /// Number of records currently held by the record cache.
    pub fn cached_record_count(&self) -> usize {
        self.data.read().records.len()
    }

    /// Blocks between the fork point and `tip`, oldest first. `tip` itself is
    /// not yet stored.
    fn branch_above(
        data: &ChainData,
        tip: &FullBlock,
        fork_height: Option<Height>,
    ) -> Option<Vec<FullBlock>> {
        let mut branch = vec![tip.clone()];
        let mut prev_hash = tip.prev_header_hash();
        let mut height = tip.height();
        while height > 0 && fork_height.map_or(true, |fork| height - 1 > fork) {
            let block = data.blocks.get(&prev_hash)?;
            prev_hash = block.prev_header_hash();
            height = block.height();
            branch.push(block.clone());
        }
        branch.reverse();
        Some(branch)
    }

    fn connect_peak(
        data: &mut ChainData,
        block: &FullBlock,
        record: &BlockRecord,
        fork_height: Option<Height>,
    ) -> Result<StateChangeSummary, ConsensusErrorCode> {
        let branch = Self::branch_above(data, block, fork_height)
            .ok_or(ConsensusErrorCode::InvalidPrevBlockHash)?;

        let mut overlay = CoinOverlay::default();
        let old_peak_height = data.peak_record().map(|peak| peak.height);
        let reorg = old_peak_height.is_some_and(|old| fork_height.map_or(true, |fork| fork < old));
        if reorg {
            overlay.rollback(&data.coins, fork_height);
        }
        for connected in &branch {
            overlay.apply(&data.coins, connected)?;
        }

        let first_new_height = fork_height.map_or(0, |fork| fork + 1);
        let reconnected: HashSet<Bytes32> = branch.iter().map(FullBlock::header_hash).collect();
        let mut rolled_back_records = Vec::new();
        if let Some(old_peak_height) = old_peak_height {
            for height in first_new_height..=old_peak_height {
                let Some(hash) = data.height_to_hash.remove(&height) else {
                    continue;
                };
                if reconnected.contains(&hash) {
                    continue;
                }
                if let Some(old) = data.block_record(&hash) {
                    rolled_back_records.push(old);
                }
            }
        }

        data.ses_heights.retain(|height| *height < first_new_height);
        for connected in &branch {
            let hash = connected.header_hash();
            data.height_to_hash.insert(connected.height(), hash);
            let included = if hash == record.header_hash {
                record.sub_epoch_summary_included.is_some()
            } else {
                data.block_record(&hash)
                    .is_some_and(|r| r.sub_epoch_summary_included.is_some())
            };
            if included {
                data.ses_heights.push(connected.height());
            }
        }

        for (coin_id, change) in overlay.changes {
            match change {
                Some(coin) => data.coins.insert(coin_id, coin),
                None => data.coins.remove(&coin_id),
            };
        }
        data.peak = Some(record.header_hash);

        Ok(StateChangeSummary {
            peak: record.clone(),
            fork_height,
            rolled_back_records,
            removals: overlay.removals,
            additions: overlay.additions,
        })
    }
}

impl BlockRecords for Blockchain {
    fn block_record(&self, header_hash: &Bytes32) -> Option<BlockRecord> {
        self.data.read().block_record(header_hash)
    }
}

#[async_trait]
impl ChainStore for Blockchain {
    fn has_block(&self, header_hash: &Bytes32) -> bool {
        self.data.read().blocks.contains_key(header_hash)
    }

    async fn get_full_block(&self, header_hash: &Bytes32) -> Option<FullBlock> {
        self.data.read().blocks.get(header_hash).cloned()
    }

    fn get_peak(&self) -> Option<BlockRecord> {
        self.data.read().peak_record()
    }

    fn height_to_hash(&self, height: Height) -> Option<Bytes32> {
        self.data.read().height_to_hash.get(&height).copied()
    }

    async fn receive_block(
        &self,
        block: &FullBlock,
        result: &PreValidationResult,
        fork_hint: Option<Height>,
    ) -> Result<ReceiveBlockResult> {
        let header_hash = block.header_hash();
        let mut data = self.data.write();

        if data.blocks.contains_key(&header_hash) {
            return Ok(ReceiveBlockResult::outcome(AddBlockResult::AlreadyHaveBlock));
        }
        if let Some(code) = result.error {
            return Ok(ReceiveBlockResult::invalid(code));
        }

        let prev = if block.height() == 0 {
            None
        } else {
            match data.block_record(&block.prev_header_hash()) {
                Some(prev) => Some(prev),
                None => {
                    return Ok(ReceiveBlockResult::outcome(AddBlockResult::DisconnectedBlock));
                }
            }
        };
        if let Some(prev) = &prev {
            if block.height() != prev.height + 1 {
                return Ok(ReceiveBlockResult::invalid(ConsensusErrorCode::InvalidHeight));
            }
            if block.weight() <= prev.weight {
                return Ok(ReceiveBlockResult::invalid(ConsensusErrorCode::InvalidWeight));
            }
        }

        let required_iters = result
            .required_iters
            .ok_or_else(|| anyhow!("valid pre-validation result without required iters"))?;
        let record = block_to_block_record(
            &self.constants,
            &*data,
            block,
            required_iters,
            prev.as_ref(),
        );

        let peak = data.peak_record();
        let heavier = peak.as_ref().map_or(true, |peak| record.weight > peak.weight);
        if !heavier {
            data.durable_records.insert(header_hash, record.clone());
            data.records.insert(header_hash, record);
            data.blocks.insert(header_hash, block.clone());
            debug!(height = block.height(), "Block added as orphan");
            return Ok(ReceiveBlockResult::outcome(AddBlockResult::AddedAsOrphan));
        }

        let fork_height = match (&peak, fork_hint) {
            (None, _) => None,
            (Some(peak), _) if peak.header_hash == record.prev_hash => Some(peak.height),
            (Some(peak), Some(hint)) if hint <= peak.height && hint < record.height => Some(hint),
            (Some(peak), _) => match &prev {
                Some(prev) => find_fork_point(&*data, peak, prev),
                None => None,
            },
        };

        match Self::connect_peak(&mut data, block, &record, fork_height) {
            Ok(state_change) => {
                data.durable_records.insert(header_hash, record.clone());
                data.records.insert(header_hash, record);
                data.blocks.insert(header_hash, block.clone());
                if !state_change.rolled_back_records.is_empty() {
                    info!(
                        height = block.height(),
                        fork_height = ?fork_height,
                        rolled_back = state_change.rolled_back_records.len(),
                        "Chain reorganized"
                    );
                }
                Ok(ReceiveBlockResult {
                    outcome: AddBlockResult::NewPeak,
                    error: None,
                    state_change: Some(state_change),
                })
            }
            Err(code) => {
                warn!(height = block.height(), ?code, "Block failed coin set checks");
                Ok(ReceiveBlockResult::invalid(code))
            }
        }
    }

    async fn pre_validate_blocks(&self, blocks: &[FullBlock]) -> Option<Vec<PreValidationResult>> {
        let mut provisional: HashMap<Bytes32, BlockRecord> = HashMap::new();
        let mut tasks = Vec::with_capacity(blocks.len());

        for block in blocks {
            let prev_hash = block.prev_header_hash();
            let prev = if block.height() == 0 {
                None
            } else {
                match provisional
                    .get(&prev_hash)
                    .cloned()
                    .or_else(|| self.block_record(&prev_hash))
                {
                    Some(prev) => Some(prev),
                    None => {
                        tasks.push(None);
                        continue;
                    }
                }
            };

            let validator = self.validator.clone();
            let owned = block.clone();
            let prev_for_task = prev.clone();
            tasks.push(Some(tokio::task::spawn_blocking(move || {
                validator.validate_block(&owned, prev_for_task.as_ref())
            })));

            let record = {
                let data = self.data.read();
                block_to_block_record(&self.constants, &*data, block, 0, prev.as_ref())
            };
            provisional.insert(record.header_hash, record);
        }

        let outcomes = futures::future::join_all(tasks.into_iter().map(|task| async move {
            match task {
                None => Ok(PreValidationResult::invalid(
                    ConsensusErrorCode::InvalidPrevBlockHash,
                )),
                Some(handle) => handle.await,
            }
        }))
        .await;
        outcomes
            .into_iter()
            .map(|outcome| {
                outcome
                    .inspect_err(|err| warn!(%err, "Block pre-validation task failed"))
                    .ok()
            })
            .collect()
    }

    async fn warmup(&self, fork_point: Height) -> Result<()> {
        let mut data = self.data.write();
        let Some(peak) = data.peak_record() else {
            return Ok(());
        };
        let start = fork_point.saturating_sub(self.constants.blocks_cache_size);
        let mut loaded = 0usize;
        for height in start..=peak.height {
            let Some(hash) = data.height_to_hash.get(&height).copied() else {
                continue;
            };
            let record = data
                .durable_records
                .get(&hash)
                .cloned()
                .ok_or_else(|| anyhow!("canonical block {hash} at height {height} has no record"))?;
            if data.records.insert(hash, record).is_none() {
                loaded += 1;
            }
        }
        debug!(fork_point, loaded, "Record cache warmed up");
        Ok(())
    }

    fn clean_block_records(&self) {
        let mut data = self.data.write();
        let Some(peak) = data.peak_record() else {
            return;
        };
        let Some(floor) = peak.height.checked_sub(self.constants.blocks_cache_size) else {
            return;
        };
        data.records.retain(|_, record| record.height >= floor);
    }

    fn sub_epoch_summary_heights(&self) -> Vec<Height> {
        self.data.read().ses_heights.clone()
    }
}

/// Header hashes of the canonical chain, genesis first. Test and debugging
/// aid.
pub fn canonical_chain(store: &dyn ChainStore) -> Vec<Bytes32> {
    let Some(peak) = store.get_peak_height() else {
        return Vec::new();
    };
    (0..=peak)
        .map_while(|height| store.height_to_hash(height))
        .collect()
}
