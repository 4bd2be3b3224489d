use std::sync::Arc;

use async_trait::async_trait;
use containers::{
    Bytes32, ConsensusError, ConsensusErrorCode, FullBlock, Height, PreValidationResult,
    WeightProof,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::block_cache::{BadPeakCache, UnfinishedBlockCache};
use crate::store::{AddBlockResult, ChainStore, StateChangeSummary};

/// Where a block came from; used to re-fetch it once when its generator
/// cannot be recovered locally.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn fetch_block(&self, height: Height, include_transactions: bool) -> Option<FullBlock>;
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("generator for block {header_hash} is not available")]
    GeneratorUnavailable { header_hash: Bytes32 },
    #[error("pre-validation of block {header_hash} did not complete")]
    PreValidationFailed { header_hash: Bytes32 },
    /// The parent of a batch block is unknown. Not evidence against the
    /// block itself.
    #[error("block {header_hash} at height {height} does not connect to the chain")]
    Disconnected { header_hash: Bytes32, height: Height },
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error("chain store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl AdmissionError {
    pub fn consensus_code(&self) -> Option<ConsensusErrorCode> {
        match self {
            AdmissionError::Consensus(err) => Some(err.code),
            _ => None,
        }
    }

    fn disconnected(block: &FullBlock) -> Self {
        AdmissionError::Disconnected {
            header_hash: block.header_hash(),
            height: block.height(),
        }
    }
}

/// Result of a successful admission call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub result: AddBlockResult,
    pub state_change: Option<StateChangeSummary>,
}

impl Admitted {
    fn outcome(result: AddBlockResult) -> Self {
        Self {
            result,
            state_change: None,
        }
    }

    pub fn is_new_peak(&self) -> bool {
        self.result == AddBlockResult::NewPeak
    }
}

/// Result of admitting a batch of consecutive blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchAdmitted {
    pub added: usize,
    pub state_change: Option<StateChangeSummary>,
}

/// The block whose generator later blocks may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorRef {
    pub height: Height,
    pub header_hash: Bytes32,
}

/// Validates and commits candidate blocks. Every chain mutation goes
/// through the single mutation lock held here.
pub struct BlockAdmission {
    store: Arc<dyn ChainStore>,
    lock: tokio::sync::Mutex<()>,
    unfinished: Arc<Mutex<UnfinishedBlockCache>>,
    previous_generator: Mutex<Option<GeneratorRef>>,
    bad_peaks: Mutex<BadPeakCache>,
}

impl BlockAdmission {
    pub fn new(store: Arc<dyn ChainStore>, unfinished: Arc<Mutex<UnfinishedBlockCache>>) -> Self {
        Self {
            store,
            lock: tokio::sync::Mutex::new(()),
            unfinished,
            previous_generator: Mutex::new(None),
            bad_peaks: Mutex::new(BadPeakCache::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    pub fn previous_generator(&self) -> Option<GeneratorRef> {
        *self.previous_generator.lock()
    }

    pub fn in_bad_peak_cache(&self, proof: &WeightProof) -> bool {
        self.bad_peaks.lock().in_weight_proof(proof)
    }

    pub fn add_to_bad_peak_cache(&self, header_hash: Bytes32, height: Height) {
        self.bad_peaks.lock().add(header_hash, height);
    }

    /// Holds the chain mutation lock for the lifetime of the guard.
    pub async fn lock_chain(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Copies the generator of the cached unfinished block into `block`.
    fn splice_generator(&self, block: &mut FullBlock) -> Option<PreValidationResult> {
        let cache = self.unfinished.lock();
        let entry = cache.get(&block.unfinished_reward_hash())?;
        if entry.block.foliage.foliage_transaction_block_hash
            != block.foliage.foliage_transaction_block_hash
        {
            return None;
        }
        block.transactions_generator = entry.block.transactions_generator.clone();
        block.transactions_generator_ref_list = entry.block.transactions_generator_ref_list.clone();
        Some(entry.result.clone())
    }

    fn record_invalid(&self, block: &FullBlock) {
        let peak_height = self.store.get_peak_height().unwrap_or_default();
        if block.height() >= peak_height {
            self.add_to_bad_peak_cache(block.header_hash(), block.height());
        }
    }

    fn track_generator(&self, block: &FullBlock, state_change: &StateChangeSummary) {
        let mut previous = self.previous_generator.lock();
        if let Some(reference) = *previous {
            if state_change.fork_height.map_or(true, |fork| fork < reference.height) {
                debug!(height = reference.height, "Dropping previous generator after reorg");
                *previous = None;
            }
        }
        if previous.is_none() && block.transactions_generator.is_some() {
            *previous = Some(GeneratorRef {
                height: block.height(),
                header_hash: block.header_hash(),
            });
        }
    }

    /// Validates `block` and commits it to the chain.
    ///
    /// A transaction block that arrives without its generator takes it from
    /// the unfinished block cache, or is re-fetched once from `origin`.
    pub async fn add_block(
        &self,
        mut block: FullBlock,
        origin: Option<&dyn BlockSource>,
        fork_hint: Option<Height>,
    ) -> Result<Admitted, AdmissionError> {
        let header_hash = block.header_hash();
        if self.store.has_block(&header_hash) {
            return Ok(Admitted::outcome(AddBlockResult::AlreadyHaveBlock));
        }

        let mut cached_result = None;
        let mut refetched = false;
        while block.is_missing_generator() {
            if let Some(result) = self.splice_generator(&mut block) {
                cached_result = Some(result);
                break;
            }
            let fetched = match origin {
                Some(origin) if !refetched => origin.fetch_block(block.height(), true).await,
                _ => None,
            };
            refetched = true;
            match fetched {
                Some(fetched) if fetched.foliage == block.foliage => {
                    debug!(height = block.height(), "Re-fetched block to recover generator");
                    block = fetched;
                }
                _ => return Err(AdmissionError::GeneratorUnavailable { header_hash }),
            }
        }

        let _guard = self.lock.lock().await;
        if self.store.has_block(&header_hash) {
            return Ok(Admitted::outcome(AddBlockResult::AlreadyHaveBlock));
        }

        let mut result = self
            .store
            .pre_validate_blocks(std::slice::from_ref(&block))
            .await
            .and_then(|results| results.into_iter().next())
            .ok_or(AdmissionError::PreValidationFailed { header_hash })?;

        if let Some(code) = result.error {
            if code == ConsensusErrorCode::InvalidPrevBlockHash {
                debug!(height = block.height(), "Block does not connect");
                return Ok(Admitted::outcome(AddBlockResult::DisconnectedBlock));
            }
            warn!(height = block.height(), ?code, "Block failed pre-validation");
            self.record_invalid(&block);
            return Err(ConsensusError::new(code, header_hash).into());
        }
        if let Some(cached) = cached_result {
            result.cost = cached.cost.or(result.cost);
        }

        let received = self.store.receive_block(&block, &result, fork_hint).await?;
        match received.outcome {
            AddBlockResult::InvalidBlock => {
                let code = received.error.unwrap_or(ConsensusErrorCode::Unknown);
                warn!(height = block.height(), ?code, "Block rejected");
                self.record_invalid(&block);
                Err(ConsensusError::new(code, header_hash).into())
            }
            AddBlockResult::NewPeak => {
                if let Some(state_change) = &received.state_change {
                    self.track_generator(&block, state_change);
                }
                info!(
                    height = block.height(),
                    weight = %block.weight(),
                    header_hash = %header_hash,
                    "New peak"
                );
                Ok(Admitted {
                    result: AddBlockResult::NewPeak,
                    state_change: received.state_change,
                })
            }
            outcome => Ok(Admitted::outcome(outcome)),
        }
    }

    /// Admits consecutive blocks: validated in parallel, committed in order
    /// under one hold of the mutation lock. Any failure aborts the rest; a
    /// block whose parent is unknown aborts with
    /// [`AdmissionError::Disconnected`] and is not recorded as a bad peak.
    pub async fn add_block_batch(
        &self,
        blocks: Vec<FullBlock>,
        fork_hint: Option<Height>,
    ) -> Result<BatchAdmitted, AdmissionError> {
        let known = blocks
            .iter()
            .take_while(|block| self.store.has_block(&block.header_hash()))
            .count();
        let blocks = &blocks[known..];
        if blocks.is_empty() {
            return Ok(BatchAdmitted::default());
        }

        let results = self.store.pre_validate_blocks(blocks).await.ok_or(
            AdmissionError::PreValidationFailed {
                header_hash: blocks[0].header_hash(),
            },
        )?;
        if let Some((block, code)) = blocks
            .iter()
            .zip(&results)
            .find_map(|(block, result)| result.error.map(|code| (block, code)))
        {
            if code == ConsensusErrorCode::InvalidPrevBlockHash {
                debug!(height = block.height(), "Batch block does not connect");
                return Err(AdmissionError::disconnected(block));
            }
            warn!(height = block.height(), ?code, "Batch block failed pre-validation");
            self.record_invalid(block);
            return Err(ConsensusError::new(code, block.header_hash()).into());
        }

        let _guard = self.lock.lock().await;
        let mut admitted = BatchAdmitted::default();
        for (block, result) in blocks.iter().zip(&results) {
            let received = self.store.receive_block(block, result, fork_hint).await?;
            match received.outcome {
                AddBlockResult::DisconnectedBlock => {
                    debug!(height = block.height(), "Batch block does not connect");
                    return Err(AdmissionError::disconnected(block));
                }
                AddBlockResult::InvalidBlock => {
                    let code = received.error.unwrap_or(ConsensusErrorCode::Unknown);
                    warn!(height = block.height(), ?code, "Batch block rejected");
                    self.record_invalid(block);
                    return Err(ConsensusError::new(code, block.header_hash()).into());
                }
                AddBlockResult::NewPeak => {
                    if let Some(state_change) = received.state_change {
                        self.track_generator(block, &state_change);
                        admitted.state_change = Some(match admitted.state_change.take() {
                            Some(earlier) => earlier.merge(state_change),
                            None => state_change,
                        });
                    }
                    admitted.added += 1;
                }
                AddBlockResult::AddedAsOrphan => admitted.added += 1,
                AddBlockResult::AlreadyHaveBlock => {}
            }
        }

        debug!(
            added = admitted.added,
            start = blocks[0].height(),
            end = blocks[blocks.len() - 1].height(),
            "Block batch committed"
        );
        Ok(admitted)
    }
}
