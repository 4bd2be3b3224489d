/// Caches kept beside the chain: unfinished blocks waiting for their
/// infusion point, and peaks known to be invalid.
use std::collections::{BTreeMap, HashMap, HashSet};

use containers::{Bytes32, Height, PreValidationResult, UnfinishedBlock, WeightProof};

/// Maximum number of invalid peaks remembered.
pub const BAD_PEAK_CACHE_SIZE: usize = 1_000;

/// A validated unfinished block and the height it will occupy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfinishedEntry {
    pub height: Height,
    pub block: UnfinishedBlock,
    pub result: PreValidationResult,
}

/// Unfinished blocks keyed by the hash of their unfinished reward chain
/// block.
///
/// The first block seen for a key is kept. Entries leave the cache when
/// their block is completed or when they fall below the rolling height
/// floor.
#[derive(Debug, Default, Clone)]
pub struct UnfinishedBlockCache {
    entries: HashMap<Bytes32, UnfinishedEntry>,
    /// Raw hashes of unfinished blocks already processed.
    seen: HashSet<Bytes32>,
}

impl UnfinishedBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when an entry with the same reward chain hash exists.
    pub fn add(&mut self, height: Height, block: UnfinishedBlock, result: PreValidationResult) -> bool {
        let key = block.partial_hash();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            UnfinishedEntry {
                height,
                block,
                result,
            },
        );
        true
    }

    pub fn get(&self, reward_chain_hash: &Bytes32) -> Option<&UnfinishedEntry> {
        self.entries.get(reward_chain_hash)
    }

    pub fn contains(&self, reward_chain_hash: &Bytes32) -> bool {
        self.entries.contains_key(reward_chain_hash)
    }

    /// Marks `raw_hash` as seen; returns whether it had been seen before.
    pub fn seen(&mut self, raw_hash: Bytes32) -> bool {
        !self.seen.insert(raw_hash)
    }

    pub fn clear_seen(&mut self) {
        self.seen.clear();
    }

    pub fn remove(&mut self, reward_chain_hash: &Bytes32) -> Option<UnfinishedEntry> {
        self.entries.remove(reward_chain_hash)
    }

    /// Drops entries strictly below `height`.
    pub fn clear_below(&mut self, height: Height) {
        self.entries.retain(|_, entry| entry.height >= height);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Header hashes of peaks that failed validation, with their heights.
/// The lowest entries are evicted first once full.
#[derive(Debug, Default, Clone)]
pub struct BadPeakCache {
    by_hash: HashMap<Bytes32, Height>,
    by_height: BTreeMap<Height, HashSet<Bytes32>>,
}

impl BadPeakCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, header_hash: Bytes32, height: Height) {
        if self.by_hash.insert(header_hash, height).is_some() {
            return;
        }
        self.by_height.entry(height).or_default().insert(header_hash);

        while self.by_hash.len() > BAD_PEAK_CACHE_SIZE {
            let Some(mut lowest) = self.by_height.first_entry() else {
                break;
            };
            let evicted: Vec<_> = lowest.get().iter().copied().collect();
            for hash in &evicted {
                self.by_hash.remove(hash);
            }
            lowest.remove();
        }
    }

    pub fn contains(&self, header_hash: &Bytes32) -> bool {
        self.by_hash.contains_key(header_hash)
    }

    /// Whether any block of the proof's recent chain is a known bad peak.
    pub fn in_weight_proof(&self, proof: &WeightProof) -> bool {
        proof
            .recent_chain_data
            .iter()
            .any(|header| self.contains(&header.header_hash()))
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}
