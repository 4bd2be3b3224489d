use chain::ConsensusConstants;
use containers::{BlockRecord, Bytes32, FullBlock, Height, SubEpochSummary};

/// Read access to block records by header hash.
pub trait BlockRecords {
    fn block_record(&self, header_hash: &Bytes32) -> Option<BlockRecord>;
}

/// Height of the last block shared by the chains ending at `a` and `b`, or
/// `None` when they do not share a genesis.
pub fn find_fork_point<R: BlockRecords + ?Sized>(
    records: &R,
    a: &BlockRecord,
    b: &BlockRecord,
) -> Option<Height> {
    let mut a = a.clone();
    let mut b = b.clone();

    while a.header_hash != b.header_hash {
        if a.height == 0 && b.height == 0 {
            return None;
        }
        if a.height >= b.height {
            a = records.block_record(&a.prev_hash)?;
        } else {
            b = records.block_record(&b.prev_hash)?;
        }
    }

    Some(a.height)
}

/// Difficulty the block at `record` was mined at.
pub fn block_difficulty<R: BlockRecords + ?Sized>(records: &R, record: &BlockRecord) -> u64 {
    let weight = match records.block_record(&record.prev_hash) {
        Some(prev) if record.height > 0 => record.weight.saturating_sub(prev.weight),
        _ => record.weight,
    };
    u64::try_from(weight).unwrap_or(u64::MAX).max(1)
}

fn latest_timestamp<R: BlockRecords + ?Sized>(
    records: &R,
    from: &BlockRecord,
    max_steps: u32,
) -> Option<u64> {
    let mut curr = from.clone();
    for _ in 0..max_steps {
        if let Some(timestamp) = curr.timestamp {
            return Some(timestamp);
        }
        if curr.height == 0 {
            return None;
        }
        curr = records.block_record(&curr.prev_hash)?;
    }
    curr.timestamp
}

fn ancestor<R: BlockRecords + ?Sized>(
    records: &R,
    from: &BlockRecord,
    height: Height,
) -> Option<BlockRecord> {
    let mut curr = from.clone();
    while curr.height > height {
        curr = records.block_record(&curr.prev_hash)?;
    }
    Some(curr)
}

/// Difficulty for the block following `record`.
///
/// Difficulty only moves at epoch boundaries, scaled by how far the last
/// epoch's wall time missed its target and clamped by
/// `difficulty_change_max_factor`.
pub fn get_next_difficulty<R: BlockRecords + ?Sized>(
    constants: &ConsensusConstants,
    records: &R,
    record: &BlockRecord,
) -> u64 {
    let current = block_difficulty(records, record);
    if !constants.is_epoch_boundary(record.height) || record.height + 1 < constants.epoch_blocks {
        return current;
    }

    let epoch_start_height = record.height + 1 - constants.epoch_blocks;
    let Some(epoch_start) = ancestor(records, record, epoch_start_height) else {
        return current;
    };
    let lookback = constants.max_sub_slot_blocks;
    let (Some(last), Some(first)) = (
        latest_timestamp(records, record, lookback),
        latest_timestamp(records, &epoch_start, lookback),
    ) else {
        return current;
    };

    let actual = last.saturating_sub(first).max(1);
    let target = constants.epoch_time_target().max(1);
    let factor = constants.difficulty_change_max_factor.max(1);

    let scaled = (current as u128 * target as u128 / actual as u128) as u64;
    scaled
        .clamp(current / factor, current.saturating_mul(factor))
        .max(1)
}

pub fn get_next_sub_slot_iters(constants: &ConsensusConstants, record: &BlockRecord) -> u64 {
    if record.sub_slot_iters == 0 {
        constants.sub_slot_iters_starting
    } else {
        record.sub_slot_iters
    }
}

/// Summary to include in the block after `record`, when that block opens a
/// new sub-epoch.
pub fn next_sub_epoch_summary<R: BlockRecords + ?Sized>(
    constants: &ConsensusConstants,
    records: &R,
    record: &BlockRecord,
) -> Option<SubEpochSummary> {
    if !constants.is_sub_epoch_boundary(record.height) {
        return None;
    }

    let mut prev_subepoch_summary_hash = Bytes32::zero();
    let mut curr = record.clone();
    for _ in 0..constants.sub_epoch_blocks {
        if let Some(summary) = &curr.sub_epoch_summary_included {
            prev_subepoch_summary_hash = summary.get_hash();
            break;
        }
        if curr.height == 0 {
            break;
        }
        match records.block_record(&curr.prev_hash) {
            Some(prev) => curr = prev,
            None => break,
        }
    }

    let epoch = constants.is_epoch_boundary(record.height);
    Some(SubEpochSummary {
        prev_subepoch_summary_hash,
        reward_chain_hash: record.reward_infusion_new_challenge,
        num_blocks_overflow: 0,
        new_difficulty: epoch.then(|| get_next_difficulty(constants, records, record)),
        new_sub_slot_iters: epoch.then(|| get_next_sub_slot_iters(constants, record)),
    })
}

/// Consensus record for a validated block on top of `prev`.
pub fn block_to_block_record<R: BlockRecords + ?Sized>(
    constants: &ConsensusConstants,
    records: &R,
    block: &FullBlock,
    required_iters: u64,
    prev: Option<&BlockRecord>,
) -> BlockRecord {
    let first_in_sub_slot = !block.finished_sub_slots.is_empty();
    let full_deficit = constants.min_blocks_per_challenge_block.saturating_sub(1);

    let (deficit, sub_slot_iters, sub_epoch_summary_included) = match prev {
        None => (full_deficit, constants.sub_slot_iters_starting, None),
        Some(prev) => {
            let deficit = if prev.deficit == 0 && first_in_sub_slot {
                full_deficit
            } else {
                prev.deficit.saturating_sub(1)
            };
            (
                deficit,
                get_next_sub_slot_iters(constants, prev),
                next_sub_epoch_summary(constants, records, prev),
            )
        }
    };

    BlockRecord {
        header_hash: block.header_hash(),
        prev_hash: block.prev_header_hash(),
        height: block.height(),
        weight: block.weight(),
        total_iters: block.total_iters(),
        signage_point_index: block.reward_chain_block.signage_point_index,
        deficit,
        sub_slot_iters,
        required_iters,
        overflow: false,
        first_in_sub_slot,
        is_transaction_block: block.is_transaction_block(),
        reward_infusion_new_challenge: block.reward_chain_block.get_hash(),
        sub_epoch_summary_included,
        timestamp: block.transactions_info.as_ref().map(|info| info.timestamp),
    }
}
