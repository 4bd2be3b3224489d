/// Post-processing of a new peak: difficulty and sub-epoch bookkeeping, the
/// mempool and slot store updates, cache eviction, and announcements to
/// full nodes, timelords, wallets and farmers.
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chain::ConsensusConstants;
use containers::{
    BlockRecord, Bytes32, ConsensusErrorCode, EndOfSubSlotBundle, FullBlock, Height, NewPeak,
    NewPeakTimelord, NewPeakWallet, NewSignagePoint, NewSignagePointOrEndOfSubSlot,
    NewTransaction, NodeType, ProtocolMessage, SignagePoint, SubEpochSummary, Weight,
};
use fork_choice::{
    get_next_difficulty, get_next_sub_slot_iters, next_sub_epoch_summary, BlockRecords, ChainStore,
    StateChangeSummary, UnfinishedBlockCache,
};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::Broadcaster;

pub const CACHE_CLEAR_INTERVAL: u32 = 1_000;
pub const UNFINISHED_RETENTION: u32 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Peak height modulus at which the seen markers and stale caches are
    /// cleared.
    pub cache_clear_interval: u32,
    /// Unfinished blocks more than this many heights below the peak are
    /// dropped on each clear.
    pub unfinished_retention: u32,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            cache_clear_interval: CACHE_CLEAR_INTERVAL,
            unfinished_retention: UNFINISHED_RETENTION,
        }
    }
}

/// Notifications for local observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    NewPeak {
        header_hash: Bytes32,
        height: Height,
        weight: Weight,
        fork_height: Option<Height>,
    },
    SyncModeChanged(bool),
    BlockRejected {
        header_hash: Bytes32,
        code: ConsensusErrorCode,
    },
}

/// A transaction that entered the mempool when the peak moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolInclusion {
    pub transaction_id: Bytes32,
    pub cost: u64,
    pub fees: u64,
}

#[async_trait]
pub trait MempoolManager: Send + Sync {
    /// Re-evaluates pending transactions against the new peak and returns
    /// the ones newly included.
    async fn new_peak(&self, peak: &BlockRecord, spent_coin_ids: &[Bytes32]) -> Vec<MempoolInclusion>;
}

/// What the slot store resolved when told about a new peak.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPeakResult {
    pub added_eos: Option<EndOfSubSlotBundle>,
    /// Signage points that became valid, with their index in the sub-slot.
    pub new_signage_points: Vec<(u8, SignagePoint)>,
}

/// Sub-slot and signage point bookkeeping.
pub trait SlotStore: Send + Sync {
    fn new_peak(
        &self,
        peak: &BlockRecord,
        next_difficulty: u64,
        next_sub_slot_iters: u64,
        sub_epoch_summary: Option<&SubEpochSummary>,
        fork_ancestor: Option<&BlockRecord>,
    ) -> SlotPeakResult;

    fn new_signage_point(&self, index: u8, peak: &BlockRecord, signage_point: SignagePoint) -> bool;

    fn clear_old_cache_entries(&self);
}

fn signage_point_message(
    index: u8,
    signage_point: &SignagePoint,
    difficulty: u64,
    sub_slot_iters: u64,
) -> Option<(NewSignagePoint, NewSignagePointOrEndOfSubSlot)> {
    let (Some(cc), Some(rc)) = (&signage_point.cc_vdf, &signage_point.rc_vdf) else {
        return None;
    };
    Some((
        NewSignagePoint {
            challenge_hash: cc.challenge,
            challenge_chain_sp: cc.output,
            reward_chain_sp: rc.output,
            difficulty,
            sub_slot_iters,
            signage_point_index: index,
        },
        NewSignagePointOrEndOfSubSlot {
            prev_challenge_hash: None,
            challenge_hash: cc.challenge,
            index_from_challenge: index,
            last_rc_infusion: rc.challenge,
        },
    ))
}

/// Turns a committed peak into cache updates and announcements.
///
/// Runs outside the chain mutation lock. A failed broadcast is logged and the
/// remaining steps still run.
pub struct PeakPropagator {
    constants: ConsensusConstants,
    config: PropagationConfig,
    store: Arc<dyn ChainStore>,
    mempool: Arc<dyn MempoolManager>,
    slots: Arc<dyn SlotStore>,
    broadcaster: Arc<dyn Broadcaster>,
    unfinished: Arc<Mutex<UnfinishedBlockCache>>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl PeakPropagator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        constants: ConsensusConstants,
        config: PropagationConfig,
        store: Arc<dyn ChainStore>,
        mempool: Arc<dyn MempoolManager>,
        slots: Arc<dyn SlotStore>,
        broadcaster: Arc<dyn Broadcaster>,
        unfinished: Arc<Mutex<UnfinishedBlockCache>>,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            constants,
            config,
            store,
            mempool,
            slots,
            broadcaster,
            unfinished,
            events,
        }
    }

    pub fn emit(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            debug!("No event subscriber");
        }
    }

    async fn broadcast(&self, message: ProtocolMessage, node_type: NodeType, except: Option<PeerId>) {
        let description = message.to_string();
        let sent: Result<()> = match except {
            Some(peer_id) => {
                self.broadcaster
                    .send_to_all_except(message, node_type, peer_id)
                    .await
            }
            None => self.broadcaster.send_to_all(message, node_type).await,
        };
        if let Err(err) = sent {
            warn!(message = %description, ?node_type, %err, "Broadcast failed");
        }
    }

    fn wallet_message(peak: &BlockRecord, fork_height: Option<Height>) -> ProtocolMessage {
        ProtocolMessage::NewPeakWallet(NewPeakWallet {
            header_hash: peak.header_hash,
            height: peak.height,
            weight: peak.weight,
            fork_point_with_previous_peak: fork_height.unwrap_or_default(),
        })
    }

    fn timelord_message(
        &self,
        block: &FullBlock,
        record: &BlockRecord,
        difficulty: u64,
        sub_slot_iters: u64,
        sub_epoch_summary: Option<SubEpochSummary>,
    ) -> ProtocolMessage {
        let last_challenge_sb_or_eos_total_iters =
            if record.is_challenge_block(self.constants.min_blocks_per_challenge_block) {
                record.total_iters
            } else {
                record.ip_sub_slot_total_iters()
            };
        let passes_ses_height_but_not_yet_included =
            sub_epoch_summary.is_some() && record.sub_epoch_summary_included.is_none();
        ProtocolMessage::NewPeakTimelord(NewPeakTimelord {
            reward_chain_block: block.reward_chain_block.clone(),
            difficulty,
            deficit: record.deficit,
            sub_slot_iters,
            sub_epoch_summary,
            last_challenge_sb_or_eos_total_iters,
            passes_ses_height_but_not_yet_included,
        })
    }

    /// Propagates `block`, which the store has just made its peak.
    pub async fn on_new_peak(
        &self,
        block: &FullBlock,
        state_change: &StateChangeSummary,
        origin: Option<PeerId>,
        sync_mode: bool,
    ) {
        let record = &state_change.peak;
        let store = self.store.as_ref();

        let difficulty = get_next_difficulty(&self.constants, store, record);
        let sub_slot_iters = get_next_sub_slot_iters(&self.constants, record);
        let sub_epoch_summary = next_sub_epoch_summary(&self.constants, store, record);

        let reorg = record.height > 0 && state_change.fork_height != Some(record.height - 1);
        let fork_ancestor = if reorg {
            let ancestor = state_change
                .fork_height
                .and_then(|height| store.height_to_hash(height))
                .and_then(|hash| store.block_record(&hash));
            info!(
                height = record.height,
                fork_height = ?state_change.fork_height,
                "Peak reorganized the chain"
            );
            ancestor
        } else {
            None
        };

        let slot_result = self.slots.new_peak(
            record,
            difficulty,
            sub_slot_iters,
            sub_epoch_summary.as_ref(),
            fork_ancestor.as_ref(),
        );
        let own_signage_point = SignagePoint {
            cc_vdf: block.reward_chain_block.challenge_chain_sp_vdf.clone(),
            rc_vdf: block.reward_chain_block.reward_chain_sp_vdf.clone(),
        };
        if own_signage_point.is_complete() {
            self.slots.new_signage_point(
                record.signage_point_index,
                record,
                own_signage_point,
            );
        }

        let inclusions = self.mempool.new_peak(record, &state_change.removals).await;
        for inclusion in inclusions {
            let message = ProtocolMessage::NewTransaction(NewTransaction {
                transaction_id: inclusion.transaction_id,
                cost: inclusion.cost,
                fees: inclusion.fees,
            });
            self.broadcast(message, NodeType::FullNode, None).await;
        }

        if let Some(eos) = &slot_result.added_eos {
            let message = ProtocolMessage::NewSignagePointOrEndOfSubSlot(
                NewSignagePointOrEndOfSubSlot {
                    prev_challenge_hash: Some(eos.challenge_chain_end_of_slot_vdf.challenge),
                    challenge_hash: eos.challenge_chain_hash(),
                    index_from_challenge: 0,
                    last_rc_infusion: eos.reward_chain_end_of_slot_vdf.challenge,
                },
            );
            self.broadcast(message, NodeType::FullNode, None).await;
        }

        let interval = self.config.cache_clear_interval.max(1);
        if record.height % interval == 0 {
            let floor = record.height.saturating_sub(self.config.unfinished_retention);
            {
                let mut unfinished = self.unfinished.lock();
                unfinished.clear_seen();
                unfinished.clear_below(floor);
            }
            self.slots.clear_old_cache_entries();
            debug!(height = record.height, floor, "Cleared stale caches");
        }

        if !sync_mode {
            let timelord = self.timelord_message(
                block,
                record,
                difficulty,
                sub_slot_iters,
                sub_epoch_summary.clone(),
            );
            self.broadcast(timelord, NodeType::Timelord, None).await;

            let new_peak = ProtocolMessage::NewPeak(NewPeak {
                header_hash: record.header_hash,
                height: record.height,
                weight: record.weight,
                fork_point_with_previous_peak: state_change.fork_height.unwrap_or_default(),
                unfinished_reward_block_hash: block.unfinished_reward_hash(),
            });
            self.broadcast(new_peak, NodeType::FullNode, origin).await;
        }

        self.broadcast(
            Self::wallet_message(record, state_change.fork_height),
            NodeType::Wallet,
            None,
        )
        .await;

        for (index, signage_point) in &slot_result.new_signage_points {
            let Some((farmer, full_node)) =
                signage_point_message(*index, signage_point, difficulty, sub_slot_iters)
            else {
                continue;
            };
            self.broadcast(ProtocolMessage::NewSignagePoint(farmer), NodeType::Farmer, None)
                .await;
            self.broadcast(
                ProtocolMessage::NewSignagePointOrEndOfSubSlot(full_node),
                NodeType::FullNode,
                None,
            )
            .await;
        }

        self.emit(NodeEvent::NewPeak {
            header_hash: record.header_hash,
            height: record.height,
            weight: record.weight,
            fork_height: state_change.fork_height,
        });
    }

    /// Sends only the wallet announcement for the current peak.
    pub async fn send_peak_to_wallets(&self) {
        let Some(peak) = self.store.get_peak() else {
            return;
        };
        let fork_height = peak.height.checked_sub(1);
        self.broadcast(Self::wallet_message(&peak, fork_height), NodeType::Wallet, None)
            .await;
    }

    /// Re-announces the current peak to timelords.
    pub async fn send_peak_to_timelords(&self) {
        let Some(peak) = self.store.get_peak() else {
            return;
        };
        let Some(block) = self.store.get_full_block(&peak.header_hash).await else {
            return;
        };
        let store = self.store.as_ref();
        let difficulty = get_next_difficulty(&self.constants, store, &peak);
        let sub_slot_iters = get_next_sub_slot_iters(&self.constants, &peak);
        let sub_epoch_summary = next_sub_epoch_summary(&self.constants, store, &peak);
        let message =
            self.timelord_message(&block, &peak, difficulty, sub_slot_iters, sub_epoch_summary);
        self.broadcast(message, NodeType::Timelord, None).await;
    }
}
