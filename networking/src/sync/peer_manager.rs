/// Peer manager for sync operations.
///
/// Tracks the peak each peer has announced, which peers are known to hold a
/// given block, and the per-peer short sync bookkeeping.
use std::collections::{HashMap, HashSet, VecDeque};

use containers::{Bytes32, Height, Weight};
use libp2p_identity::PeerId;
use tracing::debug;

use super::config::MAX_PEAK_INDEX_ENTRIES;

/// A peak announced by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeakClaim {
    pub header_hash: Bytes32,
    pub height: Height,
    pub weight: Weight,
}

/// Sync-specific peer state.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    pub peak: Option<PeakClaim>,
    /// Sequence number of the latest peak registration.
    pub registered_seq: u64,
    pub backtracks: u32,
    pub batch_syncing: bool,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            peak: None,
            registered_seq: 0,
            backtracks: 0,
            batch_syncing: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.peak.is_none() && self.backtracks == 0 && !self.batch_syncing
    }
}

/// Peer manager for sync operations.
#[derive(Debug, Default, Clone)]
pub struct PeerManager {
    peers: HashMap<PeerId, SyncPeer>,
    peak_index: HashMap<Bytes32, (PeakClaim, HashSet<PeerId>)>,
    /// Indexed hashes, oldest first.
    index_order: VecDeque<Bytes32>,
    next_seq: u64,
    peers_changed: bool,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&SyncPeer> {
        self.peers.get(peer_id)
    }

    fn index(&mut self, peer_id: PeerId, claim: &PeakClaim) {
        if let Some((_, peers)) = self.peak_index.get_mut(&claim.header_hash) {
            peers.insert(peer_id);
            return;
        }
        self.peak_index.insert(
            claim.header_hash,
            (claim.clone(), HashSet::from([peer_id])),
        );
        self.index_order.push_back(claim.header_hash);
        while self.index_order.len() > MAX_PEAK_INDEX_ENTRIES {
            if let Some(evicted) = self.index_order.pop_front() {
                self.peak_index.remove(&evicted);
            }
        }
    }

    /// Records `claim` as the peer's current peak.
    pub fn register_peak(&mut self, peer_id: PeerId, claim: PeakClaim) {
        self.index(peer_id, &claim);
        self.next_seq += 1;
        let seq = self.next_seq;
        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id));
        peer.peak = Some(claim);
        peer.registered_seq = seq;
    }

    /// Notes that the peer holds `claim` without changing its declared peak.
    pub fn mark_peer_has_block(&mut self, peer_id: PeerId, claim: PeakClaim) {
        self.index(peer_id, &claim);
    }

    /// The heaviest declared peak; the earliest registration wins ties.
    pub fn heaviest_known_peak(&self) -> Option<PeakClaim> {
        self.peers
            .values()
            .filter_map(|peer| peer.peak.as_ref().map(|peak| (peak, peer.registered_seq)))
            .max_by(|(a, a_seq), (b, b_seq)| a.weight.cmp(&b.weight).then(b_seq.cmp(a_seq)))
            .map(|(peak, _)| peak.clone())
    }

    pub fn peers_with_peak(&self, header_hash: &Bytes32) -> HashSet<PeerId> {
        self.peak_index
            .get(header_hash)
            .map(|(_, peers)| peers.clone())
            .unwrap_or_default()
    }

    pub fn peers_that_have_peaks<'a>(
        &self,
        header_hashes: impl IntoIterator<Item = &'a Bytes32>,
    ) -> HashSet<PeerId> {
        header_hashes
            .into_iter()
            .filter_map(|hash| self.peak_index.get(hash))
            .flat_map(|(_, peers)| peers.iter().copied())
            .collect()
    }

    /// Hashes of every declared peak.
    pub fn declared_peaks(&self) -> Vec<Bytes32> {
        self.peers
            .values()
            .filter_map(|peer| peer.peak.as_ref().map(|peak| peak.header_hash))
            .collect()
    }

    pub fn try_begin_backtrack(&mut self, peer_id: PeerId, limit: u32) -> bool {
        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id));
        if peer.backtracks >= limit {
            return false;
        }
        peer.backtracks += 1;
        true
    }

    pub fn end_backtrack(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.backtracks = peer.backtracks.saturating_sub(1);
        }
    }

    pub fn is_backtrack_syncing(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|peer| peer.backtracks > 0)
    }

    pub fn try_begin_batch(&mut self, peer_id: PeerId) -> bool {
        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id));
        if peer.batch_syncing {
            return false;
        }
        peer.batch_syncing = true;
        true
    }

    pub fn end_batch(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.batch_syncing = false;
        }
    }

    pub fn is_batch_syncing(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|peer| peer.batch_syncing)
    }

    pub fn peer_disconnected(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
        for (_, peers) in self.peak_index.values_mut() {
            peers.remove(peer_id);
        }
        self.peers_changed = true;
        debug!(peer = %peer_id, "Dropped sync state for peer");
    }

    /// Returns whether peers disconnected since the last call.
    pub fn take_peers_changed(&mut self) -> bool {
        std::mem::take(&mut self.peers_changed)
    }

    /// Forgets every declared peak and the hash index.
    pub fn clear_sync_info(&mut self) {
        for peer in self.peers.values_mut() {
            peer.peak = None;
        }
        self.peers.retain(|_, peer| !peer.is_idle());
        self.peak_index.clear();
        self.index_order.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
