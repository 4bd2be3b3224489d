use crate::sync::config::MAX_PEAK_INDEX_ENTRIES;
use crate::sync::{PeakClaim, PeerManager};
use containers::Bytes32;
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn claim(tag: u32, weight: u128) -> PeakClaim {
    PeakClaim {
        header_hash: Bytes32::sha256(&tag.to_le_bytes()),
        height: tag,
        weight,
    }
}

#[test]
fn test_heaviest_peak_prefers_weight() {
    let mut manager = PeerManager::new();
    manager.register_peak(PeerId::random(), claim(1, 100));
    manager.register_peak(PeerId::random(), claim(2, 300));
    manager.register_peak(PeerId::random(), claim(3, 200));

    assert_eq!(manager.heaviest_known_peak(), Some(claim(2, 300)));
}

#[test]
fn test_equal_weight_earliest_registration_wins() {
    let mut manager = PeerManager::new();
    for tag in 0..16 {
        manager.register_peak(PeerId::random(), claim(tag, 500));
    }

    assert_eq!(manager.heaviest_known_peak(), Some(claim(0, 500)));
}

#[test]
fn test_reregistration_moves_peer_to_back_of_ties() {
    let mut manager = PeerManager::new();
    let first = PeerId::random();
    manager.register_peak(first, claim(1, 500));
    manager.register_peak(PeerId::random(), claim(2, 500));
    manager.register_peak(first, claim(3, 500));

    assert_eq!(manager.heaviest_known_peak(), Some(claim(2, 500)));
}

#[test]
fn test_peers_indexed_by_hash() {
    let mut manager = PeerManager::new();
    let a = PeerId::random();
    let b = PeerId::random();
    let c = PeerId::random();
    manager.register_peak(a, claim(1, 10));
    manager.register_peak(b, claim(2, 20));
    manager.mark_peer_has_block(c, claim(1, 10));

    let with_one = manager.peers_with_peak(&claim(1, 10).header_hash);
    assert!(with_one.contains(&a) && with_one.contains(&c));
    assert!(!with_one.contains(&b));

    let hashes = [claim(1, 10).header_hash, claim(2, 20).header_hash];
    assert_eq!(manager.peers_that_have_peaks(&hashes).len(), 3);

    // Corroboration does not change the declared peak.
    assert!(manager.get_peer(&c).is_none());
}

#[test]
fn test_peak_index_is_bounded() {
    let mut manager = PeerManager::new();
    let peer = PeerId::random();
    for tag in 0..=MAX_PEAK_INDEX_ENTRIES as u32 {
        manager.mark_peer_has_block(peer, claim(tag, 1));
    }

    assert!(manager.peers_with_peak(&claim(0, 1).header_hash).is_empty());
    assert!(manager.peers_with_peak(&claim(1, 1).header_hash).contains(&peer));
}

#[rstest]
#[case(1)]
#[case(3)]
fn test_backtrack_counter_is_bounded(#[case] limit: u32) {
    let mut manager = PeerManager::new();
    let peer = PeerId::random();
    for _ in 0..limit {
        assert!(manager.try_begin_backtrack(peer, limit));
    }
    assert!(!manager.try_begin_backtrack(peer, limit));
    assert!(manager.is_backtrack_syncing(&peer));

    for _ in 0..=limit {
        manager.end_backtrack(&peer);
    }
    assert!(!manager.is_backtrack_syncing(&peer));
    assert!(manager.try_begin_backtrack(peer, limit));
}

#[test]
fn test_batch_flag_is_exclusive() {
    let mut manager = PeerManager::new();
    let peer = PeerId::random();
    assert!(manager.try_begin_batch(peer));
    assert!(!manager.try_begin_batch(peer));
    manager.end_batch(&peer);
    assert!(!manager.is_batch_syncing(&peer));
    assert!(manager.try_begin_batch(peer));
}

#[test]
fn test_disconnect_drops_peer_and_flags_change() {
    let mut manager = PeerManager::new();
    let peer = PeerId::random();
    manager.register_peak(peer, claim(1, 10));
    assert!(!manager.take_peers_changed());

    manager.peer_disconnected(&peer);

    assert!(manager.get_peer(&peer).is_none());
    assert!(manager.peers_with_peak(&claim(1, 10).header_hash).is_empty());
    assert_eq!(manager.heaviest_known_peak(), None);
    assert!(manager.take_peers_changed());
    assert!(!manager.take_peers_changed());
}

#[test]
fn test_clear_sync_info_keeps_running_syncs() {
    let mut manager = PeerManager::new();
    let idle = PeerId::random();
    let batching = PeerId::random();
    manager.register_peak(idle, claim(1, 10));
    manager.register_peak(batching, claim(2, 20));
    assert!(manager.try_begin_batch(batching));

    manager.clear_sync_info();

    assert_eq!(manager.heaviest_known_peak(), None);
    assert!(manager.peers_with_peak(&claim(2, 20).header_hash).is_empty());
    assert!(manager.get_peer(&idle).is_none());
    assert!(manager.is_batch_syncing(&batching));
}
