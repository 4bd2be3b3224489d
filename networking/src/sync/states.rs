/// Sync service state machine and the shared session flags.
use containers::Height;
use parking_lot::Mutex;
use tracing::warn;

use super::peer_manager::PeakClaim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Following the network through gossip.
    #[default]
    Idle,

    /// Fetching a short run of blocks newest-first from one peer.
    Backtrack,

    /// Fetching consecutive windows from one peer and committing them in
    /// batches.
    Batch,

    /// Weight proof driven catch-up across many peers. Gossip blocks are
    /// ignored while this runs.
    LongSync,
}

impl SyncState {
    /// Short syncs never nest; every mode returns to `Idle` and only `Idle`
    /// or a failed short sync may escalate to `LongSync`.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        match self {
            SyncState::Idle => target != SyncState::Idle,
            SyncState::Backtrack | SyncState::Batch => {
                matches!(target, SyncState::Idle | SyncState::LongSync)
            }
            SyncState::LongSync => matches!(target, SyncState::Idle),
        }
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    sync_mode: bool,
    long_sync: bool,
    target: Option<PeakClaim>,
    fork_point: Option<Height>,
    state: SyncState,
}

/// Flags shared by everything that needs to know whether a long sync is
/// running.
#[derive(Debug, Default)]
pub struct SyncSession {
    inner: Mutex<SessionInner>,
}

impl SyncSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sync_mode(&self) -> bool {
        self.inner.lock().sync_mode
    }

    pub fn set_sync_mode(&self, sync_mode: bool) {
        self.inner.lock().sync_mode = sync_mode;
    }

    pub fn is_long_sync(&self) -> bool {
        self.inner.lock().long_sync
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    /// Enters a short sync mode. Returns `false` when another mode is
    /// already active; the caller still runs but leaves the state alone.
    pub fn enter(&self, target: SyncState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SyncState::Idle || !inner.state.can_transition_to(target) {
            return false;
        }
        inner.state = target;
        true
    }

    /// Returns to `Idle` if `state` is still the active mode.
    pub fn leave(&self, state: SyncState) {
        let mut inner = self.inner.lock();
        if inner.state == state && state != SyncState::LongSync {
            inner.state = SyncState::Idle;
        }
    }

    /// Claims the long sync slot. Returns `false` when one is already
    /// running.
    pub fn try_begin_long_sync(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.long_sync {
            return false;
        }
        inner.long_sync = true;
        inner.target = None;
        inner.fork_point = None;
        inner.state = SyncState::LongSync;
        true
    }

    pub fn target(&self) -> Option<PeakClaim> {
        self.inner.lock().target.clone()
    }

    pub fn set_target(&self, target: PeakClaim) {
        self.inner.lock().target = Some(target);
    }

    pub fn fork_point(&self) -> Option<Height> {
        self.inner.lock().fork_point
    }

    pub fn set_fork_point(&self, fork_point: Height) {
        self.inner.lock().fork_point = Some(fork_point);
    }

    /// Clears the long sync flags. Returns `false` when no long sync was
    /// running, so finalization happens once.
    pub fn finish(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.long_sync {
            return false;
        }
        inner.long_sync = false;
        inner.sync_mode = false;
        inner.target = None;
        inner.state = SyncState::Idle;
        true
    }
}

/// Clears the session when a long sync future is dropped before it could
/// finalize, e.g. when its task is aborted.
///
/// Dropping an armed guard clears the session flags and runs `on_abandon`.
/// It cannot await, so the final peak is not propagated; only a run that
/// ends through its cancellation token finalizes fully.
pub struct LongSyncGuard<'a, F: FnOnce()> {
    session: &'a SyncSession,
    on_abandon: Option<F>,
}

impl<'a, F: FnOnce()> LongSyncGuard<'a, F> {
    pub fn new(session: &'a SyncSession, on_abandon: F) -> Self {
        Self {
            session,
            on_abandon: Some(on_abandon),
        }
    }

    pub fn disarm(&mut self) {
        self.on_abandon = None;
    }
}

impl<F: FnOnce()> Drop for LongSyncGuard<'_, F> {
    fn drop(&mut self) {
        let Some(on_abandon) = self.on_abandon.take() else {
            return;
        };
        if self.session.finish() {
            warn!("Long sync dropped before finalization");
            on_abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_long_sync_is_exclusive() {
        let session = SyncSession::new();
        assert!(session.try_begin_long_sync());
        assert!(!session.try_begin_long_sync());
        assert_eq!(session.state(), SyncState::LongSync);

        assert!(session.finish());
        assert!(!session.finish());
        assert_eq!(session.state(), SyncState::Idle);
    }

    #[test]
    fn test_guard_clears_flags_on_drop() {
        let session = SyncSession::new();
        assert!(session.try_begin_long_sync());
        session.set_sync_mode(true);
        let abandoned = Cell::new(0);
        {
            let _guard = LongSyncGuard::new(&session, || abandoned.set(abandoned.get() + 1));
        }
        assert!(!session.is_sync_mode());
        assert!(!session.is_long_sync());
        assert_eq!(abandoned.get(), 1);
    }

    #[test]
    fn test_disarmed_guard_leaves_flags() {
        let session = SyncSession::new();
        assert!(session.try_begin_long_sync());
        let abandoned = Cell::new(false);
        {
            let mut guard = LongSyncGuard::new(&session, || abandoned.set(true));
            guard.disarm();
        }
        assert!(session.is_long_sync());
        assert!(!abandoned.get());
    }

    #[test]
    fn test_short_sync_modes_do_not_stack() {
        let session = SyncSession::new();
        assert!(session.enter(SyncState::Backtrack));
        assert!(!session.enter(SyncState::Batch));
        session.leave(SyncState::Batch);
        assert_eq!(session.state(), SyncState::Backtrack);
        session.leave(SyncState::Backtrack);
        assert_eq!(session.state(), SyncState::Idle);
    }

    #[test]
    fn test_short_syncs_do_not_nest() {
        assert!(SyncState::Idle.can_transition_to(SyncState::Backtrack));
        assert!(!SyncState::Backtrack.can_transition_to(SyncState::Batch));
        assert!(SyncState::Batch.can_transition_to(SyncState::LongSync));
        assert!(!SyncState::LongSync.can_transition_to(SyncState::Batch));
    }
}
