//! Component I: a migratable mutex. Grounded in shape on `access/lmgr.rs`'s
//! `Lock`/`LocalLock` split (global state vs. a cheap per-caller handle),
//! but backed by `tokio::sync::Mutex` instead of a spin/condvar pair since
//! proclet threads are cooperative Tokio tasks (SPEC_FULL Open Question
//! C.3) and must yield rather than busy-spin while blocked.
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as TokioMutex, MutexGuard};

/// On-the-wire snapshot of a mutex's state, migrated alongside its owning
/// proclet. Only the held/free bit crosses the network: a lock that isn't
/// held carries no meaningful queue state to preserve, and one that *is*
/// held is only migratable once quiesced (no task may be inside its
/// critical section during a migration, spec §4.G "quiesce").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MutexSnapshot {
    pub locked: bool,
}

pub struct ProcletMutex {
    inner: TokioMutex<()>,
}

impl ProcletMutex {
    pub fn new() -> ProcletMutex {
        ProcletMutex {
            inner: TokioMutex::new(()),
        }
    }

    pub fn from_snapshot(snap: MutexSnapshot) -> ProcletMutex {
        let inner = TokioMutex::new(());
        if snap.locked {
            // Acquire and leak a guard so the restored mutex starts locked;
            // the original holder's resumption (also migrated) reacquires
            // it through the normal unlock path once rescheduled.
            let guard = inner.try_lock().expect("fresh mutex is always lockable");
            std::mem::forget(guard);
        }
        ProcletMutex { inner }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.inner.try_lock().ok()
    }

    /// Valid only once the mutex is quiesced (no task holds the guard and
    /// none is waiting) — exactly the state the migration engine guarantees
    /// before calling this.
    pub fn snapshot(&self) -> MutexSnapshot {
        MutexSnapshot {
            locked: self.inner.try_lock().is_err(),
        }
    }
}

impl Default for ProcletMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn lock_unlock_roundtrip() {
        let m = ProcletMutex::new();
        {
            let _g = m.lock().await;
            assert!(m.try_lock().is_none());
        }
        assert!(m.try_lock().is_some());
    }

    #[tokio::test]
    async fn snapshot_reflects_lock_state() {
        let m = ProcletMutex::new();
        assert!(!m.snapshot().locked);
        let g = m.lock().await;
        assert!(m.snapshot().locked);
        drop(g);
        assert!(!m.snapshot().locked);
    }

    #[tokio::test]
    async fn restoring_a_locked_snapshot_blocks_new_lockers() {
        let m = ProcletMutex::from_snapshot(MutexSnapshot { locked: true });
        assert!(m.try_lock().is_none());
    }
}
