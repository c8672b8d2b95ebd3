//! Component I: a migratable condition variable with FIFO `signal_all`
//! semantics (spec §4.I). Grounded on `lib.rs`'s `Progress` (a
//! `Mutex`+`Condvar` pair guarding a generation counter) generalized to an
//! explicit FIFO waiter queue so "signal_all wakes waiters in the order
//! they parked" is an actual invariant rather than left to the OS
//! scheduler.
use std::collections::VecDeque;
use tokio::sync::{oneshot, Mutex as TokioMutex};

pub struct ProcletCondVar {
    waiters: TokioMutex<VecDeque<oneshot::Sender<()>>>,
}

impl ProcletCondVar {
    pub fn new() -> ProcletCondVar {
        ProcletCondVar {
            waiters: TokioMutex::new(VecDeque::new()),
        }
    }

    /// Parks the caller until the next `signal_all`. The caller must already
    /// have released whatever mutex it was holding before calling this
    /// (mirrors the usual mutex+condvar contract), since this type does not
    /// itself guard any data.
    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push_back(tx);
        let _ = rx.await;
    }

    /// Wakes every waiter currently parked, oldest first.
    pub async fn signal_all(&self) {
        let mut waiters = self.waiters.lock().await;
        while let Some(tx) = waiters.pop_front() {
            let _ = tx.send(());
        }
    }

    pub async fn waiter_count(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

impl Default for ProcletCondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn signal_all_wakes_every_waiter() {
        let cv = Arc::new(ProcletCondVar::new());
        let woken = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cv = cv.clone();
            let woken = woken.clone();
            handles.push(tokio::spawn(async move {
                cv.wait().await;
                woken.fetch_add(1, Ordering::Relaxed);
            }));
        }
        // Give the waiters a chance to register before signalling.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(cv.waiter_count().await, 4);
        cv.signal_all().await;
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(woken.load(Ordering::Relaxed), 4);
    }
}
