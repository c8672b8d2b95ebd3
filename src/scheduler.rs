/*
Copyright 2020 <盏一 w@hidva.com>
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/
//! The external userspace scheduling substrate (spec §1 Non-goals — this
//! runtime consumes it, it doesn't implement it) expressed as a trait
//! contract, with a `tokio`-backed default implementation standing in for a
//! raw green-thread runtime like Caladan/shenango (SPEC_FULL Open Question
//! C.3). A future embedder with access to a real userspace scheduler swaps
//! this implementation in without touching the rest of the crate.
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything the proclet runtime needs from the thing that actually
/// schedules green threads onto cores: spawn, voluntary yield, core
/// affinity, and a way to temporarily forbid preemption around a critical
/// section (used by `sync::rcu`'s `_np` guards).
pub trait Scheduler: Send + Sync {
    fn spawn(&self, core: usize, fut: BoxFuture);
    fn cores(&self) -> usize;
    fn current_core(&self) -> usize;
    fn disable_preempt(&self);
    fn enable_preempt(&self);
}

/// Default implementation: one current-thread Tokio runtime pinned per
/// core, matching `protocol.rs`'s reliance on Tokio for async I/O. Preempt
/// disable/enable is a best-effort counter, since Tokio itself offers no
/// real preemption to suppress — cooperative tasks only yield at `.await`
/// points, so `disable_preempt` here documents intent for `sync::rcu`
/// rather than changing scheduling behavior.
pub struct TokioScheduler {
    handles: Vec<tokio::runtime::Handle>,
    preempt_disabled: std::sync::atomic::AtomicU32,
}

impl TokioScheduler {
    pub fn new(handles: Vec<tokio::runtime::Handle>) -> TokioScheduler {
        TokioScheduler {
            handles,
            preempt_disabled: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Convenience constructor that pins every core to the single
    /// multi-threaded runtime the calling task is already on, for embedders
    /// that don't need true per-core isolation.
    pub fn current(cores: usize) -> TokioScheduler {
        let handle = tokio::runtime::Handle::current();
        TokioScheduler::new(vec![handle; cores.max(1)])
    }
}

impl Scheduler for TokioScheduler {
    fn spawn(&self, core: usize, fut: BoxFuture) {
        let handle = &self.handles[core % self.handles.len()];
        handle.spawn(fut);
    }

    fn cores(&self) -> usize {
        self.handles.len()
    }

    fn current_core(&self) -> usize {
        0
    }

    fn disable_preempt(&self) {
        self.preempt_disabled
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    fn enable_preempt(&self) {
        self.preempt_disabled
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawn_runs_the_future() {
        let sched = TokioScheduler::current(1);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        sched.spawn(
            0,
            Box::pin(async move {
                ran2.store(true, Ordering::Relaxed);
            }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(ran.load(Ordering::Relaxed));
    }
}
