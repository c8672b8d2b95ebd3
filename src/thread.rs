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
//! Component K: proclet-env threads. Grounded on `inc/nu/utils/thread.hpp`:
//! a thread created inside a proclet's environment claims a stack slot from
//! the node's `StackManager` and is joinable regardless of whether the
//! spawned body finishes before or after `join()` is called — the "first to
//! finish, first to join" symmetry `thread.hpp` documents is exactly what
//! `tokio::task::JoinHandle`'s internal oneshot already gives for free, so
//! this wrapper's job is bookkeeping (stack slot lifetime, migration
//! tagging), not reimplementing that rendezvous.
use crate::commons::NodeIp;
use crate::stack::{StackId, StackManager};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A proclet-spawned green thread. `creator_ip` is the node that originally
/// spawned it — carried so a request that arrives mid-migration for this
/// thread can be forwarded back along the same path it came in on (spec
/// §4.G "request forwarding", `Forward` RPC using the thread's
/// `creator_ip`).
pub struct ProcletThread<T> {
    handle: JoinHandle<T>,
    stack_id: StackId,
    stacks: Arc<StackManager>,
    pub creator_ip: NodeIp,
}

impl<T: Send + 'static> ProcletThread<T> {
    pub fn spawn<F>(stacks: Arc<StackManager>, creator_ip: NodeIp, fut: F) -> ProcletThread<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
    {
        let stack_id = stacks.acquire();
        let handle = tokio::spawn(fut);
        ProcletThread {
            handle,
            stack_id,
            stacks,
            creator_ip,
        }
    }

    /// Waits for the thread to finish and releases its stack slot. Correct
    /// whether the body already completed (the join resolves immediately)
    /// or is still running (the join parks until it does).
    pub async fn join(self) -> Result<T, tokio::task::JoinError> {
        let result = self.handle.await;
        self.stacks.release(self.stack_id);
        result
    }

    pub fn stack_id(&self) -> StackId {
        self.stack_id
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn join_after_completion_returns_immediately() {
        let stacks = Arc::new(StackManager::new());
        let ip = NodeIp(Ipv4Addr::new(127, 0, 0, 1));
        let t = ProcletThread::spawn(stacks.clone(), ip, async { 7 });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(t.join().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn join_before_completion_waits() {
        let stacks = Arc::new(StackManager::new());
        let ip = NodeIp(Ipv4Addr::new(127, 0, 0, 1));
        let t = ProcletThread::spawn(stacks.clone(), ip, async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            9
        });
        assert_eq!(t.join().await.unwrap(), 9);
    }
}
