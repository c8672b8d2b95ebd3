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
//! Component C: stack cluster bookkeeping. Grounded on
//! `inc/nu/stack_manager.hpp`: stacks are handed out from fixed-size
//! clusters so a whole cluster (and every thread still using it) can move as
//! a unit during migration, rather than tracking each green-thread stack
//! individually.
use crate::commons::{STACK_CLUSTER_SIZE, STACK_SIZE};
use parking_lot::Mutex;
use std::collections::HashSet;

pub const STACKS_PER_CLUSTER: u64 = STACK_CLUSTER_SIZE / STACK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId {
    pub cluster: u32,
    pub slot: u32,
}

struct Cluster {
    free_slots: Vec<u32>,
    in_use: HashSet<u32>,
}

impl Cluster {
    fn new() -> Cluster {
        Cluster {
            free_slots: (0..STACKS_PER_CLUSTER as u32).rev().collect(),
            in_use: HashSet::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}

/// Manages every stack cluster a single node owns. Thread-safe: multiple
/// cores request/release stacks concurrently.
pub struct StackManager {
    clusters: Mutex<Vec<Cluster>>,
}

impl StackManager {
    pub fn new() -> StackManager {
        StackManager {
            clusters: Mutex::new(Vec::new()),
        }
    }

    /// Hands out a stack slot, creating a new cluster if every existing one
    /// is full. Clusters are never proactively balanced across cores: the
    /// migration engine moves a whole cluster, not individual slots.
    pub fn acquire(&self) -> StackId {
        let mut clusters = self.clusters.lock();
        for (idx, cluster) in clusters.iter_mut().enumerate() {
            if let Some(slot) = cluster.free_slots.pop() {
                cluster.in_use.insert(slot);
                return StackId {
                    cluster: idx as u32,
                    slot,
                };
            }
        }
        let mut cluster = Cluster::new();
        let slot = cluster.free_slots.pop().unwrap();
        cluster.in_use.insert(slot);
        clusters.push(cluster);
        StackId {
            cluster: (clusters.len() - 1) as u32,
            slot,
        }
    }

    pub fn release(&self, id: StackId) {
        let mut clusters = self.clusters.lock();
        if let Some(cluster) = clusters.get_mut(id.cluster as usize) {
            cluster.in_use.remove(&id.slot);
            cluster.free_slots.push(id.slot);
        }
    }

    /// True once every slot in `cluster` has been released, meaning the
    /// cluster is a migration candidate on its own (no thread still anchors
    /// it here).
    pub fn cluster_drained(&self, cluster: u32) -> bool {
        self.clusters
            .lock()
            .get(cluster as usize)
            .map_or(true, Cluster::is_empty)
    }
}

impl Default for StackManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let mgr = StackManager::new();
        let a = mgr.acquire();
        let b = mgr.acquire();
        assert_ne!(a, b);
        mgr.release(a);
        mgr.release(b);
        assert!(mgr.cluster_drained(0));
    }

    #[test]
    fn fills_one_cluster_before_starting_a_new_one() {
        let mgr = StackManager::new();
        let mut ids = Vec::new();
        for _ in 0..STACKS_PER_CLUSTER {
            ids.push(mgr.acquire());
        }
        assert!(ids.iter().all(|id| id.cluster == 0));
        let overflow = mgr.acquire();
        assert_eq!(overflow.cluster, 1);
    }
}
