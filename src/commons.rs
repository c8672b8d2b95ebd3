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
//! Layout constants shared by every node: the virtual heap range a
//! `ProcletId` is carved from, the fixed per-proclet heap slot size, and the
//! stack geometry used by the thread/stack managers. Mirrors
//! `inc/nu/commons.hpp` in the reference implementation.
use static_assertions::const_assert;

/// Lowest address a proclet heap slot can start at.
pub const HEAP_VADDR_MIN: u64 = 0x8000_0000;
/// One past the highest address a proclet heap slot can start at.
pub const HEAP_VADDR_MAX: u64 = 0x4000_0000_0000;
/// Fixed size of a single proclet's heap slot; `ProcletId`s are multiples of
/// this stride above `HEAP_VADDR_MIN`.
pub const HEAP_SLOT_SIZE: u64 = 0x4000_0000;
/// Size of a single green-thread stack allotment.
pub const STACK_SIZE: u64 = 256 * 1024;
/// Threads are carved out of clusters of this size so a cluster can migrate
/// as a unit.
pub const STACK_CLUSTER_SIZE: u64 = 1024 * 1024 * 1024;
/// Total heap address space a single node's runtime reserves up front.
pub const RUNTIME_HEAP_SIZE: u64 = 48 * 1024 * 1024 * 1024;
pub const PAGE_SIZE: u64 = 4096;
pub const CACHE_LINE_BYTES: usize = 64;

const_assert!(HEAP_SLOT_SIZE.is_power_of_two());
const_assert!(STACK_SIZE.is_power_of_two());
const_assert!((HEAP_VADDR_MAX - HEAP_VADDR_MIN) % HEAP_SLOT_SIZE == 0);

/// Globally unique identifier for a proclet: the base virtual address of its
/// heap slot. Two proclets never share an id because slot assignment is
/// arbitrated by the controller's free-slot stack (`controller::FreeSlots`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProcletId(pub u64);

impl ProcletId {
    pub fn from_slot_index(k: u64) -> ProcletId {
        ProcletId(HEAP_VADDR_MIN + k * HEAP_SLOT_SIZE)
    }

    pub fn addr(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 >= HEAP_VADDR_MIN
            && self.0 < HEAP_VADDR_MAX
            && (self.0 - HEAP_VADDR_MIN) % HEAP_SLOT_SIZE == 0
    }
}

impl std::fmt::Display for ProcletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proclet#{:#x}", self.0)
    }
}

/// A node's externally reachable address, used both as the controller's
/// directory value and as the RPC transport's dial target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeIp(pub std::net::Ipv4Addr);

impl std::fmt::Display for NodeIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical process: one worker node registered with the controller.
pub type LpId = u32;
