//! Component E: the controller. Grounded on `inc/nu/ctrl.hpp`: a single
//! logical service (may still be replicated for availability, but spec §4.E
//! treats it as one actor) owning proclet id allocation, the id->host
//! directory, per-node registration with a binary-identity check, resource
//! accounting, and migration-destination arbitration.
pub mod client;
pub mod server;

use crate::commons::{LpId, NodeIp, ProcletId, HEAP_SLOT_SIZE, HEAP_VADDR_MAX, HEAP_VADDR_MIN};
use crate::utils::err::{ERR_BINARY_MISMATCH, ERR_CONTROLLER_UNAVAILABLE, ERR_NO_FREE_SLOT};
use crate::{rtanyhow, rtensure};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const TOTAL_SLOTS: u64 = (HEAP_VADDR_MAX - HEAP_VADDR_MIN) / HEAP_SLOT_SIZE;
/// EWMA smoothing factor for free-resource accounting (spec §4.H /
/// SPEC_FULL C.2): `new = alpha * sample + (1 - alpha) * old`.
const RESOURCE_EWMA_ALPHA: f64 = 0.2;

struct FreeSlots {
    stack: Vec<u64>,
}

impl FreeSlots {
    fn new() -> FreeSlots {
        FreeSlots {
            stack: (0..TOTAL_SLOTS).rev().collect(),
        }
    }

    fn alloc(&mut self) -> Option<u64> {
        self.stack.pop()
    }

    fn free(&mut self, k: u64) {
        self.stack.push(k);
    }
}

#[derive(Clone)]
pub struct NodeRegistration {
    pub lp: LpId,
    pub ip: NodeIp,
    pub binary_digest: [u8; 16],
    pub registered_at: Instant,
}

/// A node's most recently reported resource snapshot, decayed with an EWMA
/// the same formula the pressure monitor itself uses on the worker side
/// (SPEC_FULL Open Question C.2: one formula, used identically on both
/// sides).
#[derive(Clone, Copy, Debug, Default)]
pub struct FreeResource {
    pub free_mem_bytes: f64,
    pub cpu_idle_frac: f64,
    pub last_update: Option<Instant>,
}

impl FreeResource {
    fn observe(&mut self, free_mem_bytes: u64, cpu_idle_frac: f64) {
        if self.last_update.is_none() {
            self.free_mem_bytes = free_mem_bytes as f64;
            self.cpu_idle_frac = cpu_idle_frac;
        } else {
            self.free_mem_bytes = RESOURCE_EWMA_ALPHA * free_mem_bytes as f64
                + (1.0 - RESOURCE_EWMA_ALPHA) * self.free_mem_bytes;
            self.cpu_idle_frac = RESOURCE_EWMA_ALPHA * cpu_idle_frac
                + (1.0 - RESOURCE_EWMA_ALPHA) * self.cpu_idle_frac;
        }
        self.last_update = Some(Instant::now());
    }
}

struct State {
    free_slots: FreeSlots,
    directory: HashMap<ProcletId, NodeIp>,
    nodes: HashMap<LpId, NodeRegistration>,
    resources: HashMap<LpId, FreeResource>,
    round_robin_cursor: usize,
    expected_binary_digest: Option<[u8; 16]>,
    /// Nodes currently reserved as a migration destination, excluded from
    /// both `select_node_for_proclet` and further `acquire_migration_dest`
    /// picks until the in-flight migration releases them (spec §4.E/§4.G).
    reserved_for_migration: std::collections::HashSet<LpId>,
}

/// Shared controller state, designed to sit behind a single async service
/// task (see `controller::server`); every method takes `&self` and locks
/// internally rather than requiring `&mut self`, matching the
/// "single logical service, arbitrated" shape rather than sharded state.
pub struct Controller {
    state: Mutex<State>,
}

impl Controller {
    pub fn new() -> Controller {
        Controller {
            state: Mutex::new(State {
                free_slots: FreeSlots::new(),
                directory: HashMap::new(),
                nodes: HashMap::new(),
                resources: HashMap::new(),
                round_robin_cursor: 0,
                expected_binary_digest: None,
                reserved_for_migration: std::collections::HashSet::new(),
            }),
        }
    }

    /// Registers a node, enforcing the binary-identity check (spec §7
    /// BinaryMismatch): the first node to register fixes the expected
    /// digest for the whole cluster, every later registration must match.
    pub fn register_node(
        &self,
        lp: LpId,
        ip: NodeIp,
        binary: &[u8],
    ) -> anyhow::Result<()> {
        let digest: [u8; 16] = Md5::digest(binary).into();
        let mut state = self.state.lock();
        match state.expected_binary_digest {
            None => state.expected_binary_digest = Some(digest),
            Some(expected) => rtensure!(
                expected == digest,
                ERR_BINARY_MISMATCH,
                "node {} binary digest does not match the registered cluster binary",
                lp
            ),
        }
        state.nodes.insert(
            lp,
            NodeRegistration {
                lp,
                ip,
                binary_digest: digest,
                registered_at: Instant::now(),
            },
        );
        state.resources.entry(lp).or_insert_with(FreeResource::default);
        Ok(())
    }

    pub fn unregister_node(&self, lp: LpId) {
        let mut state = self.state.lock();
        state.nodes.remove(&lp);
        state.resources.remove(&lp);
    }

    /// Allocates a fresh `ProcletId` from the free-slot stack.
    pub fn alloc_proclet_id(&self) -> anyhow::Result<ProcletId> {
        let mut state = self.state.lock();
        let k = state
            .free_slots
            .alloc()
            .ok_or_else(|| rtanyhow!(ERR_NO_FREE_SLOT, "no free proclet heap slots remain"))?;
        Ok(ProcletId::from_slot_index(k))
    }

    /// Allocates a proclet id and picks the node it should be created on, in
    /// one call (spec §4.E, `inc/nu/ctrl.hpp`'s `allocate_proclet`). `hint_ip`
    /// is honored when that node is registered, not a stale reporter, not
    /// reserved as a migration destination, and has enough free memory;
    /// otherwise the least-loaded qualifying node is chosen instead.
    pub fn allocate_proclet(
        &self,
        capacity_bytes: u64,
        hint_ip: Option<NodeIp>,
    ) -> anyhow::Result<(ProcletId, NodeIp)> {
        let mut state = self.state.lock();
        let lp = Self::select_node_for_proclet(&state, capacity_bytes, hint_ip)?;
        let k = state
            .free_slots
            .alloc()
            .ok_or_else(|| rtanyhow!(ERR_NO_FREE_SLOT, "no free proclet heap slots remain"))?;
        let id = ProcletId::from_slot_index(k);
        let ip = state.nodes[&lp].ip;
        state.directory.insert(id, ip);
        Ok((id, ip))
    }

    /// Picks the node a new proclet of `capacity_bytes` should land on:
    /// `hint_ip` first if it still qualifies, otherwise the non-reserved,
    /// non-stale node reporting the most free memory that can fit it, or —
    /// if none report enough headroom yet (e.g. right after cluster
    /// startup, before the first resource report lands) — the least-stale
    /// node overall, round-robin among ties.
    fn select_node_for_proclet(
        state: &State,
        capacity_bytes: u64,
        hint_ip: Option<NodeIp>,
    ) -> anyhow::Result<LpId> {
        let staleness = Duration::from_secs(30);
        let is_live = |lp: &LpId| {
            !state.reserved_for_migration.contains(lp)
                && state
                    .resources
                    .get(lp)
                    .and_then(|r| r.last_update)
                    .map(|t| t.elapsed() <= staleness)
                    .unwrap_or(true)
        };
        if let Some(hint_ip) = hint_ip {
            if let Some(lp) = state
                .nodes
                .values()
                .find(|n| n.ip == hint_ip)
                .map(|n| n.lp)
                .filter(is_live)
                .filter(|lp| {
                    state
                        .resources
                        .get(lp)
                        .map(|r| r.free_mem_bytes >= capacity_bytes as f64)
                        .unwrap_or(true)
                })
            {
                return Ok(lp);
            }
        }
        let mut qualifying: Vec<LpId> = state
            .nodes
            .keys()
            .copied()
            .filter(is_live)
            .filter(|lp| {
                state
                    .resources
                    .get(lp)
                    .map(|r| r.free_mem_bytes >= capacity_bytes as f64)
                    .unwrap_or(false)
            })
            .collect();
        qualifying.sort_unstable_by(|a, b| {
            let fa = state.resources.get(a).map(|r| r.free_mem_bytes).unwrap_or(0.0);
            let fb = state.resources.get(b).map(|r| r.free_mem_bytes).unwrap_or(0.0);
            fb.partial_cmp(&fa).unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(lp) = qualifying.into_iter().next() {
            return Ok(lp);
        }
        let mut candidates: Vec<LpId> = state.nodes.keys().copied().filter(is_live).collect();
        candidates.sort_unstable();
        rtensure!(
            !candidates.is_empty(),
            ERR_CONTROLLER_UNAVAILABLE,
            "no node available to host a new proclet"
        );
        Ok(candidates[0])
    }

    pub fn release_proclet_id(&self, id: ProcletId) {
        let mut state = self.state.lock();
        let k = (id.addr() - HEAP_VADDR_MIN) / HEAP_SLOT_SIZE;
        state.free_slots.free(k);
        state.directory.remove(&id);
    }

    pub fn lookup(&self, id: ProcletId) -> anyhow::Result<NodeIp> {
        self.state
            .lock()
            .directory
            .get(&id)
            .copied()
            .ok_or_else(|| rtanyhow!(ERR_CONTROLLER_UNAVAILABLE, "no directory entry for {}", id))
    }

    pub fn update_directory(&self, id: ProcletId, host: NodeIp) {
        self.state.lock().directory.insert(id, host);
    }

    pub fn report_resources(&self, lp: LpId, free_mem_bytes: u64, cpu_idle_frac: f64) {
        let mut state = self.state.lock();
        state
            .resources
            .entry(lp)
            .or_insert_with(FreeResource::default)
            .observe(free_mem_bytes, cpu_idle_frac);
    }

    /// Picks a migration destination able to take on `mem_hint_bytes` more
    /// resident memory, skipping `exclude` (the proclet's current host),
    /// any node whose last resource report is stale, and any node already
    /// reserved as someone else's migration destination — then reserves it
    /// so a second concurrent migration doesn't pick the same node before
    /// its resource report catches up (spec §4.E/§4.G). The caller must
    /// pair a successful call with `release_migration_dest` once the
    /// migration either completes or is aborted.
    pub fn acquire_migration_dest(&self, exclude: LpId, mem_hint_bytes: u64) -> anyhow::Result<LpId> {
        let mut state = self.state.lock();
        let staleness = Duration::from_secs(30);
        let mut candidates: Vec<LpId> = state
            .nodes
            .keys()
            .copied()
            .filter(|lp| *lp != exclude)
            .filter(|lp| !state.reserved_for_migration.contains(lp))
            .filter(|lp| {
                state
                    .resources
                    .get(lp)
                    .and_then(|r| r.last_update)
                    .map(|t| t.elapsed() <= staleness)
                    .unwrap_or(true)
            })
            .collect();
        candidates.sort_unstable_by(|a, b| {
            let fa = state.resources.get(a).map(|r| r.free_mem_bytes).unwrap_or(0.0);
            let fb = state.resources.get(b).map(|r| r.free_mem_bytes).unwrap_or(0.0);
            fb.partial_cmp(&fa).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.retain(|lp| {
            state
                .resources
                .get(lp)
                .map(|r| r.free_mem_bytes >= mem_hint_bytes as f64)
                .unwrap_or(true)
        });
        rtensure!(
            !candidates.is_empty(),
            ERR_CONTROLLER_UNAVAILABLE,
            "no migration destination with enough free memory besides {}",
            exclude
        );
        let cursor = state.round_robin_cursor % candidates.len();
        state.round_robin_cursor = state.round_robin_cursor.wrapping_add(1);
        let dest = candidates[cursor];
        state.reserved_for_migration.insert(dest);
        Ok(dest)
    }

    /// Releases a node reserved by `acquire_migration_dest`.
    pub fn release_migration_dest(&self, lp: LpId) -> anyhow::Result<()> {
        self.state.lock().reserved_for_migration.remove(&lp);
        Ok(())
    }

    pub fn node_ip(&self, lp: LpId) -> anyhow::Result<NodeIp> {
        self.state
            .lock()
            .nodes
            .get(&lp)
            .map(|n| n.ip)
            .ok_or_else(|| rtanyhow!(ERR_CONTROLLER_UNAVAILABLE, "unknown lp {}", lp))
    }

    /// A node's last report is considered stale (and thus excluded from
    /// `acquire_migration_dest`/`allocate_proclet`-adjacent health checks)
    /// after this long without a `report_resources` call.
    pub fn is_stale(&self, lp: LpId, staleness: Duration) -> bool {
        match self.state.lock().resources.get(&lp).and_then(|r| r.last_update) {
            Some(t) => t.elapsed() > staleness,
            None => true,
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(n: u8) -> NodeIp {
        NodeIp(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn binary_mismatch_rejects_second_node() {
        let ctrl = Controller::new();
        ctrl.register_node(1, ip(1), b"binary-a").unwrap();
        let err = ctrl.register_node(2, ip(2), b"binary-b").unwrap_err();
        assert!(format!("{:#}", err).contains("ERR_BINARY_MISMATCH"));
    }

    #[test]
    fn proclet_id_alloc_is_unique_and_releasable() {
        let ctrl = Controller::new();
        let a = ctrl.alloc_proclet_id().unwrap();
        let b = ctrl.alloc_proclet_id().unwrap();
        assert_ne!(a, b);
        ctrl.release_proclet_id(a);
        let c = ctrl.alloc_proclet_id().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn directory_roundtrip() {
        let ctrl = Controller::new();
        let id = ctrl.alloc_proclet_id().unwrap();
        assert!(ctrl.lookup(id).is_err());
        ctrl.update_directory(id, ip(7));
        assert_eq!(ctrl.lookup(id).unwrap(), ip(7));
    }

    #[test]
    fn migration_dest_round_robins_and_excludes_source() {
        let ctrl = Controller::new();
        ctrl.register_node(1, ip(1), b"bin").unwrap();
        ctrl.register_node(2, ip(2), b"bin").unwrap();
        ctrl.register_node(3, ip(3), b"bin").unwrap();
        let mut picks = Vec::new();
        for _ in 0..3 {
            let dest = ctrl.acquire_migration_dest(1, 0).unwrap();
            ctrl.release_migration_dest(dest).unwrap();
            picks.push(dest);
        }
        assert!(picks.iter().all(|p| *p != 1));
        assert!(picks.contains(&2));
        assert!(picks.contains(&3));
    }

    #[test]
    fn migration_dest_reservation_excludes_concurrent_pick() {
        let ctrl = Controller::new();
        ctrl.register_node(1, ip(1), b"bin").unwrap();
        ctrl.register_node(2, ip(2), b"bin").unwrap();
        let first = ctrl.acquire_migration_dest(1, 0).unwrap();
        let second = ctrl.acquire_migration_dest(1, 0).unwrap();
        assert_ne!(first, second, "a reserved node must not be handed out twice");
        ctrl.release_migration_dest(first).unwrap();
        let third = ctrl.acquire_migration_dest(1, 0).unwrap();
        assert_eq!(third, first, "released node becomes available again");
    }

    #[test]
    fn allocate_proclet_prefers_hint_when_it_qualifies() {
        let ctrl = Controller::new();
        ctrl.register_node(1, ip(1), b"bin").unwrap();
        ctrl.register_node(2, ip(2), b"bin").unwrap();
        ctrl.report_resources(1, 1_000_000, 0.5);
        ctrl.report_resources(2, 1_000_000, 0.5);
        let (_, host) = ctrl.allocate_proclet(4096, Some(ip(2))).unwrap();
        assert_eq!(host, ip(2));
    }

    #[test]
    fn allocate_proclet_picks_the_most_free_node_without_a_hint() {
        let ctrl = Controller::new();
        ctrl.register_node(1, ip(1), b"bin").unwrap();
        ctrl.register_node(2, ip(2), b"bin").unwrap();
        ctrl.report_resources(1, 1_000, 0.5);
        ctrl.report_resources(2, 1_000_000, 0.5);
        let (_, host) = ctrl.allocate_proclet(4096, None).unwrap();
        assert_eq!(host, ip(2));
    }

    #[test]
    fn resource_ewma_moves_toward_new_sample() {
        let ctrl = Controller::new();
        ctrl.register_node(1, ip(1), b"bin").unwrap();
        ctrl.report_resources(1, 1000, 0.5);
        ctrl.report_resources(1, 0, 0.0);
        let r = ctrl.state.lock().resources[&1];
        assert!(r.free_mem_bytes < 1000.0 && r.free_mem_bytes > 0.0);
    }
}
