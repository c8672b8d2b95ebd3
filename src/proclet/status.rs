//! Per-node side array tracking where a `ProcletId` currently stands. Kept
//! *outside* the proclet header itself (spec §3.1/§4.B): the header lives
//! inside the proclet's own heap slot and migrates with it, but the status
//! that says whether a given node currently has that slot mapped has to
//! survive independently of the slot's contents, since a node can be asked
//! about a proclet it has never hosted.
use crate::commons::{NodeIp, ProcletId};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// This node has never heard of the id, or it has fully departed.
    Absent,
    /// The controller's directory points here, but the heap slot has not
    /// been faulted in yet.
    Mapped,
    /// Live and runnable on this node.
    Present,
    /// A migration for this id is underway; new invocations must be queued
    /// or forwarded rather than admitted.
    Migrating,
    /// Reference count reached zero; the destructor is running and the slab
    /// is being torn down.
    Destructing,
}

#[derive(Default)]
pub struct StatusTable {
    inner: RwLock<HashMap<ProcletId, Status>>,
    directory: RwLock<HashMap<ProcletId, NodeIp>>,
}

impl StatusTable {
    pub fn new() -> StatusTable {
        StatusTable::default()
    }

    pub fn status(&self, id: ProcletId) -> Status {
        *self.inner.read().get(&id).unwrap_or(&Status::Absent)
    }

    pub fn set_status(&self, id: ProcletId, status: Status) {
        self.inner.write().insert(id, status);
    }

    pub fn clear(&self, id: ProcletId) {
        self.inner.write().remove(&id);
        self.directory.write().remove(&id);
    }

    /// Best-effort local cache of the controller's id->host directory,
    /// consulted before falling back to an RPC to the controller. Matches
    /// `RemObjRPCClientMgr`'s cache-then-ask-controller shape.
    pub fn cached_host(&self, id: ProcletId) -> Option<NodeIp> {
        self.directory.read().get(&id).copied()
    }

    pub fn cache_host(&self, id: ProcletId, host: NodeIp) {
        self.directory.write().insert(id, host);
    }

    /// Invalidates a stale directory entry. Called both reactively (on a
    /// `WrongClient` RPC return) and proactively by the migration engine
    /// right after a migration commits (`rpc_client_mgr.hpp`'s
    /// `invalidate_cache`), so callers don't have to round-trip through a
    /// stale node first.
    pub fn invalidate_cache(&self, id: ProcletId) {
        self.directory.write().remove(&id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn unknown_id_is_absent() {
        let t = StatusTable::new();
        assert_eq!(t.status(ProcletId(0x8000_0000)), Status::Absent);
    }

    #[test]
    fn cache_then_invalidate() {
        let t = StatusTable::new();
        let id = ProcletId(0x8000_0000);
        let ip = NodeIp(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(t.cached_host(id), None);
        t.cache_host(id, ip);
        assert_eq!(t.cached_host(id), Some(ip));
        t.invalidate_cache(id);
        assert_eq!(t.cached_host(id), None);
    }
}
