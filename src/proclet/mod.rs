//! Components B and F: the proclet table (admission, status, migration
//! guards, distributed reference counting) and the invocation fast/slow path
//! split between a local call and an RPC to whichever node currently hosts
//! the proclet.
pub mod handle;
pub mod invoke;
pub mod status;

use crate::commons::{NodeIp, ProcletId};
use crate::slab::SlabTable;
use crate::utils::err::{ERR_INTERNAL, ERR_MIGRATION_ABORTED};
use crate::{rtanyhow, rtbail};
use handle::{Proclet, ProcletDrop};
use parking_lot::{Mutex, RwLock};
use status::{Status, StatusTable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Anything a proclet's heap holds is type-erased behind this trait so the
/// table can store proclets of different concrete types side by side, the
/// same way `access/lmgr.rs`'s `GlobalStateExt` keeps a single
/// `HashMap<LockTag, Box<LockState>>` regardless of what each lock guards.
pub trait ProcletObject: Send + Sync {
    /// Runs exactly once, right before the slab backing this proclet is torn
    /// down (spec §4.F "ref_cnt==0 triggers Destructing").
    fn on_destruct(&mut self);

    /// Runs a marshalled method call against this proclet's live state.
    /// `method` stands in for `T::method`/`fn` in `Proclet<T>::run` — a raw
    /// function pointer doesn't mean anything once it's crossed a process
    /// boundary, so the wire carries a name instead and the concrete type
    /// dispatches on it; `args` and the returned bytes are whatever
    /// `bincode` encoding caller and callee agree on for that name.
    fn invoke(&mut self, method: &str, args: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Reconstructs a `Box<dyn ProcletObject>` from the bytes `on_destruct`'s
/// counterpart (a type's own serialize step, run by the migration caller)
/// produced. Registered per concrete type, analogous to cereal's
/// `CEREAL_REGISTER_TYPE` for polymorphic archives.
pub type RestoreFn = fn(&[u8]) -> anyhow::Result<Box<dyn ProcletObject>>;

/// Registry of proclet types this binary knows how to reconstruct after a
/// migration transfer. A concrete `ProcletObject` implementation must
/// `register` its restore function once at startup before any proclet of
/// that type can be received here.
#[derive(Default)]
pub struct TypeRegistry {
    restorers: RwLock<HashMap<String, RestoreFn>>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    pub fn register(&self, type_tag: &str, restore: RestoreFn) {
        self.restorers.write().insert(type_tag.to_string(), restore);
    }

    pub fn restore(&self, type_tag: &str, bytes: &[u8]) -> anyhow::Result<Box<dyn ProcletObject>> {
        let restorers = self.restorers.read();
        let f = restorers
            .get(type_tag)
            .ok_or_else(|| rtanyhow!(ERR_INTERNAL, "no registered proclet type {:?}", type_tag))?;
        f(bytes)
    }
}

/// RAII guard preventing a migration from starting while held. Acquired
/// around every local invocation's fast path (spec §4.F, "migration-disabled
/// guards (blocking/non-blocking) around admission"). A blocking guard waits
/// for an in-progress migration to finish before incrementing; a
/// non-blocking guard fails fast so the caller can fall back to the RPC
/// path against the (about to be updated) directory instead.
pub struct MigrationDisabledGuard<'a> {
    counter: &'a AtomicU32,
}

impl Drop for MigrationDisabledGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

/// Drop hook wiring the local-clone-style `Proclet<D>` primitive back into
/// the table: once every reference — the table's own baseline plus any
/// `crossing_inc`-granted remote one — is gone, this runs the actual
/// teardown (spec §3.2, §4.F).
struct TableDropHook {
    table: Weak<ProcletTable>,
}

impl ProcletDrop for TableDropHook {
    fn on_zero_refs(&self, id: ProcletId) {
        if let Some(table) = self.table.upgrade() {
            table.finalize_destruct(id);
        }
    }
}

struct Entry {
    object: RwLock<Box<dyn ProcletObject>>,
    migration_disable_count: AtomicU32,
    /// The table's own reference, representing "this proclet is still
    /// supposed to be alive" independent of any remote holder. `destruct`
    /// drops it; `crossing_inc`/`crossing_dec` add and remove the others.
    owner_handle: Mutex<Option<Proclet<TableDropHook>>>,
    crossing_refs: Mutex<Vec<Proclet<TableDropHook>>>,
}

/// Per-node table of locally resident proclets plus the status/directory
/// side array. One instance per node process.
pub struct ProcletTable {
    status: StatusTable,
    slabs: Arc<SlabTable>,
    entries: RwLock<HashMap<ProcletId, Arc<Entry>>>,
    self_ip: NodeIp,
    weak_self: Weak<ProcletTable>,
}

impl ProcletTable {
    pub fn new(self_ip: NodeIp, slabs: Arc<SlabTable>) -> Arc<ProcletTable> {
        Arc::new_cyclic(|weak| ProcletTable {
            status: StatusTable::new(),
            slabs,
            entries: RwLock::new(HashMap::new()),
            self_ip,
            weak_self: weak.clone(),
        })
    }

    pub fn status(&self) -> &StatusTable {
        &self.status
    }

    pub fn slabs(&self) -> &Arc<SlabTable> {
        &self.slabs
    }

    pub fn self_ip(&self) -> NodeIp {
        self.self_ip
    }

    /// Admits a freshly constructed proclet as `Present` on this node,
    /// seeding its distributed reference count at one (the table's own
    /// baseline reference).
    pub fn install(&self, id: ProcletId, object: Box<dyn ProcletObject>) {
        let owner = Proclet::new(
            id,
            TableDropHook {
                table: self.weak_self.clone(),
            },
        );
        let entry = Arc::new(Entry {
            object: RwLock::new(object),
            migration_disable_count: AtomicU32::new(0),
            owner_handle: Mutex::new(Some(owner)),
            crossing_refs: Mutex::new(Vec::new()),
        });
        self.entries.write().insert(id, entry);
        self.status.set_status(id, Status::Present);
        self.status.cache_host(id, self.self_ip);
    }

    /// Tries to take out a non-blocking migration-disabled guard and run
    /// `f` against the locally resident proclet. Returns `None` (the local
    /// fast path isn't available) when the proclet isn't `Present` here or a
    /// migration currently holds it, in which case the caller should fall
    /// back to the remote RPC path (spec §4.F).
    pub fn try_local_invoke<R>(
        &self,
        id: ProcletId,
        f: impl FnOnce(&mut dyn ProcletObject) -> R,
    ) -> Option<R> {
        if self.status.status(id) != Status::Present {
            return None;
        }
        let entry = self.entries.read().get(&id).cloned()?;
        entry.migration_disable_count.fetch_add(1, Ordering::Acquire);
        let _guard = MigrationDisabledGuard {
            counter: &entry.migration_disable_count,
        };
        if self.status.status(id) != Status::Present {
            // A migration slipped in between the status check and the
            // guard increment; bail out to the remote path rather than run
            // against a proclet that's mid-quiesce.
            return None;
        }
        let mut obj = entry.object.write();
        Some(f(&mut **obj))
    }

    /// Component F local fast path: dispatches a marshalled method call
    /// against the locally resident proclet, or returns `None` so the
    /// caller (`proclet::invoke`) falls back to an RPC.
    pub fn dispatch_local(
        &self,
        id: ProcletId,
        method: &str,
        args: &[u8],
    ) -> Option<anyhow::Result<Vec<u8>>> {
        self.try_local_invoke(id, |obj| obj.invoke(method, args))
    }

    /// Blocking variant: waits (spin, matching `utils/sb.rs`'s `Slot::lock`)
    /// for an in-flight migration to clear rather than falling back
    /// immediately. Used by the migration engine itself when it needs to run
    /// a final local op (e.g. reading state to serialize) and knows the
    /// proclet is not about to move again.
    pub fn local_invoke_blocking<R>(
        &self,
        id: ProcletId,
        f: impl FnOnce(&mut dyn ProcletObject) -> R,
    ) -> anyhow::Result<R> {
        for _ in 0..10_000 {
            if let Some(r) = self.try_local_invoke(id, |o| f(o)) {
                return Ok(r);
            }
            std::thread::yield_now();
        }
        rtbail!(
            ERR_MIGRATION_ABORTED,
            "local_invoke_blocking: proclet {} never quiesced",
            id
        )
    }

    /// Marks `id` as `Migrating`, preventing new local fast-path admissions.
    /// Returns the entry so the migration engine can wait out any guards
    /// already held (spec §4.G step "quiesce").
    pub fn begin_migration(&self, id: ProcletId) -> anyhow::Result<()> {
        if self.status.status(id) != Status::Present {
            rtbail!(
                ERR_INTERNAL,
                "begin_migration: proclet {} is not Present here",
                id
            );
        }
        self.status.set_status(id, Status::Migrating);
        Ok(())
    }

    /// Blocks until no `try_local_invoke` call still holds a
    /// migration-disabled guard for `id`.
    pub fn quiesce(&self, id: ProcletId) {
        let entry = match self.entries.read().get(&id).cloned() {
            Some(e) => e,
            None => return,
        };
        while entry.migration_disable_count.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
    }

    /// Removes `id` from this node once its data has been transferred to
    /// the destination (spec §4.G step "install forwarding").
    pub fn take_for_migration(&self, id: ProcletId) -> anyhow::Result<Box<dyn ProcletObject>> {
        let entry = self
            .entries
            .write()
            .remove(&id)
            .ok_or_else(|| rtanyhow!(ERR_INTERNAL, "take_for_migration: unknown proclet {}", id))?;
        self.status.set_status(id, Status::Absent);
        self.status.invalidate_cache(id);
        Arc::try_unwrap(entry)
            .map_err(|_| rtanyhow!(ERR_INTERNAL, "take_for_migration: proclet {} still referenced", id))
            .map(|e| e.object.into_inner())
    }

    /// Increments the distributed reference count for `id`: called from the
    /// worker RPC dispatch when a `CrossingInc` arrives from another node
    /// that just received a handle to a proclet resident here (spec §3.2,
    /// §4.F `update_ref_cnt`). Fails if `id` isn't resident, or is already
    /// past the point where its owner called `destruct`.
    pub fn crossing_inc(&self, id: ProcletId) -> anyhow::Result<()> {
        let entry = self
            .entries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| rtanyhow!(ERR_INTERNAL, "crossing_inc: unknown proclet {}", id))?;
        let owner = entry.owner_handle.lock();
        let handle = owner.as_ref().ok_or_else(|| {
            rtanyhow!(ERR_INTERNAL, "crossing_inc: proclet {} is already destructing", id)
        })?;
        entry.crossing_refs.lock().push(handle.clone());
        Ok(())
    }

    /// Releases one distributed reference taken by a prior `crossing_inc`.
    /// If this happens to drop the last outstanding reference (the owner
    /// already called `destruct` and is only waiting on remote holders),
    /// `TableDropHook::on_zero_refs` runs synchronously on this call stack.
    pub fn crossing_dec(&self, id: ProcletId) -> anyhow::Result<()> {
        let entry = self
            .entries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| rtanyhow!(ERR_INTERNAL, "crossing_dec: unknown proclet {}", id))?;
        let handle = entry.crossing_refs.lock().pop().ok_or_else(|| {
            rtanyhow!(ERR_INTERNAL, "crossing_dec: proclet {} has no outstanding crossing refs", id)
        })?;
        drop(handle);
        Ok(())
    }

    /// Drops the table's own baseline reference. If no crossing reference is
    /// outstanding this finalizes teardown immediately; otherwise teardown
    /// is deferred until the last `crossing_dec` releases its clone.
    pub fn destruct(&self, id: ProcletId) -> anyhow::Result<()> {
        self.status.set_status(id, Status::Destructing);
        self.quiesce(id);
        let entry = self
            .entries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| rtanyhow!(ERR_INTERNAL, "destruct: unknown proclet {}", id))?;
        let owner = entry
            .owner_handle
            .lock()
            .take()
            .ok_or_else(|| rtanyhow!(ERR_INTERNAL, "destruct: proclet {} already destructing", id))?;
        drop(owner);
        Ok(())
    }

    /// The actual teardown, run once the distributed reference count hits
    /// zero: drains any local invocation that slipped in before
    /// `Destructing` was set (the same race `take_for_migration` would hit
    /// if a concurrent `try_local_invoke` still held its own `Arc<Entry>`
    /// clone), then removes the entry and runs the user destructor.
    fn finalize_destruct(&self, id: ProcletId) {
        self.status.set_status(id, Status::Destructing);
        for _ in 0..10_000 {
            let entry = match self.entries.write().remove(&id) {
                Some(e) => e,
                None => return,
            };
            match Arc::try_unwrap(entry) {
                Ok(entry) => {
                    entry.object.into_inner().on_destruct();
                    self.status.invalidate_cache(id);
                    return;
                }
                Err(entry) => {
                    self.entries.write().insert(id, entry);
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    struct Counter(AtomicBool);
    impl ProcletObject for Counter {
        fn on_destruct(&mut self) {
            self.0.store(true, Ordering::Relaxed);
        }

        fn invoke(&mut self, method: &str, _args: &[u8]) -> anyhow::Result<Vec<u8>> {
            match method {
                "ping" => Ok(b"pong".to_vec()),
                other => Err(rtanyhow!(ERR_INTERNAL, "Counter has no method {:?}", other)),
            }
        }
    }

    #[test]
    fn try_local_invoke_runs_when_present() {
        let slabs = Arc::new(SlabTable::new(1));
        let table = ProcletTable::new(NodeIp(Ipv4Addr::new(127, 0, 0, 1)), slabs);
        let id = ProcletId(0x8000_0000);
        table.install(id, Box::new(Counter(AtomicBool::new(false))));
        let ran = table.try_local_invoke(id, |_o| 42);
        assert_eq!(ran, Some(42));
    }

    #[test]
    fn dispatch_local_runs_a_marshalled_method() {
        let slabs = Arc::new(SlabTable::new(1));
        let table = ProcletTable::new(NodeIp(Ipv4Addr::new(127, 0, 0, 1)), slabs);
        let id = ProcletId(0x8000_0000);
        table.install(id, Box::new(Counter(AtomicBool::new(false))));
        let reply = table.dispatch_local(id, "ping", b"").unwrap().unwrap();
        assert_eq!(reply, b"pong");
    }

    #[test]
    fn absent_proclet_falls_back() {
        let slabs = Arc::new(SlabTable::new(1));
        let table = ProcletTable::new(NodeIp(Ipv4Addr::new(127, 0, 0, 1)), slabs);
        let id = ProcletId(0x8000_0000);
        assert_eq!(table.try_local_invoke(id, |_o: &mut dyn ProcletObject| 1), None);
    }

    #[test]
    fn migrating_proclet_blocks_fast_path() {
        let slabs = Arc::new(SlabTable::new(1));
        let table = ProcletTable::new(NodeIp(Ipv4Addr::new(127, 0, 0, 1)), slabs);
        let id = ProcletId(0x8000_0000);
        table.install(id, Box::new(Counter(AtomicBool::new(false))));
        table.begin_migration(id).unwrap();
        assert_eq!(table.try_local_invoke(id, |_o| 1), None);
    }

    #[test]
    fn destruct_runs_the_user_destructor_once_refs_are_gone() {
        let slabs = Arc::new(SlabTable::new(1));
        let table = ProcletTable::new(NodeIp(Ipv4Addr::new(127, 0, 0, 1)), slabs);
        let id = ProcletId(0x8000_0000);
        let destructed = Arc::new(AtomicBool::new(false));
        struct Probe(Arc<AtomicBool>);
        impl ProcletObject for Probe {
            fn on_destruct(&mut self) {
                self.0.store(true, Ordering::Relaxed);
            }
            fn invoke(&mut self, _method: &str, _args: &[u8]) -> anyhow::Result<Vec<u8>> {
                Ok(Vec::new())
            }
        }
        table.install(id, Box::new(Probe(destructed.clone())));
        table.destruct(id).unwrap();
        assert!(destructed.load(Ordering::Relaxed));
    }

    #[test]
    fn destruct_is_deferred_while_a_crossing_ref_is_outstanding() {
        let slabs = Arc::new(SlabTable::new(1));
        let table = ProcletTable::new(NodeIp(Ipv4Addr::new(127, 0, 0, 1)), slabs);
        let id = ProcletId(0x8000_0000);
        let destructed = Arc::new(AtomicBool::new(false));
        struct Probe(Arc<AtomicBool>);
        impl ProcletObject for Probe {
            fn on_destruct(&mut self) {
                self.0.store(true, Ordering::Relaxed);
            }
            fn invoke(&mut self, _method: &str, _args: &[u8]) -> anyhow::Result<Vec<u8>> {
                Ok(Vec::new())
            }
        }
        table.install(id, Box::new(Probe(destructed.clone())));
        table.crossing_inc(id).unwrap();
        table.destruct(id).unwrap();
        assert!(!destructed.load(Ordering::Relaxed), "still held by a crossing ref");
        table.crossing_dec(id).unwrap();
        assert!(destructed.load(Ordering::Relaxed));
    }
}
