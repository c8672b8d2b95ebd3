//! Proclet reference counting. Grounded directly on `utils/marc.rs`'s
//! intrusive `Marc<T>` (the same Release/Acquire fence dance as
//! `Arc::drop`), generalized for "crossing" references: a clone that
//! outlives the node it was taken on has to tell the *owning* node about
//! the extra/removed reference via an async RPC instead of a purely local
//! atomic op (spec §3.2, §4.F).
use crate::commons::ProcletId;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};

/// Runs when a proclet's global reference count reaches zero: the user
/// destructor, then slab teardown, then a controller notification. Supplied
/// by whatever owns the proclet table (`ProcletRuntime` in `proclet::mod`).
pub trait ProcletDrop {
    fn on_zero_refs(&self, id: ProcletId);
}

struct Inner<D: ProcletDrop> {
    id: ProcletId,
    rc: AtomicUsize,
    drop_hook: D,
}

/// A reference-counted handle to a proclet. Local clones are a plain atomic
/// increment/decrement exactly like `Arc`; a handle crossing to a different
/// node (returned from a remote invocation, or captured by a migrating
/// thread) is expected to be paired with an explicit `crossing_inc`/
/// `crossing_dec` RPC to the owning node, done by the caller at the RPC
/// boundary rather than here, since only the RPC layer knows whether a given
/// clone is "local" or "crossing".
pub struct Proclet<D: ProcletDrop> {
    ptr: NonNull<Inner<D>>,
    _marker: PhantomData<Inner<D>>,
}

unsafe impl<D: ProcletDrop + Send + Sync> Send for Proclet<D> {}
unsafe impl<D: ProcletDrop + Send + Sync> Sync for Proclet<D> {}

const MAX_REFCOUNT: usize = isize::MAX as usize;

impl<D: ProcletDrop> Proclet<D> {
    pub fn new(id: ProcletId, drop_hook: D) -> Proclet<D> {
        let b = Box::new(Inner {
            id,
            rc: AtomicUsize::new(1),
            drop_hook,
        });
        Proclet {
            ptr: Box::leak(b).into(),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> ProcletId {
        self.inner().id
    }

    pub fn ref_count(&self) -> usize {
        self.inner().rc.load(Ordering::Relaxed)
    }

    fn inner(&self) -> &Inner<D> {
        unsafe { self.ptr.as_ref() }
    }

    fn from_inner(ptr: NonNull<Inner<D>>) -> Self {
        Proclet {
            ptr,
            _marker: PhantomData,
        }
    }
}

impl<D: ProcletDrop> Clone for Proclet<D> {
    fn clone(&self) -> Self {
        let rc = self.inner().rc.fetch_add(1, Ordering::Relaxed);
        assert!(rc <= MAX_REFCOUNT, "Proclet::clone: refcount overflow");
        Self::from_inner(self.ptr)
    }
}

impl<D: ProcletDrop> Drop for Proclet<D> {
    fn drop(&mut self) {
        if self.inner().rc.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        let id = self.inner().id;
        self.inner().drop_hook.on_zero_refs(id);
        unsafe {
            Box::from_raw(self.ptr.as_ptr());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct CountingDrop(Arc<AtomicU32>);
    impl ProcletDrop for CountingDrop {
        fn on_zero_refs(&self, _id: ProcletId) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn drops_exactly_once_when_last_clone_goes() {
        let drops = Arc::new(AtomicU32::new(0));
        let id = ProcletId(0x8000_0000);
        let p = Proclet::new(id, CountingDrop(drops.clone()));
        let p2 = p.clone();
        assert_eq!(p.ref_count(), 2);
        drop(p2);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        drop(p);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
