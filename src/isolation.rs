//! The isolation layer: a sequence lock wrapped around an owned store.
//!
//! Readers never block and never take a lock. A reader samples the version
//! counter, runs its read, then samples again; an odd value or a change
//! between samples means a writer was active and the read retries. Writers
//! serialise on a mutex and bump the version to odd for the duration of the
//! mutation, so at most one writer runs and readers can always tell whether
//! they raced one.
//!
//! Reads under this scheme can observe a store mid-mutation, which is why
//! every read path in the store returns owned copies and validates what it
//! decodes; a torn read produces a retry, never a dangling reference.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::record::{Node, NodeId, NodeType};
use crate::store::{Lattice, NameFilters};

pub struct SharedLattice {
    inner: UnsafeCell<Lattice>,
    version: AtomicU64,
    write_lock: Mutex<()>,
}

// SAFETY: all access to `inner` goes through read()/write(). Writers hold
// the mutex; readers tolerate races via the version protocol and only run
// closures that take &Lattice.
unsafe impl Send for SharedLattice {}
unsafe impl Sync for SharedLattice {}

impl SharedLattice {
    /// Wrap a store for shared use: any number of reader threads, one
    /// writer at a time.
    pub fn enable_isolation(lattice: Lattice) -> SharedLattice {
        SharedLattice {
            inner: UnsafeCell::new(lattice),
            version: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Unwrap back to exclusive use.
    pub fn disable_isolation(self) -> Lattice {
        self.inner.into_inner()
    }

    /// Run a read-only closure under the seqlock. Retries until it observes
    /// a quiescent version. The closure may run multiple times and must not
    /// have side effects.
    pub fn read<R>(&self, f: impl Fn(&Lattice) -> R) -> R {
        loop {
            let before = self.version.load(Ordering::Acquire);
            if before & 1 == 1 {
                // A writer is mid-mutation.
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: shared reference only; a concurrent writer invalidates
            // the result, which the version re-check catches, discarding it.
            let result = f(unsafe { &*self.inner.get() });
            fence(Ordering::Acquire);
            let after = self.version.load(Ordering::Acquire);
            if before == after {
                return result;
            }
        }
    }

    /// Run a mutation with the exclusive writer lock held and the version
    /// odd for the duration.
    pub fn write<R>(&self, f: impl FnOnce(&mut Lattice) -> R) -> R {
        let _guard = self.write_lock.lock();
        self.version.fetch_add(1, Ordering::AcqRel);
        // SAFETY: the mutex makes this the only &mut; readers that overlap
        // will observe the odd version and retry.
        let result = f(unsafe { &mut *self.inner.get() });
        self.version.fetch_add(1, Ordering::AcqRel);
        result
    }

    // Convenience wrappers for the common operations.

    pub fn add_with_isolation(
        &self,
        kind: NodeType,
        name: &str,
        text: &str,
        parent_id: NodeId,
    ) -> Result<NodeId> {
        self.write(|lattice| lattice.add(kind, name, text, parent_id))
    }

    pub fn add_binary_with_isolation(
        &self,
        kind: NodeType,
        name: &str,
        bytes: &[u8],
        parent_id: NodeId,
    ) -> Result<NodeId> {
        self.write(|lattice| lattice.add_binary(kind, name, bytes, parent_id))
    }

    pub fn update_with_isolation(&self, id: NodeId, text: &str) -> Result<()> {
        self.write(|lattice| lattice.update(id, text))
    }

    pub fn delete_with_isolation(&self, id: NodeId) -> Result<()> {
        self.write(|lattice| lattice.delete(id))
    }

    /// Snapshot read of one node. Never blocks writers.
    pub fn get_copy_with_isolation(&self, id: NodeId) -> Result<Node> {
        self.read(|lattice| lattice.read_copy(id))
    }

    /// Prefix/name query without index (re)building: a stale index degrades
    /// to the linear path rather than blocking on a writer.
    pub fn find_by_name_with_isolation(&self, query: &str, max: usize) -> Vec<NodeId> {
        self.read(|lattice| lattice.find_by_name_prebuilt(query, &NameFilters::default(), max))
    }
}

impl Lattice {
    /// Move this store behind the seqlock. See [`SharedLattice`].
    pub fn enable_isolation(self) -> SharedLattice {
        SharedLattice::enable_isolation(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn concurrent_readers_see_committed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iso.lat");
        let mut lattice = Lattice::init(&path, 1000, 1).unwrap();
        lattice.set_free_tier_limit(u32::MAX);
        lattice.license_state().set_counter_dir(dir.path());

        let seed = lattice
            .add(NodeType::Primitive, "ISA_SEED", "v0", 0)
            .unwrap();

        let shared = lattice.enable_isolation();
        let stop = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let shared = &shared;
            let stop = &stop;

            for _ in 0..4 {
                scope.spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let node = shared.get_copy_with_isolation(seed).unwrap();
                        assert_eq!(node.id, seed);
                        assert!(node.text().is_some());
                    }
                });
            }

            for i in 0..200 {
                let text = format!("v{}", i + 1);
                shared.update_with_isolation(seed, &text).unwrap();
            }
            stop.store(true, Ordering::Relaxed);
        });

        let mut lattice = shared.disable_isolation();
        assert_eq!(lattice.node_count(), 1);
        let node = lattice.get_copy(seed).unwrap();
        assert_eq!(node.text(), Some("v200"));
    }
}
