//! Debug-only reentrancy guard.
//!
//! While a thread holds a directory's shared lock for a scan (inside a
//! `filter` predicate, or for the life of a `SnapshotGuard`), calling back
//! into the same directory from that thread either deadlocks on the write
//! lock or can deadlock behind a queued writer. In debug builds each thread
//! keeps a stack of the trackers it is currently scanning under, and every
//! directory entry point checks it. In release builds this compiles to a
//! zero-cost no-op.

use core::marker::PhantomData;

#[cfg(debug_assertions)]
mod scans {
    use core::cell::RefCell;

    thread_local! {
        static ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn contains(id: usize) -> bool {
        ACTIVE.with(|a| a.borrow().contains(&id))
    }

    pub(super) fn push(id: usize) {
        ACTIVE.with(|a| a.borrow_mut().push(id));
    }

    pub(super) fn pop(id: usize) {
        ACTIVE.with(|a| {
            let mut a = a.borrow_mut();
            let pos = a.iter().rposition(|&x| x == id);
            debug_assert!(pos.is_some(), "scan guard released twice");
            if let Some(pos) = pos {
                a.remove(pos);
            }
        });
    }
}

/// Per-instance reentrancy tracker. Embed this in structs and guard entry
/// points with `self.reentrancy.check()`; open scans with
/// `let _g = self.reentrancy.enter();`.
#[derive(Debug)]
pub(crate) struct DebugReentrancy {
    // Gives every tracker a distinct address in debug builds.
    #[cfg(debug_assertions)]
    _anchor: u8,
}

impl DebugReentrancy {
    /// Create a new reentrancy tracker. Const so it can be a field default.
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            _anchor: 0,
        }
    }

    #[cfg(debug_assertions)]
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Panics in debug builds if the current thread is inside a scan of
    /// this tracker's owner.
    #[inline]
    pub(crate) fn check(&self) {
        #[cfg(debug_assertions)]
        assert!(
            !scans::contains(self.id()),
            "reentrancy detected: directory entered from within its own scan"
        );
    }

    /// Enter a scan. In debug builds, panics if this thread is already
    /// scanning the same owner.
    #[inline]
    pub(crate) fn enter(&self) -> ReentrancyGuard<'_> {
        self.check();
        #[cfg(debug_assertions)]
        scans::push(self.id());
        ReentrancyGuard {
            owner: self,
            _nosend: PhantomData,
        }
    }
}

/// RAII guard returned by `DebugReentrancy::enter`. Tied to the thread that
/// opened it.
pub(crate) struct ReentrancyGuard<'a> {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    owner: &'a DebugReentrancy,
    _nosend: PhantomData<*mut ()>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        scans::pop(self.owner.id());
    }
}
