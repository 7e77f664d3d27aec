//! Directory: membership arena plus handle index behind one reader/writer lock.

use crate::allocator::HandleAllocator;
use crate::handle::{Handle, RawHandle};
use crate::object::{Managed, MemberKey, Membership};
use crate::reentrancy::{DebugReentrancy, ReentrancyGuard};
use core::hash::BuildHasher;
use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use slotmap::SlotMap;
use std::collections::hash_map::RandomState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Source of directory identities. Links remember which directory they
/// joined, so a removal from the wrong directory is always caught.
static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Everything the directory lock protects.
pub(crate) struct State<T, S> {
    /// Identity of the directory this state belongs to.
    pub(crate) owner: u64,
    /// Generation this state belongs to; links from other generations are
    /// ignored on removal.
    pub(crate) epoch: u64,
    /// Every registered object, public or private.
    pub(crate) members: SlotMap<MemberKey, Weak<T>>,
    /// Handle -> member, for exactly the members carrying a handle.
    pub(crate) handles: HashMap<Handle, MemberKey, S>,
    pub(crate) allocator: HandleAllocator,
}

impl<T, S> State<T, S>
where
    T: Managed,
    S: BuildHasher,
{
    pub(crate) fn with_capacity_and_hasher(
        owner: u64,
        epoch: u64,
        capacity: usize,
        hasher: S,
    ) -> Self {
        Self {
            owner,
            epoch,
            members: SlotMap::with_capacity_and_key(capacity),
            handles: HashMap::with_capacity_and_hasher(capacity, hasher),
            allocator: HandleAllocator::new(),
        }
    }

    pub(crate) fn resolve(&self, h: Handle) -> Option<&Weak<T>> {
        let key = *self.handles.get(&h)?;
        self.members.get(key)
    }

    /// The arena key of `obj` if it is a member of this generation.
    fn key_of(&self, obj: &T) -> Option<MemberKey> {
        let m = obj.link().membership()?;
        if m.owner != self.owner || m.epoch != self.epoch {
            return None;
        }
        let w = self.members.get(m.key)?;
        core::ptr::eq(w.as_ptr(), obj).then_some(m.key)
    }

    pub(crate) fn insert_member(&mut self, obj: &Arc<T>) -> MemberKey {
        assert!(
            obj.link().membership().is_none(),
            "object registered twice"
        );
        let key = self.members.insert(Arc::downgrade(obj));
        obj.link().bind(Membership {
            owner: self.owner,
            epoch: self.epoch,
            key,
        });
        key
    }

    fn assign(&mut self, obj: &T) -> Handle {
        if let Some(h) = obj.link().handle() {
            panic!("object already carries handle {h}");
        }
        let key = self
            .key_of(obj)
            .unwrap_or_else(|| panic!("handle requested for an object that is not a member"));
        let h = self.allocator.allocate();
        let prev = self.handles.insert(h, key);
        assert!(prev.is_none(), "allocator issued live handle {h}");
        obj.link().publish(h);
        h
    }

    fn remove(&mut self, obj: &T) {
        let link = obj.link();
        let m = link
            .membership()
            .unwrap_or_else(|| panic!("remove of an object that was never registered"));
        assert_eq!(m.owner, self.owner, "remove of an object that is not a member");
        if m.epoch != self.epoch {
            debug!(
                epoch = m.epoch,
                current = self.epoch,
                "ignoring removal of an object from a discarded generation"
            );
            return;
        }
        let is_member = self
            .members
            .get(m.key)
            .is_some_and(|w| core::ptr::eq(w.as_ptr(), obj));
        assert!(is_member, "remove of an object that is not a member");
        if let Some(h) = link.handle() {
            let mapped = self.handles.remove(&h);
            assert_eq!(mapped, Some(m.key), "handle map out of sync for {h}");
            self.allocator.release(h);
        }
        self.members.remove(m.key);
        trace!(key = ?m.key, handle = link.raw_handle(), "removed");
    }
}

/// A shared, handle-indexed directory of live objects.
///
/// The directory holds only weak references; callers own the objects
/// through `Arc<T>` and must call [`Directory::remove`] before an object's
/// storage goes away (typically from its `Drop`).
///
/// Lock order: the directory lock is always taken before any object's own
/// content lock, never the reverse.
pub struct Directory<T, S = RandomState> {
    state: RwLock<State<T, S>>,
    /// Next unused generation number.
    epochs: AtomicU64,
    reentrancy: DebugReentrancy,
}

impl<T> Directory<T>
where
    T: Managed,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<T> Default for Directory<T>
where
    T: Managed,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> Directory<T, S>
where
    T: Managed,
    S: BuildHasher + Clone,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            state: RwLock::new(State::with_capacity_and_hasher(
                NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
                0,
                capacity,
                hasher,
            )),
            epochs: AtomicU64::new(1),
            reentrancy: DebugReentrancy::new(),
        }
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.reentrancy.check();
        self.state.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of objects reachable by handle.
    pub fn handle_count(&self) -> usize {
        self.reentrancy.check();
        self.state.read().handles.len()
    }

    /// Adds `obj` to the membership set. It is not reachable by handle
    /// until [`assign_handle`](Self::assign_handle) is called.
    ///
    /// # Panics
    ///
    /// If `obj` was registered before.
    pub fn register(&self, obj: &Arc<T>) {
        self.reentrancy.check();
        let key = self.state.write().insert_member(obj);
        trace!(?key, "registered");
    }

    /// Issues a handle for a registered object and makes it public.
    ///
    /// # Panics
    ///
    /// If `obj` already has a handle or is not a member.
    pub fn assign_handle(&self, obj: &T) -> Handle {
        self.reentrancy.check();
        let h = self.state.write().assign(obj);
        trace!(handle = h.get(), "handle assigned");
        h
    }

    /// Drops `obj` from the directory and recycles its handle, if any.
    ///
    /// # Panics
    ///
    /// If `obj` is not a member of the current generation. Objects left
    /// over from before a [`clear`](Self::clear) or load are ignored.
    pub fn remove(&self, obj: &T) {
        self.reentrancy.check();
        self.state.write().remove(obj);
    }

    pub fn contains(&self, obj: &T) -> bool {
        self.reentrancy.check();
        self.state.read().key_of(obj).is_some()
    }

    /// Non-owning lookup. The null handle returns `None` without locking.
    pub fn lookup(&self, raw: RawHandle) -> Option<Weak<T>> {
        let h = Handle::new(raw)?;
        self.reentrancy.check();
        self.state.read().resolve(h).cloned()
    }

    /// Lookup that returns a strong reference usable after the lock is gone.
    ///
    /// The reference is taken while the shared lock still excludes
    /// `remove`, so the result is either a live object or `None`; an object
    /// whose teardown already started is never returned.
    pub fn lookup_owned(&self, raw: RawHandle) -> Option<Arc<T>> {
        let h = Handle::new(raw)?;
        self.reentrancy.check();
        let state = self.state.read();
        state.resolve(h)?.upgrade()
    }

    /// Collects every live member for which `predicate` holds.
    ///
    /// The shared lock is held for the whole scan; `predicate` must not
    /// call back into this directory (debug builds panic if it does).
    pub fn filter<P>(&self, mut predicate: P) -> Vec<Arc<T>>
    where
        P: FnMut(&T) -> bool,
    {
        let mut matched = Vec::new();
        let mut rejected = Vec::new();
        {
            let _scan = self.reentrancy.enter();
            let state = self.state.read();
            for (_, weak) in state.members.iter() {
                let Some(obj) = weak.upgrade() else {
                    continue;
                };
                if predicate(&obj) {
                    matched.push(obj);
                } else {
                    rejected.push(obj);
                }
            }
        }
        // May hold last references; their owners' Drop may call `remove`.
        drop(rejected);
        matched
    }

    /// Strong references to every live member.
    pub fn members(&self) -> Vec<Arc<T>> {
        self.filter(|_| true)
    }

    /// Empties the directory and resets the allocator. Exclusive access is
    /// proven by `&mut self`, so no lock is taken.
    pub fn clear(&mut self) {
        let epoch = self.bump_epoch();
        let state = self.state.get_mut();
        state.members.clear();
        state.handles.clear();
        state.allocator.reset();
        state.epoch = epoch;
        debug!(epoch, "directory cleared");
    }

    /// [`register`](Self::register) without locking.
    pub fn register_mut(&mut self, obj: &Arc<T>) {
        let key = self.state.get_mut().insert_member(obj);
        trace!(?key, "registered");
    }

    /// [`lookup_owned`](Self::lookup_owned) without locking.
    pub fn lookup_mut(&mut self, raw: RawHandle) -> Option<Arc<T>> {
        let h = Handle::new(raw)?;
        self.state.get_mut().resolve(h)?.upgrade()
    }

    /// Copy of the allocator state.
    pub fn allocator(&self) -> HandleAllocator {
        self.reentrancy.check();
        self.state.read().allocator.clone()
    }

    /// Asserts that the membership set, the handle map and the allocator
    /// agree with each other.
    ///
    /// # Panics
    ///
    /// On the first inconsistency found.
    pub fn check_invariants(&self) {
        self.reentrancy.check();
        // Upgraded members outlive the lock; see `filter`.
        let mut held = Vec::new();
        let state = self.state.read();
        for (&h, &key) in state.handles.iter() {
            let weak = state
                .members
                .get(key)
                .unwrap_or_else(|| panic!("handle {h} maps to a removed member"));
            assert!(
                state.allocator.is_issued(h),
                "handle {h} is mapped but not issued"
            );
            if let Some(obj) = weak.upgrade() {
                assert_eq!(obj.link().handle(), Some(h), "member disagrees on its handle");
                held.push(obj);
            }
        }
        for (key, weak) in state.members.iter() {
            let Some(obj) = weak.upgrade() else {
                continue;
            };
            let link = obj.link();
            assert_eq!(link.member_key(), Some(key), "member disagrees on its key");
            if let Some(h) = link.handle() {
                assert_eq!(state.handles.get(&h), Some(&key), "public member {h} not indexed");
            }
            held.push(obj);
        }
        assert_eq!(
            state.allocator.issued(),
            state.handles.len(),
            "issued handles disagree with the handle map"
        );
    }

    fn bump_epoch(&mut self) -> u64 {
        let next = self.epochs.get_mut();
        let epoch = *next;
        *next += 1;
        epoch
    }

    pub(crate) fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    /// A fresh, empty state sharing this directory's hasher.
    pub(crate) fn empty_state(&self, epoch: u64, capacity: usize) -> State<T, S> {
        self.reentrancy.check();
        let (owner, hasher) = {
            let state = self.state.read();
            (state.owner, state.handles.hasher().clone())
        };
        State::with_capacity_and_hasher(owner, epoch, capacity, hasher)
    }

    /// Swaps in a fully built state under the write lock.
    pub(crate) fn install(&self, staged: State<T, S>) {
        self.reentrancy.check();
        let old = core::mem::replace(&mut *self.state.write(), staged);
        drop(old);
    }

    /// Opens a scan: shared lock held, re-entry from this thread rejected.
    pub(crate) fn scan(&self) -> (ReentrancyGuard<'_>, RwLockReadGuard<'_, State<T, S>>) {
        let scan = self.reentrancy.enter();
        (scan, self.state.read())
    }
}

impl<T, S> core::fmt::Debug for Directory<T, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Directory")
            .field("epoch", &state.epoch)
            .field("members", &state.members.len())
            .field("handles", &state.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Node;
    use std::collections::BTreeSet;

    /// Invariant: registration alone does not make an object reachable by handle.
    #[test]
    fn register_is_private_until_handle_assigned() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.handle_count(), 0);
        assert!(dir.contains(&a));
        assert!(!a.link().is_public());

        let h = dir.assign_handle(&a);
        assert_eq!(a.link().handle(), Some(h));
        assert_eq!(dir.handle_count(), 1);
        let found = dir.lookup_owned(h.get()).expect("public object resolves");
        assert!(Arc::ptr_eq(&found, &a));
        dir.check_invariants();
    }

    /// Invariant: handle zero and unknown handles are simply absent.
    #[test]
    fn null_and_unknown_handles_are_absent() {
        let dir: Directory<Node> = Directory::new();
        assert!(dir.lookup(0).is_none());
        assert!(dir.lookup_owned(0).is_none());
        assert!(dir.lookup(12345).is_none());
        assert!(dir.lookup_owned(12345).is_none());
    }

    #[test]
    fn lookup_returns_weak_reference() {
        let dir = Directory::new();
        let a = Node::new(5);
        dir.register(&a);
        let h = dir.assign_handle(&a);
        let weak = dir.lookup(h.get()).unwrap();
        assert!(core::ptr::eq(weak.as_ptr(), Arc::as_ptr(&a)));
        assert_eq!(Arc::strong_count(&a), 1, "lookup must not take a stake");
    }

    /// Invariant: after `remove`, the former handle no longer resolves and may
    /// be handed out again.
    #[test]
    fn remove_recycles_handle() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        let h = dir.assign_handle(&a);
        dir.remove(&a);
        assert!(dir.lookup(h.get()).is_none());
        assert!(!dir.contains(&a));
        assert!(dir.is_empty());

        let b = Node::new(2);
        dir.register(&b);
        assert_eq!(dir.assign_handle(&b), h);
        dir.check_invariants();
    }

    #[test]
    fn private_members_remove_cleanly() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        dir.remove(&a);
        assert!(dir.is_empty());
        assert_eq!(dir.allocator().issued(), 0);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_register_panics() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        dir.register(&a);
    }

    #[test]
    #[should_panic(expected = "already carries handle")]
    fn second_handle_panics() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        dir.assign_handle(&a);
        dir.assign_handle(&a);
    }

    #[test]
    #[should_panic(expected = "not a member")]
    fn handle_for_unregistered_object_panics() {
        let dir: Directory<Node> = Directory::new();
        let a = Node::new(1);
        dir.assign_handle(&a);
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn remove_of_unregistered_object_panics() {
        let dir: Directory<Node> = Directory::new();
        let a = Node::new(1);
        dir.remove(&a);
    }

    #[test]
    #[should_panic(expected = "not a member")]
    fn double_remove_panics() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        dir.remove(&a);
        dir.remove(&a);
    }

    #[test]
    #[should_panic(expected = "not a member")]
    fn remove_from_foreign_directory_panics() {
        let home = Directory::new();
        let other: Directory<Node> = Directory::new();
        let a = Node::new(1);
        home.register(&a);
        let b = Node::new(2);
        other.register(&b);
        other.remove(&a);
    }

    /// Invariant: a generation change in one directory never turns another
    /// directory's member into a tolerated stale removal.
    #[test]
    fn remove_from_foreign_directory_after_clear_panics() {
        let home = Directory::new();
        let mut other: Directory<Node> = Directory::new();
        let a = Node::new(1);
        home.register(&a);
        home.assign_handle(&a);
        other.clear();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| other.remove(&a)));
        assert!(res.is_err(), "foreign remove must be rejected");
        assert!(home.contains(&a));
        home.check_invariants();
    }

    /// Invariant: a failed invariant check leaves the directory usable and
    /// unchanged (checks run before mutation).
    #[test]
    fn rejected_assignment_leaves_state_intact() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        let h = dir.assign_handle(&a);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dir.assign_handle(&a);
        }));
        assert!(res.is_err());
        assert_eq!(dir.handle_count(), 1);
        assert_eq!(dir.allocator().issued(), 1);
        assert!(dir.lookup_owned(h.get()).is_some());
        dir.check_invariants();
    }

    #[test]
    fn filter_scans_private_and_public_members() {
        let dir = Directory::new();
        let nodes: Vec<_> = (0..6).map(Node::new).collect();
        for (i, n) in nodes.iter().enumerate() {
            dir.register(n);
            if i % 2 == 0 {
                dir.assign_handle(n);
            }
        }
        let even: BTreeSet<i64> = dir
            .filter(|n| n.value() % 2 == 0)
            .iter()
            .map(|n| n.value())
            .collect();
        assert_eq!(even, BTreeSet::from([0, 2, 4]));
        assert_eq!(dir.members().len(), 6);
        let private = dir.filter(|n| !n.link().is_public());
        assert_eq!(private.len(), 3);
    }

    #[test]
    fn filter_skips_objects_in_teardown() {
        let dir = Directory::new();
        let a = Node::new(1);
        let b = Node::new(2);
        dir.register(&a);
        dir.register(&b);
        let weak_b = Arc::downgrade(&b);
        // `b` is gone without having been removed; the directory still lists it.
        drop(b);
        assert_eq!(dir.len(), 2);
        let all = dir.members();
        assert_eq!(all.len(), 1);
        assert!(Arc::ptr_eq(&all[0], &a));
        assert!(weak_b.upgrade().is_none());
    }

    #[test]
    fn clear_discards_everything_and_ignores_stale_removals() {
        let mut dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        let h = dir.assign_handle(&a);
        dir.clear();
        assert!(dir.is_empty());
        assert_eq!(dir.handle_count(), 0);
        assert!(dir.lookup(h.get()).is_none());
        assert_eq!(dir.allocator(), HandleAllocator::new());
        assert!(!dir.contains(&a));
        // Leftover from the previous generation: a no-op, not a violation.
        dir.remove(&a);

        let b = Node::new(2);
        dir.register_mut(&b);
        assert_eq!(dir.assign_handle(&b).get(), 1);
        assert!(dir.lookup_mut(1).is_some());
        assert!(dir.lookup_mut(0).is_none());
        dir.check_invariants();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn reentry_from_filter_predicate_panics_in_debug() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dir.filter(|n| dir.contains(n));
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
        // Lock and scan marker were both released by the unwind.
        assert!(dir.contains(&a));
    }

    #[test]
    fn custom_hasher_is_honoured() {
        #[derive(Clone, Default)]
        struct ConstBuildHasher;
        struct ConstHasher;
        impl BuildHasher for ConstBuildHasher {
            type Hasher = ConstHasher;
            fn build_hasher(&self) -> Self::Hasher {
                ConstHasher
            }
        }
        impl core::hash::Hasher for ConstHasher {
            fn write(&mut self, _bytes: &[u8]) {}
            // Every handle lands in the same bucket.
            fn finish(&self) -> u64 {
                0
            }
        }

        let dir: Directory<Node, ConstBuildHasher> =
            Directory::with_capacity_and_hasher(8, ConstBuildHasher);
        let nodes: Vec<_> = (0..8).map(Node::new).collect();
        let handles: Vec<_> = nodes
            .iter()
            .map(|n| {
                dir.register(n);
                dir.assign_handle(n)
            })
            .collect();
        for (n, h) in nodes.iter().zip(&handles) {
            let found = dir.lookup_owned(h.get()).unwrap();
            assert!(Arc::ptr_eq(&found, n));
        }
        dir.check_invariants();
    }

    #[test]
    fn debug_reports_counts() {
        let dir = Directory::new();
        let a = Node::new(1);
        dir.register(&a);
        dir.assign_handle(&a);
        let s = format!("{dir:?}");
        assert!(s.contains("members: 1"));
        assert!(s.contains("handles: 1"));
    }
}
