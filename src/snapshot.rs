//! SnapshotGuard: freezes every live member for a serialization pass.
//!
//! Acquisition follows the global lock order. The directory's shared lock
//! is taken first and held for the guard's whole life, so no object can be
//! registered, published or removed while the snapshot is open; then every
//! live member's content mutex is locked in arena order. Members whose
//! teardown already began are skipped.

use crate::allocator::HandleAllocator;
use crate::directory::{Directory, State};
use crate::handle::{Handle, RawHandle};
use crate::object::{Managed, MemberKey};
use crate::reentrancy::ReentrancyGuard;
use core::hash::BuildHasher;
use lock_api::ArcMutexGuard;
use parking_lot::{RawMutex, RwLockReadGuard};
use slotmap::SecondaryMap;
use std::collections::hash_map::RandomState;
use std::sync::Arc;
use tracing::debug;

pub struct SnapshotGuard<'a, T, S = RandomState>
where
    T: Managed,
{
    // Fields drop in declaration order: object locks, then the directory
    // lock, then the strong references (whose release may run an owner's
    // `Drop`, which needs the directory again).
    locked: Vec<ArcMutexGuard<RawMutex, T::Content>>,
    state: RwLockReadGuard<'a, State<T, S>>,
    _scan: ReentrancyGuard<'a>,
    positions: SecondaryMap<MemberKey, usize>,
    objects: Vec<Arc<T>>,
}

impl<'a, T, S> SnapshotGuard<'a, T, S>
where
    T: Managed,
    S: BuildHasher + Clone,
{
    /// Blocks until the directory's shared lock and every member's content
    /// lock are held.
    ///
    /// The calling thread must not hold any member's content lock, and must
    /// not call into `dir` until the guard is dropped (debug builds panic if
    /// it does).
    pub fn acquire(dir: &'a Directory<T, S>) -> Self {
        let (scan, state) = dir.scan();
        let mut positions = SecondaryMap::with_capacity(state.members.len());
        let mut objects = Vec::with_capacity(state.members.len());
        for (key, weak) in state.members.iter() {
            if let Some(obj) = weak.upgrade() {
                positions.insert(key, objects.len());
                objects.push(obj);
            }
        }
        let locked = objects.iter().map(|o| o.content().lock_arc()).collect();
        debug!(
            members = state.members.len(),
            locked = objects.len(),
            "snapshot acquired"
        );
        Self {
            locked,
            state,
            _scan: scan,
            positions,
            objects,
        }
    }

    /// Number of objects frozen by this guard.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Every frozen object with its content, in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<T>, &T::Content)> {
        self.objects.iter().zip(self.locked.iter().map(|g| &**g))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Arc<T>, &mut T::Content)> {
        self.objects
            .iter()
            .zip(self.locked.iter_mut().map(|g| &mut **g))
    }

    /// Handle lookup served from the state this guard already holds, for
    /// use while calling into the directory itself is off limits.
    pub fn lookup(&self, raw: RawHandle) -> Option<(&Arc<T>, &T::Content)> {
        let h = Handle::new(raw)?;
        let key = *self.state.handles.get(&h)?;
        let &i = self.positions.get(key)?;
        Some((&self.objects[i], &*self.locked[i]))
    }

    /// The allocator state as of this snapshot.
    pub fn allocator(&self) -> &HandleAllocator {
        &self.state.allocator
    }

    /// Handles still indexed for members whose teardown began before the
    /// guard was taken, ascending.
    pub(crate) fn orphaned_handles(&self) -> Vec<Handle> {
        let mut orphaned: Vec<Handle> = self
            .state
            .handles
            .iter()
            .filter(|&(_, &key)| !self.positions.contains_key(key))
            .map(|(&h, _)| h)
            .collect();
        orphaned.sort_unstable();
        orphaned
    }
}

impl<T, S> core::fmt::Debug for SnapshotGuard<'_, T, S>
where
    T: Managed,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SnapshotGuard")
            .field("locked", &self.objects.len())
            .field("members", &self.state.members.len())
            .finish()
    }
}
