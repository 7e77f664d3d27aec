//! HandleAllocator: issues non-zero handles and recycles released ones.
//!
//! Plain, non-atomic state. The directory only calls into it while holding
//! its exclusive lock (or through `&mut`), so no synchronization lives here.

use crate::handle::{Handle, RawHandle};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HandleAllocator {
    /// Highest value ever issued; zero before the first allocation.
    last: RawHandle,
    /// Released handles, reused oldest first.
    free: VecDeque<Handle>,
}

impl HandleAllocator {
    pub const fn new() -> Self {
        Self {
            last: 0,
            free: VecDeque::new(),
        }
    }

    /// Returns a handle not currently issued. Prefers the oldest released
    /// value, otherwise the next never-issued one.
    pub fn allocate(&mut self) -> Handle {
        if let Some(h) = self.free.pop_front() {
            return h;
        }
        let next = self.last.wrapping_add(1);
        if next == 0 {
            // Same policy as Rc on refcount overflow.
            std::process::abort();
        }
        self.last = next;
        match Handle::new(next) {
            Some(h) => h,
            None => unreachable!("counter skips zero"),
        }
    }

    /// Returns `h` to the reuse pool.
    pub fn release(&mut self, h: Handle) {
        assert!(
            h.get() <= self.last,
            "release of handle {h} that was never issued"
        );
        debug_assert!(!self.free.contains(&h), "handle {h} released twice");
        self.free.push_back(h);
    }

    pub fn reset(&mut self) {
        self.last = 0;
        self.free.clear();
    }

    /// Number of handles currently out on loan.
    pub fn issued(&self) -> usize {
        let issued = self.last - self.free.len() as u64;
        usize::try_from(issued).unwrap_or(usize::MAX)
    }

    pub fn is_issued(&self, h: Handle) -> bool {
        h.get() <= self.last && !self.free.contains(&h)
    }

    pub fn high_water(&self) -> RawHandle {
        self.last
    }

    /// Released handles, in reuse order.
    pub fn pooled(&self) -> impl Iterator<Item = Handle> + '_ {
        self.free.iter().copied()
    }

    /// Every pooled value was issued at some point and appears once.
    pub fn is_consistent(&self) -> bool {
        let mut seen = hashbrown::HashSet::with_capacity(self.free.len());
        self.free
            .iter()
            .all(|h| h.get() <= self.last && seen.insert(*h))
    }

    /// Rebuilds the pool so that exactly `live` is issued: live values
    /// leave the pool, the counter rises past the largest one, and every
    /// other value up to the counter becomes reusable. Pooled values keep
    /// their order; recovered ones follow in ascending order.
    ///
    /// Walks every value up to the counter. Returns how many values changed
    /// hands (withdrawn plus recovered).
    pub fn reconcile<I>(&mut self, live: I) -> usize
    where
        I: IntoIterator<Item = Handle>,
    {
        let live: hashbrown::HashSet<Handle> = live.into_iter().collect();
        if let Some(max) = live.iter().map(|h| h.get()).max() {
            self.last = self.last.max(max);
        }
        let pooled = self.free.len();
        self.free.retain(|h| !live.contains(h));
        let withdrawn = pooled - self.free.len();

        let known: hashbrown::HashSet<Handle> = self.free.iter().copied().collect();
        let kept = self.free.len();
        for h in (1..=self.last).filter_map(Handle::new) {
            if !live.contains(&h) && !known.contains(&h) {
                self.free.push_back(h);
            }
        }
        withdrawn + (self.free.len() - kept)
    }
}
