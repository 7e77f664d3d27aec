//! handle-directory: a concurrent, handle-indexed directory of live objects
//! with weak back-references, whole-graph snapshots and versioned images.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: make "handle -> object" lookup an atomic, race-free primitive for
//!   an object graph shared across threads, and keep identity and lifetime
//!   bookkeeping in one place.
//! - Layers:
//!   - HandleAllocator: plain state issuing non-zero handles and recycling
//!     released ones; only ever touched under the directory's write lock.
//!   - Directory<T, S>: membership arena (`SlotMap` of `Weak<T>`) plus a
//!     handle index (`hashbrown::HashMap<Handle, MemberKey>`) behind one
//!     `parking_lot::RwLock`.
//!   - SnapshotGuard: holds the directory's shared lock and every member's
//!     content lock for the length of a serialization pass.
//!   - codec: versioned images driven through the guard (save) and a single
//!     staged swap (load).
//!
//! Ownership
//! - Callers own objects as `Arc<T>`; the directory keeps `Weak<T>` only.
//! - `lookup_owned` upgrades while the shared lock is held, so it returns
//!   either a live object or nothing. An object whose strong count reached
//!   zero cannot be upgraded, even if its `remove` has not run yet.
//! - Objects call [`Directory::remove`] before their storage goes away,
//!   typically from `Drop`. References the directory creates internally are
//!   always released after its lock, so such a `Drop` never self-deadlocks.
//!
//! Lock order
//! - Directory lock first, then any object's own content lock; never the
//!   reverse. The guard follows it, and so must callers.
//! - A thread inside a `filter` predicate or holding a `SnapshotGuard` must
//!   not call back into the same directory; debug builds detect this.
//!
//! Invariant violations
//! - Double registration, a second handle, removal of a non-member: these
//!   mean the bookkeeping is already wrong, so they panic. Checks run before
//!   any mutation, and `parking_lot` locks do not poison.
//! - Not-found is `None`. Only the persistence boundary returns errors
//!   ([`CodecError`]).
//!
//! Generations
//! - `clear` and every successful `codec::load` start a new epoch. Removing
//!   an object left over from an earlier epoch is a no-op, so stale objects
//!   can still run their normal teardown.
//! - Links also record which directory they joined. Removing an object from
//!   any other directory panics, whatever its epoch.
//!
//! Images
//! - An image issues exactly the handles it contains: handles of members
//!   already in teardown at save time are written back as free.

mod allocator;
pub mod codec;
mod directory;
mod directory_proptest;
mod error;
mod handle;
mod object;
mod reentrancy;
mod snapshot;

#[cfg(test)]
mod testing;

// Public surface
pub use allocator::HandleAllocator;
pub use codec::Persist;
pub use directory::Directory;
pub use error::{CodecError, CodecResult};
pub use handle::{Handle, RawHandle, NULL_HANDLE};
pub use object::{Link, Managed, MemberKey};
pub use snapshot::SnapshotGuard;
