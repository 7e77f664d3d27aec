//! The contract every object stored in a [`Directory`](crate::Directory)
//! fulfils, and the bookkeeping the directory embeds in it.

use crate::handle::{Handle, RawHandle, NULL_HANDLE};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

slotmap::new_key_type! {
    /// Arena key identifying a registered object within one directory.
    pub struct MemberKey;
}

/// Where an object sits in the membership arena, of which directory, and
/// in which generation of it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Membership {
    pub(crate) owner: u64,
    pub(crate) epoch: u64,
    pub(crate) key: MemberKey,
}

/// Directory bookkeeping carried by each object.
///
/// Both cells are write-once: an object is registered at most once and
/// receives at most one handle over its whole life.
#[derive(Debug, Default)]
pub struct Link {
    member: OnceLock<Membership>,
    handle: OnceLock<Handle>,
}

impl Link {
    pub const fn new() -> Self {
        Self {
            member: OnceLock::new(),
            handle: OnceLock::new(),
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    /// The handle as an integer, [`NULL_HANDLE`] if none was assigned.
    pub fn raw_handle(&self) -> RawHandle {
        self.handle().map_or(NULL_HANDLE, Handle::get)
    }

    /// Public objects are the ones reachable through handle lookup.
    pub fn is_public(&self) -> bool {
        self.handle.get().is_some()
    }

    pub fn member_key(&self) -> Option<MemberKey> {
        self.member.get().map(|m| m.key)
    }

    pub(crate) fn membership(&self) -> Option<Membership> {
        self.member.get().copied()
    }

    pub(crate) fn bind(&self, membership: Membership) {
        assert!(
            self.member.set(membership).is_ok(),
            "object registered twice"
        );
    }

    pub(crate) fn publish(&self, handle: Handle) {
        if let Err(h) = self.handle.set(handle) {
            panic!("object already carries handle {}", self.handle().unwrap_or(h));
        }
    }
}

/// An object the directory can track.
///
/// Implementors own a [`Link`] and guard their mutable content with their
/// own mutex. The directory never touches the content; only the
/// [`SnapshotGuard`](crate::SnapshotGuard) locks it, and always after the
/// directory lock.
pub trait Managed: Send + Sync + 'static {
    type Content: Send + 'static;

    fn link(&self) -> &Link;

    fn content(&self) -> &Arc<Mutex<Self::Content>>;
}
