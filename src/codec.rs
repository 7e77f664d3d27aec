//! Versioned persistence of a directory's population and allocator state.
//!
//! The codec sits outside the directory's runtime path. It reads through a
//! [`SnapshotGuard`] and writes back through a single staged swap, so the
//! concurrent operations never see format concerns.
//!
//! Image layout: a 4-byte little-endian version tag followed by a bincode
//! body.
//! - Version 1 (written): every member as `(handle or 0, payload)`, then the
//!   allocator. Members with a non-zero handle are the public ones.
//! - Version 0 (read only): an ordered `handle -> payload` map, then the
//!   allocator. Every object in it is public.

use crate::allocator::HandleAllocator;
use crate::directory::Directory;
use crate::error::{CodecError, CodecResult};
use crate::handle::{Handle, RawHandle};
use crate::object::Managed;
use crate::snapshot::SnapshotGuard;
use core::hash::BuildHasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use bincode::Options;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Version tag written by [`save`].
pub const CURRENT_VERSION: u32 = 1;
/// Oldest version [`load`] still reads.
pub const LEGACY_VERSION: u32 = 0;

const TAG_LEN: usize = 4;

/// How far a legacy allocator may lag behind its handle map before the
/// image is treated as corrupt. Loading walks every value up to the top
/// handle.
const LEGACY_SLACK: u64 = 1 << 16;

/// Fixed-width integers, and no bytes left over after the body.
fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// An object that can be written to and rebuilt from a directory image.
pub trait Persist: Managed + Sized {
    type Payload: Serialize + DeserializeOwned;

    /// Called once per object while its content lock is held.
    fn save(&self, content: &Self::Content) -> Self::Payload;

    /// Builds a fresh, unregistered object. Its handle and membership are
    /// restored by the codec.
    fn restore(payload: Self::Payload) -> Self;
}

#[derive(Serialize, Deserialize)]
struct ObjectRecord<P> {
    handle: RawHandle,
    payload: P,
}

#[derive(Serialize, Deserialize)]
struct ImageV1<P> {
    objects: Vec<ObjectRecord<P>>,
    allocator: HandleAllocator,
}

#[derive(Serialize, Deserialize)]
struct ImageV0<P> {
    handles: BTreeMap<RawHandle, P>,
    allocator: HandleAllocator,
}

/// Writes the snapshot as a version 1 image.
pub fn save<T, S>(guard: &SnapshotGuard<'_, T, S>) -> CodecResult<Vec<u8>>
where
    T: Persist,
    S: BuildHasher + Clone,
{
    let objects: Vec<_> = guard
        .iter()
        .map(|(obj, content)| ObjectRecord {
            handle: obj.link().raw_handle(),
            payload: obj.save(content),
        })
        .collect();
    let public = objects.iter().filter(|r| r.handle != 0).count();
    // Members already in teardown are not written; their handles go back
    // to the pool so the image issues exactly the handles it contains.
    let mut allocator = guard.allocator().clone();
    let orphaned = guard.orphaned_handles();
    for &h in &orphaned {
        allocator.release(h);
    }
    let image = ImageV1 { objects, allocator };
    let mut out = CURRENT_VERSION.to_le_bytes().to_vec();
    options()
        .serialize_into(&mut out, &image)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    info!(
        objects = image.objects.len(),
        public,
        released = orphaned.len(),
        bytes = out.len(),
        "directory image saved"
    );
    Ok(out)
}

/// Freezes `dir` and writes it out.
pub fn encode<T, S>(dir: &Directory<T, S>) -> CodecResult<Vec<u8>>
where
    T: Persist,
    S: BuildHasher + Clone,
{
    let guard = SnapshotGuard::acquire(dir);
    save(&guard)
}

/// Replaces the contents of `dir` with the objects in `bytes`.
///
/// The new state is built and validated off to the side and swapped in
/// under one write lock; on error `dir` is left exactly as it was. The
/// restored objects are returned to the caller, who owns them from here
/// on (the directory only keeps weak references).
pub fn load<T, S>(dir: &Directory<T, S>, bytes: &[u8]) -> CodecResult<Vec<Arc<T>>>
where
    T: Persist,
    S: BuildHasher + Clone,
{
    let (version, records, allocator) = match decode::<T::Payload>(bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, "directory image rejected");
            return Err(e);
        }
    };

    let epoch = dir.next_epoch();
    let mut staged = dir.empty_state(epoch, records.len());
    staged.allocator = allocator;
    let mut restored = Vec::with_capacity(records.len());
    for (handle, payload) in records {
        let obj = Arc::new(T::restore(payload));
        let key = staged.insert_member(&obj);
        if let Some(h) = handle {
            staged.handles.insert(h, key);
            obj.link().publish(h);
        }
        restored.push(obj);
    }
    let changed = staged.allocator.reconcile(staged.handles.keys().copied());
    if changed > 0 {
        warn!(changed, "allocator disagreed with the restored handles; rebuilt");
    }
    let public = staged.handles.len();
    dir.install(staged);
    info!(
        version,
        objects = restored.len(),
        public,
        epoch,
        "directory image loaded"
    );
    Ok(restored)
}

type Records<P> = Vec<(Option<Handle>, P)>;

/// Parses and validates an image without touching any directory.
fn decode<P>(bytes: &[u8]) -> CodecResult<(u32, Records<P>, HandleAllocator)>
where
    P: DeserializeOwned,
{
    let (tag, body) = bytes
        .split_first_chunk::<TAG_LEN>()
        .ok_or(CodecError::Truncated { len: bytes.len() })?;
    let version = u32::from_le_bytes(*tag);
    let (records, allocator) = match version {
        CURRENT_VERSION => {
            let image: ImageV1<P> = options()
                .deserialize(body)
                .map_err(|e| CodecError::Decode(e.to_string()))?;
            let records = image
                .objects
                .into_iter()
                .map(|r| (Handle::new(r.handle), r.payload))
                .collect();
            (records, image.allocator)
        }
        LEGACY_VERSION => {
            let image: ImageV0<P> = options()
                .deserialize(body)
                .map_err(|e| CodecError::Decode(e.to_string()))?;
            let records = image
                .handles
                .into_iter()
                .map(|(raw, p)| match Handle::new(raw) {
                    Some(h) => Ok((Some(h), p)),
                    None => Err(CodecError::NullHandle),
                })
                .collect::<CodecResult<Records<P>>>()?;
            (records, image.allocator)
        }
        other => return Err(CodecError::UnsupportedVersion(other)),
    };

    if !allocator.is_consistent() {
        return Err(CodecError::CorruptAllocator);
    }
    let mut seen = hashbrown::HashSet::with_capacity(records.len());
    for h in records.iter().filter_map(|(h, _)| *h) {
        if !seen.insert(h) {
            return Err(CodecError::DuplicateHandle(h.get()));
        }
    }
    let top = seen.iter().map(|h| h.get()).max().unwrap_or(0);
    if version == CURRENT_VERSION {
        // Written images issue exactly their public handles.
        let exact = seen.len() == allocator.issued()
            && top <= allocator.high_water()
            && allocator.pooled().all(|h| !seen.contains(&h));
        if !exact {
            return Err(CodecError::CorruptAllocator);
        }
    } else {
        let pooled = allocator.pooled().count() as u64;
        let budget = seen.len() as u64 + pooled + LEGACY_SLACK;
        if top.max(allocator.high_water()) > budget {
            return Err(CodecError::CorruptAllocator);
        }
    }
    Ok((version, records, allocator))
}
