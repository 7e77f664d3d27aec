//! Handle: the stable, externally visible identifier of a public object.

use core::fmt;
use core::num::NonZeroU64;
use serde::{Deserialize, Serialize};

/// Integer form of a handle as it crosses an external boundary.
pub type RawHandle = u64;

/// The "no handle" sentinel. Never assigned to a live object.
pub const NULL_HANDLE: RawHandle = 0;

/// A non-zero handle. Zero cannot be represented, so a `Handle` is always
/// a candidate key of the handle map.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Returns `None` for [`NULL_HANDLE`].
    #[inline]
    pub const fn new(raw: RawHandle) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Handle(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> RawHandle {
        self.0.get()
    }
}

impl From<Handle> for RawHandle {
    fn from(h: Handle) -> Self {
        h.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
