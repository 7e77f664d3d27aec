use crate::handle::RawHandle;

/// Errors from saving or loading a directory image.
///
/// Only the persistence boundary reports errors. Bookkeeping violations
/// inside a running directory panic instead.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The image carries a version tag this build cannot read.
    #[error("unsupported directory image version: {0}")]
    UnsupportedVersion(u32),

    /// Too short to hold a version tag.
    #[error("truncated directory image: {len} bytes")]
    Truncated { len: usize },

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    /// Two restored objects claim the same handle.
    #[error("handle {0} assigned to more than one object")]
    DuplicateHandle(RawHandle),

    /// A legacy image maps the null handle.
    #[error("null handle in legacy handle map")]
    NullHandle,

    /// The persisted allocator pool is not a set of issued handles.
    #[error("corrupt handle allocator state")]
    CorruptAllocator,
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
