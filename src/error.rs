//! Error types for the index.

use thiserror::Error;

use crate::art::RowId;

/// Result type alias using [`ArtError`].
pub type Result<T> = std::result::Result<T, ArtError>;

/// Errors surfaced by index operations.
///
/// Contract violations inside the leaf layer (duplicate row ids within one
/// gate, gate-only calls on legacy leaves) are not represented here; they are
/// debug assertions.
#[derive(Debug, Error)]
pub enum ArtError {
    /// A node pool reached its configured segment limit.
    #[error("{kind} allocator exhausted: {segments} segments of {slots_per_segment} slots in use")]
    AllocatorExhausted {
        kind: &'static str,
        segments: usize,
        slots_per_segment: usize,
    },

    /// The row id cannot be stored in the index.
    #[error("row id {row_id} is outside the local row id range")]
    RowIdOutOfRange { row_id: RowId },

    /// Two keys in one tree where one is a strict prefix of the other.
    #[error("key {key:02x?} conflicts with a prefix-related key in the index")]
    PrefixConflict { key: Vec<u8> },

    /// The key exceeds [`MAX_KEY_LEN`](crate::art::key::MAX_KEY_LEN).
    #[error("key of {len} bytes exceeds the maximum key length")]
    KeyTooLong { len: usize },

    /// Bulk construction requires an empty index.
    #[error("bulk construction into a non-empty index")]
    NotEmpty,

    /// Bulk construction input is malformed.
    #[error("invalid bulk construction input: {0}")]
    InvalidInput(&'static str),

    /// A persisted index image could not be decoded.
    #[error("corrupt index image at byte {offset}: {reason}")]
    Corrupt { offset: usize, reason: &'static str },

    /// The image was written by an unknown format version.
    #[error("unsupported index image version {0}")]
    UnsupportedVersion(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
