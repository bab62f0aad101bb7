//! Order-preserving key encoding.
//!
//! Every value stored in the tree is first turned into a byte string whose
//! lexicographic order matches the value order. Keys of one type never
//! stand in a strict prefix relation to each other, which the tree relies on
//! to recognize leaf positions.

use std::fmt;
use std::ops::Deref;

use smallvec::SmallVec;

use super::RowId;

/// Width of an encoded row id.
pub const ROW_ID_KEY_LEN: usize = 8;

/// Longest key the index accepts. Bounds the node depth of every tree path,
/// and so the recursion depth of the tree algorithms and the image decoder.
pub const MAX_KEY_LEN: usize = 512;

/// An immutable, comparable byte key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ArtKey {
    data: SmallVec<[u8; 16]>,
}

impl ArtKey {
    /// Encode a row id as an 8-byte big-endian key with the sign bit flipped.
    pub fn from_row_id(row_id: RowId) -> Self {
        row_id.encode_key()
    }

    /// Encode any [`KeyEncode`] value.
    pub fn encode<T: KeyEncode + ?Sized>(value: &T) -> Self {
        value.encode_key()
    }

    /// Wrap raw, already encoded bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: SmallVec::from_slice(bytes),
        }
    }

    /// Decode the row id of a key built by [`ArtKey::from_row_id`].
    pub fn row_id(&self) -> RowId {
        debug_assert_eq!(self.data.len(), ROW_ID_KEY_LEN, "not a row id key");
        let mut raw = [0u8; ROW_ID_KEY_LEN];
        raw.copy_from_slice(&self.data[..ROW_ID_KEY_LEN]);
        (u64::from_be_bytes(raw) ^ (1 << 63)) as RowId
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Deref for ArtKey {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for ArtKey {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for ArtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtKey({:02x?})", self.data.as_slice())
    }
}

/// Types with an order-preserving byte encoding.
pub trait KeyEncode {
    fn encode_key(&self) -> ArtKey;
}

macro_rules! impl_key_encode_unsigned {
    ($($t:ty),*) => {
        $(impl KeyEncode for $t {
            fn encode_key(&self) -> ArtKey {
                ArtKey::from_bytes(&self.to_be_bytes())
            }
        })*
    };
}

macro_rules! impl_key_encode_signed {
    ($($t:ty => $u:ty),*) => {
        $(impl KeyEncode for $t {
            fn encode_key(&self) -> ArtKey {
                let flipped = (*self as $u) ^ (1 << (<$u>::BITS - 1));
                ArtKey::from_bytes(&flipped.to_be_bytes())
            }
        })*
    };
}

impl_key_encode_unsigned!(u8, u16, u32, u64);
impl_key_encode_signed!(i8 => u8, i16 => u16, i32 => u32, i64 => u64);

impl KeyEncode for bool {
    fn encode_key(&self) -> ArtKey {
        ArtKey::from_bytes(&[u8::from(*self)])
    }
}

impl KeyEncode for f64 {
    fn encode_key(&self) -> ArtKey {
        // All NaNs collapse to one key above +inf; -0.0 sorts with 0.0.
        let value = if self.is_nan() {
            f64::NAN
        } else if *self == 0.0 {
            0.0
        } else {
            *self
        };
        let bits = value.to_bits();
        let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
        ArtKey::from_bytes(&ordered.to_be_bytes())
    }
}

impl KeyEncode for f32 {
    fn encode_key(&self) -> ArtKey {
        let value = if self.is_nan() {
            f32::NAN
        } else if *self == 0.0 {
            0.0
        } else {
            *self
        };
        let bits = value.to_bits();
        let ordered = if bits >> 31 == 1 { !bits } else { bits | (1 << 31) };
        ArtKey::from_bytes(&ordered.to_be_bytes())
    }
}

impl KeyEncode for [u8] {
    /// 0x00 and 0x01 are escaped as 0x01 0x01 and 0x01 0x02, and the key ends
    /// in 0x00, so no encoded string is a prefix of another.
    fn encode_key(&self) -> ArtKey {
        let mut data: SmallVec<[u8; 16]> = SmallVec::with_capacity(self.len() + 1);
        for &byte in self {
            match byte {
                0x00 => data.extend_from_slice(&[0x01, 0x01]),
                0x01 => data.extend_from_slice(&[0x01, 0x02]),
                b => data.push(b),
            }
        }
        data.push(0x00);
        ArtKey { data }
    }
}

impl KeyEncode for str {
    fn encode_key(&self) -> ArtKey {
        self.as_bytes().encode_key()
    }
}

impl KeyEncode for String {
    fn encode_key(&self) -> ArtKey {
        self.as_str().encode_key()
    }
}

impl KeyEncode for Vec<u8> {
    fn encode_key(&self) -> ArtKey {
        self.as_slice().encode_key()
    }
}

/// A range of sorted keys `[start, end]` sharing their first `depth` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySection {
    pub start: usize,
    pub end: usize,
    pub depth: usize,
}

impl KeySection {
    pub fn new(start: usize, end: usize, depth: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end, depth }
    }

    /// Number of keys in the section.
    #[inline]
    pub fn count(&self) -> usize {
        self.end - self.start + 1
    }
}
