//! File-system keys and their total order.
//!
//! A key is (inode number, key type, 29-bit argument), encoded in 12 bytes
//! on flash. The argument is the data block number for data keys and a name
//! hash for directory/attribute entry keys, so entry keys are "hashed":
//! distinct names may collide on the same key, and every comparison of such
//! keys needs name-based tie-breaking at a higher layer.
//!
//! The type discriminant sits in the top three bits of the packed word,
//! above the argument, so lexicographic order over the encoding equals
//! ordering by (inode, type, argument).

use crate::{read_le_u32, read_le_u64, InodeNumber, ParseError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Encoded key length on flash.
pub const EMBER_KEY_LEN: usize = 12;

/// Bits available for the packed argument (block number or name hash).
const ARG_BITS: u32 = 29;
const ARG_MASK: u32 = (1 << ARG_BITS) - 1;

/// Key type discriminant, stored in the top three bits of the packed word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyType {
    /// Inode node key; argument is always zero.
    Inode = 0,
    /// Data block key; argument is the block number within the file.
    Data = 1,
    /// Directory entry key; argument is a hash of the entry name.
    Entry = 2,
    /// Extended attribute entry key; argument is a hash of the name.
    Xattr = 3,
    /// Truncation marker; only ever appears in the journal, never in the
    /// index.
    Trunc = 4,
}

impl KeyType {
    pub fn from_bits(bits: u32) -> Result<Self, ParseError> {
        match bits {
            0 => Ok(Self::Inode),
            1 => Ok(Self::Data),
            2 => Ok(Self::Entry),
            3 => Ok(Self::Xattr),
            4 => Ok(Self::Trunc),
            _ => Err(ParseError::InvalidField {
                field: "key_type",
                reason: "unknown discriminant",
            }),
        }
    }

    /// True for key types whose argument is a name hash and may therefore
    /// collide.
    #[must_use]
    pub fn is_hashed(self) -> bool {
        matches!(self, Self::Entry | Self::Xattr)
    }
}

/// A totally ordered file-system key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    ino: u64,
    packed: u32,
}

impl Key {
    fn pack(kind: KeyType, arg: u32) -> u32 {
        debug_assert!(arg <= ARG_MASK);
        ((kind as u32) << ARG_BITS) | (arg & ARG_MASK)
    }

    /// Key of an inode node.
    #[must_use]
    pub fn inode(ino: InodeNumber) -> Self {
        Self {
            ino: ino.0,
            packed: Self::pack(KeyType::Inode, 0),
        }
    }

    /// Key of a data block. Block numbers are limited to 29 bits.
    #[must_use]
    pub fn data(ino: InodeNumber, block: u32) -> Self {
        Self {
            ino: ino.0,
            packed: Self::pack(KeyType::Data, block & ARG_MASK),
        }
    }

    /// Key of a directory entry, hashing `name`.
    #[must_use]
    pub fn entry(ino: InodeNumber, name: &[u8]) -> Self {
        Self {
            ino: ino.0,
            packed: Self::pack(KeyType::Entry, name_hash(name)),
        }
    }

    /// Key of an extended attribute entry, hashing `name`.
    #[must_use]
    pub fn xattr(ino: InodeNumber, name: &[u8]) -> Self {
        Self {
            ino: ino.0,
            packed: Self::pack(KeyType::Xattr, name_hash(name)),
        }
    }

    /// Key of a truncation marker.
    #[must_use]
    pub fn trunc(ino: InodeNumber) -> Self {
        Self {
            ino: ino.0,
            packed: Self::pack(KeyType::Trunc, 0),
        }
    }

    /// Lowest possible key of `ino`: its inode key.
    #[must_use]
    pub fn lowest(ino: InodeNumber) -> Self {
        Self {
            ino: ino.0,
            packed: 0,
        }
    }

    /// Highest possible key of `ino`, upper bound for range removal.
    #[must_use]
    pub fn highest(ino: InodeNumber) -> Self {
        Self {
            ino: ino.0,
            packed: u32::MAX,
        }
    }

    /// Lowest directory entry key of `ino` (hash zero), the seed for
    /// ordered entry traversal.
    #[must_use]
    pub fn lowest_entry(ino: InodeNumber) -> Self {
        Self {
            ino: ino.0,
            packed: Self::pack(KeyType::Entry, 0),
        }
    }

    /// Lowest extended attribute entry key of `ino`.
    #[must_use]
    pub fn lowest_xattr(ino: InodeNumber) -> Self {
        Self {
            ino: ino.0,
            packed: Self::pack(KeyType::Xattr, 0),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        InodeNumber(self.ino)
    }

    /// The key type, if the discriminant bits are valid.
    pub fn kind(&self) -> Result<KeyType, ParseError> {
        KeyType::from_bits(self.packed >> ARG_BITS)
    }

    /// The 29-bit argument: block number, name hash, or zero.
    #[must_use]
    pub fn arg(&self) -> u32 {
        self.packed & ARG_MASK
    }

    /// Block number of a data key. Meaningless for other key types.
    #[must_use]
    pub fn block(&self) -> u32 {
        self.arg()
    }

    /// True if this key's type permits hash collisions.
    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.kind().map(KeyType::is_hashed).unwrap_or(false)
    }

    /// Encode into the on-flash representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; EMBER_KEY_LEN] {
        let mut out = [0_u8; EMBER_KEY_LEN];
        out[0..8].copy_from_slice(&self.ino.to_le_bytes());
        out[8..12].copy_from_slice(&self.packed.to_le_bytes());
        out
    }

    /// Decode from the on-flash representation, validating the type bits.
    pub fn from_bytes(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let ino = read_le_u64(data, offset)?;
        let packed = read_le_u32(data, offset + 8)?;
        KeyType::from_bits(packed >> ARG_BITS)?;
        Ok(Self { ino, packed })
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ino
            .cmp(&other.ino)
            .then(self.packed.cmp(&other.packed))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Ok(kind) => write!(f, "Key({}, {kind:?}, {:#x})", self.ino, self.arg()),
            Err(_) => write!(f, "Key({}, ?, {:#010x})", self.ino, self.packed),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// R5 rolling hash of an entry name, masked to the 29-bit argument space.
///
/// Hash values 0, 1 and 2 are reserved (".", "..", and the end-of-stream
/// cookie of readdir), so real names are clamped past them.
#[must_use]
pub fn name_hash(name: &[u8]) -> u32 {
    let mut a: u32 = 0;
    for &b in name {
        let c = u32::from(b);
        a = a.wrapping_add(c << 4);
        a = a.wrapping_add(c >> 4);
        a = a.wrapping_mul(11);
    }
    a &= ARG_MASK;
    if a <= 2 {
        a += 3;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_order_is_ino_type_arg() {
        let i1 = InodeNumber(1);
        let i2 = InodeNumber(2);
        assert!(Key::inode(i1) < Key::data(i1, 0));
        assert!(Key::data(i1, 0) < Key::data(i1, 1));
        assert!(Key::data(i1, ARG_MASK) < Key::entry(i1, b"a"));
        assert!(Key::entry(i1, b"zzz") < Key::lowest_xattr(i1));
        assert!(Key::highest(i1) > Key::xattr(i1, b"user.x"));
        assert!(Key::highest(i1) < Key::lowest(i2));
    }

    #[test]
    fn hashed_types() {
        let ino = InodeNumber(7);
        assert!(Key::entry(ino, b"a").is_hashed());
        assert!(Key::xattr(ino, b"a").is_hashed());
        assert!(!Key::inode(ino).is_hashed());
        assert!(!Key::data(ino, 5).is_hashed());
        assert!(!Key::trunc(ino).is_hashed());
    }

    #[test]
    fn name_hash_reserved_values() {
        // Empty name hashes to zero before the clamp; the clamp moves it
        // past the reserved range.
        assert!(name_hash(b"") > 2);
        for name in [&b"a"[..], b"ab", b"abc", b"some-longer-name"] {
            assert!(name_hash(name) > 2);
            assert!(name_hash(name) <= ARG_MASK);
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let keys = [
            Key::inode(InodeNumber(42)),
            Key::data(InodeNumber(42), 1234),
            Key::entry(InodeNumber(42), b"hello"),
            Key::xattr(InodeNumber(42), b"user.attr"),
            Key::trunc(InodeNumber(9)),
        ];
        for key in keys {
            let bytes = key.to_bytes();
            let back = Key::from_bytes(&bytes, 0).expect("decode");
            assert_eq!(key, back);
        }
    }

    #[test]
    fn decode_rejects_bad_type_bits() {
        let mut bytes = Key::inode(InodeNumber(1)).to_bytes();
        // Force discriminant 7.
        bytes[11] |= 0xE0;
        assert!(Key::from_bytes(&bytes, 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_encoding_preserves_order(
            a_ino in 0_u64..1 << 48,
            a_block in 0_u32..1 << 29,
            b_ino in 0_u64..1 << 48,
            b_block in 0_u32..1 << 29,
        ) {
            let a = Key::data(InodeNumber(a_ino), a_block);
            let b = Key::data(InodeNumber(b_ino), b_block);
            let abytes = a.to_bytes();
            let bbytes = b.to_bytes();
            let decoded = (
                Key::from_bytes(&abytes, 0).unwrap(),
                Key::from_bytes(&bbytes, 0).unwrap(),
            );
            prop_assert_eq!(a.cmp(&b), decoded.0.cmp(&decoded.1));
        }

        #[test]
        fn prop_name_hash_in_range(name in proptest::collection::vec(any::<u8>(), 0..64)) {
            let h = name_hash(&name);
            prop_assert!(h > 2);
            prop_assert!(h <= ARG_MASK);
        }
    }
}
