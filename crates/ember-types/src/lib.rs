#![forbid(unsafe_code)]
//! Core value types for EmberFS.
//!
//! Keys and their total order, physical node locations, flash geometry,
//! sequence numbers, and the byte-level parse helpers shared by the
//! on-flash format and store crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod key;

pub use key::{Key, KeyType, EMBER_KEY_LEN};

/// Logical erase block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LebNumber(pub u32);

/// Inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const ROOT: Self = Self(1);
}

/// Global monotonic sequence number stamped on every persisted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sqnum(pub u64);

/// Sequence numbers at or above this value mean the counter is about to
/// wrap; a scanned node carrying one is treated as fatal exhaustion.
pub const SQNUM_WATERMARK: u64 = 0xFFFF_FFFF_FF00_0000;

/// Physical location of a node on flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeLocation {
    pub leb: LebNumber,
    pub offs: u32,
    pub len: u32,
}

impl NodeLocation {
    #[must_use]
    pub fn new(leb: LebNumber, offs: u32, len: u32) -> Self {
        Self { leb, offs, len }
    }

    /// The (leb, offset) pair identifying this location, ignoring length.
    #[must_use]
    pub fn addr(&self) -> (LebNumber, u32) {
        (self.leb, self.offs)
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} len {}", self.leb, self.offs, self.len)
    }
}

/// Maximum directory/attribute entry name length in bytes.
pub const EMBER_MAX_NLEN: usize = 255;

/// Data block size. All data keys address fixed-size blocks of this many
/// bytes; truncation converts byte sizes to block ranges with it.
pub const EMBER_BLOCK_SIZE: u32 = 4096;

/// Maximum index tree height.
pub const EMBER_MAX_LEVELS: u16 = 512;

/// Validated flash geometry shared by the store, TNC, and replay engine.
///
/// `main_first` is the first LEB of the main area; LEBs below it belong to
/// the log and other internal areas. The log occupies `log_lebs` LEBs
/// starting at `log_first` and is logically circular.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    leb_size: u32,
    leb_cnt: u32,
    min_io_size: u32,
    fanout: usize,
    pub log_first: LebNumber,
    pub log_lebs: u32,
    pub main_first: LebNumber,
    pub jhead_cnt: u32,
    pub max_inode_size: u64,
}

impl Geometry {
    /// Validate and build a geometry.
    ///
    /// `leb_size` must be a multiple of `min_io_size`, `min_io_size` a
    /// power of two, `fanout` in 3..=128, and the log region must fit
    /// below `main_first`.
    pub fn new(
        leb_size: u32,
        leb_cnt: u32,
        min_io_size: u32,
        fanout: usize,
        log_first: LebNumber,
        log_lebs: u32,
        main_first: LebNumber,
        jhead_cnt: u32,
        max_inode_size: u64,
    ) -> Result<Self, ParseError> {
        if min_io_size == 0 || !min_io_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "min_io_size",
                reason: "must be a power of two",
            });
        }
        if leb_size == 0 || leb_size % min_io_size != 0 {
            return Err(ParseError::InvalidField {
                field: "leb_size",
                reason: "must be a non-zero multiple of min_io_size",
            });
        }
        if !(3..=128).contains(&fanout) {
            return Err(ParseError::InvalidField {
                field: "fanout",
                reason: "must be in 3..=128",
            });
        }
        if log_lebs == 0 || log_first.0 + log_lebs > main_first.0 {
            return Err(ParseError::InvalidField {
                field: "log_lebs",
                reason: "log region must fit below main_first",
            });
        }
        if main_first.0 >= leb_cnt {
            return Err(ParseError::InvalidField {
                field: "main_first",
                reason: "must be below leb_cnt",
            });
        }
        if jhead_cnt == 0 {
            return Err(ParseError::InvalidField {
                field: "jhead_cnt",
                reason: "must be non-zero",
            });
        }
        Ok(Self {
            leb_size,
            leb_cnt,
            min_io_size,
            fanout,
            log_first,
            log_lebs,
            main_first,
            jhead_cnt,
            max_inode_size,
        })
    }

    #[must_use]
    pub fn leb_size(&self) -> u32 {
        self.leb_size
    }

    #[must_use]
    pub fn leb_cnt(&self) -> u32 {
        self.leb_cnt
    }

    #[must_use]
    pub fn min_io_size(&self) -> u32 {
        self.min_io_size
    }

    #[must_use]
    pub fn fanout(&self) -> usize {
        self.fanout
    }

    /// True if `leb` lies in the main area (where index and leaf nodes live).
    #[must_use]
    pub fn is_main_leb(&self, leb: LebNumber) -> bool {
        leb >= self.main_first && leb.0 < self.leb_cnt
    }

    /// True if `leb` lies in the log area.
    #[must_use]
    pub fn is_log_leb(&self, leb: LebNumber) -> bool {
        leb >= self.log_first && leb.0 < self.log_first.0 + self.log_lebs
    }

    /// Validate a main-area branch target: in range and 8-byte aligned.
    #[must_use]
    pub fn branch_target_ok(&self, loc: &NodeLocation) -> bool {
        self.is_main_leb(loc.leb)
            && loc.offs % 8 == 0
            && u64::from(loc.offs) + u64::from(loc.len) <= u64::from(self.leb_size)
    }
}

/// Byte-parsing failures, converted to `EmberError::Corruption` with
/// location context at the store boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Round `value` up to the nearest multiple of 8, the on-flash node
/// alignment. Saturates instead of wrapping.
#[must_use]
pub fn align8(value: u32) -> u32 {
    value.saturating_add(7) & !7
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u32` with an explicit error path.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for LebNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Sqnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(
            128 * 1024,
            64,
            8,
            8,
            LebNumber(1),
            4,
            LebNumber(8),
            2,
            1 << 40,
        )
        .expect("valid geometry")
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(matches!(
            read_le_u64(&bytes, 4),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn geometry_validation() {
        assert!(Geometry::new(0, 64, 8, 8, LebNumber(1), 4, LebNumber(8), 2, 1 << 40).is_err());
        assert!(
            Geometry::new(128 * 1024, 64, 3, 8, LebNumber(1), 4, LebNumber(8), 2, 1 << 40)
                .is_err()
        );
        assert!(
            Geometry::new(128 * 1024, 64, 8, 2, LebNumber(1), 4, LebNumber(8), 2, 1 << 40)
                .is_err()
        );
        // Log region spilling into the main area.
        assert!(
            Geometry::new(128 * 1024, 64, 8, 8, LebNumber(1), 9, LebNumber(8), 2, 1 << 40)
                .is_err()
        );
        assert!(geometry().is_main_leb(LebNumber(8)));
        assert!(!geometry().is_main_leb(LebNumber(7)));
        assert!(geometry().is_log_leb(LebNumber(1)));
        assert!(!geometry().is_log_leb(LebNumber(5)));
    }

    #[test]
    fn branch_target_bounds() {
        let g = geometry();
        assert!(g.branch_target_ok(&NodeLocation::new(LebNumber(8), 0, 64)));
        assert!(g.branch_target_ok(&NodeLocation::new(LebNumber(8), 128 * 1024 - 64, 64)));
        // Misaligned offset.
        assert!(!g.branch_target_ok(&NodeLocation::new(LebNumber(8), 4, 64)));
        // Past the end of the LEB.
        assert!(!g.branch_target_ok(&NodeLocation::new(LebNumber(8), 128 * 1024 - 32, 64)));
        // Log LEB is not a valid branch target.
        assert!(!g.branch_target_ok(&NodeLocation::new(LebNumber(1), 0, 64)));
    }

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(61), 64);
        assert_eq!(align8(u32::MAX), u32::MAX & !7);
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_down(100, 3), None);
    }
}
