#![forbid(unsafe_code)]
//! On-flash node formats.
//!
//! Every persisted node starts with the same 24-byte header:
//!
//! ```text
//! offset  0  magic            u32
//! offset  4  node type        u8
//! offset  5  group flag       u8
//! offset  6  CRC32            u32   over bytes [10, length)
//! offset 10  sequence number  u64
//! offset 18  length           u32   full node length including header
//! offset 22  padding          [u8; 2]
//! ```
//!
//! The CRC covers everything after the CRC field itself, so the sequence
//! number and length are protected. For node kinds that carry a key, the
//! key always sits at offset 24, immediately after the header, so generic
//! code can read it without knowing the node kind.

use ember_types::{ensure_slice, read_le_u32, read_le_u64, Key, ParseError, Sqnum};
use serde::{Deserialize, Serialize};

mod nodes;

pub use nodes::{
    CommitStartNode, DataNode, EntryNode, EntryType, IndexBranch, IndexNode, InodeNode, PadNode,
    RefNode, TruncNode, DATA_NODE_HDR_SZ, ENTRY_NODE_HDR_SZ, INODE_NODE_SZ, PAD_NODE_SZ,
};

/// Node header magic.
pub const EMBER_NODE_MAGIC: u32 = 0x1F45_4D42;

/// Common header length.
pub const EMBER_HDR_LEN: usize = 24;

/// Offset of the first CRC-covered byte (the sequence number field).
pub const EMBER_CRC_START: usize = 10;

/// Offset of the key in all keyed node kinds.
pub const EMBER_KEY_OFFS: usize = EMBER_HDR_LEN;

/// Node type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeType {
    Inode = 1,
    Data = 2,
    Entry = 3,
    Trunc = 4,
    Pad = 5,
    Ref = 6,
    CommitStart = 7,
    Index = 8,
}

impl NodeType {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::Inode),
            2 => Ok(Self::Data),
            3 => Ok(Self::Entry),
            4 => Ok(Self::Trunc),
            5 => Ok(Self::Pad),
            6 => Ok(Self::Ref),
            7 => Ok(Self::CommitStart),
            8 => Ok(Self::Index),
            _ => Err(ParseError::InvalidField {
                field: "node_type",
                reason: "unknown node type tag",
            }),
        }
    }

    /// True for node kinds that carry a key at `EMBER_KEY_OFFS`.
    #[must_use]
    pub fn is_keyed(self) -> bool {
        matches!(self, Self::Inode | Self::Data | Self::Entry | Self::Trunc)
    }
}

/// Decoded common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub node_type: NodeType,
    pub group: u8,
    pub crc: u32,
    pub sqnum: Sqnum,
    pub len: u32,
}

impl NodeHeader {
    /// Parse and fully validate a header against the backing buffer:
    /// magic, type tag, length bounds, and CRC.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let header = Self::parse_unchecked(data)?;
        let len = header.len as usize;
        if len < EMBER_HDR_LEN || len > data.len() {
            return Err(ParseError::InvalidField {
                field: "len",
                reason: "node length out of bounds",
            });
        }
        let crc = crc32(&data[EMBER_CRC_START..len]);
        if crc != header.crc {
            return Err(ParseError::InvalidField {
                field: "crc",
                reason: "checksum mismatch",
            });
        }
        Ok(header)
    }

    /// Parse the fixed fields without checking length bounds or CRC.
    /// Used by the scanner to probe whether a node starts here at all.
    pub fn parse_unchecked(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != EMBER_NODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: EMBER_NODE_MAGIC,
                actual: magic,
            });
        }
        let node_type = NodeType::from_raw(ensure_slice(data, 4, 1)?[0])?;
        let group = ensure_slice(data, 5, 1)?[0];
        let crc = read_le_u32(data, 6)?;
        let sqnum = Sqnum(read_le_u64(data, 10)?);
        let len = read_le_u32(data, 18)?;
        Ok(Self {
            node_type,
            group,
            crc,
            sqnum,
            len,
        })
    }
}

/// Compute the node CRC over an already-sliced `[EMBER_CRC_START, len)`
/// region.
#[must_use]
pub fn crc32(covered: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(covered);
    hasher.finalize()
}

/// Read the key of a keyed node.
pub fn node_key(data: &[u8]) -> Result<Key, ParseError> {
    Key::from_bytes(data, EMBER_KEY_OFFS)
}

/// Stamp the common header onto `buf` (whose length is the node length)
/// and compute the CRC. `buf[EMBER_HDR_LEN..]` must already hold the body.
pub fn finalize_node(buf: &mut [u8], node_type: NodeType, sqnum: Sqnum) -> Result<(), ParseError> {
    if buf.len() < EMBER_HDR_LEN {
        return Err(ParseError::InsufficientData {
            needed: EMBER_HDR_LEN,
            offset: 0,
            actual: buf.len(),
        });
    }
    let len = ember_types::usize_to_u32(buf.len(), "node_len")?;
    buf[0..4].copy_from_slice(&EMBER_NODE_MAGIC.to_le_bytes());
    buf[4] = node_type as u8;
    buf[5] = 0;
    buf[10..18].copy_from_slice(&sqnum.0.to_le_bytes());
    buf[18..22].copy_from_slice(&len.to_le_bytes());
    buf[22] = 0;
    buf[23] = 0;
    let crc = crc32(&buf[EMBER_CRC_START..]);
    buf[6..10].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}
