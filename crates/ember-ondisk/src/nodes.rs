//! Typed node bodies.
//!
//! Each node kind parses from a full node buffer (header already
//! validated by the store) and encodes to a finalized buffer with header
//! and CRC stamped, which is what tests and the journal writer feed to a
//! flash device.

use crate::{finalize_node, EMBER_HDR_LEN, EMBER_KEY_OFFS, NodeType};
use ember_types::{
    ensure_slice, read_le_u16, read_le_u32, read_le_u64, Key, LebNumber, NodeLocation, ParseError,
    Sqnum, EMBER_KEY_LEN, EMBER_MAX_NLEN,
};

/// One branch of an on-flash index node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBranch {
    pub key: Key,
    pub loc: NodeLocation,
}

const BRANCH_SZ: usize = 12 + EMBER_KEY_LEN;
const INDEX_FIXED_SZ: usize = EMBER_HDR_LEN + 4;

/// On-flash index node: a level and an ordered run of branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    pub level: u16,
    pub branches: Vec<IndexBranch>,
}

impl IndexNode {
    /// Size in bytes of an encoded index node with `child_cnt` branches.
    #[must_use]
    pub fn encoded_len(child_cnt: usize) -> usize {
        INDEX_FIXED_SZ + child_cnt * BRANCH_SZ
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let child_cnt = usize::from(read_le_u16(data, EMBER_HDR_LEN)?);
        let level = read_le_u16(data, EMBER_HDR_LEN + 2)?;
        if data.len() != Self::encoded_len(child_cnt) {
            return Err(ParseError::InvalidField {
                field: "child_cnt",
                reason: "node length does not match branch count",
            });
        }
        let mut branches = Vec::with_capacity(child_cnt);
        for i in 0..child_cnt {
            let base = INDEX_FIXED_SZ + i * BRANCH_SZ;
            let leb = LebNumber(read_le_u32(data, base)?);
            let offs = read_le_u32(data, base + 4)?;
            let len = read_le_u32(data, base + 8)?;
            let key = Key::from_bytes(data, base + 12)?;
            branches.push(IndexBranch {
                key,
                loc: NodeLocation::new(leb, offs, len),
            });
        }
        Ok(Self { level, branches })
    }

    pub fn encode(&self, sqnum: Sqnum) -> Result<Vec<u8>, ParseError> {
        let child_cnt =
            u16::try_from(self.branches.len()).map_err(|_| ParseError::IntegerConversion {
                field: "child_cnt",
            })?;
        let mut buf = vec![0_u8; Self::encoded_len(self.branches.len())];
        buf[EMBER_HDR_LEN..EMBER_HDR_LEN + 2].copy_from_slice(&child_cnt.to_le_bytes());
        buf[EMBER_HDR_LEN + 2..EMBER_HDR_LEN + 4].copy_from_slice(&self.level.to_le_bytes());
        for (i, branch) in self.branches.iter().enumerate() {
            let base = INDEX_FIXED_SZ + i * BRANCH_SZ;
            buf[base..base + 4].copy_from_slice(&branch.loc.leb.0.to_le_bytes());
            buf[base + 4..base + 8].copy_from_slice(&branch.loc.offs.to_le_bytes());
            buf[base + 8..base + 12].copy_from_slice(&branch.loc.len.to_le_bytes());
            buf[base + 12..base + 12 + EMBER_KEY_LEN].copy_from_slice(&branch.key.to_bytes());
        }
        finalize_node(&mut buf, NodeType::Index, sqnum)?;
        Ok(buf)
    }
}

/// Inode node size.
pub const INODE_NODE_SZ: usize = EMBER_HDR_LEN + EMBER_KEY_LEN + 16;

/// On-flash inode node. Only the fields the index core consumes are
/// modeled; the VFS-facing attribute block lives above this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeNode {
    pub key: Key,
    pub nlink: u32,
    pub mode: u32,
    pub size: u64,
}

impl InodeNode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != INODE_NODE_SZ {
            return Err(ParseError::InvalidField {
                field: "len",
                reason: "bad inode node length",
            });
        }
        Ok(Self {
            key: Key::from_bytes(data, EMBER_KEY_OFFS)?,
            nlink: read_le_u32(data, EMBER_KEY_OFFS + EMBER_KEY_LEN)?,
            mode: read_le_u32(data, EMBER_KEY_OFFS + EMBER_KEY_LEN + 4)?,
            size: read_le_u64(data, EMBER_KEY_OFFS + EMBER_KEY_LEN + 8)?,
        })
    }

    pub fn encode(&self, sqnum: Sqnum) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; INODE_NODE_SZ];
        buf[EMBER_KEY_OFFS..EMBER_KEY_OFFS + EMBER_KEY_LEN].copy_from_slice(&self.key.to_bytes());
        let base = EMBER_KEY_OFFS + EMBER_KEY_LEN;
        buf[base..base + 4].copy_from_slice(&self.nlink.to_le_bytes());
        buf[base + 4..base + 8].copy_from_slice(&self.mode.to_le_bytes());
        buf[base + 8..base + 16].copy_from_slice(&self.size.to_le_bytes());
        finalize_node(&mut buf, NodeType::Inode, sqnum)?;
        Ok(buf)
    }
}

/// Fixed prefix of a data node, before the payload.
pub const DATA_NODE_HDR_SZ: usize = EMBER_HDR_LEN + EMBER_KEY_LEN + 4;

/// On-flash data node: one block's worth of file payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNode {
    pub key: Key,
    /// Uncompressed byte count held by this block.
    pub size: u32,
    pub data: Vec<u8>,
}

impl DataNode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < DATA_NODE_HDR_SZ {
            return Err(ParseError::InsufficientData {
                needed: DATA_NODE_HDR_SZ,
                offset: 0,
                actual: data.len(),
            });
        }
        Ok(Self {
            key: Key::from_bytes(data, EMBER_KEY_OFFS)?,
            size: read_le_u32(data, EMBER_KEY_OFFS + EMBER_KEY_LEN)?,
            data: data[DATA_NODE_HDR_SZ..].to_vec(),
        })
    }

    pub fn encode(&self, sqnum: Sqnum) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; DATA_NODE_HDR_SZ + self.data.len()];
        buf[EMBER_KEY_OFFS..EMBER_KEY_OFFS + EMBER_KEY_LEN].copy_from_slice(&self.key.to_bytes());
        buf[EMBER_KEY_OFFS + EMBER_KEY_LEN..DATA_NODE_HDR_SZ]
            .copy_from_slice(&self.size.to_le_bytes());
        buf[DATA_NODE_HDR_SZ..].copy_from_slice(&self.data);
        finalize_node(&mut buf, NodeType::Data, sqnum)?;
        Ok(buf)
    }
}

/// Target type carried by a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
    BlockDev = 3,
    CharDev = 4,
    Fifo = 5,
    Socket = 6,
    Xattr = 7,
}

impl EntryType {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Regular),
            1 => Ok(Self::Directory),
            2 => Ok(Self::Symlink),
            3 => Ok(Self::BlockDev),
            4 => Ok(Self::CharDev),
            5 => Ok(Self::Fifo),
            6 => Ok(Self::Socket),
            7 => Ok(Self::Xattr),
            _ => Err(ParseError::InvalidField {
                field: "entry_type",
                reason: "unknown entry type",
            }),
        }
    }
}

/// Fixed prefix of an entry node, before the name.
pub const ENTRY_NODE_HDR_SZ: usize = EMBER_HDR_LEN + EMBER_KEY_LEN + 10;

/// On-flash directory or extended attribute entry node.
///
/// An entry with `inum == 0` is a deletion marker for the named entry.
/// The name is NUL-terminated on flash; the terminator is not part of
/// `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryNode {
    pub key: Key,
    pub inum: u64,
    pub etype: EntryType,
    pub name: Vec<u8>,
}

impl EntryNode {
    /// Size in bytes of an encoded entry node with an `nlen`-byte name.
    #[must_use]
    pub fn encoded_len(nlen: usize) -> usize {
        ENTRY_NODE_HDR_SZ + nlen + 1
    }

    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.inum == 0
    }

    /// Parse and validate an entry node: length/name-length consistency,
    /// name bounds, terminator, no embedded NUL, and an entry-class key.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < ENTRY_NODE_HDR_SZ {
            return Err(ParseError::InsufficientData {
                needed: ENTRY_NODE_HDR_SZ,
                offset: 0,
                actual: data.len(),
            });
        }
        let key = Key::from_bytes(data, EMBER_KEY_OFFS)?;
        if !key.is_hashed() {
            return Err(ParseError::InvalidField {
                field: "key",
                reason: "entry node key is not an entry-class key",
            });
        }
        let inum = read_le_u64(data, EMBER_KEY_OFFS + EMBER_KEY_LEN)?;
        let etype = EntryType::from_raw(data[EMBER_KEY_OFFS + EMBER_KEY_LEN + 8])?;
        let nlen = usize::from(data[EMBER_KEY_OFFS + EMBER_KEY_LEN + 9]);
        if nlen > EMBER_MAX_NLEN || data.len() != Self::encoded_len(nlen) {
            return Err(ParseError::InvalidField {
                field: "nlen",
                reason: "name length inconsistent with node length",
            });
        }
        let name = ensure_slice(data, ENTRY_NODE_HDR_SZ, nlen)?;
        if data[ENTRY_NODE_HDR_SZ + nlen] != 0 || name.contains(&0) {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "missing terminator or embedded NUL",
            });
        }
        Ok(Self {
            key,
            inum,
            etype,
            name: name.to_vec(),
        })
    }

    pub fn encode(&self, sqnum: Sqnum) -> Result<Vec<u8>, ParseError> {
        if self.name.len() > EMBER_MAX_NLEN {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "name longer than EMBER_MAX_NLEN",
            });
        }
        let nlen = self.name.len();
        let mut buf = vec![0_u8; Self::encoded_len(nlen)];
        buf[EMBER_KEY_OFFS..EMBER_KEY_OFFS + EMBER_KEY_LEN].copy_from_slice(&self.key.to_bytes());
        let base = EMBER_KEY_OFFS + EMBER_KEY_LEN;
        buf[base..base + 8].copy_from_slice(&self.inum.to_le_bytes());
        buf[base + 8] = self.etype as u8;
        buf[base + 9] = nlen as u8;
        buf[ENTRY_NODE_HDR_SZ..ENTRY_NODE_HDR_SZ + nlen].copy_from_slice(&self.name);
        // buf ends with the NUL terminator already zeroed.
        finalize_node(&mut buf, NodeType::Entry, sqnum)?;
        Ok(buf)
    }
}

/// Truncation node size.
pub const TRUNC_NODE_SZ: usize = EMBER_HDR_LEN + EMBER_KEY_LEN + 20;

/// On-flash truncation node: journal-only record shrinking a file from
/// `old_size` to `new_size`. Never inserted into the index itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncNode {
    pub key: Key,
    pub old_size: u64,
    pub new_size: u64,
}

impl TruncNode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != TRUNC_NODE_SZ {
            return Err(ParseError::InvalidField {
                field: "len",
                reason: "bad truncation node length",
            });
        }
        Ok(Self {
            key: Key::from_bytes(data, EMBER_KEY_OFFS)?,
            old_size: read_le_u64(data, EMBER_KEY_OFFS + EMBER_KEY_LEN + 4)?,
            new_size: read_le_u64(data, EMBER_KEY_OFFS + EMBER_KEY_LEN + 12)?,
        })
    }

    pub fn encode(&self, sqnum: Sqnum) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; TRUNC_NODE_SZ];
        buf[EMBER_KEY_OFFS..EMBER_KEY_OFFS + EMBER_KEY_LEN].copy_from_slice(&self.key.to_bytes());
        let base = EMBER_KEY_OFFS + EMBER_KEY_LEN + 4;
        buf[base..base + 8].copy_from_slice(&self.old_size.to_le_bytes());
        buf[base + 8..base + 16].copy_from_slice(&self.new_size.to_le_bytes());
        finalize_node(&mut buf, NodeType::Trunc, sqnum)?;
        Ok(buf)
    }
}

/// Bud reference node size.
pub const REF_NODE_SZ: usize = EMBER_HDR_LEN + 12;

/// Log record naming a bud: an erase-block region one journal head is
/// writing into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefNode {
    pub leb: LebNumber,
    pub offs: u32,
    pub jhead: u32,
}

impl RefNode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != REF_NODE_SZ {
            return Err(ParseError::InvalidField {
                field: "len",
                reason: "bad reference node length",
            });
        }
        Ok(Self {
            leb: LebNumber(read_le_u32(data, EMBER_HDR_LEN)?),
            offs: read_le_u32(data, EMBER_HDR_LEN + 4)?,
            jhead: read_le_u32(data, EMBER_HDR_LEN + 8)?,
        })
    }

    pub fn encode(&self, sqnum: Sqnum) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; REF_NODE_SZ];
        buf[EMBER_HDR_LEN..EMBER_HDR_LEN + 4].copy_from_slice(&self.leb.0.to_le_bytes());
        buf[EMBER_HDR_LEN + 4..EMBER_HDR_LEN + 8].copy_from_slice(&self.offs.to_le_bytes());
        buf[EMBER_HDR_LEN + 8..EMBER_HDR_LEN + 12].copy_from_slice(&self.jhead.to_le_bytes());
        finalize_node(&mut buf, NodeType::Ref, sqnum)?;
        Ok(buf)
    }
}

/// Commit start node size.
pub const CS_NODE_SZ: usize = EMBER_HDR_LEN + 8;

/// Log record opening a commit; the first node of every log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStartNode {
    pub cmt_no: u64,
}

impl CommitStartNode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != CS_NODE_SZ {
            return Err(ParseError::InvalidField {
                field: "len",
                reason: "bad commit start node length",
            });
        }
        Ok(Self {
            cmt_no: read_le_u64(data, EMBER_HDR_LEN)?,
        })
    }

    pub fn encode(&self, sqnum: Sqnum) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; CS_NODE_SZ];
        buf[EMBER_HDR_LEN..EMBER_HDR_LEN + 8].copy_from_slice(&self.cmt_no.to_le_bytes());
        finalize_node(&mut buf, NodeType::CommitStart, sqnum)?;
        Ok(buf)
    }
}

/// Padding node size (the node itself; `pad_len` more bytes follow it).
pub const PAD_NODE_SZ: usize = EMBER_HDR_LEN + 4;

/// Padding node: fills the tail of a write unit. The scanner skips the
/// node plus `pad_len` following bytes and accounts them as dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadNode {
    pub pad_len: u32,
}

impl PadNode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != PAD_NODE_SZ {
            return Err(ParseError::InvalidField {
                field: "len",
                reason: "bad pad node length",
            });
        }
        Ok(Self {
            pad_len: read_le_u32(data, EMBER_HDR_LEN)?,
        })
    }

    pub fn encode(&self, sqnum: Sqnum) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; PAD_NODE_SZ];
        buf[EMBER_HDR_LEN..EMBER_HDR_LEN + 4].copy_from_slice(&self.pad_len.to_le_bytes());
        finalize_node(&mut buf, NodeType::Pad, sqnum)?;
        Ok(buf)
    }
}
