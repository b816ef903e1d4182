#![forbid(unsafe_code)]
//! Flash access and the Node Store.
//!
//! The `Flash` trait is the narrow seam to the raw erase-block layer: read
//! and write at (LEB, offset), nothing else. `NodeStore` layers the common
//! header validation on top: every node handed out has had its magic, type
//! tag, length and CRC checked against the requested location, and a
//! corruption report always carries that location.
//!
//! `try_read_node` is the fallible variant used wherever a node may
//! legitimately not exist (dangling branches during replay): validation
//! failures mean `Absent`, only real I/O failures are errors.

use ember_error::{EmberError, Result};
use ember_ondisk::{NodeHeader, NodeType, EMBER_HDR_LEN};
use ember_types::{Geometry, LebNumber, NodeLocation, ParseError};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, trace};

mod lprops;
mod scan;

pub use lprops::{LebProps, LpropsTable, LPROPS_INDEX, LPROPS_TAKEN};
pub use scan::{scan_leb, ScanNode, ScannedLeb};

/// Raw flash: fixed-size logical erase blocks addressed by (LEB, offset).
pub trait Flash: Send + Sync {
    fn leb_size(&self) -> u32;

    fn leb_cnt(&self) -> u32;

    /// Read exactly `buf.len()` bytes from `leb` at `offs`.
    fn read(&self, leb: LebNumber, offs: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `data` into `leb` at `offs`. Flash semantics: the region
    /// must currently be erased.
    fn write(&self, leb: LebNumber, offs: u32, data: &[u8]) -> Result<()>;

    /// Erase a whole LEB back to `0xFF`.
    fn erase(&self, leb: LebNumber) -> Result<()>;
}

/// In-memory flash device backing tests and fixtures.
///
/// Erased bytes read as `0xFF`, like real NOR/NAND behind UBI.
pub struct RamFlash {
    leb_size: u32,
    lebs: Vec<Mutex<Vec<u8>>>,
}

impl RamFlash {
    #[must_use]
    pub fn new(leb_cnt: u32, leb_size: u32) -> Self {
        let lebs = (0..leb_cnt)
            .map(|_| Mutex::new(vec![0xFF_u8; leb_size as usize]))
            .collect();
        Self { leb_size, lebs }
    }

    fn leb(&self, leb: LebNumber) -> Result<&Mutex<Vec<u8>>> {
        self.lebs.get(leb.0 as usize).ok_or_else(|| {
            EmberError::Format(format!("LEB {leb} out of range (have {})", self.lebs.len()))
        })
    }

    fn check_range(&self, leb: LebNumber, offs: u32, len: usize) -> Result<()> {
        let end = u64::from(offs) + len as u64;
        if end > u64::from(self.leb_size) {
            return Err(EmberError::Format(format!(
                "access past end of LEB {leb}: offset {offs} len {len}"
            )));
        }
        Ok(())
    }
}

impl Flash for RamFlash {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_cnt(&self) -> u32 {
        self.lebs.len() as u32
    }

    fn read(&self, leb: LebNumber, offs: u32, buf: &mut [u8]) -> Result<()> {
        self.check_range(leb, offs, buf.len())?;
        let data = self.leb(leb)?.lock();
        let start = offs as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, leb: LebNumber, offs: u32, data: &[u8]) -> Result<()> {
        self.check_range(leb, offs, data.len())?;
        let mut target = self.leb(leb)?.lock();
        let start = offs as usize;
        target[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&self, leb: LebNumber) -> Result<()> {
        self.leb(leb)?.lock().fill(0xFF);
        Ok(())
    }
}

/// Outcome of `try_read_node`: the node is either there and valid, or not
/// there. Only I/O failures escape as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRead {
    Present(Vec<u8>),
    Absent,
}

/// Validating reader over a `Flash`.
#[derive(Clone)]
pub struct NodeStore {
    flash: Arc<dyn Flash>,
    geometry: Geometry,
}

impl NodeStore {
    pub fn new(flash: Arc<dyn Flash>, geometry: Geometry) -> Result<Self> {
        if flash.leb_size() != geometry.leb_size() || flash.leb_cnt() < geometry.leb_cnt() {
            return Err(EmberError::Format(format!(
                "flash geometry mismatch: device {}x{}, expected {}x{}",
                flash.leb_cnt(),
                flash.leb_size(),
                geometry.leb_cnt(),
                geometry.leb_size()
            )));
        }
        Ok(Self { flash, geometry })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn flash(&self) -> &Arc<dyn Flash> {
        &self.flash
    }

    fn corruption(loc: &NodeLocation, err: &ParseError) -> EmberError {
        EmberError::Corruption {
            leb: loc.leb.0,
            offset: loc.offs,
            detail: err.to_string(),
        }
    }

    fn read_raw(&self, loc: &NodeLocation) -> Result<Vec<u8>> {
        if u64::from(loc.offs) + u64::from(loc.len) > u64::from(self.geometry.leb_size()) {
            return Err(EmberError::Corruption {
                leb: loc.leb.0,
                offset: loc.offs,
                detail: format!("node length {} exceeds LEB size", loc.len),
            });
        }
        let mut buf = vec![0_u8; loc.len as usize];
        self.flash.read(loc.leb, loc.offs, &mut buf)?;
        Ok(buf)
    }

    /// Read and validate a node of known kind and length.
    ///
    /// Magic, CRC, node type, and length are all checked; any mismatch is
    /// corruption at `loc`.
    pub fn read_node(&self, kind: NodeType, loc: &NodeLocation) -> Result<Vec<u8>> {
        trace!(leb = loc.leb.0, offs = loc.offs, len = loc.len, ?kind, "read node");
        if (loc.len as usize) < EMBER_HDR_LEN {
            return Err(EmberError::Corruption {
                leb: loc.leb.0,
                offset: loc.offs,
                detail: format!("node length {} shorter than header", loc.len),
            });
        }
        let buf = self.read_raw(loc)?;
        let header = NodeHeader::parse(&buf).map_err(|err| {
            error!(leb = loc.leb.0, offs = loc.offs, %err, "bad node header");
            Self::corruption(loc, &err)
        })?;
        if header.node_type != kind {
            return Err(EmberError::Corruption {
                leb: loc.leb.0,
                offset: loc.offs,
                detail: format!("expected {kind:?} node, found {:?}", header.node_type),
            });
        }
        if header.len != loc.len {
            return Err(EmberError::Corruption {
                leb: loc.leb.0,
                offset: loc.offs,
                detail: format!("expected length {}, node says {}", loc.len, header.len),
            });
        }
        Ok(buf)
    }

    /// Read a node that may legitimately not exist.
    ///
    /// Returns `Absent` when the bytes at `loc` do not form a valid node
    /// of the requested kind and length; a real I/O failure is still an
    /// error.
    pub fn try_read_node(&self, kind: NodeType, loc: &NodeLocation) -> Result<TryRead> {
        if (loc.len as usize) < EMBER_HDR_LEN
            || u64::from(loc.offs) + u64::from(loc.len) > u64::from(self.geometry.leb_size())
        {
            return Ok(TryRead::Absent);
        }
        let buf = self.read_raw(loc)?;
        match NodeHeader::parse(&buf) {
            Ok(header) if header.node_type == kind && header.len == loc.len => {
                Ok(TryRead::Present(buf))
            }
            Ok(_) | Err(_) => {
                debug!(leb = loc.leb.0, offs = loc.offs, ?kind, "node absent");
                Ok(TryRead::Absent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_ondisk::DataNode;
    use ember_types::{InodeNumber, Key, Sqnum};

    fn geometry() -> Geometry {
        Geometry::new(
            64 * 1024,
            32,
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

    fn store() -> NodeStore {
        let g = geometry();
        let flash = Arc::new(RamFlash::new(g.leb_cnt(), g.leb_size()));
        NodeStore::new(flash, g).expect("store")
    }

    fn sample_node() -> Vec<u8> {
        DataNode {
            key: Key::data(InodeNumber(7), 0),
            size: 4,
            data: vec![1, 2, 3, 4],
        }
        .encode(Sqnum(11))
        .expect("encode")
    }

    #[test]
    fn read_node_round_trip() {
        let store = store();
        let bytes = sample_node();
        let loc = NodeLocation::new(LebNumber(8), 0, bytes.len() as u32);
        store.flash().write(loc.leb, loc.offs, &bytes).expect("write");

        let read = store.read_node(NodeType::Data, &loc).expect("read");
        assert_eq!(read, bytes);
    }

    #[test]
    fn read_node_rejects_wrong_kind_and_length() {
        let store = store();
        let bytes = sample_node();
        let loc = NodeLocation::new(LebNumber(8), 0, bytes.len() as u32);
        store.flash().write(loc.leb, loc.offs, &bytes).expect("write");

        assert!(matches!(
            store.read_node(NodeType::Inode, &loc),
            Err(EmberError::Corruption { .. })
        ));
        let short = NodeLocation::new(loc.leb, loc.offs, loc.len - 4);
        assert!(matches!(
            store.read_node(NodeType::Data, &short),
            Err(EmberError::Corruption { .. })
        ));
    }

    #[test]
    fn read_node_rejects_corrupt_payload() {
        let store = store();
        let mut bytes = sample_node();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let loc = NodeLocation::new(LebNumber(8), 0, bytes.len() as u32);
        store.flash().write(loc.leb, loc.offs, &bytes).expect("write");

        assert!(matches!(
            store.read_node(NodeType::Data, &loc),
            Err(EmberError::Corruption { .. })
        ));
    }

    #[test]
    fn try_read_distinguishes_absent() {
        let store = store();
        let bytes = sample_node();
        let loc = NodeLocation::new(LebNumber(8), 0, bytes.len() as u32);

        // Nothing written yet: erased flash is absent, not an error.
        assert_eq!(
            store.try_read_node(NodeType::Data, &loc).expect("try"),
            TryRead::Absent
        );

        store.flash().write(loc.leb, loc.offs, &bytes).expect("write");
        assert!(matches!(
            store.try_read_node(NodeType::Data, &loc).expect("try"),
            TryRead::Present(_)
        ));
        // Wrong kind is absent too.
        assert_eq!(
            store.try_read_node(NodeType::Entry, &loc).expect("try"),
            TryRead::Absent
        );
    }
}
