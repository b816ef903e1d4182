//! Erase-block scanner.
//!
//! Walks one LEB from a starting offset and produces the ordered list of
//! valid nodes in it. Padding nodes are skipped (their extent is dirt, not
//! data), erased space ends the scan, and anything else that does not
//! parse as a node is corruption.

use crate::NodeStore;
use ember_error::{EmberError, Result};
use ember_ondisk::{NodeHeader, NodeType, PadNode, EMBER_HDR_LEN};
use ember_types::{align8, LebNumber, Sqnum};
use tracing::{debug, trace};

/// One scanned node.
#[derive(Debug, Clone)]
pub struct ScanNode {
    pub node_type: NodeType,
    pub offs: u32,
    pub len: u32,
    pub sqnum: Sqnum,
    pub bytes: Vec<u8>,
}

/// Result of scanning one LEB.
#[derive(Debug, Clone)]
pub struct ScannedLeb {
    pub leb: LebNumber,
    pub nodes: Vec<ScanNode>,
    /// First byte past the last node (or padding) found; everything from
    /// here to the end of the LEB is erased.
    pub endpt: u32,
}

fn is_erased(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0xFF)
}

/// Scan `leb` from `start` and return its nodes in on-flash order.
pub fn scan_leb(store: &NodeStore, leb: LebNumber, start: u32) -> Result<ScannedLeb> {
    let leb_size = store.geometry().leb_size();
    if start > leb_size {
        return Err(EmberError::Format(format!(
            "scan start {start} past end of LEB {leb}"
        )));
    }
    debug!(leb = leb.0, start, "scanning LEB");

    let mut buf = vec![0_u8; (leb_size - start) as usize];
    store.flash().read(leb, start, &mut buf)?;

    let mut nodes = Vec::new();
    let mut offs = start;
    loop {
        let rel = (offs - start) as usize;
        let remaining = &buf[rel..];
        if remaining.len() < EMBER_HDR_LEN || is_erased(remaining) {
            break;
        }

        let header = NodeHeader::parse(remaining).map_err(|err| EmberError::Corruption {
            leb: leb.0,
            offset: offs,
            detail: format!("scan stopped at unparseable node: {err}"),
        })?;
        let len = header.len;
        let node_end = offs
            .checked_add(align8(len))
            .filter(|&end| end <= leb_size)
            .ok_or_else(|| EmberError::Corruption {
                leb: leb.0,
                offset: offs,
                detail: format!("node length {len} runs past end of LEB"),
            })?;

        if header.node_type == NodeType::Pad {
            let pad = PadNode::parse(&remaining[..len as usize]).map_err(|err| {
                EmberError::Corruption {
                    leb: leb.0,
                    offset: offs,
                    detail: err.to_string(),
                }
            })?;
            let skip_to = node_end
                .checked_add(pad.pad_len)
                .filter(|&end| end <= leb_size)
                .ok_or_else(|| EmberError::Corruption {
                    leb: leb.0,
                    offset: offs,
                    detail: format!("pad length {} runs past end of LEB", pad.pad_len),
                })?;
            trace!(leb = leb.0, offs, pad = pad.pad_len, "skipping padding");
            offs = skip_to;
            continue;
        }

        nodes.push(ScanNode {
            node_type: header.node_type,
            offs,
            len,
            sqnum: header.sqnum,
            bytes: remaining[..len as usize].to_vec(),
        });
        offs = node_end;
    }

    // Everything past the scan end must be erased; a half-written node or
    // stray data here would silently corrupt the space accounting.
    let rel = (offs - start) as usize;
    if !is_erased(&buf[rel..]) {
        return Err(EmberError::Corruption {
            leb: leb.0,
            offset: offs,
            detail: "trailing data after last node".into(),
        });
    }

    debug!(leb = leb.0, nodes = nodes.len(), endpt = offs, "scan done");
    Ok(ScannedLeb { leb, nodes, endpt: offs })
}
