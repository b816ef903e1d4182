#![forbid(unsafe_code)]
//! EmberFS index core.
//!
//! The indexing and crash-recovery heart of a log-structured flash file
//! system: an in-memory copy-on-write B+tree mapping file-system keys to
//! their physical location on flash (the Tree Node Cache), and the
//! journal replay engine that rebuilds the tree's uncommitted tail at
//! mount. This facade re-exports the public surface of the member
//! crates.

pub use ember_error::{EmberError, Result};
pub use ember_ondisk::{
    CommitStartNode, DataNode, EntryNode, EntryType, IndexBranch, IndexNode, InodeNode,
    NodeHeader, NodeType, PadNode, RefNode, TruncNode,
};
pub use ember_replay::{MountInfo, ReplayOutcome, ReplayState, Replayer};
pub use ember_store::{
    scan_leb, Flash, LebProps, LpropsTable, NodeStore, RamFlash, ScanNode, ScannedLeb, TryRead,
};
pub use ember_tnc::{Tnc, TncMetrics};
pub use ember_types::{
    Geometry, InodeNumber, Key, KeyType, LebNumber, NodeLocation, Sqnum, EMBER_BLOCK_SIZE,
    SQNUM_WATERMARK,
};
