#![forbid(unsafe_code)]
//! Mount-time journal replay.
//!
//! Everything journaled after the last successful commit lives in two
//! places: the log (commit-start and bud-reference records) and the buds
//! those references name. Replay scans both, builds one globally
//! sequence-ordered set of pending mutations, and applies them to the
//! TNC through its ordinary entry points — ascending sequence order
//! guarantees that later writes supersede earlier ones for the same key,
//! reproducing exact pre-crash commit order.
//!
//! Replay runs single-threaded before the file system is exposed to
//! anything else; it uses the TNC's locked operations for uniformity,
//! not protection. Any validation failure moves the state machine to
//! `Failed` and aborts the mount; no partial index is ever published.

use ember_error::{EmberError, Result};
use ember_ondisk::{
    CommitStartNode, DataNode, EntryNode, InodeNode, NodeType, RefNode, TruncNode,
};
use ember_store::{scan_leb, LpropsTable, NodeStore, ScanNode, LPROPS_TAKEN};
use ember_tnc::Tnc;
use ember_types::{
    align8, InodeNumber, Key, KeyType, LebNumber, NodeLocation, Sqnum, EMBER_BLOCK_SIZE,
    SQNUM_WATERMARK,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Inputs replay needs from the master-node/mount context.
#[derive(Debug, Clone, Copy)]
pub struct MountInfo {
    /// Commit number the log's first commit-start record must carry.
    pub cmt_no: u64,
    /// First log LEB to scan; the log is circular from here.
    pub log_head: LebNumber,
    /// LEB the committer was writing index nodes into.
    pub ihead: LebNumber,
    /// Write offset within the index head LEB.
    pub ihead_offs: u32,
}

/// What replay figured out, for the journal to resume from.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    /// First log LEB that was only partially filled.
    pub log_head: LebNumber,
    pub log_head_offs: u32,
    /// Highest sequence number seen anywhere in the journal.
    pub max_sqnum: u64,
    /// Highest inode number referenced by any replayed mutation.
    pub highest_ino: InodeNumber,
    /// Per journal head: where writing may resume (end of its last bud),
    /// present only when that bud still has room.
    pub head_seek: HashMap<u32, (LebNumber, u32)>,
}

/// Replay progress; `Failed` is terminal and aborts the mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayState {
    ScanningLog,
    ScanningBuds,
    Applying,
    Done,
    Failed(String),
}

#[derive(Debug, Clone)]
enum ReplayKind {
    Value,
    Deletion,
    BudRef { free: u32, dirty: u32 },
    Truncation { old_size: u64, new_size: u64 },
}

/// One pending mutation, keyed by sequence number in the replay set.
#[derive(Debug, Clone)]
struct ReplayEntry {
    loc: NodeLocation,
    key: Key,
    kind: ReplayKind,
    /// Entry name for hashed-key mutations.
    name: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct Bud {
    leb: LebNumber,
    start: u32,
    jhead: u32,
    /// Sequence number of the reference record that named this bud.
    sqnum: u64,
}

enum LogScan {
    More,
    End,
}

/// The replay engine. Build one per mount, `run` it once.
pub struct Replayer {
    store: NodeStore,
    lprops: Arc<LpropsTable>,
    info: MountInfo,
    state: ReplayState,
    entries: BTreeMap<u64, ReplayEntry>,
    buds: Vec<Bud>,
    /// Sequence number of the commit-start record: the low-water mark.
    cs_sqnum: u64,
    max_sqnum: u64,
    highest_ino: u64,
    log_head: (LebNumber, u32),
    head_seek: HashMap<u32, (LebNumber, u32)>,
}

impl Replayer {
    #[must_use]
    pub fn new(store: NodeStore, lprops: Arc<LpropsTable>, info: MountInfo) -> Self {
        let log_head = (info.log_head, 0);
        Self {
            store,
            lprops,
            info,
            state: ReplayState::ScanningLog,
            entries: BTreeMap::new(),
            buds: Vec::new(),
            cs_sqnum: 0,
            max_sqnum: 0,
            highest_ino: 0,
            log_head,
            head_seek: HashMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    /// Scan the log and buds, then rebuild the TNC's uncommitted tail.
    pub fn run(&mut self, tnc: &Tnc) -> Result<ReplayOutcome> {
        match self.try_run(tnc) {
            Ok(outcome) => {
                self.state = ReplayState::Done;
                Ok(outcome)
            }
            Err(err) => {
                self.state = ReplayState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    fn try_run(&mut self, tnc: &Tnc) -> Result<ReplayOutcome> {
        self.take_ihead()?;

        debug!("start replaying the journal");
        self.state = ReplayState::ScanningLog;
        self.scan_log()?;

        self.state = ReplayState::ScanningBuds;
        self.scan_buds()?;

        self.state = ReplayState::Applying;
        self.apply(tnc)?;

        let (log_head, log_head_offs) = self.log_head;
        debug!(
            log_head = log_head.0,
            log_head_offs,
            max_sqnum = self.max_sqnum,
            highest_ino = self.highest_ino,
            "replay finished"
        );
        Ok(ReplayOutcome {
            log_head,
            log_head_offs,
            max_sqnum: self.max_sqnum,
            highest_ino: InodeNumber(self.highest_ino),
            head_seek: std::mem::take(&mut self.head_seek),
        })
    }

    /// Check the recorded index-head position against space accounting
    /// and reserve that LEB before anything else touches it.
    fn take_ihead(&mut self) -> Result<()> {
        let props = self.lprops.lookup_dirty(self.info.ihead)?;
        let leb_size = self.store.geometry().leb_size();
        if self.info.ihead_offs != leb_size - props.free {
            return Err(EmberError::Corruption {
                leb: self.info.ihead.0,
                offset: self.info.ihead_offs,
                detail: format!(
                    "index head position disagrees with accounting (free {})",
                    props.free
                ),
            });
        }
        self.lprops
            .change(self.info.ihead, None, None, props.flags | LPROPS_TAKEN)?;
        Ok(())
    }

    // ── Log scanning ────────────────────────────────────────────────────

    fn scan_log(&mut self) -> Result<()> {
        let geometry = *self.store.geometry();
        let mut leb = self.info.log_head;
        for _ in 0..geometry.log_lebs {
            if leb.0 >= geometry.log_first.0 + geometry.log_lebs {
                // The log is logically circular.
                leb = geometry.log_first;
            }
            match self.replay_log_leb(leb)? {
                LogScan::End => break,
                LogScan::More => {}
            }
            leb = LebNumber(leb.0 + 1);
        }
        Ok(())
    }

    fn log_corrupt(leb: LebNumber, offs: u32, detail: impl Into<String>) -> EmberError {
        EmberError::Corruption {
            leb: leb.0,
            offset: offs,
            detail: detail.into(),
        }
    }

    fn replay_log_leb(&mut self, leb: LebNumber) -> Result<LogScan> {
        debug!(leb = leb.0, "replay log LEB");
        let scanned = scan_leb(&self.store, leb, 0)?;
        let Some(first) = scanned.nodes.first() else {
            return Ok(LogScan::End);
        };

        if self.cs_sqnum == 0 {
            // The very first record of the log must open the commit we
            // expect; its sequence number becomes the low-water mark
            // that tells us where the log ends.
            if first.node_type != NodeType::CommitStart {
                return Err(Self::log_corrupt(
                    leb,
                    first.offs,
                    "first log node is not a commit start",
                ));
            }
            let cs = CommitStartNode::parse(&first.bytes)
                .map_err(|err| Self::log_corrupt(leb, first.offs, err.to_string()))?;
            if cs.cmt_no != self.info.cmt_no {
                return Err(Self::log_corrupt(
                    leb,
                    first.offs,
                    format!(
                        "commit start names commit {}, expected {}",
                        cs.cmt_no, self.info.cmt_no
                    ),
                ));
            }
            self.cs_sqnum = first.sqnum.0;
            debug!(cs_sqnum = self.cs_sqnum, "commit start found");
        }

        if first.sqnum.0 < self.cs_sqnum {
            // Older log data from before the last commit; the erase
            // block was reused but not yet erased. End of log.
            return Ok(LogScan::End);
        }
        if first.offs != 0 {
            return Err(Self::log_corrupt(leb, first.offs, "first node is not at offset zero"));
        }

        for node in &scanned.nodes {
            if node.sqnum.0 >= SQNUM_WATERMARK {
                return Err(EmberError::SeqnumExhausted);
            }
            if node.sqnum.0 < self.cs_sqnum {
                return Err(Self::log_corrupt(
                    leb,
                    node.offs,
                    format!(
                        "sequence number {} below commit start {}",
                        node.sqnum, self.cs_sqnum
                    ),
                ));
            }
            if node.sqnum.0 > self.max_sqnum {
                self.max_sqnum = node.sqnum.0;
            }

            match node.node_type {
                NodeType::Ref => {
                    let rn = RefNode::parse(&node.bytes)
                        .map_err(|err| Self::log_corrupt(leb, node.offs, err.to_string()))?;
                    if self.validate_ref(leb, node, &rn)? {
                        debug!(bud = rn.leb.0, start = rn.offs, jhead = rn.jhead, "queue bud");
                        self.buds.push(Bud {
                            leb: rn.leb,
                            start: rn.offs,
                            jhead: rn.jhead,
                            sqnum: node.sqnum.0,
                        });
                    }
                }
                NodeType::CommitStart => {
                    if node.offs != 0 {
                        return Err(Self::log_corrupt(
                            leb,
                            node.offs,
                            "commit start in the middle of a log LEB",
                        ));
                    }
                }
                other => {
                    return Err(Self::log_corrupt(
                        leb,
                        node.offs,
                        format!("unexpected {other:?} node in log"),
                    ));
                }
            }
        }

        self.log_head = (leb, scanned.endpt);
        Ok(LogScan::More)
    }

    /// Validate a bud reference. Returns whether the bud is new; a
    /// repeated reference to the same bud region is skipped, any other
    /// duplicate is corruption.
    fn validate_ref(&self, leb: LebNumber, node: &ScanNode, rn: &RefNode) -> Result<bool> {
        let geometry = self.store.geometry();
        // A head sitting exactly at the end of its LEB is referenced
        // with offs == leb_size, hence `>` rather than `>=`.
        if rn.jhead >= geometry.jhead_cnt
            || !geometry.is_main_leb(rn.leb)
            || rn.offs > geometry.leb_size()
            || rn.offs % geometry.min_io_size() != 0
        {
            return Err(Self::log_corrupt(
                leb,
                node.offs,
                format!(
                    "bad bud reference {}:{} head {}",
                    rn.leb, rn.offs, rn.jhead
                ),
            ));
        }
        if let Some(existing) = self.buds.iter().find(|b| b.leb == rn.leb) {
            if existing.jhead == rn.jhead && existing.start <= rn.offs {
                return Ok(false);
            }
            return Err(Self::log_corrupt(
                leb,
                node.offs,
                format!("bud {}:{} was already referred", rn.leb, rn.offs),
            ));
        }
        Ok(true)
    }

    // ── Bud scanning ────────────────────────────────────────────────────

    fn scan_buds(&mut self) -> Result<()> {
        let buds = self.buds.clone();
        for bud in buds {
            let (free, dirty, endpt) = self.replay_bud(&bud)?;
            self.insert_entry(
                bud.sqnum,
                ReplayEntry {
                    loc: NodeLocation::new(bud.leb, bud.start, 0),
                    key: Key::highest(InodeNumber(u64::MAX)),
                    kind: ReplayKind::BudRef { free, dirty },
                    name: None,
                },
                bud.leb,
            )?;
            let geometry = *self.store.geometry();
            if endpt + geometry.min_io_size() <= geometry.leb_size() {
                self.head_seek.insert(bud.jhead, (bud.leb, endpt));
            }
        }
        Ok(())
    }

    /// Scan one bud, classify its records into replay entries, and work
    /// out how much of the region is live.
    ///
    /// The bud region's dirt is padding, deletion records, truncation
    /// records, and nodes obsoleted by later records; instead of
    /// computing clean space directly, live bytes are summed and the
    /// rest of the scanned region is dirt.
    fn replay_bud(&mut self, bud: &Bud) -> Result<(u32, u32, u32)> {
        debug!(leb = bud.leb.0, start = bud.start, jhead = bud.jhead, "replay bud");
        let scanned = scan_leb(&self.store, bud.leb, bud.start)?;
        let geometry = *self.store.geometry();
        let max_inode_size = geometry.max_inode_size;
        let mut used = 0_u32;

        for node in &scanned.nodes {
            if node.sqnum.0 >= SQNUM_WATERMARK {
                return Err(EmberError::SeqnumExhausted);
            }
            if node.sqnum.0 > self.max_sqnum {
                self.max_sqnum = node.sqnum.0;
            }
            let loc = NodeLocation::new(bud.leb, node.offs, node.len);
            let bad = |err: String| EmberError::Corruption {
                leb: bud.leb.0,
                offset: node.offs,
                detail: err,
            };

            match node.node_type {
                NodeType::Inode => {
                    let ino = InodeNode::parse(&node.bytes).map_err(|err| bad(err.to_string()))?;
                    let deletion = ino.nlink == 0;
                    if !deletion {
                        used += align8(node.len);
                    }
                    self.insert_entry(
                        node.sqnum.0,
                        ReplayEntry {
                            loc,
                            key: ino.key,
                            kind: if deletion {
                                ReplayKind::Deletion
                            } else {
                                ReplayKind::Value
                            },
                            name: None,
                        },
                        bud.leb,
                    )?;
                }
                NodeType::Data => {
                    let data = DataNode::parse(&node.bytes).map_err(|err| bad(err.to_string()))?;
                    used += align8(node.len);
                    self.insert_entry(
                        node.sqnum.0,
                        ReplayEntry {
                            loc,
                            key: data.key,
                            kind: ReplayKind::Value,
                            name: None,
                        },
                        bud.leb,
                    )?;
                }
                NodeType::Entry => {
                    // Parsing validates name length, terminator, and
                    // key class consistency.
                    let entry = EntryNode::parse(&node.bytes).map_err(|err| bad(err.to_string()))?;
                    let deletion = entry.is_deletion();
                    if !deletion {
                        used += align8(node.len);
                    }
                    self.insert_entry(
                        node.sqnum.0,
                        ReplayEntry {
                            loc,
                            key: entry.key,
                            kind: if deletion {
                                ReplayKind::Deletion
                            } else {
                                ReplayKind::Value
                            },
                            name: Some(entry.name),
                        },
                        bud.leb,
                    )?;
                }
                NodeType::Trunc => {
                    let trun = TruncNode::parse(&node.bytes).map_err(|err| bad(err.to_string()))?;
                    if trun.old_size > max_inode_size
                        || trun.new_size > max_inode_size
                        || trun.old_size <= trun.new_size
                    {
                        return Err(bad(format!(
                            "bad truncation {} -> {}",
                            trun.old_size, trun.new_size
                        )));
                    }
                    self.insert_entry(
                        node.sqnum.0,
                        ReplayEntry {
                            loc,
                            key: trun.key,
                            kind: ReplayKind::Truncation {
                                old_size: trun.old_size,
                                new_size: trun.new_size,
                            },
                            name: None,
                        },
                        bud.leb,
                    )?;
                }
                other => {
                    return Err(bad(format!("unexpected {other:?} node in bud")));
                }
            }
        }

        debug_assert!(scanned.endpt - bud.start >= used);
        let dirty = scanned.endpt - bud.start - used;
        let free = geometry.leb_size() - scanned.endpt;
        Ok((free, dirty, scanned.endpt))
    }

    /// Insert into the sequence-ordered set. A duplicate sequence number
    /// means two journal records claim the same point in history: fatal
    /// corruption.
    fn insert_entry(&mut self, sqnum: u64, entry: ReplayEntry, leb: LebNumber) -> Result<()> {
        if !matches!(entry.kind, ReplayKind::BudRef { .. }) && entry.key.ino().0 >= self.highest_ino
        {
            self.highest_ino = entry.key.ino().0;
        }
        match self.entries.entry(sqnum) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
            std::collections::btree_map::Entry::Occupied(_) => Err(EmberError::Corruption {
                leb: leb.0,
                offset: entry.loc.offs,
                detail: format!("duplicate sequence number {sqnum} in replay"),
            }),
        }
    }

    // ── Applying ────────────────────────────────────────────────────────

    fn apply(&mut self, tnc: &Tnc) -> Result<()> {
        tnc.begin_replay();
        let result = self.apply_entries(tnc);
        tnc.end_replay();
        result
    }

    fn apply_entries(&mut self, tnc: &Tnc) -> Result<()> {
        let entries = std::mem::take(&mut self.entries);
        for (sqnum, entry) in &entries {
            // The watermark lets collision resolution recognize nodes
            // that were written after this mutation and therefore cannot
            // be in the index yet.
            tnc.set_replay_watermark(Sqnum(*sqnum));
            match &entry.kind {
                ReplayKind::BudRef { free, dirty } => {
                    self.set_bud_lprops(entry, *free, *dirty)?;
                }
                ReplayKind::Value => match &entry.name {
                    Some(name) => tnc.add_nm(&entry.key, entry.loc, name)?,
                    None => tnc.add(&entry.key, entry.loc)?,
                },
                ReplayKind::Deletion => match &entry.name {
                    Some(name) => tnc.remove_nm(&entry.key, name)?,
                    None => {
                        if matches!(entry.key.kind(), Ok(KeyType::Inode)) {
                            tnc.remove_ino(entry.key.ino())?;
                        } else {
                            tnc.remove(&entry.key)?;
                        }
                    }
                },
                ReplayKind::Truncation { old_size, new_size } => {
                    Self::truncate_range(tnc, &entry.key, *old_size, *new_size)?;
                }
            }
        }
        Ok(())
    }

    /// A truncation deletes the data-block keys in `[new_size, old_size)`
    /// rounded to whole blocks.
    fn truncate_range(tnc: &Tnc, key: &Key, old_size: u64, new_size: u64) -> Result<()> {
        let block = u64::from(EMBER_BLOCK_SIZE);
        let mut min_blk = new_size / block;
        if new_size % block != 0 {
            min_blk += 1;
        }
        let mut max_blk = old_size / block;
        if old_size % block == 0 {
            max_blk = max_blk.saturating_sub(1);
        }
        let ino = key.ino();
        tnc.remove_range(
            &Key::data(ino, min_blk as u32),
            &Key::data(ino, max_blk as u32),
        )
    }

    /// Account a bud's free/dirty space. If the bud starts at offset
    /// zero but accounting says the LEB is not pristine, the bud was
    /// garbage-collected after being referenced and its dirt adjusts
    /// accordingly.
    fn set_bud_lprops(&self, entry: &ReplayEntry, free: u32, dirty: u32) -> Result<()> {
        let leb = entry.loc.leb;
        let leb_size = self.store.geometry().leb_size();
        let props = self.lprops.lookup_dirty(leb)?;

        let mut base_dirty = i64::from(props.dirty);
        if entry.loc.offs == 0 && (props.free != leb_size || props.dirty != 0) {
            debug!(
                leb = leb.0,
                free = props.free,
                dirty = props.dirty,
                "bud was garbage-collected after being referenced"
            );
            base_dirty -= i64::from(leb_size - props.free);
            if base_dirty != 0 {
                warn!(
                    leb = leb.0,
                    lp_free = props.free,
                    lp_dirty = props.dirty,
                    replay_free = free,
                    replay_dirty = dirty,
                    "bud accounting mismatch"
                );
            }
        }
        let total_dirty = base_dirty.max(0) as u32 + dirty;
        self.lprops.change(
            leb,
            Some(free),
            Some(total_dirty.min(leb_size)),
            props.flags | LPROPS_TAKEN,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_block_rounding() {
        // [new, old) in blocks; partial head block survives.
        let block = u64::from(EMBER_BLOCK_SIZE);
        // new_size inside block 0: first removed block is 1.
        assert_eq!({
            let mut min = 100 / block;
            if 100 % block != 0 {
                min += 1;
            }
            min
        }, 1);
        // old_size exactly on a block boundary: last removed block is
        // old/block - 1.
        assert_eq!({
            let mut max = (2 * block) / block;
            if (2 * block) % block == 0 {
                max -= 1;
            }
            max
        }, 1);
    }

    #[test]
    fn state_machine_starts_scanning() {
        // Construction alone must not touch the device.
        let g = ember_types::Geometry::new(
            4096,
            32,
            8,
            8,
            LebNumber(1),
            4,
            LebNumber(8),
            2,
            1 << 40,
        )
        .expect("geometry");
        let flash = std::sync::Arc::new(ember_store::RamFlash::new(g.leb_cnt(), g.leb_size()));
        let store = NodeStore::new(flash, g).expect("store");
        let lprops = Arc::new(LpropsTable::new(g));
        let replayer = Replayer::new(
            store,
            lprops,
            MountInfo {
                cmt_no: 0,
                log_head: LebNumber(1),
                ihead: LebNumber(8),
                ihead_offs: 0,
            },
        );
        assert_eq!(*replayer.state(), ReplayState::ScanningLog);
    }
}
