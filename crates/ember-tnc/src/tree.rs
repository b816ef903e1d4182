//! The index tree proper: descent, copy-on-write dirtying, insert with
//! splitting, delete with upward shrinking, ordered traversal, and the
//! old-index bookkeeping that keeps the last committed tree recoverable.
//!
//! Everything in this module runs under the TNC's single exclusive lock;
//! `Tree` itself is not synchronized.

use crate::znode::{Arena, Zbranch, Znode, ZnodeId, ZnodeState};
use crate::TncMetrics;
use ember_error::{EmberError, Result};
use ember_ondisk::{
    EntryNode, IndexNode, NodeType, DATA_NODE_HDR_SZ, ENTRY_NODE_HDR_SZ, INODE_NODE_SZ,
};
use ember_store::{LpropsTable, NodeStore};
use ember_types::{
    align8, Key, KeyType, LebNumber, NodeLocation, EMBER_BLOCK_SIZE, EMBER_MAX_LEVELS,
    EMBER_MAX_NLEN,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Tree state guarded by the TNC lock.
pub(crate) struct Tree {
    pub(crate) store: NodeStore,
    pub(crate) lprops: Arc<LpropsTable>,
    pub(crate) arena: Arena,
    /// Loaded root znode, if any.
    pub(crate) root: Option<ZnodeId>,
    /// On-flash location of the committed root, cleared once the root is
    /// dirtied past it.
    pub(crate) root_loc: Option<NodeLocation>,
    /// Index-node locations obsoleted since the last commit began, keyed
    /// by (LEB, offset). The committer must not overwrite these until the
    /// new index is durable.
    pub(crate) old_idx: BTreeSet<(u32, u32)>,
    /// Obsolete znodes still reachable through the in-flight commit's
    /// snapshot; their slots are reclaimed when the commit epoch ends.
    pub(crate) retired: Vec<ZnodeId>,
    pub(crate) committing: bool,
    pub(crate) metrics: TncMetrics,
    /// Estimated size of the index if it were committed now.
    pub(crate) calc_idx_sz: u64,
    /// Access clock for the external memory-pressure reclaimer.
    pub(crate) tick: u64,
    /// Replay mode: hashed-key resolution tolerates dangling branches.
    pub(crate) replaying: bool,
    /// Sequence number of the mutation currently being replayed; nodes
    /// stamped newer than this cannot be in the index yet.
    pub(crate) replay_sqnum: u64,
}

impl Tree {
    pub(crate) fn new_empty(store: NodeStore, lprops: Arc<LpropsTable>) -> Self {
        let mut arena = Arena::new();
        let root = arena.alloc(Znode::new(0, ZnodeState::Dirty));
        Self {
            store,
            lprops,
            arena,
            root: Some(root),
            root_loc: None,
            old_idx: BTreeSet::new(),
            retired: Vec::new(),
            committing: false,
            metrics: TncMetrics {
                dirty_znodes: 1,
                clean_znodes: 0,
            },
            calc_idx_sz: 0,
            tick: 0,
            replaying: false,
            replay_sqnum: 0,
        }
    }

    pub(crate) fn open(
        store: NodeStore,
        lprops: Arc<LpropsTable>,
        root_loc: NodeLocation,
        index_size: u64,
    ) -> Self {
        Self {
            store,
            lprops,
            arena: Arena::new(),
            root: None,
            root_loc: Some(root_loc),
            old_idx: BTreeSet::new(),
            retired: Vec::new(),
            committing: false,
            metrics: TncMetrics::default(),
            calc_idx_sz: index_size,
            tick: 0,
            replaying: false,
            replay_sqnum: 0,
        }
    }

    #[inline]
    pub(crate) fn zn(&self, id: ZnodeId) -> &Znode {
        self.arena.get(id)
    }

    #[inline]
    pub(crate) fn zn_mut(&mut self, id: ZnodeId) -> &mut Znode {
        self.arena.get_mut(id)
    }

    pub(crate) fn corrupt(loc: &NodeLocation, detail: impl Into<String>) -> EmberError {
        EmberError::Corruption {
            leb: loc.leb.0,
            offset: loc.offs,
            detail: detail.into(),
        }
    }

    // ── Old-index tracking ──────────────────────────────────────────────

    /// Record an index-node location obsoleted since the last commit
    /// began. Double insertion is harmless.
    pub(crate) fn insert_old_idx(&mut self, leb: LebNumber, offs: u32) {
        if !self.old_idx.insert((leb.0, offs)) {
            warn!(leb = leb.0, offs, "old index location recorded twice");
        }
    }

    /// The branch referring to `id`: its parent's slot, or the root
    /// branch.
    fn referring_loc(&self, id: ZnodeId) -> Option<NodeLocation> {
        match self.zn(id).parent {
            Some(p) => self.zn(p).branches[self.zn(id).iip].loc,
            None => self.root_loc,
        }
    }

    /// Record the on-flash location of `id` (through its referring
    /// branch) in the old-index set.
    pub(crate) fn insert_old_idx_znode(&mut self, id: ZnodeId) {
        if let Some(loc) = self.referring_loc(id) {
            self.insert_old_idx(loc.leb, loc.offs);
        }
    }

    /// Record the location of `id` in the old-index set and clear it from
    /// the referring branch: the znode can no longer be found by key, so
    /// the branch's location is meaningless from now on.
    fn ins_clr_old_idx_znode(&mut self, id: ZnodeId) {
        let parent = self.zn(id).parent;
        let iip = self.zn(id).iip;
        let loc = match parent {
            Some(p) => self.zn_mut(p).branches[iip].loc.take(),
            None => self.root_loc.take(),
        };
        if let Some(loc) = loc {
            self.insert_old_idx(loc.leb, loc.offs);
        }
    }

    /// Account index bytes at `loc` as dirty and shrink the committed
    /// index size estimate.
    fn add_idx_dirt(&mut self, loc: &NodeLocation) -> Result<()> {
        self.calc_idx_sz = self.calc_idx_sz.saturating_sub(u64::from(align8(loc.len)));
        self.lprops.add_dirt(loc.leb, loc.len)
    }

    // ── Loading ─────────────────────────────────────────────────────────

    pub(crate) fn ensure_root(&mut self) -> Result<ZnodeId> {
        if let Some(root) = self.root {
            return Ok(root);
        }
        let Some(loc) = self.root_loc else {
            return Err(EmberError::Format("index tree has no root".into()));
        };
        self.load_znode(loc, None)
    }

    /// Read an index node from flash, validate it, and link it into the
    /// tree as a clean znode.
    fn load_znode(&mut self, loc: NodeLocation, parent: Option<(ZnodeId, usize)>) -> Result<ZnodeId> {
        let bytes = self.store.read_node(NodeType::Index, &loc)?;
        let idx = IndexNode::parse(&bytes).map_err(|err| Self::corrupt(&loc, err.to_string()))?;
        let geometry = *self.store.geometry();

        let child_cnt = idx.branches.len();
        if child_cnt == 0 || child_cnt > geometry.fanout() {
            return Err(Self::corrupt(
                &loc,
                format!("bad child count {child_cnt} (fanout {})", geometry.fanout()),
            ));
        }
        if idx.level > EMBER_MAX_LEVELS {
            return Err(Self::corrupt(&loc, format!("bad level {}", idx.level)));
        }

        for (i, branch) in idx.branches.iter().enumerate() {
            if !geometry.branch_target_ok(&branch.loc) {
                return Err(Self::corrupt(
                    &loc,
                    format!("bad branch {i} target {}", branch.loc),
                ));
            }
            let kind = branch
                .key
                .kind()
                .map_err(|err| Self::corrupt(&loc, err.to_string()))?;
            if kind == KeyType::Trunc {
                return Err(Self::corrupt(
                    &loc,
                    format!("truncation key in index at slot {i}"),
                ));
            }
            if idx.level == 0 {
                let len = branch.loc.len as usize;
                let ok = match kind {
                    KeyType::Inode => len == INODE_NODE_SZ,
                    KeyType::Data => {
                        (DATA_NODE_HDR_SZ..=DATA_NODE_HDR_SZ + EMBER_BLOCK_SIZE as usize)
                            .contains(&len)
                    }
                    KeyType::Entry | KeyType::Xattr => {
                        (ENTRY_NODE_HDR_SZ + 1..=EntryNode::encoded_len(EMBER_MAX_NLEN))
                            .contains(&len)
                    }
                    KeyType::Trunc => false,
                };
                if !ok {
                    return Err(Self::corrupt(
                        &loc,
                        format!("bad target length {len} for {kind:?} key at slot {i}"),
                    ));
                }
            }
        }

        for i in 0..child_cnt - 1 {
            let key1 = idx.branches[i].key;
            let key2 = idx.branches[i + 1].key;
            if key1 > key2 {
                return Err(Self::corrupt(&loc, format!("bad key order at slots {i}..")));
            }
            if key1 == key2 && !key1.is_hashed() {
                return Err(Self::corrupt(
                    &loc,
                    format!("equal non-hashed keys at slots {i}.."),
                ));
            }
        }

        let mut znode = Znode::new(idx.level, ZnodeState::Clean);
        znode.parent = parent.map(|(p, _)| p);
        znode.iip = parent.map_or(0, |(_, iip)| iip);
        znode.time = self.tick;
        znode.branches = idx
            .branches
            .iter()
            .map(|b| Zbranch::leaf_at(b.key, b.loc))
            .collect();

        let id = self.arena.alloc(znode);
        self.metrics.clean_znodes += 1;
        match parent {
            Some((p, iip)) => self.zn_mut(p).branches[iip].child = Some(id),
            None => self.root = Some(id),
        }
        trace!(leb = loc.leb.0, offs = loc.offs, level = idx.level, child_cnt, "loaded znode");
        Ok(id)
    }

    /// The child znode at `znode.branches[n]`, loading it if necessary.
    pub(crate) fn get_child(&mut self, id: ZnodeId, n: usize) -> Result<ZnodeId> {
        let branch = &self.zn(id).branches[n];
        if let Some(child) = branch.child {
            return Ok(child);
        }
        let Some(loc) = branch.loc else {
            return Err(EmberError::Format(
                "branch has neither a location nor a loaded child".into(),
            ));
        };
        self.load_znode(loc, Some((id, n)))
    }

    // ── Copy-on-write dirtying ──────────────────────────────────────────

    /// Make `id` mutable: dirty it in place, or, if an in-flight commit
    /// references it, replace it with a dirty duplicate. Returns the
    /// handle the caller must use from here on.
    pub(crate) fn dirty_cow(&mut self, id: ZnodeId) -> Result<ZnodeId> {
        match self.zn(id).state {
            ZnodeState::Dirty => Ok(id),
            ZnodeState::Clean => {
                self.zn_mut(id).state = ZnodeState::Dirty;
                self.metrics.clean_znodes -= 1;
                self.metrics.dirty_znodes += 1;
                if let Some(loc) = self.referring_loc(id) {
                    self.add_idx_dirt(&loc)?;
                }
                Ok(id)
            }
            ZnodeState::CowPending => {
                debug_assert!(!self.zn(id).obsolete, "dirtying an obsolete znode");
                let mut dup = self.zn(id).clone();
                dup.state = ZnodeState::Dirty;
                dup.obsolete = false;
                let new_id = self.arena.alloc(dup);

                self.zn_mut(id).obsolete = true;
                // The duplicate joins the dirty set and the obsolete
                // original leaves it for the commit's snapshot, so the
                // dirty count nets out and the clean count grows by one.
                self.metrics.clean_znodes += 1;

                let children: Vec<ZnodeId> = self
                    .zn(new_id)
                    .branches
                    .iter()
                    .filter_map(|b| b.child)
                    .collect();
                for child in children {
                    self.zn_mut(child).parent = Some(new_id);
                }

                let parent = self.zn(id).parent;
                let iip = self.zn(id).iip;
                let loc = match parent {
                    Some(p) => {
                        let branch = &mut self.zn_mut(p).branches[iip];
                        branch.child = Some(new_id);
                        branch.loc.take()
                    }
                    None => {
                        self.root = Some(new_id);
                        self.root_loc.take()
                    }
                };
                if let Some(loc) = loc {
                    self.insert_old_idx(loc.leb, loc.offs);
                    self.add_idx_dirt(&loc)?;
                }
                self.retired.push(id);
                trace!(?id, ?new_id, "copied znode for in-flight commit");
                Ok(new_id)
            }
        }
    }

    /// Dirty `id` and every ancestor above it.
    ///
    /// Used when an operation holds a direct znode reference without
    /// having just looked it up by key (so a top-down dirtying descent is
    /// not possible): record the path up to the nearest safely dirty
    /// ancestor, then walk back down dirtying each znode on it.
    pub(crate) fn dirty_cow_bottom_up(&mut self, id: ZnodeId) -> Result<ZnodeId> {
        let root = self.ensure_root()?;
        let mut path: Vec<usize> = Vec::new();
        let mut cur = id;
        if self.zn(root).level != 0 {
            loop {
                let znode = self.zn(cur);
                let Some(parent) = znode.parent else { break };
                path.push(znode.iip);
                let parent_cow = self.zn(parent).state == ZnodeState::CowPending;
                if !parent_cow && znode.is_dirty() {
                    break;
                }
                cur = parent;
            }
        }

        loop {
            let has_parent = self.zn(cur).parent.is_some();
            cur = self.dirty_cow(cur)?;
            if has_parent {
                path.pop();
            }
            match path.last().copied() {
                Some(iip) => {
                    cur = self.zn(cur).branches[iip]
                        .child
                        .expect("bottom-up path child is loaded");
                }
                None => break,
            }
        }
        Ok(cur)
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Descend to the level-0 znode covering `key`.
    ///
    /// Returns `(exact, znode, slot)`; on a miss the slot is the
    /// immediate predecessor, `-1` if the key sorts before the leftmost
    /// entry. For hashed keys the descent compensates for colliding
    /// entries that a split may have placed in the left sibling.
    pub(crate) fn lookup_level0(&mut self, key: &Key) -> Result<(bool, ZnodeId, isize)> {
        let mut znode = self.ensure_root()?;
        self.tick += 1;
        let time = self.tick;

        let (exact, n);
        loop {
            self.zn_mut(znode).time = time;
            let (e, slot) = self.zn(znode).search_branches(key);
            if self.zn(znode).level == 0 {
                exact = e;
                n = slot;
                break;
            }
            let slot = slot.max(0) as usize;
            znode = self.get_child(znode, slot)?;
        }

        if exact || !key.is_hashed() || n != -1 {
            trace!(%key, exact, n, "lookup_level0");
            return Ok((exact, znode, n));
        }

        // The key is hashed and sorts before this znode's first entry. A
        // colliding entry equal to the parent boundary key may live in
        // the left sibling, so check the ordered predecessor.
        match self.tnc_prev(znode, n)? {
            None => Ok((false, znode, -1)),
            Some((pz, pn)) => {
                if self.zn(pz).branches[pn].key == *key {
                    Ok((true, pz, pn as isize))
                } else {
                    Ok((false, znode, -1))
                }
            }
        }
    }

    /// Like `lookup_level0`, but copy-on-write–dirties every znode on the
    /// descent path so the caller may mutate the result in place.
    pub(crate) fn lookup_level0_dirty(&mut self, key: &Key) -> Result<(bool, ZnodeId, isize)> {
        let root = self.ensure_root()?;
        let mut znode = self.dirty_cow(root)?;
        self.tick += 1;
        let time = self.tick;

        let (exact, n);
        loop {
            self.zn_mut(znode).time = time;
            let (e, slot) = self.zn(znode).search_branches(key);
            if self.zn(znode).level == 0 {
                exact = e;
                n = slot;
                break;
            }
            let slot = slot.max(0) as usize;
            let child = self.get_child(znode, slot)?;
            znode = self.dirty_cow(child)?;
        }

        if exact || !key.is_hashed() || n != -1 {
            trace!(%key, exact, n, "lookup_level0_dirty");
            return Ok((exact, znode, n));
        }

        match self.tnc_prev(znode, n)? {
            None => Ok((false, znode, -1)),
            Some((pz, pn)) => {
                if self.zn(pz).branches[pn].key == *key {
                    let pz = if self.zn(pz).state != ZnodeState::Dirty {
                        self.dirty_cow_bottom_up(pz)?
                    } else {
                        pz
                    };
                    Ok((true, pz, pn as isize))
                } else {
                    Ok((false, znode, -1))
                }
            }
        }
    }

    // ── Ordered traversal ───────────────────────────────────────────────

    /// The entry after `(id, n)` in key order, loading siblings as
    /// needed. `None` at the end of the tree.
    pub(crate) fn tnc_next(&mut self, id: ZnodeId, n: isize) -> Result<Option<(ZnodeId, usize)>> {
        let mut znode = id;
        let next = n + 1;
        debug_assert!(next >= 0);
        if (next as usize) < self.zn(znode).branches.len() {
            return Ok(Some((znode, next as usize)));
        }
        loop {
            let Some(parent) = self.zn(znode).parent else {
                return Ok(None);
            };
            let slot = self.zn(znode).iip + 1;
            znode = parent;
            if slot < self.zn(znode).branches.len() {
                let mut child = self.get_child(znode, slot)?;
                while self.zn(child).level != 0 {
                    child = self.get_child(child, 0)?;
                }
                return Ok(Some((child, 0)));
            }
        }
    }

    /// The entry before `(id, n)` in key order. `None` before the first.
    pub(crate) fn tnc_prev(&mut self, id: ZnodeId, n: isize) -> Result<Option<(ZnodeId, usize)>> {
        let mut znode = id;
        if n > 0 {
            return Ok(Some((znode, (n - 1) as usize)));
        }
        loop {
            let Some(parent) = self.zn(znode).parent else {
                return Ok(None);
            };
            let iip = self.zn(znode).iip;
            znode = parent;
            if iip > 0 {
                let mut child = self.get_child(znode, iip - 1)?;
                while self.zn(child).level != 0 {
                    let last = self.zn(child).branches.len() - 1;
                    child = self.get_child(child, last)?;
                }
                let last = self.zn(child).branches.len() - 1;
                return Ok(Some((child, last)));
            }
        }
    }

    // ── Insert and split ────────────────────────────────────────────────

    /// Insert `zbr` at slot `n` of `id`, shifting the following branches
    /// right. The caller guarantees a free slot.
    fn insert_zbranch(&mut self, id: ZnodeId, zbr: Zbranch, n: usize) {
        debug_assert!(self.zn(id).is_dirty());
        let level;
        {
            let znode = self.zn_mut(id);
            znode.branches.insert(n, zbr);
            level = znode.level;
            // Inserting at slot 0 moves this znode's lower key bound; if
            // it later splits, its old location must be recorded in the
            // old-index set because key correction elsewhere may already
            // have made it unreachable by key.
            if n == 0 {
                znode.alt = true;
            }
        }
        if level != 0 {
            let updates: Vec<(ZnodeId, usize)> = self
                .zn(id)
                .branches
                .iter()
                .enumerate()
                .skip(n)
                .filter_map(|(i, b)| b.child.map(|c| (c, i)))
                .collect();
            for (child, iip) in updates {
                let child = self.zn_mut(child);
                child.parent = Some(id);
                child.iip = iip;
            }
        }
    }

    /// When the leftmost key of `id` dropped, propagate it into every
    /// ancestor that also begins at slot 0.
    fn correct_parent_keys(&mut self, id: ZnodeId) {
        debug_assert!(self.zn(id).parent.is_some());
        debug_assert_eq!(self.zn(id).iip, 0);
        let key = self.zn(id).branches[0].key;
        let mut znode = id;
        while let Some(parent) = self.zn(znode).parent {
            if key >= self.zn(parent).branches[0].key {
                break;
            }
            self.zn_mut(parent).branches[0].key = key;
            znode = parent;
            if self.zn(znode).parent.is_none() || self.zn(znode).iip != 0 {
                break;
            }
        }
    }

    /// Insert a branch into `znode` at slot `n`, splitting overfull
    /// znodes on the way up. Split propagation is an explicit loop
    /// carrying (current znode, pending sibling branch), so stack depth
    /// never depends on tree height.
    pub(crate) fn tnc_insert(&mut self, znode: ZnodeId, zbr: Zbranch, n: usize) -> Result<()> {
        let fanout = self.store.geometry().fanout();
        let mut znode = znode;
        let mut zbr = zbr;
        let mut n = n;
        let mut appending = false;

        loop {
            debug_assert!(n <= fanout);
            let level = self.zn(znode).level;
            let parent = self.zn(znode).parent;

            if self.zn(znode).branches.len() < fanout {
                trace!(key = %zbr.key, n, level, "inserted branch");
                let iip = self.zn(znode).iip;
                self.insert_zbranch(znode, zbr, n);
                if n == 0 && parent.is_some() && iip == 0 {
                    self.correct_parent_keys(znode);
                }
                return Ok(());
            }

            // No free slot: split.
            debug!(key = %zbr.key, level, "splitting znode");
            if self.zn(znode).alt {
                // This znode may no longer be findable by key.
                self.ins_clr_old_idx_znode(znode);
            }

            if level == 0 && n == fanout && matches!(zbr.key.kind(), Ok(KeyType::Data)) {
                // A data block sequentially extending the last entry of a
                // full leaf: keep the whole run in the left node, nothing
                // can ever be inserted between consecutive blocks anyway.
                let prev = &self.zn(znode).branches[n - 1];
                if matches!(prev.key.kind(), Ok(KeyType::Data))
                    && prev.key.ino() == zbr.key.ino()
                    && prev.key.block() + 1 == zbr.key.block()
                {
                    appending = true;
                }
            }

            let (mut keep, mut moved) = if appending {
                (fanout, 0)
            } else {
                let keep = fanout.div_ceil(2);
                (keep, fanout - keep)
            };

            let sibling = self.arena.alloc(Znode {
                parent,
                iip: 0,
                level,
                state: ZnodeState::Dirty,
                obsolete: false,
                alt: false,
                time: self.tick,
                branches: Vec::new(),
            });
            self.metrics.dirty_znodes += 1;

            let insert_left = n < keep;
            if insert_left {
                moved += 1;
                keep -= 1;
            } else {
                n -= keep;
            }

            let tail = self.zn_mut(znode).branches.split_off(keep);
            debug_assert_eq!(tail.len(), moved);
            let reparent: Vec<(ZnodeId, usize)> = tail
                .iter()
                .enumerate()
                .filter_map(|(i, b)| b.child.map(|c| (c, i)))
                .collect();
            self.zn_mut(sibling).branches = tail;
            for (child, iip) in reparent {
                let child = self.zn_mut(child);
                child.parent = Some(sibling);
                child.iip = iip;
            }
            trace!(moving = moved, keeping = keep, "split point");

            let target = if insert_left { znode } else { sibling };
            self.insert_zbranch(target, zbr, n);

            if let Some(parent) = parent {
                let inserted_at = n;
                n = self.zn(znode).iip + 1;
                if appending && n != fanout {
                    appending = false;
                }
                if inserted_at == 0 && insert_left && self.zn(znode).iip == 0 {
                    self.correct_parent_keys(znode);
                }
                let first_key = self.zn(sibling).branches[0].key;
                zbr = Zbranch::to_child(first_key, sibling);
                znode = parent;
                continue;
            }

            // The root itself split: synthesize a new root with the two
            // halves and grow the tree by one level.
            debug!(level = level + 1, "creating new root");
            let mut new_root = Znode::new(level + 1, ZnodeState::Dirty);
            new_root.time = self.tick;
            new_root.branches = vec![
                Zbranch {
                    key: self.zn(znode).branches[0].key,
                    loc: self.root_loc,
                    child: Some(znode),
                    leaf: None,
                },
                Zbranch {
                    key: self.zn(sibling).branches[0].key,
                    loc: None,
                    child: Some(sibling),
                    leaf: None,
                },
            ];
            let new_root = self.arena.alloc(new_root);
            self.metrics.dirty_znodes += 1;

            self.zn_mut(znode).parent = Some(new_root);
            self.zn_mut(znode).iip = 0;
            self.zn_mut(sibling).parent = Some(new_root);
            self.zn_mut(sibling).iip = 1;
            self.root = Some(new_root);
            self.root_loc = None;
            return Ok(());
        }
    }

    // ── Delete ──────────────────────────────────────────────────────────

    /// Free `id` or, if an in-flight commit still references it, mark it
    /// obsolete and retire it until the commit epoch ends.
    fn free_or_retire(&mut self, id: ZnodeId) {
        debug_assert!(!self.zn(id).obsolete);
        debug_assert!(self.zn(id).is_dirty());
        self.metrics.dirty_znodes -= 1;
        if self.zn(id).state == ZnodeState::CowPending {
            self.zn_mut(id).obsolete = true;
            self.metrics.clean_znodes += 1;
            self.retired.push(id);
        } else {
            self.arena.free(id);
        }
    }

    /// Delete the leaf branch at `(id, n)` and shrink the tree upward if
    /// znodes empty out. No sibling rebalancing: merging under-full
    /// znodes is deferred to the next commit.
    pub(crate) fn tnc_delete(&mut self, id: ZnodeId, n: usize) -> Result<()> {
        debug_assert_eq!(self.zn(id).level, 0);
        trace!(key = %self.zn(id).branches[n].key, "deleting branch");

        let loc = self.zn(id).branches[n].loc;
        self.zn_mut(id).branches[n].leaf = None;
        if let Some(loc) = loc {
            self.lprops.add_dirt(loc.leb, loc.len)?;
        }
        self.zn_mut(id).branches.remove(n);
        if !self.zn(id).branches.is_empty() {
            return Ok(());
        }

        // The leaf emptied out: remove it from its parent, and keep
        // removing ancestors while they empty out too.
        let mut znode = id;
        let slot;
        loop {
            let Some(parent) = self.zn(znode).parent else {
                // The root itself became an empty leaf; that is the
                // empty-tree state. Interior roots never reach here:
                // height collapse keeps them at two or more children.
                debug_assert_eq!(self.zn(znode).level, 0);
                return Ok(());
            };
            let iip = self.zn(znode).iip;
            self.insert_old_idx_znode(znode);
            self.free_or_retire(znode);
            znode = parent;
            if self.zn(znode).branches.len() != 1 {
                slot = iip;
                break;
            }
        }

        debug_assert_ne!(self.zn(znode).level, 0);
        self.zn_mut(znode).branches.remove(slot);
        let updates: Vec<(ZnodeId, usize)> = self
            .zn(znode)
            .branches
            .iter()
            .enumerate()
            .skip(slot)
            .filter_map(|(i, b)| b.child.map(|c| (c, i)))
            .collect();
        for (child, iip) in updates {
            self.zn_mut(child).iip = iip;
        }

        // If the root is down to a single child above the leaf level,
        // collapse the tree height.
        if self.zn(znode).parent.is_none() {
            while self.zn(znode).branches.len() == 1 && self.zn(znode).level != 0 {
                let old_root = znode;
                let child = self.get_child(znode, 0)?;
                let child = self.dirty_cow(child)?;
                let child_loc = self.zn(old_root).branches[0].loc;

                self.zn_mut(child).parent = None;
                self.zn_mut(child).iip = 0;
                if let Some(root_loc) = self.root_loc {
                    self.insert_old_idx(root_loc.leb, root_loc.offs);
                }
                self.root_loc = child_loc;
                self.root = Some(child);
                self.free_or_retire(old_root);
                znode = child;
            }
        }
        Ok(())
    }

    /// Remove every entry with a key in `[from, to]`, one leaf run at a
    /// time.
    pub(crate) fn remove_range(&mut self, from: &Key, to: &Key) -> Result<()> {
        loop {
            let (found, mut znode, mut n) = self.lookup_level0(from)?;
            if !found {
                let Some((z, nn)) = self.tnc_next(znode, n)? else {
                    return Ok(());
                };
                let key = self.zn(z).branches[nn].key;
                if key < *from || key > *to {
                    return Ok(());
                }
                znode = z;
                n = nn as isize;
            }

            if self.zn(znode).state != ZnodeState::Dirty {
                znode = self.dirty_cow_bottom_up(znode)?;
            }
            let n = n as usize;

            // Remove every in-range key after the first in this leaf,
            // then delete the first through the shrinking path.
            let mut removed = 0;
            let mut i = n + 1;
            while i < self.zn(znode).branches.len() {
                let key = self.zn(znode).branches[i].key;
                if key < *from || key > *to {
                    break;
                }
                let loc = self.zn(znode).branches[i].loc;
                if let Some(loc) = loc {
                    self.lprops.add_dirt(loc.leb, loc.len)?;
                }
                trace!(%key, "removing branch in range");
                i += 1;
                removed += 1;
            }
            if removed > 0 {
                self.zn_mut(znode).branches.drain(n + 1..n + 1 + removed);
            }
            self.tnc_delete(znode, n)?;
        }
    }

    // ── Finding index nodes by address ──────────────────────────────────

    /// The znode at the same level as `id`, immediately to its left.
    fn left_znode(&mut self, id: ZnodeId) -> Result<Option<ZnodeId>> {
        let level = self.zn(id).level;
        let mut znode = id;
        loop {
            let Some(parent) = self.zn(znode).parent else {
                return Ok(None);
            };
            let iip = self.zn(znode).iip;
            znode = parent;
            if iip > 0 {
                let mut z = self.get_child(znode, iip - 1)?;
                while self.zn(z).level != level {
                    let last = self.zn(z).branches.len() - 1;
                    z = self.get_child(z, last)?;
                }
                return Ok(Some(z));
            }
        }
    }

    /// The znode at the same level as `id`, immediately to its right.
    fn right_znode(&mut self, id: ZnodeId) -> Result<Option<ZnodeId>> {
        let level = self.zn(id).level;
        let mut znode = id;
        loop {
            let Some(parent) = self.zn(znode).parent else {
                return Ok(None);
            };
            let slot = self.zn(znode).iip + 1;
            znode = parent;
            if slot < self.zn(znode).branches.len() {
                let mut z = self.get_child(znode, slot)?;
                while self.zn(z).level != level {
                    z = self.get_child(z, 0)?;
                }
                return Ok(Some(z));
            }
        }
    }

    /// Find an indexing node by its first key and on-flash address.
    ///
    /// The node's leftmost key may have drifted since it was written
    /// (key correction), so a miss at the natural descent position also
    /// tries the left neighbor, and hashed first keys are searched to
    /// both sides.
    pub(crate) fn lookup_znode(
        &mut self,
        key: &Key,
        level: u16,
        leb: LebNumber,
        offs: u32,
    ) -> Result<Option<ZnodeId>> {
        let root = self.ensure_root()?;
        if let Some(root_loc) = self.root_loc {
            if root_loc.leb == leb && root_loc.offs == offs {
                return Ok(Some(root));
            }
        }
        if level >= self.zn(root).level {
            return Ok(None);
        }

        let mut znode = root;
        let mut n;
        loop {
            let (_, slot) = self.zn(znode).search_branches(key);
            if slot < 0 {
                // Leftmost key here is above the searched key; the node
                // may still live one neighbor to the left (key drift).
                let Some(left) = self.left_znode(znode)? else {
                    return Ok(None);
                };
                znode = left;
                let (_, slot) = self.zn(znode).search_branches(key);
                if slot < 0 {
                    return Ok(None);
                }
                n = slot as usize;
            } else {
                n = slot as usize;
            }
            if self.zn(znode).level == level + 1 {
                break;
            }
            znode = self.get_child(znode, n)?;
        }

        let matches = |tree: &Self, z: ZnodeId, slot: usize| {
            tree.zn(z).branches[slot]
                .loc
                .is_some_and(|l| l.leb == leb && l.offs == offs)
        };

        if matches(self, znode, n) {
            return Ok(Some(self.get_child(znode, n)?));
        }
        if !key.is_hashed() {
            return Ok(None);
        }

        // Colliding first keys: the node may sit to either side.
        let (zsave, nsave) = (znode, n);
        loop {
            if n > 0 {
                n -= 1;
            } else {
                let Some(left) = self.left_znode(znode)? else {
                    break;
                };
                znode = left;
                n = self.zn(znode).branches.len() - 1;
            }
            if matches(self, znode, n) {
                return Ok(Some(self.get_child(znode, n)?));
            }
            if self.zn(znode).branches[n].key < *key {
                break;
            }
        }
        znode = zsave;
        n = nsave;
        loop {
            n += 1;
            if n >= self.zn(znode).branches.len() {
                let Some(right) = self.right_znode(znode)? else {
                    break;
                };
                znode = right;
                n = 0;
            }
            if matches(self, znode, n) {
                return Ok(Some(self.get_child(znode, n)?));
            }
            if self.zn(znode).branches[n].key > *key {
                break;
            }
        }
        Ok(None)
    }

    /// Whether the index node at `leb:offs` is referenced by the tree,
    /// and if so whether its znode is dirty.
    pub(crate) fn is_idx_node_in_tnc(
        &mut self,
        key: &Key,
        level: u16,
        leb: LebNumber,
        offs: u32,
    ) -> Result<Option<bool>> {
        Ok(self
            .lookup_znode(key, level, leb, offs)?
            .map(|id| self.zn(id).is_dirty()))
    }

    /// Whether the leaf node at `loc` is referenced by the tree.
    pub(crate) fn is_leaf_node_in_tnc(&mut self, key: &Key, loc: &NodeLocation) -> Result<bool> {
        let matches = |tree: &Self, z: ZnodeId, slot: usize| {
            tree.zn(z).branches[slot]
                .loc
                .is_some_and(|l| l.leb == loc.leb && l.offs == loc.offs)
        };

        let (found, znode, n) = self.lookup_level0(key)?;
        if !found {
            return Ok(false);
        }
        let n = n as usize;
        if matches(self, znode, n) {
            return Ok(true);
        }
        if !key.is_hashed() {
            return Ok(false);
        }

        // Colliding keys: scan both sides of the match.
        let (mut z, mut nn) = (znode, n as isize);
        while let Some((pz, pn)) = self.tnc_prev(z, nn)? {
            if self.zn(pz).branches[pn].key != *key {
                break;
            }
            if matches(self, pz, pn) {
                return Ok(true);
            }
            z = pz;
            nn = pn as isize;
        }
        let (mut z, mut nn) = (znode, n as isize);
        while let Some((sz, sn)) = self.tnc_next(z, nn)? {
            if self.zn(sz).branches[sn].key != *key {
                break;
            }
            if matches(self, sz, sn) {
                return Ok(true);
            }
            z = sz;
            nn = sn as isize;
        }
        Ok(false)
    }

    // ── Commit epochs ───────────────────────────────────────────────────

    /// Freeze the current dirty set for an external committer: every
    /// dirty znode becomes commit-referenced, so further mutation
    /// duplicates instead of changing the committer's snapshot.
    pub(crate) fn start_commit(&mut self) {
        debug_assert!(!self.committing);
        self.committing = true;
        let ids: Vec<ZnodeId> = self.arena.ids().collect();
        let mut frozen = 0_usize;
        for id in ids {
            if self.zn(id).state == ZnodeState::Dirty {
                self.zn_mut(id).state = ZnodeState::CowPending;
                frozen += 1;
            }
        }
        debug!(frozen, "commit started");
    }

    /// The commit wrote the frozen set durably: frozen znodes become
    /// clean, retired obsolete znodes are finally freed, and the
    /// old-index set (now superseded by the new on-flash index) is
    /// destroyed.
    pub(crate) fn finish_commit(&mut self) {
        debug_assert!(self.committing);
        let ids: Vec<ZnodeId> = self.arena.ids().collect();
        for id in ids {
            let znode = self.zn(id);
            if znode.state == ZnodeState::CowPending && !znode.obsolete {
                self.zn_mut(id).state = ZnodeState::Clean;
                self.metrics.dirty_znodes -= 1;
                self.metrics.clean_znodes += 1;
            }
        }
        for id in std::mem::take(&mut self.retired) {
            self.arena.free(id);
            self.metrics.clean_znodes -= 1;
        }
        self.old_idx.clear();
        self.committing = false;
        debug!("commit finished");
    }

    /// The commit failed: thaw the frozen set back to dirty and drop the
    /// half-commit's obsolete znodes. The old-index set survives, since
    /// the on-flash old index is still the recovery baseline.
    pub(crate) fn abort_commit(&mut self) {
        debug_assert!(self.committing);
        let ids: Vec<ZnodeId> = self.arena.ids().collect();
        for id in ids {
            let znode = self.zn(id);
            if znode.state == ZnodeState::CowPending && !znode.obsolete {
                self.zn_mut(id).state = ZnodeState::Dirty;
            }
        }
        for id in std::mem::take(&mut self.retired) {
            self.arena.free(id);
            self.metrics.clean_znodes -= 1;
        }
        self.committing = false;
        debug!("commit aborted");
    }
}
