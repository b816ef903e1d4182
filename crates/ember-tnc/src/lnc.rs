//! Leaf reads, the leaf-node cache, and hashed-key collision resolution.
//!
//! Entry keys order by a hash of the name, so distinct names can collide
//! on one key and every "did we find it?" question needs a second, name-
//! based pass over the colliding run. The leaf-node cache keeps the
//! decoded directory-entry payload on its zbranch so that run can be
//! walked without re-reading flash for every comparison.
//!
//! The `fallible_*` variants exist for replay: a branch may legitimately
//! refer to a node that the garbage collector already reclaimed before
//! the crash ("dangling"), and a replayed deletion must be able to target
//! such an entry. Dangling is a distinct outcome, never an error.

use crate::tree::Tree;
use crate::znode::ZnodeId;
use ember_error::{EmberError, Result};
use ember_ondisk::{node_key, EntryNode, NodeHeader, NodeType};
use ember_store::TryRead;
use ember_types::{Key, KeyType, LebNumber};
use tracing::debug;

/// Three-way outcome of comparing a stored entry's name with a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameMatch {
    Less,
    Matches,
    Greater,
}

/// Node type holding the leaf payload of `key`.
pub(crate) fn leaf_node_type(key: &Key) -> Result<NodeType> {
    let kind = key
        .kind()
        .map_err(|err| EmberError::Format(err.to_string()))?;
    match kind {
        KeyType::Inode => Ok(NodeType::Inode),
        KeyType::Data => Ok(NodeType::Data),
        KeyType::Entry | KeyType::Xattr => Ok(NodeType::Entry),
        KeyType::Trunc => Err(EmberError::Format(
            "truncation keys have no leaf node".into(),
        )),
    }
}

impl Tree {
    /// Read the leaf node behind `(id, n)`, verifying that the node on
    /// flash actually carries the branch's key. Directory entries are
    /// decoded into the leaf cache on the way through.
    pub(crate) fn read_leaf_bytes(&mut self, id: ZnodeId, n: usize) -> Result<Vec<u8>> {
        let key = self.zn(id).branches[n].key;
        let Some(loc) = self.zn(id).branches[n].loc else {
            return Err(EmberError::Format(
                "leaf branch has no on-flash location".into(),
            ));
        };
        let kind = leaf_node_type(&key)?;
        let bytes = self.store.read_node(kind, &loc)?;
        let node_key = node_key(&bytes).map_err(|err| Self::corrupt(&loc, err.to_string()))?;
        if node_key != key {
            return Err(Self::corrupt(
                &loc,
                format!("node key {node_key} does not match branch key {key}"),
            ));
        }
        if matches!(key.kind(), Ok(KeyType::Entry)) && self.zn(id).branches[n].leaf.is_none() {
            // Only directory entries are cached; they are what readdir
            // and collision resolution keep coming back for.
            let entry =
                EntryNode::parse(&bytes).map_err(|err| Self::corrupt(&loc, err.to_string()))?;
            self.zn_mut(id).branches[n].leaf = Some(entry);
        }
        Ok(bytes)
    }

    /// Decoded entry node behind `(id, n)`, from the leaf cache when
    /// possible.
    pub(crate) fn read_entry(&mut self, id: ZnodeId, n: usize) -> Result<EntryNode> {
        if let Some(leaf) = &self.zn(id).branches[n].leaf {
            return Ok(leaf.clone());
        }
        let bytes = self.read_leaf_bytes(id, n)?;
        if let Some(leaf) = &self.zn(id).branches[n].leaf {
            // read_leaf_bytes populated the cache (directory entry).
            return Ok(leaf.clone());
        }
        // Extended attribute entries are decoded but never cached.
        let loc = self.zn(id).branches[n].loc;
        EntryNode::parse(&bytes).map_err(|err| match loc {
            Some(loc) => Self::corrupt(&loc, err.to_string()),
            None => EmberError::Format(err.to_string()),
        })
    }

    /// Like `read_entry`, but tolerating a branch whose node is gone from
    /// the media. `None` means dangling, not failure.
    pub(crate) fn fallible_read_entry(&mut self, id: ZnodeId, n: usize) -> Result<Option<EntryNode>> {
        if let Some(leaf) = &self.zn(id).branches[n].leaf {
            return Ok(Some(leaf.clone()));
        }
        let key = self.zn(id).branches[n].key;
        let Some(loc) = self.zn(id).branches[n].loc else {
            return Ok(None);
        };
        match self.store.try_read_node(NodeType::Entry, &loc)? {
            TryRead::Absent => {
                debug!(leb = loc.leb.0, offs = loc.offs, %key, "dangling branch");
                Ok(None)
            }
            TryRead::Present(bytes) => {
                let node_key =
                    node_key(&bytes).map_err(|err| Self::corrupt(&loc, err.to_string()))?;
                if node_key != key {
                    // Some other node lives at this address now.
                    debug!(leb = loc.leb.0, offs = loc.offs, %key, "dangling branch (key mismatch)");
                    return Ok(None);
                }
                let header =
                    NodeHeader::parse(&bytes).map_err(|err| Self::corrupt(&loc, err.to_string()))?;
                if header.sqnum.0 > self.replay_sqnum {
                    // Newer than the mutation being replayed, so it
                    // cannot be in the index yet: the branch is dangling
                    // and this address was merely reused.
                    debug!(leb = loc.leb.0, offs = loc.offs, %key, "dangling branch (newer node)");
                    return Ok(None);
                }
                let entry =
                    EntryNode::parse(&bytes).map_err(|err| Self::corrupt(&loc, err.to_string()))?;
                if matches!(key.kind(), Ok(KeyType::Entry)) {
                    self.zn_mut(id).branches[n].leaf = Some(entry.clone());
                }
                Ok(Some(entry))
            }
        }
    }

    fn cmp_names(entry: &EntryNode, name: &[u8]) -> NameMatch {
        match entry.name.as_slice().cmp(name) {
            std::cmp::Ordering::Less => NameMatch::Less,
            std::cmp::Ordering::Equal => NameMatch::Matches,
            std::cmp::Ordering::Greater => NameMatch::Greater,
        }
    }

    /// Compare the entry behind `(id, n)` against `name`.
    pub(crate) fn matches_name(&mut self, id: ZnodeId, n: usize, name: &[u8]) -> Result<NameMatch> {
        let entry = self.read_entry(id, n)?;
        Ok(Self::cmp_names(&entry, name))
    }

    /// Compare against `name`, with `None` for a dangling branch.
    pub(crate) fn fallible_matches_name(
        &mut self,
        id: ZnodeId,
        n: usize,
        name: &[u8],
    ) -> Result<Option<NameMatch>> {
        Ok(self
            .fallible_read_entry(id, n)?
            .map(|entry| Self::cmp_names(&entry, name)))
    }

    /// Find the entry named `name` among the run of branches colliding on
    /// `key`, starting from the approximate match at `(id, n)`.
    ///
    /// Returns `(true, znode, slot)` at the match, or `(false, znode,
    /// slot)` positioned at the entry `name` would follow (`slot == -1`
    /// if it would precede the leftmost entry).
    pub(crate) fn resolve_collision(
        &mut self,
        key: &Key,
        id: ZnodeId,
        n: usize,
        name: &[u8],
    ) -> Result<(bool, ZnodeId, isize)> {
        match self.matches_name(id, n, name)? {
            NameMatch::Matches => Ok((true, id, n as isize)),
            NameMatch::Greater => {
                // The target sorts below this entry: walk left.
                let (mut z, mut nn) = (id, n as isize);
                loop {
                    let Some((pz, pn)) = self.tnc_prev(z, nn)? else {
                        debug_assert_eq!(nn, 0);
                        return Ok((false, z, -1));
                    };
                    z = pz;
                    nn = pn as isize;
                    if self.zn(pz).branches[pn].key != *key {
                        return Ok((false, z, nn));
                    }
                    match self.matches_name(pz, pn, name)? {
                        NameMatch::Less => return Ok((false, z, nn)),
                        NameMatch::Matches => return Ok((true, z, nn)),
                        NameMatch::Greater => {}
                    }
                }
            }
            NameMatch::Less => {
                // The target sorts above this entry: walk right.
                let (mut best_z, mut best_n) = (id, n as isize);
                let (mut z, mut nn) = (id, n as isize);
                loop {
                    let Some((sz, sn)) = self.tnc_next(z, nn)? else {
                        return Ok((false, best_z, best_n));
                    };
                    z = sz;
                    nn = sn as isize;
                    if self.zn(sz).branches[sn].key != *key {
                        return Ok((false, best_z, best_n));
                    }
                    match self.matches_name(sz, sn, name)? {
                        NameMatch::Greater => return Ok((false, best_z, best_n)),
                        NameMatch::Matches => return Ok((true, sz, nn)),
                        NameMatch::Less => {
                            best_z = sz;
                            best_n = nn;
                        }
                    }
                }
            }
        }
    }

    /// Replay-tolerant collision resolution.
    ///
    /// Dangling branches encountered while walking are remembered; if no
    /// exact name match exists, the last dangling entry is returned as a
    /// best-effort match, because a replayed deletion may legitimately
    /// target a node the garbage collector already reclaimed.
    pub(crate) fn fallible_resolve_collision(
        &mut self,
        key: &Key,
        id: ZnodeId,
        n: usize,
        name: &[u8],
    ) -> Result<(bool, ZnodeId, isize)> {
        let mut dangling: Option<(ZnodeId, usize)> = None;
        let mut unsure = false;

        let first = self.fallible_matches_name(id, n, name)?;
        match first {
            Some(NameMatch::Matches) => return Ok((true, id, n as isize)),
            None => {
                // A dangling branch straight away: no way to tell which
                // side the target is on, so try both, left first.
                dangling = Some((id, n));
                unsure = true;
                debug!(%key, "first dangling match");
            }
            _ => {}
        }

        let (mut res_z, mut res_n) = (id, n as isize);
        if matches!(first, Some(NameMatch::Greater)) || unsure {
            let (mut z, mut nn) = (id, n as isize);
            loop {
                let Some((pz, pn)) = self.tnc_prev(z, nn)? else {
                    res_z = z;
                    res_n = -1;
                    break;
                };
                z = pz;
                nn = pn as isize;
                if self.zn(pz).branches[pn].key != *key {
                    res_z = z;
                    res_n = nn;
                    break;
                }
                match self.fallible_matches_name(pz, pn, name)? {
                    Some(NameMatch::Less) => {
                        res_z = z;
                        res_n = nn;
                        break;
                    }
                    Some(NameMatch::Matches) => return Ok((true, pz, pn as isize)),
                    None => dangling = Some((pz, pn)),
                    Some(NameMatch::Greater) => unsure = false,
                }
            }
        }

        if matches!(first, Some(NameMatch::Less)) || unsure {
            let (mut z, mut nn) = (id, n as isize);
            res_z = id;
            res_n = n as isize;
            loop {
                let Some((sz, sn)) = self.tnc_next(z, nn)? else {
                    break;
                };
                z = sz;
                nn = sn as isize;
                if self.zn(sz).branches[sn].key != *key {
                    break;
                }
                match self.fallible_matches_name(sz, sn, name)? {
                    Some(NameMatch::Greater) => break,
                    Some(NameMatch::Matches) => return Ok((true, sz, sn as isize)),
                    Some(NameMatch::Less) => {
                        res_z = sz;
                        res_n = nn;
                    }
                    None => {
                        res_z = sz;
                        res_n = nn;
                        dangling = Some((sz, sn));
                    }
                }
            }
        }

        match dangling {
            None => Ok((false, res_z, res_n)),
            Some((dz, dn)) => {
                debug!(%key, "dangling match");
                Ok((true, dz, dn as isize))
            }
        }
    }

    /// Resolve a collision by on-flash position rather than name; used
    /// when relocating a node whose old address is known.
    pub(crate) fn resolve_collision_directly(
        &mut self,
        key: &Key,
        id: ZnodeId,
        n: usize,
        leb: LebNumber,
        offs: u32,
    ) -> Result<(bool, ZnodeId, isize)> {
        let at = |tree: &Self, z: ZnodeId, slot: usize| {
            tree.zn(z).branches[slot]
                .loc
                .is_some_and(|l| l.leb == leb && l.offs == offs)
        };

        if at(self, id, n) {
            return Ok((true, id, n as isize));
        }

        // Look left.
        let (mut z, mut nn) = (id, n as isize);
        loop {
            let Some((pz, pn)) = self.tnc_prev(z, nn)? else {
                break;
            };
            if self.zn(pz).branches[pn].key != *key {
                break;
            }
            z = pz;
            nn = pn as isize;
            if at(self, pz, pn) {
                return Ok((true, pz, pn as isize));
            }
        }

        // Look right.
        let (mut z, mut nn) = (id, n as isize);
        let (mut res_z, mut res_n) = (id, n as isize);
        loop {
            let Some((sz, sn)) = self.tnc_next(z, nn)? else {
                return Ok((false, res_z, res_n));
            };
            z = sz;
            nn = sn as isize;
            if self.zn(sz).branches[sn].key != *key {
                return Ok((false, res_z, res_n));
            }
            res_z = sz;
            res_n = nn;
            if at(self, sz, sn) {
                return Ok((true, sz, sn as isize));
            }
        }
    }
}
