//! Znodes, zbranches, and the arena that owns them.
//!
//! Znodes are held in a slab with stable integer handles rather than
//! linked by pointers: parent/child links are `ZnodeId` fields, and
//! copy-on-write duplication is an arena insert plus a handle rewrite in
//! the parent's branch array. A handle stays valid until the slot is
//! explicitly freed; obsolete znodes referenced by an in-flight commit
//! keep their slot until the commit epoch ends.

use ember_ondisk::EntryNode;
use ember_types::{Key, NodeLocation};

/// Stable handle of a znode in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZnodeId(pub(crate) u32);

/// Lifecycle state of a znode.
///
/// `CowPending` means the znode is referenced by an in-flight commit: it
/// may not be mutated in place, only duplicated. A `CowPending` znode is
/// still dirty in the accounting sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZnodeState {
    Clean,
    Dirty,
    CowPending,
}

/// One slot of a znode: a key plus where its target lives.
///
/// Invariant: at most one of `loc` and `child` is absent. A branch with a
/// location and no child is not loaded yet; a branch with a child and no
/// location was mutated since the last commit; a branch with both is a
/// loaded, still-clean subtree.
#[derive(Debug, Clone)]
pub struct Zbranch {
    pub key: Key,
    pub loc: Option<NodeLocation>,
    pub child: Option<ZnodeId>,
    /// Leaf-node cache: decoded entry payload, directory entries only.
    pub leaf: Option<EntryNode>,
}

impl Zbranch {
    #[must_use]
    pub fn leaf_at(key: Key, loc: NodeLocation) -> Self {
        Self {
            key,
            loc: Some(loc),
            child: None,
            leaf: None,
        }
    }

    #[must_use]
    pub fn to_child(key: Key, child: ZnodeId) -> Self {
        Self {
            key,
            loc: None,
            child: Some(child),
            leaf: None,
        }
    }
}

/// In-memory index node.
#[derive(Debug, Clone)]
pub struct Znode {
    pub parent: Option<ZnodeId>,
    /// Slot of this znode in its parent's branch array.
    pub iip: usize,
    pub level: u16,
    pub state: ZnodeState,
    /// Logically removed but still reachable through an in-flight
    /// commit's snapshot.
    pub obsolete: bool,
    /// A branch was inserted at slot 0 since this znode was loaded, so
    /// its on-flash location may no longer be findable by key; if the
    /// znode splits, the location must go to the old-index set first.
    pub alt: bool,
    /// Last-access tick, for an external memory-pressure reclaimer.
    pub time: u64,
    pub branches: Vec<Zbranch>,
}

impl Znode {
    #[must_use]
    pub fn new(level: u16, state: ZnodeState) -> Self {
        Self {
            parent: None,
            iip: 0,
            level,
            state,
            obsolete: false,
            alt: false,
            time: 0,
            branches: Vec::new(),
        }
    }

    /// Dirty in the accounting sense: `Dirty` or `CowPending`.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        matches!(self.state, ZnodeState::Dirty | ZnodeState::CowPending)
    }

    /// Binary-search the sorted branch array for `key`.
    ///
    /// Returns `(true, slot)` on an exact match (any one of a colliding
    /// run), or `(false, slot)` where `slot` is the greatest branch whose
    /// key is below `key`, `-1` if even the first branch is above it.
    #[must_use]
    pub fn search_branches(&self, key: &Key) -> (bool, isize) {
        match self.branches.binary_search_by(|b| b.key.cmp(key)) {
            Ok(n) => (true, n as isize),
            Err(n) => (false, n as isize - 1),
        }
    }
}

/// Slab of znodes with a free list.
#[derive(Debug, Default)]
pub struct Arena {
    slots: Vec<Option<Znode>>,
    free: Vec<u32>,
}

impl Arena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, znode: Znode) -> ZnodeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(znode);
            ZnodeId(idx)
        } else {
            self.slots.push(Some(znode));
            ZnodeId((self.slots.len() - 1) as u32)
        }
    }

    /// Access a live znode. A stale handle is a logic error, not a
    /// runtime condition.
    #[must_use]
    pub fn get(&self, id: ZnodeId) -> &Znode {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale znode handle")
    }

    #[must_use]
    pub fn get_mut(&mut self, id: ZnodeId) -> &mut Znode {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale znode handle")
    }

    pub fn free(&mut self, id: ZnodeId) {
        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(slot.is_some(), "double free of znode slot");
        *slot = None;
        self.free.push(id.0);
    }

    /// Number of live znodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over live znode handles.
    pub fn ids(&self) -> impl Iterator<Item = ZnodeId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| ZnodeId(i as u32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::InodeNumber;

    #[test]
    fn arena_alloc_free_reuses_slots() {
        let mut arena = Arena::new();
        let a = arena.alloc(Znode::new(0, ZnodeState::Dirty));
        let b = arena.alloc(Znode::new(1, ZnodeState::Clean));
        assert_eq!(arena.len(), 2);
        arena.free(a);
        assert_eq!(arena.len(), 1);
        let c = arena.alloc(Znode::new(2, ZnodeState::Dirty));
        assert_eq!(c, a, "freed slot should be reused");
        assert_eq!(arena.get(b).level, 1);
        assert_eq!(arena.get(c).level, 2);
    }

    #[test]
    fn search_branches_positions() {
        let mut znode = Znode::new(0, ZnodeState::Dirty);
        for block in [2_u32, 4, 6] {
            znode.branches.push(Zbranch::leaf_at(
                Key::data(InodeNumber(1), block),
                ember_types::NodeLocation::new(ember_types::LebNumber(8), 0, 64),
            ));
        }
        let k = |b| Key::data(InodeNumber(1), b);
        assert_eq!(znode.search_branches(&k(4)), (true, 1));
        assert_eq!(znode.search_branches(&k(5)), (false, 1));
        assert_eq!(znode.search_branches(&k(7)), (false, 2));
        assert_eq!(znode.search_branches(&k(1)), (false, -1));
    }

    #[test]
    fn dirty_states() {
        assert!(Znode::new(0, ZnodeState::Dirty).is_dirty());
        assert!(Znode::new(0, ZnodeState::CowPending).is_dirty());
        assert!(!Znode::new(0, ZnodeState::Clean).is_dirty());
    }
}
