#![forbid(unsafe_code)]
//! The Tree Node Cache (TNC): EmberFS's in-memory, copy-on-write B+tree
//! index.
//!
//! The TNC maps file-system keys to the physical location of their nodes
//! on flash. It is populated lazily from the committed on-flash index and
//! mutated in memory; a periodic commit (owned by the journal subsystem,
//! not this crate) writes the dirty subset back out. Between commits the
//! old on-flash index must survive intact for crash recovery, which is
//! what the old-index set and the copy-on-write discipline here preserve.
//!
//! Locking: one exclusive mutex around the whole tree. Traversals that
//! need to read an uncached index node from flash block every other TNC
//! operation while they do — a deliberate simplicity trade-off. The one
//! concession: a point lookup of a non-hashed key copies the found
//! location out and releases the lock before reading the leaf, since the
//! location is stable once found. Hashed-key lookups keep the lock
//! through leaf-cache population, because collision resolution needs a
//! second pass over the same branches.

use ember_error::{EmberError, Result};
use ember_ondisk::{node_key, EntryNode};
use ember_store::{LpropsTable, NodeStore};
use ember_types::{InodeNumber, Key, LebNumber, NodeLocation, Sqnum};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

mod lnc;
mod tree;
mod znode;

use lnc::leaf_node_type;
use tree::Tree;
use znode::{Zbranch, ZnodeState};

/// Dirty/clean znode counts, updated on every state transition and read
/// by an external memory-pressure reclaimer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TncMetrics {
    pub dirty_znodes: usize,
    pub clean_znodes: usize,
}

/// The Tree Node Cache.
pub struct Tnc {
    store: NodeStore,
    inner: Mutex<Tree>,
}

impl Tnc {
    /// A fresh, empty index: a single dirty level-0 znode with no
    /// branches. Used when creating a file system.
    #[must_use]
    pub fn new_empty(store: NodeStore, lprops: Arc<LpropsTable>) -> Self {
        let tree = Tree::new_empty(store.clone(), lprops);
        Self {
            store,
            inner: Mutex::new(tree),
        }
    }

    /// Open the committed index rooted at `root_loc`. The root znode is
    /// loaded lazily on first use. `index_size` seeds the committed
    /// index size estimate.
    #[must_use]
    pub fn open(
        store: NodeStore,
        lprops: Arc<LpropsTable>,
        root_loc: NodeLocation,
        index_size: u64,
    ) -> Self {
        let tree = Tree::open(store.clone(), lprops, root_loc, index_size);
        Self {
            store,
            inner: Mutex::new(tree),
        }
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    /// Look up the node with `key` and return its raw bytes.
    pub fn lookup(&self, key: &Key) -> Result<Vec<u8>> {
        self.locate(key).map(|(bytes, _)| bytes)
    }

    /// Look up the node with `key` and return its bytes and location.
    pub fn locate(&self, key: &Key) -> Result<(Vec<u8>, NodeLocation)> {
        let mut tree = self.inner.lock();
        let (found, znode, n) = tree.lookup_level0(key)?;
        if !found {
            return Err(EmberError::NotFound);
        }
        let n = n as usize;

        if key.is_hashed() {
            // Leaf cache involved: hold the lock through the read.
            let loc = tree.zn(znode).branches[n].loc.ok_or_else(|| {
                EmberError::Format("leaf branch has no on-flash location".into())
            })?;
            let bytes = tree.read_leaf_bytes(znode, n)?;
            return Ok((bytes, loc));
        }

        // Non-hashed keys: the location is stable once found, so read
        // the leaf without blocking other TNC users.
        let loc = tree.zn(znode).branches[n].loc.ok_or_else(|| {
            EmberError::Format("leaf branch has no on-flash location".into())
        })?;
        drop(tree);

        let kind = leaf_node_type(key)?;
        let bytes = self.store.read_node(kind, &loc)?;
        let found_key =
            node_key(&bytes).map_err(|err| EmberError::Corruption {
                leb: loc.leb.0,
                offset: loc.offs,
                detail: err.to_string(),
            })?;
        if found_key != *key {
            return Err(EmberError::Corruption {
                leb: loc.leb.0,
                offset: loc.offs,
                detail: format!("node key {found_key} does not match looked-up key {key}"),
            });
        }
        Ok((bytes, loc))
    }

    /// Look up a hashed-key entry by `(key, name)`, resolving hash
    /// collisions by name.
    pub fn lookup_nm(&self, key: &Key, name: &[u8]) -> Result<EntryNode> {
        let mut tree = self.inner.lock();
        let (found, znode, n) = tree.lookup_level0(key)?;
        if !found {
            return Err(EmberError::NotFound);
        }
        let n = n as usize;

        // Most lookups have no collision: check the found entry first.
        let entry = tree.read_entry(znode, n)?;
        if entry.name == name {
            return Ok(entry);
        }
        let (found, z, nn) = tree.resolve_collision(key, znode, n, name)?;
        if !found {
            return Err(EmberError::NotFound);
        }
        tree.read_entry(z, nn as usize)
    }

    /// The next directory or attribute entry after `(key, name)` in hash
    /// order, skipping deletion markers. Seed the iteration with the
    /// lowest entry key of the parent and `name = None`.
    pub fn next_entry(&self, key: &Key, name: Option<&[u8]>) -> Result<EntryNode> {
        let kind = key
            .kind()
            .map_err(|err| EmberError::Format(err.to_string()))?;
        if !kind.is_hashed() {
            return Err(EmberError::Format(
                "entry traversal needs an entry-class key".into(),
            ));
        }

        let mut tree = self.inner.lock();
        let (found, mut znode, mut n) = tree.lookup_level0(key)?;
        if found {
            if let Some(name) = name {
                let (_, z, nn) = tree.resolve_collision(key, znode, n as usize, name)?;
                znode = z;
                n = nn;
            }
        }
        loop {
            let Some((z, nn)) = tree.tnc_next(znode, n)? else {
                return Err(EmberError::NotFound);
            };
            znode = z;
            n = nn as isize;
            let dkey = tree.zn(z).branches[nn].key;
            if dkey.ino() != key.ino() || dkey.kind().ok() != Some(kind) {
                return Err(EmberError::NotFound);
            }
            let entry = tree.read_entry(z, nn)?;
            if entry.is_deletion() {
                continue;
            }
            return Ok(entry);
        }
    }

    /// Whether a node with `key` at `loc` is referenced by the tree.
    /// `level` is `Some` for index nodes (with `key` the node's first
    /// key); an index node counts only while its znode is clean or
    /// unloaded.
    pub fn has_node(&self, key: &Key, level: Option<u16>, loc: NodeLocation) -> Result<bool> {
        let mut tree = self.inner.lock();
        match level {
            Some(level) => Ok(matches!(
                tree.is_idx_node_in_tnc(key, level, loc.leb, loc.offs)?,
                Some(false)
            )),
            None => tree.is_leaf_node_in_tnc(key, &loc),
        }
    }

    // ── Mutations ───────────────────────────────────────────────────────

    /// Add `key -> loc`, replacing any existing branch for the key. The
    /// replaced node's bytes become dirty space.
    pub fn add(&self, key: &Key, loc: NodeLocation) -> Result<()> {
        let mut tree = self.inner.lock();
        debug!(%key, %loc, "tnc add");
        let (found, znode, n) = tree.lookup_level0_dirty(key)?;
        if found {
            let n = n as usize;
            let old = tree.zn(znode).branches[n].loc;
            tree.zn_mut(znode).branches[n].leaf = None;
            if let Some(old) = old {
                tree.lprops.add_dirt(old.leb, old.len)?;
                // The vacated location must survive until the next
                // commit; record it so the committer never reuses it.
                tree.insert_old_idx(old.leb, old.offs);
            }
            tree.zn_mut(znode).branches[n].loc = Some(loc);
            Ok(())
        } else {
            tree.tnc_insert(znode, Zbranch::leaf_at(*key, loc), (n + 1) as usize)
        }
    }

    /// Replace `key`'s branch with `new` only if it still points at
    /// `(old_leb, old_offs)`; used by the garbage collector when moving
    /// nodes. Returns whether the branch was replaced; if not, the moved
    /// copy at `new` is accounted as dirt instead.
    pub fn replace(
        &self,
        key: &Key,
        old_leb: LebNumber,
        old_offs: u32,
        new: NodeLocation,
    ) -> Result<bool> {
        let mut tree = self.inner.lock();
        debug!(%key, old_leb = old_leb.0, old_offs, %new, "tnc replace");
        let (found, znode, n) = tree.lookup_level0_dirty(key)?;
        let mut replaced = false;
        if found {
            let n = n as usize;
            let cur = tree.zn(znode).branches[n].loc;
            if let Some(old) = cur.filter(|l| l.leb == old_leb && l.offs == old_offs) {
                tree.zn_mut(znode).branches[n].leaf = None;
                tree.lprops.add_dirt(old.leb, old.len)?;
                tree.insert_old_idx(old.leb, old.offs);
                tree.zn_mut(znode).branches[n].loc = Some(new);
                replaced = true;
            } else if key.is_hashed() {
                let (f, z, nn) = tree.resolve_collision_directly(key, znode, n, old_leb, old_offs)?;
                if f {
                    let z = if tree.zn(z).state != ZnodeState::Dirty {
                        tree.dirty_cow_bottom_up(z)?
                    } else {
                        z
                    };
                    let nn = nn as usize;
                    let old = tree.zn(z).branches[nn].loc;
                    tree.zn_mut(z).branches[nn].leaf = None;
                    if let Some(old) = old {
                        tree.lprops.add_dirt(old.leb, old.len)?;
                        tree.insert_old_idx(old.leb, old.offs);
                    }
                    tree.zn_mut(z).branches[nn].loc = Some(new);
                    replaced = true;
                }
            }
        }
        if !replaced {
            // The relocated copy is not referenced by the index: it is
            // dead bytes wherever the GC put it.
            tree.lprops.add_dirt(new.leb, new.len)?;
        }
        Ok(replaced)
    }

    /// Add a hashed-key entry, resolving collisions by `name`. During
    /// replay, dangling branches are tolerated and may be retargeted.
    pub fn add_nm(&self, key: &Key, loc: NodeLocation, name: &[u8]) -> Result<()> {
        let mut tree = self.inner.lock();
        debug!(%key, %loc, name = %String::from_utf8_lossy(name), "tnc add_nm");
        let (mut found, mut znode, mut n) = tree.lookup_level0_dirty(key)?;
        if found {
            let (f, z, nn) = if tree.replaying {
                tree.fallible_resolve_collision(key, znode, n as usize, name)?
            } else {
                tree.resolve_collision(key, znode, n as usize, name)?
            };
            found = f;
            znode = z;
            n = nn;

            // Collision resolution may have walked into a znode off the
            // dirtied descent path.
            if tree.zn(znode).state != ZnodeState::Dirty {
                znode = tree.dirty_cow_bottom_up(znode)?;
            }

            if found {
                let n = n as usize;
                let old = tree.zn(znode).branches[n].loc;
                tree.zn_mut(znode).branches[n].leaf = None;
                if let Some(old) = old {
                    tree.lprops.add_dirt(old.leb, old.len)?;
                    tree.insert_old_idx(old.leb, old.offs);
                }
                tree.zn_mut(znode).branches[n].loc = Some(loc);
                return Ok(());
            }
        }
        tree.tnc_insert(znode, Zbranch::leaf_at(*key, loc), (n + 1) as usize)
    }

    /// Remove `key`'s branch. Removing an absent key is a no-op.
    pub fn remove(&self, key: &Key) -> Result<()> {
        let mut tree = self.inner.lock();
        debug!(%key, "tnc remove");
        let (found, znode, n) = tree.lookup_level0_dirty(key)?;
        if found {
            tree.tnc_delete(znode, n as usize)?;
        }
        Ok(())
    }

    /// Remove the hashed-key entry `(key, name)`. During replay, a
    /// dangling branch with the same key counts as the target.
    pub fn remove_nm(&self, key: &Key, name: &[u8]) -> Result<()> {
        let mut tree = self.inner.lock();
        debug!(%key, name = %String::from_utf8_lossy(name), "tnc remove_nm");
        let (found, znode, n) = tree.lookup_level0_dirty(key)?;
        if found {
            let (f, z, nn) = if tree.replaying {
                tree.fallible_resolve_collision(key, znode, n as usize, name)?
            } else {
                tree.resolve_collision(key, znode, n as usize, name)?
            };
            if f {
                let z = if tree.zn(z).state != ZnodeState::Dirty {
                    tree.dirty_cow_bottom_up(z)?
                } else {
                    z
                };
                tree.tnc_delete(z, nn as usize)?;
            }
        }
        Ok(())
    }

    /// Remove every entry with a key in `[from, to]`.
    pub fn remove_range(&self, from: &Key, to: &Key) -> Result<()> {
        let mut tree = self.inner.lock();
        debug!(%from, %to, "tnc remove_range");
        tree.remove_range(from, to)
    }

    /// Remove an inode and everything belonging to it: attribute entries
    /// cascade first, each dragging its attribute inode's subtree along.
    pub fn remove_ino(&self, ino: InodeNumber) -> Result<()> {
        debug!(%ino, "tnc remove_ino");
        let mut key = Key::lowest_xattr(ino);
        let mut last_name: Option<Vec<u8>> = None;
        loop {
            let xent = match self.next_entry(&key, last_name.as_deref()) {
                Ok(xent) => xent,
                Err(EmberError::NotFound) => break,
                Err(err) => return Err(err),
            };
            let xattr_ino = InodeNumber(xent.inum);
            self.remove_nm(&xent.key, &xent.name)?;
            self.remove_range(&Key::lowest(xattr_ino), &Key::highest(xattr_ino))?;
            key = xent.key;
            last_name = Some(xent.name);
        }
        self.remove_range(&Key::lowest(ino), &Key::highest(ino))
    }

    /// Load and dirty the index node at `(leb, offs)` so the garbage
    /// collector can reclaim its LEB: a dirty znode will be written to a
    /// new location by the next commit. `key` is the node's first key.
    pub fn dirty_idx_node(&self, key: &Key, level: u16, leb: LebNumber, offs: u32) -> Result<()> {
        let mut tree = self.inner.lock();
        if let Some(znode) = tree.lookup_znode(key, level, leb, offs)? {
            tree.dirty_cow_bottom_up(znode)?;
        }
        Ok(())
    }

    // ── Commit epochs ───────────────────────────────────────────────────

    /// Freeze the dirty set for an external committer; mutations from
    /// now on copy-on-write instead of touching the frozen snapshot.
    pub fn start_commit(&self) {
        self.inner.lock().start_commit();
    }

    /// The commit is durable: clean the frozen set, reclaim retired
    /// znodes, and destroy the old-index set it superseded.
    pub fn finish_commit(&self) {
        self.inner.lock().finish_commit();
    }

    /// The commit failed: thaw the frozen set back to dirty. The
    /// old-index set survives, since the on-flash old index is still the
    /// recovery baseline.
    pub fn abort_commit(&self) {
        self.inner.lock().abort_commit();
    }

    // ── Replay hooks ────────────────────────────────────────────────────

    /// Enter replay mode: hashed-key resolution tolerates dangling
    /// branches. Only used at mount, before the tree is shared.
    pub fn begin_replay(&self) {
        self.inner.lock().replaying = true;
    }

    /// Sequence number of the mutation being replayed; nodes stamped
    /// newer cannot be in the index yet.
    pub fn set_replay_watermark(&self, sqnum: Sqnum) {
        self.inner.lock().replay_sqnum = sqnum.0;
    }

    /// Leave replay mode.
    pub fn end_replay(&self) {
        let mut tree = self.inner.lock();
        tree.replaying = false;
        tree.replay_sqnum = 0;
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Current dirty/clean znode counts.
    #[must_use]
    pub fn metrics(&self) -> TncMetrics {
        self.inner.lock().metrics
    }

    /// Whether `(leb, offs)` is recorded as an old-index location.
    #[must_use]
    pub fn old_index_contains(&self, leb: LebNumber, offs: u32) -> bool {
        self.inner.lock().old_idx.contains(&(leb.0, offs))
    }

    /// Number of old-index locations currently recorded.
    #[must_use]
    pub fn old_index_len(&self) -> usize {
        self.inner.lock().old_idx.len()
    }

    /// Estimated on-flash size of the index if committed now.
    #[must_use]
    pub fn index_size(&self) -> u64 {
        self.inner.lock().calc_idx_sz
    }

    /// Every leaf key in index order, loading znodes as needed. An
    /// integrity and test helper; the ordering invariant of every znode
    /// holds iff this is sorted.
    pub fn leaf_keys(&self) -> Result<Vec<Key>> {
        let mut tree = self.inner.lock();
        let mut keys = Vec::new();
        let root = tree.ensure_root()?;
        let mut znode = root;
        while tree.zn(znode).level != 0 {
            znode = tree.get_child(znode, 0)?;
        }
        if tree.zn(znode).branches.is_empty() {
            return Ok(keys);
        }
        keys.push(tree.zn(znode).branches[0].key);
        let mut n = 0_usize;
        loop {
            let Some((z, nn)) = tree.tnc_next(znode, n as isize)? else {
                break;
            };
            znode = z;
            n = nn;
            keys.push(tree.zn(z).branches[nn].key);
        }
        Ok(keys)
    }

    /// Drop the whole cache. Everything dirty is lost; only meaningful
    /// at unmount after a successful commit, or when giving up on a
    /// mount.
    pub fn close(self) {}
}
