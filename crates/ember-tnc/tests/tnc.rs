//! End-to-end TNC tests over an in-memory flash device.
//!
//! Leaf nodes referenced by lookups are really encoded and written to
//! the device, so these tests exercise the store validation path too.

use ember_ondisk::{DataNode, EntryNode, EntryType, IndexBranch, IndexNode, InodeNode};
use ember_store::{Flash, LpropsTable, NodeStore, RamFlash};
use ember_tnc::Tnc;
use ember_types::key::name_hash;
use ember_types::{align8, Geometry, InodeNumber, Key, LebNumber, NodeLocation, Sqnum};
use std::collections::HashMap;
use std::sync::Arc;

const LEB_SIZE: u32 = 64 * 1024;

fn geometry(fanout: usize) -> Geometry {
    Geometry::new(
        LEB_SIZE,
        64,
        8,
        fanout,
        LebNumber(1),
        4,
        LebNumber(8),
        2,
        1 << 40,
    )
    .expect("valid geometry")
}

/// Test media: appends encoded nodes into LEBs and hands out locations.
struct Media {
    store: NodeStore,
    offs: HashMap<u32, u32>,
    sqnum: u64,
}

impl Media {
    fn new(fanout: usize) -> Self {
        let g = geometry(fanout);
        let flash = Arc::new(RamFlash::new(g.leb_cnt(), g.leb_size()));
        Self {
            store: NodeStore::new(flash, g).expect("store"),
            offs: HashMap::new(),
            sqnum: 0,
        }
    }

    fn next_sqnum(&mut self) -> Sqnum {
        self.sqnum += 1;
        Sqnum(self.sqnum)
    }

    fn append(&mut self, leb: LebNumber, bytes: &[u8]) -> NodeLocation {
        let offs = *self.offs.entry(leb.0).or_insert(0);
        self.store
            .flash()
            .write(leb, offs, bytes)
            .expect("flash write");
        self.offs.insert(leb.0, offs + align8(bytes.len() as u32));
        NodeLocation::new(leb, offs, bytes.len() as u32)
    }

    fn data_node(&mut self, leb: LebNumber, ino: u64, block: u32) -> (Key, NodeLocation) {
        let key = Key::data(InodeNumber(ino), block);
        let sq = self.next_sqnum();
        let bytes = DataNode {
            key,
            size: 16,
            data: vec![0xA5; 16],
        }
        .encode(sq)
        .expect("encode data");
        (key, self.append(leb, &bytes))
    }

    fn inode_node(&mut self, leb: LebNumber, ino: u64, nlink: u32) -> (Key, NodeLocation) {
        let key = Key::inode(InodeNumber(ino));
        let sq = self.next_sqnum();
        let bytes = InodeNode {
            key,
            nlink,
            mode: 0o100_644,
            size: 0,
        }
        .encode(sq)
        .expect("encode inode");
        (key, self.append(leb, &bytes))
    }

    fn entry_node(
        &mut self,
        leb: LebNumber,
        dir: u64,
        name: &[u8],
        target: u64,
    ) -> (Key, NodeLocation) {
        let key = Key::entry(InodeNumber(dir), name);
        let sq = self.next_sqnum();
        let bytes = EntryNode {
            key,
            inum: target,
            etype: EntryType::Regular,
            name: name.to_vec(),
        }
        .encode(sq)
        .expect("encode entry");
        (key, self.append(leb, &bytes))
    }

    fn xattr_node(
        &mut self,
        leb: LebNumber,
        host: u64,
        name: &[u8],
        target: u64,
    ) -> (Key, NodeLocation) {
        let key = Key::xattr(InodeNumber(host), name);
        let sq = self.next_sqnum();
        let bytes = EntryNode {
            key,
            inum: target,
            etype: EntryType::Xattr,
            name: name.to_vec(),
        }
        .encode(sq)
        .expect("encode xattr entry");
        (key, self.append(leb, &bytes))
    }
}

fn empty_tnc(fanout: usize) -> (Tnc, Media) {
    let media = Media::new(fanout);
    let lprops = Arc::new(LpropsTable::new(*media.store.geometry()));
    let tnc = Tnc::new_empty(media.store.clone(), lprops);
    (tnc, media)
}

/// Two distinct names with the same entry-key hash, by birthday search.
fn colliding_names() -> (Vec<u8>, Vec<u8>) {
    let mut seen: HashMap<u32, Vec<u8>> = HashMap::new();
    for i in 0_u64.. {
        let name = format!("name{i}").into_bytes();
        if let Some(prev) = seen.insert(name_hash(&name), name.clone()) {
            return (prev, name);
        }
    }
    unreachable!("29-bit hash space must collide");
}

#[test]
fn round_trip_shuffled_inserts_then_delete_all() {
    let (tnc, _media) = empty_tnc(8);
    let ino = InodeNumber(1);
    let count = 100_u32;

    // Deterministic shuffle: stride coprime to the count.
    for i in 0..count {
        let block = (i * 37) % count;
        let loc = NodeLocation::new(LebNumber(8 + block % 4), block * 64, 64);
        tnc.add(&Key::data(ino, block), loc).expect("add");
    }

    let keys = tnc.leaf_keys().expect("walk");
    assert_eq!(keys.len(), count as usize);
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys must be sorted");

    for block in 0..count {
        tnc.remove(&Key::data(ino, block)).expect("remove");
    }
    assert!(tnc.leaf_keys().expect("walk").is_empty());
    // Everything collapsed back to a single (empty, dirty) root.
    assert_eq!(tnc.metrics().dirty_znodes, 1);
    assert_eq!(tnc.metrics().clean_znodes, 0);

    // The tree is still usable after emptying out.
    tnc.add(
        &Key::data(ino, 7),
        NodeLocation::new(LebNumber(8), 0, 64),
    )
    .expect("add after empty");
    assert_eq!(tnc.leaf_keys().expect("walk").len(), 1);
}

#[test]
fn replace_is_idempotent_and_records_old_location() {
    let (tnc, mut media) = empty_tnc(8);
    let (key, loc1) = media.data_node(LebNumber(8), 1, 5);

    tnc.add(&key, loc1).expect("add");
    let (_, found) = tnc.locate(&key).expect("locate");
    assert_eq!(found, loc1);

    // Relocate the same key; exactly one branch must remain.
    let (_, loc2) = media.data_node(LebNumber(8), 1, 5);
    tnc.add(&key, loc2).expect("re-add");
    let (bytes, found) = tnc.locate(&key).expect("locate");
    assert_eq!(found, loc2);
    assert_eq!(bytes.len(), loc2.len as usize);

    assert_eq!(tnc.leaf_keys().expect("walk").len(), 1);
    assert!(tnc.old_index_contains(loc1.leb, loc1.offs));
}

#[test]
fn splitting_a_full_leaf_partitions_the_keys() {
    let (tnc, _media) = empty_tnc(8);
    let ino = InodeNumber(3);

    // Non-sequential inserts so the midpoint split path runs.
    let blocks: Vec<u32> = vec![0, 4, 8, 12, 16, 20, 24, 28, 14];
    for &block in &blocks {
        let loc = NodeLocation::new(LebNumber(8), block * 64, 64);
        tnc.add(&Key::data(ino, block), loc).expect("add");
    }

    let keys = tnc.leaf_keys().expect("walk");
    assert_eq!(keys.len(), blocks.len());
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    // The split made a sibling and a new root: three dirty znodes.
    assert_eq!(tnc.metrics().dirty_znodes, 3);
}

#[test]
fn appending_data_blocks_splits_without_scattering_the_run() {
    let (tnc, _media) = empty_tnc(8);
    let ino = InodeNumber(3);

    // A file written sequentially: every insert lands past the last
    // block, which triggers the keep-all-in-left split bias.
    for block in 0..24_u32 {
        let loc = NodeLocation::new(LebNumber(8), block * 64, 64);
        tnc.add(&Key::data(ino, block), loc).expect("add");
    }

    let keys = tnc.leaf_keys().expect("walk");
    assert_eq!(keys.len(), 24);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    for block in 0..24_u32 {
        let key = Key::data(ino, block);
        assert!(
            tnc.has_node(&key, None, NodeLocation::new(LebNumber(8), block * 64, 64))
                .expect("has_node"),
            "block {block} lost by append-biased split"
        );
    }
}

#[test]
fn colliding_names_resolve_to_their_own_entries() {
    let (a, b) = colliding_names();
    assert_eq!(name_hash(&a), name_hash(&b));

    let (tnc, mut media) = empty_tnc(8);
    let dir = 7_u64;
    let (key_a, loc_a) = media.entry_node(LebNumber(8), dir, &a, 101);
    let (key_b, loc_b) = media.entry_node(LebNumber(8), dir, &b, 102);
    assert_eq!(key_a, key_b, "names were chosen to collide");

    tnc.add_nm(&key_a, loc_a, &a).expect("add a");
    tnc.add_nm(&key_b, loc_b, &b).expect("add b");
    assert_eq!(tnc.leaf_keys().expect("walk").len(), 2);

    let ent_a = tnc.lookup_nm(&key_a, &a).expect("lookup a");
    assert_eq!(ent_a.inum, 101);
    assert_eq!(ent_a.name, a);
    let ent_b = tnc.lookup_nm(&key_b, &b).expect("lookup b");
    assert_eq!(ent_b.inum, 102);
    assert_eq!(ent_b.name, b);

    // Removing one colliding entry must not disturb the other.
    tnc.remove_nm(&key_a, &a).expect("remove a");
    assert!(matches!(
        tnc.lookup_nm(&key_a, &a),
        Err(ember_error::EmberError::NotFound)
    ));
    assert_eq!(tnc.lookup_nm(&key_b, &b).expect("lookup b").inum, 102);
}

#[test]
fn next_entry_walks_a_directory() {
    let (tnc, mut media) = empty_tnc(8);
    let dir = 10_u64;
    let names: Vec<&[u8]> = vec![b"alpha", b"beta", b"gamma"];
    for (i, name) in names.iter().enumerate() {
        let (key, loc) = media.entry_node(LebNumber(8), dir, name, 100 + i as u64);
        tnc.add_nm(&key, loc, name).expect("add_nm");
    }
    // An unrelated directory that must not leak into the walk.
    let (okey, oloc) = media.entry_node(LebNumber(8), 11, b"other", 500);
    tnc.add_nm(&okey, oloc, b"other").expect("add_nm");

    let mut seen = Vec::new();
    let mut key = Key::lowest_entry(InodeNumber(dir));
    let mut last: Option<Vec<u8>> = None;
    loop {
        match tnc.next_entry(&key, last.as_deref()) {
            Ok(entry) => {
                key = entry.key;
                seen.push(entry.name.clone());
                last = Some(entry.name);
            }
            Err(ember_error::EmberError::NotFound) => break,
            Err(err) => panic!("next_entry failed: {err}"),
        }
    }
    let mut seen_sorted = seen.clone();
    seen_sorted.sort();
    assert_eq!(seen_sorted, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    // Entries come back ordered by name hash.
    let hashes: Vec<u32> = seen.iter().map(|n| name_hash(n)).collect();
    assert!(hashes.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn remove_ino_cascades_through_attribute_entries() {
    let (tnc, mut media) = empty_tnc(8);
    let host = 20_u64;
    let xattr_ino = 21_u64;

    let (ikey, iloc) = media.inode_node(LebNumber(8), host, 1);
    tnc.add(&ikey, iloc).expect("add inode");
    let (dkey, dloc) = media.data_node(LebNumber(8), host, 0);
    tnc.add(&dkey, dloc).expect("add data");

    let (xkey, xloc) = media.xattr_node(LebNumber(8), host, b"user.tag", xattr_ino);
    tnc.add_nm(&xkey, xloc, b"user.tag").expect("add xattr entry");
    let (xikey, xiloc) = media.inode_node(LebNumber(8), xattr_ino, 1);
    tnc.add(&xikey, xiloc).expect("add xattr inode");
    let (xdkey, xdloc) = media.data_node(LebNumber(8), xattr_ino, 0);
    tnc.add(&xdkey, xdloc).expect("add xattr data");

    tnc.remove_ino(InodeNumber(host)).expect("remove_ino");
    assert!(
        tnc.leaf_keys().expect("walk").is_empty(),
        "host inode, its data, its attribute entry, and the attribute \
         inode's subtree must all be gone"
    );
}

#[test]
fn commit_freeze_copies_on_write() {
    let (tnc, mut media) = empty_tnc(8);
    let ino = InodeNumber(1);
    let (k0, l0) = media.data_node(LebNumber(8), 1, 0);
    tnc.add(&k0, l0).expect("add");
    for block in 1..6_u32 {
        let loc = NodeLocation::new(LebNumber(9), block * 64, 64);
        tnc.add(&Key::data(ino, block), loc).expect("add");
    }

    tnc.start_commit();
    let frozen_dirty = tnc.metrics().dirty_znodes;

    // Mutating the frozen snapshot must duplicate, not corrupt it.
    for block in 6..10_u32 {
        let loc = NodeLocation::new(LebNumber(9), block * 64, 64);
        tnc.add(&Key::data(ino, block), loc).expect("add during commit");
    }
    let keys = tnc.leaf_keys().expect("walk");
    assert_eq!(keys.len(), 10);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert!(tnc.metrics().dirty_znodes >= frozen_dirty);

    tnc.finish_commit();
    assert_eq!(tnc.old_index_len(), 0, "old index dies with the commit");
    // The tree stays fully usable after the epoch ends.
    let (_, found) = tnc.locate(&k0).expect("locate");
    assert_eq!(found, l0);
    tnc.remove(&Key::data(ino, 3)).expect("remove after commit");
    assert_eq!(tnc.leaf_keys().expect("walk").len(), 9);
}

#[test]
fn abort_commit_thaws_the_dirty_set() {
    let (tnc, _media) = empty_tnc(8);
    let ino = InodeNumber(2);
    for block in 0..4_u32 {
        let loc = NodeLocation::new(LebNumber(8), block * 64, 64);
        tnc.add(&Key::data(ino, block), loc).expect("add");
    }
    tnc.start_commit();
    tnc.add(
        &Key::data(ino, 9),
        NodeLocation::new(LebNumber(8), 4096, 64),
    )
    .expect("add during commit");
    tnc.abort_commit();

    let keys = tnc.leaf_keys().expect("walk");
    assert_eq!(keys.len(), 5);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    // A failed commit keeps the old-index baseline alive.
    tnc.remove(&Key::data(ino, 0)).expect("remove after abort");
}

/// Build a two-level index on flash and open it cold.
fn committed_tree() -> (Tnc, Media, Vec<(Key, NodeLocation)>, Vec<NodeLocation>) {
    let mut media = Media::new(8);
    let leaves_leb = LebNumber(8);
    let index_leb = LebNumber(12);

    let nodes: Vec<(Key, NodeLocation)> = (0..4_u32)
        .map(|block| media.data_node(leaves_leb, 1, block))
        .collect();

    let sq = media.next_sqnum();
    let leaf0 = IndexNode {
        level: 0,
        branches: nodes[..2]
            .iter()
            .map(|(key, loc)| IndexBranch { key: *key, loc: *loc })
            .collect(),
    }
    .encode(sq)
    .expect("encode leaf0");
    let leaf0_loc = media.append(index_leb, &leaf0);

    let sq = media.next_sqnum();
    let leaf1 = IndexNode {
        level: 0,
        branches: nodes[2..]
            .iter()
            .map(|(key, loc)| IndexBranch { key: *key, loc: *loc })
            .collect(),
    }
    .encode(sq)
    .expect("encode leaf1");
    let leaf1_loc = media.append(index_leb, &leaf1);

    let sq = media.next_sqnum();
    let root = IndexNode {
        level: 1,
        branches: vec![
            IndexBranch {
                key: nodes[0].0,
                loc: leaf0_loc,
            },
            IndexBranch {
                key: nodes[2].0,
                loc: leaf1_loc,
            },
        ],
    }
    .encode(sq)
    .expect("encode root");
    let root_loc = media.append(index_leb, &root);

    let lprops = Arc::new(LpropsTable::new(*media.store.geometry()));
    let index_size = u64::from(align8(leaf0_loc.len) + align8(leaf1_loc.len) + align8(root_loc.len));
    let tnc = Tnc::open(media.store.clone(), lprops, root_loc, index_size);
    (tnc, media, nodes, vec![leaf0_loc, leaf1_loc, root_loc])
}

#[test]
fn opens_a_committed_index_from_flash() {
    let (tnc, _media, nodes, _) = committed_tree();
    for (key, loc) in &nodes {
        let (bytes, found) = tnc.locate(key).expect("locate");
        assert_eq!(found, *loc);
        assert_eq!(bytes.len(), loc.len as usize);
    }
    let keys = tnc.leaf_keys().expect("walk");
    assert_eq!(keys.len(), nodes.len());
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    // Everything loaded through the store is clean until mutated.
    assert_eq!(tnc.metrics().dirty_znodes, 0);
    assert_eq!(tnc.metrics().clean_znodes, 3);
}

#[test]
fn dirtying_a_loaded_znode_accounts_index_dirt() {
    let (tnc, _media, nodes, _index_locs) = committed_tree();
    let before = tnc.index_size();

    // Replacing a leaf dirties the whole descent path.
    let new_loc = NodeLocation::new(LebNumber(9), 0, nodes[0].1.len);
    tnc.add(&nodes[0].0, new_loc).expect("add");
    assert!(tnc.metrics().dirty_znodes >= 2);
    assert!(tnc.index_size() < before, "dirtied index nodes leave the estimate");
}

#[test]
fn has_node_and_dirty_idx_node_for_index_nodes() {
    let (tnc, _media, nodes, index_locs) = committed_tree();
    let leaf0_loc = index_locs[0];

    // The first leaf index node, addressed by its first key.
    assert!(tnc
        .has_node(&nodes[0].0, Some(0), leaf0_loc)
        .expect("has_node"));
    // Wrong address: not in the tree.
    let bogus = NodeLocation::new(leaf0_loc.leb, leaf0_loc.offs + 512, leaf0_loc.len);
    assert!(!tnc.has_node(&nodes[0].0, Some(0), bogus).expect("has_node"));

    // Dirtying it (as the GC does before moving it) takes it out of the
    // committed index.
    tnc.dirty_idx_node(&nodes[0].0, 0, leaf0_loc.leb, leaf0_loc.offs)
        .expect("dirty_idx_node");
    assert!(!tnc
        .has_node(&nodes[0].0, Some(0), leaf0_loc)
        .expect("has_node"));

    // Leaf variant.
    assert!(tnc.has_node(&nodes[1].0, None, nodes[1].1).expect("has_node"));
    let bogus = NodeLocation::new(nodes[1].1.leb, nodes[1].1.offs + 8, nodes[1].1.len);
    assert!(!tnc.has_node(&nodes[1].0, None, bogus).expect("has_node"));
}

mod invariants {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any interleaving of adds and removes keeps the leaf keys
        /// strictly sorted (data keys never collide) and consistent
        /// with a model map.
        #[test]
        fn prop_tree_stays_sorted_under_random_ops(
            ops in proptest::collection::vec((any::<bool>(), 0_u32..64), 1..200)
        ) {
            let (tnc, _media) = empty_tnc(8);
            let ino = InodeNumber(9);
            let mut model = std::collections::BTreeSet::new();
            for (add, block) in ops {
                let key = Key::data(ino, block);
                if add {
                    let loc = NodeLocation::new(LebNumber(8), block * 64, 64);
                    tnc.add(&key, loc).expect("add");
                    model.insert(block);
                } else {
                    tnc.remove(&key).expect("remove");
                    model.remove(&block);
                }
            }
            let keys = tnc.leaf_keys().expect("walk");
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
            let expected: Vec<Key> = model.iter().map(|&b| Key::data(ino, b)).collect();
            prop_assert_eq!(keys, expected);
        }
    }
}

#[test]
fn corrupt_index_node_fails_the_lookup() {
    let mut media = Media::new(8);
    let (k0, l0) = media.data_node(LebNumber(8), 1, 1);
    let (k1, l1) = media.data_node(LebNumber(8), 1, 0);

    // Keys deliberately out of order in the index node.
    let sq = media.next_sqnum();
    let bad_leaf = IndexNode {
        level: 0,
        branches: vec![
            IndexBranch { key: k0, loc: l0 },
            IndexBranch { key: k1, loc: l1 },
        ],
    }
    .encode(sq)
    .expect("encode");
    let bad_loc = media.append(LebNumber(12), &bad_leaf);

    let lprops = Arc::new(LpropsTable::new(*media.store.geometry()));
    let tnc = Tnc::open(media.store.clone(), lprops, bad_loc, 0);
    assert!(matches!(
        tnc.lookup(&k0),
        Err(ember_error::EmberError::Corruption { .. })
    ));
}
