//! Bulk-loading trees from sorted entry streams.

mod common;

use common::{tree_depth, TinyEntry, TinyIndex};
use tempfile::tempdir;
use tristore::btree::{node, BTree, TreeIndex, MAX_DEPTH};
use tristore::index::{AggregatedEntry, AggregatedFactsIndex, VecSource, LEAF_CAPACITY};

fn aggregated_entries(n: u32) -> Vec<AggregatedEntry> {
    (0..n)
        .map(|i| AggregatedEntry::new(i, i % 7, 1 + i % 5))
        .collect()
}

fn load(entries: Vec<AggregatedEntry>) -> BTree<AggregatedFactsIndex> {
    let dir = tempdir().unwrap();
    let index = AggregatedFactsIndex::create(dir.path().join("facts.agg")).unwrap();
    std::mem::forget(dir);
    let mut tree = BTree::new(index);
    tree.perform_bulkload(&mut VecSource::new(entries)).unwrap();
    tree
}

#[test]
fn empty_load_yields_a_searchable_tree() {
    let tree = load(Vec::new());

    assert_ne!(tree.index().root_page(), 0);
    assert_eq!(tree.index().leaf_count(), 1);
    assert!(tree.index().scan().unwrap().is_empty());
    assert_eq!(tree.lookup_count(1, 2).unwrap(), None);
}

#[test]
fn single_entry() {
    let tree = load(vec![AggregatedEntry::new(7, 8, 3)]);

    assert_eq!(tree.index().leaf_count(), 1);
    assert_eq!(tree.lookup_count(7, 8).unwrap(), Some(3));
    assert_eq!(tree.lookup_count(7, 9).unwrap(), None);
    // Past the maximum key: the descent runs off the tree.
    assert!(tree.find_leaf(tristore::index::AggregatedKey(8, 0)).unwrap().is_none());
}

#[test]
fn root_is_inner_even_over_a_single_leaf() {
    let tree = load(vec![AggregatedEntry::new(1, 1, 1)]);

    let root = tree
        .index()
        .read_shared(tree.index().root_page())
        .unwrap();
    assert!(node::is_inner(root.data()));
    assert_eq!(node::inner_count(root.data()), 1);
}

#[test]
fn hundred_thousand_entries() {
    let tree = load(aggregated_entries(100_000));

    let expected_leaves = 100_000_u32.div_ceil(LEAF_CAPACITY as u32);
    assert_eq!(tree.index().leaf_count(), expected_leaves);
    assert_eq!(tree_depth(&tree).unwrap(), 2);

    assert_eq!(tree.lookup_count(50_000, 50_000 % 7).unwrap(), Some(1 + 50_000 % 5));
    assert_eq!(tree.lookup_count(0, 0).unwrap(), Some(1));
    assert_eq!(tree.lookup_count(99_999, 99_999 % 7).unwrap(), Some(1 + 99_999 % 5));
    assert_eq!(tree.lookup_count(50_000, 0).unwrap(), None);
}

#[test]
fn leaf_chain_scan_is_sorted_and_complete() {
    let tree = load(aggregated_entries(10_000));

    let scanned = tree.index().scan().unwrap();
    assert_eq!(scanned.len(), 10_000);
    for (i, entry) in scanned.iter().enumerate() {
        assert_eq!(entry.value1, i as u32);
        assert_eq!(entry.value2, i as u32 % 7);
        assert_eq!(entry.count, 1 + i as u32 % 5);
    }
    assert!(scanned.windows(2).all(|w| w[0].key() < w[1].key()));
}

#[test]
fn every_leaf_sits_at_the_same_depth() {
    let tree = load(aggregated_entries(20_000));
    let depth = tree_depth(&tree).unwrap();
    assert!(depth <= MAX_DEPTH);

    // Probe a spread of keys; each descent must land on a leaf.
    for value1 in [0, 1, 4_999, 10_000, 19_999] {
        let leaf = tree
            .find_leaf(tristore::index::AggregatedKey(value1, value1 % 7))
            .unwrap()
            .expect("key within the tree");
        assert!(!node::is_inner(leaf.data()));
    }
}

#[test]
fn tiny_fanout_builds_multiple_inner_levels() {
    let dir = tempdir().unwrap();
    let index = TinyIndex::create(dir.path().join("tiny")).unwrap();
    let mut tree = BTree::new(index);

    // 40 entries over four-entry leaves: 10 leaves, more than one level.
    let entries: Vec<_> = (0..40).map(|i| TinyEntry::new(i, i * 10)).collect();
    tree.perform_bulkload(&mut VecSource::new(entries)).unwrap();

    assert_eq!(tree.index().leaf_count(), 10);
    assert!(tree_depth(&tree).unwrap() >= 2);
    for key in [0, 17, 39] {
        assert_eq!(common::tiny_lookup(&tree, key).unwrap(), Some(key * 10));
    }
    assert_eq!(common::tiny_lookup(&tree, 40).unwrap(), None);
    let scanned = tree.index().scan().unwrap();
    assert_eq!(scanned.len(), 40);
    assert!(scanned.windows(2).all(|w| w[0].key < w[1].key));
}

#[test]
fn reload_replaces_the_previous_tree() {
    let dir = tempdir().unwrap();
    let index = AggregatedFactsIndex::create(dir.path().join("facts.agg")).unwrap();
    let mut tree = BTree::new(index);

    tree.perform_bulkload(&mut VecSource::new(aggregated_entries(500)))
        .unwrap();
    let first_root = tree.index().root_page();

    tree.perform_bulkload(&mut VecSource::new(vec![AggregatedEntry::new(9, 9, 9)]))
        .unwrap();
    assert_ne!(tree.index().root_page(), first_root);
    assert_eq!(tree.index().scan().unwrap().len(), 1);
    assert_eq!(tree.lookup_count(9, 9).unwrap(), Some(9));
    assert_eq!(tree.lookup_count(100, 100 % 7).unwrap(), None);
}
