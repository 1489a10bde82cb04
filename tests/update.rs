//! Incremental merge updates: conflicts, splits and root growth.

mod common;

use common::{tiny_lookup, tree_depth, TinyEntry, TinyIndex};
use tempfile::tempdir;
use tristore::btree::{BTree, TreeIndex, MAX_DEPTH};
use tristore::index::{AggregatedEntry, AggregatedFactsIndex, VecSource};

fn load(entries: Vec<AggregatedEntry>) -> BTree<AggregatedFactsIndex> {
    let dir = tempdir().unwrap();
    let index = AggregatedFactsIndex::create(dir.path().join("facts.agg")).unwrap();
    std::mem::forget(dir);
    let mut tree = BTree::new(index);
    tree.perform_bulkload(&mut VecSource::new(entries)).unwrap();
    tree
}

fn tiny_load(entries: Vec<TinyEntry>) -> BTree<TinyIndex> {
    let dir = tempdir().unwrap();
    let index = TinyIndex::create(dir.path().join("tiny")).unwrap();
    std::mem::forget(dir);
    let mut tree = BTree::new(index);
    tree.perform_bulkload(&mut VecSource::new(entries)).unwrap();
    tree
}

#[test]
fn merge_reports_conflicts_and_stores_the_rest() {
    // Ten stored entries with even keys, five incoming of which two
    // collide: thirteen survive.
    let stored: Vec<_> = (0..10).map(|i| AggregatedEntry::new(i * 2, 0, 1)).collect();
    let mut tree = load(stored);

    let incoming = vec![
        AggregatedEntry::new(4, 0, 9),
        AggregatedEntry::new(5, 0, 7),
        AggregatedEntry::new(10, 0, 9),
        AggregatedEntry::new(11, 0, 7),
        AggregatedEntry::new(100, 0, 7),
    ];
    let mut source = VecSource::new(incoming);
    tree.perform_update(&mut source).unwrap();

    assert_eq!(source.conflicts(), 2);
    let scanned = tree.index().scan().unwrap();
    assert_eq!(scanned.len(), 13);
    assert!(scanned.windows(2).all(|w| w[0].key() < w[1].key()));

    // Conflicting keys carry the incoming count now.
    assert_eq!(tree.lookup_count(4, 0).unwrap(), Some(9));
    assert_eq!(tree.lookup_count(10, 0).unwrap(), Some(9));
    // New keys landed, untouched ones kept their count.
    assert_eq!(tree.lookup_count(5, 0).unwrap(), Some(7));
    assert_eq!(tree.lookup_count(100, 0).unwrap(), Some(7));
    assert_eq!(tree.lookup_count(0, 0).unwrap(), Some(1));
}

#[test]
fn remerging_the_same_entries_changes_nothing() {
    let entries: Vec<_> = (0..50).map(|i| AggregatedEntry::new(i, i, 2)).collect();
    let mut tree = load(entries.clone());
    let before = tree.index().scan().unwrap();

    let mut source = VecSource::new(entries);
    tree.perform_update(&mut source).unwrap();

    assert_eq!(source.conflicts(), 50);
    let after = tree.index().scan().unwrap();
    assert_eq!(after.len(), before.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!((a.value1, a.value2, a.count), (b.value1, b.value2, b.count));
    }
}

#[test]
fn merge_into_an_empty_tree() {
    let mut tree = load(Vec::new());

    let entries: Vec<_> = (0..100).map(|i| AggregatedEntry::new(i, 0, 1)).collect();
    let mut source = VecSource::new(entries);
    tree.perform_update(&mut source).unwrap();

    assert_eq!(source.conflicts(), 0);
    let scanned = tree.index().scan().unwrap();
    assert_eq!(scanned.len(), 100);
    assert!(scanned.windows(2).all(|w| w[0].key() < w[1].key()));
    assert_eq!(tree.lookup_count(42, 0).unwrap(), Some(1));
}

#[test]
fn empty_update_is_a_no_op() {
    let mut tree = load(vec![AggregatedEntry::new(1, 1, 1)]);
    let mut source = VecSource::new(Vec::new());
    tree.perform_update(&mut source).unwrap();
    assert_eq!(tree.index().scan().unwrap().len(), 1);
}

#[test]
fn interleaved_merge_splits_leaves() {
    // Evens loaded, odds merged in between: every leaf overflows.
    let stored: Vec<_> = (0..100).map(|i| TinyEntry::new(i * 2, 0)).collect();
    let mut tree = tiny_load(stored);
    assert_eq!(tree.index().leaf_count(), 25);

    let incoming: Vec<_> = (0..100).map(|i| TinyEntry::new(i * 2 + 1, 1)).collect();
    let mut source = VecSource::new(incoming);
    tree.perform_update(&mut source).unwrap();

    assert_eq!(source.conflicts(), 0);
    let scanned = tree.index().scan().unwrap();
    assert_eq!(scanned.len(), 200);
    for (i, entry) in scanned.iter().enumerate() {
        assert_eq!(entry.key, i as u32);
        assert_eq!(entry.payload, (i % 2) as u32);
    }
}

#[test]
fn appending_past_the_maximum_key_extends_the_tree() {
    let stored: Vec<_> = (0..20).map(|i| TinyEntry::new(i, 0)).collect();
    let mut tree = tiny_load(stored);

    let incoming: Vec<_> = (20..200).map(|i| TinyEntry::new(i, 5)).collect();
    tree.perform_update(&mut VecSource::new(incoming)).unwrap();

    let scanned = tree.index().scan().unwrap();
    assert_eq!(scanned.len(), 200);
    assert!(scanned.windows(2).all(|w| w[0].key < w[1].key));
    assert_eq!(tiny_lookup(&tree, 19).unwrap(), Some(0));
    assert_eq!(tiny_lookup(&tree, 20).unwrap(), Some(5));
    assert_eq!(tiny_lookup(&tree, 199).unwrap(), Some(5));
}

#[test]
fn splitting_a_full_inner_page_keeps_both_halves_reachable() {
    // 10000 four-entry leaves fill the first level-one inner page to its
    // 2045-entry capacity. Merging a single small key splits leaf 0 and
    // then that inner page, with the new separator landing in its left
    // half; the right half must still be wired into the root.
    let stored: Vec<_> = (0..40_000).map(|i| TinyEntry::new(i * 2, 1)).collect();
    let mut tree = tiny_load(stored);
    assert_eq!(tree_depth(&tree).unwrap(), 3);

    let mut source = VecSource::new(vec![TinyEntry::new(1, 7)]);
    tree.perform_update(&mut source).unwrap();

    assert_eq!(source.conflicts(), 0);
    assert_eq!(tiny_lookup(&tree, 1).unwrap(), Some(7));
    // Keys on either side of the split point (leaf 1022 of 2045) stay
    // findable from the root, not just via the leaf chain.
    for key in [0, 2, 6, 8 * 1021, 8 * 1022, 8 * 1022 + 6, 8 * 1500, 2 * 39_999] {
        assert_eq!(tiny_lookup(&tree, key).unwrap(), Some(1), "key {key}");
    }
    assert_eq!(tree.index().scan().unwrap().len(), 40_001);
}

#[test]
fn splitting_with_the_separator_in_the_right_half() {
    let stored: Vec<_> = (0..40_000).map(|i| TinyEntry::new(i * 2, 1)).collect();
    let mut tree = tiny_load(stored);

    // Leaf 1500 sits past the split midpoint of the full inner page, so
    // the new separator goes into its right half.
    tree.perform_update(&mut VecSource::new(vec![TinyEntry::new(12_001, 7)]))
        .unwrap();

    assert_eq!(tiny_lookup(&tree, 12_001).unwrap(), Some(7));
    for key in [0, 8 * 1021, 8 * 1022, 12_000, 12_002, 12_006, 2 * 39_999] {
        assert_eq!(tiny_lookup(&tree, key).unwrap(), Some(1), "key {key}");
    }
    assert_eq!(tree.index().scan().unwrap().len(), 40_001);
}

#[test]
fn massive_merge_splits_the_root() {
    let stored: Vec<_> = (0..100).map(|i| TinyEntry::new(i, 1)).collect();
    let mut tree = tiny_load(stored);
    assert_eq!(tree_depth(&tree).unwrap(), 2);
    let old_root = tree.index().root_page();

    // Four-entry leaves and 2045-entry inner pages: 10100 entries need
    // more leaves than one root can reference, so the root must split.
    let incoming: Vec<_> = (100..10_100).map(|i| TinyEntry::new(i, 2)).collect();
    tree.perform_update(&mut VecSource::new(incoming)).unwrap();

    assert_ne!(tree.index().root_page(), old_root);
    let depth = tree_depth(&tree).unwrap();
    assert_eq!(depth, 3);
    assert!(depth <= MAX_DEPTH);

    let scanned = tree.index().scan().unwrap();
    assert_eq!(scanned.len(), 10_100);
    assert!(scanned.windows(2).all(|w| w[0].key < w[1].key));
    for key in [0, 99, 100, 5_000, 10_099] {
        let expected = if key < 100 { 1 } else { 2 };
        assert_eq!(tiny_lookup(&tree, key).unwrap(), Some(expected));
    }
}
