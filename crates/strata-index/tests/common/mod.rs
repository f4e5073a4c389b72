//! Shared fixtures and structural validation for B+ tree tests.

#![allow(dead_code)]

use std::sync::Arc;
use strata_buffer::{BufferPoolManager, DiskManager};
use strata_common::page::PageId;
use strata_index::btree::page::{
    node_kind, node_max_size, node_parent, InternalNode, LeafNode, NodeKind,
};
use strata_index::{BPlusTree, OrdComparator, HEADER_PAGE_ID};
use tempfile::TempDir;

/// Creates a pool over a fresh data file with the header page in place.
pub fn setup_pool(frames: usize) -> (Arc<BufferPoolManager>, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path().join("index.db"), false).unwrap());
    let pool = Arc::new(BufferPoolManager::new(frames, 2, disk));

    let (page_id, _) = pool.new_page().unwrap();
    assert_eq!(page_id, HEADER_PAGE_ID);
    pool.unpin_page(page_id, true);

    (pool, dir)
}

/// A tree with tiny fan-out so a handful of keys exercises splits.
pub fn small_tree(pool: &Arc<BufferPoolManager>) -> BPlusTree<u64, u64> {
    tree_with_sizes(pool, 3, 4)
}

pub fn tree_with_sizes(
    pool: &Arc<BufferPoolManager>,
    leaf_max: u32,
    internal_max: u32,
) -> BPlusTree<u64, u64> {
    BPlusTree::new("test_index", Arc::clone(pool), OrdComparator, leaf_max, internal_max).unwrap()
}

/// Walks the whole tree checking the structural invariants: parent
/// pointers, equal leaf depth, per-node fill bounds, and key ordering
/// within nodes and across separator ranges. Returns the leaf depth.
pub fn validate_tree(pool: &BufferPoolManager, tree: &BPlusTree<u64, u64>) {
    let root = tree.root_page_id();
    if !root.is_valid() {
        return;
    }
    check_node(pool, root, PageId::INVALID, None, None);

    // The leaf chain must enumerate strictly increasing keys.
    let keys: Vec<u64> = tree.iter().unwrap().map(|(key, _)| key).collect();
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "leaf chain out of order: {:?}", pair);
    }
}

/// Checks one subtree; `low`/`high` bound the keys it may contain.
fn check_node(
    pool: &BufferPoolManager,
    page_id: PageId,
    expected_parent: PageId,
    low: Option<u64>,
    high: Option<u64>,
) -> usize {
    let is_root = !expected_parent.is_valid();
    let frame = pool.fetch_page(page_id).unwrap();

    enum Shape {
        Leaf,
        Internal(Vec<(PageId, Option<u64>, Option<u64>)>),
    }

    let shape = {
        let guard = frame.read_data();
        let data = &(**guard)[..];
        assert_eq!(node_parent(data), expected_parent, "bad parent of {}", page_id);

        match node_kind(data) {
            NodeKind::Leaf => {
                let leaf = LeafNode::<_, u64, u64>::view(data);
                if !is_root {
                    assert!(
                        leaf.size() >= leaf.max_size() / 2,
                        "underfull leaf {}: {} entries",
                        page_id,
                        leaf.size()
                    );
                }
                assert!(
                    leaf.size() < leaf.max_size(),
                    "overfull leaf {}: {} entries",
                    page_id,
                    leaf.size()
                );
                for i in 0..leaf.size() {
                    let key = leaf.key_at(i);
                    if i > 0 {
                        assert!(leaf.key_at(i - 1) < key, "unsorted leaf {}", page_id);
                    }
                    if let Some(low) = low {
                        assert!(key >= low, "leaf {} key {} below range", page_id, key);
                    }
                    if let Some(high) = high {
                        assert!(key < high, "leaf {} key {} above range", page_id, key);
                    }
                }
                Shape::Leaf
            }
            NodeKind::Internal => {
                let node = InternalNode::<_, u64>::view(data);
                let size = node.size();
                if is_root {
                    assert!(size >= 2, "root {} has a single child", page_id);
                } else {
                    assert!(
                        size >= node_max_size(data) / 2,
                        "underfull internal {}: {} children",
                        page_id,
                        size
                    );
                }
                assert!(
                    size <= node_max_size(data),
                    "overfull internal {}: {} children",
                    page_id,
                    size
                );

                let mut children = Vec::with_capacity(size);
                for i in 0..size {
                    if i > 1 {
                        assert!(node.key_at(i - 1) < node.key_at(i), "unsorted internal {}", page_id);
                    }
                    let child_low = if i == 0 { low } else { Some(node.key_at(i)) };
                    let child_high = if i + 1 < size { Some(node.key_at(i + 1)) } else { high };
                    children.push((node.child_at(i), child_low, child_high));
                }
                Shape::Internal(children)
            }
        }
    };
    pool.unpin_page(page_id, false);

    match shape {
        Shape::Leaf => 1,
        Shape::Internal(children) => {
            let mut depth = None;
            for (child, child_low, child_high) in children {
                let child_depth = check_node(pool, child, page_id, child_low, child_high);
                match depth {
                    None => depth = Some(child_depth),
                    Some(depth) => {
                        assert_eq!(depth, child_depth, "leaves at unequal depth under {}", page_id)
                    }
                }
            }
            depth.unwrap() + 1
        }
    }
}

/// Collects the tree's contents through the iterator.
pub fn collect(tree: &BPlusTree<u64, u64>) -> Vec<(u64, u64)> {
    tree.iter().unwrap().collect()
}
