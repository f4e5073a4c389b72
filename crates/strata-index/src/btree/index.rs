//! Concurrent B+ tree index over the buffer pool.

use super::context::LatchContext;
use super::iterator::TreeIterator;
use super::page::{
    node_kind, node_max_size, node_parent, node_size, set_node_parent, InternalNode, LeafNode,
    NodeKind, NODE_HEADER_LEN,
};
use super::types::{IndexKey, IndexValue, KeyComparator, OrdComparator};
use crate::header::{HeaderView, HEADER_PAGE_ID};
use log::debug;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::Result;

/// Kind of traversal a descent performs. Determines the latch mode taken
/// on each page and which nodes count as safe during crabbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Search,
    Insert,
    Delete,
}

/// Outcome of the right-sibling check on insert.
enum SiblingCheck {
    Stay,
    Switched,
    Restart,
}

struct RootState {
    page_id: PageId,
    /// Whether a root record for this index exists on the header page.
    published: bool,
}

/// A B+ tree index storing unique keys, backed entirely by the buffer pool.
///
/// All traversals use latch crabbing: a descent latches pages top-down in
/// the mode the operation needs and releases every ancestor as soon as the
/// newly latched child is structurally safe. Writers therefore only hold
/// the spine of the tree that a split or merge can actually reach, and a
/// parent needing modification is always still latched from the descent.
///
/// Keys, values, and the comparator are monomorphised per index.
pub struct BPlusTree<K, V, C = OrdComparator> {
    name: String,
    pool: Arc<strata_buffer::BufferPoolManager>,
    comparator: C,
    leaf_max_size: u32,
    internal_max_size: u32,
    /// In-memory root pointer, mirrored onto the header page on change.
    root: Mutex<RootState>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: IndexKey,
    V: IndexValue,
    C: KeyComparator<K>,
{
    /// Opens the index named `name`, recovering its root pointer from the
    /// header page if one was published before.
    ///
    /// A leaf splits upon reaching `leaf_max_size` pairs; an internal node
    /// splits when it exceeds `internal_max_size` children.
    pub fn new(
        name: impl Into<String>,
        pool: Arc<strata_buffer::BufferPoolManager>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        let name = name.into();
        assert!(leaf_max_size >= 2, "leaf_max_size must be >= 2");
        assert!(internal_max_size >= 3, "internal_max_size must be >= 3");
        assert!(
            NODE_HEADER_LEN + leaf_max_size as usize * (K::ENCODED_LEN + V::ENCODED_LEN)
                <= PAGE_SIZE,
            "leaf_max_size does not fit in a page"
        );
        assert!(
            NODE_HEADER_LEN + (internal_max_size as usize + 1) * (K::ENCODED_LEN + 4) <= PAGE_SIZE,
            "internal_max_size does not fit in a page"
        );

        let (page_id, published) = {
            let frame = pool.fetch_page(HEADER_PAGE_ID)?;
            let record = {
                let guard = frame.read_data();
                HeaderView::new(&(**guard)[..]).get_record(&name)
            };
            pool.unpin_page(HEADER_PAGE_ID, false);
            match record {
                Some(page_id) => (page_id, true),
                None => (PageId::INVALID, false),
            }
        };

        Ok(Self {
            name,
            pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            root: Mutex::new(RootState { page_id, published }),
            _marker: PhantomData,
        })
    }

    /// The largest capacities the page size permits for this key/value pair.
    pub fn default_max_sizes() -> (u32, u32) {
        let leaf = (PAGE_SIZE - NODE_HEADER_LEN) / (K::ENCODED_LEN + V::ENCODED_LEN);
        let internal = (PAGE_SIZE - NODE_HEADER_LEN) / (K::ENCODED_LEN + 4) - 1;
        (leaf as u32, internal as u32)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current root page id; INVALID for an empty tree.
    pub fn root_page_id(&self) -> PageId {
        self.root.lock().page_id
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    fn leaf_min_size(&self) -> usize {
        (self.leaf_max_size / 2) as usize
    }

    fn internal_min_size(&self) -> usize {
        (self.internal_max_size / 2) as usize
    }

    /// Whether the operation is guaranteed not to propagate a structural
    /// change upward out of this (non-root) node.
    fn is_safe(&self, data: &[u8], mode: AccessMode) -> bool {
        match mode {
            AccessMode::Search => true,
            AccessMode::Insert => match node_kind(data) {
                // A leaf splits upon *reaching* max_size
                NodeKind::Leaf => node_size(data) + 1 < node_max_size(data),
                NodeKind::Internal => node_size(data) < node_max_size(data),
            },
            AccessMode::Delete => node_size(data) > node_max_size(data) / 2,
        }
    }

    /// Descends to the leaf responsible for `key`, crabbing latches in the
    /// given mode. On success the context holds the latched leaf as its
    /// deepest page, plus every ancestor that could still be touched by a
    /// structural change. Returns false if the tree is empty.
    fn find_leaf<'a>(
        &'a self,
        key: &K,
        mode: AccessMode,
        ctx: &mut LatchContext<'a>,
    ) -> Result<bool> {
        debug_assert!(ctx.is_empty());

        loop {
            let root_pid = self.root.lock().page_id;
            if !root_pid.is_valid() {
                return Ok(false);
            }
            match mode {
                AccessMode::Search => ctx.latch_read(root_pid)?,
                _ => ctx.latch_write(root_pid)?,
            }
            // The root may have moved between the unlatched read above and
            // the latch acquisition; restart from the new root if so.
            if self.root.lock().page_id == root_pid {
                break;
            }
            ctx.release_all();
        }

        loop {
            let child = {
                let data = ctx.last().data();
                match node_kind(data) {
                    NodeKind::Leaf => return Ok(true),
                    NodeKind::Internal => {
                        let node = InternalNode::<_, K>::view(data);
                        node.child_at(node.lookup_child(&self.comparator, key))
                    }
                }
            };
            match mode {
                AccessMode::Search => ctx.latch_read(child)?,
                _ => ctx.latch_write(child)?,
            }
            if mode == AccessMode::Search || self.is_safe(ctx.last().data(), mode) {
                ctx.release_ancestors();
            }
        }
    }

    /// Point lookup.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let mut ctx = LatchContext::new(self.pool.as_ref());
        if !self.find_leaf(key, AccessMode::Search, &mut ctx)? {
            return Ok(None);
        }
        let result = {
            let leaf = LeafNode::<_, K, V>::view(ctx.last().data());
            leaf.search(&self.comparator, key)
                .ok()
                .map(|index| leaf.value_at(index))
        };
        ctx.release_all();
        Ok(result)
    }

    /// Inserts a key/value pair. Returns false if the key already exists.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        if self.try_start_new_tree(key, value)? {
            return Ok(true);
        }

        loop {
            let mut ctx = LatchContext::new(self.pool.as_ref());
            if !self.find_leaf(key, AccessMode::Insert, &mut ctx)? {
                // The tree was emptied by concurrent removes
                drop(ctx);
                if self.try_start_new_tree(key, value)? {
                    return Ok(true);
                }
                continue;
            }

            if let SiblingCheck::Restart = self.check_right_sibling(key, &mut ctx)? {
                continue;
            }

            let position = {
                let leaf = LeafNode::<_, K, V>::view(ctx.last().data());
                leaf.search(&self.comparator, key)
            };
            let Err(position) = position else {
                ctx.release_all();
                return Ok(false);
            };

            let needs_split = {
                let page = ctx.last_mut();
                let mut leaf = LeafNode::<_, K, V>::view(page.data_mut());
                leaf.insert_at(position, key, value);
                leaf.size() == leaf.max_size()
            };
            ctx.last_mut().dirty = true;

            if needs_split {
                self.split_leaf(&mut ctx)?;
            }
            ctx.release_all();
            return Ok(true);
        }
    }

    /// Creates the first leaf and publishes it as the root, unless a root
    /// already exists. Returns true if this call created the tree.
    fn try_start_new_tree(&self, key: &K, value: &V) -> Result<bool> {
        let mut root = self.root.lock();
        if root.page_id.is_valid() {
            return Ok(false);
        }

        let (page_id, frame) = self.pool.new_page()?;
        {
            let mut guard = frame.write_data();
            let mut leaf = LeafNode::<_, K, V>::init(
                &mut (**guard)[..],
                page_id,
                PageId::INVALID,
                self.leaf_max_size,
            );
            leaf.insert_at(0, key, value);
        }
        self.pool.unpin_page(page_id, true);

        root.page_id = page_id;
        let first_publication = !root.published;
        root.published = true;
        self.write_root_record(page_id, first_publication)?;
        debug!("tree {} rooted at {}", self.name, page_id);
        Ok(true)
    }

    /// Handles the race where a concurrent split narrowed the latched leaf
    /// after routing: a key greater than everything in the leaf may belong
    /// to its right sibling. The sibling latch is only tried, never waited
    /// on; contention or an unsafe sibling restarts the whole descent.
    fn check_right_sibling<'a>(
        &'a self,
        key: &K,
        ctx: &mut LatchContext<'a>,
    ) -> Result<SiblingCheck> {
        let (beyond_leaf, next) = {
            let leaf = LeafNode::<_, K, V>::view(ctx.last().data());
            let size = leaf.size();
            let beyond = size > 0
                && self.comparator.compare(key, &leaf.key_at(size - 1)) == Ordering::Greater;
            (beyond, leaf.next_leaf())
        };
        if !beyond_leaf || !next.is_valid() {
            return Ok(SiblingCheck::Stay);
        }

        let frame = self.pool.fetch_page(next)?;
        let Some(guard) = frame.try_write_data() else {
            self.pool.unpin_page(next, false);
            ctx.release_all();
            return Ok(SiblingCheck::Restart);
        };

        let (belongs_there, sibling_safe) = {
            let sibling = LeafNode::<_, K, V>::view(&(**guard)[..]);
            let belongs = sibling.size() > 0
                && self.comparator.compare(key, &sibling.key_at(0)) != Ordering::Less;
            (belongs, sibling.size() + 1 < sibling.max_size())
        };
        if !belongs_there {
            drop(guard);
            self.pool.unpin_page(next, false);
            return Ok(SiblingCheck::Stay);
        }
        if !sibling_safe {
            drop(guard);
            self.pool.unpin_page(next, false);
            ctx.release_all();
            return Ok(SiblingCheck::Restart);
        }

        ctx.pop_release();
        ctx.push_latched_write(next, frame, guard);
        Ok(SiblingCheck::Switched)
    }

    /// Splits the full leaf at the bottom of the context and propagates the
    /// new separator to the parent.
    fn split_leaf<'a>(&'a self, ctx: &mut LatchContext<'a>) -> Result<()> {
        let (new_pid, new_frame) = self.pool.new_page()?;
        let (left_pid, parent_pid, separator) = {
            let mut new_guard = new_frame.write_data();
            let page = ctx.last_mut();
            let mut leaf = LeafNode::<_, K, V>::view(page.data_mut());
            let mut new_leaf = LeafNode::<_, K, V>::init(
                &mut (**new_guard)[..],
                new_pid,
                leaf.parent(),
                self.leaf_max_size,
            );

            let split_at = leaf.size() / 2;
            leaf.split_into(&mut new_leaf, split_at);
            new_leaf.set_next_leaf(leaf.next_leaf());
            leaf.set_next_leaf(new_pid);

            (leaf.page_id(), leaf.parent(), new_leaf.key_at(0))
        };
        ctx.last_mut().dirty = true;
        self.pool.unpin_page(new_pid, true);

        debug!("leaf {} split, new sibling {}", left_pid, new_pid);
        self.insert_into_parent(ctx, parent_pid, left_pid, separator, new_pid)
    }

    /// Inserts `(separator, right)` into the parent of a just-split node,
    /// growing a new root or splitting the parent as needed.
    fn insert_into_parent<'a>(
        &'a self,
        ctx: &mut LatchContext<'a>,
        parent_pid: PageId,
        left_pid: PageId,
        separator: K,
        right_pid: PageId,
    ) -> Result<()> {
        if !parent_pid.is_valid() {
            // The split node was the root: grow a new root above the pair.
            let (root_pid, root_frame) = self.pool.new_page()?;
            {
                let mut guard = root_frame.write_data();
                let mut root = InternalNode::<_, K>::init(
                    &mut (**guard)[..],
                    root_pid,
                    PageId::INVALID,
                    self.internal_max_size,
                );
                root.push_first_child(left_pid);
                root.append(&separator, right_pid);
            }
            let left_pos = ctx.position(left_pid).expect("split node is latched");
            {
                let page = ctx.page_mut(left_pos);
                set_node_parent(page.data_mut(), root_pid);
                page.dirty = true;
            }
            self.set_parent(ctx, right_pid, root_pid)?;
            self.pool.unpin_page(root_pid, true);
            self.publish_root(root_pid)?;
            debug!("root split, new root {}", root_pid);
            return Ok(());
        }

        let parent_pos = ctx
            .position(parent_pid)
            .expect("unsafe descent keeps the split parent latched");

        let needs_split = {
            let page = ctx.page_mut(parent_pos);
            let mut parent = InternalNode::<_, K>::view(page.data_mut());
            let left_index = parent
                .index_of_child(left_pid)
                .expect("left child under its parent");
            parent.insert_at(left_index + 1, &separator, right_pid);
            parent.size() > parent.max_size()
        };
        ctx.page_mut(parent_pos).dirty = true;
        if !needs_split {
            return Ok(());
        }

        let (new_pid, new_frame) = self.pool.new_page()?;
        let (grand_pid, new_separator, moved_children) = {
            let mut new_guard = new_frame.write_data();
            let page = ctx.page_mut(parent_pos);
            let mut parent = InternalNode::<_, K>::view(page.data_mut());
            let mut new_node = InternalNode::<_, K>::init(
                &mut (**new_guard)[..],
                new_pid,
                parent.parent(),
                self.internal_max_size,
            );

            let split_at = (parent.size() + 1) / 2;
            let new_separator = parent.key_at(split_at);
            parent.split_into(&mut new_node, split_at);
            let moved: Vec<PageId> = (0..new_node.size()).map(|i| new_node.child_at(i)).collect();

            (parent.parent(), new_separator, moved)
        };
        self.pool.unpin_page(new_pid, true);
        for child in moved_children {
            self.set_parent(ctx, child, new_pid)?;
        }

        debug!("internal {} split, new sibling {}", parent_pid, new_pid);
        self.insert_into_parent(ctx, grand_pid, parent_pid, new_separator, new_pid)
    }

    /// Rewrites a node's parent pointer, through the context when the page
    /// is latched by this operation and through a brief latch otherwise.
    fn set_parent<'a>(
        &'a self,
        ctx: &mut LatchContext<'a>,
        page_id: PageId,
        parent: PageId,
    ) -> Result<()> {
        if let Some(pos) = ctx.position(page_id) {
            let page = ctx.page_mut(pos);
            set_node_parent(page.data_mut(), parent);
            page.dirty = true;
            return Ok(());
        }
        let frame = self.pool.fetch_page(page_id)?;
        {
            let mut guard = frame.write_data();
            set_node_parent(&mut (**guard)[..], parent);
        }
        self.pool.unpin_page(page_id, true);
        Ok(())
    }

    /// Removes a key. Absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut ctx = LatchContext::new(self.pool.as_ref());
        if !self.find_leaf(key, AccessMode::Delete, &mut ctx)? {
            return Ok(());
        }

        let leaf_pos = ctx.len() - 1;
        let found = {
            let leaf = LeafNode::<_, K, V>::view(ctx.last().data());
            leaf.search(&self.comparator, key).ok()
        };
        let Some(index) = found else {
            ctx.release_all();
            return Ok(());
        };

        let (leaf_pid, parent_pid, new_size) = {
            let page = ctx.last_mut();
            let mut leaf = LeafNode::<_, K, V>::view(page.data_mut());
            leaf.remove_at(index);
            (leaf.page_id(), leaf.parent(), leaf.size())
        };
        ctx.last_mut().dirty = true;

        if !parent_pid.is_valid() {
            // The leaf is the root; deleting its last pair empties the tree.
            if new_size == 0 {
                self.publish_root(PageId::INVALID)?;
                ctx.schedule_delete(leaf_pid);
                debug!("tree {} emptied", self.name);
            }
            ctx.release_all();
            return Ok(());
        }

        if new_size < self.leaf_min_size() {
            self.coalesce_or_redistribute(&mut ctx, leaf_pos)?;
            self.adjust_root(&mut ctx)?;
        }
        ctx.release_all();
        Ok(())
    }

    /// Fixes an underfull node by borrowing from or merging with a sibling,
    /// recursing into the parent when a merge leaves it underfull too.
    ///
    /// On entry the node is the deepest latched page and its parent sits
    /// directly above it in the context. A merge releases the node and the
    /// sibling; a redistribution releases only the sibling.
    fn coalesce_or_redistribute<'a>(
        &'a self,
        ctx: &mut LatchContext<'a>,
        node_pos: usize,
    ) -> Result<()> {
        debug_assert!(node_pos >= 1, "underfull non-root keeps its parent latched");
        debug_assert_eq!(node_pos, ctx.len() - 1);
        let parent_pos = node_pos - 1;
        let node_pid = ctx.page(node_pos).page_id;

        let (node_index, sibling_pid, sibling_is_left) = {
            let parent = InternalNode::<_, K>::view(ctx.page(parent_pos).data());
            let index = parent
                .index_of_child(node_pid)
                .expect("node under its parent");
            if index > 0 {
                (index, parent.child_at(index - 1), true)
            } else {
                (index, parent.child_at(index + 1), false)
            }
        };

        // Sibling latches are taken in ascending page-id order between
        // symmetric deletes: when the sibling sorts first, step off the
        // node (keeping its pin) and re-latch it afterwards.
        let sibling_frame = self.pool.fetch_page(sibling_pid)?;
        if sibling_pid < node_pid {
            ctx.page_mut(node_pos).unlatch();
            let guard = sibling_frame.write_data();
            ctx.page_mut(node_pos).relatch_write();
            ctx.push_latched_write(sibling_pid, sibling_frame, guard);
        } else {
            let guard = sibling_frame.write_data();
            ctx.push_latched_write(sibling_pid, sibling_frame, guard);
        }
        let sibling_pos = ctx.len() - 1;

        let node_is_leaf = node_kind(ctx.page(node_pos).data()) == NodeKind::Leaf;
        let sibling_size = node_size(ctx.page(sibling_pos).data());
        let min_size = if node_is_leaf {
            self.leaf_min_size()
        } else {
            self.internal_min_size()
        };

        // A concurrent insert may have refilled the node through the
        // latch gap opened for page-id ordering; nothing to fix then.
        if node_size(ctx.page(node_pos).data()) >= min_size {
            ctx.pop_release(); // sibling
            return Ok(());
        }

        if sibling_size > min_size {
            if node_is_leaf {
                self.redistribute_leaf(ctx, parent_pos, node_pos, sibling_pos, node_index, sibling_is_left);
            } else {
                self.redistribute_internal(ctx, parent_pos, node_pos, sibling_pos, node_index, sibling_is_left)?;
            }
            ctx.pop_release(); // sibling
            return Ok(());
        }

        if node_is_leaf {
            self.coalesce_leaf(ctx, parent_pos, node_pos, sibling_pos, node_index, sibling_is_left);
        } else {
            self.coalesce_internal(ctx, parent_pos, node_pos, sibling_pos, node_index, sibling_is_left)?;
        }
        ctx.pop_release(); // sibling
        ctx.pop_release(); // node

        let (parent_is_root, parent_size) = {
            let data = ctx.page(parent_pos).data();
            (!node_parent(data).is_valid(), node_size(data))
        };
        if !parent_is_root && parent_size < self.internal_min_size() {
            self.coalesce_or_redistribute(ctx, parent_pos)?;
        }
        Ok(())
    }

    fn redistribute_leaf(
        &self,
        ctx: &mut LatchContext<'_>,
        parent_pos: usize,
        node_pos: usize,
        sibling_pos: usize,
        node_index: usize,
        sibling_is_left: bool,
    ) {
        if sibling_is_left {
            // Move the left sibling's last pair to the node's front.
            let (key, value) = {
                let page = ctx.page_mut(sibling_pos);
                let mut sibling = LeafNode::<_, K, V>::view(page.data_mut());
                let last = sibling.size() - 1;
                let pair = (sibling.key_at(last), sibling.value_at(last));
                sibling.remove_at(last);
                pair
            };
            ctx.page_mut(sibling_pos).dirty = true;
            {
                let page = ctx.page_mut(node_pos);
                let mut node = LeafNode::<_, K, V>::view(page.data_mut());
                node.insert_at(0, &key, &value);
            }
            ctx.page_mut(node_pos).dirty = true;
            {
                let page = ctx.page_mut(parent_pos);
                let mut parent = InternalNode::<_, K>::view(page.data_mut());
                parent.set_key_at(node_index, &key);
            }
            ctx.page_mut(parent_pos).dirty = true;
        } else {
            // Move the right sibling's first pair to the node's end.
            let (key, value, new_separator) = {
                let page = ctx.page_mut(sibling_pos);
                let mut sibling = LeafNode::<_, K, V>::view(page.data_mut());
                let pair = (sibling.key_at(0), sibling.value_at(0));
                sibling.remove_at(0);
                (pair.0, pair.1, sibling.key_at(0))
            };
            ctx.page_mut(sibling_pos).dirty = true;
            {
                let page = ctx.page_mut(node_pos);
                let mut node = LeafNode::<_, K, V>::view(page.data_mut());
                node.append(&key, &value);
            }
            ctx.page_mut(node_pos).dirty = true;
            {
                let page = ctx.page_mut(parent_pos);
                let mut parent = InternalNode::<_, K>::view(page.data_mut());
                parent.set_key_at(node_index + 1, &new_separator);
            }
            ctx.page_mut(parent_pos).dirty = true;
        }
    }

    fn coalesce_leaf(
        &self,
        ctx: &mut LatchContext<'_>,
        parent_pos: usize,
        node_pos: usize,
        sibling_pos: usize,
        node_index: usize,
        sibling_is_left: bool,
    ) {
        // Merge rightward pages into their left neighbour so the leaf
        // chain only ever loses its tail end.
        let (survivor_pos, absorbed_pos, separator_index) = if sibling_is_left {
            (sibling_pos, node_pos, node_index)
        } else {
            (node_pos, sibling_pos, node_index + 1)
        };
        let absorbed_pid = ctx.page(absorbed_pos).page_id;

        let (entries, absorbed_next) = {
            let absorbed = LeafNode::<_, K, V>::view(ctx.page(absorbed_pos).data());
            let entries: Vec<(K, V)> = (0..absorbed.size())
                .map(|i| (absorbed.key_at(i), absorbed.value_at(i)))
                .collect();
            (entries, absorbed.next_leaf())
        };
        {
            let page = ctx.page_mut(survivor_pos);
            let mut survivor = LeafNode::<_, K, V>::view(page.data_mut());
            for (key, value) in &entries {
                survivor.append(key, value);
            }
            survivor.set_next_leaf(absorbed_next);
        }
        ctx.page_mut(survivor_pos).dirty = true;
        {
            let page = ctx.page_mut(parent_pos);
            let mut parent = InternalNode::<_, K>::view(page.data_mut());
            parent.remove_at(separator_index);
        }
        ctx.page_mut(parent_pos).dirty = true;
        ctx.schedule_delete(absorbed_pid);
        debug!("leaf {} merged away", absorbed_pid);
    }

    fn redistribute_internal<'a>(
        &'a self,
        ctx: &mut LatchContext<'a>,
        parent_pos: usize,
        node_pos: usize,
        sibling_pos: usize,
        node_index: usize,
        sibling_is_left: bool,
    ) -> Result<()> {
        let node_pid = ctx.page(node_pos).page_id;
        if sibling_is_left {
            // Rotate the left sibling's last child through the parent.
            let (borrowed_key, borrowed_child) = {
                let page = ctx.page_mut(sibling_pos);
                let mut sibling = InternalNode::<_, K>::view(page.data_mut());
                let last = sibling.size() - 1;
                let slot = (sibling.key_at(last), sibling.child_at(last));
                sibling.remove_at(last);
                slot
            };
            ctx.page_mut(sibling_pos).dirty = true;
            let old_separator = {
                let parent = InternalNode::<_, K>::view(ctx.page(parent_pos).data());
                parent.key_at(node_index)
            };
            {
                let page = ctx.page_mut(node_pos);
                let mut node = InternalNode::<_, K>::view(page.data_mut());
                let first_child = node.child_at(0);
                node.insert_at(1, &old_separator, first_child);
                node.set_child_at(0, borrowed_child);
            }
            ctx.page_mut(node_pos).dirty = true;
            {
                let page = ctx.page_mut(parent_pos);
                let mut parent = InternalNode::<_, K>::view(page.data_mut());
                parent.set_key_at(node_index, &borrowed_key);
            }
            ctx.page_mut(parent_pos).dirty = true;
            self.set_parent(ctx, borrowed_child, node_pid)
        } else {
            // Rotate the right sibling's first child through the parent.
            let separator = {
                let parent = InternalNode::<_, K>::view(ctx.page(parent_pos).data());
                parent.key_at(node_index + 1)
            };
            let (moved_child, new_separator) = {
                let page = ctx.page_mut(sibling_pos);
                let mut sibling = InternalNode::<_, K>::view(page.data_mut());
                let moved = sibling.child_at(0);
                let new_separator = sibling.key_at(1);
                sibling.remove_at(0);
                (moved, new_separator)
            };
            ctx.page_mut(sibling_pos).dirty = true;
            {
                let page = ctx.page_mut(node_pos);
                let mut node = InternalNode::<_, K>::view(page.data_mut());
                node.append(&separator, moved_child);
            }
            ctx.page_mut(node_pos).dirty = true;
            {
                let page = ctx.page_mut(parent_pos);
                let mut parent = InternalNode::<_, K>::view(page.data_mut());
                parent.set_key_at(node_index + 1, &new_separator);
            }
            ctx.page_mut(parent_pos).dirty = true;
            self.set_parent(ctx, moved_child, node_pid)
        }
    }

    fn coalesce_internal<'a>(
        &'a self,
        ctx: &mut LatchContext<'a>,
        parent_pos: usize,
        node_pos: usize,
        sibling_pos: usize,
        node_index: usize,
        sibling_is_left: bool,
    ) -> Result<()> {
        let (survivor_pos, absorbed_pos, separator_index) = if sibling_is_left {
            (sibling_pos, node_pos, node_index)
        } else {
            (node_pos, sibling_pos, node_index + 1)
        };
        let survivor_pid = ctx.page(survivor_pos).page_id;
        let absorbed_pid = ctx.page(absorbed_pos).page_id;

        // The separator between the two pages moves down into the merge.
        let separator = {
            let parent = InternalNode::<_, K>::view(ctx.page(parent_pos).data());
            parent.key_at(separator_index)
        };
        let slots: Vec<(Option<K>, PageId)> = {
            let absorbed = InternalNode::<_, K>::view(ctx.page(absorbed_pos).data());
            (0..absorbed.size())
                .map(|i| {
                    let key = if i == 0 { None } else { Some(absorbed.key_at(i)) };
                    (key, absorbed.child_at(i))
                })
                .collect()
        };
        {
            let page = ctx.page_mut(survivor_pos);
            let mut survivor = InternalNode::<_, K>::view(page.data_mut());
            for (key, child) in &slots {
                match key {
                    None => survivor.append(&separator, *child),
                    Some(key) => survivor.append(key, *child),
                }
            }
        }
        ctx.page_mut(survivor_pos).dirty = true;
        {
            let page = ctx.page_mut(parent_pos);
            let mut parent = InternalNode::<_, K>::view(page.data_mut());
            parent.remove_at(separator_index);
        }
        ctx.page_mut(parent_pos).dirty = true;
        for (_, child) in &slots {
            self.set_parent(ctx, *child, survivor_pid)?;
        }
        ctx.schedule_delete(absorbed_pid);
        debug!("internal {} merged away", absorbed_pid);
        Ok(())
    }

    /// Collapses a root that is down to a single child, promoting the child.
    fn adjust_root<'a>(&'a self, ctx: &mut LatchContext<'a>) -> Result<()> {
        let root_pid = self.root.lock().page_id;
        let Some(pos) = ctx.position(root_pid) else {
            return Ok(());
        };

        let only_child = {
            let data = ctx.page(pos).data();
            match node_kind(data) {
                NodeKind::Internal => {
                    let node = InternalNode::<_, K>::view(data);
                    (node.size() == 1).then(|| node.child_at(0))
                }
                NodeKind::Leaf => None,
            }
        };
        if let Some(child) = only_child {
            self.set_parent(ctx, child, PageId::INVALID)?;
            self.publish_root(child)?;
            ctx.schedule_delete(root_pid);
            debug!("root collapsed into {}", child);
        }
        Ok(())
    }

    /// Publishes a root change: updates the in-memory pointer and mirrors
    /// it onto the header page. The root mutex is held across the header
    /// write so publications cannot interleave.
    fn publish_root(&self, new_root: PageId) -> Result<()> {
        let mut root = self.root.lock();
        root.page_id = new_root;
        let first_publication = !root.published;
        root.published = true;
        self.write_root_record(new_root, first_publication)
    }

    fn write_root_record(&self, root_pid: PageId, insert_new: bool) -> Result<()> {
        let frame = self.pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = frame.write_data();
            let mut header = HeaderView::new(&mut (**guard)[..]);
            if insert_new {
                let inserted = header.insert_record(&self.name, root_pid);
                debug_assert!(inserted, "header page out of record space");
            } else {
                let updated = header.update_record(&self.name, root_pid);
                debug_assert!(updated, "root record vanished from header page");
            }
        }
        self.pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    /// Iterator over the whole tree in key order.
    pub fn iter(&self) -> Result<TreeIterator<'_, K, V>> {
        self.make_iterator(None)
    }

    /// Iterator starting at the first pair with key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<'_, K, V>> {
        self.make_iterator(Some(key))
    }

    /// The past-the-end sentinel.
    pub fn end(&self) -> TreeIterator<'_, K, V> {
        TreeIterator::end(self.pool.as_ref())
    }

    fn make_iterator(&self, key: Option<&K>) -> Result<TreeIterator<'_, K, V>> {
        match self.locate_first_slot(key)? {
            Some((page_id, slot)) => TreeIterator::new(self.pool.as_ref(), page_id, slot),
            None => Ok(self.end()),
        }
    }

    /// Finds the leaf slot an iteration should start from.
    fn locate_first_slot(&self, key: Option<&K>) -> Result<Option<(PageId, usize)>> {
        let root_pid = self.root.lock().page_id;
        if !root_pid.is_valid() {
            return Ok(None);
        }

        let mut page_id = root_pid;
        loop {
            let frame = self.pool.fetch_page(page_id)?;
            let next = {
                let guard = frame.read_data();
                let data = &(**guard)[..];
                match node_kind(data) {
                    NodeKind::Internal => {
                        let node = InternalNode::<_, K>::view(data);
                        let index = match key {
                            Some(key) => node.lookup_child(&self.comparator, key),
                            None => 0,
                        };
                        Some(node.child_at(index))
                    }
                    NodeKind::Leaf => None,
                }
            };
            self.pool.unpin_page(page_id, false);
            match next {
                Some(child) => page_id = child,
                None => break,
            }
        }

        // Find the first qualifying slot, crossing into the next leaf when
        // the key sorts past every entry here.
        loop {
            let frame = self.pool.fetch_page(page_id)?;
            let (slot, next) = {
                let guard = frame.read_data();
                let leaf = LeafNode::<_, K, V>::view(&(**guard)[..]);
                let slot = match key {
                    Some(key) => leaf.lower_bound(&self.comparator, key),
                    None => 0,
                };
                if slot < leaf.size() {
                    (Some(slot), PageId::INVALID)
                } else {
                    (None, leaf.next_leaf())
                }
            };
            self.pool.unpin_page(page_id, false);
            match slot {
                Some(slot) => return Ok(Some((page_id, slot))),
                None => {
                    if !next.is_valid() {
                        return Ok(None);
                    }
                    page_id = next;
                }
            }
        }
    }
}
