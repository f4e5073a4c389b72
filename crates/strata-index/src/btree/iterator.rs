//! Forward iterator over the B+ tree leaf chain.

use super::page::LeafNode;
use super::types::{IndexKey, IndexValue};
use log::debug;
use std::marker::PhantomData;
use strata_buffer::{BufferPoolManager, Frame};
use strata_common::page::PageId;
use strata_common::Result;

/// Forward-only cursor walking the leaf chain in key order.
///
/// The iterator pins exactly one leaf at a time; each step briefly takes
/// that leaf's read latch to decode the current pair. Advancing past the
/// last pair of a leaf unpins it and pins its chain successor. The end
/// sentinel holds no page; position equality is `(page, slot)`.
pub struct TreeIterator<'a, K, V> {
    pool: &'a BufferPoolManager,
    frame: Option<&'a Frame>,
    page_id: PageId,
    slot: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K, V> TreeIterator<'a, K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    /// Pins `page_id` and positions the cursor on `slot`.
    pub(crate) fn new(pool: &'a BufferPoolManager, page_id: PageId, slot: usize) -> Result<Self> {
        let frame = pool.fetch_page(page_id)?;
        Ok(Self {
            pool,
            frame: Some(frame),
            page_id,
            slot,
            _marker: PhantomData,
        })
    }

    /// The past-the-end sentinel.
    pub(crate) fn end(pool: &'a BufferPoolManager) -> Self {
        Self {
            pool,
            frame: None,
            page_id: PageId::INVALID,
            slot: 0,
            _marker: PhantomData,
        }
    }

    /// True once the cursor has moved past the last pair.
    pub fn is_end(&self) -> bool {
        !self.page_id.is_valid()
    }
}

enum Step<K, V> {
    Yield(K, V),
    Advance(PageId),
}

impl<K, V> Iterator for TreeIterator<'_, K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if !self.page_id.is_valid() {
                return None;
            }
            let frame = self.frame?;

            let step = {
                let guard = frame.read_data();
                let leaf = LeafNode::<_, K, V>::view(&(**guard)[..]);
                if self.slot < leaf.size() {
                    Step::Yield(leaf.key_at(self.slot), leaf.value_at(self.slot))
                } else {
                    Step::Advance(leaf.next_leaf())
                }
            };

            match step {
                Step::Yield(key, value) => {
                    self.slot += 1;
                    return Some((key, value));
                }
                Step::Advance(next) => {
                    self.pool.unpin_page(self.page_id, false);
                    self.page_id = PageId::INVALID;
                    self.frame = None;
                    self.slot = 0;
                    if !next.is_valid() {
                        return None;
                    }
                    match self.pool.fetch_page(next) {
                        Ok(frame) => {
                            self.page_id = next;
                            self.frame = Some(frame);
                        }
                        Err(err) => {
                            debug!("iterator stopped at {}: {}", next, err);
                            return None;
                        }
                    }
                }
            }
        }
    }
}

impl<K, V> PartialEq for TreeIterator<'_, K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.slot == other.slot
    }
}

impl<K, V> Drop for TreeIterator<'_, K, V> {
    fn drop(&mut self) {
        if self.page_id.is_valid() {
            self.pool.unpin_page(self.page_id, false);
        }
    }
}
