//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use log::trace;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as evictable or pinned-down.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame for eviction and forgets its state.
    ///
    /// Returns None if no frames are evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Removes an evictable frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU-K replacement policy.
///
/// Evicts the frame with the largest backward k-distance: the difference
/// between the current timestamp and the k-th most recent access. Frames
/// with fewer than K recorded accesses have infinite distance and are
/// preferred, classic-LRU ordered by their oldest access.
pub struct LruKReplacer {
    /// Number of frames the replacer may track.
    num_frames: usize,
    /// The K in LRU-K.
    k: usize,
    /// Internal state protected by a mutex.
    state: Mutex<ReplacerState>,
}

struct ReplacerState {
    /// Access history and evictability per tracked frame.
    store: HashMap<FrameId, LruKNode>,
    /// Logical clock, bumped on every recorded access.
    current_ts: u64,
    /// Count of tracked frames currently evictable.
    evictable_count: usize,
}

struct LruKNode {
    /// Up to K access timestamps, oldest first.
    history: VecDeque<u64>,
    evictable: bool,
}

impl LruKReplacer {
    /// Creates a replacer tracking up to `num_frames` frames with parameter `k`.
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "k must be > 0");
        Self {
            num_frames,
            k,
            state: Mutex::new(ReplacerState {
                store: HashMap::new(),
                current_ts: 0,
                evictable_count: 0,
            }),
        }
    }

    fn assert_in_range(&self, frame_id: FrameId) {
        assert!(
            (frame_id.0 as usize) < self.num_frames,
            "frame id {} out of range for replacer of {} frames",
            frame_id,
            self.num_frames
        );
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&self, frame_id: FrameId) {
        self.assert_in_range(frame_id);
        let mut state = self.state.lock();

        let ts = state.current_ts;
        let node = state.store.entry(frame_id).or_insert_with(|| LruKNode {
            history: VecDeque::new(),
            evictable: false,
        });
        node.history.push_back(ts);
        if node.history.len() > self.k {
            node.history.pop_front();
        }
        state.current_ts += 1;
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.assert_in_range(frame_id);
        let mut state = self.state.lock();

        let Some(node) = state.store.get_mut(&frame_id) else {
            return;
        };
        if node.evictable == evictable {
            return;
        }
        node.evictable = evictable;
        if evictable {
            state.evictable_count += 1;
        } else {
            state.evictable_count -= 1;
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();

        if state.evictable_count == 0 {
            return None;
        }

        let now = state.current_ts;
        let mut victim: Option<FrameId> = None;
        let mut victim_inf = false;
        // For +inf candidates this holds the earliest first access; for
        // finite candidates it holds the largest backward k-distance.
        let mut victim_rank = 0u64;

        for (&fid, node) in state.store.iter() {
            if !node.evictable {
                continue;
            }
            let oldest = *node.history.front().expect("tracked frame has history");
            if node.history.len() < self.k {
                // Infinite distance: prefer the earliest-accessed frame.
                if !victim_inf || oldest < victim_rank {
                    victim = Some(fid);
                    victim_inf = true;
                    victim_rank = oldest;
                }
            } else if !victim_inf {
                let distance = now - oldest;
                if victim.is_none() || distance > victim_rank {
                    victim = Some(fid);
                    victim_rank = distance;
                }
            }
        }

        let fid = victim?;
        state.store.remove(&fid);
        state.evictable_count -= 1;
        trace!("replacer evicting {}", fid);
        Some(fid)
    }

    fn remove(&self, frame_id: FrameId) {
        self.assert_in_range(frame_id);
        let mut state = self.state.lock();

        let Some(node) = state.store.get(&frame_id) else {
            return;
        };
        assert!(
            node.evictable,
            "cannot remove non-evictable frame {}",
            frame_id
        );
        state.store.remove(&frame_id);
        state.evictable_count -= 1;
    }

    fn size(&self) -> usize {
        self.state.lock().evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_all(replacer: &LruKReplacer, ids: &[u32]) {
        for &id in ids {
            replacer.record_access(FrameId(id));
        }
    }

    #[test]
    fn test_lru_k_empty() {
        let replacer = LruKReplacer::new(10, 2);
        assert_eq!(replacer.size(), 0);
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_basic_evict_order() {
        let replacer = LruKReplacer::new(8, 2);

        // Frames 1 and 2 reach K accesses; 3 and 4 stay at one access and
        // keep infinite distance.
        record_all(&replacer, &[1, 2, 3, 4, 1, 2]);
        for id in 1..=4 {
            replacer.set_evictable(FrameId(id), true);
        }
        assert_eq!(replacer.size(), 4);

        // Infinite-distance frames go first in order of their single
        // access, then the finite ones by largest backward k-distance.
        assert_eq!(replacer.evict(), Some(FrameId(3)));
        assert_eq!(replacer.evict(), Some(FrameId(4)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert!(replacer.evict().is_none());
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k3_infinite_bucket_first() {
        let replacer = LruKReplacer::new(8, 3);

        record_all(&replacer, &[1, 2, 3, 1, 1, 2, 2]);
        for id in 1..=3 {
            replacer.set_evictable(FrameId(id), true);
        }

        // Frame 3 has one access and is still at +inf; frames 1 and 2
        // both reached K=3 and order by k-th most recent access.
        assert_eq!(replacer.evict(), Some(FrameId(3)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_k_history_bounded() {
        let replacer = LruKReplacer::new(4, 2);

        // Eight accesses to frame 1, then one to frame 2: frame 1 keeps
        // only its two most recent timestamps, so frame 2 (+inf) wins.
        record_all(&replacer, &[1, 1, 1, 1, 1, 1, 1, 1, 2]);
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(2), true);

        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
    }

    #[test]
    fn test_lru_k_non_evictable_skipped() {
        let replacer = LruKReplacer::new(4, 2);

        record_all(&replacer, &[1, 2, 1, 2]);
        replacer.set_evictable(FrameId(1), true);
        // Frame 2 stays pinned

        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_set_evictable_idempotent() {
        let replacer = LruKReplacer::new(4, 2);

        replacer.record_access(FrameId(1));
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId(1), false);
        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_set_evictable_untracked_is_noop() {
        let replacer = LruKReplacer::new(4, 2);

        replacer.set_evictable(FrameId(3), true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_remove() {
        let replacer = LruKReplacer::new(4, 2);

        record_all(&replacer, &[1, 2]);
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(2), true);

        replacer.remove(FrameId(1));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_k_remove_untracked_is_silent() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.remove(FrameId(3));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    #[should_panic(expected = "non-evictable")]
    fn test_lru_k_remove_pinned_panics() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(FrameId(1));
        replacer.remove(FrameId(1));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_lru_k_record_out_of_range_panics() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(FrameId(100));
    }

    #[test]
    fn test_lru_k_evict_forgets_history() {
        let replacer = LruKReplacer::new(4, 2);

        record_all(&replacer, &[1, 1, 2]);
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(2), true);

        // Frame 2 is +inf, goes first despite frame 1's older history
        assert_eq!(replacer.evict(), Some(FrameId(2)));

        // Re-tracked frame starts over with infinite distance
        replacer.record_access(FrameId(2));
        replacer.set_evictable(FrameId(2), true);
        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
    }
}
