//! Tiered chunk priority queue
//!
//! One queue per lifecycle stage: two pairing heaps for the ordered tiers
//! (VISIBLE, PREFETCH) plus an LRU list for RECENT. The polarity decides
//! both the heap order and the direction candidates are surfaced in:
//!
//! - Eviction: RECENT tail first, then the PREFETCH minimum, then the
//!   VISIBLE minimum. A visible chunk is never surfaced while anything
//!   less important is still enqueued.
//! - Promotion: VISIBLE maximum first, then PREFETCH, then the RECENT head.

use crate::chunk::{ChunkArena, ChunkId, LinkIndex, PriorityTier};

use super::heap::{HeapOrder, PairingHeap};
use super::lru::LruList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolarity {
    Eviction,
    Promotion,
}

#[derive(Debug)]
pub struct ChunkPriorityQueue {
    visible: PairingHeap,
    prefetch: PairingHeap,
    recent: LruList,
    polarity: QueuePolarity,
    len: usize,
}

impl ChunkPriorityQueue {
    pub fn new(link: LinkIndex, polarity: QueuePolarity) -> Self {
        let order = match polarity {
            QueuePolarity::Eviction => HeapOrder::MinFirst,
            QueuePolarity::Promotion => HeapOrder::MaxFirst,
        };
        Self {
            visible: PairingHeap::new(link, order),
            prefetch: PairingHeap::new(link, order),
            recent: LruList::new(link),
            polarity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a chunk into the container of its current tier.
    pub fn insert(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        match arena.chunk(id).tier {
            PriorityTier::Visible => self.visible.insert(arena, id),
            PriorityTier::Prefetch => self.prefetch.insert(arena, id),
            PriorityTier::Recent => self.recent.push_front(arena, id),
        }
        self.len += 1;
    }

    /// Remove a chunk. The chunk's tier must not have changed since it was
    /// inserted.
    pub fn remove(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        match arena.chunk(id).tier {
            PriorityTier::Visible => self.visible.remove(arena, id),
            PriorityTier::Prefetch => self.prefetch.remove(arena, id),
            PriorityTier::Recent => self.recent.remove(arena, id),
        }
        self.len -= 1;
    }

    /// The next candidate in polarity order.
    ///
    /// The cursor does not remove: the caller's evict/promote path removes
    /// the chunk through its state transition, after which the next call
    /// surfaces the following candidate.
    pub fn peek(&self, _arena: &ChunkArena) -> Option<ChunkId> {
        match self.polarity {
            QueuePolarity::Eviction => self
                .recent
                .back()
                .or_else(|| self.prefetch.peek())
                .or_else(|| self.visible.peek()),
            QueuePolarity::Promotion => self
                .visible
                .peek()
                .or_else(|| self.prefetch.peek())
                .or_else(|| self.recent.front()),
        }
    }

    /// All member ids, in no particular order.
    pub fn collect(&self, arena: &ChunkArena) -> Vec<ChunkId> {
        let mut out = self.visible.collect(arena);
        out.extend(self.prefetch.collect(arena));
        out.extend(self.recent.collect(arena));
        out
    }
}
