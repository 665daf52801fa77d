//! Intrusive LRU list for the RECENT tier

use crate::chunk::{ChunkArena, ChunkId, LinkIndex};

/// Doubly-linked recency list threaded through chunk links. The most
/// recently enqueued chunk sits at the head; eviction consumes from the
/// tail.
#[derive(Debug)]
pub struct LruList {
    head: Option<ChunkId>,
    tail: Option<ChunkId>,
    link: LinkIndex,
    len: usize,
}

impl LruList {
    pub fn new(link: LinkIndex) -> Self {
        Self {
            head: None,
            tail: None,
            link,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Most recently enqueued chunk.
    pub fn front(&self) -> Option<ChunkId> {
        self.head
    }

    /// Least recently enqueued chunk.
    pub fn back(&self) -> Option<ChunkId> {
        self.tail
    }

    pub fn push_front(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        debug_assert!(
            arena.chunk(id).links(self.link).is_clear(),
            "inserting a chunk that is already enqueued"
        );
        arena.chunk_mut(id).links_mut(self.link).next = self.head;
        if let Some(head) = self.head {
            arena.chunk_mut(head).links_mut(self.link).prev = Some(id);
        } else {
            self.tail = Some(id);
        }
        self.head = Some(id);
        self.len += 1;
    }

    pub fn remove(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        let links = *arena.chunk(id).links(self.link);
        match links.prev {
            Some(prev) => arena.chunk_mut(prev).links_mut(self.link).next = links.next,
            None => {
                debug_assert_eq!(self.head, Some(id), "removing a chunk that is not listed");
                self.head = links.next;
            }
        }
        match links.next {
            Some(next) => arena.chunk_mut(next).links_mut(self.link).prev = links.prev,
            None => {
                debug_assert_eq!(self.tail, Some(id), "removing a chunk that is not listed");
                self.tail = links.prev;
            }
        }
        *arena.chunk_mut(id).links_mut(self.link) = Default::default();
        self.len -= 1;
    }

    /// Member ids from most to least recent.
    pub fn collect(&self, arena: &ChunkArena) -> Vec<ChunkId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = arena.chunk(id).links(self.link).next;
        }
        out
    }
}
