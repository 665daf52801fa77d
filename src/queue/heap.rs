//! Intrusive pairing heap over the chunk arena
//!
//! Heap nodes are the chunks themselves: `child` points at the first child,
//! `next`/`prev` form the sibling list, and `prev` of a first child points
//! back at its parent. Meld is O(1); removal combines the node's children
//! with the standard two-pass pairing and melds them back into the root.

use crate::chunk::{ChunkArena, ChunkId, LinkIndex};

/// Which priority surfaces at the root.
///
/// Eviction queues want the least important chunk first (`MinFirst`);
/// promotion queues want the most important first (`MaxFirst`). Ties break
/// differently on purpose: eviction surfaces the most recently inserted
/// equal-priority chunk, promotion the least recently inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapOrder {
    MinFirst,
    MaxFirst,
}

#[derive(Debug)]
pub struct PairingHeap {
    root: Option<ChunkId>,
    link: LinkIndex,
    order: HeapOrder,
}

impl PairingHeap {
    pub fn new(link: LinkIndex, order: HeapOrder) -> Self {
        Self {
            root: None,
            link,
            order,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The chunk at the root: minimum priority for `MinFirst`, maximum for
    /// `MaxFirst`.
    pub fn peek(&self) -> Option<ChunkId> {
        self.root
    }

    /// Whether `a` belongs above `b`.
    fn before(&self, arena: &ChunkArena, a: ChunkId, b: ChunkId) -> bool {
        let pa = arena.chunk(a).priority;
        let pb = arena.chunk(b).priority;
        match self.order {
            HeapOrder::MinFirst => pa <= pb,
            HeapOrder::MaxFirst => pa > pb,
        }
    }

    /// Meld two heap roots, returning the new root. O(1).
    fn meld(&self, arena: &mut ChunkArena, a: ChunkId, b: ChunkId) -> ChunkId {
        let (winner, loser) = if self.before(arena, b, a) {
            (b, a)
        } else {
            (a, b)
        };
        // Attach the loser as the winner's first child.
        let first_child = arena.chunk(winner).links(self.link).child;
        {
            let links = arena.chunk_mut(loser).links_mut(self.link);
            links.prev = Some(winner);
            links.next = first_child;
        }
        if let Some(child) = first_child {
            arena.chunk_mut(child).links_mut(self.link).prev = Some(loser);
        }
        arena.chunk_mut(winner).links_mut(self.link).child = Some(loser);
        winner
    }

    pub fn insert(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        debug_assert!(
            arena.chunk(id).links(self.link).is_clear(),
            "inserting a chunk that is already enqueued"
        );
        self.root = Some(match self.root {
            None => id,
            Some(root) => self.meld(arena, root, id),
        });
    }

    /// Remove an arbitrary chunk from the heap. Panics if the chunk is not a
    /// member.
    pub fn remove(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        if self.root == Some(id) {
            let child = arena.chunk(id).links(self.link).child;
            *arena.chunk_mut(id).links_mut(self.link) = Default::default();
            self.root = self.combine_children(arena, child);
            return;
        }

        // Cut the node out of its sibling list. `prev` is the parent when
        // the node is a first child.
        let links = *arena.chunk(id).links(self.link);
        let prev = links
            .prev
            .expect("removing a chunk that is not in this heap");
        if arena.chunk(prev).links(self.link).child == Some(id) {
            arena.chunk_mut(prev).links_mut(self.link).child = links.next;
        } else {
            arena.chunk_mut(prev).links_mut(self.link).next = links.next;
        }
        if let Some(next) = links.next {
            arena.chunk_mut(next).links_mut(self.link).prev = links.prev;
        }
        *arena.chunk_mut(id).links_mut(self.link) = Default::default();

        // The node's own children rejoin the heap through the root.
        if let Some(subtree) = self.combine_children(arena, links.child) {
            let root = self.root.expect("non-root removal from an empty heap");
            self.root = Some(self.meld(arena, root, subtree));
        }
    }

    /// Remove and return the root.
    pub fn pop(&mut self, arena: &mut ChunkArena) -> Option<ChunkId> {
        let root = self.root?;
        self.remove(arena, root);
        Some(root)
    }

    /// Two-pass pairing combine of a child list.
    fn combine_children(
        &self,
        arena: &mut ChunkArena,
        first: Option<ChunkId>,
    ) -> Option<ChunkId> {
        let mut children = Vec::new();
        let mut cursor = first;
        while let Some(id) = cursor {
            cursor = arena.chunk(id).links(self.link).next;
            let links = arena.chunk_mut(id).links_mut(self.link);
            links.next = None;
            links.prev = None;
            children.push(id);
        }
        if children.is_empty() {
            return None;
        }

        // Pass 1: meld adjacent pairs left to right.
        let mut merged = Vec::with_capacity(children.len().div_ceil(2));
        let mut i = 0;
        while i + 1 < children.len() {
            merged.push(self.meld(arena, children[i], children[i + 1]));
            i += 2;
        }
        if i < children.len() {
            merged.push(children[i]);
        }

        // Pass 2: fold right to left.
        let mut root = merged.pop().expect("merged list is non-empty");
        while let Some(heap) = merged.pop() {
            root = self.meld(arena, heap, root);
        }
        Some(root)
    }

    /// All member ids, in no particular order.
    pub fn collect(&self, arena: &ChunkArena) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let mut stack: Vec<ChunkId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            let links = arena.chunk(id).links(self.link);
            if let Some(child) = links.child {
                stack.push(child);
            }
            if self.root != Some(id) {
                if let Some(next) = links.next {
                    stack.push(next);
                }
            }
        }
        out
    }
}
