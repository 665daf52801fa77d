//! Chunk identity, state and intrusive queue links
//!
//! A chunk is one fixed-granularity unit of remote data, identified by
//! `(SourceId, ChunkKey)`. Chunks live in an arena owned by the worker-side
//! queue manager; queues and source key-maps refer to them by [`ChunkId`]
//! rather than by reference, which breaks the Chunk <-> Source <-> queue
//! ownership cycle.

pub mod source;

pub use source::{ChunkCost, ChunkPayload, ChunkSource, SourceStats, TierStat};

use tokio_util::sync::CancellationToken;

use crate::core::error::DownloadError;

/// Grid position of a chunk within its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ChunkKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Identifier of a registered chunk source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SourceId(pub u32);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source{}", self.0)
    }
}

/// Stable arena index of a chunk. Slots are reused through a free-list, so a
/// `ChunkId` is only meaningful while the chunk is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(pub(crate) u32);

/// Coarse priority class. Lower rank = more important.
///
/// `Recent` is special: chunks in that tier are not currently requested by
/// any layer and are kept only so that re-requesting them is free. They are
/// ordered by recency instead of by priority scalar.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum PriorityTier {
    Visible = 0,
    Prefetch = 1,
    Recent = 2,
}

pub const TIER_COUNT: usize = 3;

impl PriorityTier {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChunkState {
    /// Constructed but never requested.
    New,
    /// Requested, waiting for a download (or compute) slot.
    Queued,
    /// Download in flight; the chunk holds a live cancellation token.
    Downloading,
    /// Download or decode failed; the error payload is retained.
    Failed,
    /// Decoded bytes resident in worker memory.
    SystemMemoryWorker,
    /// Decoded bytes resident in main-context memory.
    SystemMemory,
    /// Uploaded to GPU memory (main context is authoritative).
    GpuMemory,
    /// Destroyed; the arena slot is about to be reused.
    Expired,
}

pub const STATE_COUNT: usize = 8;

impl ChunkState {
    pub fn index(self) -> usize {
        match self {
            ChunkState::New => 0,
            ChunkState::Queued => 1,
            ChunkState::Downloading => 2,
            ChunkState::Failed => 3,
            ChunkState::SystemMemoryWorker => 4,
            ChunkState::SystemMemory => 5,
            ChunkState::GpuMemory => 6,
            ChunkState::Expired => 7,
        }
    }

    /// Whether the state machine permits `self -> to`.
    pub fn transition_permitted(self, to: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, to),
            (New, Queued)
                | (Queued, Downloading)
                | (Queued, Expired)
                | (Downloading, SystemMemoryWorker)
                | (Downloading, Failed)
                | (Downloading, Queued)
                | (SystemMemoryWorker, SystemMemory)
                | (SystemMemoryWorker, Queued)
                | (SystemMemoryWorker, Expired)
                | (SystemMemory, GpuMemory)
                | (SystemMemory, Queued)
                | (SystemMemory, Expired)
                | (GpuMemory, SystemMemory)
                | (Failed, Queued)
        )
    }
}

/// Which of the two intrusive link triples a queue threads through.
///
/// The system-memory eviction queue contains every memory-resident chunk and
/// owns link set 0; every other queue uses link set 1. No chunk is ever in
/// two queues of the same link family at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkIndex {
    Memory = 0,
    Lifecycle = 1,
}

/// One intrusive link triple. `child` is only used by pairing heaps; the LRU
/// list uses `next`/`prev` alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkLinks {
    pub child: Option<ChunkId>,
    pub next: Option<ChunkId>,
    pub prev: Option<ChunkId>,
}

impl ChunkLinks {
    pub fn is_clear(&self) -> bool {
        self.child.is_none() && self.next.is_none() && self.prev.is_none()
    }
}

/// State-bearing chunk node.
#[derive(Debug)]
pub struct Chunk {
    pub source: SourceId,
    pub key: ChunkKey,
    pub state: ChunkState,
    pub tier: PriorityTier,
    pub priority: f32,
    /// Worker-memory footprint. Zero until the first successful download;
    /// afterwards it survives eviction as the re-download estimate.
    pub system_memory_bytes: u64,
    pub gpu_memory_bytes: u64,
    /// Download-slot cost, >= 1.
    pub download_slots: u32,
    /// Produced by a computation instead of a download; scheduled against
    /// the compute capacity.
    pub computational: bool,
    /// Requested by the worker side only; never a GPU promotion candidate.
    pub backend_only: bool,
    /// Whether the main context asked for this chunk.
    pub requested_to_frontend: bool,
    /// Error payload, present iff state == Failed.
    pub error: Option<DownloadError>,
    /// Cancellation handle, present iff state == Downloading.
    pub cancel: Option<CancellationToken>,
    /// Identity of the most recently started download. Settlements carrying
    /// a stale generation are discarded.
    pub download_generation: u64,
    /// Decoded bytes, held until the first handoff to the main context.
    pub payload: Option<Vec<u8>>,
    links: [ChunkLinks; 2],
}

impl Chunk {
    pub fn new(source: SourceId, key: ChunkKey, cost: ChunkCost) -> Self {
        Self {
            source,
            key,
            state: ChunkState::New,
            tier: PriorityTier::Recent,
            priority: f32::NEG_INFINITY,
            system_memory_bytes: cost.system_memory_bytes_estimate,
            gpu_memory_bytes: cost.gpu_memory_bytes_estimate,
            download_slots: cost.download_slots.max(1),
            computational: cost.computational,
            backend_only: false,
            requested_to_frontend: false,
            error: None,
            cancel: None,
            download_generation: 0,
            payload: None,
            links: [ChunkLinks::default(); 2],
        }
    }

    pub fn links(&self, index: LinkIndex) -> &ChunkLinks {
        &self.links[index as usize]
    }

    pub fn links_mut(&mut self, index: LinkIndex) -> &mut ChunkLinks {
        &mut self.links[index as usize]
    }
}

/// Arena of chunks with free-list slot reuse.
#[derive(Debug, Default)]
pub struct ChunkArena {
    slots: Vec<Option<Chunk>>,
    free: Vec<u32>,
}

impl ChunkArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk: Chunk) -> ChunkId {
        match self.free.pop() {
            Some(index) => {
                debug_assert!(self.slots[index as usize].is_none());
                self.slots[index as usize] = Some(chunk);
                ChunkId(index)
            }
            None => {
                self.slots.push(Some(chunk));
                ChunkId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Remove a chunk and return its slot to the free-list.
    pub fn remove(&mut self, id: ChunkId) -> Chunk {
        let chunk = self.slots[id.0 as usize]
            .take()
            .expect("removing a vacant chunk slot");
        self.free.push(id.0);
        chunk
    }

    /// Look up a live chunk. Panics if the slot is vacant; use [`Self::get`]
    /// when the id may be stale (e.g. download settlements).
    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("chunk slot is vacant")
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("chunk slot is vacant")
    }

    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
