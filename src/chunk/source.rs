//! Chunk source interface and per-source bookkeeping

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::DownloadError;

use super::{ChunkId, ChunkKey, ChunkState, PriorityTier, STATE_COUNT, TIER_COUNT};

/// Per-chunk scheduling cost, declared by the source before the first
/// download.
#[derive(Debug, Clone, Copy)]
pub struct ChunkCost {
    /// Download-slot cost; clamped to >= 1.
    pub download_slots: u32,
    /// Scheduled against the compute capacity instead of a download level.
    pub computational: bool,
    /// Worker-memory estimate used for download byte accounting until the
    /// first successful download reports the real size.
    pub system_memory_bytes_estimate: u64,
    pub gpu_memory_bytes_estimate: u64,
}

impl Default for ChunkCost {
    fn default() -> Self {
        Self {
            download_slots: 1,
            computational: false,
            system_memory_bytes_estimate: 0,
            gpu_memory_bytes_estimate: 0,
        }
    }
}

/// Result of a successful download: decoded bytes plus the memory footprint
/// the chunk will occupy from now on.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub data: Vec<u8>,
    pub system_memory_bytes: u64,
    pub gpu_memory_bytes: u64,
}

impl ChunkPayload {
    /// Payload whose worker footprint is the byte length of `data` and whose
    /// GPU footprint equals it. Good enough for most raw volume sources.
    pub fn from_data(data: Vec<u8>) -> Self {
        let bytes = data.len() as u64;
        Self {
            data,
            system_memory_bytes: bytes,
            gpu_memory_bytes: bytes,
        }
    }
}

/// A remote data source the scheduler can download chunks from.
///
/// The contract: on success the payload carries the decoded bytes and the
/// chunk's memory footprint. On failure the error becomes the chunk's FAILED
/// payload. The source must honour cancellation: when the token fires, abort
/// network I/O and settle; the scheduler discards the settlement.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Download-slot dependency level. A source whose download logic itself
    /// requests chunks from another source must declare a strictly greater
    /// level than that source, so the two never contend for the same slots.
    fn level(&self) -> usize {
        0
    }

    /// Scheduling cost of a chunk, consulted when the chunk is first created.
    fn chunk_cost(&self, _key: ChunkKey) -> ChunkCost {
        ChunkCost::default()
    }

    async fn download(
        &self,
        key: ChunkKey,
        cancel: CancellationToken,
    ) -> Result<ChunkPayload, DownloadError>;
}

/// Count and byte totals for one (state, tier) cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TierStat {
    pub chunks: u64,
    pub system_bytes: u64,
    pub gpu_bytes: u64,
}

/// Per-source statistics, indexed by state x tier.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SourceStats {
    cells: [[TierStat; TIER_COUNT]; STATE_COUNT],
}

impl SourceStats {
    pub fn get(&self, state: ChunkState, tier: PriorityTier) -> TierStat {
        self.cells[state.index()][tier.index()]
    }

    /// Total chunk count in a state, summed over tiers.
    pub fn state_total(&self, state: ChunkState) -> u64 {
        self.cells[state.index()].iter().map(|s| s.chunks).sum()
    }

    pub(crate) fn add(
        &mut self,
        state: ChunkState,
        tier: PriorityTier,
        system_bytes: u64,
        gpu_bytes: u64,
    ) {
        let cell = &mut self.cells[state.index()][tier.index()];
        cell.chunks += 1;
        cell.system_bytes += system_bytes;
        cell.gpu_bytes += gpu_bytes;
    }

    pub(crate) fn sub(
        &mut self,
        state: ChunkState,
        tier: PriorityTier,
        system_bytes: u64,
        gpu_bytes: u64,
    ) {
        let cell = &mut self.cells[state.index()][tier.index()];
        debug_assert!(cell.chunks >= 1, "stat cell underflow");
        cell.chunks -= 1;
        cell.system_bytes -= system_bytes;
        cell.gpu_bytes -= gpu_bytes;
    }
}

/// A registered source: the downloader itself, its key map and statistics.
pub struct SourceEntry {
    pub source: Arc<dyn ChunkSource>,
    pub level: usize,
    pub chunks: HashMap<ChunkKey, ChunkId>,
    pub stats: SourceStats,
}

impl SourceEntry {
    pub fn new(source: Arc<dyn ChunkSource>) -> Self {
        let level = source.level();
        Self {
            source,
            level,
            chunks: HashMap::new(),
            stats: SourceStats::default(),
        }
    }
}

impl std::fmt::Debug for SourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceEntry")
            .field("level", &self.level)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}
