//! Main-side chunk manager
//!
//! Collects the chunk requests every visible layer makes during a frame,
//! merges repeated requests by the max rule, and at end of frame diffs the
//! requested set against the previous frame. Only actual (tier, priority)
//! changes cross the channel to the worker, so a chunk requested at the same
//! priority every frame costs nothing, and a chunk that stops being
//! requested decays to the RECENT tier after one frame.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::chunk::{ChunkKey, ChunkState, PriorityTier, SourceId};
use crate::core::epoch::MarkGenerator;
use crate::transport::{ChunkUpdate, PriorityDelta, QueueManagerHandle};

/// How often the per-layer progress counters are published.
const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_millis(200);

/// Identifier of a render layer registered with the chunk manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerId(usize);

/// Per-layer chunk progress for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LayerProgress {
    pub visible_chunks_needed: u64,
    pub visible_chunks_available: u64,
    pub prefetch_chunks_needed: u64,
    pub prefetch_chunks_available: u64,
}

type ChunkRef = (SourceId, ChunkKey);

/// Staged and current effective priority of one requested chunk.
#[derive(Debug)]
struct RequestedChunk {
    tier: PriorityTier,
    priority: f32,
    staged_tier: PriorityTier,
    staged_priority: f32,
}

impl RequestedChunk {
    fn new() -> Self {
        Self {
            tier: PriorityTier::Recent,
            priority: f32::NEG_INFINITY,
            staged_tier: PriorityTier::Recent,
            staged_priority: f32::NEG_INFINITY,
        }
    }

    /// Swap staged into current and reset staged. Returns whether anything
    /// changed.
    fn apply_staged(&mut self) -> bool {
        let changed = self.staged_tier != self.tier || self.staged_priority != self.priority;
        self.tier = self.staged_tier;
        self.priority = self.staged_priority;
        self.staged_tier = PriorityTier::Recent;
        self.staged_priority = f32::NEG_INFINITY;
        changed
    }
}

/// Frontend residency of a chunk, mirrored from worker updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidentState {
    SystemMemory,
    GpuMemory,
}

pub struct ChunkManager {
    handle: QueueManagerHandle,
    chunks: HashMap<ChunkRef, RequestedChunk>,
    /// Chunks whose current effective tier is VISIBLE or PREFETCH, rebuilt
    /// every update from the requested set.
    existing_tier: [Vec<ChunkRef>; 2],
    /// Chunks touched by `request_chunk` since the last update.
    new_tier: Vec<ChunkRef>,
    update_pending: bool,
    marks: MarkGenerator,
    layers: Vec<LayerProgress>,
    /// Residency mirrored from `ChunkUpdate` messages; the main context is
    /// authoritative for GPU uploads.
    resident: HashMap<ChunkRef, ResidentState>,
    progress_tx: watch::Sender<Vec<LayerProgress>>,
    last_progress_report: Option<Instant>,
}

impl ChunkManager {
    pub fn new(handle: QueueManagerHandle) -> Self {
        let (progress_tx, _) = watch::channel(Vec::new());
        Self {
            handle,
            chunks: HashMap::new(),
            existing_tier: [Vec::new(), Vec::new()],
            new_tier: Vec::new(),
            update_pending: false,
            marks: MarkGenerator::new(),
            layers: Vec::new(),
            resident: HashMap::new(),
            progress_tx,
            last_progress_report: None,
        }
    }

    pub fn handle(&self) -> &QueueManagerHandle {
        &self.handle
    }

    /// Register a render layer for progress accounting.
    pub fn add_layer(&mut self) -> LayerId {
        self.layers.push(LayerProgress::default());
        LayerId(self.layers.len() - 1)
    }

    /// Start a frame: advance the traversal mark and reset the per-frame
    /// progress gauges.
    pub fn begin_frame(&mut self) {
        self.marks.advance();
        for layer in &mut self.layers {
            *layer = LayerProgress::default();
        }
    }

    /// The current frame's traversal mark, for layers that need to dedupe
    /// their own chunk walks.
    pub fn frame_mark(&self) -> crate::core::epoch::MarkGeneration {
        self.marks.current()
    }

    /// Request a chunk for this frame. Repeated requests for the same chunk
    /// merge by the max rule: the better tier wins, and within a tier the
    /// larger priority.
    pub fn request_chunk(
        &mut self,
        layer: LayerId,
        source: SourceId,
        key: ChunkKey,
        tier: PriorityTier,
        priority: f32,
    ) {
        assert!(tier != PriorityTier::Recent, "cannot request the RECENT tier");
        assert!(priority.is_finite(), "chunk priority must be finite");

        let chunk_ref = (source, key);
        let record = self
            .chunks
            .entry(chunk_ref)
            .or_insert_with(RequestedChunk::new);
        if record.staged_tier == PriorityTier::Recent {
            self.new_tier.push(chunk_ref);
        }
        if tier < record.staged_tier
            || (tier == record.staged_tier && priority > record.staged_priority)
        {
            record.staged_tier = tier;
            record.staged_priority = priority;
        }

        let progress = &mut self.layers[layer.0];
        let on_gpu = self.resident.get(&chunk_ref) == Some(&ResidentState::GpuMemory);
        match tier {
            PriorityTier::Visible => {
                progress.visible_chunks_needed += 1;
                if on_gpu {
                    progress.visible_chunks_available += 1;
                }
            }
            PriorityTier::Prefetch => {
                progress.prefetch_chunks_needed += 1;
                if on_gpu {
                    progress.prefetch_chunks_available += 1;
                }
            }
            PriorityTier::Recent => unreachable!(),
        }
        self.update_pending = true;
    }

    /// End-of-frame priority recomputation. Coalesced: redundant calls in
    /// one frame collapse to a single pass.
    pub fn update_chunk_priorities(&mut self) {
        if !self.update_pending && self.new_tier.is_empty() {
            self.report_progress();
            return;
        }
        self.update_pending = false;
        self.update_queue_state(&[PriorityTier::Visible, PriorityTier::Prefetch]);
        self.report_progress();
    }

    fn update_queue_state(&mut self, tiers: &[PriorityTier]) {
        let mut deltas = Vec::new();

        // Pass 1: anything from the previous frame that was not re-requested
        // has a staged tier of RECENT and decays.
        for &tier in tiers {
            let previous = std::mem::take(&mut self.existing_tier[tier.index()]);
            for chunk_ref in previous {
                let Some(record) = self.chunks.get_mut(&chunk_ref) else {
                    continue;
                };
                if record.staged_tier != PriorityTier::Recent {
                    // Re-requested this frame; pass 2 re-files it.
                    continue;
                }
                if record.apply_staged() {
                    deltas.push(delta_for(chunk_ref, record));
                }
                self.chunks.remove(&chunk_ref);
            }
        }

        // Pass 2: file every chunk touched this frame under its new tier.
        for chunk_ref in std::mem::take(&mut self.new_tier) {
            let Some(record) = self.chunks.get_mut(&chunk_ref) else {
                continue;
            };
            if record.apply_staged() {
                deltas.push(delta_for(chunk_ref, record));
            }
            match record.tier {
                PriorityTier::Visible | PriorityTier::Prefetch => {
                    self.existing_tier[record.tier.index()].push(chunk_ref);
                }
                PriorityTier::Recent => {
                    self.chunks.remove(&chunk_ref);
                }
            }
        }

        if !deltas.is_empty() {
            self.handle.update_priorities(deltas);
        }
    }

    /// Mirror one worker update into the residency map. Returns the decoded
    /// buffer when the worker hands a chunk over for its first GPU upload;
    /// the caller owns the actual upload.
    pub fn apply_update(&mut self, update: ChunkUpdate) -> Option<Vec<u8>> {
        let chunk_ref = (update.source(), update.key());
        match update {
            ChunkUpdate::SystemMemory { .. } => {
                self.resident.insert(chunk_ref, ResidentState::SystemMemory);
                None
            }
            ChunkUpdate::GpuMemory { buffer, .. } => {
                self.resident.insert(chunk_ref, ResidentState::GpuMemory);
                buffer
            }
            ChunkUpdate::Expired { .. } => {
                self.resident.remove(&chunk_ref);
                None
            }
        }
    }

    pub fn resident_state(&self, source: SourceId, key: ChunkKey) -> Option<ResidentState> {
        self.resident.get(&(source, key)).copied()
    }

    /// Frontend view of a chunk's state, for consumers that only care about
    /// availability.
    pub fn chunk_state(&self, source: SourceId, key: ChunkKey) -> Option<ChunkState> {
        match self.resident_state(source, key)? {
            ResidentState::SystemMemory => Some(ChunkState::SystemMemory),
            ResidentState::GpuMemory => Some(ChunkState::GpuMemory),
        }
    }

    pub fn layer_progress(&self, layer: LayerId) -> LayerProgress {
        self.layers[layer.0]
    }

    /// Watch channel carrying throttled per-layer progress snapshots.
    pub fn progress_updates(&self) -> watch::Receiver<Vec<LayerProgress>> {
        self.progress_tx.subscribe()
    }

    fn report_progress(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_progress_report {
            if now.duration_since(last) < PROGRESS_REPORT_INTERVAL {
                return;
            }
        }
        self.last_progress_report = Some(now);
        let _ = self.progress_tx.send(self.layers.clone());
    }
}

fn delta_for(chunk_ref: ChunkRef, record: &RequestedChunk) -> PriorityDelta {
    PriorityDelta {
        source: chunk_ref.0,
        key: chunk_ref.1,
        tier: record.tier,
        priority: record.priority,
    }
}
