//! Worker-side queue manager
//!
//! Owns the chunk arena, the per-state priority queues and the capacity
//! counters, and runs the capacity-aware promote/evict loop. All mutation
//! happens through synchronous methods; side effects (messages to the main
//! context, downloads to start) are collected as [`SchedulerAction`]s for
//! the surrounding actor to perform, which keeps the scheduler itself
//! deterministic and directly testable.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chunk::source::SourceEntry;
use crate::chunk::{
    Chunk, ChunkArena, ChunkId, ChunkKey, ChunkPayload, ChunkSource, ChunkState, LinkIndex,
    PriorityTier, SourceId, SourceStats,
};
use crate::core::error::{DownloadError, RetrieveError};
use crate::queue::{ChunkPriorityQueue, QueuePolarity};
use crate::transport::{ChunkUpdate, PriorityDelta};

use super::capacity::{AvailableCapacity, CapacityLimits, CapacityUsage};

/// Capacity limits for every resource class the scheduler arbitrates.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChunkQueueConfig {
    pub gpu_memory: CapacityLimits,
    pub system_memory: CapacityLimits,
    /// Per-source-level download limits. Levels beyond the end of the list
    /// reuse the last entry.
    pub download: Vec<CapacityLimits>,
    pub compute: CapacityLimits,
}

impl Default for ChunkQueueConfig {
    fn default() -> Self {
        Self {
            gpu_memory: CapacityLimits::new(u64::MAX, 1024 * 1024 * 1024), // 1 GB
            system_memory: CapacityLimits::new(u64::MAX, 2 * 1024 * 1024 * 1024), // 2 GB
            download: vec![CapacityLimits::new(32, u64::MAX)],
            compute: CapacityLimits::new(16, u64::MAX),
        }
    }
}

/// Side effect produced by a scheduler mutation, performed by the worker
/// actor after the mutation returns.
pub enum SchedulerAction {
    /// Deliver a state notification to the main context.
    Send(ChunkUpdate),
    /// Spawn the download (or computation) for a chunk that was just
    /// promoted to DOWNLOADING.
    StartDownload {
        chunk: ChunkId,
        generation: u64,
        source: Arc<dyn ChunkSource>,
        key: ChunkKey,
        cancel: CancellationToken,
    },
}

impl std::fmt::Debug for SchedulerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerAction::Send(update) => write!(f, "Send({update:?})"),
            SchedulerAction::StartDownload { key, generation, .. } => {
                write!(f, "StartDownload({key}, gen {generation})")
            }
        }
    }
}

/// Cumulative scheduler counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct SchedulerCounters {
    pub downloads_started: u64,
    pub downloads_completed: u64,
    pub downloads_failed: u64,
    pub downloads_cancelled: u64,
    pub gpu_promotions: u64,
    pub gpu_evictions: u64,
    pub memory_evictions: u64,
    pub chunks_destroyed: u64,
}

/// Snapshot of scheduler state for the main context.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueueManagerStats {
    pub counters: SchedulerCounters,
    pub gpu_memory: CapacityUsage,
    pub system_memory: CapacityUsage,
    pub download: Vec<CapacityUsage>,
    pub compute: CapacityUsage,
    pub failed_chunks: u64,
    pub sources: Vec<SourceStats>,
}

/// Resource class selector for capacity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapacityKind {
    Gpu,
    System,
    Download(usize),
    Compute,
}

/// Which eviction queue feeds candidates to a capacity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Evictor {
    Gpu,
    System,
    Download(usize),
    Compute,
}

/// Which promotion queue a download pass drains.
#[derive(Debug, Clone, Copy)]
enum DownloadQueue {
    Level(usize),
    Compute,
}

pub struct QueueManager {
    arena: ChunkArena,
    sources: Vec<SourceEntry>,
    config: ChunkQueueConfig,

    gpu_memory: AvailableCapacity,
    system_memory: AvailableCapacity,
    download: Vec<AvailableCapacity>,
    compute: AvailableCapacity,

    /// Promotion queues for QUEUED chunks, one per source level.
    queued_download_promotion: Vec<ChunkPriorityQueue>,
    queued_compute_promotion: ChunkPriorityQueue,
    /// Eviction queues for DOWNLOADING chunks, one per source level.
    download_eviction: Vec<ChunkPriorityQueue>,
    compute_eviction: ChunkPriorityQueue,
    /// Every memory-resident chunk; the only queue on link set 0.
    system_memory_eviction: ChunkPriorityQueue,
    gpu_memory_promotion: ChunkPriorityQueue,
    gpu_memory_eviction: ChunkPriorityQueue,

    update_pending: bool,
    next_download_generation: u64,
    counters: SchedulerCounters,
    actions: Vec<SchedulerAction>,
}

impl QueueManager {
    pub fn new(config: ChunkQueueConfig) -> Self {
        let mut manager = Self {
            arena: ChunkArena::new(),
            sources: Vec::new(),
            gpu_memory: AvailableCapacity::new(config.gpu_memory),
            system_memory: AvailableCapacity::new(config.system_memory),
            download: Vec::new(),
            compute: AvailableCapacity::new(config.compute),
            queued_download_promotion: Vec::new(),
            queued_compute_promotion: ChunkPriorityQueue::new(
                LinkIndex::Lifecycle,
                QueuePolarity::Promotion,
            ),
            download_eviction: Vec::new(),
            compute_eviction: ChunkPriorityQueue::new(
                LinkIndex::Lifecycle,
                QueuePolarity::Eviction,
            ),
            system_memory_eviction: ChunkPriorityQueue::new(
                LinkIndex::Memory,
                QueuePolarity::Eviction,
            ),
            gpu_memory_promotion: ChunkPriorityQueue::new(
                LinkIndex::Lifecycle,
                QueuePolarity::Promotion,
            ),
            gpu_memory_eviction: ChunkPriorityQueue::new(
                LinkIndex::Lifecycle,
                QueuePolarity::Eviction,
            ),
            update_pending: false,
            next_download_generation: 1,
            counters: SchedulerCounters::default(),
            actions: Vec::new(),
            config,
        };
        manager.ensure_level(0);
        manager
    }

    /// Register a source. Its declared level gets dedicated download slots.
    pub fn add_source(&mut self, source: Arc<dyn ChunkSource>) -> SourceId {
        let entry = SourceEntry::new(source);
        self.ensure_level(entry.level);
        let id = SourceId(self.sources.len() as u32);
        log::info!("registered {} at level {}", id, entry.level);
        self.sources.push(entry);
        id
    }

    fn ensure_level(&mut self, level: usize) {
        while self.download.len() <= level {
            let limits = self.download_limits(self.download.len());
            self.download.push(AvailableCapacity::new(limits));
            self.queued_download_promotion.push(ChunkPriorityQueue::new(
                LinkIndex::Lifecycle,
                QueuePolarity::Promotion,
            ));
            self.download_eviction.push(ChunkPriorityQueue::new(
                LinkIndex::Lifecycle,
                QueuePolarity::Eviction,
            ));
        }
    }

    fn download_limits(&self, level: usize) -> CapacityLimits {
        self.config
            .download
            .get(level)
            .or_else(|| self.config.download.last())
            .copied()
            .unwrap_or_default()
    }

    /// Replace every capacity limit. Over-committed capacities are resolved
    /// by eviction on the next tick.
    pub fn set_capacities(&mut self, config: ChunkQueueConfig) {
        self.gpu_memory.set_limits(config.gpu_memory);
        self.system_memory.set_limits(config.system_memory);
        self.compute.set_limits(config.compute);
        self.config = config;
        for level in 0..self.download.len() {
            let limits = self.download_limits(level);
            self.download[level].set_limits(limits);
        }
        self.schedule_update();
    }

    // --- Priority updates ---

    /// Apply one frame's batched priority deltas from the main context.
    pub fn apply_priority_deltas(&mut self, deltas: &[PriorityDelta]) {
        for delta in deltas {
            assert!(
                delta.tier == PriorityTier::Recent || delta.priority.is_finite(),
                "chunk priority must be finite"
            );
            let existing = self.sources[delta.source.0 as usize]
                .chunks
                .get(&delta.key)
                .copied();
            let id = match existing {
                Some(id) => {
                    self.mark_requested_to_frontend(id);
                    id
                }
                // A decay delta for a chunk the worker has already dropped.
                None if delta.tier == PriorityTier::Recent => continue,
                None => self.intern_chunk(delta.source, delta.key, true),
            };
            self.set_chunk_priority(id, delta.tier, delta.priority);
        }
    }

    /// Request a chunk on behalf of the worker side itself (for example a
    /// source computing derived data). Backend chunks never become GPU
    /// promotion candidates.
    pub fn request_backend_chunk(
        &mut self,
        source: SourceId,
        key: ChunkKey,
        tier: PriorityTier,
        priority: f32,
    ) {
        assert!(tier != PriorityTier::Recent, "cannot request the RECENT tier");
        assert!(priority.is_finite(), "chunk priority must be finite");
        let id = match self.sources[source.0 as usize].chunks.get(&key).copied() {
            Some(id) => id,
            None => {
                let id = self.intern_chunk(source, key, false);
                self.arena.chunk_mut(id).backend_only = true;
                id
            }
        };
        self.set_chunk_priority(id, tier, priority);
    }

    fn intern_chunk(&mut self, source: SourceId, key: ChunkKey, to_frontend: bool) -> ChunkId {
        let entry = &self.sources[source.0 as usize];
        let cost = entry.source.chunk_cost(key);
        let mut chunk = Chunk::new(source, key, cost);
        chunk.requested_to_frontend = to_frontend;
        let id = self.arena.insert(chunk);
        self.sources[source.0 as usize].chunks.insert(key, id);
        self.charge(id, 1);
        id
    }

    /// Late upgrade of a backend chunk into one the frontend wants. Queue
    /// membership depends on the flag, so re-enqueue around the change.
    fn mark_requested_to_frontend(&mut self, id: ChunkId) {
        if self.arena.chunk(id).requested_to_frontend {
            return;
        }
        self.remove_from_queues(id);
        self.arena.chunk_mut(id).requested_to_frontend = true;
        self.insert_into_queues(id);
    }

    /// Change a chunk's (tier, priority), maintaining queue membership,
    /// statistics and the NEW -> QUEUED / destroy-on-decay transitions.
    fn set_chunk_priority(&mut self, id: ChunkId, tier: PriorityTier, priority: f32) {
        {
            let chunk = self.arena.chunk(id);
            if chunk.tier == tier && chunk.priority == priority {
                return;
            }
        }
        self.remove_from_queues(id);
        self.charge(id, -1);
        {
            let chunk = self.arena.chunk_mut(id);
            chunk.tier = tier;
            chunk.priority = priority;
        }
        self.charge(id, 1);

        let state = self.arena.chunk(id).state;
        if state == ChunkState::New && tier != PriorityTier::Recent {
            // First request: straight into the queued pool.
            self.charge(id, -1);
            self.write_state(id, ChunkState::Queued);
            self.charge(id, 1);
        }
        self.insert_into_queues(id);
        self.destroy_if_unwanted(id);
        self.schedule_update();
    }

    // --- State transitions ---

    /// The single routing point for chunk state changes: bracket the
    /// capacity/statistics adjustment and the queue re-membership around the
    /// state write, then schedule a tick.
    fn update_chunk_state(&mut self, id: ChunkId, new_state: ChunkState) {
        self.charge(id, -1);
        self.remove_from_queues(id);
        self.write_state(id, new_state);
        self.charge(id, 1);
        self.insert_into_queues(id);
        self.schedule_update();
    }

    fn write_state(&mut self, id: ChunkId, new_state: ChunkState) {
        let chunk = self.arena.chunk_mut(id);
        debug_assert!(
            chunk.state.transition_permitted(new_state),
            "illegal transition {:?} -> {:?}",
            chunk.state,
            new_state,
        );
        chunk.state = new_state;
    }

    /// Adjust every affected capacity counter and the per-source statistics
    /// by the chunk's current costs. `dir` is +1 or -1; every mutation of
    /// state, tier or byte sizes must bracket a -1/+1 pair around it.
    fn charge(&mut self, id: ChunkId, dir: i64) {
        let (state, tier, source, sys_bytes, gpu_bytes, slots, computational, level) = {
            let chunk = self.arena.chunk(id);
            (
                chunk.state,
                chunk.tier,
                chunk.source,
                chunk.system_memory_bytes,
                chunk.gpu_memory_bytes,
                chunk.download_slots as i64,
                chunk.computational,
                self.sources[chunk.source.0 as usize].level,
            )
        };
        let sys = sys_bytes as i64;
        match state {
            ChunkState::Downloading => {
                if computational {
                    // Compute slots are charged; compute bytes are not.
                    self.compute.adjust(dir * slots, 0);
                } else {
                    self.download[level].adjust(dir * slots, dir * sys);
                }
                self.system_memory.adjust(dir, dir * sys);
            }
            ChunkState::SystemMemoryWorker | ChunkState::SystemMemory => {
                self.system_memory.adjust(dir, dir * sys);
            }
            ChunkState::GpuMemory => {
                self.system_memory.adjust(dir, dir * sys);
                self.gpu_memory.adjust(dir, dir * (gpu_bytes as i64));
            }
            ChunkState::New | ChunkState::Queued | ChunkState::Failed | ChunkState::Expired => {}
        }
        let stats = &mut self.sources[source.0 as usize].stats;
        if dir > 0 {
            stats.add(state, tier, sys_bytes, gpu_bytes);
        } else {
            stats.sub(state, tier, sys_bytes, gpu_bytes);
        }
    }

    /// Queue membership implied by the chunk's (state, tier, flags).
    fn insert_into_queues(&mut self, id: ChunkId) {
        let (state, tier, computational, backend_only, to_frontend, level) = {
            let chunk = self.arena.chunk(id);
            (
                chunk.state,
                chunk.tier,
                chunk.computational,
                chunk.backend_only,
                chunk.requested_to_frontend,
                self.sources[chunk.source.0 as usize].level,
            )
        };
        match state {
            ChunkState::Queued => {
                if computational {
                    self.queued_compute_promotion.insert(&mut self.arena, id);
                } else {
                    self.queued_download_promotion[level].insert(&mut self.arena, id);
                }
            }
            ChunkState::Downloading => {
                if computational {
                    self.compute_eviction.insert(&mut self.arena, id);
                } else {
                    self.download_eviction[level].insert(&mut self.arena, id);
                }
                self.system_memory_eviction.insert(&mut self.arena, id);
            }
            ChunkState::SystemMemoryWorker | ChunkState::SystemMemory => {
                self.system_memory_eviction.insert(&mut self.arena, id);
                if tier != PriorityTier::Recent && !backend_only && to_frontend {
                    self.gpu_memory_promotion.insert(&mut self.arena, id);
                }
            }
            ChunkState::GpuMemory => {
                self.system_memory_eviction.insert(&mut self.arena, id);
                self.gpu_memory_eviction.insert(&mut self.arena, id);
            }
            ChunkState::New | ChunkState::Failed | ChunkState::Expired => {}
        }
    }

    fn remove_from_queues(&mut self, id: ChunkId) {
        let (state, tier, computational, backend_only, to_frontend, level) = {
            let chunk = self.arena.chunk(id);
            (
                chunk.state,
                chunk.tier,
                chunk.computational,
                chunk.backend_only,
                chunk.requested_to_frontend,
                self.sources[chunk.source.0 as usize].level,
            )
        };
        match state {
            ChunkState::Queued => {
                if computational {
                    self.queued_compute_promotion.remove(&mut self.arena, id);
                } else {
                    self.queued_download_promotion[level].remove(&mut self.arena, id);
                }
            }
            ChunkState::Downloading => {
                if computational {
                    self.compute_eviction.remove(&mut self.arena, id);
                } else {
                    self.download_eviction[level].remove(&mut self.arena, id);
                }
                self.system_memory_eviction.remove(&mut self.arena, id);
            }
            ChunkState::SystemMemoryWorker | ChunkState::SystemMemory => {
                self.system_memory_eviction.remove(&mut self.arena, id);
                if tier != PriorityTier::Recent && !backend_only && to_frontend {
                    self.gpu_memory_promotion.remove(&mut self.arena, id);
                }
            }
            ChunkState::GpuMemory => {
                self.system_memory_eviction.remove(&mut self.arena, id);
                self.gpu_memory_eviction.remove(&mut self.arena, id);
            }
            ChunkState::New | ChunkState::Failed | ChunkState::Expired => {}
        }
    }

    /// A QUEUED chunk whose effective tier dropped to RECENT is no longer
    /// wanted by anyone; free it so its slot can be reused.
    fn destroy_if_unwanted(&mut self, id: ChunkId) {
        let chunk = self.arena.chunk(id);
        if chunk.state != ChunkState::Queued || chunk.tier != PriorityTier::Recent {
            return;
        }
        self.charge(id, -1);
        self.remove_from_queues(id);
        self.write_state(id, ChunkState::Expired);
        self.destroy_chunk(id);
    }

    /// Remove a chunk from the arena and its source's key map. The chunk
    /// must already be unqueued and uncharged.
    fn destroy_chunk(&mut self, id: ChunkId) {
        debug_assert_eq!(self.arena.chunk(id).state, ChunkState::Expired);
        let chunk = self.arena.remove(id);
        self.sources[chunk.source.0 as usize].chunks.remove(&chunk.key);
        self.counters.chunks_destroyed += 1;
    }

    // --- Eviction primitives ---

    /// Drop a chunk from GPU memory; the main context keeps the CPU copy.
    fn evict_gpu_memory(&mut self, id: ChunkId) {
        debug_assert_eq!(self.arena.chunk(id).state, ChunkState::GpuMemory);
        self.update_chunk_state(id, ChunkState::SystemMemory);
        let chunk = self.arena.chunk(id);
        log::debug!("evicting {} {} from gpu memory", chunk.source, chunk.key);
        self.actions.push(SchedulerAction::Send(ChunkUpdate::SystemMemory {
            source: chunk.source,
            key: chunk.key,
        }));
        self.counters.gpu_evictions += 1;
    }

    /// Free a chunk's decoded bytes everywhere. Still-wanted chunks return
    /// to QUEUED; RECENT chunks are destroyed.
    fn evict_worker_memory(&mut self, id: ChunkId) {
        debug_assert!(matches!(
            self.arena.chunk(id).state,
            ChunkState::SystemMemory | ChunkState::SystemMemoryWorker
        ));
        // Byte sizes survive as the re-download estimate.
        self.arena.chunk_mut(id).payload = None;
        let (source, key, tier) = {
            let chunk = self.arena.chunk(id);
            (chunk.source, chunk.key, chunk.tier)
        };
        log::debug!("evicting {source} {key} from worker memory");
        self.actions
            .push(SchedulerAction::Send(ChunkUpdate::Expired { source, key }));
        self.counters.memory_evictions += 1;
        if tier == PriorityTier::Recent {
            self.charge(id, -1);
            self.remove_from_queues(id);
            self.write_state(id, ChunkState::Expired);
            self.destroy_chunk(id);
        } else {
            self.update_chunk_state(id, ChunkState::Queued);
        }
    }

    /// Cancel an in-flight download and return the chunk to QUEUED. The
    /// settlement of the cancelled download is discarded by the generation
    /// check when it eventually arrives.
    fn cancel_download(&mut self, id: ChunkId) {
        debug_assert_eq!(self.arena.chunk(id).state, ChunkState::Downloading);
        let token = self
            .arena
            .chunk_mut(id)
            .cancel
            .take()
            .expect("downloading chunk without a cancellation token");
        token.cancel();
        self.counters.downloads_cancelled += 1;
        self.update_chunk_state(id, ChunkState::Queued);
        self.destroy_if_unwanted(id);
    }

    /// Evict one candidate surfaced by an eviction queue, dispatching on its
    /// state.
    fn evict(&mut self, evictor: Evictor, id: ChunkId) {
        match evictor {
            Evictor::Gpu => self.evict_gpu_memory(id),
            Evictor::System | Evictor::Download(_) | Evictor::Compute => {
                match self.arena.chunk(id).state {
                    ChunkState::Downloading => self.cancel_download(id),
                    ChunkState::GpuMemory => {
                        self.evict_gpu_memory(id);
                        self.evict_worker_memory(id);
                    }
                    ChunkState::SystemMemory | ChunkState::SystemMemoryWorker => {
                        self.evict_worker_memory(id);
                    }
                    state => unreachable!("unevictable state {state:?}"),
                }
            }
        }
    }

    // --- Capacity-aware promotion ---

    fn capacity(&self, kind: CapacityKind) -> &AvailableCapacity {
        match kind {
            CapacityKind::Gpu => &self.gpu_memory,
            CapacityKind::System => &self.system_memory,
            CapacityKind::Download(level) => &self.download[level],
            CapacityKind::Compute => &self.compute,
        }
    }

    fn eviction_peek(&self, evictor: Evictor) -> Option<ChunkId> {
        match evictor {
            Evictor::Gpu => self.gpu_memory_eviction.peek(&self.arena),
            Evictor::System => self.system_memory_eviction.peek(&self.arena),
            Evictor::Download(level) => self.download_eviction[level].peek(&self.arena),
            Evictor::Compute => self.compute_eviction.peek(&self.arena),
        }
    }

    /// Evict until `cap` can admit one item of `size` bytes, but only while
    /// the promotion candidate strictly outranks the next eviction candidate
    /// on (tier, priority). Returns whether room was made.
    fn try_to_free_capacity(
        &mut self,
        size: u64,
        cap: CapacityKind,
        promo_tier: PriorityTier,
        promo_priority: f32,
        evictor: Evictor,
    ) -> bool {
        loop {
            {
                let capacity = self.capacity(cap);
                if capacity.available_items() >= 1 && capacity.available_size() >= size {
                    return true;
                }
            }
            let Some(candidate) = self.eviction_peek(evictor) else {
                return false;
            };
            let (cand_tier, cand_priority) = {
                let chunk = self.arena.chunk(candidate);
                (chunk.tier, chunk.priority)
            };
            let outranks = promo_tier < cand_tier
                || (promo_tier == cand_tier && promo_priority > cand_priority);
            if !outranks {
                return false;
            }
            self.evict(evictor, candidate);
        }
    }

    /// Run one scheduler tick: resolve shrunken limits, then the GPU
    /// promotion pass, then the download/compute promotion passes.
    ///
    /// GPU promotion runs first so that chunks already resident in worker
    /// memory reach the GPU before fresh downloads claim the budget.
    pub fn process(&mut self) {
        self.update_pending = false;
        self.enforce_limits();
        self.process_gpu_promotions();
        self.process_download_promotions();
    }

    /// Resolve capacities left over-committed by a runtime limit reduction.
    fn enforce_limits(&mut self) {
        while self.gpu_memory.over_committed() {
            let Some(id) = self.gpu_memory_eviction.peek(&self.arena) else {
                break;
            };
            self.evict(Evictor::Gpu, id);
        }
        while self.system_memory.over_committed() {
            let Some(id) = self.system_memory_eviction.peek(&self.arena) else {
                break;
            };
            self.evict(Evictor::System, id);
        }
        for level in 0..self.download.len() {
            while self.download[level].over_committed() {
                let Some(id) = self.download_eviction[level].peek(&self.arena) else {
                    break;
                };
                self.evict(Evictor::Download(level), id);
            }
        }
        while self.compute.over_committed() {
            let Some(id) = self.compute_eviction.peek(&self.arena) else {
                break;
            };
            self.evict(Evictor::Compute, id);
        }
    }

    fn process_gpu_promotions(&mut self) {
        while let Some(id) = self.gpu_memory_promotion.peek(&self.arena) {
            let (tier, priority, gpu_bytes) = {
                let chunk = self.arena.chunk(id);
                (chunk.tier, chunk.priority, chunk.gpu_memory_bytes)
            };
            if !self.try_to_free_capacity(gpu_bytes, CapacityKind::Gpu, tier, priority, Evictor::Gpu)
            {
                // Heap order guarantees no later candidate could succeed.
                break;
            }
            self.copy_chunk_to_gpu(id);
        }
    }

    /// Promote one memory-resident chunk to the GPU. The decoded buffer is
    /// attached on the first handoff; afterwards the main context already
    /// holds the data.
    fn copy_chunk_to_gpu(&mut self, id: ChunkId) {
        let buffer = if self.arena.chunk(id).state == ChunkState::SystemMemoryWorker {
            let payload = self.arena.chunk_mut(id).payload.take();
            self.update_chunk_state(id, ChunkState::SystemMemory);
            payload
        } else {
            None
        };
        self.update_chunk_state(id, ChunkState::GpuMemory);
        let chunk = self.arena.chunk(id);
        log::debug!("promoting {} {} to gpu memory", chunk.source, chunk.key);
        self.actions.push(SchedulerAction::Send(ChunkUpdate::GpuMemory {
            source: chunk.source,
            key: chunk.key,
            buffer,
        }));
        self.counters.gpu_promotions += 1;
    }

    fn process_download_promotions(&mut self) {
        for level in 0..self.download.len() {
            self.promote_queued(DownloadQueue::Level(level));
        }
        self.promote_queued(DownloadQueue::Compute);
    }

    fn promote_queued(&mut self, queue: DownloadQueue) {
        loop {
            let id = match queue {
                DownloadQueue::Level(level) => {
                    self.queued_download_promotion[level].peek(&self.arena)
                }
                DownloadQueue::Compute => self.queued_compute_promotion.peek(&self.arena),
            };
            let Some(id) = id else { break };
            let (tier, priority, sys_bytes) = {
                let chunk = self.arena.chunk(id);
                (chunk.tier, chunk.priority, chunk.system_memory_bytes)
            };
            let (cap, evictor, cap_size) = match queue {
                DownloadQueue::Level(level) => {
                    (CapacityKind::Download(level), Evictor::Download(level), sys_bytes)
                }
                DownloadQueue::Compute => (CapacityKind::Compute, Evictor::Compute, 0),
            };
            // Both the slot capacity and worker memory must admit the chunk.
            if !self.try_to_free_capacity(cap_size, cap, tier, priority, evictor) {
                break;
            }
            if !self.try_to_free_capacity(
                sys_bytes,
                CapacityKind::System,
                tier,
                priority,
                Evictor::System,
            ) {
                break;
            }
            self.start_download(id);
        }
    }

    fn start_download(&mut self, id: ChunkId) {
        let generation = self.next_download_generation;
        self.next_download_generation += 1;
        let token = CancellationToken::new();
        {
            let chunk = self.arena.chunk_mut(id);
            chunk.cancel = Some(token.clone());
            chunk.download_generation = generation;
            chunk.error = None;
        }
        self.update_chunk_state(id, ChunkState::Downloading);
        let (source, key) = {
            let chunk = self.arena.chunk(id);
            (chunk.source, chunk.key)
        };
        log::debug!("starting download of {source} {key} (gen {generation})");
        self.actions.push(SchedulerAction::StartDownload {
            chunk: id,
            generation,
            source: self.sources[source.0 as usize].source.clone(),
            key,
            cancel: token,
        });
        self.counters.downloads_started += 1;
    }

    // --- Download settlement ---

    /// Handle the settlement of a download task. Settlements whose chunk is
    /// gone, no longer downloading, or downloading under a newer generation
    /// are stale and discarded.
    pub fn download_settled(
        &mut self,
        id: ChunkId,
        generation: u64,
        result: Result<ChunkPayload, DownloadError>,
    ) {
        let Some(chunk) = self.arena.get(id) else {
            return;
        };
        if chunk.state != ChunkState::Downloading || chunk.download_generation != generation {
            log::debug!("discarding stale settlement for {} {}", chunk.source, chunk.key);
            return;
        }
        match result {
            Ok(payload) => {
                self.arena.chunk_mut(id).cancel = None;
                self.charge(id, -1);
                {
                    let chunk = self.arena.chunk_mut(id);
                    chunk.system_memory_bytes = payload.system_memory_bytes;
                    chunk.gpu_memory_bytes = payload.gpu_memory_bytes;
                    chunk.payload = Some(payload.data);
                }
                self.charge(id, 1);
                self.counters.downloads_completed += 1;
                self.update_chunk_state(id, ChunkState::SystemMemoryWorker);
            }
            Err(DownloadError::Cancelled) => {
                // The source gave up on its own; requeue as if evicted.
                log::warn!(
                    "download of {} {} cancelled by the source",
                    chunk.source,
                    chunk.key
                );
                self.cancel_download(id);
            }
            Err(error) => {
                {
                    let chunk = self.arena.chunk_mut(id);
                    log::warn!("download of {} {} failed: {error}", chunk.source, chunk.key);
                    chunk.cancel = None;
                    chunk.error = Some(error);
                }
                self.counters.downloads_failed += 1;
                self.update_chunk_state(id, ChunkState::Failed);
            }
        }
    }

    // --- Source invalidation ---

    /// Drop every cached byte of a source and schedule re-downloads for the
    /// chunks still requested. Failed chunks get another chance.
    pub fn invalidate_source(&mut self, source: SourceId) {
        let ids: Vec<ChunkId> = self.sources[source.0 as usize]
            .chunks
            .values()
            .copied()
            .collect();
        log::info!("invalidating {source} ({} chunks)", ids.len());
        for id in ids {
            match self.arena.chunk(id).state {
                ChunkState::Downloading => self.cancel_download(id),
                ChunkState::GpuMemory => {
                    self.evict_gpu_memory(id);
                    self.evict_worker_memory(id);
                }
                ChunkState::SystemMemory | ChunkState::SystemMemoryWorker => {
                    self.evict_worker_memory(id);
                }
                ChunkState::Failed => {
                    self.arena.chunk_mut(id).error = None;
                    self.update_chunk_state(id, ChunkState::Queued);
                    self.destroy_if_unwanted(id);
                }
                ChunkState::New | ChunkState::Queued => {}
                ChunkState::Expired => unreachable!("expired chunk in source map"),
            }
        }
        self.schedule_update();
    }

    // --- Retrieval ---

    /// Raw bytes of a chunk currently resident in worker memory.
    pub fn retrieve(&self, source: SourceId, key: ChunkKey) -> Result<Vec<u8>, RetrieveError> {
        let entry = self
            .sources
            .get(source.0 as usize)
            .ok_or(RetrieveError::UnknownSource(source.0))?;
        let id = *entry.chunks.get(&key).ok_or(RetrieveError::UnknownChunk)?;
        let chunk = self.arena.chunk(id);
        if chunk.state != ChunkState::SystemMemoryWorker {
            return Err(RetrieveError::NotResident);
        }
        chunk.payload.clone().ok_or(RetrieveError::NotResident)
    }

    // --- Scheduling and reporting ---

    /// Coalesced tick request: redundant calls collapse into one pending
    /// tick that the actor runs after the current message batch.
    pub fn schedule_update(&mut self) {
        self.update_pending = true;
    }

    pub fn take_update_pending(&mut self) -> bool {
        std::mem::take(&mut self.update_pending)
    }

    /// Drain the side effects accumulated since the last call.
    pub fn take_actions(&mut self) -> Vec<SchedulerAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn stats(&self) -> QueueManagerStats {
        QueueManagerStats {
            counters: self.counters,
            gpu_memory: self.gpu_memory.usage(),
            system_memory: self.system_memory.usage(),
            download: self.download.iter().map(|c| c.usage()).collect(),
            compute: self.compute.usage(),
            failed_chunks: self
                .sources
                .iter()
                .map(|s| s.stats.state_total(ChunkState::Failed))
                .sum(),
            sources: self.sources.iter().map(|s| s.stats.clone()).collect(),
        }
    }

    /// Cancel every in-flight download. Called when the worker actor shuts
    /// down; no further state transitions happen after this.
    pub fn shutdown(&mut self) {
        let mut cancelled = 0usize;
        for entry in &self.sources {
            for &id in entry.chunks.values() {
                if let Some(token) = self.arena.chunk_mut(id).cancel.take() {
                    token.cancel();
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            log::info!("cancelled {cancelled} in-flight downloads on shutdown");
        }
    }

    /// Look up a chunk's current state, if it is live.
    pub fn chunk_state(&self, source: SourceId, key: ChunkKey) -> Option<ChunkState> {
        let entry = self.sources.get(source.0 as usize)?;
        let id = *entry.chunks.get(&key)?;
        Some(self.arena.chunk(id).state)
    }

    /// The error payload of a FAILED chunk.
    pub fn chunk_error(&self, source: SourceId, key: ChunkKey) -> Option<&DownloadError> {
        let entry = self.sources.get(source.0 as usize)?;
        let id = *entry.chunks.get(&key)?;
        self.arena.chunk(id).error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::chunk::ChunkCost;

    /// Source for synchronous scheduler tests; downloads are driven by hand
    /// through `download_settled`, so the async path is never exercised.
    struct TestSource {
        level: usize,
        cost: ChunkCost,
    }

    impl TestSource {
        fn plain() -> Self {
            Self {
                level: 0,
                cost: ChunkCost::default(),
            }
        }

        fn at_level(level: usize) -> Self {
            Self {
                level,
                cost: ChunkCost::default(),
            }
        }

        fn computational() -> Self {
            Self {
                level: 0,
                cost: ChunkCost {
                    computational: true,
                    ..ChunkCost::default()
                },
            }
        }
    }

    #[async_trait]
    impl ChunkSource for TestSource {
        fn level(&self) -> usize {
            self.level
        }

        fn chunk_cost(&self, _key: ChunkKey) -> ChunkCost {
            self.cost
        }

        async fn download(
            &self,
            _key: ChunkKey,
            _cancel: CancellationToken,
        ) -> Result<ChunkPayload, DownloadError> {
            panic!("test source downloads are settled by hand");
        }
    }

    fn small_config() -> ChunkQueueConfig {
        ChunkQueueConfig {
            gpu_memory: CapacityLimits::new(2, 200),
            system_memory: CapacityLimits::new(4, 400),
            download: vec![CapacityLimits::new(2, u64::MAX)],
            compute: CapacityLimits::new(2, u64::MAX),
        }
    }

    fn manager_with_source(config: ChunkQueueConfig) -> (QueueManager, SourceId) {
        let mut manager = QueueManager::new(config);
        let source = manager.add_source(Arc::new(TestSource::plain()));
        (manager, source)
    }

    fn key(x: i32) -> ChunkKey {
        ChunkKey::new(x, 0, 0)
    }

    fn request(
        manager: &mut QueueManager,
        source: SourceId,
        x: i32,
        tier: PriorityTier,
        priority: f32,
    ) {
        manager.apply_priority_deltas(&[PriorityDelta {
            source,
            key: key(x),
            tier,
            priority,
        }]);
    }

    fn decay(manager: &mut QueueManager, source: SourceId, x: i32) {
        manager.apply_priority_deltas(&[PriorityDelta {
            source,
            key: key(x),
            tier: PriorityTier::Recent,
            priority: f32::NEG_INFINITY,
        }]);
    }

    /// Drain actions, returning started downloads and sent updates.
    fn drain(
        manager: &mut QueueManager,
    ) -> (Vec<(ChunkId, u64, ChunkKey, CancellationToken)>, Vec<ChunkUpdate>) {
        let mut downloads = Vec::new();
        let mut updates = Vec::new();
        for action in manager.take_actions() {
            match action {
                SchedulerAction::StartDownload {
                    chunk,
                    generation,
                    key,
                    cancel,
                    ..
                } => downloads.push((chunk, generation, key, cancel)),
                SchedulerAction::Send(update) => updates.push(update),
            }
        }
        (downloads, updates)
    }

    fn settle_ok(
        manager: &mut QueueManager,
        downloads: &[(ChunkId, u64, ChunkKey, CancellationToken)],
        x: i32,
        sys_bytes: u64,
        gpu_bytes: u64,
    ) {
        let (id, generation, ..) = downloads
            .iter()
            .find(|(_, _, k, _)| *k == key(x))
            .expect("no download was started for the chunk");
        manager.download_settled(
            *id,
            *generation,
            Ok(ChunkPayload {
                data: vec![0u8; sys_bytes as usize],
                system_memory_bytes: sys_bytes,
                gpu_memory_bytes: gpu_bytes,
            }),
        );
    }

    fn state(manager: &QueueManager, source: SourceId, x: i32) -> Option<ChunkState> {
        manager.chunk_state(source, key(x))
    }

    /// Bring chunks to GPU residency: request, download, settle, promote.
    fn load_to_gpu(manager: &mut QueueManager, source: SourceId, chunks: &[(i32, f32)]) {
        for &(x, priority) in chunks {
            request(manager, source, x, PriorityTier::Visible, priority);
        }
        manager.process();
        let (downloads, _) = drain(manager);
        for &(x, _) in chunks {
            settle_ok(manager, &downloads, x, 50, 80);
        }
        manager.process();
    }

    // --- End-to-end scenarios ---

    #[test]
    fn test_promotion_within_budget() {
        let (mut manager, source) = manager_with_source(small_config());
        request(&mut manager, source, 1, PriorityTier::Visible, 10.0);
        request(&mut manager, source, 2, PriorityTier::Visible, 10.0);
        manager.process();

        assert_eq!(state(&manager, source, 1), Some(ChunkState::Downloading));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::Downloading));

        let (downloads, _) = drain(&mut manager);
        assert_eq!(downloads.len(), 2);
        settle_ok(&mut manager, &downloads, 1, 50, 80);
        settle_ok(&mut manager, &downloads, 2, 50, 80);
        manager.process();

        assert_eq!(state(&manager, source, 1), Some(ChunkState::GpuMemory));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::GpuMemory));
        let stats = manager.stats();
        assert_eq!(stats.gpu_memory.items, 2);
        assert_eq!(stats.gpu_memory.size, 160);
        assert_eq!(stats.system_memory.items, 2);
        assert_eq!(stats.system_memory.size, 100);

        // The first handoff carries the decoded buffer.
        let (_, updates) = drain(&mut manager);
        assert!(updates.iter().all(|u| matches!(
            u,
            ChunkUpdate::GpuMemory { buffer: Some(_), .. }
        )));
    }

    #[test]
    fn test_eviction_triggers_promotion() {
        let (mut manager, source) = manager_with_source(small_config());
        load_to_gpu(&mut manager, source, &[(1, 10.0), (2, 10.0)]);
        drain(&mut manager);

        // A higher-priority chunk arrives; the GPU is full.
        request(&mut manager, source, 3, PriorityTier::Visible, 20.0);
        manager.process();
        let (downloads, _) = drain(&mut manager);
        settle_ok(&mut manager, &downloads, 3, 50, 80);
        manager.process();

        // One resident was demoted to make room; the other stayed.
        assert_eq!(state(&manager, source, 1), Some(ChunkState::GpuMemory));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::SystemMemory));
        assert_eq!(state(&manager, source, 3), Some(ChunkState::GpuMemory));

        let (_, updates) = drain(&mut manager);
        assert!(updates.contains(&ChunkUpdate::SystemMemory {
            source,
            key: key(2)
        }));
        let stats = manager.stats();
        assert_eq!(stats.gpu_memory.items, 2);
        assert_eq!(stats.counters.gpu_evictions, 1);
    }

    #[test]
    fn test_prefetch_cannot_evict_visible() {
        let (mut manager, source) = manager_with_source(small_config());
        load_to_gpu(&mut manager, source, &[(1, 10.0), (2, 10.0)]);
        drain(&mut manager);

        // A prefetch chunk, however high its scalar, cannot displace a
        // visible resident.
        request(&mut manager, source, 3, PriorityTier::Prefetch, 100.0);
        manager.process();
        let (downloads, _) = drain(&mut manager);
        settle_ok(&mut manager, &downloads, 3, 50, 80);
        manager.process();

        assert_eq!(state(&manager, source, 1), Some(ChunkState::GpuMemory));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::GpuMemory));
        assert_eq!(
            state(&manager, source, 3),
            Some(ChunkState::SystemMemoryWorker)
        );
        assert_eq!(manager.stats().counters.gpu_evictions, 0);
    }

    #[test]
    fn test_recent_decay_keeps_gpu_charge_until_evicted() {
        let config = ChunkQueueConfig {
            gpu_memory: CapacityLimits::new(1, 200),
            ..small_config()
        };
        let (mut manager, source) = manager_with_source(config);
        load_to_gpu(&mut manager, source, &[(1, 5.0)]);
        drain(&mut manager);

        // Next frame the chunk is not requested: it decays to RECENT but
        // its GPU bytes stay charged.
        decay(&mut manager, source, 1);
        manager.process();
        assert_eq!(state(&manager, source, 1), Some(ChunkState::GpuMemory));
        assert_eq!(manager.stats().gpu_memory.items, 1);

        // A newly requested chunk evicts it.
        load_to_gpu(&mut manager, source, &[(2, 1.0)]);
        assert_eq!(state(&manager, source, 1), Some(ChunkState::SystemMemory));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::GpuMemory));
        assert_eq!(manager.stats().gpu_memory.items, 1);
    }

    #[test]
    fn test_cancel_mid_download() {
        let config = ChunkQueueConfig {
            download: vec![CapacityLimits::new(1, u64::MAX)],
            ..small_config()
        };
        let (mut manager, source) = manager_with_source(config);

        request(&mut manager, source, 1, PriorityTier::Visible, 1.0);
        manager.process();
        let (first, _) = drain(&mut manager);
        assert_eq!(first.len(), 1);

        // A much more important chunk arrives while the only slot is taken.
        request(&mut manager, source, 2, PriorityTier::Visible, 1000.0);
        manager.process();

        assert_eq!(state(&manager, source, 1), Some(ChunkState::Queued));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::Downloading));
        assert!(first[0].3.is_cancelled());
        assert_eq!(manager.stats().counters.downloads_cancelled, 1);

        // The cancelled download's settlement is stale and changes nothing.
        settle_ok(&mut manager, &first, 1, 50, 80);
        assert_eq!(state(&manager, source, 1), Some(ChunkState::Queued));
        manager.download_settled(
            first[0].0,
            first[0].1,
            Err(DownloadError::Transport("late failure".into())),
        );
        assert_eq!(state(&manager, source, 1), Some(ChunkState::Queued));
        assert_eq!(manager.stats().counters.downloads_failed, 0);
    }

    #[test]
    fn test_source_invalidation() {
        let config = ChunkQueueConfig {
            gpu_memory: CapacityLimits::new(1, 200),
            system_memory: CapacityLimits::new(8, 800),
            download: vec![CapacityLimits::new(3, u64::MAX)],
            compute: CapacityLimits::new(2, u64::MAX),
        };
        let (mut manager, source) = manager_with_source(config);

        // A ends up on the GPU, B in worker memory.
        request(&mut manager, source, 1, PriorityTier::Visible, 30.0);
        request(&mut manager, source, 2, PriorityTier::Visible, 20.0);
        manager.process();
        let (downloads, _) = drain(&mut manager);
        settle_ok(&mut manager, &downloads, 1, 50, 80);
        settle_ok(&mut manager, &downloads, 2, 50, 80);
        manager.process();
        // C stays in flight, D fails.
        request(&mut manager, source, 3, PriorityTier::Visible, 1.0);
        request(&mut manager, source, 4, PriorityTier::Visible, 40.0);
        manager.process();
        let (late, _) = drain(&mut manager);
        let (d_id, d_generation, ..) = late.iter().find(|(_, _, k, _)| *k == key(4)).unwrap();
        manager.download_settled(
            *d_id,
            *d_generation,
            Err(DownloadError::Transport("410 gone".into())),
        );

        assert_eq!(state(&manager, source, 1), Some(ChunkState::GpuMemory));
        assert_eq!(
            state(&manager, source, 2),
            Some(ChunkState::SystemMemoryWorker)
        );
        assert_eq!(state(&manager, source, 3), Some(ChunkState::Downloading));
        assert_eq!(state(&manager, source, 4), Some(ChunkState::Failed));

        manager.invalidate_source(source);

        for x in 1..=4 {
            assert_eq!(state(&manager, source, x), Some(ChunkState::Queued));
        }
        let c_token = &late.iter().find(|(_, _, k, _)| *k == key(3)).unwrap().3;
        assert!(c_token.is_cancelled());
        let stats = manager.stats();
        assert_eq!(stats.gpu_memory.items, 0);
        assert_eq!(stats.system_memory.items, 0);
        assert_eq!(stats.system_memory.size, 0);
        assert_eq!(stats.failed_chunks, 0);

        // The next tick restarts downloads in priority order; the lowest
        // priority chunk waits for a slot.
        manager.process();
        assert_eq!(state(&manager, source, 4), Some(ChunkState::Downloading));
        assert_eq!(state(&manager, source, 1), Some(ChunkState::Downloading));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::Downloading));
        assert_eq!(state(&manager, source, 3), Some(ChunkState::Queued));
    }

    // --- Invariants ---

    #[test]
    fn test_capacity_limits_hold_after_every_tick() {
        let (mut manager, source) = manager_with_source(small_config());
        for x in 0..16 {
            request(
                &mut manager,
                source,
                x,
                PriorityTier::Visible,
                (x % 5) as f32,
            );
        }
        manager.process();
        let (downloads, _) = drain(&mut manager);
        for (i, (id, generation, ..)) in downloads.iter().enumerate() {
            manager.download_settled(
                *id,
                *generation,
                Ok(ChunkPayload {
                    data: vec![0u8; 50],
                    system_memory_bytes: 50,
                    gpu_memory_bytes: 40 + (i as u64 * 10),
                }),
            );
            manager.process();
            let stats = manager.stats();
            assert!(stats.gpu_memory.items <= 2);
            assert!(stats.gpu_memory.size <= 200);
            assert!(stats.system_memory.items <= 4);
            assert!(stats.system_memory.size <= 400);
            assert!(stats.download[0].items <= 2);
        }
    }

    #[test]
    fn test_shrinking_limits_evicts_on_next_tick() {
        let (mut manager, source) = manager_with_source(small_config());
        load_to_gpu(&mut manager, source, &[(1, 10.0), (2, 20.0)]);
        assert_eq!(manager.stats().gpu_memory.items, 2);

        let mut shrunk = small_config();
        shrunk.gpu_memory = CapacityLimits::new(1, 200);
        manager.set_capacities(shrunk);
        manager.process();

        let stats = manager.stats();
        assert_eq!(stats.gpu_memory.items, 1);
        // The lower-priority resident was chosen.
        assert_eq!(state(&manager, source, 1), Some(ChunkState::SystemMemory));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::GpuMemory));
    }

    #[test]
    fn test_queue_membership_follows_state() {
        let config = ChunkQueueConfig {
            gpu_memory: CapacityLimits::new(0, 0),
            download: vec![CapacityLimits::new(1, u64::MAX)],
            ..small_config()
        };
        let (mut manager, source) = manager_with_source(config);

        // Queued (no free slot for the second chunk).
        request(&mut manager, source, 1, PriorityTier::Visible, 10.0);
        request(&mut manager, source, 2, PriorityTier::Visible, 5.0);
        manager.process();
        let queued = *manager.sources[source.0 as usize].chunks.get(&key(2)).unwrap();
        let downloading = *manager.sources[source.0 as usize].chunks.get(&key(1)).unwrap();

        assert!(manager.queued_download_promotion[0]
            .collect(&manager.arena)
            .contains(&queued));
        assert!(!manager
            .system_memory_eviction
            .collect(&manager.arena)
            .contains(&queued));

        assert!(manager.download_eviction[0]
            .collect(&manager.arena)
            .contains(&downloading));
        assert!(manager
            .system_memory_eviction
            .collect(&manager.arena)
            .contains(&downloading));

        // Worker-memory resident: eviction queue plus GPU promotion queue.
        let (downloads, _) = drain(&mut manager);
        settle_ok(&mut manager, &downloads, 1, 50, 80);
        manager.process();
        assert_eq!(
            state(&manager, source, 1),
            Some(ChunkState::SystemMemoryWorker)
        );
        assert!(manager
            .system_memory_eviction
            .collect(&manager.arena)
            .contains(&downloading));
        assert!(manager
            .gpu_memory_promotion
            .collect(&manager.arena)
            .contains(&downloading));
        assert!(!manager.download_eviction[0]
            .collect(&manager.arena)
            .contains(&downloading));
    }

    #[test]
    fn test_gpu_resident_queue_membership() {
        let (mut manager, source) = manager_with_source(small_config());
        load_to_gpu(&mut manager, source, &[(1, 10.0)]);
        let id = *manager.sources[source.0 as usize].chunks.get(&key(1)).unwrap();

        assert!(manager
            .gpu_memory_eviction
            .collect(&manager.arena)
            .contains(&id));
        assert!(manager
            .system_memory_eviction
            .collect(&manager.arena)
            .contains(&id));
        assert!(!manager
            .gpu_memory_promotion
            .collect(&manager.arena)
            .contains(&id));
    }

    #[test]
    fn test_source_levels_use_separate_slots() {
        let mut manager = QueueManager::new(ChunkQueueConfig {
            download: vec![CapacityLimits::new(1, u64::MAX)],
            ..small_config()
        });
        let base = manager.add_source(Arc::new(TestSource::plain()));
        let derived = manager.add_source(Arc::new(TestSource::at_level(1)));

        request(&mut manager, base, 1, PriorityTier::Visible, 1.0);
        request(&mut manager, derived, 2, PriorityTier::Visible, 1.0);
        manager.process();

        // One slot per level: both download despite the single-slot limit.
        assert_eq!(state(&manager, base, 1), Some(ChunkState::Downloading));
        assert_eq!(state(&manager, derived, 2), Some(ChunkState::Downloading));
        let stats = manager.stats();
        assert_eq!(stats.download[0].items, 1);
        assert_eq!(stats.download[1].items, 1);
    }

    #[test]
    fn test_computational_chunks_use_compute_capacity() {
        let mut manager = QueueManager::new(ChunkQueueConfig {
            compute: CapacityLimits::new(1, u64::MAX),
            ..small_config()
        });
        let source = manager.add_source(Arc::new(TestSource::computational()));

        request(&mut manager, source, 1, PriorityTier::Visible, 2.0);
        request(&mut manager, source, 2, PriorityTier::Visible, 1.0);
        manager.process();

        assert_eq!(state(&manager, source, 1), Some(ChunkState::Downloading));
        assert_eq!(state(&manager, source, 2), Some(ChunkState::Queued));
        let stats = manager.stats();
        assert_eq!(stats.compute.items, 1);
        assert_eq!(stats.download[0].items, 0);
    }

    #[test]
    fn test_queued_chunk_decaying_to_recent_is_destroyed() {
        let config = ChunkQueueConfig {
            download: vec![CapacityLimits::new(0, 0)],
            ..small_config()
        };
        let (mut manager, source) = manager_with_source(config);
        request(&mut manager, source, 1, PriorityTier::Visible, 1.0);
        manager.process();
        assert_eq!(state(&manager, source, 1), Some(ChunkState::Queued));

        decay(&mut manager, source, 1);
        assert_eq!(state(&manager, source, 1), None);
        assert_eq!(manager.stats().counters.chunks_destroyed, 1);
        assert!(manager.arena.is_empty());
    }

    #[test]
    fn test_failed_chunk_is_not_retried() {
        let (mut manager, source) = manager_with_source(small_config());
        request(&mut manager, source, 1, PriorityTier::Visible, 1.0);
        manager.process();
        let (downloads, _) = drain(&mut manager);
        manager.download_settled(
            downloads[0].0,
            downloads[0].1,
            Err(DownloadError::Decode("bad gzip stream".into())),
        );
        assert_eq!(state(&manager, source, 1), Some(ChunkState::Failed));
        assert_eq!(manager.stats().failed_chunks, 1);
        assert!(matches!(
            manager.chunk_error(source, key(1)),
            Some(DownloadError::Decode(_))
        ));

        // Re-requesting changes the priority but never restarts the
        // download.
        request(&mut manager, source, 1, PriorityTier::Visible, 100.0);
        manager.process();
        assert_eq!(state(&manager, source, 1), Some(ChunkState::Failed));
        let (downloads, _) = drain(&mut manager);
        assert!(downloads.is_empty());
    }

    #[test]
    fn test_backend_chunk_is_never_gpu_promoted() {
        let (mut manager, source) = manager_with_source(small_config());
        manager.request_backend_chunk(source, key(1), PriorityTier::Visible, 10.0);
        manager.process();
        let (downloads, _) = drain(&mut manager);
        settle_ok(&mut manager, &downloads, 1, 50, 80);
        manager.process();

        assert_eq!(
            state(&manager, source, 1),
            Some(ChunkState::SystemMemoryWorker)
        );
        assert_eq!(manager.stats().gpu_memory.items, 0);
    }

    #[test]
    fn test_net_accounting_matches_final_states() {
        let (mut manager, source) = manager_with_source(small_config());
        load_to_gpu(&mut manager, source, &[(1, 10.0), (2, 20.0)]);
        // Churn: decay, re-request, evict, settle again.
        decay(&mut manager, source, 1);
        request(&mut manager, source, 1, PriorityTier::Prefetch, 3.0);
        request(&mut manager, source, 3, PriorityTier::Visible, 30.0);
        manager.process();
        let (downloads, _) = drain(&mut manager);
        settle_ok(&mut manager, &downloads, 3, 50, 80);
        manager.process();

        // Whatever happened in between, the counters must equal the sum of
        // the per-chunk contributions of the final states.
        let mut expected_sys_items = 0;
        let mut expected_sys_bytes = 0;
        let mut expected_gpu_items = 0;
        let mut expected_gpu_bytes = 0;
        for x in 1..=3 {
            match state(&manager, source, x) {
                Some(ChunkState::GpuMemory) => {
                    expected_sys_items += 1;
                    expected_sys_bytes += 50;
                    expected_gpu_items += 1;
                    expected_gpu_bytes += 80;
                }
                Some(
                    ChunkState::SystemMemory
                    | ChunkState::SystemMemoryWorker
                    | ChunkState::Downloading,
                ) => {
                    expected_sys_items += 1;
                    expected_sys_bytes += 50;
                }
                _ => {}
            }
        }
        let stats = manager.stats();
        assert_eq!(stats.system_memory.items, expected_sys_items);
        assert_eq!(stats.system_memory.size, expected_sys_bytes);
        assert_eq!(stats.gpu_memory.items, expected_gpu_items);
        assert_eq!(stats.gpu_memory.size, expected_gpu_bytes);
    }

    #[test]
    fn test_per_source_stats_track_states() {
        let (mut manager, source) = manager_with_source(small_config());
        request(&mut manager, source, 1, PriorityTier::Visible, 1.0);
        request(&mut manager, source, 2, PriorityTier::Prefetch, 1.0);
        manager.process();

        let stats = manager.stats();
        let per_source = &stats.sources[source.0 as usize];
        assert_eq!(per_source.state_total(ChunkState::Downloading), 2);
        assert_eq!(
            per_source
                .get(ChunkState::Downloading, PriorityTier::Prefetch)
                .chunks,
            1
        );
    }
}
