//! The two halves of the scheduler
//!
//! [`ChunkManager`] runs on the main context and turns per-frame layer
//! requests into priority deltas; [`QueueManager`] runs on the worker
//! context and owns the chunks, queues and capacities. The worker actor in
//! [`worker`] drives the queue manager from a message loop.

pub mod capacity;
pub mod chunk_manager;
pub mod queue_manager;
pub mod visibility;
pub mod worker;

pub use capacity::{AvailableCapacity, CapacityLimits, CapacityUsage};
pub use chunk_manager::{ChunkManager, LayerId, LayerProgress, ResidentState};
pub use queue_manager::{
    ChunkQueueConfig, QueueManager, QueueManagerStats, SchedulerAction, SchedulerCounters,
};
pub use visibility::{effective_tier, VisibilityAggregator, VisibilityContributor};
pub use worker::{run_queue_manager, spawn_queue_manager};
