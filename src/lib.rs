//! Volustream - a multi-resource chunk scheduler for volumetric data viewers
//!
//! Layers render by consuming fixed-size data chunks fetched from remote
//! sources, decoded, buffered in worker memory and uploaded to GPU memory.
//! The scheduler drives each chunk through that lifecycle under three hard
//! budgets (download slots, worker memory bytes, GPU memory bytes) so that
//! the highest-priority chunks are always GPU-resident and lower-priority
//! chunks are evicted in strict reverse-priority order.
//!
//! The crate is split along the two execution contexts of a viewer:
//! - Main context: [`scheduler::ChunkManager`] batches per-frame chunk
//!   requests from layers and forwards priority deltas.
//! - Worker context: [`scheduler::QueueManager`] owns the chunks, the
//!   priority queues and the capacity counters, and runs the
//!   promote/evict loop.
//!
//! The two sides communicate only through in-order messages (see
//! [`transport`]).

pub mod chunk;
pub mod core;
pub mod queue;
pub mod scheduler;
pub mod transport;
