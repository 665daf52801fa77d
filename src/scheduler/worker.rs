//! Worker-context actor
//!
//! Wraps the synchronous [`QueueManager`] in a single-threaded message loop:
//! requests from the main context and download settlements are the only ways
//! in, so no two mutations ever interleave. Download tasks run concurrently
//! on the runtime but re-enter the scheduler purely as settlement messages.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunk::{ChunkId, ChunkKey, ChunkPayload, ChunkSource};
use crate::core::error::DownloadError;
use crate::transport::{ChunkUpdate, QueueManagerHandle, WorkerRequest};

use super::queue_manager::{ChunkQueueConfig, QueueManager, SchedulerAction};

struct Settlement {
    chunk: ChunkId,
    generation: u64,
    result: Result<ChunkPayload, DownloadError>,
}

/// Spawn the worker actor on the current runtime.
///
/// Returns the main-side handle, the stream of chunk updates the main
/// context must drain, and the actor's join handle. Dropping every handle
/// clone shuts the actor down and cancels in-flight downloads.
pub fn spawn_queue_manager(
    config: ChunkQueueConfig,
) -> (
    QueueManagerHandle,
    mpsc::UnboundedReceiver<ChunkUpdate>,
    tokio::task::JoinHandle<()>,
) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let manager = QueueManager::new(config);
    let join = tokio::spawn(run_queue_manager(manager, request_rx, update_tx));
    (QueueManagerHandle::new(request_tx), update_rx, join)
}

/// The actor loop. Processes a batch of ready messages, runs the coalesced
/// scheduler tick, then performs the side effects the tick produced.
pub async fn run_queue_manager(
    mut manager: QueueManager,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    updates: mpsc::UnboundedSender<ChunkUpdate>,
) {
    let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Settlement>();
    log::info!("queue manager worker started");

    loop {
        tokio::select! {
            biased;
            Some(settlement) = settled_rx.recv() => {
                manager.download_settled(settlement.chunk, settlement.generation, settlement.result);
            }
            request = requests.recv() => {
                match request {
                    Some(request) => handle_request(&mut manager, request),
                    None => break,
                }
            }
        }
        // Drain whatever else is already waiting so one tick covers the
        // whole batch.
        while let Ok(settlement) = settled_rx.try_recv() {
            manager.download_settled(settlement.chunk, settlement.generation, settlement.result);
        }
        while let Ok(request) = requests.try_recv() {
            handle_request(&mut manager, request);
        }

        while manager.take_update_pending() {
            manager.process();
        }
        for action in manager.take_actions() {
            match action {
                SchedulerAction::Send(update) => {
                    let _ = updates.send(update);
                }
                SchedulerAction::StartDownload {
                    chunk,
                    generation,
                    source,
                    key,
                    cancel,
                } => {
                    spawn_download(settled_tx.clone(), chunk, generation, source, key, cancel);
                }
            }
        }
    }

    manager.shutdown();
    log::info!("queue manager worker stopped");
}

fn spawn_download(
    settled_tx: mpsc::UnboundedSender<Settlement>,
    chunk: ChunkId,
    generation: u64,
    source: Arc<dyn ChunkSource>,
    key: ChunkKey,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let result = source.download(key, cancel).await;
        // The actor may already be gone during shutdown.
        let _ = settled_tx.send(Settlement {
            chunk,
            generation,
            result,
        });
    });
}

fn handle_request(manager: &mut QueueManager, request: WorkerRequest) {
    match request {
        WorkerRequest::UpdatePriorities(deltas) => manager.apply_priority_deltas(&deltas),
        WorkerRequest::Retrieve { source, key, reply } => {
            let _ = reply.send(manager.retrieve(source, key));
        }
        WorkerRequest::InvalidateSource(source) => manager.invalidate_source(source),
        WorkerRequest::SetCapacities(config) => manager.set_capacities(config),
        WorkerRequest::GetStats { reply } => {
            let _ = reply.send(manager.stats());
        }
        WorkerRequest::AddSource { source, reply } => {
            let _ = reply.send(manager.add_source(source));
        }
    }
}
