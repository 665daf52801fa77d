//! Cross-context messages between the main and worker contexts
//!
//! The two contexts share no memory; they exchange typed messages over
//! in-order channels. Data-bearing messages are plain serde types so that an
//! out-of-process transport can frame them (length-prefixed JSON); control
//! messages that carry a reply channel stay in-process.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::chunk::{ChunkKey, ChunkSource, PriorityTier, SourceId};
use crate::core::error::RetrieveError;
use crate::scheduler::{ChunkQueueConfig, QueueManagerStats};

/// One (tier, priority) change for a single chunk, produced by the main-side
/// frame diff and applied to the authoritative worker-side chunk.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PriorityDelta {
    pub source: SourceId,
    pub key: ChunkKey,
    pub tier: PriorityTier,
    pub priority: f32,
}

/// Worker -> main chunk state notification.
///
/// `GpuMemory` carries the decoded buffer the first time a worker-memory
/// chunk is handed over; the main context is authoritative for GPU-resident
/// chunks and performs the actual upload on receipt.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ChunkUpdate {
    SystemMemory {
        source: SourceId,
        key: ChunkKey,
    },
    GpuMemory {
        source: SourceId,
        key: ChunkKey,
        buffer: Option<Vec<u8>>,
    },
    /// The chunk's data is no longer resident anywhere; drop CPU copies and
    /// GPU textures.
    Expired {
        source: SourceId,
        key: ChunkKey,
    },
}

impl ChunkUpdate {
    pub fn source(&self) -> SourceId {
        match self {
            ChunkUpdate::SystemMemory { source, .. }
            | ChunkUpdate::GpuMemory { source, .. }
            | ChunkUpdate::Expired { source, .. } => *source,
        }
    }

    pub fn key(&self) -> ChunkKey {
        match self {
            ChunkUpdate::SystemMemory { key, .. }
            | ChunkUpdate::GpuMemory { key, .. }
            | ChunkUpdate::Expired { key, .. } => *key,
        }
    }
}

/// Main -> worker request.
pub enum WorkerRequest {
    /// Batched priority changes for one frame.
    UpdatePriorities(Vec<PriorityDelta>),
    /// Fetch the raw bytes of a chunk resident in worker memory.
    Retrieve {
        source: SourceId,
        key: ChunkKey,
        reply: oneshot::Sender<Result<Vec<u8>, RetrieveError>>,
    },
    /// Drop all cached data of a source and re-download what is requested.
    InvalidateSource(SourceId),
    /// Replace the capacity limits; takes effect on the next tick.
    SetCapacities(ChunkQueueConfig),
    GetStats {
        reply: oneshot::Sender<QueueManagerStats>,
    },
    AddSource {
        source: Arc<dyn ChunkSource>,
        reply: oneshot::Sender<SourceId>,
    },
}

impl std::fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRequest::UpdatePriorities(deltas) => {
                write!(f, "UpdatePriorities({} deltas)", deltas.len())
            }
            WorkerRequest::Retrieve { source, key, .. } => {
                write!(f, "Retrieve({source}, {key})")
            }
            WorkerRequest::InvalidateSource(source) => write!(f, "InvalidateSource({source})"),
            WorkerRequest::SetCapacities(_) => write!(f, "SetCapacities"),
            WorkerRequest::GetStats { .. } => write!(f, "GetStats"),
            WorkerRequest::AddSource { .. } => write!(f, "AddSource"),
        }
    }
}

/// Main-side handle to the worker context.
///
/// Cloneable; dropping every clone closes the channel and shuts the worker
/// actor down.
#[derive(Clone)]
pub struct QueueManagerHandle {
    tx: mpsc::UnboundedSender<WorkerRequest>,
}

impl QueueManagerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkerRequest>) -> Self {
        Self { tx }
    }

    /// Register a source with the worker and get its id.
    pub async fn add_source(&self, source: Arc<dyn ChunkSource>) -> Option<SourceId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::AddSource { source, reply })
            .ok()?;
        rx.await.ok()
    }

    /// Forward one frame's priority deltas. Silently dropped if the worker
    /// is gone.
    pub fn update_priorities(&self, deltas: Vec<PriorityDelta>) {
        let _ = self.tx.send(WorkerRequest::UpdatePriorities(deltas));
    }

    pub fn invalidate_source(&self, source: SourceId) {
        let _ = self.tx.send(WorkerRequest::InvalidateSource(source));
    }

    pub fn set_capacities(&self, config: ChunkQueueConfig) {
        let _ = self.tx.send(WorkerRequest::SetCapacities(config));
    }

    /// Fetch the raw bytes of a chunk currently resident in worker memory.
    /// Used by auxiliary consumers, not the rendering path.
    pub async fn retrieve(
        &self,
        source: SourceId,
        key: ChunkKey,
    ) -> Result<Vec<u8>, RetrieveError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::Retrieve { source, key, reply })
            .map_err(|_| RetrieveError::WorkerGone)?;
        rx.await.map_err(|_| RetrieveError::WorkerGone)?
    }

    pub async fn stats(&self) -> Option<QueueManagerStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(WorkerRequest::GetStats { reply }).ok()?;
        rx.await.ok()
    }
}

/// Wire codec errors for framed messages.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame is truncated")]
    Truncated,

    #[error("frame body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame a message as length-prefixed JSON for out-of-process transports.
pub fn encode_frame<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(value)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame, returning the message and the number of bytes consumed.
pub fn decode_frame<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), WireError> {
    if bytes.len() < 4 {
        return Err(WireError::Truncated);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let end = 4 + len;
    if bytes.len() < end {
        return Err(WireError::Truncated);
    }
    let value = serde_json::from_slice(&bytes[4..end])?;
    Ok((value, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKey;

    #[test]
    fn test_frame_round_trip() {
        let update = ChunkUpdate::GpuMemory {
            source: SourceId(3),
            key: ChunkKey::new(1, -2, 3),
            buffer: Some(vec![1, 2, 3, 4]),
        };
        let frame = encode_frame(&update).unwrap();
        let (decoded, consumed): (ChunkUpdate, usize) = decode_frame(&frame).unwrap();
        assert_eq!(decoded, update);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_frames_concatenate() {
        let a = ChunkUpdate::Expired {
            source: SourceId(0),
            key: ChunkKey::new(0, 0, 0),
        };
        let b = ChunkUpdate::SystemMemory {
            source: SourceId(1),
            key: ChunkKey::new(5, 5, 5),
        };
        let mut stream = encode_frame(&a).unwrap();
        stream.extend(encode_frame(&b).unwrap());

        let (first, consumed): (ChunkUpdate, usize) = decode_frame(&stream).unwrap();
        let (second, _): (ChunkUpdate, usize) = decode_frame(&stream[consumed..]).unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
    }

    #[test]
    fn test_truncated_frame() {
        let frame = encode_frame(&PriorityDelta {
            source: SourceId(0),
            key: ChunkKey::new(0, 0, 0),
            tier: PriorityTier::Visible,
            priority: 1.0,
        })
        .unwrap();
        let result: Result<(PriorityDelta, usize), _> = decode_frame(&frame[..frame.len() - 1]);
        assert!(matches!(result, Err(WireError::Truncated)));
    }
}
