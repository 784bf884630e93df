// src/client.rs - Viewer registry and per-viewer send queues
//
// Every viewer owns a byte-accounted FIFO queue drained by its worker
// thread. A queue that would exceed its budget marks the viewer for
// eviction; one stalled socket never holds up the broadcast or another
// viewer's bytes.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_VIEWER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique viewer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(u64);

impl ViewerId {
    pub fn next() -> ViewerId {
        ViewerId(NEXT_VIEWER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Why a viewer's connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown (WebSocket 1000).
    Normal,
    /// Service is faulted; refusing streams (WebSocket 1008).
    Policy,
    /// Internal failure or backpressure eviction (WebSocket 1011).
    Internal,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::Policy => 1008,
            CloseReason::Internal => 1011,
        }
    }
}

/// Messages travelling from the coordinator to a viewer worker.
#[derive(Debug)]
pub enum ViewerMsg {
    Data(Bytes),
    Close(CloseReason),
}

/// Builds the two halves of a viewer send queue with the given byte budget.
pub fn queue_pair(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let queued = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            queued: queued.clone(),
            capacity,
        },
        QueueReceiver { rx, queued },
    )
}

#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: Sender<ViewerMsg>,
    queued: Arc<AtomicUsize>,
    capacity: usize,
}

impl QueueSender {
    /// Enqueues stream data. Returns false when the byte budget is blown or
    /// the worker is gone; the caller evicts on false. An empty queue
    /// always accepts one message so a bootstrap blob larger than the
    /// budget cannot starve a fresh viewer.
    pub fn try_send(&self, data: Bytes) -> bool {
        let queued = self.queued.load(Ordering::Acquire);
        if queued > 0 && queued + data.len() > self.capacity {
            return false;
        }
        let len = data.len();
        if self.tx.send(ViewerMsg::Data(data)).is_err() {
            return false;
        }
        self.queued.fetch_add(len, Ordering::AcqRel);
        true
    }

    /// Queues a close command; always accepted.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.tx.send(ViewerMsg::Close(reason));
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct QueueReceiver {
    rx: Receiver<ViewerMsg>,
    queued: Arc<AtomicUsize>,
}

impl QueueReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ViewerMsg, RecvTimeoutError> {
        let msg = self.rx.recv_timeout(timeout)?;
        self.account(&msg);
        Ok(msg)
    }

    pub fn try_recv(&self) -> Result<ViewerMsg, TryRecvError> {
        let msg = self.rx.try_recv()?;
        self.account(&msg);
        Ok(msg)
    }

    fn account(&self, msg: &ViewerMsg) {
        if let ViewerMsg::Data(data) = msg {
            self.queued.fetch_sub(data.len(), Ordering::AcqRel);
        }
    }
}

pub struct Viewer {
    pub id: ViewerId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    queue: QueueSender,
}

impl Viewer {
    pub fn new(id: ViewerId, peer: SocketAddr, queue: QueueSender) -> Self {
        Self {
            id,
            peer,
            connected_at: Instant::now(),
            queue,
        }
    }
}

/// Registry of connected viewers plus the broadcast primitive.
#[derive(Default)]
pub struct ClientManager {
    viewers: HashMap<ViewerId, Viewer>,
    evicted_total: u64,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, viewer: Viewer) {
        info!(
            "{} connected from {} ({} viewer(s))",
            viewer.id,
            viewer.peer,
            self.viewers.len() + 1
        );
        self.viewers.insert(viewer.id, viewer);
    }

    /// Removes without sending anything; used when the worker already went
    /// away. Idempotent. Returns whether the viewer was present.
    pub fn remove(&mut self, id: ViewerId) -> bool {
        self.viewers.remove(&id).is_some()
    }

    /// Queues a close command and drops the viewer from the registry.
    pub fn close(&mut self, id: ViewerId, reason: CloseReason) {
        if let Some(viewer) = self.viewers.remove(&id) {
            viewer.queue.close(reason);
        }
    }

    pub fn close_all(&mut self, reason: CloseReason) {
        for (_, viewer) in self.viewers.drain() {
            viewer.queue.close(reason);
        }
    }

    pub fn count(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }

    pub fn contains(&self, id: ViewerId) -> bool {
        self.viewers.contains_key(&id)
    }

    /// Fans a chunk out to every viewer queue. Viewers whose queue is full
    /// are evicted with an internal-error close. Returns how many were
    /// evicted.
    pub fn broadcast(&mut self, data: &Bytes) -> usize {
        let mut overflowed = Vec::new();
        for viewer in self.viewers.values() {
            if !viewer.queue.try_send(data.clone()) {
                overflowed.push(viewer.id);
            }
        }
        for id in &overflowed {
            warn!(
                "{} cannot keep up ({} bytes queued); evicting",
                id,
                self.viewers
                    .get(id)
                    .map_or(0, |v| v.queue.queued_bytes())
            );
            self.close(*id, CloseReason::Internal);
        }
        self.evicted_total += overflowed.len() as u64;
        overflowed.len()
    }

    /// Sends a blob to a single viewer, evicting it on overflow.
    pub fn send_to(&mut self, id: ViewerId, data: Bytes) -> bool {
        let Some(viewer) = self.viewers.get(&id) else {
            return false;
        };
        if viewer.queue.try_send(data) {
            return true;
        }
        debug!("{} overflowed during direct send; evicting", id);
        self.close(id, CloseReason::Internal);
        self.evicted_total += 1;
        false
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<ViewerId> {
        self.viewers.keys().copied().collect()
    }
}
