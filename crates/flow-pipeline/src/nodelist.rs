//! Single-producer single-consumer node FIFO between capture and flow.
//!
//! Push never blocks (the channel is unbounded; the flow stage drains much
//! faster than libpcap delivers). Pop blocks with a bounded timeout so the
//! consumer can observe its cancellation flag even while the producer is
//! alive but idle.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::node::NodeEvent;

const POP_TICK: Duration = Duration::from_millis(100);

/// Depth and throughput counters, reported at shutdown.
#[derive(Default)]
struct ListStat {
    pushed: AtomicU64,
    popped: AtomicU64,
    peak: AtomicU64,
}

pub struct NodeSender {
    tx: Sender<NodeEvent>,
    stat: Arc<ListStat>,
}

pub struct NodeReceiver {
    rx: Receiver<NodeEvent>,
    stat: Arc<ListStat>,
}

pub fn node_list() -> (NodeSender, NodeReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let stat = Arc::new(ListStat::default());
    (
        NodeSender { tx, stat: stat.clone() },
        NodeReceiver { rx, stat },
    )
}

impl NodeSender {
    pub fn push(&self, event: NodeEvent) {
        // The receiver only disappears after the producer is joined; a send
        // error here means shutdown is already past the point of caring.
        if self.tx.send(event).is_ok() {
            self.stat.pushed.fetch_add(1, Relaxed);
            let depth = self.tx.len() as u64;
            self.stat.peak.fetch_max(depth, Relaxed);
        }
    }

    /// Dropping the sender closes the list; `pop` drains what remains and
    /// then returns `None`.
    pub fn close(self) {}
}

impl NodeReceiver {
    /// Blocking pop with cancellation sensing.
    ///
    /// Returns `None` once the producer has disconnected and the queue is
    /// drained, or when `done` is observed while the queue is empty.
    pub fn pop(&self, done: &AtomicBool) -> Option<NodeEvent> {
        loop {
            match self.rx.recv_timeout(POP_TICK) {
                Ok(event) => {
                    self.stat.popped.fetch_add(1, Relaxed);
                    return Some(event);
                }
                Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) => {
                    if done.load(Relaxed) {
                        return None;
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dump_stat(&self) {
        info!(
            "node list: pushed: {}, popped: {}, peak depth: {}, pending: {}",
            self.stat.pushed.load(Relaxed),
            self.stat.popped.load(Relaxed),
            self.stat.peak.load(Relaxed),
            self.rx.len()
        );
    }
}
