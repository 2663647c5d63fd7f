//! Worker-to-supervisor event bus types.
//!
//! Workers report completion and fatal errors over a channel instead of
//! raising signals at the main thread; the supervisor selects over this bus
//! and the process signal stream.

use crossbeam_channel::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Capture finished on its own: end of file, or a fatal read error.
    CaptureDone { error: bool },
    /// The flow worker could not continue (flow file open failure).
    FlowFailed,
    /// The pcap flusher could not open its next output file.
    PcapFlushFailed,
}

pub type SupervisorTx = Sender<WorkerEvent>;

/// Fire-and-forget notify; the supervisor may already be gone during teardown.
pub fn notify(tx: &SupervisorTx, event: WorkerEvent) {
    let _ = tx.send(event);
}
