//! Supervisor: signal routing and orderly worker shutdown.
//!
//! Termination signals are forwarded from a dedicated signal-iterator thread
//! onto a channel; workers report completion or fatal errors on a second
//! channel. The main thread selects over both, then tears the pipeline down
//! leaf-first: capture (which joins the pcap flusher itself), then flow.
//! Workers observe cancellation through their atomic flags at every blocking
//! point, so one store per worker is all it takes — no signal storms.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, Receiver};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

use flow_pipeline::WorkerEvent;

/// Exit code for fatal setup or worker failures.
pub const EXIT_FATAL: i32 = 255;

/// Ignore SIGPIPE and start the forwarder for termination signals.
/// SIGHUP is consumed and ignored so accidental terminal hangups are harmless.
pub fn install_signals() -> Result<Receiver<i32>> {
    // SAFETY: installing a disposition for SIGPIPE before threads start.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGHUP]).context("install signal handlers")?;
    let (tx, rx) = bounded(4);
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGHUP => info!("ignoring SIGHUP"),
                    _ => {
                        if tx.send(sig).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .context("spawn signal thread")?;
    Ok(rx)
}

pub struct Workers {
    pub capture: JoinHandle<()>,
    pub capture_done: Arc<AtomicBool>,
    pub flow: JoinHandle<()>,
    pub flow_done: Arc<AtomicBool>,
}

/// Block until a termination signal arrives or a worker reports in.
/// Returns the process exit code the run has earned so far.
pub fn wait_done(signals: &Receiver<i32>, events: &Receiver<WorkerEvent>) -> i32 {
    loop {
        select! {
            recv(signals) -> sig => {
                match sig {
                    Ok(sig) => info!("received signal {}, shutting down", sig),
                    Err(_) => error!("signal thread gone"),
                }
                return 0;
            }
            recv(events) -> event => {
                match event {
                    Ok(WorkerEvent::CaptureDone { error: false }) => return 0,
                    Ok(WorkerEvent::CaptureDone { error: true }) => return EXIT_FATAL,
                    Ok(WorkerEvent::FlowFailed) | Ok(WorkerEvent::PcapFlushFailed) => {
                        return EXIT_FATAL;
                    }
                    Err(_) => return 0,
                }
            }
        }
    }
}

/// Leaf-first teardown. The node channel closes when capture exits, so the
/// flow worker drains what is queued and cuts its final window.
pub fn shutdown(workers: Workers) -> i32 {
    let mut code = 0;

    workers.capture_done.store(true, Relaxed);
    if workers.capture.join().is_err() {
        error!("capture worker panicked");
        code = EXIT_FATAL;
    }

    workers.flow_done.store(true, Relaxed);
    if workers.flow.join().is_err() {
        error!("flow worker panicked");
        code = EXIT_FATAL;
    }

    code
}
