//! Double-buffered pcap output spool and its flush worker.
//!
//! The capture thread appends encoded pcap records to the active slot; the
//! flush worker owns the file descriptor and drains the staged slot. The
//! mutex protects only the slot swap and the rotation trigger, so at most one
//! slot is ever subject to file I/O while the other keeps accepting appends.
//!
//! Rotation protocol: capture waits for the staged slot to drain, swaps so
//! the closing window's bytes are staged, stamps `close_rename` with the
//! window start, and signals. The flusher drains, closes, renames
//! `pcap.current.<pid>` to its `pcapd.<TS>` name, and opens the next file.

use pcap_file::pcap::{PcapHeader, PcapPacket};
use pcap_file::{DataLink, Endianness, TsResolution};
use pcap_file::byteorder_slice::{BigEndian, LittleEndian};
use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::rotation;
use crate::worker::{notify, SupervisorTx, WorkerEvent};

/// Slot capacity; a swap is forced once an append would overflow this.
const SPOOL_BUFFER_BYTES: usize = 1024 * 1024;
/// Per-record pcap framing overhead.
const RECORD_HEADER_BYTES: usize = 16;

struct SpoolState {
    active: Vec<u8>,
    staged: Vec<u8>,
    /// Window start of a pending close; 0 = no rotation requested.
    close_rename: i64,
    done: bool,
}

pub struct PcapSpool {
    state: Mutex<SpoolState>,
    cond: Condvar,
    endianness: Endianness,
}

impl PcapSpool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SpoolState {
                active: Vec::with_capacity(SPOOL_BUFFER_BYTES),
                staged: Vec::with_capacity(SPOOL_BUFFER_BYTES),
                close_rename: 0,
                done: false,
            }),
            cond: Condvar::new(),
            endianness: Endianness::native(),
        })
    }

    /// Append one raw packet record to the active slot, swapping first if the
    /// slot is full. Encoding errors are logged and dropped — pcap output
    /// failures never stop capture.
    pub fn append(&self, ts: Duration, orig_len: u32, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if state.done {
            return;
        }
        if !state.active.is_empty()
            && state.active.len() + RECORD_HEADER_BYTES + data.len() > SPOOL_BUFFER_BYTES
        {
            while !state.staged.is_empty() && !state.done {
                state = self.cond.wait(state).unwrap();
            }
            if state.done {
                return;
            }
            let SpoolState { active, staged, .. } = &mut *state;
            std::mem::swap(active, staged);
            self.cond.notify_all();
        }

        let packet = PcapPacket {
            timestamp: ts,
            orig_len,
            data: Cow::Borrowed(data),
        };
        if let Err(e) = packet.write_to(&mut state.active, self.endianness, TsResolution::MicroSecond)
        {
            warn!("pcap spool encode error: {}", e);
        }
    }

    /// Request a file rotation at the close of the window starting at
    /// `t_start`. All bytes buffered so far belong to that window, so the
    /// active slot is staged wholesale.
    pub fn rotate(&self, t_start: i64) {
        let mut state = self.state.lock().unwrap();
        while !state.staged.is_empty() && !state.done {
            state = self.cond.wait(state).unwrap();
        }
        if state.done {
            return;
        }
        let SpoolState { active, staged, .. } = &mut *state;
        std::mem::swap(active, staged);
        state.close_rename = t_start;
        drop(state);
        self.cond.notify_all();
    }

    /// Final close: stage the last window and stop the flusher.
    pub fn shutdown(&self, t_start: i64) {
        let mut state = self.state.lock().unwrap();
        while !state.staged.is_empty() && !state.done {
            state = self.cond.wait(state).unwrap();
        }
        state.close_rename = t_start;
        state.done = true;
        drop(state);
        self.cond.notify_all();
    }
}

/// Everything the flush worker needs to cut and name files.
pub struct FlushConfig {
    pub pcap_dir: PathBuf,
    pub subdir_index: u32,
    pub time_extension: &'static str,
    pub snaplen: u32,
    pub linktype: i32,
}

fn open_current(cfg: &FlushConfig, path: &Path) -> io::Result<File> {
    let mut file = File::create(path)?;
    let header = PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: cfg.snaplen,
        datalink: DataLink::from(cfg.linktype as u32),
        ts_resolution: TsResolution::MicroSecond,
        endianness: Endianness::native(),
    };
    header
        .write_to(&mut file)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(file)
}

/// Spawn the flush worker. It opens the first `pcap.current.<pid>` itself;
/// failing to open an output file is fatal to the worker and reported on the
/// supervisor bus.
pub fn spawn_flush_worker(
    spool: Arc<PcapSpool>,
    cfg: FlushConfig,
    supervisor: SupervisorTx,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("pcap-flush".into())
        .spawn(move || flush_loop(&spool, &cfg, &supervisor))
}

fn flush_loop(spool: &PcapSpool, cfg: &FlushConfig, supervisor: &SupervisorTx) {
    let current = cfg
        .pcap_dir
        .join(format!("pcap.current.{}", std::process::id()));

    let mut file = match open_current(cfg, &current) {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open {}: {}", current.display(), e);
            fail(spool, supervisor);
            return;
        }
    };

    let mut state = spool.state.lock().unwrap();
    loop {
        while state.staged.is_empty() && !state.done && state.close_rename == 0 {
            state = spool.cond.wait(state).unwrap();
        }

        // The staged slot is ours while the mutex is held; capture only ever
        // touches the active slot.
        if !state.staged.is_empty() {
            if let Err(e) = file.write_all(&state.staged) {
                warn!("pcap write error: {}", e);
            }
            state.staged.clear();
        }

        if state.done && !state.active.is_empty() {
            if let Err(e) = file.write_all(&state.active) {
                warn!("pcap write error: {}", e);
            }
            state.active.clear();
        }

        if state.done || state.close_rename != 0 {
            let t_close = state.close_rename;
            state.close_rename = 0;
            let done = state.done;

            let target = rotation::target_path(
                &cfg.pcap_dir,
                "pcapd",
                cfg.subdir_index,
                t_close,
                cfg.time_extension,
            );
            if let Err(e) = file.sync_all() {
                warn!("pcap sync error: {}", e);
            }
            if let Err(e) = fs::rename(&current, &target) {
                error!(
                    "rename {} -> {} failed: {}",
                    current.display(),
                    target.display(),
                    e
                );
            } else {
                info!("pcap file rotated: {}", target.display());
            }

            if done {
                drop(state);
                spool.cond.notify_all();
                break;
            }

            file = match open_current(cfg, &current) {
                Ok(f) => f,
                Err(e) => {
                    error!("failed to open {}: {}", current.display(), e);
                    drop(state);
                    fail(spool, supervisor);
                    return;
                }
            };
        }

        drop(state);
        spool.cond.notify_all();
        state = spool.state.lock().unwrap();
    }
}

fn fail(spool: &PcapSpool, supervisor: &SupervisorTx) {
    {
        let mut state = spool.state.lock().unwrap();
        state.done = true;
    }
    spool.cond.notify_all();
    notify(supervisor, WorkerEvent::PcapFlushFailed);
}
