//! Flow worker: owns the flow tree and the flow-record output files.
//!
//! Consumes node events in capture order. The observation clock is the node
//! timestamp, never the wall clock, so replayed files rotate exactly like
//! live traffic did. A rotation (window boundary crossed, or shutdown)
//! expires/flushes the tree into the open `.current` file, patches its stat
//! record, publishes it under its window name with an atomic rename, updates
//! the bookkeeper, and opens the next file.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

use crate::books::Bookkeeper;
use crate::extmap::ExtensionSet;
use crate::flowtree::FlowTree;
use crate::nffile::{Compression, ExporterStat, FlowFile};
use crate::node::{FlowNode, NodeEvent};
use crate::nodelist::NodeReceiver;
use crate::rotation;
use crate::worker::{notify, SupervisorTx, WorkerEvent};

/// Expiry pass cadence, in observation-clock seconds.
const EXPIRE_INTERVAL_SECS: i64 = 10;

pub struct FlowConfig {
    pub flow_dir: PathBuf,
    pub ident: String,
    pub t_win: i64,
    pub subdir_index: u32,
    pub time_extension: &'static str,
    pub compression: Compression,
    pub extensions: ExtensionSet,
    pub cache_size: usize,
    pub active_secs: u64,
    pub inactive_secs: u64,
}

pub fn spawn_flow(
    config: FlowConfig,
    nodes: NodeReceiver,
    done: Arc<AtomicBool>,
    books: Arc<Mutex<Bookkeeper>>,
    supervisor: SupervisorTx,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("flow".into())
        .spawn(move || flow_loop(config, nodes, done, books, supervisor))
}

fn write_flow(file: &mut FlowFile, extensions: &ExtensionSet, mut node: FlowNode) {
    if !extensions.interfaces() {
        node.input = 0;
        node.output = 0;
    }
    if !extensions.fragments() {
        node.frag = None;
    }
    debug!(
        "emit flow: proto {} {}:{} -> {}:{} packets {} bytes {}",
        node.key.proto,
        node.key.src_addr,
        node.key.src_port,
        node.key.dst_addr,
        node.key.dst_port,
        node.packets,
        node.bytes
    );
    if let Err(e) = file.add_flow(&node) {
        error!("failed to write flow record: {}", e);
    }
}

fn flow_loop(
    config: FlowConfig,
    nodes: NodeReceiver,
    done: Arc<AtomicBool>,
    books: Arc<Mutex<Bookkeeper>>,
    supervisor: SupervisorTx,
) {
    let pid = std::process::id();
    let mut tree = FlowTree::new(config.cache_size, config.active_secs, config.inactive_secs);

    let mut file = match FlowFile::create(
        &config.flow_dir,
        pid,
        &config.ident,
        config.compression,
        &config.extensions,
    ) {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open flow file in {}: {}", config.flow_dir.display(), e);
            notify(&supervisor, WorkerEvent::FlowFailed);
            return;
        }
    };

    let mut t_start: i64 = 0;
    let mut t_clock: i64 = 0;
    let mut last_expire: i64 = 0;

    loop {
        let event = nodes.pop(&done);
        let mut finished = false;
        let node = match event {
            Some(NodeEvent::Flow(node)) => {
                t_clock = (node.last_us / 1_000_000) as i64;
                Some(node)
            }
            Some(NodeEvent::Rotate { epoch }) => {
                t_clock = epoch;
                None
            }
            None => {
                finished = true;
                None
            }
        };

        if t_start == 0 && t_clock != 0 {
            t_start = rotation::window_start(t_clock, config.t_win);
        }

        // A node from the next window closes the current one before it is
        // merged, so windows stay aligned to the packet clock.
        if (t_start != 0 && t_clock - t_start >= config.t_win) || finished {
            nodes.dump_stat();
            let emitted = if finished {
                tree.flush()
            } else {
                tree.expire(t_clock as u64 * 1_000_000)
            };
            let num_emitted = emitted.len();
            for flow in emitted {
                write_flow(&mut file, &config.extensions, flow);
            }

            let stat = file.stat;
            let (first_ms, last_ms) = if stat.has_data() {
                (stat.first_ms, stat.last_ms)
            } else {
                // Nothing collected this window: bracket the whole slot.
                (t_start as u64 * 1000, (t_start + config.t_win) as u64 * 1000)
            };
            let exporter = ExporterStat {
                ident: config.ident.clone(),
                flows: stat.flows,
                packets: stat.packets,
                bytes: stat.bytes,
            };

            let current = file.current_path().to_path_buf();
            match file.finalize(first_ms, last_ms, &exporter) {
                Ok(stat) => info!(
                    "ident '{}' flows: {}, packets: {}, bytes: {}, emitted: {}",
                    config.ident, stat.flows, stat.packets, stat.bytes, num_emitted
                ),
                Err(e) => error!("failed to close flow file: {}", e),
            }

            let target = rotation::target_path(
                &config.flow_dir,
                "nfcapd",
                config.subdir_index,
                t_start,
                config.time_extension,
            );
            match fs::rename(&current, &target) {
                Err(e) => {
                    // Books are not updated for a window that failed to
                    // publish, or the totals would drift from disk reality.
                    error!("can't rename dump file {}: {}", current.display(), e);
                    error!("serious problem, fix manually");
                }
                Ok(()) => {
                    let size = fs::metadata(&target).map(|m| m.blocks() * 512).unwrap_or(0);
                    books.lock().unwrap().update(t_start, size);
                }
            }

            if finished {
                break;
            }

            t_start = rotation::window_start(t_clock, config.t_win);
            file = match FlowFile::create(
                &config.flow_dir,
                pid,
                &config.ident,
                config.compression,
                &config.extensions,
            ) {
                Ok(f) => f,
                Err(e) => {
                    error!("fatal: failed to open next flow file: {}", e);
                    notify(&supervisor, WorkerEvent::FlowFailed);
                    return;
                }
            };
        }

        if let Some(node) = node {
            let when = (node.last_us / 1_000_000) as i64;
            tree.merge(*node);
            if when - last_expire > EXPIRE_INTERVAL_SECS {
                for flow in tree.expire(when as u64 * 1_000_000) {
                    write_flow(&mut file, &config.extensions, flow);
                }
                last_expire = when;
            }
        }
        for flow in tree.cache_check() {
            write_flow(&mut file, &config.extensions, flow);
        }
    }

    info!("terminating flow processing, {} flows evicted by cache pressure", tree.evicted);
}
