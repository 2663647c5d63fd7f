//! Capture worker: the packet-facing end of the pipeline.
//!
//! Pulls packets off the device, fans every decoded flow node onto the node
//! channel, and — when pcap output is configured — duplicates the raw record
//! into the spool, driving spool rotation off the packet clock. On live
//! captures the idle tick (read timeout) checks the wall clock so rotation
//! happens on quiet links too, and injects a rotate event for the flow stage.
//!
//! The pcap flush worker is spawned and joined here; the supervisor only ever
//! sees the capture thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};

use crate::decode::{PacketDecoder, ProcStat};
use crate::device::{PacketDevice, ReadOutcome};
use crate::node::NodeEvent;
use crate::nodelist::NodeSender;
use crate::rotation;
use crate::spool::{spawn_flush_worker, FlushConfig, PcapSpool};
use crate::worker::{notify, SupervisorTx, WorkerEvent};

pub struct CaptureConfig {
    pub t_win: i64,
    pub pcap_dir: Option<PathBuf>,
    pub subdir_index: u32,
    pub time_extension: &'static str,
}

pub fn spawn_capture(
    device: PacketDevice,
    config: CaptureConfig,
    nodes: NodeSender,
    done: Arc<AtomicBool>,
    supervisor: SupervisorTx,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("capture".into())
        .spawn(move || capture_loop(device, config, nodes, done, supervisor))
}

fn capture_loop(
    mut device: PacketDevice,
    config: CaptureConfig,
    nodes: NodeSender,
    done: Arc<AtomicBool>,
    supervisor: SupervisorTx,
) {
    let mut decoder = PacketDecoder::new(device.linktype, device.link_offset);
    let mut stat = ProcStat::default();

    // Start the flusher first so the spool has a drain before any append.
    let (spool, flush_handle) = match &config.pcap_dir {
        Some(dir) => {
            let spool = PcapSpool::new();
            let flush_config = FlushConfig {
                pcap_dir: dir.clone(),
                subdir_index: config.subdir_index,
                time_extension: config.time_extension,
                snaplen: device.snaplen as u32,
                linktype: device.linktype,
            };
            match spawn_flush_worker(spool.clone(), flush_config, supervisor.clone()) {
                Ok(handle) => (Some(spool), Some(handle)),
                Err(e) => {
                    error!("failed to start pcap flush worker: {}", e);
                    nodes.close();
                    notify(&supervisor, WorkerEvent::CaptureDone { error: true });
                    return;
                }
            }
        }
        None => (None, None),
    };

    let mut t_start: i64 = 0;
    let mut read_error = false;

    loop {
        let mut idle_tick = false;
        match device.next() {
            Ok(ReadOutcome::Packet(packet)) => {
                let hdr = *packet.header;
                let t_clock = hdr.ts.tv_sec as i64;
                let ts_us = hdr.ts.tv_sec as u64 * 1_000_000 + hdr.ts.tv_usec as u64;

                for node in decoder.process(ts_us, hdr.len, packet.data, &mut stat) {
                    nodes.push(NodeEvent::Flow(Box::new(node)));
                }

                if let Some(spool) = &spool {
                    if t_clock - t_start >= config.t_win {
                        // First packet, or a window boundary crossed.
                        if t_start != 0 {
                            spool.rotate(t_start);
                        }
                        t_start = rotation::window_start(t_clock, config.t_win);
                    }
                    let ts = Duration::new(hdr.ts.tv_sec as u64, hdr.ts.tv_usec as u32 * 1000);
                    spool.append(ts, hdr.len, packet.data);
                }
            }
            Ok(ReadOutcome::Timeout) => idle_tick = true,
            Ok(ReadOutcome::Eof) => {
                info!("end of capture file");
                stat.log();
                done.store(true, Relaxed);
            }
            Err(e) => {
                error!("packet read error: {:#}", e);
                read_error = true;
                done.store(true, Relaxed);
            }
        }

        if idle_tick {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            let t_clock = now.as_secs() as i64;
            if t_clock - t_start >= config.t_win {
                if t_start != 0 {
                    nodes.push(NodeEvent::Rotate { epoch: t_clock });
                    if let Some(spool) = &spool {
                        spool.rotate(t_start);
                    }
                    stat.log();
                    device.log_drop_stats();
                    stat.reset();
                }
                t_start = rotation::window_start(t_clock, config.t_win);
            }
        }

        if done.load(Relaxed) {
            break;
        }
    }

    // Leaf-first teardown: close the spool and wait for the flusher before
    // reporting back.
    if let Some(spool) = &spool {
        spool.shutdown(t_start);
    }
    if let Some(handle) = flush_handle {
        if handle.join().is_err() {
            error!("pcap flush worker panicked");
            read_error = true;
        }
    }

    stat.log();
    if decoder.pending_fragments() > 0 {
        info!("{} unfinished fragment reassemblies", decoder.pending_fragments());
    }
    nodes.close();
    info!("terminating packet capture");
    notify(&supervisor, WorkerEvent::CaptureDone { error: read_error });
}
