//! flowcapd — packet-capture-to-flow-record daemon.
//!
//! Reads packets from a live interface or a pcap file, tracks unidirectional
//! flows per 5-tuple, and publishes rotating flow record files plus optional
//! time-sliced pcap files. Run `flowcapd -h` for usage.

use clap::error::ErrorKind;
use clap::Parser;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod daemon;
mod supervisor;

use cli::Cli;
use flow_pipeline::{
    node_list, rotation, spawn_capture, spawn_flow, Bookkeeper, CaptureConfig, ExtensionSet,
    FlowConfig, PacketDevice,
};
use supervisor::EXIT_FATAL;

const EXIT_USAGE: i32 = 1;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let default_level = if cli.extended_debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(default_level.parse().expect("static directive")),
        )
        .init();

    // ── Option validation ────────────────────────────────────────────────
    if cli.interface.is_none() && cli.pcap_file.is_none() {
        error!("specify either a device (-i) or a pcap file (-r) to read packets from");
        return EXIT_USAGE;
    }
    if cli.t_win < 2 {
        error!("time interval < 2s not allowed");
        return EXIT_USAGE;
    }
    if let Err(e) = PacketDevice::check_snaplen(cli.snaplen) {
        error!("{}", e);
        return EXIT_USAGE;
    }
    if cli.cache_size == 0 {
        error!("cache size must not be 0");
        return EXIT_USAGE;
    }
    if let Some(mb) = cli.buffer_mb {
        if !(1..=2047).contains(&mb) {
            error!("buffer size in MB must be between 1..2047");
            return EXIT_USAGE;
        }
    }
    let (active, inactive) = match cli.expire_timers() {
        Ok(t) => t,
        Err(e) => {
            error!("{}", e);
            return EXIT_USAGE;
        }
    };

    let extensions = match ExtensionSet::parse(&cli.extension_tags) {
        Ok(set) => set,
        Err(e) => {
            error!("{}", e);
            return EXIT_FATAL;
        }
    };
    if !rotation::check_subdir_index(cli.subdir_index) {
        error!("unknown sub directory format index {}", cli.subdir_index);
        return EXIT_FATAL;
    }
    if !cli.flow_dir.is_dir() {
        error!("no such directory: '{}'", cli.flow_dir.display());
        return EXIT_FATAL;
    }
    if let Some(dir) = &cli.pcap_dir {
        if !dir.is_dir() {
            error!("no such directory: '{}'", dir.display());
            return EXIT_FATAL;
        }
    }

    let time_extension = rotation::time_extension(cli.t_win);

    // ── Capture handle, then drop privileges ─────────────────────────────
    let device = match &cli.pcap_file {
        Some(path) => PacketDevice::open_file(path, cli.filter.as_deref(), cli.snaplen),
        None => PacketDevice::open_live(
            cli.interface.as_deref(),
            cli.filter.as_deref(),
            cli.snaplen,
            cli.buffer_mb,
        ),
    };
    let device = match device {
        Ok(d) => d,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_FATAL;
        }
    };
    info!(
        "capture open: linktype {}, link offset {}, snaplen {}",
        device.linktype, device.link_offset, device.snaplen
    );

    if let Err(e) = daemon::set_privileges(cli.user.as_deref(), cli.group.as_deref()) {
        error!("{:#}", e);
        return EXIT_FATAL;
    }

    if let Some(pidfile) = &cli.pidfile {
        if let Err(e) = daemon::PidFile::check(pidfile) {
            error!("{:#}", e);
            return EXIT_FATAL;
        }
    }

    if cli.daemonize {
        if let Err(e) = daemon::daemonize() {
            error!("{:#}", e);
            return EXIT_FATAL;
        }
    }

    // Written after daemonizing: the double fork changes our pid.
    let pidfile = match &cli.pidfile {
        Some(path) => match daemon::PidFile::write(path) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("{:#}", e);
                return EXIT_FATAL;
            }
        },
        None => None,
    };

    info!("startup, ident '{}'", cli.ident);

    // ── Workers ──────────────────────────────────────────────────────────
    let signals = match supervisor::install_signals() {
        Ok(rx) => rx,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_FATAL;
        }
    };

    let (node_tx, node_rx) = node_list();
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let books = Arc::new(Mutex::new(Bookkeeper::new(&cli.flow_dir)));
    let capture_done = Arc::new(AtomicBool::new(false));
    let flow_done = Arc::new(AtomicBool::new(false));

    let flow = spawn_flow(
        FlowConfig {
            flow_dir: cli.flow_dir.clone(),
            ident: cli.ident.clone(),
            t_win: cli.t_win,
            subdir_index: cli.subdir_index,
            time_extension,
            compression: cli.compression(),
            extensions,
            cache_size: cli.cache_size,
            active_secs: active,
            inactive_secs: inactive,
        },
        node_rx,
        flow_done.clone(),
        books.clone(),
        event_tx.clone(),
    );
    let flow = match flow {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to start flow worker: {}", e);
            return EXIT_FATAL;
        }
    };

    let capture = spawn_capture(
        device,
        CaptureConfig {
            t_win: cli.t_win,
            pcap_dir: cli.pcap_dir.clone(),
            subdir_index: cli.subdir_index,
            time_extension,
        },
        node_tx,
        capture_done.clone(),
        event_tx,
    );
    let capture = match capture {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to start capture worker: {}", e);
            return EXIT_FATAL;
        }
    };

    // ── Wait, then tear down leaf-first ──────────────────────────────────
    let wait_code = supervisor::wait_done(&signals, &event_rx);
    let shutdown_code = supervisor::shutdown(supervisor::Workers {
        capture,
        capture_done,
        flow,
        flow_done,
    });

    if let Err(e) = books.lock().unwrap().save() {
        error!("failed to write book summary: {}", e);
    }
    if let Some(pidfile) = pidfile {
        pidfile.remove();
    }

    info!("terminating flowcapd");
    wait_code.max(shutdown_code)
}
