//! End-to-end pipeline tests: replay a synthetic pcap file through the
//! capture and flow workers and check the published output windows.

use etherparse::PacketBuilder;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flow_pipeline::{
    node_list, spawn_capture, spawn_flow, Bookkeeper, CaptureConfig, Compression, ExtensionSet,
    FlowConfig, FlowFileReader, PacketDevice,
};

// Window-aligned base timestamp (divisible by 300 and 60).
const BASE: u64 = 1_699_999_800;

fn tcp_frame(src_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(src_port, 80, 1, 8192);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

fn udp_frame(src_port: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
        .ipv4([10, 0, 0, 3], [10, 0, 0, 4], 64)
        .udp(src_port, 53);
    let mut frame = Vec::with_capacity(builder.size(8));
    builder.write(&mut frame, &[0u8; 8]).unwrap();
    frame
}

fn write_pcap(path: &Path, packets: &[(u64, Vec<u8>)]) {
    let header = PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: 65535,
        datalink: DataLink::ETHERNET,
        ts_resolution: TsResolution::MicroSecond,
        endianness: Endianness::native(),
    };
    let mut writer = PcapWriter::with_header(File::create(path).unwrap(), header).unwrap();
    for (ts_us, frame) in packets {
        let pkt = PcapPacket::new(
            Duration::from_micros(*ts_us),
            frame.len() as u32,
            frame,
        );
        writer.write_packet(&pkt).unwrap();
    }
}

fn run_pipeline(input: &Path, flow_dir: &Path, pcap_dir: Option<&Path>, t_win: i64, inactive: u64) {
    let device = PacketDevice::open_file(input, None, 1526).unwrap();
    let (node_tx, node_rx) = node_list();
    let (sup_tx, _sup_rx) = crossbeam_channel::unbounded();
    let books = Arc::new(Mutex::new(Bookkeeper::new(flow_dir)));

    let flow_handle = spawn_flow(
        FlowConfig {
            flow_dir: flow_dir.to_path_buf(),
            ident: "test".into(),
            t_win,
            subdir_index: 0,
            time_extension: flow_pipeline::rotation::time_extension(t_win),
            compression: Compression::None,
            extensions: ExtensionSet::default(),
            cache_size: 1024,
            active_secs: 300,
            inactive_secs: inactive,
        },
        node_rx,
        Arc::new(AtomicBool::new(false)),
        books,
        sup_tx.clone(),
    )
    .unwrap();

    let capture_handle = spawn_capture(
        device,
        CaptureConfig {
            t_win,
            pcap_dir: pcap_dir.map(|p| p.to_path_buf()),
            subdir_index: 0,
            time_extension: flow_pipeline::rotation::time_extension(t_win),
        },
        node_tx,
        Arc::new(AtomicBool::new(false)),
        sup_tx,
    )
    .unwrap();

    capture_handle.join().unwrap();
    flow_handle.join().unwrap();
}

fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with(prefix)
        })
        .collect();
    files.sort();
    files
}

#[test]
fn single_tcp_flow_single_window() {
    let input_dir = tempfile::tempdir().unwrap();
    let flow_dir = tempfile::tempdir().unwrap();
    let input = input_dir.path().join("input.pcap");

    // 100 packets of one connection spread over 30 seconds.
    let packets: Vec<(u64, Vec<u8>)> = (0..100u64)
        .map(|i| ((BASE * 1_000_000) + i * 300_000, tcp_frame(40000, b"data")))
        .collect();
    write_pcap(&input, &packets);

    run_pipeline(&input, flow_dir.path(), None, 60, 60);

    let files = files_with_prefix(flow_dir.path(), "nfcapd.");
    assert_eq!(files.len(), 1);
    assert!(files_with_prefix(flow_dir.path(), "nfcapd.current").is_empty());

    let back = FlowFileReader::read(&files[0]).unwrap();
    assert_eq!(back.flows.len(), 1);
    let flow = &back.flows[0];
    assert_eq!(flow.packets, 100);
    assert_eq!(flow.first_us, BASE * 1_000_000);
    assert_eq!(flow.last_us, BASE * 1_000_000 + 99 * 300_000);
    assert_eq!(back.stat.packets, 100);
    assert_eq!(back.exporter.unwrap().packets, 100);
}

#[test]
fn rotation_splits_windows_on_the_packet_clock() {
    let input_dir = tempfile::tempdir().unwrap();
    let flow_dir = tempfile::tempdir().unwrap();
    let input = input_dir.path().join("input.pcap");

    // 10 packets at t=0..5s and 10 at t=65..70s, one-minute windows.
    let mut packets = Vec::new();
    for i in 0..10u64 {
        packets.push(((BASE + i / 2) * 1_000_000, udp_frame(1000)));
    }
    for i in 0..10u64 {
        packets.push(((BASE + 65 + i / 2) * 1_000_000, udp_frame(2000)));
    }
    write_pcap(&input, &packets);

    run_pipeline(&input, flow_dir.path(), None, 60, 60);

    let files = files_with_prefix(flow_dir.path(), "nfcapd.");
    assert_eq!(files.len(), 2);

    let first = FlowFileReader::read(&files[0]).unwrap();
    let second = FlowFileReader::read(&files[1]).unwrap();
    assert_eq!(first.stat.packets, 10);
    assert_eq!(second.stat.packets, 10);
    assert!(first.stat.last_ms < second.stat.first_ms);

    // Every record of a window falls inside it.
    for flow in &first.flows {
        let last_s = flow.last_us / 1_000_000;
        assert!((BASE..BASE + 60).contains(&last_s));
    }
}

#[test]
fn idle_flow_keeps_its_real_last_seen() {
    let input_dir = tempfile::tempdir().unwrap();
    let flow_dir = tempfile::tempdir().unwrap();
    let input = input_dir.path().join("input.pcap");

    // 5 TCP packets, then 75 quiet seconds before an unrelated packet moves
    // the observation clock past the inactive timer.
    let mut packets: Vec<(u64, Vec<u8>)> = (0..5u64)
        .map(|i| ((BASE + i) * 1_000_000, tcp_frame(41000, b"x")))
        .collect();
    packets.push(((BASE + 80) * 1_000_000, udp_frame(3000)));
    write_pcap(&input, &packets);

    run_pipeline(&input, flow_dir.path(), None, 300, 60);

    let files = files_with_prefix(flow_dir.path(), "nfcapd.");
    assert_eq!(files.len(), 1);
    let back = FlowFileReader::read(&files[0]).unwrap();
    assert_eq!(back.flows.len(), 2);

    let tcp = back.flows.iter().find(|f| f.key.proto == 6).unwrap();
    assert_eq!(tcp.packets, 5);
    // Expiry must not stretch last_seen to the window end.
    assert_eq!(tcp.last_us, (BASE + 4) * 1_000_000);
}

#[test]
fn pcap_output_duplicates_every_packet() {
    let input_dir = tempfile::tempdir().unwrap();
    let flow_dir = tempfile::tempdir().unwrap();
    let pcap_dir = tempfile::tempdir().unwrap();
    let input = input_dir.path().join("input.pcap");

    let packets: Vec<(u64, Vec<u8>)> = (0..50u64)
        .map(|i| ((BASE + i) * 1_000_000, udp_frame(4000 + i as u16)))
        .collect();
    write_pcap(&input, &packets);

    run_pipeline(&input, flow_dir.path(), Some(pcap_dir.path()), 300, 60);

    let pcap_files = files_with_prefix(pcap_dir.path(), "pcapd.");
    assert_eq!(pcap_files.len(), 1);
    assert!(files_with_prefix(pcap_dir.path(), "pcap.current").is_empty());

    let mut reader = PcapReader::new(File::open(&pcap_files[0]).unwrap()).unwrap();
    let mut copied = 0;
    while let Some(pkt) = reader.next_packet() {
        let pkt = pkt.unwrap();
        let ts_s = pkt.timestamp.as_secs();
        assert!((BASE..BASE + 300).contains(&ts_s));
        copied += 1;
    }
    assert_eq!(copied, 50);

    // Flow side accounted the same packets.
    let files = files_with_prefix(flow_dir.path(), "nfcapd.");
    assert_eq!(files.len(), 1);
    let back = FlowFileReader::read(&files[0]).unwrap();
    assert_eq!(back.stat.packets, 50);
}

#[test]
fn replays_are_deterministic() {
    let input_dir = tempfile::tempdir().unwrap();
    let input = input_dir.path().join("input.pcap");
    let packets: Vec<(u64, Vec<u8>)> = (0..30u64)
        .map(|i| ((BASE + i * 2) * 1_000_000, tcp_frame(5000 + (i % 3) as u16, b"abc")))
        .collect();
    write_pcap(&input, &packets);

    let run = |flow_dir: &Path| {
        run_pipeline(&input, flow_dir, None, 300, 60);
        let files = files_with_prefix(flow_dir, "nfcapd.");
        assert_eq!(files.len(), 1);
        let back = FlowFileReader::read(&files[0]).unwrap();
        let mut flows = back.flows;
        flows.sort_by_key(|f| f.key.src_port);
        flows
    };

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    assert_eq!(run(dir_a.path()), run(dir_b.path()));
}
