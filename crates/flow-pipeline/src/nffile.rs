//! Flow record file writer.
//!
//! On-disk layout: a fixed-size file header and stat record (both patched in
//! place when the file is closed), followed by blocks. Each block is a fixed
//! header plus a bincode payload, compressed whole with the configured codec.
//! The first block records the extension set the file was cut with; flow
//! blocks follow; one exporter-stat block is appended at close.
//!
//! The writer only ever produces `nfcapd.current.<pid>` files — publishing
//! under the final window name is the flow stage's rename, so readers never
//! observe a partially written file.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::extmap::ExtensionSet;
use crate::node::FlowNode;

const MAGIC: u16 = 0x4643;
const LAYOUT_VERSION: u16 = 1;
const IDENT_LEN: usize = 32;

/// Flush the open block once its raw payload reaches this size.
const BLOCK_FLUSH_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Deflate,
    Lz4,
    Bzip2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum BlockKind {
    Extensions,
    Flows,
    ExporterStat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct FileHeader {
    magic: u16,
    version: u16,
    compression: Compression,
    num_blocks: u32,
    ident: [u8; IDENT_LEN],
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlockHeader {
    kind: BlockKind,
    num_records: u32,
    raw_size: u32,
    disk_size: u32,
}

/// Per-window statistics, patched into the head of the file at close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRecord {
    pub flows: u64,
    pub flows_tcp: u64,
    pub flows_udp: u64,
    pub flows_icmp: u64,
    pub flows_other: u64,
    pub packets: u64,
    pub bytes: u64,
    pub first_ms: u64,
    pub last_ms: u64,
}

impl Default for StatRecord {
    fn default() -> Self {
        Self {
            flows: 0,
            flows_tcp: 0,
            flows_udp: 0,
            flows_icmp: 0,
            flows_other: 0,
            packets: 0,
            bytes: 0,
            first_ms: u64::MAX,
            last_ms: 0,
        }
    }
}

impl StatRecord {
    pub fn add(&mut self, node: &FlowNode) {
        self.flows += 1;
        match node.key.proto {
            6 => self.flows_tcp += 1,
            17 => self.flows_udp += 1,
            1 | 58 => self.flows_icmp += 1,
            _ => self.flows_other += 1,
        }
        self.packets += node.packets;
        self.bytes += node.bytes;
        self.first_ms = self.first_ms.min(node.first_us / 1000);
        self.last_ms = self.last_ms.max(node.last_us / 1000);
    }

    pub fn has_data(&self) -> bool {
        self.flows > 0
    }
}

/// Totals for the single exporter feeding this file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterStat {
    pub ident: String,
    pub flows: u64,
    pub packets: u64,
    pub bytes: u64,
}

fn ident_bytes(ident: &str) -> [u8; IDENT_LEN] {
    let mut out = [0u8; IDENT_LEN];
    let src = ident.as_bytes();
    let n = src.len().min(IDENT_LEN);
    out[..n].copy_from_slice(&src[..n]);
    out
}

fn to_io(e: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn compress(codec: Compression, raw: &[u8]) -> io::Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(raw.to_vec()),
        Compression::Deflate => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(raw)?;
            enc.finish()
        }
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(raw)),
        Compression::Bzip2 => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
            enc.write_all(raw)?;
            enc.finish()
        }
    }
}

fn decompress(codec: Compression, disk: &[u8], raw_size: usize) -> io::Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(disk.to_vec()),
        Compression::Deflate => {
            let mut out = Vec::with_capacity(raw_size);
            flate2::read::ZlibDecoder::new(disk).read_to_end(&mut out)?;
            Ok(out)
        }
        Compression::Lz4 => lz4_flex::decompress_size_prepended(disk)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Compression::Bzip2 => {
            let mut out = Vec::with_capacity(raw_size);
            bzip2::read::BzDecoder::new(disk).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

pub struct FlowFile {
    file: File,
    path: PathBuf,
    compression: Compression,
    num_blocks: u32,
    ident: [u8; IDENT_LEN],
    pub stat: StatRecord,
    block: Vec<u8>,
    block_records: u32,
}

impl FlowFile {
    /// Open `<dir>/nfcapd.current.<pid>` and lay down the header, the stat
    /// placeholder, and the extension-set block.
    pub fn create(
        dir: &Path,
        pid: u32,
        ident: &str,
        compression: Compression,
        extensions: &ExtensionSet,
    ) -> io::Result<Self> {
        let path = dir.join(format!("nfcapd.current.{pid}"));
        let file = File::create(&path)?;
        let mut nf = Self {
            file,
            path,
            compression,
            num_blocks: 0,
            ident: ident_bytes(ident),
            stat: StatRecord::default(),
            block: Vec::with_capacity(BLOCK_FLUSH_BYTES),
            block_records: 0,
        };
        nf.write_head()?;
        let payload = bincode::serialize(extensions).map_err(to_io)?;
        nf.write_block(BlockKind::Extensions, 1, &payload)?;
        Ok(nf)
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    fn write_head(&mut self) -> io::Result<()> {
        let header = FileHeader {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            compression: self.compression,
            num_blocks: self.num_blocks,
            ident: self.ident,
        };
        let mut head = bincode::serialize(&header).map_err(to_io)?;
        head.extend(bincode::serialize(&self.stat).map_err(to_io)?);
        self.file.write_all(&head)
    }

    fn write_block(&mut self, kind: BlockKind, num_records: u32, raw: &[u8]) -> io::Result<()> {
        let disk = compress(self.compression, raw)?;
        let header = BlockHeader {
            kind,
            num_records,
            raw_size: raw.len() as u32,
            disk_size: disk.len() as u32,
        };
        self.file
            .write_all(&bincode::serialize(&header).map_err(to_io)?)?;
        self.file.write_all(&disk)?;
        self.num_blocks += 1;
        Ok(())
    }

    /// Append one flow record to the open block, spilling at the block limit.
    pub fn add_flow(&mut self, node: &FlowNode) -> io::Result<()> {
        bincode::serialize_into(&mut self.block, node).map_err(to_io)?;
        self.block_records += 1;
        self.stat.add(node);
        if self.block.len() >= BLOCK_FLUSH_BYTES {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn has_pending_records(&self) -> bool {
        self.block_records > 0
    }

    pub fn flush_block(&mut self) -> io::Result<()> {
        if self.block_records == 0 {
            return Ok(());
        }
        let raw = std::mem::take(&mut self.block);
        let records = self.block_records;
        self.block_records = 0;
        self.write_block(BlockKind::Flows, records, &raw)
    }

    /// Flush, append the exporter block, patch the head, and close.
    ///
    /// `first_ms`/`last_ms` override the collected bracket (the flow stage
    /// synthesizes them for windows that saw no traffic). Returns the final
    /// stat record for logging.
    pub fn finalize(
        mut self,
        first_ms: u64,
        last_ms: u64,
        exporter: &ExporterStat,
    ) -> io::Result<StatRecord> {
        self.flush_block()?;
        let payload = bincode::serialize(exporter).map_err(to_io)?;
        self.write_block(BlockKind::ExporterStat, 1, &payload)?;

        self.stat.first_ms = first_ms;
        self.stat.last_ms = last_ms;

        self.file.seek(SeekFrom::Start(0))?;
        self.write_head()?;
        self.file.sync_all()?;
        Ok(self.stat)
    }
}

/// Read-back of a finished file, for verification and tooling.
pub struct FlowFileReader {
    pub ident: String,
    pub compression: Compression,
    pub stat: StatRecord,
    pub extensions: ExtensionSet,
    pub flows: Vec<FlowNode>,
    pub exporter: Option<ExporterStat>,
}

impl FlowFileReader {
    pub fn read(path: &Path) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let header: FileHeader =
            bincode::deserialize_from(&mut reader).map_err(to_io)?;
        if header.magic != MAGIC || header.version != LAYOUT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a flow file or unsupported layout",
            ));
        }
        let stat: StatRecord = bincode::deserialize_from(&mut reader).map_err(to_io)?;

        let mut extensions = ExtensionSet::default();
        let mut flows = Vec::new();
        let mut exporter = None;
        for _ in 0..header.num_blocks {
            let bh: BlockHeader = bincode::deserialize_from(&mut reader).map_err(to_io)?;
            let mut disk = vec![0u8; bh.disk_size as usize];
            reader.read_exact(&mut disk)?;
            let raw = decompress(header.compression, &disk, bh.raw_size as usize)?;
            match bh.kind {
                BlockKind::Extensions => {
                    extensions = bincode::deserialize(&raw).map_err(to_io)?;
                }
                BlockKind::Flows => {
                    let mut cur = io::Cursor::new(raw);
                    for _ in 0..bh.num_records {
                        flows.push(bincode::deserialize_from(&mut cur).map_err(to_io)?);
                    }
                }
                BlockKind::ExporterStat => {
                    exporter = Some(bincode::deserialize(&raw).map_err(to_io)?);
                }
            }
        }

        let ident_end = header
            .ident
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IDENT_LEN);
        let ident = String::from_utf8_lossy(&header.ident[..ident_end]).into_owned();

        Ok(Self {
            ident,
            compression: header.compression,
            stat,
            extensions,
            flows,
            exporter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FlowKey;

    fn node(port: u16, ts_s: u64, bytes: u64) -> FlowNode {
        let key = FlowKey {
            proto: 6,
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            src_port: port,
            dst_port: 80,
        };
        FlowNode::from_packet(key, ts_s * 1_000_000, bytes)
    }

    fn exporter(stat: &StatRecord) -> ExporterStat {
        ExporterStat {
            ident: "test".into(),
            flows: stat.flows,
            packets: stat.packets,
            bytes: stat.bytes,
        }
    }

    fn roundtrip(compression: Compression) {
        let dir = tempfile::tempdir().unwrap();
        let mut nf = FlowFile::create(
            dir.path(),
            1234,
            "test",
            compression,
            &ExtensionSet::default(),
        )
        .unwrap();
        assert!(nf
            .current_path()
            .to_str()
            .unwrap()
            .ends_with("nfcapd.current.1234"));

        for port in 0..100u16 {
            nf.add_flow(&node(port, 100 + port as u64, 1500)).unwrap();
        }
        let stat = nf.stat;
        let final_stat = nf
            .finalize(stat.first_ms, stat.last_ms, &exporter(&stat))
            .unwrap();
        assert_eq!(final_stat.flows, 100);

        let back =
            FlowFileReader::read(&dir.path().join("nfcapd.current.1234")).unwrap();
        assert_eq!(back.ident, "test");
        assert_eq!(back.compression, compression);
        assert_eq!(back.flows.len(), 100);
        assert_eq!(back.stat.flows, 100);
        assert_eq!(back.stat.flows_tcp, 100);
        assert_eq!(back.stat.packets, 100);
        assert_eq!(back.stat.bytes, 150_000);
        assert_eq!(back.stat.first_ms, 100_000);
        assert_eq!(back.stat.last_ms, 199_000);
        assert_eq!(back.exporter.unwrap().flows, 100);
        assert_eq!(back.flows[0].key.src_port, 0);
        assert_eq!(back.flows[99].key.src_port, 99);
    }

    #[test]
    fn roundtrip_uncompressed() {
        roundtrip(Compression::None);
    }

    #[test]
    fn roundtrip_deflate() {
        roundtrip(Compression::Deflate);
    }

    #[test]
    fn roundtrip_lz4() {
        roundtrip(Compression::Lz4);
    }

    #[test]
    fn roundtrip_bzip2() {
        roundtrip(Compression::Bzip2);
    }

    #[test]
    fn empty_window_keeps_synthesized_bracket() {
        let dir = tempfile::tempdir().unwrap();
        let nf = FlowFile::create(
            dir.path(),
            1,
            "none",
            Compression::None,
            &ExtensionSet::default(),
        )
        .unwrap();
        let stat = nf
            .finalize(
                1_000 * 1000,
                1_300 * 1000,
                &ExporterStat {
                    ident: "none".into(),
                    flows: 0,
                    packets: 0,
                    bytes: 0,
                },
            )
            .unwrap();
        assert_eq!(stat.flows, 0);

        let back = FlowFileReader::read(&dir.path().join("nfcapd.current.1")).unwrap();
        assert!(back.flows.is_empty());
        assert_eq!(back.stat.first_ms, 1_000_000);
        assert_eq!(back.stat.last_ms, 1_300_000);
    }

    #[test]
    fn large_files_span_multiple_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut nf = FlowFile::create(
            dir.path(),
            2,
            "big",
            Compression::Lz4,
            &ExtensionSet::default(),
        )
        .unwrap();
        for i in 0..2000u32 {
            nf.add_flow(&node((i % 65_000) as u16, i as u64, 64)).unwrap();
        }
        let stat = nf.stat;
        nf.finalize(stat.first_ms, stat.last_ms, &exporter(&stat))
            .unwrap();

        let back = FlowFileReader::read(&dir.path().join("nfcapd.current.2")).unwrap();
        assert_eq!(back.flows.len(), 2000);
        let bytes: u64 = back.flows.iter().map(|f| f.bytes).sum();
        assert_eq!(bytes, 2000 * 64);
    }
}
