//! CLI definitions for flowcapd.
//!
//! Short flags follow the historical collector interface so existing startup
//! scripts keep working.

use clap::Parser;
use flow_pipeline::extmap;
use flow_pipeline::flowtree::{DEFAULT_ACTIVE_SECS, DEFAULT_CACHE_SIZE, DEFAULT_INACTIVE_SECS};
use flow_pipeline::Compression;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "flowcapd",
    version,
    about = "Packet-capture-to-flow-record daemon\n\nReads packets from an interface or a pcap file, tracks flows per 5-tuple, and writes rotating flow record files plus optional time-sliced pcap files.",
    long_about = None
)]
pub struct Cli {
    /// Read packets from this interface
    #[arg(short = 'i', value_name = "interface")]
    pub interface: Option<String>,

    /// Read packets from a pcap file
    #[arg(short = 'r', value_name = "pcapfile", conflicts_with = "interface")]
    pub pcap_file: Option<PathBuf>,

    /// Flow output directory
    #[arg(short = 'l', value_name = "flowdir", default_value = "/var/tmp")]
    pub flow_dir: PathBuf,

    /// Pcap output directory (optional; enables packet duplication)
    #[arg(short = 'p', value_name = "pcapdir")]
    pub pcap_dir: Option<PathBuf>,

    /// Sub directory hierarchy index (0 = flat, 1..8 = date layouts)
    #[arg(short = 'S', value_name = "num", default_value_t = 0)]
    pub subdir_index: u32,

    /// Ident string recorded in the output files
    #[arg(short = 'I', value_name = "ident", default_value = "none")]
    pub ident: String,

    /// Pidfile path
    #[arg(short = 'P', value_name = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// Time window in seconds to rotate pcap/flow files
    #[arg(short = 't', value_name = "seconds", default_value_t = 300)]
    pub t_win: i64,

    /// Snapshot length
    #[arg(short = 's', value_name = "snaplen", default_value_t = 1526)]
    pub snaplen: i32,

    /// Active and inactive flow expiry in seconds, e.g. 300,60
    #[arg(short = 'e', value_name = "active,inactive")]
    pub expire: Option<String>,

    /// Flow cache size
    #[arg(short = 'B', value_name = "num", default_value_t = DEFAULT_CACHE_SIZE)]
    pub cache_size: usize,

    /// Capture buffer size in MB (1..2047)
    #[arg(short = 'b', value_name = "MB")]
    pub buffer_mb: Option<i32>,

    /// Deflate-compress flows in output files
    #[arg(short = 'z', conflicts_with_all = ["lz4", "bzip2"])]
    pub deflate: bool,

    /// LZ4-compress flows in output files
    #[arg(short = 'y', conflicts_with = "bzip2")]
    pub lz4: bool,

    /// BZ2-compress flows in output files
    #[arg(short = 'j')]
    pub bzip2: bool,

    /// Extension tags to include in records ('all' or comma-separated)
    #[arg(short = 'T', value_name = "tags", default_value = extmap::DEFAULT_TAGS)]
    pub extension_tags: String,

    /// Extended debug output
    #[arg(short = 'E')]
    pub extended_debug: bool,

    /// Detach from the terminal (daemonize)
    #[arg(short = 'D')]
    pub daemonize: bool,

    /// Run as this user after setup
    #[arg(short = 'u', value_name = "userid")]
    pub user: Option<String>,

    /// Run as this group after setup
    #[arg(short = 'g', value_name = "groupid")]
    pub group: Option<String>,

    /// BPF filter expression
    #[arg(value_name = "filter")]
    pub filter: Option<String>,
}

impl Cli {
    pub fn compression(&self) -> Compression {
        if self.deflate {
            Compression::Deflate
        } else if self.lz4 {
            Compression::Lz4
        } else if self.bzip2 {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    /// Parse `-e active,inactive`, falling back to the defaults.
    pub fn expire_timers(&self) -> Result<(u64, u64), String> {
        let spec = match &self.expire {
            None => return Ok((DEFAULT_ACTIVE_SECS, DEFAULT_INACTIVE_SECS)),
            Some(s) => s,
        };
        let (active, inactive) = spec
            .split_once(',')
            .ok_or_else(|| format!("bad expiry spec '{spec}': expected active,inactive"))?;
        let active: u64 = active
            .trim()
            .parse()
            .map_err(|_| format!("bad active timeout '{active}'"))?;
        let inactive: u64 = inactive
            .trim()
            .parse()
            .map_err(|_| format!("bad inactive timeout '{inactive}'"))?;
        if active == 0 || inactive == 0 {
            return Err("expiry timeouts must be > 0".into());
        }
        Ok((active, inactive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_collector_conventions() {
        let cli = Cli::parse_from(["flowcapd", "-r", "x.pcap"]);
        assert_eq!(cli.t_win, 300);
        assert_eq!(cli.snaplen, 1526);
        assert_eq!(cli.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(cli.ident, "none");
        assert_eq!(cli.expire_timers().unwrap(), (300, 60));
        assert_eq!(cli.compression(), Compression::None);
    }

    #[test]
    fn compression_flags_map_to_codecs() {
        let cli = Cli::parse_from(["flowcapd", "-r", "x.pcap", "-y"]);
        assert_eq!(cli.compression(), Compression::Lz4);
        let cli = Cli::parse_from(["flowcapd", "-r", "x.pcap", "-j"]);
        assert_eq!(cli.compression(), Compression::Bzip2);
        let cli = Cli::parse_from(["flowcapd", "-r", "x.pcap", "-z"]);
        assert_eq!(cli.compression(), Compression::Deflate);
    }

    #[test]
    fn compression_flags_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["flowcapd", "-r", "x.pcap", "-z", "-y"]).is_err());
        assert!(Cli::try_parse_from(["flowcapd", "-r", "x.pcap", "-y", "-j"]).is_err());
    }

    #[test]
    fn interface_and_file_are_exclusive() {
        assert!(Cli::try_parse_from(["flowcapd", "-i", "eth0", "-r", "x.pcap"]).is_err());
    }

    #[test]
    fn expire_spec_parses_both_timers() {
        let cli = Cli::parse_from(["flowcapd", "-r", "x.pcap", "-e", "120,30"]);
        assert_eq!(cli.expire_timers().unwrap(), (120, 30));
        let cli = Cli::parse_from(["flowcapd", "-r", "x.pcap", "-e", "120"]);
        assert!(cli.expire_timers().is_err());
    }

    #[test]
    fn positional_filter_is_captured() {
        let cli = Cli::parse_from(["flowcapd", "-i", "eth0", "tcp port 80"]);
        assert_eq!(cli.filter.as_deref(), Some("tcp port 80"));
    }
}
