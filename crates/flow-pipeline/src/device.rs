//! Capture device setup and the read-event surface the capture worker loops on.
//!
//! Live handles are opened promiscuous with a 500 ms read timeout so the
//! worker regains control on quiet interfaces; offline handles replay a pcap
//! file at full speed. Both apply an optional BPF filter at setup time.
//! Unsupported link types are a fatal setup error — the per-packet decoder
//! relies on a fixed link-header offset.

use anyhow::{anyhow, bail, Context, Result};
use pcap::{Active, Capture, Device, Error as PcapError, Offline, Packet};
use std::path::Path;
use tracing::info;

/// Read timeout for live captures, milliseconds.
const READ_TIMEOUT_MS: i32 = 500;

// Link types we can decode, with their fixed header lengths.
const DLT_NULL: i32 = 0;
const DLT_EN10MB: i32 = 1;
const DLT_PPP: i32 = 9;
const DLT_RAW: i32 = 12;
const DLT_IEEE802_11: i32 = 105;
const DLT_LOOP: i32 = 108;
const DLT_LINUX_SLL: i32 = 113;

pub fn link_offset(linktype: i32) -> Option<usize> {
    match linktype {
        DLT_RAW => Some(0),
        DLT_PPP => Some(2),
        DLT_NULL => Some(4),
        DLT_EN10MB | DLT_LOOP => Some(14),
        DLT_LINUX_SLL => Some(16),
        DLT_IEEE802_11 => Some(22),
        _ => None,
    }
}

pub fn is_ethernet(linktype: i32) -> bool {
    linktype == DLT_EN10MB
}

enum Handle {
    Live(Capture<Active>),
    File(Capture<Offline>),
}

/// One capture read, borrowed from the handle's internal buffer.
pub enum ReadOutcome<'p> {
    Packet(Packet<'p>),
    /// Live idle cycle — the read timeout expired without traffic.
    Timeout,
    /// End of an offline file.
    Eof,
}

pub struct PacketDevice {
    handle: Handle,
    pub snaplen: i32,
    pub linktype: i32,
    pub link_offset: usize,
    pub live: bool,
}

impl PacketDevice {
    pub fn open_live(
        device: Option<&str>,
        filter: Option<&str>,
        snaplen: i32,
        buffer_mb: Option<i32>,
    ) -> Result<Self> {
        let name = match device {
            Some(name) => name.to_string(),
            None => {
                let dev = Device::lookup().context("no default capture device")?;
                info!("listen on {}", dev.name);
                dev.name
            }
        };

        let mut inactive = Capture::from_device(name.as_str())
            .with_context(|| format!("open device {name}"))?
            .promisc(true)
            .snaplen(snaplen)
            .timeout(READ_TIMEOUT_MS);
        if let Some(mb) = buffer_mb {
            inactive = inactive.buffer_size(mb * 1024 * 1024);
        }
        let mut capture = inactive
            .open()
            .with_context(|| format!("activate capture on {name}"))?;
        if let Some(expr) = filter {
            capture
                .filter(expr)
                .with_context(|| format!("compile filter '{expr}'"))?;
        }

        Self::from_handle(Handle::Live(capture), snaplen, true)
    }

    pub fn open_file(path: &Path, filter: Option<&str>, snaplen: i32) -> Result<Self> {
        let mut capture = Capture::from_file(path)
            .with_context(|| format!("open pcap file {}", path.display()))?;
        if let Some(expr) = filter {
            capture
                .filter(expr)
                .with_context(|| format!("compile filter '{expr}'"))?;
        }
        Self::from_handle(Handle::File(capture), snaplen, false)
    }

    fn from_handle(handle: Handle, snaplen: i32, live: bool) -> Result<Self> {
        let linktype = match &handle {
            Handle::Live(c) => c.get_datalink().0,
            Handle::File(c) => c.get_datalink().0,
        };
        let link_offset =
            link_offset(linktype).ok_or_else(|| anyhow!("unsupported data link type {linktype}"))?;
        Ok(Self {
            handle,
            snaplen,
            linktype,
            link_offset,
            live,
        })
    }

    /// Pull the next packet. Timeouts and EOF are events, not errors.
    pub fn next(&mut self) -> Result<ReadOutcome<'_>> {
        let result = match &mut self.handle {
            Handle::Live(c) => c.next(),
            Handle::File(c) => c.next(),
        };
        match result {
            Ok(packet) => Ok(ReadOutcome::Packet(packet)),
            Err(PcapError::TimeoutExpired) => Ok(ReadOutcome::Timeout),
            Err(PcapError::NoMorePackets) => Ok(ReadOutcome::Eof),
            Err(e) => Err(e).context("read packet"),
        }
    }

    /// Log libpcap's receive/drop counters (live captures only).
    pub fn log_drop_stats(&mut self) {
        if let Handle::Live(c) = &mut self.handle {
            match c.stats() {
                Ok(s) => info!(
                    "capture stats: received: {}, dropped: {}, dropped by interface: {}",
                    s.received, s.dropped, s.if_dropped
                ),
                Err(e) => info!("pcap stats unavailable: {}", e),
            }
        }
    }

    /// Validate CLI bounds shared by both open paths.
    pub fn check_snaplen(snaplen: i32) -> Result<()> {
        // Ethernet + IPv4 + TCP with no payload.
        if snaplen < 14 + 20 + 20 {
            bail!("snaplen < 54: too short for TCP/IPv4 headers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_offsets_match_decoder_table() {
        assert_eq!(link_offset(DLT_RAW), Some(0));
        assert_eq!(link_offset(DLT_PPP), Some(2));
        assert_eq!(link_offset(DLT_NULL), Some(4));
        assert_eq!(link_offset(DLT_EN10MB), Some(14));
        assert_eq!(link_offset(DLT_LOOP), Some(14));
        assert_eq!(link_offset(DLT_LINUX_SLL), Some(16));
        assert_eq!(link_offset(DLT_IEEE802_11), Some(22));
    }

    #[test]
    fn unknown_linktype_is_rejected() {
        assert_eq!(link_offset(147), None);
    }

    #[test]
    fn snaplen_floor() {
        assert!(PacketDevice::check_snaplen(54).is_ok());
        assert!(PacketDevice::check_snaplen(53).is_err());
    }
}
