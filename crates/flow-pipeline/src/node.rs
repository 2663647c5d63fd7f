//! Flow key and flow node types shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// The 5-tuple a unidirectional flow is keyed on.
///
/// For ICMP/ICMPv6 the destination port carries `type << 8 | code` and the
/// source port is zero, so distinct message classes land in distinct flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub proto: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn icmp(src_addr: IpAddr, dst_addr: IpAddr, proto: u8, icmp_type: u8, icmp_code: u8) -> Self {
        Self {
            proto,
            src_addr,
            dst_addr,
            src_port: 0,
            dst_port: (icmp_type as u16) << 8 | icmp_code as u16,
        }
    }
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            proto: 0,
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
        }
    }
}

/// Fragmentation bookkeeping carried by flows assembled from IP fragments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragInfo {
    /// Number of fragments merged into this node.
    pub fragments: u32,
    /// At least one fragment arrived out of offset order.
    pub out_of_order: bool,
}

/// One unidirectional flow in progress.
///
/// Created by the capture stage — one node per decoded packet, or one per
/// completed reassembly — and merged into the flow tree by the flow stage.
/// Timestamps are microseconds since the epoch, taken from the packet header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub key: FlowKey,
    /// Ingress/egress interface indices; populated only when the extension
    /// set enables them (a single-device capture reports 0/0).
    pub input: u32,
    pub output: u32,
    pub first_us: u64,
    pub last_us: u64,
    pub packets: u64,
    pub bytes: u64,
    /// Accumulated TCP flag bits; zero for non-TCP flows.
    pub tcp_flags: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub frag: Option<FragInfo>,
}

impl FlowNode {
    /// A single-packet node: both timestamps equal, counts of one packet.
    pub fn from_packet(key: FlowKey, ts_us: u64, bytes: u64) -> Self {
        Self {
            key,
            input: 0,
            output: 0,
            first_us: ts_us,
            last_us: ts_us,
            packets: 1,
            bytes,
            tcp_flags: 0,
            icmp_type: 0,
            icmp_code: 0,
            frag: None,
        }
    }

    /// Fold another observation of the same 5-tuple into this node.
    pub fn merge(&mut self, other: &FlowNode) {
        debug_assert_eq!(self.key, other.key);
        self.first_us = self.first_us.min(other.first_us);
        self.last_us = self.last_us.max(other.last_us);
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.tcp_flags |= other.tcp_flags;
        if let Some(f) = other.frag {
            let agg = self.frag.get_or_insert(FragInfo::default());
            agg.fragments += f.fragments;
            agg.out_of_order |= f.out_of_order;
        }
    }
}

/// What travels over the node channel from capture to flow.
///
/// `Rotate` is the time-based rotation tick the live capture injects on idle
/// cycles; it carries the observation clock but no flow data.
#[derive(Debug)]
pub enum NodeEvent {
    Flow(Box<FlowNode>),
    Rotate { epoch: i64 },
}
