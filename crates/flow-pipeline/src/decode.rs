//! Per-packet decoding: link layer → IP → transport → flow node.
//!
//! The link header is stripped by the fixed per-linktype offset (Ethernet
//! goes through real header parsing so VLAN tags are handled); the IP and
//! transport layers are sliced with `etherparse`. Every decodable packet
//! yields exactly one node; IPv4 fragments are diverted to the reassembly
//! table and surface as a single node when the datagram closes. Undecodable
//! packets only bump counters — the capture loop never stops for them.

use etherparse::{
    EtherType, Ethernet2Header, Icmpv4Slice, Icmpv6Header, IpNumber, Ipv4Header, Ipv6Header,
    SingleVlanHeader, TcpHeader, UdpHeader,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::info;

use crate::device;
use crate::ipfrag::FragmentTable;
use crate::node::{FlowKey, FlowNode};

// TCP flag bits accumulated on flow records.
const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;
const TCP_URG: u8 = 0x20;

/// Per-window packet processing counters, owned by the capture stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStat {
    pub packets: u64,
    pub skipped: u64,
    pub unknown: u64,
    pub short_snap: u64,
}

impl ProcStat {
    pub fn log(&self) {
        info!(
            "packet processing stats: total: {}, skipped: {}, unknown: {}, short snaplen: {}",
            self.packets, self.skipped, self.unknown, self.short_snap
        );
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct PacketDecoder {
    ethernet: bool,
    link_offset: usize,
    frags: FragmentTable,
}

impl PacketDecoder {
    pub fn new(linktype: i32, link_offset: usize) -> Self {
        Self {
            ethernet: device::is_ethernet(linktype),
            link_offset,
            frags: FragmentTable::new(),
        }
    }

    pub fn pending_fragments(&self) -> usize {
        self.frags.len()
    }

    /// Decode one captured packet.
    ///
    /// `wire_len` is the original on-the-wire length, `data` the (possibly
    /// snaplen-truncated) capture. Returns zero nodes for undecodable input,
    /// one for the common case, and one assembled node when a fragmented
    /// datagram completes.
    pub fn process(
        &mut self,
        ts_us: u64,
        wire_len: u32,
        data: &[u8],
        stat: &mut ProcStat,
    ) -> Vec<FlowNode> {
        stat.packets += 1;
        let truncated = (data.len() as u32) < wire_len;
        let short_or_skip = |stat: &mut ProcStat| {
            if truncated {
                stat.short_snap += 1;
            } else {
                stat.skipped += 1;
            }
        };

        // Strip the link layer.
        let (ip_slice, l2_len) = if self.ethernet {
            let (eth, mut rest) = match Ethernet2Header::from_slice(data) {
                Ok(t) => t,
                Err(_) => {
                    short_or_skip(stat);
                    return Vec::new();
                }
            };
            let mut ether_type = eth.ether_type;
            while matches!(
                ether_type,
                EtherType::VLAN_TAGGED_FRAME
                    | EtherType::PROVIDER_BRIDGING
                    | EtherType::VLAN_DOUBLE_TAGGED_FRAME
            ) {
                match SingleVlanHeader::from_slice(rest) {
                    Ok((vlan, after)) => {
                        ether_type = vlan.ether_type;
                        rest = after;
                    }
                    Err(_) => {
                        short_or_skip(stat);
                        return Vec::new();
                    }
                }
            }
            match ether_type {
                EtherType::IPV4 | EtherType::IPV6 => {}
                _ => {
                    stat.unknown += 1;
                    return Vec::new();
                }
            }
            (rest, data.len() - rest.len())
        } else {
            if data.len() <= self.link_offset {
                short_or_skip(stat);
                return Vec::new();
            }
            (&data[self.link_offset..], self.link_offset)
        };

        let l3_bytes = (wire_len as u64).saturating_sub(l2_len as u64);

        match ip_slice.first().map(|b| *b >> 4) {
            Some(4) => self.process_v4(ts_us, l3_bytes, ip_slice, truncated, stat),
            Some(6) => self.process_v6(ts_us, l3_bytes, ip_slice, truncated, stat),
            _ => {
                stat.unknown += 1;
                Vec::new()
            }
        }
    }

    fn process_v4(
        &mut self,
        ts_us: u64,
        l3_bytes: u64,
        ip_slice: &[u8],
        truncated: bool,
        stat: &mut ProcStat,
    ) -> Vec<FlowNode> {
        let (ip, rest) = match Ipv4Header::from_slice(ip_slice) {
            Ok(t) => t,
            Err(_) => {
                bump_short(truncated, stat);
                return Vec::new();
            }
        };
        let src = IpAddr::V4(Ipv4Addr::from(ip.source));
        let dst = IpAddr::V4(Ipv4Addr::from(ip.destination));

        let frag_offset = ip.fragment_offset.value() as u32 * 8;
        if ip.more_fragments || frag_offset > 0 {
            let payload_len =
                (ip.total_len as u32).saturating_sub(ip.header_len() as u32);
            if frag_offset == 0 {
                if let Some(node) =
                    self.transport_node(ip.protocol, src, dst, ts_us, 0, rest, truncated, stat)
                {
                    self.frags
                        .first_fragment(src, dst, ip.identification, node);
                }
            }
            return self
                .frags
                .fragment(
                    ts_us,
                    src,
                    dst,
                    ip.identification,
                    frag_offset,
                    payload_len,
                    ip.more_fragments,
                    l3_bytes,
                )
                .into_iter()
                .collect();
        }

        self.transport_node(ip.protocol, src, dst, ts_us, l3_bytes, rest, truncated, stat)
            .into_iter()
            .collect()
    }

    fn process_v6(
        &mut self,
        ts_us: u64,
        l3_bytes: u64,
        ip_slice: &[u8],
        truncated: bool,
        stat: &mut ProcStat,
    ) -> Vec<FlowNode> {
        let (ip, rest) = match Ipv6Header::from_slice(ip_slice) {
            Ok(t) => t,
            Err(_) => {
                bump_short(truncated, stat);
                return Vec::new();
            }
        };
        let src = IpAddr::V6(Ipv6Addr::from(ip.source));
        let dst = IpAddr::V6(Ipv6Addr::from(ip.destination));

        self.transport_node(ip.next_header, src, dst, ts_us, l3_bytes, rest, truncated, stat)
            .into_iter()
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn transport_node(
        &self,
        proto: IpNumber,
        src: IpAddr,
        dst: IpAddr,
        ts_us: u64,
        l3_bytes: u64,
        rest: &[u8],
        truncated: bool,
        stat: &mut ProcStat,
    ) -> Option<FlowNode> {
        match proto {
            IpNumber::TCP => {
                let (tcp, _) = match TcpHeader::from_slice(rest) {
                    Ok(t) => t,
                    Err(_) => {
                        bump_short(truncated, stat);
                        return None;
                    }
                };
                let key = FlowKey {
                    proto: proto.0,
                    src_addr: src,
                    dst_addr: dst,
                    src_port: tcp.source_port,
                    dst_port: tcp.destination_port,
                };
                let mut node = FlowNode::from_packet(key, ts_us, l3_bytes);
                node.tcp_flags = tcp_flags(&tcp);
                Some(node)
            }
            IpNumber::UDP => {
                let (udp, _) = match UdpHeader::from_slice(rest) {
                    Ok(t) => t,
                    Err(_) => {
                        bump_short(truncated, stat);
                        return None;
                    }
                };
                let key = FlowKey {
                    proto: proto.0,
                    src_addr: src,
                    dst_addr: dst,
                    src_port: udp.source_port,
                    dst_port: udp.destination_port,
                };
                Some(FlowNode::from_packet(key, ts_us, l3_bytes))
            }
            IpNumber::ICMP => {
                let icmp = match Icmpv4Slice::from_slice(rest) {
                    Ok(t) => t,
                    Err(_) => {
                        bump_short(truncated, stat);
                        return None;
                    }
                };
                let (t, c) = (icmp.type_u8(), icmp.code_u8());
                let key = FlowKey::icmp(src, dst, proto.0, t, c);
                let mut node = FlowNode::from_packet(key, ts_us, l3_bytes);
                node.icmp_type = t;
                node.icmp_code = c;
                Some(node)
            }
            IpNumber::IPV6_ICMP => {
                let (icmp, _) = match Icmpv6Header::from_slice(rest) {
                    Ok(t) => t,
                    Err(_) => {
                        bump_short(truncated, stat);
                        return None;
                    }
                };
                let (t, c) = (icmp.icmp_type.type_u8(), icmp.icmp_type.code_u8());
                let key = FlowKey::icmp(src, dst, proto.0, t, c);
                let mut node = FlowNode::from_packet(key, ts_us, l3_bytes);
                node.icmp_type = t;
                node.icmp_code = c;
                Some(node)
            }
            // Any other L4 protocol still becomes a (portless) flow.
            other => {
                let key = FlowKey {
                    proto: other.0,
                    src_addr: src,
                    dst_addr: dst,
                    src_port: 0,
                    dst_port: 0,
                };
                Some(FlowNode::from_packet(key, ts_us, l3_bytes))
            }
        }
    }
}

fn bump_short(truncated: bool, stat: &mut ProcStat) {
    if truncated {
        stat.short_snap += 1;
    } else {
        stat.skipped += 1;
    }
}

fn tcp_flags(tcp: &TcpHeader) -> u8 {
    let mut flags = 0;
    if tcp.fin {
        flags |= TCP_FIN;
    }
    if tcp.syn {
        flags |= TCP_SYN;
    }
    if tcp.rst {
        flags |= TCP_RST;
    }
    if tcp.psh {
        flags |= TCP_PSH;
    }
    if tcp.ack {
        flags |= TCP_ACK;
    }
    if tcp.urg {
        flags |= TCP_URG;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{IcmpEchoHeader, Icmpv4Type, IpFragOffset, PacketBuilder};

    const DLT_EN10MB: i32 = 1;
    const DLT_RAW: i32 = 12;

    fn decoder_en10mb() -> PacketDecoder {
        PacketDecoder::new(DLT_EN10MB, 14)
    }

    fn tcp_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(40000, 443, 1000, 65535)
            .syn();
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    #[test]
    fn tcp_packet_yields_one_node() {
        let mut dec = decoder_en10mb();
        let mut stat = ProcStat::default();
        let frame = tcp_frame(b"hello");

        let nodes = dec.process(1_000_000, frame.len() as u32, &frame, &mut stat);
        assert_eq!(nodes.len(), 1);
        let node = &nodes[0];
        assert_eq!(node.key.proto, 6);
        assert_eq!(node.key.src_port, 40000);
        assert_eq!(node.key.dst_port, 443);
        assert_eq!(node.bytes, frame.len() as u64 - 14);
        assert_eq!(node.tcp_flags, TCP_SYN);
        assert_eq!(stat.packets, 1);
        assert_eq!(stat.skipped + stat.unknown + stat.short_snap, 0);
    }

    #[test]
    fn udp_over_ipv6_yields_one_node() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv6([0x20; 16], [0x21; 16], 64)
            .udp(5353, 53);
        let mut frame = Vec::with_capacity(builder.size(4));
        builder.write(&mut frame, &[0u8; 4]).unwrap();

        let mut dec = decoder_en10mb();
        let mut stat = ProcStat::default();
        let nodes = dec.process(0, frame.len() as u32, &frame, &mut stat);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].key.proto, 17);
        assert_eq!(nodes[0].key.dst_port, 53);
    }

    #[test]
    fn vlan_tag_is_stripped() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).udp(1234, 5678);
        let mut inner = Vec::with_capacity(builder.size(0));
        builder.write(&mut inner, &[]).unwrap();

        // Ethernet header carrying an 802.1Q tag (vid 7) around the IP frame.
        let mut frame = Vec::with_capacity(18 + inner.len());
        frame.extend_from_slice(&[2u8; 6]);
        frame.extend_from_slice(&[1u8; 6]);
        frame.extend_from_slice(&[0x81, 0x00, 0x00, 0x07, 0x08, 0x00]);
        frame.extend_from_slice(&inner);

        let mut dec = decoder_en10mb();
        let mut stat = ProcStat::default();
        let nodes = dec.process(0, frame.len() as u32, &frame, &mut stat);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].key.src_port, 1234);
        assert_eq!(nodes[0].bytes, inner.len() as u64);
    }

    #[test]
    fn icmp_echo_packs_type_into_key() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .icmpv4(Icmpv4Type::EchoRequest(IcmpEchoHeader { id: 1, seq: 1 }));
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        let mut dec = decoder_en10mb();
        let mut stat = ProcStat::default();
        let nodes = dec.process(0, frame.len() as u32, &frame, &mut stat);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].key.proto, 1);
        assert_eq!(nodes[0].icmp_type, 8);
        assert_eq!(nodes[0].key.dst_port, 8 << 8);
    }

    #[test]
    fn non_ip_ethertype_counts_unknown() {
        // ARP ethertype with empty body.
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08;
        frame[13] = 0x06;

        let mut dec = decoder_en10mb();
        let mut stat = ProcStat::default();
        assert!(dec.process(0, frame.len() as u32, &frame, &mut stat).is_empty());
        assert_eq!(stat.unknown, 1);
    }

    #[test]
    fn truncated_capture_counts_short_snap() {
        let frame = tcp_frame(b"payload");
        let mut dec = decoder_en10mb();
        let mut stat = ProcStat::default();
        // Snaplen cut inside the TCP header.
        let cut = &frame[..14 + 20 + 4];
        assert!(dec.process(0, frame.len() as u32, cut, &mut stat).is_empty());
        assert_eq!(stat.short_snap, 1);
    }

    #[test]
    fn raw_linktype_decodes_bare_ip() {
        let builder = PacketBuilder::ipv4([192, 0, 2, 1], [192, 0, 2, 2], 64).udp(9, 10);
        let mut frame = Vec::with_capacity(builder.size(2));
        builder.write(&mut frame, &[0u8; 2]).unwrap();

        let mut dec = PacketDecoder::new(DLT_RAW, 0);
        let mut stat = ProcStat::default();
        let nodes = dec.process(0, frame.len() as u32, &frame, &mut stat);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].bytes, frame.len() as u64);
    }

    fn v4_fragment(
        id: u16,
        offset_units: u16,
        more: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut ip = Ipv4Header::new(
            payload.len() as u16,
            64,
            IpNumber::UDP,
            [192, 0, 2, 1],
            [192, 0, 2, 2],
        )
        .unwrap();
        ip.identification = id;
        ip.more_fragments = more;
        ip.fragment_offset = IpFragOffset::try_new(offset_units).unwrap();
        let mut frame = Vec::new();
        ip.write(&mut frame).unwrap();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn fragmented_datagram_assembles_into_one_node() {
        let mut dec = PacketDecoder::new(DLT_RAW, 0);
        let mut stat = ProcStat::default();

        // First fragment: UDP header + 8 bytes of payload (16 bytes, 2 units).
        let mut first_payload = Vec::new();
        UdpHeader::without_ipv4_checksum(7000, 53, 8)
            .unwrap()
            .write(&mut first_payload)
            .unwrap();
        first_payload.extend_from_slice(&[0u8; 8]);
        let frag1 = v4_fragment(42, 0, true, &first_payload);
        assert!(dec.process(1_000, frag1.len() as u32, &frag1, &mut stat).is_empty());

        // Final fragment at offset 16.
        let frag2 = v4_fragment(42, 2, false, &[0u8; 8]);
        let nodes = dec.process(2_000, frag2.len() as u32, &frag2, &mut stat);
        assert_eq!(nodes.len(), 1);

        let node = &nodes[0];
        assert_eq!(node.key.src_port, 7000);
        assert_eq!(node.packets, 2);
        assert_eq!(node.bytes, (frag1.len() + frag2.len()) as u64);
        assert_eq!(node.frag.unwrap().fragments, 2);
        assert_eq!(stat.packets, 2);
    }
}
