//! IPv4 fragment reassembly table.
//!
//! Fragments are keyed by (src, dst, ip id). The first fragment contributes
//! the transport 5-tuple; later fragments only add byte spans. When the span
//! set is gap-free and the final fragment has arrived, one flow node covering
//! the whole datagram is emitted. Stale entries are swept on a timer driven
//! by packet timestamps.

use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

use crate::node::{FlowNode, FragInfo};

/// Incomplete datagrams are dropped after this much observation time.
const FRAG_TIMEOUT_US: u64 = 30_000_000;
/// Sweep cadence.
const SWEEP_INTERVAL_US: u64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragKey {
    src: IpAddr,
    dst: IpAddr,
    id: u16,
}

struct FragEntry {
    /// Node seeded by the first fragment (offset 0); carries the 5-tuple.
    node: Option<FlowNode>,
    /// Byte spans seen so far, unmerged.
    spans: Vec<(u32, u32)>,
    /// Datagram payload length, known once the last fragment arrives.
    total: Option<u32>,
    bytes: u64,
    fragments: u32,
    out_of_order: bool,
    highest_offset: u32,
    last_touch_us: u64,
}

impl FragEntry {
    fn new(now_us: u64) -> Self {
        Self {
            node: None,
            spans: Vec::with_capacity(8),
            total: None,
            bytes: 0,
            fragments: 0,
            out_of_order: false,
            highest_offset: 0,
            last_touch_us: now_us,
        }
    }

    fn complete(&self) -> bool {
        let total = match self.total {
            Some(t) => t,
            None => return false,
        };
        if self.node.is_none() {
            return false;
        }
        let mut spans = self.spans.clone();
        spans.sort_unstable();
        let mut end = 0u32;
        for (start, len) in spans {
            if start > end {
                return false;
            }
            end = end.max(start + len);
        }
        end >= total
    }
}

#[derive(Default)]
pub struct FragStat {
    pub datagrams: u64,
    pub timed_out: u64,
}

pub struct FragmentTable {
    entries: HashMap<FragKey, FragEntry>,
    last_sweep_us: u64,
    pub stat: FragStat,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            last_sweep_us: 0,
            stat: FragStat::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seed an entry with the node decoded from the first fragment.
    pub fn first_fragment(&mut self, src: IpAddr, dst: IpAddr, id: u16, node: FlowNode) {
        let entry = self
            .entries
            .entry(FragKey { src, dst, id })
            .or_insert_with(|| FragEntry::new(node.last_us));
        entry.node = Some(node);
    }

    /// Record one fragment's span; returns the assembled node when the
    /// datagram closes.
    pub fn fragment(
        &mut self,
        ts_us: u64,
        src: IpAddr,
        dst: IpAddr,
        id: u16,
        offset: u32,
        payload_len: u32,
        more_fragments: bool,
        l3_bytes: u64,
    ) -> Option<FlowNode> {
        let key = FragKey { src, dst, id };
        let entry = self.entries.entry(key).or_insert_with(|| FragEntry::new(ts_us));

        if offset < entry.highest_offset {
            entry.out_of_order = true;
        }
        entry.highest_offset = entry.highest_offset.max(offset);
        entry.spans.push((offset, payload_len));
        entry.bytes += l3_bytes;
        entry.fragments += 1;
        entry.last_touch_us = ts_us;
        if !more_fragments {
            entry.total = Some(offset + payload_len);
        }

        let assembled = if entry.complete() {
            let entry = self.entries.remove(&key).unwrap();
            let mut node = entry.node.unwrap();
            node.last_us = node.last_us.max(ts_us);
            node.first_us = node.first_us.min(ts_us);
            node.packets = entry.fragments as u64;
            node.bytes = entry.bytes;
            node.frag = Some(FragInfo {
                fragments: entry.fragments,
                out_of_order: entry.out_of_order,
            });
            self.stat.datagrams += 1;
            Some(node)
        } else {
            None
        };

        self.sweep(ts_us);
        assembled
    }

    fn sweep(&mut self, now_us: u64) {
        if now_us.saturating_sub(self.last_sweep_us) < SWEEP_INTERVAL_US {
            return;
        }
        self.last_sweep_us = now_us;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now_us.saturating_sub(e.last_touch_us) < FRAG_TIMEOUT_US);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            self.stat.timed_out += dropped as u64;
            debug!("fragment table: dropped {} stale datagrams", dropped);
        }
    }
}

impl Default for FragmentTable {
    fn default() -> Self {
        Self::new()
    }
}
