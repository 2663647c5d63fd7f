//! The flow tree: live per-5-tuple state owned by the flow stage.
//!
//! Nodes arriving from capture are merged in; aged flows are emitted by the
//! timer pass; cache pressure force-emits the least recently seen entries so
//! the tree never exceeds its cap and no packet or byte counts are lost.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::node::{FlowKey, FlowNode};

pub const DEFAULT_CACHE_SIZE: usize = 524_288;
pub const DEFAULT_ACTIVE_SECS: u64 = 300;
pub const DEFAULT_INACTIVE_SECS: u64 = 60;

pub struct FlowTree {
    tree: BTreeMap<FlowKey, FlowNode>,
    cache_size: usize,
    active_us: u64,
    inactive_us: u64,
    /// Flows force-emitted by cache pressure since startup.
    pub evicted: u64,
}

impl FlowTree {
    pub fn new(cache_size: usize, active_secs: u64, inactive_secs: u64) -> Self {
        Self {
            tree: BTreeMap::new(),
            cache_size,
            active_us: active_secs * 1_000_000,
            inactive_us: inactive_secs * 1_000_000,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Insert a fresh node or fold it into the live entry for its key.
    pub fn merge(&mut self, node: FlowNode) {
        match self.tree.get_mut(&node.key) {
            Some(live) => live.merge(&node),
            None => {
                self.tree.insert(node.key, node);
            }
        }
    }

    /// Emit every flow whose inactive timer elapsed or whose total lifetime
    /// hit the active timer.
    pub fn expire(&mut self, now_us: u64) -> Vec<FlowNode> {
        let expired: Vec<FlowKey> = self
            .tree
            .values()
            .filter(|n| {
                now_us.saturating_sub(n.last_us) >= self.inactive_us
                    || now_us.saturating_sub(n.first_us) >= self.active_us
            })
            .map(|n| n.key)
            .collect();

        let nodes: Vec<FlowNode> = expired
            .iter()
            .filter_map(|k| self.tree.remove(k))
            .collect();
        if !nodes.is_empty() {
            debug!("expired {} flows, {} live", nodes.len(), self.tree.len());
        }
        nodes
    }

    /// Drain the whole tree (shutdown path).
    pub fn flush(&mut self) -> Vec<FlowNode> {
        std::mem::take(&mut self.tree).into_values().collect()
    }

    /// Enforce the cache cap by force-emitting the least recently seen flows.
    ///
    /// Emitted flows keep their counts, so output packet/byte sums stay exact
    /// under overflow; the early cut is logged since it splits long flows.
    pub fn cache_check(&mut self) -> Vec<FlowNode> {
        if self.tree.len() < self.cache_size {
            return Vec::new();
        }
        let want = (self.cache_size / 32).max(1);

        let mut by_age: Vec<(u64, FlowKey)> =
            self.tree.values().map(|n| (n.last_us, n.key)).collect();
        by_age.sort_unstable_by_key(|(last, _)| *last);

        let victims: Vec<FlowNode> = by_age
            .iter()
            .take(want)
            .filter_map(|(_, k)| self.tree.remove(k))
            .collect();

        self.evicted += victims.len() as u64;
        warn!(
            "flow cache full ({} entries): force-emitted {} oldest flows",
            self.cache_size,
            victims.len()
        );
        victims
    }
}
