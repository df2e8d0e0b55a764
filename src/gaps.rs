//! Per-node sequence tracking and the pending re-request set.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Missing sequence numbers of one node awaiting an out-of-band re-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub node_id: i32,
    pub missing: Vec<i64>,
}

pub struct GapTracker {
    highest: HashMap<i32, i64>,
    pending: BTreeMap<i32, BTreeSet<i64>>,
    /// Jumps larger than this are treated as a node reset, not as a gap.
    max_gap: i64,
}

impl GapTracker {
    pub fn new(max_gap: i64) -> Self {
        Self { highest: HashMap::new(), pending: BTreeMap::new(), max_gap }
    }

    /// Record a sequence number and return how many new gaps it opened.
    pub fn observe(&mut self, node_id: i32, sequence: i64) -> usize {
        let Some(&highest) = self.highest.get(&node_id) else {
            self.highest.insert(node_id, sequence);
            return 0;
        };
        if sequence <= highest {
            self.resolve(node_id, sequence);
            return 0;
        }
        self.highest.insert(node_id, sequence);
        let Some(jump) = sequence.checked_sub(highest).map(|d| d - 1) else {
            tracing::warn!(node = node_id, from = highest, to = sequence, "sequence jump out of range, treating as reset");
            return 0;
        };
        if jump == 0 {
            return 0;
        }
        if jump > self.max_gap {
            tracing::warn!(node = node_id, from = highest, to = sequence, "sequence jump too large, treating as reset");
            return 0;
        }
        self.register_gap(node_id, highest + 1..sequence)
    }

    pub fn register_gap(&mut self, node_id: i32, missing: std::ops::Range<i64>) -> usize {
        let set = self.pending.entry(node_id).or_default();
        let before = set.len();
        set.extend(missing);
        set.len() - before
    }

    fn resolve(&mut self, node_id: i32, sequence: i64) {
        if let Some(set) = self.pending.get_mut(&node_id) {
            set.remove(&sequence);
            if set.is_empty() {
                self.pending.remove(&node_id);
            }
        }
    }

    /// Drain the pending set, one entry per node in node order.
    pub fn consume_pending_gaps(&mut self) -> Vec<Gap> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(node_id, missing)| Gap { node_id, missing: missing.into_iter().collect() })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|s| s.len()).sum()
    }

    pub fn highest(&self, node_id: i32) -> Option<i64> {
        self.highest.get(&node_id).copied()
    }
}

impl Default for GapTracker {
    fn default() -> Self {
        Self::new(10_000)
    }
}
