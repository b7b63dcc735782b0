//! Memoized lowering results.
//!
//! Every node is lowered at most once per pass; consumers that reach the
//! same node through different paths observe the identical target value.
//! Nodes that produce no value (control, memory projections, stores) are
//! cached as `None` so they are not lowered twice either.

use crate::graph::NodeId;
use crate::target::Value;

/// Result of lowering one node.
pub type Lowered = Option<Value>;

#[derive(Debug, Clone, Copy, Default)]
struct CacheEntry {
    hit: bool,
    val: Lowered,
}

/// Per-pass cache indexed by node id.
#[derive(Debug, Default)]
pub struct ValueCache {
    entries: Vec<CacheEntry>,
    hits: usize,
}

impl ValueCache {
    pub fn with_capacity(nodes: usize) -> Self {
        Self {
            entries: vec![CacheEntry::default(); nodes],
            hits: 0,
        }
    }

    /// Cached result for `node`, if it was lowered already.
    pub fn lookup(&mut self, node: NodeId) -> Option<Lowered> {
        let entry = self.entries.get(node.index())?;
        if entry.hit {
            self.hits += 1;
            Some(entry.val)
        } else {
            None
        }
    }

    pub fn is_lowered(&self, node: NodeId) -> bool {
        self.entries.get(node.index()).is_some_and(|e| e.hit)
    }

    /// Record the lowering of `node`. Nodes created during the pass grow the table.
    pub fn record(&mut self, node: NodeId, val: Lowered) {
        let idx = node.index();
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, CacheEntry::default());
        }
        self.entries[idx] = CacheEntry { hit: true, val };
    }

    /// Number of lookups answered from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn lowered_count(&self) -> usize {
        self.entries.iter().filter(|e| e.hit).count()
    }
}
