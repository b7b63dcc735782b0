// This module defines the CfgWalker trait, the bridge between the selector and the scheduled
// block/node graph handed over by the optimizer. The selector never assumes a particular
// graph container: it walks blocks in layout order, visits the already-selected machine nodes
// of each block in schedule order (the block's entry marker is skipped), asks which block a
// node was scheduled into, and follows successor edges while skipping connector blocks that
// only pass control through. Graph implements the trait; host adaptors can provide their own.

//! CFG walker responsibilities.
//!
//! The framework assumes:
//! - Block 0 of the layout is the root block holding the start node.
//! - Node 0 of every block is its entry marker (start or region).
//! - Successor edges are listed in the order the block's end projections appear,
//!   and those projections are the last nodes of the block.
//! - Connector blocks transfer control to their single successor.

use crate::graph::{Block, BlockId, NodeId};

/// Ordered traversal over a scheduled machine-node CFG.
pub trait CfgWalker {
    /// Number of blocks in the layout.
    fn number_of_blocks(&self) -> usize;

    /// Block holding the start node.
    fn root_block(&self) -> BlockId;

    /// Access a block's nodes and edges.
    fn block(&self, block: BlockId) -> &Block;

    /// Block a node was scheduled into, if any.
    fn block_for_node(&self, node: NodeId) -> Option<BlockId>;

    /// `node` is a control projection trailing its block's end node.
    fn is_end_projection(&self, node: NodeId) -> bool;

    /// Iterator over all blocks in layout order.
    fn blocks(&self) -> Box<dyn Iterator<Item = BlockId> + '_> {
        Box::new((0..self.number_of_blocks() as u32).map(BlockId))
    }

    /// Iterator over the nodes of a block, skipping the entry marker.
    fn block_nodes(&self, block: BlockId) -> Box<dyn Iterator<Item = NodeId> + '_> {
        Box::new(self.block(block).nodes.iter().skip(1).copied())
    }

    /// Node ending the block. Trailing successor projections are skipped.
    fn block_end(&self, block: BlockId) -> Option<NodeId> {
        let b = self.block(block);
        let last = *b.nodes.last()?;
        if !self.is_end_projection(last) {
            return Some(last);
        }
        let idx = b.nodes.len().checked_sub(b.succs.len() + 1)?;
        b.nodes.get(idx).copied()
    }

    /// Follow successor `index` through any connector blocks.
    fn non_connector_successor(&self, block: BlockId, index: usize) -> Option<BlockId> {
        let mut succ = *self.block(block).succs.get(index)?;
        let mut hops = 0;
        while self.block(succ).connector {
            succ = *self.block(succ).succs.first()?;
            hops += 1;
            if hops > self.number_of_blocks() {
                return None;
            }
        }
        Some(succ)
    }

    /// Resolve a branch target through connector blocks.
    fn non_connector(&self, block: BlockId) -> Option<BlockId> {
        if !self.block(block).connector {
            return Some(block);
        }
        self.non_connector_successor(block, 0)
    }
}
