//! Two-pass merge lowering.
//!
//! A phi node is lowered to an empty target phi at the head of its block
//! and queued. Once every block has been walked the queue is drained: each
//! input is paired with the predecessor at the same position, connector
//! predecessors are looked through, and the input is attached from every
//! target block that actually branches into the phi's block (a source block
//! may have been split by call or handler dispatch lowering). Inputs whose
//! representation differs from the phi get one cast at the end of the
//! block that produced them, shared by every incoming edge.

use log::trace;

use super::Selector;
use crate::core::adaptor::CfgWalker;
use crate::core::error::{CompileError, CompileResult};
use crate::graph::{BlockId, NodeId, NodeType};
use crate::target::{BlockOrigin, BlockRef, CastOp, Op, Type, Value, ValueDef};

impl<'g, 'arena> Selector<'g, 'arena> {
    pub(super) fn lower_phi(&mut self, node: NodeId, ty: NodeType) -> CompileResult<Value> {
        let block = self.scheduled_block(node)?;
        let phi_ty = self.type_of(ty.basic)?;
        let phi = self.builder.phi_at_head(self.blocks[block.index()], phi_ty);
        self.pending_phis.push((node, phi));
        // Record before tagging: a derived phi's base may be a merge that
        // refers back to this one.
        self.cache.record(node, Some(phi));
        self.tag_value(node, ty, phi)?;
        Ok(phi)
    }

    fn scheduled_block(&self, node: NodeId) -> CompileResult<BlockId> {
        self.graph
            .block_for_node(node)
            .ok_or_else(|| CompileError::BlockLayout {
                block: None,
                reason: format!("{node} is not scheduled"),
            })
    }

    pub(super) fn complete_phi_nodes(&mut self) -> CompileResult<()> {
        // Lowering an input may queue further phis.
        let mut i = 0;
        while i < self.pending_phis.len() {
            let (node, phi) = self.pending_phis[i];
            i += 1;

            let block = self.scheduled_block(node)?;
            let n = self.graph.node(node).clone();
            let b = self.graph.block(block);
            if b.head() != n.input(0) {
                return Err(CompileError::BlockLayout {
                    block: Some(block),
                    reason: format!("phi {node} does not belong to the block's region"),
                });
            }
            let preds = b.preds.clone();
            if n.req() != preds.len() + 1 {
                return Err(CompileError::BlockLayout {
                    block: Some(block),
                    reason: format!(
                        "phi {node} has {} inputs for {} predecessors",
                        n.req() - 1,
                        preds.len()
                    ),
                });
            }

            let phi_block = self.blocks[block.index()];
            for (k, pred) in preds.into_iter().enumerate() {
                let input = n.input(k + 1).ok_or(CompileError::MissingInput {
                    node,
                    index: k + 1,
                })?;
                self.add_phi_incoming(phi, phi_block, input, pred, 0)?;
            }
            self.session.record_phi_resolved();
            trace!("completed phi {phi} for {node}");
        }
        Ok(())
    }

    fn add_phi_incoming(
        &mut self,
        phi: Value,
        phi_block: BlockRef,
        input: NodeId,
        pred: BlockId,
        depth: usize,
    ) -> CompileResult<()> {
        if self.graph.block(pred).connector {
            if depth > self.graph.number_of_blocks() {
                return Err(CompileError::BlockLayout {
                    block: Some(pred),
                    reason: "connector cycle".to_string(),
                });
            }
            let preds = self.graph.block(pred).preds.clone();
            for p in preds {
                self.add_phi_incoming(phi, phi_block, input, p, depth + 1)?;
            }
            return Ok(());
        }

        let value = self.phi_input_value(input)?;
        let incoming: Vec<BlockRef> = self
            .builder
            .function()
            .blocks_with_origin(|origin| match origin {
                BlockOrigin::Source(b) | BlockOrigin::CallResult(b) | BlockOrigin::HandlerDispatch(b) => {
                    b == pred
                }
                BlockOrigin::Entry => false,
            })
            .into_iter()
            .filter(|from| {
                self.builder
                    .function()
                    .block(*from)
                    .terminator
                    .as_ref()
                    .is_some_and(|t| t.successors().contains(&phi_block))
            })
            .collect();
        if incoming.is_empty() {
            return Err(CompileError::BlockLayout {
                block: Some(pred),
                reason: format!(
                    "no edge into {} for phi {phi}",
                    self.builder.block_name(phi_block)
                ),
            });
        }

        let phi_ty = self.builder.value_type(phi);
        let value = self.phi_representation(value, phi_ty, incoming[0])?;
        for from in incoming {
            self.builder.add_incoming(phi, value, from)?;
        }
        Ok(())
    }

    /// Value of a phi input, lowered at the end of its own block if no walk
    /// has reached it yet.
    fn phi_input_value(&mut self, input: NodeId) -> CompileResult<Value> {
        if self.cache.is_lowered(input) {
            return self.value_of(input);
        }
        let block = self.scheduled_block(input)?;
        let (saved_block, saved_cursor) = (self.block, self.builder.current_block());
        self.block = block;
        self.builder.position_at_end(self.blocks[block.index()]);
        let value = self.value_of(input);
        self.block = saved_block;
        if let Some(cursor) = saved_cursor {
            self.builder.position_at_end(cursor);
        }
        value
    }

    /// Target block ending with `value` in scope: its defining block, the
    /// root block for arguments and constants, or `from` for a call token.
    fn producer_block(&self, value: Value, from: BlockRef) -> BlockRef {
        let function = self.builder.function();
        match function.value_def(value) {
            ValueDef::Inst(_) => function.def_block(value).unwrap_or(from),
            ValueDef::Param(_) | ValueDef::Const(_) => self.blocks[self.graph.root_block().index()],
            ValueDef::Terminator(_) => from,
        }
    }

    /// Cast `value` to the phi's representation before the terminator of
    /// its producing block.
    fn phi_representation(&mut self, value: Value, phi_ty: Type, from: BlockRef) -> CompileResult<Value> {
        let vty = self.builder.value_type(value);
        if vty == phi_ty {
            return Ok(value);
        }
        if let Some(cast) = self.phi_casts.get(&(value, phi_ty)) {
            return Ok(*cast);
        }
        let ptr_bits = self.builder.ptr_bits();
        let op = match (vty.is_ptr(), phi_ty.is_ptr()) {
            (false, true) if vty.is_int() && vty.bits(ptr_bits) == ptr_bits => CastOp::IntToPtr,
            (true, false) if phi_ty.is_int() && phi_ty.bits(ptr_bits) == ptr_bits => CastOp::PtrToInt,
            _ => {
                return Err(CompileError::PhiRepresentation {
                    value,
                    reason: format!("{vty} into a {phi_ty} phi"),
                })
            }
        };
        let block = self.producer_block(value, from);
        let cast = self
            .builder
            .emit_in(
                block,
                Op::Cast {
                    op,
                    value,
                    to: phi_ty,
                },
            )
            .ok_or_else(|| CompileError::PhiRepresentation {
                value,
                reason: "cast produced no value".to_string(),
            })?;
        trace!("phi cast {cast} in {}", self.builder.block_name(block));
        self.phi_casts.insert((value, phi_ty), cast);
        Ok(cast)
    }
}
