// Call lowering. Every call becomes a statepoint: the collector may stop there, so the call
// carries the interpreter-state values needed for deoptimization and the list of pointer
// values it must relocate, bases of derived pointers included. Arguments are packed with the
// same rule as the function's own parameters. When the call's block ends in an exception
// dispatch, the successor projections name the normal continuation (the fall-through index)
// and the handlers in order. One handler is reached directly: the call becomes an invoke whose
// unwind edge enters the handler through a landing pad. With more handlers the call returns
// normally and the runtime stores the index of the taken target in a thread slot (zero for the
// normal path); a chain of equality tests on that slot, one synthetic block per test after the
// first, selects the destination.

use log::trace;

use super::{CallSite, RelocAnchor, RelocSite, Selector};
use crate::core::adaptor::CfgWalker;
use crate::core::error::{CompileError, CompileResult};
use crate::debug_info::{DebugInfo, StackMapId, StackMapKind};
use crate::graph::{
    slots, BasicType, BlockId, CallKind, CallNode, NodeId, NodeKind, FALL_THROUGH_INDEX,
};
use crate::reloc::RelocRequest;
use crate::selector::callconv::pack;
use crate::selector::derived::is_derived;
use crate::target::{
    BlockOrigin, BlockRef, IntPredicate, Op, StatepointCall, Terminator, Type, Value,
};

/// Successors of an exception-covered call.
struct Dispatch {
    normal: Option<(BlockId, BlockRef)>,
    handlers: Vec<(BlockId, BlockRef)>,
}

fn push_unique(list: &mut Vec<Value>, value: Value) {
    if !list.contains(&value) {
        list.push(value);
    }
}

impl<'g, 'arena> Selector<'g, 'arena> {
    /// Lowered argument values in physical order.
    fn call_args(&mut self, node: NodeId, call: &CallNode) -> CompileResult<Vec<Value>> {
        let mut args = Vec::with_capacity(call.signature.params.len());
        for (i, ty) in call.signature.params.iter().enumerate() {
            if *ty == BasicType::Half {
                continue;
            }
            args.push(self.input_value(node, slots::PARMS + i)?);
        }
        Ok(self.callconv_adjust(args))
    }

    /// Apply the packed convention to lowered arguments.
    fn callconv_adjust(&mut self, args: Vec<Value>) -> Vec<Value> {
        let floats: Vec<bool> = args
            .iter()
            .map(|a| self.builder.value_type(*a).is_float())
            .collect();
        let packed = pack(
            (0..args.len()).map(Some).collect(),
            |slot: &Option<usize>| slot.is_some_and(|i| floats[i]),
            self.config.general_param_quota,
            || None,
        );
        packed
            .into_iter()
            .map(|slot| match slot {
                Some(i) => args[i],
                None => self.builder.const_int(Type::I64, 0),
            })
            .collect()
    }

    /// Deoptimization values and GC-live pointers of a call's debug state.
    fn stackmap_scope(&mut self, debug: &[NodeId]) -> CompileResult<(Vec<Value>, Vec<Value>)> {
        let mut deopt = Vec::with_capacity(debug.len());
        let mut gc_live = Vec::new();
        for &node in debug {
            let value = self.value_of(node)?;
            deopt.push(value);
            let ty = self.graph.node(node).ty;
            if is_derived(&ty) {
                let base = self
                    .derived
                    .find_derived_base(self.graph, node, self.session)?;
                let base_value = self.value_of(base)?;
                self.provenance.mark_dptr(value, base_value)?;
                push_unique(&mut gc_live, base_value);
                push_unique(&mut gc_live, value);
            } else if self.provenance.is_enabled() {
                if self.provenance.is_managed(value) {
                    push_unique(&mut gc_live, value);
                }
            } else if ty.basic == BasicType::Object {
                push_unique(&mut gc_live, value);
            }
        }
        Ok((deopt, gc_live))
    }

    /// Normal and handler successors when the current block ends in a catch.
    fn call_dispatch(&self) -> CompileResult<Option<Dispatch>> {
        let Some(end) = self.graph.block_end(self.block) else {
            return Ok(None);
        };
        if !matches!(self.graph.node(end).kind, NodeKind::Catch) {
            return Ok(None);
        }
        let mut dispatch = Dispatch {
            normal: None,
            handlers: Vec::new(),
        };
        for &proj in self.graph.outs(end) {
            let NodeKind::CatchProj { con } = self.graph.node(proj).kind else {
                continue;
            };
            let target = self.projection_target(proj)?;
            if con == FALL_THROUGH_INDEX {
                if dispatch.normal.replace(target).is_some() {
                    return Err(CompileError::MalformedNode {
                        node: end,
                        reason: "two fall-through projections".to_string(),
                    });
                }
            } else {
                dispatch.handlers.push(target);
            }
        }
        if dispatch.handlers.is_empty() {
            return Err(CompileError::MalformedNode {
                node: end,
                reason: "exception dispatch without handlers".to_string(),
            });
        }
        Ok(Some(dispatch))
    }

    pub(super) fn lower_call(&mut self, node: NodeId, call: &CallNode) -> CompileResult<Option<Value>> {
        let args = self.call_args(node, call)?;
        let ret = self.type_of(call.signature.ret)?;
        let (kind, debug) = match call.kind {
            CallKind::StaticJava => (
                StackMapKind::StaticCall,
                DebugInfo::StaticCall {
                    method: call.method.clone(),
                },
            ),
            CallKind::DynamicJava => (StackMapKind::DynamicCall, DebugInfo::DynamicCall),
            CallKind::Runtime => (StackMapKind::RuntimeCall, DebugInfo::StaticCall { method: None }),
        };
        let id = self.next_stackmap_id(kind);
        let (deopt, gc_live) = self.stackmap_scope(&call.debug)?;
        let statepoint = StatepointCall {
            id,
            patch_bytes: id.patch_bytes(),
            target: call.entry_point,
            args,
            ret,
            deopt: deopt.clone(),
            gc_live: gc_live.clone(),
        };
        trace!("call {} at {} -> {:#x}", id, node, call.entry_point);

        let dispatch = self.call_dispatch()?;
        let result = match &dispatch {
            None => self.emit_statepoint(statepoint, ret)?,
            Some(d) => self.emit_covered_call(statepoint, ret, d)?,
        };

        let (normal, handlers) = match dispatch {
            Some(d) => (
                d.normal.map(|(b, _)| b),
                d.handlers.into_iter().map(|(b, _)| b).collect(),
            ),
            None => (None, Vec::new()),
        };
        if !handlers.is_empty() {
            self.handler_table.insert(self.block, handlers.clone());
        }
        self.record_call_site(node, id, debug, deopt, gc_live, normal, handlers);
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_call_site(
        &mut self,
        node: NodeId,
        stackmap: StackMapId,
        debug: DebugInfo,
        deopt: Vec<Value>,
        gc_live: Vec<Value>,
        normal: Option<BlockId>,
        handlers: Vec<BlockId>,
    ) {
        self.reloc_sites.push(RelocSite {
            anchor: RelocAnchor::StackMap(stackmap),
            request: RelocRequest::Debug(debug.clone()),
        });
        self.call_sites.push(CallSite {
            id: self.call_sites.len(),
            node,
            block: self.block,
            stackmap,
            debug,
            deopt,
            gc_live,
            normal,
            handlers,
        });
        self.session.record_call_site();
    }

    /// Plain statepoint at the cursor; returns the call result if any.
    fn emit_statepoint(&mut self, call: StatepointCall, ret: Type) -> CompileResult<Option<Value>> {
        let token = self.builder.emit_value(Op::Statepoint(call))?;
        if ret == Type::Void {
            return Ok(None);
        }
        self.builder
            .emit_value(Op::GcResult {
                statepoint: token,
                ty: ret,
            })
            .map(Some)
    }

    fn emit_covered_call(
        &mut self,
        call: StatepointCall,
        ret: Type,
        dispatch: &Dispatch,
    ) -> CompileResult<Option<Value>> {
        match (dispatch.normal, dispatch.handlers.as_slice()) {
            (Some((_, next)), [(_, handler)]) => {
                let (next, handler) = (next, *handler);
                if !self.builder.has_landing_pad(handler) {
                    self.builder.landing_pad_at_head(handler);
                    self.session.record_landing_pad();
                }
                if ret == Type::Void {
                    self.builder.invoke(call, next, handler)?;
                    return Ok(None);
                }
                let name = format!("{}_result", self.current_name());
                let result_block = self
                    .builder
                    .add_block(name, BlockOrigin::CallResult(self.block));
                let token = self.builder.invoke(call, result_block, handler)?;
                self.builder.position_at_end(result_block);
                let value = self.builder.emit_value(Op::GcResult {
                    statepoint: token,
                    ty: ret,
                })?;
                self.builder.br(next)?;
                Ok(Some(value))
            }
            (normal, handlers) => {
                let result = self.emit_statepoint(call, ret)?;
                // Index 0 selects the normal path, index j handler j - 1.
                let mut targets: Vec<(u32, BlockRef)> = Vec::with_capacity(handlers.len() + 1);
                if let Some((_, next)) = normal {
                    targets.push((0, next));
                }
                targets.extend(
                    handlers
                        .iter()
                        .enumerate()
                        .map(|(j, (_, target))| (j as u32 + 1, *target)),
                );
                self.dispatch_chain(&targets)?;
                Ok(result)
            }
        }
    }

    fn current_name(&self) -> String {
        self.builder
            .block_name(self.blocks[self.block.index()])
            .to_string()
    }

    /// Select among `targets` by the pending handler index; the last
    /// target is the fallback of the final test.
    fn dispatch_chain(&mut self, targets: &[(u32, BlockRef)]) -> CompileResult<()> {
        let Some(&(_, last)) = targets.last() else {
            return Err(CompileError::BlockLayout {
                block: Some(self.block),
                reason: "empty handler dispatch".to_string(),
            });
        };
        if targets.len() == 1 {
            return self.builder.br(last);
        }

        let thread = self.thread()?;
        let slot = self.gep_const(thread, self.config.thread.pending_handler_offset)?;
        let index = self.builder.load(slot, Type::I32)?;

        let name = self.current_name();
        let tests = targets.len() - 1;
        for (j, &(disc, target)) in targets[..tests].iter().enumerate() {
            let otherwise = if j + 1 == tests {
                last
            } else {
                let link = self.builder.add_block(
                    format!("{name}_handler{}", j + 1),
                    BlockOrigin::HandlerDispatch(self.block),
                );
                self.session.record_dispatch_block();
                link
            };
            let expected = self.builder.const_int(Type::I32, disc as u64);
            let taken = self.builder.icmp(IntPredicate::Eq, index, expected)?;
            self.builder.cond_br(taken, target, otherwise)?;
            if otherwise != last {
                self.builder.position_at_end(otherwise);
                let id = self.next_stackmap_id(StackMapKind::InBlock);
                self.builder.stackmap(id)?;
            }
        }
        Ok(())
    }

    /// Hand the exception to the runtime; control does not return.
    pub(super) fn lower_rethrow(&mut self, node: NodeId) -> CompileResult<()> {
        let exception = self.input_value(node, 1)?;
        let id = self.next_stackmap_id(StackMapKind::Rethrow);
        let gc_live = if !self.provenance.is_enabled() || self.provenance.is_managed(exception) {
            vec![exception]
        } else {
            Vec::new()
        };
        let call = StatepointCall {
            id,
            patch_bytes: id.patch_bytes(),
            target: self.config.rethrow_stub,
            args: vec![exception],
            ret: Type::Void,
            deopt: Vec::new(),
            gc_live: gc_live.clone(),
        };
        self.builder.emit(Op::Statepoint(call))?;
        self.builder.set_terminator(Terminator::Unreachable)?;
        self.record_call_site(node, id, DebugInfo::Rethrow, Vec::new(), gc_live, None, Vec::new());
        Ok(())
    }
}
