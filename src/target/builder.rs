//! Incremental construction of target functions.
//!
//! The builder keeps an insertion cursor. Appending to a block always lands
//! before its terminator, since terminators are stored apart from the
//! instruction list. Phis and landing pads go to the head of a block
//! regardless of the cursor.

use super::{
    BinOp, BlockOrigin, BlockRef, CastOp, Constant, FloatPredicate, Function, Inst, InstId,
    IntPredicate, Op, StatepointCall, TargetBlock, Terminator, Type, Value, ValueDef,
};
use crate::core::error::{CompileError, CompileResult};
use crate::debug_info::StackMapId;

pub struct FunctionBuilder {
    func: Function,
    cursor: Option<BlockRef>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type, ptr_bits: u32) -> Self {
        let values = params
            .iter()
            .enumerate()
            .map(|(i, ty)| (*ty, ValueDef::Param(i as u32)))
            .collect();
        Self {
            func: Function {
                name: name.into(),
                ptr_bits,
                params,
                ret,
                values,
                insts: Vec::new(),
                blocks: Vec::new(),
            },
            cursor: None,
        }
    }

    pub fn function(&self) -> &Function {
        &self.func
    }

    pub fn finish(self) -> Function {
        self.func
    }

    pub fn ptr_bits(&self) -> u32 {
        self.func.ptr_bits
    }

    pub fn add_block(&mut self, name: impl Into<String>, origin: BlockOrigin) -> BlockRef {
        let id = BlockRef(self.func.blocks.len() as u32);
        self.func.blocks.push(TargetBlock {
            name: name.into(),
            origin,
            insts: Vec::new(),
            terminator: None,
        });
        id
    }

    pub fn block_name(&self, block: BlockRef) -> &str {
        &self.func.blocks[block.index()].name
    }

    pub fn position_at_end(&mut self, block: BlockRef) {
        self.cursor = Some(block);
    }

    pub fn current_block(&self) -> Option<BlockRef> {
        self.cursor
    }

    pub fn param(&self, index: usize) -> Option<Value> {
        (index < self.func.params.len()).then_some(Value(index as u32))
    }

    pub fn value_type(&self, value: Value) -> Type {
        self.func.value_type(value)
    }

    fn new_value(&mut self, ty: Type, def: ValueDef) -> Value {
        let v = Value(self.func.values.len() as u32);
        self.func.values.push((ty, def));
        v
    }

    pub fn constant(&mut self, c: Constant) -> Value {
        self.new_value(c.ty(), ValueDef::Const(c))
    }

    pub fn const_int(&mut self, ty: Type, bits: u64) -> Value {
        self.constant(Constant::Int(ty, bits))
    }

    pub fn const_f32(&mut self, value: f32) -> Value {
        self.constant(Constant::F32(value.to_bits()))
    }

    pub fn const_f64(&mut self, value: f64) -> Value {
        self.constant(Constant::F64(value.to_bits()))
    }

    pub fn const_ptr(&mut self, addr: u64) -> Value {
        self.constant(Constant::Ptr(addr))
    }

    /// All-zero value of `ty`.
    pub fn null(&mut self, ty: Type) -> Value {
        match ty {
            Type::Ptr => self.const_ptr(0),
            Type::F32 => self.constant(Constant::F32(0)),
            Type::F64 => self.constant(Constant::F64(0)),
            ty => self.const_int(ty, 0),
        }
    }

    fn push_inst(&mut self, op: Op) -> (InstId, Option<Value>) {
        let id = InstId(self.func.insts.len() as u32);
        let result = op
            .result_type(&self.func.values)
            .map(|ty| self.new_value(ty, ValueDef::Inst(id)));
        self.func.insts.push(Inst { result, op });
        (id, result)
    }

    fn push_valued(&mut self, op: Op, ty: Type) -> (InstId, Value) {
        let id = InstId(self.func.insts.len() as u32);
        let result = self.new_value(ty, ValueDef::Inst(id));
        self.func.insts.push(Inst {
            result: Some(result),
            op,
        });
        (id, result)
    }

    /// Append `op` at the end of `block`.
    pub fn emit_in(&mut self, block: BlockRef, op: Op) -> Option<Value> {
        let (id, result) = self.push_inst(op);
        self.func.blocks[block.index()].insts.push(id);
        result
    }

    /// Append `op` at the cursor.
    pub fn emit(&mut self, op: Op) -> CompileResult<Option<Value>> {
        let block = self.cursor.ok_or_else(|| CompileError::BlockLayout {
            block: None,
            reason: "no insertion point".to_string(),
        })?;
        Ok(self.emit_in(block, op))
    }

    /// Append a value-producing `op` at the cursor.
    pub fn emit_value(&mut self, op: Op) -> CompileResult<Value> {
        let block = self.cursor;
        self.emit(op)?.ok_or_else(|| CompileError::BlockLayout {
            block: None,
            reason: format!("instruction in {block:?} produces no value"),
        })
    }

    fn head_position(&self, block: BlockRef, past: impl Fn(&Op) -> bool) -> usize {
        let insts = &self.func.blocks[block.index()].insts;
        insts
            .iter()
            .position(|id| !past(&self.func.insts[id.0 as usize].op))
            .unwrap_or(insts.len())
    }

    /// Insert an empty phi of `ty` after the existing phis of `block`.
    pub fn phi_at_head(&mut self, block: BlockRef, ty: Type) -> Value {
        let pos = self.head_position(block, |op| matches!(op, Op::Phi { .. }));
        let (id, result) = self.push_valued(
            Op::Phi {
                ty,
                incoming: Vec::new(),
            },
            ty,
        );
        self.func.blocks[block.index()].insts.insert(pos, id);
        result
    }

    /// Insert a landing pad after the phis of `block`.
    pub fn landing_pad_at_head(&mut self, block: BlockRef) -> Value {
        let pos = self.head_position(block, |op| matches!(op, Op::Phi { .. } | Op::LandingPad));
        let (id, result) = self.push_valued(Op::LandingPad, Type::Token);
        self.func.blocks[block.index()].insts.insert(pos, id);
        result
    }

    pub fn has_landing_pad(&self, block: BlockRef) -> bool {
        self.func.blocks[block.index()]
            .insts
            .iter()
            .any(|id| matches!(self.func.insts[id.0 as usize].op, Op::LandingPad))
    }

    pub fn add_incoming(&mut self, phi: Value, value: Value, from: BlockRef) -> CompileResult<()> {
        let ValueDef::Inst(id) = self.func.value_def(phi) else {
            return Err(CompileError::PhiRepresentation {
                value: phi,
                reason: "not a phi".to_string(),
            });
        };
        match &mut self.func.insts[id.0 as usize].op {
            Op::Phi { incoming, .. } => {
                incoming.push((value, from));
                Ok(())
            }
            _ => Err(CompileError::PhiRepresentation {
                value: phi,
                reason: "not a phi".to_string(),
            }),
        }
    }

    pub fn has_terminator(&self, block: BlockRef) -> bool {
        self.func.blocks[block.index()].terminator.is_some()
    }

    pub fn set_terminator_of(&mut self, block: BlockRef, term: Terminator) -> CompileResult<()> {
        let target = &mut self.func.blocks[block.index()];
        if target.terminator.is_some() {
            return Err(CompileError::BlockLayout {
                block: None,
                reason: format!("{} already has a terminator", target.name),
            });
        }
        target.terminator = Some(term);
        Ok(())
    }

    pub fn set_terminator(&mut self, term: Terminator) -> CompileResult<()> {
        let block = self.cursor.ok_or_else(|| CompileError::BlockLayout {
            block: None,
            reason: "no insertion point".to_string(),
        })?;
        self.set_terminator_of(block, term)
    }

    /// Terminate the current block with a statepoint invoke; returns its token.
    pub fn invoke(
        &mut self,
        call: StatepointCall,
        normal: BlockRef,
        unwind: BlockRef,
    ) -> CompileResult<Value> {
        let block = self.cursor.ok_or_else(|| CompileError::BlockLayout {
            block: None,
            reason: "no insertion point".to_string(),
        })?;
        let token = self.new_value(Type::Token, ValueDef::Terminator(block));
        self.set_terminator_of(
            block,
            Terminator::Invoke {
                call,
                token,
                normal,
                unwind,
            },
        )?;
        Ok(token)
    }

    // Shorthands used throughout lowering.

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> CompileResult<Value> {
        self.emit_value(Op::Binary { op, lhs, rhs })
    }

    pub fn icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> CompileResult<Value> {
        self.emit_value(Op::ICmp { pred, lhs, rhs })
    }

    pub fn fcmp(&mut self, pred: FloatPredicate, lhs: Value, rhs: Value) -> CompileResult<Value> {
        self.emit_value(Op::FCmp { pred, lhs, rhs })
    }

    pub fn cast(&mut self, op: CastOp, value: Value, to: Type) -> CompileResult<Value> {
        self.emit_value(Op::Cast { op, value, to })
    }

    pub fn gep(&mut self, base: Value, offset: Value) -> CompileResult<Value> {
        self.emit_value(Op::Gep { base, offset })
    }

    pub fn select(&mut self, cond: Value, on_true: Value, on_false: Value) -> CompileResult<Value> {
        self.emit_value(Op::Select {
            cond,
            on_true,
            on_false,
        })
    }

    pub fn load(&mut self, addr: Value, ty: Type) -> CompileResult<Value> {
        self.emit_value(Op::Load { addr, ty })
    }

    pub fn store(&mut self, value: Value, addr: Value) -> CompileResult<()> {
        self.emit(Op::Store { value, addr }).map(|_| ())
    }

    pub fn stackmap(&mut self, id: StackMapId) -> CompileResult<()> {
        self.emit(Op::StackMap { id }).map(|_| ())
    }

    pub fn br(&mut self, dest: BlockRef) -> CompileResult<()> {
        self.set_terminator(Terminator::Br(dest))
    }

    pub fn cond_br(&mut self, cond: Value, on_true: BlockRef, on_false: BlockRef) -> CompileResult<()> {
        self.set_terminator(Terminator::CondBr {
            cond,
            on_true,
            on_false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phis_and_landing_pads_go_to_the_head() {
        let mut b = FunctionBuilder::new("f", vec![Type::I32], Type::I32, 64);
        let bb = b.add_block("B1", BlockOrigin::Entry);
        b.position_at_end(bb);
        let x = b.param(0).unwrap();
        let sum = b.binary(BinOp::Add, x, x).unwrap();
        let pad = b.landing_pad_at_head(bb);
        let phi = b.phi_at_head(bb, Type::I32);

        let func = b.function();
        let results: Vec<_> = func.block_insts(bb).map(|i| i.result).collect();
        assert_eq!(results, vec![Some(phi), Some(pad), Some(sum)]);
    }

    #[test]
    fn second_terminator_is_rejected() {
        let mut b = FunctionBuilder::new("f", vec![], Type::Void, 64);
        let bb = b.add_block("B0", BlockOrigin::Entry);
        b.position_at_end(bb);
        b.set_terminator(Terminator::Ret(None)).unwrap();
        assert!(matches!(
            b.set_terminator(Terminator::Unreachable),
            Err(CompileError::BlockLayout { .. })
        ));
    }
}
