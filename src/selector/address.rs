//! Address formation and memory access lowering.

use super::Selector;
use crate::core::error::{CompileError, CompileResult};
use crate::graph::{slots, AddPOffset, BasicType, MemOperand, NodeId, NodeKind};
use crate::target::{CastOp, Op, Type, Value};

impl<'g, 'arena> Selector<'g, 'arena> {
    /// `base + offset` with a constant byte offset.
    pub(super) fn gep_const(&mut self, base: Value, offset: i64) -> CompileResult<Value> {
        let off = self.builder.const_int(Type::I64, offset as u64);
        self.builder.gep(base, off)
    }

    /// Address arithmetic. An integer address with a pointer offset is
    /// commuted; a purely integral address becomes a pointer first.
    fn form_address(&mut self, node: NodeId, addr: Value, offset: Value) -> CompileResult<Value> {
        let (mut addr, offset) = if !self.builder.value_type(addr).is_ptr()
            && self.builder.value_type(offset).is_ptr()
        {
            (offset, addr)
        } else {
            (addr, offset)
        };
        match self.builder.value_type(addr) {
            Type::Ptr => {}
            ty if ty.is_int() => addr = self.builder.cast(CastOp::IntToPtr, addr, Type::Ptr)?,
            ty => {
                return Err(CompileError::MalformedNode {
                    node,
                    reason: format!("address of type {ty}"),
                })
            }
        }
        if !self.builder.value_type(offset).is_int() {
            return Err(CompileError::MalformedNode {
                node,
                reason: "address offset is not an integer".to_string(),
            });
        }
        self.builder.gep(addr, offset)
    }

    fn addp_offset(&mut self, node: NodeId, offset: AddPOffset) -> CompileResult<Value> {
        match offset {
            AddPOffset::Reg => self.input_value(node, slots::OFFSET),
            AddPOffset::Imm(imm) => Ok(self.builder.const_int(Type::I64, imm as u64)),
        }
    }

    pub(super) fn lower_addp(&mut self, node: NodeId, offset: AddPOffset) -> CompileResult<Value> {
        let addr = self.input_value(node, slots::ADDRESS)?;
        let off = self.addp_offset(node, offset)?;
        self.form_address(node, addr, off)
    }

    /// Effective address of a memory node.
    fn select_address(&mut self, node: NodeId, mem: MemOperand) -> CompileResult<Value> {
        let addr_node = self.input_node(node, slots::ADDRESS)?;
        match mem {
            MemOperand::IndOffset(disp) => {
                let base = self.value_of(addr_node)?;
                let off = self.builder.const_int(Type::I64, disp as u64);
                self.form_address(node, base, off)
            }
            MemOperand::Indirect => {
                match self.graph.node(addr_node).kind {
                    // Folded address: the constant object is the offset
                    // operand, and `form_address` swaps it back into the base.
                    NodeKind::AddP { offset } => {
                        let inner = self.input_node(addr_node, slots::ADDRESS)?;
                        if matches!(self.graph.node(inner).kind, NodeKind::ConP(_)) {
                            let object = self.value_of(inner)?;
                            let base = self.addp_offset(addr_node, offset)?;
                            self.form_address(node, base, object)
                        } else {
                            self.value_of(addr_node)
                        }
                    }
                    _ => self.value_of(addr_node),
                }
            }
        }
    }

    pub(super) fn lower_load(
        &mut self,
        node: NodeId,
        mem: MemOperand,
        ty: BasicType,
    ) -> CompileResult<Value> {
        let addr = self.select_address(node, mem)?;
        if ty == BasicType::NarrowOop && self.fast_compression {
            let narrow = self.builder.load(addr, Type::I32)?;
            let word = self.int_resize(narrow, self.word_type(), false)?;
            return self.builder.cast(CastOp::IntToPtr, word, Type::Ptr);
        }
        let loaded = self.type_of(ty)?;
        self.builder.load(addr, loaded)
    }

    pub(super) fn lower_store(
        &mut self,
        node: NodeId,
        mem: MemOperand,
        ty: BasicType,
    ) -> CompileResult<()> {
        let addr = self.select_address(node, mem)?;
        let mut value = self.input_value(node, slots::VALUE_IN)?;
        let value_ty = self.builder.value_type(value);
        if ty == BasicType::NarrowOop && self.fast_compression {
            let word = self.builder.cast(CastOp::PtrToInt, value, self.word_type())?;
            value = self.int_resize(word, Type::I32, false)?;
        } else {
            let mem_ty = self.type_of(ty)?;
            if mem_ty.is_int() && value_ty.is_int() {
                value = self.int_resize(value, mem_ty, false)?;
            } else if mem_ty.is_int() && value_ty.is_ptr() {
                let word = self.builder.cast(CastOp::PtrToInt, value, self.word_type())?;
                value = self.int_resize(word, mem_ty, false)?;
            } else if mem_ty != value_ty {
                return Err(CompileError::MalformedNode {
                    node,
                    reason: format!("storing {value_ty} as {mem_ty}"),
                });
            }
        }
        self.builder.store(value, addr)
    }

    /// Compare-and-swap yielding 1 on success, 0 otherwise.
    pub(super) fn lower_cas(&mut self, node: NodeId, mem: MemOperand) -> CompileResult<Value> {
        let addr = self.select_address(node, mem)?;
        let expected = self.input_value(node, slots::EXPECTED)?;
        let new = self.input_value(node, slots::NEW_VALUE)?;
        let (expected, new) = self.coerce_pair(node, expected, new)?;
        let ok = self.builder.emit_value(Op::CmpXchg {
            addr,
            expected,
            new,
        })?;
        self.builder.cast(CastOp::ZExt, ok, Type::I32)
    }

    /// Bring two operands to one representation: a pointer paired with an
    /// integer turns the integer into a pointer.
    pub(super) fn coerce_pair(
        &mut self,
        node: NodeId,
        a: Value,
        b: Value,
    ) -> CompileResult<(Value, Value)> {
        let (at, bt) = (self.builder.value_type(a), self.builder.value_type(b));
        if at == bt {
            return Ok((a, b));
        }
        let to_ptr = |s: &mut Self, v: Value| -> CompileResult<Value> {
            let word = s.int_resize(v, s.word_type(), false)?;
            s.builder.cast(CastOp::IntToPtr, word, Type::Ptr)
        };
        match (at.is_ptr(), bt.is_ptr()) {
            (true, false) if bt.is_int() => Ok((a, to_ptr(self, b)?)),
            (false, true) if at.is_int() => Ok((to_ptr(self, a)?, b)),
            _ if at.is_int() && bt.is_int() => {
                let wide = if at.bits(64) >= bt.bits(64) { at } else { bt };
                let a = self.int_resize(a, wide, true)?;
                let b = self.int_resize(b, wide, true)?;
                Ok((a, b))
            }
            _ => Err(CompileError::MalformedNode {
                node,
                reason: format!("operands of type {at} and {bt}"),
            }),
        }
    }
}
