// This module defines the target representation the selector lowers into: a statepoint-aware
// SSA function made of named basic blocks. Values are defined by function parameters,
// constants, instructions or value-producing terminators (an invoke's statepoint token). Every
// block holds an ordered list of instructions and exactly one terminator once lowering is
// complete. Calls into managed code are statepoints that carry the call-site stack map id, the
// number of patchable bytes, deoptimization values and the GC-live pointer set; their return
// value is read back through a gc-result instruction. BlockOrigin records why a target block
// exists (synthetic entry, a source block, a call-result continuation or a handler dispatch
// test) so hosts and tests can tell synthetic blocks apart. The module also hosts the
// function builder, the textual printer used in trace logs and a small interpreter used by the
// tests to execute lowered functions.

//! Target SSA representation.

use std::fmt;

use crate::debug_info::StackMapId;
use crate::graph::BlockId;

pub mod builder;
pub mod display;
pub mod interp;

pub use builder::FunctionBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Pointer of the configured word size.
    Ptr,
    /// Statepoint or landing-pad token.
    Token,
}

impl Type {
    pub fn is_int(self) -> bool {
        matches!(self, Type::I1 | Type::I8 | Type::I16 | Type::I32 | Type::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    pub fn is_ptr(self) -> bool {
        self == Type::Ptr
    }

    /// Width in bits; pointers take `ptr_bits`.
    pub fn bits(self, ptr_bits: u32) -> u32 {
        match self {
            Type::Void | Type::Token => 0,
            Type::I1 => 1,
            Type::I8 => 8,
            Type::I16 => 16,
            Type::I32 | Type::F32 => 32,
            Type::I64 | Type::F64 => 64,
            Type::Ptr => ptr_bits,
        }
    }

    /// Integer type of `bits` width.
    pub fn int(bits: u32) -> Self {
        match bits {
            1 => Type::I1,
            8 => Type::I8,
            16 => Type::I16,
            32 => Type::I32,
            _ => Type::I64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl Value {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef(pub u32);

impl BlockRef {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u32);

/// Constant payload; floats are kept as raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(Type, u64),
    F32(u32),
    F64(u64),
    Ptr(u64),
}

impl Constant {
    pub fn ty(&self) -> Type {
        match self {
            Constant::Int(ty, _) => *ty,
            Constant::F32(_) => Type::F32,
            Constant::F64(_) => Type::F64,
            Constant::Ptr(_) => Type::Ptr,
        }
    }

    pub fn bits(&self) -> u64 {
        match *self {
            Constant::Int(_, bits) | Constant::F64(bits) | Constant::Ptr(bits) => bits,
            Constant::F32(bits) => bits as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    Param(u32),
    Const(Constant),
    Inst(InstId),
    /// Token produced by the terminator of the block.
    Terminator(BlockRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// Unordered float predicates: true when either operand is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatPredicate {
    Ueq,
    Une,
    Ult,
    Ule,
    Ugt,
    Uge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    ZExt,
    SExt,
    Trunc,
    IntToPtr,
    PtrToInt,
    PtrCast,
}

/// A call the collector may stop at.
#[derive(Debug, Clone, PartialEq)]
pub struct StatepointCall {
    pub id: StackMapId,
    pub patch_bytes: u32,
    pub target: u64,
    pub args: Vec<Value>,
    pub ret: Type,
    /// Interpreter state values recorded for deoptimization.
    pub deopt: Vec<Value>,
    /// Pointers the collector must relocate across the call.
    pub gc_live: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Binary { op: BinOp, lhs: Value, rhs: Value },
    ICmp { pred: IntPredicate, lhs: Value, rhs: Value },
    FCmp { pred: FloatPredicate, lhs: Value, rhs: Value },
    Cast { op: CastOp, value: Value, to: Type },
    /// Byte-offset address arithmetic.
    Gep { base: Value, offset: Value },
    Select { cond: Value, on_true: Value, on_false: Value },
    Load { addr: Value, ty: Type },
    Store { value: Value, addr: Value },
    /// Sequentially consistent compare-and-exchange; yields the success flag.
    CmpXchg { addr: Value, expected: Value, new: Value },
    Phi { ty: Type, incoming: Vec<(Value, BlockRef)> },
    Statepoint(StatepointCall),
    GcResult { statepoint: Value, ty: Type },
    /// Plain call into native code that never reaches a safepoint.
    CallC { target: u64, args: Vec<Value>, ret: Type },
    LandingPad,
    FrameAddress,
    Alloca { bytes: u32 },
    StackMap { id: StackMapId },
}

impl Op {
    /// Result type, `None` for ops without a value.
    pub fn result_type(&self, values: &[(Type, ValueDef)]) -> Option<Type> {
        let ty_of = |v: &Value| values[v.index()].0;
        match self {
            Op::Binary { lhs, .. } => Some(ty_of(lhs)),
            Op::ICmp { .. } | Op::FCmp { .. } | Op::CmpXchg { .. } => Some(Type::I1),
            Op::Cast { to, .. } => Some(*to),
            Op::Gep { .. } | Op::FrameAddress | Op::Alloca { .. } => Some(Type::Ptr),
            Op::Select { on_true, .. } => Some(ty_of(on_true)),
            Op::Load { ty, .. } | Op::Phi { ty, .. } | Op::GcResult { ty, .. } => Some(*ty),
            Op::Statepoint(_) | Op::LandingPad => Some(Type::Token),
            Op::CallC { ret, .. } => (*ret != Type::Void).then_some(*ret),
            Op::Store { .. } | Op::StackMap { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub result: Option<Value>,
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Br(BlockRef),
    CondBr {
        cond: Value,
        on_true: BlockRef,
        on_false: BlockRef,
    },
    Ret(Option<Value>),
    /// Statepoint call with explicit normal and unwind destinations.
    Invoke {
        call: StatepointCall,
        token: Value,
        normal: BlockRef,
        unwind: BlockRef,
    },
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockRef> {
        match self {
            Terminator::Br(b) => vec![*b],
            Terminator::CondBr {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            Terminator::Invoke { normal, unwind, .. } => vec![*normal, *unwind],
            Terminator::Ret(_) | Terminator::Unreachable => Vec::new(),
        }
    }
}

/// Why a target block exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Entry,
    Source(BlockId),
    /// Normal continuation of an invoke that reads the call result.
    CallResult(BlockId),
    /// One link of a multi-handler dispatch chain.
    HandlerDispatch(BlockId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetBlock {
    pub name: String,
    pub origin: BlockOrigin,
    pub insts: Vec<InstId>,
    pub terminator: Option<Terminator>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub ptr_bits: u32,
    pub params: Vec<Type>,
    pub ret: Type,
    pub values: Vec<(Type, ValueDef)>,
    pub insts: Vec<Inst>,
    pub blocks: Vec<TargetBlock>,
}

impl Function {
    pub fn value_type(&self, value: Value) -> Type {
        self.values[value.index()].0
    }

    pub fn value_def(&self, value: Value) -> ValueDef {
        self.values[value.index()].1
    }

    pub fn block(&self, block: BlockRef) -> &TargetBlock {
        &self.blocks[block.index()]
    }

    /// Block holding the instruction that defines `value`.
    pub fn def_block(&self, value: Value) -> Option<BlockRef> {
        let ValueDef::Inst(id) = self.value_def(value) else {
            return None;
        };
        self.blocks
            .iter()
            .position(|b| b.insts.contains(&id))
            .map(|i| BlockRef(i as u32))
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0 as usize]
    }

    /// Instructions of `block` in order.
    pub fn block_insts(&self, block: BlockRef) -> impl Iterator<Item = &Inst> + '_ {
        self.blocks[block.index()]
            .insts
            .iter()
            .map(move |id| &self.insts[id.0 as usize])
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockRef> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .map(|i| BlockRef(i as u32))
    }

    pub fn blocks_with_origin(&self, pred: impl Fn(BlockOrigin) -> bool) -> Vec<BlockRef> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| pred(b.origin))
            .map(|(i, _)| BlockRef(i as u32))
            .collect()
    }

    /// All instructions in block order.
    pub fn all_insts(&self) -> impl Iterator<Item = &Inst> + '_ {
        self.blocks
            .iter()
            .flat_map(move |b| b.insts.iter().map(move |id| &self.insts[id.0 as usize]))
    }

    /// Statepoints, whether called or invoked.
    pub fn statepoints(&self) -> Vec<&StatepointCall> {
        let mut out = Vec::new();
        for block in &self.blocks {
            for id in &block.insts {
                if let Op::Statepoint(call) = &self.insts[id.0 as usize].op {
                    out.push(call);
                }
            }
            if let Some(Terminator::Invoke { call, .. }) = &block.terminator {
                out.push(call);
            }
        }
        out
    }
}
