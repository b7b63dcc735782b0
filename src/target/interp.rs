// This module provides a small reference evaluator for target functions. It executes a lowered
// function block by block over a byte-addressed little-endian memory, evaluating the phis of a
// block against the edge it was entered from, and hands every call (statepoint, invoke or plain
// native call) to a caller-supplied hook that either returns a value or unwinds. Invokes route
// an unwinding call to their unwind destination; an unwind anywhere else is an error. A step
// limit guards against non-terminating inputs. The evaluator exists so tests can check that a
// lowering computes the right thing (compression round trips, branch polarity, handler
// dispatch) instead of only matching instruction shapes.

//! Reference interpreter for lowered functions.

use hashbrown::HashMap;
use thiserror::Error;

use super::{
    BinOp, BlockRef, CastOp, FloatPredicate, Function, IntPredicate, Op, Terminator, Type, Value,
    ValueDef,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpError {
    #[error("Step limit of {0} exceeded")]
    StepLimit(usize),

    #[error("Block {0} has no terminator")]
    MissingTerminator(String),

    #[error("Expected {expected} arguments, got {got}")]
    ArgCount { expected: usize, got: usize },

    #[error("Phi {phi} in {block} has no incoming value for the taken edge")]
    MissingIncoming { phi: Value, block: String },

    #[error("Value {0} used before definition")]
    Undefined(Value),

    #[error("Call to {0:#x} unwound outside an invoke")]
    UnwindOutsideInvoke(u64),

    #[error("Reached unreachable in {0}")]
    Unreachable(String),
}

pub type InterpResult<T> = Result<T, InterpError>;

/// Result of a call made by the interpreted function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Return(u64),
    Unwind,
}

/// Host side of every call the function makes.
pub trait CallHook {
    fn call(&mut self, target: u64, args: &[u64], memory: &mut Memory) -> CallOutcome;
}

impl<F> CallHook for F
where
    F: FnMut(u64, &[u64], &mut Memory) -> CallOutcome,
{
    fn call(&mut self, target: u64, args: &[u64], memory: &mut Memory) -> CallOutcome {
        self(target, args, memory)
    }
}

/// Sparse little-endian memory; unwritten bytes read as zero.
#[derive(Debug, Default, Clone)]
pub struct Memory {
    bytes: HashMap<u64, u8>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, addr: u64, size: usize) -> u64 {
        (0..size).fold(0u64, |acc, i| {
            let byte = self.bytes.get(&addr.wrapping_add(i as u64)).copied().unwrap_or(0);
            acc | (byte as u64) << (8 * i)
        })
    }

    pub fn write(&mut self, addr: u64, size: usize, value: u64) {
        for i in 0..size {
            self.bytes
                .insert(addr.wrapping_add(i as u64), (value >> (8 * i)) as u8);
        }
    }
}

const FRAME_ADDRESS: u64 = 0x7fff_f000_0000;
const DEFAULT_STEP_LIMIT: usize = 100_000;

fn mask(bits: u32, value: u64) -> u64 {
    match bits {
        0 => 0,
        b if b >= 64 => value,
        b => value & ((1u64 << b) - 1),
    }
}

fn sext(bits: u32, value: u64) -> i64 {
    match bits {
        0 => 0,
        b if b >= 64 => value as i64,
        b => ((value << (64 - b)) as i64) >> (64 - b),
    }
}

fn byte_size(bits: u32) -> usize {
    bits.div_ceil(8) as usize
}

pub struct Interpreter<'f> {
    func: &'f Function,
    pub memory: Memory,
    step_limit: usize,
    stack_top: u64,
    trace: Vec<BlockRef>,
}

impl<'f> Interpreter<'f> {
    pub fn new(func: &'f Function) -> Self {
        Self {
            func,
            memory: Memory::new(),
            step_limit: DEFAULT_STEP_LIMIT,
            stack_top: FRAME_ADDRESS,
            trace: Vec::new(),
        }
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = memory;
        self
    }

    /// Blocks entered by the last run, in order.
    pub fn trace(&self) -> &[BlockRef] {
        &self.trace
    }

    /// Names of the blocks entered by the last run.
    pub fn trace_names(&self) -> Vec<&str> {
        self.trace
            .iter()
            .map(|b| self.func.block(*b).name.as_str())
            .collect()
    }

    fn bits(&self, ty: Type) -> u32 {
        match ty {
            // Tokens carry the call's raw return value.
            Type::Token => 64,
            ty => ty.bits(self.func.ptr_bits),
        }
    }

    pub fn run(&mut self, args: &[u64], hook: &mut dyn CallHook) -> InterpResult<Option<u64>> {
        let func = self.func;
        if args.len() != func.params.len() {
            return Err(InterpError::ArgCount {
                expected: func.params.len(),
                got: args.len(),
            });
        }
        let mut vals: Vec<Option<u64>> = vec![None; func.values.len()];
        for (idx, (ty, def)) in func.values.iter().enumerate() {
            match def {
                ValueDef::Param(i) => vals[idx] = Some(mask(self.bits(*ty), args[*i as usize])),
                ValueDef::Const(c) => vals[idx] = Some(mask(self.bits(*ty), c.bits())),
                _ => {}
            }
        }
        self.trace.clear();

        let mut steps = 0usize;
        let mut prev: Option<BlockRef> = None;
        let mut block = BlockRef(0);
        loop {
            self.trace.push(block);
            let tb = func.block(block);

            // Phis read their inputs on entry, all at once.
            let mut phi_vals = Vec::new();
            for id in &tb.insts {
                let inst = func.inst(*id);
                let Op::Phi { incoming, .. } = &inst.op else {
                    break;
                };
                let (v, _) = incoming
                    .iter()
                    .find(|(_, from)| Some(*from) == prev)
                    .ok_or_else(|| InterpError::MissingIncoming {
                        phi: inst.result.unwrap_or(Value(u32::MAX)),
                        block: tb.name.clone(),
                    })?;
                phi_vals.push((inst.result, get(&vals, *v)?));
            }
            for (r, v) in phi_vals {
                if let Some(r) = r {
                    vals[r.index()] = Some(v);
                }
            }

            for id in &tb.insts {
                let inst = func.inst(*id);
                if matches!(inst.op, Op::Phi { .. }) {
                    continue;
                }
                steps += 1;
                if steps > self.step_limit {
                    return Err(InterpError::StepLimit(self.step_limit));
                }
                let result = self.exec(&inst.op, &vals, hook)?;
                if let (Some(r), Some(v)) = (inst.result, result) {
                    vals[r.index()] = Some(mask(self.bits(func.value_type(r)), v));
                }
            }

            steps += 1;
            if steps > self.step_limit {
                return Err(InterpError::StepLimit(self.step_limit));
            }
            let next = match &tb.terminator {
                None => return Err(InterpError::MissingTerminator(tb.name.clone())),
                Some(Terminator::Ret(v)) => {
                    return v.map(|v| get(&vals, v)).transpose();
                }
                Some(Terminator::Unreachable) => {
                    return Err(InterpError::Unreachable(tb.name.clone()))
                }
                Some(Terminator::Br(b)) => *b,
                Some(Terminator::CondBr {
                    cond,
                    on_true,
                    on_false,
                }) => {
                    if get(&vals, *cond)? != 0 {
                        *on_true
                    } else {
                        *on_false
                    }
                }
                Some(Terminator::Invoke {
                    call,
                    token,
                    normal,
                    unwind,
                }) => {
                    let args = call
                        .args
                        .iter()
                        .map(|a| get(&vals, *a))
                        .collect::<InterpResult<Vec<_>>>()?;
                    match hook.call(call.target, &args, &mut self.memory) {
                        CallOutcome::Return(r) => {
                            vals[token.index()] = Some(r);
                            *normal
                        }
                        CallOutcome::Unwind => *unwind,
                    }
                }
            };
            prev = Some(block);
            block = next;
        }
    }

    fn exec(
        &mut self,
        op: &Op,
        vals: &[Option<u64>],
        hook: &mut dyn CallHook,
    ) -> InterpResult<Option<u64>> {
        let func = self.func;
        let ty_bits = |v: &Value| func.value_type(*v).bits(func.ptr_bits);
        let out = match op {
            Op::Binary { op, lhs, rhs } => {
                let ty = func.value_type(*lhs);
                let bits = self.bits(ty);
                let (a, b) = (get(vals, *lhs)?, get(vals, *rhs)?);
                Some(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl => a.wrapping_shl((b % bits.max(1) as u64) as u32),
                    BinOp::LShr => a.wrapping_shr((b % bits.max(1) as u64) as u32),
                    BinOp::AShr => (sext(bits, a) >> (b % bits.max(1) as u64)) as u64,
                    BinOp::FAdd | BinOp::FSub | BinOp::FMul => float_binary(*op, ty, a, b),
                })
            }
            Op::ICmp { pred, lhs, rhs } => {
                let bits = ty_bits(lhs);
                let (a, b) = (get(vals, *lhs)?, get(vals, *rhs)?);
                let (sa, sb) = (sext(bits, a), sext(bits, b));
                Some(match pred {
                    IntPredicate::Eq => a == b,
                    IntPredicate::Ne => a != b,
                    IntPredicate::Slt => sa < sb,
                    IntPredicate::Sle => sa <= sb,
                    IntPredicate::Sgt => sa > sb,
                    IntPredicate::Sge => sa >= sb,
                    IntPredicate::Ult => a < b,
                    IntPredicate::Ule => a <= b,
                    IntPredicate::Ugt => a > b,
                    IntPredicate::Uge => a >= b,
                } as u64)
            }
            Op::FCmp { pred, lhs, rhs } => {
                let ty = func.value_type(*lhs);
                let a = as_f64(ty, get(vals, *lhs)?);
                let b = as_f64(ty, get(vals, *rhs)?);
                let unordered = a.is_nan() || b.is_nan();
                Some(
                    (unordered
                        || match pred {
                            FloatPredicate::Ueq => a == b,
                            FloatPredicate::Une => a != b,
                            FloatPredicate::Ult => a < b,
                            FloatPredicate::Ule => a <= b,
                            FloatPredicate::Ugt => a > b,
                            FloatPredicate::Uge => a >= b,
                        }) as u64,
                )
            }
            Op::Cast { op, value, to } => {
                let from = ty_bits(value);
                let v = get(vals, *value)?;
                let to_bits = self.bits(*to);
                Some(match op {
                    CastOp::SExt => mask(to_bits, sext(from, v) as u64),
                    CastOp::ZExt
                    | CastOp::Trunc
                    | CastOp::IntToPtr
                    | CastOp::PtrToInt
                    | CastOp::PtrCast => mask(to_bits, v),
                })
            }
            Op::Gep { base, offset } => {
                let off = sext(ty_bits(offset), get(vals, *offset)?);
                Some(get(vals, *base)?.wrapping_add(off as u64))
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => Some(if get(vals, *cond)? != 0 {
                get(vals, *on_true)?
            } else {
                get(vals, *on_false)?
            }),
            Op::Load { addr, ty } => {
                let size = byte_size(self.bits(*ty));
                Some(self.memory.read(get(vals, *addr)?, size))
            }
            Op::Store { value, addr } => {
                let size = byte_size(ty_bits(value));
                self.memory.write(get(vals, *addr)?, size, get(vals, *value)?);
                None
            }
            Op::CmpXchg {
                addr,
                expected,
                new,
            } => {
                let bits = ty_bits(new);
                let size = byte_size(bits);
                let addr = get(vals, *addr)?;
                let old = self.memory.read(addr, size);
                if mask(bits, old) == mask(bits, get(vals, *expected)?) {
                    self.memory.write(addr, size, get(vals, *new)?);
                    Some(1)
                } else {
                    Some(0)
                }
            }
            Op::Phi { .. } => None,
            Op::Statepoint(call) => {
                let args = call
                    .args
                    .iter()
                    .map(|a| get(vals, *a))
                    .collect::<InterpResult<Vec<_>>>()?;
                match hook.call(call.target, &args, &mut self.memory) {
                    CallOutcome::Return(r) => Some(r),
                    CallOutcome::Unwind => return Err(InterpError::UnwindOutsideInvoke(call.target)),
                }
            }
            Op::GcResult { statepoint, .. } => Some(get(vals, *statepoint)?),
            Op::CallC { target, args, .. } => {
                let args = args
                    .iter()
                    .map(|a| get(vals, *a))
                    .collect::<InterpResult<Vec<_>>>()?;
                match hook.call(*target, &args, &mut self.memory) {
                    CallOutcome::Return(r) => Some(r),
                    CallOutcome::Unwind => return Err(InterpError::UnwindOutsideInvoke(*target)),
                }
            }
            Op::LandingPad => Some(0),
            Op::FrameAddress => Some(FRAME_ADDRESS),
            Op::Alloca { bytes } => {
                self.stack_top = (self.stack_top - *bytes as u64) & !0xf;
                Some(self.stack_top)
            }
            Op::StackMap { .. } => None,
        };
        Ok(out)
    }
}

fn get(vals: &[Option<u64>], v: Value) -> InterpResult<u64> {
    vals.get(v.index())
        .copied()
        .flatten()
        .ok_or(InterpError::Undefined(v))
}

fn as_f64(ty: Type, bits: u64) -> f64 {
    if ty == Type::F32 {
        f32::from_bits(bits as u32) as f64
    } else {
        f64::from_bits(bits)
    }
}

fn float_binary(op: BinOp, ty: Type, a: u64, b: u64) -> u64 {
    if ty == Type::F32 {
        let (a, b) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
        let r = match op {
            BinOp::FAdd => a + b,
            BinOp::FSub => a - b,
            _ => a * b,
        };
        r.to_bits() as u64
    } else {
        let (a, b) = (f64::from_bits(a), f64::from_bits(b));
        let r = match op {
            BinOp::FAdd => a + b,
            BinOp::FSub => a - b,
            _ => a * b,
        };
        r.to_bits()
    }
}
