//! Textual form of target functions, used by trace logging.

use std::fmt;

use super::{Constant, Function, Op, StatepointCall, Terminator, Type, Value, ValueDef};

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Type::Void => "void",
            Type::I1 => "i1",
            Type::I8 => "i8",
            Type::I16 => "i16",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F32 => "float",
            Type::F64 => "double",
            Type::Ptr => "ptr",
            Type::Token => "token",
        };
        f.write_str(s)
    }
}

struct Operand<'a>(&'a Function, Value);

impl fmt::Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Operand(func, v) = *self;
        match func.value_def(v) {
            ValueDef::Const(Constant::Int(_, bits)) => write!(f, "{}", bits as i64),
            ValueDef::Const(Constant::F32(bits)) => write!(f, "{:?}", f32::from_bits(bits)),
            ValueDef::Const(Constant::F64(bits)) => write!(f, "{:?}", f64::from_bits(bits)),
            ValueDef::Const(Constant::Ptr(0)) => f.write_str("null"),
            ValueDef::Const(Constant::Ptr(addr)) => write!(f, "{addr:#x}"),
            _ => write!(f, "{v}"),
        }
    }
}

fn list(func: &Function, values: &[Value]) -> String {
    values
        .iter()
        .map(|v| Operand(func, *v).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn statepoint(func: &Function, call: &StatepointCall) -> String {
    format!(
        "statepoint {} [{}] {:#x}({}) deopt({}) gc({})",
        call.id,
        call.patch_bytes,
        call.target,
        list(func, &call.args),
        list(func, &call.deopt),
        list(func, &call.gc_live)
    )
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("{ty} %{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "define {} @{}({}) {{", self.ret, self.name, params)?;
        for block in &self.blocks {
            writeln!(f, "{}:  ; {:?}", block.name, block.origin)?;
            for id in &block.insts {
                let inst = self.inst(*id);
                f.write_str("  ")?;
                if let Some(r) = inst.result {
                    write!(f, "{r} = ")?;
                }
                let o = |v: &Value| Operand(self, *v);
                match &inst.op {
                    Op::Binary { op, lhs, rhs } => write!(f, "{op:?} {}, {}", o(lhs), o(rhs))?,
                    Op::ICmp { pred, lhs, rhs } => write!(f, "icmp {pred:?} {}, {}", o(lhs), o(rhs))?,
                    Op::FCmp { pred, lhs, rhs } => write!(f, "fcmp {pred:?} {}, {}", o(lhs), o(rhs))?,
                    Op::Cast { op, value, to } => write!(f, "{op:?} {} to {to}", o(value))?,
                    Op::Gep { base, offset } => write!(f, "gep {}, {}", o(base), o(offset))?,
                    Op::Select {
                        cond,
                        on_true,
                        on_false,
                    } => write!(f, "select {}, {}, {}", o(cond), o(on_true), o(on_false))?,
                    Op::Load { addr, ty } => write!(f, "load {ty}, {}", o(addr))?,
                    Op::Store { value, addr } => write!(f, "store {}, {}", o(value), o(addr))?,
                    Op::CmpXchg {
                        addr,
                        expected,
                        new,
                    } => write!(f, "cmpxchg {}, {}, {}", o(addr), o(expected), o(new))?,
                    Op::Phi { ty, incoming } => {
                        write!(f, "phi {ty}")?;
                        for (v, b) in incoming {
                            write!(f, " [{}, {}]", o(v), self.block(*b).name)?;
                        }
                    }
                    Op::Statepoint(call) => f.write_str(&statepoint(self, call))?,
                    Op::GcResult { statepoint, ty } => write!(f, "gc.result {ty} {statepoint}")?,
                    Op::CallC { target, args, ret } => {
                        write!(f, "call {ret} {target:#x}({})", list(self, args))?
                    }
                    Op::LandingPad => f.write_str("landingpad cleanup")?,
                    Op::FrameAddress => f.write_str("frameaddress")?,
                    Op::Alloca { bytes } => write!(f, "alloca {bytes}")?,
                    Op::StackMap { id } => write!(f, "stackmap {id}")?,
                }
                writeln!(f)?;
            }
            match &block.terminator {
                Some(Terminator::Br(b)) => writeln!(f, "  br {}", self.block(*b).name)?,
                Some(Terminator::CondBr {
                    cond,
                    on_true,
                    on_false,
                }) => writeln!(
                    f,
                    "  br {}, {}, {}",
                    Operand(self, *cond),
                    self.block(*on_true).name,
                    self.block(*on_false).name
                )?,
                Some(Terminator::Ret(Some(v))) => writeln!(f, "  ret {}", Operand(self, *v))?,
                Some(Terminator::Ret(None)) => writeln!(f, "  ret void")?,
                Some(Terminator::Invoke {
                    call,
                    token,
                    normal,
                    unwind,
                }) => writeln!(
                    f,
                    "  {token} = invoke {} to {} unwind {}",
                    statepoint(self, call),
                    self.block(*normal).name,
                    self.block(*unwind).name
                )?,
                Some(Terminator::Unreachable) => writeln!(f, "  unreachable")?,
                None => writeln!(f, "  ; <no terminator>")?,
            }
        }
        write!(f, "}}")
    }
}
