// Memory access tests. Loads, stores and compare-and-swap are lowered over both memory operand
// forms (a full address expression and a base plus displacement), including the folded
// constant-object address and the commuted integer/pointer address. Each test checks the
// address the access goes through and the value the function computes in the interpreter.

mod common;

use common::{init_logging, int, physical_args, run, run_with, select, THREAD};
use machsel::core::SelectorConfig;
use machsel::debug_info::DebugInfo;
use machsel::graph::{BasicType, BinaryOp, GraphBuilder, MemOperand, NodeType, Signature, ThreadField};
use machsel::reloc::RelocRequest;
use machsel::selector::{PtrTag, Selection};
use machsel::target::interp::{CallOutcome, Memory};
use machsel::target::{CastOp, Constant, Function, Op, Type, Value, ValueDef};

const OBJECT: u64 = 0x1_0000_0100;

fn no_calls(t: u64, _: &[u64], _: &mut Memory) -> CallOutcome {
    panic!("unexpected call to {t:#x}")
}

fn param(sel: &Selection, index: usize) -> Value {
    Value(sel.param_layout.param_to_arg(index).unwrap() as u32)
}

/// The instruction defining `value`.
fn def_op(func: &Function, value: Value) -> &Op {
    match func.value_def(value) {
        ValueDef::Inst(id) => &func.inst(id).op,
        def => panic!("{value} is not an instruction: {def:?}"),
    }
}

/// Address operand of the only load in `func`.
fn load_address(func: &Function) -> Value {
    let mut loads = func.all_insts().filter_map(|i| match i.op {
        Op::Load { addr, .. } => Some(addr),
        _ => None,
    });
    let addr = loads.next().expect("no load");
    assert!(loads.next().is_none(), "more than one load");
    addr
}

fn count_casts(func: &Function, cast: CastOp) -> usize {
    func.all_insts()
        .filter(|i| matches!(i.op, Op::Cast { op, .. } if op == cast))
        .count()
}

#[test]
fn displacement_operand_addresses_off_the_base() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Object], BasicType::Long);
    let mut b = GraphBuilder::new("get_field", sig);
    let body = b.block();
    b.goto(b.root(), body);
    let obj = b.parm(0);
    let field = b.load(body, MemOperand::IndOffset(16), BasicType::Long, obj);
    b.ret(body, Some(field));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let addr = load_address(&sel.function);
    let Op::Gep { base, offset } = def_op(&sel.function, addr) else {
        panic!("load address is not a gep");
    };
    assert_eq!(*base, param(&sel, 0));
    assert_eq!(sel.function.value_def(*offset), ValueDef::Const(Constant::Int(Type::I64, 16)));

    let mut memory = Memory::new();
    memory.write(OBJECT + 16, 8, 0x0123_4567_89ab_cdef);
    let args = physical_args(&sel.param_layout, &[OBJECT]);
    let (result, _) = run_with(&sel.function, memory, &args, no_calls);
    assert_eq!(result, Some(0x0123_4567_89ab_cdef));
}

#[test]
fn folded_constant_object_stays_the_base() {
    init_logging();
    let sig = Signature::new(vec![], BasicType::Int);
    let mut b = GraphBuilder::new("static_field", sig);
    let body = b.block();
    b.goto(b.root(), body);
    let holder = b.con_p(body, 0x1000);
    let field = b.addp_imm(body, NodeType::derived(8), holder, holder, 8);
    let value = b.load(body, MemOperand::Indirect, BasicType::Int, field);
    b.ret(body, Some(value));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let addr = load_address(&sel.function);
    let Op::Gep { base, offset } = def_op(&sel.function, addr) else {
        panic!("load address is not a gep");
    };
    assert_eq!(sel.function.value_def(*base), ValueDef::Const(Constant::Ptr(0x1000)));
    assert_eq!(sel.provenance.tag(*base), Some(PtrTag::Managed));
    assert_eq!(sel.function.value_def(*offset), ValueDef::Const(Constant::Int(Type::I64, 8)));
    assert_eq!(count_casts(&sel.function, CastOp::IntToPtr), 0);

    // One oop relocation for the single constant object.
    let oops: Vec<_> = sel
        .reloc_sites
        .iter()
        .filter(|s| s.request == RelocRequest::Debug(DebugInfo::Oop(0x1000)))
        .collect();
    assert_eq!(oops.len(), 1);

    let mut memory = Memory::new();
    memory.write(0x1008, 4, 77);
    let (result, _) = run_with(&sel.function, memory, &[], no_calls);
    assert_eq!(result, Some(77));
}

#[test]
fn folded_constant_object_with_register_index() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Long], BasicType::Int);
    let mut b = GraphBuilder::new("table_entry", sig);
    let body = b.block();
    b.goto(b.root(), body);
    let index = b.parm(0);
    let table = b.con_p(body, 0x2000);
    let slot = b.addp(body, NodeType::of(BasicType::Address), table, table, index);
    let value = b.load(body, MemOperand::Indirect, BasicType::Int, slot);
    b.ret(body, Some(value));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let Op::Gep { base, offset } = def_op(&sel.function, load_address(&sel.function)) else {
        panic!("load address is not a gep");
    };
    assert_eq!(sel.function.value_def(*base), ValueDef::Const(Constant::Ptr(0x2000)));
    assert_eq!(*offset, param(&sel, 0));

    let mut memory = Memory::new();
    memory.write(0x2000 + 12, 4, 5);
    let args = physical_args(&sel.param_layout, &[12]);
    let (result, _) = run_with(&sel.function, memory, &args, no_calls);
    assert_eq!(result, Some(5));
}

#[test]
fn integer_address_with_pointer_offset_is_commuted() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Object, BasicType::Long], BasicType::Int);
    let mut b = GraphBuilder::new("element", sig);
    let body = b.block();
    b.goto(b.root(), body);
    let array = b.parm(0);
    let scaled = b.parm(1);
    // Address input is the integer, offset input the object.
    let elem = b.addp(body, NodeType::of(BasicType::Address), array, scaled, array);
    let value = b.load(body, MemOperand::Indirect, BasicType::Int, elem);
    b.ret(body, Some(value));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let Op::Gep { base, offset } = def_op(&sel.function, load_address(&sel.function)) else {
        panic!("load address is not a gep");
    };
    assert_eq!(*base, param(&sel, 0));
    assert_eq!(*offset, param(&sel, 1));
    assert_eq!(count_casts(&sel.function, CastOp::IntToPtr), 0);

    let mut memory = Memory::new();
    memory.write(OBJECT + 0x20, 4, 31);
    let args = physical_args(&sel.param_layout, &[OBJECT, 0x20]);
    let (result, _) = run_with(&sel.function, memory, &args, no_calls);
    assert_eq!(result, Some(31));
}

#[test]
fn store_narrows_to_the_field_width() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Object, BasicType::Long], BasicType::Long);
    let mut b = GraphBuilder::new("put_int", sig);
    let body = b.block();
    b.goto(b.root(), body);
    let obj = b.parm(0);
    let wide = b.parm(1);
    b.store(body, MemOperand::IndOffset(8), BasicType::Int, obj, wide);
    let back = b.load(body, MemOperand::IndOffset(8), BasicType::Long, obj);
    b.ret(body, Some(back));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let stored = sel
        .function
        .all_insts()
        .find_map(|i| match i.op {
            Op::Store { value, .. } => Some(value),
            _ => None,
        })
        .unwrap();
    assert_eq!(sel.function.value_type(stored), Type::I32);

    // The upper half of the 8-byte slot keeps its old contents.
    let mut memory = Memory::new();
    memory.write(OBJECT + 8, 8, 0xffff_ffff_ffff_ffff);
    let args = physical_args(&sel.param_layout, &[OBJECT, 0x1111_2222_3333_4444]);
    let (result, _) = run_with(&sel.function, memory, &args, no_calls);
    assert_eq!(result, Some(0xffff_ffff_3333_4444));
}

#[test]
fn compare_and_swap_reports_success() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Object, BasicType::Int, BasicType::Int], BasicType::Int);
    let mut b = GraphBuilder::new("cas_int", sig);
    let body = b.block();
    b.goto(b.root(), body);
    let obj = b.parm(0);
    let expected = b.parm(1);
    let new = b.parm(2);
    let ok = b.compare_and_swap(body, MemOperand::IndOffset(12), obj, expected, new);
    let after = b.load(body, MemOperand::IndOffset(12), BasicType::Int, obj);
    let thousand = b.con_i(body, 1000);
    let flag = b.binary(body, BinaryOp::Mul, BasicType::Int, ok, thousand);
    let result = b.binary(body, BinaryOp::Add, BasicType::Int, flag, after);
    b.ret(body, Some(result));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    assert_eq!(
        sel.function
            .all_insts()
            .filter(|i| matches!(i.op, Op::CmpXchg { .. }))
            .count(),
        1
    );

    for (current, want) in [(5, 1009), (6, 6)] {
        let mut memory = Memory::new();
        memory.write(OBJECT + 12, 4, current);
        let args = physical_args(&sel.param_layout, &[OBJECT, int(5), int(9)]);
        let (result, _) = run_with(&sel.function, memory, &args, no_calls);
        assert_eq!(result, Some(want), "field holding {current}");
    }
}

#[test]
fn compare_and_swap_coerces_integer_against_pointer() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Object, BasicType::Object], BasicType::Int);
    let mut b = GraphBuilder::new("cas_oop", sig);
    let body = b.block();
    b.goto(b.root(), body);
    let obj = b.parm(0);
    let value = b.parm(1);
    let null = b.con_l(body, 0);
    let ok = b.compare_and_swap(body, MemOperand::IndOffset(16), obj, null, value);
    b.ret(body, Some(ok));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let (expected, new) = sel
        .function
        .all_insts()
        .find_map(|i| match i.op {
            Op::CmpXchg { expected, new, .. } => Some((expected, new)),
            _ => None,
        })
        .unwrap();
    assert_eq!(new, param(&sel, 1));
    assert!(matches!(
        def_op(&sel.function, expected),
        Op::Cast {
            op: CastOp::IntToPtr,
            ..
        }
    ));

    let args = physical_args(&sel.param_layout, &[OBJECT, 0x2_0000_0000]);
    assert_eq!(run(&sel.function, &args), Some(1));
    let mut taken = Memory::new();
    taken.write(OBJECT + 16, 8, 0x3_0000_0000);
    let (result, _) = run_with(&sel.function, taken, &args, no_calls);
    assert_eq!(result, Some(0));
}

#[test]
fn thread_fields_address_off_the_thread_pointer() {
    init_logging();
    let config = SelectorConfig::default();
    for (field, offset) in [
        (ThreadField::TlabTop, config.thread.tlab_top_offset),
        (ThreadField::TlabEnd, config.thread.tlab_end_offset),
    ] {
        let mut b = GraphBuilder::new("tlab", Signature::new(vec![], BasicType::Address));
        let body = b.block();
        b.goto(b.root(), body);
        let addr = b.thread_field(body, field);
        b.ret(body, Some(addr));
        let mut graph = b.finish();

        let (sel, _) = select(&mut graph, &config).unwrap();
        let thread = sel
            .function
            .all_insts()
            .find_map(|i| match i.op {
                Op::CallC { .. } => i.result,
                _ => None,
            })
            .unwrap();
        let geps: Vec<&Op> = sel
            .function
            .all_insts()
            .map(|i| &i.op)
            .filter(|op| matches!(op, Op::Gep { .. }))
            .collect();
        assert!(matches!(geps[..], [Op::Gep { base, .. }] if *base == thread));
        assert_eq!(run(&sel.function, &[]), Some(THREAD + offset as u64), "{field:?}");
    }
}

#[test]
fn tlab_top_is_loadable() {
    init_logging();
    let mut b = GraphBuilder::new("tlab_top", Signature::new(vec![], BasicType::Address));
    let body = b.block();
    b.goto(b.root(), body);
    let top_addr = b.thread_field(body, ThreadField::TlabTop);
    let top = b.load(body, MemOperand::Indirect, BasicType::Address, top_addr);
    b.ret(body, Some(top));
    let mut graph = b.finish();

    let config = SelectorConfig::default();
    let (sel, _) = select(&mut graph, &config).unwrap();
    let mut memory = Memory::new();
    memory.write(THREAD + config.thread.tlab_top_offset as u64, 8, 0x5_0000_0040);
    let (result, _) = run_with(&sel.function, memory, &[], no_calls);
    assert_eq!(result, Some(0x5_0000_0040));
}
