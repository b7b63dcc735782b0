// End-to-end selection tests. Each test builds a small scheduled graph with GraphBuilder, runs
// the selector over it and checks both the shape of the lowered function (blocks, statepoints,
// landing pads, dispatch blocks) and what it computes, by executing it in the reference
// interpreter with a host hook standing in for the runtime.

mod common;

use common::{init_logging, int, physical_args, run, run_with, select, THREAD};
use machsel::core::{CompileError, SelectorConfig};
use machsel::debug_info::{DebugInfo, StackMapKind};
use machsel::graph::{
    BasicType, BinaryOp, CallKind, CallNode, CmpKind, CondCode, GraphBuilder, MethodRef,
    NodeType, Signature, FALL_THROUGH_INDEX,
};
use machsel::selector::{PtrTag, RelocAnchor};
use machsel::target::interp::{CallOutcome, Memory};
use machsel::target::{BinOp, BlockOrigin, BlockRef, Op, Terminator, Value};

const CALLEE: u64 = 0x5000;

fn java_call(params: Vec<BasicType>, ret: BasicType) -> CallNode {
    CallNode {
        kind: CallKind::StaticJava,
        entry_point: CALLEE,
        method: Some(MethodRef {
            name: "callee".to_string(),
            is_static: true,
        }),
        signature: Signature::new(params, ret),
        debug: Vec::new(),
    }
}

#[test]
fn constant_return() {
    init_logging();
    let mut b = GraphBuilder::new("answer", Signature::new(vec![], BasicType::Int));
    let body = b.block();
    b.goto(b.root(), body);
    let c = b.con_i(body, 42);
    b.ret(body, Some(c));
    let mut graph = b.finish();

    let (sel, stats) = select(&mut graph, &SelectorConfig::default()).unwrap();
    assert!(sel.reloc_sites.is_empty());
    assert!(sel.call_sites.is_empty());
    assert_eq!(sel.function.block(sel.block(body)).name, "B2");
    assert_eq!(stats.call_sites, 0);

    let (result, trace) = run_with(&sel.function, Memory::new(), &[], |t: u64, _: &[u64], _: &mut Memory| {
        panic!("unexpected call to {t:#x}")
    });
    assert_eq!(result, Some(42));
    assert_eq!(trace, vec!["B0", "B1", "B2"]);
}

#[test]
fn prolog_fetches_thread_and_frame() {
    init_logging();
    let mut b = GraphBuilder::new("thread", Signature::new(vec![], BasicType::Address));
    let body = b.block();
    b.goto(b.root(), body);
    let t = b.thread_local(body);
    b.ret(body, Some(t));
    let mut graph = b.finish();

    let config = SelectorConfig::default();
    let (sel, _) = select(&mut graph, &config).unwrap();
    let entry: Vec<&Op> = sel.function.block_insts(BlockRef(0)).map(|i| &i.op).collect();
    assert!(matches!(entry[0], Op::FrameAddress));
    assert!(matches!(entry[1], Op::CallC { target, .. } if *target == config.thread.tls_accessor));
    assert!(matches!(entry[2], Op::Alloca { bytes } if *bytes == config.frame_size));
    assert!(sel.thread.is_some() && sel.frame_address.is_some());
    assert_eq!(run(&sel.function, &[]), Some(THREAD));
}

#[test]
fn shared_node_is_lowered_once() {
    init_logging();
    let mut b = GraphBuilder::new("memo", Signature::new(vec![BasicType::Int], BasicType::Int));
    let body = b.block();
    b.goto(b.root(), body);
    let p = b.parm(0);
    let s = b.binary(body, BinaryOp::Add, BasicType::Int, p, p);
    let t = b.binary(body, BinaryOp::Mul, BasicType::Int, s, s);
    let u = b.binary(body, BinaryOp::Sub, BasicType::Int, t, s);
    b.ret(body, Some(u));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let adds = sel
        .function
        .all_insts()
        .filter(|i| matches!(i.op, Op::Binary { op: BinOp::Add, .. }))
        .count();
    assert_eq!(adds, 1);

    let args = physical_args(&sel.param_layout, &[3]);
    assert_eq!(run(&sel.function, &args), Some(30));
}

#[test]
fn packed_parameters_reach_their_nodes() {
    init_logging();
    let params = vec![BasicType::Int; 6];
    let mut b = GraphBuilder::new("six", Signature::new(params, BasicType::Int));
    let body = b.block();
    b.goto(b.root(), body);
    let p0 = b.parm(0);
    let p3 = b.parm(3);
    let diff = b.binary(body, BinaryOp::Sub, BasicType::Int, p3, p0);
    b.ret(body, Some(diff));
    let mut graph = b.finish();

    let config = SelectorConfig::default().with_param_quota(4);
    let (sel, _) = select(&mut graph, &config).unwrap();
    let layout = &sel.param_layout;
    assert!(!layout.is_padded());
    assert_eq!(layout.types().len(), 6);
    assert_eq!(layout.param_to_arg(3), Some(0));
    assert_eq!(layout.param_to_arg(0), Some(1));
    assert_eq!(layout.param_to_arg(2), Some(3));
    assert_eq!(layout.param_to_arg(4), Some(4));

    // Physical order: p3 p0 p1 p2 p4 p5.
    assert_eq!(run(&sel.function, &[40, 10, 20, 30, 50, 60]), Some(30));
}

#[test]
fn call_arguments_are_packed_like_parameters() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Int, BasicType::Int], BasicType::Int);
    let mut b = GraphBuilder::new("caller", sig.clone());
    let body = b.block();
    b.goto(b.root(), body);
    let a = b.parm(0);
    let c = b.parm(1);
    let call = b.call(body, java_call(sig.params.clone(), BasicType::Int), &[a, c]);
    let r = b.proj(body, call);
    b.ret(body, Some(r));
    let mut graph = b.finish();

    let (sel, stats) = select(&mut graph, &SelectorConfig::default()).unwrap();
    assert_eq!(stats.call_sites, 1);
    let site = &sel.call_sites[0];
    assert_eq!(site.stackmap.kind(), StackMapKind::StaticCall);
    assert!(sel.reloc_sites.iter().any(|s| s.anchor == RelocAnchor::StackMap(site.stackmap)));

    let sp = sel.function.statepoints();
    assert_eq!(sp.len(), 1);
    assert_eq!(sp[0].args.len(), 3, "pad word leads a short argument list");
    assert_eq!(sp[0].patch_bytes, site.stackmap.patch_bytes());

    let args = physical_args(&sel.param_layout, &[7, 5]);
    let (result, _) = run_with(&sel.function, Memory::new(), &args, |t: u64, args: &[u64], _: &mut Memory| {
        assert_eq!(t, CALLEE);
        assert_eq!(args, &[0, 7, 5]);
        CallOutcome::Return(args[1] * args[2])
    });
    assert_eq!(result, Some(35));
}

#[test]
fn single_handler_call_becomes_invoke() {
    init_logging();
    let mut b = GraphBuilder::new("covered", Signature::new(vec![], BasicType::Int));
    let body = b.block();
    let normal = b.block();
    let handler = b.block();
    b.goto(b.root(), body);
    let call = b.call(body, java_call(vec![], BasicType::Int), &[]);
    let r = b.proj(body, call);
    b.catch(body, &[(FALL_THROUGH_INDEX, normal), (1, handler)]);
    b.ret(normal, Some(r));
    let failed = b.con_i(handler, -1);
    b.ret(handler, Some(failed));
    let mut graph = b.finish();

    let (sel, stats) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let func = &sel.function;
    assert_eq!(stats.landing_pads, 1);
    assert_eq!(stats.dispatch_blocks, 0);
    assert!(func
        .blocks_with_origin(|o| matches!(o, BlockOrigin::HandlerDispatch(_)))
        .is_empty());
    assert!(matches!(
        func.block(sel.block(body)).terminator,
        Some(Terminator::Invoke { .. })
    ));
    assert!(func
        .block_insts(sel.block(handler))
        .any(|i| matches!(i.op, Op::LandingPad)));
    assert_eq!(sel.handler_table.get(&body), Some(&vec![handler]));
    assert_eq!(sel.call_sites[0].normal, Some(normal));

    let ok = |_: u64, _: &[u64], _: &mut Memory| CallOutcome::Return(7);
    let (result, trace) = run_with(func, Memory::new(), &[], ok);
    assert_eq!(result, Some(7));
    assert!(trace.contains(&"B2_result".to_string()));

    let unwind = |_: u64, _: &[u64], _: &mut Memory| CallOutcome::Unwind;
    let (result, trace) = run_with(func, Memory::new(), &[], unwind);
    assert_eq!(result, Some(int(-1)));
    assert_eq!(trace.last().map(String::as_str), Some("B4"));
}

#[test]
fn multiple_handlers_dispatch_on_pending_index() {
    init_logging();
    let mut b = GraphBuilder::new("dispatch", Signature::new(vec![], BasicType::Int));
    let body = b.block();
    let normal = b.block();
    let handlers: Vec<_> = (0..3).map(|_| b.block()).collect();
    b.goto(b.root(), body);
    let call = b.call(body, java_call(vec![], BasicType::Int), &[]);
    let r = b.proj(body, call);
    b.catch(
        body,
        &[
            (FALL_THROUGH_INDEX, normal),
            (1, handlers[0]),
            (2, handlers[1]),
            (3, handlers[2]),
        ],
    );
    b.ret(normal, Some(r));
    for (j, h) in handlers.iter().enumerate() {
        let c = b.con_i(*h, 100 * (j as i32 + 1));
        b.ret(*h, Some(c));
    }
    let mut graph = b.finish();

    let config = SelectorConfig::default();
    let (sel, stats) = select(&mut graph, &config).unwrap();
    assert_eq!(stats.dispatch_blocks, 2);
    assert_eq!(stats.landing_pads, 0);
    let links = sel
        .function
        .blocks_with_origin(|o| o == BlockOrigin::HandlerDispatch(body));
    assert_eq!(links.len(), 2);
    assert_eq!(sel.function.block(links[0]).name, "B2_handler1");
    assert_eq!(sel.call_sites[0].handlers, handlers);

    let slot = THREAD + config.thread.pending_handler_offset as u64;
    for (index, expected) in [(0u64, 9u64), (1, 100), (2, 200), (3, 300)] {
        let hook = move |_: u64, _: &[u64], mem: &mut Memory| {
            mem.write(slot, 4, index);
            CallOutcome::Return(9)
        };
        let (result, trace) = run_with(&sel.function, Memory::new(), &[], hook);
        assert_eq!(result, Some(expected), "pending index {index}");
        if index == 3 {
            assert!(trace.contains(&"B2_handler2".to_string()));
        }
    }
}

#[test]
fn rethrow_hands_exception_to_stub() {
    init_logging();
    let mut b = GraphBuilder::new("rethrow", Signature::new(vec![BasicType::Object], BasicType::Void));
    let body = b.block();
    b.goto(b.root(), body);
    let exc = b.parm(0);
    b.rethrow(body, exc);
    let mut graph = b.finish();

    let config = SelectorConfig::default();
    let (sel, _) = select(&mut graph, &config).unwrap();
    let exc_value = Value(sel.param_layout.param_to_arg(0).unwrap() as u32);
    let sp = sel.function.statepoints();
    assert_eq!(sp[0].target, config.rethrow_stub);
    assert_eq!(sp[0].args, vec![exc_value]);
    assert_eq!(sp[0].gc_live, vec![exc_value]);
    assert_eq!(sel.call_sites[0].debug, DebugInfo::Rethrow);
    assert!(matches!(
        sel.function.block(sel.block(body)).terminator,
        Some(Terminator::Unreachable)
    ));
}

#[test]
fn diamond_merges_through_phi() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Int, BasicType::Int], BasicType::Int);
    let mut b = GraphBuilder::new("max", sig);
    let entry = b.block();
    let left = b.block();
    let right = b.block();
    let join = b.block();
    b.goto(b.root(), entry);
    let x = b.parm(0);
    let y = b.parm(1);
    let cmp = b.cmp(entry, CmpKind::Int, x, y);
    b.branch(entry, CondCode::Gt, cmp, left, right, true);
    b.goto(left, join);
    b.goto(right, join);
    let phi = b.phi(join, NodeType::of(BasicType::Int), &[x, y]);
    b.ret(join, Some(phi));
    let mut graph = b.finish();

    let (sel, stats) = select(&mut graph, &SelectorConfig::default()).unwrap();
    assert_eq!(stats.phi_nodes_resolved, 1);
    for (a, c, want) in [(3, 9, 9), (9, 3, 9), (-1, 2, 2), (-5, -7, -5)] {
        let args = physical_args(&sel.param_layout, &[int(a), int(c)]);
        assert_eq!(run(&sel.function, &args), Some(int(want)), "max({a}, {c})");
    }
}

#[test]
fn loop_phis_take_back_edge_values() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Int], BasicType::Int);
    let mut b = GraphBuilder::new("sum_to_n", sig);
    let entry = b.block();
    let header = b.block();
    let body = b.block();
    let exit = b.block();
    b.goto(b.root(), entry);
    let n = b.parm(0);
    let zero = b.con_i(entry, 0);
    b.goto(entry, header);
    let i = b.phi(header, NodeType::of(BasicType::Int), &[zero, zero]);
    let acc = b.phi(header, NodeType::of(BasicType::Int), &[zero, zero]);
    let cmp = b.cmp(header, CmpKind::Int, i, n);
    b.branch(header, CondCode::Lt, cmp, body, exit, true);
    let one = b.con_i(body, 1);
    let next_i = b.binary(body, BinaryOp::Add, BasicType::Int, i, one);
    let next_acc = b.binary(body, BinaryOp::Add, BasicType::Int, acc, i);
    b.goto(body, header);
    b.ret(exit, Some(acc));
    let mut graph = b.finish();
    graph.set_input(i, 2, Some(next_i));
    graph.set_input(acc, 2, Some(next_acc));

    let (sel, stats) = select(&mut graph, &SelectorConfig::default()).unwrap();
    assert_eq!(stats.phi_nodes_resolved, 2);
    let args = physical_args(&sel.param_layout, &[5]);
    assert_eq!(run(&sel.function, &args), Some(10));
    let args = physical_args(&sel.param_layout, &[0]);
    assert_eq!(run(&sel.function, &args), Some(0));
}

#[test]
fn derived_pointer_keeps_base_live() {
    init_logging();
    let mut b = GraphBuilder::new("field", Signature::new(vec![BasicType::Object], BasicType::Void));
    let body = b.block();
    b.goto(b.root(), body);
    let obj = b.parm(0);
    let field = b.addp_imm(body, NodeType::derived(16), obj, obj, 16);
    let call = CallNode {
        kind: CallKind::Runtime,
        entry_point: 0x6000,
        method: None,
        signature: Signature::new(vec![], BasicType::Void),
        debug: vec![field, obj],
    };
    b.call(body, call, &[]);
    b.ret(body, None);
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let obj_value = Value(sel.param_layout.param_to_arg(0).unwrap() as u32);
    let site = &sel.call_sites[0];
    assert_eq!(site.stackmap.kind(), StackMapKind::RuntimeCall);
    assert_eq!(site.deopt.len(), 2);
    let field_value = site.deopt[0];
    assert_eq!(site.gc_live, vec![obj_value, field_value]);
    assert_eq!(
        sel.provenance.tag(field_value),
        Some(PtrTag::Derived { base: obj_value })
    );
    assert_eq!(sel.provenance.tag(obj_value), Some(PtrTag::Managed));
    assert_eq!(sel.function.statepoints()[0].gc_live, site.gc_live);
}

#[test]
fn untracked_mode_keeps_objects_live_without_tags() {
    init_logging();
    let mut b = GraphBuilder::new("untracked", Signature::new(vec![BasicType::Object], BasicType::Void));
    let body = b.block();
    b.goto(b.root(), body);
    let obj = b.parm(0);
    let call = CallNode {
        kind: CallKind::DynamicJava,
        entry_point: CALLEE,
        method: None,
        signature: Signature::new(vec![], BasicType::Void),
        debug: vec![obj],
    };
    b.call(body, call, &[]);
    b.ret(body, None);
    let mut graph = b.finish();

    let config = SelectorConfig::default().with_provenance(false);
    let (sel, _) = select(&mut graph, &config).unwrap();
    assert!(sel.provenance.is_empty());
    assert_eq!(sel.call_sites[0].gc_live.len(), 1);
    assert_eq!(sel.call_sites[0].stackmap.kind(), StackMapKind::DynamicCall);
}

#[test]
fn float_operands_of_a_bit_test_are_rejected() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Float, BasicType::Float], BasicType::Int);
    let mut b = GraphBuilder::new("ftest", sig);
    let entry = b.block();
    let t = b.block();
    let f = b.block();
    b.goto(b.root(), entry);
    let x = b.parm(0);
    let y = b.parm(1);
    let cmp = b.cmp(entry, CmpKind::And, x, y);
    b.branch(entry, CondCode::Eq, cmp, t, f, true);
    let one = b.con_i(t, 1);
    b.ret(t, Some(one));
    let zero = b.con_i(f, 0);
    b.ret(f, Some(zero));
    let mut graph = b.finish();

    let err = select(&mut graph, &SelectorConfig::default()).unwrap_err();
    assert_eq!(
        err,
        CompileError::UnsupportedCondition {
            cond: CondCode::Eq,
            cmp: CmpKind::And
        }
    );
}

#[test]
fn half_slot_value_is_rejected() {
    init_logging();
    let sig = Signature::new(vec![], BasicType::Half);
    let mut b = GraphBuilder::new("half", sig);
    let body = b.block();
    b.goto(b.root(), body);
    b.ret(body, None);
    let mut graph = b.finish();

    assert!(matches!(
        select(&mut graph, &SelectorConfig::default()),
        Err(CompileError::UnsupportedType {
            ty: BasicType::Half,
            ..
        })
    ));
}

#[test]
fn block_without_terminator_or_single_successor_fails() {
    init_logging();
    let mut b = GraphBuilder::new("open", Signature::new(vec![], BasicType::Void));
    let body = b.block();
    b.goto(b.root(), body);
    b.con_i(body, 1);
    let mut graph = b.finish();

    assert!(matches!(
        select(&mut graph, &SelectorConfig::default()),
        Err(CompileError::BlockLayout { .. })
    ));
}

#[test]
fn float_constants_become_reloc_sites() {
    init_logging();
    let mut b = GraphBuilder::new("fconst", Signature::new(vec![], BasicType::Double));
    let body = b.block();
    b.goto(b.root(), body);
    let half = b.con_d(body, 0.5);
    let two = b.con_d(body, 2.0);
    let prod = b.binary(body, BinaryOp::Mul, BasicType::Double, half, two);
    b.ret(body, Some(prod));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let constants = sel
        .reloc_sites
        .iter()
        .filter(|s| matches!(s.anchor, RelocAnchor::Constant(_)))
        .count();
    assert_eq!(constants, 2);
    assert_eq!(run(&sel.function, &[]).map(f64::from_bits), Some(1.0));
}
