//! Shared helpers for the integration tests.

#![allow(dead_code)]

use bumpalo::Bump;
use machsel::core::{CompilationSession, CompileResult, SelectorConfig, SessionStats};
use machsel::graph::Graph;
use machsel::selector::{ParamLayout, Selection, Selector};
use machsel::target::interp::{CallOutcome, Interpreter, Memory};
use machsel::target::Function;

/// Thread address handed out by the host TLS accessor.
pub const THREAD: u64 = 0x7e00_0000_0000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run the selector over `graph` with a fresh arena and session.
pub fn select(graph: &mut Graph, config: &SelectorConfig) -> CompileResult<(Selection, SessionStats)> {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let selection = Selector::new(graph, config, &session)?.run()?;
    Ok((selection, session.stats()))
}

/// Physical argument list for logical parameter values.
pub fn physical_args(layout: &ParamLayout, logical: &[u64]) -> Vec<u64> {
    let mut args = vec![0; layout.types().len()];
    for (i, v) in logical.iter().enumerate() {
        if let Some(arg) = layout.param_to_arg(i) {
            args[arg] = *v;
        }
    }
    args
}

/// Interpret `func`, answering the prolog's TLS lookup and delegating
/// every other call to `calls`.
pub fn run_with(
    func: &Function,
    memory: Memory,
    args: &[u64],
    mut calls: impl FnMut(u64, &[u64], &mut Memory) -> CallOutcome,
) -> (Option<u64>, Vec<String>) {
    let tls = SelectorConfig::default().thread.tls_accessor;
    let mut hook = |target: u64, args: &[u64], mem: &mut Memory| {
        if target == tls {
            CallOutcome::Return(THREAD)
        } else {
            calls(target, args, mem)
        }
    };
    let mut interp = Interpreter::new(func).with_memory(memory);
    let result = interp.run(args, &mut hook).expect("interpretation failed");
    let trace = interp.trace_names().into_iter().map(str::to_string).collect();
    (result, trace)
}

/// Interpret a function that makes no calls besides the prolog's.
pub fn run(func: &Function, args: &[u64]) -> Option<u64> {
    run_with(func, Memory::new(), args, |target: u64, _: &[u64], _: &mut Memory| {
        panic!("unexpected call to {target:#x}")
    })
    .0
}

/// 32-bit argument encoding of a signed int.
pub fn int(v: i32) -> u64 {
    v as u32 as u64
}
