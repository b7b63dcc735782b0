// Branch polarity tests. For every condition code and both projection orders, a two-way branch
// on a compare must transfer control to the true successor exactly when the condition holds.
// Integer compares cover signed and unsigned conditions, bit tests cover the signed ones over
// `lhs & rhs`, and float compares check the unordered treatment of NaN.

mod common;

use common::{init_logging, int, physical_args, run, select};
use machsel::core::{CompileError, SelectorConfig};
use machsel::graph::{BasicType, CmpKind, CondCode, GraphBuilder, Signature};
use machsel::selector::Selection;

fn branch_unit(kind: CmpKind, operand: BasicType, cond: CondCode, true_first: bool) -> Result<Selection, CompileError> {
    let sig = Signature::new(vec![operand, operand], BasicType::Int);
    let mut b = GraphBuilder::new("polarity", sig);
    let entry = b.block();
    let on_true = b.block();
    let on_false = b.block();
    b.goto(b.root(), entry);
    let x = b.parm(0);
    let y = b.parm(1);
    let cmp = b.cmp(entry, kind, x, y);
    b.branch(entry, cond, cmp, on_true, on_false, true_first);
    let one = b.con_i(on_true, 1);
    b.ret(on_true, Some(one));
    let zero = b.con_i(on_false, 0);
    b.ret(on_false, Some(zero));
    let mut graph = b.finish();
    select(&mut graph, &SelectorConfig::default()).map(|(sel, _)| sel)
}

fn holds_signed(cond: CondCode, a: i64, b: i64) -> bool {
    match cond {
        CondCode::Eq => a == b,
        CondCode::Ne => a != b,
        CondCode::Lt => a < b,
        CondCode::Le => a <= b,
        CondCode::Gt => a > b,
        CondCode::Ge => a >= b,
        CondCode::Ult => (a as u32) < (b as u32),
        CondCode::Ule => (a as u32) <= (b as u32),
        CondCode::Ugt => (a as u32) > (b as u32),
        CondCode::Uge => (a as u32) >= (b as u32),
    }
}

const PAIRS: [(i32, i32); 6] = [(1, 2), (2, 1), (2, 2), (-1, 1), (1, -1), (i32::MIN, 0)];

#[test]
fn int_compare_polarity() {
    init_logging();
    for cond in CondCode::ALL {
        for true_first in [true, false] {
            let sel = branch_unit(CmpKind::Int, BasicType::Int, cond, true_first).unwrap();
            for (a, b) in PAIRS {
                let args = physical_args(&sel.param_layout, &[int(a), int(b)]);
                let expected = holds_signed(cond, a as i64, b as i64) as u64;
                assert_eq!(
                    run(&sel.function, &args),
                    Some(expected),
                    "{cond:?} {a} {b} (true first: {true_first})"
                );
            }
        }
    }
}

#[test]
fn bit_test_polarity() {
    init_logging();
    for cond in CondCode::ALL {
        for true_first in [true, false] {
            let unit = branch_unit(CmpKind::And, BasicType::Int, cond, true_first);
            if cond.is_unsigned() {
                assert_eq!(
                    unit.unwrap_err(),
                    CompileError::UnsupportedCondition {
                        cond,
                        cmp: CmpKind::And
                    }
                );
                continue;
            }
            let sel = unit.unwrap();
            for (a, b) in PAIRS {
                let args = physical_args(&sel.param_layout, &[int(a), int(b)]);
                let expected = holds_signed(cond, (a & b) as i64, 0) as u64;
                assert_eq!(run(&sel.function, &args), Some(expected), "{cond:?} {a} & {b}");
            }
        }
    }
}

#[test]
fn float_compare_is_unordered() {
    init_logging();
    let values = [1.5f32, -2.0, 1.5, f32::NAN];
    for cond in CondCode::ALL {
        for true_first in [true, false] {
            let unit = branch_unit(CmpKind::Float, BasicType::Float, cond, true_first);
            if cond.is_unsigned() {
                assert!(matches!(unit, Err(CompileError::UnsupportedCondition { .. })));
                continue;
            }
            let sel = unit.unwrap();
            for a in values {
                for b in values {
                    let args = physical_args(&sel.param_layout, &[a.to_bits() as u64, b.to_bits() as u64]);
                    let ordered = match cond {
                        CondCode::Eq => a == b,
                        CondCode::Ne => a != b,
                        CondCode::Lt => a < b,
                        CondCode::Le => a <= b,
                        CondCode::Gt => a > b,
                        _ => a >= b,
                    };
                    let expected = (a.is_nan() || b.is_nan() || ordered) as u64;
                    assert_eq!(run(&sel.function, &args), Some(expected), "{cond:?} {a} {b}");
                }
            }
        }
    }
}

#[test]
fn pointer_compares_against_integers() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Object], BasicType::Int);
    let mut b = GraphBuilder::new("is_null", sig);
    let entry = b.block();
    let yes = b.block();
    let no = b.block();
    b.goto(b.root(), entry);
    let p = b.parm(0);
    let zero = b.con_l(entry, 0);
    let cmp = b.cmp(entry, CmpKind::Int, p, zero);
    b.branch(entry, CondCode::Eq, cmp, yes, no, false);
    let one = b.con_i(yes, 1);
    b.ret(yes, Some(one));
    let nope = b.con_i(no, 0);
    b.ret(no, Some(nope));
    let mut graph = b.finish();

    let (sel, _) = select(&mut graph, &SelectorConfig::default()).unwrap();
    let args = physical_args(&sel.param_layout, &[0]);
    assert_eq!(run(&sel.function, &args), Some(1));
    let args = physical_args(&sel.param_layout, &[0x1000]);
    assert_eq!(run(&sel.function, &args), Some(0));
}

#[test]
fn compare_without_branch_is_malformed() {
    init_logging();
    let sig = Signature::new(vec![BasicType::Int], BasicType::Int);
    let mut b = GraphBuilder::new("dangling", sig);
    let body = b.block();
    b.goto(b.root(), body);
    let x = b.parm(0);
    let cmp = b.cmp(body, CmpKind::Int, x, x);
    b.ret(body, Some(cmp));
    let mut graph = b.finish();

    assert!(matches!(
        select(&mut graph, &SelectorConfig::default()),
        Err(CompileError::MalformedNode { .. })
    ));
}
