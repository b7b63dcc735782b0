//! Comparison and two-way branch lowering.

use super::Selector;
use crate::core::error::{CompileError, CompileResult};
use crate::graph::{CmpKind, CondCode, NodeId, NodeKind};
use crate::target::{BinOp, CastOp, FloatPredicate, IntPredicate, Value};

fn int_predicate(cond: CondCode) -> IntPredicate {
    match cond {
        CondCode::Eq => IntPredicate::Eq,
        CondCode::Ne => IntPredicate::Ne,
        CondCode::Lt => IntPredicate::Slt,
        CondCode::Le => IntPredicate::Sle,
        CondCode::Gt => IntPredicate::Sgt,
        CondCode::Ge => IntPredicate::Sge,
        CondCode::Ult => IntPredicate::Ult,
        CondCode::Ule => IntPredicate::Ule,
        CondCode::Ugt => IntPredicate::Ugt,
        CondCode::Uge => IntPredicate::Uge,
    }
}

/// Unordered predicate: a NaN operand makes the condition hold.
fn float_predicate(cond: CondCode) -> Option<FloatPredicate> {
    Some(match cond {
        CondCode::Eq => FloatPredicate::Ueq,
        CondCode::Ne => FloatPredicate::Une,
        CondCode::Lt => FloatPredicate::Ult,
        CondCode::Le => FloatPredicate::Ule,
        CondCode::Gt => FloatPredicate::Ugt,
        CondCode::Ge => FloatPredicate::Uge,
        _ => return None,
    })
}

impl<'g, 'arena> Selector<'g, 'arena> {
    /// Condition code of the branch consuming `cmp`.
    fn branch_condition(&self, cmp: NodeId) -> CompileResult<CondCode> {
        let user = self
            .graph
            .unique_out(cmp)
            .ok_or_else(|| CompileError::MalformedNode {
                node: cmp,
                reason: format!("compare has {} users, expected one branch", self.graph.outs(cmp).len()),
            })?;
        match self.graph.node(user).kind {
            NodeKind::If(cond) => Ok(cond),
            ref other => Err(CompileError::MalformedNode {
                node: cmp,
                reason: format!("compare consumed by {}", other.name()),
            }),
        }
    }

    /// Lower a compare into an `i1` for its branch.
    pub(super) fn select_condition(&mut self, cmp: NodeId, kind: CmpKind) -> CompileResult<Value> {
        let cond = self.branch_condition(cmp)?;
        let lhs = self.input_value(cmp, 1)?;
        let rhs = self.input_value(cmp, 2)?;
        let (lty, rty) = (self.builder.value_type(lhs), self.builder.value_type(rhs));
        let float_operands = lty.is_float() || rty.is_float();

        match kind {
            CmpKind::Float => {
                if !(lty.is_float() && lty == rty) {
                    return Err(CompileError::MalformedNode {
                        node: cmp,
                        reason: format!("float compare of {lty} and {rty}"),
                    });
                }
                let pred = float_predicate(cond)
                    .ok_or(CompileError::UnsupportedCondition { cond, cmp: kind })?;
                self.builder.fcmp(pred, lhs, rhs)
            }
            CmpKind::And => {
                if float_operands || cond.is_unsigned() {
                    return Err(CompileError::UnsupportedCondition { cond, cmp: kind });
                }
                let (lhs, rhs) = self.integral_pair(cmp, lhs, rhs)?;
                let masked = self.builder.binary(BinOp::And, lhs, rhs)?;
                let ty = self.builder.value_type(masked);
                let zero = self.builder.null(ty);
                self.builder.icmp(int_predicate(cond), masked, zero)
            }
            CmpKind::Int => {
                if float_operands {
                    return Err(CompileError::MalformedNode {
                        node: cmp,
                        reason: format!("integer compare of {lty} and {rty}"),
                    });
                }
                let (lhs, rhs) = self.coerce_pair(cmp, lhs, rhs)?;
                self.builder.icmp(int_predicate(cond), lhs, rhs)
            }
        }
    }

    /// Both operands as integers of one width.
    fn integral_pair(&mut self, node: NodeId, a: Value, b: Value) -> CompileResult<(Value, Value)> {
        let word = self.word_type();
        let a = if self.builder.value_type(a).is_ptr() {
            self.builder.cast(CastOp::PtrToInt, a, word)?
        } else {
            a
        };
        let b = if self.builder.value_type(b).is_ptr() {
            self.builder.cast(CastOp::PtrToInt, b, word)?
        } else {
            b
        };
        self.coerce_pair(node, a, b)
    }

    /// Two-way branch. The successor projections are classified by kind,
    /// since upstream passes may emit them in either order.
    pub(super) fn select_if(&mut self, node: NodeId) -> CompileResult<()> {
        let projs: Vec<NodeId> = self
            .graph
            .outs(node)
            .iter()
            .copied()
            .filter(|o| matches!(self.graph.node(*o).kind, NodeKind::IfTrue | NodeKind::IfFalse))
            .collect();
        let [first, second] = projs[..] else {
            return Err(CompileError::MalformedNode {
                node,
                reason: format!("branch with {} successor projections", projs.len()),
            });
        };
        let (if_true, if_false) = if self.graph.node(first).kind == NodeKind::IfTrue {
            (first, second)
        } else {
            (second, first)
        };
        if self.graph.node(if_true).kind != NodeKind::IfTrue
            || self.graph.node(if_false).kind != NodeKind::IfFalse
        {
            return Err(CompileError::MalformedNode {
                node,
                reason: "branch projections of the same polarity".to_string(),
            });
        }

        let cond = self.input_value(node, 1)?;
        let (_, on_true) = self.projection_target(if_true)?;
        let (_, on_false) = self.projection_target(if_false)?;
        self.builder.cond_br(cond, on_true, on_false)
    }
}
