//! Scalar evolution.
//!
//! Recognizes induction variables of canonical loops (a header with exactly
//! one preheader and one latch predecessor) as chains of recurrences: a
//! header phi whose latch operand is `phi + step` or `phi * step` with a
//! loop-invariant step becomes `{base, +, step}` or `{base, *, step}`.
//! Unresolved phis are retried until a fixed point so recurrences whose step
//! is itself a recognized recurrence resolve too.

use crate::analysis::loops::LoopInfo;
use crate::ir::context::Context;
use crate::ir::ir::{ArithOp, Function, InstData, Value, ValueId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScevExpr {
    /// A compile-time constant step or base.
    Const { value: u64, bits: u32 },
    /// A loop-invariant but unknown value.
    Unknown(Value),
    /// `{lhs, +, rhs}`
    Add(Box<ScevExpr>, Box<ScevExpr>),
    /// `{lhs, *, rhs}`
    Mul(Box<ScevExpr>, Box<ScevExpr>),
}

struct PhiInfo {
    phi: ValueId,
    preheader_operand: Value,
    latch_operand: Value,
}

/// Analyzes the loop described by `info`, filling in its scev expressions
/// and induction variable list.
pub fn analyze(ctx: &Context, func: &Function, info: &mut LoopInfo) {
    let preds = func.predecessors(info.header);
    if preds.len() != 2 {
        return;
    }
    let (preheader, latch) = if info.is_latch(preds[0]) {
        (preds[1], preds[0])
    } else if info.is_latch(preds[1]) {
        (preds[0], preds[1])
    } else {
        return;
    };
    if info.is_inner(preheader) {
        return;
    }
    let mut worklist: Vec<PhiInfo> = Vec::new();
    for phi in func.phis_of(info.header) {
        if !ctx.types.is_int(func.local_type(phi)) {
            continue;
        }
        let (Some(ph), Some(lt)) = (
            func.phi_arg_for(phi, preheader),
            func.phi_arg_for(phi, latch),
        ) else {
            continue;
        };
        worklist.push(PhiInfo {
            phi,
            preheader_operand: ph,
            latch_operand: lt,
        });
    }
    loop {
        let mut resolved_any = false;
        let mut index = 0;
        while index < worklist.len() {
            let item = &worklist[index];
            match find_scev_expr(ctx, func, info, item) {
                Some(expr) => {
                    let phi = item.phi;
                    info.scev_exprs.insert(phi, expr);
                    info.induction_vars.push(phi);
                    worklist.swap_remove(index);
                    resolved_any = true;
                }
                None => index += 1,
            }
        }
        if !resolved_any {
            break;
        }
    }
}

/// A nullary expression for `value`: a constant, or an unknown if the value
/// is defined outside the loop. Values computed inside the loop have no
/// nullary form.
fn nullary(ctx: &Context, func: &Function, info: &LoopInfo, value: Value) -> Option<ScevExpr> {
    if let Value::Const(c) = value {
        if let crate::ir::context::ConstData::Int { value, bits } = *ctx.const_data(c) {
            return Some(ScevExpr::Const { value, bits });
        }
        return None;
    }
    if let Value::Local(id) = value {
        if let Some(block) = func.parent_block(id) {
            if info.is_inner(block) {
                return None;
            }
        }
    }
    Some(ScevExpr::Unknown(value))
}

/// Nullary, or the already recognized recurrence of an inner instruction.
fn other(ctx: &Context, func: &Function, info: &LoopInfo, value: Value) -> Option<ScevExpr> {
    if let Some(expr) = nullary(ctx, func, info, value) {
        return Some(expr);
    }
    let id = value.as_local()?;
    info.scev_exprs.get(&id).cloned()
}

fn find_scev_expr(
    ctx: &Context,
    func: &Function,
    info: &LoopInfo,
    item: &PhiInfo,
) -> Option<ScevExpr> {
    let latch_inst = item.latch_operand.as_local()?;
    if !func.value(latch_inst).is_inst() {
        return None;
    }
    let InstData::Arith { op, lhs, rhs } = *func.inst_data(latch_inst) else {
        return None;
    };
    if lhs != Value::Local(item.phi) {
        return None;
    }
    let base = nullary(ctx, func, info, item.preheader_operand)?;
    let step = other(ctx, func, info, rhs)?;
    match op {
        ArithOp::Add => Some(ScevExpr::Add(Box::new(base), Box::new(step))),
        ArithOp::Mul => Some(ScevExpr::Mul(Box::new(base), Box::new(step))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::{BlockId, CompareMode, CompareOp};

    fn counting_loop() -> (Context, Function, BlockId) {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "count", &[], i64t);
        let entry = b.add_new_block("entry");
        let header = b.func.add_block("header");
        let body = b.func.add_block("body");
        let exit = b.func.add_block("exit");
        b.select_block(entry);
        b.goto(header);
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        b.select_block(header);
        let i = b.phi(&[(entry, zero)], "i");
        let ten = Value::Const(b.ctx.int_constant(10, 64));
        let cond = b.cmp(CompareMode::Signed, CompareOp::Less, i, ten, "cond");
        b.branch(cond, body, exit);
        b.select_block(body);
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let next = b.arith(crate::ir::ir::ArithOp::Add, i, one, "next");
        b.goto(header);
        b.func.phi_add_arg(i.as_local().unwrap(), body, next);
        b.select_block(exit);
        b.ret(i);
        let f = b.finish();
        (ctx, f, header)
    }

    #[test]
    fn test_recognizes_add_recurrence() {
        let (ctx, func, header) = counting_loop();
        let dom = func.get_or_compute_dom_info();
        let mut info = LoopInfo::compute(&func, &dom, header);
        analyze(&ctx, &func, &mut info);
        assert_eq!(info.induction_vars.len(), 1);
        let phi = info.induction_vars[0];
        let expr = &info.scev_exprs[&phi];
        assert_eq!(
            expr,
            &ScevExpr::Add(
                Box::new(ScevExpr::Const { value: 0, bits: 64 }),
                Box::new(ScevExpr::Const { value: 1, bits: 64 })
            )
        );
    }
}
