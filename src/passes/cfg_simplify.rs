//! CFG simplification.
//!
//! Runs a block worklist to a fixed point:
//! 1. Branches with a constant condition become gotos; the unchosen target
//!    loses the edge.
//! 2. An empty block with one predecessor and one successor is bypassed.
//! 3. A diamond whose join holds only phis collapses into selects on the
//!    branch condition, when the speculated block is small and side-effect
//!    free (geps are free).
//! 4. A block whose single predecessor has no other successor is spliced
//!    into that predecessor.
//! 5. Branches with identical targets become gotos.
//! 6. Unreachable blocks are removed.

use hashbrown::HashSet;

use crate::ir::context::{ConstData, Context};
use crate::ir::ir::{BlockId, FuncId, Function, InstData, Module, Value};
use crate::ir::validate::assert_invariants;
use crate::passes::common::has_side_effects;
use crate::passes::{Pass, PassCategory, PassRegistry};

/// Instructions (besides phis and geps) we are willing to execute
/// speculatively when collapsing a diamond.
const MAX_SPECULATED_INSTRUCTIONS: usize = 2;

pub(crate) fn register(registry: &mut PassRegistry) {
    registry.add(Pass {
        name: "simplifycfg",
        category: PassCategory::Simplification,
        run: simplify_cfg,
    });
}

pub fn simplify_cfg(ctx: &mut Context, module: &mut Module, id: FuncId) -> bool {
    module.with_function(id, |module, func| {
        let mut modified = false;
        loop {
            modified |= Worklist::new(func).run(ctx, module, func);
            if remove_unreachable_blocks(func) {
                modified = true;
                continue;
            }
            break;
        }
        if modified {
            func.invalidate_cfg_info();
        }
        assert_invariants(ctx, module, func);
        modified
    })
}

struct Worklist {
    blocks: Vec<BlockId>,
}

impl Worklist {
    fn new(func: &Function) -> Worklist {
        Worklist {
            blocks: func.block_ids(),
        }
    }

    fn push(&mut self, block: BlockId) {
        if !self.blocks.contains(&block) {
            self.blocks.push(block);
        }
    }

    fn run(&mut self, ctx: &mut Context, module: &Module, func: &mut Function) -> bool {
        let mut modified = false;
        while let Some(block) = self.blocks.pop() {
            if func.block(block).dead {
                continue;
            }
            rewrite_constant_branch(self, ctx, func, block);
            if self.fold_if_empty(module, func, block) {
                modified = true;
                continue;
            }
            if self.fold_into_single_pred(func, block) {
                modified = true;
                continue;
            }
            if self.replace_same_target_branch(ctx, func, block) {
                modified = true;
                continue;
            }
        }
        modified
    }

    /// Simple case of the empty-block fold:
    /// ```text
    /// pred -> BB -> succ
    /// ```
    /// and the diamond case where `succ` merges `pred` and `BB` with phis.
    fn fold_if_empty(&mut self, module: &Module, func: &mut Function, block: BlockId) -> bool {
        let Some(pred) = func.single_predecessor(block) else {
            return false;
        };
        let Some(succ) = func.single_successor(block) else {
            return false;
        };
        if block == pred || block == succ {
            return false;
        }
        let succ_has_phis = !func.phis_of(succ).is_empty();
        if !func.predecessors(succ).contains(&pred) || !succ_has_phis {
            if !func.empty_except_terminator(block) {
                return false;
            }
            func.update_predecessor(succ, block, pred);
            func.update_target(pred, block, succ);
            func.erase_block(block);
            self.push(pred);
            self.push(succ);
            for s in func.successors(pred) {
                self.push(s);
            }
            for &p in func.predecessors(succ).to_vec().iter() {
                self.push(p);
            }
            return true;
        }
        // Diamond:
        // ```text
        //   pred
        //  /   |
        // BB   |
        //  \   |
        //   succ
        // ```
        // Selects only have two operands.
        if func.predecessors(succ).len() != 2 || func.successors(pred).len() != 2 {
            return false;
        }
        if !can_execute_speculatively(func, module, block) {
            return false;
        }
        let branch = func.terminator(pred).expect("blocks have terminators");
        let InstData::Branch {
            cond,
            then_target,
            else_target,
        } = *func.inst_data(branch)
        else {
            return false;
        };
        // The edge going straight to `succ` contributes `pred`'s phi
        // operand; the other one goes through `block`.
        let then_key = if then_target == succ { pred } else { block };
        let else_key = if else_target == succ { pred } else { block };
        let phis = func.phis_of(succ);
        let mut insert_at = phis.len();
        for phi in phis {
            let then_value = func.phi_arg_for(phi, then_key).expect("phi has the edge");
            let else_value = func.phi_arg_for(phi, else_key).expect("phi has the edge");
            let ty = func.local_type(phi);
            let name = func.value(phi).name.clone().unwrap_or_default();
            let select = func.insert_inst(
                succ,
                insert_at,
                InstData::Select {
                    cond,
                    then_value,
                    else_value,
                },
                ty,
                &name,
            );
            insert_at += 1;
            func.replace_all_uses(phi, Value::Local(select));
        }
        for phi in func.phis_of(succ) {
            func.erase_inst(phi);
        }
        erase_single_value_phis(func, block);
        // Splice `block` into `succ`, then `pred` in front of it.
        let term = func.terminator(block).expect("blocks have terminators");
        func.erase_inst(term);
        let block_insts = func.block(block).insts.clone();
        for (index, inst) in block_insts.iter().enumerate() {
            func.extract_inst(*inst);
            func.place_inst(succ, index, *inst);
        }
        func.erase_inst(branch);
        let pred_insts = func.block(pred).insts.clone();
        for (index, inst) in pred_insts.iter().enumerate() {
            func.extract_inst(*inst);
            func.place_inst(succ, index, *inst);
        }
        let grand_preds = func.predecessors(pred).to_vec();
        for &p in &grand_preds {
            func.update_target(p, pred, succ);
        }
        func.block_mut(succ).preds = grand_preds.clone();
        func.erase_block(block);
        func.erase_block(pred);
        self.push(succ);
        for p in grand_preds {
            self.push(p);
        }
        true
    }

    /// Splices `block` into its single predecessor when that predecessor has
    /// no other successor.
    fn fold_into_single_pred(&mut self, func: &mut Function, block: BlockId) -> bool {
        let Some(pred) = func.single_predecessor(block) else {
            return false;
        };
        if pred == block || func.successors(pred).len() > 1 {
            return false;
        }
        erase_single_value_phis(func, block);
        let goto = func.terminator(pred).expect("blocks have terminators");
        func.erase_inst(goto);
        for inst in func.block(block).insts.clone() {
            func.extract_inst(inst);
            let end = func.block(pred).insts.len();
            func.place_inst(pred, end, inst);
        }
        for succ in func.successors(pred) {
            func.update_predecessor(succ, block, pred);
            self.push(succ);
        }
        func.erase_block(block);
        self.push(pred);
        true
    }

    fn replace_same_target_branch(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        block: BlockId,
    ) -> bool {
        let Some(term) = func.terminator(block) else {
            return false;
        };
        let InstData::Branch {
            then_target,
            else_target,
            ..
        } = *func.inst_data(term)
        else {
            return false;
        };
        if then_target != else_target {
            return false;
        }
        func.remove_predecessor(then_target, block);
        func.erase_inst(term);
        func.set_terminator(
            block,
            InstData::Goto {
                target: then_target,
            },
            ctx,
        );
        self.push(block);
        self.push(then_target);
        true
    }
}

fn constant_condition(ctx: &Context, cond: Value) -> Option<bool> {
    let c = cond.as_const()?;
    match ctx.const_data(c) {
        ConstData::Int { value, bits: 1 } => Some(*value != 0),
        // Branching on undef picks the then-branch.
        ConstData::Undef { .. } => Some(true),
        _ => None,
    }
}

fn rewrite_constant_branch(
    worklist: &mut Worklist,
    ctx: &mut Context,
    func: &mut Function,
    block: BlockId,
) {
    let Some(term) = func.terminator(block) else {
        return;
    };
    let InstData::Branch {
        cond,
        then_target,
        else_target,
    } = *func.inst_data(term)
    else {
        return;
    };
    let Some(condition) = constant_condition(ctx, cond) else {
        return;
    };
    let (target, stale) = if condition {
        (then_target, else_target)
    } else {
        (else_target, then_target)
    };
    func.remove_predecessor(stale, block);
    func.erase_inst(term);
    func.set_terminator(block, InstData::Goto { target }, ctx);
    worklist.push(target);
    worklist.push(stale);
}

/// Replaces the single-argument phis of a single-predecessor block by their
/// argument.
fn erase_single_value_phis(func: &mut Function, block: BlockId) {
    for phi in func.phis_of(block) {
        let args = func.phi_args(phi);
        debug_assert_eq!(args.len(), 1, "one operand per predecessor");
        let value = args[0].1;
        func.replace_all_uses(phi, value);
        func.erase_inst(phi);
    }
}

fn can_execute_speculatively(func: &Function, module: &Module, block: BlockId) -> bool {
    let mut count = 0;
    for &inst in &func.block(block).insts {
        let data = func.inst_data(inst);
        if data.is_phi() || matches!(data, InstData::Gep { .. }) {
            continue;
        }
        if data.is_terminator() {
            break;
        }
        if has_side_effects(func, module, inst) {
            return false;
        }
        count += 1;
        if count > MAX_SPECULATED_INSTRUCTIONS {
            return false;
        }
    }
    true
}

fn remove_unreachable_blocks(func: &mut Function) -> bool {
    let mut live = HashSet::new();
    let mut stack = vec![func.entry()];
    while let Some(block) = stack.pop() {
        if !live.insert(block) {
            continue;
        }
        for succ in func.successors(block) {
            stack.push(succ);
        }
    }
    let dead: Vec<BlockId> = func
        .block_ids()
        .into_iter()
        .filter(|b| !live.contains(b))
        .collect();
    if dead.is_empty() {
        return false;
    }
    for &block in &dead {
        for succ in func.successors(block) {
            if live.contains(&succ) {
                func.remove_predecessor(succ, block);
            }
        }
    }
    for block in dead {
        func.erase_block(block);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::ArithOp;

    #[test]
    fn test_constant_branch_folds_and_dead_block_is_removed() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        let entry = b.add_new_block("entry");
        let then_b = b.func.add_block("then");
        let else_b = b.func.add_block("else");
        b.select_block(entry);
        let yes = Value::Const(b.ctx.bool_constant(true));
        b.branch(yes, then_b, else_b);
        b.select_block(then_b);
        b.ret(b.param(0));
        b.select_block(else_b);
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        b.ret(zero);
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        assert!(simplify_cfg(&mut ctx, &mut module, id));
        let f = module.function(id);
        // The else arm disappears; then is merged into the entry.
        assert_eq!(f.block_ids().len(), 1);
        let term = f.terminator(f.entry()).unwrap();
        assert!(matches!(f.inst_data(term), InstData::Return { .. }));
    }

    #[test]
    fn test_diamond_collapses_to_select() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let mut b = FunctionBuilder::new(&mut ctx, "inc_if", &[i1, i64t], i64t);
        let entry = b.add_new_block("entry");
        let then_b = b.func.add_block("then");
        let join = b.func.add_block("join");
        b.select_block(entry);
        b.branch(b.param(0), then_b, join);
        b.select_block(then_b);
        let p1 = b.param(1);
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let inc = b.arith(ArithOp::Add, p1, one, "inc");
        b.goto(join);
        b.select_block(join);
        let phi = b.phi(&[(entry, p1), (then_b, inc)], "result");
        b.ret(phi);
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        assert!(simplify_cfg(&mut ctx, &mut module, id));
        let f = module.function(id);
        assert_eq!(f.block_ids().len(), 1, "diamond collapses into one block");
        let insts = f.instructions();
        assert!(insts
            .iter()
            .any(|&i| matches!(f.inst_data(i), InstData::Select { .. })));
        assert!(insts.iter().all(|&i| !f.inst_data(i).is_phi()));
    }

    #[test]
    fn test_fixed_point_is_stable() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i1, i64t], i64t);
        let entry = b.add_new_block("entry");
        let mid = b.func.add_block("mid");
        let exit = b.func.add_block("exit");
        b.select_block(entry);
        b.branch(b.param(0), mid, exit);
        b.select_block(mid);
        b.goto(exit);
        b.select_block(exit);
        b.ret(b.param(1));
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        simplify_cfg(&mut ctx, &mut module, id);
        // Running again must be a no-op.
        assert!(!simplify_cfg(&mut ctx, &mut module, id));
    }

    #[test]
    fn test_side_effecting_block_is_not_speculated() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let ptr = ctx.ptr_type();
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i1, ptr, i64t], i64t);
        let entry = b.add_new_block("entry");
        let then_b = b.func.add_block("then");
        let join = b.func.add_block("join");
        b.select_block(entry);
        b.branch(b.param(0), then_b, join);
        b.select_block(then_b);
        b.store(b.param(1), b.param(2));
        let one = Value::Const(b.ctx.int_constant(1, 64));
        b.goto(join);
        b.select_block(join);
        let phi = b.phi(&[(entry, b.param(2)), (then_b, one)], "v");
        b.ret(phi);
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        simplify_cfg(&mut ctx, &mut module, id);
        let f = module.function(id);
        // The store must not be hoisted onto the path that skips `then`.
        assert_eq!(f.block_ids().len(), 3);
    }
}
