//! Aggressive dead code elimination.
//!
//! Mark-and-sweep over the post-dominator structure: the initial live set is
//! the returns and the side-effecting instructions; liveness propagates to
//! operands, to the terminators of the reverse dominance frontier of each
//! live instruction's block, and for phis to every predecessor's terminator.
//! Unmarked branches become unconditional gotos to the nearest useful
//! post-dominator; everything else unmarked is erased. A function with no
//! reachable exit and no side effects has undefined behaviour and gets its
//! body replaced by a single `return undef`.

use hashbrown::HashSet;
use log::debug;

use crate::ir::context::Context;
use crate::ir::ir::{BlockId, FuncId, Function, InstData, Module, Value, ValueId};
use crate::ir::validate::assert_invariants;
use crate::passes::common::has_side_effects;
use crate::passes::{Pass, PassCategory, PassRegistry};

pub(crate) fn register(registry: &mut PassRegistry) {
    registry.add(Pass {
        name: "dce",
        category: PassCategory::Simplification,
        run: dce,
    });
}

pub fn dce(ctx: &mut Context, module: &mut Module, id: FuncId) -> bool {
    module.with_function(id, |module, func| {
        let result = run(ctx, module, func);
        assert_invariants(ctx, module, func);
        result
    })
}

fn run(ctx: &mut Context, module: &Module, func: &mut Function) -> bool {
    let postdom = func.get_or_compute_post_dom_info();
    let instructions = func.instructions();
    let mut marked: HashSet<ValueId> = HashSet::new();
    let mut useful_blocks: HashSet<BlockId> = HashSet::new();
    let mut worklist: Vec<ValueId> = Vec::new();
    let mut mark = |inst: ValueId,
                    func: &Function,
                    marked: &mut HashSet<ValueId>,
                    worklist: &mut Vec<ValueId>,
                    useful_blocks: &mut HashSet<BlockId>| {
        if marked.insert(inst) {
            worklist.push(inst);
            if let Some(block) = func.parent_block(inst) {
                useful_blocks.insert(block);
            }
        }
    };
    // Critical instructions: returns and side effects.
    for &inst in &instructions {
        let critical = matches!(func.inst_data(inst), InstData::Return { .. })
            || has_side_effects(func, module, inst);
        if critical {
            mark(inst, func, &mut marked, &mut worklist, &mut useful_blocks);
        }
    }
    if postdom.is_empty() {
        if !marked.is_empty() {
            // Can't run the algorithm without post-dominance, and can't
            // delete the body because of the critical instructions.
            return false;
        }
        // A non-terminating function without critical instructions is
        // undefined behaviour; the body is deleted.
        for block in func.block_ids() {
            func.erase_block(block);
        }
        let entry = func.add_block("entry");
        let undef = ctx.undef(func.return_type);
        func.set_terminator(
            entry,
            InstData::Return {
                value: Value::Const(undef),
            },
            ctx,
        );
        func.invalidate_cfg_info();
        debug!("dce deleted the exitless body of @{}", func.name);
        return true;
    }
    // Mark phase.
    while let Some(inst) = worklist.pop() {
        for operand in func.inst_data(inst).operands() {
            if let Value::Local(op) = operand {
                if func.value(op).is_inst() && !marked.contains(&op) {
                    mark(op, func, &mut marked, &mut worklist, &mut useful_blocks);
                }
            }
        }
        let block = func.parent_block(inst).expect("placed");
        for &frontier in postdom.dom_front(block) {
            let term = func.terminator(frontier).expect("blocks have terminators");
            mark(term, func, &mut marked, &mut worklist, &mut useful_blocks);
        }
        if let InstData::Phi { args } = func.inst_data(inst) {
            let preds: Vec<BlockId> = args.iter().map(|&(p, _)| p).collect();
            for pred in preds {
                let term = func.terminator(pred).expect("blocks have terminators");
                mark(term, func, &mut marked, &mut worklist, &mut useful_blocks);
            }
        }
    }
    // Sweep phase: dead branches first, then dead instructions.
    let mut modified = false;
    let mut modified_cfg = false;
    for &inst in &instructions {
        if marked.contains(&inst) {
            continue;
        }
        if !matches!(func.inst_data(inst), InstData::Branch { .. }) {
            continue;
        }
        let block = func.parent_block(inst).expect("placed");
        if !postdom.contains(block) {
            continue;
        }
        let target = nearest_useful_postdom(&postdom, &useful_blocks, block);
        let Some(target) = target else { continue };
        for old_target in func.inst_data(inst).targets() {
            func.remove_predecessor(old_target, block);
        }
        func.erase_inst(inst);
        func.set_terminator(block, InstData::Goto { target }, ctx);
        func.add_predecessor(target, block);
        // The rewritten edge carries no meaningful value for the target's
        // phis; fill the new slot with undef.
        for phi in func.phis_of(target) {
            if func.phi_arg_for(phi, block).is_none() {
                let undef = ctx.undef(func.local_type(phi));
                func.phi_add_arg(phi, block, undef_value(undef));
            }
        }
        modified = true;
        modified_cfg = true;
    }
    // Erase unmarked instructions, unused first; cycles of dead phis are
    // broken by rewriting their operands to undef.
    let mut dead: Vec<ValueId> = instructions
        .iter()
        .copied()
        .filter(|&inst| {
            !marked.contains(&inst)
                && !func.value(inst).dead
                && !matches!(
                    func.inst_data(inst),
                    InstData::Goto { .. } | InstData::Branch { .. } | InstData::Return { .. }
                )
        })
        .collect();
    loop {
        let mut progress = false;
        dead.retain(|&inst| {
            if func.is_unused(inst) {
                func.erase_inst(inst);
                modified = true;
                progress = true;
                false
            } else {
                true
            }
        });
        if !progress {
            break;
        }
    }
    for &inst in &dead {
        let undef = ctx.undef(func.local_type(inst));
        func.replace_all_uses(inst, undef_value(undef));
    }
    for inst in dead {
        func.erase_inst(inst);
        modified = true;
    }
    if modified_cfg {
        func.invalidate_cfg_info();
    }
    modified
}

fn undef_value(undef: crate::ir::context::ConstId) -> Value {
    Value::Const(undef)
}

/// Walks the post-dominator tree upwards from `origin` to the closest block
/// that holds a marked instruction.
fn nearest_useful_postdom(
    postdom: &crate::analysis::domtree::DominanceInfo,
    useful_blocks: &HashSet<BlockId>,
    origin: BlockId,
) -> Option<BlockId> {
    let mut node = postdom.idom(origin);
    while let Some(block) = node {
        if useful_blocks.contains(&block) {
            return Some(block);
        }
        node = postdom.idom(block);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::ArithOp;

    #[test]
    fn test_erases_unused_arithmetic() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        b.add_new_block("entry");
        let p = b.param(0);
        let _dead = b.arith(ArithOp::Mul, p, p, "dead");
        let live = b.arith(ArithOp::Add, p, p, "live");
        b.ret(live);
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        assert!(dce(&mut ctx, &mut module, id));
        let f = module.function(id);
        assert_eq!(f.block(f.entry()).insts.len(), 2, "add and return remain");
    }

    #[test]
    fn test_rewrites_useless_branch_to_goto() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i1, i64t], i64t);
        let entry = b.add_new_block("entry");
        let then_b = b.func.add_block("then");
        let else_b = b.func.add_block("else");
        let join = b.func.add_block("join");
        b.select_block(entry);
        b.branch(b.param(0), then_b, else_b);
        b.select_block(then_b);
        b.goto(join);
        b.select_block(else_b);
        b.goto(join);
        b.select_block(join);
        b.ret(b.param(1));
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        assert!(dce(&mut ctx, &mut module, id));
        let f = module.function(id);
        // Nothing in the branch arms matters, so the branch at the entry is
        // dead and must have been rewritten to a goto.
        let term = f.terminator(entry).unwrap();
        assert!(matches!(f.inst_data(term), InstData::Goto { .. }));
    }

    #[test]
    fn test_keeps_side_effecting_call_chain() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let ptr = ctx.ptr_type();
        let void = ctx.void_type();
        let mut module = Module::new();
        // External function with unknown effects.
        let ext = module.declare_ext_function(crate::ir::ir::ExtFunction {
            name: "opaque".to_string(),
            slot: 0,
            index: 0,
            params: vec![ptr],
            return_type: void,
        });
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        b.add_new_block("entry");
        let slot = b.alloca(i64t, "x");
        b.call(crate::ir::ir::Callee::Ext(ext), &[slot], void, "");
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        b.ret(zero);
        let f = b.finish();
        let id = module.add_function(f);
        dce(&mut ctx, &mut module, id);
        let f = module.function(id);
        // The call has side effects, so it and its alloca operand survive.
        let insts = f.instructions();
        assert!(insts
            .iter()
            .any(|&i| matches!(f.inst_data(i), InstData::Call { .. })));
        assert!(insts.iter().any(|&i| f.inst_data(i).is_alloca()));
    }

    #[test]
    fn test_exitless_body_is_deleted() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "spin", &[], i64t);
        let entry = b.add_new_block("entry");
        b.goto(entry);
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        assert!(dce(&mut ctx, &mut module, id));
        let f = module.function(id);
        let blocks = f.block_ids();
        assert_eq!(blocks.len(), 1);
        let term = f.terminator(blocks[0]).unwrap();
        let InstData::Return { value } = *f.inst_data(term) else {
            panic!("expected return");
        };
        assert!(ctx.is_undef(value.as_const().unwrap()));
    }

    /// The regression guard of the write-through-reference scenario: a call
    /// whose return value is ignored but which writes through its pointer
    /// argument must survive.
    #[test]
    fn test_ignored_return_value_call_survives() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let ptr = ctx.ptr_type();
        let void = ctx.void_type();
        let mut module = Module::new();
        // Callee writes 10 through its reference parameter.
        let mut cb = FunctionBuilder::new(&mut ctx, "modify", &[ptr], void);
        cb.add_new_block("entry");
        let ten = Value::Const(cb.ctx.int_constant(10, 64));
        cb.store(cb.param(0), ten);
        cb.ret_void();
        let callee = module.add_function(cb.finish());
        let mut b = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
        b.add_new_block("entry");
        let slot = b.alloca(i64t, "i");
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        b.store(slot, zero);
        b.call(crate::ir::ir::Callee::Function(callee), &[slot], void, "");
        let v = b.load(slot, i64t, "v");
        b.ret(v);
        let id = module.add_function(b.finish());
        dce(&mut ctx, &mut module, id);
        let f = module.function(id);
        assert!(
            f.instructions()
                .iter()
                .any(|&i| matches!(f.inst_data(i), InstData::Call { .. })),
            "call with ignored return value but memory effects must survive"
        );
    }
}
