//! Promotion of memory to registers.
//!
//! For every promotable alloca (used only by loads from it and stores to
//! it), phi nodes are placed at the dominance frontier of the defining
//! blocks, restricted to blocks where the value is actually live-in, and a
//! CFG walk renames loads to the reaching definition. The pass repeats up to
//! a fixed number of rounds: promoting one alloca can strip a level of
//! indirection off a stack slot that holds the address of another.

use hashbrown::{HashMap, HashSet};
use log::debug;
use smallvec::SmallVec;

use crate::ir::context::Context;
use crate::ir::ir::{BlockId, FuncId, Function, InstData, Module, Value, ValueId};
use crate::ir::types::TypeId;
use crate::ir::validate::assert_invariants;
use crate::passes::{Pass, PassCategory, PassRegistry};

/// Rounds of repeated promotion; each round peels one level of
/// stack-pointer-in-stack-memory indirection.
const HARD_LIMIT: usize = 10;

pub(crate) fn register(registry: &mut PassRegistry) {
    registry.add(Pass {
        name: "memtoreg",
        category: PassCategory::Simplification,
        run: mem2reg,
    });
}

pub fn mem2reg(ctx: &mut Context, module: &mut Module, id: FuncId) -> bool {
    module.with_function(id, |module, func| {
        let mut result = false;
        for _ in 0..HARD_LIMIT {
            let allocas = promotable_allocas(func);
            if allocas.is_empty() || !promote(ctx, func, &allocas) {
                break;
            }
            assert_invariants(ctx, module, func);
            result = true;
        }
        result
    })
}

/// Promotes exactly the given allocas. Used by SROA to promote the slice
/// allocas it materializes. Returns whether anything changed.
pub fn promote(ctx: &mut Context, func: &mut Function, allocas: &[ValueId]) -> bool {
    let mut pass = PromotionCtx {
        variables: HashMap::new(),
        phi_to_alloca: HashMap::new(),
        renamed: HashSet::new(),
    };
    for &alloca in allocas {
        if !is_promotable(func, alloca) {
            continue;
        }
        let info = gather_info(func, alloca);
        pass.variables.insert(alloca, info);
    }
    if pass.variables.is_empty() {
        return false;
    }
    let mut targets: Vec<ValueId> = pass.variables.keys().copied().collect();
    targets.sort();
    for alloca in &targets {
        pass.insert_phis(ctx, func, *alloca);
    }
    let entry = func.entry();
    pass.rename(ctx, func, entry);
    let changed = pass.clean(func);
    if changed {
        func.invalidate_cfg_info();
    }
    changed
}

/// All promotable allocas in the entry block prefix.
fn promotable_allocas(func: &Function) -> Vec<ValueId> {
    func.block(func.entry())
        .insts
        .iter()
        .copied()
        .take_while(|&inst| func.inst_data(inst).is_alloca())
        .filter(|&inst| is_promotable(func, inst))
        .collect()
}

/// An alloca is promotable when it never escapes: every user is a load from
/// it or a store to it (never a store *of* it).
fn is_promotable(func: &Function, alloca: ValueId) -> bool {
    func.users(alloca).iter().all(|&user| match func.inst_data(user) {
        InstData::Load { .. } => true,
        InstData::Store { addr, value } => {
            *addr == Value::Local(alloca) && *value != Value::Local(alloca)
        }
        _ => false,
    })
}

struct VariableInfo {
    ty: TypeId,
    name: String,
    loads: Vec<ValueId>,
    stores: Vec<ValueId>,
    using_blocks: HashSet<BlockId>,
    defining_blocks: HashSet<BlockId>,
    phi_nodes: HashMap<BlockId, ValueId>,
    stack: Vec<Value>,
}

fn gather_info(func: &Function, alloca: ValueId) -> VariableInfo {
    let InstData::Alloca { allocated, .. } = *func.inst_data(alloca) else {
        panic!("not an alloca");
    };
    let mut info = VariableInfo {
        ty: allocated,
        name: func.value(alloca).name.clone().unwrap_or_default(),
        loads: Vec::new(),
        stores: Vec::new(),
        using_blocks: HashSet::new(),
        defining_blocks: HashSet::new(),
        phi_nodes: HashMap::new(),
        stack: Vec::new(),
    };
    for user in func.users(alloca) {
        let block = func.parent_block(user).expect("users are placed");
        match func.inst_data(user) {
            InstData::Load { .. } => {
                info.loads.push(user);
                info.using_blocks.insert(block);
            }
            InstData::Store { .. } => {
                info.stores.push(user);
                info.defining_blocks.insert(block);
            }
            _ => unreachable!("checked by is_promotable"),
        }
    }
    info
}

struct PromotionCtx {
    variables: HashMap<ValueId, VariableInfo>,
    phi_to_alloca: HashMap<ValueId, ValueId>,
    renamed: HashSet<BlockId>,
}

impl PromotionCtx {
    /// The blocks where the promoted value is live on entry: the using
    /// blocks whose first access is a load, extended backwards through
    /// predecessors up to (excluding) defining blocks.
    fn compute_live_blocks(&self, func: &Function, alloca: ValueId) -> HashSet<BlockId> {
        let info = &self.variables[&alloca];
        let mut worklist: Vec<BlockId> = info.using_blocks.iter().copied().collect();
        worklist.retain(|&block| {
            if !info.defining_blocks.contains(&block) {
                return true;
            }
            // The block both uses and defines the value. If the first access
            // is a store, the value is not live-in here.
            for &inst in &func.block(block).insts {
                match func.inst_data(inst) {
                    InstData::Store { addr, .. } if *addr == Value::Local(alloca) => return false,
                    InstData::Load { addr } if *addr == Value::Local(alloca) => return true,
                    _ => {}
                }
            }
            true
        });
        let mut live = HashSet::new();
        while let Some(block) = worklist.pop() {
            if !live.insert(block) {
                continue;
            }
            for &pred in func.predecessors(block) {
                if !info.defining_blocks.contains(&pred) {
                    worklist.push(pred);
                }
            }
        }
        live
    }

    fn insert_phis(&mut self, ctx: &mut Context, func: &mut Function, alloca: ValueId) {
        let dom = func.get_or_compute_dom_info();
        let live_blocks = self.compute_live_blocks(func, alloca);
        let info = self.variables.get_mut(&alloca).expect("tracked");
        let mut appeared: HashSet<BlockId> = info.defining_blocks.clone();
        let mut worklist: Vec<BlockId> = appeared.iter().copied().collect();
        worklist.sort();
        while let Some(block) = worklist.pop() {
            if !dom.contains(block) {
                continue;
            }
            for &frontier in dom.dom_front(block) {
                if info.phi_nodes.contains_key(&frontier) || !live_blocks.contains(&frontier) {
                    continue;
                }
                let undef = ctx.undef(info.ty);
                let args: SmallVec<[(BlockId, Value); 2]> = func
                    .predecessors(frontier)
                    .iter()
                    .map(|&pred| (pred, Value::Const(undef)))
                    .collect();
                let phi = func.insert_phi(frontier, InstData::Phi { args }, info.ty, &info.name);
                self.phi_to_alloca.insert(phi, alloca);
                info.phi_nodes.insert(frontier, phi);
                if appeared.insert(frontier) {
                    worklist.push(frontier);
                }
            }
        }
    }

    /// Renaming walk over the CFG. Pushes phi and store definitions on the
    /// per-variable stack, replaces loads with the reaching definition, and
    /// fills the phi arguments of successors before descending.
    fn rename(&mut self, ctx: &mut Context, func: &mut Function, block: BlockId) {
        if !self.renamed.insert(block) {
            return;
        }
        for phi in func.phis_of(block) {
            if let Some(&alloca) = self.phi_to_alloca.get(&phi) {
                self.variables
                    .get_mut(&alloca)
                    .expect("tracked")
                    .stack
                    .push(Value::Local(phi));
            }
        }
        for inst in func.block(block).insts.clone() {
            match *func.inst_data(inst) {
                InstData::Load { addr } => {
                    let Some(alloca) = addr.as_local() else { continue };
                    let Some(info) = self.variables.get(&alloca) else {
                        continue;
                    };
                    let value = match info.stack.last() {
                        Some(&value) => value,
                        // Loading from uninitialized memory yields undef.
                        None => Value::Const(ctx.undef(func.local_type(inst))),
                    };
                    func.replace_all_uses(inst, value);
                }
                InstData::Store { addr, value } => {
                    let Some(alloca) = addr.as_local() else { continue };
                    if let Some(info) = self.variables.get_mut(&alloca) {
                        info.stack.push(value);
                    }
                }
                _ => {}
            }
        }
        for succ in func.successors(block) {
            for phi in func.phis_of(succ) {
                let Some(&alloca) = self.phi_to_alloca.get(&phi) else {
                    continue;
                };
                let info = &self.variables[&alloca];
                if let Some(&top) = info.stack.last() {
                    func.phi_set_arg_for(phi, block, top);
                }
            }
        }
        for succ in func.successors(block) {
            self.rename(ctx, func, succ);
        }
        for &inst in &func.block(block).insts.clone() {
            let alloca = if let Some(&alloca) = self.phi_to_alloca.get(&inst) {
                Some(alloca)
            } else {
                match *func.inst_data(inst) {
                    InstData::Store { addr, .. } => {
                        addr.as_local().filter(|a| self.variables.contains_key(a))
                    }
                    _ => None,
                }
            };
            if let Some(alloca) = alloca {
                self.variables
                    .get_mut(&alloca)
                    .expect("tracked")
                    .stack
                    .pop();
            }
        }
    }

    /// Erases the now-dead loads, stores, allocas, and unused phis.
    fn clean(&mut self, func: &mut Function) -> bool {
        let mut cleaned = false;
        for (&alloca, info) in &self.variables {
            for &load in &info.loads {
                debug_assert!(func.is_unused(load), "loads are rewritten before cleanup");
                func.erase_inst(load);
            }
            for &store in &info.stores {
                func.erase_inst(store);
            }
            debug_assert!(func.is_unused(alloca));
            func.erase_inst(alloca);
            debug!("promoted alloca {} in @{}", info.name, func.name);
            cleaned = true;
        }
        for (&phi, _) in &self.phi_to_alloca {
            if func.is_unused(phi) && !func.value(phi).dead {
                func.erase_inst(phi);
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::{ArithOp, CompareMode, CompareOp};

    /// let a = 1; let b = 2; return a + b;   through stack slots.
    #[test]
    fn test_promotes_straightline_slots() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
        b.add_new_block("entry");
        let a = b.alloca(i64t, "a");
        let bb = b.alloca(i64t, "b");
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let two = Value::Const(b.ctx.int_constant(2, 64));
        b.store(a, one);
        b.store(bb, two);
        let va = b.load(a, i64t, "va");
        let vb = b.load(bb, i64t, "vb");
        let sum = b.arith(ArithOp::Add, va, vb, "sum");
        b.ret(sum);
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        assert!(mem2reg(&mut ctx, &mut module, id));
        let f = module.function(id);
        // No promotable alloca remains; the function is a single return of
        // a folded-over expression.
        assert!(f
            .instructions()
            .iter()
            .all(|&i| !f.inst_data(i).is_alloca()));
        assert!(f
            .instructions()
            .iter()
            .all(|&i| !matches!(f.inst_data(i), InstData::Load { .. } | InstData::Store { .. })));
    }

    /// A diamond with stores on both arms gets exactly one phi with two
    /// distinct reaching definitions.
    #[test]
    fn test_inserts_minimal_phi() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i1], i64t);
        let entry = b.add_new_block("entry");
        let then_b = b.func.add_block("then");
        let else_b = b.func.add_block("else");
        let join = b.func.add_block("join");
        b.select_block(entry);
        let slot = b.alloca(i64t, "x");
        let cond = b.param(0);
        b.branch(cond, then_b, else_b);
        b.select_block(then_b);
        let one = Value::Const(b.ctx.int_constant(1, 64));
        b.store(slot, one);
        b.goto(join);
        b.select_block(else_b);
        let two = Value::Const(b.ctx.int_constant(2, 64));
        b.store(slot, two);
        b.goto(join);
        b.select_block(join);
        let v = b.load(slot, i64t, "v");
        b.ret(v);
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        assert!(mem2reg(&mut ctx, &mut module, id));
        let f = module.function(id);
        let phis = f.phis_of(join);
        assert_eq!(phis.len(), 1);
        let args = f.phi_args(phis[0]);
        assert_eq!(args.len(), 2);
        let mut incoming: Vec<Value> = args.iter().map(|&(_, v)| v).collect();
        incoming.dedup();
        assert_eq!(incoming.len(), 2, "two distinct reaching definitions");
        // No phi in blocks where the value is not live.
        assert!(f.phis_of(then_b).is_empty());
    }

    /// Loads from never-stored memory become undef.
    #[test]
    fn test_uninitialized_load_becomes_undef() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        b.add_new_block("entry");
        let slot = b.alloca(i64t, "x");
        let v = b.load(slot, i64t, "v");
        b.ret(v);
        let f = b.finish();
        let mut module = Module::new();
        let id = module.add_function(f);
        assert!(mem2reg(&mut ctx, &mut module, id));
        let f = module.function(id);
        let ret = f.terminator(f.entry()).unwrap();
        let InstData::Return { value } = *f.inst_data(ret) else {
            panic!()
        };
        let Value::Const(c) = value else {
            panic!("expected constant undef")
        };
        assert!(ctx.is_undef(c));
    }
}
