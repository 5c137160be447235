//! Utilities shared by the transformation passes: side-effect queries,
//! edge splitting, and recognition of the builtin memory intrinsics.

use hashbrown::HashSet;

use crate::ir::context::Context;
use crate::ir::ir::{
    BlockId, Callee, FuncId, Function, FunctionAttributes, InstData, Module, Value, ValueId,
};

pub const BUILTIN_MEMCPY: &str = "__builtin_memcpy";
pub const BUILTIN_MEMSET: &str = "__builtin_memset";
pub const BUILTIN_ALLOC: &str = "__builtin_alloc";

/// Whether executing `inst` can be observed besides through its result.
/// Stores always can; calls can unless the callee guarantees it does not
/// write memory.
pub fn has_side_effects(func: &Function, module: &Module, inst: ValueId) -> bool {
    match func.inst_data(inst) {
        InstData::Store { .. } => true,
        InstData::Call { callee, .. } => match callee {
            Callee::Function(id) => {
                let attrs = callee_attributes(func, module, *id);
                !attrs.contains(FunctionAttributes::MEMORY_WRITE_NONE)
            }
            Callee::Ext(_) | Callee::Indirect(_) => true,
        },
        _ => false,
    }
}

fn callee_attributes(func: &Function, module: &Module, callee: FuncId) -> FunctionAttributes {
    if callee == func.id() {
        func.attributes
    } else {
        module.function(callee).attributes
    }
}

/// Whether `a` precedes `b` within their common block.
pub fn precedes(func: &Function, a: ValueId, b: ValueId) -> bool {
    debug_assert_eq!(func.parent_block(a), func.parent_block(b));
    func.index_in_block(a) < func.index_in_block(b)
}

/// Moves the alloca prefix of `from` to the alloca prefix of `to`.
pub fn move_allocas(func: &mut Function, from: BlockId, to: BlockId) {
    if from == to {
        return;
    }
    let allocas: Vec<ValueId> = func
        .block(from)
        .insts
        .iter()
        .copied()
        .take_while(|&inst| func.inst_data(inst).is_alloca())
        .collect();
    let mut insert_at = func
        .block(to)
        .insts
        .iter()
        .position(|&inst| !func.inst_data(inst).is_alloca())
        .unwrap_or(func.block(to).insts.len());
    for inst in allocas {
        func.extract_inst(inst);
        func.place_inst(to, insert_at, inst);
        insert_at += 1;
    }
}

pub fn is_critical_edge(func: &Function, from: BlockId, to: BlockId) -> bool {
    func.successors(from).len() > 1 && func.predecessors(to).len() > 1
}

/// Splits the edge `from -> to` with a fresh block holding a single goto.
pub fn split_edge(
    name: &str,
    ctx: &mut Context,
    func: &mut Function,
    from: BlockId,
    to: BlockId,
) -> BlockId {
    let tmp = func.add_block_before(name, to);
    func.set_terminator(tmp, InstData::Goto { target: to }, ctx);
    func.update_target(from, to, tmp);
    func.update_predecessor(to, from, tmp);
    func.add_predecessor(tmp, from);
    tmp
}

/// Splits every critical edge reachable from the entry. Returns whether the
/// CFG changed.
pub fn split_critical_edges(ctx: &mut Context, func: &mut Function) -> bool {
    let mut visited = HashSet::new();
    let mut modified = false;
    let mut stack = vec![func.entry()];
    while let Some(block) = stack.pop() {
        if !visited.insert(block) {
            continue;
        }
        for succ in func.successors(block) {
            if is_critical_edge(func, block, succ) {
                split_edge("split", ctx, func, block, succ);
                modified = true;
            }
            stack.push(succ);
        }
    }
    if modified {
        func.invalidate_cfg_info();
    }
    modified
}

/// Inserts a block joining the edges from `preds` into `header`: the new
/// block takes over those incoming edges and enters `header` with a single
/// goto. Phi arguments of `header` for the rerouted predecessors are folded
/// into new phis in the joining block where necessary.
pub fn add_joining_predecessor(
    ctx: &mut Context,
    func: &mut Function,
    header: BlockId,
    preds: &[BlockId],
    name: &str,
) -> BlockId {
    debug_assert!(preds
        .iter()
        .all(|&p| func.successors(p).contains(&header)));
    let joining = func.add_block_before(name, header);
    for phi in func.phis_of(header) {
        let args: Vec<(BlockId, Value)> = preds
            .iter()
            .map(|&p| (p, func.phi_arg_for(phi, p).expect("pred has a phi slot")))
            .collect();
        let value = if args.is_empty() {
            let ty = func.local_type(phi);
            Value::Const(ctx.undef(ty))
        } else if args.len() == 1 {
            args[0].1
        } else {
            let ty = func.local_type(phi);
            let name = func.value(phi).name.clone().unwrap_or_default();
            let joined = func.insert_phi(
                joining,
                InstData::Phi {
                    args: args.iter().copied().collect(),
                },
                ty,
                &name,
            );
            Value::Local(joined)
        };
        func.phi_add_arg(phi, joining, value);
    }
    for &pred in preds {
        func.update_target(pred, header, joining);
        func.remove_predecessor(header, pred);
        func.add_predecessor(joining, pred);
    }
    func.set_terminator(joining, InstData::Goto { target: header }, ctx);
    func.add_predecessor(header, joining);
    func.invalidate_cfg_info();
    joining
}

// -- Builtin intrinsic recognition ---------------------------------------

fn is_builtin_call(func: &Function, module: &Module, inst: ValueId, name: &str) -> bool {
    let InstData::Call { callee, .. } = func.inst_data(inst) else {
        return false;
    };
    match callee {
        Callee::Ext(id) => module.ext_function(*id).name == name,
        _ => false,
    }
}

pub fn is_memcpy(func: &Function, module: &Module, inst: ValueId) -> bool {
    is_builtin_call(func, module, inst, BUILTIN_MEMCPY)
}

/// A memcpy whose size arguments are integer constants.
pub fn is_const_size_memcpy(
    ctx: &Context,
    func: &Function,
    module: &Module,
    inst: ValueId,
) -> bool {
    if !is_memcpy(func, module, inst) {
        return false;
    }
    let args = call_args(func, inst);
    args.len() == 4
        && arg_int(ctx, args[1]).is_some()
        && arg_int(ctx, args[3]).is_some()
}

pub fn is_memset(func: &Function, module: &Module, inst: ValueId) -> bool {
    is_builtin_call(func, module, inst, BUILTIN_MEMSET)
}

/// A memset with constant size and constant fill value.
pub fn is_const_memset(ctx: &Context, func: &Function, module: &Module, inst: ValueId) -> bool {
    if !is_memset(func, module, inst) {
        return false;
    }
    let args = call_args(func, inst);
    args.len() == 3
        && arg_int(ctx, args[1]).is_some()
        && arg_int(ctx, args[2]).is_some()
}

pub fn is_builtin_alloc(func: &Function, module: &Module, inst: ValueId) -> bool {
    is_builtin_call(func, module, inst, BUILTIN_ALLOC)
}

pub fn call_args(func: &Function, inst: ValueId) -> Vec<Value> {
    match func.inst_data(inst) {
        InstData::Call { args, .. } => args.to_vec(),
        _ => panic!("not a call"),
    }
}

fn arg_int(ctx: &Context, value: Value) -> Option<u64> {
    ctx.int_value(value.as_const()?)
}

pub fn memcpy_dest(func: &Function, inst: ValueId) -> Value {
    call_args(func, inst)[0]
}

pub fn memcpy_source(func: &Function, inst: ValueId) -> Value {
    call_args(func, inst)[2]
}

pub fn memcpy_size(ctx: &Context, func: &Function, inst: ValueId) -> usize {
    arg_int(ctx, call_args(func, inst)[1]).expect("memcpy size is constant") as usize
}

pub fn memset_dest(func: &Function, inst: ValueId) -> Value {
    call_args(func, inst)[0]
}

pub fn memset_size(ctx: &Context, func: &Function, inst: ValueId) -> usize {
    arg_int(ctx, call_args(func, inst)[1]).expect("memset size is constant") as usize
}

pub fn memset_value(func: &Function, inst: ValueId) -> Value {
    call_args(func, inst)[2]
}

/// Rewrites argument `index` of a call, accounting for the extra operand
/// slot an indirect callee occupies.
pub fn set_call_arg(func: &mut Function, inst: ValueId, index: usize, value: Value) {
    let offset = match func.inst_data(inst) {
        InstData::Call {
            callee: Callee::Indirect(_),
            ..
        } => 1,
        InstData::Call { .. } => 0,
        _ => panic!("not a call"),
    };
    func.set_operand(inst, offset + index, value);
}
