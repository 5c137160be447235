//! Scalar replacement of aggregates.
//!
//! Per candidate alloca, three phases:
//!
//! 1. **Analyze.** Transitively trace every use. Loads, stores of unrelated
//!    values, constant-index geps, phis outside loop headers, and constant
//!    size memcpy/memset calls are allowed; anything else (a stored pointer,
//!    an unknown call, a loop phi) makes the alloca escape and the candidate
//!    is dropped.
//! 2. **Phi rewrite.** If pointers into the alloca flow through phis, split
//!    critical edges and, visiting blocks in reverse BFS order, clone each
//!    affected access into the predecessors of its phi, substituting the
//!    incoming pointer. Loads phi their cloned results back together. The
//!    clones are guarded: the user must post-dominate the phi and all other
//!    operands must dominate it, so nothing runs speculatively.
//! 3. **Slice and replace.** Slice points are the boundaries of all accessed
//!    subranges plus the member-boundary positions induced by each access
//!    type's member tree. One intermediate alloca is materialized per slice;
//!    accesses are rewritten slice-wise (with shift/mask splicing when a
//!    node straddles slices), memcpys and memsets become per-slice calls,
//!    dead geps are erased, and the new allocas are handed to mem2reg.
//!
//! The driver iterates the candidate list until a fixed point, so an alloca
//! holding the address of another becomes promotable once the other one is
//! gone.

use hashbrown::{HashMap, HashSet};
use log::debug;
use smallvec::SmallVec;

use crate::ir::context::Context;
use crate::ir::ir::{
    BlockId, Callee, ExtFuncId, FuncId, Function, InstData, Module, Value, ValueId,
};
use crate::ir::types::TypeId;
use crate::ir::validate::assert_invariants;
use crate::passes::common::{
    is_const_memset, is_const_size_memcpy, is_memcpy, is_memset, memcpy_dest, memcpy_size,
    memcpy_source, memset_dest, memset_size, memset_value, set_call_arg, split_critical_edges,
};
use crate::passes::member_tree::{MemberTree, NodeId};
use crate::passes::{mem2reg, Pass, PassCategory, PassRegistry};

pub(crate) fn register(registry: &mut PassRegistry) {
    registry.add(Pass {
        name: "sroa",
        category: PassCategory::Simplification,
        run: sroa,
    });
}

pub fn sroa(ctx: &mut Context, module: &mut Module, id: FuncId) -> bool {
    module.with_function(id, |module, func| {
        let mut worklist: Vec<ValueId> = func
            .block(func.entry())
            .insts
            .iter()
            .copied()
            .take_while(|&inst| func.inst_data(inst).is_alloca())
            .collect();
        let mut modified = false;
        loop {
            let mut this_round = false;
            let mut index = 0;
            while index < worklist.len() {
                let alloca = worklist[index];
                if Variable::run(ctx, module, func, alloca) {
                    worklist.swap_remove(index);
                    this_round = true;
                } else {
                    index += 1;
                }
            }
            if !this_round {
                break;
            }
            modified = true;
        }
        assert_invariants(ctx, module, func);
        modified
    })
}

/// A byte slice of the alloca region and the intermediate alloca standing in
/// for it. Begin/end are relative to whatever frame the slice list was
/// produced in (absolute for the master list, access-relative in
/// [`Variable::subrange_slices`]).
#[derive(Debug, Clone, Copy)]
struct Slice {
    begin: usize,
    end: usize,
    alloca: ValueId,
}

impl Slice {
    fn size(&self) -> usize {
        self.end - self.begin
    }
}

type Subrange = (usize, usize);

struct Variable {
    base_alloca: ValueId,
    alloca_size: usize,
    memcpy: Option<ExtFuncId>,
    memset: Option<ExtFuncId>,
    /// Loads, stores, memcpys and memsets that touch the alloca region.
    accesses: HashSet<ValueId>,
    geps: HashSet<ValueId>,
    phis: HashSet<ValueId>,
    /// Maps accesses and geps to the phi they transitively derive their
    /// pointer from.
    assoc_phis: HashMap<ValueId, ValueId>,
    /// Every pointer into the alloca region, with its constant byte offset
    /// where known (phis and phi-derived geps have none).
    ptr_offsets: HashMap<ValueId, Option<usize>>,
    subrange_slices: HashMap<Subrange, Vec<Slice>>,
    inserted_allocas: Vec<ValueId>,
    member_trees: HashMap<TypeId, MemberTree>,
}

impl Variable {
    fn run(ctx: &mut Context, module: &Module, func: &mut Function, alloca: ValueId) -> bool {
        let InstData::Alloca { allocated, count } = *func.inst_data(alloca) else {
            return false;
        };
        let Some(count) = count.as_const().and_then(|c| ctx.int_value(c)) else {
            return false;
        };
        let mut variable = Variable {
            base_alloca: alloca,
            alloca_size: count as usize * ctx.types.size(allocated),
            memcpy: None,
            memset: None,
            accesses: HashSet::new(),
            geps: HashSet::new(),
            phis: HashSet::new(),
            assoc_phis: HashMap::new(),
            ptr_offsets: HashMap::new(),
            subrange_slices: HashMap::new(),
            inserted_allocas: Vec::new(),
            member_trees: HashMap::new(),
        };
        if !variable.analyze(ctx, module, func, alloca) {
            return false;
        }
        let mut modified = false;
        modified |= variable.rewrite_phis(ctx, func);
        modified |= variable.compute_slices(ctx, func);
        modified |= variable.replace_by_slices(ctx, module, func);
        modified |= variable.promote_slices(ctx, func);
        if modified {
            debug!(
                "sroa sliced alloca {:?} in @{}",
                func.value(alloca).name,
                func.name
            );
        }
        modified
    }

    // -- Bookkeeping --------------------------------------------------------

    fn is_our_pointer(&self, value: Value) -> bool {
        value
            .as_local()
            .is_some_and(|id| self.ptr_offsets.contains_key(&id))
    }

    fn offset_of(&self, value: Value) -> Option<usize> {
        self.ptr_offsets.get(&value.as_local()?).copied().flatten()
    }

    /// The phi this value derives its pointer from: the value itself when it
    /// is a phi, otherwise the associated phi recorded during analysis.
    fn assoc_phi(&self, func: &Function, value: Value) -> Option<ValueId> {
        let id = value.as_local()?;
        if func.value(id).is_inst() && func.inst_data(id).is_phi() {
            return Some(id);
        }
        self.assoc_phis.get(&id).copied()
    }

    fn memorize(&mut self, func: &Function, inst: ValueId) -> bool {
        match func.inst_data(inst) {
            InstData::Load { .. } | InstData::Store { .. } | InstData::Call { .. } => {
                self.accesses.insert(inst)
            }
            InstData::Gep { .. } => self.geps.insert(inst),
            InstData::Phi { .. } => self.phis.insert(inst),
            _ => unreachable!("analysis only memorizes access instructions"),
        }
    }

    fn forget(&mut self, inst: ValueId) {
        self.accesses.remove(&inst);
        self.geps.remove(&inst);
        self.phis.remove(&inst);
        self.assoc_phis.remove(&inst);
    }

    // -- Phase 1: analysis --------------------------------------------------

    fn analyze(&mut self, ctx: &Context, module: &Module, func: &Function, inst: ValueId) -> bool {
        match func.inst_data(inst).clone() {
            InstData::Alloca { .. } => {
                debug_assert_eq!(inst, self.base_alloca);
                self.ptr_offsets.insert(inst, Some(0));
                self.analyze_users(ctx, module, func, inst)
            }
            InstData::Load { addr } => {
                if !self.pointer_use_postdominates_phi(func, inst, addr) {
                    return false;
                }
                self.memorize(func, inst);
                true
            }
            InstData::Store { addr, value } => {
                // Storing a pointer into the alloca region to memory makes
                // the region escape.
                if self.is_our_pointer(value) {
                    return false;
                }
                if !self.pointer_use_postdominates_phi(func, inst, addr) {
                    return false;
                }
                if !self.value_strictly_dominates_phi(func, value, addr) {
                    return false;
                }
                self.memorize(func, inst);
                true
            }
            InstData::Call { .. } => {
                if is_const_size_memcpy(ctx, func, module, inst) {
                    self.analyze_memcpy(func, inst)
                } else if is_const_memset(ctx, func, module, inst) {
                    self.analyze_memset(func, inst)
                } else {
                    false
                }
            }
            InstData::Gep {
                inbounds,
                base,
                index,
                ref members,
            } => {
                let Some(byte_offset) =
                    crate::passes::pointer_analysis::constant_byte_offset(
                        ctx, inbounds, index, members,
                    )
                else {
                    return false;
                };
                let base_is_phi = base
                    .as_local()
                    .is_some_and(|b| func.value(b).is_inst() && func.inst_data(b).is_phi());
                // Phi bases (and anything derived from one) may sit at
                // different offsets per path.
                let offset = if base_is_phi {
                    None
                } else {
                    self.offset_of(base).map(|o| o + byte_offset)
                };
                let newly = !self.ptr_offsets.contains_key(&inst);
                self.ptr_offsets.insert(inst, offset);
                if self.memorize(func, inst) || newly {
                    return self.analyze_users(ctx, module, func, inst);
                }
                true
            }
            InstData::Phi { .. } => {
                // Pointers that travel around a loop cannot be sliced.
                let lnf = func.get_or_compute_lnf();
                let block = func.parent_block(inst).expect("placed");
                if lnf.is_proper_loop(block) {
                    return false;
                }
                self.ptr_offsets.insert(inst, None);
                if self.memorize(func, inst) {
                    return self.analyze_users(ctx, module, func, inst);
                }
                true
            }
            _ => false,
        }
    }

    fn analyze_users(
        &mut self,
        ctx: &Context,
        module: &Module,
        func: &Function,
        inst: ValueId,
    ) -> bool {
        for user in func.users(inst) {
            if let Some(phi) = self.assoc_phi(func, Value::Local(inst)) {
                self.assoc_phis.insert(user, phi);
            }
            if !self.analyze(ctx, module, func, user) {
                return false;
            }
        }
        true
    }

    fn analyze_memcpy(&mut self, func: &Function, call: ValueId) -> bool {
        let dest = memcpy_dest(func, call);
        let source = memcpy_source(func, call);
        let alloca_ptr = if self.is_our_pointer(dest) {
            dest
        } else if self.is_our_pointer(source) {
            source
        } else {
            unreachable!("the call was reached through a pointer into the alloca");
        };
        if !self.pointer_use_postdominates_phi(func, call, alloca_ptr) {
            return false;
        }
        let args = crate::passes::common::call_args(func, call);
        let others_dominate = args.iter().all(|&arg| {
            arg == alloca_ptr || self.value_strictly_dominates_phi(func, arg, alloca_ptr)
        });
        if !others_dominate {
            return false;
        }
        let InstData::Call {
            callee: Callee::Ext(ext),
            ..
        } = *func.inst_data(call)
        else {
            return false;
        };
        self.memcpy = Some(ext);
        self.memorize(func, call);
        true
    }

    fn analyze_memset(&mut self, func: &Function, call: ValueId) -> bool {
        let dest = memset_dest(func, call);
        if !self.is_our_pointer(dest) {
            return false;
        }
        if !self.pointer_use_postdominates_phi(func, call, dest) {
            return false;
        }
        // The remaining memset arguments are constants, so no dominance
        // check is needed for them.
        let InstData::Call {
            callee: Callee::Ext(ext),
            ..
        } = *func.inst_data(call)
        else {
            return false;
        };
        self.memset = Some(ext);
        self.memorize(func, call);
        true
    }

    /// Control flow reaching the phi must always reach the user; otherwise a
    /// clone in the predecessor would run speculatively.
    fn pointer_use_postdominates_phi(&self, func: &Function, user: ValueId, ptr: Value) -> bool {
        let Some(phi) = self.assoc_phi(func, ptr) else {
            return true;
        };
        let postdom = func.get_or_compute_post_dom_info();
        let phi_block = func.parent_block(phi).expect("placed");
        let user_block = func.parent_block(user).expect("placed");
        postdom.contains(phi_block) && postdom.dominator_set(phi_block).contains(&user_block)
    }

    /// Operands of a cloned user must already exist in every predecessor of
    /// the phi.
    fn value_strictly_dominates_phi(&self, func: &Function, value: Value, ptr: Value) -> bool {
        let Some(inst) = value.as_local().filter(|&i| func.value(i).is_inst()) else {
            return true;
        };
        let Some(phi) = self.assoc_phi(func, ptr) else {
            return true;
        };
        let phi_block = func.parent_block(phi).expect("placed");
        let inst_block = func.parent_block(inst).expect("placed");
        if phi_block == inst_block {
            return false;
        }
        let dom = func.get_or_compute_dom_info();
        dom.contains(phi_block) && dom.dominator_set(phi_block).contains(&inst_block)
    }

    // -- Phase 2: phi rewriting ---------------------------------------------

    fn rewrite_phis(&mut self, ctx: &mut Context, func: &mut Function) -> bool {
        if self.phis.is_empty() {
            return false;
        }
        // Splitting critical edges lets us copy users into predecessors
        // without executing anything speculatively.
        split_critical_edges(ctx, func);
        let mut to_erase: Vec<ValueId> = Vec::new();
        let mut copy_map: HashMap<(BlockId, Value), ValueId> = HashMap::new();
        let mut insert_points: HashMap<BlockId, ValueId> = HashMap::new();
        for block in reverse_bfs(func) {
            struct PhiInsertion {
                before: ValueId,
                phi_args: SmallVec<[(BlockId, Value); 2]>,
                ty: TypeId,
                name: String,
                replaced: ValueId,
            }
            let mut phi_insertions: Vec<PhiInsertion> = Vec::new();
            for inst in func.block(block).insts.clone().into_iter().rev() {
                if !matches!(
                    func.inst_data(inst),
                    InstData::Load { .. }
                        | InstData::Store { .. }
                        | InstData::Gep { .. }
                        | InstData::Call { .. }
                ) {
                    continue;
                }
                let Some(&phi) = self.assoc_phis.get(&inst) else {
                    continue;
                };
                let phi_args = func.phi_args(phi).to_vec();
                if phi_args.len() == 1 {
                    // With one argument we substitute in place; a clone in
                    // the predecessor could run speculatively because the
                    // predecessor may have other successors.
                    let argument = phi_args[0].1;
                    func.update_operand(inst, Value::Local(phi), argument);
                    self.assoc_phis.remove(&inst);
                    if let Some(assoc) = self.assoc_phi(func, argument) {
                        self.assoc_phis.insert(inst, assoc);
                    }
                    if let InstData::Gep {
                        inbounds,
                        base,
                        index,
                        ref members,
                    } = *func.inst_data(inst)
                    {
                        let byte = crate::passes::pointer_analysis::constant_byte_offset(
                            ctx, inbounds, index, members,
                        );
                        if let (Some(base_off), Some(byte)) = (self.offset_of(base), byte) {
                            self.ptr_offsets.insert(inst, Some(base_off + byte));
                        }
                    }
                    continue;
                }
                let mut new_phi_args: SmallVec<[(BlockId, Value); 2]> = SmallVec::new();
                for (pred, phi_argument) in phi_args {
                    debug_assert_eq!(
                        func.successors(pred).len(),
                        1,
                        "critical edges are split and single-argument phis handled above"
                    );
                    let insert_before = *insert_points
                        .entry(pred)
                        .or_insert_with(|| func.terminator(pred).expect("has terminator"));
                    let copy = func.clone_inst(inst);
                    let index = func.index_in_block(insert_before);
                    func.place_inst(pred, index, copy);
                    insert_points.insert(pred, copy);
                    copy_map.insert((pred, Value::Local(inst)), copy);
                    if self.is_our_pointer(phi_argument) {
                        self.memorize(func, copy);
                    }
                    for operand in func.inst_data(copy).operands() {
                        if operand == Value::Local(phi) {
                            func.update_operand(copy, operand, phi_argument);
                        } else if let Some(&prior) = copy_map.get(&(pred, operand)) {
                            func.update_operand(copy, operand, Value::Local(prior));
                        }
                    }
                    new_phi_args.push((pred, Value::Local(copy)));
                    if let Some(assoc) = self.assoc_phi(func, phi_argument) {
                        self.assoc_phis.insert(copy, assoc);
                    }
                    if let InstData::Gep {
                        inbounds,
                        base,
                        index,
                        ref members,
                    } = *func.inst_data(copy)
                    {
                        let byte = crate::passes::pointer_analysis::constant_byte_offset(
                            ctx, inbounds, index, members,
                        );
                        if let (Some(base_off), Some(byte)) = (self.offset_of(base), byte) {
                            self.ptr_offsets.insert(copy, Some(base_off + byte));
                        }
                    }
                }
                // Loads phi their copies back together, but only when used.
                if matches!(func.inst_data(inst), InstData::Load { .. }) && !func.is_unused(inst) {
                    let name = func.value(inst).name.clone().unwrap_or_default();
                    phi_insertions.push(PhiInsertion {
                        before: phi,
                        phi_args: new_phi_args,
                        ty: func.local_type(inst),
                        name: format!("{name}.phi"),
                        replaced: inst,
                    });
                }
                to_erase.push(inst);
            }
            for insertion in phi_insertions {
                let block = func.parent_block(insertion.before).expect("placed");
                let index = func.index_in_block(insertion.before);
                let new_phi = func.insert_inst(
                    block,
                    index,
                    InstData::Phi {
                        args: insertion.phi_args,
                    },
                    insertion.ty,
                    &insertion.name,
                );
                func.replace_all_uses(insertion.replaced, Value::Local(new_phi));
            }
        }
        // Rewritten users first, then the phis, which by now only reference
        // each other.
        let mut remaining = to_erase;
        loop {
            let mut progress = false;
            remaining.retain(|&inst| {
                if func.is_unused(inst) {
                    self.forget(inst);
                    func.erase_inst(inst);
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
        debug_assert!(remaining.is_empty(), "rewritten users must become dead");
        let phis: Vec<ValueId> = self.phis.drain().collect();
        for &phi in &phis {
            let ty = func.local_type(phi);
            let undef = ctx.undef(ty);
            func.replace_all_uses(phi, Value::Const(undef));
        }
        for phi in phis {
            func.erase_inst(phi);
        }
        func.invalidate_cfg_info();
        true
    }

    // -- Phase 3: slicing ---------------------------------------------------

    fn member_tree(&mut self, ctx: &Context, ty: TypeId) -> &MemberTree {
        self.member_trees
            .entry(ty)
            .or_insert_with(|| MemberTree::compute(&ctx.types, ty))
    }

    fn compute_slices(&mut self, ctx: &mut Context, func: &mut Function) -> bool {
        let mut points: HashSet<usize> = HashSet::new();
        let accesses: Vec<ValueId> = sorted(&self.accesses);
        // Boundaries of every accessed subrange.
        for &inst in &accesses {
            for (begin, end) in self.subranges_cached(ctx, func, inst) {
                points.insert(begin);
                points.insert(end);
            }
        }
        // Critical positions: slicing inside a member forces slicing at all
        // of its siblings' boundaries, so sliced accesses stay contiguous.
        for &inst in &accesses {
            let (ptr, ty) = match *func.inst_data(inst) {
                InstData::Load { addr } => (addr, func.local_type(inst)),
                InstData::Store { addr, value } => (addr, func.value_type(value, ctx)),
                // Memory intrinsics have no structure of their own.
                InstData::Call { .. } => continue,
                _ => unreachable!(),
            };
            let offset = self.offset_of(ptr).expect("registered");
            let tree = self
                .member_trees
                .entry(ty)
                .or_insert_with(|| MemberTree::compute(&ctx.types, ty));
            let mut new_points = Vec::new();
            critical_positions(tree, tree.root(), offset, &points, &mut new_points);
            points.extend(new_points);
        }
        let mut sorted_points: Vec<usize> = points.into_iter().collect();
        sorted_points.sort_unstable();
        let mut slices: Vec<Slice> = Vec::new();
        let mut modified = false;
        let i8t = ctx.int_type(8);
        let ptr_ty = ctx.ptr_type();
        let entry = func.entry();
        let base_index = func.index_in_block(self.base_alloca);
        let base_name = func
            .value(self.base_alloca)
            .name
            .clone()
            .unwrap_or_default();
        for window in sorted_points.windows(2) {
            let (begin, end) = (window[0], window[1]);
            let alloca = if begin == 0 && end == self.alloca_size {
                self.base_alloca
            } else {
                modified = true;
                let count = ctx.int_constant((end - begin) as u64, 32);
                let new_alloca = func.insert_inst(
                    entry,
                    base_index,
                    InstData::Alloca {
                        allocated: i8t,
                        count: Value::Const(count),
                    },
                    ptr_ty,
                    &format!("{base_name}.slice"),
                );
                self.inserted_allocas.push(new_alloca);
                new_alloca
            };
            slices.push(Slice { begin, end, alloca });
        }
        for &inst in &accesses {
            for (begin, end) in self.subranges_cached(ctx, func, inst) {
                let in_range: Vec<Slice> = slices
                    .iter()
                    .filter(|s| s.begin >= begin && s.end <= end)
                    .map(|s| Slice {
                        begin: s.begin - begin,
                        end: s.end - begin,
                        alloca: s.alloca,
                    })
                    .collect();
                self.subrange_slices.insert((begin, end), in_range);
            }
        }
        modified
    }

    /// The byte subranges of the alloca region this access touches. Calls
    /// here are always the memorized memcpy/memset intrinsics.
    fn subranges_cached(
        &self,
        ctx: &Context,
        func: &Function,
        inst: ValueId,
    ) -> SmallVec<[Subrange; 2]> {
        let mut result = SmallVec::new();
        match *func.inst_data(inst) {
            InstData::Load { addr } => {
                let offset = self.offset_of(addr).expect("registered");
                let size = ctx.types.size(func.local_type(inst));
                result.push((offset, offset + size));
            }
            InstData::Store { addr, value } => {
                let offset = self.offset_of(addr).expect("registered");
                let size = ctx.types.size(func.value_type(value, ctx));
                result.push((offset, offset + size));
            }
            InstData::Call { ref args, .. } => {
                let size = ctx
                    .int_value(args[1].as_const().expect("analyzed as constant"))
                    .expect("analyzed as constant") as usize;
                if args.len() == 4 {
                    // memcpy(dest, size, source, size)
                    if let Some(offset) = self.offset_of(args[0]) {
                        result.push((offset, offset + size));
                    }
                    if let Some(offset) = self.offset_of(args[2]) {
                        result.push((offset, offset + size));
                    }
                } else {
                    // memset(dest, size, value)
                    let offset = self.offset_of(args[0]).expect("registered");
                    result.push((offset, offset + size));
                }
            }
            _ => unreachable!(),
        }
        result
    }

    // -- Phase 3b: access rewriting ----------------------------------------

    fn replace_by_slices(&mut self, ctx: &mut Context, module: &Module, func: &mut Function) -> bool {
        let mut modified = false;
        for inst in sorted(&self.accesses) {
            modified |= match *func.inst_data(inst) {
                InstData::Load { .. } => self.replace_load(ctx, func, inst),
                InstData::Store { .. } => self.replace_store(ctx, func, inst),
                InstData::Call { .. } => {
                    if is_memcpy(func, module, inst) {
                        self.replace_memcpy(ctx, func, inst)
                    } else {
                        self.replace_memset(ctx, func, inst)
                    }
                }
                _ => unreachable!(),
            };
        }
        modified
    }

    fn replace_load(&mut self, ctx: &mut Context, func: &mut Function, load: ValueId) -> bool {
        let ty = func.local_type(load);
        let subrange = self.subranges_cached(ctx, func, load)[0];
        let slices = self.subrange_slices[&subrange].clone();
        let tree = self.member_tree(ctx, ty);
        let plan = plan_tree_walk(tree, &slices);
        let mut modified = false;
        let mut aggregate = Value::Const(ctx.undef(ty));
        let name = func.value(load).name.clone().unwrap_or_default();
        for step in plan {
            let WalkStep {
                node_ty,
                node_begin,
                node_end,
                slices: node_slices,
                indices,
            } = step;
            match node_slices.len() {
                0 => {}
                1 => {
                    let slice = node_slices[0];
                    debug_assert!(slice.begin == node_begin && slice.end == node_end);
                    if indices.is_empty() {
                        func.set_operand(load, 0, Value::Local(slice.alloca));
                    } else {
                        let new_load = func.insert_inst_before(
                            load,
                            InstData::Load {
                                addr: Value::Local(slice.alloca),
                            },
                            node_ty,
                            &name,
                        );
                        let insert = func.insert_inst_before(
                            load,
                            InstData::InsertValue {
                                base: aggregate,
                                inserted: Value::Local(new_load),
                                members: SmallVec::from_slice(&indices),
                            },
                            ty,
                            "sroa.insert",
                        );
                        aggregate = Value::Local(insert);
                        modified = true;
                    }
                }
                _ => {
                    // The node straddles slices: load each slice, widen,
                    // shift into place and or everything together.
                    let node_size = node_end - node_begin;
                    let int_ty = ctx.int_type((node_size * 8) as u32);
                    let mut value = Value::Const(ctx.int_constant(0, (node_size * 8) as u32));
                    for slice in &node_slices {
                        let slice_ty = ctx.int_type((slice.size() * 8) as u32);
                        let mut slice_value: Value = Value::Local(func.insert_inst_before(
                            load,
                            InstData::Load {
                                addr: Value::Local(slice.alloca),
                            },
                            slice_ty,
                            &name,
                        ));
                        if slice_ty != int_ty {
                            slice_value = Value::Local(func.insert_inst_before(
                                load,
                                InstData::Conv {
                                    conv: crate::ir::ir::Conversion::Zext,
                                    operand: slice_value,
                                },
                                int_ty,
                                "sroa.zext",
                            ));
                        }
                        let local_begin = slice.begin - node_begin;
                        if local_begin > 0 {
                            let shift = ctx.int_constant((local_begin * 8) as u64, 32);
                            slice_value = Value::Local(func.insert_inst_before(
                                load,
                                InstData::Arith {
                                    op: crate::ir::ir::ArithOp::LShL,
                                    lhs: slice_value,
                                    rhs: Value::Const(shift),
                                },
                                int_ty,
                                "sroa.shift",
                            ));
                        }
                        value = Value::Local(func.insert_inst_before(
                            load,
                            InstData::Arith {
                                op: crate::ir::ir::ArithOp::Or,
                                lhs: value,
                                rhs: slice_value,
                            },
                            int_ty,
                            "sroa.or",
                        ));
                    }
                    if node_ty != int_ty {
                        value = Value::Local(func.insert_inst_before(
                            load,
                            InstData::Conv {
                                conv: crate::ir::ir::Conversion::Bitcast,
                                operand: value,
                            },
                            node_ty,
                            "sroa.bitcast",
                        ));
                    }
                    if indices.is_empty() {
                        aggregate = value;
                    } else {
                        aggregate = Value::Local(func.insert_inst_before(
                            load,
                            InstData::InsertValue {
                                base: aggregate,
                                inserted: value,
                                members: SmallVec::from_slice(&indices),
                            },
                            ty,
                            "sroa.insert",
                        ));
                    }
                    modified = true;
                }
            }
        }
        if modified {
            func.replace_all_uses(load, aggregate);
            self.forget(load);
            func.erase_inst(load);
        }
        modified
    }

    fn replace_store(&mut self, ctx: &mut Context, func: &mut Function, store: ValueId) -> bool {
        let InstData::Store { value, .. } = *func.inst_data(store) else {
            unreachable!()
        };
        let value_ty = func.value_type(value, ctx);
        let subrange = self.subranges_cached(ctx, func, store)[0];
        let slices = self.subrange_slices[&subrange].clone();
        let tree = self.member_tree(ctx, value_ty);
        let plan = plan_tree_walk(tree, &slices);
        let mut modified = false;
        for step in plan {
            let WalkStep {
                node_ty,
                node_begin,
                node_end,
                slices: node_slices,
                indices,
            } = step;
            match node_slices.len() {
                0 => {}
                1 => {
                    let slice = node_slices[0];
                    debug_assert!(slice.begin == node_begin && slice.end == node_end);
                    if indices.is_empty() {
                        func.set_operand(store, 0, Value::Local(slice.alloca));
                    } else {
                        let extract = func.insert_inst_before(
                            store,
                            InstData::ExtractValue {
                                base: value,
                                members: SmallVec::from_slice(&indices),
                            },
                            node_ty,
                            "sroa.extract",
                        );
                        func.insert_inst_before(
                            store,
                            InstData::Store {
                                addr: Value::Local(slice.alloca),
                                value: Value::Local(extract),
                            },
                            ctx.void_type(),
                            "",
                        );
                        modified = true;
                    }
                }
                _ => {
                    let node_size = node_end - node_begin;
                    let int_ty = ctx.int_type((node_size * 8) as u32);
                    let mut wide = if indices.is_empty() {
                        value
                    } else {
                        Value::Local(func.insert_inst_before(
                            store,
                            InstData::ExtractValue {
                                base: value,
                                members: SmallVec::from_slice(&indices),
                            },
                            node_ty,
                            "sroa.extract",
                        ))
                    };
                    if node_ty != int_ty {
                        wide = Value::Local(func.insert_inst_before(
                            store,
                            InstData::Conv {
                                conv: crate::ir::ir::Conversion::Bitcast,
                                operand: wide,
                            },
                            int_ty,
                            "sroa.bitcast",
                        ));
                    }
                    for slice in &node_slices {
                        let local_begin = slice.begin - node_begin;
                        let mut slice_value = wide;
                        if local_begin > 0 {
                            let shift = ctx.int_constant((local_begin * 8) as u64, 32);
                            slice_value = Value::Local(func.insert_inst_before(
                                store,
                                InstData::Arith {
                                    op: crate::ir::ir::ArithOp::LShR,
                                    lhs: slice_value,
                                    rhs: Value::Const(shift),
                                },
                                int_ty,
                                "sroa.shift",
                            ));
                        }
                        let slice_ty = ctx.int_type((slice.size() * 8) as u32);
                        if slice_ty != int_ty {
                            slice_value = Value::Local(func.insert_inst_before(
                                store,
                                InstData::Conv {
                                    conv: crate::ir::ir::Conversion::Trunc,
                                    operand: slice_value,
                                },
                                slice_ty,
                                "sroa.trunc",
                            ));
                        }
                        func.insert_inst_before(
                            store,
                            InstData::Store {
                                addr: Value::Local(slice.alloca),
                                value: slice_value,
                            },
                            ctx.void_type(),
                            "",
                        );
                    }
                    modified = true;
                }
            }
        }
        if modified {
            self.forget(store);
            func.erase_inst(store);
        }
        modified
    }

    fn replace_memcpy(&mut self, ctx: &mut Context, func: &mut Function, call: ValueId) -> bool {
        let dest = memcpy_dest(func, call);
        let source = memcpy_source(func, call);
        let dest_ours = self.is_our_pointer(dest);
        let source_ours = self.is_our_pointer(source);
        debug_assert!(dest_ours || source_ours);
        let subranges = self.subranges_cached(ctx, func, call);
        let memcpy = self.memcpy.expect("set during analysis");
        let void = ctx.void_type();
        if dest_ours && source_ours {
            let dest_slices = self.subrange_slices[&subranges[0]].clone();
            let source_slices = self.subrange_slices[&subranges[1]].clone();
            debug_assert_eq!(dest_slices.len(), source_slices.len());
            if dest_slices.len() == 1 {
                set_call_arg(func, call, 0, Value::Local(dest_slices[0].alloca));
                set_call_arg(func, call, 2, Value::Local(source_slices[0].alloca));
                return false;
            }
            for (d, s) in dest_slices.iter().zip(source_slices.iter()) {
                debug_assert_eq!(d.size(), s.size());
                let size = Value::Const(ctx.int_constant(d.size() as u64, 64));
                func.insert_inst_before(
                    call,
                    InstData::Call {
                        callee: Callee::Ext(memcpy),
                        args: SmallVec::from_slice(&[
                            Value::Local(d.alloca),
                            size,
                            Value::Local(s.alloca),
                            size,
                        ]),
                    },
                    void,
                    "",
                );
            }
            self.forget(call);
            func.erase_inst(call);
            return true;
        }
        let slices = self.subrange_slices[&subranges[0]].clone();
        if slices.len() == 1 {
            let arg = if dest_ours { 0 } else { 2 };
            set_call_arg(func, call, arg, Value::Local(slices[0].alloca));
            return false;
        }
        let i8t = ctx.int_type(8);
        let ptr_ty = ctx.ptr_type();
        let other = if dest_ours { source } else { dest };
        for slice in &slices {
            let index = Value::Const(ctx.int_constant(slice.begin as u64, 32));
            let other_ptr = func.insert_inst_before(
                call,
                InstData::Gep {
                    inbounds: i8t,
                    base: other,
                    index,
                    members: SmallVec::new(),
                },
                ptr_ty,
                "sroa.gep",
            );
            let size = Value::Const(ctx.int_constant(slice.size() as u64, 64));
            let args = if dest_ours {
                [Value::Local(slice.alloca), size, Value::Local(other_ptr), size]
            } else {
                [Value::Local(other_ptr), size, Value::Local(slice.alloca), size]
            };
            func.insert_inst_before(
                call,
                InstData::Call {
                    callee: Callee::Ext(memcpy),
                    args: SmallVec::from_slice(&args),
                },
                void,
                "",
            );
        }
        self.forget(call);
        func.erase_inst(call);
        true
    }

    fn replace_memset(&mut self, ctx: &mut Context, func: &mut Function, call: ValueId) -> bool {
        let subranges = self.subranges_cached(ctx, func, call);
        let slices = self.subrange_slices[&subranges[0]].clone();
        if slices.len() == 1 {
            set_call_arg(func, call, 0, Value::Local(slices[0].alloca));
            return false;
        }
        let memset = self.memset.expect("set during analysis");
        let fill = memset_value(func, call);
        let void = ctx.void_type();
        for slice in &slices {
            let size = Value::Const(ctx.int_constant(slice.size() as u64, 64));
            func.insert_inst_before(
                call,
                InstData::Call {
                    callee: Callee::Ext(memset),
                    args: SmallVec::from_slice(&[Value::Local(slice.alloca), size, fill]),
                },
                void,
                "",
            );
        }
        self.forget(call);
        func.erase_inst(call);
        true
    }

    fn promote_slices(&mut self, ctx: &mut Context, func: &mut Function) -> bool {
        let mut modified = false;
        // All geps are dead after the rewrite; chains unwind at the fixpoint.
        let mut geps: Vec<ValueId> = self.geps.drain().collect();
        geps.sort();
        loop {
            let mut progress = false;
            geps.retain(|&gep| {
                if func.is_unused(gep) {
                    func.erase_inst(gep);
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
        debug_assert!(geps.is_empty(), "geps must be dead after slicing");
        let mut allocas = self.inserted_allocas.clone();
        allocas.push(self.base_alloca);
        modified |= mem2reg::promote(ctx, func, &allocas);
        modified
    }
}

fn sorted(set: &HashSet<ValueId>) -> Vec<ValueId> {
    let mut v: Vec<ValueId> = set.iter().copied().collect();
    v.sort();
    v
}

/// Reverse BFS over the CFG, starting from the exit blocks.
fn reverse_bfs(func: &Function) -> Vec<BlockId> {
    let mut order = Vec::new();
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut queue: std::collections::VecDeque<BlockId> = func
        .block_ids()
        .into_iter()
        .filter(|&b| func.successors(b).is_empty())
        .collect();
    visited.extend(queue.iter().copied());
    while let Some(block) = queue.pop_front() {
        order.push(block);
        for &pred in func.predecessors(block) {
            if visited.insert(pred) {
                queue.push_back(pred);
            }
        }
    }
    order
}

/// Collects the sibling boundaries that must become slice points: when a
/// slice point falls strictly inside a node, all of the node's children gain
/// boundary points.
fn critical_positions(
    tree: &MemberTree,
    node: NodeId,
    offset: usize,
    points: &HashSet<usize>,
    out: &mut Vec<usize>,
) {
    for &child in tree.children(node) {
        critical_positions(tree, child, offset, points, out);
    }
    let node_data = tree.node(node);
    let mut has_points = false;
    for &child in tree.children(node) {
        let child_data = tree.node(child);
        has_points |= child_data.begin != node_data.begin
            && (points.contains(&(offset + child_data.begin))
                || out.contains(&(offset + child_data.begin)));
        has_points |= child_data.end != node_data.end
            && (points.contains(&(offset + child_data.end))
                || out.contains(&(offset + child_data.end)));
    }
    if has_points {
        for &child in tree.children(node) {
            let child_data = tree.node(child);
            out.push(offset + child_data.begin);
            out.push(offset + child_data.end);
        }
    }
}

struct WalkStep {
    node_ty: TypeId,
    node_begin: usize,
    node_end: usize,
    slices: Vec<Slice>,
    indices: Vec<u32>,
}

/// Post-order plan over the access type's member tree: each reported node
/// carries the slices it fully contains. A node whose children already
/// claimed slices is not reported itself.
fn plan_tree_walk(tree: &MemberTree, slices: &[Slice]) -> Vec<WalkStep> {
    let mut plan = Vec::new();
    let mut indices = Vec::new();
    walk(tree, tree.root(), slices, &mut indices, &mut plan);
    plan
}

fn walk(
    tree: &MemberTree,
    node: NodeId,
    slices: &[Slice],
    indices: &mut Vec<u32>,
    plan: &mut Vec<WalkStep>,
) -> bool {
    let mut any = false;
    let mut all = true;
    for &child in tree.children(node) {
        indices.push(tree.node(child).index);
        let claimed = walk(tree, child, slices, indices, plan);
        any |= claimed;
        all &= claimed;
        indices.pop();
    }
    if any {
        debug_assert!(all, "either every child claims slices or none does");
        return true;
    }
    let data = tree.node(node);
    let mine: Vec<Slice> = slices
        .iter()
        .copied()
        .filter(|s| s.begin >= data.begin && s.end <= data.end)
        .collect();
    let claimed = !mine.is_empty();
    plan.push(WalkStep {
        node_ty: data.ty,
        node_begin: data.begin,
        node_end: data.end,
        slices: mine,
        indices: indices.clone(),
    });
    claimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::ArithOp;
    use crate::ir::print::Printer;

    /// A two-field struct accessed member-wise through geps promotes fully.
    #[test]
    fn test_struct_decomposes_and_promotes() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let pair = ctx.anonymous_struct(&[i64t, i64t]);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t, i64t], i64t);
        b.add_new_block("entry");
        let slot = b.alloca(pair, "p");
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        let first = b.gep(pair, slot, zero, &[0u32], "first");
        let second = b.gep(pair, slot, zero, &[1u32], "second");
        b.store(first, b.param(0));
        b.store(second, b.param(1));
        let x = b.load(first, i64t, "x");
        let y = b.load(second, i64t, "y");
        let sum = b.arith(ArithOp::Add, x, y, "sum");
        b.ret(sum);
        let mut module = Module::new();
        let id = module.add_function(b.finish());
        assert!(sroa(&mut ctx, &mut module, id));
        let f = module.function(id);
        for inst in f.instructions() {
            assert!(
                !f.inst_data(inst).is_alloca(),
                "all slices promoted:\n{}",
                Printer::new(&ctx, f).function_to_string()
            );
            assert!(!matches!(f.inst_data(inst), InstData::Gep { .. }));
        }
    }

    /// Running the pass twice yields the same IR as running it once.
    #[test]
    fn test_idempotent() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let pair = ctx.anonymous_struct(&[i64t, i64t]);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        b.add_new_block("entry");
        let slot = b.alloca(pair, "p");
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        let first = b.gep(pair, slot, zero, &[0u32], "first");
        b.store(first, b.param(0));
        let x = b.load(first, i64t, "x");
        b.ret(x);
        let mut module = Module::new();
        let id = module.add_function(b.finish());
        sroa(&mut ctx, &mut module, id);
        let once = Printer::new(&ctx, module.function(id)).function_to_string();
        sroa(&mut ctx, &mut module, id);
        let twice = Printer::new(&ctx, module.function(id)).function_to_string();
        assert_eq!(once, twice);
    }

    /// An alloca whose address escapes through an unknown call is left
    /// untouched.
    #[test]
    fn test_escaping_alloca_bails() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let ptr = ctx.ptr_type();
        let void = ctx.void_type();
        let mut module = Module::new();
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
        b.call(Callee::Ext(ext), &[slot], void, "");
        let v = b.load(slot, i64t, "v");
        b.ret(v);
        let id = module.add_function(b.finish());
        assert!(!sroa(&mut ctx, &mut module, id));
        let f = module.function(id);
        assert!(f
            .instructions()
            .iter()
            .any(|&i| f.inst_data(i).is_alloca()));
    }

    /// Pointers selected by a non-loop phi are rewritten into the
    /// predecessors and the aggregate still promotes.
    #[test]
    fn test_phi_of_pointers_is_rewritten() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let pair = ctx.anonymous_struct(&[i64t, i64t]);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i1], i64t);
        let entry = b.add_new_block("entry");
        let left = b.func.add_block("left");
        let right = b.func.add_block("right");
        let join = b.func.add_block("join");
        b.select_block(entry);
        let slot = b.alloca(pair, "p");
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        let first = b.gep(pair, slot, zero, &[0u32], "first");
        let second = b.gep(pair, slot, zero, &[1u32], "second");
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let two = Value::Const(b.ctx.int_constant(2, 64));
        b.store(first, one);
        b.store(second, two);
        b.branch(b.param(0), left, right);
        b.select_block(left);
        b.goto(join);
        b.select_block(right);
        b.goto(join);
        b.select_block(join);
        let chosen = b.phi(&[(left, first), (right, second)], "chosen");
        let v = b.load(chosen, i64t, "v");
        b.ret(v);
        let mut module = Module::new();
        let id = module.add_function(b.finish());
        assert!(sroa(&mut ctx, &mut module, id));
        let f = module.function(id);
        for inst in f.instructions() {
            assert!(!f.inst_data(inst).is_phi() || !ctx.types.is_ptr(f.local_type(inst)),
                "no pointer phis remain");
            assert!(!f.inst_data(inst).is_alloca(), "slices were promoted");
        }
    }
}
