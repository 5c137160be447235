//! Global value numbering.
//!
//! A loop-aware partial redundancy elimination. Preprocessing splits
//! critical edges, attaches a landing pad to every loop header, computes a
//! reverse topological order over the forward edges, and assigns every
//! instruction a rank (one plus the maximum operand rank; phis do not
//! increment) together with a per-block, per-rank insertion point.
//!
//! The main phase walks ranks outermost and blocks in reverse topological
//! order (successors first), maintaining two tables:
//!
//! - the **local computation table** per block, keyed by a computation key
//!   that treats commutative operand pairs and equality compares as
//!   unordered; duplicate keys are redundancies and fold immediately;
//! - the **movable computation table** per CFG edge, holding operand-renamed
//!   clones available for motion from the successor into the predecessor.
//!   Moving into a branching predecessor requires the computation on every
//!   outgoing edge; moving into a landing pad requires that no operand is
//!   defined inside the loop.
//!
//! Post-processing removes split-edge blocks that received no code, erases
//! the now-redundant instructions, and destroys clones that never got
//! placed.

use hashbrown::{HashMap, HashSet};

use crate::ir::context::Context;
use crate::ir::ir::{
    ArithOp, BlockId, CompareMode, CompareOp, Conversion, FuncId, Function, InstData, Module,
    Value, ValueId,
};
use crate::ir::types::TypeId;
use crate::ir::validate::assert_invariants;
use crate::passes::common::{add_joining_predecessor, is_critical_edge, split_edge};
use crate::passes::{Pass, PassCategory, PassRegistry};

pub(crate) fn register(registry: &mut PassRegistry) {
    registry.add(Pass {
        name: "gvn",
        category: PassCategory::Simplification,
        run: gvn,
    });
}

pub fn gvn(ctx: &mut Context, module: &mut Module, id: FuncId) -> bool {
    module.with_function(id, |module, func| {
        let result = GvnCtx::default().run(ctx, func);
        assert_invariants(ctx, module, func);
        result
    })
}

/// Identifies equal computations. Commutative arithmetic and equality
/// compares normalize their operand order, so `a + b` and `b + a` map to the
/// same key. The commutativity bit is taken from the context when the key is
/// built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CompKey {
    Arith {
        op: ArithOp,
        operands: [Value; 2],
    },
    UnaryArith {
        op: crate::ir::ir::UnaryArithOp,
        operand: Value,
    },
    Cmp {
        mode: CompareMode,
        op: CompareOp,
        operands: [Value; 2],
    },
    Gep {
        inbounds: TypeId,
        base: Value,
        index: Value,
        members: Vec<u32>,
    },
    Conv {
        conv: Conversion,
        operand: Value,
    },
    Select {
        cond: Value,
        then_value: Value,
        else_value: Value,
    },
    Extract {
        base: Value,
        members: Vec<u32>,
    },
    Insert {
        base: Value,
        inserted: Value,
        members: Vec<u32>,
    },
}

fn value_order(v: Value) -> (u8, u32) {
    match v {
        Value::Local(id) => (0, id.0),
        Value::Const(id) => (1, id.0),
        Value::Global(id) => (2, id.0),
        Value::Function(id) => (3, id.0),
        Value::ExtFunction(id) => (4, id.0),
    }
}

fn normalized(a: Value, b: Value) -> [Value; 2] {
    if value_order(a) <= value_order(b) {
        [a, b]
    } else {
        [b, a]
    }
}

/// Instructions the algorithm never numbers: control flow, memory, calls.
fn is_ignored(data: &InstData) -> bool {
    matches!(
        data,
        InstData::Phi { .. }
            | InstData::Alloca { .. }
            | InstData::Load { .. }
            | InstData::Store { .. }
            | InstData::Call { .. }
    ) || data.is_terminator()
}

fn comp_key(ctx: &Context, data: &InstData) -> Option<CompKey> {
    match data.clone() {
        InstData::Arith { op, lhs, rhs } => {
            let operands = if ctx.is_commutative(op) {
                normalized(lhs, rhs)
            } else {
                [lhs, rhs]
            };
            Some(CompKey::Arith { op, operands })
        }
        InstData::UnaryArith { op, operand } => Some(CompKey::UnaryArith { op, operand }),
        InstData::Cmp { mode, op, lhs, rhs } => {
            let operands = if op.is_equality() {
                normalized(lhs, rhs)
            } else {
                [lhs, rhs]
            };
            Some(CompKey::Cmp { mode, op, operands })
        }
        InstData::Gep {
            inbounds,
            base,
            index,
            members,
        } => Some(CompKey::Gep {
            inbounds,
            base,
            index,
            members: members.to_vec(),
        }),
        InstData::Conv { conv, operand } => Some(CompKey::Conv { conv, operand }),
        InstData::Select {
            cond,
            then_value,
            else_value,
        } => Some(CompKey::Select {
            cond,
            then_value,
            else_value,
        }),
        InstData::ExtractValue { base, members } => Some(CompKey::Extract {
            base,
            members: members.to_vec(),
        }),
        InstData::InsertValue {
            base,
            inserted,
            members,
        } => Some(CompKey::Insert {
            base,
            inserted,
            members: members.to_vec(),
        }),
        _ => None,
    }
}

#[derive(Default)]
struct Lct {
    by_rank: HashMap<usize, Vec<(CompKey, ValueId)>>,
}

impl Lct {
    /// Inserts the computation, or reports the existing equal one.
    fn insert_or_existing(&mut self, rank: usize, key: CompKey, inst: ValueId) -> Option<ValueId> {
        let list = self.by_rank.entry(rank).or_default();
        if let Some((_, existing)) = list.iter().find(|(k, _)| *k == key) {
            return Some(*existing);
        }
        list.push((key, inst));
        None
    }

    fn of_rank(&self, rank: usize) -> Vec<(CompKey, ValueId)> {
        self.by_rank.get(&rank).cloned().unwrap_or_default()
    }
}

struct MctEntry {
    key: CompKey,
    copy: ValueId,
    originals: Vec<ValueId>,
    rank: usize,
    dead: bool,
}

#[derive(Default)]
struct Mct {
    entries: Vec<MctEntry>,
}

impl Mct {
    /// Inserts a clone; when an equal computation is already present the
    /// clone is surplus and handed back for destruction.
    fn insert(
        &mut self,
        rank: usize,
        key: CompKey,
        copy: ValueId,
        original: ValueId,
    ) -> Option<ValueId> {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| !e.dead && e.key == key)
        {
            entry.originals.push(original);
            return Some(copy);
        }
        self.entries.push(MctEntry {
            key,
            copy,
            originals: vec![original],
            rank,
            dead: false,
        });
        None
    }

    fn indices_of_rank(&self, rank: usize) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.dead && e.rank == rank)
            .map(|(i, _)| i)
            .collect()
    }

    fn find_key(&self, key: &CompKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.dead && e.key == *key)
    }

    /// Kills every live entry, handing back the clones for destruction.
    fn clear(&mut self) -> Vec<ValueId> {
        let mut copies = Vec::new();
        for entry in &mut self.entries {
            if !entry.dead {
                entry.dead = true;
                copies.push(entry.copy);
            }
        }
        copies
    }
}

struct LoopDesc {
    landing_pad: BlockId,
    loop_nodes: HashSet<BlockId>,
}

#[derive(Default)]
struct GvnCtx {
    modified: bool,
    edge_split_blocks: HashSet<BlockId>,
    loop_headers: HashSet<BlockId>,
    landing_pads: HashSet<BlockId>,
    loops: HashMap<BlockId, LoopDesc>,
    virtual_preds: HashMap<BlockId, Vec<BlockId>>,
    virtual_succs: HashMap<BlockId, Vec<BlockId>>,
    topsort: Vec<BlockId>,
    max_rank: usize,
    global_ranks: HashMap<ValueId, usize>,
    redundant: HashSet<ValueId>,
    insert_points: HashMap<(BlockId, usize), ValueId>,
    lcts: HashMap<BlockId, Lct>,
    mcts: HashMap<(BlockId, BlockId), Mct>,
    /// Every clone made for table entries; unplaced leftovers are destroyed
    /// before validation.
    clones: Vec<ValueId>,
}

impl GvnCtx {
    fn run(mut self, ctx: &mut Context, func: &mut Function) -> bool {
        self.split_critical_edges(ctx, func);
        self.gather_loops(ctx, func);
        self.compute_topsort(func);
        self.assign_ranks(func);
        self.process_globally(ctx, func);
        self.clean(func);
        self.join_split_edges(func);
        // The CFG was changed, analyzed, and possibly changed back; the
        // caches cannot be trusted either way.
        func.invalidate_cfg_info();
        self.modified
    }

    /// Splits critical edges, remembering the inserted blocks so empty ones
    /// can be removed again afterwards; otherwise this pass and simplifycfg
    /// would oscillate forever.
    fn split_critical_edges(&mut self, ctx: &mut Context, func: &mut Function) {
        let mut visited = HashSet::new();
        let mut stack = vec![func.entry()];
        while let Some(block) = stack.pop() {
            if !visited.insert(block) {
                continue;
            }
            for succ in func.successors(block) {
                if is_critical_edge(func, block, succ) {
                    let inserted = split_edge("gvn.split", ctx, func, block, succ);
                    self.edge_split_blocks.insert(inserted);
                }
                stack.push(succ);
            }
        }
        if !self.edge_split_blocks.is_empty() {
            func.invalidate_cfg_info();
        }
    }

    fn gather_loops(&mut self, ctx: &mut Context, func: &mut Function) {
        let lnf = func.get_or_compute_lnf();
        for header in lnf.headers_preorder() {
            let landing_pad = self.find_landing_pad(ctx, func, &lnf, header);
            let mut loop_nodes = HashSet::new();
            for &pred in func.predecessors(header).to_vec().iter() {
                let mut stack = vec![pred];
                while let Some(block) = stack.pop() {
                    if block == landing_pad || !loop_nodes.insert(block) {
                        continue;
                    }
                    for &p in func.predecessors(block) {
                        stack.push(p);
                    }
                }
            }
            let mut exit_nodes = HashSet::new();
            for &block in &loop_nodes {
                for succ in func.successors(block) {
                    if !loop_nodes.contains(&succ) {
                        exit_nodes.insert(succ);
                        self.virtual_preds.entry(succ).or_default().push(landing_pad);
                        self.virtual_succs
                            .entry(landing_pad)
                            .or_default()
                            .push(succ);
                    }
                }
            }
            self.loops.insert(
                header,
                LoopDesc {
                    landing_pad,
                    loop_nodes,
                },
            );
            self.loop_headers.insert(header);
            self.landing_pads.insert(landing_pad);
        }
    }

    /// A landing pad is the unique non-loop predecessor of the header with a
    /// single successor. Multiple entering edges get a joining preheader; a
    /// loop guard gets the edge split.
    fn find_landing_pad(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        lnf: &crate::analysis::loops::LoopNestingForest,
        header: BlockId,
    ) -> BlockId {
        let candidates: Vec<BlockId> = func
            .predecessors(header)
            .iter()
            .copied()
            .filter(|&pred| pred != header && !lnf.is_loop_node_of(pred, header))
            .collect();
        debug_assert!(
            !candidates.is_empty(),
            "every loop header needs a potential landing pad"
        );
        if candidates.len() > 1 {
            return add_joining_predecessor(ctx, func, header, &candidates, "preheader");
        }
        let candidate = candidates[0];
        if func.successors(candidate).len() == 1 {
            return candidate;
        }
        let landing_pad = split_edge("gvn.landingpad", ctx, func, candidate, header);
        self.edge_split_blocks.insert(landing_pad);
        landing_pad
    }

    /// Reverse topological order over the forward edges: a postorder DFS
    /// from the entry lists every successor before its predecessors.
    fn compute_topsort(&mut self, func: &Function) {
        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();
        let mut order = Vec::new();
        fn dfs(
            func: &Function,
            block: BlockId,
            visited: &mut HashSet<BlockId>,
            on_path: &mut HashSet<BlockId>,
            order: &mut Vec<BlockId>,
        ) {
            visited.insert(block);
            on_path.insert(block);
            for succ in func.successors(block) {
                // Back edges are not forward edges.
                if on_path.contains(&succ) || visited.contains(&succ) {
                    continue;
                }
                dfs(func, succ, visited, on_path, order);
            }
            on_path.remove(&block);
            order.push(block);
        }
        dfs(func, func.entry(), &mut visited, &mut on_path, &mut order);
        self.topsort = order;
    }

    fn avail_rank(&self, value: Value) -> usize {
        match value {
            Value::Local(id) => self.global_ranks.get(&id).copied().unwrap_or(0),
            _ => 0,
        }
    }

    fn assign_ranks(&mut self, func: &Function) {
        let mut instruction_order: HashMap<ValueId, usize> = HashMap::new();
        for &block in self.topsort.clone().iter().rev() {
            for (index, &inst) in func.block(block).insts.iter().enumerate() {
                instruction_order.insert(inst, index);
                if func.inst_data(inst).is_terminator() {
                    continue;
                }
                let mut rank = 0;
                func.inst_data(inst).for_each_operand(|op| {
                    rank = rank.max(self.avail_rank(op));
                });
                if !func.inst_data(inst).is_phi() {
                    rank += 1;
                }
                self.global_ranks.insert(inst, rank);
                self.max_rank = self.max_rank.max(rank);
                // The insertion point of this rank: past the instruction,
                // skipping the alloca prefix.
                let insts = &func.block(block).insts;
                let mut point = index + 1;
                while point < insts.len() && func.inst_data(insts[point]).is_alloca() {
                    point += 1;
                }
                if point < insts.len() {
                    self.insert_points.insert((block, rank), insts[point]);
                }
            }
        }
        // Every (block, rank) pair needs an insertion point, and points of
        // higher rank may never precede points of lower rank.
        for &block in &self.topsort {
            let terminator = func.terminator(block).expect("blocks have terminators");
            self.insert_points.entry((block, 0)).or_insert(terminator);
            for rank in 1..=self.max_rank {
                let prev = *self
                    .insert_points
                    .entry((block, rank - 1))
                    .or_insert(terminator);
                let current = *self.insert_points.entry((block, rank)).or_insert(terminator);
                if instruction_order.get(&current) < instruction_order.get(&prev) {
                    self.insert_points.insert((block, rank), prev);
                }
            }
        }
    }

    fn build_lct(&mut self, ctx: &Context, func: &mut Function, block: BlockId) {
        let mut lct = Lct::default();
        for inst in func.block(block).insts.clone() {
            if is_ignored(func.inst_data(inst)) || func.inst_data(inst).is_terminator() {
                continue;
            }
            let Some(rank) = self.global_ranks.get(&inst).copied() else {
                continue;
            };
            let Some(key) = comp_key(ctx, func.inst_data(inst)) else {
                continue;
            };
            if let Some(existing) = lct.insert_or_existing(rank, key, inst) {
                func.replace_all_uses(inst, Value::Local(existing));
                self.redundant.insert(inst);
                self.modified = true;
            }
        }
        self.lcts.insert(block, lct);
    }

    fn process_globally(&mut self, ctx: &mut Context, func: &mut Function) {
        for rank in 0..=self.max_rank {
            for &block in &self.topsort.clone() {
                if rank == 0 {
                    self.build_lct(ctx, func, block);
                }
                if self.loop_headers.contains(&block) {
                    self.process_header(ctx, func, rank, block);
                } else if self.landing_pads.contains(&block) {
                    self.process_landing_pad(ctx, func, rank, block);
                } else {
                    self.process_other(ctx, func, rank, block);
                }
            }
        }
    }

    fn process_header(&mut self, ctx: &mut Context, func: &mut Function, rank: usize, header: BlockId) {
        let succs = func.successors(header).to_vec();
        self.move_in(func, rank, header, &succs, None);
        let landing_pad = self.loops[&header].landing_pad;
        // Candidates movable out of the header: nothing defined in the
        // header itself may feed them.
        let movable: Vec<(CompKey, ValueId)> = self.lcts[&header]
            .of_rank(rank)
            .into_iter()
            .filter(|&(_, inst)| {
                !func.value(inst).dead && self.is_header_movable(func, inst, header)
            })
            .collect();
        for (_, inst) in movable {
            let copy = self.copy_and_phi_rename(func, inst, landing_pad);
            let key = comp_key(ctx, func.inst_data(copy)).expect("movable computations have keys");
            let rank_of = self.global_ranks[&inst];
            if let Some(surplus) = self
                .mcts
                .entry((landing_pad, header))
                .or_default()
                .insert(rank_of, key, copy, inst)
            {
                self.destroy_clone(func, surplus);
            }
        }
    }

    fn is_header_movable(&self, func: &Function, inst: ValueId, header: BlockId) -> bool {
        if is_ignored(func.inst_data(inst)) {
            return false;
        }
        let mut movable = true;
        func.inst_data(inst).for_each_operand(|op| {
            if let Some(op) = op.as_local() {
                if func.value(op).is_inst() && func.parent_block(op) == Some(header) {
                    movable = false;
                }
            }
        });
        movable
    }

    fn process_landing_pad(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        rank: usize,
        block: BlockId,
    ) {
        let header = func
            .single_successor(block)
            .expect("landing pads have exactly the header as successor");
        let loop_nodes = self.loops[&header].loop_nodes.clone();
        // Nothing that depends on values computed inside the loop may move
        // into the landing pad.
        let real_succs = [header];
        self.move_in(func, rank, block, &real_succs, Some(&loop_nodes));
        let virtual_succs = self.virtual_succs.get(&block).cloned().unwrap_or_default();
        self.move_in(func, rank, block, &virtual_succs, Some(&loop_nodes));
        self.move_out(ctx, func, rank, block);
    }

    fn process_other(&mut self, ctx: &mut Context, func: &mut Function, rank: usize, block: BlockId) {
        let succs = func.successors(block).to_vec();
        self.move_in(func, rank, block, &succs, None);
        self.move_out(ctx, func, rank, block);
    }

    /// Whether the entry's operands stay clear of the given loop, when
    /// moving into a landing pad.
    fn entry_condition(
        &self,
        func: &Function,
        copy: ValueId,
        forbidden: Option<&HashSet<BlockId>>,
    ) -> bool {
        let Some(forbidden) = forbidden else {
            return true;
        };
        let mut ok = true;
        func.inst_data(copy).for_each_operand(|op| {
            if let Some(op) = op.as_local() {
                if func.value(op).is_inst() {
                    if let Some(block) = func.parent_block(op) {
                        if forbidden.contains(&block) {
                            ok = false;
                        }
                    }
                }
            }
        });
        ok
    }

    /// Places an MCT entry in `block` (or folds it into an existing equal
    /// computation) and redirects all of the entry's originals to it.
    fn insert_into_lct_and_block(
        &mut self,
        func: &mut Function,
        block: BlockId,
        rank: usize,
        key: CompKey,
        copy: ValueId,
        originals: &[ValueId],
    ) -> ValueId {
        let lct = self.lcts.entry(block).or_default();
        let inst = match lct.insert_or_existing(rank, key, copy) {
            Some(existing) => {
                // A move-out phi may already reference the clone.
                func.replace_all_uses(copy, Value::Local(existing));
                self.destroy_clone(func, copy);
                existing
            }
            None => {
                self.global_ranks.insert(copy, rank);
                let point = self.insert_points[&(block, rank)];
                let index = func.index_in_block(point);
                func.place_inst(block, index, copy);
                self.modified = true;
                copy
            }
        };
        for &original in originals {
            if original != inst {
                func.replace_all_uses(original, Value::Local(inst));
                self.redundant.insert(original);
                self.modified = true;
            }
        }
        inst
    }

    fn move_in(
        &mut self,
        func: &mut Function,
        rank: usize,
        block: BlockId,
        succs: &[BlockId],
        forbidden: Option<&HashSet<BlockId>>,
    ) {
        match succs.len() {
            0 => {}
            1 => {
                let succ = succs[0];
                let Some(mct) = self.mcts.get_mut(&(block, succ)) else {
                    return;
                };
                let indices = mct.indices_of_rank(rank);
                let mut ready = Vec::new();
                for index in indices {
                    let entry = &mut self.mcts.get_mut(&(block, succ)).expect("present").entries
                        [index];
                    let copy = entry.copy;
                    let key = entry.key.clone();
                    let originals = entry.originals.clone();
                    if !self.entry_condition(func, copy, forbidden) {
                        continue;
                    }
                    self.mcts.get_mut(&(block, succ)).expect("present").entries[index].dead = true;
                    ready.push((key, copy, originals));
                }
                for (key, copy, originals) in ready {
                    self.insert_into_lct_and_block(func, block, rank, key, copy, &originals);
                }
                let surplus = self
                    .mcts
                    .get_mut(&(block, succ))
                    .expect("present")
                    .clear();
                for copy in surplus {
                    self.destroy_clone(func, copy);
                }
            }
            _ => {
                for &succ in succs {
                    let indices = match self.mcts.get(&(block, succ)) {
                        Some(mct) => mct.indices_of_rank(rank),
                        None => continue,
                    };
                    for index in indices {
                        let (key, copy, originals) = {
                            let entry = &self.mcts[&(block, succ)].entries[index];
                            if entry.dead {
                                continue;
                            }
                            (entry.key.clone(), entry.copy, entry.originals.clone())
                        };
                        if !self.entry_condition(func, copy, forbidden) {
                            continue;
                        }
                        // Motion across a branch requires the computation on
                        // every outgoing edge.
                        let all_others = func.successors(block).iter().all(|&other| {
                            other == succ
                                || self
                                    .mcts
                                    .get(&(block, other))
                                    .and_then(|m| m.find_key(&key))
                                    .is_some()
                        });
                        if !all_others {
                            continue;
                        }
                        self.mcts.get_mut(&(block, succ)).expect("present").entries[index].dead =
                            true;
                        let inst = self.insert_into_lct_and_block(
                            func, block, rank, key.clone(), copy, &originals,
                        );
                        for other in func.successors(block).to_vec() {
                            if other == succ {
                                continue;
                            }
                            let Some(other_index) = self
                                .mcts
                                .get(&(block, other))
                                .and_then(|m| m.find_key(&key))
                            else {
                                continue;
                            };
                            let (other_copy, other_originals) = {
                                let entry = &self.mcts[&(block, other)].entries[other_index];
                                (entry.copy, entry.originals.clone())
                            };
                            for original in other_originals {
                                if original != inst {
                                    func.replace_all_uses(original, Value::Local(inst));
                                    self.redundant.insert(original);
                                    self.modified = true;
                                }
                            }
                            self.mcts.get_mut(&(block, other)).expect("present").entries
                                [other_index]
                                .dead = true;
                            func.replace_all_uses(other_copy, Value::Local(inst));
                            self.destroy_clone(func, other_copy);
                        }
                    }
                }
            }
        }
    }

    fn move_out(&mut self, ctx: &mut Context, func: &mut Function, rank: usize, block: BlockId) {
        let movable: Vec<(CompKey, ValueId)> = self
            .lcts
            .entry(block)
            .or_default()
            .of_rank(rank)
            .into_iter()
            .filter(|&(_, inst)| !func.value(inst).dead && self.is_moveable(func, inst, block))
            .collect();
        let preds = func.predecessors(block).to_vec();
        match preds.len() {
            0 => {}
            1 => {
                let real_pred = preds[0];
                let mut all_preds = self.virtual_preds.get(&block).cloned().unwrap_or_default();
                all_preds.push(real_pred);
                for &pred in &all_preds {
                    for &(_, inst) in &movable {
                        let copy = self.copy_and_phi_rename(func, inst, real_pred);
                        let key =
                            comp_key(ctx, func.inst_data(copy)).expect("movable have keys");
                        if let Some(surplus) = self
                            .mcts
                            .entry((pred, block))
                            .or_default()
                            .insert(rank, key, copy, inst)
                        {
                            self.destroy_clone(func, surplus);
                        }
                    }
                }
            }
            _ => {
                // No critical edges: every predecessor has only this block
                // as successor, so everything put into the MCTs here is
                // guaranteed to be placed. That lets us phi the copies
                // together right away.
                debug_assert!(self
                    .virtual_preds
                    .get(&block)
                    .map_or(true, Vec::is_empty));
                for &(_, inst) in &movable {
                    let mut phi_args: smallvec::SmallVec<[(BlockId, Value); 2]> =
                        smallvec::SmallVec::new();
                    for &pred in &preds {
                        let copy = self.copy_and_phi_rename(func, inst, pred);
                        let key =
                            comp_key(ctx, func.inst_data(copy)).expect("movable have keys");
                        let arg = match self
                            .mcts
                            .entry((pred, block))
                            .or_default()
                            .insert(rank, key.clone(), copy, inst)
                        {
                            Some(surplus) => {
                                self.destroy_clone(func, surplus);
                                let index = self.mcts[&(pred, block)]
                                    .find_key(&key)
                                    .expect("just matched");
                                self.mcts[&(pred, block)].entries[index].copy
                            }
                            None => copy,
                        };
                        phi_args.push((pred, Value::Local(arg)));
                    }
                    let ty = func.local_type(inst);
                    let name = func.value(inst).name.clone().unwrap_or_default();
                    let phi =
                        func.insert_phi(block, InstData::Phi { args: phi_args }, ty, &name);
                    func.replace_all_uses(inst, Value::Local(phi));
                    self.modified = true;
                }
            }
        }
    }

    /// A computation can move across an edge when none of its operands are
    /// defined in its own block (phis are renamed across the edge instead).
    fn is_moveable(&self, func: &Function, inst: ValueId, block: BlockId) -> bool {
        if is_ignored(func.inst_data(inst)) {
            return false;
        }
        let mut movable = true;
        func.inst_data(inst).for_each_operand(|op| {
            if let Some(op) = op.as_local() {
                if func.value(op).is_inst()
                    && !func.inst_data(op).is_phi()
                    && func.parent_block(op) == Some(block)
                {
                    movable = false;
                }
            }
        });
        movable
    }

    /// Clones `inst`, substituting the incoming value of `pred` for every
    /// operand that is a phi of `inst`'s block.
    fn copy_and_phi_rename(&mut self, func: &mut Function, inst: ValueId, pred: BlockId) -> ValueId {
        let block = func.parent_block(inst).expect("placed");
        let copy = func.clone_inst(inst);
        self.clones.push(copy);
        for operand in func.inst_data(copy).operands() {
            let Some(op) = operand.as_local() else { continue };
            if !func.value(op).is_inst() || !func.inst_data(op).is_phi() {
                continue;
            }
            if func.parent_block(op) == Some(block) {
                let renamed = func
                    .phi_arg_for(op, pred)
                    .expect("pred is an incoming edge");
                func.update_operand(copy, operand, renamed);
            }
        }
        copy
    }

    fn destroy_clone(&mut self, func: &mut Function, clone: ValueId) {
        if !func.value(clone).dead && func.parent_block(clone).is_none() && func.is_unused(clone) {
            func.erase_inst(clone);
        }
    }

    fn clean(&mut self, func: &mut Function) {
        // Clones that never made it into a block go first: they still
        // reference (and thereby pin) instructions that became redundant.
        let mut stale: Vec<ValueId> = self
            .clones
            .iter()
            .copied()
            .filter(|&c| !func.value(c).dead && func.parent_block(c).is_none())
            .collect();
        loop {
            let mut progress = false;
            stale.retain(|&clone| {
                if func.is_unused(clone) {
                    func.erase_inst(clone);
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
        let mut remaining: Vec<ValueId> = self
            .redundant
            .iter()
            .copied()
            .filter(|&inst| !func.value(inst).dead)
            .collect();
        remaining.sort();
        loop {
            let mut progress = false;
            remaining.retain(|&inst| {
                if func.is_unused(inst) {
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
        debug_assert!(remaining.is_empty(), "redundant instructions must be unused");
    }

    /// Removes split-edge blocks that received no code. Blocks that kept
    /// moved-in computations stay and count as a modification.
    fn join_split_edges(&mut self, func: &mut Function) {
        let blocks: Vec<BlockId> = self.edge_split_blocks.iter().copied().collect();
        for block in blocks {
            if func.block(block).dead {
                self.edge_split_blocks.remove(&block);
                continue;
            }
            if !func.empty_except_terminator(block) {
                continue;
            }
            let (Some(pred), Some(succ)) = (
                func.single_predecessor(block),
                func.single_successor(block),
            ) else {
                continue;
            };
            func.update_target(pred, block, succ);
            func.update_predecessor(succ, block, pred);
            func.erase_block(block);
            self.edge_split_blocks.remove(&block);
        }
        self.modified |= !self.edge_split_blocks.is_empty();
    }
}
