//! Loop nesting forest and loop-closed SSA form.
//!
//! The forest is derived from the dominator tree and the back edges of the
//! CFG: the target of a back edge (an edge whose target dominates its
//! source) is a loop header, the loop body is the natural loop of its
//! latches, and loops nest by containment. Every basic block corresponds to
//! one forest node; a node is a "proper" loop if it heads one.
//!
//! [`LoopInfo`] captures the derived structure of a single loop: entering
//! blocks, latches, exiting and exit blocks, the loop-closing phi map filled
//! in by [`make_lcssa`], and the induction variables recognized by scalar
//! evolution.

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use crate::analysis::domtree::DominanceInfo;
use crate::analysis::scev::ScevExpr;
use crate::ir::ir::{BlockId, Function, InstData, Value, ValueId};

pub struct LoopNestingForest {
    /// Innermost proper loop enclosing the block, if any. A header's parent
    /// is the next loop out, never itself.
    parent: HashMap<BlockId, Option<BlockId>>,
    /// Blocks directly inside each header's loop (including nested headers).
    children: HashMap<BlockId, Vec<BlockId>>,
    headers: HashSet<BlockId>,
    roots: Vec<BlockId>,
}

impl LoopNestingForest {
    pub fn compute(func: &Function, dom: &DominanceInfo) -> LoopNestingForest {
        // Back edges and natural loop membership.
        let mut members: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
        for block in func.block_ids() {
            if !dom.contains(block) {
                continue;
            }
            for succ in func.successors(block) {
                if dom.dominates(succ, block) {
                    let set = members.entry(succ).or_insert_with(|| {
                        let mut s = HashSet::new();
                        s.insert(succ);
                        s
                    });
                    // Walk predecessors from the latch up to the header.
                    let mut stack = vec![block];
                    while let Some(b) = stack.pop() {
                        if !set.insert(b) {
                            continue;
                        }
                        for &pred in func.predecessors(b) {
                            if dom.contains(pred) && !set.contains(&pred) {
                                stack.push(pred);
                            }
                        }
                    }
                }
            }
        }
        let headers: HashSet<BlockId> = members.keys().copied().collect();
        // Innermost containment: smaller loops are nested inside larger ones.
        let mut by_size: Vec<(BlockId, usize)> =
            members.iter().map(|(&h, set)| (h, set.len())).collect();
        by_size.sort_by_key(|&(h, size)| (size, h));
        let mut parent: HashMap<BlockId, Option<BlockId>> = HashMap::new();
        for block in func.block_ids() {
            let innermost = by_size
                .iter()
                .find(|&&(h, _)| h != block && members[&h].contains(&block))
                .map(|&(h, _)| h);
            parent.insert(block, innermost);
        }
        let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        let mut roots = Vec::new();
        for block in func.block_ids() {
            match parent[&block] {
                Some(header) => children.entry(header).or_default().push(block),
                None => roots.push(block),
            }
        }
        LoopNestingForest {
            parent,
            children,
            headers,
            roots,
        }
    }

    /// Whether `block` heads an actual loop (it has forest children or a
    /// back edge onto itself).
    pub fn is_proper_loop(&self, block: BlockId) -> bool {
        self.headers.contains(&block)
    }

    /// Whether `block` belongs to the loop headed by `header` (the header
    /// itself included).
    pub fn is_loop_node_of(&self, block: BlockId, header: BlockId) -> bool {
        let mut current = Some(block);
        while let Some(b) = current {
            if b == header {
                return true;
            }
            current = self.parent.get(&b).copied().flatten();
        }
        false
    }

    /// Innermost enclosing proper loop.
    pub fn enclosing_loop(&self, block: BlockId) -> Option<BlockId> {
        self.parent.get(&block).copied().flatten()
    }

    pub fn headers(&self) -> &HashSet<BlockId> {
        &self.headers
    }

    pub fn children_of(&self, header: BlockId) -> &[BlockId] {
        self.children.get(&header).map_or(&[], Vec::as_slice)
    }

    pub fn roots(&self) -> &[BlockId] {
        &self.roots
    }

    /// Headers ordered outermost first.
    pub fn headers_preorder(&self) -> Vec<BlockId> {
        let mut result: Vec<BlockId> = self.headers.iter().copied().collect();
        result.sort_by_key(|&h| (self.depth(h), h));
        result
    }

    fn depth(&self, block: BlockId) -> usize {
        let mut depth = 0;
        let mut current = self.parent.get(&block).copied().flatten();
        while let Some(b) = current {
            depth += 1;
            current = self.parent.get(&b).copied().flatten();
        }
        depth
    }
}

/// Derived metadata of a single loop.
pub struct LoopInfo {
    pub header: BlockId,
    pub inner_blocks: HashSet<BlockId>,
    pub entering_blocks: HashSet<BlockId>,
    pub latches: HashSet<BlockId>,
    pub exiting_blocks: HashSet<BlockId>,
    pub exit_blocks: HashSet<BlockId>,
    /// Maps `(exit block, loop instruction)` to the phi that closes the
    /// instruction's value at that exit. Filled by [`make_lcssa`].
    pub loop_closing_phis: HashMap<(BlockId, ValueId), ValueId>,
    /// Header phis recognized as induction variables, with their recurrences.
    pub induction_vars: Vec<ValueId>,
    pub scev_exprs: HashMap<ValueId, ScevExpr>,
}

impl LoopInfo {
    pub fn compute(func: &Function, dom: &DominanceInfo, header: BlockId) -> LoopInfo {
        let mut inner = HashSet::new();
        inner.insert(header);
        for &pred in func.predecessors(header) {
            if !dom.contains(pred) || !dom.dominates(header, pred) {
                continue;
            }
            let mut stack = vec![pred];
            while let Some(b) = stack.pop() {
                if !inner.insert(b) {
                    continue;
                }
                if b == header {
                    continue;
                }
                for &p in func.predecessors(b) {
                    if p != header && !inner.contains(&p) {
                        stack.push(p);
                    }
                }
            }
        }
        let mut entering = HashSet::new();
        let mut latches = HashSet::new();
        for &pred in func.predecessors(header) {
            if inner.contains(&pred) {
                latches.insert(pred);
            } else {
                entering.insert(pred);
            }
        }
        let mut exiting = HashSet::new();
        let mut exits = HashSet::new();
        for &block in &inner {
            for succ in func.successors(block) {
                if !inner.contains(&succ) {
                    exiting.insert(block);
                    exits.insert(succ);
                }
            }
        }
        LoopInfo {
            header,
            inner_blocks: inner,
            entering_blocks: entering,
            latches,
            exiting_blocks: exiting,
            exit_blocks: exits,
            loop_closing_phis: HashMap::new(),
            induction_vars: Vec::new(),
            scev_exprs: HashMap::new(),
        }
    }

    pub fn is_inner(&self, block: BlockId) -> bool {
        self.inner_blocks.contains(&block)
    }

    pub fn is_latch(&self, block: BlockId) -> bool {
        self.latches.contains(&block)
    }

    pub fn is_exit(&self, block: BlockId) -> bool {
        self.exit_blocks.contains(&block)
    }

    pub fn loop_closing_phi(&self, exit: BlockId, inst: ValueId) -> Option<ValueId> {
        self.loop_closing_phis.get(&(exit, inst)).copied()
    }
}

/// Rewrites `func` into loop-closed SSA form: every value defined inside a
/// loop and used outside it passes through a phi in an exit block. Returns
/// whether the function changed.
pub fn make_lcssa(func: &mut Function) -> bool {
    let dom = func.get_or_compute_dom_info();
    let lnf = func.get_or_compute_lnf();
    let mut modified = false;
    for header in lnf.headers_preorder() {
        let mut info = LoopInfo::compute(func, &dom, header);
        modified |= make_lcssa_loop(func, &mut info);
    }
    modified
}

/// LCSSA for a single loop. Closing phis are placed in exit blocks whose
/// predecessors all lie inside the loop (GVN and SROA split critical edges,
/// which establishes this shape); uses not dominated by any such exit keep
/// their original operand.
pub fn make_lcssa_loop(func: &mut Function, info: &mut LoopInfo) -> bool {
    let dom = func.get_or_compute_dom_info();
    let mut modified = false;
    let mut inner_blocks: Vec<BlockId> = info.inner_blocks.iter().copied().collect();
    inner_blocks.sort();
    for block in inner_blocks {
        for inst in func.block(block).insts.clone() {
            if func.value(inst).uses.is_empty() {
                continue;
            }
            // Collect the outside uses: (user, block the use lives in).
            let mut outside_uses: Vec<(ValueId, BlockId)> = Vec::new();
            for user in func.users(inst) {
                let Some(user_block) = func.parent_block(user) else {
                    continue;
                };
                if let InstData::Phi { args } = func.inst_data(user) {
                    for &(pred, value) in args.clone().iter() {
                        if value == Value::Local(inst) && !info.is_inner(pred) {
                            // A use through a phi is located at the end of
                            // the predecessor block.
                            outside_uses.push((user, pred));
                        }
                    }
                } else if !info.is_inner(user_block) {
                    outside_uses.push((user, user_block));
                }
            }
            // Drop uses by phis we inserted as closing phis for this value.
            outside_uses.retain(|(user, _)| {
                !info
                    .loop_closing_phis
                    .iter()
                    .any(|(_, &phi)| phi == *user)
            });
            if outside_uses.is_empty() {
                continue;
            }
            let ty = func.local_type(inst);
            let mut exits: Vec<BlockId> = info.exit_blocks.iter().copied().collect();
            exits.sort();
            for exit in exits {
                if info.loop_closing_phis.contains_key(&(exit, inst)) {
                    continue;
                }
                let preds = func.predecessors(exit).to_vec();
                if preds.is_empty() || !preds.iter().all(|p| info.is_inner(*p)) {
                    continue;
                }
                let args: SmallVec<[(BlockId, Value); 2]> =
                    preds.iter().map(|&p| (p, Value::Local(inst))).collect();
                let name = func
                    .value(inst)
                    .name
                    .clone()
                    .unwrap_or_default();
                let phi = func.insert_phi(
                    exit,
                    InstData::Phi { args },
                    ty,
                    &format!("{name}.lcssa"),
                );
                info.loop_closing_phis.insert((exit, inst), phi);
                modified = true;
            }
            for (user, use_block) in outside_uses {
                let closing = info.loop_closing_phis.iter().find(|(&(exit, i), _)| {
                    i == inst && (exit == use_block || dom.dominates(exit, use_block))
                });
                let Some((_, &phi)) = closing else { continue };
                if phi == user {
                    continue;
                }
                if func.inst_data(user).is_phi() {
                    // Rewrite only the slot of this incoming edge; other
                    // slots of the same phi may be in-loop uses.
                    let slot = func
                        .phi_args(user)
                        .iter()
                        .position(|&(pred, value)| {
                            pred == use_block && value == Value::Local(inst)
                        });
                    if let Some(slot) = slot {
                        func.set_operand(user, slot, Value::Local(phi));
                        modified = true;
                    }
                } else {
                    func.update_operand(user, Value::Local(inst), Value::Local(phi));
                    modified = true;
                }
            }
        }
    }
    modified
}
