//! Dominance and post-dominance.
//!
//! Computed with the classic iterative data-flow formulation over dominator
//! sets; the immediate-dominator tree and dominance frontiers are derived
//! from the sets. Post-dominance runs the same computation on the reversed
//! CFG with a virtual sink behind all exit blocks, so functions with several
//! returns (or none) need no special casing at the call sites.
//!
//! Results are cached on the function and must be invalidated atomically
//! with any CFG edit (`Function::invalidate_cfg_info`).

use hashbrown::{HashMap, HashSet};

use crate::ir::ir::{BlockId, Function};

pub struct DominanceInfo {
    dom_sets: HashMap<BlockId, HashSet<BlockId>>,
    idom: HashMap<BlockId, Option<BlockId>>,
    children: HashMap<BlockId, Vec<BlockId>>,
    frontier: HashMap<BlockId, Vec<BlockId>>,
    roots: Vec<BlockId>,
}

impl DominanceInfo {
    /// Dominance over the forward CFG, rooted at the entry block.
    pub fn compute(func: &Function) -> DominanceInfo {
        let mut reachable = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![func.entry()];
        seen.insert(func.entry());
        while let Some(block) = stack.pop() {
            reachable.push(block);
            for succ in func.successors(block) {
                if seen.insert(succ) {
                    stack.push(succ);
                }
            }
        }
        let preds: HashMap<BlockId, Vec<BlockId>> = reachable
            .iter()
            .map(|&b| {
                let ps = func
                    .predecessors(b)
                    .iter()
                    .copied()
                    .filter(|p| seen.contains(p))
                    .collect();
                (b, ps)
            })
            .collect();
        Self::compute_impl(reachable, preds, vec![func.entry()])
    }

    /// Dominance over the reversed CFG. Roots are the exit blocks; blocks
    /// that cannot reach an exit are absent from the result. A function
    /// without exits yields an empty analysis.
    pub fn compute_post(func: &Function) -> DominanceInfo {
        let exits: Vec<BlockId> = func
            .block_ids()
            .into_iter()
            .filter(|&b| func.successors(b).is_empty())
            .collect();
        // Restrict to blocks that reach an exit.
        let mut seen: HashSet<BlockId> = exits.iter().copied().collect();
        let mut stack = exits.clone();
        let mut nodes = Vec::new();
        while let Some(block) = stack.pop() {
            nodes.push(block);
            for &pred in func.predecessors(block) {
                if seen.insert(pred) {
                    stack.push(pred);
                }
            }
        }
        let preds: HashMap<BlockId, Vec<BlockId>> = nodes
            .iter()
            .map(|&b| {
                let ps = func
                    .successors(b)
                    .into_iter()
                    .filter(|s| seen.contains(s))
                    .collect();
                (b, ps)
            })
            .collect();
        Self::compute_impl(nodes, preds, exits)
    }

    fn compute_impl(
        nodes: Vec<BlockId>,
        preds: HashMap<BlockId, Vec<BlockId>>,
        roots: Vec<BlockId>,
    ) -> DominanceInfo {
        let all: HashSet<BlockId> = nodes.iter().copied().collect();
        let root_set: HashSet<BlockId> = roots.iter().copied().collect();
        let mut dom_sets: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
        for &b in &nodes {
            if root_set.contains(&b) {
                dom_sets.insert(b, HashSet::from_iter([b]));
            } else {
                dom_sets.insert(b, all.clone());
            }
        }
        let mut changed = true;
        while changed {
            changed = false;
            for &b in &nodes {
                if root_set.contains(&b) {
                    continue;
                }
                let mut new_set: Option<HashSet<BlockId>> = None;
                for &p in &preds[&b] {
                    let pset = &dom_sets[&p];
                    new_set = Some(match new_set {
                        None => pset.clone(),
                        Some(acc) => acc.intersection(pset).copied().collect(),
                    });
                }
                let mut new_set = new_set.unwrap_or_default();
                new_set.insert(b);
                if new_set != dom_sets[&b] {
                    dom_sets.insert(b, new_set);
                    changed = true;
                }
            }
        }
        // Immediate dominators: the strict dominator whose own set is one
        // element smaller.
        let mut idom: HashMap<BlockId, Option<BlockId>> = HashMap::new();
        for &b in &nodes {
            if root_set.contains(&b) {
                idom.insert(b, None);
                continue;
            }
            let set = &dom_sets[&b];
            let mut best = None;
            for &d in set {
                if d == b {
                    continue;
                }
                if dom_sets[&d].len() == set.len() - 1 {
                    best = Some(d);
                    break;
                }
            }
            idom.insert(b, best);
        }
        let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for &b in &nodes {
            if let Some(Some(parent)) = idom.get(&b) {
                children.entry(*parent).or_default().push(b);
            }
        }
        for list in children.values_mut() {
            list.sort();
        }
        // Dominance frontiers via the runner construction.
        let mut frontier: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
        for &b in &nodes {
            let bpreds = &preds[&b];
            if bpreds.len() < 2 {
                continue;
            }
            let target = idom[&b];
            for &p in bpreds {
                let mut runner = Some(p);
                while runner != target {
                    let Some(r) = runner else { break };
                    frontier.entry(r).or_default().insert(b);
                    runner = idom.get(&r).copied().flatten();
                }
            }
        }
        let frontier = frontier
            .into_iter()
            .map(|(b, set)| {
                let mut v: Vec<BlockId> = set.into_iter().collect();
                v.sort();
                (b, v)
            })
            .collect();
        DominanceInfo {
            dom_sets,
            idom,
            children,
            frontier,
            roots,
        }
    }

    /// Whether the analysis covers no blocks (post-dominance of an exitless
    /// function).
    pub fn is_empty(&self) -> bool {
        self.dom_sets.is_empty()
    }

    /// Whether `block` is part of the analysis domain.
    pub fn contains(&self, block: BlockId) -> bool {
        self.dom_sets.contains_key(&block)
    }

    /// The set of blocks dominating `block`, including itself.
    pub fn dominator_set(&self, block: BlockId) -> &HashSet<BlockId> {
        &self.dom_sets[&block]
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.dom_sets
            .get(&b)
            .is_some_and(|set| set.contains(&a))
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// The dominance frontier of `block`.
    pub fn dom_front(&self, block: BlockId) -> &[BlockId] {
        self.frontier.get(&block).map_or(&[], Vec::as_slice)
    }

    /// Immediate dominator, or `None` for tree roots (the entry block, or
    /// exit blocks whose immediate post-dominator is the virtual sink).
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied().flatten()
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map_or(&[], Vec::as_slice)
    }

    pub fn roots(&self) -> &[BlockId] {
        &self.roots
    }

    /// Dominator-tree preorder over all roots.
    pub fn preorder(&self) -> Vec<BlockId> {
        let mut result = Vec::new();
        let mut stack: Vec<BlockId> = self.roots.iter().rev().copied().collect();
        while let Some(block) = stack.pop() {
            result.push(block);
            for &child in self.children(block).iter().rev() {
                stack.push(child);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::context::Context;
    use crate::ir::ir::Value;

    /// entry -> (then | other) -> join -> exit
    fn diamond() -> (Context, Function, [BlockId; 4]) {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i1], i64t);
        let entry = b.add_new_block("entry");
        let then_b = b.func.add_block("then");
        let else_b = b.func.add_block("else");
        let join = b.func.add_block("join");
        b.select_block(entry);
        let cond = b.param(0);
        b.branch(cond, then_b, else_b);
        b.select_block(then_b);
        b.goto(join);
        b.select_block(else_b);
        b.goto(join);
        b.select_block(join);
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        b.ret(zero);
        let f = b.finish();
        (ctx, f, [entry, then_b, else_b, join])
    }

    #[test]
    fn test_diamond_dominance() {
        let (_ctx, f, [entry, then_b, else_b, join]) = diamond();
        let dom = DominanceInfo::compute(&f);
        assert!(dom.dominates(entry, join));
        assert!(!dom.dominates(then_b, join));
        assert_eq!(dom.idom(join), Some(entry));
        assert_eq!(dom.idom(then_b), Some(entry));
        assert_eq!(dom.dom_front(then_b), &[join]);
        assert_eq!(dom.dom_front(else_b), &[join]);
        assert!(dom.dom_front(entry).is_empty());
    }

    #[test]
    fn test_diamond_post_dominance() {
        let (_ctx, f, [entry, then_b, _else_b, join]) = diamond();
        let postdom = DominanceInfo::compute_post(&f);
        assert!(postdom.dominates(join, entry));
        assert!(postdom.dominates(join, then_b));
        assert_eq!(postdom.idom(entry), Some(join));
        assert_eq!(postdom.idom(join), None);
        // The reverse dominance frontier of a branch arm is the branch block.
        assert_eq!(postdom.dom_front(then_b), &[entry]);
    }

    #[test]
    fn test_exitless_function_has_empty_postdom() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "spin", &[], i64t);
        let entry = b.add_new_block("entry");
        b.goto(entry);
        let f = b.finish();
        let postdom = DominanceInfo::compute_post(&f);
        assert!(postdom.is_empty());
    }
}
