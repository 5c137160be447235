//! The SCC call graph.
//!
//! A multigraph of the module's functions: one node per function, one edge
//! per (caller, callee) pair with the set of callsites on the edge. Direct
//! self-recursion is excluded from the graph; the inliner handles it
//! separately. On top of the function graph sit the strongly connected
//! components, themselves linked into a DAG.
//!
//! The graph supports one incremental update, [`SCCCallGraph::remove_call`]:
//! when inlining removes the last callsite of an edge, the edge disappears,
//! and if caller and callee are no longer mutually reachable inside their
//! SCC, the SCC splits. Splitting re-runs the component computation on the
//! subgraph of the old SCC, which may yield more than two components; the
//! result reports the components now holding the caller and the callee.

use hashbrown::{HashMap, HashSet};

use crate::ir::ir::{Callee, FuncId, InstData, Module, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SccId(pub usize);

struct FunctionNode {
    func: FuncId,
    callees: Vec<usize>,
    callers: Vec<usize>,
    callsites: HashMap<usize, HashSet<ValueId>>,
    scc: usize,
}

struct SccNode {
    members: Vec<usize>,
    succs: Vec<usize>,
    preds: Vec<usize>,
    live: bool,
}

pub struct SCCCallGraph {
    nodes: Vec<FunctionNode>,
    sccs: Vec<SccNode>,
    func_to_node: HashMap<FuncId, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveCallResult {
    /// The callsite was not the last one on the edge (or the edge was never
    /// in the graph, e.g. for a devirtualized call).
    None,
    /// The edge disappeared but the SCC structure is unchanged.
    RemovedEdge,
    /// The edge removal split an SCC.
    SplitScc { caller: SccId, callee: SccId },
}

impl SCCCallGraph {
    pub fn compute(module: &Module) -> SCCCallGraph {
        let mut graph = SCCCallGraph {
            nodes: Vec::new(),
            sccs: Vec::new(),
            func_to_node: HashMap::new(),
        };
        for index in 0..module.functions.len() {
            let id = FuncId(index as u32);
            graph.func_to_node.insert(id, index);
            graph.nodes.push(FunctionNode {
                func: id,
                callees: Vec::new(),
                callers: Vec::new(),
                callsites: HashMap::new(),
                scc: usize::MAX,
            });
        }
        for (index, func) in module.functions.iter().enumerate() {
            for inst in func.instructions() {
                let InstData::Call { callee, .. } = func.inst_data(inst) else {
                    continue;
                };
                let Callee::Function(target) = *callee else {
                    continue;
                };
                if target == FuncId(index as u32) {
                    continue;
                }
                let target_index = graph.func_to_node[&target];
                let node = &mut graph.nodes[index];
                node.callsites.entry(target_index).or_default().insert(inst);
                if !node.callees.contains(&target_index) {
                    node.callees.push(target_index);
                }
                let target_node = &mut graph.nodes[target_index];
                if !target_node.callers.contains(&index) {
                    target_node.callers.push(index);
                }
            }
        }
        let members: Vec<usize> = (0..graph.nodes.len()).collect();
        graph.compute_sccs_of(&members);
        graph
    }

    /// Tarjan over the subgraph induced by `domain`, appending the resulting
    /// components and rewiring SCC-level edges for them.
    fn compute_sccs_of(&mut self, domain: &[usize]) {
        let domain_set: HashSet<usize> = domain.iter().copied().collect();
        let mut index_of: HashMap<usize, usize> = HashMap::new();
        let mut lowlink: HashMap<usize, usize> = HashMap::new();
        let mut on_stack: HashSet<usize> = HashSet::new();
        let mut stack: Vec<usize> = Vec::new();
        let mut next_index = 0usize;
        let mut new_sccs: Vec<Vec<usize>> = Vec::new();

        // Iterative Tarjan with an explicit work stack.
        enum Frame {
            Enter(usize),
            Visit(usize, usize),
            /// Fold the finished child's lowlink into the parent's.
            Merge(usize, usize),
        }
        for &start in domain {
            if index_of.contains_key(&start) {
                continue;
            }
            let mut work = vec![Frame::Enter(start)];
            while let Some(frame) = work.pop() {
                match frame {
                    Frame::Enter(v) => {
                        index_of.insert(v, next_index);
                        lowlink.insert(v, next_index);
                        next_index += 1;
                        stack.push(v);
                        on_stack.insert(v);
                        work.push(Frame::Visit(v, 0));
                    }
                    Frame::Visit(v, child) => {
                        let callees: Vec<usize> = self.nodes[v]
                            .callees
                            .iter()
                            .copied()
                            .filter(|c| domain_set.contains(c))
                            .collect();
                        if child < callees.len() {
                            let next = callees[child];
                            work.push(Frame::Visit(v, child + 1));
                            if !index_of.contains_key(&next) {
                                work.push(Frame::Merge(v, next));
                                work.push(Frame::Enter(next));
                            } else if on_stack.contains(&next) {
                                let low = lowlink[&v].min(index_of[&next]);
                                lowlink.insert(v, low);
                            }
                        } else if lowlink[&v] == index_of[&v] {
                            let mut component = Vec::new();
                            while let Some(w) = stack.pop() {
                                on_stack.remove(&w);
                                component.push(w);
                                if w == v {
                                    break;
                                }
                            }
                            new_sccs.push(component);
                        }
                    }
                    Frame::Merge(v, child) => {
                        let low = lowlink[&v].min(lowlink[&child]);
                        lowlink.insert(v, low);
                    }
                }
            }
        }
        for members in new_sccs {
            let scc_index = self.sccs.len();
            for &m in &members {
                self.nodes[m].scc = scc_index;
            }
            self.sccs.push(SccNode {
                members,
                succs: Vec::new(),
                preds: Vec::new(),
                live: true,
            });
        }
        self.recompute_scc_edges();
    }

    /// Rebuilds SCC-level adjacency from the function-level edges.
    fn recompute_scc_edges(&mut self) {
        for scc in &mut self.sccs {
            scc.succs.clear();
            scc.preds.clear();
        }
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for node in &self.nodes {
            for &callee in &node.callees {
                let from = node.scc;
                let to = self.nodes[callee].scc;
                if from != to && !edges.contains(&(from, to)) {
                    edges.push((from, to));
                }
            }
        }
        for (from, to) in edges {
            self.sccs[from].succs.push(to);
            self.sccs[to].preds.push(from);
        }
    }

    pub fn scc_of(&self, func: FuncId) -> SccId {
        SccId(self.nodes[self.func_to_node[&func]].scc)
    }

    pub fn functions_in(&self, scc: SccId) -> Vec<FuncId> {
        self.sccs[scc.0]
            .members
            .iter()
            .map(|&n| self.nodes[n].func)
            .collect()
    }

    pub fn callees_of(&self, func: FuncId) -> Vec<FuncId> {
        self.nodes[self.func_to_node[&func]]
            .callees
            .iter()
            .map(|&n| self.nodes[n].func)
            .collect()
    }

    pub fn callers_of(&self, func: FuncId) -> Vec<FuncId> {
        self.nodes[self.func_to_node[&func]]
            .callers
            .iter()
            .map(|&n| self.nodes[n].func)
            .collect()
    }

    pub fn callsites(&self, caller: FuncId, callee: FuncId) -> Vec<ValueId> {
        let caller = self.func_to_node[&caller];
        let callee = self.func_to_node[&callee];
        self.nodes[caller]
            .callsites
            .get(&callee)
            .map(|set| {
                let mut v: Vec<ValueId> = set.iter().copied().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    pub fn scc_successors(&self, scc: SccId) -> Vec<SccId> {
        self.sccs[scc.0].succs.iter().map(|&s| SccId(s)).collect()
    }

    /// Live SCCs in bottom-up (callees-first) order.
    pub fn sccs_bottom_up(&self) -> Vec<SccId> {
        let live: Vec<usize> = (0..self.sccs.len())
            .filter(|&s| self.sccs[s].live)
            .collect();
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        fn visit(
            graph: &SCCCallGraph,
            scc: usize,
            visited: &mut HashSet<usize>,
            order: &mut Vec<SccId>,
        ) {
            if !visited.insert(scc) {
                return;
            }
            for &succ in &graph.sccs[scc].succs {
                visit(graph, succ, visited, order);
            }
            order.push(SccId(scc));
        }
        for scc in live {
            visit(self, scc, &mut visited, &mut order);
        }
        order
    }

    /// Removes the callsite `call_inst` of the edge `caller -> callee`.
    pub fn remove_call(
        &mut self,
        caller: FuncId,
        callee: FuncId,
        call_inst: ValueId,
    ) -> RemoveCallResult {
        let caller_n = self.func_to_node[&caller];
        let callee_n = self.func_to_node[&callee];
        if !self.nodes[caller_n].callees.contains(&callee_n) {
            // Calls devirtualized by local optimization were never edges.
            return RemoveCallResult::None;
        }
        let sites = self.nodes[caller_n]
            .callsites
            .get_mut(&callee_n)
            .expect("edge without callsites");
        sites.remove(&call_inst);
        if !sites.is_empty() {
            return RemoveCallResult::None;
        }
        self.nodes[caller_n].callsites.remove(&callee_n);
        self.nodes[caller_n].callees.retain(|&c| c != callee_n);
        self.nodes[callee_n].callers.retain(|&c| c != caller_n);
        let caller_scc = self.nodes[caller_n].scc;
        let callee_scc = self.nodes[callee_n].scc;
        if caller_scc != callee_scc {
            self.recompute_scc_edges();
            return RemoveCallResult::RemovedEdge;
        }
        // Same SCC: if both directions are still reachable within the SCC,
        // the component is intact.
        if self.reachable_within_scc(caller_n, callee_n) && self.reachable_within_scc(callee_n, caller_n)
        {
            return RemoveCallResult::RemovedEdge;
        }
        let members = std::mem::take(&mut self.sccs[caller_scc].members);
        self.sccs[caller_scc].live = false;
        self.compute_sccs_of(&members);
        RemoveCallResult::SplitScc {
            caller: self.scc_of(caller),
            callee: self.scc_of(callee),
        }
    }

    fn reachable_within_scc(&self, from: usize, to: usize) -> bool {
        let scc = self.nodes[from].scc;
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if !visited.insert(n) {
                continue;
            }
            for &succ in &self.nodes[n].callees {
                if self.nodes[succ].scc == scc {
                    stack.push(succ);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::context::Context;

    /// Builds `a -> b`, `b -> c`, `c -> b` (b and c mutually recursive).
    fn sample_module() -> (Context, Module) {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut module = Module::new();
        for (name, callee) in [("a", FuncId(1)), ("b", FuncId(2)), ("c", FuncId(1))] {
            let mut b = FunctionBuilder::new(&mut ctx, name, &[], i64t);
            b.add_new_block("entry");
            let r = b.call(Callee::Function(callee), &[], i64t, "r");
            b.ret(r);
            module.add_function(b.finish());
        }
        (ctx, module)
    }

    #[test]
    fn test_scc_construction() {
        let (_ctx, module) = sample_module();
        let graph = SCCCallGraph::compute(&module);
        let a = FuncId(0);
        let b = FuncId(1);
        let c = FuncId(2);
        assert_ne!(graph.scc_of(a), graph.scc_of(b));
        assert_eq!(graph.scc_of(b), graph.scc_of(c));
        assert_eq!(graph.callees_of(a), vec![b]);
        let order = graph.sccs_bottom_up();
        let pos_a = order.iter().position(|&s| s == graph.scc_of(a)).unwrap();
        let pos_b = order.iter().position(|&s| s == graph.scc_of(b)).unwrap();
        assert!(pos_b < pos_a, "callee SCC comes before caller SCC");
    }

    #[test]
    fn test_remove_call_splits_scc() {
        let (_ctx, module) = sample_module();
        let mut graph = SCCCallGraph::compute(&module);
        let b = FuncId(1);
        let c = FuncId(2);
        let sites = graph.callsites(c, b);
        assert_eq!(sites.len(), 1);
        let result = graph.remove_call(c, b, sites[0]);
        match result {
            RemoveCallResult::SplitScc { caller, callee } => {
                assert_ne!(caller, callee);
                assert_eq!(graph.functions_in(caller), vec![c]);
                assert_eq!(graph.functions_in(callee), vec![b]);
            }
            other => panic!("expected SplitScc, got {other:?}"),
        }
    }
}
