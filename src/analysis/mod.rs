//! Analyses over the SSA IR.
//!
//! Everything here is a pure computation: results are cached on the owning
//! function (dominance, loop nesting) or held by the caller (call graph,
//! loop info) and invalidated when the CFG changes.

pub mod callgraph;
pub mod domtree;
pub mod loops;
pub mod scev;

pub use callgraph::{RemoveCallResult, SCCCallGraph, SccId};
pub use domtree::DominanceInfo;
pub use loops::{make_lcssa, LoopInfo, LoopNestingForest};
pub use scev::ScevExpr;
