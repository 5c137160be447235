//! Transformation passes and the pass registry.
//!
//! Every pass registers itself by name and category; the registry is built
//! once at startup by the per-module registration functions and is read-only
//! afterwards. The pipeline executor walks the registry by name, so drivers
//! can assemble pass sequences from strings.

use std::sync::OnceLock;

use crate::ir::context::Context;
use crate::ir::ir::{FuncId, Module};

pub mod access_tree;
pub mod cfg_simplify;
pub mod common;
pub mod dce;
pub mod gvn;
pub mod instcombine;
pub mod mem2reg;
pub mod member_tree;
pub mod pointer_analysis;
pub mod rematerialize;
pub mod sroa;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassCategory {
    Analysis,
    Simplification,
    Experimental,
    Other,
}

pub type PassFn = fn(&mut Context, &mut Module, FuncId) -> bool;

pub struct Pass {
    pub name: &'static str,
    pub category: PassCategory,
    pub run: PassFn,
}

#[derive(Default)]
pub struct PassRegistry {
    passes: Vec<Pass>,
}

impl PassRegistry {
    pub fn add(&mut self, pass: Pass) {
        debug_assert!(
            self.passes.iter().all(|p| p.name != pass.name),
            "pass registered twice: {}",
            pass.name
        );
        self.passes.push(pass);
    }

    pub fn find(&self, name: &str) -> Option<&Pass> {
        self.passes.iter().find(|p| p.name == name)
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }
}

static REGISTRY: OnceLock<PassRegistry> = OnceLock::new();

/// The process-wide pass registry. Populated on first access; write-once.
pub fn registry() -> &'static PassRegistry {
    REGISTRY.get_or_init(|| {
        let mut r = PassRegistry::default();
        mem2reg::register(&mut r);
        sroa::register(&mut r);
        instcombine::register(&mut r);
        gvn::register(&mut r);
        dce::register(&mut r);
        cfg_simplify::register(&mut r);
        pointer_analysis::register(&mut r);
        rematerialize::register(&mut r);
        r.add(Pass {
            name: "splitcriticaledges",
            category: PassCategory::Simplification,
            run: |ctx, module, id| {
                module.with_function(id, |_, func| common::split_critical_edges(ctx, func))
            },
        });
        r
    })
}

/// Runs the registered pass `name` on one function.
pub fn run_pass(name: &str, ctx: &mut Context, module: &mut Module, func: FuncId) -> bool {
    let pass = registry()
        .find(name)
        .unwrap_or_else(|| panic!("unknown pass: {name}"));
    (pass.run)(ctx, module, func)
}

/// Rounds of the default pipeline. One round is usually enough; the cap
/// bounds pathological ping-ponging between passes.
const MAX_PIPELINE_ROUNDS: usize = 4;

const DEFAULT_PIPELINE: &[&str] = &[
    "memtoreg",
    "sroa",
    "ptranalysis",
    "instcombine",
    "simplifycfg",
    "gvn",
    "instcombine",
    "dce",
    "simplifycfg",
];

/// Runs the default optimization pipeline on one function to a bounded
/// fixed point.
pub fn optimize_function(ctx: &mut Context, module: &mut Module, func: FuncId) -> bool {
    let mut modified = false;
    for _ in 0..MAX_PIPELINE_ROUNDS {
        let mut round = false;
        for name in DEFAULT_PIPELINE {
            round |= run_pass(name, ctx, module, func);
        }
        modified |= round;
        if !round {
            break;
        }
    }
    modified
}

/// Runs the default pipeline over every function of the module.
pub fn optimize(ctx: &mut Context, module: &mut Module) -> bool {
    let mut modified = false;
    for id in module.func_ids() {
        modified |= optimize_function(ctx, module, id);
    }
    modified
}
