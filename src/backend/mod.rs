//! Lowering to the machine IR and the MIR cleanup passes.

pub mod calling_convention;
pub mod inst_simplify;
pub mod jump_elision;
pub mod lower;
pub mod mir;
pub mod static_data;

use crate::ir::context::Context;
use crate::ir::ir::Module;
use mir::MirModule;

/// Lowers the optimized module to MIR and runs the MIR post passes:
/// instruction simplification and jump elision.
pub fn codegen(ctx: &Context, module: &Module) -> MirModule {
    let mut mir = lower::lower_to_mir(ctx, module);
    for func in &mut mir.functions {
        inst_simplify::inst_simplify(func);
        jump_elision::elide_jumps(func);
    }
    mir
}
