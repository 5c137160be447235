//! Rematerialization of address computations.
//!
//! Geps used in other blocks are re-emitted directly in front of each such
//! user, so register allocation does not have to carry the computed address
//! across block boundaries. A gep with a single user moves; one with several
//! users is cloned per remote user. Phi users are left untouched: sinking
//! into a phi argument would place the computation in a predecessor block
//! where it executes speculatively.

use crate::ir::context::Context;
use crate::ir::ir::{FuncId, InstData, Module, Value};
use crate::ir::validate::assert_invariants;
use crate::passes::{Pass, PassCategory, PassRegistry};

pub(crate) fn register(registry: &mut PassRegistry) {
    registry.add(Pass {
        name: "rematerialize",
        category: PassCategory::Experimental,
        run: rematerialize,
    });
}

pub fn rematerialize(ctx: &mut Context, module: &mut Module, id: FuncId) -> bool {
    module.with_function(id, |module, func| {
        let mut modified = false;
        for inst in func.instructions() {
            if func.value(inst).dead {
                continue;
            }
            if !matches!(func.inst_data(inst), InstData::Gep { .. }) {
                continue;
            }
            let parent = func.parent_block(inst).expect("placed");
            let users = func.users(inst);
            for user in users {
                if func.parent_block(user) == Some(parent) {
                    continue;
                }
                if func.inst_data(user).is_phi() {
                    continue;
                }
                modified = true;
                if func.users(inst).len() == 1 {
                    // Sole user: move the gep itself.
                    func.extract_inst(inst);
                    let block = func.parent_block(user).expect("placed");
                    let index = func.index_in_block(user);
                    func.place_inst(block, index, inst);
                    break;
                }
                let copy = func.clone_inst(inst);
                let block = func.parent_block(user).expect("placed");
                let index = func.index_in_block(user);
                func.place_inst(block, index, copy);
                func.update_operand(user, Value::Local(inst), Value::Local(copy));
            }
        }
        if modified {
            assert_invariants(ctx, module, func);
        }
        modified
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;

    #[test]
    fn test_gep_moves_to_remote_user() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        let entry = b.add_new_block("entry");
        let next = b.func.add_block("next");
        b.select_block(entry);
        let arr = ctx_array(&mut b, i64t);
        let a = b.alloca(arr, "a");
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        let p = b.gep(i64t, a, one, &[], "p");
        b.store(p, zero);
        b.goto(next);
        b.select_block(next);
        let v = b.load(p, i64t, "v");
        b.ret(v);
        let mut module = Module::new();
        let id = module.add_function(b.finish());
        assert!(rematerialize(&mut ctx, &mut module, id));
        let f = module.function(id);
        // The remote load got its own copy of the gep, directly before it.
        let load = f
            .block(next)
            .insts
            .iter()
            .copied()
            .find(|&i| matches!(f.inst_data(i), InstData::Load { .. }))
            .unwrap();
        let InstData::Load { addr } = *f.inst_data(load) else {
            panic!()
        };
        let addr = addr.as_local().unwrap();
        assert_eq!(f.parent_block(addr), Some(next));
        assert!(matches!(f.inst_data(addr), InstData::Gep { .. }));
    }

    fn ctx_array(
        b: &mut FunctionBuilder<'_>,
        elem: crate::ir::types::TypeId,
    ) -> crate::ir::types::TypeId {
        b.ctx.array_type(elem, 4)
    }
}
