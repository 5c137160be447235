//! IR invariant checking.
//!
//! `validate_function` re-derives dominance from scratch and checks every
//! structural invariant of the data model; `assert_invariants` is the
//! panicking form transformation passes run after mutating a function. A
//! failure here always means a compiler bug, so the error carries the
//! offending declaration and the full function dump for inspection.

use hashbrown::{HashMap, HashSet};

use crate::analysis::domtree::DominanceInfo;
use crate::common::error::{InvariantError, ValidationResult};
use crate::ir::context::Context;
use crate::ir::ir::{Callee, CompareMode, Function, InstData, Module, Value, ValueId};
use crate::ir::print::{value_decl, Printer};

struct Checker<'a> {
    ctx: &'a Context,
    module: &'a Module,
    func: &'a Function,
    dom: DominanceInfo,
}

impl<'a> Checker<'a> {
    fn fail(&self, decl: String, message: impl Into<String>) -> ValidationResult {
        let dump = Printer::with_module(self.ctx, self.func, self.module).function_to_string();
        Err(Box::new(InvariantError::new(message, decl, dump)))
    }

    fn check_value(&self, id: ValueId, condition: bool, message: &str) -> ValidationResult {
        if condition {
            return Ok(());
        }
        self.fail(value_decl(self.ctx, self.func, id), message.to_string())
    }

    fn run(&self) -> ValidationResult {
        let func = self.func;
        let blocks = func.block_ids();
        if blocks.is_empty() {
            return self.fail(format!("@{}", func.name), "empty functions are invalid");
        }
        let mut names: HashMap<&str, ValueId> = HashMap::new();
        for block in blocks {
            self.check_block(block)?;
            for &inst in &func.block(block).insts {
                self.check_inst(inst, &mut names)?;
            }
        }
        Ok(())
    }

    fn check_block(&self, block: crate::ir::ir::BlockId) -> ValidationResult {
        let func = self.func;
        let data = func.block(block);
        let decl = || format!("%{}", data.name);
        if data.insts.is_empty() {
            return self.fail(decl(), "basic blocks must end with a terminator");
        }
        let mut found_non_phi = false;
        let mut found_non_alloca = false;
        for (index, &inst) in data.insts.iter().enumerate() {
            let inst_data = func.inst_data(inst);
            if func.value(inst).dead {
                return self.check_value(inst, false, "dead instruction left in block");
            }
            if func.parent_block(inst) != Some(block) {
                return self.check_value(inst, false, "parent pointers must be set up correctly");
            }
            if inst_data.is_phi() {
                self.check_value(
                    inst,
                    !found_non_phi,
                    "phi nodes must form a prefix of their block",
                )?;
                self.check_value(
                    inst,
                    block != func.entry(),
                    "phi nodes may not appear in the entry block",
                )?;
            } else {
                found_non_phi = true;
            }
            if inst_data.is_alloca() {
                self.check_value(
                    inst,
                    !found_non_alloca,
                    "allocas must form a prefix of the entry block",
                )?;
                self.check_value(inst, block == func.entry(), "allocas belong in the entry block")?;
            } else {
                found_non_alloca = true;
            }
            let is_last = index + 1 == data.insts.len();
            self.check_value(
                inst,
                inst_data.is_terminator() == is_last,
                "the last instruction must be the one and only terminator",
            )?;
        }
        let term = func.terminator(block).expect("checked above");
        if let InstData::Return { value } = func.inst_data(term) {
            let ty = func.value_type(*value, self.ctx);
            self.check_value(
                term,
                ty == func.return_type,
                "returned type must match the function's return type",
            )?;
        }
        for &pred in func.predecessors(block) {
            if !func.successors(pred).contains(&block) {
                return self.fail(
                    decl(),
                    "predecessors must list this block as a successor",
                );
            }
        }
        for succ in func.successors(block) {
            if !func.predecessors(succ).contains(&block) {
                return self.fail(decl(), "successors must list this block as a predecessor");
            }
        }
        Ok(())
    }

    fn check_inst(&self, inst: ValueId, names: &mut HashMap<&'a str, ValueId>) -> ValidationResult {
        let func = self.func;
        let ctx = self.ctx;
        let data = func.inst_data(inst);
        let ty = func.local_type(inst);
        // Naming: non-void values carry a function-unique name.
        match &func.value(inst).name {
            Some(name) => {
                if let Some(&existing) = names.get(name.as_str()) {
                    self.check_value(
                        inst,
                        existing == inst,
                        "a value with the same name must be the same value",
                    )?;
                } else {
                    names.insert(name, inst);
                }
            }
            None => {
                self.check_value(
                    inst,
                    ctx.types.is_void(ty),
                    "non-void instructions must be named",
                )?;
            }
        }
        // Operand/use coherence and use-def dominance.
        let operands = data.operands();
        for (slot, &operand) in operands.iter().enumerate() {
            if let Value::Local(op) = operand {
                let op_data = func.value(op);
                self.check_value(inst, !op_data.dead, "operand references a destroyed value")?;
                let multiplicity = operands.iter().filter(|&&o| o == operand).count();
                let listed = op_data.uses.iter().filter(|&&u| u == inst).count();
                self.check_value(
                    inst,
                    listed == multiplicity,
                    "operands must list this instruction as a user once per slot",
                )?;
                if op_data.is_inst() {
                    self.check_value(
                        inst,
                        op_data.parent.is_some(),
                        "operand instruction is not placed in any block",
                    )?;
                    self.check_use_def_dominance(inst, slot, op)?;
                }
            }
        }
        for user in func.users(inst) {
            let uses_us = func
                .inst_data(user)
                .operands()
                .iter()
                .any(|&o| o == Value::Local(inst));
            self.check_value(inst, uses_us, "listed users must actually use the value")?;
        }
        self.check_kind(inst, data, ty)
    }

    fn check_use_def_dominance(&self, user: ValueId, slot: usize, def: ValueId) -> ValidationResult {
        let func = self.func;
        let def_block = func.parent_block(def).expect("checked by caller");
        // The use site of a phi's i-th argument is the terminator of the i-th
        // predecessor.
        let use_site = if let InstData::Phi { args } = func.inst_data(user) {
            let (pred, _) = args[slot];
            func.terminator(pred).expect("blocks have terminators")
        } else {
            user
        };
        let use_block = func.parent_block(use_site).expect("placed");
        self.check_value(user, use_site != def, "an instruction may not use itself")?;
        if def_block == use_block {
            let def_index = func.index_in_block(def);
            let use_index = func.index_in_block(use_site);
            self.check_value(user, def_index < use_index, "defs must dominate uses")?;
        } else {
            self.check_value(
                user,
                self.dom.contains(use_block) && self.dom.dominates(def_block, use_block),
                "defs must dominate uses",
            )?;
        }
        Ok(())
    }

    fn check_kind(&self, inst: ValueId, data: &InstData, ty: crate::ir::types::TypeId) -> ValidationResult {
        let func = self.func;
        let ctx = self.ctx;
        let types = &ctx.types;
        match data {
            InstData::Phi { args } => {
                let block = func.parent_block(inst).expect("placed");
                let preds = func.predecessors(block);
                self.check_value(
                    inst,
                    args.len() == preds.len(),
                    "phi needs exactly one argument per predecessor",
                )?;
                for (&(label, value), &pred) in args.iter().zip(preds.iter()) {
                    self.check_value(
                        inst,
                        label == pred,
                        "phi arguments must match the predecessor list in order",
                    )?;
                    self.check_value(
                        inst,
                        func.value_type(value, ctx) == ty,
                        "phi arguments must have the phi's type",
                    )?;
                }
            }
            InstData::Branch {
                cond,
                then_target,
                else_target,
            } => {
                let cond_ty = func.value_type(*cond, ctx);
                self.check_value(
                    inst,
                    types.is_int(cond_ty) && types.bitwidth(cond_ty) == 1,
                    "branch condition must be i1",
                )?;
                self.check_value(
                    inst,
                    then_target != else_target,
                    "branches must have distinct targets",
                )?;
            }
            InstData::Load { addr } => {
                self.check_value(
                    inst,
                    types.is_ptr(func.value_type(*addr, ctx)),
                    "load address must be of pointer type",
                )?;
                self.check_value(inst, !types.is_void(ty), "cannot load void")?;
            }
            InstData::Store { addr, .. } => {
                self.check_value(
                    inst,
                    types.is_ptr(func.value_type(*addr, ctx)),
                    "store address must be of pointer type",
                )?;
                if let Value::Global(g) = *addr {
                    self.check_value(
                        inst,
                        self.module.global(g).mutable,
                        "cannot write into a global constant",
                    )?;
                }
            }
            InstData::Arith { lhs, rhs, .. } => {
                self.check_value(
                    inst,
                    func.value_type(*lhs, ctx) == func.value_type(*rhs, ctx),
                    "binary operands must have the same type",
                )?;
            }
            InstData::Cmp { mode, lhs, rhs, .. } => {
                let lhs_ty = func.value_type(*lhs, ctx);
                let rhs_ty = func.value_type(*rhs, ctx);
                self.check_value(
                    inst,
                    lhs_ty == rhs_ty,
                    "compare operands must have the same type",
                )?;
                let mode_ok = match mode {
                    CompareMode::Signed | CompareMode::Unsigned => {
                        types.is_int(lhs_ty) || types.is_ptr(lhs_ty)
                    }
                    CompareMode::Float => types.is_float(lhs_ty),
                };
                self.check_value(inst, mode_ok, "compare mode does not fit the operand type")?;
                self.check_value(
                    inst,
                    types.is_int(ty) && types.bitwidth(ty) == 1,
                    "compares produce i1",
                )?;
            }
            InstData::Gep { inbounds, base, members, .. } => {
                self.check_value(
                    inst,
                    types.is_ptr(func.value_type(*base, ctx)),
                    "gep base must be of pointer type",
                )?;
                let mut current = *inbounds;
                for &index in members {
                    let in_bounds = match types.data(current) {
                        crate::ir::types::TypeData::Record { members, .. } => {
                            (index as usize) < members.len()
                        }
                        crate::ir::types::TypeData::Array { count, .. } => {
                            (index as usize) < *count
                        }
                        _ => false,
                    };
                    self.check_value(inst, in_bounds, "gep member index out of bounds")?;
                    current = types.member_type_at(current, index as usize);
                }
            }
            InstData::Call { callee, args } => match callee {
                Callee::Function(id) => {
                    let (param_types, return_type): (Vec<_>, _) = if *id == func.id() {
                        (
                            func.params.iter().map(|&p| func.local_type(p)).collect(),
                            func.return_type,
                        )
                    } else {
                        let callee = self.module.function(*id);
                        (
                            callee
                                .params
                                .iter()
                                .map(|&p| callee.local_type(p))
                                .collect(),
                            callee.return_type,
                        )
                    };
                    self.check_value(inst, ty == return_type, "call/callee return type mismatch")?;
                    self.check_value(
                        inst,
                        args.len() == param_types.len(),
                        "calls need one argument per parameter",
                    )?;
                    for (&arg, &param_ty) in args.iter().zip(param_types.iter()) {
                        self.check_value(
                            inst,
                            func.value_type(arg, ctx) == param_ty,
                            "call argument type mismatch",
                        )?;
                    }
                }
                Callee::Ext(id) => {
                    let ext = self.module.ext_function(*id);
                    self.check_value(inst, ty == ext.return_type, "call/callee return type mismatch")?;
                    self.check_value(
                        inst,
                        args.len() == ext.params.len(),
                        "calls need one argument per parameter",
                    )?;
                }
                Callee::Indirect(value) => {
                    self.check_value(
                        inst,
                        types.is_ptr(func.value_type(*value, ctx)),
                        "indirect calls must call pointer values",
                    )?;
                }
            },
            _ => {}
        }
        Ok(())
    }
}

pub fn validate_function(ctx: &Context, module: &Module, func: &Function) -> ValidationResult {
    let checker = Checker {
        ctx,
        module,
        func,
        dom: DominanceInfo::compute(func),
    };
    checker.run()
}

/// Validates global name uniqueness and every function of the module.
pub fn validate_module(ctx: &Context, module: &Module) -> ValidationResult {
    let mut seen = HashSet::new();
    for func in &module.functions {
        if !seen.insert(func.name.as_str()) {
            return Err(Box::new(InvariantError::new(
                "global names must be unique within a module",
                format!("@{}", func.name),
                String::new(),
            )));
        }
    }
    for global in &module.globals {
        if !seen.insert(global.name.as_str()) {
            return Err(Box::new(InvariantError::new(
                "global names must be unique within a module",
                format!("@{}", global.name),
                String::new(),
            )));
        }
        let init_ty = ctx.const_type(global.initializer);
        if init_ty != global.value_type {
            return Err(Box::new(InvariantError::new(
                "global initializer type must match the declared type",
                format!("@{}", global.name),
                String::new(),
            )));
        }
    }
    for &ty in &module.struct_types {
        if let crate::ir::types::TypeData::Record {
            name: Some(name), ..
        } = ctx.types.data(ty)
        {
            if !seen.insert(name.as_str()) {
                return Err(Box::new(InvariantError::new(
                    "global names must be unique within a module",
                    format!("@{name}"),
                    String::new(),
                )));
            }
        }
    }
    for func in &module.functions {
        validate_function(ctx, module, func)?;
    }
    Ok(())
}

/// Panicking validation used by passes after mutating a function.
pub fn assert_invariants(ctx: &Context, module: &Module, func: &Function) {
    if let Err(error) = validate_function(ctx, module, func) {
        error.report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::ArithOp;

    #[test]
    fn test_valid_function_passes() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        b.add_new_block("entry");
        let p = b.param(0);
        let sum = b.arith(ArithOp::Add, p, p, "sum");
        b.ret(sum);
        let f = b.finish();
        let module = Module::new();
        assert!(validate_function(&ctx, &module, &f).is_ok());
    }

    #[test]
    fn test_detects_type_mismatch() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i32t = ctx.int_type(32);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t, i32t], i64t);
        b.add_new_block("entry");
        let p0 = b.param(0);
        let p1 = b.param(1);
        let sum = b.arith(ArithOp::Add, p0, p1, "sum");
        b.ret(sum);
        let f = b.finish();
        let module = Module::new();
        let result = validate_function(&ctx, &module, &f);
        assert!(result.is_err());
        let error = result.unwrap_err();
        assert!(error.message.contains("same type"));
        assert!(error.function_dump.contains("func i64 @f"));
    }

    #[test]
    fn test_detects_use_before_def() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        b.add_new_block("entry");
        let p = b.param(0);
        let a = b.arith(ArithOp::Add, p, p, "a");
        let bb = b.arith(ArithOp::Add, a, p, "b");
        b.ret(bb);
        let mut f = b.finish();
        // Swap the two instructions to break def-before-use ordering.
        let entry = f.entry();
        let insts = &mut f.block_mut(entry).insts;
        insts.swap(0, 1);
        let module = Module::new();
        let result = validate_function(&ctx, &module, &f);
        assert!(result.is_err());
        assert!(result.unwrap_err().message.contains("dominate"));
    }
}
