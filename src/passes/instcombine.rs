//! Instruction combining.
//!
//! A worklist-driven local rewriter. The worklist preserves insertion order
//! and never holds an instruction twice; it starts out with every
//! instruction of the function. Visit functions return the replacement value
//! when they find one and never touch users themselves; the driver rewires
//! uses, re-queues users, and schedules the replaced instruction (and
//! everything that became dead) for deletion.
//!
//! Aggregate `insert_value`/`extract_value` chains are collapsed through a
//! per-root [`AccessTree`] that memoizes which value sits at which member
//! path; trees are invalidated transitively whenever a participating
//! instruction is rewritten.

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use crate::ir::context::{ConstData, Context};
use crate::ir::ir::{
    ArithOp, CompareOp, Conversion, FuncId, Function, InstData, MemberIndices, Module,
    UnaryArithOp, Value, ValueId,
};
use crate::ir::pointer_info::Provenance;
use crate::ir::types::{TypeData, TypeId};
use crate::ir::validate::assert_invariants;
use crate::passes::common::has_side_effects;
use crate::passes::pointer_analysis::{constant_byte_offset, may_alias};
use crate::passes::{Pass, PassCategory, PassRegistry};

pub(crate) fn register(registry: &mut PassRegistry) {
    registry.add(Pass {
        name: "instcombine",
        category: PassCategory::Simplification,
        run: instcombine,
    });
}

pub fn instcombine(ctx: &mut Context, module: &mut Module, id: FuncId) -> bool {
    module.with_function(id, |module, func| {
        let mut pass = InstCombine::new(func);
        let result = pass.run(ctx, module, func);
        assert_invariants(ctx, module, func);
        result
    })
}

struct InstCombine {
    items: Vec<ValueId>,
    index: usize,
    erase_list: HashSet<ValueId>,
    /// Extracts synthesized as missing access-tree leaves; deleted after the
    /// run when they ended up unused.
    ev_list: Vec<ValueId>,
    access_trees: HashMap<ValueId, crate::passes::access_tree::AccessTree>,
    modified: bool,
}

impl InstCombine {
    fn new(func: &Function) -> InstCombine {
        InstCombine {
            items: func.instructions(),
            index: 0,
            erase_list: HashSet::new(),
            ev_list: Vec::new(),
            access_trees: HashMap::new(),
            modified: false,
        }
    }

    fn push(&mut self, inst: ValueId) {
        if self.erase_list.contains(&inst) {
            return;
        }
        if self.items[self.index..].contains(&inst) {
            return;
        }
        self.items.push(inst);
    }

    fn push_value(&mut self, value: Value) {
        if let Value::Local(id) = value {
            self.push(id);
        }
    }

    fn push_users(&mut self, func: &Function, inst: ValueId) {
        for user in func.users(inst) {
            self.push(user);
        }
    }

    fn is_used(&self, func: &Function, module: &Module, inst: ValueId) -> bool {
        if has_side_effects(func, module, inst) || func.inst_data(inst).is_terminator() {
            return true;
        }
        func.users(inst)
            .iter()
            .any(|user| !self.erase_list.contains(user))
    }

    fn mark_for_deletion(&mut self, func: &Function, inst: ValueId) {
        for operand in func.inst_data(inst).operands() {
            self.push_value(operand);
        }
        self.erase_list.insert(inst);
    }

    fn invalidate_access_tree(&mut self, func: &Function, inst: ValueId) {
        if !matches!(
            func.inst_data(inst),
            InstData::InsertValue { .. } | InstData::ExtractValue { .. }
        ) {
            return;
        }
        self.access_trees.remove(&inst);
        if matches!(func.inst_data(inst), InstData::InsertValue { .. }) {
            for user in func.users(inst) {
                if func.value(user).is_inst() {
                    self.invalidate_access_tree(func, user);
                }
            }
        }
    }

    fn replace_inst(&mut self, func: &mut Function, old: ValueId, new: Value) {
        if Value::Local(old) == new {
            return;
        }
        for user in func.users(old) {
            self.invalidate_access_tree(func, user);
        }
        func.replace_all_uses(old, new);
    }

    fn run(&mut self, ctx: &mut Context, module: &Module, func: &mut Function) -> bool {
        while self.index < self.items.len() {
            let inst = self.items[self.index];
            self.index += 1;
            if func.value(inst).dead || self.erase_list.contains(&inst) {
                continue;
            }
            if !self.is_used(func, module, inst) {
                self.mark_for_deletion(func, inst);
                continue;
            }
            let Some(replacement) = self.visit(ctx, module, func, inst) else {
                continue;
            };
            self.modified = true;
            self.push_users(func, inst);
            self.push_value(replacement);
            self.replace_inst(func, inst, replacement);
            if replacement != Value::Local(inst) {
                self.mark_for_deletion(func, inst);
            }
        }
        self.clean(ctx, func);
        self.modified
    }

    fn clean(&mut self, ctx: &mut Context, func: &mut Function) {
        let mut dead: Vec<ValueId> = self
            .erase_list
            .iter()
            .copied()
            .filter(|&inst| !func.value(inst).dead)
            .collect();
        dead.sort();
        loop {
            let mut progress = false;
            dead.retain(|&inst| {
                if func.is_unused(inst) {
                    func.erase_inst(inst);
                    self.modified = true;
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
        // Cycles of mutually dead instructions (dead phi loops) are broken
        // by rewriting their operands to undef.
        for &inst in &dead {
            let ty = func.local_type(inst);
            let undef = ctx.undef(ty);
            func.replace_all_uses(inst, Value::Const(undef));
        }
        for inst in dead {
            func.erase_inst(inst);
            self.modified = true;
        }
        for &ev in &self.ev_list {
            if !func.value(ev).dead && func.is_unused(ev) {
                func.erase_inst(ev);
            }
        }
    }

    fn visit(
        &mut self,
        ctx: &mut Context,
        module: &Module,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        match func.inst_data(inst) {
            InstData::Gep { .. } => self.visit_gep(ctx, func, inst),
            InstData::Arith { .. } => self.visit_arith(ctx, func, inst),
            InstData::Load { .. } => self.visit_load(ctx, module, func, inst),
            InstData::Conv { .. } => self.visit_conv(ctx, func, inst),
            InstData::Phi { .. } => self.visit_phi(ctx, func, inst),
            InstData::Select { .. } => self.visit_select(ctx, func, inst),
            InstData::Cmp { .. } => self.visit_cmp(ctx, module, func, inst),
            InstData::UnaryArith { .. } => self.visit_unary_arith(func, inst),
            InstData::ExtractValue { .. } => self.visit_extract(ctx, func, inst),
            InstData::InsertValue { .. } => self.visit_insert(ctx, func, inst),
            _ => None,
        }
    }

    // -- Pointer arithmetic -------------------------------------------------

    fn visit_gep(&mut self, ctx: &mut Context, func: &mut Function, inst: ValueId) -> Option<Value> {
        let InstData::Gep {
            inbounds,
            base,
            index,
            ref members,
        } = *func.inst_data(inst)
        else {
            unreachable!()
        };
        if constant_byte_offset(ctx, inbounds, index, members) == Some(0) {
            return Some(base);
        }
        if let Some(value) = self.gep_combine_preserve_structure(ctx, func, inst) {
            return Some(value);
        }
        if let Some(value) = self.gep_combine_byte_offset(ctx, func, inst) {
            return Some(value);
        }
        None
    }

    /// Combines a chain of constant-indexed geps into a single gep with the
    /// summed array index and the concatenated member indices, keeping the
    /// outermost structure.
    fn gep_combine_preserve_structure(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        let mut base_type;
        let mut combined_base = None;
        let mut array_index = 0i64;
        let mut member_indices: MemberIndices = SmallVec::new();
        {
            let InstData::Gep { inbounds, .. } = *func.inst_data(inst) else {
                unreachable!()
            };
            base_type = inbounds;
        }
        let mut current = Some(inst);
        while let Some(gep) = current {
            let InstData::Gep {
                inbounds,
                base,
                index,
                ref members,
            } = *func.inst_data(gep)
            else {
                break;
            };
            // A gep with member indices cannot fold into an accumulated
            // array offset.
            if array_index != 0 && !members.is_empty() {
                break;
            }
            let Some(const_index) = index.as_const().and_then(|c| ctx.int_value_signed(c)) else {
                break;
            };
            let Some(adjusted) = adjust_array_index_to_type(ctx, base_type, inbounds, const_index)
            else {
                break;
            };
            if !members.is_empty() {
                base_type = inbounds;
                let mut joined: MemberIndices = members.clone();
                joined.extend(member_indices.iter().copied());
                member_indices = joined;
            }
            array_index += adjusted;
            combined_base = Some(base);
            current = base
                .as_local()
                .filter(|&b| func.value(b).is_inst())
                .filter(|&b| matches!(func.inst_data(b), InstData::Gep { .. }));
        }
        let combined_base = combined_base?;
        let InstData::Gep { base, .. } = *func.inst_data(inst) else {
            unreachable!()
        };
        if combined_base == base {
            return None;
        }
        let index = ctx.int_constant_signed(array_index, 64);
        let name = func.value(inst).name.clone().unwrap_or_default();
        let ptr = ctx.ptr_type();
        let new_gep = func.insert_inst_before(
            inst,
            InstData::Gep {
                inbounds: base_type,
                base: combined_base,
                index: Value::Const(index),
                members: member_indices,
            },
            ptr,
            &name,
        );
        Some(Value::Local(new_gep))
    }

    /// Fallback gep combining: collapse the whole chain into one byte-typed
    /// gep with the summed constant byte offset.
    fn gep_combine_byte_offset(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        let (base, offset, geps) = recursive_gep_base_and_offset(ctx, func, Value::Local(inst));
        if geps.len() <= 1 {
            return None;
        }
        let index = ctx.int_constant_signed(offset, 64);
        let i8t = ctx.int_type(8);
        let ptr = ctx.ptr_type();
        let name = func.value(inst).name.clone().unwrap_or_default();
        let new_gep = func.insert_inst_before(
            inst,
            InstData::Gep {
                inbounds: i8t,
                base,
                index: Value::Const(index),
                members: SmallVec::new(),
            },
            ptr,
            &name,
        );
        Some(Value::Local(new_gep))
    }

    // -- Arithmetic ---------------------------------------------------------

    fn visit_arith(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        let InstData::Arith { op, lhs, rhs } = *func.inst_data(inst) else {
            unreachable!()
        };
        let ty = func.local_type(inst);
        // Canonicalize constants to the right for commutative operations.
        let (lhs, rhs) = if ctx.is_commutative(op) && lhs.is_constant() && !rhs.is_constant() {
            if let InstData::Arith { lhs, rhs, .. } = func.inst_data_mut(inst) {
                std::mem::swap(lhs, rhs);
            }
            self.push_users(func, inst);
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };
        match op {
            ArithOp::Add => {
                if self.try_merge_negate(func, inst) {
                    self.modified = true;
                    self.push(inst);
                    return None;
                }
                if is_int_constant(ctx, rhs, 0) {
                    return Some(lhs);
                }
                self.merge_arithmetic(ctx, func, inst);
            }
            ArithOp::FAdd => {
                if is_float_constant(ctx, rhs, 0.0) {
                    return Some(lhs);
                }
                self.merge_arithmetic(ctx, func, inst);
            }
            ArithOp::Sub => {
                if is_int_constant(ctx, lhs, 0) {
                    let neg = func.insert_inst_before(
                        inst,
                        InstData::UnaryArith {
                            op: UnaryArithOp::Negate,
                            operand: rhs,
                        },
                        ty,
                        "negate",
                    );
                    return Some(Value::Local(neg));
                }
                if self.try_merge_negate(func, inst) {
                    self.modified = true;
                    self.push(inst);
                    return None;
                }
                if is_int_constant(ctx, rhs, 0) {
                    return Some(lhs);
                }
                if lhs == rhs {
                    return Some(Value::Const(ctx.arithmetic_constant(0, ty)));
                }
                self.merge_arithmetic(ctx, func, inst);
            }
            ArithOp::FSub => {
                if is_float_constant(ctx, rhs, 0.0) {
                    return Some(lhs);
                }
                if lhs == rhs {
                    return Some(Value::Const(ctx.arithmetic_constant(0, ty)));
                }
                self.merge_arithmetic(ctx, func, inst);
            }
            ArithOp::Mul | ArithOp::FMul => {
                if is_constant_scalar(ctx, rhs, 1) {
                    return Some(lhs);
                }
                self.merge_arithmetic(ctx, func, inst);
            }
            ArithOp::SDiv | ArithOp::UDiv | ArithOp::FDiv => {
                if is_constant_scalar(ctx, rhs, 0) {
                    return Some(Value::Const(ctx.undef(ty)));
                }
                if is_constant_scalar(ctx, rhs, 1) {
                    return Some(lhs);
                }
                if lhs == rhs {
                    return Some(Value::Const(ctx.arithmetic_constant(1, ty)));
                }
                self.merge_arithmetic(ctx, func, inst);
            }
            ArithOp::SRem | ArithOp::URem => {
                if is_int_constant(ctx, rhs, 0) {
                    return Some(Value::Const(ctx.undef(ty)));
                }
                if is_int_constant(ctx, rhs, 1) || lhs == rhs {
                    return Some(Value::Const(ctx.arithmetic_constant(0, ty)));
                }
            }
            ArithOp::And => {
                let bits = ctx.types.bitwidth(ty);
                if is_all_ones(ctx, rhs, bits) {
                    return Some(lhs);
                }
                if is_all_ones(ctx, lhs, bits) {
                    return Some(rhs);
                }
                if lhs == rhs {
                    return Some(lhs);
                }
            }
            ArithOp::Or => {
                if is_int_constant(ctx, rhs, 0) {
                    return Some(lhs);
                }
                if is_int_constant(ctx, lhs, 0) {
                    return Some(rhs);
                }
                if lhs == rhs {
                    return Some(lhs);
                }
            }
            ArithOp::XOr => {
                if lhs == rhs {
                    return Some(Value::Const(ctx.arithmetic_constant(0, ty)));
                }
            }
            _ => {}
        }
        None
    }

    /// Merges sequential additive or multiplicative operations whose right
    /// hand sides are constants: `(a + 1) + 1` becomes `a + 2`. Float chains
    /// fold only when reassociation is enabled.
    fn merge_arithmetic(&mut self, ctx: &mut Context, func: &mut Function, inst: ValueId) {
        let InstData::Arith { op, lhs, rhs } = *func.inst_data(inst) else {
            unreachable!()
        };
        let Some(rhs_const) = rhs.as_const() else {
            return;
        };
        let Some(prev) = lhs.as_local().filter(|&p| func.value(p).is_inst()) else {
            return;
        };
        let InstData::Arith {
            op: prev_op,
            lhs: prev_lhs,
            rhs: prev_rhs,
        } = *func.inst_data(prev)
        else {
            return;
        };
        let Some(prev_const) = prev_rhs.as_const() else {
            return;
        };
        let ty = func.local_type(inst);
        let ints = (
            ctx.int_value_signed(rhs_const),
            ctx.int_value_signed(prev_const),
        );
        let floats = (ctx.float_value(rhs_const), ctx.float_value(prev_const));
        let assoc = ctx.associative_float_arithmetic();
        let bits = if ctx.types.is_float(ty) {
            ctx.types.bitwidth(ty)
        } else {
            0
        };
        // The outer operation is kept; only the constant changes:
        // `(x + b) op a` folds to `x op c` with the appropriately signed `c`.
        let new_rhs = match (op, prev_op, ints, floats) {
            (ArithOp::Add | ArithOp::Sub, ArithOp::Add | ArithOp::Sub, (Some(a), Some(b)), _) => {
                let value = if op == prev_op {
                    a.wrapping_add(b)
                } else {
                    a.wrapping_sub(b)
                };
                Some(ctx.arithmetic_constant(value, ty))
            }
            (ArithOp::FAdd | ArithOp::FSub, ArithOp::FAdd | ArithOp::FSub, _, (Some(a), Some(b)))
                if assoc =>
            {
                let value = if op == prev_op { a + b } else { a - b };
                Some(ctx.float_constant(value, bits))
            }
            (ArithOp::FMul, ArithOp::FMul, _, (Some(a), Some(b))) if assoc => {
                Some(ctx.float_constant(a * b, bits))
            }
            (ArithOp::FMul, ArithOp::FDiv, _, (Some(a), Some(b))) if assoc => {
                Some(ctx.float_constant(a / b, bits))
            }
            (ArithOp::FDiv, ArithOp::FMul, _, (Some(a), Some(b))) if assoc => {
                if let InstData::Arith { op, .. } = func.inst_data_mut(inst) {
                    *op = ArithOp::FMul;
                }
                Some(ctx.float_constant(b / a, bits))
            }
            (ArithOp::FDiv, ArithOp::FDiv, _, (Some(a), Some(b))) if assoc => {
                Some(ctx.float_constant(a * b, bits))
            }
            _ => None,
        };
        let Some(new_rhs) = new_rhs else {
            return;
        };
        func.set_operand(inst, 0, prev_lhs);
        func.set_operand(inst, 1, Value::Const(new_rhs));
        self.modified = true;
        self.push(inst);
        self.push(prev);
    }

    /// `a + (-b) => a - b`, `(-a) + b => b - a`, `a - (-b) => a + b`.
    fn try_merge_negate(&mut self, func: &mut Function, inst: ValueId) -> bool {
        let InstData::Arith { op, lhs, rhs } = *func.inst_data(inst) else {
            unreachable!()
        };
        debug_assert!(matches!(op, ArithOp::Add | ArithOp::Sub));
        if let Some(negated) = negated_value(func, rhs) {
            let new_op = if op == ArithOp::Add {
                ArithOp::Sub
            } else {
                ArithOp::Add
            };
            if let InstData::Arith { op, .. } = func.inst_data_mut(inst) {
                *op = new_op;
            }
            func.update_operand(inst, rhs, negated);
            return true;
        }
        if op == ArithOp::Add {
            if let Some(negated) = negated_value(func, lhs) {
                if let InstData::Arith { op, .. } = func.inst_data_mut(inst) {
                    *op = ArithOp::Sub;
                }
                // lhs becomes the old rhs, rhs the negated operand.
                func.set_operand(inst, 0, rhs);
                func.set_operand(inst, 1, negated);
                return true;
            }
        }
        false
    }

    // -- Loads from constant globals ----------------------------------------

    fn visit_load(
        &mut self,
        ctx: &mut Context,
        module: &Module,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        let InstData::Load { addr } = *func.inst_data(inst) else {
            unreachable!()
        };
        let (pointer, byte_offset, geps) = recursive_gep_base_and_offset(ctx, func, addr);
        let Value::Global(global_id) = pointer else {
            return None;
        };
        let global = module.global(global_id);
        if global.mutable {
            return None;
        }
        let load_ty = func.local_type(inst);
        if let Some(elem) = self.load_constant(ctx, func, inst, global.initializer, &geps, byte_offset)
        {
            let elem_ty = func.value_type(elem, ctx);
            if elem_ty == load_ty {
                return Some(elem);
            }
            if ctx.types.size(elem_ty) == ctx.types.size(load_ty) {
                let name = func.value(inst).name.clone().unwrap_or_default();
                let conv = func.insert_inst_before(
                    inst,
                    InstData::Conv {
                        conv: Conversion::Bitcast,
                        operand: elem,
                    },
                    load_ty,
                    &name,
                );
                return Some(Value::Local(conv));
            }
            return None;
        }
        // No structural match: evaluate the initializer's byte image and
        // rebuild the loaded value from the accessed subrange.
        let init = global.initializer;
        let size = ctx.types.size(ctx.const_type(init));
        let mut bytes = vec![0u8; size];
        if !crate::backend::static_data::write_constant_bytes(ctx, init, &mut bytes) {
            // Function pointers cannot be evaluated this way.
            return None;
        }
        let offset = usize::try_from(byte_offset).ok()?;
        let load_size = ctx.types.size(load_ty);
        if offset + load_size > bytes.len() {
            return None;
        }
        if let TypeData::Int { bits } = *ctx.types.data(load_ty) {
            let mut word = [0u8; 8];
            word[..load_size].copy_from_slice(&bytes[offset..offset + load_size]);
            let value = u64::from_le_bytes(word);
            return Some(Value::Const(ctx.int_constant(value, bits)));
        }
        None
    }

    fn load_constant(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        load: ValueId,
        base: crate::ir::context::ConstId,
        geps: &[ValueId],
        byte_offset: i64,
    ) -> Option<Value> {
        if let Some(value) = self.load_const_no_punning(ctx, func, load, base, geps) {
            return Some(value);
        }
        self.load_const_punning(ctx, func, load, base, byte_offset)
    }

    /// Navigates the constant by the gep chain, innermost first, when the
    /// accesses line up with the constant's structure.
    fn load_const_no_punning(
        &mut self,
        ctx: &Context,
        func: &Function,
        load: ValueId,
        base: crate::ir::context::ConstId,
        geps: &[ValueId],
    ) -> Option<Value> {
        let mut current = base;
        for &gep in geps.iter().rev() {
            let InstData::Gep {
                inbounds,
                index,
                ref members,
                ..
            } = *func.inst_data(gep)
            else {
                return None;
            };
            let array_index = index.as_const().and_then(|c| ctx.int_value_signed(c))?;
            match ctx.const_data(current) {
                ConstData::Array { elems, ty } => {
                    let TypeData::Array { elem, .. } = *ctx.types.data(*ty) else {
                        return None;
                    };
                    if elem != inbounds || array_index < 0 {
                        return None;
                    }
                    current = *elems.get(array_index as usize)?;
                }
                _ => {
                    if array_index != 0 {
                        return None;
                    }
                }
            }
            for &member in members {
                match ctx.const_data(current) {
                    ConstData::Record { elems, .. } => {
                        current = *elems.get(member as usize)?;
                    }
                    _ => return None,
                }
            }
        }
        let load_ty = func.local_type(load);
        if ctx.types.size(ctx.const_type(current)) == ctx.types.size(load_ty) {
            Some(Value::Const(current))
        } else {
            None
        }
    }

    /// Type-punned access: the load hits a record member at a matching byte
    /// offset of the same size; extract that member.
    fn load_const_punning(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        load: ValueId,
        base: crate::ir::context::ConstId,
        byte_offset: i64,
    ) -> Option<Value> {
        let ConstData::Record { ty, .. } = *ctx.const_data(base) else {
            return None;
        };
        let byte_offset = usize::try_from(byte_offset).ok()?;
        let load_ty = func.local_type(load);
        let members = ctx.types.members(ty).to_vec();
        let (index, member) = members
            .iter()
            .enumerate()
            .find(|(_, m)| m.offset == byte_offset)?;
        if ctx.types.size(member.ty) != ctx.types.size(load_ty) {
            return None;
        }
        let extract = func.insert_inst_before(
            load,
            InstData::ExtractValue {
                base: Value::Const(base),
                members: SmallVec::from_slice(&[index as u32]),
            },
            member.ty,
            "extract",
        );
        self.modified = true;
        self.push(extract);
        Some(Value::Local(extract))
    }

    // -- Conversions --------------------------------------------------------

    fn visit_conv(&mut self, ctx: &mut Context, func: &mut Function, inst: ValueId) -> Option<Value> {
        let InstData::Conv { conv, operand } = *func.inst_data(inst) else {
            unreachable!()
        };
        if conv != Conversion::Bitcast {
            return None;
        }
        let ty = func.local_type(inst);
        if func.value_type(operand, ctx) == ty {
            return Some(operand);
        }
        // Chained bitcasts fold onto the innermost operand.
        if let Some(op_inst) = operand.as_local().filter(|&o| func.value(o).is_inst()) {
            if let InstData::Conv {
                conv: Conversion::Bitcast,
                operand: inner,
            } = *func.inst_data(op_inst)
            {
                self.push(op_inst);
                func.update_operand(inst, operand, inner);
                return Some(Value::Local(inst));
            }
            // A bitcast of a load re-loads at the target type.
            if let InstData::Load { addr } = *func.inst_data(op_inst) {
                let name = func.value(inst).name.clone().unwrap_or_default();
                let new_load =
                    func.insert_inst_before(op_inst, InstData::Load { addr }, ty, &name);
                return Some(Value::Local(new_load));
            }
        }
        if let Some(c) = operand.as_const() {
            if let ConstData::Record { elems, .. } = ctx.const_data(c) {
                if elems.len() == 1 {
                    let elem = elems[0];
                    debug_assert_eq!(
                        ctx.types.size(ctx.const_type(elem)),
                        ctx.types.size(ty)
                    );
                    func.update_operand(inst, operand, Value::Const(elem));
                    return Some(Value::Local(inst));
                }
            }
        }
        None
    }

    // -- Phi / select / compare --------------------------------------------

    fn visit_phi(&mut self, ctx: &mut Context, func: &mut Function, inst: ValueId) -> Option<Value> {
        let InstData::Phi { args } = func.inst_data(inst) else {
            unreachable!()
        };
        if args.is_empty() {
            let ty = func.local_type(inst);
            return Some(Value::Const(ctx.undef(ty)));
        }
        let first = args[0].1;
        if args.iter().all(|&(_, v)| v == first) {
            return Some(first);
        }
        None
    }

    fn visit_select(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        let InstData::Select {
            cond,
            then_value,
            else_value,
        } = *func.inst_data(inst)
        else {
            unreachable!()
        };
        if let Some(c) = cond.as_const() {
            if let Some(value) = ctx.int_value(c) {
                return Some(if value != 0 { then_value } else { else_value });
            }
        }
        if then_value == else_value {
            return Some(then_value);
        }
        // A select between boolean constants is the condition itself or its
        // logical not.
        let ty = func.local_type(inst);
        if ctx.types.is_int(ty) && ctx.types.bitwidth(ty) == 1 {
            let tv = then_value.as_const().and_then(|c| ctx.int_value(c));
            let ev = else_value.as_const().and_then(|c| ctx.int_value(c));
            if let (Some(tv), Some(ev)) = (tv, ev) {
                debug_assert_ne!(tv, ev, "equal-value case handled above");
                if tv != 0 {
                    return Some(cond);
                }
                let lnt = func.insert_inst_before(
                    inst,
                    InstData::UnaryArith {
                        op: UnaryArithOp::LogicalNot,
                        operand: cond,
                    },
                    ty,
                    "select.lnt",
                );
                return Some(Value::Local(lnt));
            }
        }
        None
    }

    fn visit_cmp(
        &mut self,
        ctx: &mut Context,
        module: &Module,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        let InstData::Cmp { op, lhs, rhs, .. } = *func.inst_data(inst) else {
            unreachable!()
        };
        // Canonicalize constants to the right, flipping the operation.
        let (lhs, rhs) = if lhs.is_constant() && !rhs.is_constant() {
            if let InstData::Cmp { op: o, lhs, rhs, .. } = func.inst_data_mut(inst) {
                *o = op.flipped();
                std::mem::swap(lhs, rhs);
            }
            self.push_users(func, inst);
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };
        let InstData::Cmp { op, .. } = *func.inst_data(inst) else {
            unreachable!()
        };
        if !op.is_equality() {
            return None;
        }
        let equal = op == CompareOp::Equal;
        if lhs == rhs {
            return Some(Value::Const(ctx.bool_constant(equal)));
        }
        if ctx.types.is_ptr(func.value_type(lhs, ctx)) {
            match pointer_static_compare(ctx, func, module, lhs, rhs) {
                StaticCompare::Equal => {
                    return Some(Value::Const(ctx.bool_constant(equal)));
                }
                StaticCompare::NotEqual => {
                    return Some(Value::Const(ctx.bool_constant(!equal)));
                }
                StaticCompare::Indeterminate => {}
            }
        }
        None
    }

    fn visit_unary_arith(&mut self, func: &mut Function, inst: ValueId) -> Option<Value> {
        let InstData::UnaryArith { op, operand } = *func.inst_data(inst) else {
            unreachable!()
        };
        if op != UnaryArithOp::LogicalNot {
            return None;
        }
        let compare = operand.as_local().filter(|&c| func.value(c).is_inst())?;
        let InstData::Cmp {
            mode,
            op: cmp_op,
            lhs,
            rhs,
        } = *func.inst_data(compare)
        else {
            return None;
        };
        if func.users(compare).len() == 1 {
            // Sole user: invert the compare in place.
            if let InstData::Cmp { op, .. } = func.inst_data_mut(compare) {
                *op = cmp_op.inverse();
            }
            return Some(Value::Local(compare));
        }
        let name = func.value(compare).name.clone().unwrap_or_default();
        let ty = func.local_type(compare);
        let inverted = func.insert_inst_before(
            inst,
            InstData::Cmp {
                mode,
                op: cmp_op.inverse(),
                lhs,
                rhs,
            },
            ty,
            &format!("{name}.inv"),
        );
        Some(Value::Local(inverted))
    }

    // -- Aggregates ---------------------------------------------------------

    fn visit_extract(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        let InstData::ExtractValue { base, ref members } = *func.inst_data(inst) else {
            unreachable!()
        };
        let members = members.clone();
        if let Some(c) = base.as_const() {
            if ctx.is_undef(c) {
                let ty = func.local_type(inst);
                return Some(Value::Const(ctx.undef(ty)));
            }
        }
        if let Some(value) = self.extract_phi_value(func, inst, base, &members) {
            return Some(value);
        }
        if let Some(value) = self.extract_insert_value(ctx, func, inst, base, &members) {
            return Some(value);
        }
        if let Some(value) = extract_constant(ctx, base, &members) {
            return Some(value);
        }
        None
    }

    /// An extract whose base is a phi with no other users is performed in
    /// every predecessor and the results phi'd together.
    fn extract_phi_value(
        &mut self,
        func: &mut Function,
        inst: ValueId,
        base: Value,
        members: &[u32],
    ) -> Option<Value> {
        let phi = base.as_local().filter(|&p| func.value(p).is_inst())?;
        if !func.inst_data(phi).is_phi() || func.users(phi).len() > 1 {
            return None;
        }
        let args = func.phi_args(phi).to_vec();
        let ty = func.local_type(inst);
        let name = func.value(inst).name.clone().unwrap_or_default();
        let mut new_args: SmallVec<[(crate::ir::ir::BlockId, Value); 2]> = SmallVec::new();
        for (pred, arg) in args {
            let term = func.terminator(pred).expect("blocks have terminators");
            let index = func.index_in_block(term);
            let extract = func.insert_inst(
                pred,
                index,
                InstData::ExtractValue {
                    base: arg,
                    members: SmallVec::from_slice(members),
                },
                ty,
                &name,
            );
            self.push(extract);
            new_args.push((pred, Value::Local(extract)));
        }
        let phi_block = func.parent_block(phi).expect("placed");
        let new_phi = func.insert_phi(phi_block, InstData::Phi { args: new_args }, ty, &name);
        Some(Value::Local(new_phi))
    }

    fn extract_insert_value(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        inst: ValueId,
        base: Value,
        members: &[u32],
    ) -> Option<Value> {
        // Scan the insert chain for an exact index match.
        let mut insert_base = None;
        let mut current = base;
        while let Some(iv) = current.as_local().filter(|&i| func.value(i).is_inst()) {
            let InstData::InsertValue {
                base: iv_base,
                inserted,
                members: ref iv_members,
            } = *func.inst_data(iv)
            else {
                break;
            };
            insert_base = Some(iv_base);
            if iv_members.as_slice() == members {
                return Some(inserted);
            }
            current = iv_base;
        }
        let base_inst = base.as_local().filter(|&i| func.value(i).is_inst())?;
        if !matches!(func.inst_data(base_inst), InstData::InsertValue { .. }) {
            return None;
        }
        let tree = self.access_tree_for(ctx, func, base_inst).clone();
        let mut node = &tree;
        let mut depth = 0;
        while depth < members.len() && node.has_children() {
            node = node.child_at(members[depth] as usize)?;
            depth += 1;
        }
        let name = func.value(inst).name.clone().unwrap_or_default();
        if depth < members.len() {
            // Ran out of tree: extract the remaining path from the node's
            // value.
            let node_value = node.value()?;
            let remaining = SmallVec::from_slice(&members[depth..]);
            let ty = func.local_type(inst);
            let new_extract = func.insert_inst_before(
                inst,
                InstData::ExtractValue {
                    base: node_value,
                    members: remaining,
                },
                ty,
                &name,
            );
            return Some(Value::Local(new_extract));
        }
        if node.has_children() {
            return self.stitch_extracted_value(ctx, func, inst, node);
        }
        if let Some(value) = node.value() {
            return Some(value);
        }
        // The tree has no opinion: extract from below the whole chain.
        let insert_base = insert_base?;
        let ty = func.local_type(inst);
        let new_extract = func.insert_inst_before(
            inst,
            InstData::ExtractValue {
                base: insert_base,
                members: SmallVec::from_slice(members),
            },
            ty,
            &name,
        );
        Some(Value::Local(new_extract))
    }

    /// Rebuilds the extracted aggregate from the access-tree children:
    /// constant children become a record constant, the rest is inserted on
    /// top of it.
    fn stitch_extracted_value(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        inst: ValueId,
        node: &crate::passes::access_tree::AccessTree,
    ) -> Option<Value> {
        let ty = node.ty();
        let num = ctx.types.num_members(ty);
        let mut base = if node.has_constant_children() {
            let mut elems = Vec::with_capacity(num);
            for index in 0..num {
                let elem_ty = ctx.types.member_type_at(ty, index);
                let elem = match node.child_at(index).and_then(|c| c.value()) {
                    Some(Value::Const(c)) => c,
                    _ => ctx.undef(elem_ty),
                };
                elems.push(elem);
            }
            Value::Const(record_or_array_constant(ctx, elems, ty))
        } else {
            Value::Const(ctx.undef(ty))
        };
        let name = func.value(inst).name.clone().unwrap_or_default();
        for index in 0..num {
            let Some(value) = node.child_at(index).and_then(|c| c.value()) else {
                return None;
            };
            if matches!(value, Value::Const(_)) {
                continue;
            }
            let insert = func.insert_inst_before(
                inst,
                InstData::InsertValue {
                    base,
                    inserted: value,
                    members: SmallVec::from_slice(&[index as u32]),
                },
                ty,
                &format!("{name}.{index}"),
            );
            base = Value::Local(insert);
        }
        Some(base)
    }

    fn visit_insert(
        &mut self,
        ctx: &mut Context,
        func: &mut Function,
        inst: ValueId,
    ) -> Option<Value> {
        let InstData::InsertValue { base, inserted, .. } = *func.inst_data(inst) else {
            unreachable!()
        };
        if let Some(c) = inserted.as_const() {
            if ctx.is_undef(c) {
                return Some(base);
            }
        }
        // Chains are rewritten at their outermost use, not in the middle.
        if func.users(inst).iter().all(|&user| {
            matches!(
                func.inst_data(user),
                InstData::InsertValue { .. } | InstData::ExtractValue { .. }
            )
        }) && !func.users(inst).is_empty()
        {
            return None;
        }
        let mut tree = self.access_tree_for(ctx, func, inst).clone();
        let iv_map = gather_iv_map(func, inst);
        let mut new_inserts: Vec<ValueId> = Vec::new();
        let mut discarded: Vec<ValueId> = Vec::new();
        let mut missing_leaf = false;
        tree.post_order_walk(&mut |node, _indices| {
            if missing_leaf {
                return;
            }
            if !node.has_children() {
                // Leaves without a memoized value extract from the chain's
                // ultimate base.
                if node.value().is_none() {
                    missing_leaf = true;
                }
                return;
            }
            let (leaves_base, leaves_inserts) =
                rebuild_inserts(ctx, func, node, &iv_map, true);
            let (children_base, children_inserts) =
                rebuild_inserts(ctx, func, node, &iv_map, false);
            if children_inserts.len() < leaves_inserts.len() {
                discarded.extend(leaves_inserts);
                new_inserts.extend(children_inserts.iter().copied());
                node.set_value(children_base);
            } else {
                discarded.extend(children_inserts);
                new_inserts.extend(leaves_inserts.iter().copied());
                node.set_value(leaves_base);
            }
        });
        if missing_leaf {
            // Fill the missing leaves with extracts from the root value and
            // retry on the next visit.
            let root_base = chain_base(func, inst);
            let mut tree = self.access_tree_for(ctx, func, inst).clone();
            let mut created = Vec::new();
            tree.post_order_walk(&mut |node, indices| {
                if !node.has_children() && node.value().is_none() {
                    created.push((node.ty(), indices.to_vec()));
                }
            });
            // Unwind the speculative inserts of the aborted walk. Losers may
            // reference winners, so they go first, each set newest first.
            erase_unplaced(func, &discarded);
            erase_unplaced(func, &new_inserts);
            let mut changed = false;
            for (ty, indices) in created {
                let ev = func.insert_inst_before(
                    inst,
                    InstData::ExtractValue {
                        base: root_base,
                        members: SmallVec::from_slice(&indices),
                    },
                    ty,
                    "ev",
                );
                self.ev_list.push(ev);
                let memo = self.access_trees.get_mut(&inst).expect("cached above");
                let mut node = Some(&mut *memo);
                for &i in &indices {
                    node = node.and_then(|n| n.child_at_mut(i as usize));
                }
                if let Some(node) = node {
                    node.set_value(Value::Local(ev));
                    changed = true;
                }
            }
            if changed {
                self.push(inst);
            }
            return None;
        }
        // Drop the losing speculative inserts, most recent first.
        erase_unplaced(func, &discarded);
        let new_value = tree.value()?;
        if new_value == Value::Local(inst) {
            erase_unplaced(func, &new_inserts);
            return None;
        }
        for insert in new_inserts {
            if func.value(insert).parent.is_none() {
                let block = func.parent_block(inst).expect("placed");
                let index = func.index_in_block(inst);
                func.place_inst(block, index, insert);
            }
            self.push(insert);
        }
        let InstData::InsertValue { base, inserted, .. } = *func.inst_data(inst) else {
            unreachable!()
        };
        self.push_value(base);
        self.push_value(inserted);
        if let Some(nv) = new_value.as_local().filter(|&n| func.value(n).is_inst()) {
            if let InstData::InsertValue { base, inserted, .. } = *func.inst_data(nv) {
                self.push_value(base);
                self.push_value(inserted);
            }
        }
        Some(new_value)
    }

    /// The memoized access tree for an insert/extract instruction.
    fn access_tree_for(
        &mut self,
        ctx: &Context,
        func: &Function,
        inst: ValueId,
    ) -> &crate::passes::access_tree::AccessTree {
        use crate::passes::access_tree::AccessTree;
        if self.access_trees.contains_key(&inst) {
            return &self.access_trees[&inst];
        }
        let base = match *func.inst_data(inst) {
            InstData::InsertValue { base, .. } | InstData::ExtractValue { base, .. } => base,
            _ => panic!("access trees only exist for insert/extract"),
        };
        let mut tree = match base.as_local().filter(|&b| func.value(b).is_inst()) {
            Some(b)
                if matches!(
                    func.inst_data(b),
                    InstData::InsertValue { .. } | InstData::ExtractValue { .. }
                ) =>
            {
                self.access_tree_for(ctx, func, b).clone()
            }
            _ => {
                let ty = func.value_type(base, ctx);
                let mut t = AccessTree::new(ty);
                t.set_value(base);
                t
            }
        };
        if let InstData::InsertValue {
            inserted,
            ref members,
            ..
        } = *func.inst_data(inst)
        {
            let members = members.clone();
            let mut node = &mut tree;
            for &index in &members {
                node.fan_out(&ctx.types);
                node = node.child_at_mut(index as usize).expect("fanned out");
            }
            node.set_value(inserted);
        }
        self.access_trees.insert(inst, tree);
        &self.access_trees[&inst]
    }
}

// -- Free helpers ---------------------------------------------------------

fn is_int_constant(ctx: &Context, value: Value, expected: i64) -> bool {
    value
        .as_const()
        .and_then(|c| ctx.int_value_signed(c))
        .is_some_and(|v| v == expected)
}

fn is_float_constant(ctx: &Context, value: Value, expected: f64) -> bool {
    value
        .as_const()
        .and_then(|c| ctx.float_value(c))
        .is_some_and(|v| v == expected)
}

/// Integer or float constant equality against a small scalar.
fn is_constant_scalar(ctx: &Context, value: Value, expected: i64) -> bool {
    is_int_constant(ctx, value, expected) || is_float_constant(ctx, value, expected as f64)
}

fn is_all_ones(ctx: &Context, value: Value, bits: u32) -> bool {
    let mask = if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };
    value
        .as_const()
        .and_then(|c| ctx.int_value(c))
        .is_some_and(|v| v == mask)
}

fn negated_value(func: &Function, value: Value) -> Option<Value> {
    let inst = value.as_local().filter(|&i| func.value(i).is_inst())?;
    match *func.inst_data(inst) {
        InstData::UnaryArith {
            op: UnaryArithOp::Negate,
            operand,
        } => Some(operand),
        _ => None,
    }
}

/// Ratio-adjusts an array index counted in `index_type` elements to
/// `base_type` elements, when the sizes divide evenly.
fn adjust_array_index_to_type(
    ctx: &Context,
    base_type: TypeId,
    index_type: TypeId,
    index: i64,
) -> Option<i64> {
    if index == 0 {
        return Some(0);
    }
    let base_size = ctx.types.size(base_type) as i64;
    let curr_size = ctx.types.size(index_type) as i64;
    if base_size == curr_size {
        return Some(index);
    }
    if base_size == 0 || curr_size == 0 || base_size % curr_size != 0 && curr_size % base_size != 0
    {
        return None;
    }
    if base_size < curr_size {
        Some(index * (curr_size / base_size))
    } else {
        let denom = base_size / curr_size;
        if index % denom != 0 {
            return None;
        }
        Some(index / denom)
    }
}

/// Unwinds a chain of constant-indexed geps: the ultimate base pointer, the
/// summed byte offset, and the traversed geps outermost first.
pub(crate) fn recursive_gep_base_and_offset(
    ctx: &Context,
    func: &Function,
    pointer: Value,
) -> (Value, i64, Vec<ValueId>) {
    let mut geps = Vec::new();
    let mut current = pointer;
    let mut offset = 0i64;
    loop {
        let Some(inst) = current.as_local().filter(|&i| func.value(i).is_inst()) else {
            break;
        };
        let InstData::Gep {
            inbounds,
            base,
            index,
            ref members,
        } = *func.inst_data(inst)
        else {
            break;
        };
        let Some(byte_offset) = constant_byte_offset(ctx, inbounds, index, members) else {
            break;
        };
        geps.push(inst);
        offset += byte_offset as i64;
        current = base;
    }
    (current, offset, geps)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StaticCompare {
    Indeterminate,
    Equal,
    NotEqual,
}

/// Resolves a pointer equality at compile time where provenance allows.
fn pointer_static_compare(
    ctx: &Context,
    func: &Function,
    module: &Module,
    lhs: Value,
    rhs: Value,
) -> StaticCompare {
    if lhs == rhs {
        return StaticCompare::Equal;
    }
    let lhs_info = func.pointer_info(lhs);
    // A pointer known not null never equals the null pointer.
    if let Some(info) = lhs_info {
        if info.guaranteed_not_null
            && rhs
                .as_const()
                .is_some_and(|c| matches!(ctx.const_data(c), ConstData::NullPtr))
        {
            return StaticCompare::NotEqual;
        }
    }
    let (Some(lhs_info), Some(rhs_info)) = (lhs_info, func.pointer_info(rhs)) else {
        return StaticCompare::Indeterminate;
    };
    if let (Provenance::Static(a), Provenance::Static(b)) =
        (lhs_info.provenance, rhs_info.provenance)
    {
        if a == b {
            if let (Some(ao), Some(bo)) = (lhs_info.static_offset, rhs_info.static_offset) {
                return if ao == bo {
                    StaticCompare::Equal
                } else {
                    StaticCompare::NotEqual
                };
            }
        }
    }
    if !may_alias(func, module, lhs, rhs) {
        return StaticCompare::NotEqual;
    }
    StaticCompare::Indeterminate
}

fn extract_constant(ctx: &Context, base: Value, members: &[u32]) -> Option<Value> {
    let mut current = base.as_const()?;
    for &index in members {
        match ctx.const_data(current) {
            ConstData::Record { elems, .. } | ConstData::Array { elems, .. } => {
                current = *elems.get(index as usize)?;
            }
            _ => return None,
        }
    }
    Some(Value::Const(current))
}

fn record_or_array_constant(
    ctx: &mut Context,
    elems: Vec<crate::ir::context::ConstId>,
    ty: TypeId,
) -> crate::ir::context::ConstId {
    if ctx.types.is_array(ty) {
        ctx.array_constant(elems, ty)
    } else {
        ctx.record_constant(elems, ty)
    }
}

/// Destroys still-unplaced speculative instructions, newest first so chain
/// references unwind cleanly; anything still used is retried until a fixed
/// point.
fn erase_unplaced(func: &mut Function, list: &[ValueId]) {
    let mut remaining: Vec<ValueId> = list
        .iter()
        .rev()
        .copied()
        .filter(|&inst| !func.value(inst).dead && func.parent_block(inst).is_none())
        .collect();
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
}

/// The value below an entire insert chain.
fn chain_base(func: &Function, inst: ValueId) -> Value {
    let mut current = Value::Local(inst);
    while let Some(iv) = current.as_local().filter(|&i| func.value(i).is_inst()) {
        let InstData::InsertValue { base, .. } = *func.inst_data(iv) else {
            break;
        };
        current = base;
    }
    current
}

/// Maps `(base, inserted)` pairs to the insert instruction that combined
/// them, over the chain reachable from `inst`.
fn gather_iv_map(func: &Function, inst: ValueId) -> HashMap<(Value, Value), ValueId> {
    let mut map = HashMap::new();
    let mut stack = vec![Value::Local(inst)];
    while let Some(value) = stack.pop() {
        let Some(iv) = value.as_local().filter(|&i| func.value(i).is_inst()) else {
            continue;
        };
        let InstData::InsertValue { base, inserted, .. } = *func.inst_data(iv) else {
            continue;
        };
        if map.insert((base, inserted), iv).is_none() {
            stack.push(base);
            stack.push(inserted);
        }
    }
    map
}

/// Computes the cheapest insert chain that reproduces `node`'s aggregate,
/// either leaf-wise (full depth) or child-wise (one level). Returns the
/// resulting base value and the freshly created, still unplaced inserts.
fn rebuild_inserts(
    ctx: &mut Context,
    func: &mut Function,
    node: &crate::passes::access_tree::AccessTree,
    iv_map: &HashMap<(Value, Value), ValueId>,
    leaf_wise: bool,
) -> (Value, Vec<ValueId>) {
    // Find the base most leaves already extract from, so re-inserting those
    // leaves becomes unnecessary.
    let mut base_count: HashMap<Value, usize> = HashMap::new();
    let mut visit_leaf = |leaf: &crate::passes::access_tree::AccessTree, indices: &[u32]| {
        let Some(value) = leaf.value() else { return };
        let Some(ev) = value.as_local().filter(|&i| func.value(i).is_inst()) else {
            return;
        };
        let InstData::ExtractValue {
            base,
            members: ref ev_members,
        } = *func.inst_data(ev)
        else {
            return;
        };
        if ev_members.as_slice() == indices {
            *base_count.entry(base).or_default() += 1;
        }
    };
    if leaf_wise {
        node.leaf_walk(&mut visit_leaf);
    } else {
        for index in 0..node.num_children() {
            if let Some(child) = node.child_at(index) {
                visit_leaf(child, &[index as u32]);
            }
        }
    }
    let max_base = base_count
        .iter()
        .max_by_key(|&(_, count)| *count)
        .map(|(&base, _)| base);
    let mut base_value = max_base.unwrap_or_else(|| Value::Const(ctx.undef(node.ty())));
    // Collect the (value, path) pairs first; the emission below mutates the
    // function arena.
    let mut pending: Vec<(Option<Value>, Vec<u32>)> = Vec::new();
    if leaf_wise {
        node.leaf_walk(&mut |leaf, indices| {
            pending.push((leaf.value(), indices.to_vec()));
        });
    } else {
        for index in 0..node.num_children() {
            if let Some(child) = node.child_at(index) {
                pending.push((child.value(), vec![index as u32]));
            }
        }
    }
    let node_ty = node.ty();
    let mut inserts = Vec::new();
    for (value, indices) in pending {
        let Some(ins) = value else { continue };
        // A leaf that already is `extract(max_base, path)` is covered by the
        // base value itself.
        if let Some(ev) = ins.as_local().filter(|&i| func.value(i).is_inst()) {
            if let InstData::ExtractValue {
                base,
                members: ref ev_members,
            } = *func.inst_data(ev)
            {
                if ev_members.as_slice() == indices.as_slice() && Some(base) == max_base {
                    continue;
                }
            }
        }
        // Reuse an existing insert of the same pair at the same path.
        if let Some(&existing) = iv_map.get(&(base_value, ins)) {
            if let InstData::InsertValue {
                members: ref iv_members,
                ..
            } = *func.inst_data(existing)
            {
                if iv_members.as_slice() == indices.as_slice() {
                    base_value = Value::Local(existing);
                    continue;
                }
            }
        }
        let insert = func.new_inst(
            InstData::InsertValue {
                base: base_value,
                inserted: ins,
                members: SmallVec::from_slice(&indices),
            },
            node_ty,
            "iv",
        );
        inserts.push(insert);
        base_value = Value::Local(insert);
    }
    (base_value, inserts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::CompareMode;

    fn run_one(ctx: &mut Context, func: Function) -> (Module, FuncId) {
        let mut module = Module::new();
        let id = module.add_function(func);
        instcombine(ctx, &mut module, id);
        (module, id)
    }

    fn returned(func: &Function) -> Value {
        let mut value = None;
        for block in func.block_ids() {
            if let Some(term) = func.terminator(block) {
                if let InstData::Return { value: v } = *func.inst_data(term) {
                    value = Some(v);
                }
            }
        }
        value.expect("function returns")
    }

    #[test]
    fn test_add_zero_and_sub_self() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        b.add_new_block("entry");
        let p = b.param(0);
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        let a = b.arith(ArithOp::Add, p, zero, "a");
        let s = b.arith(ArithOp::Sub, a, a, "s");
        let t = b.arith(ArithOp::Add, p, s, "t");
        b.ret(t);
        let func = b.finish();
        let (module, id) = run_one(&mut ctx, func);
        let f = module.function(id);
        // x+0 => x, x-x => 0, x+0 => x: the function returns its parameter.
        assert_eq!(returned(f), Value::Local(f.params[0]));
    }

    #[test]
    fn test_constant_chain_merges() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        b.add_new_block("entry");
        let p = b.param(0);
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let two = Value::Const(b.ctx.int_constant(2, 64));
        let a = b.arith(ArithOp::Add, p, one, "a");
        let c = b.arith(ArithOp::Add, a, two, "c");
        b.ret(c);
        let func = b.finish();
        let (module, id) = run_one(&mut ctx, func);
        let f = module.function(id);
        let ret = returned(f).as_local().unwrap();
        let InstData::Arith { op, lhs, rhs } = *f.inst_data(ret) else {
            panic!("expected arithmetic result");
        };
        assert_eq!(op, ArithOp::Add);
        assert_eq!(lhs, Value::Local(f.params[0]));
        assert_eq!(ctx.int_value(rhs.as_const().unwrap()), Some(3));
    }

    #[test]
    fn test_div_by_self_and_rem_one() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        b.add_new_block("entry");
        let p = b.param(0);
        let d = b.arith(ArithOp::SDiv, p, p, "d");
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let r = b.arith(ArithOp::SRem, p, one, "r");
        let sum = b.arith(ArithOp::Add, d, r, "sum");
        b.ret(sum);
        let func = b.finish();
        let (module, id) = run_one(&mut ctx, func);
        let f = module.function(id);
        // 1 + 0 folds to the constant 1 via canonicalization and merging.
        let ret = returned(f);
        assert_eq!(ctx.int_value(ret.as_const().unwrap()), Some(1));
    }

    #[test]
    fn test_select_laws() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i1, i64t, i64t], i64t);
        b.add_new_block("entry");
        let t = Value::Const(b.ctx.bool_constant(true));
        let s1 = b.select(t, b.param(1), b.param(2), "s1");
        let s2 = b.select(b.param(0), s1, s1, "s2");
        b.ret(s2);
        let func = b.finish();
        let (module, id) = run_one(&mut ctx, func);
        let f = module.function(id);
        assert_eq!(returned(f), Value::Local(f.params[1]));
    }

    #[test]
    fn test_extract_of_insert() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let rec = ctx.anonymous_struct(&[i64t, i64t]);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t, i64t], i64t);
        b.add_new_block("entry");
        let undef = Value::Const(b.ctx.undef(rec));
        let iv0 = b.insert_value(undef, b.param(0), &[0u32], "iv0");
        let iv1 = b.insert_value(iv0, b.param(1), &[1u32], "iv1");
        let ev = b.extract_value(iv1, &[1u32], "ev");
        b.ret(ev);
        let func = b.finish();
        let (module, id) = run_one(&mut ctx, func);
        let f = module.function(id);
        assert_eq!(returned(f), Value::Local(f.params[1]));
    }

    #[test]
    fn test_bitcast_of_bitcast_collapses() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let f64t = ctx.float_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        b.add_new_block("entry");
        let c1 = b.conv(Conversion::Bitcast, b.param(0), f64t, "c1");
        let c2 = b.conv(Conversion::Bitcast, c1, i64t, "c2");
        b.ret(c2);
        let func = b.finish();
        let (module, id) = run_one(&mut ctx, func);
        let f = module.function(id);
        assert_eq!(returned(f), Value::Local(f.params[0]));
    }

    #[test]
    fn test_pointer_compare_uses_provenance() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i1 = ctx.bool_type();
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i1, );
        b.add_new_block("entry");
        let a = b.alloca(i64t, "a");
        let c = b.alloca(i64t, "c");
        let one = Value::Const(b.ctx.int_constant(1, 64));
        b.store(a, one);
        b.store(c, one);
        let cmp = b.cmp(CompareMode::Unsigned, CompareOp::Equal, a, c, "cmp");
        b.ret(cmp);
        let mut module = Module::new();
        let id = module.add_function(b.finish());
        crate::passes::pointer_analysis::pointer_analysis(&mut ctx, &mut module, id);
        instcombine(&mut ctx, &mut module, id);
        let f = module.function(id);
        let ret = returned(f);
        assert_eq!(
            ctx.int_value(ret.as_const().unwrap()),
            Some(0),
            "distinct allocas compare unequal"
        );
    }

    #[test]
    fn test_load_from_constant_global() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let arr = ctx.array_type(i64t, 3);
        let elems: Vec<_> = [10u64, 20, 30]
            .iter()
            .map(|&v| ctx.int_constant(v, 64))
            .collect();
        let init = ctx.array_constant(elems, arr);
        let mut module = Module::new();
        let g = module.add_global(crate::ir::ir::GlobalVariable {
            name: "table".to_string(),
            value_type: arr,
            initializer: init,
            mutable: false,
        });
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        b.add_new_block("entry");
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let p = b.gep(i64t, Value::Global(g), one, &[], "p");
        let v = b.load(p, i64t, "v");
        b.ret(v);
        let id = module.add_function(b.finish());
        instcombine(&mut ctx, &mut module, id);
        let f = module.function(id);
        let ret = returned(f);
        assert_eq!(ctx.int_value(ret.as_const().unwrap()), Some(20));
    }
}
