//! IR construction.
//!
//! [`FunctionBuilder`] wraps a function under construction together with the
//! context, tracks a current insertion block, and parks allocas on a deferred
//! list: front-ends and passes can create local variables at any point, and
//! [`FunctionBuilder::insert_allocas`] moves the ones that ended up used into
//! the entry block's alloca prefix in creation order.

use smallvec::SmallVec;

use crate::ir::context::{ConstId, Context};
use crate::ir::ir::{
    ArithOp, BlockId, Callee, CompareMode, CompareOp, Conversion, Function, InstData,
    MemberIndices, UnaryArithOp, Value, ValueId,
};
use crate::ir::types::{TypeData, TypeId};

pub struct FunctionBuilder<'a> {
    pub ctx: &'a mut Context,
    pub func: Function,
    current: Option<BlockId>,
    deferred_allocas: Vec<ValueId>,
}

impl<'a> FunctionBuilder<'a> {
    pub fn new(
        ctx: &'a mut Context,
        name: impl Into<String>,
        param_types: &[TypeId],
        return_type: TypeId,
    ) -> Self {
        FunctionBuilder {
            func: Function::new(name, param_types, return_type),
            ctx,
            current: None,
            deferred_allocas: Vec::new(),
        }
    }

    /// Wraps an existing function to keep appending to it.
    pub fn resume(ctx: &'a mut Context, func: Function, block: BlockId) -> Self {
        FunctionBuilder {
            ctx,
            func,
            current: Some(block),
            deferred_allocas: Vec::new(),
        }
    }

    pub fn param(&self, index: usize) -> Value {
        Value::Local(self.func.params[index])
    }

    pub fn add_new_block(&mut self, name: &str) -> BlockId {
        let block = self.func.add_block(name);
        self.current = Some(block);
        block
    }

    pub fn select_block(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    pub fn current_block(&self) -> BlockId {
        self.current.expect("no current block")
    }

    fn push(&mut self, data: InstData, ty: TypeId, name: &str) -> Value {
        let block = self.current_block();
        Value::Local(self.func.push_inst(block, data, ty, name))
    }

    // -- Locals -------------------------------------------------------------

    /// Creates a deferred alloca for one element of `ty`. The instruction is
    /// unplaced until [`FunctionBuilder::insert_allocas`] runs.
    pub fn alloca(&mut self, ty: TypeId, name: &str) -> Value {
        let one = self.ctx.int_constant(1, 32);
        self.alloca_array(ty, Value::Const(one), name)
    }

    pub fn alloca_array(&mut self, elem: TypeId, count: Value, name: &str) -> Value {
        let ptr = self.ctx.ptr_type();
        let id = self.func.new_inst(
            InstData::Alloca {
                allocated: elem,
                count,
            },
            ptr,
            name,
        );
        self.deferred_allocas.push(id);
        Value::Local(id)
    }

    /// Spills `value` into fresh stack memory and returns the address.
    pub fn store_to_memory(&mut self, value: Value, name: &str) -> Value {
        let ty = self.func.value_type(value, self.ctx);
        let addr = self.alloca(ty, &format!("{name}.addr"));
        self.store(addr, value);
        addr
    }

    /// Moves all deferred allocas that are still used into the entry block
    /// prefix, preserving creation order. Unused ones are discarded.
    pub fn insert_allocas(&mut self) {
        let entry = self.func.entry();
        let mut index = 0usize;
        for id in std::mem::take(&mut self.deferred_allocas) {
            if self.func.is_unused(id) {
                self.func.erase_inst(id);
                continue;
            }
            self.func.place_inst(entry, index, id);
            index += 1;
        }
    }

    /// Finalizes construction: inserts deferred allocas and yields the
    /// function.
    pub fn finish(mut self) -> Function {
        self.insert_allocas();
        self.func
    }

    // -- Instructions -------------------------------------------------------

    pub fn load(&mut self, addr: Value, ty: TypeId, name: &str) -> Value {
        self.push(InstData::Load { addr }, ty, name)
    }

    pub fn store(&mut self, addr: Value, value: Value) {
        let void = self.ctx.void_type();
        self.push(InstData::Store { addr, value }, void, "");
    }

    pub fn gep(
        &mut self,
        inbounds: TypeId,
        base: Value,
        index: Value,
        members: &[u32],
        name: &str,
    ) -> Value {
        let ptr = self.ctx.ptr_type();
        self.push(
            InstData::Gep {
                inbounds,
                base,
                index,
                members: MemberIndices::from_slice(members),
            },
            ptr,
            name,
        )
    }

    pub fn arith(&mut self, op: ArithOp, lhs: Value, rhs: Value, name: &str) -> Value {
        let ty = self.func.value_type(lhs, self.ctx);
        self.push(InstData::Arith { op, lhs, rhs }, ty, name)
    }

    pub fn unary_arith(&mut self, op: UnaryArithOp, operand: Value, name: &str) -> Value {
        let ty = self.func.value_type(operand, self.ctx);
        self.push(InstData::UnaryArith { op, operand }, ty, name)
    }

    pub fn cmp(
        &mut self,
        mode: CompareMode,
        op: CompareOp,
        lhs: Value,
        rhs: Value,
        name: &str,
    ) -> Value {
        let i1 = self.ctx.bool_type();
        self.push(InstData::Cmp { mode, op, lhs, rhs }, i1, name)
    }

    pub fn conv(&mut self, conv: Conversion, operand: Value, target: TypeId, name: &str) -> Value {
        self.push(InstData::Conv { conv, operand }, target, name)
    }

    pub fn call(
        &mut self,
        callee: Callee,
        args: &[Value],
        return_type: TypeId,
        name: &str,
    ) -> Value {
        self.push(
            InstData::Call {
                callee,
                args: SmallVec::from_slice(args),
            },
            return_type,
            name,
        )
    }

    pub fn phi(&mut self, args: &[(BlockId, Value)], name: &str) -> Value {
        assert!(!args.is_empty(), "phi needs at least one incoming value");
        let ty = self.func.value_type(args[0].1, self.ctx);
        let block = self.current_block();
        let id = self.func.insert_phi(
            block,
            InstData::Phi {
                args: SmallVec::from_slice(args),
            },
            ty,
            name,
        );
        Value::Local(id)
    }

    pub fn select(&mut self, cond: Value, then_value: Value, else_value: Value, name: &str) -> Value {
        let ty = self.func.value_type(then_value, self.ctx);
        self.push(
            InstData::Select {
                cond,
                then_value,
                else_value,
            },
            ty,
            name,
        )
    }

    pub fn extract_value(&mut self, base: Value, members: &[u32], name: &str) -> Value {
        let members = MemberIndices::from_slice(members);
        let base_ty = self.func.value_type(base, self.ctx);
        let (ty, _) = self.ctx.types.inner_type_and_offset(base_ty, &members);
        self.push(InstData::ExtractValue { base, members }, ty, name)
    }

    pub fn insert_value(&mut self, base: Value, inserted: Value, members: &[u32], name: &str) -> Value {
        let ty = self.func.value_type(base, self.ctx);
        self.push(
            InstData::InsertValue {
                base,
                inserted,
                members: MemberIndices::from_slice(members),
            },
            ty,
            name,
        )
    }

    // -- Terminators --------------------------------------------------------

    /// `goto target`; registers the edge on the target's predecessor list.
    pub fn goto(&mut self, target: BlockId) {
        let block = self.current_block();
        self.func
            .set_terminator(block, InstData::Goto { target }, self.ctx);
        self.func.add_predecessor(target, block);
    }

    pub fn branch(&mut self, cond: Value, then_target: BlockId, else_target: BlockId) {
        let block = self.current_block();
        self.func.set_terminator(
            block,
            InstData::Branch {
                cond,
                then_target,
                else_target,
            },
            self.ctx,
        );
        self.func.add_predecessor(then_target, block);
        self.func.add_predecessor(else_target, block);
    }

    pub fn ret(&mut self, value: Value) {
        let block = self.current_block();
        self.func
            .set_terminator(block, InstData::Return { value }, self.ctx);
    }

    pub fn ret_void(&mut self) {
        let void = self.ctx.void_type();
        let undef = self.ctx.undef(void);
        self.ret(Value::Const(undef));
    }

    // -- Aggregates ---------------------------------------------------------

    /// Builds a value of struct type `ty` by chaining `insert_value`s over
    /// `members`. Element instructions are named `<name>.elem.<i>`.
    pub fn build_structure(&mut self, ty: TypeId, members: &[Value], name: &str) -> Value {
        assert_eq!(self.ctx.types.num_members(ty), members.len());
        let undef = self.ctx.undef(ty);
        let mut value = Value::Const(undef);
        for (index, &member) in members.iter().enumerate() {
            value = self.insert_value(
                value,
                member,
                &[index as u32],
                &format!("{name}.elem.{index}"),
            );
        }
        value
    }

    /// Packs the given values into an anonymous tuple. A single value is
    /// returned unchanged.
    pub fn pack_values(&mut self, values: &[Value], name: &str) -> Value {
        match values {
            [] => panic!("cannot pack zero values"),
            [single] => *single,
            values => {
                let member_types: Vec<TypeId> = values
                    .iter()
                    .map(|&v| self.func.value_type(v, self.ctx))
                    .collect();
                let ty = self.ctx.anonymous_struct(&member_types);
                self.build_structure(ty, values, name)
            }
        }
    }

    /// Left-folds `op` over `values`.
    pub fn fold_values(&mut self, op: ArithOp, values: &[Value], name: &str) -> Value {
        assert!(!values.is_empty());
        let mut result = values[0];
        for &value in &values[1..] {
            result = self.arith(op, result, value, name);
        }
        result
    }

    /// The type-appropriate zero: integer 0, float 0.0, null pointer, or the
    /// recursive zero of every record/array member.
    pub fn make_zero_constant(&mut self, ty: TypeId) -> ConstId {
        match self.ctx.types.data(ty).clone() {
            TypeData::Int { bits } => self.ctx.int_constant(0, bits),
            TypeData::Float { bits } => self.ctx.float_constant(0.0, bits),
            TypeData::Ptr => self.ctx.nullpointer(),
            TypeData::Array { elem, count } => {
                let zero = self.make_zero_constant(elem);
                self.ctx.array_constant(vec![zero; count], ty)
            }
            TypeData::Record { ref members, .. } => {
                let elems: Vec<ConstId> = members
                    .clone()
                    .iter()
                    .map(|m| self.make_zero_constant(m.ty))
                    .collect();
                self.ctx.record_constant(elems, ty)
            }
            TypeData::Void => panic!("no zero constant of void type"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::context::ConstData;

    #[test]
    fn test_deferred_allocas_filtered_and_ordered() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        b.add_new_block("entry");
        let a = b.alloca(i64t, "a");
        let _unused = b.alloca(i64t, "b");
        let c = b.alloca(i64t, "c");
        let one = Value::Const(b.ctx.int_constant(1, 64));
        b.store(a, one);
        let v = b.load(c, i64t, "v");
        b.ret(v);
        let f = b.finish();
        let entry = f.entry();
        let insts = &f.block(entry).insts;
        assert!(f.inst_data(insts[0]).is_alloca());
        assert!(f.inst_data(insts[1]).is_alloca());
        assert!(!f.inst_data(insts[2]).is_alloca());
        assert_eq!(f.value(insts[0]).name.as_deref(), Some("a"));
        assert_eq!(f.value(insts[1]).name.as_deref(), Some("c"));
    }

    #[test]
    fn test_pack_values_builds_anonymous_tuple() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i32t = ctx.int_type(32);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t, i32t], i64t);
        b.add_new_block("entry");
        let p0 = b.param(0);
        let p1 = b.param(1);
        let packed = b.pack_values(&[p0, p1], "pair");
        let ty = b.func.value_type(packed, b.ctx);
        assert!(b.ctx.types.is_record(ty));
        assert_eq!(b.ctx.types.num_members(ty), 2);
        let single = b.pack_values(&[p0], "one");
        assert_eq!(single, p0);
    }

    #[test]
    fn test_make_zero_constant_recurses() {
        let mut ctx = Context::new();
        let i32t = ctx.int_type(32);
        let f64t = ctx.float_type(64);
        let rec = ctx.anonymous_struct(&[i32t, f64t]);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i32t);
        let zero = b.make_zero_constant(rec);
        match b.ctx.const_data(zero) {
            ConstData::Record { elems, .. } => {
                assert_eq!(elems.len(), 2);
                assert_eq!(b.ctx.int_value(elems[0]), Some(0));
                assert_eq!(b.ctx.float_value(elems[1]), Some(0.0));
            }
            other => panic!("expected record constant, got {other:?}"),
        }
    }
}
