//! Lowering from SSA IR to MIR.
//!
//! Each function is visited once. Parameters bind to the bottom of the
//! register file; every instruction result gets a run of word-sized
//! registers. Wide loads and stores emit one MIR access per 8-byte slice
//! (the last slice carries the residual width). Geps lower to `lea` only
//! when some user is not a load or store, since memory accesses embed the
//! address computation themselves. A branch or select directly after the
//! compare it tests reuses the machine's compare flags; calls clobber the
//! flags and break the reuse.

use hashbrown::HashMap;

use crate::backend::mir::{
    MemoryAddress, MirBlockId, MirCallee, MirFunction, MirInst, MirModule, MirValue, Reg,
};
use crate::backend::static_data::{layout_globals, StaticData};
use crate::ir::context::{ConstData, Context};
use crate::ir::ir::{
    ArithOp, BlockId, Callee, CompareOp, Conversion, Function, InstData, Module, Value, ValueId,
};
use crate::ir::types::TypeId;

pub fn lower_to_mir(ctx: &Context, module: &Module) -> MirModule {
    let static_data = layout_globals(ctx, module);
    let mut result = MirModule {
        static_data: static_data.image.clone(),
        address_placeholders: static_data.placeholders.clone(),
        ..Default::default()
    };
    // Declare every function first so calls can reference them.
    for func in &module.functions {
        let num_param_regs: usize = func
            .params
            .iter()
            .map(|&p| num_words(ctx, func.local_type(p)))
            .sum();
        let num_retval_regs = num_words(ctx, func.return_type);
        let mut mir_func = MirFunction {
            name: func.name.clone(),
            num_param_regs: num_param_regs as u32,
            num_retval_regs: num_retval_regs as u32,
            ..Default::default()
        };
        mir_func.alloc_regs(num_param_regs);
        result.functions.push(mir_func);
    }
    for (index, func) in module.functions.iter().enumerate() {
        let mut gen = FunctionLowering {
            ctx,
            module,
            func,
            statics: &static_data,
            mir: std::mem::take(&mut result.functions[index]),
            value_map: HashMap::new(),
            block_map: HashMap::new(),
            current: MirBlockId(0),
            last_compare: None,
        };
        gen.run();
        result.functions[index] = gen.mir;
    }
    result
}

pub(crate) fn num_words(ctx: &Context, ty: TypeId) -> usize {
    ctx.types.size(ty).div_ceil(8)
}

/// Width of word slice `index` when copying `num_bytes` bytes.
fn slice_width(num_bytes: usize, index: usize, words: usize) -> u8 {
    if index + 1 != words {
        return 8;
    }
    let residue = num_bytes % 8;
    if residue == 0 {
        8
    } else {
        residue as u8
    }
}

struct FunctionLowering<'a> {
    ctx: &'a Context,
    module: &'a Module,
    func: &'a Function,
    statics: &'a StaticData,
    mir: MirFunction,
    value_map: HashMap<Value, MirValue>,
    block_map: HashMap<BlockId, MirBlockId>,
    current: MirBlockId,
    /// The last compare emitted in the current block whose flags are still
    /// valid.
    last_compare: Option<ValueId>,
}

impl<'a> FunctionLowering<'a> {
    fn run(&mut self) {
        let blocks = self.func.block_ids();
        for &block in &blocks {
            let mir_block = self.mir.add_block(self.func.block(block).name.clone());
            self.block_map.insert(block, mir_block);
        }
        // Parameters live in the bottom registers.
        let mut cursor = 0u32;
        for &param in &self.func.params {
            self.value_map
                .insert(Value::Local(param), MirValue::Reg(Reg(cursor)));
            cursor += num_words(self.ctx, self.func.local_type(param)) as u32;
        }
        for &block in &blocks {
            self.current = self.block_map[&block];
            self.last_compare = None;
            let preds: Vec<MirBlockId> = self
                .func
                .predecessors(block)
                .iter()
                .map(|p| self.block_map[p])
                .collect();
            let succs: Vec<MirBlockId> = self
                .func
                .successors(block)
                .iter()
                .map(|s| self.block_map[s])
                .collect();
            let mir_block = self.mir.block_mut(self.current);
            mir_block.preds = preds;
            mir_block.succs = succs;
            for inst in self.func.block(block).insts.clone() {
                self.lower_inst(inst);
            }
        }
    }

    fn emit(&mut self, inst: MirInst) {
        self.mir.block_mut(self.current).insts.push(inst);
    }

    // -- Value resolution ---------------------------------------------------

    fn resolve(&mut self, value: Value) -> MirValue {
        if let Some(&resolved) = self.value_map.get(&value) {
            return resolved;
        }
        match value {
            Value::Local(id) => {
                let ty = self.func.local_type(id);
                if self.ctx.types.is_void(ty) {
                    return MirValue::Undef;
                }
                let reg = self.mir.alloc_regs(num_words(self.ctx, ty));
                self.value_map.insert(value, MirValue::Reg(reg));
                MirValue::Reg(reg)
            }
            Value::Const(c) => {
                let resolved = match self.ctx.const_data(c) {
                    ConstData::Int { value, .. } => MirValue::Const {
                        value: *value,
                        width: self.ctx.types.size(self.ctx.const_type(c)) as u8,
                    },
                    ConstData::Float { bits, width } => MirValue::Const {
                        value: *bits,
                        width: (*width / 8) as u8,
                    },
                    ConstData::Undef { .. } => MirValue::Undef,
                    ConstData::NullPtr => MirValue::Const { value: 0, width: 8 },
                    ConstData::FunctionPtr { func } => MirValue::Func(*func),
                    ConstData::Array { .. } | ConstData::Record { .. } => {
                        return self.materialize_aggregate(c);
                    }
                };
                self.value_map.insert(value, resolved);
                resolved
            }
            Value::Global(g) => {
                // A fresh register holding the encoded static address.
                let address = self.statics.addresses[&g];
                let dest = self.mir.alloc_regs(1);
                self.emit(MirInst::Copy {
                    dest,
                    source: MirValue::Const {
                        value: address,
                        width: 8,
                    },
                    width: 8,
                });
                MirValue::Reg(dest)
            }
            Value::Function(f) => MirValue::Func(f),
            Value::ExtFunction(_) => MirValue::Const { value: 0, width: 8 },
        }
    }

    /// Copies an aggregate constant's byte image into a register run.
    fn materialize_aggregate(&mut self, c: crate::ir::context::ConstId) -> MirValue {
        let ty = self.ctx.const_type(c);
        let size = self.ctx.types.size(ty);
        let words = num_words(self.ctx, ty);
        let mut bytes = vec![0u8; words * 8];
        crate::backend::static_data::write_constant_bytes(self.ctx, c, &mut bytes[..size]);
        let reg = self.mir.alloc_regs(words);
        for word in 0..words {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[word * 8..word * 8 + 8]);
            self.emit(MirInst::Copy {
                dest: reg.advanced(word),
                source: MirValue::Const {
                    value: u64::from_le_bytes(chunk),
                    width: 8,
                },
                width: 8,
            });
        }
        MirValue::Reg(reg)
    }

    fn resolve_to_register(&mut self, value: Value) -> Reg {
        let resolved = self.resolve(value);
        if let MirValue::Reg(reg) = resolved {
            return reg;
        }
        let ty = self.func.value_type(value, self.ctx);
        let words = num_words(self.ctx, ty).max(1);
        let reg = self.mir.alloc_regs(words);
        self.gen_copy(reg, resolved, self.ctx.types.size(ty).max(1));
        reg
    }

    /// Word-sliced copy; returns the register past the destination run.
    fn gen_copy(&mut self, dest: Reg, source: MirValue, num_bytes: usize) -> Reg {
        let words = num_bytes.div_ceil(8);
        let mut dest = dest;
        let mut source = source;
        for word in 0..words {
            self.emit(MirInst::Copy {
                dest,
                source,
                width: slice_width(num_bytes, word, words),
            });
            dest = dest.next();
            source = source.next();
        }
        dest
    }

    /// The condition for a branch/select on `cond`: reuses the live compare
    /// flags when `cond` is the compare just emitted in this block,
    /// otherwise emits a `test`.
    fn read_condition(&mut self, cond: Value) -> CompareOp {
        if let Some(compare) = self.last_compare {
            if cond == Value::Local(compare) {
                if let InstData::Cmp { op, .. } = *self.func.inst_data(compare) {
                    return op;
                }
            }
        }
        let reg = self.resolve_to_register(cond);
        self.emit(MirInst::Test {
            operand: MirValue::Reg(reg),
            mode: crate::ir::ir::CompareMode::Unsigned,
            width: 1,
        });
        self.last_compare = None;
        CompareOp::NotEqual
    }

    // -- Addressing ---------------------------------------------------------

    fn compute_address(&mut self, value: Value) -> Option<MemoryAddress> {
        if let Some(gep) = value.as_local().filter(|&v| self.func.value(v).is_inst()) {
            if matches!(self.func.inst_data(gep), InstData::Gep { .. }) {
                return self.compute_gep(gep);
            }
        }
        match self.resolve(value) {
            MirValue::Undef => None,
            resolved => {
                let base = match resolved {
                    MirValue::Reg(reg) => reg,
                    other => {
                        let reg = self.mir.alloc_regs(1);
                        self.gen_copy(reg, other, 8);
                        reg
                    }
                };
                Some(MemoryAddress::plain(base))
            }
        }
    }

    fn compute_gep(&mut self, gep: ValueId) -> Option<MemoryAddress> {
        let InstData::Gep {
            inbounds,
            base,
            index,
            ref members,
        } = *self.func.inst_data(gep)
        else {
            unreachable!()
        };
        let members = members.clone();
        let base = match self.resolve(base) {
            MirValue::Undef => return None,
            MirValue::Reg(reg) => reg,
            other => {
                let reg = self.mir.alloc_regs(1);
                self.gen_copy(reg, other, 8);
                reg
            }
        };
        let dyn_offset = {
            let const_index = index.as_const().and_then(|c| self.ctx.int_value(c));
            if const_index == Some(0) {
                None
            } else {
                match self.resolve(index) {
                    MirValue::Reg(reg) => Some(reg),
                    other => {
                        let reg = self.mir.alloc_regs(1);
                        self.gen_copy(reg, other, 8);
                        Some(reg)
                    }
                }
            }
        };
        let elem_size = self.ctx.types.size(inbounds) as u32;
        let (_, inner_offset) = self.ctx.types.inner_type_and_offset(inbounds, &members);
        Some(MemoryAddress {
            base,
            dyn_offset,
            elem_size,
            offset_term: inner_offset as u32,
        })
    }

    // -- Instruction lowering ----------------------------------------------

    fn lower_inst(&mut self, inst: ValueId) {
        match self.func.inst_data(inst).clone() {
            InstData::Alloca { allocated, count } => {
                let count = count
                    .as_const()
                    .and_then(|c| self.ctx.int_value(c))
                    .expect("alloca counts are constant by lowering time");
                let bytes =
                    (self.ctx.types.size(allocated) * count as usize).div_ceil(8) * 8;
                let dest = self.dest_reg(inst);
                self.emit(MirInst::Lisp {
                    dest,
                    bytes: MirValue::Const {
                        value: bytes as u64,
                        width: 2,
                    },
                });
            }
            InstData::Store { addr, value } => {
                let Some(dest) = self.compute_address(addr) else {
                    return;
                };
                let source = self.resolve_to_register(value);
                let num_bytes = self.ctx.types.size(self.func.value_type(value, self.ctx));
                let words = num_bytes.div_ceil(8);
                let mut source = MirValue::Reg(source);
                let mut dest = dest;
                for word in 0..words {
                    self.emit(MirInst::Store {
                        addr: dest,
                        source,
                        width: slice_width(num_bytes, word, words),
                    });
                    dest = dest.with_added_offset(8);
                    source = source.next();
                }
            }
            InstData::Load { addr } => {
                let Some(src) = self.compute_address(addr) else {
                    return;
                };
                let mut dest = self.dest_reg(inst);
                let num_bytes = self.ctx.types.size(self.func.local_type(inst));
                let words = num_bytes.div_ceil(8);
                let mut src = src;
                for word in 0..words {
                    self.emit(MirInst::Load {
                        dest,
                        addr: src,
                        width: slice_width(num_bytes, word, words),
                    });
                    dest = dest.next();
                    src = src.with_added_offset(8);
                }
            }
            InstData::Conv { conv, operand } => self.lower_conv(inst, conv, operand),
            InstData::Cmp { mode, lhs, rhs, .. } => {
                let lhs_reg = self.resolve_to_register(lhs);
                let rhs_val = self.resolve(rhs);
                let width = self.ctx.types.size(self.func.value_type(lhs, self.ctx)) as u8;
                self.emit(MirInst::Compare {
                    lhs: MirValue::Reg(lhs_reg),
                    rhs: rhs_val,
                    mode,
                    width,
                });
                let InstData::Cmp { op, .. } = *self.func.inst_data(inst) else {
                    unreachable!()
                };
                let dest = self.dest_reg(inst);
                self.emit(MirInst::Set { dest, op });
                self.last_compare = Some(inst);
            }
            InstData::UnaryArith { op, operand } => {
                let operand_reg = self.resolve_to_register(operand);
                let dest = self.dest_reg(inst);
                self.emit(MirInst::UnaryArith {
                    dest,
                    operand: MirValue::Reg(operand_reg),
                    op,
                    width: 8,
                });
            }
            InstData::Arith { op, lhs, rhs } => {
                let lhs_reg = self.resolve_to_register(lhs);
                let mut rhs_val = self.resolve(rhs);
                // Shifts take their amount as an 8-bit literal.
                if op.is_shift() {
                    if let MirValue::Const { value, .. } = rhs_val {
                        rhs_val = MirValue::Const { value, width: 1 };
                    }
                }
                let mut width = self.ctx.types.size(self.func.value_type(lhs, self.ctx));
                if width < 4 {
                    width = 8;
                    if !op.is_shift() {
                        if let MirValue::Const { value, .. } = rhs_val {
                            rhs_val = MirValue::Const { value, width: 8 };
                        }
                    }
                }
                let dest = self.dest_reg(inst);
                self.emit(MirInst::ValueArith {
                    dest,
                    lhs: MirValue::Reg(lhs_reg),
                    rhs: rhs_val,
                    op,
                    width: width as u8,
                });
            }
            InstData::Goto { target } => {
                let target = self.block_map[&target];
                self.emit(MirInst::Jump { target });
            }
            InstData::Branch {
                cond,
                then_target,
                else_target,
            } => {
                let condition = self.read_condition(cond);
                let then_target = self.block_map[&then_target];
                let else_target = self.block_map[&else_target];
                self.emit(MirInst::CondJump {
                    target: else_target,
                    cond: condition.inverse(),
                });
                self.emit(MirInst::Jump {
                    target: then_target,
                });
            }
            InstData::Call { ref callee, ref args } => {
                let mir_callee = match *callee {
                    Callee::Function(f) => MirCallee::Func(f),
                    Callee::Ext(e) => {
                        let ext = self.module.ext_function(e);
                        MirCallee::Ext {
                            slot: ext.slot,
                            index: ext.index,
                        }
                    }
                    Callee::Indirect(v) => {
                        let resolved = self.resolve(v);
                        MirCallee::Indirect(resolved)
                    }
                };
                let mut mir_args = Vec::new();
                for &arg in args.clone().iter() {
                    let words = num_words(self.ctx, self.func.value_type(arg, self.ctx));
                    let mut resolved = self.resolve(arg);
                    for _ in 0..words.max(1) {
                        mir_args.push(resolved);
                        resolved = resolved.next();
                    }
                }
                let ret_words = num_words(self.ctx, self.func.local_type(inst));
                let dest = if ret_words == 0 {
                    None
                } else {
                    Some(self.dest_reg(inst))
                };
                self.emit(MirInst::Call {
                    callee: mir_callee,
                    args: mir_args,
                    dest,
                    num_dests: ret_words as u32,
                });
                // Calls clobber the compare flags.
                self.last_compare = None;
            }
            InstData::Return { value } => {
                let words = num_words(self.ctx, self.func.value_type(value, self.ctx));
                let mut args = Vec::new();
                let mut resolved = if words > 0 {
                    self.resolve(value)
                } else {
                    MirValue::Undef
                };
                for _ in 0..words {
                    args.push(resolved);
                    resolved = resolved.next();
                }
                self.emit(MirInst::Return { args });
            }
            InstData::Phi { ref args } => {
                let mut dest = self.dest_reg(inst);
                let mut mir_args: Vec<MirValue> = args
                    .clone()
                    .iter()
                    .map(|&(_, v)| self.resolve(v))
                    .collect();
                let num_bytes = self.ctx.types.size(self.func.local_type(inst));
                let words = num_bytes.div_ceil(8);
                for word in 0..words {
                    // Phi copies stay in the phi prefix of the block.
                    let position = self
                        .mir
                        .block(self.current)
                        .insts
                        .iter()
                        .position(|i| !matches!(i, MirInst::Phi { .. }))
                        .unwrap_or(self.mir.block(self.current).insts.len());
                    let inst = MirInst::Phi {
                        dest,
                        args: mir_args.clone(),
                        width: slice_width(num_bytes, word, words),
                    };
                    self.mir
                        .block_mut(self.current)
                        .insts
                        .insert(position, inst);
                    dest = dest.next();
                    for arg in &mut mir_args {
                        *arg = arg.next();
                    }
                }
            }
            InstData::Gep { .. } => {
                let all_users_are_memory_accesses =
                    self.func.users(inst).iter().all(|&user| {
                        match self.func.inst_data(user) {
                            InstData::Load { .. } => true,
                            InstData::Store { value, .. } => *value != Value::Local(inst),
                            _ => false,
                        }
                    });
                if all_users_are_memory_accesses {
                    // Loads and stores compute their addresses themselves.
                    return;
                }
                let Some(address) = self.compute_gep(inst) else {
                    return;
                };
                let dest = self.dest_reg(inst);
                self.emit(MirInst::Lea { dest, addr: address });
            }
            InstData::ExtractValue { base, ref members } => {
                self.lower_extract(inst, base, &members.clone())
            }
            InstData::InsertValue {
                base,
                inserted,
                ref members,
            } => self.lower_insert(inst, base, inserted, &members.clone()),
            InstData::Select {
                cond,
                then_value,
                else_value,
            } => {
                let condition = self.read_condition(cond);
                let mut then_val = self.resolve(then_value);
                let mut else_val = self.resolve(else_value);
                let mut dest = self.dest_reg(inst);
                let num_bytes = self.ctx.types.size(self.func.local_type(inst));
                let words = num_bytes.div_ceil(8);
                for word in 0..words {
                    self.emit(MirInst::Select {
                        dest,
                        then_value: then_val,
                        else_value: else_val,
                        cond: condition,
                        width: slice_width(num_bytes, word, words),
                    });
                    dest = dest.next();
                    then_val = then_val.next();
                    else_val = else_val.next();
                }
            }
        }
    }

    fn dest_reg(&mut self, inst: ValueId) -> Reg {
        match self.resolve(Value::Local(inst)) {
            MirValue::Reg(reg) => reg,
            _ => unreachable!("non-void instructions resolve to registers"),
        }
    }

    fn lower_conv(&mut self, inst: ValueId, conv: Conversion, operand: Value) {
        match conv {
            Conversion::Zext | Conversion::Trunc | Conversion::Bitcast => {
                // These are no-ops at the register level: constants fold,
                // registers alias.
                let resolved = self.resolve(operand);
                match resolved {
                    MirValue::Const { value, .. } => {
                        let to_ty = self.func.local_type(inst);
                        let to_bits = (self.ctx.types.size(to_ty) * 8).min(64) as u32;
                        let folded = crate::ir::context::truncate(value, to_bits);
                        self.value_map.insert(
                            Value::Local(inst),
                            MirValue::Const {
                                value: folded,
                                width: self.ctx.types.size(to_ty) as u8,
                            },
                        );
                    }
                    MirValue::Undef => {
                        self.value_map.insert(Value::Local(inst), MirValue::Undef);
                    }
                    other => {
                        self.value_map.insert(Value::Local(inst), other);
                    }
                }
            }
            _ => {
                let from_ty = self.func.value_type(operand, self.ctx);
                let from_bits = self.ctx.types.bitwidth(from_ty) as u16;
                let to_bits = self.ctx.types.bitwidth(self.func.local_type(inst)) as u16;
                let operand = self.resolve(operand);
                let dest = self.dest_reg(inst);
                self.emit(MirInst::Conv {
                    dest,
                    operand,
                    conv,
                    from_bits,
                    to_bits,
                });
            }
        }
    }

    fn lower_extract(&mut self, inst: ValueId, base: Value, members: &[u32]) {
        let source = self.resolve(base);
        let source = match source {
            MirValue::Undef => {
                self.value_map.insert(Value::Local(inst), MirValue::Undef);
                return;
            }
            MirValue::Reg(reg) => reg,
            other => {
                // Aggregate constants were materialized into registers; a
                // scalar leftover is copied.
                let reg = self.mir.alloc_regs(1);
                self.gen_copy(reg, other, 8);
                reg
            }
        };
        let outer_ty = self.func.value_type(base, self.ctx);
        let (inner_ty, inner_byte_begin) = self.ctx.types.inner_type_and_offset(outer_ty, members);
        let inner_word_begin = inner_byte_begin / 8;
        let inner_byte_offset = inner_byte_begin % 8;
        let inner_size = self.ctx.types.size(inner_ty);
        let source = source.advanced(inner_word_begin);
        if inner_byte_offset == 0 {
            // Word-aligned member: the source registers alias the result.
            self.value_map
                .insert(Value::Local(inst), MirValue::Reg(source));
            return;
        }
        debug_assert!(inner_byte_offset + inner_size <= 8, "single-word spans only");
        let shifted = self.mir.alloc_regs(1);
        self.emit(MirInst::ValueArith {
            dest: shifted,
            lhs: MirValue::Reg(source),
            rhs: MirValue::Const {
                value: 8 * inner_byte_offset as u64,
                width: 1,
            },
            op: ArithOp::LShR,
            width: 8,
        });
        let mask = word_mask(0, inner_size);
        let dest = self.dest_reg(inst);
        self.emit(MirInst::ValueArith {
            dest,
            lhs: MirValue::Reg(shifted),
            rhs: MirValue::Const {
                value: mask,
                width: 8,
            },
            op: ArithOp::And,
            width: 8,
        });
    }

    fn lower_insert(&mut self, inst: ValueId, base: Value, inserted: Value, members: &[u32]) {
        let mut inserted_val = self.resolve(inserted);
        let mut source = self.resolve(base);
        let mut dest = self.dest_reg(inst);
        let outer_ty = self.func.local_type(inst);
        let (inner_ty, inner_byte_begin) = self.ctx.types.inner_type_and_offset(outer_ty, members);
        let inner_size = self.ctx.types.size(inner_ty);
        let inner_word_begin = inner_byte_begin / 8;
        let inner_word_end = inner_word_begin + num_words(self.ctx, inner_ty);
        // Words before the inserted member copy through unchanged.
        dest = self.gen_copy(dest, source, 8 * inner_word_begin);
        for _ in 0..inner_word_begin {
            source = source.next();
        }
        let inner_byte_offset = inner_byte_begin % 8;
        if inner_byte_offset == 0 {
            let full_words_inner = inner_size / 8;
            dest = self.gen_copy(dest, inserted_val, 8 * full_words_inner);
            for _ in 0..full_words_inner {
                inserted_val = inserted_val.next();
                source = source.next();
            }
            let hung_over = inner_size % 8;
            if hung_over != 0 {
                let source_mask = !0u64 << (8 * hung_over);
                let masked_source = self.mir.alloc_regs(1);
                self.emit(MirInst::ValueArith {
                    dest: masked_source,
                    lhs: source,
                    rhs: MirValue::Const {
                        value: source_mask,
                        width: 8,
                    },
                    op: ArithOp::And,
                    width: 8,
                });
                let masked_inserted = self.mir.alloc_regs(1);
                self.emit(MirInst::ValueArith {
                    dest: masked_inserted,
                    lhs: inserted_val,
                    rhs: MirValue::Const {
                        value: !source_mask,
                        width: 8,
                    },
                    op: ArithOp::And,
                    width: 8,
                });
                self.emit(MirInst::ValueArith {
                    dest,
                    lhs: MirValue::Reg(masked_source),
                    rhs: MirValue::Reg(masked_inserted),
                    op: ArithOp::Or,
                    width: 8,
                });
                dest = dest.next();
                source = source.next();
            }
        } else {
            debug_assert!(
                inner_byte_offset + inner_size <= 8,
                "single-word spans only"
            );
            let inserted_mask = word_mask(inner_byte_offset, inner_size);
            let shifted = self.mir.alloc_regs(1);
            self.emit(MirInst::ValueArith {
                dest: shifted,
                lhs: inserted_val,
                rhs: MirValue::Const {
                    value: 8 * inner_byte_offset as u64,
                    width: 1,
                },
                op: ArithOp::LShL,
                width: 8,
            });
            let masked_source = self.mir.alloc_regs(1);
            self.emit(MirInst::ValueArith {
                dest: masked_source,
                lhs: source,
                rhs: MirValue::Const {
                    value: !inserted_mask,
                    width: 8,
                },
                op: ArithOp::And,
                width: 8,
            });
            let masked_inserted = self.mir.alloc_regs(1);
            self.emit(MirInst::ValueArith {
                dest: masked_inserted,
                lhs: MirValue::Reg(shifted),
                rhs: MirValue::Const {
                    value: inserted_mask,
                    width: 8,
                },
                op: ArithOp::And,
                width: 8,
            });
            self.emit(MirInst::ValueArith {
                dest,
                lhs: MirValue::Reg(masked_source),
                rhs: MirValue::Reg(masked_inserted),
                op: ArithOp::Or,
                width: 8,
            });
            dest = dest.next();
            source = source.next();
        }
        // Trailing unchanged words.
        let outer_size = self.ctx.types.size(outer_ty);
        let trailing = outer_size.div_ceil(8) * 8 - 8 * inner_word_end;
        self.gen_copy(dest, source, trailing);
    }
}

/// A mask of `one_bytes` set bytes after `leading_zero_bytes` clear ones.
fn word_mask(leading_zero_bytes: usize, one_bytes: usize) -> u64 {
    debug_assert!(leading_zero_bytes + one_bytes <= 8);
    let mut mask = 0u64;
    for byte in leading_zero_bytes..leading_zero_bytes + one_bytes {
        mask |= 0xFFu64 << (8 * byte);
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::{CompareMode, Module};

    #[test]
    fn test_lower_simple_arith_function() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "add", &[i64t, i64t], i64t);
        b.add_new_block("entry");
        let sum = b.arith(ArithOp::Add, b.param(0), b.param(1), "sum");
        b.ret(sum);
        let mut module = Module::new();
        module.add_function(b.finish());
        let mir = lower_to_mir(&ctx, &module);
        let f = &mir.functions[0];
        assert_eq!(f.num_param_regs, 2);
        assert_eq!(f.num_retval_regs, 1);
        let insts = &f.blocks[0].insts;
        assert!(matches!(insts[0], MirInst::ValueArith { op: ArithOp::Add, .. }));
        assert!(matches!(insts[1], MirInst::Return { .. }));
    }

    #[test]
    fn test_branch_reuses_compare_flags() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[i64t], i64t);
        let entry = b.add_new_block("entry");
        let then_b = b.func.add_block("then");
        let else_b = b.func.add_block("else");
        b.select_block(entry);
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        let cond = b.cmp(CompareMode::Signed, CompareOp::Less, b.param(0), zero, "c");
        b.branch(cond, then_b, else_b);
        b.select_block(then_b);
        b.ret(zero);
        b.select_block(else_b);
        b.ret(b.param(0));
        let mut module = Module::new();
        module.add_function(b.finish());
        let mir = lower_to_mir(&ctx, &module);
        let insts = &mir.functions[0].blocks[0].insts;
        // compare, set, cond-jump (inverted onto the else edge), jump; no
        // redundant test.
        assert!(matches!(insts[0], MirInst::Compare { .. }));
        assert!(matches!(insts[1], MirInst::Set { .. }));
        assert!(
            matches!(
                insts[2],
                MirInst::CondJump {
                    cond: CompareOp::GreaterEq,
                    ..
                }
            ),
            "condition is inverted for the else target"
        );
        assert!(matches!(insts[3], MirInst::Jump { .. }));
        assert!(!insts.iter().any(|i| matches!(i, MirInst::Test { .. })));
    }

    #[test]
    fn test_wide_store_is_sliced() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i32t = ctx.int_type(32);
        let rec = ctx.anonymous_struct(&[i64t, i32t]);
        let ptr = ctx.ptr_type();
        let void = ctx.void_type();
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[ptr, rec], void);
        b.add_new_block("entry");
        b.store(b.param(0), b.param(1));
        b.ret_void();
        let mut module = Module::new();
        module.add_function(b.finish());
        let mir = lower_to_mir(&ctx, &module);
        let stores: Vec<&MirInst> = mir.functions[0].blocks[0]
            .insts
            .iter()
            .filter(|i| matches!(i, MirInst::Store { .. }))
            .collect();
        assert_eq!(stores.len(), 2, "12-byte store emits an 8 and a 4 byte slice");
        let MirInst::Store { width: w0, .. } = stores[0] else {
            unreachable!()
        };
        let MirInst::Store { width: w1, addr, .. } = stores[1] else {
            unreachable!()
        };
        assert_eq!(*w0, 8);
        assert_eq!(*w1, 4);
        assert_eq!(addr.offset_term, 8);
    }

    #[test]
    fn test_gep_used_only_by_memory_has_no_lea() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let arr = ctx.array_type(i64t, 4);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        b.add_new_block("entry");
        let a = b.alloca(arr, "a");
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let p = b.gep(i64t, a, one, &[], "p");
        let v = b.load(p, i64t, "v");
        b.ret(v);
        let mut module = Module::new();
        module.add_function(b.finish());
        let mir = lower_to_mir(&ctx, &module);
        let insts = &mir.functions[0].blocks[0].insts;
        assert!(!insts.iter().any(|i| matches!(i, MirInst::Lea { .. })));
        let load = insts
            .iter()
            .find_map(|i| match i {
                MirInst::Load { addr, .. } => Some(addr),
                _ => None,
            })
            .expect("load survives");
        assert_eq!(load.elem_size, 8, "gep folded into the addressing mode");
    }
}
