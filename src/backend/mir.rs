//! The machine IR.
//!
//! A register machine one step above the bytecode: functions hold basic
//! blocks of instructions over an unbounded set of word-sized SSA registers.
//! Values wider than a word occupy contiguous register runs and are stepped
//! through with [`Reg::next`]. A [`MemoryAddress`] models the addressing
//! mode `base + dyn_offset * elem_size + offset_term`.

use crate::ir::ir::{ArithOp, CompareMode, CompareOp, Conversion, FuncId, UnaryArithOp};

/// An SSA register. Multi-word values occupy consecutive registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl Reg {
    pub fn next(self) -> Reg {
        Reg(self.0 + 1)
    }

    pub fn advanced(self, words: usize) -> Reg {
        Reg(self.0 + words as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MirBlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirValue {
    Reg(Reg),
    /// An immediate of `width` bytes.
    Const { value: u64, width: u8 },
    Undef,
    /// The address of a function; patched by the assembler.
    Func(FuncId),
}

impl MirValue {
    pub fn as_reg(self) -> Option<Reg> {
        match self {
            MirValue::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    /// The value one word further into a register run. Immediates and undef
    /// collapse to themselves only for the word they describe; stepping an
    /// immediate yields zero (the upper words of a small constant).
    pub fn next(self) -> MirValue {
        match self {
            MirValue::Reg(reg) => MirValue::Reg(reg.next()),
            MirValue::Const { .. } => MirValue::Const { value: 0, width: 8 },
            other => other,
        }
    }
}

/// `base + dyn_offset * elem_size + offset_term`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAddress {
    pub base: Reg,
    pub dyn_offset: Option<Reg>,
    pub elem_size: u32,
    pub offset_term: u32,
}

impl MemoryAddress {
    pub fn plain(base: Reg) -> MemoryAddress {
        MemoryAddress {
            base,
            dyn_offset: None,
            elem_size: 0,
            offset_term: 0,
        }
    }

    pub fn with_added_offset(self, bytes: u32) -> MemoryAddress {
        MemoryAddress {
            offset_term: self.offset_term + bytes,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirCallee {
    Func(FuncId),
    /// External function, addressed as `(slot, index)` in the call data.
    Ext { slot: u32, index: u32 },
    Indirect(MirValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirInst {
    Copy {
        dest: Reg,
        source: MirValue,
        width: u8,
    },
    /// Copy executed only when the last compare satisfies `cond`.
    CondCopy {
        dest: Reg,
        source: MirValue,
        cond: CompareOp,
        width: u8,
    },
    Load {
        dest: Reg,
        addr: MemoryAddress,
        width: u8,
    },
    Store {
        addr: MemoryAddress,
        source: MirValue,
        width: u8,
    },
    /// Load-and-increment-stack-pointer: stack allocation.
    Lisp { dest: Reg, bytes: MirValue },
    Lea { dest: Reg, addr: MemoryAddress },
    Compare {
        lhs: MirValue,
        rhs: MirValue,
        mode: CompareMode,
        width: u8,
    },
    Test {
        operand: MirValue,
        mode: CompareMode,
        width: u8,
    },
    /// Materializes the last compare's flag as a 0/1 byte.
    Set { dest: Reg, op: CompareOp },
    UnaryArith {
        dest: Reg,
        operand: MirValue,
        op: UnaryArithOp,
        width: u8,
    },
    ValueArith {
        dest: Reg,
        lhs: MirValue,
        rhs: MirValue,
        op: ArithOp,
        width: u8,
    },
    /// Arithmetic with the right operand taken from memory.
    LoadArith {
        dest: Reg,
        lhs: MirValue,
        addr: MemoryAddress,
        op: ArithOp,
        width: u8,
    },
    Conv {
        dest: Reg,
        operand: MirValue,
        conv: Conversion,
        from_bits: u16,
        to_bits: u16,
    },
    Call {
        callee: MirCallee,
        args: Vec<MirValue>,
        /// First return register and the number of return registers.
        dest: Option<Reg>,
        num_dests: u32,
    },
    Jump { target: MirBlockId },
    CondJump { target: MirBlockId, cond: CompareOp },
    Return { args: Vec<MirValue> },
    Phi {
        dest: Reg,
        args: Vec<MirValue>,
        width: u8,
    },
    Select {
        dest: Reg,
        then_value: MirValue,
        else_value: MirValue,
        cond: CompareOp,
        width: u8,
    },
}

impl MirInst {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            MirInst::Jump { .. } | MirInst::CondJump { .. } | MirInst::Return { .. }
        )
    }

    pub fn jump_target(&self) -> Option<MirBlockId> {
        match self {
            MirInst::Jump { target } | MirInst::CondJump { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// The first register this instruction defines, if any.
    pub fn dest_reg(&self) -> Option<Reg> {
        match *self {
            MirInst::Copy { dest, .. }
            | MirInst::CondCopy { dest, .. }
            | MirInst::Load { dest, .. }
            | MirInst::Lisp { dest, .. }
            | MirInst::Lea { dest, .. }
            | MirInst::Set { dest, .. }
            | MirInst::UnaryArith { dest, .. }
            | MirInst::ValueArith { dest, .. }
            | MirInst::LoadArith { dest, .. }
            | MirInst::Conv { dest, .. }
            | MirInst::Phi { dest, .. }
            | MirInst::Select { dest, .. } => Some(dest),
            MirInst::Call { dest, .. } => dest,
            _ => None,
        }
    }

    pub fn for_each_value(&self, mut f: impl FnMut(MirValue)) {
        let mut addr = |a: &MemoryAddress, f: &mut dyn FnMut(MirValue)| {
            f(MirValue::Reg(a.base));
            if let Some(dyn_offset) = a.dyn_offset {
                f(MirValue::Reg(dyn_offset));
            }
        };
        match self {
            MirInst::Copy { source, .. } | MirInst::CondCopy { source, .. } => f(*source),
            MirInst::Load { addr: a, .. } | MirInst::Lea { addr: a, .. } => addr(a, &mut f),
            MirInst::Store { addr: a, source, .. } => {
                addr(a, &mut f);
                f(*source);
            }
            MirInst::Lisp { bytes, .. } => f(*bytes),
            MirInst::Compare { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            MirInst::Test { operand, .. } => f(*operand),
            MirInst::Set { .. } => {}
            MirInst::UnaryArith { operand, .. } => f(*operand),
            MirInst::ValueArith { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            MirInst::LoadArith { lhs, addr: a, .. } => {
                f(*lhs);
                addr(a, &mut f);
            }
            MirInst::Conv { operand, .. } => f(*operand),
            MirInst::Call { callee, args, .. } => {
                if let MirCallee::Indirect(v) = callee {
                    f(*v);
                }
                for arg in args {
                    f(*arg);
                }
            }
            MirInst::Return { args } => {
                for arg in args {
                    f(*arg);
                }
            }
            MirInst::Phi { args, .. } => {
                for arg in args {
                    f(*arg);
                }
            }
            MirInst::Select {
                then_value,
                else_value,
                ..
            } => {
                f(*then_value);
                f(*else_value);
            }
            MirInst::Jump { .. } | MirInst::CondJump { .. } => {}
        }
    }

    /// Rewrites every occurrence of register `old` in a value position.
    /// Address base/offset registers are rewritten only when the replacement
    /// is itself a register.
    pub fn replace_reg(&mut self, old: Reg, new: MirValue) {
        let fix_value = |v: &mut MirValue| {
            if *v == MirValue::Reg(old) {
                *v = new;
            }
        };
        let fix_addr = |a: &mut MemoryAddress| {
            if let MirValue::Reg(new_reg) = new {
                if a.base == old {
                    a.base = new_reg;
                }
                if a.dyn_offset == Some(old) {
                    a.dyn_offset = Some(new_reg);
                }
            }
        };
        match self {
            MirInst::Copy { source, .. } | MirInst::CondCopy { source, .. } => fix_value(source),
            MirInst::Load { addr, .. } | MirInst::Lea { addr, .. } => fix_addr(addr),
            MirInst::Store { addr, source, .. } => {
                fix_addr(addr);
                fix_value(source);
            }
            MirInst::Lisp { bytes, .. } => fix_value(bytes),
            MirInst::Compare { lhs, rhs, .. } => {
                fix_value(lhs);
                fix_value(rhs);
            }
            MirInst::Test { operand, .. } => fix_value(operand),
            MirInst::Set { .. } => {}
            MirInst::UnaryArith { operand, .. } => fix_value(operand),
            MirInst::ValueArith { lhs, rhs, .. } => {
                fix_value(lhs);
                fix_value(rhs);
            }
            MirInst::LoadArith { lhs, addr, .. } => {
                fix_value(lhs);
                fix_addr(addr);
            }
            MirInst::Conv { operand, .. } => fix_value(operand),
            MirInst::Call { callee, args, .. } => {
                if let MirCallee::Indirect(v) = callee {
                    fix_value(v);
                }
                for arg in args {
                    fix_value(arg);
                }
            }
            MirInst::Return { args } => {
                for arg in args {
                    fix_value(arg);
                }
            }
            MirInst::Phi { args, .. } => {
                for arg in args {
                    fix_value(arg);
                }
            }
            MirInst::Select {
                then_value,
                else_value,
                ..
            } => {
                fix_value(then_value);
                fix_value(else_value);
            }
            MirInst::Jump { .. } | MirInst::CondJump { .. } => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct MirBlock {
    pub name: String,
    pub insts: Vec<MirInst>,
    pub preds: Vec<MirBlockId>,
    pub succs: Vec<MirBlockId>,
}

#[derive(Debug, Default)]
pub struct MirFunction {
    pub name: String,
    /// Registers occupied by the parameters, at the bottom of the register
    /// file.
    pub num_param_regs: u32,
    pub num_retval_regs: u32,
    /// Total SSA registers allocated so far.
    pub num_regs: u32,
    pub blocks: Vec<MirBlock>,
    /// Layout order; jump elision rearranges this.
    pub block_order: Vec<MirBlockId>,
}

impl MirFunction {
    pub fn alloc_regs(&mut self, words: usize) -> Reg {
        let first = Reg(self.num_regs);
        self.num_regs += words as u32;
        first
    }

    pub fn block(&self, id: MirBlockId) -> &MirBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: MirBlockId) -> &mut MirBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> MirBlockId {
        let id = MirBlockId(self.blocks.len() as u32);
        self.blocks.push(MirBlock {
            name: name.into(),
            ..Default::default()
        });
        self.block_order.push(id);
        id
    }
}

/// Placeholder for a function address in the static data image, patched by
/// the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPlaceholder {
    pub offset: usize,
    pub function: FuncId,
}

#[derive(Debug, Default)]
pub struct MirModule {
    pub functions: Vec<MirFunction>,
    /// Byte image of the static data region (slot 1).
    pub static_data: Vec<u8>,
    pub address_placeholders: Vec<AddressPlaceholder>,
}
