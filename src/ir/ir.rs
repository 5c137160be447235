//! The SSA intermediate representation.
//!
//! Values live in a per-function arena and are addressed by `ValueId`; basic
//! blocks live in a parallel arena addressed by `BlockId`. Operands are
//! `Value` handles that reference either a function-local value (instruction
//! result or parameter), a context constant, a global, or a function. Use
//! lists are maintained for function-local values: every operand slot that
//! references a local value contributes exactly one entry to that value's
//! use list, and all operand mutation goes through the methods on
//! [`Function`] so the two sides can never drift apart.
//!
//! Control-flow edges (terminator targets, phi predecessor labels) are
//! `BlockId`s stored in the instruction payload rather than operand slots.
//! The mutation protocol (`update_target`, `update_predecessor`,
//! `add_predecessor`, `remove_predecessor`) keeps predecessor lists and phi
//! argument lists synchronized within a single call.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::analysis::domtree::DominanceInfo;
use crate::analysis::loops::LoopNestingForest;
use crate::ir::context::{ConstId, Context};
use crate::ir::pointer_info::PointerInfo;
use crate::ir::types::TypeId;

/// Index of a function-local value (instruction or parameter) in its
/// function's value arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Index of a basic block in its function's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Index of a function in its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Index of a global variable in its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

/// Index of an externally declared function in its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtFuncId(pub u32);

/// Operand handle. Everything an instruction can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Local(ValueId),
    Const(ConstId),
    Global(GlobalId),
    Function(FuncId),
    ExtFunction(ExtFuncId),
}

impl Value {
    pub fn as_local(self) -> Option<ValueId> {
        match self {
            Value::Local(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_const(self) -> Option<ConstId> {
        match self {
            Value::Const(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_constant(self) -> bool {
        matches!(self, Value::Const(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    FAdd,
    FSub,
    FMul,
    FDiv,
    LShL,
    LShR,
    AShL,
    AShR,
    And,
    Or,
    XOr,
}

impl ArithOp {
    pub fn is_shift(self) -> bool {
        matches!(
            self,
            ArithOp::LShL | ArithOp::LShR | ArithOp::AShL | ArithOp::AShR
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryArithOp {
    BitwiseNot,
    LogicalNot,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareMode {
    Signed,
    Unsigned,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

impl CompareOp {
    /// The operation that holds exactly when `self` does not.
    pub fn inverse(self) -> CompareOp {
        match self {
            CompareOp::Equal => CompareOp::NotEqual,
            CompareOp::NotEqual => CompareOp::Equal,
            CompareOp::Less => CompareOp::GreaterEq,
            CompareOp::LessEq => CompareOp::Greater,
            CompareOp::Greater => CompareOp::LessEq,
            CompareOp::GreaterEq => CompareOp::Less,
        }
    }

    /// The operation with swapped operands: `a < b` iff `b > a`.
    pub fn flipped(self) -> CompareOp {
        match self {
            CompareOp::Less => CompareOp::Greater,
            CompareOp::LessEq => CompareOp::GreaterEq,
            CompareOp::Greater => CompareOp::Less,
            CompareOp::GreaterEq => CompareOp::LessEq,
            op => op,
        }
    }

    /// Equality compares match regardless of operand order.
    pub fn is_equality(self) -> bool {
        matches!(self, CompareOp::Equal | CompareOp::NotEqual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conversion {
    Zext,
    Sext,
    Trunc,
    Fext,
    Ftrunc,
    UtoF,
    StoF,
    FtoU,
    FtoS,
    Bitcast,
}

/// Target of a call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    Function(FuncId),
    Ext(ExtFuncId),
    /// Indirect call through a pointer-typed value.
    Indirect(Value),
}

pub type MemberIndices = SmallVec<[u32; 4]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstData {
    /// Stack allocation of `count` elements of `allocated`. Must appear in
    /// the alloca prefix of the entry block. Its value is a pointer whose
    /// provenance is the alloca itself.
    Alloca { allocated: TypeId, count: Value },
    Load { addr: Value },
    Store { addr: Value, value: Value },
    /// Pointer arithmetic: `base + index * size_of(inbounds) + member offsets`.
    Gep {
        inbounds: TypeId,
        base: Value,
        index: Value,
        members: MemberIndices,
    },
    Arith { op: ArithOp, lhs: Value, rhs: Value },
    UnaryArith { op: UnaryArithOp, operand: Value },
    Cmp {
        mode: CompareMode,
        op: CompareOp,
        lhs: Value,
        rhs: Value,
    },
    Conv { conv: Conversion, operand: Value },
    Call {
        callee: Callee,
        args: SmallVec<[Value; 4]>,
    },
    /// One incoming value per predecessor of the parent block, in the same
    /// order as the block's predecessor list.
    Phi {
        args: SmallVec<[(BlockId, Value); 2]>,
    },
    Select {
        cond: Value,
        then_value: Value,
        else_value: Value,
    },
    ExtractValue { base: Value, members: MemberIndices },
    InsertValue {
        base: Value,
        inserted: Value,
        members: MemberIndices,
    },
    Goto { target: BlockId },
    Branch {
        cond: Value,
        then_target: BlockId,
        else_target: BlockId,
    },
    /// Functions returning void return an undef of type void.
    Return { value: Value },
}

impl InstData {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstData::Goto { .. } | InstData::Branch { .. } | InstData::Return { .. }
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstData::Phi { .. })
    }

    pub fn is_alloca(&self) -> bool {
        matches!(self, InstData::Alloca { .. })
    }

    /// All operand slots in slot order.
    pub fn operands(&self) -> SmallVec<[Value; 4]> {
        let mut result = SmallVec::new();
        self.for_each_operand(|v| result.push(v));
        result
    }

    pub fn for_each_operand(&self, mut f: impl FnMut(Value)) {
        match self {
            InstData::Alloca { count, .. } => f(*count),
            InstData::Load { addr } => f(*addr),
            InstData::Store { addr, value } => {
                f(*addr);
                f(*value);
            }
            InstData::Gep { base, index, .. } => {
                f(*base);
                f(*index);
            }
            InstData::Arith { lhs, rhs, .. } | InstData::Cmp { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            InstData::UnaryArith { operand, .. } | InstData::Conv { operand, .. } => f(*operand),
            InstData::Call { callee, args } => {
                if let Callee::Indirect(v) = callee {
                    f(*v);
                }
                for arg in args {
                    f(*arg);
                }
            }
            InstData::Phi { args } => {
                for (_, v) in args {
                    f(*v);
                }
            }
            InstData::Select {
                cond,
                then_value,
                else_value,
            } => {
                f(*cond);
                f(*then_value);
                f(*else_value);
            }
            InstData::ExtractValue { base, .. } => f(*base),
            InstData::InsertValue { base, inserted, .. } => {
                f(*base);
                f(*inserted);
            }
            InstData::Goto { .. } => {}
            InstData::Branch { cond, .. } => f(*cond),
            InstData::Return { value } => f(*value),
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            InstData::Alloca { count, .. } => f(count),
            InstData::Load { addr } => f(addr),
            InstData::Store { addr, value } => {
                f(addr);
                f(value);
            }
            InstData::Gep { base, index, .. } => {
                f(base);
                f(index);
            }
            InstData::Arith { lhs, rhs, .. } | InstData::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstData::UnaryArith { operand, .. } | InstData::Conv { operand, .. } => f(operand),
            InstData::Call { callee, args } => {
                if let Callee::Indirect(v) = callee {
                    f(v);
                }
                for arg in args {
                    f(arg);
                }
            }
            InstData::Phi { args } => {
                for (_, v) in args {
                    f(v);
                }
            }
            InstData::Select {
                cond,
                then_value,
                else_value,
            } => {
                f(cond);
                f(then_value);
                f(else_value);
            }
            InstData::ExtractValue { base, .. } => f(base),
            InstData::InsertValue { base, inserted, .. } => {
                f(base);
                f(inserted);
            }
            InstData::Goto { .. } => {}
            InstData::Branch { cond, .. } => f(cond),
            InstData::Return { value } => f(value),
        }
    }

    /// Successor blocks of a terminator, in target order.
    pub fn targets(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            InstData::Goto { target } => SmallVec::from_slice(&[*target]),
            InstData::Branch {
                then_target,
                else_target,
                ..
            } => SmallVec::from_slice(&[*then_target, *else_target]),
            _ => SmallVec::new(),
        }
    }

    /// Rewrites every terminator target equal to `old` to `new`.
    pub fn update_target(&mut self, old: BlockId, new: BlockId) {
        match self {
            InstData::Goto { target } => {
                if *target == old {
                    *target = new;
                }
            }
            InstData::Branch {
                then_target,
                else_target,
                ..
            } => {
                if *then_target == old {
                    *then_target = new;
                }
                if *else_target == old {
                    *else_target = new;
                }
            }
            _ => panic!("update_target on non-terminator"),
        }
    }
}

bitflags! {
    /// Function attributes relevant to optimization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionAttributes: u8 {
        /// The function does not write to memory observable by the caller.
        const MEMORY_WRITE_NONE = 1 << 0;
        /// The function does not read memory observable by the caller.
        const MEMORY_READ_NONE = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    Param { index: usize },
    Inst(InstData),
}

#[derive(Debug)]
pub struct ValueData {
    pub ty: TypeId,
    pub name: Option<String>,
    pub kind: ValueKind,
    /// Parent block for instructions that are placed in one.
    pub parent: Option<BlockId>,
    /// One entry per operand slot that references this value.
    pub uses: Vec<ValueId>,
    pub ptr_info: Option<PointerInfo>,
    pub dead: bool,
}

impl ValueData {
    pub fn inst(&self) -> &InstData {
        match &self.kind {
            ValueKind::Inst(data) => data,
            ValueKind::Param { .. } => panic!("not an instruction"),
        }
    }

    pub fn is_inst(&self) -> bool {
        matches!(self.kind, ValueKind::Inst(_))
    }
}

#[derive(Debug)]
pub struct BlockData {
    pub name: String,
    /// Ordered instruction list; the terminator, if present, is last.
    pub insts: Vec<ValueId>,
    pub preds: Vec<BlockId>,
    pub dead: bool,
}

#[derive(Default)]
struct CfgCache {
    dom: RefCell<Option<Rc<DominanceInfo>>>,
    postdom: RefCell<Option<Rc<DominanceInfo>>>,
    lnf: RefCell<Option<Rc<LoopNestingForest>>>,
}

/// A function: an ordered list of basic blocks (the first is the entry), a
/// parameter list, and lazily computed CFG analyses.
#[derive(Default)]
pub struct Function {
    pub name: String,
    pub return_type: TypeId,
    pub attributes: FunctionAttributes,
    pub params: Vec<ValueId>,
    pub(crate) id: FuncId,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    block_order: Vec<BlockId>,
    taken_names: HashMap<String, u32>,
    cfg: CfgCache,
}

impl Default for FuncId {
    fn default() -> Self {
        FuncId(u32::MAX)
    }
}

impl Default for TypeId {
    fn default() -> Self {
        TypeId(0)
    }
}

impl Function {
    pub fn new(name: impl Into<String>, param_types: &[TypeId], return_type: TypeId) -> Self {
        let mut function = Function {
            name: name.into(),
            return_type,
            ..Default::default()
        };
        for (index, &ty) in param_types.iter().enumerate() {
            let name = function.unique_name(&index.to_string());
            let id = ValueId(function.values.len() as u32);
            function.values.push(ValueData {
                ty,
                name: Some(name),
                kind: ValueKind::Param { index },
                parent: None,
                uses: Vec::new(),
                ptr_info: None,
                dead: false,
            });
            function.params.push(id);
        }
        function
    }

    pub fn id(&self) -> FuncId {
        self.id
    }

    // -- Names ------------------------------------------------------------

    /// Makes `base` unique within this function by appending `.N` when taken.
    pub fn unique_name(&mut self, base: &str) -> String {
        let base = if base.is_empty() { "tmp" } else { base };
        let Some(&mut mut counter) = self.taken_names.get_mut(base) else {
            self.taken_names.insert(base.to_string(), 0);
            return base.to_string();
        };
        loop {
            counter += 1;
            let candidate = format!("{base}.{counter}");
            if !self.taken_names.contains_key(&candidate) {
                self.taken_names.insert(candidate.clone(), 0);
                *self.taken_names.get_mut(base).unwrap() = counter;
                break candidate;
            }
        }
    }

    pub fn set_name(&mut self, id: ValueId, base: &str) {
        let name = self.unique_name(base);
        self.values[id.0 as usize].name = Some(name);
    }

    // -- Blocks -----------------------------------------------------------

    pub fn add_block(&mut self, name: &str) -> BlockId {
        let name = self.unique_name(name);
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            name,
            insts: Vec::new(),
            preds: Vec::new(),
            dead: false,
        });
        self.block_order.push(id);
        id
    }

    /// Adds a block and places it in the order directly before `before`.
    pub fn add_block_before(&mut self, name: &str, before: BlockId) -> BlockId {
        let id = self.add_block(name);
        self.block_order.pop();
        let pos = self
            .block_order
            .iter()
            .position(|&b| b == before)
            .expect("before block not in function");
        self.block_order.insert(pos, id);
        id
    }

    pub fn entry(&self) -> BlockId {
        self.block_order[0]
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BlockData {
        &mut self.blocks[id.0 as usize]
    }

    /// Live blocks in function order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.block_order
            .iter()
            .copied()
            .filter(|&b| !self.block(b).dead)
            .collect()
    }

    pub fn num_blocks(&self) -> usize {
        self.block_order
            .iter()
            .filter(|&&b| !self.block(b).dead)
            .count()
    }

    /// Erases a block from the function. The caller is responsible for edge
    /// bookkeeping (predecessor lists of successors); the block's own
    /// instructions are destroyed back to front.
    pub fn erase_block(&mut self, id: BlockId) {
        let insts = self.block(id).insts.clone();
        for &inst in insts.iter().rev() {
            self.clear_operands(inst);
            self.values[inst.0 as usize].parent = None;
            self.values[inst.0 as usize].dead = true;
        }
        let block = self.block_mut(id);
        block.insts.clear();
        block.dead = true;
        self.block_order.retain(|&b| b != id);
    }

    pub fn successors(&self, id: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.terminator(id) {
            Some(term) => self.values[term.0 as usize].inst().targets(),
            None => SmallVec::new(),
        }
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        &self.block(id).preds
    }

    pub fn single_predecessor(&self, id: BlockId) -> Option<BlockId> {
        match self.block(id).preds.as_slice() {
            &[pred] => Some(pred),
            _ => None,
        }
    }

    pub fn single_successor(&self, id: BlockId) -> Option<BlockId> {
        match self.successors(id).as_slice() {
            &[succ] => Some(succ),
            _ => None,
        }
    }

    pub fn terminator(&self, id: BlockId) -> Option<ValueId> {
        let last = *self.block(id).insts.last()?;
        self.values[last.0 as usize]
            .inst()
            .is_terminator()
            .then_some(last)
    }

    /// Index of the first non-phi instruction of the block.
    pub fn phi_end(&self, id: BlockId) -> usize {
        self.block(id)
            .insts
            .iter()
            .position(|&inst| !self.values[inst.0 as usize].inst().is_phi())
            .unwrap_or(self.block(id).insts.len())
    }

    pub fn phis_of(&self, id: BlockId) -> Vec<ValueId> {
        self.block(id).insts[..self.phi_end(id)].to_vec()
    }

    /// Whether the block holds nothing but its terminator.
    pub fn empty_except_terminator(&self, id: BlockId) -> bool {
        self.block(id).insts.len() <= 1
    }

    // -- Predecessor / phi coherence ---------------------------------------

    /// Appends `pred` to the predecessor list. Phi nodes of the block must be
    /// extended by the caller via [`Function::phi_add_arg`].
    pub fn add_predecessor(&mut self, block: BlockId, pred: BlockId) {
        debug_assert!(!self.block(block).preds.contains(&pred));
        self.block_mut(block).preds.push(pred);
    }

    /// Removes `pred` from the predecessor list and drops the matching
    /// argument from every phi of the block.
    pub fn remove_predecessor(&mut self, block: BlockId, pred: BlockId) {
        let preds = &mut self.block_mut(block).preds;
        if let Some(pos) = preds.iter().position(|&p| p == pred) {
            preds.remove(pos);
        }
        for phi in self.phis_of(block) {
            self.phi_remove_arg(phi, pred);
        }
    }

    /// Renames predecessor `old` to `new` in place, in both the predecessor
    /// list and every phi's label list.
    pub fn update_predecessor(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        for p in &mut self.block_mut(block).preds {
            if *p == old {
                *p = new;
            }
        }
        for phi in self.phis_of(block) {
            if let ValueKind::Inst(InstData::Phi { args }) = &mut self.values[phi.0 as usize].kind {
                for (label, _) in args {
                    if *label == old {
                        *label = new;
                    }
                }
            }
        }
    }

    /// Rewrites the terminator target `old` to `new`, keeping only the
    /// source side of the edge; predecessor lists of the targets are the
    /// caller's concern.
    pub fn update_target(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        let term = self.terminator(block).expect("block has no terminator");
        if let ValueKind::Inst(data) = &mut self.values[term.0 as usize].kind {
            data.update_target(old, new);
        }
        self.invalidate_cfg_info();
    }

    // -- Values -----------------------------------------------------------

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.0 as usize]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut ValueData {
        &mut self.values[id.0 as usize]
    }

    pub fn inst_data(&self, id: ValueId) -> &InstData {
        self.values[id.0 as usize].inst()
    }

    /// Mutable payload access for non-structural edits: operation kinds,
    /// member indices, conversion kinds, or swapping two operand slots (the
    /// use multiset is unchanged by a swap). Operand slot values must go
    /// through [`Function::set_operand`]/[`Function::update_operand`] so use
    /// lists stay coherent.
    pub fn inst_data_mut(&mut self, id: ValueId) -> &mut InstData {
        match &mut self.values[id.0 as usize].kind {
            ValueKind::Inst(data) => data,
            ValueKind::Param { .. } => panic!("not an instruction"),
        }
    }

    pub fn local_type(&self, id: ValueId) -> TypeId {
        self.values[id.0 as usize].ty
    }

    /// Type of any operand handle. Globals and functions are pointers.
    pub fn value_type(&self, value: Value, ctx: &Context) -> TypeId {
        match value {
            Value::Local(id) => self.local_type(id),
            Value::Const(id) => ctx.const_type(id),
            Value::Global(_) | Value::Function(_) | Value::ExtFunction(_) => ctx.ptr_type(),
        }
    }

    pub fn parent_block(&self, id: ValueId) -> Option<BlockId> {
        self.values[id.0 as usize].parent
    }

    /// Distinct users of the value, in use-list order.
    pub fn users(&self, id: ValueId) -> Vec<ValueId> {
        let mut seen = Vec::new();
        for &user in &self.values[id.0 as usize].uses {
            if !seen.contains(&user) {
                seen.push(user);
            }
        }
        seen
    }

    pub fn is_unused(&self, id: ValueId) -> bool {
        self.values[id.0 as usize].uses.is_empty()
    }

    /// All live instruction ids in block order.
    pub fn instructions(&self) -> Vec<ValueId> {
        let mut result = Vec::new();
        for block in self.block_ids() {
            result.extend_from_slice(&self.block(block).insts);
        }
        result
    }

    // -- Instruction creation and placement --------------------------------

    /// Creates an unplaced instruction, registering uses of its operands.
    pub fn new_inst(&mut self, data: InstData, ty: TypeId, name: &str) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        let name = if name.is_empty() {
            None
        } else {
            Some(self.unique_name(name))
        };
        data.for_each_operand(|op| {
            if let Value::Local(op) = op {
                self.values[op.0 as usize].uses.push(id);
            }
        });
        self.values.push(ValueData {
            ty,
            name,
            kind: ValueKind::Inst(data),
            parent: None,
            uses: Vec::new(),
            ptr_info: None,
            dead: false,
        });
        id
    }

    /// Places an unplaced instruction at `index` within `block`.
    pub fn place_inst(&mut self, block: BlockId, index: usize, inst: ValueId) {
        debug_assert!(self.values[inst.0 as usize].parent.is_none());
        self.block_mut(block).insts.insert(index, inst);
        self.values[inst.0 as usize].parent = Some(block);
    }

    /// Creates and places an instruction before the block's terminator, or at
    /// the end when the block has none yet.
    pub fn push_inst(&mut self, block: BlockId, data: InstData, ty: TypeId, name: &str) -> ValueId {
        let index = match self.terminator(block) {
            Some(_) => self.block(block).insts.len() - 1,
            None => self.block(block).insts.len(),
        };
        let id = self.new_inst(data, ty, name);
        self.place_inst(block, index, id);
        id
    }

    /// Creates and places an instruction at a specific index.
    pub fn insert_inst(
        &mut self,
        block: BlockId,
        index: usize,
        data: InstData,
        ty: TypeId,
        name: &str,
    ) -> ValueId {
        let id = self.new_inst(data, ty, name);
        self.place_inst(block, index, id);
        id
    }

    /// Creates and places an instruction directly before `before`.
    pub fn insert_inst_before(
        &mut self,
        before: ValueId,
        data: InstData,
        ty: TypeId,
        name: &str,
    ) -> ValueId {
        let block = self.parent_block(before).expect("before is unplaced");
        let index = self.index_in_block(before);
        self.insert_inst(block, index, data, ty, name)
    }

    /// Appends a terminator to a block that has none.
    pub fn set_terminator(&mut self, block: BlockId, data: InstData, ctx: &Context) -> ValueId {
        debug_assert!(data.is_terminator());
        debug_assert!(self.terminator(block).is_none());
        let id = self.new_inst(data, ctx.void_type(), "");
        let index = self.block(block).insts.len();
        self.place_inst(block, index, id);
        id
    }

    /// Inserts a phi at the end of the block's phi prefix.
    pub fn insert_phi(&mut self, block: BlockId, data: InstData, ty: TypeId, name: &str) -> ValueId {
        debug_assert!(data.is_phi());
        let index = self.phi_end(block);
        self.insert_inst(block, index, data, ty, name)
    }

    pub fn index_in_block(&self, inst: ValueId) -> usize {
        let block = self.parent_block(inst).expect("instruction is unplaced");
        self.block(block)
            .insts
            .iter()
            .position(|&i| i == inst)
            .expect("instruction not in its parent block")
    }

    /// Removes the instruction from its block without destroying it. Operand
    /// uses stay registered; the instruction can be re-placed elsewhere.
    pub fn extract_inst(&mut self, inst: ValueId) {
        let block = self.parent_block(inst).expect("instruction is unplaced");
        let index = self.index_in_block(inst);
        self.block_mut(block).insts.remove(index);
        self.values[inst.0 as usize].parent = None;
    }

    /// Destroys an instruction: clears its operand uses, removes it from its
    /// block, tombstones the arena slot. The instruction must be unused.
    pub fn erase_inst(&mut self, inst: ValueId) {
        debug_assert!(
            self.values[inst.0 as usize].uses.is_empty(),
            "erasing an instruction that still has users"
        );
        self.clear_operands(inst);
        if self.values[inst.0 as usize].parent.is_some() {
            self.extract_inst(inst);
        }
        self.values[inst.0 as usize].dead = true;
    }

    fn clear_operands(&mut self, inst: ValueId) {
        let operands = self.values[inst.0 as usize].inst().operands();
        for op in operands {
            if let Value::Local(op) = op {
                remove_one(&mut self.values[op.0 as usize].uses, inst);
            }
        }
    }

    /// Clones an instruction (same payload, fresh name) without placing it.
    pub fn clone_inst(&mut self, inst: ValueId) -> ValueId {
        let data = self.values[inst.0 as usize].inst().clone();
        let ty = self.values[inst.0 as usize].ty;
        let name = self.values[inst.0 as usize]
            .name
            .clone()
            .unwrap_or_default();
        self.new_inst(data, ty, &name)
    }

    // -- Operand mutation ---------------------------------------------------

    /// Rewrites every operand slot of `user` equal to `old` to `new`,
    /// keeping both use lists coherent.
    pub fn update_operand(&mut self, user: ValueId, old: Value, new: Value) {
        if old == new {
            return;
        }
        let mut replaced = 0usize;
        if let ValueKind::Inst(data) = &mut self.values[user.0 as usize].kind {
            data.for_each_operand_mut(|op| {
                if *op == old {
                    *op = new;
                    replaced += 1;
                }
            });
        }
        for _ in 0..replaced {
            if let Value::Local(old) = old {
                remove_one(&mut self.values[old.0 as usize].uses, user);
            }
            if let Value::Local(new) = new {
                self.values[new.0 as usize].uses.push(user);
            }
        }
    }

    /// Rewrites the operand at `slot` (in operand-iteration order).
    pub fn set_operand(&mut self, user: ValueId, slot: usize, new: Value) {
        let mut current = 0usize;
        let mut old = None;
        if let ValueKind::Inst(data) = &mut self.values[user.0 as usize].kind {
            data.for_each_operand_mut(|op| {
                if current == slot {
                    old = Some(*op);
                    *op = new;
                }
                current += 1;
            });
        }
        let old = old.expect("operand slot out of range");
        if old == new {
            return;
        }
        if let Value::Local(old) = old {
            remove_one(&mut self.values[old.0 as usize].uses, user);
        }
        if let Value::Local(new) = new {
            self.values[new.0 as usize].uses.push(user);
        }
    }

    /// Replaces every use of `old` with `new` atomically over both use lists.
    pub fn replace_all_uses(&mut self, old: ValueId, new: Value) {
        if Value::Local(old) == new {
            return;
        }
        let uses = std::mem::take(&mut self.values[old.0 as usize].uses);
        let mut unique = Vec::new();
        for user in uses {
            if !unique.contains(&user) {
                unique.push(user);
            }
        }
        for user in unique {
            let mut replaced = 0usize;
            if let ValueKind::Inst(data) = &mut self.values[user.0 as usize].kind {
                data.for_each_operand_mut(|op| {
                    if *op == Value::Local(old) {
                        *op = new;
                        replaced += 1;
                    }
                });
            }
            if let Value::Local(new) = new {
                for _ in 0..replaced {
                    self.values[new.0 as usize].uses.push(user);
                }
            }
        }
    }

    // -- Phi helpers --------------------------------------------------------

    pub fn phi_args(&self, phi: ValueId) -> &[(BlockId, Value)] {
        match self.values[phi.0 as usize].inst() {
            InstData::Phi { args } => args,
            _ => panic!("not a phi"),
        }
    }

    pub fn phi_arg_for(&self, phi: ValueId, pred: BlockId) -> Option<Value> {
        self.phi_args(phi)
            .iter()
            .find(|(label, _)| *label == pred)
            .map(|&(_, v)| v)
    }

    pub fn phi_add_arg(&mut self, phi: ValueId, pred: BlockId, value: Value) {
        if let ValueKind::Inst(InstData::Phi { args }) = &mut self.values[phi.0 as usize].kind {
            args.push((pred, value));
        } else {
            panic!("not a phi");
        }
        if let Value::Local(value) = value {
            self.values[value.0 as usize].uses.push(phi);
        }
    }

    pub fn phi_remove_arg(&mut self, phi: ValueId, pred: BlockId) {
        let removed = match &mut self.values[phi.0 as usize].kind {
            ValueKind::Inst(InstData::Phi { args }) => {
                match args.iter().position(|(label, _)| *label == pred) {
                    Some(pos) => Some(args.remove(pos).1),
                    None => None,
                }
            }
            _ => panic!("not a phi"),
        };
        if let Some(Value::Local(value)) = removed {
            remove_one(&mut self.values[value.0 as usize].uses, phi);
        }
    }

    pub fn phi_set_arg_for(&mut self, phi: ValueId, pred: BlockId, value: Value) {
        let slot = self
            .phi_args(phi)
            .iter()
            .position(|(label, _)| *label == pred)
            .expect("pred is not an incoming edge of the phi");
        self.set_operand(phi, slot, value);
    }

    // -- Pointer info -------------------------------------------------------

    pub fn pointer_info(&self, value: Value) -> Option<&PointerInfo> {
        match value {
            Value::Local(id) => self.values[id.0 as usize].ptr_info.as_ref(),
            _ => None,
        }
    }

    pub fn set_pointer_info(&mut self, id: ValueId, info: PointerInfo) {
        self.values[id.0 as usize].ptr_info = Some(info);
    }

    // -- Analysis caches ----------------------------------------------------

    /// Lazily computed dominance information. The cache is the only mutable
    /// state reachable through a shared function reference; any CFG mutation
    /// must call [`Function::invalidate_cfg_info`].
    pub fn get_or_compute_dom_info(&self) -> Rc<DominanceInfo> {
        if let Some(info) = self.cfg.dom.borrow().as_ref() {
            return Rc::clone(info);
        }
        let info = Rc::new(DominanceInfo::compute(self));
        *self.cfg.dom.borrow_mut() = Some(Rc::clone(&info));
        info
    }

    pub fn get_or_compute_post_dom_info(&self) -> Rc<DominanceInfo> {
        if let Some(info) = self.cfg.postdom.borrow().as_ref() {
            return Rc::clone(info);
        }
        let info = Rc::new(DominanceInfo::compute_post(self));
        *self.cfg.postdom.borrow_mut() = Some(Rc::clone(&info));
        info
    }

    pub fn get_or_compute_lnf(&self) -> Rc<LoopNestingForest> {
        if let Some(info) = self.cfg.lnf.borrow().as_ref() {
            return Rc::clone(info);
        }
        let dom = self.get_or_compute_dom_info();
        let info = Rc::new(LoopNestingForest::compute(self, &dom));
        *self.cfg.lnf.borrow_mut() = Some(Rc::clone(&info));
        info
    }

    pub fn invalidate_cfg_info(&self) {
        self.cfg.dom.borrow_mut().take();
        self.cfg.postdom.borrow_mut().take();
        self.cfg.lnf.borrow_mut().take();
    }
}

fn remove_one(uses: &mut Vec<ValueId>, user: ValueId) {
    if let Some(pos) = uses.iter().position(|&u| u == user) {
        uses.swap_remove(pos);
    }
}

/// A global variable with a constant initializer.
#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    pub value_type: TypeId,
    pub initializer: ConstId,
    pub mutable: bool,
}

/// An externally declared (foreign) function, addressed by `(slot, index)`
/// in the VM's foreign function table.
#[derive(Debug, Clone)]
pub struct ExtFunction {
    pub name: String,
    pub slot: u32,
    pub index: u32,
    pub params: Vec<TypeId>,
    pub return_type: TypeId,
}

/// A compilation unit: functions, globals, external declarations and the
/// named struct types it defines.
#[derive(Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVariable>,
    pub ext_functions: Vec<ExtFunction>,
    pub struct_types: Vec<TypeId>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn add_function(&mut self, mut function: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        function.id = id;
        self.functions.push(function);
        id
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn add_global(&mut self, global: GlobalVariable) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        &self.globals[id.0 as usize]
    }

    pub fn declare_ext_function(&mut self, ext: ExtFunction) -> ExtFuncId {
        let id = ExtFuncId(self.ext_functions.len() as u32);
        self.ext_functions.push(ext);
        id
    }

    pub fn ext_function(&self, id: ExtFuncId) -> &ExtFunction {
        &self.ext_functions[id.0 as usize]
    }

    pub fn func_ids(&self) -> Vec<FuncId> {
        (0..self.functions.len() as u32).map(FuncId).collect()
    }

    /// Temporarily takes the function out of the module so a pass can mutate
    /// it while still reading the rest of the module (callee attributes,
    /// external declarations, globals). The function slot holds a default
    /// placeholder for the duration of the call.
    pub fn with_function<R>(
        &mut self,
        id: FuncId,
        f: impl FnOnce(&mut Module, &mut Function) -> R,
    ) -> R {
        let mut function = std::mem::take(&mut self.functions[id.0 as usize]);
        let result = f(self, &mut function);
        self.functions[id.0 as usize] = function;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::context::Context;

    fn make_add_function(ctx: &mut Context) -> Function {
        let i64t = ctx.int_type(64);
        let mut f = Function::new("add", &[i64t, i64t], i64t);
        let entry = f.add_block("entry");
        let lhs = Value::Local(f.params[0]);
        let rhs = Value::Local(f.params[1]);
        let sum = f.push_inst(
            entry,
            InstData::Arith {
                op: ArithOp::Add,
                lhs,
                rhs,
            },
            i64t,
            "sum",
        );
        f.set_terminator(
            entry,
            InstData::Return {
                value: Value::Local(sum),
            },
            ctx,
        );
        f
    }

    #[test]
    fn test_use_lists_track_operands() {
        let mut ctx = Context::new();
        let f = make_add_function(&mut ctx);
        let p0 = f.params[0];
        assert_eq!(f.users(p0).len(), 1);
        let sum = f.users(p0)[0];
        assert!(matches!(f.inst_data(sum), InstData::Arith { .. }));
        assert_eq!(f.users(sum).len(), 1);
    }

    #[test]
    fn test_replace_all_uses() {
        let mut ctx = Context::new();
        let mut f = make_add_function(&mut ctx);
        let p0 = f.params[0];
        let sum = f.users(p0)[0];
        let c = ctx.int_constant(7, 64);
        f.replace_all_uses(sum, Value::Const(c));
        assert!(f.is_unused(sum));
        let ret = f.terminator(f.entry()).unwrap();
        assert_eq!(
            f.inst_data(ret),
            &InstData::Return {
                value: Value::Const(c)
            }
        );
    }

    #[test]
    fn test_erase_inst_clears_operand_uses() {
        let mut ctx = Context::new();
        let mut f = make_add_function(&mut ctx);
        let p0 = f.params[0];
        let sum = f.users(p0)[0];
        let undef = ctx.undef(f.return_type);
        let ret = f.terminator(f.entry()).unwrap();
        f.update_operand(ret, Value::Local(sum), Value::Const(undef));
        assert!(f.is_unused(sum));
        f.erase_inst(sum);
        assert!(f.is_unused(p0));
        assert!(f.value(sum).dead);
    }

    #[test]
    fn test_unique_names() {
        let mut f = Function::new("f", &[], TypeId::default());
        assert_eq!(f.unique_name("x"), "x");
        assert_eq!(f.unique_name("x"), "x.1");
        assert_eq!(f.unique_name("x"), "x.2");
    }

    #[test]
    fn test_duplicate_operand_multiplicity() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut f = Function::new("f", &[i64t], i64t);
        let entry = f.add_block("entry");
        let p = Value::Local(f.params[0]);
        let dbl = f.push_inst(
            entry,
            InstData::Arith {
                op: ArithOp::Add,
                lhs: p,
                rhs: p,
            },
            i64t,
            "dbl",
        );
        // One use-list entry per operand slot.
        assert_eq!(f.value(f.params[0]).uses.len(), 2);
        let c = ctx.int_constant(1, 64);
        f.update_operand(dbl, p, Value::Const(c));
        assert!(f.is_unused(f.params[0]));
    }
}
