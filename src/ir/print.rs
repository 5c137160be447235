//! Textual IR output.
//!
//! Used by tests and by the validator's invariant-violation messages. The
//! format follows the human-readable SSA form: `func <type> @name(...)` with
//! `%block:` labels, typed operands, and the instruction mnemonics of the
//! data model.

use std::fmt::Write;

use crate::ir::context::{ConstData, Context};
use crate::ir::ir::{
    ArithOp, Callee, CompareMode, CompareOp, Conversion, Function, InstData, Module, UnaryArithOp,
    Value, ValueId,
};
use crate::ir::types::{TypeData, TypeId};

pub fn type_name(ctx: &Context, ty: TypeId) -> String {
    match ctx.types.data(ty) {
        TypeData::Void => "void".to_string(),
        TypeData::Int { bits } => format!("i{bits}"),
        TypeData::Float { bits } => format!("f{bits}"),
        TypeData::Ptr => "ptr".to_string(),
        TypeData::Array { elem, count } => format!("[{}, {}]", type_name(ctx, *elem), count),
        TypeData::Record {
            name: Some(name), ..
        } => format!("@{name}"),
        TypeData::Record { members, .. } => {
            let inner: Vec<String> = members.iter().map(|m| type_name(ctx, m.ty)).collect();
            format!("{{ {} }}", inner.join(", "))
        }
    }
}

fn const_name(ctx: &Context, id: crate::ir::context::ConstId) -> String {
    match ctx.const_data(id) {
        ConstData::Int { value, bits } => {
            format!("{}", crate::ir::context::sign_extend(*value, *bits))
        }
        ConstData::Float { .. } => format!("{}", ctx.float_value(id).unwrap()),
        ConstData::Undef { .. } => "undef".to_string(),
        ConstData::NullPtr => "null".to_string(),
        ConstData::Array { elems, .. } | ConstData::Record { elems, .. } => {
            let inner: Vec<String> = elems
                .iter()
                .map(|&e| format!("{} {}", type_name(ctx, ctx.const_type(e)), const_name(ctx, e)))
                .collect();
            format!("[{}]", inner.join(", "))
        }
        ConstData::FunctionPtr { func } => format!("@fn.{}", func.0),
    }
}

pub struct Printer<'a> {
    pub ctx: &'a Context,
    pub func: &'a Function,
    pub module: Option<&'a Module>,
}

impl<'a> Printer<'a> {
    pub fn new(ctx: &'a Context, func: &'a Function) -> Self {
        Printer {
            ctx,
            func,
            module: None,
        }
    }

    pub fn with_module(ctx: &'a Context, func: &'a Function, module: &'a Module) -> Self {
        Printer {
            ctx,
            func,
            module: Some(module),
        }
    }

    fn value_name(&self, value: Value) -> String {
        match value {
            Value::Local(id) => match &self.func.value(id).name {
                Some(name) => format!("%{name}"),
                None => format!("%v{}", id.0),
            },
            Value::Const(id) => const_name(self.ctx, id),
            Value::Global(id) => match self.module {
                Some(module) => format!("@{}", module.global(id).name),
                None => format!("@global.{}", id.0),
            },
            Value::Function(id) => {
                if id == self.func.id() {
                    format!("@{}", self.func.name)
                } else {
                    match self.module {
                        Some(module) if !module.function(id).name.is_empty() => {
                            format!("@{}", module.function(id).name)
                        }
                        _ => format!("@fn.{}", id.0),
                    }
                }
            }
            Value::ExtFunction(id) => match self.module {
                Some(module) => format!("@{}", module.ext_function(id).name),
                None => format!("@ext.{}", id.0),
            },
        }
    }

    fn typed_value(&self, value: Value) -> String {
        let ty = self.func.value_type(value, self.ctx);
        format!("{} {}", type_name(self.ctx, ty), self.value_name(value))
    }

    fn block_name(&self, block: crate::ir::ir::BlockId) -> String {
        format!("%{}", self.func.block(block).name)
    }

    pub fn inst_to_string(&self, id: ValueId) -> String {
        let data = self.func.inst_data(id);
        let ty = self.func.local_type(id);
        let mut s = String::new();
        if !self.ctx.types.is_void(ty) {
            let _ = write!(s, "{} = ", self.value_name(Value::Local(id)));
        }
        match data {
            InstData::Alloca { allocated, count } => {
                let _ = write!(
                    s,
                    "alloca {}, {}",
                    type_name(self.ctx, *allocated),
                    self.typed_value(*count)
                );
            }
            InstData::Load { addr } => {
                let _ = write!(
                    s,
                    "load {}, {}",
                    type_name(self.ctx, ty),
                    self.typed_value(*addr)
                );
            }
            InstData::Store { addr, value } => {
                let _ = write!(s, "store {}, {}", self.typed_value(*addr), self.typed_value(*value));
            }
            InstData::Gep {
                inbounds,
                base,
                index,
                members,
            } => {
                let _ = write!(
                    s,
                    "getelementptr inbounds {}, {}, {}",
                    type_name(self.ctx, *inbounds),
                    self.typed_value(*base),
                    self.typed_value(*index)
                );
                for m in members {
                    let _ = write!(s, ", {m}");
                }
            }
            InstData::Arith { op, lhs, rhs } => {
                let _ = write!(
                    s,
                    "{} {}, {}",
                    arith_mnemonic(*op),
                    self.typed_value(*lhs),
                    self.value_name(*rhs)
                );
            }
            InstData::UnaryArith { op, operand } => {
                let mnemonic = match op {
                    UnaryArithOp::BitwiseNot => "bnt",
                    UnaryArithOp::LogicalNot => "lnt",
                    UnaryArithOp::Negate => "neg",
                };
                let _ = write!(s, "{} {}", mnemonic, self.typed_value(*operand));
            }
            InstData::Cmp { mode, op, lhs, rhs } => {
                let mode = match mode {
                    CompareMode::Signed => "scmp",
                    CompareMode::Unsigned => "ucmp",
                    CompareMode::Float => "fcmp",
                };
                let _ = write!(
                    s,
                    "{} {} {}, {}",
                    mode,
                    cmp_mnemonic(*op),
                    self.typed_value(*lhs),
                    self.typed_value(*rhs)
                );
            }
            InstData::Conv { conv, operand } => {
                let _ = write!(
                    s,
                    "{} {} to {}",
                    conv_mnemonic(*conv),
                    self.typed_value(*operand),
                    type_name(self.ctx, ty)
                );
            }
            InstData::Call { callee, args } => {
                let target = match callee {
                    Callee::Function(id) => self.value_name(Value::Function(*id)),
                    Callee::Ext(id) => self.value_name(Value::ExtFunction(*id)),
                    Callee::Indirect(v) => self.value_name(*v),
                };
                let _ = write!(s, "call {} {}", type_name(self.ctx, ty), target);
                for arg in args {
                    let _ = write!(s, ", {}", self.typed_value(*arg));
                }
            }
            InstData::Phi { args } => {
                let _ = write!(s, "phi {}", type_name(self.ctx, ty));
                for (i, (pred, value)) in args.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    let _ = write!(
                        s,
                        "{sep}[label {} : {}]",
                        self.block_name(*pred),
                        self.value_name(*value)
                    );
                }
            }
            InstData::Select {
                cond,
                then_value,
                else_value,
            } => {
                let _ = write!(
                    s,
                    "select {}, {}, {}",
                    self.typed_value(*cond),
                    self.typed_value(*then_value),
                    self.typed_value(*else_value)
                );
            }
            InstData::ExtractValue { base, members } => {
                let _ = write!(s, "extract_value {}", self.typed_value(*base));
                for m in members {
                    let _ = write!(s, ", {m}");
                }
            }
            InstData::InsertValue {
                base,
                inserted,
                members,
            } => {
                let _ = write!(
                    s,
                    "insert_value {}, {}",
                    self.typed_value(*base),
                    self.typed_value(*inserted)
                );
                for m in members {
                    let _ = write!(s, ", {m}");
                }
            }
            InstData::Goto { target } => {
                let _ = write!(s, "goto label {}", self.block_name(*target));
            }
            InstData::Branch {
                cond,
                then_target,
                else_target,
            } => {
                let _ = write!(
                    s,
                    "branch {}, label {}, label {}",
                    self.typed_value(*cond),
                    self.block_name(*then_target),
                    self.block_name(*else_target)
                );
            }
            InstData::Return { value } => {
                let _ = write!(s, "return {}", self.typed_value(*value));
            }
        }
        s
    }

    pub fn function_to_string(&self) -> String {
        let mut s = String::new();
        let params: Vec<String> = self
            .func
            .params
            .iter()
            .map(|&p| self.typed_value(Value::Local(p)))
            .collect();
        let _ = writeln!(
            s,
            "func {} @{}({}) {{",
            type_name(self.ctx, self.func.return_type),
            self.func.name,
            params.join(", ")
        );
        for block in self.func.block_ids() {
            let _ = writeln!(s, "  {}:", self.block_name(block));
            for &inst in &self.func.block(block).insts {
                let _ = writeln!(s, "    {}", self.inst_to_string(inst));
            }
        }
        let _ = writeln!(s, "}}");
        s
    }
}

fn arith_mnemonic(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "add",
        ArithOp::Sub => "sub",
        ArithOp::Mul => "mul",
        ArithOp::SDiv => "sdiv",
        ArithOp::UDiv => "udiv",
        ArithOp::SRem => "srem",
        ArithOp::URem => "urem",
        ArithOp::FAdd => "fadd",
        ArithOp::FSub => "fsub",
        ArithOp::FMul => "fmul",
        ArithOp::FDiv => "fdiv",
        ArithOp::LShL => "lshl",
        ArithOp::LShR => "lshr",
        ArithOp::AShL => "ashl",
        ArithOp::AShR => "ashr",
        ArithOp::And => "and",
        ArithOp::Or => "or",
        ArithOp::XOr => "xor",
    }
}

fn cmp_mnemonic(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Equal => "eq",
        CompareOp::NotEqual => "neq",
        CompareOp::Less => "ls",
        CompareOp::LessEq => "leq",
        CompareOp::Greater => "grt",
        CompareOp::GreaterEq => "geq",
    }
}

fn conv_mnemonic(conv: Conversion) -> &'static str {
    match conv {
        Conversion::Zext => "zext",
        Conversion::Sext => "sext",
        Conversion::Trunc => "trunc",
        Conversion::Fext => "fext",
        Conversion::Ftrunc => "ftrunc",
        Conversion::UtoF => "utof",
        Conversion::StoF => "stof",
        Conversion::FtoU => "ftou",
        Conversion::FtoS => "ftos",
        Conversion::Bitcast => "bitcast",
    }
}

/// Prints the whole module: globals first, then every function.
pub fn module_to_string(ctx: &Context, module: &Module) -> String {
    let mut s = String::new();
    for global in &module.globals {
        let kind = if global.mutable { "global" } else { "constant" };
        let _ = writeln!(
            s,
            "@{} = {} {} {}",
            global.name,
            kind,
            type_name(ctx, global.value_type),
            const_name(ctx, global.initializer)
        );
    }
    if !module.globals.is_empty() {
        let _ = writeln!(s);
    }
    for func in &module.functions {
        let printer = Printer::with_module(ctx, func, module);
        let _ = writeln!(s, "{}", printer.function_to_string());
    }
    s
}

/// One-line declaration of a value, used in invariant-violation messages.
pub fn value_decl(ctx: &Context, func: &Function, id: ValueId) -> String {
    let printer = Printer::new(ctx, func);
    match &func.value(id).kind {
        crate::ir::ir::ValueKind::Param { index } => {
            format!(
                "parameter {} of @{}: {}",
                index,
                func.name,
                printer.typed_value(Value::Local(id))
            )
        }
        crate::ir::ir::ValueKind::Inst(_) => printer.inst_to_string(id),
    }
}
