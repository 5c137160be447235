//! The compilation context and the SSA intermediate representation.

pub mod builder;
pub mod context;
#[allow(clippy::module_inception)]
pub mod ir;
pub mod pointer_info;
pub mod print;
pub mod types;
pub mod validate;

pub use context::{ConstData, ConstId, Context};
pub use ir::{
    ArithOp, BlockId, Callee, CompareMode, CompareOp, Conversion, ExtFuncId, ExtFunction, FuncId,
    Function, FunctionAttributes, GlobalId, GlobalVariable, InstData, Module, UnaryArithOp, Value,
    ValueId,
};
pub use types::{TypeData, TypeId};
