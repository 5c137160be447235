//! Pointer provenance analysis.
//!
//! A forward fixpoint over the pointer-producing instructions of a function,
//! attaching [`PointerInfo`] records: allocas know their size, alignment and
//! that they are distinct allocations; geps adjust alignment, valid size and
//! offset; calls to the builtin allocator produce fresh 16-byte-aligned
//! allocations; other calls produce opaque dynamic provenances. Instructions
//! the analysis does not understand keep no info, which alias queries treat
//! as "may alias anything".

use hashbrown::HashSet;

use crate::ir::context::Context;
use crate::ir::ir::{FuncId, Function, InstData, Module, Value, ValueId};
use crate::ir::pointer_info::{PointerInfo, Provenance};
use crate::passes::common::is_builtin_alloc;
use crate::passes::{Pass, PassCategory, PassRegistry};

pub(crate) fn register(registry: &mut PassRegistry) {
    registry.add(Pass {
        name: "ptranalysis",
        category: PassCategory::Analysis,
        run: pointer_analysis,
    });
}

pub fn pointer_analysis(ctx: &mut Context, module: &mut Module, id: FuncId) -> bool {
    module.with_function(id, |module, func| {
        let mut pass = PtrAnalyze {
            visited: HashSet::new(),
            modified: false,
        };
        for inst in func.instructions() {
            if ctx.types.is_ptr(func.local_type(inst))
                || producing_fat_pointer(func, module, inst)
            {
                pass.analyze(ctx, module, func, inst);
            }
        }
        pass.modified
    })
}

/// Calls to the builtin allocator produce a `{ ptr, i64 }` record whose
/// pointer element carries the allocation's info.
fn producing_fat_pointer(func: &Function, module: &Module, inst: ValueId) -> bool {
    matches!(func.inst_data(inst), InstData::Call { .. }) && is_builtin_alloc(func, module, inst)
}

struct PtrAnalyze {
    visited: HashSet<ValueId>,
    modified: bool,
}

impl PtrAnalyze {
    fn analyze(&mut self, ctx: &Context, module: &Module, func: &mut Function, inst: ValueId) {
        if func.value(inst).ptr_info.is_some() {
            return;
        }
        if !self.visited.insert(inst) {
            return;
        }
        let info = match func.inst_data(inst).clone() {
            InstData::Alloca { allocated, count } => {
                let size = count
                    .as_const()
                    .and_then(|c| ctx.int_value(c))
                    .map(|n| n as usize * ctx.types.size(allocated));
                Some(PointerInfo {
                    align: ctx.types.align(allocated),
                    valid_size: size,
                    provenance: Provenance::Static(Value::Local(inst)),
                    static_offset: Some(0),
                    guaranteed_not_null: true,
                    non_escaping: false,
                })
            }
            InstData::Gep {
                inbounds,
                base,
                index,
                members,
            } => {
                if let Some(base_inst) = base.as_local() {
                    if func.value(base_inst).is_inst() {
                        self.analyze(ctx, module, func, base_inst);
                    }
                }
                func.pointer_info(base).copied().map(|base_info| {
                    let byte_offset =
                        constant_byte_offset(ctx, inbounds, index, &members);
                    let (accessed_ty, _) = ctx.types.inner_type_and_offset(inbounds, &members);
                    let align = match byte_offset {
                        Some(offset) if base_info.align > 0 => {
                            compute_align(base_info.align, offset)
                        }
                        _ => base_info.align.min(ctx.types.align(accessed_ty)),
                    };
                    let valid_size = match (base_info.valid_size, byte_offset) {
                        (Some(size), Some(offset)) => Some(size.saturating_sub(offset)),
                        _ => None,
                    };
                    let static_offset = match (base_info.static_offset, byte_offset) {
                        (Some(base_off), Some(off)) => Some(base_off + off),
                        _ => None,
                    };
                    PointerInfo {
                        align,
                        valid_size,
                        provenance: base_info.provenance,
                        static_offset,
                        guaranteed_not_null: base_info.guaranteed_not_null,
                        non_escaping: base_info.non_escaping,
                    }
                })
            }
            InstData::ExtractValue { base, members } => {
                if let Some(base_inst) = base.as_local() {
                    if func.value(base_inst).is_inst() {
                        self.analyze(ctx, module, func, base_inst);
                    }
                }
                // Only the pointer element of a fat pointer carries info.
                if members.as_slice() == [0] {
                    func.pointer_info(base).copied()
                } else {
                    None
                }
            }
            InstData::Call { .. } => {
                if is_builtin_alloc(func, module, inst) {
                    // Pointers returned by the builtin allocator are aligned
                    // to 16 byte boundaries.
                    Some(PointerInfo {
                        align: 16,
                        valid_size: None,
                        provenance: Provenance::Static(Value::Local(inst)),
                        static_offset: Some(0),
                        guaranteed_not_null: true,
                        non_escaping: false,
                    })
                } else if ctx.types.is_ptr(func.local_type(inst)) {
                    Some(PointerInfo {
                        align: 0,
                        valid_size: None,
                        provenance: Provenance::Dynamic(Value::Local(inst)),
                        static_offset: Some(0),
                        guaranteed_not_null: false,
                        non_escaping: false,
                    })
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(info) = info {
            func.set_pointer_info(inst, info);
            self.modified = true;
        }
    }
}

/// `gcd`-like alignment of a pointer displaced by `offset` from a
/// `base_align`-aligned address.
fn compute_align(base_align: usize, offset: usize) -> usize {
    let rem = offset % base_align;
    if rem == 0 {
        base_align
    } else {
        rem
    }
}

/// The constant byte offset a gep computes, when its array index is constant.
pub fn constant_byte_offset(
    ctx: &Context,
    inbounds: crate::ir::types::TypeId,
    index: Value,
    members: &[u32],
) -> Option<usize> {
    let array_index = index.as_const().and_then(|c| ctx.int_value(c))? as usize;
    let (_, inner_offset) = ctx.types.inner_type_and_offset(inbounds, members);
    Some(array_index * ctx.types.size(inbounds) + inner_offset)
}

fn is_alloca(func: &Function, value: Value) -> bool {
    value
        .as_local()
        .is_some_and(|id| func.value(id).is_inst() && func.inst_data(id).is_alloca())
}

fn is_alloc_call(func: &Function, module: &Module, value: Value) -> bool {
    value
        .as_local()
        .is_some_and(|id| func.value(id).is_inst() && is_builtin_alloc(func, module, id))
}

/// Provenance-based aliasing: two pointers may alias unless their origins
/// are provably disjoint allocations.
pub fn may_alias(func: &Function, module: &Module, a: Value, b: Value) -> bool {
    let (Some(ia), Some(ib)) = (func.pointer_info(a), func.pointer_info(b)) else {
        return true;
    };
    let pa = ia.provenance;
    let pb = ib.provenance;
    if pa == pb {
        return true;
    }
    if pa.is_static() && pb.is_static() && pa.value() != pb.value() {
        return false;
    }
    if is_alloca(func, pa.value()) {
        return alloca_may_alias(func, module, ia, ib);
    }
    if is_alloca(func, pb.value()) {
        return alloca_may_alias(func, module, ib, ia);
    }
    if is_alloc_call(func, module, pa.value()) {
        return dyn_alloc_may_alias(func, module, ia, ib);
    }
    if is_alloc_call(func, module, pb.value()) {
        return dyn_alloc_may_alias(func, module, ib, ia);
    }
    true
}

fn alloca_may_alias(
    func: &Function,
    module: &Module,
    alloc: &PointerInfo,
    other: &PointerInfo,
) -> bool {
    let other_prov = other.provenance.value();
    // Two distinct allocas never alias, and automatic storage never aliases
    // dynamic allocations.
    if is_alloca(func, other_prov) || is_alloc_call(func, module, other_prov) {
        return false;
    }
    if alloc.non_escaping {
        return false;
    }
    true
}

fn dyn_alloc_may_alias(
    func: &Function,
    module: &Module,
    alloc: &PointerInfo,
    other: &PointerInfo,
) -> bool {
    let other_prov = other.provenance.value();
    if is_alloc_call(func, module, other_prov) || is_alloca(func, other_prov) {
        return false;
    }
    if alloc.non_escaping {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::{Callee, ExtFunction};

    fn alloc_ext(ctx: &mut Context, module: &mut Module) -> crate::ir::ir::ExtFuncId {
        let i64t = ctx.int_type(64);
        let ptr = ctx.ptr_type();
        let fat = ctx.anonymous_struct(&[ptr, i64t]);
        module.declare_ext_function(ExtFunction {
            name: crate::passes::common::BUILTIN_ALLOC.to_string(),
            slot: 1,
            index: 0,
            params: vec![i64t, i64t],
            return_type: fat,
        })
    }

    #[test]
    fn test_distinct_allocas_do_not_alias() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        b.add_new_block("entry");
        let a = b.alloca(i64t, "a");
        let bb = b.alloca(i64t, "b");
        let va = b.load(a, i64t, "va");
        let vb = b.load(bb, i64t, "vb");
        let sum = b.arith(crate::ir::ir::ArithOp::Add, va, vb, "sum");
        b.ret(sum);
        let mut module = Module::new();
        let id = module.add_function(b.finish());
        pointer_analysis(&mut ctx, &mut module, id);
        let f = module.function(id);
        assert!(!may_alias(f, &module, a, bb));
        assert!(may_alias(f, &module, a, a));
        let info = f.pointer_info(a).unwrap();
        assert_eq!(info.valid_size, Some(8));
        assert_eq!(info.align, 8);
        assert!(info.guaranteed_not_null);
    }

    #[test]
    fn test_alloca_and_dynamic_allocation_do_not_alias() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let mut module = Module::new();
        let alloc = alloc_ext(&mut ctx, &mut module);
        let fat = module.ext_function(alloc).return_type;
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        b.add_new_block("entry");
        let a = b.alloca(i64t, "a");
        let size = Value::Const(b.ctx.int_constant(8, 64));
        let align = Value::Const(b.ctx.int_constant(8, 64));
        let fatptr = b.call(Callee::Ext(alloc), &[size, align], fat, "mem");
        let p = b.extract_value(fatptr, &[0u32], "p");
        let v = b.load(p, i64t, "v");
        let w = b.load(a, i64t, "w");
        let sum = b.arith(crate::ir::ir::ArithOp::Add, v, w, "sum");
        b.ret(sum);
        let id = module.add_function(b.finish());
        pointer_analysis(&mut ctx, &mut module, id);
        let f = module.function(id);
        assert_eq!(f.pointer_info(p).unwrap().align, 16);
        assert!(!may_alias(f, &module, a, p));
    }

    #[test]
    fn test_gep_adjusts_alignment_and_size() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let i8t = ctx.int_type(8);
        let arr = ctx.array_type(i64t, 4);
        let mut b = FunctionBuilder::new(&mut ctx, "f", &[], i64t);
        b.add_new_block("entry");
        let a = b.alloca(arr, "a");
        let three = Value::Const(b.ctx.int_constant(3, 64));
        let p = b.gep(i8t, a, three, &[], "p");
        let v = b.load(p, i64t, "v");
        b.ret(v);
        let mut module = Module::new();
        let id = module.add_function(b.finish());
        pointer_analysis(&mut ctx, &mut module, id);
        let f = module.function(id);
        let info = f.pointer_info(p).unwrap();
        assert_eq!(info.align, 3, "8-aligned base displaced by 3 bytes");
        assert_eq!(info.valid_size, Some(29));
        assert_eq!(info.static_offset, Some(3));
        // Same provenance still may alias.
        assert!(may_alias(f, &module, a, p));
    }
}
