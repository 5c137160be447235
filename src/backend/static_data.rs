//! Static data layout.
//!
//! Global variables serialize into one linear byte image matching the
//! type's field offsets. Pointer constants use the 64-bit encoding
//! `{ slot: u32, offset: u32 }` (slot in the upper half); slot 1 denotes
//! the static-data region. Function pointers are written as zero
//! placeholders and recorded for the assembler to patch.

use hashbrown::HashMap;

use crate::backend::mir::AddressPlaceholder;
use crate::ir::context::{ConstData, ConstId, Context};
use crate::ir::ir::{GlobalId, Module};
use crate::ir::types::TypeData;

/// The slot index of the static data region in virtual pointers.
pub const STATIC_DATA_SLOT: u32 = 1;

/// Encodes a virtual pointer as `{ slot: u32, offset: u32 }`.
pub fn encode_pointer(slot: u32, offset: u32) -> u64 {
    ((slot as u64) << 32) | offset as u64
}

/// Serializes `constant` into `out` (whose length must equal the constant
/// type's size). Returns `false` when a function pointer was encountered;
/// those cannot be evaluated to bytes without the assembler's address map.
pub fn write_constant_bytes(ctx: &Context, constant: ConstId, out: &mut [u8]) -> bool {
    let mut placeholders = Vec::new();
    let complete = write_impl(ctx, constant, out, 0, &mut placeholders);
    complete && placeholders.is_empty()
}

/// Serialization that tolerates function pointers by recording patch
/// locations instead of failing.
pub fn write_constant_with_placeholders(
    ctx: &Context,
    constant: ConstId,
    out: &mut [u8],
    base_offset: usize,
    placeholders: &mut Vec<AddressPlaceholder>,
) {
    let mut local = Vec::new();
    write_impl(ctx, constant, out, 0, &mut local);
    for (offset, function) in local {
        placeholders.push(AddressPlaceholder {
            offset: base_offset + offset,
            function,
        });
    }
}

fn write_impl(
    ctx: &Context,
    constant: ConstId,
    out: &mut [u8],
    at: usize,
    placeholders: &mut Vec<(usize, crate::ir::ir::FuncId)>,
) -> bool {
    let ty = ctx.const_type(constant);
    let size = ctx.types.size(ty);
    match ctx.const_data(constant) {
        ConstData::Int { value, .. } => {
            out[at..at + size].copy_from_slice(&value.to_le_bytes()[..size]);
            true
        }
        ConstData::Float { bits, .. } => {
            out[at..at + size].copy_from_slice(&bits.to_le_bytes()[..size]);
            true
        }
        ConstData::Undef { .. } => {
            out[at..at + size].fill(0);
            true
        }
        ConstData::NullPtr => {
            out[at..at + 8].fill(0);
            true
        }
        ConstData::Array { elems, ty } => {
            let TypeData::Array { elem, .. } = *ctx.types.data(*ty) else {
                unreachable!()
            };
            let elem_size = ctx.types.size(elem);
            let mut complete = true;
            for (index, &e) in elems.iter().enumerate() {
                complete &= write_impl(ctx, e, out, at + index * elem_size, placeholders);
            }
            complete
        }
        ConstData::Record { elems, ty } => {
            let members = ctx.types.members(*ty).to_vec();
            let mut complete = true;
            for (member, &e) in members.iter().zip(elems.iter()) {
                complete &= write_impl(ctx, e, out, at + member.offset, placeholders);
            }
            complete
        }
        ConstData::FunctionPtr { func } => {
            out[at..at + 8].fill(0);
            placeholders.push((at, *func));
            false
        }
    }
}

/// The laid-out static data of a module: the byte image, each global's
/// encoded address, and the function-pointer patch list.
pub struct StaticData {
    pub image: Vec<u8>,
    pub addresses: HashMap<GlobalId, u64>,
    pub placeholders: Vec<AddressPlaceholder>,
}

pub fn layout_globals(ctx: &Context, module: &Module) -> StaticData {
    let mut image = Vec::new();
    let mut addresses = HashMap::new();
    let mut placeholders = Vec::new();
    for (index, global) in module.globals.iter().enumerate() {
        let size = ctx.types.size(global.value_type);
        let align = ctx.types.align(global.value_type).max(1);
        let offset = image.len().div_ceil(align) * align;
        image.resize(offset + size, 0);
        write_constant_with_placeholders(
            ctx,
            global.initializer,
            &mut image[offset..offset + size],
            offset,
            &mut placeholders,
        );
        addresses.insert(
            GlobalId(index as u32),
            encode_pointer(STATIC_DATA_SLOT, offset as u32),
        );
    }
    StaticData {
        image,
        addresses,
        placeholders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::GlobalVariable;

    #[test]
    fn test_record_image_respects_offsets() {
        let mut ctx = Context::new();
        let i8t = ctx.int_type(8);
        let i32t = ctx.int_type(32);
        let rec = ctx.anonymous_struct(&[i8t, i32t]);
        let a = ctx.int_constant(0xAB, 8);
        let b = ctx.int_constant(0x1234_5678, 32);
        let init = ctx.record_constant(vec![a, b], rec);
        let mut out = vec![0u8; ctx.types.size(rec)];
        assert!(write_constant_bytes(&ctx, init, &mut out));
        assert_eq!(out[0], 0xAB);
        // Padding, then the i32 at offset 4, little endian.
        assert_eq!(&out[4..8], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_global_addresses_use_slot_one() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let init = ctx.int_constant(7, 64);
        let mut module = Module::new();
        let g = module.add_global(GlobalVariable {
            name: "g".to_string(),
            value_type: i64t,
            initializer: init,
            mutable: false,
        });
        let data = layout_globals(&ctx, &module);
        let address = data.addresses[&g];
        assert_eq!(address >> 32, STATIC_DATA_SLOT as u64);
        assert_eq!(address & 0xFFFF_FFFF, 0);
        assert_eq!(&data.image[..8], &7u64.to_le_bytes());
    }

    #[test]
    fn test_function_pointer_becomes_placeholder() {
        let mut ctx = Context::new();
        let fp = ctx.function_pointer(crate::ir::ir::FuncId(3));
        let mut out = vec![0u8; 8];
        assert!(!write_constant_bytes(&ctx, fp, &mut out));
        let mut placeholders = Vec::new();
        write_constant_with_placeholders(&ctx, fp, &mut out, 16, &mut placeholders);
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].offset, 16);
        assert_eq!(placeholders[0].function, crate::ir::ir::FuncId(3));
    }
}
