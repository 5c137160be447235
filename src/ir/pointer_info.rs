//! Pointer provenance metadata.
//!
//! Every pointer-typed value may carry a [`PointerInfo`] describing what is
//! statically known about it: alignment, the number of valid bytes behind the
//! pointer, the allocation it was derived from, its constant offset into that
//! allocation, and nullness/escape facts. Pointer analysis
//! (`passes::pointer_analysis`) populates these; aliasing and pointer-compare
//! folding consume them.

use crate::ir::ir::Value;

/// The allocation a pointer was ultimately derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// The originating allocation is a known value (an alloca or a call to
    /// the builtin allocator).
    Static(Value),
    /// The origin is opaque but identified: distinct dynamic provenances may
    /// still refer to the same allocation.
    Dynamic(Value),
}

impl Provenance {
    pub fn value(self) -> Value {
        match self {
            Provenance::Static(v) | Provenance::Dynamic(v) => v,
        }
    }

    pub fn is_static(self) -> bool {
        matches!(self, Provenance::Static(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerInfo {
    /// Alignment the pointer is known to satisfy. Zero means unknown.
    pub align: usize,
    /// Statically known number of accessible bytes behind the pointer.
    pub valid_size: Option<usize>,
    pub provenance: Provenance,
    /// Constant byte offset relative to the provenance, when known.
    pub static_offset: Option<usize>,
    pub guaranteed_not_null: bool,
    /// Set when the pointed-to allocation is known not to escape the
    /// function.
    pub non_escaping: bool,
}

impl PointerInfo {
    pub fn indeterminate(origin: Value) -> Self {
        PointerInfo {
            align: 0,
            valid_size: None,
            provenance: Provenance::Dynamic(origin),
            static_offset: None,
            guaranteed_not_null: false,
            non_escaping: false,
        }
    }
}
