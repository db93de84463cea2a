//! PTX Register Management
//!
//! Special hardware registers and per-function virtual register allocation.
//! Passes in this crate mint fresh virtual registers for broadcast
//! temporaries, axis predicates and loop counters; nothing is coalesced.

use super::types::PtxType;
use std::collections::HashMap;

/// Special PTX registers (read-only hardware registers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtxReg {
    /// Thread ID X dimension (lockstep lane index)
    TidX,
    /// Thread ID Y dimension (cooperative group index)
    TidY,
    /// Thread ID Z dimension
    TidZ,
    /// Block dimension X (threads per block)
    NtidX,
    /// Block dimension Y
    NtidY,
    /// Warp ID within block
    WarpId,
    /// Lane ID within warp (0-31)
    LaneId,
}

impl PtxReg {
    /// Convert to PTX string representation
    #[must_use]
    pub const fn to_ptx_string(self) -> &'static str {
        match self {
            Self::TidX => "%tid.x",
            Self::TidY => "%tid.y",
            Self::TidZ => "%tid.z",
            Self::NtidX => "%ntid.x",
            Self::NtidY => "%ntid.y",
            Self::WarpId => "%warpid",
            Self::LaneId => "%laneid",
        }
    }

    /// Get the data type of this special register
    #[must_use]
    pub const fn data_type(self) -> PtxType {
        PtxType::U32
    }
}

/// Virtual register (pre-allocation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualReg {
    id: u32,
    ty: PtxType,
}

impl VirtualReg {
    /// Create a new virtual register
    #[must_use]
    pub const fn new(id: u32, ty: PtxType) -> Self {
        Self { id, ty }
    }

    /// Get register ID
    #[must_use]
    pub const fn id(self) -> u32 {
        self.id
    }

    /// Get register type
    #[must_use]
    pub const fn ty(self) -> PtxType {
        self.ty
    }

    /// Convert to PTX string
    #[must_use]
    pub fn to_ptx_string(self) -> String {
        format!("{}{}", self.ty.register_prefix(), self.id)
    }
}

/// Hands out function-unique virtual registers
#[derive(Debug, Clone, Default)]
pub struct RegisterAllocator {
    next_id: u32,
    allocated: Vec<VirtualReg>,
}

impl RegisterAllocator {
    /// Create a new register allocator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new virtual register
    pub fn allocate_virtual(&mut self, ty: PtxType) -> VirtualReg {
        let vreg = VirtualReg::new(self.next_id, ty);
        self.next_id += 1;
        self.allocated.push(vreg);
        vreg
    }

    /// Number of registers handed out so far
    #[must_use]
    pub fn count(&self) -> usize {
        self.allocated.len()
    }

    /// Generate register declarations for PTX, one line per register class
    #[must_use]
    pub fn emit_declarations(&self) -> String {
        let mut by_prefix: HashMap<(&'static str, &'static str), u32> = HashMap::new();
        for vreg in &self.allocated {
            let ty = vreg.ty();
            let slot = by_prefix
                .entry((ty.register_prefix(), ty.to_ptx_string()))
                .or_default();
            *slot = (*slot).max(vreg.id() + 1);
        }

        let mut classes: Vec<_> = by_prefix.into_iter().collect();
        classes.sort_unstable();

        let mut decls = String::new();
        for ((prefix, ty), count) in classes {
            decls.push_str(&format!("    .reg {}  {}<{}>;\n", ty, prefix, count));
        }
        decls
    }
}
