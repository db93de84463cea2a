//! PTX Intermediate Representation
//!
//! The CFG and instruction stream the divergence passes consume and mutate.
//!
//! ## Architecture
//!
//! ```text
//! Function ─┬─ blocks (BlockId arena, succs/preds, layout order)
//!           ├─ instructions (InsnId arena, owner block per insn)
//!           ├─ virtual registers
//!           └─ optional local stack frame
//! ```
//!
//! ## Example
//!
//! ```rust
//! use trueno_simt::ptx::{AxisMask, Function, MarkerKind, PtxInstruction};
//!
//! let mut func = Function::new("kernel");
//! let entry = func.entry();
//! func.push(entry, PtxInstruction::marker(MarkerKind::Enter, AxisMask::LOCKSTEP));
//! func.push(entry, PtxInstruction::ret());
//! assert_eq!(func.insns(entry).len(), 2);
//! ```

mod axis;
mod cfg;
pub mod emit;
mod instructions;
mod liveness;
mod registers;
mod types;

pub use axis::{Axis, AxisMask};
pub use cfg::{BlockId, Frame, Function, InsnId};
pub use instructions::{
    Boundary, CmpOp, Marker, MarkerKind, Operand, Predicate, PtxInstruction, PtxOp,
    ReductionCall, ReductionOp, ReductionPhase,
};
pub use liveness::{LiveSet, Liveness};
pub use registers::{PtxReg, RegisterAllocator, VirtualReg};
pub use types::{PtxStateSpace, PtxType};

/// Threads per warp on every supported target
pub const WARP_SIZE: u32 = 32;

/// Maximum threads per block on every supported target
pub const MAX_THREADS_PER_BLOCK: u32 = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_constants() {
        assert_eq!(WARP_SIZE, 32);
        assert_eq!(MAX_THREADS_PER_BLOCK / WARP_SIZE, 32);
    }
}
