//! PTX Instructions
//!
//! The instruction set the neutering passes read and write, including the
//! region marker and reduction pseudo-instructions placed by the front end.

use super::axis::{Axis, AxisMask};
use super::cfg::BlockId;
use super::registers::{PtxReg, VirtualReg};
use super::types::{PtxStateSpace, PtxType};

/// PTX operation codes
#[derive(Debug, Clone, PartialEq)]
pub enum PtxOp {
    // ===== Arithmetic =====
    /// Add two values
    Add,
    /// Subtract
    Sub,
    /// Multiply
    Mul,
    /// Minimum
    Min,
    /// Maximum
    Max,

    // ===== Comparison =====
    /// Set predicate (comparison in `PtxInstruction::cmp`)
    Setp,

    // ===== Logical/Bitwise =====
    /// Bitwise AND
    And,
    /// Bitwise OR
    Or,
    /// Bitwise XOR
    Xor,
    /// Shift right (logical)
    Shr,

    // ===== Data Movement =====
    /// Move/copy
    Mov,
    /// Load from memory
    Ld,
    /// Store to memory: srcs = [address, value]
    St,
    /// Convert type
    Cvt,
    /// Select based on predicate
    Selp,
    /// `mov.b64 {lo, hi}, src`: split a 64-bit value into two halves
    Unpack,
    /// `mov.b64 dst, {lo, hi}`: join two halves
    Pack,

    // ===== Warp-Level =====
    /// Warp shuffle down
    ShflDown,
    /// Warp shuffle indexed
    ShflIdx,

    // ===== Control Flow =====
    /// Branch; target is a block or a label
    Bra,
    /// Call
    Call,
    /// Return
    Ret,
    /// Exit kernel
    Exit,
    /// Abort execution
    Trap,
    /// Barrier synchronization
    Bar,
    /// Memory fence
    MemBar,

    // ===== Atomic =====
    /// Atomic compare-and-swap: srcs = [address, expected, replacement]
    AtomCas,

    // ===== Pseudo =====
    /// Label definition (name in `PtxInstruction::label`)
    Label,
    /// Region boundary marker
    Marker(Marker),
    /// Reduction call site, expanded before neutering
    Reduction(ReductionCall),
}

/// Comparison operators for setp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

impl CmpOp {
    /// Convert to PTX string
    #[must_use]
    pub const fn to_ptx_string(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
        }
    }
}

/// Kind of region marker.
///
/// `Enter` and `Leave` head their block after splitting. `PreEnter` and
/// `PreLeave` end the single predecessor of that block and bracket the
/// spill side of a cooperative broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    /// Last instruction before the region's first block
    PreEnter,
    /// First instruction of the region
    Enter,
    /// Last instruction before the region's exit block
    PreLeave,
    /// First instruction after the region
    Leave,
}

/// Region marker: kind plus the axes the region partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Marker {
    /// Marker kind
    pub kind: MarkerKind,
    /// Partitioned axes, possibly with the call flag
    pub mask: AxisMask,
}

/// Block-splitting boundary classification of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Region entry with its mask
    Enter(AxisMask),
    /// Region exit with its mask
    Leave(AxisMask),
    /// Function return
    Return,
}

/// Associative combining operator of a reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionOp {
    /// `+`
    Add,
    /// `*`
    Mul,
    /// minimum
    Min,
    /// maximum
    Max,
    /// bitwise and
    And,
    /// bitwise or
    Or,
    /// bitwise xor
    Xor,
}

impl ReductionOp {
    /// Arithmetic instruction implementing the operator
    #[must_use]
    pub const fn to_ptx_op(self) -> PtxOp {
        match self {
            Self::Add => PtxOp::Add,
            Self::Mul => PtxOp::Mul,
            Self::Min => PtxOp::Min,
            Self::Max => PtxOp::Max,
            Self::And => PtxOp::And,
            Self::Or => PtxOp::Or,
            Self::Xor => PtxOp::Xor,
        }
    }
}

/// Phase of the four-phase reduction protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionPhase {
    /// Before the partitioned region
    Setup,
    /// At region entry, per thread
    Init,
    /// At region exit, combine partial results
    Fini,
    /// After the partitioned region
    Teardown,
}

/// Reduction call site payload.
///
/// Operands live on the carrying instruction: `dst` is the result,
/// `srcs[0]` the private value and `srcs[1]` (optional) the receiver
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReductionCall {
    /// Protocol phase
    pub phase: ReductionPhase,
    /// Axis being reduced over
    pub axis: Axis,
    /// Combining operator
    pub op: ReductionOp,
    /// Byte offset into the cooperative reduction buffer
    pub offset: u32,
}

/// A single PTX instruction
#[derive(Debug, Clone, PartialEq)]
pub struct PtxInstruction {
    /// Operation
    pub op: PtxOp,
    /// Data type
    pub ty: PtxType,
    /// Destination register (if any)
    pub dst: Option<Operand>,
    /// Multiple destination registers (for unpack)
    pub dsts: Vec<Operand>,
    /// Source operands
    pub srcs: Vec<Operand>,
    /// Predicate guard (optional)
    pub predicate: Option<Predicate>,
    /// State space (for memory ops)
    pub state_space: Option<PtxStateSpace>,
    /// Comparison (for setp)
    pub cmp: Option<CmpOp>,
    /// Label (for label definitions and named branch targets)
    pub label: Option<String>,
    /// Branch condition is known identical across the executing threads
    pub uniform: bool,
    /// Call never returns
    pub noreturn: bool,
}

/// Instruction operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Virtual register
    Reg(VirtualReg),
    /// Special register
    SpecialReg(PtxReg),
    /// Immediate integer
    ImmI64(i64),
    /// Immediate unsigned
    ImmU64(u64),
    /// Immediate float
    ImmF32(f32),
    /// Immediate double
    ImmF64(f64),
    /// Address of a module-level symbol
    Symbol(String),
    /// Memory address (base + offset)
    Addr {
        /// Base register
        base: VirtualReg,
        /// Offset in bytes
        offset: i32,
    },
    /// Label reference
    Label(String),
    /// Basic block reference
    Block(BlockId),
}

/// Predicate for conditional execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predicate {
    /// Predicate register
    pub reg: VirtualReg,
    /// Negated?
    pub negated: bool,
}

impl Predicate {
    /// Guard on `reg` being true
    #[must_use]
    pub const fn on(reg: VirtualReg) -> Self {
        Self {
            reg,
            negated: false,
        }
    }
}

impl PtxInstruction {
    /// Create a new instruction
    #[must_use]
    pub fn new(op: PtxOp, ty: PtxType) -> Self {
        Self {
            op,
            ty,
            dst: None,
            dsts: Vec::new(),
            srcs: Vec::new(),
            predicate: None,
            state_space: None,
            cmp: None,
            label: None,
            uniform: false,
            noreturn: false,
        }
    }

    /// Region marker
    #[must_use]
    pub fn marker(kind: MarkerKind, mask: AxisMask) -> Self {
        Self::new(PtxOp::Marker(Marker { kind, mask }), PtxType::B32)
    }

    /// Label definition
    #[must_use]
    pub fn label_def(name: impl Into<String>) -> Self {
        Self::new(PtxOp::Label, PtxType::B32).label(name)
    }

    /// `bar.sync 0`
    #[must_use]
    pub fn bar_sync() -> Self {
        Self::new(PtxOp::Bar, PtxType::B32).src(Operand::ImmU64(0))
    }

    /// `ret`
    #[must_use]
    pub fn ret() -> Self {
        Self::new(PtxOp::Ret, PtxType::B32)
    }

    /// Unconditional branch to a block
    #[must_use]
    pub fn branch(target: BlockId) -> Self {
        Self::new(PtxOp::Bra, PtxType::B32).src(Operand::Block(target))
    }

    /// Branch to a named label
    #[must_use]
    pub fn branch_label(name: impl Into<String>) -> Self {
        Self::new(PtxOp::Bra, PtxType::B32).src(Operand::Label(name.into()))
    }

    /// `mov` between registers or from an immediate/special register
    #[must_use]
    pub fn mov(dst: VirtualReg, src: Operand) -> Self {
        Self::new(PtxOp::Mov, dst.ty()).dst(Operand::Reg(dst)).src(src)
    }

    /// `setp.<cmp>.<ty> dst, a, b`
    #[must_use]
    pub fn setp(cmp: CmpOp, ty: PtxType, dst: VirtualReg, a: Operand, b: Operand) -> Self {
        Self::new(PtxOp::Setp, ty)
            .cmp(cmp)
            .dst(Operand::Reg(dst))
            .src(a)
            .src(b)
    }

    /// Set destination
    #[must_use]
    pub fn dst(mut self, dst: Operand) -> Self {
        self.dst = Some(dst);
        self
    }

    /// Push a destination operand to the vector destination list
    #[must_use]
    pub fn push_dst(mut self, dst: Operand) -> Self {
        self.dsts.push(dst);
        self
    }

    /// Add source operand
    #[must_use]
    pub fn src(mut self, src: Operand) -> Self {
        self.srcs.push(src);
        self
    }

    /// Set predicate guard
    #[must_use]
    pub fn predicated(mut self, pred: Predicate) -> Self {
        self.predicate = Some(pred);
        self
    }

    /// Set state space
    #[must_use]
    pub fn space(mut self, space: PtxStateSpace) -> Self {
        self.state_space = Some(space);
        self
    }

    /// Set comparison
    #[must_use]
    pub fn cmp(mut self, cmp: CmpOp) -> Self {
        self.cmp = Some(cmp);
        self
    }

    /// Set label
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Mark a branch as uniform
    #[must_use]
    pub fn uniform(mut self) -> Self {
        self.uniform = true;
        self
    }

    /// Mark a call as never returning
    #[must_use]
    pub fn noreturn(mut self) -> Self {
        self.noreturn = true;
        self
    }

    /// Marker payload, if this is a marker
    #[must_use]
    pub fn as_marker(&self) -> Option<Marker> {
        match self.op {
            PtxOp::Marker(marker) => Some(marker),
            _ => None,
        }
    }

    /// Block-splitting boundary this instruction represents
    #[must_use]
    pub fn boundary(&self) -> Option<Boundary> {
        match self.op {
            PtxOp::Marker(Marker {
                kind: MarkerKind::Enter,
                mask,
            }) => Some(Boundary::Enter(mask)),
            PtxOp::Marker(Marker {
                kind: MarkerKind::Leave,
                mask,
            }) => Some(Boundary::Leave(mask)),
            PtxOp::Ret => Some(Boundary::Return),
            _ => None,
        }
    }

    /// True for branches
    #[must_use]
    pub fn is_branch(&self) -> bool {
        self.op == PtxOp::Bra
    }

    /// True for predicated branches
    #[must_use]
    pub fn is_conditional_branch(&self) -> bool {
        self.is_branch() && self.predicate.is_some()
    }

    /// Target block of a CFG branch
    #[must_use]
    pub fn block_target(&self) -> Option<BlockId> {
        match (self.is_branch(), self.srcs.first()) {
            (true, Some(Operand::Block(block))) => Some(*block),
            _ => None,
        }
    }

    /// True for a call that never returns
    #[must_use]
    pub fn is_noreturn_call(&self) -> bool {
        self.op == PtxOp::Call && self.noreturn
    }

    /// Whether non-leader threads must be kept from executing this.
    ///
    /// Markers, labels and barriers are executed by every thread.
    #[must_use]
    pub fn needs_neutering(&self) -> bool {
        !matches!(self.op, PtxOp::Marker(_) | PtxOp::Label | PtxOp::Bar)
    }

    /// Registers written
    #[must_use]
    pub fn defs(&self) -> Vec<VirtualReg> {
        self.dst
            .iter()
            .chain(&self.dsts)
            .filter_map(|op| match op {
                Operand::Reg(reg) => Some(*reg),
                _ => None,
            })
            .collect()
    }

    /// Registers read, including the guard predicate and address bases
    #[must_use]
    pub fn uses(&self) -> Vec<VirtualReg> {
        let mut regs: Vec<VirtualReg> = self
            .srcs
            .iter()
            .filter_map(|op| match op {
                Operand::Reg(reg) | Operand::Addr { base: reg, .. } => Some(*reg),
                _ => None,
            })
            .collect();
        if let Some(Operand::Addr { base, .. }) = &self.dst {
            regs.push(*base);
        }
        if let Some(pred) = self.predicate {
            regs.push(pred.reg);
        }
        regs
    }
}
