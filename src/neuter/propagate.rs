//! State Propagator
//!
//! Makes the values one thread computed visible to the threads that were
//! neutered while it ran. Two broadcast strategies plug into one driver:
//!
//! - [`WarpBroadcast`]: `shfl.sync.idx` from lane 0, lockstep axis only
//! - [`SharedBroadcast`]: spill to a shared buffer on one side of a
//!   barrier, fill from it on the other
//!
//! [`propagate`] walks the live-in registers of a block plus the whole
//! local stack frame and asks the strategy for each value's sequence.

use crate::context::{SharedBuffer, BROADCAST_SYMBOL};
use crate::ptx::{
    CmpOp, Function, InsnId, Operand, Predicate, PtxInstruction, PtxOp, PtxStateSpace, PtxType,
    VirtualReg,
};

/// Size of one frame copy unit
const FRAME_WORD: u32 = 8;

/// Direction of a propagation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagateMode {
    /// Leader's value leaves the register (spill)
    Read,
    /// Value arrives in every thread's register (fill)
    Write,
    /// Both in one step (register shuffle)
    ReadWrite,
}

impl PropagateMode {
    /// Whether the value is read from its home
    #[must_use]
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether the value is written back to its home
    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// A broadcast strategy
pub trait Propagator {
    /// Sequence moving `reg`; `repeat` is the trip count of the enclosing
    /// frame copy loop, or 0 outside a loop
    fn value(
        &mut self,
        func: &mut Function,
        reg: VirtualReg,
        mode: PropagateMode,
        repeat: u32,
    ) -> Vec<PtxInstruction>;

    /// Setup before a frame copy loop of `repeat` iterations
    fn loop_begin(&mut self, _func: &mut Function, _repeat: u32) -> Vec<PtxInstruction> {
        Vec::new()
    }

    /// Teardown after a frame copy loop
    fn loop_end(&mut self, _func: &mut Function) -> Vec<PtxInstruction> {
        Vec::new()
    }
}

/// What one [`propagate`] call moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Propagated {
    /// Registers broadcast
    pub registers: usize,
    /// 64-bit frame words broadcast
    pub frame_words: u32,
}

impl Propagated {
    /// True when nothing was emitted
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.registers == 0 && self.frame_words == 0
    }
}

/// Emit `prop`'s sequences for the frame and for `live` right after
/// `anchor`. Call boundaries only move the frame.
pub fn propagate<P: Propagator>(
    func: &mut Function,
    anchor: InsnId,
    live: &[VirtualReg],
    is_call: bool,
    mode: PropagateMode,
    prop: &mut P,
) -> Propagated {
    let mut at = anchor;
    let mut done = Propagated::default();

    if let Some(frame) = func.frame().filter(|f| f.size > 0) {
        let words = frame.size.div_ceil(FRAME_WORD);
        // a single word needs no loop
        let repeat = if words == 1 { 0 } else { words };
        let tmp = func.alloc_reg(PtxType::U64);
        let ptr = func.alloc_reg(PtxType::U64);
        let mut seq = vec![PtxInstruction::mov(ptr, Operand::Reg(frame.pointer))];

        let mut counter = None;
        if repeat > 0 {
            let idx = func.alloc_reg(PtxType::U32);
            let pred = func.alloc_reg(PtxType::Pred);
            let label = func.fresh_label();
            seq.push(PtxInstruction::mov(idx, Operand::ImmU64(u64::from(repeat))));
            seq.extend(prop.loop_begin(func, repeat));
            seq.push(PtxInstruction::label_def(label.clone()));
            seq.push(
                PtxInstruction::new(PtxOp::Add, PtxType::U32)
                    .dst(Operand::Reg(idx))
                    .src(Operand::Reg(idx))
                    .src(Operand::ImmI64(-1)),
            );
            counter = Some((idx, pred, label));
        }
        if mode.reads() {
            seq.push(
                PtxInstruction::new(PtxOp::Ld, PtxType::U64)
                    .space(PtxStateSpace::Local)
                    .dst(Operand::Reg(tmp))
                    .src(Operand::Addr { base: ptr, offset: 0 }),
            );
        }
        seq.extend(prop.value(func, tmp, mode, repeat));
        if mode.writes() {
            seq.push(
                PtxInstruction::new(PtxOp::St, PtxType::U64)
                    .space(PtxStateSpace::Local)
                    .src(Operand::Addr { base: ptr, offset: 0 })
                    .src(Operand::Reg(tmp)),
            );
        }
        if let Some((idx, pred, label)) = counter {
            seq.push(PtxInstruction::setp(
                CmpOp::Ne,
                PtxType::U32,
                pred,
                Operand::Reg(idx),
                Operand::ImmU64(0),
            ));
            seq.push(
                PtxInstruction::new(PtxOp::Add, PtxType::U64)
                    .dst(Operand::Reg(ptr))
                    .src(Operand::Reg(ptr))
                    .src(Operand::ImmU64(u64::from(FRAME_WORD))),
            );
            seq.push(
                PtxInstruction::branch_label(label)
                    .predicated(Predicate::on(pred))
                    .uniform(),
            );
            seq.extend(prop.loop_end(func));
        }

        at = func.insert_seq_after(at, seq);
        done.frame_words = words;
    }

    if !is_call {
        for &reg in live {
            let seq = prop.value(func, reg, mode, 0);
            if seq.is_empty() {
                continue;
            }
            at = func.insert_seq_after(at, seq);
            done.registers += 1;
        }
    }

    tracing::trace!(
        function = func.name(),
        ?mode,
        registers = done.registers,
        frame_words = done.frame_words,
        "propagated state"
    );
    done
}

/// `selp.u32 dst, 1, 0, pred`
fn pred_to_u32(dst: VirtualReg, pred: VirtualReg) -> PtxInstruction {
    PtxInstruction::new(PtxOp::Selp, PtxType::U32)
        .dst(Operand::Reg(dst))
        .src(Operand::ImmU64(1))
        .src(Operand::ImmU64(0))
        .src(Operand::Reg(pred))
}

/// `setp.ne.u32 pred, src, 0`
fn u32_to_pred(pred: VirtualReg, src: VirtualReg) -> PtxInstruction {
    PtxInstruction::setp(
        CmpOp::Ne,
        PtxType::U32,
        pred,
        Operand::Reg(src),
        Operand::ImmU64(0),
    )
}

/// Warp shuffle of any register type.
///
/// `op` is [`PtxOp::ShflIdx`] (broadcast from lane `lane`) or
/// [`PtxOp::ShflDown`] (read from `lane` lanes above). 64-bit values
/// travel as two halves, predicates and narrow integers via a 32-bit
/// temporary.
pub(crate) fn shuffle(
    func: &mut Function,
    op: PtxOp,
    dst: VirtualReg,
    src: VirtualReg,
    lane: Operand,
) -> Vec<PtxInstruction> {
    let ty = src.ty();
    match ty.size_bits() {
        64 => {
            let lo = func.alloc_reg(PtxType::U32);
            let hi = func.alloc_reg(PtxType::U32);
            let mut seq = vec![PtxInstruction::new(PtxOp::Unpack, PtxType::B64)
                .push_dst(Operand::Reg(lo))
                .push_dst(Operand::Reg(hi))
                .src(Operand::Reg(src))];
            seq.extend(shuffle(func, op.clone(), lo, lo, lane.clone()));
            seq.extend(shuffle(func, op, hi, hi, lane));
            seq.push(
                PtxInstruction::new(PtxOp::Pack, PtxType::B64)
                    .dst(Operand::Reg(dst))
                    .src(Operand::Reg(lo))
                    .src(Operand::Reg(hi)),
            );
            seq
        }
        32 => vec![PtxInstruction::new(op, PtxType::B32)
            .dst(Operand::Reg(dst))
            .src(Operand::Reg(src))
            .src(lane)
            .src(Operand::ImmU64(31))],
        _ if ty == PtxType::Pred => {
            let tmp = func.alloc_reg(PtxType::U32);
            let mut seq = vec![pred_to_u32(tmp, src)];
            seq.extend(shuffle(func, op, tmp, tmp, lane));
            seq.push(u32_to_pred(dst, tmp));
            seq
        }
        _ => {
            let tmp = func.alloc_reg(PtxType::U32);
            let mut seq = vec![PtxInstruction::new(PtxOp::Cvt, PtxType::U32)
                .dst(Operand::Reg(tmp))
                .src(Operand::Reg(src))];
            seq.extend(shuffle(func, op, tmp, tmp, lane));
            seq.push(
                PtxInstruction::new(PtxOp::Cvt, ty)
                    .dst(Operand::Reg(dst))
                    .src(Operand::Reg(tmp)),
            );
            seq
        }
    }
}

/// Lane-0 register broadcast for lockstep regions
#[derive(Debug, Clone, Copy, Default)]
pub struct WarpBroadcast;

impl Propagator for WarpBroadcast {
    fn value(
        &mut self,
        func: &mut Function,
        reg: VirtualReg,
        mode: PropagateMode,
        _repeat: u32,
    ) -> Vec<PtxInstruction> {
        if mode != PropagateMode::ReadWrite {
            return Vec::new();
        }
        shuffle(func, PtxOp::ShflIdx, reg, reg, Operand::ImmU64(0))
    }
}

/// Shared-memory broadcast through the unit's broadcast buffer.
///
/// Values are laid out at increasing, naturally aligned offsets from the
/// buffer base. Inside a frame copy loop a moving pointer replaces the
/// fixed offsets.
#[derive(Debug, Clone)]
pub struct SharedBroadcast {
    base: Option<VirtualReg>,
    ptr: Option<VirtualReg>,
    offset: u32,
    align: u32,
}

impl SharedBroadcast {
    /// Broadcast through a base register initialised by [`finish`](Self::finish)
    pub fn new(func: &mut Function) -> Self {
        Self {
            base: Some(func.alloc_reg(PtxType::U64)),
            ptr: None,
            offset: 0,
            align: 1,
        }
    }

    /// Broadcast of a single value addressed directly through the symbol
    #[must_use]
    pub const fn direct() -> Self {
        Self {
            base: None,
            ptr: None,
            offset: 0,
            align: 1,
        }
    }

    /// Bytes laid out so far
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Initialise the base register after `anchor` and reserve the bytes
    /// used in `buffer`. Does nothing if no value was laid out.
    pub fn finish(&self, func: &mut Function, anchor: InsnId, buffer: &mut SharedBuffer) {
        if self.offset == 0 {
            return;
        }
        if let Some(base) = self.base {
            func.insert_after(
                anchor,
                PtxInstruction::mov(base, Operand::Symbol(BROADCAST_SYMBOL.to_string())),
            );
        }
        buffer.grow(self.offset.div_ceil(self.align) * self.align, self.align);
    }

    fn address(&mut self, ty: PtxType) -> Operand {
        if let Some(ptr) = self.ptr {
            return Operand::Addr { base: ptr, offset: 0 };
        }
        let align = ty.align_bytes();
        self.align = self.align.max(align);
        self.offset = self.offset.div_ceil(align) * align;
        match self.base {
            Some(base) => Operand::Addr {
                base,
                offset: self.offset as i32,
            },
            None => Operand::Symbol(BROADCAST_SYMBOL.to_string()),
        }
    }
}

impl Propagator for SharedBroadcast {
    fn value(
        &mut self,
        func: &mut Function,
        reg: VirtualReg,
        mode: PropagateMode,
        repeat: u32,
    ) -> Vec<PtxInstruction> {
        let ty = reg.ty();
        if ty == PtxType::Pred {
            let tmp = func.alloc_reg(PtxType::U32);
            let mut seq = Vec::new();
            if mode.reads() {
                seq.push(pred_to_u32(tmp, reg));
            }
            seq.extend(self.value(func, tmp, mode, repeat));
            if mode.writes() {
                seq.push(u32_to_pred(reg, tmp));
            }
            return seq;
        }

        let addr = self.address(ty);
        let access = if mode == PropagateMode::Read {
            PtxInstruction::new(PtxOp::St, ty)
                .space(PtxStateSpace::Shared)
                .src(addr)
                .src(Operand::Reg(reg))
        } else {
            PtxInstruction::new(PtxOp::Ld, ty)
                .space(PtxStateSpace::Shared)
                .dst(Operand::Reg(reg))
                .src(addr)
        };
        let mut seq = vec![access];

        match self.ptr {
            Some(ptr) => {
                seq.push(
                    PtxInstruction::new(PtxOp::Add, PtxType::U64)
                        .dst(Operand::Reg(ptr))
                        .src(Operand::Reg(ptr))
                        .src(Operand::ImmU64(u64::from(ty.size_bytes()))),
                );
                self.offset += repeat * ty.size_bytes();
            }
            None => self.offset += ty.size_bytes(),
        }
        seq
    }

    fn loop_begin(&mut self, func: &mut Function, _repeat: u32) -> Vec<PtxInstruction> {
        let Some(base) = self.base else {
            return Vec::new();
        };
        self.align = self.align.max(FRAME_WORD);
        self.offset = self.offset.div_ceil(FRAME_WORD) * FRAME_WORD;
        let ptr = func.alloc_reg(PtxType::U64);
        self.ptr = Some(ptr);
        vec![PtxInstruction::new(PtxOp::Add, PtxType::U64)
            .dst(Operand::Reg(ptr))
            .src(Operand::Reg(base))
            .src(Operand::ImmU64(u64::from(self.offset)))]
    }

    fn loop_end(&mut self, _func: &mut Function) -> Vec<PtxInstruction> {
        self.ptr = None;
        Vec::new()
    }
}
