//! Reduction Expander
//!
//! Replaces every reduction call site with real instructions. A reduction
//! variable goes through four phases around the partitioned region that
//! computes it:
//!
//! | Phase    | Lockstep                 | Cooperative              | Independent            |
//! |----------|--------------------------|--------------------------|------------------------|
//! | setup    | load receiver            | load receiver, store red | forward                |
//! | init     | identity on non-leaders  | identity                 | identity (or forward)  |
//! | fini     | shuffle-down loop        | atomic update of red     | atomic update receiver |
//! | teardown | store receiver           | load red, store receiver | forward                |
//!
//! `red` is this reduction's slot in the unit's cooperative reduction
//! buffer. Atomic updates use a compare-and-swap retry loop for 32 and
//! 64-bit values and a global spin lock otherwise.
//!
//! Expansion creates blocks, so it runs before block splitting.

mod update;

#[cfg(test)]
pub(crate) mod simulate;

pub use update::{update_strategy, UpdateStrategy};

use tracing::instrument;

use crate::context::{CodegenContext, REDUCTION_SYMBOL};
use crate::error::{NeuterError, Result};
use crate::ptx::{
    Axis, CmpOp, Function, InsnId, Operand, PtxInstruction, PtxOp, PtxReg, PtxStateSpace,
    PtxType, ReductionCall, ReductionOp, ReductionPhase, VirtualReg,
};

/// What expansion produced for one function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReductionReport {
    /// Call sites replaced
    pub expanded: usize,
    /// Compare-and-swap retry loops
    pub lock_free: usize,
    /// Spin-lock critical sections
    pub lock_based: usize,
    /// Lockstep shuffle-down loops
    pub shuffle_loops: usize,
}

/// Identity element of `op` over `ty`, as an immediate.
///
/// # Errors
///
/// Bitwise operators have no float identity; predicate and half-precision
/// reductions are not supported.
pub fn identity(op: ReductionOp, ty: PtxType) -> Result<Operand> {
    if matches!(ty, PtxType::Pred | PtxType::F16) {
        return Err(NeuterError::InvalidReduction(format!(
            "no {:?} reduction over {}",
            op, ty
        )));
    }

    if ty.is_float() {
        let value = match op {
            ReductionOp::Add => 0.0,
            ReductionOp::Mul => 1.0,
            ReductionOp::Min => f64::INFINITY,
            ReductionOp::Max => f64::NEG_INFINITY,
            ReductionOp::And | ReductionOp::Or | ReductionOp::Xor => {
                return Err(NeuterError::InvalidReduction(format!(
                    "bitwise {:?} over float {}",
                    op, ty
                )));
            }
        };
        return Ok(if ty == PtxType::F32 {
            Operand::ImmF32(value as f32)
        } else {
            Operand::ImmF64(value)
        });
    }

    let bits = ty.size_bits();
    let ones = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let operand = match (op, ty.is_signed()) {
        (ReductionOp::Add | ReductionOp::Or | ReductionOp::Xor, _) => Operand::ImmU64(0),
        (ReductionOp::Mul, _) => Operand::ImmU64(1),
        (ReductionOp::And, true) => Operand::ImmI64(-1),
        (ReductionOp::And, false) => Operand::ImmU64(ones),
        (ReductionOp::Max, true) => Operand::ImmI64(i64::MIN >> (64 - bits)),
        (ReductionOp::Max, false) => Operand::ImmU64(0),
        (ReductionOp::Min, true) => Operand::ImmI64(i64::MAX >> (64 - bits)),
        (ReductionOp::Min, false) => Operand::ImmU64(ones),
    };
    Ok(operand)
}

/// A validated call site
#[derive(Debug, Clone)]
pub(crate) struct Site {
    pub insn: InsnId,
    pub call: ReductionCall,
    pub result: VirtualReg,
    pub var: VirtualReg,
    pub receiver: Option<Operand>,
    pub identity: Operand,
}

impl Site {
    fn parse(func: &Function, insn: InsnId) -> Result<Self> {
        let site = func.insn(insn);
        let PtxOp::Reduction(call) = site.op else {
            return Err(NeuterError::InvalidReduction(format!(
                "{} is not a reduction call",
                insn
            )));
        };

        let actual = site.srcs.len();
        if !(1..=2).contains(&actual) {
            return Err(NeuterError::ArgumentCount {
                expected: actual.clamp(1, 2),
                actual,
            });
        }
        let Some(Operand::Reg(result)) = site.dst else {
            return Err(NeuterError::InvalidReduction(format!(
                "{} has no result register",
                insn
            )));
        };
        let Operand::Reg(var) = site.srcs[0] else {
            return Err(NeuterError::InvalidReduction(format!(
                "{} reduces a non-register value",
                insn
            )));
        };
        if var.ty() != result.ty() {
            return Err(NeuterError::InvalidReduction(format!(
                "{} result {} differs from value {}",
                insn,
                result.ty(),
                var.ty()
            )));
        }
        let receiver = site.srcs.get(1).map(memory_operand).transpose()?;

        Ok(Self {
            insn,
            call,
            result,
            var,
            receiver,
            identity: identity(call.op, var.ty())?,
        })
    }

    fn ty(&self) -> PtxType {
        self.var.ty()
    }
}

/// Receiver operand as a memory reference
fn memory_operand(op: &Operand) -> Result<Operand> {
    match op {
        Operand::Reg(base) if base.ty().size_bits() == 64 => Ok(Operand::Addr {
            base: *base,
            offset: 0,
        }),
        Operand::Symbol(_) | Operand::Addr { .. } => Ok(op.clone()),
        other => Err(NeuterError::InvalidReduction(format!(
            "receiver {} is not an address",
            other
        ))),
    }
}

pub(crate) fn load(ty: PtxType, space: PtxStateSpace, dst: VirtualReg, addr: Operand) -> PtxInstruction {
    PtxInstruction::new(PtxOp::Ld, ty)
        .space(space)
        .dst(Operand::Reg(dst))
        .src(addr)
}

pub(crate) fn store(ty: PtxType, space: PtxStateSpace, addr: Operand, value: VirtualReg) -> PtxInstruction {
    PtxInstruction::new(PtxOp::St, ty)
        .space(space)
        .src(addr)
        .src(Operand::Reg(value))
}

/// `op dst, a, b` with the reduction operator
pub(crate) fn combine(op: ReductionOp, dst: VirtualReg, a: VirtualReg, b: VirtualReg) -> PtxInstruction {
    PtxInstruction::new(op.to_ptx_op(), dst.ty())
        .dst(Operand::Reg(dst))
        .src(Operand::Reg(a))
        .src(Operand::Reg(b))
}

/// Address this reduction's slot in the cooperative buffer, reserving it
fn reduction_slot(func: &mut Function, ctx: &mut CodegenContext, site: &Site) -> Operand {
    let ty = site.ty();
    let base = func.alloc_reg(PtxType::U64);
    func.insert_before(
        site.insn,
        PtxInstruction::mov(base, Operand::Symbol(REDUCTION_SYMBOL.to_string())),
    );
    ctx.reduction
        .grow(site.call.offset + ty.size_bytes(), ty.align_bytes());
    Operand::Addr {
        base,
        offset: site.call.offset as i32,
    }
}

fn setup(func: &mut Function, ctx: &mut CodegenContext, site: &Site) {
    let ty = site.ty();
    let mut value = site.var;
    if let (true, Some(receiver)) = (site.call.axis != Axis::Independent, &site.receiver) {
        let loaded = func.alloc_reg(ty);
        func.insert_before(site.insn, load(ty, PtxStateSpace::Global, loaded, receiver.clone()));
        value = loaded;
    }
    if site.call.axis == Axis::Cooperative {
        let slot = reduction_slot(func, ctx, site);
        func.insert_before(site.insn, store(ty, PtxStateSpace::Shared, slot, value));
    }
    func.insert_before(site.insn, PtxInstruction::mov(site.result, Operand::Reg(value)));
}

fn init(func: &mut Function, site: &Site) {
    let seq = match site.call.axis {
        // Non-leader lanes pick the identity with selp rather than a
        // split block, so the warp never branches.
        Axis::Lockstep => {
            let tid = func.alloc_reg(PtxType::U32);
            let lane = func.alloc_reg(PtxType::Pred);
            vec![
                PtxInstruction::mov(tid, Operand::SpecialReg(PtxReg::TidX)),
                PtxInstruction::setp(
                    CmpOp::Ne,
                    PtxType::U32,
                    lane,
                    Operand::Reg(tid),
                    Operand::ImmU64(0),
                ),
                PtxInstruction::new(PtxOp::Selp, site.ty())
                    .dst(Operand::Reg(site.result))
                    .src(site.identity.clone())
                    .src(Operand::Reg(site.var))
                    .src(Operand::Reg(lane)),
            ]
        }
        Axis::Independent if site.receiver.is_none() => {
            vec![PtxInstruction::mov(site.result, Operand::Reg(site.var))]
        }
        Axis::Cooperative | Axis::Independent => {
            vec![PtxInstruction::mov(site.result, site.identity.clone())]
        }
    };
    func.insert_seq_before(site.insn, seq);
}

fn fini(
    func: &mut Function,
    ctx: &mut CodegenContext,
    site: &Site,
    report: &mut ReductionReport,
) {
    match (site.call.axis, &site.receiver) {
        (Axis::Lockstep, _) => {
            update::shuffle_reduce(func, site);
            report.shuffle_loops += 1;
        }
        (Axis::Cooperative, _) => {
            let slot = reduction_slot(func, ctx, site);
            update::update(func, ctx, site, slot, PtxStateSpace::Shared, report);
        }
        (Axis::Independent, Some(receiver)) => {
            let receiver = receiver.clone();
            update::update(func, ctx, site, receiver, PtxStateSpace::Global, report);
        }
        (Axis::Independent, None) => {
            func.insert_before(site.insn, PtxInstruction::mov(site.result, Operand::Reg(site.var)));
        }
    }
}

fn teardown(func: &mut Function, ctx: &mut CodegenContext, site: &Site) {
    let ty = site.ty();
    let mut value = site.var;
    if site.call.axis == Axis::Cooperative {
        let slot = reduction_slot(func, ctx, site);
        let loaded = func.alloc_reg(ty);
        func.insert_before(site.insn, load(ty, PtxStateSpace::Shared, loaded, slot));
        value = loaded;
    }
    if let (true, Some(receiver)) = (site.call.axis != Axis::Independent, &site.receiver) {
        func.insert_before(site.insn, store(ty, PtxStateSpace::Global, receiver.clone(), value));
    }
    func.insert_before(site.insn, PtxInstruction::mov(site.result, Operand::Reg(value)));
}

/// Expand every reduction call site of `func`.
///
/// # Errors
///
/// Returns an error for a call site with the wrong operand count, a
/// non-register value, mismatched types or an operator with no identity
/// over the value's type. Sites before the failing one stay expanded.
#[instrument(skip_all, fields(function = %func.name()))]
pub fn expand_reductions(func: &mut Function, ctx: &mut CodegenContext) -> Result<ReductionReport> {
    let sites: Vec<InsnId> = func
        .iter_insns()
        .filter(|&(_, insn)| matches!(func.insn(insn).op, PtxOp::Reduction(_)))
        .map(|(_, insn)| insn)
        .collect();

    let mut report = ReductionReport::default();
    for insn in sites {
        let site = Site::parse(func, insn)?;
        match site.call.phase {
            ReductionPhase::Setup => setup(func, ctx, &site),
            ReductionPhase::Init => init(func, &site),
            ReductionPhase::Fini => fini(func, ctx, &site, &mut report),
            ReductionPhase::Teardown => teardown(func, ctx, &site),
        }
        func.remove(insn);
        report.expanded += 1;
        tracing::trace!(
            %insn,
            phase = ?site.call.phase,
            axis = %site.call.axis,
            op = ?site.call.op,
            "reduction expanded"
        );
    }

    if report.expanded > 0 {
        tracing::debug!(
            expanded = report.expanded,
            lock_free = report.lock_free,
            lock_based = report.lock_based,
            shuffle_loops = report.shuffle_loops,
            "reductions expanded"
        );
    }
    Ok(report)
}
