//! Atomic accumulator updates and the lockstep shuffle-down loop.
//!
//! Every loop here is a real CFG loop: the call site's block is split
//! twice, leaving an empty block between the code before and after the
//! call. The loop body goes into that block, which branches to itself.

use super::{combine, load, store, ReductionReport, Site};
use crate::context::{CodegenContext, LOCK_SYMBOL};
use crate::neuter::shuffle;
use crate::ptx::{
    BlockId, CmpOp, Function, InsnId, Operand, Predicate, PtxInstruction, PtxOp, PtxStateSpace,
    PtxType, VirtualReg, WARP_SIZE,
};

/// How an accumulator cell is updated atomically
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Compare-and-swap retry loop
    LockFree,
    /// Critical section under the global reduction lock
    LockBased,
}

/// Strategy for values of type `ty`: hardware compare-and-swap exists for
/// 32 and 64-bit cells only.
#[must_use]
pub const fn update_strategy(ty: PtxType) -> UpdateStrategy {
    match ty.size_bits() {
        32 | 64 => UpdateStrategy::LockFree,
        _ => UpdateStrategy::LockBased,
    }
}

/// Empty block between `at` and the instructions before it, looping on
/// itself and falling through to the block now holding `at`
fn loop_block(func: &mut Function, at: InsnId) -> BlockId {
    let block = func.block_of(at);
    let body = func.split_block(block, at);
    func.split_block(body, at);
    func.add_edge(body, body);
    body
}

/// `@pred bra body`
fn back_branch(body: BlockId, pred: VirtualReg) -> PtxInstruction {
    PtxInstruction::branch(body).predicated(Predicate::on(pred))
}

/// `atom.<space>.cas.<bits> actual, [addr], expect, write`
fn cas(
    ty: PtxType,
    space: PtxStateSpace,
    actual: VirtualReg,
    addr: Operand,
    expect: Operand,
    write: Operand,
) -> PtxInstruction {
    PtxInstruction::new(PtxOp::AtomCas, ty.bits_type())
        .space(space)
        .dst(Operand::Reg(actual))
        .src(addr)
        .src(expect)
        .src(write)
}

/// Pairwise-halving reduction across the warp; lane 0 ends up with the
/// total.
pub(super) fn shuffle_reduce(func: &mut Function, site: &Site) {
    let ty = site.ty();
    let acc = func.alloc_reg(ty);
    let other = func.alloc_reg(ty);
    let shift = func.alloc_reg(PtxType::U32);
    let more = func.alloc_reg(PtxType::Pred);

    func.insert_seq_before(
        site.insn,
        vec![
            PtxInstruction::mov(acc, Operand::Reg(site.var)),
            PtxInstruction::mov(shift, Operand::ImmU64(u64::from(WARP_SIZE / 2))),
        ],
    );

    let body = loop_block(func, site.insn);
    let mut seq = shuffle(func, PtxOp::ShflDown, other, acc, Operand::Reg(shift));
    seq.push(combine(site.call.op, acc, acc, other));
    seq.push(
        PtxInstruction::new(PtxOp::Shr, PtxType::U32)
            .dst(Operand::Reg(shift))
            .src(Operand::Reg(shift))
            .src(Operand::ImmU64(1)),
    );
    seq.push(PtxInstruction::setp(
        CmpOp::Ne,
        PtxType::U32,
        more,
        Operand::Reg(shift),
        Operand::ImmU64(0),
    ));
    // every lane runs the same trip count
    seq.push(back_branch(body, more).uniform());
    for insn in seq {
        func.push(body, insn);
    }

    func.insert_before(site.insn, PtxInstruction::mov(site.result, Operand::Reg(acc)));
}

/// Fold the site's value into the cell at `addr`
pub(super) fn update(
    func: &mut Function,
    ctx: &mut CodegenContext,
    site: &Site,
    addr: Operand,
    space: PtxStateSpace,
    report: &mut ReductionReport,
) {
    match update_strategy(site.ty()) {
        UpdateStrategy::LockFree => {
            lock_free(func, site, addr, space);
            report.lock_free += 1;
        }
        UpdateStrategy::LockBased => {
            lock_based(func, ctx, site, addr, space);
            report.lock_based += 1;
        }
    }
}

/// Retry `write = expect op var; cas` until the cell held `expect`
fn lock_free(func: &mut Function, site: &Site, addr: Operand, space: PtxStateSpace) {
    let ty = site.ty();
    let bits = ty.bits_type();
    let expect = func.alloc_reg(ty);
    let write = func.alloc_reg(ty);
    let actual = func.alloc_reg(ty);
    let retry = func.alloc_reg(PtxType::Pred);

    func.insert_before(site.insn, PtxInstruction::mov(expect, site.identity.clone()));
    let body = loop_block(func, site.insn);
    let seq = vec![
        combine(site.call.op, write, expect, site.var),
        cas(
            ty,
            space,
            actual,
            addr,
            Operand::Reg(expect),
            Operand::Reg(write),
        ),
        PtxInstruction::setp(
            CmpOp::Ne,
            bits,
            retry,
            Operand::Reg(actual),
            Operand::Reg(expect),
        ),
        PtxInstruction::mov(expect, Operand::Reg(actual)),
        back_branch(body, retry),
    ];
    for insn in seq {
        func.push(body, insn);
    }
    func.insert_before(site.insn, PtxInstruction::mov(site.result, Operand::Reg(write)));
}

/// Spin on the global lock cell, update the cell non-atomically, release
fn lock_based(
    func: &mut Function,
    ctx: &mut CodegenContext,
    site: &Site,
    addr: Operand,
    space: PtxStateSpace,
) {
    let ty = site.ty();
    let lock = func.alloc_reg(PtxType::U64);
    let old = func.alloc_reg(PtxType::U32);
    let held = func.alloc_reg(PtxType::Pred);
    let acc = func.alloc_reg(ty);
    let released = func.alloc_reg(PtxType::U32);

    func.insert_before(
        site.insn,
        PtxInstruction::mov(lock, Operand::Symbol(LOCK_SYMBOL.to_string())),
    );
    let lock_addr = Operand::Addr {
        base: lock,
        offset: 0,
    };

    let body = loop_block(func, site.insn);
    let spin = vec![
        cas(
            PtxType::U32,
            PtxStateSpace::Global,
            old,
            lock_addr.clone(),
            Operand::ImmU64(0),
            Operand::ImmU64(1),
        ),
        PtxInstruction::setp(
            CmpOp::Ne,
            PtxType::U32,
            held,
            Operand::Reg(old),
            Operand::ImmU64(0),
        ),
        back_branch(body, held),
    ];
    for insn in spin {
        func.push(body, insn);
    }

    func.insert_seq_before(
        site.insn,
        vec![
            load(ty, space, acc, addr.clone()),
            combine(site.call.op, acc, acc, site.var),
            store(ty, space, addr, acc),
            PtxInstruction::new(PtxOp::MemBar, PtxType::B32),
            cas(
                PtxType::U32,
                PtxStateSpace::Global,
                released,
                lock_addr,
                Operand::ImmU64(1),
                Operand::ImmU64(0),
            ),
            PtxInstruction::mov(site.result, Operand::Reg(acc)),
        ],
    );
    ctx.lock.grow(4, 4);
}
