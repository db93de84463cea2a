//! CFG fixtures shared by the pass tests.

use proptest::prelude::*;

use crate::ptx::{
    AxisMask, BlockId, Boundary, CmpOp, Function, MarkerKind, Operand, Predicate, PtxInstruction,
    PtxOp, PtxType, VirtualReg,
};

/// Shape of one region in a generated chain
#[derive(Debug, Clone)]
pub(crate) struct Nest {
    pub mask: AxisMask,
    pub interior: usize,
    pub diamond: bool,
    pub children: Vec<Nest>,
}

pub(crate) fn nest(mask: AxisMask, children: Vec<Nest>) -> Nest {
    Nest {
        mask,
        interior: 1,
        diamond: false,
        children,
    }
}

pub(crate) fn bump(x: VirtualReg) -> PtxInstruction {
    PtxInstruction::new(PtxOp::Add, x.ty())
        .dst(Operand::Reg(x))
        .src(Operand::Reg(x))
        .src(Operand::ImmU64(1))
}

/// `cur` ends in a conditional branch on `x`; returns the merge block
pub(crate) fn diamond(func: &mut Function, cur: BlockId, x: VirtualReg) -> BlockId {
    let p = func.alloc_reg(PtxType::Pred);
    let left = func.add_block();
    let right = func.add_block();
    let join = func.add_block();

    func.push(
        cur,
        PtxInstruction::setp(CmpOp::Eq, PtxType::U32, p, Operand::Reg(x), Operand::ImmU64(0)),
    );
    func.push(cur, PtxInstruction::branch(right).predicated(Predicate::on(p)));
    func.add_edge(cur, left);
    func.add_edge(cur, right);

    func.push(left, bump(x));
    func.push(left, PtxInstruction::branch(join));
    func.add_edge(left, join);
    func.push(right, bump(x));
    func.add_edge(right, join);
    join
}

fn emit(
    func: &mut Function,
    mut cur: BlockId,
    nest: &Nest,
    x: VirtualReg,
    seq: &mut Vec<Boundary>,
) -> BlockId {
    func.push(cur, PtxInstruction::marker(MarkerKind::PreEnter, nest.mask));
    func.push(cur, PtxInstruction::marker(MarkerKind::Enter, nest.mask));
    seq.push(Boundary::Enter(nest.mask));
    for _ in 0..nest.interior {
        func.push(cur, bump(x));
    }
    if nest.diamond {
        cur = diamond(func, cur, x);
    }
    for child in &nest.children {
        cur = emit(func, cur, child, x, seq);
    }
    func.push(cur, PtxInstruction::marker(MarkerKind::PreLeave, nest.mask));
    func.push(cur, PtxInstruction::marker(MarkerKind::Leave, nest.mask));
    seq.push(Boundary::Leave(nest.mask));
    cur
}

/// Straight-line function holding `nests` one after another, unsplit.
///
/// Returns the function and the boundary sequence it encodes.
pub(crate) fn region_chain(nests: &[Nest]) -> (Function, Vec<Boundary>) {
    let mut func = Function::new("chain");
    let mut cur = func.entry();
    let x = func.alloc_reg(PtxType::U32);
    func.push(cur, PtxInstruction::mov(x, Operand::ImmU64(0)));
    let mut seq = Vec::new();
    for n in nests {
        cur = emit(&mut func, cur, n, x, &mut seq);
    }
    func.push(cur, bump(x));
    func.push(cur, PtxInstruction::ret());
    (func, seq)
}

fn masks_within(available: AxisMask) -> Vec<AxisMask> {
    [
        AxisMask::COOPERATIVE,
        AxisMask::LOCKSTEP,
        AxisMask::PARTITIONED,
    ]
    .into_iter()
    .filter(|&m| available.contains(m))
    .collect()
}

pub(crate) fn arb_nest(available: AxisMask) -> BoxedStrategy<Nest> {
    (
        prop::sample::select(masks_within(available)),
        0usize..3,
        any::<bool>(),
        any::<bool>(),
    )
        .prop_flat_map(move |(mask, interior, diamond, call)| {
            let remaining = available.difference(mask);
            let full = if call { mask | AxisMask::CALL } else { mask };
            let children = if remaining.is_empty() {
                Just(Vec::new()).boxed()
            } else {
                prop::collection::vec(arb_nest(remaining), 0..3).boxed()
            };
            children.prop_map(move |children| Nest {
                mask: full,
                interior,
                diamond,
                children,
            })
        })
        .boxed()
}

pub(crate) fn arb_nests() -> impl Strategy<Value = Vec<Nest>> {
    prop::collection::vec(arb_nest(AxisMask::PARTITIONED), 0..4)
}
