//! Benchmarks for the divergence-management passes
//!
//! # Benchmark Methodology
//!
//! - Straight chains of nested cooperative/lockstep regions: 4, 16, 64
//! - A ladder of diamonds at the root, guarded per block or per SESE region
//! - Reduction expansion of a cooperative region with all four phases
//! - Each benchmark clones a prebuilt function, so CFG construction is
//!   not measured
//!
//! Throughput is reported in regions (or diamonds) per second.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use trueno_simt::ptx::{
    Axis, AxisMask, BlockId, CmpOp, Function, MarkerKind, Operand, Predicate, PtxInstruction,
    PtxOp, PtxType, ReductionCall, ReductionOp, ReductionPhase, VirtualReg,
};
use trueno_simt::{
    compile_function, expand_reductions, CodegenContext, LaunchGeometry, NeuterConfig,
};

fn bump(x: VirtualReg) -> PtxInstruction {
    PtxInstruction::new(PtxOp::Add, x.ty())
        .dst(Operand::Reg(x))
        .src(Operand::Reg(x))
        .src(Operand::ImmU64(1))
}

/// `count` cooperative regions, each holding one lockstep region
fn region_chain(count: usize) -> Function {
    let mut func = Function::new("chain");
    let b = func.entry();
    let x = func.alloc_reg(PtxType::U32);
    let y = func.alloc_reg(PtxType::U64);
    func.push(b, PtxInstruction::mov(x, Operand::ImmU64(0)));
    func.push(b, PtxInstruction::mov(y, Operand::ImmU64(0)));
    for _ in 0..count {
        func.push(b, PtxInstruction::marker(MarkerKind::PreEnter, AxisMask::COOPERATIVE));
        func.push(b, PtxInstruction::marker(MarkerKind::Enter, AxisMask::COOPERATIVE));
        func.push(b, bump(x));
        func.push(b, PtxInstruction::marker(MarkerKind::PreEnter, AxisMask::LOCKSTEP));
        func.push(b, PtxInstruction::marker(MarkerKind::Enter, AxisMask::LOCKSTEP));
        func.push(b, bump(y));
        func.push(b, PtxInstruction::marker(MarkerKind::PreLeave, AxisMask::LOCKSTEP));
        func.push(b, PtxInstruction::marker(MarkerKind::Leave, AxisMask::LOCKSTEP));
        func.push(b, bump(x));
        func.push(b, PtxInstruction::marker(MarkerKind::PreLeave, AxisMask::COOPERATIVE));
        func.push(b, PtxInstruction::marker(MarkerKind::Leave, AxisMask::COOPERATIVE));
    }
    func.push(b, PtxInstruction::ret());
    func
}

/// `count` diamonds back to back at the root
fn diamond_ladder(count: usize) -> Function {
    let mut func = Function::new("ladder");
    let mut cur = func.entry();
    let x = func.alloc_reg(PtxType::U32);
    func.push(cur, PtxInstruction::mov(x, Operand::ImmU64(0)));
    for _ in 0..count {
        cur = diamond(&mut func, cur, x);
    }
    func.push(cur, PtxInstruction::ret());
    func
}

fn diamond(func: &mut Function, cur: BlockId, x: VirtualReg) -> BlockId {
    let p = func.alloc_reg(PtxType::Pred);
    let left = func.add_block();
    let right = func.add_block();
    let join = func.add_block();
    func.push(
        cur,
        PtxInstruction::setp(CmpOp::Lt, PtxType::U32, p, Operand::Reg(x), Operand::ImmU64(8)),
    );
    func.push(cur, PtxInstruction::branch(right).predicated(Predicate::on(p)));
    func.add_edge(cur, left);
    func.add_edge(cur, right);
    func.push(left, bump(x));
    func.push(left, PtxInstruction::branch(join));
    func.add_edge(left, join);
    func.push(right, bump(x));
    func.add_edge(right, join);
    func.push(join, bump(x));
    join
}

/// Cooperative region reducing `count` independent sums
fn reduction_kernel(count: usize) -> Function {
    let coop = AxisMask::COOPERATIVE;
    let mut func = Function::new("sums");
    let e = func.entry();
    let body = func.add_block();
    let after = func.add_block();
    func.add_edge(e, body);
    func.add_edge(body, after);

    let mut vars = Vec::with_capacity(count);
    for i in 0..count {
        let v = func.alloc_reg(PtxType::U32);
        func.push(e, PtxInstruction::mov(v, Operand::ImmU64(0)));
        vars.push((v, format!("out{}", i), i as u32 * 4));
    }

    emit(&mut func, e, ReductionPhase::Setup, &mut vars);
    func.push(e, PtxInstruction::marker(MarkerKind::PreEnter, coop));
    func.push(body, PtxInstruction::marker(MarkerKind::Enter, coop));
    emit(&mut func, body, ReductionPhase::Init, &mut vars);
    emit(&mut func, body, ReductionPhase::Fini, &mut vars);
    func.push(body, PtxInstruction::marker(MarkerKind::PreLeave, coop));
    func.push(after, PtxInstruction::marker(MarkerKind::Leave, coop));
    emit(&mut func, after, ReductionPhase::Teardown, &mut vars);
    func.push(after, PtxInstruction::ret());
    func
}

/// Append one reduction call per variable, rebinding each to its result
fn emit(
    func: &mut Function,
    block: BlockId,
    phase: ReductionPhase,
    vars: &mut [(VirtualReg, String, u32)],
) {
    for (v, receiver, offset) in vars.iter_mut() {
        let call = ReductionCall {
            phase,
            axis: Axis::Cooperative,
            op: ReductionOp::Add,
            offset: *offset,
        };
        let result = func.alloc_reg(PtxType::U32);
        func.push(
            block,
            PtxInstruction::new(PtxOp::Reduction(call), PtxType::U32)
                .dst(Operand::Reg(result))
                .src(Operand::Reg(*v))
                .src(Operand::Symbol(receiver.clone())),
        );
        *v = result;
    }
}

/// Full pipeline over nested region chains
fn bench_region_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_chain");
    let geometry = LaunchGeometry::cooperative(4);
    let config = NeuterConfig::default();

    for size in [4usize, 16, 64].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("compile", size), size, |bencher, &size| {
            let func = region_chain(size);
            bencher.iter(|| {
                let mut func = func.clone();
                let mut ctx = CodegenContext::new();
                black_box(compile_function(&mut func, &mut ctx, &geometry, &config).unwrap());
            });
        });
    }

    group.finish();
}

/// SESE guarding against per-block guarding
fn bench_diamond_ladder(c: &mut Criterion) {
    let mut group = c.benchmark_group("diamond_ladder");
    let geometry = LaunchGeometry::cooperative(4);

    for size in [8usize, 32, 128].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("sese", size), size, |bencher, &size| {
            let func = diamond_ladder(size);
            let config = NeuterConfig::default();
            bencher.iter(|| {
                let mut func = func.clone();
                let mut ctx = CodegenContext::new();
                black_box(compile_function(&mut func, &mut ctx, &geometry, &config).unwrap());
            });
        });

        group.bench_with_input(BenchmarkId::new("per_block", size), size, |bencher, &size| {
            let func = diamond_ladder(size);
            let config = NeuterConfig::default().without_sese_regions();
            bencher.iter(|| {
                let mut func = func.clone();
                let mut ctx = CodegenContext::new();
                black_box(compile_function(&mut func, &mut ctx, &geometry, &config).unwrap());
            });
        });
    }

    group.finish();
}

/// Reduction expansion alone
fn bench_reductions(c: &mut Criterion) {
    let mut group = c.benchmark_group("reductions");

    for size in [1usize, 8, 32].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("expand", size), size, |bencher, &size| {
            let func = reduction_kernel(size);
            bencher.iter(|| {
                let mut func = func.clone();
                let mut ctx = CodegenContext::new();
                black_box(expand_reductions(&mut func, &mut ctx).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_region_chain,
    bench_diamond_ladder,
    bench_reductions
);
criterion_main!(benches);
