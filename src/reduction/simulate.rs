//! Test-only interpreter for expanded reduction code.
//!
//! Runs one function on several threads over a flat byte memory. The
//! scheduler picks which thread executes its next instruction, so a test
//! controls exactly how the threads' loads, stores and compare-and-swaps
//! interleave. A compare-and-swap is a single step.

use std::collections::HashMap;

use crate::context::{BROADCAST_SYMBOL, LOCK_SYMBOL, REDUCTION_SYMBOL};
use crate::ptx::{BlockId, CmpOp, Function, Operand, PtxOp, PtxReg, PtxType};

const SYMBOL_BYTES: u64 = 64;

#[derive(Debug, Clone)]
struct Thread {
    tid: u32,
    block: BlockId,
    pc: usize,
    regs: HashMap<u32, u64>,
    done: bool,
}

/// Threads, memory and symbol addresses
pub(crate) struct Machine<'f> {
    func: &'f Function,
    memory: Vec<u8>,
    symbols: HashMap<String, u64>,
    threads: Vec<Thread>,
}

fn truncate(ty: PtxType, value: u64) -> u64 {
    match ty.size_bits() {
        64 => value,
        bits => value & ((1u64 << bits) - 1),
    }
}

fn signed(ty: PtxType, value: u64) -> i64 {
    let shift = 64 - ty.size_bits();
    ((value << shift) as i64) >> shift
}

fn float(ty: PtxType, value: u64) -> f64 {
    if ty == PtxType::F32 {
        f64::from(f32::from_bits(value as u32))
    } else {
        f64::from_bits(value)
    }
}

fn unfloat(ty: PtxType, value: f64) -> u64 {
    if ty == PtxType::F32 {
        u64::from((value as f32).to_bits())
    } else {
        value.to_bits()
    }
}

fn arith(op: &PtxOp, ty: PtxType, a: u64, b: u64) -> u64 {
    if ty.is_float() {
        let (x, y) = (float(ty, a), float(ty, b));
        let r = match op {
            PtxOp::Add => x + y,
            PtxOp::Mul => x * y,
            PtxOp::Min => x.min(y),
            PtxOp::Max => x.max(y),
            other => panic!("{:?} on float", other),
        };
        return unfloat(ty, r);
    }
    let r = match op {
        PtxOp::Add => a.wrapping_add(b),
        PtxOp::Mul => a.wrapping_mul(b),
        PtxOp::And => a & b,
        PtxOp::Or => a | b,
        PtxOp::Xor => a ^ b,
        PtxOp::Shr => a >> b,
        PtxOp::Min if ty.is_signed() => signed(ty, a).min(signed(ty, b)) as u64,
        PtxOp::Max if ty.is_signed() => signed(ty, a).max(signed(ty, b)) as u64,
        PtxOp::Min => truncate(ty, a).min(truncate(ty, b)),
        PtxOp::Max => truncate(ty, a).max(truncate(ty, b)),
        other => panic!("{:?} is not arithmetic", other),
    };
    truncate(ty, r)
}

fn compare(cmp: CmpOp, ty: PtxType, a: u64, b: u64) -> bool {
    let ord = if ty.is_float() {
        float(ty, a).partial_cmp(&float(ty, b))
    } else if ty.is_signed() {
        Some(signed(ty, a).cmp(&signed(ty, b)))
    } else {
        Some(truncate(ty, a).cmp(&truncate(ty, b)))
    };
    let Some(ord) = ord else {
        return cmp == CmpOp::Ne;
    };
    match cmp {
        CmpOp::Eq => ord.is_eq(),
        CmpOp::Ne => ord.is_ne(),
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Le => ord.is_le(),
        CmpOp::Gt => ord.is_gt(),
        CmpOp::Ge => ord.is_ge(),
    }
}

impl<'f> Machine<'f> {
    /// `threads` threads at the entry of `func`; `%tid.x` is the thread
    /// number. The unit's buffers plus `extra` symbols get zeroed memory.
    pub(crate) fn new(func: &'f Function, threads: u32, extra: &[&str]) -> Self {
        let mut symbols = HashMap::new();
        let names = [BROADCAST_SYMBOL, REDUCTION_SYMBOL, LOCK_SYMBOL]
            .into_iter()
            .chain(extra.iter().copied());
        for (i, name) in names.enumerate() {
            // address 0 stays unused
            symbols.insert(name.to_string(), (i as u64 + 1) * SYMBOL_BYTES);
        }
        let memory = vec![0; ((symbols.len() as u64 + 1) * SYMBOL_BYTES) as usize];
        let threads = (0..threads)
            .map(|tid| Thread {
                tid,
                block: func.entry(),
                pc: 0,
                regs: HashMap::new(),
                done: false,
            })
            .collect();
        Self {
            func,
            memory,
            symbols,
            threads,
        }
    }

    pub(crate) fn read(&self, symbol: &str, ty: PtxType) -> u64 {
        self.load(self.symbols[symbol], ty)
    }

    pub(crate) fn write(&mut self, symbol: &str, ty: PtxType, value: u64) {
        let addr = self.symbols[symbol];
        self.store(addr, ty, value);
    }

    fn load(&self, addr: u64, ty: PtxType) -> u64 {
        let start = addr as usize;
        let mut bytes = [0u8; 8];
        let n = ty.size_bytes() as usize;
        bytes[..n].copy_from_slice(&self.memory[start..start + n]);
        u64::from_le_bytes(bytes)
    }

    fn store(&mut self, addr: u64, ty: PtxType, value: u64) {
        let start = addr as usize;
        let n = ty.size_bytes() as usize;
        self.memory[start..start + n].copy_from_slice(&value.to_le_bytes()[..n]);
    }

    fn value(&self, t: usize, op: &Operand) -> u64 {
        let thread = &self.threads[t];
        match op {
            Operand::Reg(reg) => thread.regs.get(&reg.id()).copied().unwrap_or(0),
            Operand::SpecialReg(PtxReg::TidX | PtxReg::LaneId) => u64::from(thread.tid),
            Operand::SpecialReg(_) => 0,
            Operand::ImmU64(v) => *v,
            Operand::ImmI64(v) => *v as u64,
            Operand::ImmF32(v) => u64::from(v.to_bits()),
            Operand::ImmF64(v) => v.to_bits(),
            Operand::Symbol(name) => self.symbols[name],
            Operand::Addr { base, offset } => thread
                .regs
                .get(&base.id())
                .copied()
                .unwrap_or(0)
                .wrapping_add(*offset as i64 as u64),
            Operand::Label(_) | Operand::Block(_) => panic!("{:?} has no value", op),
        }
    }

    fn set(&mut self, t: usize, dst: &Option<Operand>, ty: PtxType, value: u64) {
        if let Some(Operand::Reg(reg)) = dst {
            let value = if ty == PtxType::Pred { value & 1 } else { truncate(ty, value) };
            self.threads[t].regs.insert(reg.id(), value);
        }
    }

    fn fall_through(&self, block: BlockId) -> Option<BlockId> {
        let layout = self.func.layout();
        let pos = layout.iter().position(|&b| b == block)?;
        layout.get(pos + 1).copied()
    }

    fn find_label(&self, name: &str) -> (BlockId, usize) {
        self.func
            .layout()
            .iter()
            .find_map(|&b| {
                self.func
                    .insns(b)
                    .iter()
                    .position(|&i| {
                        let insn = self.func.insn(i);
                        insn.op == PtxOp::Label && insn.label.as_deref() == Some(name)
                    })
                    .map(|pos| (b, pos))
            })
            .unwrap_or_else(|| panic!("label {} not found", name))
    }

    /// Execute one instruction of thread `t`; false once it has finished
    fn step(&mut self, t: usize) -> bool {
        let func = self.func;
        loop {
            let thread = &self.threads[t];
            if thread.done {
                return false;
            }
            if thread.pc < func.insns(thread.block).len() {
                break;
            }
            let next = self.fall_through(thread.block);
            let thread = &mut self.threads[t];
            match next {
                Some(block) => {
                    thread.block = block;
                    thread.pc = 0;
                }
                None => {
                    thread.done = true;
                    return false;
                }
            }
        }

        let (block, pc) = (self.threads[t].block, self.threads[t].pc);
        let insn = func.insn(func.insns(block)[pc]);
        self.threads[t].pc += 1;

        if let Some(pred) = insn.predicate {
            let on = self.value(t, &Operand::Reg(pred.reg)) != 0;
            if on == pred.negated {
                return true;
            }
        }

        match &insn.op {
            PtxOp::Mov => {
                let v = self.value(t, &insn.srcs[0]);
                self.set(t, &insn.dst, insn.ty, v);
            }
            op @ (PtxOp::Add
            | PtxOp::Mul
            | PtxOp::Min
            | PtxOp::Max
            | PtxOp::And
            | PtxOp::Or
            | PtxOp::Xor
            | PtxOp::Shr) => {
                let a = self.value(t, &insn.srcs[0]);
                let b = self.value(t, &insn.srcs[1]);
                let v = arith(op, insn.ty, a, b);
                self.set(t, &insn.dst, insn.ty, v);
            }
            PtxOp::Setp => {
                let a = self.value(t, &insn.srcs[0]);
                let b = self.value(t, &insn.srcs[1]);
                let cmp = insn.cmp.unwrap_or(CmpOp::Eq);
                let v = u64::from(compare(cmp, insn.ty, a, b));
                self.set(t, &insn.dst, PtxType::Pred, v);
            }
            PtxOp::Selp => {
                let pick = self.value(t, &insn.srcs[2]) != 0;
                let v = self.value(t, &insn.srcs[usize::from(!pick)]);
                self.set(t, &insn.dst, insn.ty, v);
            }
            PtxOp::Ld => {
                let addr = self.value(t, &insn.srcs[0]);
                let v = self.load(addr, insn.ty);
                self.set(t, &insn.dst, insn.ty, v);
            }
            PtxOp::St => {
                let addr = self.value(t, &insn.srcs[0]);
                let v = self.value(t, &insn.srcs[1]);
                self.store(addr, insn.ty, v);
            }
            PtxOp::AtomCas => {
                let addr = self.value(t, &insn.srcs[0]);
                let expect = truncate(insn.ty, self.value(t, &insn.srcs[1]));
                let write = self.value(t, &insn.srcs[2]);
                let actual = self.load(addr, insn.ty);
                if actual == expect {
                    self.store(addr, insn.ty, write);
                }
                self.set(t, &insn.dst, insn.ty, actual);
            }
            PtxOp::Bra => {
                let (target, pc) = match &insn.srcs[0] {
                    Operand::Block(b) => (*b, 0),
                    Operand::Label(name) => self.find_label(name),
                    other => panic!("branch to {:?}", other),
                };
                let thread = &mut self.threads[t];
                thread.block = target;
                thread.pc = pc;
            }
            PtxOp::Ret | PtxOp::Exit => self.threads[t].done = true,
            PtxOp::Label | PtxOp::MemBar | PtxOp::Marker(_) => {}
            other => panic!("simulator cannot run {:?}", other),
        }
        true
    }

    /// Run threads in the order `schedule` names them, cycling through it
    /// until every thread finished. Panics after `max_steps` steps.
    pub(crate) fn run(&mut self, schedule: &[usize], max_steps: usize) {
        assert!(!schedule.is_empty());
        let mut steps = 0;
        let mut idle = 0;
        for &pick in schedule.iter().cycle() {
            if self.threads.iter().all(|t| t.done) {
                return;
            }
            let t = pick % self.threads.len();
            if self.step(t) {
                steps += 1;
                idle = 0;
                assert!(steps < max_steps, "no progress after {} steps", steps);
            } else {
                idle += 1;
                if idle > schedule.len() {
                    // the schedule only names finished threads
                    if let Some(t) = self.threads.iter().position(|t| !t.done) {
                        self.step(t);
                    }
                    idle = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CodegenContext;
    use crate::ptx::{Axis, PtxInstruction, ReductionOp, ReductionPhase};
    use crate::reduction::expand_reductions;
    use crate::reduction::tests::call_site;
    use proptest::prelude::*;

    const ACC: &str = "acc";

    /// Every thread adds `tid + 1` into `acc`
    fn summing_kernel(ty: PtxType) -> Function {
        let mut func = Function::new("sum");
        let entry = func.entry();
        let tid = func.alloc_reg(ty);
        let var = func.alloc_reg(ty);
        func.push(entry, PtxInstruction::mov(tid, Operand::SpecialReg(PtxReg::TidX)));
        func.push(
            entry,
            PtxInstruction::new(PtxOp::Add, ty)
                .dst(Operand::Reg(var))
                .src(Operand::Reg(tid))
                .src(Operand::ImmU64(1)),
        );
        call_site(
            &mut func,
            ReductionPhase::Fini,
            Axis::Independent,
            ReductionOp::Add,
            var,
            Some(Operand::Symbol(ACC.to_string())),
        );
        func.push(entry, PtxInstruction::ret());
        let mut ctx = CodegenContext::new();
        expand_reductions(&mut func, &mut ctx).unwrap();
        func
    }

    fn run_sum(ty: PtxType, threads: u32, schedule: &[usize]) -> u64 {
        let func = summing_kernel(ty);
        let mut machine = Machine::new(&func, threads, &[ACC]);
        machine.run(schedule, 100_000);
        machine.read(ACC, ty)
    }

    fn expected(threads: u32) -> u64 {
        u64::from(threads * (threads + 1) / 2)
    }

    #[test]
    fn test_sequential_threads_sum() {
        let schedule: Vec<usize> = (0..4).flat_map(|t| std::iter::repeat(t).take(64)).collect();
        assert_eq!(run_sum(PtxType::U32, 4, &schedule), expected(4));
        assert_eq!(run_sum(PtxType::U16, 4, &schedule), expected(4));
    }

    #[test]
    fn test_round_robin_lock_free() {
        assert_eq!(run_sum(PtxType::U32, 8, &[0, 1, 2, 3, 4, 5, 6, 7]), expected(8));
    }

    #[test]
    fn test_round_robin_lock_based() {
        assert_eq!(run_sum(PtxType::U16, 8, &[0, 1, 2, 3, 4, 5, 6, 7]), expected(8));
    }

    #[test]
    fn test_unguarded_update_loses_writes() {
        // load, add, store with no atomics: interleaving two threads
        // step by step drops one contribution
        let mut func = Function::new("racy");
        let entry = func.entry();
        let v = func.alloc_reg(PtxType::U32);
        func.push(
            entry,
            PtxInstruction::new(PtxOp::Ld, PtxType::U32)
                .dst(Operand::Reg(v))
                .src(Operand::Symbol(ACC.to_string())),
        );
        func.push(
            entry,
            PtxInstruction::new(PtxOp::Add, PtxType::U32)
                .dst(Operand::Reg(v))
                .src(Operand::Reg(v))
                .src(Operand::ImmU64(1)),
        );
        func.push(
            entry,
            PtxInstruction::new(PtxOp::St, PtxType::U32)
                .src(Operand::Symbol(ACC.to_string()))
                .src(Operand::Reg(v)),
        );
        func.push(entry, PtxInstruction::ret());

        let mut machine = Machine::new(&func, 2, &[ACC]);
        machine.run(&[0, 1], 100);
        assert_eq!(machine.read(ACC, PtxType::U32), 1);
    }

    #[test]
    fn test_lock_is_released() {
        let func = summing_kernel(PtxType::U8);
        let mut machine = Machine::new(&func, 3, &[ACC]);
        machine.write(ACC, PtxType::U8, 10);
        machine.run(&[2, 0, 1, 1, 0], 100_000);
        assert_eq!(machine.read(ACC, PtxType::U8), 16);
        assert_eq!(machine.read(LOCK_SYMBOL, PtxType::U32), 0);
    }

    #[test]
    fn test_signed_and_float_arithmetic() {
        assert_eq!(arith(&PtxOp::Max, PtxType::S8, 0xff, 1), 1);
        assert_eq!(arith(&PtxOp::Min, PtxType::S8, 0xff, 1), 0xff);
        assert_eq!(arith(&PtxOp::Min, PtxType::U8, 0xff, 1), 1);
        let three = unfloat(PtxType::F32, 3.0);
        let sum = arith(&PtxOp::Add, PtxType::F32, three, three);
        assert_eq!(float(PtxType::F32, sum), 6.0);
        assert!(compare(CmpOp::Lt, PtxType::S32, 0xffff_ffff, 0));
        assert!(!compare(CmpOp::Lt, PtxType::U32, 0xffff_ffff, 0));
    }

    mod property_tests {
        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn prop_lock_based_update_never_loses_a_contribution(
                threads in 2u32..6,
                schedule in prop::collection::vec(0usize..6, 1..24),
            ) {
                prop_assert_eq!(run_sum(PtxType::U16, threads, &schedule), expected(threads));
            }

            #[test]
            fn prop_lock_free_update_never_loses_a_contribution(
                threads in 2u32..6,
                schedule in prop::collection::vec(0usize..6, 1..24),
            ) {
                prop_assert_eq!(run_sum(PtxType::U32, threads, &schedule), expected(threads));
            }
        }
    }
}
