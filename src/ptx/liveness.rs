//! Backward dataflow liveness over the CFG.
//!
//! Computes the registers live at the entry of every block. Region-boundary
//! broadcasting copies exactly these registers from the leader thread to
//! the rest of its group.
//!
//! # Algorithm
//!
//! 1. **gen/kill** per block (forward scan): `gen(B)` holds registers read
//!    before any write in B, `kill(B)` those written unconditionally.
//!    A predicated write may not happen, so it does not kill.
//! 2. **Iterate** in reverse layout order until nothing changes:
//!    - `live_out(B) = ∪ live_in(S)` over successors S
//!    - `live_in(B) = gen(B) ∪ (live_out(B) - kill(B))`

use std::collections::HashSet;

use super::cfg::{BlockId, Function};
use super::registers::VirtualReg;

/// Set of live registers at a block boundary
pub type LiveSet = HashSet<VirtualReg>;

/// Liveness information for every block, indexed by `BlockId::index()`
#[derive(Debug, Clone)]
pub struct Liveness {
    live_in: Vec<LiveSet>,
    live_out: Vec<LiveSet>,
}

impl Liveness {
    /// Run the analysis on the current state of `func`
    #[must_use]
    pub fn compute(func: &Function) -> Self {
        let num_blocks = func.num_blocks();
        tracing::debug!(function = func.name(), num_blocks, "computing liveness");

        let mut gen: Vec<LiveSet> = vec![LiveSet::new(); num_blocks];
        let mut kill: Vec<LiveSet> = vec![LiveSet::new(); num_blocks];
        for &block in func.layout() {
            let (g, k) = (&mut gen[block.index()], &mut kill[block.index()]);
            for &insn in func.insns(block) {
                let insn = func.insn(insn);
                for reg in insn.uses() {
                    if !k.contains(&reg) {
                        g.insert(reg);
                    }
                }
                if insn.predicate.is_none() {
                    k.extend(insn.defs());
                }
            }
        }

        let mut live_in: Vec<LiveSet> = gen.clone();
        let mut live_out: Vec<LiveSet> = vec![LiveSet::new(); num_blocks];
        let mut iterations = 0usize;
        let mut changed = true;
        while changed {
            changed = false;
            iterations += 1;
            for &block in func.layout().iter().rev() {
                let b = block.index();
                let mut out = LiveSet::new();
                for &succ in func.succs(block) {
                    out.extend(live_in[succ.index()].iter().copied());
                }
                let mut inn = gen[b].clone();
                inn.extend(out.iter().filter(|reg| !kill[b].contains(reg)).copied());

                if inn.len() != live_in[b].len() {
                    changed = true;
                }
                live_in[b] = inn;
                live_out[b] = out;
            }
        }

        tracing::trace!(function = func.name(), iterations, "liveness converged");
        Self { live_in, live_out }
    }

    /// Registers live on entry to `block`
    #[must_use]
    pub fn live_in(&self, block: BlockId) -> &LiveSet {
        &self.live_in[block.index()]
    }

    /// Registers live on exit from `block`
    #[must_use]
    pub fn live_out(&self, block: BlockId) -> &LiveSet {
        &self.live_out[block.index()]
    }

    /// Live-in registers of `block` in a stable (id) order
    #[must_use]
    pub fn live_in_sorted(&self, block: BlockId) -> Vec<VirtualReg> {
        let mut regs: Vec<VirtualReg> = self.live_in(block).iter().copied().collect();
        regs.sort_by_key(|reg| reg.id());
        regs
    }
}
