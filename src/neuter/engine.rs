//! Divergence Neutering Engine
//!
//! Two passes over the region tree:
//!
//! 1. **Bottom-up** ([`Neuterer::propagate_boundaries`]): every partitioned
//!    region broadcasts the leader's live state at its entry, through
//!    shared memory and barriers for the cooperative axis or a warp
//!    shuffle for the lockstep axis.
//! 2. **Top-down** ([`Neuterer::neuter`]): every region decides per axis
//!    whether to do nothing, guard each of its SESE regions (or blocks),
//!    or skip itself as a whole, and inserts the guard branches.
//!
//! ## Per-axis decision
//!
//! ```text
//! axis partitioned here or above      -> nothing
//! axis unused by the launch           -> nothing
//! axis partitioned below, or root     -> guard own blocks
//! parent is root or guards own blocks -> skip whole region
//! otherwise                           -> parent's skip covers it
//! ```
//!
//! A guarded range ending in a conditional branch has its condition
//! broadcast before the branch, which is then tagged uniform.

use super::propagate::{
    propagate, shuffle, PropagateMode, Propagated, Propagator, SharedBroadcast, WarpBroadcast,
};
use super::region::{RegionId, RegionTree};
use super::sese::find_sese;
use crate::config::NeuterConfig;
use crate::context::CodegenContext;
use crate::error::{NeuterError, Result};
use crate::ptx::{
    Axis, AxisMask, BlockId, CmpOp, Function, InsnId, Liveness, Operand, Predicate,
    PtxInstruction, PtxOp, PtxType, VirtualReg,
};

/// A range of blocks non-leader threads jump over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardRegion {
    /// First block of the range
    pub entry: BlockId,
    /// Last block of the range
    pub exit: BlockId,
    /// Axes guarded
    pub mask: AxisMask,
}

/// State broadcast at one region's entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryPropagation {
    /// The region's forked block
    pub block: BlockId,
    /// Axis whose threads receive the state
    pub axis: Axis,
    /// Registers broadcast
    pub registers: usize,
    /// Frame words broadcast
    pub frame_words: u32,
    /// Barriers bracketing the region (0 or 2)
    pub barriers: usize,
}

/// Everything the neutering passes inserted into one function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeuterReport {
    /// Guarded ranges, in insertion order
    pub guards: Vec<GuardRegion>,
    /// Region-entry broadcasts, bottom-up
    pub propagations: Vec<BoundaryPropagation>,
    /// Conditional branches whose condition was broadcast
    pub branch_broadcasts: usize,
    /// Barriers inserted, all causes
    pub barriers: usize,
    /// Never-returning calls terminated with `trap; exit;`
    pub noreturn_traps: usize,
}

impl NeuterReport {
    /// Guard ranges covering `axis`
    #[must_use]
    pub fn guards_for(&self, axis: Axis) -> usize {
        self.guards.iter().filter(|g| g.mask.has(axis)).count()
    }
}

fn predicate_slot(axis: Axis) -> Option<usize> {
    Axis::NEUTERED.iter().position(|&a| a == axis)
}

/// Rewrites one function given its region tree
pub struct Neuterer<'a> {
    func: &'a mut Function,
    tree: &'a RegionTree,
    ctx: &'a mut CodegenContext,
    config: &'a NeuterConfig,
    predicates: [Option<VirtualReg>; 2],
    report: NeuterReport,
}

impl<'a> Neuterer<'a> {
    /// Engine over `func`, whose regions `tree` describes
    pub fn new(
        func: &'a mut Function,
        tree: &'a RegionTree,
        ctx: &'a mut CodegenContext,
        config: &'a NeuterConfig,
    ) -> Self {
        Self {
            func,
            tree,
            ctx,
            config,
            predicates: [None; 2],
            report: NeuterReport::default(),
        }
    }

    /// Broadcast live state into every partitioned region, innermost
    /// regions first.
    ///
    /// `liveness` must describe the function before any propagation code
    /// was inserted.
    pub fn propagate_boundaries(&mut self, liveness: &Liveness) -> Result<()> {
        // Reverse pre-order visits every child before its parent.
        for id in self.tree.preorder().into_iter().rev() {
            self.propagate_region(id, liveness)?;
        }
        Ok(())
    }

    fn propagate_region(&mut self, id: RegionId, liveness: &Liveness) -> Result<()> {
        let node = self.tree.node(id);
        let mask = node.mask;
        let is_call = node.is_call();
        let (Some(forked_block), Some(forked_insn)) = (node.forked_block, node.forked_insn) else {
            return Ok(());
        };
        let live = liveness.live_in_sorted(forked_block);

        if mask.has(Axis::Cooperative) {
            let (Some(fork_insn), Some(join_insn)) = (node.fork_insn, node.join_insn) else {
                return Err(NeuterError::MalformedBoundary {
                    block: forked_block,
                    reason: "cooperative region without preamble",
                });
            };

            let mut fill = SharedBroadcast::new(self.func);
            let filled = propagate(
                self.func,
                forked_insn,
                &live,
                is_call,
                PropagateMode::Write,
                &mut fill,
            );
            fill.finish(self.func, forked_insn, &mut self.ctx.broadcast);

            let mut spill = SharedBroadcast::new(self.func);
            let spilled = propagate(
                self.func,
                fork_insn,
                &live,
                is_call,
                PropagateMode::Read,
                &mut spill,
            );
            spill.finish(self.func, fork_insn, &mut self.ctx.broadcast);

            let empty_body = !is_call && self.func.next_in_block(forked_insn) == node.joining_insn;
            let barriers = if spilled.is_empty() && (empty_body || is_call) {
                0
            } else {
                self.func.insert_before(forked_insn, PtxInstruction::bar_sync());
                self.func.insert_before(join_insn, PtxInstruction::bar_sync());
                2
            };
            self.record_propagation(forked_block, Axis::Cooperative, filled, barriers);
        } else if mask.has(Axis::Lockstep) {
            let shuffled = propagate(
                self.func,
                forked_insn,
                &live,
                is_call,
                PropagateMode::ReadWrite,
                &mut WarpBroadcast,
            );
            self.record_propagation(forked_block, Axis::Lockstep, shuffled, 0);
        }
        Ok(())
    }

    fn record_propagation(&mut self, block: BlockId, axis: Axis, done: Propagated, barriers: usize) {
        tracing::debug!(
            %block,
            %axis,
            registers = done.registers,
            frame_words = done.frame_words,
            barriers,
            "region entry propagation"
        );
        self.report.barriers += barriers;
        self.report.propagations.push(BoundaryPropagation {
            block,
            axis,
            registers: done.registers,
            frame_words: done.frame_words,
            barriers,
        });
    }

    /// Insert guards for the axes in `modes`, outermost region first
    pub fn neuter(&mut self, modes: AxisMask) -> Result<()> {
        let mut stack = vec![(self.tree.root(), AxisMask::EMPTY)];
        while let Some((id, outer)) = stack.pop() {
            self.neuter_region(id, modes, outer)?;
            let node = self.tree.node(id);
            let inherited = outer | node.mask.partitioned();
            stack.extend(node.children.iter().rev().map(|&child| (child, inherited)));
        }
        Ok(())
    }

    fn neuter_region(&mut self, id: RegionId, modes: AxisMask, outer: AxisMask) -> Result<()> {
        let node = self.tree.node(id);
        let partitioned = outer | node.mask.partitioned();
        let parent = node.parent.map(|p| self.tree.node(p));

        let mut neuter_mask = AxisMask::EMPTY;
        let mut skip_mask = AxisMask::EMPTY;
        for axis in Axis::NEUTERED {
            if partitioned.has(axis) || !modes.has(axis) {
                continue;
            }
            if node.inner_mask.has(axis) || node.forked_insn.is_none() {
                neuter_mask |= axis.mask();
            } else if parent.map_or(true, |p| p.forked_insn.is_none() || p.inner_mask.has(axis)) {
                skip_mask |= axis.mask();
            }
        }

        if !neuter_mask.is_empty() {
            if self.config.sese_regions {
                for region in find_sese(self.func, &node.blocks)? {
                    self.single(neuter_mask, region.entry, region.exit)?;
                }
            } else {
                for &block in &node.blocks {
                    self.single(neuter_mask, block, block)?;
                }
            }
        }

        if !skip_mask.is_empty() {
            self.skip_region(id, skip_mask)?;
        }
        Ok(())
    }

    /// Jump non-leaders from the region's forked block to the end of the
    /// block preceding its join block
    fn skip_region(&mut self, id: RegionId, mask: AxisMask) -> Result<()> {
        let node = self.tree.node(id);
        let (Some(forked), Some(join)) = (node.forked_block, node.join_block) else {
            return Ok(());
        };
        let &[pre_tail] = self.func.preds(join) else {
            return Err(NeuterError::MalformedBoundary {
                block: join,
                reason: "skipped region's join block needs exactly one predecessor",
            });
        };
        if self.func.succs(pre_tail).len() != 1 {
            return Err(NeuterError::MalformedBoundary {
                block: pre_tail,
                reason: "block before a join must fall through to it",
            });
        }
        self.single(mask, forked, pre_tail)
    }

    fn axis_predicate(&mut self, axis: Axis) -> VirtualReg {
        let slot = predicate_slot(axis).unwrap_or(0);
        match self.predicates[slot] {
            Some(pred) => pred,
            None => {
                let pred = self.func.alloc_reg(PtxType::Pred);
                self.predicates[slot] = Some(pred);
                pred
            }
        }
    }

    /// First instruction of `block` that needs neutering, or its last
    /// instruction when none does
    fn neuter_head(&self, block: BlockId) -> Option<InsnId> {
        let insns = self.func.insns(block);
        insns
            .iter()
            .copied()
            .find(|&i| self.func.insn(i).needs_neutering())
            .or_else(|| insns.last().copied())
    }

    /// Guard the block range `from..=to` so only leaders of `mask` run it
    fn single(&mut self, mask: AxisMask, mut from: BlockId, to: BlockId) -> Result<()> {
        let mut head;
        loop {
            head = self.neuter_head(from);
            if from == to {
                break;
            }
            let jump_only = head.is_some_and(|h| self.func.insn(h).is_branch())
                && self.func.succs(from).len() == 1;
            if !jump_only {
                break;
            }
            let target = self.func.succs(from)[0];
            if self.func.preds(target).len() != 1 {
                break;
            }
            from = target;
        }

        let tail = self.func.last(to);
        let tail_branch = tail.is_some_and(|t| self.func.insn(t).block_target().is_some());
        let cond_branch = tail_branch
            && tail.is_some_and(|t| self.func.insn(t).is_conditional_branch());

        let mut skip_mask = mask;
        if tail == head {
            let Some(only) = head else {
                return Ok(());
            };
            if !self.func.insn(only).needs_neutering() {
                return Ok(());
            }
            if cond_branch {
                // the branch itself runs everywhere; only a shared-memory
                // broadcast needs leader-only code
                if !mask.has(Axis::Cooperative) {
                    skip_mask = AxisMask::EMPTY;
                }
            } else if tail_branch {
                return Ok(());
            }
        }

        let noreturn_tail = tail.is_some_and(|t| self.func.insn(t).is_noreturn_call());
        let mut before = tail;
        let mut last_guard: Option<InsnId> = None;
        let mut first_label: Option<InsnId> = None;
        for axis in Axis::NEUTERED {
            if !skip_mask.has(axis) {
                continue;
            }
            let label = self.func.fresh_label();
            let pred = self.axis_predicate(axis);
            let mut guard = PtxInstruction::branch_label(label.clone()).predicated(Predicate::on(pred));
            if axis == Axis::Cooperative {
                guard = guard.uniform();
            }
            let guard = match (last_guard, head) {
                (Some(prev), _) => self.func.insert_after(prev, guard),
                (None, Some(h)) => self.func.insert_before(h, guard),
                (None, None) => self.func.push_front(from, guard),
            };
            last_guard = Some(guard);

            let def = PtxInstruction::label_def(label);
            let label_insn = match (tail_branch, before, tail, first_label) {
                (true, Some(b), _, _) => {
                    let l = self.func.insert_before(b, def);
                    before = Some(l);
                    l
                }
                (_, _, Some(t), _) => self.func.insert_after(t, def),
                (_, _, None, Some(first)) => self.func.insert_before(first, def),
                (_, _, None, None) => self.func.push(to, def),
            };
            first_label.get_or_insert(label_insn);
            if !tail_branch && noreturn_tail {
                self.func
                    .insert_after(label_insn, PtxInstruction::new(PtxOp::Exit, PtxType::B32));
            }
        }

        if !skip_mask.is_empty() {
            tracing::trace!(entry = %from, exit = %to, mask = %skip_mask, "guarded range");
            self.report.guards.push(GuardRegion {
                entry: from,
                exit: to,
                mask: skip_mask,
            });
        }

        if let (true, Some(tail)) = (cond_branch, tail) {
            self.broadcast_condition(mask, tail, before.unwrap_or(tail));
        }
        Ok(())
    }

    /// Make a guarded range's trailing branch condition uniform
    fn broadcast_condition(&mut self, mask: AxisMask, tail: InsnId, before: InsnId) {
        let branch = self.func.insn(tail);
        if branch.uniform {
            return;
        }
        let Some(pred) = branch.predicate.map(|p| p.reg) else {
            return;
        };

        if mask == AxisMask::LOCKSTEP {
            let seq = shuffle(self.func, PtxOp::ShflIdx, pred, pred, Operand::ImmU64(0));
            self.func.insert_seq_before(tail, seq);
        } else {
            let spill = SharedBroadcast::direct().value(self.func, pred, PropagateMode::Read, 0);
            self.func.insert_seq_before(before, spill);
            let mut seq = vec![PtxInstruction::bar_sync()];
            seq.extend(SharedBroadcast::direct().value(self.func, pred, PropagateMode::Write, 0));
            seq.push(PtxInstruction::bar_sync());
            self.func.insert_seq_before(tail, seq);
            self.ctx.broadcast.grow(4, 4);
            self.report.barriers += 2;
        }
        self.func.insn_mut(tail).uniform = true;
        self.report.branch_broadcasts += 1;
        tracing::trace!(%tail, %mask, "branch condition broadcast");
    }

    /// Initialise the axis predicates used by the guards at the head of
    /// the entry block, and hand back the report
    pub fn finish(self) -> NeuterReport {
        let mut seq = Vec::new();
        for (axis, pred) in Axis::NEUTERED.into_iter().zip(self.predicates) {
            let (Some(pred), Some(index)) = (pred, axis.thread_index()) else {
                continue;
            };
            let tid = self.func.alloc_reg(PtxType::U32);
            seq.push(PtxInstruction::mov(tid, Operand::SpecialReg(index)));
            seq.push(PtxInstruction::setp(
                CmpOp::Ne,
                PtxType::U32,
                pred,
                Operand::Reg(tid),
                Operand::ImmU64(0),
            ));
        }
        let entry = self.func.entry();
        match self.func.first(entry) {
            Some(first) => self.func.insert_seq_before(first, seq),
            None => {
                for insn in seq {
                    self.func.push(entry, insn);
                }
            }
        }
        self.report
    }
}
