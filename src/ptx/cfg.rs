//! Control-Flow Graph
//!
//! A function is an arena of basic blocks and an arena of instructions.
//! Handles (`BlockId`, `InsnId`) stay valid across every edit the passes
//! make: splitting a block moves instructions, it never renumbers them.
//!
//! Edges are explicit (`succs`/`preds`); a block without a trailing branch
//! falls through to its single successor, which `layout` keeps adjacent.

use std::fmt;

use super::instructions::PtxInstruction;
use super::registers::{RegisterAllocator, VirtualReg};
use super::types::PtxType;

/// Basic block handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    /// Handle for an arena index
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Arena index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Instruction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnId(u32);

impl InsnId {
    /// Arena index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InsnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
struct BasicBlock {
    insns: Vec<InsnId>,
    succs: Vec<BlockId>,
    preds: Vec<BlockId>,
}

/// Per-thread stack frame living in local memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Size in bytes
    pub size: u32,
    /// Register holding the frame's base address
    pub pointer: VirtualReg,
}

/// A function body under transformation
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    blocks: Vec<BasicBlock>,
    layout: Vec<BlockId>,
    insns: Vec<PtxInstruction>,
    owner: Vec<BlockId>,
    entry: BlockId,
    regs: RegisterAllocator,
    frame: Option<Frame>,
    next_label: u32,
}

impl Function {
    /// Create a function with an empty entry block
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut func = Self {
            name: name.into(),
            blocks: Vec::new(),
            layout: Vec::new(),
            insns: Vec::new(),
            owner: Vec::new(),
            entry: BlockId(0),
            regs: RegisterAllocator::new(),
            frame: None,
            next_label: 0,
        };
        func.entry = func.add_block();
        func
    }

    /// Give the function a local stack frame of `size` bytes
    #[must_use]
    pub fn with_frame(mut self, size: u32) -> Self {
        let pointer = self.regs.allocate_virtual(PtxType::U64);
        self.frame = Some(Frame { size, pointer });
        self
    }

    /// Function name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry block
    #[must_use]
    pub const fn entry(&self) -> BlockId {
        self.entry
    }

    /// Local stack frame, if any
    #[must_use]
    pub const fn frame(&self) -> Option<Frame> {
        self.frame
    }

    /// Number of blocks
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks in layout order
    #[must_use]
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    /// Register allocator
    #[must_use]
    pub fn registers(&self) -> &RegisterAllocator {
        &self.regs
    }

    /// Allocate a fresh virtual register
    pub fn alloc_reg(&mut self, ty: PtxType) -> VirtualReg {
        self.regs.allocate_virtual(ty)
    }

    /// Fresh label, unique within the function
    pub fn fresh_label(&mut self) -> String {
        let label = format!("$L__{}_{}", self.name, self.next_label);
        self.next_label += 1;
        label
    }

    /// Append an empty block at the end of the layout
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::default());
        self.layout.push(id);
        id
    }

    /// Add a control-flow edge
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].succs.push(to);
        self.blocks[to.index()].preds.push(from);
    }

    /// Successors of a block
    #[must_use]
    pub fn succs(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block.index()].succs
    }

    /// Predecessors of a block
    #[must_use]
    pub fn preds(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block.index()].preds
    }

    /// Instructions of a block, in order
    #[must_use]
    pub fn insns(&self, block: BlockId) -> &[InsnId] {
        &self.blocks[block.index()].insns
    }

    /// First instruction of a block
    #[must_use]
    pub fn first(&self, block: BlockId) -> Option<InsnId> {
        self.insns(block).first().copied()
    }

    /// Last instruction of a block
    #[must_use]
    pub fn last(&self, block: BlockId) -> Option<InsnId> {
        self.insns(block).last().copied()
    }

    /// Instruction following `insn` in its block
    #[must_use]
    pub fn next_in_block(&self, insn: InsnId) -> Option<InsnId> {
        let insns = self.insns(self.block_of(insn));
        let pos = self.position(insn);
        insns.get(pos + 1).copied()
    }

    /// Instruction by handle
    #[must_use]
    pub fn insn(&self, insn: InsnId) -> &PtxInstruction {
        &self.insns[insn.index()]
    }

    /// Mutable instruction by handle
    pub fn insn_mut(&mut self, insn: InsnId) -> &mut PtxInstruction {
        &mut self.insns[insn.index()]
    }

    /// Block currently holding `insn`
    #[must_use]
    pub fn block_of(&self, insn: InsnId) -> BlockId {
        self.owner[insn.index()]
    }

    /// Every instruction in layout order
    pub fn iter_insns(&self) -> impl Iterator<Item = (BlockId, InsnId)> + '_ {
        self.layout
            .iter()
            .flat_map(move |&b| self.insns(b).iter().map(move |&i| (b, i)))
    }

    /// Append an instruction to a block
    pub fn push(&mut self, block: BlockId, insn: PtxInstruction) -> InsnId {
        let id = self.alloc_insn(block, insn);
        self.blocks[block.index()].insns.push(id);
        id
    }

    /// Insert an instruction at the head of a block
    pub fn push_front(&mut self, block: BlockId, insn: PtxInstruction) -> InsnId {
        let id = self.alloc_insn(block, insn);
        self.blocks[block.index()].insns.insert(0, id);
        id
    }

    /// Insert an instruction immediately before `anchor`
    pub fn insert_before(&mut self, anchor: InsnId, insn: PtxInstruction) -> InsnId {
        let block = self.block_of(anchor);
        let pos = self.position(anchor);
        let id = self.alloc_insn(block, insn);
        self.blocks[block.index()].insns.insert(pos, id);
        id
    }

    /// Insert an instruction immediately after `anchor`
    pub fn insert_after(&mut self, anchor: InsnId, insn: PtxInstruction) -> InsnId {
        let block = self.block_of(anchor);
        let pos = self.position(anchor);
        let id = self.alloc_insn(block, insn);
        self.blocks[block.index()].insns.insert(pos + 1, id);
        id
    }

    /// Insert a sequence after `anchor`, in order; returns the last inserted
    /// instruction (or `anchor` for an empty sequence)
    pub fn insert_seq_after(&mut self, anchor: InsnId, seq: Vec<PtxInstruction>) -> InsnId {
        seq.into_iter()
            .fold(anchor, |at, insn| self.insert_after(at, insn))
    }

    /// Insert a sequence before `anchor`, in order
    pub fn insert_seq_before(&mut self, anchor: InsnId, seq: Vec<PtxInstruction>) {
        for insn in seq {
            self.insert_before(anchor, insn);
        }
    }

    /// Unlink an instruction from its block; the handle stays allocated
    pub fn remove(&mut self, insn: InsnId) {
        let block = self.block_of(insn);
        self.blocks[block.index()].insns.retain(|&i| i != insn);
    }

    /// Split `block` so that `at` and everything after it move to a new
    /// block placed right after it in the layout.
    ///
    /// Outgoing edges move to the new block; the old block falls through
    /// into it.
    pub fn split_block(&mut self, block: BlockId, at: InsnId) -> BlockId {
        let pos = self.position(at);
        let new = BlockId(self.blocks.len() as u32);

        let tail = self.blocks[block.index()].insns.split_off(pos);
        for &insn in &tail {
            self.owner[insn.index()] = new;
        }
        let succs = std::mem::take(&mut self.blocks[block.index()].succs);
        for &succ in &succs {
            for pred in &mut self.blocks[succ.index()].preds {
                if *pred == block {
                    *pred = new;
                }
            }
        }

        self.blocks.push(BasicBlock {
            insns: tail,
            succs,
            preds: vec![block],
        });
        self.blocks[block.index()].succs.push(new);

        let at_layout = self
            .layout
            .iter()
            .position(|&b| b == block)
            .map_or(self.layout.len(), |p| p + 1);
        self.layout.insert(at_layout, new);
        new
    }

    fn alloc_insn(&mut self, block: BlockId, insn: PtxInstruction) -> InsnId {
        let id = InsnId(self.insns.len() as u32);
        self.insns.push(insn);
        self.owner.push(block);
        id
    }

    fn position(&self, insn: InsnId) -> usize {
        let block = self.block_of(insn);
        // Ownership is maintained on every move, so the handle is present.
        self.blocks[block.index()]
            .insns
            .iter()
            .position(|&i| i == insn)
            .unwrap_or(0)
    }
}
