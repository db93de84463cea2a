//! Region Tree Builder
//!
//! Recovers the nesting of partitioned regions from the split CFG.
//!
//! ## Ownership
//!
//! ```text
//!   root ── blocks outside every region, plus join blocks of top regions
//!    └─ region (mask) ── its forked block, interior blocks,
//!        │               join blocks of its children
//!        └─ child ...
//! ```
//!
//! The block an `Enter` heads belongs to the region it opens; the block a
//! `Leave` heads belongs to the enclosing region. Blocks headed by `ret`
//! belong to no region: nothing in them diverges.
//!
//! Nodes live in an arena indexed by `RegionId`. A child is always
//! allocated after its parent, so reverse index order is a valid
//! post-order and merging a node into its parent never breaks that.

use std::collections::HashMap;

use super::split::BlockMarkers;
use crate::error::{NeuterError, Result};
use crate::ptx::{Axis, AxisMask, BlockId, Boundary, Function, InsnId, MarkerKind};

/// Region tree node handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u32);

impl RegionId {
    /// Arena index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One partitioned region (or the root)
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Enclosing region; `None` for the root
    pub parent: Option<RegionId>,
    /// Nested regions in discovery order
    pub children: Vec<RegionId>,
    /// Axes this region partitions (empty for the root)
    pub mask: AxisMask,
    /// Union of the masks of every descendant
    pub inner_mask: AxisMask,
    /// Block headed by the `Enter` marker
    pub forked_block: Option<BlockId>,
    /// Block headed by the `Leave` marker
    pub join_block: Option<BlockId>,
    /// The `Enter` marker
    pub forked_insn: Option<InsnId>,
    /// The `Leave` marker
    pub join_insn: Option<InsnId>,
    /// The `PreEnter` marker (cooperative regions only)
    pub fork_insn: Option<InsnId>,
    /// The `PreLeave` marker (cooperative regions only)
    pub joining_insn: Option<InsnId>,
    /// Blocks owned by this region, in discovery order
    pub blocks: Vec<BlockId>,
    detached: bool,
}

impl Region {
    fn new(parent: Option<RegionId>, mask: AxisMask) -> Self {
        Self {
            parent,
            children: Vec::new(),
            mask,
            inner_mask: AxisMask::EMPTY,
            forked_block: None,
            join_block: None,
            forked_insn: None,
            join_insn: None,
            fork_insn: None,
            joining_insn: None,
            blocks: Vec::new(),
            detached: false,
        }
    }

    /// True for the root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// True for regions bracketing a call
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.mask.is_call()
    }
}

/// Broadcasting through shared memory needs the preamble markers
fn needs_shared_broadcast(mask: AxisMask) -> bool {
    mask.has(Axis::Cooperative)
}

/// Arena-backed region tree of one function
#[derive(Debug, Clone)]
pub struct RegionTree {
    nodes: Vec<Region>,
}

impl RegionTree {
    const ROOT: RegionId = RegionId(0);

    /// Discover regions by a depth-first walk from the entry block.
    ///
    /// `markers` must come from [`split_blocks`](super::split::split_blocks)
    /// on the same function.
    pub fn build(func: &Function, markers: &BlockMarkers) -> Result<Self> {
        let mut tree = Self {
            nodes: vec![Region::new(None, AxisMask::EMPTY)],
        };
        let mut visited = vec![false; func.num_blocks()];
        let mut stack = vec![(func.entry(), Self::ROOT)];

        while let Some((block, mut par)) = stack.pop() {
            if visited[block.index()] {
                continue;
            }
            visited[block.index()] = true;

            if let Some(&end) = markers.get(&block) {
                match func.insn(end).boundary() {
                    Some(Boundary::Return) => continue,
                    Some(Boundary::Enter(mask)) => {
                        if mask.partitioned().is_empty() {
                            return Err(NeuterError::EmptyRegionMask { block });
                        }
                        let child = tree.push_node(Region::new(Some(par), mask));
                        let node = tree.node_mut(child);
                        node.forked_block = Some(block);
                        node.forked_insn = Some(end);
                        if needs_shared_broadcast(mask) {
                            let pre = discover_preamble(func, block, MarkerKind::PreEnter)?;
                            tree.node_mut(child).fork_insn = Some(pre);
                        }
                        tree.node_mut(par).children.push(child);
                        par = child;
                    }
                    Some(Boundary::Leave(mask)) => {
                        let node = tree.node(par);
                        let Some(parent) = node.parent else {
                            return Err(NeuterError::UnmatchedLeave { block });
                        };
                        if node.mask != mask {
                            return Err(NeuterError::MaskMismatch {
                                block,
                                entered: node.mask,
                                left: mask,
                            });
                        }
                        if node.join_block.is_some() {
                            return Err(NeuterError::MalformedBoundary {
                                block,
                                reason: "region left through two different blocks",
                            });
                        }
                        let joining = if needs_shared_broadcast(mask) {
                            Some(discover_preamble(func, block, MarkerKind::PreLeave)?)
                        } else {
                            None
                        };
                        let node = tree.node_mut(par);
                        node.join_block = Some(block);
                        node.join_insn = Some(end);
                        node.joining_insn = joining;
                        par = parent;
                    }
                    None => {}
                }
            }

            tree.node_mut(par).blocks.push(block);
            for &succ in func.succs(block).iter().rev() {
                stack.push((succ, par));
            }
        }

        for node in tree.nodes.iter().skip(1) {
            if node.join_block.is_none() {
                let block = node.forked_block.unwrap_or(func.entry());
                return Err(NeuterError::UnclosedRegion { block });
            }
        }

        tracing::debug!(
            function = func.name(),
            regions = tree.nodes.len() - 1,
            "region tree built"
        );
        Ok(tree)
    }

    fn push_node(&mut self, node: Region) -> RegionId {
        let id = RegionId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn node_mut(&mut self, id: RegionId) -> &mut Region {
        &mut self.nodes[id.index()]
    }

    /// Root handle
    #[must_use]
    pub const fn root(&self) -> RegionId {
        Self::ROOT
    }

    /// Node by handle
    #[must_use]
    pub fn node(&self, id: RegionId) -> &Region {
        &self.nodes[id.index()]
    }

    /// Number of regions still in the tree, root included
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| !n.detached).count()
    }

    /// Always false: the root exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Nodes in pre-order (parents before children, siblings in order)
    #[must_use]
    pub fn preorder(&self) -> Vec<RegionId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.node(id).children.iter().rev().copied());
        }
        order
    }

    /// Region owning `block`, if any
    #[must_use]
    pub fn owner(&self, block: BlockId) -> Option<RegionId> {
        self.owners().get(&block).copied()
    }

    /// Owning region of every owned block
    #[must_use]
    pub fn owners(&self) -> HashMap<BlockId, RegionId> {
        self.preorder()
            .into_iter()
            .flat_map(|id| self.node(id).blocks.iter().map(move |&b| (b, id)))
            .collect()
    }

    /// Flatten back into the nested boundary sequence the tree encodes
    #[must_use]
    pub fn boundary_sequence(&self) -> Vec<Boundary> {
        fn walk(tree: &RegionTree, id: RegionId, out: &mut Vec<Boundary>) {
            let node = tree.node(id);
            if !node.is_root() {
                out.push(Boundary::Enter(node.mask));
            }
            for &child in &node.children {
                walk(tree, child, out);
            }
            if !node.is_root() {
                out.push(Boundary::Leave(node.mask));
            }
        }
        let mut out = Vec::new();
        walk(self, Self::ROOT, &mut out);
        out
    }

    /// Fold a region's single child into it when the two are back to back.
    ///
    /// The parent must own exactly its forked block and the child's join
    /// block, the child's `PreEnter` must directly follow the parent's
    /// `Enter`, and the parent's `PreLeave` must directly follow the
    /// child's `Leave`. The parent then partitions both axis sets at once.
    pub fn merge_nested(&mut self, func: &Function) -> usize {
        let mut merged = 0;
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            if self.try_merge(func, id) {
                merged += 1;
            }
            stack.extend(self.node(id).children.iter().rev().copied());
        }
        if merged > 0 {
            tracing::debug!(function = func.name(), merged, "nested regions merged");
        }
        merged
    }

    fn try_merge(&mut self, func: &Function, id: RegionId) -> bool {
        let node = self.node(id);
        if node.mask.partitioned().is_empty() || node.children.len() != 1 || node.blocks.len() != 2
        {
            return false;
        }
        let inner_id = node.children[0];
        let inner = self.node(inner_id);
        if node.mask.partitioned().intersects(inner.mask) {
            return false;
        }

        let (Some(forked), Some(forked_block)) = (node.forked_insn, node.forked_block) else {
            return false;
        };
        let Some(fork) = func.next_in_block(forked) else {
            return false;
        };
        let is_pre_enter = func
            .insn(fork)
            .as_marker()
            .is_some_and(|m| m.kind == MarkerKind::PreEnter);
        if func.last(forked_block) != Some(fork) || !is_pre_enter {
            return false;
        }
        let Some(inner_join) = inner.join_insn else {
            return false;
        };
        if node.joining_insn.is_none() || func.next_in_block(inner_join) != node.joining_insn {
            return false;
        }

        tracing::trace!(
            outer = %node.mask,
            inner = %inner.mask,
            block = %forked_block,
            "merging nested region into parent"
        );

        let inner = std::mem::replace(
            &mut self.nodes[inner_id.index()],
            Region::new(None, AxisMask::EMPTY),
        );
        self.nodes[inner_id.index()].detached = true;
        for &grandchild in &inner.children {
            self.node_mut(grandchild).parent = Some(id);
        }
        let node = self.node_mut(id);
        node.mask |= inner.mask.partitioned();
        node.blocks.extend(inner.blocks);
        node.children = inner.children;
        true
    }

    /// Fill in every node's inner mask, bottom-up.
    ///
    /// Fails if a region partitions an axis some enclosing region already
    /// partitions.
    pub fn compute_inner_masks(&mut self) -> Result<()> {
        for index in (0..self.nodes.len()).rev() {
            if self.nodes[index].detached {
                continue;
            }
            let mut inner = AxisMask::EMPTY;
            for &child in &self.nodes[index].children {
                let child = self.node(child);
                inner |= child.mask.partitioned() | child.inner_mask;
            }
            let node = &mut self.nodes[index];
            node.inner_mask = inner;
            let overlap = node.mask.partitioned() & inner;
            if let (false, Some(block)) = (overlap.is_empty(), node.forked_block) {
                return Err(NeuterError::AxisRepartitioned {
                    block,
                    axes: overlap,
                });
            }
        }
        Ok(())
    }
}

/// Last instruction of the single predecessor of `block`, which must be a
/// preamble marker of the given kind.
fn discover_preamble(func: &Function, block: BlockId, kind: MarkerKind) -> Result<InsnId> {
    let &[pred] = func.preds(block) else {
        return Err(NeuterError::MalformedBoundary {
            block,
            reason: "region boundary block needs exactly one predecessor",
        });
    };
    let name = match kind {
        MarkerKind::PreEnter => "pre-enter",
        MarkerKind::PreLeave => "pre-leave",
        MarkerKind::Enter => "enter",
        MarkerKind::Leave => "leave",
    };
    func.last(pred)
        .filter(|&insn| func.insn(insn).as_marker().is_some_and(|m| m.kind == kind))
        .ok_or(NeuterError::MissingPreamble { block, kind: name })
}
