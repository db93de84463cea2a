//! Single-entry single-exit region finder.
//!
//! Partitions a region's blocks into maximal SESE regions by cycle
//! equivalence, so a whole region can be skipped with one guard instead
//! of one guard per block.
//!
//! ## Detection Strategy
//!
//! 1. Every block `B` becomes three pseudo-nodes `Bi - B' - Bo` joined by
//!    two edges; edges into `B` attach to `Bi`, edges out of `B` to `Bo`.
//!    Numbers go in steps of 3 from 2 so the pseudo-nodes of `B` are
//!    `n-1, n, n+1`. Node 0 stands for everything outside the set.
//! 2. An undirected DFS numbers the blocks. A block reached against edge
//!    direction gets orientation -1, which swaps its above and below.
//! 3. In reverse DFS order each block's below and above pseudo-nodes are
//!    processed: child bracket lists are spliced in, brackets ending here
//!    are removed, back-edges leaving here are pushed. The class of the
//!    edge `B'-Bo` is the (size, top bracket) pair of the list at that
//!    moment; equal classes mean cycle-equivalent blocks.
//! 4. A forward walk over the whole function opens a region at the first
//!    block of a class and closes it when the class count hits zero.
//!
//! Edges leaving the set are back-edges to node 0. A node with no
//! brackets or no edges on one side leads into a region that never
//! returns and gets a fake back-edge to node 0 as well.

use std::collections::{HashMap, HashSet};

use crate::error::{NeuterError, Result};
use crate::ptx::{BlockId, Function};

/// A maximal single-entry single-exit block range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeseRegion {
    /// First block; dominates the region
    pub entry: BlockId,
    /// Last block; post-dominates the region
    pub exit: BlockId,
}

/// Pseudo-node reference: `offset` relative to `block`'s number, or the
/// absolute number `offset` when `block` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pseudo {
    block: Option<BlockId>,
    offset: i32,
}

impl Pseudo {
    const OUTSIDE: Self = Self {
        block: None,
        offset: 0,
    };

    const fn unreached(depth: i32) -> Self {
        Self {
            block: None,
            offset: depth,
        }
    }
}

#[derive(Debug, Clone)]
struct Bracket {
    back: Pseudo,
    color: usize,
    size: Option<usize>,
}

impl Bracket {
    const fn new(back: Pseudo) -> Self {
        Self {
            back,
            color: 0,
            size: None,
        }
    }

    /// Class of an edge whose bracket list has this bracket on top and
    /// `length` entries
    fn color(&mut self, counts: &mut Vec<u32>, length: usize) -> usize {
        if self.size != Some(length) {
            self.size = Some(length);
            self.color = counts.len();
            counts.push(0);
        }
        counts[self.color] += 1;
        self.color
    }
}

#[derive(Debug, Clone)]
struct SeseNode {
    node: i32,
    parent: i32,
    dir: i32,
    high: Pseudo,
    color: Option<usize>,
    brackets: Vec<Bracket>,
}

impl SeseNode {
    const fn new(node: i32, parent: i32, dir: i32) -> Self {
        Self {
            node,
            parent,
            dir,
            high: Pseudo::OUTSIDE,
            color: None,
            brackets: Vec::new(),
        }
    }
}

type Nodes = HashMap<BlockId, SeseNode>;

fn number_of(nodes: &Nodes, pseudo: Pseudo) -> i32 {
    pseudo.offset + pseudo.block.and_then(|b| nodes.get(&b)).map_or(0, |n| n.node)
}

/// Edges of `block` on the side `dir` (+1 = successors)
fn side(func: &Function, block: BlockId, dir: i32) -> &[BlockId] {
    if dir > 0 {
        func.succs(block)
    } else {
        func.preds(block)
    }
}

/// Find the SESE regions made of `blocks`.
///
/// Regions come back in class order. Blocks outside `blocks` are treated
/// as one external node.
pub fn find_sese(func: &Function, blocks: &[BlockId]) -> Result<Vec<SeseRegion>> {
    let members: HashSet<BlockId> = blocks.iter().copied().collect();
    let mut nodes = Nodes::with_capacity(blocks.len());
    let mut counts: Vec<u32> = Vec::new();

    for &start in blocks {
        if nodes.contains_key(&start) {
            continue;
        }
        let mut order = Vec::new();
        let depth = number(func, &members, &mut nodes, start, &mut order);
        tracing::trace!(%start, blocks = order.len(), depth, "numbered SESE component");

        for &block in order.iter().rev() {
            process_pseudo(func, &mut nodes, block, 1, depth);
            let node = nodes
                .get_mut(&block)
                .ok_or(NeuterError::Sese { block, reason: "block lost its numbering" })?;
            let length = node.brackets.len();
            let top = node.brackets.last_mut().ok_or(NeuterError::Sese {
                block,
                reason: "empty bracket list below block",
            })?;
            node.color = Some(top.color(&mut counts, length));
            process_pseudo(func, &mut nodes, block, -1, depth);
        }
    }

    let regions = color_regions(func, &nodes, counts)?;
    tracing::debug!(
        function = func.name(),
        blocks = blocks.len(),
        regions = regions.len(),
        "SESE regions found"
    );
    Ok(regions)
}

/// Undirected DFS numbering of the component containing `start`.
///
/// Each block first walks its "other side" edges, then its own side with
/// the orientation flipped. Returns the next free number, which exceeds
/// every pseudo-node number in the component.
fn number(
    func: &Function,
    members: &HashSet<BlockId>,
    nodes: &mut Nodes,
    start: BlockId,
    order: &mut Vec<BlockId>,
) -> i32 {
    struct Frame {
        block: BlockId,
        node: i32,
        dir: i32,
        second_pass: bool,
        next: usize,
    }

    enum Step {
        Visit(BlockId, i32, i32),
        Flip,
        Pop,
        Skip,
    }

    let mut n = 2;
    nodes.insert(start, SeseNode::new(n, 0, 1));
    order.push(start);
    let mut stack = vec![Frame {
        block: start,
        node: n,
        dir: 1,
        second_pass: false,
        next: 0,
    }];
    n += 3;

    while let Some(frame) = stack.last_mut() {
        let edges = side(func, frame.block, frame.dir);
        let step = if let Some(&target) = edges.get(frame.next) {
            frame.next += 1;
            if members.contains(&target) && !nodes.contains_key(&target) {
                Step::Visit(target, frame.node, frame.dir)
            } else {
                Step::Skip
            }
        } else if !frame.second_pass {
            Step::Flip
        } else {
            Step::Pop
        };

        match step {
            Step::Visit(block, parent, dir) => {
                nodes.insert(block, SeseNode::new(n, parent, dir));
                order.push(block);
                stack.push(Frame {
                    block,
                    node: n,
                    dir,
                    second_pass: false,
                    next: 0,
                });
                n += 3;
            }
            Step::Flip => {
                if let Some(frame) = stack.last_mut() {
                    frame.second_pass = true;
                    frame.dir = -frame.dir;
                    frame.next = 0;
                }
            }
            Step::Pop => {
                stack.pop();
            }
            Step::Skip => {}
        }
    }
    n
}

enum EdgeKind {
    Child(BlockId, i32),
    Back(Pseudo, i32),
    Outside,
    Other,
}

/// Process the pseudo-node of `me` on side `dir` (+1 below, -1 above)
fn process_pseudo(func: &Function, nodes: &mut Nodes, me: BlockId, dir: i32, depth: i32) {
    let Some(me_node) = nodes.get(&me) else {
        return;
    };
    let (node, parent, orientation, own_high) =
        (me_node.node, me_node.parent, me_node.dir, me_node.high);
    let usd = -dir * orientation;
    let edges = side(func, me, dir * orientation);

    let mut hi_back = depth;
    let mut node_back = Pseudo::unreached(depth);
    let mut hi_child = depth;
    let mut node_child = Pseudo::unreached(depth);
    let mut highest_child: Option<BlockId> = None;
    let mut self_child = false;

    if dir < 0 {
        // The above pseudo-node has the block itself as an extra child.
        node_child = own_high;
        hi_child = number_of(nodes, own_high);
        self_child = true;
    }

    let kinds: Vec<EdgeKind> = edges
        .iter()
        .map(|&target| match nodes.get(&target) {
            Some(t) if t.parent == node && t.dir + usd == 0 => {
                EdgeKind::Child(target, number_of(nodes, t.high))
            }
            Some(t) if t.node < node + dir && !(dir < 0 && parent == t.node) => {
                let d = usd * t.dir;
                EdgeKind::Back(
                    Pseudo {
                        block: Some(target),
                        offset: d,
                    },
                    t.node + d,
                )
            }
            Some(_) => EdgeKind::Other,
            None => EdgeKind::Outside,
        })
        .collect();

    let mut children: Vec<BlockId> = Vec::new();
    for kind in &kinds {
        match *kind {
            EdgeKind::Child(target, t_hi) => {
                if children.contains(&target) {
                    continue;
                }
                children.push(target);
                if t_hi < hi_child {
                    hi_child = t_hi;
                    node_child = nodes.get(&target).map_or(node_child, |t| t.high);
                    highest_child = Some(target);
                }
            }
            EdgeKind::Back(pseudo, back) => {
                if back < hi_back {
                    hi_back = back;
                    node_back = pseudo;
                }
            }
            EdgeKind::Outside => {
                hi_back = 0;
                node_back = Pseudo::OUTSIDE;
            }
            EdgeKind::Other => {}
        }
    }

    let mut spliced = Vec::new();
    for child in &children {
        if let Some(t) = nodes.get_mut(child) {
            spliced.append(&mut t.brackets);
        }
    }

    // Second-highest reach among the children, for the capping bracket.
    let mut hi2 = depth;
    let mut node2 = Pseudo::unreached(depth);
    if self_child && highest_child.is_some() {
        hi2 = number_of(nodes, own_high);
        node2 = own_high;
    }
    for child in &children {
        if Some(*child) == highest_child {
            continue;
        }
        if let Some(t) = nodes.get(child) {
            let t_hi = number_of(nodes, t.high);
            if t_hi < hi2 {
                hi2 = t_hi;
                node2 = t.high;
            }
        }
    }

    let Some(me_node) = nodes.get_mut(&me) else {
        return;
    };
    me_node.brackets.append(&mut spliced);

    let here = Pseudo {
        block: Some(me),
        offset: dir,
    };
    me_node.brackets.retain(|b| b.back != here);

    for kind in &kinds {
        match *kind {
            EdgeKind::Back(pseudo, _) => me_node.brackets.push(Bracket::new(pseudo)),
            EdgeKind::Outside => me_node.brackets.push(Bracket::new(Pseudo::OUTSIDE)),
            EdgeKind::Child(..) | EdgeKind::Other => {}
        }
    }

    if me_node.brackets.is_empty() || edges.is_empty() {
        hi_back = 0;
        node_back = Pseudo::OUTSIDE;
        me_node.brackets.push(Bracket::new(node_back));
    }

    me_node.high = if hi_back < hi_child {
        node_back
    } else {
        node_child
    };

    // Capping bracket only when the second child reaches above every
    // back-edge, as in Johnson, Pearson and Pingali.
    if children.len() + usize::from(self_child) > 1 && hi2 < hi_back {
        me_node.brackets.push(Bracket::new(node2));
    }
}

/// Walk the function from its entry, opening a region at the first block
/// of a class and closing it at the last.
fn color_regions(func: &Function, nodes: &Nodes, mut counts: Vec<u32>) -> Result<Vec<SeseRegion>> {
    let mut colour: HashMap<BlockId, Option<usize>> =
        nodes.iter().map(|(&b, n)| (b, n.color)).collect();
    let mut regions: Vec<Option<(BlockId, Option<BlockId>)>> = vec![None; counts.len()];
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut stack: Vec<(BlockId, Option<usize>)> = vec![(func.entry(), None)];

    while let Some((block, mut coloring)) = stack.pop() {
        if !visited.insert(block) {
            let consistent = coloring.is_none() || colour.get(&block) == Some(&coloring);
            if !consistent {
                return Err(NeuterError::Sese {
                    block,
                    reason: "region re-entered under a different class",
                });
            }
            continue;
        }

        if let Some(slot) = colour.get_mut(&block) {
            let color = slot.ok_or(NeuterError::Sese {
                block,
                reason: "block was never classified",
            })?;
            if coloring.is_none() && counts[color] > 0 {
                regions[color] = Some((block, None));
                coloring = Some(color);
            }
            counts[color] = counts[color].saturating_sub(1);
            if counts[color] == 0 && coloring == Some(color) {
                if let Some(region) = regions[color].as_mut() {
                    region.1 = Some(block);
                }
                coloring = None;
            } else {
                *slot = coloring;
            }
        } else if coloring.is_some() {
            return Err(NeuterError::Sese {
                block,
                reason: "walk left the block set inside a region",
            });
        }

        let succs = func.succs(block);
        if succs.is_empty() && coloring.is_some() {
            return Err(NeuterError::Sese {
                block,
                reason: "function ends inside a region",
            });
        }
        for &succ in succs.iter().rev() {
            stack.push((succ, coloring));
        }
    }

    regions
        .into_iter()
        .flatten()
        .map(|(entry, exit)| {
            exit.map(|exit| SeseRegion { entry, exit })
                .ok_or(NeuterError::Sese {
                    block: entry,
                    reason: "region never closed",
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptx::PtxInstruction;

    /// Blocks plus edges; the last block returns
    fn graph(n: usize, edges: &[(usize, usize)]) -> (Function, Vec<BlockId>) {
        let mut func = Function::new("g");
        let mut blocks = vec![func.entry()];
        for _ in 1..n {
            blocks.push(func.add_block());
        }
        for &(a, b) in edges {
            func.add_edge(blocks[a], blocks[b]);
        }
        let ret = func.add_block();
        func.push(ret, PtxInstruction::ret());
        func.add_edge(blocks[n - 1], ret);
        (func, blocks)
    }

    fn pairs(regions: &[SeseRegion]) -> Vec<(BlockId, BlockId)> {
        regions.iter().map(|r| (r.entry, r.exit)).collect()
    }

    #[test]
    fn test_single_block() {
        let (func, b) = graph(1, &[]);
        let regions = find_sese(&func, &b).unwrap();
        assert_eq!(pairs(&regions), vec![(b[0], b[0])]);
    }

    #[test]
    fn test_chain_is_one_region() {
        let (func, b) = graph(3, &[(0, 1), (1, 2)]);
        let regions = find_sese(&func, &b).unwrap();
        assert_eq!(pairs(&regions), vec![(b[0], b[2])]);
    }

    #[test]
    fn test_diamond_is_one_region() {
        let (func, b) = graph(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let regions = find_sese(&func, &b).unwrap();
        assert_eq!(pairs(&regions), vec![(b[0], b[3])]);
    }

    #[test]
    fn test_loop_is_one_region() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let (func, b) = graph(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        let regions = find_sese(&func, &b).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(pairs(&regions), vec![(b[0], b[3])]);
    }

    #[test]
    fn test_while_loop_between_preheader_and_exit() {
        // 0 -> 1 -> 2 -> 1, 1 -> 3
        let (func, b) = graph(4, &[(0, 1), (1, 2), (2, 1), (1, 3)]);
        let regions = find_sese(&func, &b).unwrap();
        assert_eq!(pairs(&regions), vec![(b[0], b[3])]);
    }

    #[test]
    fn test_bare_while_loop_splits_header_from_body() {
        // header -> body -> header, header -> exit; only the loop is in
        // the set, and the header is cycle-equivalent to neither side
        let mut func = Function::new("g");
        let header = func.entry();
        let body = func.add_block();
        let exit = func.add_block();
        func.add_edge(header, body);
        func.add_edge(body, header);
        func.add_edge(header, exit);
        func.push(exit, PtxInstruction::ret());

        let regions = find_sese(&func, &[header, body]).unwrap();
        let found = pairs(&regions);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&(header, header)));
        assert!(found.contains(&(body, body)));
    }

    #[test]
    fn test_subset_split_by_outside_block() {
        // 0 -> 1 -> 2 where 1 is not in the set
        let (func, b) = graph(3, &[(0, 1), (1, 2)]);
        let regions = find_sese(&func, &[b[0], b[2]]).unwrap();
        assert_eq!(pairs(&regions).len(), 2);
        assert!(pairs(&regions).contains(&(b[0], b[0])));
        assert!(pairs(&regions).contains(&(b[2], b[2])));
    }

    #[test]
    fn test_two_diamonds_in_sequence() {
        let (func, b) = graph(
            7,
            &[(0, 1), (0, 2), (1, 3), (2, 3), (3, 4), (3, 5), (4, 6), (5, 6)],
        );
        let regions = find_sese(&func, &b).unwrap();
        // the whole sequence is single-entry single-exit
        assert_eq!(pairs(&regions), vec![(b[0], b[6])]);
    }

    #[test]
    fn test_early_exit_splits_region() {
        // 0 -> 1 -> 2, and 0 -> ret directly: 1 and 2 are not
        // cycle-equivalent with 0
        let (mut func, b) = graph(3, &[(0, 1), (1, 2)]);
        let out = func.add_block();
        func.push(out, PtxInstruction::ret());
        func.add_edge(b[0], out);
        let regions = find_sese(&func, &b).unwrap();
        let found = pairs(&regions);
        assert!(found.contains(&(b[1], b[2])));
        assert!(found.contains(&(b[0], b[0])));
    }
}
