//! Block Splitter
//!
//! Makes every region boundary start its own basic block. After this pass
//! an `Enter`/`Leave` marker or a `ret` is always the first instruction of
//! its block, so the region tree can be read off whole blocks.

use std::collections::BTreeMap;

use crate::ptx::{BlockId, Function, InsnId};

/// Blocks headed by a boundary instruction, and that instruction
pub type BlockMarkers = BTreeMap<BlockId, InsnId>;

/// Split blocks at boundary instructions.
///
/// A boundary that already heads its block stays put. Any later boundary
/// in the same block starts a new block, and scanning continues in that
/// new block, so a block holding several markers is cut once per marker.
pub fn split_blocks(func: &mut Function) -> BlockMarkers {
    let mut markers = BlockMarkers::new();
    let mut worklist: Vec<(BlockId, InsnId)> = Vec::new();

    for &block in func.layout() {
        let mut seen_insn = false;
        for &insn in func.insns(block) {
            if func.insn(insn).boundary().is_some() {
                if seen_insn {
                    worklist.push((block, insn));
                } else {
                    markers.insert(block, insn);
                }
            }
            seen_insn = true;
        }
    }

    // Splits of one original block chain: each cut targets the previous tail.
    let mut current: Option<(BlockId, BlockId)> = None;
    for (block, insn) in worklist {
        let source = match current {
            Some((orig, tail)) if orig == block => tail,
            _ => block,
        };
        let tail = func.split_block(source, insn);
        tracing::trace!(%source, %tail, %insn, "split at region boundary");
        markers.insert(tail, insn);
        current = Some((block, tail));
    }

    tracing::debug!(function = func.name(), boundaries = markers.len(), "blocks split");
    markers
}
