//! Divergence Neutering
//!
//! Rewrites a function so code inside a partitioned region runs on every
//! thread of the region's axes, while code outside it runs on one leader
//! thread per axis and the leader's state is broadcast at each boundary.
//!
//! ## Pipeline
//!
//! ```text
//! split_blocks      boundaries head their own block
//! RegionTree        nesting of Enter/Leave pairs, block ownership
//! merge_nested      fold single-child regions into their parent
//! Liveness          live-in registers of every forked block
//! propagate (up)    broadcast live state into each region
//! neuter (down)     guard or skip per axis, SESE ranges
//! finish            leader predicates at the entry head
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_simt::context::CodegenContext;
//! use trueno_simt::neuter::neuter_function;
//! use trueno_simt::ptx::{AxisMask, Function, Operand, PtxInstruction, PtxType};
//! use trueno_simt::NeuterConfig;
//!
//! let mut func = Function::new("kernel");
//! let entry = func.entry();
//! let x = func.alloc_reg(PtxType::U32);
//! func.push(entry, PtxInstruction::mov(x, Operand::ImmU64(7)));
//! func.push(entry, PtxInstruction::ret());
//!
//! let mut ctx = CodegenContext::new();
//! let report = neuter_function(&mut func, &mut ctx, AxisMask::LOCKSTEP, &NeuterConfig::default())?;
//! assert_eq!(report.guards.len(), 1);
//! # Ok::<(), trueno_simt::NeuterError>(())
//! ```

mod engine;
mod propagate;
mod region;
mod sese;
mod split;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{BoundaryPropagation, GuardRegion, NeuterReport, Neuterer};
pub(crate) use propagate::shuffle;
pub use propagate::{
    propagate, PropagateMode, Propagated, Propagator, SharedBroadcast, WarpBroadcast,
};
pub use region::{Region, RegionId, RegionTree};
pub use sese::{find_sese, SeseRegion};
pub use split::{split_blocks, BlockMarkers};

use tracing::instrument;

use crate::config::NeuterConfig;
use crate::context::CodegenContext;
use crate::error::Result;
use crate::ptx::{AxisMask, Function, Liveness, PtxInstruction, PtxOp, PtxType};

/// Follow every never-returning call with `trap; exit;`.
///
/// Returns the number of calls terminated.
pub fn terminate_noreturn_calls(func: &mut Function) -> usize {
    let calls: Vec<_> = func
        .iter_insns()
        .filter(|&(_, insn)| func.insn(insn).is_noreturn_call())
        .map(|(_, insn)| insn)
        .collect();
    for &call in &calls {
        let trap = func.insert_after(call, PtxInstruction::new(PtxOp::Trap, PtxType::B32));
        func.insert_after(trap, PtxInstruction::new(PtxOp::Exit, PtxType::B32));
    }
    calls.len()
}

/// Run the whole neutering pipeline on one function.
///
/// `modes` is the launch's partition mask: axes outside it are never
/// guarded. Shared buffer requirements are recorded in `ctx`.
///
/// # Errors
///
/// Returns an error when the region markers are malformed or a boundary
/// block has an edge shape the passes cannot guard.
#[instrument(skip_all, fields(function = %func.name(), modes = %modes))]
pub fn neuter_function(
    func: &mut Function,
    ctx: &mut CodegenContext,
    modes: AxisMask,
    config: &NeuterConfig,
) -> Result<NeuterReport> {
    let markers = split_blocks(func);
    let mut tree = RegionTree::build(func, &markers)?;
    if config.merge_nested_regions {
        let merged = tree.merge_nested(func);
        if merged > 0 {
            tracing::debug!(merged, "nested regions merged");
        }
    }
    tree.compute_inner_masks()?;
    let liveness = Liveness::compute(func);

    let mut engine = Neuterer::new(func, &tree, ctx, config);
    engine.propagate_boundaries(&liveness)?;
    engine.neuter(modes)?;
    let mut report = engine.finish();

    if config.terminate_noreturn_calls {
        report.noreturn_traps = terminate_noreturn_calls(func);
    }

    tracing::debug!(
        regions = tree.len(),
        guards = report.guards.len(),
        propagations = report.propagations.len(),
        barriers = report.barriers,
        "function neutered"
    );
    Ok(report)
}
