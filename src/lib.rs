//! # trueno-simt: SIMT Divergence Management for PTX
//!
//! Lowers structured parallel regions to code that is correct on SIMT
//! hardware: outside a region only one leader thread per axis runs, the
//! others are jumped over it by guard branches; at each region boundary
//! the leader's live state is broadcast to every thread; reductions are
//! expanded into shuffle loops and atomic updates.
//!
//! ## Quick Start
//!
//! ```rust
//! use trueno_simt::ptx::{AxisMask, Function, MarkerKind, Operand, PtxInstruction, PtxType};
//! use trueno_simt::{compile_function, CodegenContext, LaunchGeometry, NeuterConfig};
//!
//! // x = 1; lockstep region { x += 1 }; ret
//! let mut func = Function::new("kernel");
//! let b = func.entry();
//! let x = func.alloc_reg(PtxType::U32);
//! func.push(b, PtxInstruction::mov(x, Operand::ImmU64(1)));
//! func.push(b, PtxInstruction::marker(MarkerKind::PreEnter, AxisMask::LOCKSTEP));
//! func.push(b, PtxInstruction::marker(MarkerKind::Enter, AxisMask::LOCKSTEP));
//! func.push(b, PtxInstruction::mov(x, Operand::Reg(x)));
//! func.push(b, PtxInstruction::marker(MarkerKind::PreLeave, AxisMask::LOCKSTEP));
//! func.push(b, PtxInstruction::marker(MarkerKind::Leave, AxisMask::LOCKSTEP));
//! func.push(b, PtxInstruction::ret());
//!
//! let mut ctx = CodegenContext::new();
//! let report = compile_function(
//!     &mut func,
//!     &mut ctx,
//!     &LaunchGeometry::lockstep(),
//!     &NeuterConfig::default(),
//! )?;
//! assert_eq!(report.neuter.propagations.len(), 1);
//! assert!(ctx.finalize().is_empty());
//! # Ok::<(), trueno_simt::NeuterError>(())
//! ```
//!
//! ## Modules
//!
//! - [`ptx`] - CFG and instruction IR the passes rewrite
//! - [`neuter`] - block splitting, region tree, SESE, propagation, guards
//! - [`reduction`] - four-phase reduction expansion
//! - [`context`] - compilation-unit buffers shared by every function
//! - [`config`] - pass toggles and launch geometry

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
// Allow possible truncation - offsets and counts fit in 32 bits
#![allow(clippy::cast_possible_truncation)]
// Allow possible wrap - buffer offsets are far below i32::MAX
#![allow(clippy::cast_possible_wrap)]
// Allow cast_sign_loss - we know values are positive
#![allow(clippy::cast_sign_loss)]
// Allow doc markdown for PTX mnemonics
#![allow(clippy::doc_markdown)]
// Allow module name repetitions - NeuterConfig, NeuterReport read better
#![allow(clippy::module_name_repetitions)]
// Allow uninlined format args - stylistic preference
#![allow(clippy::uninlined_format_args)]
// Allow too_many_lines - pass drivers are long match ladders
#![allow(clippy::too_many_lines)]
// Allow unwrap_used in tests
#![allow(clippy::unwrap_used)]
// Allow panic in tests and the test interpreter
#![allow(clippy::panic)]
// Allow float_cmp in tests where exact comparison is intended
#![allow(clippy::float_cmp)]

pub mod config;
pub mod context;
pub mod neuter;
pub mod ptx;
pub mod reduction;

/// Error types for trueno-simt passes
pub mod error;

pub use config::{AxisDim, AxisSize, LaunchGeometry, NeuterConfig};
pub use context::{BufferDecl, CodegenContext, SharedBuffer};
pub use error::{NeuterError, Result};
pub use neuter::{neuter_function, NeuterReport};
pub use reduction::{expand_reductions, ReductionReport};

use tracing::instrument;

use ptx::{AxisMask, Function};

/// Everything the pipeline did to one function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileReport {
    /// Axes the launch partitions
    pub modes: AxisMask,
    /// Reduction expansion
    pub reductions: ReductionReport,
    /// Guards, broadcasts and barriers
    pub neuter: NeuterReport,
}

/// Run the full divergence-management pipeline on one function.
///
/// Reductions are expanded first, since they add blocks, then the
/// function is neutered for the axes `geometry` partitions. Buffer
/// requirements accumulate in `ctx`; call [`CodegenContext::finalize`]
/// after the last function of the unit.
///
/// # Errors
///
/// Returns an error for an invalid launch geometry, a malformed
/// reduction call site or malformed region markers.
#[instrument(skip_all, fields(function = %func.name()))]
pub fn compile_function(
    func: &mut Function,
    ctx: &mut CodegenContext,
    geometry: &LaunchGeometry,
    config: &NeuterConfig,
) -> Result<CompileReport> {
    let modes = geometry.partition_mask()?;
    let reductions = expand_reductions(func, ctx)?;
    let neuter = neuter_function(func, ctx, modes, config)?;
    ctx.record_function();

    tracing::debug!(
        %modes,
        reductions = reductions.expanded,
        guards = neuter.guards.len(),
        barriers = neuter.barriers,
        "function compiled"
    );
    Ok(CompileReport {
        modes,
        reductions,
        neuter,
    })
}
