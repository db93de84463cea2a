//! Error types for trueno-simt passes
//!
//! Every variant is an internal-consistency failure: the front end handed
//! over a CFG whose markers, edges or call sites break the contract the
//! passes rely on. Callers treat them as fatal for the compilation unit.

use thiserror::Error;

use crate::ptx::{AxisMask, BlockId};

/// Result type alias for trueno-simt operations
pub type Result<T> = std::result::Result<T, NeuterError>;

/// Errors raised while building, neutering or expanding a function
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NeuterError {
    /// Region entered but never left on some path
    #[error("region entered in {block} is never left")]
    UnclosedRegion {
        /// Block holding the enter marker
        block: BlockId,
    },

    /// Leave marker with no open region
    #[error("leave marker in {block} has no open region")]
    UnmatchedLeave {
        /// Block holding the leave marker
        block: BlockId,
    },

    /// Leave mask differs from the mask the region was entered with
    #[error("leave marker in {block} closes {left} but the open region is {entered}")]
    MaskMismatch {
        /// Block holding the leave marker
        block: BlockId,
        /// Mask of the open region
        entered: AxisMask,
        /// Mask on the leave marker
        left: AxisMask,
    },

    /// Enter marker with no axis
    #[error("enter marker in {block} partitions no axis")]
    EmptyRegionMask {
        /// Block holding the enter marker
        block: BlockId,
    },

    /// An axis partitioned again inside a region already partitioning it
    #[error("region at {block} re-partitions {axes} already partitioned by an enclosing region")]
    AxisRepartitioned {
        /// Forked block of the offending region
        block: BlockId,
        /// Axes partitioned twice
        axes: AxisMask,
    },

    /// Preamble marker missing from the predecessor of a boundary block
    #[error("expected {kind} marker ending the single predecessor of {block}")]
    MissingPreamble {
        /// Boundary block
        block: BlockId,
        /// Marker kind expected
        kind: &'static str,
    },

    /// Boundary block with an unexpected edge shape
    #[error("malformed region boundary at {block}: {reason}")]
    MalformedBoundary {
        /// Offending block
        block: BlockId,
        /// What was wrong
        reason: &'static str,
    },

    /// Cycle-equivalence colouring reached an inconsistent state
    #[error("SESE analysis failed at {block}: {reason}")]
    Sese {
        /// Block being visited
        block: BlockId,
        /// What was wrong
        reason: &'static str,
    },

    /// Launch geometry rejected
    #[error("Invalid launch geometry: {0}")]
    InvalidGeometry(String),

    /// Reduction call site malformed
    #[error("Invalid reduction: {0}")]
    InvalidReduction(String),

    /// Call site operand count differs from the declared count
    #[error("argument count mismatch: expected {expected}, got {actual}")]
    ArgumentCount {
        /// Declared operand count
        expected: usize,
        /// Operands present
        actual: usize,
    },
}
