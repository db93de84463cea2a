//! Pass configuration and launch geometry.
//!
//! `NeuterConfig` toggles optional behaviour of the neutering pipeline.
//! `LaunchGeometry` describes how the enclosing kernel is launched; its
//! partition mask decides which axes are neutered at all.

use crate::error::{NeuterError, Result};
use crate::ptx::{Axis, AxisMask, MAX_THREADS_PER_BLOCK, WARP_SIZE};

/// Configuration for the neutering pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeuterConfig {
    /// Guard minimal single-entry single-exit regions instead of every
    /// block separately
    pub sese_regions: bool,
    /// Fold a region into its parent when the two differ only in axes
    pub merge_nested_regions: bool,
    /// Append `trap; exit;` after calls that never return
    pub terminate_noreturn_calls: bool,
}

impl NeuterConfig {
    /// Default configuration: every optimisation on
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sese_regions: true,
            merge_nested_regions: true,
            terminate_noreturn_calls: true,
        }
    }

    /// Neuter block by block
    #[must_use]
    pub const fn without_sese_regions(mut self) -> Self {
        self.sese_regions = false;
        self
    }

    /// Keep every nested region separate
    #[must_use]
    pub const fn without_nested_merge(mut self) -> Self {
        self.merge_nested_regions = false;
        self
    }

    /// Leave never-returning calls untouched
    #[must_use]
    pub const fn without_noreturn_traps(mut self) -> Self {
        self.terminate_noreturn_calls = false;
        self
    }
}

impl Default for NeuterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Extent of one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSize {
    /// Known at compile time
    Fixed(u32),
    /// Chosen at launch
    Runtime,
}

/// Size and participation of one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisDim {
    /// Extent
    pub size: AxisSize,
    /// Whether the axis may be partitioned at all
    pub participates: bool,
}

impl AxisDim {
    const UNIT: Self = Self {
        size: AxisSize::Fixed(1),
        participates: true,
    };

    /// True when more than one thread may exist along this axis
    #[must_use]
    pub const fn is_partitioned(self) -> bool {
        self.participates && !matches!(self.size, AxisSize::Fixed(1))
    }
}

/// Launch dimensions of the kernel being compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    dims: [AxisDim; 3],
}

impl LaunchGeometry {
    /// Single thread along every axis
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dims: [AxisDim::UNIT; 3],
        }
    }

    /// Typical worker/vector launch: `groups` cooperative groups of one
    /// full warp each
    #[must_use]
    pub fn cooperative(groups: u32) -> Self {
        Self::new()
            .with_size(Axis::Cooperative, AxisSize::Fixed(groups))
            .with_size(Axis::Lockstep, AxisSize::Fixed(WARP_SIZE))
    }

    /// One warp per block
    #[must_use]
    pub fn lockstep() -> Self {
        Self::new().with_size(Axis::Lockstep, AxisSize::Fixed(WARP_SIZE))
    }

    const fn slot(axis: Axis) -> usize {
        match axis {
            Axis::Independent => 0,
            Axis::Cooperative => 1,
            Axis::Lockstep => 2,
        }
    }

    /// Set an axis' extent
    #[must_use]
    pub fn with_size(mut self, axis: Axis, size: AxisSize) -> Self {
        self.dims[Self::slot(axis)].size = size;
        self
    }

    /// Exclude an axis from partitioning
    #[must_use]
    pub fn without(mut self, axis: Axis) -> Self {
        self.dims[Self::slot(axis)].participates = false;
        self
    }

    /// Extent and participation of an axis
    #[must_use]
    pub fn dim(&self, axis: Axis) -> AxisDim {
        self.dims[Self::slot(axis)]
    }

    /// Lower fixed sizes above the hardware limits, warning for each
    #[must_use]
    pub fn clamp(mut self) -> Self {
        if let AxisSize::Fixed(len) = self.dim(Axis::Lockstep).size {
            if len > WARP_SIZE {
                tracing::warn!(requested = len, limit = WARP_SIZE, "lockstep length clamped to warp size");
                self = self.with_size(Axis::Lockstep, AxisSize::Fixed(WARP_SIZE));
            }
        }
        let lanes = match self.dim(Axis::Lockstep).size {
            AxisSize::Fixed(len) => len.max(1),
            AxisSize::Runtime => WARP_SIZE,
        };
        let limit = MAX_THREADS_PER_BLOCK / lanes;
        if let AxisSize::Fixed(groups) = self.dim(Axis::Cooperative).size {
            if groups > limit {
                tracing::warn!(requested = groups, limit, "cooperative group count clamped");
                self = self.with_size(Axis::Cooperative, AxisSize::Fixed(limit));
            }
        }
        self
    }

    /// Axes that must be neutered.
    ///
    /// An axis is partitioned when it participates and its size is not
    /// fixed at one. Cooperative partitioning needs lockstep partitioning
    /// too: a group leader is a whole warp, whose other lanes still have
    /// to be kept idle.
    pub fn partition_mask(&self) -> Result<AxisMask> {
        let mut mask = AxisMask::EMPTY;
        for axis in [Axis::Independent, Axis::Cooperative, Axis::Lockstep] {
            let dim = self.dim(axis);
            if dim.size == AxisSize::Fixed(0) {
                return Err(NeuterError::InvalidGeometry(format!(
                    "{} axis has size 0",
                    axis
                )));
            }
            if dim.is_partitioned() {
                mask |= axis.mask();
            }
        }
        if mask.has(Axis::Cooperative) && !mask.has(Axis::Lockstep) {
            return Err(NeuterError::InvalidGeometry(
                "cooperative axis partitioned without lockstep axis".to_string(),
            ));
        }
        Ok(mask)
    }
}

impl Default for LaunchGeometry {
    fn default() -> Self {
        Self::new()
    }
}
