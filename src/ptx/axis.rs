//! Parallelism Axes
//!
//! A kernel launch partitions threads along three axes. Only two of them
//! diverge inside a thread block and therefore need neutering:
//!
//! ```text
//! Independent  (blocks)        never synchronise, never neutered
//! Cooperative  (%tid.y groups) barrier + shared memory broadcast
//! Lockstep     (%tid.x lanes)  one warp, register shuffles
//! ```

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use super::registers::PtxReg;

/// One axis of parallelism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Thread blocks; no intra-block divergence
    Independent,
    /// Groups of warps inside a block; synchronise with `bar.sync`
    Cooperative,
    /// Lanes of one warp; execute in lockstep
    Lockstep,
}

impl Axis {
    /// Axes that are neutered, outermost first.
    ///
    /// Guards are emitted in this order so the lockstep test nests inside
    /// the cooperative one.
    pub const NEUTERED: [Self; 2] = [Self::Cooperative, Self::Lockstep];

    /// Single-axis mask
    #[must_use]
    pub const fn mask(self) -> AxisMask {
        match self {
            Self::Independent => AxisMask::INDEPENDENT,
            Self::Cooperative => AxisMask::COOPERATIVE,
            Self::Lockstep => AxisMask::LOCKSTEP,
        }
    }

    /// Hardware thread index distinguishing this axis' leader (index 0)
    #[must_use]
    pub const fn thread_index(self) -> Option<PtxReg> {
        match self {
            Self::Independent => None,
            Self::Cooperative => Some(PtxReg::TidY),
            Self::Lockstep => Some(PtxReg::TidX),
        }
    }

    /// Short name used in logs and labels
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Independent => "independent",
            Self::Cooperative => "cooperative",
            Self::Lockstep => "lockstep",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of axes, plus the call-boundary flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AxisMask(u8);

impl AxisMask {
    /// No axes
    pub const EMPTY: Self = Self(0);
    /// Independent axis bit
    pub const INDEPENDENT: Self = Self(1);
    /// Cooperative axis bit
    pub const COOPERATIVE: Self = Self(1 << 1);
    /// Lockstep axis bit
    pub const LOCKSTEP: Self = Self(1 << 2);
    /// Region brackets a call to a partitioned routine
    pub const CALL: Self = Self(1 << 3);
    /// Axes that diverge inside a block
    pub const PARTITIONED: Self = Self(Self::COOPERATIVE.0 | Self::LOCKSTEP.0);

    /// Build from raw bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b1111)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if no bit is set
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit is shared
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True if the axis bit is set
    #[must_use]
    pub const fn has(self, axis: Axis) -> bool {
        self.intersects(axis.mask())
    }

    /// Bits of `self` not in `other`
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Only the cooperative and lockstep bits
    #[must_use]
    pub const fn partitioned(self) -> Self {
        Self(self.0 & Self::PARTITIONED.0)
    }

    /// Call-boundary flag
    #[must_use]
    pub const fn is_call(self) -> bool {
        self.intersects(Self::CALL)
    }

    /// Neutered axes present in this mask, outermost first
    pub fn axes(self) -> impl Iterator<Item = Axis> {
        Axis::NEUTERED.into_iter().filter(move |axis| self.has(*axis))
    }
}

impl BitOr for AxisMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AxisMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AxisMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl From<Axis> for AxisMask {
    fn from(axis: Axis) -> Self {
        axis.mask()
    }
}

impl fmt::Display for AxisMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = [
            (Self::INDEPENDENT, "independent"),
            (Self::COOPERATIVE, "cooperative"),
            (Self::LOCKSTEP, "lockstep"),
            (Self::CALL, "call"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
