//! Region identifiers assigned to compact spans by the partitioning stage.

use core::ops::{Add, AddAssign};

/// The id of a region in a [`CompactHeightfield`](crate::CompactHeightfield).
///
/// Non-zero ids without the border bit identify regular regions; ids with
/// [`RegionId::BORDER_REGION`] set mark the padding ring painted around the
/// grid edge, whose spans never produce contours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RegionId(u16);

bitflags::bitflags! {
    impl RegionId: u16 {
        /// No region. Spans with this id are not walkable or not yet assigned.
        const NONE = 0;
        /// Marks the region as part of the grid border ring.
        const BORDER_REGION = 0x8000;
        /// The maximum representable region id.
        const MAX = u16::MAX;
    }
}

impl Add<u16> for RegionId {
    type Output = Self;
    fn add(self, other: u16) -> Self::Output {
        RegionId::from(self.bits() + other)
    }
}

impl AddAssign<u16> for RegionId {
    fn add_assign(&mut self, other: u16) {
        *self = RegionId::from(self.bits() + other);
    }
}

impl Default for RegionId {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u16> for RegionId {
    fn from(value: u16) -> Self {
        RegionId::from_bits_retain(value)
    }
}
