//! Solid spans: contiguous vertical runs of obstructed voxels in one column.
//!
//! Spans live in a [`Spans`] arena and chain upwards through their `next`
//! keys, so a column is an ordered singly-linked list rooted in the
//! heightfield's column table.

use core::ops::{Deref, DerefMut};
use slotmap::SlotMap;

slotmap::new_key_type! {
    /// A key for a span in [`Spans`].
    pub struct SpanKey;
}

/// The arena holding every span of one [`Heightfield`](crate::Heightfield).
///
/// Removed spans return to the slotmap's internal freelist, so repeated
/// merging during rasterization does not grow the arena.
#[derive(Debug, Default, Clone)]
pub struct Spans(SlotMap<SpanKey, Span>);

impl Deref for Spans {
    type Target = SlotMap<SpanKey, Span>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Spans {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Spans {
    const DEFAULT_CAPACITY: usize = 1024;

    pub(crate) fn with_min_capacity(min_capacity: usize) -> Self {
        let capacity = min_capacity.max(Self::DEFAULT_CAPACITY);
        Self(SlotMap::with_capacity_and_key(capacity))
    }
}

/// A solid span in a heightfield column.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Span {
    /// Height of the span floor, in cell units from the heightfield base.
    pub min: u16,
    /// Height of the span ceiling. Always `> min`.
    pub max: u16,
    /// Area type of the surface at `max`.
    pub area: AreaType,
    /// The next-higher span in the same column.
    pub next: Option<SpanKey>,
}

impl Span {
    pub(crate) const MAX_HEIGHT: u16 = u16::MAX;
}

/// The area type of a walkable surface.
///
/// `0` ([`AreaType::NOT_WALKABLE`]) and [`u8::MAX`] ([`AreaType::DEFAULT_WALKABLE`])
/// are reserved; everything in between is free for user-defined areas, e.g.
/// to assign traversal costs. When overlapping spans are merged, the higher
/// area type wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AreaType(pub u8);

impl Deref for AreaType {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for AreaType {
    fn default() -> Self {
        Self::NOT_WALKABLE
    }
}

impl From<u8> for AreaType {
    fn from(value: u8) -> Self {
        AreaType(value)
    }
}

impl AreaType {
    /// The null area. Spans and triangles with this area are not walkable.
    pub const NOT_WALKABLE: Self = Self(0);
    /// The default area assigned to walkable triangles by slope tagging.
    pub const DEFAULT_WALKABLE: Self = Self(u8::MAX);

    /// Returns whether the area type is walkable.
    #[inline]
    pub fn is_walkable(&self) -> bool {
        self != &Self::NOT_WALKABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_merge_prefers_higher_id() {
        let a = AreaType(3);
        let b = AreaType(7);
        assert_eq!(a.max(b), b);
        assert!(b.is_walkable());
        assert!(!AreaType::NOT_WALKABLE.is_walkable());
    }

    #[test]
    fn spans_chain_through_arena_keys() {
        let mut spans = Spans::with_min_capacity(4);
        let upper = spans.insert(Span {
            min: 7,
            max: 9,
            area: AreaType::DEFAULT_WALKABLE,
            next: None,
        });
        let lower = spans.insert(Span {
            min: 2,
            max: 4,
            area: AreaType(1),
            next: Some(upper),
        });
        assert_eq!(spans[lower].next, Some(upper));
        assert_eq!(spans[upper].max, 9);

        spans.remove(upper);
        assert!(spans.get(upper).is_none());
    }
}
