//! The solid heightfield: a grid of columns, each an ordered list of
//! obstructed [`Span`]s.

use thiserror::Error;

use crate::{
    math::Aabb3d,
    span::{Span, SpanKey, Spans},
};

/// A dynamic heightfield representing obstructed space.
///
/// The grid is laid out on the xz-plane at `cell_size` resolution; span
/// floors and ceilings are multiples of `cell_height` above the AABB base.
/// Columns are ordered, non-overlapping span lists: for consecutive spans
/// `a` below `b` the invariant `a.min < a.max <= b.min` holds.
///
/// Built empty with [`HeightfieldBuilder`], populated by
/// [`Heightfield::rasterize_triangles`](crate::Heightfield::rasterize_triangles),
/// and consumed by [`Heightfield::into_compact`](crate::Heightfield::into_compact).
#[derive(Debug, Default, Clone)]
pub struct Heightfield {
    /// The width of the heightfield along the x-axis in cell units
    pub width: u16,
    /// The height of the heightfield along the z-axis in cell units
    pub height: u16,
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
    /// Keys of the lowest span of each column, in `width * height` order
    pub columns: Vec<Option<SpanKey>>,
    /// The arena holding all spans of the heightfield
    pub allocated_spans: Spans,
}

impl Heightfield {
    /// Inserts a span into its column, merging it with every overlapping
    /// span already present.
    ///
    /// The merged span covers the union of the vertical extents. When the
    /// ceilings of the merged spans lie within `flag_merge_threshold` cells
    /// of each other the higher area type wins; otherwise the incoming
    /// span's area replaces the old one, so the surface nearest the merged
    /// ceiling defines the area. Note that `new_span.max` has already been
    /// widened by earlier merges of the same call when this comparison
    /// runs, which makes the resulting area order-dependent for
    /// overlapping triangles with different areas. Callers that need
    /// determinism there should submit triangles in area-priority order.
    pub(crate) fn add_span(&mut self, insertion: SpanInsertion) -> Result<(), SpanInsertionError> {
        let column_index = self.column_index(insertion.x, insertion.z);
        if column_index >= self.columns.len() {
            return Err(SpanInsertionError::ColumnIndexOutOfBounds {
                x: insertion.x,
                z: insertion.z,
            });
        }

        let mut new_span = insertion.span;
        let mut previous_span_key = None;
        let mut current_span_key_iter = self.columns[column_index];
        while let Some(current_span_key) = current_span_key_iter {
            let current_span = self.span(current_span_key).clone();
            current_span_key_iter = current_span.next;
            if current_span.min > new_span.max {
                // Strictly above the new span; the insertion point is found.
                break;
            }
            if current_span.max < new_span.min {
                // Strictly below the new span; keep walking up.
                previous_span_key.replace(current_span_key);
                continue;
            }
            // Overlap: widen the new span to the union.
            if current_span.min < new_span.min {
                new_span.min = current_span.min;
            }
            if current_span.max > new_span.max {
                new_span.max = current_span.max;
            }

            if (new_span.max as i32 - current_span.max as i32).unsigned_abs()
                <= insertion.flag_merge_threshold as u32
            {
                new_span.area = new_span.area.max(current_span.area);
            }

            // The merged span replaces the current one. Keep going in case
            // the union swallowed further spans above.
            let next_key = current_span.next;
            self.allocated_spans.remove(current_span_key);
            if let Some(previous_span_key) = previous_span_key {
                self.span_mut(previous_span_key).next = next_key;
            } else {
                self.columns[column_index] = next_key;
            }
        }

        if let Some(previous_span_key) = previous_span_key {
            new_span.next = self.span(previous_span_key).next;
            let new_span_key = self.allocated_spans.insert(new_span);
            self.span_mut(previous_span_key).next = Some(new_span_key);
        } else {
            // New lowest span of the column.
            new_span.next = self.columns[column_index];
            let new_span_key = self.allocated_spans.insert(new_span);
            self.columns[column_index] = Some(new_span_key);
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn column_index(&self, x: u16, z: u16) -> usize {
        x as usize + z as usize * self.width as usize
    }

    #[inline]
    pub(crate) fn contains(&self, x: i32, z: i32) -> bool {
        x >= 0 && x < self.width as i32 && z >= 0 && z < self.height as i32
    }

    /// Returns the key of the lowest span in the column at the given
    /// coordinates, or `None` for an empty or out-of-bounds column.
    #[inline]
    pub fn span_key_at(&self, x: u16, z: u16) -> Option<SpanKey> {
        let column_index = self.column_index(x, z);
        *self.columns.get(column_index)?
    }

    /// Returns the lowest span in the column at the given coordinates.
    #[inline]
    pub fn span_at(&self, x: u16, z: u16) -> Option<&Span> {
        Some(self.span(self.span_key_at(x, z)?))
    }

    /// Returns a reference to the span with the given key.
    ///
    /// # Panics
    ///
    /// Panics if the key is stale.
    #[inline]
    pub fn span(&self, key: SpanKey) -> &Span {
        &self.allocated_spans[key]
    }

    /// Returns a mutable reference to the span with the given key.
    ///
    /// # Panics
    ///
    /// Panics if the key is stale.
    #[inline]
    pub fn span_mut(&mut self, key: SpanKey) -> &mut Span {
        &mut self.allocated_spans[key]
    }

    /// Iterates over the spans of the column at the given coordinates,
    /// bottom to top.
    pub fn column_spans(&self, x: u16, z: u16) -> impl Iterator<Item = &Span> {
        let mut key = self.span_key_at(x, z);
        core::iter::from_fn(move || {
            let span = self.span(key?);
            key = span.next;
            Some(span)
        })
    }

    /// The number of live spans in the heightfield.
    pub fn span_count(&self) -> usize {
        self.allocated_spans.len()
    }
}

/// A builder for [`Heightfield`]s.
pub struct HeightfieldBuilder {
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
}

impl HeightfieldBuilder {
    /// Builds an empty heightfield whose grid covers the AABB.
    pub fn build(self) -> Result<Heightfield, HeightfieldBuilderError> {
        if !(self.cell_size > 0.0) || !(self.cell_height > 0.0) {
            return Err(HeightfieldBuilderError::InvalidCellSize {
                cell_size: self.cell_size,
                cell_height: self.cell_height,
            });
        }
        let width = (self.aabb.max.x - self.aabb.min.x) / self.cell_size + 0.5;
        let height = (self.aabb.max.z - self.aabb.min.z) / self.cell_size + 0.5;
        let column_count = width as u128 * height as u128;
        if width > u16::MAX as f32 || height > u16::MAX as f32 || column_count > usize::MAX as u128
        {
            return Err(HeightfieldBuilderError::GridTooLarge { width, height });
        }
        let column_count = column_count as usize;
        Ok(Heightfield {
            width: width as u16,
            height: height as u16,
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            columns: vec![None; column_count],
            allocated_spans: Spans::with_min_capacity(column_count),
        })
    }
}

/// Errors that can occur when building a [`Heightfield`] with [`HeightfieldBuilder::build`].
#[derive(Error, Debug)]
pub enum HeightfieldBuilderError {
    /// The cell size or cell height is zero or negative.
    #[error("Cell sizes must be positive, got cell_size={cell_size}, cell_height={cell_height}")]
    InvalidCellSize {
        /// The xz-plane cell size.
        cell_size: f32,
        /// The y-axis cell size.
        cell_height: f32,
    },
    /// The grid does not fit the column index space.
    #[error("Grid of {width}x{height} cells is too large")]
    GridTooLarge {
        /// The width of the heightfield along the x-axis in cell units
        width: f32,
        /// The height of the heightfield along the z-axis in cell units
        height: f32,
    },
}

/// Errors that can occur when inserting a span into a [`Heightfield`]
#[derive(Error, Debug)]
pub enum SpanInsertionError {
    /// Happens when the column index is out of bounds.
    #[error("column index out of bounds: x={x}, z={z}")]
    ColumnIndexOutOfBounds {
        /// The x-coordinate of the span
        x: u16,
        /// The z-coordinate of the span
        z: u16,
    },
}

pub(crate) struct SpanInsertion {
    /// The x-coordinate of the span
    pub(crate) x: u16,
    /// The z-coordinate of the span
    pub(crate) z: u16,
    /// Maximum ceiling difference between two merged spans to merge area types
    pub(crate) flag_merge_threshold: u16,
    /// The span to insert
    pub(crate) span: Span,
}

#[cfg(test)]
mod tests {
    use glam::Vec3A;

    use crate::span::AreaType;

    use super::*;

    fn height_field() -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3A::ZERO, Vec3A::splat(5.0)),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap()
    }

    fn span(min: u16, max: u16, area: u8) -> Span {
        Span {
            min,
            max,
            area: AreaType(area),
            next: None,
        }
    }

    fn insert(heightfield: &mut Heightfield, x: u16, z: u16, span: Span) {
        heightfield
            .add_span(SpanInsertion {
                x,
                z,
                flag_merge_threshold: 1,
                span,
            })
            .unwrap();
    }

    fn column(heightfield: &Heightfield, x: u16, z: u16) -> Vec<(u16, u16, u8)> {
        heightfield
            .column_spans(x, z)
            .map(|s| (s.min, s.max, s.area.0))
            .collect()
    }

    #[test]
    fn rejects_out_of_bounds_column() {
        let mut heightfield = height_field();
        let result = heightfield.add_span(SpanInsertion {
            x: 0,
            z: 9,
            flag_merge_threshold: 0,
            span: span(0, 1, 0),
        });
        assert!(result.is_err());
    }

    #[test]
    fn keeps_disjoint_spans_ordered() {
        let mut heightfield = height_field();
        insert(&mut heightfield, 1, 3, span(7, 10, 2));
        insert(&mut heightfield, 1, 3, span(2, 4, 2));
        assert_eq!(column(&heightfield, 1, 3), vec![(2, 4, 2), (7, 10, 2)]);
        assert_eq!(heightfield.span_at(3, 1), None);
    }

    #[test]
    fn merges_overlapping_spans_into_union() {
        let mut heightfield = height_field();
        insert(&mut heightfield, 1, 3, span(2, 4, 1));
        insert(&mut heightfield, 1, 3, span(3, 7, 2));
        assert_eq!(column(&heightfield, 1, 3), vec![(2, 7, 2)]);
    }

    #[test]
    fn merge_swallows_multiple_spans() {
        let mut heightfield = height_field();
        insert(&mut heightfield, 0, 0, span(1, 2, 1));
        insert(&mut heightfield, 0, 0, span(4, 5, 1));
        insert(&mut heightfield, 0, 0, span(8, 9, 1));
        insert(&mut heightfield, 0, 0, span(2, 8, 1));
        assert_eq!(column(&heightfield, 0, 0), vec![(1, 9, 1)]);
        assert_eq!(heightfield.span_count(), 1);
    }

    #[test]
    fn higher_surface_keeps_its_area_when_ceilings_differ() {
        let mut heightfield = height_field();
        insert(&mut heightfield, 0, 0, span(0, 2, 9));
        // The new span tops out far above the old ceiling, so its area
        // defines the merged surface even though the old id is larger.
        insert(&mut heightfield, 0, 0, span(0, 8, 7));
        assert_eq!(column(&heightfield, 0, 0), vec![(0, 8, 7)]);
    }

    #[test]
    fn close_ceilings_merge_to_max_area() {
        let mut heightfield = height_field();
        insert(&mut heightfield, 0, 0, span(0, 4, 7));
        insert(&mut heightfield, 0, 0, span(0, 5, 2));
        assert_eq!(column(&heightfield, 0, 0), vec![(0, 5, 7)]);
    }

    #[test]
    fn column_invariant_holds_after_random_inserts() {
        let mut heightfield = height_field();
        // Deterministic pseudo-random insertions.
        let mut state = 0x2545_f491_u32;
        for _ in 0..200 {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            let min = (state >> 8) % 40;
            let max = min + 1 + (state >> 16) % 6;
            insert(&mut heightfield, 2, 2, span(min as u16, max as u16, 1));
        }
        let spans = column(&heightfield, 2, 2);
        for pair in spans.windows(2) {
            assert!(pair[0].0 < pair[0].1);
            assert!(pair[0].1 <= pair[1].0);
        }
    }
}
