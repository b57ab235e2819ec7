//! Rasterization of triangles into a [`Heightfield`].
//!
//! Each triangle is clipped against the z-rows and x-columns of the grid it
//! touches; the clipped fragment's vertical extent becomes a solid span.

use glam::Vec3A;
use thiserror::Error;

use crate::{
    heightfield::{Heightfield, SpanInsertion, SpanInsertionError},
    math::TriangleVertices as _,
    span::Span,
    trimesh::TriMesh,
};

impl Heightfield {
    /// Rasterizes all triangles of a [`TriMesh`] into the heightfield.
    ///
    /// `flag_merge_threshold` is the maximum ceiling difference, in cells,
    /// for two merged spans to merge their area types; it is conventionally
    /// the walkable climb.
    pub fn rasterize_triangles(
        &mut self,
        trimesh: &TriMesh,
        flag_merge_threshold: u16,
    ) -> Result<(), RasterizationError> {
        for (i, triangle) in trimesh.indices.iter().enumerate() {
            let triangle = [
                trimesh.vertices[triangle[0] as usize],
                trimesh.vertices[triangle[1] as usize],
                trimesh.vertices[triangle[2] as usize],
            ];
            let area_type = trimesh.area_types[i];
            self.rasterize_triangle(triangle, area_type, flag_merge_threshold)?;
        }
        Ok(())
    }

    /// Rasterizes one triangle. Triangles outside the heightfield AABB
    /// contribute nothing.
    pub fn rasterize_triangle(
        &mut self,
        triangle: [Vec3A; 3],
        area_type: crate::AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), RasterizationError> {
        let triangle_aabb = triangle.aabb();
        if !self.aabb.intersects(&triangle_aabb) {
            return Ok(());
        }

        let inverse_cell_size = 1.0 / self.cell_size;
        let inverse_cell_height = 1.0 / self.cell_height;

        let w = self.width as i32;
        let h = self.height as i32;
        let field_height = self.aabb.max.y - self.aabb.min.y;

        // The z-rows the triangle footprint touches. -1 on the low side so
        // the fragment entering the grid from below is clipped correctly.
        let z0 = ((triangle_aabb.min.z - self.aabb.min.z) * inverse_cell_size) as i32;
        let z1 = ((triangle_aabb.max.z - self.aabb.min.z) * inverse_cell_size) as i32;
        if z1 < 0 || z0 >= h {
            return Ok(());
        }
        let z0 = z0.clamp(-1, h - 1);
        let z1 = z1.clamp(0, h - 1);

        // Clipping a triangle by two parallel planes yields at most 7
        // vertices; four scratch polygons cover the row/column ping-pong.
        const MAX_CLIPPED_VERTS: usize = 7;
        let mut buf = [Vec3A::ZERO; MAX_CLIPPED_VERTS * 4];
        let (mut remaining, rest) = buf.split_at_mut(MAX_CLIPPED_VERTS);
        let (mut row, rest) = rest.split_at_mut(MAX_CLIPPED_VERTS);
        let (cell, mut scratch) = rest.split_at_mut(MAX_CLIPPED_VERTS);

        remaining[..3].copy_from_slice(&triangle);
        let mut remaining_count = 3_usize;

        for z in z0..=z1 {
            // Split off the part of the polygon inside this row.
            let row_max_z = self.aabb.min.z + (z + 1) as f32 * self.cell_size;
            let (row_count, rest_count) = divide_poly(
                &remaining[..remaining_count],
                row,
                scratch,
                row_max_z,
                DivisionAxis::Z,
            )?;
            core::mem::swap(&mut remaining, &mut scratch);
            remaining_count = rest_count;

            if row_count < 3 || z < 0 {
                continue;
            }

            let mut min_x = row[0].x;
            let mut max_x = row[0].x;
            for vert in &row[1..row_count] {
                min_x = min_x.min(vert.x);
                max_x = max_x.max(vert.x);
            }
            let x0 = ((min_x - self.aabb.min.x) * inverse_cell_size) as i32;
            let x1 = ((max_x - self.aabb.min.x) * inverse_cell_size) as i32;
            if x1 < 0 || x0 >= w {
                continue;
            }
            let x0 = x0.clamp(-1, w - 1);
            let x1 = x1.clamp(0, w - 1);

            let mut row_count = row_count;
            for x in x0..=x1 {
                // Split off the part of the row inside this column.
                let cell_max_x = self.aabb.min.x + (x + 1) as f32 * self.cell_size;
                let (cell_count, rest_count) = divide_poly(
                    &row[..row_count],
                    cell,
                    scratch,
                    cell_max_x,
                    DivisionAxis::X,
                )?;
                core::mem::swap(&mut row, &mut scratch);
                row_count = rest_count;

                if cell_count < 3 || x < 0 {
                    continue;
                }

                let mut span_min = cell[0].y;
                let mut span_max = span_min;
                for vert in &cell[1..cell_count] {
                    span_min = span_min.min(vert.y);
                    span_max = span_max.max(vert.y);
                }
                span_min -= self.aabb.min.y;
                span_max -= self.aabb.min.y;
                if span_max < 0.0 || span_min > field_height {
                    continue;
                }
                let span_min = span_min.max(0.0);
                let span_max = span_max.min(field_height);

                // Snap to the height grid, keeping at least one cell of
                // thickness so thin surfaces still produce a span.
                let min_cell = ((span_min * inverse_cell_height).floor() as u16)
                    .clamp(0, Span::MAX_HEIGHT - 1);
                let max_cell = ((span_max * inverse_cell_height).ceil() as u16)
                    .clamp(min_cell + 1, Span::MAX_HEIGHT);

                self.add_span(SpanInsertion {
                    x: x as u16,
                    z: z as u16,
                    flag_merge_threshold,
                    span: Span {
                        min: min_cell,
                        max: max_cell,
                        area: area_type,
                        next: None,
                    },
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum DivisionAxis {
    X = 0,
    Z = 2,
}

/// Splits a convex polygon along an axis-aligned plane. Writes the part on
/// the negative side of `axis_offset` into `below` and the rest into
/// `above`, returning both vertex counts.
fn divide_poly(
    in_verts: &[Vec3A],
    below: &mut [Vec3A],
    above: &mut [Vec3A],
    axis_offset: f32,
    axis: DivisionAxis,
) -> Result<(usize, usize), PolygonDivisionError> {
    if in_verts.len() > 7 {
        return Err(PolygonDivisionError::TooManyVertices(in_verts.len()));
    }
    if in_verts.is_empty() {
        return Err(PolygonDivisionError::NoVertices);
    }
    let axis = axis as usize;

    // Signed distance of every vertex to the splitting plane.
    let mut deltas = [0.0_f32; 7];
    for (delta, vert) in deltas.iter_mut().zip(in_verts) {
        *delta = axis_offset - vert[axis];
    }

    let mut below_count = 0;
    let mut above_count = 0;
    let mut b = in_verts.len() - 1;
    for a in 0..in_verts.len() {
        let same_side = (deltas[a] >= 0.0) == (deltas[b] >= 0.0);
        if !same_side {
            // The edge crosses the plane; both halves gain the crossing point.
            let s = deltas[b] / (deltas[b] - deltas[a]);
            below[below_count] = in_verts[b] + (in_verts[a] - in_verts[b]) * s;
            above[above_count] = below[below_count];
            below_count += 1;
            above_count += 1;

            // Vertices exactly on the plane were just added; skip them here.
            if deltas[a] > 0.0 {
                below[below_count] = in_verts[a];
                below_count += 1;
            } else if deltas[a] < 0.0 {
                above[above_count] = in_verts[a];
                above_count += 1;
            }
        } else {
            if deltas[a] >= 0.0 {
                below[below_count] = in_verts[a];
                below_count += 1;
                if deltas[a] != 0.0 {
                    b = a;
                    continue;
                }
            }
            above[above_count] = in_verts[a];
            above_count += 1;
        }
        b = a;
    }

    Ok((below_count, above_count))
}

/// Errors that can occur when rasterizing triangles with
/// [`Heightfield::rasterize_triangles`].
#[derive(Error, Debug)]
pub enum RasterizationError {
    /// Happens when the polygon division fails.
    #[error("Failed to rasterize triangle: {0}")]
    PolygonDivision(#[from] PolygonDivisionError),
    /// Happens when the span insertion fails.
    #[error("Failed to add span: {0}")]
    SpanInsertion(#[from] SpanInsertionError),
}

/// Errors that can occur when splitting a clipped triangle fragment.
#[derive(Error, Debug)]
pub enum PolygonDivisionError {
    /// The fragment has more vertices than two-plane clipping can produce.
    #[error("Clipped fragment has too many vertices: {0}")]
    TooManyVertices(usize),
    /// The fragment is empty.
    #[error("Clipped fragment has no vertices")]
    NoVertices,
}

#[cfg(test)]
mod tests {
    use glam::Vec3A;

    use crate::{AreaType, HeightfieldBuilder, math::Aabb3d};

    use super::*;

    fn grid(size: f32) -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3A::new(0.0, 0.0, 0.0), Vec3A::new(size, 4.0, size)),
            cell_size: 1.0,
            cell_height: 0.5,
        }
        .build()
        .unwrap()
    }

    fn quad(size: f32, y: f32) -> [[Vec3A; 3]; 2] {
        let a = Vec3A::new(0.0, y, 0.0);
        let b = Vec3A::new(size, y, 0.0);
        let c = Vec3A::new(size, y, size);
        let d = Vec3A::new(0.0, y, size);
        [[a, d, c], [a, c, b]]
    }

    #[test]
    fn flat_quad_fills_every_column() {
        let mut heightfield = grid(4.0);
        for triangle in quad(4.0, 1.0) {
            heightfield
                .rasterize_triangle(triangle, AreaType::DEFAULT_WALKABLE, 1)
                .unwrap();
        }
        for z in 0..4 {
            for x in 0..4 {
                let spans: Vec<_> = heightfield.column_spans(x, z).collect();
                assert_eq!(spans.len(), 1, "column ({x}, {z})");
                // y=1.0 lands exactly on cell 2 of the 0.5 grid; the span
                // is padded to one cell of thickness.
                assert_eq!(spans[0].min, 2);
                assert_eq!(spans[0].max, 3);
                assert_eq!(spans[0].area, AreaType::DEFAULT_WALKABLE);
            }
        }
    }

    #[test]
    fn triangle_outside_bounds_adds_nothing() {
        let mut heightfield = grid(4.0);
        let triangle = [
            Vec3A::new(10.0, 0.0, 10.0),
            Vec3A::new(11.0, 0.0, 10.0),
            Vec3A::new(10.0, 0.0, 11.0),
        ];
        heightfield
            .rasterize_triangle(triangle, AreaType::DEFAULT_WALKABLE, 1)
            .unwrap();
        assert_eq!(heightfield.span_count(), 0);
    }

    #[test]
    fn partially_overlapping_triangle_is_clipped() {
        let mut heightfield = grid(4.0);
        // One vertex inside the grid, two outside on the -x side.
        let triangle = [
            Vec3A::new(1.5, 1.0, 1.5),
            Vec3A::new(-3.0, 1.0, 0.5),
            Vec3A::new(-3.0, 1.0, 2.5),
        ];
        heightfield
            .rasterize_triangle(triangle, AreaType::DEFAULT_WALKABLE, 1)
            .unwrap();
        assert!(heightfield.span_count() > 0);
        // Nothing may land outside the clipped footprint.
        for z in 0..4 {
            for x in 0..4 {
                if heightfield.span_at(x, z).is_some() {
                    assert!(x <= 1, "unexpected span at ({x}, {z})");
                }
            }
        }
    }

    #[test]
    fn degenerate_triangle_is_harmless() {
        let mut heightfield = grid(4.0);
        let p = Vec3A::new(1.0, 1.0, 1.0);
        heightfield
            .rasterize_triangle([p, p, p], AreaType::DEFAULT_WALKABLE, 1)
            .unwrap();
        // A zero-area triangle still occupies its cell conservatively.
        assert!(heightfield.span_count() <= 1);
    }

    #[test]
    fn sloped_triangle_spans_rise_with_the_slope() {
        let mut heightfield = grid(4.0);
        let triangle = [
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 4.0),
            Vec3A::new(4.0, 2.0, 2.0),
        ];
        heightfield
            .rasterize_triangle(triangle, AreaType::DEFAULT_WALKABLE, 1)
            .unwrap();
        let low = heightfield.span_at(0, 1).unwrap();
        let high = heightfield.span_at(3, 1).unwrap();
        assert!(high.max > low.max);
    }
}
