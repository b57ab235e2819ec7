//! The distance-to-boundary field feeding watershed partitioning.

use crate::CompactHeightfield;

impl CompactHeightfield {
    /// Computes for every span its (2, 3)-chamfer distance to the nearest
    /// area boundary, stores the box-blurred field in
    /// [`CompactHeightfield::dist`] and the pre-blur maximum in
    /// [`CompactHeightfield::max_distance`].
    ///
    /// A span seeds the transform when any of its four directions is
    /// unconnected or leads to a span of a different area type.
    pub fn build_distance_field(&mut self) {
        let mut src = vec![u16::MAX; self.spans.len()];

        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    let span = &self.spans[i];
                    let area = self.areas[i];
                    let mut same_area_neighbors = 0;
                    for dir in 0..4 {
                        if let Some(con) = span.con(dir) {
                            let (_, _, a_i) = self.con_indices(x as i32, z as i32, dir, con);
                            if self.areas[a_i] == area {
                                same_area_neighbors += 1;
                            }
                        }
                    }
                    if same_area_neighbors != 4 {
                        src[i] = 0;
                    }
                }
            }
        }

        // Forward pass (NW to SE).
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    let span = &self.spans[i];
                    let mut d = src[i];

                    // (-1, 0) and (-1, -1)
                    if let Some(con) = span.con(0) {
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, 0, con);
                        d = d.min(src[a_i].saturating_add(2));
                        if let Some(con) = self.spans[a_i].con(3) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, 3, con);
                            d = d.min(src[b_i].saturating_add(3));
                        }
                    }
                    // (0, -1) and (1, -1)
                    if let Some(con) = span.con(3) {
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, 3, con);
                        d = d.min(src[a_i].saturating_add(2));
                        if let Some(con) = self.spans[a_i].con(2) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, 2, con);
                            d = d.min(src[b_i].saturating_add(3));
                        }
                    }
                    src[i] = d;
                }
            }
        }

        // Backward pass (SE to NW).
        for z in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    let span = &self.spans[i];
                    let mut d = src[i];

                    // (1, 0) and (1, 1)
                    if let Some(con) = span.con(2) {
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, 2, con);
                        d = d.min(src[a_i].saturating_add(2));
                        if let Some(con) = self.spans[a_i].con(1) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, 1, con);
                            d = d.min(src[b_i].saturating_add(3));
                        }
                    }
                    // (0, 1) and (-1, 1)
                    if let Some(con) = span.con(1) {
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, 1, con);
                        d = d.min(src[a_i].saturating_add(2));
                        if let Some(con) = self.spans[a_i].con(0) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, 0, con);
                            d = d.min(src[b_i].saturating_add(3));
                        }
                    }
                    src[i] = d;
                }
            }
        }

        self.max_distance = src.iter().copied().max().unwrap_or(0);
        self.dist = self.box_blur(&src, 1);
    }

    /// 3x3 box blur over the distance field. Values at or below
    /// `threshold * 2` pass through unchanged to keep the boundary sharp.
    fn box_blur(&self, src: &[u16], threshold: u16) -> Vec<u16> {
        let threshold = threshold * 2;
        let mut dst = vec![0_u16; src.len()];

        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    let span = &self.spans[i];
                    let center = src[i];
                    if center <= threshold {
                        dst[i] = center;
                        continue;
                    }

                    let mut d = center as u32;
                    for dir in 0..4 {
                        let Some(con) = span.con(dir) else {
                            // Missing cardinal neighbor stands in for
                            // itself and its diagonal.
                            d += center as u32 * 2;
                            continue;
                        };
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, dir, con);
                        d += src[a_i] as u32;

                        let diagonal_dir = (dir + 1) & 0x3;
                        if let Some(con) = self.spans[a_i].con(diagonal_dir) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, diagonal_dir, con);
                            d += src[b_i] as u32;
                        } else {
                            d += center as u32;
                        }
                    }
                    dst[i] = ((d + 5) / 9) as u16;
                }
            }
        }
        dst
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3A;

    use crate::{
        Heightfield, HeightfieldBuilder,
        heightfield::SpanInsertion,
        math::Aabb3d,
        span::{AreaType, Span},
    };

    use super::*;

    fn floor_grid(size: u16) -> Heightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3A::ZERO, Vec3A::new(size as f32, 8.0, size as f32)),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        for z in 0..size {
            for x in 0..size {
                heightfield
                    .add_span(SpanInsertion {
                        x,
                        z,
                        flag_merge_threshold: 1,
                        span: Span {
                            min: 0,
                            max: 1,
                            area: AreaType::DEFAULT_WALKABLE,
                            next: None,
                        },
                    })
                    .unwrap();
            }
        }
        heightfield
    }

    fn span_index(compact: &CompactHeightfield, x: u16, z: u16) -> usize {
        compact.cell_at(x, z).index() as usize
    }

    #[test]
    fn distance_peaks_in_the_center() {
        let mut compact = floor_grid(9).into_compact(2, 1).unwrap();
        compact.build_distance_field();
        assert_eq!(compact.dist.len(), compact.spans.len());
        // Edge cells touch the boundary.
        assert_eq!(compact.dist[span_index(&compact, 0, 0)], 0);
        assert_eq!(compact.dist[span_index(&compact, 8, 4)], 0);
        // The center is the unique chamfer maximum: 4 rings of cardinal
        // steps from the edge.
        assert_eq!(compact.max_distance, 8);
        let center = compact.dist[span_index(&compact, 4, 4)];
        for z in 0..9 {
            for x in 0..9 {
                assert!(compact.dist[span_index(&compact, x, z)] <= center);
            }
        }
    }

    #[test]
    fn field_is_symmetric_on_a_symmetric_grid() {
        let mut compact = floor_grid(8).into_compact(2, 1).unwrap();
        compact.build_distance_field();
        for z in 0..8_u16 {
            for x in 0..8_u16 {
                let d = compact.dist[span_index(&compact, x, z)];
                let mirror_x = compact.dist[span_index(&compact, 7 - x, z)];
                let mirror_z = compact.dist[span_index(&compact, x, 7 - z)];
                assert_eq!(d, mirror_x, "x mirror at ({x}, {z})");
                assert_eq!(d, mirror_z, "z mirror at ({x}, {z})");
            }
        }
    }

    #[test]
    fn area_seams_seed_the_field() {
        // Two areas side by side; the seam becomes a distance-0 line even
        // though all spans stay connected.
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3A::ZERO, Vec3A::new(6.0, 8.0, 6.0)),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        for z in 0..6 {
            for x in 0..6 {
                let area = if x < 3 {
                    AreaType::DEFAULT_WALKABLE
                } else {
                    AreaType(7)
                };
                heightfield
                    .add_span(SpanInsertion {
                        x,
                        z,
                        flag_merge_threshold: 1,
                        span: Span {
                            min: 0,
                            max: 1,
                            area,
                            next: None,
                        },
                    })
                    .unwrap();
            }
        }
        let mut compact = heightfield.into_compact(2, 1).unwrap();
        compact.build_distance_field();
        assert_eq!(compact.dist[span_index(&compact, 2, 3)], 0);
        assert_eq!(compact.dist[span_index(&compact, 3, 3)], 0);
    }
}
