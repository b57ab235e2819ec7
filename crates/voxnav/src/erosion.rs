//! Erosion of the walkable area by the agent radius.

use crate::{CompactHeightfield, span::AreaType};

/// Distance saturation for the 8-bit chamfer transform.
const MAX_DIST: u8 = 250;

impl CompactHeightfield {
    /// Shrinks the walkable area away from boundaries by `walkable_radius`
    /// cells, so polygon edges end up at least an agent radius away from
    /// obstructions.
    ///
    /// Runs a two-pass (2, 3)-chamfer distance transform from boundary
    /// spans and relabels every span closer than `2 * walkable_radius` to
    /// [`AreaType::NOT_WALKABLE`]. A radius of zero leaves the field
    /// untouched.
    pub fn erode_walkable_area(&mut self, walkable_radius: u16) {
        if walkable_radius == 0 {
            return;
        }
        let mut dist = vec![MAX_DIST; self.spans.len()];

        // Boundary seeding: null spans, and walkable spans missing a
        // walkable neighbor in any cardinal direction.
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    if !self.areas[i].is_walkable() {
                        dist[i] = 0;
                        continue;
                    }
                    let span = &self.spans[i];
                    let mut neighbor_count = 0;
                    for dir in 0..4 {
                        let Some(con) = span.con(dir) else {
                            break;
                        };
                        let (_, _, neighbor_index) =
                            self.con_indices(x as i32, z as i32, dir, con);
                        if !self.areas[neighbor_index].is_walkable() {
                            break;
                        }
                        neighbor_count += 1;
                    }
                    if neighbor_count != 4 {
                        dist[i] = 0;
                    }
                }
            }
        }

        self.chamfer_pass_forward(&mut dist);
        self.chamfer_pass_backward(&mut dist);

        let threshold = (walkable_radius as u32 * 2).min(MAX_DIST as u32) as u8;
        for (dist, area) in dist.iter().zip(self.areas.iter_mut()) {
            if *dist < threshold {
                *area = AreaType::NOT_WALKABLE;
            }
        }
    }

    /// Forward chamfer sweep (NW to SE): relaxes through the west and south
    /// neighbors and their composed diagonals.
    fn chamfer_pass_forward(&self, dist: &mut [u8]) {
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    let span = &self.spans[i];
                    let mut d = dist[i];

                    // (-1, 0)
                    if let Some(con) = span.con(0) {
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, 0, con);
                        d = d.min(dist[a_i].saturating_add(2));
                        // (-1, -1)
                        if let Some(con) = self.spans[a_i].con(3) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, 3, con);
                            d = d.min(dist[b_i].saturating_add(3));
                        }
                    }
                    // (0, -1)
                    if let Some(con) = span.con(3) {
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, 3, con);
                        d = d.min(dist[a_i].saturating_add(2));
                        // (1, -1)
                        if let Some(con) = self.spans[a_i].con(2) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, 2, con);
                            d = d.min(dist[b_i].saturating_add(3));
                        }
                    }
                    dist[i] = d.min(MAX_DIST);
                }
            }
        }
    }

    /// Backward chamfer sweep (SE to NW): relaxes through the east and
    /// north neighbors and their composed diagonals.
    fn chamfer_pass_backward(&self, dist: &mut [u8]) {
        for z in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    let span = &self.spans[i];
                    let mut d = dist[i];

                    // (1, 0)
                    if let Some(con) = span.con(2) {
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, 2, con);
                        d = d.min(dist[a_i].saturating_add(2));
                        // (1, 1)
                        if let Some(con) = self.spans[a_i].con(1) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, 1, con);
                            d = d.min(dist[b_i].saturating_add(3));
                        }
                    }
                    // (0, 1)
                    if let Some(con) = span.con(1) {
                        let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, 1, con);
                        d = d.min(dist[a_i].saturating_add(2));
                        // (-1, 1)
                        if let Some(con) = self.spans[a_i].con(0) {
                            let (_, _, b_i) = self.con_indices(a_x, a_z, 0, con);
                            d = d.min(dist[b_i].saturating_add(3));
                        }
                    }
                    dist[i] = d.min(MAX_DIST);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3A;

    use crate::{
        Heightfield, HeightfieldBuilder,
        heightfield::SpanInsertion,
        math::Aabb3d,
        span::Span,
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

    fn walkable_cells(compact: &CompactHeightfield) -> Vec<(u16, u16)> {
        let mut cells = Vec::new();
        for z in 0..compact.height {
            for x in 0..compact.width {
                for i in compact.cell_at(x, z).index_range() {
                    if compact.areas[i].is_walkable() {
                        cells.push((x, z));
                    }
                }
            }
        }
        cells
    }

    #[test]
    fn zero_radius_is_a_no_op() {
        let mut compact = floor_grid(6).into_compact(2, 1).unwrap();
        compact.erode_walkable_area(0);
        assert_eq!(walkable_cells(&compact).len(), 36);
    }

    #[test]
    fn radius_one_strips_the_boundary_ring() {
        let mut compact = floor_grid(6).into_compact(2, 1).unwrap();
        compact.erode_walkable_area(1);
        let remaining = walkable_cells(&compact);
        assert_eq!(remaining.len(), 16);
        for (x, z) in remaining {
            assert!((1..5).contains(&x) && (1..5).contains(&z));
        }
    }

    #[test]
    fn radius_two_strips_two_rings() {
        let mut compact = floor_grid(8).into_compact(2, 1).unwrap();
        compact.erode_walkable_area(2);
        let remaining = walkable_cells(&compact);
        assert_eq!(remaining.len(), 16);
        for (x, z) in remaining {
            assert!((2..6).contains(&x) && (2..6).contains(&z));
        }
    }

    /// Dijkstra over the same (2, 3)-weighted edges the two sweep passes
    /// relax, as an independent reference for the chamfer result.
    fn reference_erosion(compact: &CompactHeightfield, radius: u16) -> Vec<bool> {
        let n = compact.spans.len();
        let mut dist = vec![u32::MAX; n];
        let mut position = vec![(0_u16, 0_u16); n];
        let mut heap = std::collections::BinaryHeap::new();
        for z in 0..compact.height {
            for x in 0..compact.width {
                for i in compact.cell_at(x, z).index_range() {
                    position[i] = (x, z);
                    let boundary = !compact.areas[i].is_walkable() || {
                        let span = &compact.spans[i];
                        (0..4).any(|dir| match span.con(dir) {
                            Some(con) => {
                                let (_, _, ni) = compact.con_indices(x as i32, z as i32, dir, con);
                                !compact.areas[ni].is_walkable()
                            }
                            None => true,
                        })
                    };
                    if boundary {
                        dist[i] = 0;
                        heap.push(core::cmp::Reverse((0_u32, i)));
                    }
                }
            }
        }
        while let Some(core::cmp::Reverse((d, i))) = heap.pop() {
            if d > dist[i] {
                continue;
            }
            let (x, z) = position[i];
            let span = compact.spans[i].clone();
            for dir in 0..4 {
                let Some(con) = span.con(dir) else { continue };
                let (a_x, a_z, a_i) = compact.con_indices(x as i32, z as i32, dir, con);
                if d + 2 < dist[a_i] {
                    dist[a_i] = d + 2;
                    heap.push(core::cmp::Reverse((d + 2, a_i)));
                }
                let diagonal_dir = (dir + 1) & 0x3;
                if let Some(con) = compact.spans[a_i].con(diagonal_dir) {
                    let (_, _, b_i) = compact.con_indices(a_x, a_z, diagonal_dir, con);
                    if d + 3 < dist[b_i] {
                        dist[b_i] = d + 3;
                        heap.push(core::cmp::Reverse((d + 3, b_i)));
                    }
                }
            }
        }
        dist.iter()
            .zip(compact.areas.iter())
            .map(|(d, area)| area.is_walkable() && *d >= radius as u32 * 2)
            .collect()
    }

    #[test]
    fn chamfer_matches_brute_force_distances_around_an_obstacle() {
        let mut heightfield = floor_grid(10);
        // Punch a non-walkable post into the middle of the floor.
        heightfield
            .add_span(SpanInsertion {
                x: 5,
                z: 5,
                flag_merge_threshold: 0,
                span: Span {
                    min: 0,
                    max: 6,
                    area: AreaType::NOT_WALKABLE,
                    next: None,
                },
            })
            .unwrap();
        let compact = heightfield.into_compact(2, 1).unwrap();

        for radius in [1_u16, 2, 3] {
            let mut eroded = compact.clone();
            eroded.erode_walkable_area(radius);
            let expected = reference_erosion(&compact, radius);
            for z in 0..compact.height {
                for x in 0..compact.width {
                    for i in compact.cell_at(x, z).index_range() {
                        assert_eq!(
                            eroded.areas[i].is_walkable(),
                            expected[i],
                            "radius {radius}, cell ({x}, {z})"
                        );
                    }
                }
            }
        }
    }
}
