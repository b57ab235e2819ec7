//! Contour extraction: one simplified boundary polygon per region.

use glam::{U16Vec3, Vec3Swizzles};

use crate::{
    CompactHeightfield, RegionId,
    math::{Aabb3d, dist_sq_point_segment_u16},
    span::AreaType,
};

impl CompactHeightfield {
    /// Traces and simplifies the boundary of every region.
    ///
    /// The raw contours match the region outlines exactly; `max_error` and
    /// `max_edge_len` control how closely the simplified contours follow
    /// them. Vertices at portals between regions are mandatory and always
    /// kept, so neighboring contours stay stitched together.
    ///
    /// A `max_edge_len` of zero disables long-edge splitting.
    pub fn build_contours(
        &self,
        max_error: f32,
        max_edge_len: u16,
        build_flags: BuildContoursFlags,
    ) -> ContourSet {
        let mut cset = ContourSet {
            contours: Vec::new(),
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            width: self.width - self.border_size * 2,
            height: self.height - self.border_size * 2,
            border_size: self.border_size,
            max_error,
        };
        if self.border_size > 0 {
            // The border ring is not part of the output; shrink the AABB.
            let pad = self.border_size as f32 * self.cell_size;
            cset.aabb.min.x += pad;
            cset.aabb.min.z += pad;
            cset.aabb.max.x -= pad;
            cset.aabb.max.z -= pad;
        }

        // For every span, a bitmask of the directions in which its region
        // ends. 0 means interior, 0xf fully isolated.
        let mut flags = vec![0_u8; self.spans.len()];
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    let span = &self.spans[i];
                    if span.region == RegionId::NONE
                        || span.region.intersects(RegionId::BORDER_REGION)
                    {
                        flags[i] = 0;
                        continue;
                    }
                    let mut connected_dirs = 0_u8;
                    for dir in 0..4 {
                        let mut r = RegionId::NONE;
                        if let Some(con) = span.con(dir) {
                            let (_, _, a_i) = self.con_indices(x as i32, z as i32, dir, con);
                            r = self.spans[a_i].region;
                        }
                        if r == span.region {
                            connected_dirs |= 1 << dir;
                        }
                    }
                    flags[i] = connected_dirs ^ 0xf;
                }
            }
        }

        let mut verts = Vec::with_capacity(256);
        let mut simplified = Vec::with_capacity(64);

        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    if flags[i] == 0 || flags[i] == 0xf {
                        flags[i] = 0;
                        continue;
                    }
                    let region = self.spans[i].region;
                    if region == RegionId::NONE || region.intersects(RegionId::BORDER_REGION) {
                        continue;
                    }
                    let area = self.areas[i];

                    verts.clear();
                    simplified.clear();

                    self.walk_contour_boundary(x, z, i, &mut flags, &mut verts);
                    simplify_contour(&verts, &mut simplified, max_error, max_edge_len, build_flags);
                    remove_degenerate_segments(&mut simplified);

                    if simplified.len() < 3 {
                        continue;
                    }
                    let mut contour = Contour {
                        vertices: simplified.clone(),
                        raw_vertices: verts.clone(),
                        region,
                        area,
                    };
                    if self.border_size > 0 {
                        // Undo the border offset so output vertices are
                        // relative to the un-padded grid.
                        for (vert, _) in &mut contour.vertices {
                            vert.x = vert.x.saturating_sub(self.border_size);
                            vert.z = vert.z.saturating_sub(self.border_size);
                        }
                        for (vert, _) in &mut contour.raw_vertices {
                            vert.x = vert.x.saturating_sub(self.border_size);
                            vert.z = vert.z.saturating_sub(self.border_size);
                        }
                    }
                    cset.contours.push(contour);
                }
            }
        }
        cset
    }

    /// Walks the boundary starting at span `i`'s first open direction,
    /// emitting one vertex per boundary corner. Clears the visited
    /// direction bits in `flags` along the way.
    fn walk_contour_boundary(
        &self,
        mut x: u16,
        mut z: u16,
        mut i: usize,
        flags: &mut [u8],
        points: &mut Vec<(U16Vec3, RegionVertexId)>,
    ) {
        let mut dir = 0_u8;
        while (flags[i] & (1 << dir)) == 0 {
            dir += 1;
        }

        let start_dir = dir;
        let start_i = i;
        let area = self.areas[i];

        // Bounded for safety on malformed connectivity.
        for _ in 0..40_000 {
            if (flags[i] & (1 << dir)) != 0 {
                // The edge in `dir` is a boundary: emit its CCW corner.
                let mut is_area_border = false;
                let mut p_x = x;
                let (p_y, is_border_vertex) = self.corner_height(x, z, i, dir);
                let mut p_z = z;
                match dir {
                    0 => p_z += 1,
                    1 => {
                        p_x += 1;
                        p_z += 1;
                    }
                    2 => p_x += 1,
                    _ => {}
                }
                let mut r = RegionVertexId::NONE;
                let span = &self.spans[i];
                if let Some(con) = span.con(dir) {
                    let (_, _, a_i) = self.con_indices(x as i32, z as i32, dir, con);
                    r = RegionVertexId::from(self.spans[a_i].region);
                    if area != self.areas[a_i] {
                        is_area_border = true;
                    }
                }
                if is_border_vertex {
                    r |= RegionVertexId::BORDER_VERTEX;
                }
                if is_area_border {
                    r |= RegionVertexId::AREA_BORDER;
                }
                points.push((U16Vec3::new(p_x, p_y, p_z), r));

                flags[i] &= !(1 << dir);
                // Rotate clockwise.
                dir = (dir + 1) & 0x3;
            } else {
                let span = &self.spans[i];
                let Some(con) = span.con(dir) else {
                    // The flag said connected but the link is gone.
                    tracing::warn!("contour walk hit a missing connection, aborting contour");
                    return;
                };
                let (n_x, n_z, n_i) = self.con_indices(x as i32, z as i32, dir, con);
                x = n_x as u16;
                z = n_z as u16;
                i = n_i;
                // Rotate counterclockwise.
                dir = (dir + 3) & 0x3;
            }
            if start_i == i && start_dir == dir {
                break;
            }
        }
    }

    /// Height of the corner CCW of `dir`, taken as the maximum floor among
    /// the up-to-four spans meeting at that lattice point. Also reports
    /// whether the corner is a removable border vertex.
    fn corner_height(&self, x: u16, z: u16, i: usize, dir: u8) -> (u16, bool) {
        let span = &self.spans[i];
        let mut height = span.y;
        let dir_p = (dir + 1) & 0x3;

        // Region and area combined per participating span, so a vertex
        // between two areas is never treated as removable.
        let mut regs = [RegionVertexId::NONE; 4];
        let combined = |i: usize| {
            RegionVertexId::from(
                self.spans[i].region.bits() as u32 | ((self.areas[i].0 as u32) << 16),
            )
        };
        regs[0] = combined(i);

        if let Some(con) = span.con(dir) {
            let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, dir, con);
            let a_span = &self.spans[a_i];
            height = height.max(a_span.y);
            regs[1] = combined(a_i);
            if let Some(con) = a_span.con(dir_p) {
                let (_, _, b_i) = self.con_indices(a_x, a_z, dir_p, con);
                let b_span = &self.spans[b_i];
                height = height.max(b_span.y);
                regs[2] = combined(b_i);
            }
        }
        if let Some(con) = span.con(dir_p) {
            let (a_x, a_z, a_i) = self.con_indices(x as i32, z as i32, dir_p, con);
            let a_span = &self.spans[a_i];
            height = height.max(a_span.y);
            regs[3] = combined(a_i);
            if let Some(con) = a_span.con(dir) {
                let (_, _, b_i) = self.con_indices(a_x, a_z, dir, con);
                let b_span = &self.spans[b_i];
                height = height.max(b_span.y);
                regs[2] = combined(b_i);
            }
        }

        // The vertex is removable when two consecutive exterior cells of
        // the same border region are followed by two interior cells of one
        // area and no participating cell is unassigned.
        let mut is_border_vertex = false;
        for dir in 0..4 {
            let a = dir;
            let b = (dir + 1) & 0x3;
            let c = (dir + 2) & 0x3;
            let d = (dir + 3) & 0x3;

            let two_same_exteriors =
                regs[a] == regs[b] && regs[a].contains(RegionId::BORDER_REGION.into());
            let two_interiors = !(regs[c] | regs[d]).contains(RegionId::BORDER_REGION.into());
            let interiors_same_area = (regs[c].bits() >> 16) == (regs[d].bits() >> 16);
            let no_unassigned = regs[a] != RegionVertexId::NONE
                && regs[b] != RegionVertexId::NONE
                && regs[c] != RegionVertexId::NONE
                && regs[d] != RegionVertexId::NONE;
            if two_same_exteriors && two_interiors && no_unassigned && interiors_same_area {
                is_border_vertex = true;
                break;
            }
        }
        (height, is_border_vertex)
    }
}

fn simplify_contour(
    points: &[(U16Vec3, RegionVertexId)],
    simplified: &mut Vec<(U16Vec3, u32)>,
    max_error: f32,
    max_edge_len: u16,
    flags: BuildContoursFlags,
) {
    // Seed the simplified polyline with portal vertices: one wherever the
    // neighbor region or area changes.
    let has_connections = points
        .iter()
        .any(|(_, r)| r.intersects(RegionVertexId::REGION_MASK));

    if has_connections {
        let n = points.len();
        for (i, (point, region)) in points.iter().enumerate() {
            let next_region = points[(i + 1) % n].1;
            let different_regions = *region & RegionVertexId::REGION_MASK
                != next_region & RegionVertexId::REGION_MASK;
            let area_border_change = *region & RegionVertexId::AREA_BORDER
                != next_region & RegionVertexId::AREA_BORDER;
            if different_regions || area_border_change {
                simplified.push((*point, i as u32));
            }
        }
    }
    if simplified.is_empty() {
        // Isolated region: seed with the lower-left and upper-right
        // extremes of the raw contour.
        let mut ll = &points[0].0;
        let mut lli = 0;
        let mut ur = &points[0].0;
        let mut uri = 0;
        for (i, point) in points.iter().map(|(p, _)| p).enumerate() {
            if point.x < ll.x || (point.x == ll.x && point.z < ll.z) {
                ll = point;
                lli = i;
            }
            if point.x > ur.x || (point.x == ur.x && point.z > ur.z) {
                ur = point;
                uri = i;
            }
        }
        simplified.push((*ll, lli as u32));
        simplified.push((*ur, uri as u32));
    }

    // Douglas-Peucker: split segments at the raw vertex deviating most,
    // until every raw vertex is within tolerance.
    let mut i = 0;
    while i < simplified.len() {
        let ii = (i + 1) % simplified.len();
        let (mut a, ai) = simplified[i];
        let (mut b, bi) = simplified[ii];

        let mut max_deviation = 0.0_f32;
        let mut max_index = None;
        let mut ci: usize;
        let cinc: usize;
        let endi: usize;

        // Walk the raw vertices in lexicographic order so both traversal
        // directions of an edge measure the same deviations.
        if b.x > a.x || (b.x == a.x && b.z > a.z) {
            cinc = 1;
            ci = (ai as usize + cinc) % points.len();
            endi = bi as usize;
        } else {
            cinc = points.len() - 1;
            ci = (bi as usize + cinc) % points.len();
            endi = ai as usize;
            core::mem::swap(&mut a.x, &mut b.x);
            core::mem::swap(&mut a.z, &mut b.z);
        }
        // Only wall and area-border edges are tightened; portal edges stay.
        let region = points[ci].1;
        if !region.intersects(RegionVertexId::REGION_MASK)
            || region.intersects(RegionVertexId::AREA_BORDER)
        {
            while ci != endi {
                let d = dist_sq_point_segment_u16(points[ci].0.xz(), (a.xz(), b.xz()));
                if d > max_deviation {
                    max_deviation = d;
                    max_index = Some(ci);
                }
                ci = (ci + cinc) % points.len();
            }
        }

        if let Some(max_index) = max_index
            && max_deviation > max_error * max_error
        {
            simplified.insert(i + 1, (points[max_index].0, max_index as u32));
        } else {
            i += 1;
        }
    }

    // Split overly long wall or area-border edges at their midpoint vertex.
    if max_edge_len > 0
        && flags.intersects(
            BuildContoursFlags::TESSELLATE_SOLID_WALL_EDGES
                | BuildContoursFlags::TESSELLATE_AREA_EDGES,
        )
    {
        let mut i = 0;
        while i < simplified.len() {
            let ii = (i + 1) % simplified.len();
            let (a, ai) = simplified[i];
            let (b, bi) = simplified[ii];
            let mut max_index = None;
            let ci = (ai as usize + 1) % points.len();

            let edge_region = points[ci].1;
            let is_wall_edge = flags.intersects(BuildContoursFlags::TESSELLATE_SOLID_WALL_EDGES)
                && !edge_region.intersects(RegionVertexId::REGION_MASK);
            let is_area_edge = flags.intersects(BuildContoursFlags::TESSELLATE_AREA_EDGES)
                && edge_region.intersects(RegionVertexId::AREA_BORDER);
            if is_wall_edge || is_area_edge {
                let delta = b.xz().as_ivec2() - a.xz().as_ivec2();
                if delta.length_squared() > (max_edge_len as i32).pow(2) {
                    let n = if bi < ai {
                        bi + points.len() as u32 - ai
                    } else {
                        bi - ai
                    };
                    if n > 1 {
                        // Round towards the lexicographically greater end so
                        // both traversal directions split identically.
                        max_index = if b.x > a.x || (b.x == a.x && b.z > a.z) {
                            Some((ai + n / 2) % points.len() as u32)
                        } else {
                            Some((ai + n.div_ceil(2)) % points.len() as u32)
                        };
                    }
                }
            }
            if let Some(max_index) = max_index {
                simplified.insert(i + 1, (points[max_index as usize].0, max_index));
            } else {
                i += 1;
            }
        }
    }

    for (_, index) in simplified.iter_mut() {
        // The edge vertex flag comes from the raw vertex itself; the
        // neighbor region comes from the following raw vertex.
        let ai = (*index as usize + 1) % points.len();
        let bi = *index as usize;
        let a = points[ai].1;
        let b = points[bi].1;
        *index = (a.bits() & (RegionVertexId::REGION_MASK | RegionVertexId::AREA_BORDER).bits())
            | (b.bits() & RegionVertexId::BORDER_VERTEX.bits());
    }
}

/// Removes adjacent vertices that coincide on the xz-plane, which would
/// otherwise confuse the triangulator.
fn remove_degenerate_segments(simplified: &mut Vec<(U16Vec3, u32)>) {
    let mut i = 0;
    while i < simplified.len() {
        let ni = (i + 1) % simplified.len();
        if simplified[i].0.xz() == simplified[ni].0.xz() {
            simplified.remove(i);
        } else {
            i += 1;
        }
    }
}

/// A group of related contours sharing bounds and cell sizes.
///
/// Built with [`CompactHeightfield::build_contours`], consumed by
/// [`ContourSet::into_polygon_mesh`](crate::ContourSet::into_polygon_mesh).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ContourSet {
    /// The contours in the set.
    pub contours: Vec<Contour>,
    /// The AABB in world space.
    pub aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    pub cell_size: f32,
    /// The height of each cell. (The minimum increment along the y-axis.)
    pub cell_height: f32,
    /// The width of the set, in cell units, without the border.
    pub width: u16,
    /// The height of the set, in cell units, without the border.
    pub height: u16,
    /// The AABB border size used to generate the source data.
    pub border_size: u16,
    /// The max edge error the contours were simplified with.
    pub max_error: f32,
}

bitflags::bitflags! {
    /// Flag bits stored next to the region id in contour vertex data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionVertexId: u32 {
        /// No flags.
        const NONE = 0;

        /// Extracts the neighbor region id from a vertex flag word.
        const REGION_MASK = RegionId::MAX.bits() as u32;

        /// The vertex lies on the padded grid border and only exists to
        /// match segments across tiles; the polygonizer removes it.
        const BORDER_VERTEX = 0x10_000;

        /// The edge leaving this vertex separates two different areas.
        const AREA_BORDER = 0x20_000;
    }
}

impl From<u32> for RegionVertexId {
    fn from(bits: u32) -> Self {
        RegionVertexId::from_bits_retain(bits)
    }
}

impl From<RegionId> for RegionVertexId {
    fn from(region_id: RegionId) -> Self {
        RegionVertexId::from_bits_retain(region_id.bits() as u32)
    }
}

impl From<RegionVertexId> for RegionId {
    fn from(region_vertex_id: RegionVertexId) -> Self {
        let bits = region_vertex_id.bits() & RegionVertexId::REGION_MASK.bits();
        RegionId::from_bits_retain(bits as u16)
    }
}

/// A simple, non-overlapping boundary polygon of one region, in cell
/// coordinates on the voxel corner lattice.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Contour {
    /// Simplified vertices. The `u32` per vertex packs the neighbor region
    /// of the outgoing edge plus [`RegionVertexId`] flag bits.
    pub vertices: Vec<(U16Vec3, u32)>,
    /// Raw, unsimplified vertices with per-vertex neighbor data.
    pub raw_vertices: Vec<(U16Vec3, RegionVertexId)>,
    /// Region id of the contour.
    pub region: RegionId,
    /// Area type of the contour.
    pub area: AreaType,
}

/// Contour build flags used in [`CompactHeightfield::build_contours`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BuildContoursFlags(u8);

bitflags::bitflags! {
    impl BuildContoursFlags: u8 {
        /// Split long solid (impassable) edges while simplifying.
        const TESSELLATE_SOLID_WALL_EDGES = 1;
        /// Split long edges between areas while simplifying.
        const TESSELLATE_AREA_EDGES = 2;

        /// Default flags for building contours.
        const DEFAULT = Self::TESSELLATE_SOLID_WALL_EDGES.bits();
    }
}

impl Default for BuildContoursFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use glam::{Vec3A, u16vec3};

    use crate::{
        HeightfieldBuilder,
        heightfield::SpanInsertion,
        span::Span,
    };

    use super::*;

    fn contoured_plate(size: u16) -> ContourSet {
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
        let mut compact = heightfield.into_compact(2, 1).unwrap();
        compact.build_distance_field();
        compact.build_regions(0, 2, 10).unwrap();
        compact.build_contours(1.3, 0, BuildContoursFlags::default())
    }

    #[test]
    fn square_plate_simplifies_to_its_corners() {
        let cset = contoured_plate(6);
        assert_eq!(cset.contours.len(), 1);
        let contour = &cset.contours[0];
        assert_eq!(contour.region, RegionId::from(1));
        assert_eq!(contour.vertices.len(), 4);
        let mut corners: Vec<_> = contour.vertices.iter().map(|(v, _)| v.xz()).collect();
        corners.sort_by_key(|v| (v.x, v.y));
        assert_eq!(
            corners,
            vec![
                u16vec3(0, 0, 0).xz(),
                u16vec3(0, 0, 6).xz(),
                u16vec3(6, 0, 0).xz(),
                u16vec3(6, 0, 6).xz(),
            ]
        );
    }

    #[test]
    fn raw_contour_walks_the_full_perimeter() {
        let cset = contoured_plate(6);
        let contour = &cset.contours[0];
        // A 6x6 square has 24 raw boundary corners.
        assert_eq!(contour.raw_vertices.len(), 24);
    }

    #[test]
    fn contour_vertices_carry_wall_neighbors() {
        let cset = contoured_plate(5);
        let contour = &cset.contours[0];
        for (_, flags) in &contour.vertices {
            // Every edge of an isolated plate borders the void.
            assert_eq!(flags & RegionVertexId::REGION_MASK.bits(), 0);
        }
    }

    #[test]
    fn long_edges_are_split_when_requested() {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3A::ZERO, Vec3A::new(12.0, 8.0, 12.0)),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        for z in 0..12 {
            for x in 0..12 {
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
        let mut compact = heightfield.into_compact(2, 1).unwrap();
        compact.build_distance_field();
        compact.build_regions(0, 2, 10).unwrap();
        let split = compact.build_contours(1.3, 4, BuildContoursFlags::default());
        let unsplit = compact.build_contours(1.3, 0, BuildContoursFlags::default());
        assert!(split.contours[0].vertices.len() > unsplit.contours[0].vertices.len());
        for window in split.contours[0].vertices.windows(2) {
            let a = window[0].0.xz().as_ivec2();
            let b = window[1].0.xz().as_ivec2();
            assert!((b - a).length_squared() <= 16);
        }
    }
}
