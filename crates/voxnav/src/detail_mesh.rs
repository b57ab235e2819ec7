//! Detail meshes: per-polygon height-sampled triangle patches that track
//! the heightfield floor more closely than the coarse polygons.

use glam::{U16Vec3, Vec3A, Vec3Swizzles};
use thiserror::Error;

use crate::{
    CompactHeightfield, PolygonMesh, RegionId,
    math::{dir_offset_x, dir_offset_z, dist_sq_point_segment_xz},
    poly_mesh::NULL_INDEX,
};

const MAX_VERTS: usize = 127;
const MAX_TRIS: usize = 255;
const MAX_VERTS_PER_EDGE: usize = 32;
const UNSET_HEIGHT: u16 = u16::MAX;
const RETRACT_SIZE: usize = 256;

/// Edge flag bit: the edge lies on the polygon boundary.
pub const DETAIL_EDGE_BOUNDARY: u8 = 0x1;

/// Triangle meshes representing the detailed height data of the polygons
/// in an associated [`PolygonMesh`].
///
/// Triangle vertex indices are local to their submesh.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DetailNavmesh {
    /// One submesh per polygon.
    pub meshes: Vec<SubMesh>,
    /// The mesh vertices in world space.
    pub vertices: Vec<Vec3A>,
    /// The mesh triangles: three local vertex indices plus edge flags.
    pub triangles: Vec<[u8; 4]>,
}

/// The slice of a [`DetailNavmesh`] belonging to one polygon.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubMesh {
    /// First vertex of the submesh in [`DetailNavmesh::vertices`].
    pub base_vertex: u32,
    /// Number of vertices in the submesh.
    pub vertex_count: u32,
    /// First triangle of the submesh in [`DetailNavmesh::triangles`].
    pub base_triangle: u32,
    /// Number of triangles in the submesh.
    pub triangle_count: u32,
}

/// Errors that can occur when building a [`DetailNavmesh`].
#[derive(Debug, Error)]
pub enum DetailMeshError {
    /// A polygon's height patch exceeded the working buffers.
    #[error("Height patch of {width}x{height} cells is too large")]
    HeightPatchTooLarge {
        /// Patch width in cells.
        width: u16,
        /// Patch height in cells.
        height: u16,
    },
}

impl DetailNavmesh {
    /// Builds the detail mesh for `mesh`, sampling floor heights from the
    /// compact heightfield.
    ///
    /// `sample_dist` is the XZ spacing of height samples in world units; a
    /// value of zero disables sampling, leaving each polygon's own hull
    /// triangulation. `sample_max_error` is the maximum height deviation
    /// tolerated before a sample becomes a vertex.
    pub fn new(
        mesh: &PolygonMesh,
        heightfield: &CompactHeightfield,
        sample_dist: f32,
        sample_max_error: f32,
    ) -> Result<Self, DetailMeshError> {
        let mut dmesh = DetailNavmesh::default();
        if mesh.vertices.is_empty() || mesh.polygon_count() == 0 {
            return Ok(dmesh);
        }

        let chf = heightfield;
        let nvp = mesh.vertices_per_polygon;
        let cs = mesh.cell_size;
        let ch = mesh.cell_height;
        let orig = mesh.aabb.min;
        let border_size = mesh.border_size;
        let height_search_radius = 1.max(mesh.max_edge_error.ceil() as i32);

        // Per-polygon footprint on the heightfield grid, padded by one cell.
        let mut bounds = Vec::with_capacity(mesh.polygon_count());
        let mut max_patch_width = 0;
        let mut max_patch_height = 0;
        for i in 0..mesh.polygon_count() {
            let p = mesh.polygon_vertices(i);
            let mut xmin = chf.width;
            let mut xmax = 0;
            let mut zmin = chf.height;
            let mut zmax = 0;
            for &pj in p {
                if pj == NULL_INDEX {
                    break;
                }
                let v = &mesh.vertices[pj as usize];
                xmin = xmin.min(v.x);
                xmax = xmax.max(v.x);
                zmin = zmin.min(v.z);
                zmax = zmax.max(v.z);
            }
            let xmin = xmin.saturating_sub(1);
            let xmax = chf.width.min(xmax + 1);
            let zmin = zmin.saturating_sub(1);
            let zmax = chf.height.min(zmax + 1);
            bounds.push((xmin, xmax, zmin, zmax));
            if xmin >= xmax || zmin >= zmax {
                continue;
            }
            max_patch_width = max_patch_width.max(xmax - xmin);
            max_patch_height = max_patch_height.max(zmax - zmin);
        }

        let mut patch = HeightPatch {
            data: vec![0; max_patch_width as usize * max_patch_height as usize],
            xmin: 0,
            zmin: 0,
            width: 0,
            height: 0,
        };

        let mut poly: Vec<Vec3A> = Vec::with_capacity(nvp);
        let mut queue: Vec<(u16, u16, usize)> = Vec::with_capacity(512);
        let mut verts: Vec<Vec3A> = Vec::with_capacity(256);
        let mut tris: Vec<[u8; 4]> = Vec::with_capacity(512);
        let mut samples: Vec<(i32, u16, i32)> = Vec::with_capacity(512);
        let mut edges: Vec<DelaunayEdge> = Vec::with_capacity(64);

        dmesh.meshes.reserve(mesh.polygon_count());

        for i in 0..mesh.polygon_count() {
            let p = mesh.polygon_vertices(i);

            // Polygon vertices in local (AABB-relative) world units.
            poly.clear();
            for &pj in p {
                if pj == NULL_INDEX {
                    break;
                }
                let v = &mesh.vertices[pj as usize];
                poly.push(Vec3A::new(
                    v.x as f32 * cs,
                    v.y as f32 * ch,
                    v.z as f32 * cs,
                ));
            }

            let (xmin, xmax, zmin, zmax) = bounds[i];
            patch.xmin = xmin;
            patch.zmin = zmin;
            patch.width = xmax.saturating_sub(xmin);
            patch.height = zmax.saturating_sub(zmin);
            patch.extract_height_data(chf, p, &mesh.vertices, border_size, mesh.regions[i], &mut queue);

            build_poly_detail(
                &poly,
                sample_dist,
                sample_max_error,
                height_search_radius,
                cs,
                ch,
                &patch,
                &mut verts,
                &mut tris,
                &mut samples,
                &mut edges,
            );

            // To world space.
            let base_vertex = dmesh.vertices.len() as u32;
            for v in verts.iter() {
                dmesh.vertices.push(Vec3A::new(
                    v.x + orig.x,
                    // Lift by one cell: span floors sit on top of the
                    // voxel they cap.
                    v.y + orig.y + ch,
                    v.z + orig.z,
                ));
            }
            let base_triangle = dmesh.triangles.len() as u32;
            dmesh.triangles.extend_from_slice(&tris);

            dmesh.meshes.push(SubMesh {
                base_vertex,
                vertex_count: verts.len() as u32,
                base_triangle,
                triangle_count: tris.len() as u32,
            });
        }

        Ok(dmesh)
    }
}

#[derive(Debug, Default)]
struct HeightPatch {
    data: Vec<u16>,
    xmin: u16,
    zmin: u16,
    width: u16,
    height: u16,
}

impl HeightPatch {
    #[inline]
    fn data_at(&self, x: u16, z: u16) -> u16 {
        self.data[x as usize + z as usize * self.width as usize]
    }

    #[inline]
    fn set_data_at(&mut self, x: u16, z: u16, height: u16) {
        self.data[x as usize + z as usize * self.width as usize] = height;
    }

    /// Copies the floor heights of `region`'s spans under the polygon into
    /// the patch, then flood-fills the remainder from the region border.
    ///
    /// Heightfield reads are offset by `border_size` since the polygon
    /// vertices have the border removed already.
    fn extract_height_data(
        &mut self,
        chf: &CompactHeightfield,
        poly: &[u16],
        mesh_verts: &[U16Vec3],
        border_size: u16,
        region: RegionId,
        queue: &mut Vec<(u16, u16, usize)>,
    ) {
        queue.clear();
        let len = self.width as usize * self.height as usize;
        self.data[..len].fill(UNSET_HEIGHT);

        let mut empty = true;

        // Heights cannot be sampled from polygons built across regions:
        // they may overlap geometry of the other region.
        if region != RegionId::NONE {
            for hz in 0..self.height {
                let z = self.zmin + hz + border_size;
                for hx in 0..self.width {
                    let x = self.xmin + hx + border_size;
                    let cell = chf.cell_at(x, z);
                    for i in cell.index_range() {
                        let span = &chf.spans[i];
                        if span.region != region {
                            continue;
                        }
                        self.set_data_at(hx, hz, span.y);
                        empty = false;

                        // Spans with a foreign neighbor seed the flood.
                        let mut border = false;
                        for dir in 0..4 {
                            if let Some(con) = span.con(dir) {
                                let (_, _, a_i) = chf.con_indices(x as i32, z as i32, dir, con);
                                if chf.spans[a_i].region != region {
                                    border = true;
                                    break;
                                }
                            }
                        }
                        if border {
                            queue.push((x, z, i));
                        }
                        break;
                    }
                }
            }
        }

        // No span of the region under the polygon (or a multi-region
        // polygon): seed from the span nearest a polygon vertex instead.
        if empty {
            self.seed_with_poly_center(chf, poly, mesh_verts, border_size, queue);
        }

        let mut head = 0;
        while head < queue.len() {
            let (cx, cz, ci) = queue[head];
            head += 1;
            if head >= RETRACT_SIZE {
                queue.drain(..RETRACT_SIZE);
                head = 0;
            }

            let span = chf.spans[ci].clone();
            for dir in 0..4 {
                let Some(con) = span.con(dir) else {
                    continue;
                };
                let a_x = cx as i32 + dir_offset_x(dir) as i32;
                let a_z = cz as i32 + dir_offset_z(dir) as i32;
                let hx = a_x - self.xmin as i32 - border_size as i32;
                let hz = a_z - self.zmin as i32 - border_size as i32;
                if hx < 0 || hz < 0 || hx >= self.width as i32 || hz >= self.height as i32 {
                    continue;
                }
                if self.data_at(hx as u16, hz as u16) != UNSET_HEIGHT {
                    continue;
                }
                let (_, _, a_i) = chf.con_indices(cx as i32, cz as i32, dir, con);
                let neighbor = &chf.spans[a_i];
                self.set_data_at(hx as u16, hz as u16, neighbor.y);
                queue.push((a_x as u16, a_z as u16, a_i));
            }
        }
    }

    /// Finds the span closest in height to any polygon vertex and queues it
    /// as the flood seed.
    fn seed_with_poly_center(
        &mut self,
        chf: &CompactHeightfield,
        poly: &[u16],
        mesh_verts: &[U16Vec3],
        border_size: u16,
        queue: &mut Vec<(u16, u16, usize)>,
    ) {
        const OFFSETS: [(i16, i16); 9] = [
            (0, 0),
            (-1, -1),
            (0, -1),
            (1, -1),
            (1, 0),
            (1, 1),
            (0, 1),
            (-1, 1),
            (-1, 0),
        ];

        let mut start: Option<(u16, u16, usize)> = None;
        let mut best_height_diff = UNSET_HEIGHT;

        'outer: for &pj in poly {
            if pj == NULL_INDEX {
                break;
            }
            let vertex = mesh_verts[pj as usize];
            for (offset_x, offset_z) in OFFSETS {
                let Some(ax) = vertex.x.checked_add_signed(offset_x) else {
                    continue;
                };
                let Some(az) = vertex.z.checked_add_signed(offset_z) else {
                    continue;
                };
                if ax < self.xmin
                    || ax >= self.xmin + self.width
                    || az < self.zmin
                    || az >= self.zmin + self.height
                {
                    continue;
                }
                let cell = chf.cell_at(ax + border_size, az + border_size);
                for i in cell.index_range() {
                    let height_diff = vertex.y.abs_diff(chf.spans[i].y);
                    if height_diff < best_height_diff {
                        start = Some((ax + border_size, az + border_size, i));
                        best_height_diff = height_diff;
                        if height_diff == 0 {
                            break 'outer;
                        }
                    }
                }
            }
        }

        let Some((cx, cz, ci)) = start else {
            return;
        };
        let hx = cx - border_size - self.xmin;
        let hz = cz - border_size - self.zmin;
        self.set_data_at(hx, hz, chf.spans[ci].y);
        queue.clear();
        queue.push((cx, cz, ci));
    }

    /// Height lookup with a spiral search around misses, preferring the
    /// candidate closest to `fy`.
    fn get_height(&self, fx: f32, fy: f32, fz: f32, inv_cell_size: f32, cell_height: f32, radius: i32) -> u16 {
        let ix = (fx * inv_cell_size + 0.01) as i32;
        let iz = (fz * inv_cell_size + 0.01) as i32;
        let ix = (ix - self.xmin as i32).clamp(0, self.width as i32 - 1);
        let iz = (iz - self.zmin as i32).clamp(0, self.height as i32 - 1);
        let mut height = self.data_at(ix as u16, iz as u16);
        if height != UNSET_HEIGHT {
            return height;
        }

        // Spiral outwards ring by ring until a set cell is found.
        let mut x = 1_i32;
        let mut z = 0_i32;
        let mut dx = 1_i32;
        let mut dz = 0_i32;
        let max_size = radius * 2 + 1;
        let max_iter = max_size * max_size - 1;

        let mut next_ring_iter_start = 8;
        let mut next_ring_iters = 16;

        let mut best_diff = f32::MAX;
        for iteration in 0..max_iter {
            let nx = ix + x;
            let nz = iz + z;
            if nx >= 0 && nz >= 0 && nx < self.width as i32 && nz < self.height as i32 {
                let nh = self.data_at(nx as u16, nz as u16);
                if nh != UNSET_HEIGHT {
                    let diff = (nh as f32 * cell_height - fy).abs();
                    if diff < best_diff {
                        height = nh;
                        best_diff = diff;
                    }
                }
            }

            // Finishing a ring with a hit means closer cells cannot exist.
            if iteration + 1 == next_ring_iter_start {
                if height != UNSET_HEIGHT {
                    break;
                }
                next_ring_iter_start += next_ring_iters;
                next_ring_iters += 8;
            }

            if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
                core::mem::swap(&mut dx, &mut dz);
                dx = -dx;
            }
            x += dx;
            z += dz;
        }
        height
    }
}

/// 3D squared distance from `point` to segment `(a, b)`.
fn dist_sq_point_segment(point: Vec3A, a: Vec3A, b: Vec3A) -> f32 {
    let ab = b - a;
    let ap = point - a;
    let d = ab.length_squared();
    let mut t = ab.dot(ap);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    (a + ab * t - point).length_squared()
}

/// Signed distance from `point` to the polygon boundary on the xz-plane;
/// negative inside.
fn dist_to_poly(poly: &[Vec3A], point: Vec3A) -> f32 {
    let mut dmin = f32::MAX;
    let mut inside = false;
    let n = poly.len();
    for i in 0..n {
        let vi = poly[i];
        let vj = poly[(i + n - 1) % n];
        if ((vi.z > point.z) != (vj.z > point.z))
            && (point.x < (vj.x - vi.x) * (point.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        dmin = dmin.min(dist_sq_point_segment_xz(point, vj, vi));
    }
    let dmin = dmin.sqrt();
    if inside { -dmin } else { dmin }
}

/// Vertical distance from `point` to the triangle, or `None` if the point
/// is outside the triangle's xz footprint.
fn dist_point_to_triangle(point: Vec3A, a: Vec3A, b: Vec3A, c: Vec3A) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = point - a;

    let dot00 = v0.x * v0.x + v0.z * v0.z;
    let dot01 = v0.x * v1.x + v0.z * v1.z;
    let dot02 = v0.x * v2.x + v0.z * v2.z;
    let dot11 = v1.x * v1.x + v1.z * v1.z;
    let dot12 = v1.x * v2.x + v1.z * v2.z;

    let inv_denom = 1.0 / (dot00 * dot11 - dot01 * dot01);
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    const EPS: f32 = 1e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a.y + u * v0.y + v * v1.y;
        Some((y - point.y).abs())
    } else {
        None
    }
}

/// Minimum vertical distance from `point` to any triangle of the mesh, or
/// `None` if no triangle covers its xz position.
fn dist_to_tri_mesh(point: Vec3A, verts: &[Vec3A], tris: &[[u8; 4]]) -> Option<f32> {
    let mut dmin = None;
    for tri in tris {
        let a = verts[tri[0] as usize];
        let b = verts[tri[1] as usize];
        let c = verts[tri[2] as usize];
        let d = dist_point_to_triangle(point, a, b, c);
        if let Some(d) = d
            && dmin.is_none_or(|dmin| d < dmin)
        {
            dmin = Some(d);
        }
    }
    dmin
}

/// The smallest edge-to-opposite-vertex extent of the polygon; small
/// extents do not profit from interior sampling.
fn poly_min_extent(verts: &[Vec3A]) -> f32 {
    let mut min_dist = f32::MAX;
    for i in 0..verts.len() {
        let ni = (i + 1) % verts.len();
        let p1 = verts[i];
        let p2 = verts[ni];
        let mut max_edge_dist = 0.0_f32;
        for (j, vert) in verts.iter().enumerate() {
            if j == i || j == ni {
                continue;
            }
            max_edge_dist = max_edge_dist.max(dist_sq_point_segment_xz(*vert, p1, p2));
        }
        min_dist = min_dist.min(max_edge_dist);
    }
    min_dist.sqrt()
}

#[inline]
fn prev_hull(i: usize, n: usize) -> usize {
    (i + n - 1) % n
}

#[inline]
fn next_hull(i: usize, n: usize) -> usize {
    (i + 1) % n
}

/// Builds one polygon's detail patch into `verts`/`tris`.
fn build_poly_detail(
    poly: &[Vec3A],
    sample_dist: f32,
    sample_max_error: f32,
    height_search_radius: i32,
    cell_size: f32,
    cell_height: f32,
    patch: &HeightPatch,
    verts: &mut Vec<Vec3A>,
    tris: &mut Vec<[u8; 4]>,
    samples: &mut Vec<(i32, u16, i32)>,
    edges: &mut Vec<DelaunayEdge>,
) {
    let inv_cell_size = 1.0 / cell_size;
    let mut hull: Vec<usize> = Vec::with_capacity(MAX_VERTS);
    let mut edge_points = [Vec3A::ZERO; MAX_VERTS_PER_EDGE + 1];

    verts.clear();
    verts.extend_from_slice(poly);
    tris.clear();
    samples.clear();

    let min_extent = poly_min_extent(verts);

    // Tessellate the polygon outline, snapping every sample to the floor.
    if sample_dist > 0.0 {
        for i in 0..poly.len() {
            let j = (i + poly.len() - 1) % poly.len();
            let mut vj = poly[j];
            let mut vi = poly[i];
            let mut swapped = false;
            // Edges are sampled in lexicographic order so shared edges of
            // neighboring polygons produce identical samples.
            if (vj.x - vi.x).abs() < 1e-6 {
                if vj.z > vi.z {
                    core::mem::swap(&mut vj, &mut vi);
                    swapped = true;
                }
            } else if vj.x > vi.x {
                core::mem::swap(&mut vj, &mut vi);
                swapped = true;
            }

            let delta = vi - vj;
            let d = (delta.x * delta.x + delta.z * delta.z).sqrt();
            let mut nn = 1 + (d / sample_dist).floor() as usize;
            if nn >= MAX_VERTS_PER_EDGE {
                nn = MAX_VERTS_PER_EDGE - 1;
            }
            if verts.len() + nn >= MAX_VERTS {
                nn = (MAX_VERTS - 1).saturating_sub(verts.len());
            }

            for (k, edge_point) in edge_points.iter_mut().enumerate().take(nn + 1) {
                let t = k as f32 / nn as f32;
                let mut pos = vj + delta * t;
                pos.y = patch.get_height(pos.x, pos.y, pos.z, inv_cell_size, cell_height, height_search_radius)
                    as f32
                    * cell_height;
                *edge_point = pos;
            }

            // Keep only samples deviating from the straight edge.
            let mut idx = vec![0, nn];
            let mut k = 0;
            while k < idx.len() - 1 {
                let a = idx[k];
                let b = idx[k + 1];
                let va = edge_points[a];
                let vb = edge_points[b];
                let mut max_dev = 0.0;
                let mut max_i = None;
                for (m, edge_point) in edge_points.iter().enumerate().take(b).skip(a + 1) {
                    let dev = dist_sq_point_segment(*edge_point, va, vb);
                    if dev > max_dev {
                        max_dev = dev;
                        max_i = Some(m);
                    }
                }
                if let Some(max_i) = max_i
                    && max_dev > sample_max_error * sample_max_error
                {
                    idx.insert(k + 1, max_i);
                } else {
                    k += 1;
                }
            }

            hull.push(j);
            // Add the new edge vertices in walk order.
            if swapped {
                for &k in idx.iter().rev().skip(1).take(idx.len().saturating_sub(2)) {
                    verts.push(edge_points[k]);
                    hull.push(verts.len() - 1);
                }
            } else {
                for &k in idx.iter().skip(1).take(idx.len().saturating_sub(2)) {
                    verts.push(edge_points[k]);
                    hull.push(verts.len() - 1);
                }
            }
        }
    } else {
        hull.extend(0..poly.len());
    }

    // Thin polygons do not profit from interior sampling.
    if min_extent < sample_dist * 2.0 {
        triangulate_hull(verts, &hull, poly.len(), tris);
        set_tri_flags(tris, &hull);
        return;
    }

    triangulate_hull(verts, &hull, poly.len(), tris);
    if tris.is_empty() {
        tracing::warn!("Hull triangulation produced no triangles for a detail submesh");
        return;
    }

    if sample_dist > 0.0 {
        // Sample the interior on a regular grid.
        let mut bmin = poly[0];
        let mut bmax = poly[0];
        for vert in &poly[1..] {
            bmin = bmin.min(*vert);
            bmax = bmax.max(*vert);
        }
        let x0 = (bmin.x / sample_dist).floor() as i32;
        let x1 = (bmax.x / sample_dist).ceil() as i32;
        let z0 = (bmin.z / sample_dist).floor() as i32;
        let z1 = (bmax.z / sample_dist).ceil() as i32;

        for z in z0..z1 {
            for x in x0..x1 {
                let pt = Vec3A::new(
                    x as f32 * sample_dist,
                    (bmax.y + bmin.y) * 0.5,
                    z as f32 * sample_dist,
                );
                // Skip samples hugging the boundary; edge tessellation
                // already covered those.
                if dist_to_poly(poly, pt) > -sample_dist / 2.0 {
                    continue;
                }
                let y = patch.get_height(pt.x, pt.y, pt.z, inv_cell_size, cell_height, height_search_radius);
                samples.push((x, y, z));
            }
        }

        // Insert the worst-offending samples until the surface fits.
        let nsamples = samples.len();
        let mut added: Vec<bool> = vec![false; nsamples];
        for _ in 0..nsamples {
            if verts.len() >= MAX_VERTS {
                break;
            }
            let mut best_point = Vec3A::ZERO;
            let mut best_dist = 0.0_f32;
            let mut best_i = None;
            for (i, &(sx, sy, sz)) in samples.iter().enumerate() {
                if added[i] {
                    continue;
                }
                // Jitter the lookup off the grid to avoid ties along edges.
                let pt = Vec3A::new(
                    sx as f32 * sample_dist + jitter_x(i) * cell_size * 0.1,
                    sy as f32 * cell_height,
                    sz as f32 * sample_dist + jitter_z(i) * cell_size * 0.1,
                );
                let Some(d) = dist_to_tri_mesh(pt, verts, tris) else {
                    continue;
                };
                if d > best_dist {
                    best_dist = d;
                    best_i = Some(i);
                    best_point = pt;
                }
            }
            let Some(best_i) = best_i else {
                break;
            };
            if best_dist <= sample_max_error {
                break;
            }
            added[best_i] = true;
            verts.push(best_point);

            // Rebuild the triangulation with the new vertex.
            edges.clear();
            tris.clear();
            delaunay_hull(verts, &hull, tris, edges);
        }
    }

    if tris.len() > MAX_TRIS {
        tris.truncate(MAX_TRIS);
        tracing::warn!(
            "Shrinking detail triangle count to {MAX_TRIS}, submesh is too dense"
        );
    }

    set_tri_flags(tris, &hull);
}

/// Deterministic pseudo-random jitter in [-1, 1].
fn jitter_x(i: usize) -> f32 {
    (((i.wrapping_mul(0x8da6b343)) & 0xffff) as f32 / 65535.0) * 2.0 - 1.0
}

fn jitter_z(i: usize) -> f32 {
    (((i.wrapping_mul(0xd8163841)) & 0xffff) as f32 / 65535.0) * 2.0 - 1.0
}

/// Fan-triangulates the hull from its shortest-perimeter original corner,
/// then advances along whichever side adds less perimeter.
fn triangulate_hull(verts: &[Vec3A], hull: &[usize], original_vertex_count: usize, tris: &mut Vec<[u8; 4]>) {
    let n = hull.len();
    if n < 3 {
        return;
    }
    let mut start = 0;
    let mut left = 1;
    let mut right = n - 1;

    let mut min_perimeter = f32::MAX;
    for i in 0..n {
        if hull[i] >= original_vertex_count {
            // Edge-tessellation vertices cannot start the fan.
            continue;
        }
        let pi = prev_hull(i, n);
        let ni = next_hull(i, n);
        let pv = verts[hull[pi]].xz();
        let cv = verts[hull[i]].xz();
        let nv = verts[hull[ni]].xz();
        let perimeter = pv.distance(cv) + cv.distance(nv) + nv.distance(pv);
        if perimeter < min_perimeter {
            start = i;
            left = ni;
            right = pi;
            min_perimeter = perimeter;
        }
    }

    tris.push([hull[start] as u8, hull[left] as u8, hull[right] as u8, 0]);

    while next_hull(left, n) != right {
        let nleft = next_hull(left, n);
        let nright = prev_hull(right, n);

        let cv_left = verts[hull[left]].xz();
        let nv_left = verts[hull[nleft]].xz();
        let cv_right = verts[hull[right]].xz();
        let nv_right = verts[hull[nright]].xz();

        let dleft = cv_left.distance(nv_left) + nv_left.distance(cv_right);
        let dright = cv_right.distance(nv_right) + cv_left.distance(nv_right);

        if dleft < dright {
            tris.push([hull[left] as u8, hull[nleft] as u8, hull[right] as u8, 0]);
            left = nleft;
        } else {
            tris.push([hull[left] as u8, hull[nright] as u8, hull[right] as u8, 0]);
            right = nright;
        }
    }
}

const EV_UNDEF: i32 = -1;
const EV_HULL: i32 = -2;

#[derive(Debug, Clone, Copy)]
struct DelaunayEdge {
    s: usize,
    t: usize,
    left: i32,
    right: i32,
}

/// Cross product of `(p2 - p1)` and `(p3 - p1)` on the xz-plane.
fn vcross2(p1: Vec3A, p2: Vec3A, p3: Vec3A) -> f32 {
    let u1 = p2.x - p1.x;
    let v1 = p2.z - p1.z;
    let u2 = p3.x - p1.x;
    let v2 = p3.z - p1.z;
    u1 * v2 - v1 * u2
}

fn circum_circle(p1: Vec3A, p2: Vec3A, p3: Vec3A) -> Option<(Vec3A, f32)> {
    const EPS: f32 = 1e-6;
    // Relative to p1 to dodge precision loss on large coordinates.
    let v2 = p2 - p1;
    let v3 = p3 - p1;

    let cp = vcross2(Vec3A::ZERO, v2, v3);
    if cp.abs() <= EPS {
        return None;
    }
    let v2_sq = v2.xz().length_squared();
    let v3_sq = v3.xz().length_squared();
    let c = Vec3A::new(
        (v2_sq * v3.z - v3_sq * v2.z) / (2.0 * cp),
        0.0,
        (v3_sq * v2.x - v2_sq * v3.x) / (2.0 * cp),
    );
    let r = c.xz().length();
    Some((c + p1, r))
}

fn overlap_seg_seg_2d(a: Vec3A, b: Vec3A, c: Vec3A, d: Vec3A) -> bool {
    let a1 = vcross2(a, b, d);
    let a2 = vcross2(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = vcross2(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

fn overlap_edges(verts: &[Vec3A], edges: &[DelaunayEdge], s1: usize, t1: usize) -> bool {
    for edge in edges {
        let (s0, t0) = (edge.s, edge.t);
        if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
            continue;
        }
        if overlap_seg_seg_2d(verts[s0], verts[t0], verts[s1], verts[t1]) {
            return true;
        }
    }
    false
}

fn find_edge(edges: &[DelaunayEdge], s: usize, t: usize) -> Option<usize> {
    edges
        .iter()
        .position(|edge| (edge.s == s && edge.t == t) || (edge.s == t && edge.t == s))
}

fn add_edge(edges: &mut Vec<DelaunayEdge>, max_edges: usize, s: usize, t: usize, left: i32, right: i32) {
    if edges.len() >= max_edges {
        tracing::warn!("Too many Delaunay edges ({count}/{max_edges})", count = edges.len());
        return;
    }
    if find_edge(edges, s, t).is_none() {
        edges.push(DelaunayEdge { s, t, left, right });
    }
}

fn update_left_face(edge: &mut DelaunayEdge, s: usize, t: usize, face: i32) {
    if edge.s == s && edge.t == t && edge.left == EV_UNDEF {
        edge.left = face;
    } else if edge.t == s && edge.s == t && edge.right == EV_UNDEF {
        edge.right = face;
    }
}

fn complete_facet(
    verts: &[Vec3A],
    edges: &mut Vec<DelaunayEdge>,
    max_edges: usize,
    nfaces: &mut i32,
    e: usize,
) {
    const EPS: f32 = 1e-5;

    let (s, t) = {
        let edge = edges[e];
        if edge.left == EV_UNDEF {
            (edge.s, edge.t)
        } else if edge.right == EV_UNDEF {
            (edge.t, edge.s)
        } else {
            return;
        }
    };

    // Best point left of the edge by the empty-circumcircle rule.
    let mut pt = verts.len();
    let mut circle = (Vec3A::ZERO, -1.0_f32);
    for u in 0..verts.len() {
        if u == s || u == t {
            continue;
        }
        if vcross2(verts[s], verts[t], verts[u]) <= EPS {
            continue;
        }
        if circle.1 < 0.0 {
            // First candidate.
            pt = u;
            if let Some(c) = circum_circle(verts[s], verts[t], verts[u]) {
                circle = c;
            }
            continue;
        }
        let d = circle.0.xz().distance(verts[u].xz());
        let tolerance = 0.001;
        if d > circle.1 * (1.0 + tolerance) {
            // Outside the current circumcircle.
            continue;
        } else if d < circle.1 * (1.0 - tolerance) {
            // Clearly inside, adopt.
            pt = u;
            if let Some(c) = circum_circle(verts[s], verts[t], verts[u]) {
                circle = c;
            }
        } else {
            // On the boundary within tolerance; only adopt when the new
            // edges do not cross existing ones.
            if overlap_edges(verts, edges, s, u) || overlap_edges(verts, edges, t, u) {
                continue;
            }
            pt = u;
            if let Some(c) = circum_circle(verts[s], verts[t], verts[u]) {
                circle = c;
            }
        }
    }

    if pt >= verts.len() {
        update_left_face(&mut edges[e], s, t, EV_HULL);
        return;
    }

    let face = *nfaces;
    update_left_face(&mut edges[e], s, t, face);

    match find_edge(edges, pt, s) {
        Some(existing) => update_left_face(&mut edges[existing], pt, s, face),
        None => add_edge(edges, max_edges, pt, s, face, EV_UNDEF),
    }
    match find_edge(edges, t, pt) {
        Some(existing) => update_left_face(&mut edges[existing], t, pt, face),
        None => add_edge(edges, max_edges, t, pt, face, EV_UNDEF),
    }

    *nfaces += 1;
}

/// Delaunay triangulation constrained to the hull boundary.
fn delaunay_hull(verts: &[Vec3A], hull: &[usize], tris: &mut Vec<[u8; 4]>, edges: &mut Vec<DelaunayEdge>) {
    let max_edges = verts.len() * 10;
    edges.clear();

    let mut nfaces = 0;
    for i in 0..hull.len() {
        let j = prev_hull(i, hull.len());
        add_edge(edges, max_edges, hull[j], hull[i], EV_HULL, EV_UNDEF);
    }

    let mut e = 0;
    while e < edges.len() {
        if edges[e].left == EV_UNDEF {
            complete_facet(verts, edges, max_edges, &mut nfaces, e);
        }
        if edges[e].right == EV_UNDEF {
            complete_facet(verts, edges, max_edges, &mut nfaces, e);
        }
        e += 1;
    }

    tris.clear();
    tris.resize(nfaces as usize, [0xff, 0xff, 0xff, 0]);

    for edge in edges.iter() {
        if edge.right >= 0 {
            // Right face of the edge.
            let t = &mut tris[edge.right as usize];
            if t[0] == 0xff {
                t[0] = edge.s as u8;
                t[1] = edge.t as u8;
            } else if t[0] == edge.t as u8 {
                t[2] = edge.s as u8;
            } else if t[1] == edge.s as u8 {
                t[2] = edge.t as u8;
            }
        }
        if edge.left >= 0 {
            // Left face of the edge.
            let t = &mut tris[edge.left as usize];
            if t[0] == 0xff {
                t[0] = edge.t as u8;
                t[1] = edge.s as u8;
            } else if t[0] == edge.s as u8 {
                t[2] = edge.t as u8;
            } else if t[1] == edge.t as u8 {
                t[2] = edge.s as u8;
            }
        }
    }

    // Dangling faces from overflowing the edge budget are dropped.
    tris.retain(|t| {
        let keep = t[0] != 0xff && t[1] != 0xff && t[2] != 0xff;
        if !keep {
            tracing::warn!("Removing dangling face from Delaunay hull");
        }
        keep
    });
}

/// Flags each triangle edge that lies on the polygon hull boundary.
fn set_tri_flags(tris: &mut [[u8; 4]], hull: &[usize]) {
    for tri in tris.iter_mut() {
        let mut flags = 0_u8;
        flags |= edge_flag(tri[0] as usize, tri[1] as usize, hull);
        flags |= edge_flag(tri[1] as usize, tri[2] as usize, hull) << 2;
        flags |= edge_flag(tri[2] as usize, tri[0] as usize, hull) << 4;
        tri[3] = flags;
    }
}

/// Whether the edge `(va, vb)` is a hull edge.
fn edge_flag(va: usize, vb: usize, hull: &[usize]) -> u8 {
    let n = hull.len();
    for i in 0..n {
        let j = next_hull(i, n);
        if (hull[i] == va && hull[j] == vb) || (hull[i] == vb && hull[j] == va) {
            return DETAIL_EDGE_BOUNDARY;
        }
    }
    0
}
