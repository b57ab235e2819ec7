//! Polygonization: contours are triangulated with integer-exact ear
//! clipping, greedily merged into convex n-gons, and wired up with
//! neighbor adjacency and portal edges.

use glam::U16Vec3;
use thiserror::Error;

use crate::{
    ContourSet, RegionId,
    contours::RegionVertexId,
    math::Aabb3d,
    span::AreaType,
};

/// Sentinel for an unused vertex or neighbor slot in [`PolygonMesh::polygons`].
pub const NULL_INDEX: u16 = 0xffff;

/// Region id recorded for polygons whose vertices came from multiple
/// regions during hole retriangulation.
const MULTIPLE_REGIONS: RegionId = RegionId::NONE;

/// Portal marker: bit 15 set, portal direction in bits 13-14.
const PORTAL_FLAG: u16 = 0x8000;

const VERTEX_BUCKET_COUNT: usize = 1 << 12;

/// A navigation mesh of convex polygons in cell coordinates.
///
/// `polygons` is laid out in chunks of `2 * vertices_per_polygon` per
/// polygon: the first half holds vertex indices (padded with
/// [`NULL_INDEX`]), the second half neighbor data. A neighbor slot is
/// either the index of the polygon sharing that edge, [`NULL_INDEX`] for a
/// solid edge, or a portal marker (bit 15 plus the direction in bits
/// 13-14) for edges on the grid border.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PolygonMesh {
    /// The mesh vertices in cell coordinates.
    pub vertices: Vec<U16Vec3>,
    /// Polygon vertex and neighbor data. [Length: `polygon_count() * 2 * vertices_per_polygon`]
    pub polygons: Vec<u16>,
    /// The region id of each polygon.
    pub regions: Vec<RegionId>,
    /// User flags per polygon, zero-initialized.
    pub flags: Vec<u16>,
    /// The area type of each polygon.
    pub areas: Vec<AreaType>,
    /// The maximum number of vertices per polygon.
    pub vertices_per_polygon: usize,
    /// The bounding box of the mesh in world space.
    pub aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    pub cell_size: f32,
    /// The height of each cell.
    pub cell_height: f32,
    /// The border size used to generate the source data.
    pub border_size: u16,
    /// The max error of the simplified contours this mesh was built from.
    pub max_edge_error: f32,
    /// Regions whose contours could not be triangulated and were dropped.
    pub skipped_contours: Vec<RegionId>,
}

impl PolygonMesh {
    /// The number of polygons in the mesh.
    #[inline]
    pub fn polygon_count(&self) -> usize {
        if self.vertices_per_polygon == 0 {
            return 0;
        }
        self.polygons.len() / (self.vertices_per_polygon * 2)
    }

    /// The vertex-index half of polygon `i`.
    #[inline]
    pub fn polygon_vertices(&self, i: usize) -> &[u16] {
        let nvp = self.vertices_per_polygon;
        &self.polygons[i * nvp * 2..i * nvp * 2 + nvp]
    }

    /// The neighbor half of polygon `i`.
    #[inline]
    pub fn polygon_neighbors(&self, i: usize) -> &[u16] {
        let nvp = self.vertices_per_polygon;
        &self.polygons[i * nvp * 2 + nvp..i * nvp * 2 + nvp * 2]
    }

    /// The number of used vertices of polygon `i`.
    pub fn polygon_vertex_count(&self, i: usize) -> usize {
        count_poly_verts(self.polygon_vertices(i))
    }
}

impl ContourSet {
    /// Builds a polygon mesh from the contours.
    ///
    /// Contour vertices within two height cells of each other on the same
    /// xz position are welded. Each contour is triangulated with
    /// integer-exact ear clipping; a contour that defeats both the strict
    /// and the loose predicates is dropped (recorded in
    /// [`PolygonMesh::skipped_contours`]) and the rest of the mesh is still
    /// produced. Triangles are then merged into convex polygons of up to
    /// `max_vertices_per_polygon` vertices.
    pub fn into_polygon_mesh(
        self,
        max_vertices_per_polygon: usize,
    ) -> Result<PolygonMesh, PolygonMeshError> {
        let nvp = max_vertices_per_polygon;
        let mut mesh = PolygonMesh {
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            border_size: self.border_size,
            max_edge_error: self.max_error,
            vertices_per_polygon: nvp,
            ..Default::default()
        };

        let mut max_vertices = 0;
        let mut max_tris = 0;
        let mut max_verts_per_cont = 0;
        for contour in &self.contours {
            if contour.vertices.len() < 3 {
                continue;
            }
            max_vertices += contour.vertices.len();
            max_tris += contour.vertices.len() - 2;
            max_verts_per_cont = max_verts_per_cont.max(contour.vertices.len());
        }
        if max_vertices >= NULL_INDEX as usize - 1 {
            return Err(PolygonMeshError::TooManyVertices {
                vertex_count: max_vertices,
            });
        }

        mesh.vertices = Vec::with_capacity(max_vertices);
        mesh.polygons.reserve(max_tris * nvp * 2);
        mesh.regions.reserve(max_tris);
        mesh.areas.reserve(max_tris);

        // Vertices welded so far are flagged for later removal when they
        // came from the grid border.
        let mut vertex_flags = vec![false; max_vertices];

        let mut first_vertex = vec![NULL_INDEX as i32; VERTEX_BUCKET_COUNT];
        let mut next_vertex = vec![NULL_INDEX as i32; max_vertices];

        let mut indices: Vec<u32> = Vec::with_capacity(max_verts_per_cont);
        let mut tris: Vec<[u16; 3]> = Vec::with_capacity(max_verts_per_cont);
        let mut polys: Vec<u16> = Vec::with_capacity((max_verts_per_cont + 1) * nvp);

        for contour in &self.contours {
            if contour.vertices.len() < 3 {
                continue;
            }

            indices.clear();
            indices.extend(0..contour.vertices.len() as u32);
            tris.clear();

            if !triangulate(&contour.vertices, &mut indices, &mut tris) {
                // Dead-end even under the loose predicates. Emitting a
                // self-intersecting polygon would be worse than a hole.
                tracing::warn!(
                    "Failed to triangulate contour of region {region:?}, dropping it",
                    region = contour.region
                );
                mesh.skipped_contours.push(contour.region);
                continue;
            }

            // Weld the contour's vertices into the mesh vertex pool.
            indices.clear();
            for (vert, raw_flags) in &contour.vertices {
                let index = add_vertex(
                    *vert,
                    &mut mesh.vertices,
                    &mut first_vertex,
                    &mut next_vertex,
                );
                indices.push(index as u32);
                if raw_flags & RegionVertexId::BORDER_VERTEX.bits() != 0 {
                    vertex_flags[index as usize] = true;
                }
            }

            // Seed the merge pool with the triangles.
            polys.clear();
            for tri in &tris {
                let (a, b, c) = (tri[0], tri[1], tri[2]);
                if a != b && a != c && b != c {
                    polys.push(indices[a as usize] as u16);
                    polys.push(indices[b as usize] as u16);
                    polys.push(indices[c as usize] as u16);
                    polys.extend(core::iter::repeat_n(NULL_INDEX, nvp - 3));
                }
            }
            if polys.is_empty() {
                continue;
            }

            if nvp > 3 {
                merge_polygons(&mut polys, nvp, &mesh.vertices);
            }

            let npolys = polys.len() / nvp;
            for j in 0..npolys {
                mesh.polygons.extend_from_slice(&polys[j * nvp..(j + 1) * nvp]);
                mesh.polygons.extend(core::iter::repeat_n(NULL_INDEX, nvp));
                mesh.regions.push(contour.region);
                mesh.areas.push(contour.area);
                if mesh.polygon_count() > max_tris {
                    return Err(PolygonMeshError::TooManyPolygons {
                        polygon_count: mesh.polygon_count(),
                        max: max_tris,
                    });
                }
            }
        }

        // Remove vertices that only exist to line up tile borders.
        let mut i = 0;
        while i < mesh.vertices.len() {
            if !vertex_flags[i] {
                i += 1;
                continue;
            }
            if !can_remove_vertex(&mesh, i as u16) {
                i += 1;
                continue;
            }
            remove_vertex(&mut mesh, i as u16)?;
            vertex_flags.remove(i);
            // The next vertex shifted into slot i; revisit it.
        }

        build_mesh_adjacency(&mut mesh.polygons, nvp, mesh.vertices.len());

        // Mark edges lying on the grid border as portals for the tile
        // stitcher.
        if mesh.border_size > 0 {
            let w = self.width;
            let h = self.height;
            for i in 0..mesh.polygon_count() {
                let base = i * nvp * 2;
                for j in 0..nvp {
                    if mesh.polygons[base + j] == NULL_INDEX {
                        break;
                    }
                    if mesh.polygons[base + nvp + j] != NULL_INDEX {
                        continue;
                    }
                    let nj = if j + 1 >= nvp || mesh.polygons[base + j + 1] == NULL_INDEX {
                        0
                    } else {
                        j + 1
                    };
                    let va = mesh.vertices[mesh.polygons[base + j] as usize];
                    let vb = mesh.vertices[mesh.polygons[base + nj] as usize];

                    let portal = if va.x == 0 && vb.x == 0 {
                        Some(0)
                    } else if va.z == h && vb.z == h {
                        Some(1)
                    } else if va.x == w && vb.x == w {
                        Some(2)
                    } else if va.z == 0 && vb.z == 0 {
                        Some(3)
                    } else {
                        None
                    };
                    if let Some(dir) = portal {
                        mesh.polygons[base + nvp + j] = PORTAL_FLAG | (dir << 13);
                    }
                }
            }
        }

        mesh.flags = vec![0; mesh.polygon_count()];

        if mesh.vertices.len() > NULL_INDEX as usize {
            return Err(PolygonMeshError::TooManyVertices {
                vertex_count: mesh.vertices.len(),
            });
        }
        if mesh.polygon_count() > NULL_INDEX as usize {
            return Err(PolygonMeshError::TooManyPolygons {
                polygon_count: mesh.polygon_count(),
                max: NULL_INDEX as usize,
            });
        }

        Ok(mesh)
    }
}

/// Errors that can occur when building a [`PolygonMesh`].
#[derive(Debug, Error)]
pub enum PolygonMeshError {
    /// The contour set produces more vertices than `u16` indexing allows.
    #[error("Too many vertices for u16 indexing: {vertex_count}")]
    TooManyVertices {
        /// The offending vertex count.
        vertex_count: usize,
    },
    /// More polygons were produced than expected or indexable.
    #[error("Too many polygons: {polygon_count} (max {max})")]
    TooManyPolygons {
        /// The offending polygon count.
        polygon_count: usize,
        /// The maximum allowed.
        max: usize,
    },
}

#[inline]
fn count_poly_verts(poly: &[u16]) -> usize {
    poly.iter().take_while(|&&v| v != NULL_INDEX).count()
}

#[inline]
fn prev_index(i: usize, n: usize) -> usize {
    (i + n - 1) % n
}

#[inline]
fn next_index(i: usize, n: usize) -> usize {
    (i + 1) % n
}

/// Twice the signed area of triangle `(a, b, c)` on the xz-plane, computed
/// in 64 bits so large grids cannot overflow the predicate.
#[inline]
fn area2(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> i64 {
    (b.x as i64 - a.x as i64) * (c.z as i64 - a.z as i64)
        - (c.x as i64 - a.x as i64) * (b.z as i64 - a.z as i64)
}

#[inline]
fn left(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    area2(a, b, c) < 0
}

#[inline]
fn left_on(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
fn collinear(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    area2(a, b, c) == 0
}

/// Proper intersection: the segments cross at a point interior to both.
fn intersect_prop(a: U16Vec3, b: U16Vec3, c: U16Vec3, d: U16Vec3) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }
    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// Whether `c` lies on the closed segment `(a, b)`.
fn between(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    if !collinear(a, b, c) {
        return false;
    }
    if a.x != b.x {
        (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x)
    } else {
        (a.z <= c.z && c.z <= b.z) || (a.z >= c.z && c.z >= b.z)
    }
}

/// Intersection including improper (endpoint / collinear overlap) cases.
fn intersect(a: U16Vec3, b: U16Vec3, c: U16Vec3, d: U16Vec3) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

fn vequal(a: U16Vec3, b: U16Vec3) -> bool {
    a.x == b.x && a.z == b.z
}

const EAR_FLAG: u32 = 0x8000_0000;
const INDEX_MASK: u32 = 0x0fff_ffff;

#[inline]
fn vert_of(verts: &[(U16Vec3, u32)], indices: &[u32], i: usize) -> U16Vec3 {
    verts[(indices[i] & INDEX_MASK) as usize].0
}

/// Whether the diagonal `(i, j)` is strictly inside the polygon in the
/// neighborhood of vertex `i`.
fn in_cone(i: usize, j: usize, verts: &[(U16Vec3, u32)], indices: &[u32]) -> bool {
    let n = indices.len();
    let pi = vert_of(verts, indices, i);
    let pj = vert_of(verts, indices, j);
    let pi_next = vert_of(verts, indices, next_index(i, n));
    let pi_prev = vert_of(verts, indices, prev_index(i, n));

    if left_on(pi_prev, pi, pi_next) {
        // Convex corner.
        left(pi, pj, pi_prev) && left(pj, pi, pi_next)
    } else {
        // Reflex corner.
        !(left_on(pi, pj, pi_next) && left_on(pj, pi, pi_prev))
    }
}

/// Whether the diagonal `(i, j)` crosses no polygon edge.
fn diagonalie(i: usize, j: usize, verts: &[(U16Vec3, u32)], indices: &[u32]) -> bool {
    let n = indices.len();
    let d0 = vert_of(verts, indices, i);
    let d1 = vert_of(verts, indices, j);

    for k in 0..n {
        let k1 = next_index(k, n);
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = vert_of(verts, indices, k);
        let p1 = vert_of(verts, indices, k1);
        if vequal(d0, p0) || vequal(d1, p0) || vequal(d0, p1) || vequal(d1, p1) {
            continue;
        }
        if intersect(d0, d1, p0, p1) {
            return false;
        }
    }
    true
}

fn diagonal(i: usize, j: usize, verts: &[(U16Vec3, u32)], indices: &[u32]) -> bool {
    in_cone(i, j, verts, indices) && diagonalie(i, j, verts, indices)
}

fn in_cone_loose(i: usize, j: usize, verts: &[(U16Vec3, u32)], indices: &[u32]) -> bool {
    let n = indices.len();
    let pi = vert_of(verts, indices, i);
    let pj = vert_of(verts, indices, j);
    let pi_next = vert_of(verts, indices, next_index(i, n));
    let pi_prev = vert_of(verts, indices, prev_index(i, n));

    if left_on(pi_prev, pi, pi_next) {
        left_on(pi, pj, pi_prev) && left_on(pj, pi, pi_next)
    } else {
        !(left_on(pi, pj, pi_next) && left_on(pj, pi, pi_prev))
    }
}

fn diagonalie_loose(i: usize, j: usize, verts: &[(U16Vec3, u32)], indices: &[u32]) -> bool {
    let n = indices.len();
    let d0 = vert_of(verts, indices, i);
    let d1 = vert_of(verts, indices, j);

    for k in 0..n {
        let k1 = next_index(k, n);
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = vert_of(verts, indices, k);
        let p1 = vert_of(verts, indices, k1);
        if vequal(d0, p0) || vequal(d1, p0) || vequal(d0, p1) || vequal(d1, p1) {
            continue;
        }
        if intersect_prop(d0, d1, p0, p1) {
            return false;
        }
    }
    true
}

fn diagonal_loose(i: usize, j: usize, verts: &[(U16Vec3, u32)], indices: &[u32]) -> bool {
    in_cone_loose(i, j, verts, indices) && diagonalie_loose(i, j, verts, indices)
}

/// Ear-clipping triangulation on integer coordinates.
///
/// Returns `false` when even the loose fallback predicates find no ear, in
/// which case `tris` holds a partial triangulation the caller should
/// discard.
fn triangulate(
    verts: &[(U16Vec3, u32)],
    indices: &mut Vec<u32>,
    tris: &mut Vec<[u16; 3]>,
) -> bool {
    // Mark removable corners.
    for i in 0..indices.len() {
        let ni = next_index(i, indices.len());
        let nni = next_index(ni, indices.len());
        if diagonal(i, nni, verts, indices) {
            indices[ni] |= EAR_FLAG;
        }
    }

    while indices.len() > 3 {
        let n = indices.len();
        let mut min_len = i64::MAX;
        let mut min_i = None;

        // Clip the ear with the shortest diagonal first.
        for i in 0..n {
            let ni = next_index(i, n);
            if indices[ni] & EAR_FLAG != 0 {
                let p0 = vert_of(verts, indices, i);
                let p2 = vert_of(verts, indices, next_index(ni, n));
                let dx = p2.x as i64 - p0.x as i64;
                let dz = p2.z as i64 - p0.z as i64;
                let len = dx * dx + dz * dz;
                if len < min_len {
                    min_len = len;
                    min_i = Some(i);
                }
            }
        }

        if min_i.is_none() {
            // The polygon contains a degenerate fold; retry with loosened
            // predicates before giving up.
            for i in 0..n {
                let ni = next_index(i, n);
                let nni = next_index(ni, n);
                if diagonal_loose(i, nni, verts, indices) {
                    let p0 = vert_of(verts, indices, i);
                    let p2 = vert_of(verts, indices, nni);
                    let dx = p2.x as i64 - p0.x as i64;
                    let dz = p2.z as i64 - p0.z as i64;
                    let len = dx * dx + dz * dz;
                    if len < min_len {
                        min_len = len;
                        min_i = Some(i);
                    }
                }
            }
            if min_i.is_none() {
                return false;
            }
        }

        let i = min_i.unwrap();
        let mut ni = next_index(i, n);
        let nni = next_index(ni, n);

        tris.push([
            (indices[i] & INDEX_MASK) as u16,
            (indices[ni] & INDEX_MASK) as u16,
            (indices[nni] & INDEX_MASK) as u16,
        ]);

        // Remove the clipped vertex.
        indices.remove(ni);
        if ni >= indices.len() {
            ni = 0;
        }

        // Update the ear status of the two corners now joined.
        let n = indices.len();
        let i = prev_index(ni, n);
        let prev = prev_index(i, n);
        let nni = next_index(ni, n);

        if diagonal(prev, ni, verts, indices) {
            indices[i] |= EAR_FLAG;
        } else {
            indices[i] &= INDEX_MASK;
        }
        if diagonal(i, nni, verts, indices) {
            indices[ni] |= EAR_FLAG;
        } else {
            indices[ni] &= INDEX_MASK;
        }
    }

    tris.push([
        (indices[0] & INDEX_MASK) as u16,
        (indices[1] & INDEX_MASK) as u16,
        (indices[2] & INDEX_MASK) as u16,
    ]);
    true
}

/// Adds `vertex` to the pool unless an equal vertex (same xz, floor within
/// two cells) already exists, and returns its index.
fn add_vertex(
    vertex: U16Vec3,
    vertices: &mut Vec<U16Vec3>,
    first_vertex: &mut [i32],
    next_vertex: &mut [i32],
) -> u16 {
    let bucket = vertex_hash(vertex.x as u64, vertex.z as u64);
    let mut i = first_vertex[bucket];

    while i != NULL_INDEX as i32 {
        let candidate = vertices[i as usize];
        if candidate.x == vertex.x
            && candidate.z == vertex.z
            && candidate.y.abs_diff(vertex.y) <= 2
        {
            return i as u16;
        }
        i = next_vertex[i as usize];
    }

    let i = vertices.len();
    vertices.push(vertex);
    next_vertex[i] = first_vertex[bucket];
    first_vertex[bucket] = i as i32;
    i as u16
}

fn vertex_hash(x: u64, z: u64) -> usize {
    // Large multiplicative constants, arbitrarily chosen primes.
    const HASH_X: u64 = 0x8da6b343;
    const HASH_Z: u64 = 0xcb1ab31f;
    let hash = x.wrapping_mul(HASH_X).wrapping_add(z.wrapping_mul(HASH_Z));
    (hash & (VERTEX_BUCKET_COUNT as u64 - 1)) as usize
}

/// Strict left turn on unsigned vertices, used for the merge convexity test.
#[inline]
fn uleft(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    area2(a, b, c) < 0
}

/// Value of merging polygons `pa` and `pb`: the squared length of their
/// shared edge, or `None` when merging is illegal (no single shared edge,
/// too many vertices, or a reflex corner would appear).
fn poly_merge_value(
    pa: &[u16],
    pb: &[u16],
    vertices: &[U16Vec3],
    nvp: usize,
) -> Option<(usize, usize, i64)> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);

    if na + nb - 2 > nvp {
        return None;
    }

    // Find the shared edge.
    let mut ea = None;
    let mut eb = None;
    for i in 0..na {
        let mut va0 = pa[i];
        let mut va1 = pa[next_index(i, na)];
        if va0 > va1 {
            core::mem::swap(&mut va0, &mut va1);
        }
        for j in 0..nb {
            let mut vb0 = pb[j];
            let mut vb1 = pb[next_index(j, nb)];
            if vb0 > vb1 {
                core::mem::swap(&mut vb0, &mut vb1);
            }
            if va0 == vb0 && va1 == vb1 {
                ea = Some(i);
                eb = Some(j);
            }
        }
    }
    let (ea, eb) = (ea?, eb?);

    // The two corners created by the splice must stay convex.
    let va = pa[prev_index(ea, na)];
    let vb = pa[ea];
    let vc = pb[(eb + 2) % nb];
    if !uleft(
        vertices[va as usize],
        vertices[vb as usize],
        vertices[vc as usize],
    ) {
        return None;
    }

    let va = pb[prev_index(eb, nb)];
    let vb = pb[eb];
    let vc = pa[(ea + 2) % na];
    if !uleft(
        vertices[va as usize],
        vertices[vb as usize],
        vertices[vc as usize],
    ) {
        return None;
    }

    let va = pa[ea];
    let vb = pa[next_index(ea, na)];
    let dx = vertices[va as usize].x as i64 - vertices[vb as usize].x as i64;
    let dz = vertices[va as usize].z as i64 - vertices[vb as usize].z as i64;
    Some((ea, eb, dx * dx + dz * dz))
}

/// Splices `pb` into `pa` across their shared edge `(ea, eb)`.
fn merge_poly_verts(pa: &[u16], pb: &[u16], ea: usize, eb: usize, nvp: usize) -> Vec<u16> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);
    let mut merged = vec![NULL_INDEX; nvp];
    let mut n = 0;
    for i in 0..na - 1 {
        merged[n] = pa[(ea + 1 + i) % na];
        n += 1;
    }
    for i in 0..nb - 1 {
        merged[n] = pb[(eb + 1 + i) % nb];
        n += 1;
    }
    merged
}

/// Greedily merges polygons (stored flat with stride `nvp`) pairwise by
/// longest shared edge until no legal merge remains.
fn merge_polygons(polys: &mut Vec<u16>, nvp: usize, vertices: &[U16Vec3]) {
    loop {
        let npolys = polys.len() / nvp;
        let mut best_value = 0_i64;
        let mut best = None;

        for j in 0..npolys.saturating_sub(1) {
            for k in j + 1..npolys {
                let pa = &polys[j * nvp..(j + 1) * nvp];
                let pb = &polys[k * nvp..(k + 1) * nvp];
                if let Some((ea, eb, value)) = poly_merge_value(pa, pb, vertices, nvp)
                    && value > best_value
                {
                    best_value = value;
                    best = Some((j, k, ea, eb));
                }
            }
        }

        let Some((j, k, ea, eb)) = best else {
            break;
        };
        let pa = polys[j * nvp..(j + 1) * nvp].to_vec();
        let pb = polys[k * nvp..(k + 1) * nvp].to_vec();
        let merged = merge_poly_verts(&pa, &pb, ea, eb, nvp);
        polys[j * nvp..(j + 1) * nvp].copy_from_slice(&merged);
        // Swap-remove polygon k.
        let npolys = polys.len() / nvp;
        if k != npolys - 1 {
            let last = polys[(npolys - 1) * nvp..npolys * nvp].to_vec();
            polys[k * nvp..(k + 1) * nvp].copy_from_slice(&last);
        }
        polys.truncate((npolys - 1) * nvp);
    }
}

/// Whether removing vertex `rem` leaves a hole that can be retriangulated:
/// enough surrounding edges, and at most two open edges around the vertex.
fn can_remove_vertex(mesh: &PolygonMesh, rem: u16) -> bool {
    let mut num_touched_verts = 0;
    let mut num_remaining_edges = 0;
    for i in 0..mesh.polygon_count() {
        let p = mesh.polygon_vertices(i);
        let nv = count_poly_verts(p);
        let mut num_removed = 0;
        let mut num_verts = 0;
        for &v in &p[..nv] {
            if v == rem {
                num_touched_verts += 1;
                num_removed += 1;
            }
            num_verts += 1;
        }
        if num_removed > 0 {
            num_remaining_edges += num_verts - (num_removed + 1);
        }
    }
    if num_remaining_edges <= 2 {
        // The hole would collapse to a degenerate sliver.
        return false;
    }

    // Edges around the vertex: open edges (used once) must number at most 2.
    let max_edges = num_touched_verts * 2;
    let mut edges: Vec<(u16, u16, u16)> = Vec::with_capacity(max_edges);
    for i in 0..mesh.polygon_count() {
        let p = mesh.polygon_vertices(i);
        let nv = count_poly_verts(p);
        let mut k = nv - 1;
        for j in 0..nv {
            if p[j] == rem || p[k] == rem {
                let other = if p[j] == rem { p[k] } else { p[j] };
                if other != rem {
                    if let Some(edge) = edges.iter_mut().find(|(_, b, _)| *b == other) {
                        edge.2 += 1;
                    } else {
                        edges.push((rem, other, 1));
                    }
                }
            }
            k = j;
        }
    }

    let num_open_edges = edges.iter().filter(|(_, _, count)| *count < 2).count();
    num_open_edges <= 2
}

/// Removes vertex `rem` from the mesh, retriangulates the hole it leaves,
/// and merges the resulting triangles back into convex polygons.
fn remove_vertex(mesh: &mut PolygonMesh, rem: u16) -> Result<(), PolygonMeshError> {
    let nvp = mesh.vertices_per_polygon;

    // Collect the boundary edges of all polygons using the vertex, then
    // drop those polygons.
    let mut edges: Vec<(u16, u16, RegionId, AreaType)> = Vec::new();
    let mut i = 0;
    while i < mesh.polygon_count() {
        let p = mesh.polygon_vertices(i);
        let nv = count_poly_verts(p);
        if !p[..nv].contains(&rem) {
            i += 1;
            continue;
        }
        let region = mesh.regions[i];
        let area = mesh.areas[i];
        let mut k = nv - 1;
        for j in 0..nv {
            if p[j] != rem && p[k] != rem {
                edges.push((p[k], p[j], region, area));
            }
            k = j;
        }
        // Swap-remove polygon i and revisit the slot.
        let npolys = mesh.polygon_count();
        if i != npolys - 1 {
            let last = mesh.polygons[(npolys - 1) * nvp * 2..npolys * nvp * 2].to_vec();
            mesh.polygons[i * nvp * 2..(i + 1) * nvp * 2].copy_from_slice(&last);
            mesh.regions[i] = mesh.regions[npolys - 1];
            mesh.areas[i] = mesh.areas[npolys - 1];
        }
        mesh.polygons.truncate((npolys - 1) * nvp * 2);
        mesh.regions.truncate(npolys - 1);
        mesh.areas.truncate(npolys - 1);
    }

    // Remove the vertex and patch all indices above it.
    mesh.vertices.remove(rem as usize);
    for i in 0..mesh.polygon_count() {
        let base = i * nvp * 2;
        for j in 0..nvp {
            let v = mesh.polygons[base + j];
            if v != NULL_INDEX && v > rem {
                mesh.polygons[base + j] = v - 1;
            }
        }
    }
    for (a, b, _, _) in edges.iter_mut() {
        if *a > rem {
            *a -= 1;
        }
        if *b > rem {
            *b -= 1;
        }
    }

    if edges.is_empty() {
        return Ok(());
    }

    // Chain the edges into the hole loop.
    let mut hole: Vec<u16> = Vec::with_capacity(edges.len());
    let mut hole_regions: Vec<RegionId> = Vec::with_capacity(edges.len());
    let mut hole_areas: Vec<AreaType> = Vec::with_capacity(edges.len());

    let (a, b, region, area) = edges.swap_remove(0);
    hole.push(a);
    hole.push(b);
    hole_regions.push(region);
    hole_regions.push(region);
    hole_areas.push(area);
    hole_areas.push(area);

    while !edges.is_empty() {
        let mut matched = false;
        let mut i = 0;
        while i < edges.len() {
            let (ea, eb, region, area) = edges[i];
            let mut add = false;
            if hole[0] == eb {
                hole.insert(0, ea);
                hole_regions.insert(0, region);
                hole_areas.insert(0, area);
                add = true;
            } else if *hole.last().unwrap() == ea {
                hole.push(eb);
                hole_regions.push(region);
                hole_areas.push(area);
                add = true;
            }
            if add {
                edges.swap_remove(i);
                matched = true;
            } else {
                i += 1;
            }
        }
        if !matched {
            break;
        }
    }
    // The chained loop repeats the first vertex at the end.
    if hole.len() > 1 && hole.first() == hole.last() {
        hole.pop();
        hole_regions.pop();
        hole_areas.pop();
    }

    if hole.len() < 3 {
        return Ok(());
    }

    // Triangulate the hole.
    let hole_verts: Vec<(U16Vec3, u32)> = hole
        .iter()
        .map(|&v| (mesh.vertices[v as usize], 0_u32))
        .collect();
    let mut indices: Vec<u32> = (0..hole.len() as u32).collect();
    let mut tris: Vec<[u16; 3]> = Vec::new();
    if !triangulate(&hole_verts, &mut indices, &mut tris) {
        tracing::warn!("Hole triangulation produced a partial result while removing a vertex");
    }

    // Merge the hole triangles back into polygons.
    let mut polys: Vec<u16> = Vec::new();
    let mut poly_regions: Vec<RegionId> = Vec::new();
    let mut poly_areas: Vec<AreaType> = Vec::new();
    for tri in &tris {
        let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        if a == b || b == c || a == c {
            continue;
        }
        polys.push(hole[a]);
        polys.push(hole[b]);
        polys.push(hole[c]);
        polys.extend(core::iter::repeat_n(NULL_INDEX, nvp - 3));
        // A hole spanning several regions gets the multi-region marker.
        if hole_regions[a] != hole_regions[b] || hole_regions[b] != hole_regions[c] {
            poly_regions.push(MULTIPLE_REGIONS);
        } else {
            poly_regions.push(hole_regions[a]);
        }
        poly_areas.push(hole_areas[a]);
    }
    if polys.is_empty() {
        return Ok(());
    }

    if nvp > 3 {
        merge_polygons_tracked(&mut polys, &mut poly_regions, &mut poly_areas, nvp, &mesh.vertices);
    }

    let npolys = polys.len() / nvp;
    for j in 0..npolys {
        mesh.polygons.extend_from_slice(&polys[j * nvp..(j + 1) * nvp]);
        mesh.polygons.extend(core::iter::repeat_n(NULL_INDEX, nvp));
        mesh.regions.push(poly_regions[j]);
        mesh.areas.push(poly_areas[j]);
    }
    if mesh.polygon_count() > NULL_INDEX as usize {
        return Err(PolygonMeshError::TooManyPolygons {
            polygon_count: mesh.polygon_count(),
            max: NULL_INDEX as usize,
        });
    }
    Ok(())
}

/// [`merge_polygons`], but keeping the per-polygon region and area arrays
/// in step with the swap-removals.
fn merge_polygons_tracked(
    polys: &mut Vec<u16>,
    regions: &mut Vec<RegionId>,
    areas: &mut Vec<AreaType>,
    nvp: usize,
    vertices: &[U16Vec3],
) {
    loop {
        let npolys = polys.len() / nvp;
        let mut best_value = 0_i64;
        let mut best = None;

        for j in 0..npolys.saturating_sub(1) {
            for k in j + 1..npolys {
                let pa = &polys[j * nvp..(j + 1) * nvp];
                let pb = &polys[k * nvp..(k + 1) * nvp];
                if let Some((ea, eb, value)) = poly_merge_value(pa, pb, vertices, nvp)
                    && value > best_value
                {
                    best_value = value;
                    best = Some((j, k, ea, eb));
                }
            }
        }

        let Some((j, k, ea, eb)) = best else {
            break;
        };
        let pa = polys[j * nvp..(j + 1) * nvp].to_vec();
        let pb = polys[k * nvp..(k + 1) * nvp].to_vec();
        let merged = merge_poly_verts(&pa, &pb, ea, eb, nvp);
        polys[j * nvp..(j + 1) * nvp].copy_from_slice(&merged);
        if regions[j] != regions[k] {
            regions[j] = MULTIPLE_REGIONS;
        }
        let npolys = polys.len() / nvp;
        if k != npolys - 1 {
            let last = polys[(npolys - 1) * nvp..npolys * nvp].to_vec();
            polys[k * nvp..(k + 1) * nvp].copy_from_slice(&last);
        }
        regions.swap_remove(k);
        areas.swap_remove(k);
        polys.truncate((npolys - 1) * nvp);
    }
}

/// Fills the neighbor half of every polygon with the index of the polygon
/// sharing each edge.
fn build_mesh_adjacency(polys: &mut [u16], nvp: usize, vertex_count: usize) {
    let npolys = polys.len() / (nvp * 2);
    let max_edge_count = npolys * nvp;

    #[derive(Clone, Copy)]
    struct Edge {
        vert: [u16; 2],
        poly: [u16; 2],
        poly_edge: [u16; 2],
    }

    let mut first_edge: Vec<Option<usize>> = vec![None; vertex_count];
    let mut next_edge: Vec<Option<usize>> = vec![None; max_edge_count];
    let mut edges: Vec<Edge> = Vec::with_capacity(max_edge_count);

    for i in 0..npolys {
        let base = i * nvp * 2;
        for j in 0..nvp {
            if polys[base + j] == NULL_INDEX {
                break;
            }
            let v0 = polys[base + j];
            let v1 = if j + 1 >= nvp || polys[base + j + 1] == NULL_INDEX {
                polys[base]
            } else {
                polys[base + j + 1]
            };
            if v0 < v1 {
                let edge_index = edges.len();
                edges.push(Edge {
                    vert: [v0, v1],
                    poly: [i as u16, i as u16],
                    poly_edge: [j as u16, 0],
                });
                next_edge[edge_index] = first_edge[v0 as usize];
                first_edge[v0 as usize] = Some(edge_index);
            }
        }
    }

    for i in 0..npolys {
        let base = i * nvp * 2;
        for j in 0..nvp {
            if polys[base + j] == NULL_INDEX {
                break;
            }
            let v0 = polys[base + j];
            let v1 = if j + 1 >= nvp || polys[base + j + 1] == NULL_INDEX {
                polys[base]
            } else {
                polys[base + j + 1]
            };
            if v0 > v1 {
                let mut edge_iter = first_edge[v1 as usize];
                while let Some(edge_index) = edge_iter {
                    let edge = &mut edges[edge_index];
                    if edge.vert[1] == v0 && edge.poly[0] == edge.poly[1] {
                        edge.poly[1] = i as u16;
                        edge.poly_edge[1] = j as u16;
                        break;
                    }
                    edge_iter = next_edge[edge_index];
                }
            }
        }
    }

    for edge in &edges {
        if edge.poly[0] != edge.poly[1] {
            let p0 = edge.poly[0] as usize;
            let p1 = edge.poly[1] as usize;
            polys[p0 * nvp * 2 + nvp + edge.poly_edge[0] as usize] = edge.poly[1];
            polys[p1 * nvp * 2 + nvp + edge.poly_edge[1] as usize] = edge.poly[0];
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::u16vec3;

    use super::*;

    fn square_contour(size: u16) -> Vec<(U16Vec3, u32)> {
        // CW in x/z screen coordinates, which is the winding the contour
        // tracer emits.
        vec![
            (u16vec3(0, 0, 0), 0),
            (u16vec3(0, 0, size), 0),
            (u16vec3(size, 0, size), 0),
            (u16vec3(size, 0, 0), 0),
        ]
    }

    #[test]
    fn triangulates_a_square() {
        let verts = square_contour(4);
        let mut indices: Vec<u32> = (0..4).collect();
        let mut tris = Vec::new();
        assert!(triangulate(&verts, &mut indices, &mut tris));
        assert_eq!(tris.len(), 2);
    }

    #[test]
    fn triangulates_a_concave_polygon() {
        // An L-shape.
        let verts = vec![
            (u16vec3(0, 0, 0), 0),
            (u16vec3(0, 0, 4), 0),
            (u16vec3(4, 0, 4), 0),
            (u16vec3(4, 0, 2), 0),
            (u16vec3(2, 0, 2), 0),
            (u16vec3(2, 0, 0), 0),
        ];
        let mut indices: Vec<u32> = (0..6).collect();
        let mut tris = Vec::new();
        assert!(triangulate(&verts, &mut indices, &mut tris));
        assert_eq!(tris.len(), 4);
        // All triangles must have positive (CW) area and vertices from the
        // input range.
        for tri in &tris {
            let a = verts[tri[0] as usize].0;
            let b = verts[tri[1] as usize].0;
            let c = verts[tri[2] as usize].0;
            assert!(area2(a, b, c) < 0, "triangle {tri:?} is not CCW-left");
        }
    }

    #[test]
    fn welds_vertices_with_close_floors() {
        let mut vertices = Vec::new();
        let mut first = vec![NULL_INDEX as i32; VERTEX_BUCKET_COUNT];
        let mut next = vec![NULL_INDEX as i32; 8];
        let a = add_vertex(u16vec3(1, 10, 1), &mut vertices, &mut first, &mut next);
        let b = add_vertex(u16vec3(1, 11, 1), &mut vertices, &mut first, &mut next);
        let c = add_vertex(u16vec3(1, 14, 1), &mut vertices, &mut first, &mut next);
        let d = add_vertex(u16vec3(2, 10, 1), &mut vertices, &mut first, &mut next);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(vertices.len(), 3);
    }

    #[test]
    fn merge_produces_convex_polygons_up_to_nvp() {
        // A convex 10-gon contour (approximate circle), nvp 6.
        let n = 10_u16;
        let verts: Vec<(U16Vec3, u32)> = (0..n)
            .map(|i| {
                // CW winding in the lattice orientation.
                let angle = -(i as f32) * core::f32::consts::TAU / n as f32;
                let x = (50.0 + 30.0 * angle.cos()).round() as u16;
                let z = (50.0 + 30.0 * angle.sin()).round() as u16;
                (u16vec3(x, 0, z), 0)
            })
            .collect();

        let mut indices: Vec<u32> = (0..n as u32).collect();
        let mut tris = Vec::new();
        assert!(triangulate(&verts, &mut indices, &mut tris));

        let nvp = 6;
        let vertices: Vec<U16Vec3> = verts.iter().map(|(v, _)| *v).collect();
        let mut polys = Vec::new();
        for tri in &tris {
            polys.extend_from_slice(&[tri[0], tri[1], tri[2]]);
            polys.extend(core::iter::repeat_n(NULL_INDEX, nvp - 3));
        }
        merge_polygons(&mut polys, nvp, &vertices);

        let npolys = polys.len() / nvp;
        assert!(npolys <= 3, "expected <= 3 polygons, got {npolys}");
        for j in 0..npolys {
            let p = &polys[j * nvp..(j + 1) * nvp];
            let nv = count_poly_verts(p);
            assert!(nv <= nvp);
            // Convexity under the same predicate the merger used.
            for i in 0..nv {
                let a = vertices[p[prev_index(i, nv)] as usize];
                let b = vertices[p[i] as usize];
                let c = vertices[p[next_index(i, nv)] as usize];
                assert!(area2(a, b, c) <= 0, "reflex corner in polygon {j}");
            }
        }
    }

    #[test]
    fn adjacency_is_symmetric() {
        // Two triangles sharing an edge, nvp = 3.
        let nvp = 3;
        let mut polys = vec![
            0, 1, 2, NULL_INDEX, NULL_INDEX, NULL_INDEX, // poly 0
            0, 2, 3, NULL_INDEX, NULL_INDEX, NULL_INDEX, // poly 1
        ];
        build_mesh_adjacency(&mut polys, nvp, 4);
        // Poly 0's edge (2, 0) and poly 1's edge (0, 2) are shared.
        assert_eq!(polys[nvp + 2], 1);
        assert_eq!(polys[nvp * 2 + nvp], 0);
        // The outer edges stay open.
        assert_eq!(polys[nvp], NULL_INDEX);
        assert_eq!(polys[nvp + 1], NULL_INDEX);
    }
}
