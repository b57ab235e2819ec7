//! Small geometric helpers shared across the pipeline stages.

use glam::{U16Vec2, Vec2, Vec3A};

/// An axis-aligned bounding box in world space.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Aabb3d {
    /// The minimum corner.
    pub min: Vec3A,
    /// The maximum corner.
    pub max: Vec3A,
}

impl Aabb3d {
    /// Creates an AABB from its two corners.
    pub fn new(min: impl Into<Vec3A>, max: impl Into<Vec3A>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Computes the AABB of a point cloud. Returns `None` if `verts` is empty.
    pub fn from_verts(verts: &[Vec3A]) -> Option<Self> {
        let first = verts.first()?;
        let mut aabb = Self {
            min: *first,
            max: *first,
        };
        for vert in &verts[1..] {
            aabb.min = aabb.min.min(*vert);
            aabb.max = aabb.max.max(*vert);
        }
        Some(aabb)
    }

    /// Returns whether this AABB overlaps `other`, boundaries included.
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }
}

/// An axis-aligned bounding box on the xz-plane.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Aabb2d {
    /// The minimum corner.
    pub min: Vec2,
    /// The maximum corner.
    pub max: Vec2,
}

impl Aabb2d {
    /// Computes the AABB of a point cloud. Returns `None` if `verts` is empty.
    pub fn from_verts(verts: &[Vec2]) -> Option<Self> {
        let first = verts.first()?;
        let mut aabb = Self {
            min: *first,
            max: *first,
        };
        for vert in &verts[1..] {
            aabb.min = aabb.min.min(*vert);
            aabb.max = aabb.max.max(*vert);
        }
        Some(aabb)
    }

    /// Extrudes the 2D box into an [`Aabb3d`] covering `[min_y, max_y]`.
    pub fn extend_y(&self, min_y: f32, max_y: f32) -> Aabb3d {
        Aabb3d {
            min: Vec3A::new(self.min.x, min_y, self.min.y),
            max: Vec3A::new(self.max.x, max_y, self.max.y),
        }
    }
}

/// Gets the x-axis offset for the given axis-neighbor direction.
/// Directions are `0 = (-1, 0)`, `1 = (0, 1)`, `2 = (1, 0)`, `3 = (0, -1)`.
#[inline]
pub(crate) fn dir_offset_x(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [-1, 0, 1, 0];
    OFFSET[direction as usize & 0x03]
}

/// Gets the z-axis offset for the given axis-neighbor direction.
#[inline]
pub(crate) fn dir_offset_z(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [0, 1, 0, -1];
    OFFSET[direction as usize & 0x03]
}

/// Squared distance from `point` to the segment `(a, b)`, all on the voxel
/// corner lattice.
pub(crate) fn dist_sq_point_segment_u16(point: U16Vec2, (a, b): (U16Vec2, U16Vec2)) -> f32 {
    let p = point.as_vec2();
    let a = a.as_vec2();
    let b = b.as_vec2();
    let ab = b - a;
    let ap = p - a;
    let d = ab.length_squared();
    let mut t = ab.dot(ap);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    (a + ab * t - p).length_squared()
}

/// Squared distance from `point` to the segment `(a, b)` on the xz-plane.
pub(crate) fn dist_sq_point_segment_xz(point: Vec3A, a: Vec3A, b: Vec3A) -> f32 {
    let pq = Vec2::new(b.x - a.x, b.z - a.z);
    let dp = Vec2::new(point.x - a.x, point.z - a.z);
    let d = pq.length_squared();
    let mut t = pq.dot(dp);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = a.x + t * pq.x - point.x;
    let dz = a.z + t * pq.y - point.z;
    dx * dx + dz * dz
}

pub(crate) trait TriangleIndices {
    fn normal(&self, vertices: &[Vec3A]) -> Vec3A;
}

impl TriangleIndices for glam::UVec3 {
    #[inline]
    fn normal(&self, vertices: &[Vec3A]) -> Vec3A {
        let a = vertices[self[0] as usize];
        let b = vertices[self[1] as usize];
        let c = vertices[self[2] as usize];
        let ab = b - a;
        let ac = c - a;
        ab.cross(ac).normalize_or_zero()
    }
}

pub(crate) trait TriangleVertices {
    fn aabb(&self) -> Aabb3d;
}

impl TriangleVertices for [Vec3A; 3] {
    #[inline]
    fn aabb(&self) -> Aabb3d {
        let min = self[0].min(self[1]).min(self[2]);
        let max = self[0].max(self[1]).max(self[2]);
        Aabb3d { min, max }
    }
}

#[cfg(test)]
mod tests {
    use glam::u16vec2;

    use super::*;

    #[test]
    fn aabbs_intersect_on_shared_boundary() {
        let a = Aabb3d::new(Vec3A::ZERO, Vec3A::splat(1.0));
        let b = Aabb3d::new(Vec3A::splat(1.0), Vec3A::splat(2.0));
        let c = Aabb3d::new(Vec3A::splat(1.1), Vec3A::splat(2.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn point_segment_distance_clamps_to_endpoints() {
        let a = u16vec2(0, 0);
        let b = u16vec2(10, 0);
        assert_eq!(dist_sq_point_segment_u16(u16vec2(5, 3), (a, b)), 9.0);
        assert_eq!(dist_sq_point_segment_u16(u16vec2(13, 4), (a, b)), 25.0);
    }
}
