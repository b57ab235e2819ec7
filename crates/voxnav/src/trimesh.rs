//! The indexed triangle soup consumed by rasterization.

use glam::{UVec3, Vec3A};

use crate::{
    math::{Aabb3d, TriangleIndices as _},
    span::AreaType,
};

/// A mesh used as input for [`Heightfield`](crate::Heightfield) rasterization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriMesh {
    /// The vertices of the mesh.
    pub vertices: Vec<Vec3A>,

    /// The triangles of the mesh as CCW vertex index triples.
    pub indices: Vec<UVec3>,

    /// The area types of the mesh. Each index corresponds 1:1 to [`TriMesh::indices`].
    pub area_types: Vec<AreaType>,
}

impl TriMesh {
    /// Creates a trimesh from packed vertex and index buffers, assigning
    /// [`AreaType::NOT_WALKABLE`] to every triangle.
    pub fn new(vertices: Vec<Vec3A>, indices: Vec<UVec3>) -> Self {
        let area_types = vec![AreaType::NOT_WALKABLE; indices.len()];
        Self {
            vertices,
            indices,
            area_types,
        }
    }

    /// Extends the trimesh with the vertices and triangles of another trimesh.
    /// The indices of `other` are offset by the number of vertices in `self`.
    pub fn extend(&mut self, other: TriMesh) {
        if self.vertices.len() > u32::MAX as usize {
            panic!("Cannot extend a trimesh with more than 2^32 vertices");
        }
        let next_vertex_index = self.vertices.len() as u32;
        self.vertices.extend(other.vertices);
        self.indices
            .extend(other.indices.iter().map(|i| *i + next_vertex_index));
        self.area_types.extend(other.area_types);
    }

    /// Computes the AABB of the trimesh.
    /// Returns `None` if the trimesh is empty.
    pub fn compute_aabb(&self) -> Option<Aabb3d> {
        Aabb3d::from_verts(&self.vertices)
    }

    /// Returns whether every triangle's indices point into [`TriMesh::vertices`]
    /// and the per-triangle tables are consistent.
    pub fn is_well_formed(&self) -> bool {
        self.area_types.len() == self.indices.len()
            && self
                .indices
                .iter()
                .all(|tri| tri.max_element() < self.vertices.len() as u32)
    }

    /// Marks triangles whose slope is below `threshold_rad` as
    /// [`AreaType::DEFAULT_WALKABLE`]. Steeper triangles keep their area.
    ///
    /// Degenerate triangles have a zero normal and are never marked.
    pub fn mark_walkable_triangles(&mut self, threshold_rad: f32) {
        let threshold_cos = threshold_rad.cos();
        for (i, indices) in self.indices.iter().enumerate() {
            let normal = indices.normal(&self.vertices);

            if normal.y > threshold_cos {
                self.area_types[i] = AreaType::DEFAULT_WALKABLE;
            }
        }
    }

    /// The inverse of [`TriMesh::mark_walkable_triangles`]: resets triangles
    /// steeper than `threshold_rad` to [`AreaType::NOT_WALKABLE`] while
    /// keeping custom area ids on walkable ones.
    pub fn clear_unwalkable_triangles(&mut self, threshold_rad: f32) {
        let threshold_cos = threshold_rad.cos();
        for (i, indices) in self.indices.iter().enumerate() {
            let normal = indices.normal(&self.vertices);

            if normal.y <= threshold_cos {
                self.area_types[i] = AreaType::NOT_WALKABLE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::uvec3;

    fn two_triangles() -> TriMesh {
        // One flat triangle at y=0, one vertical wall.
        TriMesh::new(
            vec![
                Vec3A::new(0.0, 0.0, 0.0),
                Vec3A::new(1.0, 0.0, 0.0),
                Vec3A::new(0.0, 0.0, 1.0),
                Vec3A::new(0.0, 1.0, 0.0),
                Vec3A::new(0.0, 1.0, 1.0),
            ],
            vec![uvec3(0, 2, 1), uvec3(0, 3, 4)],
        )
    }

    #[test]
    fn marks_only_flat_triangles() {
        let mut trimesh = two_triangles();
        trimesh.mark_walkable_triangles(45_f32.to_radians());
        assert_eq!(trimesh.area_types[0], AreaType::DEFAULT_WALKABLE);
        assert_eq!(trimesh.area_types[1], AreaType::NOT_WALKABLE);
    }

    #[test]
    fn clear_preserves_custom_areas_on_walkable_triangles() {
        let mut trimesh = two_triangles();
        trimesh.area_types = vec![AreaType(5), AreaType(5)];
        trimesh.clear_unwalkable_triangles(45_f32.to_radians());
        assert_eq!(trimesh.area_types[0], AreaType(5));
        assert_eq!(trimesh.area_types[1], AreaType::NOT_WALKABLE);
    }

    #[test]
    fn mark_then_clear_is_idempotent() {
        let mut trimesh = two_triangles();
        let threshold = 45_f32.to_radians();
        trimesh.mark_walkable_triangles(threshold);
        trimesh.clear_unwalkable_triangles(threshold);
        let snapshot = trimesh.area_types.clone();
        trimesh.mark_walkable_triangles(threshold);
        trimesh.clear_unwalkable_triangles(threshold);
        assert_eq!(trimesh.area_types, snapshot);
    }

    #[test]
    fn extend_offsets_indices() {
        let mut a = two_triangles();
        let b = two_triangles();
        a.extend(b);
        assert_eq!(a.vertices.len(), 10);
        assert_eq!(a.indices[2], uvec3(5, 7, 6));
        assert!(a.is_well_formed());
    }
}
