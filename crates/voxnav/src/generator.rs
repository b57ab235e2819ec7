//! The one-shot build driver running every pipeline stage in order.

use glam::Vec3A;
use thiserror::Error;
use tracing::info_span;

use crate::{
    CompactHeightfieldError, Config, DetailMeshError, DetailNavmesh, HeightfieldBuilder,
    HeightfieldBuilderError, PartitionType, PolygonMesh, PolygonMeshError, RegionId, TriMesh,
    rasterize::RasterizationError,
    watershed::BuildRegionsError,
};

/// The product of a successful [`build_navmesh`] run.
#[derive(Debug, Default, Clone)]
pub struct NavmeshBuild {
    /// The polygon mesh.
    pub polygon_mesh: PolygonMesh,
    /// The per-polygon detail mesh.
    pub detail_mesh: DetailNavmesh,
    /// Non-fatal problems encountered along the way.
    pub warnings: Vec<BuildWarning>,
}

/// A non-fatal problem during a build. The affected geometry is dropped
/// but the rest of the mesh is intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildWarning {
    /// A region's contour defeated the triangulator and was dropped.
    ContourSkipped {
        /// The region whose contour was skipped.
        region: RegionId,
    },
}

/// Runs the full pipeline: rasterization, filtering, compaction, erosion,
/// region partitioning, contouring, polygonization and detail meshing.
///
/// Empty input geometry is not an error and produces an empty mesh.
pub fn build_navmesh(mut trimesh: TriMesh, config: &Config) -> Result<NavmeshBuild, BuildNavmeshError> {
    validate_config(config)?;
    validate_geometry(&trimesh)?;

    let aabb = if config.wants_derived_aabb() {
        match trimesh.compute_aabb() {
            Some(aabb) => aabb,
            None => return Ok(NavmeshBuild::default()),
        }
    } else {
        config.aabb
    };
    // The border ring is extra padding around the requested bounds.
    let mut aabb = aabb;
    let border_padding = config.border_size as f32 * config.cell_size;
    aabb.min.x -= border_padding;
    aabb.min.z -= border_padding;
    aabb.max.x += border_padding;
    aabb.max.z += border_padding;

    trimesh.clear_unwalkable_triangles(config.walkable_slope_angle.to_radians());

    let mut heightfield = HeightfieldBuilder {
        aabb,
        cell_size: config.cell_size,
        cell_height: config.cell_height,
    }
    .build()?;

    {
        let _span = info_span!("rasterize_triangles").entered();
        heightfield.rasterize_triangles(&trimesh, config.walkable_climb)?;
    }

    {
        let _span = info_span!("filter_walkable_surfaces").entered();
        heightfield.filter_low_hanging_walkable_obstacles(config.walkable_climb);
        heightfield.filter_ledge_spans(config.walkable_height, config.walkable_climb);
        heightfield.filter_walkable_low_height_spans(config.walkable_height);
    }

    let mut compact = {
        let _span = info_span!("build_compact_heightfield").entered();
        heightfield.into_compact(config.walkable_height, config.walkable_climb)?
    };

    {
        let _span = info_span!("erode_walkable_area").entered();
        compact.erode_walkable_area(config.walkable_radius);
    }

    for volume in &config.area_volumes {
        compact.mark_convex_poly_area(volume);
    }

    {
        let _span = info_span!("build_regions").entered();
        match config.partition {
            PartitionType::Watershed => {
                compact.build_distance_field();
                compact.build_regions(
                    config.border_size,
                    config.min_region_area,
                    config.merge_region_area,
                )?;
            }
            PartitionType::Monotone => {
                compact.build_regions_monotone(
                    config.border_size,
                    config.min_region_area,
                    config.merge_region_area,
                )?;
            }
        }
    }

    let contours = {
        let _span = info_span!("build_contours").entered();
        compact.build_contours(
            config.max_simplification_error,
            config.max_edge_len,
            config.contour_flags,
        )
    };

    let polygon_mesh = {
        let _span = info_span!("build_polygon_mesh").entered();
        contours.into_polygon_mesh(config.max_vertices_per_polygon)?
    };

    let detail_mesh = {
        let _span = info_span!("build_detail_mesh").entered();
        DetailNavmesh::new(
            &polygon_mesh,
            &compact,
            config.detail_sample_dist,
            config.detail_sample_max_error,
        )?
    };

    let warnings = polygon_mesh
        .skipped_contours
        .iter()
        .map(|&region| BuildWarning::ContourSkipped { region })
        .collect();

    Ok(NavmeshBuild {
        polygon_mesh,
        detail_mesh,
        warnings,
    })
}

fn validate_config(config: &Config) -> Result<(), ConfigValidationError> {
    if !(config.cell_size > 0.0) || !(config.cell_height > 0.0) {
        return Err(ConfigValidationError::NonPositiveCellSize {
            cell_size: config.cell_size,
            cell_height: config.cell_height,
        });
    }
    if !(0.0..=90.0).contains(&config.walkable_slope_angle) {
        return Err(ConfigValidationError::SlopeAngleOutOfRange {
            angle: config.walkable_slope_angle,
        });
    }
    if config.walkable_height < 1 {
        return Err(ConfigValidationError::WalkableHeightTooSmall {
            walkable_height: config.walkable_height,
        });
    }
    if !(config.max_simplification_error > 0.0) {
        return Err(ConfigValidationError::NonPositiveSimplificationError {
            max_simplification_error: config.max_simplification_error,
        });
    }
    if !(3..=12).contains(&config.max_vertices_per_polygon) {
        return Err(ConfigValidationError::VerticesPerPolygonOutOfRange {
            max_vertices_per_polygon: config.max_vertices_per_polygon,
        });
    }
    if !config.wants_derived_aabb()
        && (config.aabb.min.cmpgt(config.aabb.max).any())
    {
        return Err(ConfigValidationError::InvertedAabb {
            min: config.aabb.min,
            max: config.aabb.max,
        });
    }
    Ok(())
}

fn validate_geometry(trimesh: &TriMesh) -> Result<(), GeometryValidationError> {
    if trimesh.area_types.len() != trimesh.indices.len() {
        return Err(GeometryValidationError::AreaTypeCountMismatch {
            triangle_count: trimesh.indices.len(),
            area_type_count: trimesh.area_types.len(),
        });
    }
    for (i, tri) in trimesh.indices.iter().enumerate() {
        if tri.max_element() as usize >= trimesh.vertices.len() {
            return Err(GeometryValidationError::IndexOutOfBounds {
                triangle: i,
                index: tri.max_element(),
                vertex_count: trimesh.vertices.len(),
            });
        }
    }
    Ok(())
}

/// Fatal errors of [`build_navmesh`]. On failure no partial output is
/// produced.
#[derive(Debug, Error)]
pub enum BuildNavmeshError {
    /// The configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),
    /// The input geometry is malformed.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(#[from] GeometryValidationError),
    /// The heightfield grid could not be allocated.
    #[error(transparent)]
    Heightfield(#[from] HeightfieldBuilderError),
    /// Rasterization failed.
    #[error(transparent)]
    Rasterization(#[from] RasterizationError),
    /// Compaction failed.
    #[error(transparent)]
    Compaction(#[from] CompactHeightfieldError),
    /// Region partitioning failed.
    #[error(transparent)]
    Regions(#[from] BuildRegionsError),
    /// Polygonization failed.
    #[error(transparent)]
    PolygonMesh(#[from] PolygonMeshError),
    /// Detail meshing failed.
    #[error(transparent)]
    DetailMesh(#[from] DetailMeshError),
}

/// Configuration problems caught before any stage runs.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    /// Cell sizes must be positive.
    #[error("cell sizes must be positive, got cell_size={cell_size}, cell_height={cell_height}")]
    NonPositiveCellSize {
        /// The xz-plane cell size.
        cell_size: f32,
        /// The y-axis cell size.
        cell_height: f32,
    },
    /// The walkable slope angle must lie in `[0, 90]` degrees.
    #[error("walkable slope angle {angle} is outside [0, 90] degrees")]
    SlopeAngleOutOfRange {
        /// The offending angle.
        angle: f32,
    },
    /// The agent must be at least one cell tall.
    #[error("walkable height must be >= 1, got {walkable_height}")]
    WalkableHeightTooSmall {
        /// The offending height.
        walkable_height: u16,
    },
    /// The simplification tolerance must be positive.
    #[error("max simplification error must be > 0, got {max_simplification_error}")]
    NonPositiveSimplificationError {
        /// The offending tolerance.
        max_simplification_error: f32,
    },
    /// Polygons must have between 3 and 12 vertices.
    #[error("max vertices per polygon must be in [3, 12], got {max_vertices_per_polygon}")]
    VerticesPerPolygonOutOfRange {
        /// The offending vertex budget.
        max_vertices_per_polygon: usize,
    },
    /// The AABB is inverted.
    #[error("AABB min {min} exceeds max {max}")]
    InvertedAabb {
        /// The minimum corner.
        min: Vec3A,
        /// The maximum corner.
        max: Vec3A,
    },
}

/// Geometry problems caught before any stage runs.
#[derive(Debug, Error)]
pub enum GeometryValidationError {
    /// The per-triangle area table does not match the triangle count.
    #[error("{triangle_count} triangles but {area_type_count} area types")]
    AreaTypeCountMismatch {
        /// Number of triangles.
        triangle_count: usize,
        /// Number of area type entries.
        area_type_count: usize,
    },
    /// A triangle references a vertex that does not exist.
    #[error("triangle {triangle} references vertex {index}, but there are {vertex_count} vertices")]
    IndexOutOfBounds {
        /// The offending triangle.
        triangle: usize,
        /// The out-of-bounds vertex index.
        index: u32,
        /// Number of vertices in the mesh.
        vertex_count: usize,
    },
}

#[cfg(test)]
mod tests {
    use glam::uvec3;

    use crate::ConfigBuilder;

    use super::*;

    #[test]
    fn empty_geometry_builds_an_empty_mesh() {
        let config = ConfigBuilder::default().build();
        let build = build_navmesh(TriMesh::default(), &config).unwrap();
        assert_eq!(build.polygon_mesh.polygon_count(), 0);
        assert!(build.detail_mesh.meshes.is_empty());
        assert!(build.warnings.is_empty());
    }

    #[test]
    fn rejects_bad_vertex_budget() {
        let mut config = ConfigBuilder::default().build();
        config.max_vertices_per_polygon = 13;
        let result = build_navmesh(TriMesh::default(), &config);
        assert!(matches!(
            result,
            Err(BuildNavmeshError::InvalidConfig(
                ConfigValidationError::VerticesPerPolygonOutOfRange { .. }
            ))
        ));
    }

    #[test]
    fn rejects_out_of_bounds_indices() {
        let config = ConfigBuilder::default().build();
        let trimesh = TriMesh::new(
            vec![Vec3A::ZERO, Vec3A::X, Vec3A::Z],
            vec![uvec3(0, 1, 3)],
        );
        let result = build_navmesh(trimesh, &config);
        assert!(matches!(
            result,
            Err(BuildNavmeshError::InvalidGeometry(
                GeometryValidationError::IndexOutOfBounds { .. }
            ))
        ));
    }

    #[test]
    fn rejects_zero_cell_size() {
        let mut config = ConfigBuilder::default().build();
        config.cell_size = 0.0;
        let result = build_navmesh(TriMesh::default(), &config);
        assert!(matches!(
            result,
            Err(BuildNavmeshError::InvalidConfig(
                ConfigValidationError::NonPositiveCellSize { .. }
            ))
        ));
    }
}
