//! Build configuration: the aggregated parameters of every pipeline stage.

use glam::Vec3A;

use crate::{
    BuildContoursFlags, ConvexVolume,
    math::Aabb3d,
};

/// Which algorithm partitions the walkable surface into regions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionType {
    /// Distance-field watershed. Best quality, needs the distance field.
    #[default]
    Watershed,
    /// Single-pass row sweep. Fast and deterministic but produces long,
    /// thin regions on open ground.
    Monotone,
}

/// Aggregated parameters for one navmesh build.
///
/// Units are world units (wu) or voxels (vx); voxel parameters are scaled
/// by [`Config::cell_size`] / [`Config::cell_height`]. Use
/// [`ConfigBuilder`] to derive a consistent set from agent-centric
/// measurements instead of filling this in by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// The xz-plane cell size. `[Limit: > 0] [Units: wu]`
    pub cell_size: f32,

    /// The y-axis cell size. `[Limit: > 0] [Units: wu]`
    pub cell_height: f32,

    /// The world AABB to rasterize. When zero on both corners, the AABB is
    /// derived from the input geometry.
    pub aabb: Aabb3d,

    /// The size of the non-navigable border around the heightfield,
    /// painted as border regions. `[Limit: >= 0] [Units: vx]`
    pub border_size: u16,

    /// The maximum walkable slope, measured from the horizontal.
    /// `[Limits: 0 <= value <= 90] [Units: Degrees]`
    pub walkable_slope_angle: f32,

    /// Minimum floor-to-ceiling clearance for a span to stay walkable;
    /// the agent height. `[Limit: >= 1] [Units: vx]`
    pub walkable_height: u16,

    /// Maximum ledge height the agent can still step over.
    /// `[Limit: >= 0] [Units: vx]`
    pub walkable_climb: u16,

    /// The agent radius the walkable area is eroded by.
    /// `[Limit: >= 0] [Units: vx]`
    pub walkable_radius: u16,

    /// Maximum contour edge length along mesh borders; zero disables
    /// splitting. `[Limit: >= 0] [Units: vx]`
    pub max_edge_len: u16,

    /// Maximum distance simplified contours may deviate from the raw
    /// region outline. `[Limit: > 0] [Units: vx]`
    pub max_simplification_error: f32,

    /// Regions with fewer spans than this are removed (isolated islands).
    /// `[Limit: >= 0] [Units: vx]`
    pub min_region_area: u16,

    /// Regions at or below this span count are merged into neighbors when
    /// possible. `[Limit: >= 0] [Units: vx]`
    pub merge_region_area: u16,

    /// Maximum vertices per polygon. `[Limits: 3 <= value <= 12]`
    pub max_vertices_per_polygon: usize,

    /// XZ sampling distance for the detail mesh; zero disables sampling.
    /// `[Limits: 0 or >= 0.9] [Units: wu]`
    pub detail_sample_dist: f32,

    /// Maximum height deviation of the detail surface from the
    /// heightfield. `[Limit: >= 0] [Units: wu]`
    pub detail_sample_max_error: f32,

    /// Which partitioner assigns region ids.
    pub partition: PartitionType,

    /// Flags controlling contour simplification.
    pub contour_flags: BuildContoursFlags,

    /// Volumes stamping specific area ids onto the walkable surface.
    pub area_volumes: Vec<ConvexVolume>,
}

/// A builder deriving a consistent [`Config`] from agent-centric,
/// world-unit measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigBuilder {
    /// How many cells fit into [`Self::agent_radius`] on the xz-plane.
    /// Two is usually enough; three for tight indoor scenes.
    pub cell_size_fraction: f32,
    /// How many cells fit into [`Self::agent_radius`] along the y-axis.
    /// Usually twice [`Self::cell_size_fraction`].
    pub cell_height_fraction: f32,
    /// The height of the agent. `[Limit: > 0] [Units: wu]`
    pub agent_height: f32,
    /// The radius of the agent. `[Limit: > 0] [Units: wu]`
    pub agent_radius: f32,
    /// Maximum ledge height the agent can step over. `[Units: wu]`
    pub walkable_climb: f32,
    /// The maximum walkable slope. `[Units: Degrees]`
    pub walkable_slope_angle: f32,
    /// Minimum isolated island side length before removal. `[Units: vx]`
    pub min_region_size: u16,
    /// Region side length below which regions are merged. `[Units: vx]`
    pub merge_region_size: u16,
    /// Maximum contour edge length, in multiples of the walkable radius.
    pub edge_max_len_factor: u16,
    /// Contour simplification tolerance. `[Units: vx]`
    pub max_simplification_error: f32,
    /// Maximum vertices per polygon. `[Limits: 3 <= value <= 12]`
    pub max_vertices_per_polygon: usize,
    /// Detail sampling distance, in multiples of the cell size.
    /// Values below 0.9 disable sampling.
    pub detail_sample_dist: f32,
    /// Detail height tolerance, in multiples of the cell height.
    pub detail_sample_max_error: f32,
    /// The world AABB to build in.
    pub aabb: Aabb3d,
    /// Which partitioner assigns region ids.
    pub partition: PartitionType,
    /// Flags controlling contour simplification.
    pub contour_flags: BuildContoursFlags,
    /// Volumes stamping specific area ids onto the walkable surface.
    pub area_volumes: Vec<ConvexVolume>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            cell_size_fraction: 2.0,
            cell_height_fraction: 4.0,
            agent_height: 2.0,
            agent_radius: 0.6,
            walkable_climb: 0.9,
            walkable_slope_angle: 45.0,
            min_region_size: 8,
            merge_region_size: 20,
            edge_max_len_factor: 8,
            max_simplification_error: 1.3,
            max_vertices_per_polygon: 6,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
            aabb: Aabb3d::default(),
            partition: PartitionType::Watershed,
            contour_flags: BuildContoursFlags::default(),
            area_volumes: Vec::new(),
        }
    }
}

impl ConfigBuilder {
    /// Builds the voxel-unit [`Config`].
    pub fn build(self) -> Config {
        let cell_size = self.agent_radius / self.cell_size_fraction;
        let cell_height = self.agent_radius / self.cell_height_fraction;
        let walkable_radius = (self.agent_radius / cell_size).ceil() as u16;
        // Padding so erosion never reaches the real data.
        let border_size = walkable_radius + 3;
        Config {
            cell_size,
            cell_height,
            aabb: self.aabb,
            border_size,
            walkable_slope_angle: self.walkable_slope_angle,
            walkable_height: (self.agent_height / cell_height).ceil() as u16,
            walkable_climb: (self.walkable_climb / cell_height).floor() as u16,
            walkable_radius,
            max_edge_len: walkable_radius * self.edge_max_len_factor,
            max_simplification_error: self.max_simplification_error,
            min_region_area: self.min_region_size * self.min_region_size,
            merge_region_area: self.merge_region_size * self.merge_region_size,
            max_vertices_per_polygon: self.max_vertices_per_polygon,
            detail_sample_dist: if self.detail_sample_dist < 0.9 {
                0.0
            } else {
                cell_size * self.detail_sample_dist
            },
            detail_sample_max_error: cell_height * self.detail_sample_max_error,
            partition: self.partition,
            contour_flags: self.contour_flags,
            area_volumes: self.area_volumes,
        }
    }
}

impl Config {
    /// Whether the AABB was left for the build to derive from the geometry.
    pub(crate) fn wants_derived_aabb(&self) -> bool {
        self.aabb.min == Vec3A::ZERO && self.aabb.max == Vec3A::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_scales_voxel_parameters_by_cell_size() {
        let config = ConfigBuilder {
            agent_radius: 0.6,
            agent_height: 2.0,
            cell_size_fraction: 2.0,
            cell_height_fraction: 4.0,
            walkable_climb: 0.9,
            ..Default::default()
        }
        .build();
        assert_eq!(config.cell_size, 0.3);
        assert_eq!(config.cell_height, 0.15);
        assert_eq!(config.walkable_radius, 2);
        assert_eq!(config.walkable_height, 14);
        assert_eq!(config.walkable_climb, 5);
        assert_eq!(config.border_size, 5);
    }

    #[test]
    fn tiny_detail_sample_dist_disables_sampling() {
        let config = ConfigBuilder {
            detail_sample_dist: 0.5,
            ..Default::default()
        }
        .build();
        assert_eq!(config.detail_sample_dist, 0.0);
    }

    #[test]
    fn region_thresholds_are_areas() {
        let config = ConfigBuilder {
            min_region_size: 8,
            merge_region_size: 20,
            ..Default::default()
        }
        .build();
        assert_eq!(config.min_region_area, 64);
        assert_eq!(config.merge_region_area, 400);
    }
}
