//! Construction of polygonal navigation meshes from triangle soup.
//!
//! The pipeline voxelizes the walkable surfaces of a world into a
//! [`Heightfield`], filters and compacts it, partitions the result into
//! regions, traces and simplifies their contours, and finally produces a
//! [`PolygonMesh`] of convex n-gons plus a height-accurate
//! [`DetailNavmesh`]. Run the whole chain with [`build_navmesh`], or call
//! the stages individually for custom setups.

mod compact_cell;
mod compact_heightfield;
mod compact_span;
mod config;
mod contours;
mod detail_mesh;
mod distance_field;
mod erosion;
mod generator;
mod heightfield;
mod mark_convex_poly_area;
pub(crate) mod math;
mod monotone;
mod poly_mesh;
mod pre_filter;
mod rasterize;
mod region;
mod span;
mod trimesh;
mod watershed;

pub use compact_cell::CompactCell;
pub use compact_heightfield::{CompactHeightfield, CompactHeightfieldError};
pub use compact_span::CompactSpan;
pub use config::{Config, ConfigBuilder, PartitionType};
pub use contours::{BuildContoursFlags, Contour, ContourSet, RegionVertexId};
pub use detail_mesh::{DETAIL_EDGE_BOUNDARY, DetailMeshError, DetailNavmesh, SubMesh};
pub use generator::{
    BuildNavmeshError, BuildWarning, ConfigValidationError, GeometryValidationError, NavmeshBuild,
    build_navmesh,
};
pub use heightfield::{Heightfield, HeightfieldBuilder, HeightfieldBuilderError};
pub use mark_convex_poly_area::ConvexVolume;
pub use math::{Aabb2d, Aabb3d};
pub use poly_mesh::{NULL_INDEX, PolygonMesh, PolygonMeshError};
pub use rasterize::{PolygonDivisionError, RasterizationError};
pub use region::RegionId;
pub use span::{AreaType, Span, SpanKey, Spans};
pub use trimesh::TriMesh;
pub use watershed::BuildRegionsError;
