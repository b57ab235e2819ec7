//! End-to-end builds on small synthetic scenes.

use glam::{UVec3, Vec3A, uvec3};
use voxnav::{
    Aabb3d, BuildContoursFlags, Config, NULL_INDEX, NavmeshBuild, PartitionType, PolygonMesh,
    RegionId, TriMesh, build_navmesh,
};

/// A permissive hand-rolled config for unit-sized test scenes.
fn test_config() -> Config {
    Config {
        cell_size: 1.0,
        cell_height: 0.5,
        aabb: Aabb3d::default(),
        border_size: 0,
        walkable_slope_angle: 45.0,
        walkable_height: 3,
        walkable_climb: 1,
        walkable_radius: 0,
        max_edge_len: 0,
        max_simplification_error: 1.3,
        min_region_area: 2,
        merge_region_area: 20,
        max_vertices_per_polygon: 6,
        detail_sample_dist: 0.0,
        detail_sample_max_error: 1.0,
        partition: PartitionType::Watershed,
        contour_flags: BuildContoursFlags::default(),
        area_volumes: Vec::new(),
    }
}

/// Appends a flat, upward-facing quad to the trimesh.
fn push_quad(trimesh: &mut TriMesh, min: Vec3A, size: f32, y: f32) {
    let base = trimesh.vertices.len() as u32;
    trimesh.vertices.extend([
        Vec3A::new(min.x, y, min.z),
        Vec3A::new(min.x + size, y, min.z),
        Vec3A::new(min.x + size, y, min.z + size),
        Vec3A::new(min.x, y, min.z + size),
    ]);
    trimesh.indices.extend([
        uvec3(base, base + 3, base + 2),
        uvec3(base, base + 2, base + 1),
    ]);
    trimesh
        .area_types
        .extend([voxnav::AreaType::DEFAULT_WALKABLE; 2]);
}

/// Appends a vertical wall between two ground points.
fn push_wall(trimesh: &mut TriMesh, from: Vec3A, to: Vec3A, height: f32) {
    let base = trimesh.vertices.len() as u32;
    trimesh.vertices.extend([
        from,
        to,
        Vec3A::new(to.x, to.y + height, to.z),
        Vec3A::new(from.x, from.y + height, from.z),
    ]);
    trimesh.indices.extend([
        uvec3(base, base + 1, base + 2),
        uvec3(base, base + 2, base + 3),
    ]);
    trimesh
        .area_types
        .extend([voxnav::AreaType::DEFAULT_WALKABLE; 2]);
}

fn polygon_regions(mesh: &PolygonMesh) -> Vec<RegionId> {
    let mut regions: Vec<_> = mesh.regions.clone();
    regions.sort();
    regions.dedup();
    regions
}

/// Twice the signed area of the triangle on the xz-plane.
fn area2(a: glam::U16Vec3, b: glam::U16Vec3, c: glam::U16Vec3) -> i64 {
    (b.x as i64 - a.x as i64) * (c.z as i64 - a.z as i64)
        - (c.x as i64 - a.x as i64) * (b.z as i64 - a.z as i64)
}

/// The structural post-conditions every produced polygon mesh must hold.
fn assert_polygon_mesh_invariants(mesh: &PolygonMesh) {
    let nvp = mesh.vertices_per_polygon;
    for i in 0..mesh.polygon_count() {
        let p = mesh.polygon_vertices(i);
        let nv = mesh.polygon_vertex_count(i);
        assert!((3..=nvp).contains(&nv), "polygon {i} has {nv} vertices");

        // Used slots are distinct, valid indices; unused slots are NULL.
        for j in 0..nv {
            assert!(
                (p[j] as usize) < mesh.vertices.len(),
                "polygon {i} vertex out of range"
            );
            for k in j + 1..nv {
                assert_ne!(p[j], p[k], "polygon {i} repeats vertex {}", p[j]);
            }
        }
        for &slot in &p[nv..] {
            assert_eq!(slot, NULL_INDEX);
        }

        // No reflex corner under the integer predicates.
        for j in 0..nv {
            let a = mesh.vertices[p[(j + nv - 1) % nv] as usize];
            let b = mesh.vertices[p[j] as usize];
            let c = mesh.vertices[p[(j + 1) % nv] as usize];
            assert!(area2(a, b, c) <= 0, "polygon {i} has a reflex corner");
        }

        // Neighbor links are reciprocal.
        let neighbors = mesh.polygon_neighbors(i);
        for &n in &neighbors[..nv] {
            if n == NULL_INDEX || n & 0x8000 != 0 {
                continue;
            }
            let reverse = mesh.polygon_neighbors(n as usize);
            assert!(
                reverse.contains(&(i as u16)),
                "polygon {n} does not link back to polygon {i}"
            );
        }
    }
}

fn internal_neighbor_count(mesh: &PolygonMesh, i: usize) -> usize {
    mesh.polygon_neighbors(i)
        .iter()
        .filter(|&&n| n != NULL_INDEX && n & 0x8000 == 0)
        .count()
}

fn build(trimesh: TriMesh, config: &Config) -> NavmeshBuild {
    build_navmesh(trimesh, config).unwrap()
}

#[test]
fn flat_quad_becomes_a_single_polygon() {
    let mut trimesh = TriMesh::default();
    push_quad(&mut trimesh, Vec3A::ZERO, 10.0, 0.0);

    let result = build(trimesh, &test_config());
    let mesh = &result.polygon_mesh;

    assert_eq!(polygon_regions(mesh), vec![RegionId::from(1)]);
    assert_eq!(mesh.polygon_count(), 1);
    assert_eq!(mesh.vertices.len(), 4);
    assert!(result.warnings.is_empty());
    assert_polygon_mesh_invariants(mesh);

    // One detail submesh fanning the quad into two triangles.
    assert_eq!(result.detail_mesh.meshes.len(), 1);
    assert_eq!(result.detail_mesh.triangles.len(), 2);
}

#[test]
fn separated_plates_stay_disconnected() {
    let mut trimesh = TriMesh::default();
    push_quad(&mut trimesh, Vec3A::ZERO, 4.0, 0.0);
    push_quad(&mut trimesh, Vec3A::new(7.0, 0.0, 0.0), 4.0, 0.0);

    let result = build(trimesh, &test_config());
    let mesh = &result.polygon_mesh;

    assert_eq!(polygon_regions(mesh).len(), 2);
    assert_eq!(mesh.polygon_count(), 2);
    assert_polygon_mesh_invariants(mesh);
    // No portals, no adjacency across the gap.
    for i in 0..mesh.polygon_count() {
        assert_eq!(internal_neighbor_count(mesh, i), 0);
        assert!(
            mesh.polygon_neighbors(i)
                .iter()
                .all(|&n| n == NULL_INDEX)
        );
    }
}

#[test]
fn steep_slope_produces_no_mesh() {
    // A 60 degree ramp against a 45 degree limit.
    let run = 5.0;
    let rise = run * 60_f32.to_radians().tan();
    let trimesh = TriMesh {
        vertices: vec![
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 10.0),
            Vec3A::new(run, rise, 5.0),
        ],
        indices: vec![UVec3::new(0, 1, 2)],
        area_types: vec![voxnav::AreaType::DEFAULT_WALKABLE],
    };

    let result = build(trimesh, &test_config());
    assert_eq!(result.polygon_mesh.polygon_count(), 0);
    assert!(result.detail_mesh.triangles.is_empty());
}

#[test]
fn small_island_is_removed_entirely() {
    let mut trimesh = TriMesh::default();
    push_quad(&mut trimesh, Vec3A::ZERO, 3.0, 0.0);

    let mut config = test_config();
    config.min_region_area = 64;
    let result = build(trimesh, &config);
    assert_eq!(result.polygon_mesh.polygon_count(), 0);
}

#[test]
fn plates_touching_with_float_noise_fuse_into_one_region() {
    let mut trimesh = TriMesh::default();
    push_quad(&mut trimesh, Vec3A::ZERO, 4.0, 0.0);
    push_quad(&mut trimesh, Vec3A::new(4.0, 0.0, 0.0), 4.0, 1e-4);

    let result = build(trimesh, &test_config());
    let mesh = &result.polygon_mesh;
    assert_eq!(polygon_regions(mesh), vec![RegionId::from(1)]);
    assert!(mesh.polygon_count() >= 1);
    assert_polygon_mesh_invariants(mesh);
}

#[test]
fn obstacle_on_a_plate_leaves_a_connected_ring() {
    let mut trimesh = TriMesh::default();
    push_quad(&mut trimesh, Vec3A::ZERO, 12.0, 0.0);
    // A solid block in the middle; walls are too steep to walk and tall
    // enough to wipe out the ground beneath them.
    let corners = [
        Vec3A::new(5.0, 0.0, 5.0),
        Vec3A::new(7.0, 0.0, 5.0),
        Vec3A::new(7.0, 0.0, 7.0),
        Vec3A::new(5.0, 0.0, 7.0),
    ];
    for i in 0..4 {
        push_wall(&mut trimesh, corners[i], corners[(i + 1) % 4], 2.0);
    }
    push_quad(&mut trimesh, Vec3A::new(5.0, 2.0, 5.0), 2.0, 2.0);

    let mut config = test_config();
    config.walkable_radius = 1;
    config.min_region_area = 2;
    config.merge_region_area = 0;
    config.partition = PartitionType::Monotone;

    let result = build(trimesh, &config);
    let mesh = &result.polygon_mesh;

    let regions = polygon_regions(mesh);
    assert!(
        (1..=6).contains(&regions.len()),
        "unexpected region count {}",
        regions.len()
    );
    assert!(mesh.polygon_count() >= 2);
    assert_polygon_mesh_invariants(mesh);
    // The ring is connected: no polygon is isolated.
    for i in 0..mesh.polygon_count() {
        assert!(
            internal_neighbor_count(mesh, i) >= 1,
            "polygon {i} is isolated"
        );
    }
}

#[test]
fn watershed_and_monotone_agree_on_simple_scenes() {
    for partition in [PartitionType::Watershed, PartitionType::Monotone] {
        let mut trimesh = TriMesh::default();
        push_quad(&mut trimesh, Vec3A::ZERO, 10.0, 0.0);
        let mut config = test_config();
        config.partition = partition;
        let result = build(trimesh, &config);
        assert_eq!(
            polygon_regions(&result.polygon_mesh),
            vec![RegionId::from(1)],
            "{partition:?}"
        );
        assert_polygon_mesh_invariants(&result.polygon_mesh);
    }
}

#[test]
fn detail_sampling_on_flat_ground_adds_no_vertices() {
    let mut trimesh = TriMesh::default();
    push_quad(&mut trimesh, Vec3A::ZERO, 10.0, 0.0);
    let mut config = test_config();
    config.detail_sample_dist = 2.0;
    config.detail_sample_max_error = 0.5;

    let result = build(trimesh, &config);
    assert_eq!(result.detail_mesh.meshes.len(), 1);
    // Flat ground deviates nowhere, so the submesh stays the polygon hull.
    assert_eq!(result.detail_mesh.meshes[0].vertex_count, 4);
    for tri in &result.detail_mesh.triangles {
        assert!(tri[0] < 4 && tri[1] < 4 && tri[2] < 4);
    }
}

#[test]
fn custom_area_volume_survives_to_the_polygons() {
    let mut trimesh = TriMesh::default();
    push_quad(&mut trimesh, Vec3A::ZERO, 10.0, 0.0);
    let mut config = test_config();
    config.area_volumes.push(voxnav::ConvexVolume {
        vertices: vec![
            glam::Vec2::new(3.0, 3.0),
            glam::Vec2::new(7.0, 3.0),
            glam::Vec2::new(7.0, 7.0),
            glam::Vec2::new(3.0, 7.0),
        ],
        min_y: 0.0,
        max_y: 2.0,
        area: voxnav::AreaType(5),
    });

    let result = build(trimesh, &config);
    let mesh = &result.polygon_mesh;
    assert!(mesh.areas.contains(&voxnav::AreaType(5)));
    assert!(mesh.areas.contains(&voxnav::AreaType::DEFAULT_WALKABLE));
    assert_polygon_mesh_invariants(mesh);
}
