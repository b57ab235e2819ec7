//! Stamping user area types onto spans inside convex volumes.

use glam::{IVec3, Vec2};

use crate::{CompactHeightfield, math::Aabb2d, span::AreaType};

impl CompactHeightfield {
    /// Sets the [`AreaType`] of every walkable span inside the given
    /// extruded convex polygon.
    pub fn mark_convex_poly_area(&mut self, volume: &ConvexVolume) {
        let Some(aabb) = Aabb2d::from_verts(&volume.vertices) else {
            return;
        };
        let aabb = aabb.extend_y(volume.min_y, volume.max_y);

        let inverse_cell_size = 1.0 / self.cell_size;
        let inverse_cell_height = 1.0 / self.cell_height;

        let min = (aabb.min - self.aabb.min)
            * glam::Vec3A::new(inverse_cell_size, inverse_cell_height, inverse_cell_size);
        let max = (aabb.max - self.aabb.min)
            * glam::Vec3A::new(inverse_cell_size, inverse_cell_height, inverse_cell_size);
        let mut min = IVec3::new(min.x as i32, min.y as i32, min.z as i32);
        let mut max = IVec3::new(max.x as i32, max.y as i32, max.z as i32);

        if max.x < 0 || min.x >= self.width as i32 || max.z < 0 || min.z >= self.height as i32 {
            return;
        }
        min.x = min.x.max(0);
        max.x = max.x.min(self.width as i32 - 1);
        min.z = min.z.max(0);
        max.z = max.z.min(self.height as i32 - 1);

        for z in min.z..=max.z {
            let point_z = self.aabb.min.z + (z as f32 + 0.5) * self.cell_size;
            for x in min.x..=max.x {
                let point = Vec2::new(self.aabb.min.x + (x as f32 + 0.5) * self.cell_size, point_z);
                if !point_in_poly(point, &volume.vertices) {
                    continue;
                }

                let cell = *self.cell_at(x as u16, z as u16);
                for i in cell.index_range() {
                    if !self.areas[i].is_walkable() {
                        continue;
                    }
                    let span_y = self.spans[i].y as i32;
                    if span_y >= min.y && span_y <= max.y {
                        self.areas[i] = volume.area;
                    }
                }
            }
        }
    }
}

/// Even-odd-rule point-in-polygon test on the xz-plane.
fn point_in_poly(point: Vec2, vertices: &[Vec2]) -> bool {
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let vi = vertices[i];
        let vj = vertices[j];
        if ((vi.y > point.y) != (vj.y > point.y))
            && (point.x < (vj.x - vi.x) * (point.y - vi.y) / (vj.y - vi.y) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// A convex volume assigning an [`AreaType`] to the spans it contains, via
/// [`CompactHeightfield::mark_convex_poly_area`].
#[derive(Debug, Default, PartialEq, Clone)]
pub struct ConvexVolume {
    /// The polygon vertices on the xz-plane.
    pub vertices: Vec<Vec2>,
    /// The lower y bound of the volume in world units.
    pub min_y: f32,
    /// The upper y bound of the volume in world units.
    pub max_y: f32,
    /// The area type to assign.
    pub area: AreaType,
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

    #[test]
    fn stamps_only_spans_inside_the_volume() {
        let mut compact = floor_grid(8).into_compact(2, 1).unwrap();
        compact.mark_convex_poly_area(&ConvexVolume {
            vertices: vec![
                Vec2::new(2.0, 2.0),
                Vec2::new(6.0, 2.0),
                Vec2::new(6.0, 6.0),
                Vec2::new(2.0, 6.0),
            ],
            min_y: 0.0,
            max_y: 4.0,
            area: AreaType(3),
        });
        let inside = compact.cell_at(4, 4).index() as usize;
        assert_eq!(compact.areas[inside], AreaType(3));
        let outside = compact.cell_at(0, 0).index() as usize;
        assert_eq!(compact.areas[outside], AreaType::DEFAULT_WALKABLE);
    }

    #[test]
    fn volume_above_the_floor_does_not_stamp() {
        let mut compact = floor_grid(8).into_compact(2, 1).unwrap();
        compact.mark_convex_poly_area(&ConvexVolume {
            vertices: vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(8.0, 0.0),
                Vec2::new(8.0, 8.0),
                Vec2::new(0.0, 8.0),
            ],
            min_y: 5.0,
            max_y: 7.0,
            area: AreaType(3),
        });
        assert!(compact.areas.iter().all(|a| *a == AreaType::DEFAULT_WALKABLE));
    }
}
