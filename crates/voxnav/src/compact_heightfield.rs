//! The compact heightfield: a dense array of walkable spans with
//! 4-neighbor connectivity, distance and region data.

use crate::{
    compact_cell::CompactCell,
    compact_span::CompactSpan,
    heightfield::Heightfield,
    math::{Aabb3d, dir_offset_x, dir_offset_z},
    region::RegionId,
    span::AreaType,
};

/// A compact, static heightfield representing unobstructed space.
///
/// Spans here are the open air columns above walkable surfaces of a solid
/// [`Heightfield`]. The data is contiguous: `cells[x + z * width]` slices
/// into `spans`, `areas` and `dist`, which all share indexing.
///
/// Axis-neighbors are addressed per direction as
///
/// ```txt
/// Direction 0 = (-1, 0)
/// Direction 1 = (0, 1)
/// Direction 2 = (1, 0)
/// Direction 3 = (0, -1)
/// ```
///
/// with each connection storing the neighbor span's local index inside its
/// cell (see [`CompactSpan::con`] and [`CompactHeightfield::con_indices`]).
#[derive(Debug, Default, Clone)]
pub struct CompactHeightfield {
    /// The width of the heightfield along the x-axis in cell units
    pub width: u16,
    /// The height of the heightfield along the z-axis in cell units
    pub height: u16,
    /// The walkable height used during the build of the field
    pub walkable_height: u16,
    /// The walkable climb used during the build of the field
    pub walkable_climb: u16,
    /// The AABB border size used during region building
    pub border_size: u16,
    /// The maximum distance-field value of any span within the field
    pub max_distance: u16,
    /// The maximum region id of any span within the field
    pub max_region: RegionId,
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
    /// The cells of the grid. [Size: `width * height`]
    pub cells: Vec<CompactCell>,
    /// All walkable spans. [Shared indexing with `areas` and `dist`]
    pub spans: Vec<CompactSpan>,
    /// Border distance data, filled by the distance field stage. [Size: `spans.len()`]
    pub dist: Vec<u16>,
    /// Area type per span. [Size: `spans.len()`]
    pub areas: Vec<AreaType>,
}

impl Heightfield {
    const MAX_HEIGHT: u16 = u16::MAX;

    /// Builds the compact heightfield from this solid heightfield, keeping
    /// one compact span per walkable solid span and wiring up the
    /// 4-neighbor connections.
    ///
    /// A neighbor is connected when the floors differ by at most
    /// `walkable_climb` and the shared headroom between the two columns is
    /// at least `walkable_height`.
    ///
    /// # Errors
    ///
    /// Returns an error if any cell holds more walkable spans than the
    /// 6-bit connection encoding can address.
    pub fn into_compact(
        self,
        walkable_height: u16,
        walkable_climb: u16,
    ) -> Result<CompactHeightfield, CompactHeightfieldError> {
        let walkable_span_count = self
            .allocated_spans
            .values()
            .filter(|span| span.area.is_walkable())
            .count();

        let mut compact = CompactHeightfield {
            width: self.width,
            height: self.height,
            walkable_height,
            walkable_climb,
            border_size: 0,
            max_distance: 0,
            max_region: RegionId::NONE,
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            cells: vec![CompactCell::default(); self.width as usize * self.height as usize],
            spans: vec![CompactSpan::default(); walkable_span_count],
            dist: vec![],
            areas: vec![AreaType::NOT_WALKABLE; walkable_span_count],
        };
        // Room for the agent standing on the topmost surface.
        compact.aabb.max.y += walkable_height as f32 * compact.cell_height;

        let mut cell_index = 0_usize;
        for z in 0..self.height {
            for x in 0..self.width {
                let Some(span_key) = self.span_key_at(x, z) else {
                    // Empty column: stays at index=0, count=0.
                    continue;
                };
                let mut span_key_iter = Some(span_key);
                let column_index = self.column_index(x, z);

                let cell = &mut compact.cells[column_index];
                cell.set_index(cell_index as u32);
                cell.set_count(0);

                while let Some(span_key) = span_key_iter {
                    let span = self.span(span_key);
                    span_key_iter = span.next;
                    if !span.area.is_walkable() {
                        continue;
                    }
                    let bot = span.max;
                    let top = span
                        .next
                        .map(|key| self.span(key).min)
                        .unwrap_or(Self::MAX_HEIGHT);
                    compact.spans[cell_index].y = bot;
                    let height = (top.saturating_sub(bot)).min(u8::MAX.into()) as u8;
                    compact.spans[cell_index].set_height(height);
                    compact.areas[cell_index] = span.area;
                    cell_index += 1;
                    cell.inc_count();
                }
            }
        }

        // Wire up the neighbor connections.
        const MAX_LAYERS: u8 = CompactSpan::NOT_CONNECTED - 1;
        let mut max_layer_index = 0_u32;
        for z in 0..self.height {
            for x in 0..self.width {
                let column_index = self.column_index(x, z);
                let cell = compact.cells[column_index];
                for i in cell.index_range() {
                    for dir in 0..4_u8 {
                        compact.spans[i].set_con(dir, None);
                        let neighbor_x = x as i32 + dir_offset_x(dir) as i32;
                        let neighbor_z = z as i32 + dir_offset_z(dir) as i32;
                        if !self.contains(neighbor_x, neighbor_z) {
                            continue;
                        }

                        let neighbor_column_index =
                            self.column_index(neighbor_x as u16, neighbor_z as u16);
                        let neighbor_cell = compact.cells[neighbor_column_index];
                        let span = compact.spans[i].clone();
                        for k in neighbor_cell.index_range() {
                            let neighbor_span = &compact.spans[k];
                            let bot = span.y.max(neighbor_span.y) as i32;
                            let top = (span.y as i32 + span.height() as i32)
                                .min(neighbor_span.y as i32 + neighbor_span.height() as i32);

                            let fits_agent = (top - bot) >= walkable_height as i32;
                            let climbable = (neighbor_span.y as i32 - span.y as i32).abs()
                                <= walkable_climb as i32;
                            if !fits_agent || !climbable {
                                continue;
                            }
                            let layer_index = k as i32 - neighbor_cell.index() as i32;
                            if layer_index < 0 || layer_index >= MAX_LAYERS as i32 {
                                max_layer_index = max_layer_index.max(layer_index as u32);
                                continue;
                            }
                            compact.spans[i].set_con(dir, Some(layer_index as u8));
                            break;
                        }
                    }
                }
            }
        }
        if max_layer_index > MAX_LAYERS as u32 {
            return Err(CompactHeightfieldError::TooManyLayers {
                max_layer_index: MAX_LAYERS,
                layer_index: max_layer_index,
            });
        }
        Ok(compact)
    }
}

impl CompactHeightfield {
    #[inline]
    pub(crate) fn column_index(&self, x: u16, z: u16) -> usize {
        x as usize + z as usize * self.width as usize
    }

    /// Returns the cell at the given coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    #[inline]
    pub fn cell_at(&self, x: u16, z: u16) -> &CompactCell {
        &self.cells[self.column_index(x, z)]
    }

    /// Given a span at `(x, z)`, a direction, and that direction's
    /// connection value, returns the neighbor's `(x, z)` and its index into
    /// [`Self::spans`].
    #[inline]
    pub fn con_indices(&self, x: i32, z: i32, dir: u8, con: u8) -> (i32, i32, usize) {
        let a_x = x + dir_offset_x(dir) as i32;
        let a_z = z + dir_offset_z(dir) as i32;
        let cell_index = (a_x + a_z * self.width as i32) as usize;
        let a_i = self.cells[cell_index].index() as usize + con as usize;
        (a_x, a_z, a_i)
    }
}

/// Errors that can occur when building a compact heightfield.
#[derive(Debug, thiserror::Error)]
pub enum CompactHeightfieldError {
    /// A cell holds more walkable spans than the connection encoding can address.
    #[error(
        "Heightfield has too many layers. Max layer index is {max_layer_index}, but got {layer_index}"
    )]
    TooManyLayers {
        /// The maximum addressable layer index.
        max_layer_index: u8,
        /// The layer index that was encountered.
        layer_index: u32,
    },
}

#[cfg(test)]
mod tests {
    use glam::Vec3A;

    use crate::{
        HeightfieldBuilder,
        heightfield::SpanInsertion,
        span::Span,
    };

    use super::*;

    fn solid_floor(size: u16, floor: u16) -> Heightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3A::ZERO, Vec3A::new(size as f32, 20.0, size as f32)),
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
                            max: floor,
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
    fn every_walkable_span_survives_compaction() {
        let compact = solid_floor(4, 2).into_compact(2, 1).unwrap();
        assert_eq!(compact.spans.len(), 16);
        for z in 0..4 {
            for x in 0..4 {
                let cell = compact.cell_at(x, z);
                assert_eq!(cell.count(), 1);
                let span = &compact.spans[cell.index() as usize];
                assert_eq!(span.y, 2);
            }
        }
    }

    #[test]
    fn connections_are_reciprocal() {
        let compact = solid_floor(4, 2).into_compact(2, 1).unwrap();
        for z in 0..4_u16 {
            for x in 0..4_u16 {
                let cell = compact.cell_at(x, z);
                for i in cell.index_range() {
                    for dir in 0..4 {
                        let Some(con) = compact.spans[i].con(dir) else {
                            // Missing connections only at the grid edge.
                            let nx = x as i32 + dir_offset_x(dir) as i32;
                            let nz = z as i32 + dir_offset_z(dir) as i32;
                            assert!(nx < 0 || nx >= 4 || nz < 0 || nz >= 4);
                            continue;
                        };
                        let (nx, nz, ni) = compact.con_indices(x as i32, z as i32, dir, con);
                        let reverse_dir = (dir + 2) & 0x3;
                        let reverse_con = compact.spans[ni].con(reverse_dir).unwrap();
                        let (_, _, back) = compact.con_indices(nx, nz, reverse_dir, reverse_con);
                        assert_eq!(back, i);
                    }
                }
            }
        }
    }

    #[test]
    fn unreachable_floors_are_not_connected() {
        let mut heightfield = solid_floor(2, 2);
        // Raise one column far above walkable climb.
        heightfield
            .add_span(SpanInsertion {
                x: 1,
                z: 0,
                flag_merge_threshold: 1,
                span: Span {
                    min: 0,
                    max: 10,
                    area: AreaType::DEFAULT_WALKABLE,
                    next: None,
                },
            })
            .unwrap();
        let compact = heightfield.into_compact(2, 1).unwrap();
        let cell = compact.cell_at(0, 0);
        let span = &compact.spans[cell.index() as usize];
        // Direction 2 = (+1, 0) points at the raised column.
        assert_eq!(span.con(2), None);
        assert!(span.con(1).is_some());
    }

    #[test]
    fn clearance_is_ceiling_minus_floor() {
        let mut heightfield = solid_floor(2, 2);
        heightfield
            .add_span(SpanInsertion {
                x: 0,
                z: 0,
                flag_merge_threshold: 1,
                span: Span {
                    min: 8,
                    max: 9,
                    area: AreaType::NOT_WALKABLE,
                    next: None,
                },
            })
            .unwrap();
        let compact = heightfield.into_compact(2, 1).unwrap();
        let covered = &compact.spans[compact.cell_at(0, 0).index() as usize];
        assert_eq!(covered.height(), 6);
        let open = &compact.spans[compact.cell_at(1, 1).index() as usize];
        assert_eq!(open.height(), u8::MAX);
    }
}
