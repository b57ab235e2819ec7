//! In-place walkability filters applied to the solid heightfield after
//! rasterization and before compaction.

use crate::{
    heightfield::Heightfield,
    math::{dir_offset_x, dir_offset_z},
    span::{AreaType, Span},
};

impl Heightfield {
    const MAX_HEIGHTFIELD_HEIGHT: u16 = u16::MAX;

    /// Marks non-walkable spans as walkable when they sit directly on top of
    /// a walkable span and the step up to them is within `walkable_climb`.
    ///
    /// This keeps low obstacles such as curbs traversable. The decision uses
    /// the walkability each span had *before* this pass touched it, so a
    /// stack of obstacles is not promoted rung by rung.
    pub fn filter_low_hanging_walkable_obstacles(&mut self, walkable_climb: u16) {
        for z in 0..self.height {
            for x in 0..self.width {
                let mut previous_span: Option<Span> = None;
                let mut previous_was_walkable = false;
                let mut previous_area = AreaType::NOT_WALKABLE;

                let mut span_key = self.span_key_at(x, z);
                while let Some(current_span_key) = span_key {
                    let current_span = self.span(current_span_key).clone();
                    let walkable = current_span.area.is_walkable();

                    if let Some(previous_span) = previous_span.as_ref()
                        && !walkable
                        && previous_was_walkable
                        && (current_span.max as i32 - previous_span.max as i32)
                            <= walkable_climb as i32
                    {
                        self.span_mut(current_span_key).area = previous_area;
                    }

                    // Remember the original walkability, not the patched one.
                    previous_was_walkable = walkable;
                    previous_area = current_span.area;
                    previous_span = Some(current_span.clone());
                    span_key = current_span.next;
                }
            }
        }
    }

    /// Marks walkable spans that sit next to a ledge as not walkable.
    ///
    /// A span is a ledge if the drop to any neighbor the agent could
    /// otherwise reach exceeds `walkable_climb`, or if the accessible
    /// neighbor floors spread further apart than `walkable_climb`
    /// (a steep traversal the slope filter missed at voxel resolution).
    pub fn filter_ledge_spans(&mut self, walkable_height: u16, walkable_climb: u16) {
        for z in 0..self.height {
            for x in 0..self.width {
                let mut span_key = self.span_key_at(x, z);
                while let Some(current_span_key) = span_key {
                    let span = self.span(current_span_key).clone();
                    span_key = span.next;

                    if !span.area.is_walkable() {
                        continue;
                    }

                    let floor = span.max as i32;
                    let ceiling = span
                        .next
                        .map(|key| self.span(key).min as i32)
                        .unwrap_or(Self::MAX_HEIGHTFIELD_HEIGHT as i32);

                    // Lowest floor delta to any neighbor the agent can fit
                    // through, and the extremes among reachable floors.
                    let mut lowest_neighbor_floor_difference = Self::MAX_HEIGHTFIELD_HEIGHT as i32;
                    let mut lowest_traversable_neighbor_floor = span.max as i32;
                    let mut highest_traversable_neighbor_floor = span.max as i32;

                    for direction in 0..4 {
                        let neighbor_x = x as i32 + dir_offset_x(direction) as i32;
                        let neighbor_z = z as i32 + dir_offset_z(direction) as i32;

                        // The grid edge counts as a bottomless drop.
                        if !self.contains(neighbor_x, neighbor_z) {
                            lowest_neighbor_floor_difference = -(walkable_climb as i32) - 1;
                            break;
                        }

                        let mut neighbor_key =
                            self.span_key_at(neighbor_x as u16, neighbor_z as u16);

                        // The open volume below the neighbor column's first span.
                        let mut neighbor_ceiling = neighbor_key
                            .map(|key| self.span(key).min as i32)
                            .unwrap_or(Self::MAX_HEIGHTFIELD_HEIGHT as i32);

                        if ceiling.min(neighbor_ceiling) - floor >= walkable_height as i32 {
                            lowest_neighbor_floor_difference = -(walkable_climb as i32) - 1;
                            break;
                        }

                        while let Some(current_neighbor_key) = neighbor_key {
                            let neighbor_span = self.span(current_neighbor_key);
                            neighbor_key = neighbor_span.next;
                            let neighbor_floor = neighbor_span.max as i32;
                            neighbor_ceiling = neighbor_span
                                .next
                                .map(|key| self.span(key).min as i32)
                                .unwrap_or(Self::MAX_HEIGHTFIELD_HEIGHT as i32);

                            // Shared headroom must fit the agent for the
                            // neighbor to count at all.
                            if ceiling.min(neighbor_ceiling) - floor.max(neighbor_floor)
                                < walkable_height as i32
                            {
                                continue;
                            }

                            let neighbor_floor_difference = neighbor_floor - floor;
                            lowest_neighbor_floor_difference =
                                lowest_neighbor_floor_difference.min(neighbor_floor_difference);

                            if neighbor_floor_difference.abs() <= walkable_climb as i32 {
                                lowest_traversable_neighbor_floor =
                                    lowest_traversable_neighbor_floor.min(neighbor_floor);
                                highest_traversable_neighbor_floor =
                                    highest_traversable_neighbor_floor.max(neighbor_floor);
                            } else if neighbor_floor_difference < -(walkable_climb as i32) {
                                // Already a ledge, no need to scan further.
                                break;
                            }
                        }
                    }

                    let is_ledge = lowest_neighbor_floor_difference < -(walkable_climb as i32)
                        || highest_traversable_neighbor_floor - lowest_traversable_neighbor_floor
                            > walkable_climb as i32;
                    if is_ledge {
                        self.span_mut(current_span_key).area = AreaType::NOT_WALKABLE;
                    }
                }
            }
        }
    }

    /// Marks walkable spans without `walkable_height` of clearance above
    /// them as not walkable.
    pub fn filter_walkable_low_height_spans(&mut self, walkable_height: u16) {
        for z in 0..self.height {
            for x in 0..self.width {
                let mut span_key = self.span_key_at(x, z);
                while let Some(current_span_key) = span_key {
                    let span = self.span(current_span_key);
                    let floor = span.max as i32;
                    let ceiling = span
                        .next
                        .map(|key| self.span(key).min as i32)
                        .unwrap_or(Self::MAX_HEIGHTFIELD_HEIGHT as i32);
                    let next = span.next;
                    if ceiling - floor < walkable_height as i32 {
                        self.span_mut(current_span_key).area = AreaType::NOT_WALKABLE;
                    }
                    span_key = next;
                }
            }
        }
    }
}
