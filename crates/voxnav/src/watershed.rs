//! Watershed region partitioning, plus the region merge & filter machinery
//! shared with the monotone partitioner.

use crate::{CompactHeightfield, RegionId, span::AreaType};

impl CompactHeightfield {
    /// Partitions the walkable area into regions by flooding the distance
    /// field from its peaks downwards.
    ///
    /// Every non-null region ends up as a set of connected, non-overlapping
    /// spans forming a single contour. Regions whose connected component is
    /// smaller than `min_region_area` spans are deleted unless they touch a
    /// border region; regions at or below `merge_region_area` spans are
    /// merged into their smallest eligible neighbor.
    ///
    /// When `border_size > 0`, a ring that wide along the grid edge is
    /// painted with dedicated border region ids first, which keeps regions
    /// touching the grid edge from being judged "small".
    ///
    /// The distance field must have been built with
    /// [`CompactHeightfield::build_distance_field`] first.
    pub fn build_regions(
        &mut self,
        border_size: u16,
        min_region_area: u16,
        merge_region_area: u16,
    ) -> Result<(), BuildRegionsError> {
        const LOG_NB_STACKS: usize = 3;
        const NB_STACKS: usize = 1 << LOG_NB_STACKS;
        let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS] = [const { Vec::new() }; NB_STACKS];
        for stack in &mut level_stacks {
            stack.reserve(256);
        }
        let mut stack: Vec<LevelStackEntry> = Vec::with_capacity(256);

        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let mut src_dist = vec![0_u16; self.spans.len()];

        let mut region_id = RegionId::from(1);
        let mut level = (self.max_distance + 1) & !1;

        // How far expansion may outrun the current level before new seeds
        // are planted. Higher values produce fewer, simpler regions.
        let expand_iters = 8;

        if border_size > 0 {
            let border_width = border_size.min(self.width);
            let border_height = border_size.min(self.height);

            // Paint the four edge strips as border regions.
            self.paint_rect_region(
                0,
                border_width,
                0,
                self.height,
                region_id | RegionId::BORDER_REGION,
                &mut src_reg,
            );
            region_id += 1;
            self.paint_rect_region(
                self.width - border_width,
                self.width,
                0,
                self.height,
                region_id | RegionId::BORDER_REGION,
                &mut src_reg,
            );
            region_id += 1;
            self.paint_rect_region(
                0,
                self.width,
                0,
                border_height,
                region_id | RegionId::BORDER_REGION,
                &mut src_reg,
            );
            region_id += 1;
            self.paint_rect_region(
                0,
                self.width,
                self.height - border_height,
                self.height,
                region_id | RegionId::BORDER_REGION,
                &mut src_reg,
            );
            region_id += 1;
        }
        self.border_size = border_size;

        let mut stack_id = -1_i32;
        while level > 0 {
            level = level.saturating_sub(2);
            stack_id = (stack_id + 1) & (NB_STACKS as i32 - 1);

            if stack_id == 0 {
                self.sort_cells_by_level(level, &src_reg, &mut level_stacks, 1);
            } else {
                // Carry over unassigned spans from the previous level.
                let (processed, remaining) = level_stacks.split_at_mut(stack_id as usize);
                append_stacks(&processed[stack_id as usize - 1], &mut remaining[0], &src_reg);
            }

            self.expand_regions(
                expand_iters,
                level,
                &mut src_reg,
                &mut src_dist,
                &mut level_stacks[stack_id as usize],
                false,
            );

            // Flood fresh regions from spans still unassigned at this level.
            for entry in level_stacks[stack_id as usize].iter() {
                let Some(i) = entry.index else {
                    continue;
                };
                if src_reg[i] == RegionId::NONE
                    && self.flood_region(entry, level, region_id, &mut src_reg, &mut src_dist, &mut stack)
                {
                    if region_id == RegionId::MAX {
                        return Err(BuildRegionsError::RegionIdOverflow);
                    }
                    region_id += 1;
                }
            }
        }

        // Mop up anything the leveled expansion missed.
        self.expand_regions(expand_iters * 8, 0, &mut src_reg, &mut src_dist, &mut stack, true);

        self.max_region = region_id;
        let overlaps = self.merge_and_filter_regions(min_region_area, merge_region_area, &mut src_reg);
        if !overlaps.is_empty() {
            tracing::error!(
                "{len} overlapping regions remain after merging",
                len = overlaps.len()
            );
        }

        for (span, reg) in self.spans.iter_mut().zip(src_reg.iter()) {
            span.region = *reg;
        }

        Ok(())
    }

    /// Builds `Region` bookkeeping for every id, then deletes small
    /// connected components, merges small regions into neighbors, and
    /// compacts the surviving ids into `1..=max_region`.
    ///
    /// Returns the ids of regions found to vertically overlap themselves.
    pub(crate) fn merge_and_filter_regions(
        &mut self,
        min_region_area: u16,
        merge_region_area: u16,
        src_reg: &mut [RegionId],
    ) -> Vec<RegionId> {
        let w = self.width;
        let h = self.height;

        let nreg = self.max_region.bits() as usize + 1;
        let mut regions = (0..nreg)
            .map(|i| Region::new(RegionId::from(i as u16)))
            .collect::<Vec<_>>();

        // Gather span counts, vertical floor lists, and boundary contours.
        for z in 0..h {
            for x in 0..w {
                let cell = *self.cell_at(x, z);
                for i in cell.index_range() {
                    let r = src_reg[i];
                    if r == RegionId::NONE || r.bits() as usize >= nreg {
                        continue;
                    }
                    let region = &mut regions[r.bits() as usize];
                    region.span_count += 1;

                    // Regions stacked in the same column are "floors" of
                    // each other; a region overlapping itself is malformed.
                    for j in cell.index_range() {
                        if i == j {
                            continue;
                        }
                        let floor_id = src_reg[j];
                        if floor_id == RegionId::NONE || floor_id.bits() as usize >= nreg {
                            continue;
                        }
                        if floor_id == r {
                            region.overlap = true;
                        }
                        region.add_unique_floor_region(floor_id);
                    }

                    if !region.connections.is_empty() {
                        continue;
                    }

                    region.area = self.areas[i];

                    // First span of the region that touches a boundary:
                    // walk the contour to record the neighbor sequence.
                    let boundary_dir = (0..4).find(|&dir| self.is_solid_edge(src_reg, x, z, i, dir));
                    if let Some(dir) = boundary_dir {
                        let mut connections = core::mem::take(&mut region.connections);
                        self.walk_region_contour(x, z, i, dir, src_reg, &mut connections);
                        regions[r.bits() as usize].connections = connections;
                    }
                }
            }
        }

        // Delete small, border-free connected components outright.
        let mut stack = Vec::with_capacity(32);
        let mut trace = Vec::with_capacity(32);
        for i in 0..nreg {
            let region = &mut regions[i];
            if region.id == RegionId::NONE || region.id.intersects(RegionId::BORDER_REGION) {
                continue;
            }
            if region.span_count == 0 || region.visited {
                continue;
            }

            let mut connects_to_border = false;
            let mut span_count = 0;
            stack.clear();
            trace.clear();

            region.visited = true;
            stack.push(i);

            while let Some(ri) = stack.pop() {
                let connections = regions[ri].connections.clone();
                span_count += regions[ri].span_count;
                trace.push(ri);

                for connection in connections {
                    if connection.intersects(RegionId::BORDER_REGION) {
                        connects_to_border = true;
                        continue;
                    }
                    let neighbor = &mut regions[connection.bits() as usize];
                    if neighbor.visited
                        || neighbor.id == RegionId::NONE
                        || neighbor.id.intersects(RegionId::BORDER_REGION)
                    {
                        continue;
                    }
                    neighbor.visited = true;
                    stack.push(neighbor.id.bits() as usize);
                }
            }

            // Size of regions touching the border cannot be estimated from
            // this grid alone, so they are never deleted here.
            if span_count < min_region_area as usize && !connects_to_border {
                for &ri in trace.iter() {
                    regions[ri].span_count = 0;
                    regions[ri].id = RegionId::NONE;
                }
            }
        }

        // Merge small regions into their smallest mergeable neighbor until
        // nothing changes.
        loop {
            let mut merge_count = 0;
            for i in 0..nreg {
                let region = regions[i].clone();
                if region.id == RegionId::NONE || region.id.intersects(RegionId::BORDER_REGION) {
                    continue;
                }
                if region.overlap || region.span_count == 0 {
                    continue;
                }
                if region.span_count > merge_region_area as usize
                    && region.is_connected_to_border()
                {
                    continue;
                }

                let mut smallest = usize::MAX;
                let mut merge_id = region.id;
                for connection in region.connections.iter() {
                    if connection.intersects(RegionId::BORDER_REGION) {
                        continue;
                    }
                    let candidate = &regions[connection.bits() as usize];
                    if candidate.id == RegionId::NONE
                        || candidate.id.intersects(RegionId::BORDER_REGION)
                        || candidate.overlap
                    {
                        continue;
                    }
                    if candidate.span_count < smallest
                        && region.can_merge_with(candidate)
                        && candidate.can_merge_with(&region)
                    {
                        smallest = candidate.span_count;
                        merge_id = candidate.id;
                    }
                }
                if merge_id == region.id {
                    continue;
                }
                let old_id = region.id;
                let mut target = regions[merge_id.bits() as usize].clone();
                if target.merge_with(&region) {
                    regions[merge_id.bits() as usize] = target;
                    regions[i].span_count = 0;
                    regions[i].connections.clear();
                    // Point everything that referenced the merged region at
                    // its new id.
                    for region in regions.iter_mut() {
                        if region.id == RegionId::NONE
                            || region.id.intersects(RegionId::BORDER_REGION)
                        {
                            continue;
                        }
                        if region.id == old_id {
                            region.id = merge_id;
                        }
                        region.replace_neighbour(old_id, merge_id);
                    }
                    merge_count += 1;
                }
            }
            if merge_count == 0 {
                break;
            }
        }

        // Compact ids into a dense 1..=n range.
        for region in regions.iter_mut() {
            region.remap =
                !(region.id == RegionId::NONE || region.id.intersects(RegionId::BORDER_REGION));
        }
        let mut next_id = 0;
        for i in 0..nreg {
            if !regions[i].remap {
                continue;
            }
            let old_id = regions[i].id;
            next_id += 1;
            let new_id = RegionId::from(next_id);
            for region in regions[i..].iter_mut() {
                if region.id == old_id {
                    region.id = new_id;
                    region.remap = false;
                }
            }
        }
        self.max_region = RegionId::from(next_id);

        for reg in src_reg.iter_mut() {
            if !reg.intersects(RegionId::BORDER_REGION) {
                *reg = regions[reg.bits() as usize].id;
            }
        }

        regions
            .iter()
            .filter(|region| region.overlap)
            .map(|region| region.id)
            .collect()
    }

    /// Walks the 4-connected boundary of a region, recording the region id
    /// seen across each boundary edge. Adjacent duplicates are collapsed,
    /// so the result is the region's neighbor sequence in contour order.
    pub(crate) fn walk_region_contour(
        &self,
        mut x: u16,
        mut z: u16,
        mut i: usize,
        mut dir: u8,
        src_reg: &[RegionId],
        connections: &mut Vec<RegionId>,
    ) {
        let start_dir = dir;
        let start_i = i;

        let start_span = &self.spans[i];
        let mut current_region = RegionId::NONE;
        if let Some(con) = start_span.con(dir) {
            let (_, _, a_i) = self.con_indices(x as i32, z as i32, dir, con);
            current_region = src_reg[a_i];
        }
        connections.push(current_region);

        // Bounded for safety on malformed connectivity.
        for _ in 0..40_000 {
            let span = &self.spans[i];
            if self.is_solid_edge(src_reg, x, z, i, dir) {
                let mut r = RegionId::NONE;
                if let Some(con) = span.con(dir) {
                    let (_, _, a_i) = self.con_indices(x as i32, z as i32, dir, con);
                    r = src_reg[a_i];
                }
                if r != current_region {
                    current_region = r;
                    connections.push(current_region);
                }
                // Rotate clockwise.
                dir = (dir + 1) & 0x3;
            } else {
                let Some(con) = span.con(dir) else {
                    // Boundary claims walkable but the connection is gone.
                    return;
                };
                let (n_x, n_z, n_i) = self.con_indices(x as i32, z as i32, dir, con);
                x = n_x as u16;
                z = n_z as u16;
                i = n_i;
                // Rotate counter-clockwise.
                dir = (dir + 3) & 0x3;
            }
            if start_i == i && start_dir == dir {
                break;
            }
        }

        // Collapse adjacent duplicates, including the wrap-around pair.
        if connections.len() > 1 {
            let mut j = 0;
            while j < connections.len() {
                let nj = (j + 1) % connections.len();
                if connections[j] == connections[nj] {
                    connections.remove(j);
                } else {
                    j += 1;
                }
            }
        }
    }

    pub(crate) fn is_solid_edge(
        &self,
        src_reg: &[RegionId],
        x: u16,
        z: u16,
        i: usize,
        dir: u8,
    ) -> bool {
        let span = &self.spans[i];
        let mut r = RegionId::NONE;
        if let Some(con) = span.con(dir) {
            let (_, _, a_i) = self.con_indices(x as i32, z as i32, dir, con);
            r = src_reg[a_i];
        }
        r != src_reg[i]
    }

    /// Flood-fills a fresh region out of `entry`, claiming connected
    /// same-area spans with `dist >= level - 2`. Cells bordering a foreign
    /// region are released again so watersheds do not merge.
    fn flood_region(
        &self,
        entry: &LevelStackEntry,
        level: u16,
        region: RegionId,
        src_reg: &mut [RegionId],
        src_dist: &mut [u16],
        stack: &mut Vec<LevelStackEntry>,
    ) -> bool {
        // Entry indices are filtered by the caller.
        let i = entry.index.unwrap();
        let area = self.areas[i];

        stack.clear();
        stack.push(entry.clone());
        src_reg[i] = region;
        src_dist[i] = 0;

        let level = level.saturating_sub(2);
        let mut count = 0;

        while let Some(current) = stack.pop() {
            let Some(ci) = current.index else {
                continue;
            };
            let cx = current.x;
            let cz = current.z;
            let span = &self.spans[ci];

            // Reject the cell if an 8-neighbor already belongs to another
            // region of the same area.
            let mut foreign_region = RegionId::NONE;
            for dir in 0..4 {
                let Some(con) = span.con(dir) else {
                    continue;
                };
                let (a_x, a_z, a_i) = self.con_indices(cx as i32, cz as i32, dir, con);
                if self.areas[a_i] != area {
                    continue;
                }
                let nr = src_reg[a_i];
                if nr.intersects(RegionId::BORDER_REGION) {
                    // Borders do not count.
                    break;
                }
                if nr != RegionId::NONE && nr != region {
                    foreign_region = nr;
                    break;
                }

                let diagonal_dir = (dir + 1) & 0x3;
                if let Some(con) = self.spans[a_i].con(diagonal_dir) {
                    let (_, _, b_i) = self.con_indices(a_x, a_z, diagonal_dir, con);
                    if self.areas[b_i] != area {
                        continue;
                    }
                    let nr = src_reg[b_i];
                    if nr != RegionId::NONE && nr != region {
                        foreign_region = nr;
                        break;
                    }
                }
            }
            if foreign_region != RegionId::NONE {
                src_reg[ci] = RegionId::NONE;
                continue;
            }

            count += 1;

            for dir in 0..4 {
                let Some(con) = span.con(dir) else {
                    continue;
                };
                let (a_x, a_z, a_i) = self.con_indices(cx as i32, cz as i32, dir, con);
                if self.areas[a_i] != area {
                    continue;
                }
                if self.dist[a_i] >= level && src_reg[a_i] == RegionId::NONE {
                    src_reg[a_i] = region;
                    src_dist[a_i] = 0;
                    stack.push(LevelStackEntry {
                        x: a_x as u16,
                        z: a_z as u16,
                        index: Some(a_i),
                    });
                }
            }
        }
        count > 0
    }

    /// Assigns `region` to every walkable span in the given rectangle.
    fn paint_rect_region(
        &self,
        min_x: u16,
        max_x: u16,
        min_z: u16,
        max_z: u16,
        region: RegionId,
        src_reg: &mut [RegionId],
    ) {
        for z in min_z..max_z {
            for x in min_x..max_x {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    if self.areas[i].is_walkable() {
                        src_reg[i] = region;
                    }
                }
            }
        }
    }

    /// Buckets every unassigned walkable span into one of the level stacks
    /// by how far below `start_level` its distance value lies.
    fn sort_cells_by_level(
        &self,
        start_level: u16,
        src_reg: &[RegionId],
        stacks: &mut [Vec<LevelStackEntry>],
        log_levels_per_stack: u16,
    ) {
        let start_level = start_level >> log_levels_per_stack;
        for stack in stacks.iter_mut() {
            stack.clear();
        }

        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    if !self.areas[i].is_walkable() || src_reg[i] != RegionId::NONE {
                        continue;
                    }
                    let level = self.dist[i] >> log_levels_per_stack;
                    let stack_id = start_level.saturating_sub(level);
                    if stack_id >= stacks.len() as u16 {
                        continue;
                    }
                    stacks[stack_id as usize].push(LevelStackEntry {
                        x,
                        z,
                        index: Some(i),
                    });
                }
            }
        }
    }

    /// Grows existing regions into unassigned spans with `dist >= level`.
    ///
    /// Updates are staged in a dirty list per sweep so every adoption
    /// decision reads the start-of-sweep snapshot.
    fn expand_regions(
        &self,
        max_iter: u16,
        level: u16,
        src_reg: &mut [RegionId],
        src_dist: &mut [u16],
        stack: &mut Vec<LevelStackEntry>,
        fill_stack: bool,
    ) {
        if fill_stack {
            stack.clear();
            for z in 0..self.height {
                for x in 0..self.width {
                    let cell = self.cell_at(x, z);
                    for i in cell.index_range() {
                        if self.dist[i] >= level
                            && src_reg[i] == RegionId::NONE
                            && self.areas[i].is_walkable()
                        {
                            stack.push(LevelStackEntry {
                                x,
                                z,
                                index: Some(i),
                            });
                        }
                    }
                }
            }
        } else {
            // Retire entries that gained a region since they were stacked.
            for entry in stack.iter_mut() {
                let Some(i) = entry.index else {
                    continue;
                };
                if src_reg[i] != RegionId::NONE {
                    entry.index = None;
                }
            }
        }

        let mut dirty_entries = Vec::new();
        let mut iter = 0;
        while !stack.is_empty() {
            let mut failed = 0;
            dirty_entries.clear();

            for entry in stack.iter_mut() {
                let Some(i) = entry.index else {
                    failed += 1;
                    continue;
                };
                let x = entry.x;
                let z = entry.z;

                let mut r = src_reg[i];
                let mut closest = u16::MAX;
                let area = self.areas[i];
                let span = &self.spans[i];
                for dir in 0..4 {
                    let Some(con) = span.con(dir) else {
                        continue;
                    };
                    let (_, _, a_i) = self.con_indices(x as i32, z as i32, dir, con);
                    if self.areas[a_i] != area {
                        continue;
                    }
                    let neighbor_region = src_reg[a_i];
                    let neighbor_dist = src_dist[a_i].saturating_add(2);
                    if neighbor_region != RegionId::NONE
                        && !neighbor_region.intersects(RegionId::BORDER_REGION)
                        && neighbor_dist < closest
                    {
                        r = neighbor_region;
                        closest = neighbor_dist;
                    }
                }
                if r != RegionId::NONE {
                    entry.index = None;
                    dirty_entries.push(DirtyEntry {
                        index: i,
                        region: r,
                        distance: closest,
                    });
                } else {
                    failed += 1;
                }
            }

            for dirty in dirty_entries.iter() {
                src_reg[dirty.index] = dirty.region;
                src_dist[dirty.index] = dirty.distance;
            }

            if failed == stack.len() {
                break;
            }
            if level > 0 {
                iter += 1;
                if iter >= max_iter {
                    break;
                }
            }
        }
    }
}

fn append_stacks(
    src_stack: &[LevelStackEntry],
    dst_stack: &mut Vec<LevelStackEntry>,
    src_reg: &[RegionId],
) {
    for entry in src_stack.iter() {
        let Some(i) = entry.index else {
            continue;
        };
        if src_reg[i] != RegionId::NONE {
            continue;
        }
        dst_stack.push(entry.clone());
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LevelStackEntry {
    pub(crate) x: u16,
    pub(crate) z: u16,
    pub(crate) index: Option<usize>,
}

#[derive(Clone, Debug)]
struct DirtyEntry {
    index: usize,
    region: RegionId,
    distance: u16,
}

/// Bookkeeping for one region id while merging and filtering.
#[derive(Debug, Clone)]
pub(crate) struct Region {
    pub(crate) span_count: usize,
    pub(crate) id: RegionId,
    pub(crate) area: AreaType,
    remap: bool,
    visited: bool,
    pub(crate) overlap: bool,
    pub(crate) connections: Vec<RegionId>,
    floors: Vec<RegionId>,
}

impl Region {
    pub(crate) fn new(id: RegionId) -> Self {
        Self {
            id,
            span_count: 0,
            area: AreaType::NOT_WALKABLE,
            remap: false,
            visited: false,
            overlap: false,
            connections: Vec::new(),
            floors: Vec::new(),
        }
    }

    fn add_unique_floor_region(&mut self, floor_id: RegionId) {
        if !self.floors.contains(&floor_id) {
            self.floors.push(floor_id);
        }
    }

    fn is_connected_to_border(&self) -> bool {
        // A null neighbor means the contour ran along unassigned space.
        self.connections.contains(&RegionId::NONE)
    }

    /// Two regions may merge when they share the area type, meet along
    /// exactly one boundary segment, and do not overlap vertically.
    fn can_merge_with(&self, other: &Self) -> bool {
        if self.area != other.area {
            return false;
        }
        let shared_segments = self
            .connections
            .iter()
            .filter(|connection| **connection == other.id)
            .count();
        if shared_segments != 1 {
            return false;
        }
        !self.floors.contains(&other.id)
    }

    fn replace_neighbour(&mut self, old_id: RegionId, new_id: RegionId) {
        let mut connections_changed = false;
        for connection in self.connections.iter_mut() {
            if *connection == old_id {
                *connection = new_id;
                connections_changed = true;
            }
        }
        for floor in self.floors.iter_mut() {
            if *floor == old_id {
                *floor = new_id;
            }
        }
        if connections_changed {
            self.remove_adjacent_duplicate_neighbours();
        }
    }

    fn remove_adjacent_duplicate_neighbours(&mut self) {
        let mut i = 0;
        while i < self.connections.len() && self.connections.len() > 1 {
            let ni = (i + 1) % self.connections.len();
            if self.connections[i] == self.connections[ni] {
                self.connections.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Splices `other`'s neighbor sequence into this one at their shared
    /// boundary segment. The caller clears `other` on success.
    fn merge_with(&mut self, other: &Self) -> bool {
        let a_id = self.id;
        let b_id = other.id;

        let a_con = self.connections.clone();
        let b_con = &other.connections;

        let Some(insert_a) = a_con.iter().position(|con| *con == b_id) else {
            return false;
        };
        let Some(insert_b) = b_con.iter().position(|con| *con == a_id) else {
            return false;
        };

        self.connections.clear();
        let ni = a_con.len();
        for i in 0..ni - 1 {
            self.connections.push(a_con[(insert_a + 1 + i) % ni]);
        }
        let ni = b_con.len();
        for i in 0..ni - 1 {
            self.connections.push(b_con[(insert_b + 1 + i) % ni]);
        }
        self.remove_adjacent_duplicate_neighbours();

        for floor in other.floors.iter() {
            self.add_unique_floor_region(*floor);
        }
        self.span_count += other.span_count;

        true
    }
}

/// Error type for the region building stages.
#[derive(Debug, thiserror::Error)]
pub enum BuildRegionsError {
    /// More regions were created than region ids exist.
    #[error("Region ID overflow")]
    RegionIdOverflow,
}
