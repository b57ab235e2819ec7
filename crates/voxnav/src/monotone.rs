//! Monotone region partitioning: a single top-to-bottom sweep that builds
//! regions out of per-row runs. Cheaper than the watershed and free of
//! distance-field noise, at the cost of longer, thinner regions.

use crate::{
    CompactHeightfield, RegionId,
    watershed::BuildRegionsError,
};

/// Sentinel for a sweep run that saw conflicting previous-row neighbors.
const NULL_NEI: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, Default)]
struct SweepSpan {
    /// Final region id assigned to the run.
    id: u16,
    /// Number of samples in which `nei` was observed.
    ns: u16,
    /// The previous row's region this run attaches to, if unambiguous.
    nei: u16,
}

impl CompactHeightfield {
    /// Partitions the walkable area into regions with one monotone sweep
    /// along the z-axis, then applies the same small-region filtering and
    /// merging as the watershed partitioner.
    ///
    /// Does not require a distance field.
    pub fn build_regions_monotone(
        &mut self,
        border_size: u16,
        min_region_area: u16,
        merge_region_area: u16,
    ) -> Result<(), BuildRegionsError> {
        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let mut region_id: u16 = 1;

        if border_size > 0 {
            let border_width = border_size.min(self.width);
            let border_height = border_size.min(self.height);
            let mut paint = |min_x, max_x, min_z, max_z, src_reg: &mut [RegionId]| {
                let region = RegionId::from(region_id) | RegionId::BORDER_REGION;
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
                region_id += 1;
            };
            paint(0, border_width, 0, self.height, &mut src_reg);
            paint(self.width - border_width, self.width, 0, self.height, &mut src_reg);
            paint(0, self.width, 0, border_height, &mut src_reg);
            paint(0, self.width, self.height - border_height, self.height, &mut src_reg);
        }
        self.border_size = border_size;

        let mut sweeps: Vec<SweepSpan> = vec![SweepSpan::default(); self.width as usize + 1];
        let mut prev: Vec<u16> = Vec::with_capacity(256);

        for z in border_size..self.height.saturating_sub(border_size) {
            // Samples per previous-row region, reset each row.
            prev.clear();
            prev.resize(region_id as usize + 1, 0);
            let mut rid: u16 = 1;

            for x in border_size..self.width.saturating_sub(border_size) {
                let cell = *self.cell_at(x, z);
                for i in cell.index_range() {
                    if !self.areas[i].is_walkable() {
                        continue;
                    }
                    let span = self.spans[i].clone();

                    // Continue the run of the west neighbor if compatible.
                    let mut previd: u16 = 0;
                    if let Some(con) = span.con(0) {
                        let (_, _, a_i) = self.con_indices(x as i32, z as i32, 0, con);
                        let neighbor_region = src_reg[a_i];
                        if neighbor_region != RegionId::NONE
                            && !neighbor_region.intersects(RegionId::BORDER_REGION)
                            && self.areas[i] == self.areas[a_i]
                        {
                            previd = neighbor_region.bits();
                        }
                    }
                    if previd == 0 {
                        previd = rid;
                        rid += 1;
                        // Multi-layer columns can exceed one run per column.
                        if sweeps.len() <= previd as usize {
                            sweeps.resize(previd as usize + 1, SweepSpan::default());
                        }
                        sweeps[previd as usize] = SweepSpan::default();
                    }

                    // Attach the run to the previous row's region if every
                    // sample agrees on it.
                    if let Some(con) = span.con(3) {
                        let (_, _, a_i) = self.con_indices(x as i32, z as i32, 3, con);
                        let neighbor_region = src_reg[a_i];
                        if neighbor_region != RegionId::NONE
                            && !neighbor_region.intersects(RegionId::BORDER_REGION)
                            && self.areas[i] == self.areas[a_i]
                        {
                            let nr = neighbor_region.bits();
                            let sweep = &mut sweeps[previd as usize];
                            if sweep.nei == 0 || sweep.nei == nr {
                                sweep.nei = nr;
                                sweep.ns += 1;
                                prev[nr as usize] += 1;
                            } else {
                                sweep.nei = NULL_NEI;
                            }
                        }
                    }

                    src_reg[i] = RegionId::from(previd);
                }
            }

            // Resolve run ids: adopt the previous-row region when the
            // attachment was exclusive both ways, else mint a new id.
            for sweep in sweeps[1..rid as usize].iter_mut() {
                if sweep.nei != NULL_NEI
                    && sweep.nei != 0
                    && prev[sweep.nei as usize] == sweep.ns
                {
                    sweep.id = sweep.nei;
                } else {
                    if region_id == RegionId::MAX.bits() {
                        return Err(BuildRegionsError::RegionIdOverflow);
                    }
                    sweep.id = region_id;
                    region_id += 1;
                    // Keep the per-row sample table in step with new ids.
                    prev.push(0);
                }
            }

            // Rewrite the row's run ids to final region ids.
            for x in border_size..self.width.saturating_sub(border_size) {
                let cell = *self.cell_at(x, z);
                for i in cell.index_range() {
                    let reg = src_reg[i];
                    if reg != RegionId::NONE
                        && !reg.intersects(RegionId::BORDER_REGION)
                        && reg.bits() < rid
                    {
                        src_reg[i] = RegionId::from(sweeps[reg.bits() as usize].id);
                    }
                }
            }
        }

        self.max_region = RegionId::from(region_id);
        let overlaps =
            self.merge_and_filter_regions(min_region_area, merge_region_area, &mut src_reg);
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
}

#[cfg(test)]
mod tests {
    use glam::Vec3A;

    use crate::{
        HeightfieldBuilder,
        heightfield::SpanInsertion,
        math::Aabb3d,
        span::{AreaType, Span},
    };

    use super::*;

    fn floor_grid(size: u16) -> CompactHeightfield {
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
        heightfield.into_compact(2, 1).unwrap()
    }

    #[test]
    fn single_plate_is_one_region() {
        let mut compact = floor_grid(8);
        compact.build_regions_monotone(0, 2, 10).unwrap();
        assert_eq!(compact.max_region.bits(), 1);
        let first = compact.spans[0].region;
        assert!(compact.spans.iter().all(|span| span.region == first));
    }

    #[test]
    fn rows_reuse_the_previous_rows_region() {
        let mut compact = floor_grid(6);
        compact.build_regions_monotone(0, 1, 1).unwrap();
        // With merging effectively disabled the sweep itself must already
        // produce one region for a convex plate.
        assert_eq!(compact.max_region.bits(), 1);
    }

    #[test]
    fn region_ids_are_dense_after_filtering() {
        let mut compact = floor_grid(9);
        compact.build_regions_monotone(0, 2, 4).unwrap();
        crate::watershed::tests::assert_dense_region_ids(&compact);
    }
}
