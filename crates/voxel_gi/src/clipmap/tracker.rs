//! Camera-anchored clip level regions and their per-frame invalidation.

use glam::{IVec3, UVec3};

use crate::config::{VoxelGiConfig, CLIP_REGION_COUNT};
use crate::core::Aabb;

use super::region::{ClipmapRegion, RegionBox};

/// What one clip level needs this frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelPlan {
    pub delta: IVec3,
    /// Footprint after this frame; equal to the current one when clean.
    pub region: ClipmapRegion,
    /// Non-overlapping boxes to clear and re-voxelize; empty when clean.
    pub revoxelize: Vec<RegionBox>,
    pub full: bool,
}

impl LevelPlan {
    pub fn is_dirty(&self) -> bool {
        !self.revoxelize.is_empty()
    }
}

/// Per-level work for one frame, computed without touching tracker state.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipmapPlan {
    pub levels: Vec<LevelPlan>,
}

impl ClipmapPlan {
    pub fn dirty_levels(&self) -> Vec<usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, level)| level.is_dirty())
            .map(|(index, _)| index)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|level| !level.is_dirty())
    }
}

/// Owns the [`ClipmapRegion`] of every level. Regions only move through
/// [`ClipmapTracker::commit`].
#[derive(Debug, Clone)]
pub struct ClipmapTracker {
    regions: [ClipmapRegion; CLIP_REGION_COUNT],
    clip_min_change: [u32; CLIP_REGION_COUNT],
    resolution: u32,
    full_revoxelization: bool,
}

impl ClipmapTracker {
    /// All levels start at the origin with a full re-voxelization pending.
    pub fn new(config: &VoxelGiConfig) -> Self {
        let extent = UVec3::splat(config.clipmap_resolution);
        let regions = std::array::from_fn(|level| ClipmapRegion {
            min_corner: IVec3::ZERO,
            extent,
            voxel_size: config.voxel_size(level),
        });
        Self {
            regions,
            clip_min_change: config.clip_min_change,
            resolution: config.clipmap_resolution,
            full_revoxelization: true,
        }
    }

    pub fn regions(&self) -> &[ClipmapRegion; CLIP_REGION_COUNT] {
        &self.regions
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn set_full_revoxelization(&mut self) {
        self.full_revoxelization = true;
    }

    pub fn full_revoxelization(&self) -> bool {
        self.full_revoxelization
    }

    /// Min corner that centers `level` on `camera`, snapped to the level's grid.
    pub fn target_min_corner(&self, level: usize, camera: &Aabb) -> IVec3 {
        let voxel_size = self.regions[level].voxel_size;
        let center = (camera.center() / voxel_size).floor().as_ivec3();
        center - IVec3::splat(self.resolution as i32 / 2)
    }

    /// Voxel displacement between `level`'s current and camera-centered corner.
    pub fn calculate_change_delta(&self, level: usize, camera: &Aabb) -> IVec3 {
        self.target_min_corner(level, camera) - self.regions[level].min_corner
    }

    /// Whether `delta` reaches `level`'s minimum-change threshold on any axis.
    pub fn exceeds_threshold(&self, level: usize, delta: IVec3) -> bool {
        delta.abs().max_element() as u32 >= self.clip_min_change[level]
    }

    pub fn plan(&self, camera: &Aabb) -> ClipmapPlan {
        let levels = (0..CLIP_REGION_COUNT)
            .map(|level| {
                let current = self.regions[level];
                let delta = self.calculate_change_delta(level, camera);
                let full = self.full_revoxelization;
                if !full && !self.exceeds_threshold(level, delta) {
                    return LevelPlan {
                        delta,
                        region: current,
                        revoxelize: Vec::new(),
                        full: false,
                    };
                }
                let region = ClipmapRegion {
                    min_corner: current.min_corner + delta,
                    ..current
                };
                let revoxelize = if full {
                    vec![region.footprint()]
                } else {
                    fill_revoxelization_regions(current.min_corner, region.min_corner, self.resolution)
                };
                LevelPlan {
                    delta,
                    full: full || revoxelize.first() == Some(&region.footprint()),
                    region,
                    revoxelize,
                }
            })
            .collect();
        ClipmapPlan { levels }
    }

    /// Adopts the plan's regions once its frame has been submitted.
    pub fn commit(&mut self, plan: &ClipmapPlan) {
        for (region, level) in self.regions.iter_mut().zip(&plan.levels) {
            *region = level.region;
        }
        self.full_revoxelization = false;
    }
}

fn axis_split(old_min: i32, new_min: i32, res: i32) -> ((i32, i32), (i32, i32)) {
    let d = new_min - old_min;
    let (lo, hi) = (new_min, new_min + res);
    if d > 0 {
        // (exposed, retained)
        ((hi - d, hi), (lo, hi - d))
    } else if d < 0 {
        ((lo, lo - d), (lo - d, hi))
    } else {
        ((lo, lo), (lo, hi))
    }
}

/// Boxes covering exactly the part of the new footprint outside the old one.
///
/// The exposed X slab spans the full new footprint; the Y slab spans only the
/// retained X range and the Z slab the retained X and Y ranges, so the boxes
/// never overlap. A shift of a full footprint or more yields the whole new
/// footprint.
pub fn fill_revoxelization_regions(old_min: IVec3, new_min: IVec3, resolution: u32) -> Vec<RegionBox> {
    let res = resolution as i32;
    let d = new_min - old_min;
    if d.abs().max_element() >= res {
        return vec![RegionBox::new(new_min, UVec3::splat(resolution))];
    }

    let (ex, kx) = axis_split(old_min.x, new_min.x, res);
    let (ey, ky) = axis_split(old_min.y, new_min.y, res);
    let (ez, _) = axis_split(old_min.z, new_min.z, res);
    let full = (new_min, new_min + IVec3::splat(res));

    let candidates = [
        RegionBox::from_bounds(IVec3::new(ex.0, full.0.y, full.0.z), IVec3::new(ex.1, full.1.y, full.1.z)),
        RegionBox::from_bounds(IVec3::new(kx.0, ey.0, full.0.z), IVec3::new(kx.1, ey.1, full.1.z)),
        RegionBox::from_bounds(IVec3::new(kx.0, ky.0, ez.0), IVec3::new(kx.1, ky.1, ez.1)),
    ];
    candidates.into_iter().filter(|b| !b.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn config() -> VoxelGiConfig {
        VoxelGiConfig {
            clipmap_resolution: 16,
            base_voxel_size: 1.0,
            clip_min_change: [2, 2, 4, 4, 8, 8],
            ..Default::default()
        }
    }

    fn camera_at(p: Vec3) -> Aabb {
        Aabb::from_center_half_extent(p, Vec3::splat(0.25))
    }

    fn settled(config: &VoxelGiConfig, at: Vec3) -> ClipmapTracker {
        let mut tracker = ClipmapTracker::new(config);
        let plan = tracker.plan(&camera_at(at));
        tracker.commit(&plan);
        tracker
    }

    #[test]
    fn first_plan_is_full_for_every_level() {
        let tracker = ClipmapTracker::new(&config());
        let plan = tracker.plan(&camera_at(Vec3::new(3.3, -7.0, 100.0)));
        assert_eq!(plan.dirty_levels(), (0..CLIP_REGION_COUNT).collect::<Vec<_>>());
        for level in &plan.levels {
            assert!(level.full);
            assert_eq!(level.revoxelize, vec![level.region.footprint()]);
        }
    }

    #[test]
    fn forced_full_revoxelization_ignores_delta() {
        let config = config();
        let mut tracker = settled(&config, Vec3::splat(0.5));
        tracker.set_full_revoxelization();
        let plan = tracker.plan(&camera_at(Vec3::splat(0.5)));
        assert_eq!(plan.dirty_levels().len(), CLIP_REGION_COUNT);
        for level in &plan.levels {
            assert_eq!(level.delta, IVec3::ZERO);
            assert_eq!(level.revoxelize[0].extent, UVec3::splat(16));
        }
        tracker.commit(&plan);
        assert!(!tracker.full_revoxelization());
    }

    #[test]
    fn static_camera_produces_no_work() {
        let config = config();
        let tracker = settled(&config, Vec3::new(10.2, 3.0, -4.0));
        let plan = tracker.plan(&camera_at(Vec3::new(10.2, 3.0, -4.0)));
        assert!(plan.is_empty());
        assert!(plan.levels.iter().all(|l| l.delta == IVec3::ZERO));
    }

    #[test]
    fn sub_threshold_move_is_ignored_and_threshold_move_exposes_a_slab() {
        let config = config();
        let tracker = settled(&config, Vec3::splat(0.5));

        let plan = tracker.plan(&camera_at(Vec3::new(1.5, 0.5, 0.5)));
        assert_eq!(plan.levels[0].delta, IVec3::X);
        assert!(!plan.levels[0].is_dirty());

        let plan = tracker.plan(&camera_at(Vec3::new(2.5, 0.5, 0.5)));
        let level = &plan.levels[0];
        assert_eq!(level.delta, IVec3::new(2, 0, 0));
        assert_eq!(level.revoxelize.len(), 1);
        let slab = level.revoxelize[0];
        assert_eq!(slab.extent, UVec3::new(2, 16, 16));
        assert_eq!(slab.max().x, level.region.footprint().max().x);
        // Two finest-level voxels are half a level-1 voxel.
        assert!(!plan.levels[1].is_dirty());
    }

    #[test]
    fn shifts_past_the_footprint_become_full() {
        let regions = fill_revoxelization_regions(IVec3::ZERO, IVec3::new(0, -40, 3), 16);
        assert_eq!(regions, vec![RegionBox::new(IVec3::new(0, -40, 3), UVec3::splat(16))]);
    }

    #[test]
    fn regions_cover_exactly_the_newly_exposed_voxels() {
        let res = 8u32;
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let old_min = IVec3::new(rng.gen_range(-20..20), rng.gen_range(-20..20), rng.gen_range(-20..20));
            let d = IVec3::new(rng.gen_range(-10..=10), rng.gen_range(-10..=10), rng.gen_range(-10..=10));
            let new_min = old_min + d;
            let old = RegionBox::new(old_min, UVec3::splat(res));
            let new = RegionBox::new(new_min, UVec3::splat(res));

            let regions = fill_revoxelization_regions(old_min, new_min, res);
            let mut covered = HashSet::new();
            for region in &regions {
                for v in region.iter() {
                    assert!(covered.insert(v), "overlap at {v} for d = {d}");
                }
            }
            let expected: HashSet<IVec3> = new.iter().filter(|v| !old.contains(*v)).collect();
            assert_eq!(covered, expected, "d = {d}");
        }
    }
}
