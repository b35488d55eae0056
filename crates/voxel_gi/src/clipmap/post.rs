//! Compute passes that keep the clip levels consistent after a partial
//! re-voxelization.

use glam::IVec3;

use crate::config::CLIP_REGION_COUNT;
use crate::gpu::params::{ClipmapPassParams, DOWN_SAMPLE_OPACITY, DOWN_SAMPLE_RADIANCE};
use crate::gpu::{linear_workgroups, Access, Binding, CommandBuffer, LevelMask, PipelineKind, Workgroups};

use super::region::{ClipmapRegion, RegionBox};
use super::volume::ClipmapVolume;

fn pass_params(volume: &ClipmapVolume, level: usize, region: RegionBox, mode: u32) -> ClipmapPassParams {
    ClipmapPassParams {
        region_min: [region.min.x, region.min.y, region.min.z, 0],
        region_extent: [region.extent.x, region.extent.y, region.extent.z, 0],
        level: level as u32,
        resolution: volume.resolution(),
        border: volume.border(),
        mode,
    }
}

fn whole_level_workgroups(volume: &ClipmapVolume) -> Workgroups {
    Workgroups::Direct(linear_workgroups(volume.texels_per_level() as u32))
}

/// Zeroes opacity and radiance inside one region of a level.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClipmapCleaner;

impl ClipmapCleaner {
    pub fn record(&self, cmd: &mut CommandBuffer, volume: &ClipmapVolume, level: usize, region: RegionBox) {
        if region.is_empty() {
            return;
        }
        let mask = LevelMask::level(level);
        cmd.dispatch(
            format!("clear L{level}"),
            PipelineKind::ClearRegion,
            vec![
                Binding::levels(volume.opacity(), Access::Write, mask),
                Binding::levels(volume.radiance(), Access::Write, mask),
            ],
            &pass_params(volume, level, region, 0),
            Workgroups::Direct(linear_workgroups(region.voxel_count() as u32)),
        );
    }
}

/// Aggregates level `L` into level `L + 1` over a bounded coarse region.
#[derive(Debug, Clone, Copy)]
pub struct DownSampler {
    /// Coarse texels re-aggregated around every changed fine box.
    pub margin: u32,
}

impl DownSampler {
    pub fn new(margin: u32) -> Self {
        Self { margin }
    }

    /// Coarse texels of `coarse` to refresh from `fine`.
    ///
    /// The changed fine boxes are coarsened and grown by the margin, merged
    /// with the coarse level's own changed boxes into one bounding box, then
    /// clamped to the coarse footprint and to the texels whose eight children
    /// all lie inside the fine footprint.
    pub fn region(
        &self,
        fine: &ClipmapRegion,
        coarse: &ClipmapRegion,
        fine_changed: &[RegionBox],
        coarse_changed: &[RegionBox],
    ) -> RegionBox {
        let empty = RegionBox::new(coarse.min_corner, glam::UVec3::ZERO);
        let merged = fine_changed
            .iter()
            .map(|b| b.coarsened().grown(self.margin))
            .chain(coarse_changed.iter().copied())
            .fold(empty, |acc, b| acc.union_bounds(&b));
        if merged.is_empty() {
            return merged;
        }

        let fine_min = fine.min_corner;
        let fine_max = fine_min + fine.extent.as_ivec3();
        let child_valid = RegionBox::from_bounds(
            IVec3::new(
                (fine_min.x + 1).div_euclid(2),
                (fine_min.y + 1).div_euclid(2),
                (fine_min.z + 1).div_euclid(2),
            ),
            IVec3::new(
                (fine_max.x - 2).div_euclid(2) + 1,
                (fine_max.y - 2).div_euclid(2) + 1,
                (fine_max.z - 2).div_euclid(2) + 1,
            ),
        );
        merged.intersection(&coarse.footprint()).intersection(&child_valid)
    }

    /// Records the opacity and radiance down-sample from `level` into
    /// `level + 1` over `region`, given in `level + 1` voxels.
    pub fn record(&self, cmd: &mut CommandBuffer, volume: &ClipmapVolume, level: usize, region: RegionBox) {
        if region.is_empty() || level + 1 >= CLIP_REGION_COUNT {
            return;
        }
        let mask = LevelMask::level(level) | LevelMask::level(level + 1);
        let workgroups = Workgroups::Direct(linear_workgroups(region.voxel_count() as u32));
        cmd.dispatch(
            format!("down sample opacity L{level}"),
            PipelineKind::DownSample,
            vec![Binding::levels(volume.opacity(), Access::ReadWrite, mask)],
            &pass_params(volume, level, region, DOWN_SAMPLE_OPACITY),
            workgroups,
        );
        cmd.dispatch(
            format!("down sample radiance L{level}"),
            PipelineKind::DownSample,
            vec![Binding::levels(volume.radiance(), Access::ReadWrite, mask)],
            &pass_params(volume, level, region, DOWN_SAMPLE_RADIANCE),
            workgroups,
        );
    }
}

/// Refreshes a level's border texels from the opposite interior faces.
#[derive(Debug, Clone, Copy, Default)]
pub struct BorderWrapper;

impl BorderWrapper {
    pub fn record(&self, cmd: &mut CommandBuffer, volume: &ClipmapVolume, level: usize) {
        let mask = LevelMask::level(level);
        let whole = RegionBox::new(IVec3::ZERO, glam::UVec3::ZERO);
        cmd.dispatch(
            format!("border wrap L{level}"),
            PipelineKind::BorderWrap,
            vec![
                Binding::levels(volume.opacity(), Access::ReadWrite, mask),
                Binding::levels(volume.radiance(), Access::ReadWrite, mask),
            ],
            &pass_params(volume, level, whole, 0),
            whole_level_workgroups(volume),
        );
    }
}

/// Copies opacity alpha into radiance alpha across a whole padded level.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyAlpha;

impl CopyAlpha {
    pub fn record(&self, cmd: &mut CommandBuffer, volume: &ClipmapVolume, level: usize) {
        let mask = LevelMask::level(level);
        let whole = RegionBox::new(IVec3::ZERO, glam::UVec3::ZERO);
        cmd.dispatch(
            format!("copy alpha L{level}"),
            PipelineKind::CopyAlpha,
            vec![
                Binding::levels(volume.opacity(), Access::Read, mask),
                Binding::levels(volume.radiance(), Access::ReadWrite, mask),
            ],
            &pass_params(volume, level, whole, 0),
            whole_level_workgroups(volume),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;

    fn region(min: i32, voxel_size: f32) -> ClipmapRegion {
        ClipmapRegion {
            min_corner: IVec3::splat(min),
            extent: UVec3::splat(16),
            voxel_size,
        }
    }

    #[test]
    fn down_sample_region_keeps_children_inside_the_fine_footprint() {
        let fine = region(-7, 1.0);
        let coarse = region(-8, 2.0);
        let sampler = DownSampler::new(10);
        let everything = sampler.region(&fine, &coarse, &[fine.footprint()], &[]);
        // Children of t are 2t and 2t + 1; both must land in [-7, 9).
        assert_eq!(everything.min, IVec3::splat(-3));
        assert_eq!(everything.max(), IVec3::splat(4));
        for t in everything.iter() {
            for k in 0..8 {
                let child = t * 2 + IVec3::new(k & 1, (k >> 1) & 1, (k >> 2) & 1);
                assert!(fine.footprint().contains(child));
            }
        }
    }

    #[test]
    fn down_sample_region_grows_a_slab_by_the_margin() {
        let fine = region(-8, 1.0);
        let coarse = region(-8, 2.0);
        let slab = RegionBox::new(IVec3::new(6, -8, -8), UVec3::new(2, 16, 16));
        let sampler = DownSampler::new(1);
        let r = sampler.region(&fine, &coarse, &[slab], &[]);
        assert_eq!(r.min, IVec3::new(2, -4, -4));
        assert_eq!(r.max(), IVec3::new(4, 4, 4));
    }

    #[test]
    fn down_sample_region_is_empty_without_changes() {
        let fine = region(-8, 1.0);
        let coarse = region(-8, 2.0);
        assert!(DownSampler::new(10).region(&fine, &coarse, &[], &[]).is_empty());
    }
}
