use crate::gpu::params::ClipmapVoxelizeParams;
use crate::gpu::{linear_workgroups, Access, Binding, CommandBuffer, LevelMask, PipelineKind, Workgroups};
use crate::scene::GpuScene;

use super::region::RegionBox;
use super::volume::ClipmapVolume;

/// Records the voxelization of `region` of clip `level` straight into both
/// clip volumes.
///
/// One invocation per triangle; each tests the voxels of its bounding box
/// clipped to `region` and max-blends opacity and radiance, so regions of
/// one level may be voxelized back to back without barriers.
pub fn cmd_voxelize_region(
    cmd: &mut CommandBuffer,
    scene: &GpuScene,
    volume: &ClipmapVolume,
    level: usize,
    region: RegionBox,
    voxel_size: f32,
) {
    if scene.triangle_count() == 0 || region.is_empty() {
        return;
    }
    let params = ClipmapVoxelizeParams {
        region_min: [region.min.x, region.min.y, region.min.z, level as i32],
        region_extent: [region.extent.x, region.extent.y, region.extent.z, 0],
        voxel_size,
        resolution: volume.resolution(),
        border: volume.border(),
        num_triangles: scene.triangle_count(),
    };
    let mask = LevelMask::level(level);
    cmd.dispatch(
        format!("voxelize clipmap L{level}"),
        PipelineKind::VoxelizeClipmap,
        vec![
            Binding::new(scene.triangles(), Access::Read),
            Binding::levels(volume.opacity(), Access::Atomic, mask),
            Binding::levels(volume.radiance(), Access::Atomic, mask),
        ],
        &params,
        Workgroups::Direct(linear_workgroups(scene.triangle_count())),
    );
}
