//! Camera-anchored clipmap of opacity and radiance voxels.
//!
//! Every frame the tracker plans which parts of each level the camera move
//! exposed; those boxes are cleared and re-voxelized, then border wrap,
//! down-sample and copy alpha bring every touched level back in sync before
//! both volumes are handed to the graphics queue.

mod post;
mod region;
mod tracker;
mod volume;
mod voxelize;

pub use post::{BorderWrapper, ClipmapCleaner, CopyAlpha, DownSampler};
pub use region::{ClipmapRegion, RegionBox};
pub use tracker::{fill_revoxelization_regions, ClipmapPlan, ClipmapTracker, LevelPlan};
pub use volume::{texel_index, ClipLevelImage, ClipmapVolume};
pub use voxelize::cmd_voxelize_region;

use crate::config::{VoxelGiConfig, CLIP_REGION_COUNT};
use crate::core::CameraSource;
use crate::error::Result;
use crate::gpu::{
    Access, Backend, Command, CommandBuffer, GpuContext, LevelMask, QueueKind, ResourceArena, ResourceId,
};
use crate::logging::LogContext;
use crate::scene::GpuScene;

const LOG_TARGET: &str = "voxel_gi::clipmap";

/// What one clipmap update did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClipmapUpdate {
    pub dirty_levels: Vec<usize>,
    /// Boxes cleared and re-voxelized, per level.
    pub revoxelized: Vec<(usize, RegionBox)>,
    /// Coarse boxes refreshed from the next finer level, keyed by the coarse level.
    pub down_sampled: Vec<(usize, RegionBox)>,
    /// Dispatch labels in recording order.
    pub passes: Vec<String>,
    pub submitted: bool,
}

/// Borrowed view of the finished clip volumes for cone tracing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipmapView {
    pub opacity: ResourceId,
    pub radiance: ResourceId,
    pub resolution: u32,
    pub border: u32,
    pub regions: [ClipmapRegion; CLIP_REGION_COUNT],
}

pub struct Clipmap {
    tracker: ClipmapTracker,
    volume: ClipmapVolume,
    cleaner: ClipmapCleaner,
    down_sampler: DownSampler,
    border_wrapper: BorderWrapper,
    copy_alpha: CopyAlpha,
    log: LogContext,
}

impl Clipmap {
    pub fn initialize<B: Backend>(gpu: &mut GpuContext<B>, config: &VoxelGiConfig) -> Result<Self> {
        config.validate()?;
        let volume = ClipmapVolume::allocate(gpu, config)?;
        gpu.log().info(
            LOG_TARGET,
            format_args!(
                "clipmap {} levels of {}³ (+{} border), finest voxel {}",
                CLIP_REGION_COUNT, config.clipmap_resolution, config.voxel_border, config.base_voxel_size
            ),
        );
        Ok(Self {
            tracker: ClipmapTracker::new(config),
            volume,
            cleaner: ClipmapCleaner,
            down_sampler: DownSampler::new(config.down_sample_region_size),
            border_wrapper: BorderWrapper,
            copy_alpha: CopyAlpha,
            log: gpu.log().clone(),
        })
    }

    pub fn tracker(&self) -> &ClipmapTracker {
        &self.tracker
    }

    pub fn volume(&self) -> &ClipmapVolume {
        &self.volume
    }

    pub fn regions(&self) -> &[ClipmapRegion; CLIP_REGION_COUNT] {
        self.tracker.regions()
    }

    /// Forces every level to be rebuilt on the next update.
    pub fn set_full_revoxelization(&mut self) {
        self.tracker.set_full_revoxelization();
    }

    pub fn plan(&self, camera: &dyn CameraSource) -> ClipmapPlan {
        self.tracker.plan(&camera.bounding_region())
    }

    /// The volumes and regions, once both volumes belong to the graphics queue.
    pub fn view(&self, arena: &ResourceArena) -> Result<Option<ClipmapView>> {
        let handed_over = arena.queue_of(self.volume.opacity())? == QueueKind::Graphics
            && arena.queue_of(self.volume.radiance())? == QueueKind::Graphics;
        Ok(handed_over.then(|| ClipmapView {
            opacity: self.volume.opacity(),
            radiance: self.volume.radiance(),
            resolution: self.volume.resolution(),
            border: self.volume.border(),
            regions: *self.tracker.regions(),
        }))
    }

    /// Records everything `plan` needs into `cmd`. Nothing is recorded for
    /// a plan without dirty levels.
    pub fn record_update(
        &self,
        cmd: &mut CommandBuffer,
        arena: &ResourceArena,
        scene: &GpuScene,
        plan: &ClipmapPlan,
    ) -> Result<ClipmapUpdate> {
        let mut update = ClipmapUpdate {
            dirty_levels: plan.dirty_levels(),
            ..ClipmapUpdate::default()
        };
        if plan.is_empty() {
            return Ok(update);
        }
        let first_command = cmd.commands().len();
        let volumes = [self.volume.opacity(), self.volume.radiance()];

        for id in volumes {
            if arena.queue_of(id)? == QueueKind::Graphics {
                cmd.acquire_ownership(id, QueueKind::Graphics, Access::Read, Access::ReadWrite);
            }
        }

        for (level, level_plan) in plan.levels.iter().enumerate() {
            if !level_plan.is_dirty() {
                continue;
            }
            let mask = LevelMask::level(level);
            for (index, region) in level_plan.revoxelize.iter().enumerate() {
                if index > 0 {
                    barrier_volumes(cmd, &volumes, mask);
                }
                self.cleaner.record(cmd, &self.volume, level, *region);
                update.revoxelized.push((level, *region));
            }
            barrier_volumes(cmd, &volumes, mask);
            for region in &level_plan.revoxelize {
                cmd_voxelize_region(cmd, scene, &self.volume, level, *region, level_plan.region.voxel_size);
            }
        }
        barrier_volumes(cmd, &volumes, LevelMask::ALL);

        let mut changed: Vec<Vec<RegionBox>> = plan.levels.iter().map(|l| l.revoxelize.clone()).collect();
        for level in 0..CLIP_REGION_COUNT {
            let mask = LevelMask::level(level);
            let touched = !changed[level].is_empty();
            if touched {
                self.border_wrapper.record(cmd, &self.volume, level);
                barrier_volumes(cmd, &volumes, mask);
            }
            if level + 1 < CLIP_REGION_COUNT {
                let region = self.down_sampler.region(
                    &plan.levels[level].region,
                    &plan.levels[level + 1].region,
                    &changed[level],
                    &changed[level + 1],
                );
                if !region.is_empty() {
                    self.down_sampler.record(cmd, &self.volume, level, region);
                    barrier_volumes(cmd, &volumes, mask | LevelMask::level(level + 1));
                    update.down_sampled.push((level + 1, region));
                    changed[level + 1].push(region);
                }
            }
            if touched {
                self.copy_alpha.record(cmd, &self.volume, level);
            }
        }

        for id in volumes {
            cmd.transfer_ownership(id, Access::ReadWrite, Access::Read, QueueKind::Graphics);
        }

        update.passes = cmd.commands()[first_command..]
            .iter()
            .filter_map(|command| match command {
                Command::Dispatch(dispatch) => Some(dispatch.label.clone()),
                _ => None,
            })
            .collect();
        Ok(update)
    }

    /// Plans, records and submits this frame's update, then waits for it.
    ///
    /// The tracker adopts the new regions only after the submission has
    /// completed; on error the previous regions stay current and the next
    /// update replans from them.
    pub fn update<B: Backend>(
        &mut self,
        gpu: &mut GpuContext<B>,
        scene: &GpuScene,
        camera: &dyn CameraSource,
    ) -> Result<ClipmapUpdate> {
        let plan = self.plan(camera);
        let update = self.apply(gpu, scene, &plan)?;
        self.commit(&plan);
        Ok(update)
    }

    /// Records, submits and waits for `plan` without adopting its regions.
    pub fn apply<B: Backend>(
        &mut self,
        gpu: &mut GpuContext<B>,
        scene: &GpuScene,
        plan: &ClipmapPlan,
    ) -> Result<ClipmapUpdate> {
        if plan.is_empty() {
            return Ok(ClipmapUpdate::default());
        }
        let mut cmd = gpu.begin("clipmap update");
        let submitted = self
            .record_update(&mut cmd, gpu.arena(), scene, plan)
            .and_then(|update| gpu.submit_and_wait(cmd).map(|()| update));
        let mut update = match submitted {
            Ok(update) => update,
            Err(err) => {
                // The volumes may already hold part of the new footprint.
                self.tracker.set_full_revoxelization();
                self.log.warn(
                    LOG_TARGET,
                    format_args!("update of levels {:?} failed, next update rebuilds every level: {err}", plan.dirty_levels()),
                );
                return Err(err);
            }
        };
        update.submitted = true;
        self.log.debug(
            LOG_TARGET,
            format_args!(
                "levels {:?} dirty: {} boxes re-voxelized, {} down-sampled",
                update.dirty_levels,
                update.revoxelized.len(),
                update.down_sampled.len()
            ),
        );
        Ok(update)
    }

    /// Adopts the regions of a plan whose update has completed.
    pub fn commit(&mut self, plan: &ClipmapPlan) {
        self.tracker.commit(plan);
    }

    pub fn read_level<B: Backend>(&self, gpu: &mut GpuContext<B>, level: usize) -> Result<ClipLevelImage> {
        self.volume.read_level(gpu, level)
    }

    pub fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        self.volume.release(gpu)
    }
}

fn barrier_volumes(cmd: &mut CommandBuffer, volumes: &[ResourceId; 2], levels: LevelMask) {
    for &id in volumes {
        cmd.barrier_levels(id, levels, Access::ReadWrite, Access::ReadWrite);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Aabb, SceneGeometry};
    use crate::gpu::PipelineKind;
    use crate::reference_cpu::ReferenceBackend;
    use glam::{IVec3, UVec3, Vec3};

    fn config() -> VoxelGiConfig {
        VoxelGiConfig {
            clipmap_resolution: 8,
            base_voxel_size: 1.0,
            clip_min_change: [2, 2, 4, 4, 8, 8],
            validate_dependencies: true,
            ..Default::default()
        }
    }

    fn camera_at(p: Vec3) -> Aabb {
        Aabb::from_center_half_extent(p, Vec3::splat(0.25))
    }

    /// One triangle inside finest voxel (0, 1, 1).
    fn setup() -> (GpuContext<ReferenceBackend>, GpuScene, Clipmap) {
        let config = config();
        let mut gpu = GpuContext::new(ReferenceBackend::new(), &config, LogContext::new("clipmap"));
        let geometry = SceneGeometry {
            triangles: vec![[
                Vec3::new(0.1, 1.1, 1.5),
                Vec3::new(0.9, 1.1, 1.5),
                Vec3::new(0.1, 1.9, 1.5),
            ]],
            colors: Some(vec![[10, 20, 30, 255]]),
        };
        let scene = GpuScene::upload(&mut gpu, &geometry).unwrap();
        let clipmap = Clipmap::initialize(&mut gpu, &config).unwrap();
        (gpu, scene, clipmap)
    }

    #[test]
    fn first_update_rebuilds_every_level_and_hands_volumes_to_graphics() {
        let (mut gpu, scene, mut clipmap) = setup();
        let update = clipmap.update(&mut gpu, &scene, &camera_at(Vec3::splat(0.5))).unwrap();
        assert!(update.submitted);
        assert_eq!(update.dirty_levels, (0..CLIP_REGION_COUNT).collect::<Vec<_>>());
        assert_eq!(update.revoxelized.len(), CLIP_REGION_COUNT);
        for (level, region) in &update.revoxelized {
            assert_eq!(*region, clipmap.regions()[*level].footprint());
            assert_eq!(region.extent, UVec3::splat(8));
        }
        assert_eq!(gpu.queue_of(clipmap.volume().opacity()).unwrap(), QueueKind::Graphics);
        assert_eq!(gpu.queue_of(clipmap.volume().radiance()).unwrap(), QueueKind::Graphics);
        assert!(clipmap.view(gpu.arena()).unwrap().is_some());

        let fine = clipmap.read_level(&mut gpu, 0).unwrap();
        assert_eq!(fine.opacity_at(IVec3::new(0, 1, 1)), [255; 4]);
        assert_eq!(fine.radiance_at(IVec3::new(0, 1, 1)), [10, 20, 30, 255]);
        assert_eq!(fine.occupied(), 1);
        // Padded x = border + resolution wraps onto world x = 0.
        assert_eq!(fine.padded_texel(UVec3::new(9, 2, 2)).0, u32::MAX);

        // Level 1 is refreshed from level 0: one of eight children is solid.
        let coarse = clipmap.read_level(&mut gpu, 1).unwrap();
        assert_eq!(coarse.opacity_at(IVec3::ZERO), [32; 4]);
        assert_eq!(coarse.radiance_at(IVec3::ZERO), [10, 20, 30, 32]);
    }

    #[test]
    fn passes_are_ordered_clear_voxelize_wrap_down_sample_copy() {
        let (gpu, scene, clipmap) = setup();
        let plan = clipmap.plan(&camera_at(Vec3::splat(0.5)));
        let mut cmd = gpu.begin("ordering");
        clipmap.record_update(&mut cmd, gpu.arena(), &scene, &plan).unwrap();
        crate::gpu::validate(&cmd, gpu.arena()).unwrap();

        let opacity = clipmap.volume().opacity();
        let clears = cmd.positions_of(PipelineKind::ClearRegion);
        let voxelizes = cmd.positions_of(PipelineKind::VoxelizeClipmap);
        let wraps = cmd.positions_of(PipelineKind::BorderWrap);
        let down_samples = cmd.positions_of(PipelineKind::DownSample);
        let copies = cmd.positions_of(PipelineKind::CopyAlpha);
        assert_eq!(clears.len(), CLIP_REGION_COUNT);
        assert_eq!(voxelizes.len(), CLIP_REGION_COUNT);
        assert_eq!(wraps.len(), CLIP_REGION_COUNT);
        assert_eq!(copies.len(), CLIP_REGION_COUNT);
        assert_eq!(down_samples.len(), 2 * (CLIP_REGION_COUNT - 1));

        for level in 0..CLIP_REGION_COUNT {
            let mask = LevelMask::level(level);
            let (clear, voxelize, wrap, copy) = (clears[level], voxelizes[level], wraps[level], copies[level]);
            assert!(clear < voxelize && voxelize < wrap && wrap < copy);
            assert!(cmd.has_barrier_between(clear, voxelize, opacity, mask));
            assert!(cmd.has_barrier_between(voxelize, wrap, opacity, mask));
            if level + 1 < CLIP_REGION_COUNT {
                let down = cmd.position_of_label(&format!("down sample opacity L{level}")).unwrap();
                assert!(wrap < down && down < copy);
                assert!(cmd.has_barrier_between(wrap, down, opacity, mask));
                assert!(cmd.has_barrier_between(down, copy, opacity, mask));
                // The coarser level is wrapped only after it received the down-sample.
                assert!(down < wraps[level + 1]);
            }
        }
        let last = cmd.commands().last().unwrap();
        assert!(matches!(last, Command::Barrier(b) if b.transfer.map(|t| t.to) == Some(QueueKind::Graphics)));
    }

    #[test]
    fn static_camera_records_nothing_and_leaves_volumes_untouched() {
        let (mut gpu, scene, mut clipmap) = setup();
        let camera = camera_at(Vec3::new(0.5, 0.5, 0.5));
        clipmap.update(&mut gpu, &scene, &camera).unwrap();
        let opacity = gpu.backend().words(clipmap.volume().opacity()).unwrap().to_vec();
        let radiance = gpu.backend().words(clipmap.volume().radiance()).unwrap().to_vec();
        let dispatches = gpu.backend().dispatch_count();

        let plan = clipmap.plan(&camera);
        assert!(plan.is_empty());
        let mut cmd = gpu.begin("static");
        clipmap.record_update(&mut cmd, gpu.arena(), &scene, &plan).unwrap();
        assert!(cmd.is_empty());

        let update = clipmap.update(&mut gpu, &scene, &camera).unwrap();
        assert!(!update.submitted);
        assert!(update.dirty_levels.is_empty());
        assert_eq!(gpu.backend().dispatch_count(), dispatches);
        assert_eq!(gpu.backend().words(clipmap.volume().opacity()).unwrap(), opacity.as_slice());
        assert_eq!(gpu.backend().words(clipmap.volume().radiance()).unwrap(), radiance.as_slice());
    }

    #[test]
    fn threshold_move_revoxelizes_only_the_exposed_slab() {
        let (mut gpu, scene, mut clipmap) = setup();
        clipmap.update(&mut gpu, &scene, &camera_at(Vec3::splat(0.5))).unwrap();

        let below = clipmap.update(&mut gpu, &scene, &camera_at(Vec3::new(1.5, 0.5, 0.5))).unwrap();
        assert!(!below.submitted);

        let moved = clipmap.update(&mut gpu, &scene, &camera_at(Vec3::new(2.5, 0.5, 0.5))).unwrap();
        assert!(moved.submitted);
        assert_eq!(moved.dirty_levels, vec![0]);
        assert_eq!(
            moved.revoxelized,
            vec![(0, RegionBox::new(IVec3::new(4, -4, -4), UVec3::new(2, 8, 8)))]
        );
        assert_eq!(moved.passes.iter().filter(|p| p.starts_with("clear")).count(), 1);
        assert_eq!(moved.passes[0], "clear L0");
        assert_eq!(moved.down_sampled.first().map(|(level, _)| *level), Some(1));
        assert_eq!(clipmap.regions()[0].min_corner, IVec3::new(-2, -4, -4));
        assert_eq!(clipmap.regions()[1].min_corner, IVec3::splat(-4));

        // The retained voxel survives the move.
        let fine = clipmap.read_level(&mut gpu, 0).unwrap();
        assert_eq!(fine.opacity_at(IVec3::new(0, 1, 1)), [255; 4]);
        assert_eq!(fine.occupied(), 1);
    }

    #[test]
    fn forced_full_revoxelization_rebuilds_all_levels_in_place() {
        let (mut gpu, scene, mut clipmap) = setup();
        let camera = camera_at(Vec3::splat(0.5));
        clipmap.update(&mut gpu, &scene, &camera).unwrap();
        let before = clipmap.read_level(&mut gpu, 0).unwrap();

        clipmap.set_full_revoxelization();
        let update = clipmap.update(&mut gpu, &scene, &camera).unwrap();
        assert_eq!(update.dirty_levels.len(), CLIP_REGION_COUNT);
        for (level, region) in &update.revoxelized {
            assert_eq!(*region, clipmap.regions()[*level].footprint());
        }
        assert_eq!(clipmap.read_level(&mut gpu, 0).unwrap(), before);
    }

    #[test]
    fn failed_submission_keeps_previous_regions() {
        let (mut gpu, scene, mut clipmap) = setup();
        clipmap.update(&mut gpu, &scene, &camera_at(Vec3::splat(0.5))).unwrap();
        let regions = *clipmap.regions();

        gpu.backend_mut().stall_fences(true);
        let err = clipmap
            .update(&mut gpu, &scene, &camera_at(Vec3::new(40.5, 0.5, 0.5)))
            .unwrap_err();
        assert!(matches!(err, crate::error::VoxelGiError::SyncTimeout { .. }));
        assert_eq!(*clipmap.regions(), regions);
        assert!(clipmap.tracker().full_revoxelization());
    }

    #[test]
    fn returning_after_a_failed_update_restores_the_surface() {
        let (mut gpu, scene, mut clipmap) = setup();
        let home = camera_at(Vec3::splat(0.5));
        clipmap.update(&mut gpu, &scene, &home).unwrap();

        // The stalled submission still executes and clears the far footprint.
        gpu.backend_mut().stall_fences(true);
        assert!(clipmap.update(&mut gpu, &scene, &camera_at(Vec3::new(30.5, 0.5, 0.5))).is_err());
        gpu.backend_mut().stall_fences(false);

        let update = clipmap.update(&mut gpu, &scene, &home).unwrap();
        assert_eq!(update.dirty_levels.len(), CLIP_REGION_COUNT);
        let fine = clipmap.read_level(&mut gpu, 0).unwrap();
        assert_eq!(fine.opacity_at(IVec3::new(0, 1, 1)), [255; 4]);
        assert_eq!(fine.radiance_at(IVec3::new(0, 1, 1)), [10, 20, 30, 255]);
        assert_eq!(fine.occupied(), 1);
    }
}
