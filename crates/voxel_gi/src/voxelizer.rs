//! Sparse voxelizer: scene triangles to an unordered fragment list.
//!
//! Each triangle is tested against every voxel of its grid-space bounding
//! box; every overlapping voxel appends one fragment through the fragment
//! counter. The list is rewritten from scratch on every [`SparseVoxelizer::voxelize`].

use glam::{UVec3, Vec3};

use crate::config::{MAX_OCTREE_LEVEL, MIN_OCTREE_LEVEL};
use crate::core::{unpack_position, unpack_rgba8, Aabb, VoxelFragment, FRAGMENT_WORDS};
use crate::counter::Counter;
use crate::error::{Result, VoxelGiError};
use crate::gpu::params::VoxelizeFragmentParams;
use crate::gpu::{
    linear_workgroups, Access, Backend, Binding, BufferDesc, BufferUsage, CommandBuffer, CounterRole, GpuContext,
    Owner, PipelineKind, ResourceId, Workgroups,
};
use crate::logging::LogContext;
use crate::scene::GpuScene;

const LOG_TARGET: &str = "voxel_gi::voxelizer";

/// Surface fragments per grid face used to bound the expected fragment count
/// of a level.
const FRAGMENTS_PER_FACE: u64 = 6;

/// Cubic world-space domain voxelized into `2^level` cells per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelGrid {
    pub origin: Vec3,
    pub extent: f32,
}

impl VoxelGrid {
    pub fn new(origin: Vec3, extent: f32) -> Result<Self> {
        if !origin.is_finite() || !extent.is_finite() || extent <= 0.0 {
            return Err(VoxelGiError::InvalidConfig(format!(
                "voxel grid needs a finite origin and positive extent (got {origin} / {extent})"
            )));
        }
        Ok(Self { origin, extent })
    }

    /// Smallest cube anchored at `bounds.min` enclosing `bounds`, padded so
    /// geometry on the max faces stays inside the last cell.
    pub fn covering(bounds: Aabb) -> Self {
        let extent = bounds.extent().max_element().max(1e-3) * 1.001;
        Self {
            origin: bounds.min,
            extent,
        }
    }

    pub fn voxel_size(&self, resolution: u32) -> f32 {
        self.extent / resolution as f32
    }

    /// World-space bounds of voxel `v` at `resolution`.
    pub fn voxel_bounds(&self, v: UVec3, resolution: u32) -> Aabb {
        let size = self.voxel_size(resolution);
        let min = self.origin + v.as_vec3() * size;
        Aabb::new(min, min + Vec3::splat(size))
    }
}

/// Deepest level in `MIN_OCTREE_LEVEL..=requested` whose surface estimate
/// fits `max_fragments`.
pub fn capped_octree_level(requested: u32, max_fragments: u32) -> u32 {
    let mut level = requested.clamp(MIN_OCTREE_LEVEL, MAX_OCTREE_LEVEL);
    while level > MIN_OCTREE_LEVEL && FRAGMENTS_PER_FACE << (2 * level) > max_fragments as u64 {
        level -= 1;
    }
    level
}

pub struct SparseVoxelizer {
    grid: VoxelGrid,
    octree_level: u32,
    max_fragments: u32,
    counter: Counter,
    fragments: ResourceId,
    log: LogContext,
}

impl SparseVoxelizer {
    /// Allocates the fragment list and counter for a grid covering `scene`.
    pub fn initialize<B: Backend>(
        gpu: &mut GpuContext<B>,
        scene: &GpuScene,
        octree_level: u32,
        max_fragments: u32,
    ) -> Result<Self> {
        let grid = match scene.bounds() {
            Some(bounds) => VoxelGrid::covering(bounds),
            None => VoxelGrid::new(Vec3::ZERO, 1.0)?,
        };
        Self::initialize_in(gpu, grid, octree_level, max_fragments)
    }

    pub fn initialize_in<B: Backend>(
        gpu: &mut GpuContext<B>,
        grid: VoxelGrid,
        octree_level: u32,
        max_fragments: u32,
    ) -> Result<Self> {
        if max_fragments == 0 {
            return Err(VoxelGiError::InvalidConfig("max_fragments must be >= 1".into()));
        }
        let log = gpu.log().clone();
        let level = capped_octree_level(octree_level, max_fragments);
        if level != octree_level {
            log.warn(
                LOG_TARGET,
                format_args!(
                    "octree level {octree_level} capped to {level} to fit {max_fragments} fragments"
                ),
            );
        }

        let counter = Counter::initialize(gpu, CounterRole::Fragment)?;
        let fragments = match gpu.create_buffer(
            BufferDesc::words(
                "voxelizer.fragments",
                max_fragments as u64 * FRAGMENT_WORDS as u64,
                BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            ),
            Owner::SparseVoxelizer,
        ) {
            Ok(fragments) => fragments,
            Err(err) => {
                counter.release(gpu)?;
                return Err(err);
            }
        };
        log.info(
            LOG_TARGET,
            format_args!(
                "voxelizer ready: level {level} ({}³), {max_fragments} fragment slots",
                1u32 << level
            ),
        );
        Ok(Self {
            grid,
            octree_level: level,
            max_fragments,
            counter,
            fragments,
            log,
        })
    }

    pub fn grid(&self) -> VoxelGrid {
        self.grid
    }

    pub fn octree_level(&self) -> u32 {
        self.octree_level
    }

    pub fn resolution(&self) -> u32 {
        1 << self.octree_level
    }

    pub fn max_fragments(&self) -> u32 {
        self.max_fragments
    }

    pub fn fragments(&self) -> ResourceId {
        self.fragments
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    /// Fragment count from the last completed [`voxelize`](Self::voxelize),
    /// uncapped. `None` until then.
    pub fn fragment_count(&self) -> Option<u32> {
        self.counter.staging_mirror()
    }

    /// Reads the fragment counter back from the device.
    pub fn read_fragment_count<B: Backend>(&mut self, gpu: &mut GpuContext<B>) -> Result<u32> {
        self.counter.read(gpu)
    }

    /// Changes the voxelization level; takes effect on the next voxelize.
    pub fn set_octree_level(&mut self, level: u32) -> Result<()> {
        if !(MIN_OCTREE_LEVEL..=MAX_OCTREE_LEVEL).contains(&level) {
            return Err(VoxelGiError::InvalidConfig(format!(
                "octree level {level} outside {MIN_OCTREE_LEVEL}..={MAX_OCTREE_LEVEL}"
            )));
        }
        self.octree_level = level;
        self.counter.invalidate();
        Ok(())
    }

    /// Hard-resets the fragment counter.
    pub fn pre_voxelize<B: Backend>(&mut self, gpu: &mut GpuContext<B>) -> Result<()> {
        self.counter.reset(gpu)
    }

    /// Records the voxelization dispatch; the counter must already be reset.
    pub fn cmd_voxelize(&self, cmd: &mut CommandBuffer, scene: &GpuScene) {
        let resolution = self.resolution();
        let params = VoxelizeFragmentParams {
            origin: [
                self.grid.origin.x,
                self.grid.origin.y,
                self.grid.origin.z,
                resolution as f32 / self.grid.extent,
            ],
            resolution,
            num_triangles: scene.triangle_count(),
            max_fragments: self.max_fragments,
            _pad0: 0,
        };
        cmd.dispatch(
            "voxelize fragments",
            PipelineKind::VoxelizeFragments,
            vec![
                Binding::new(scene.triangles(), Access::Read),
                Binding::new(self.counter.buffer(), Access::Atomic),
                Binding::new(self.fragments, Access::Write),
            ],
            &params,
            Workgroups::Direct(linear_workgroups(scene.triangle_count())),
        );
    }

    /// Voxelizes `scene` and returns the fragment count.
    ///
    /// A count above capacity is reported as `CapacityOverrun`; the list then
    /// holds only the first `max_fragments` fragments.
    pub fn voxelize<B: Backend>(&mut self, gpu: &mut GpuContext<B>, scene: &GpuScene) -> Result<u32> {
        self.pre_voxelize(gpu)?;
        let mut cmd = gpu.begin(format!("voxelize level {}", self.octree_level));
        self.cmd_voxelize(&mut cmd, scene);
        gpu.submit_and_wait(cmd)?;
        self.counter.invalidate();
        let count = self.counter.read(gpu)?;
        self.log.debug(
            LOG_TARGET,
            format_args!("level {} produced {count} fragments", self.octree_level),
        );
        if count > self.max_fragments {
            self.log.warn(
                LOG_TARGET,
                format_args!("fragment list overran: {count} > {}", self.max_fragments),
            );
            return Err(VoxelGiError::CapacityOverrun {
                resource: "fragment list",
                requested: count as u64,
                capacity: self.max_fragments as u64,
            });
        }
        Ok(count)
    }

    /// Debug readback of the stored fragments.
    pub fn read_voxel_fragments<B: Backend>(&mut self, gpu: &mut GpuContext<B>) -> Result<Vec<VoxelFragment>> {
        let count = self.counter.read(gpu)?.min(self.max_fragments) as usize;
        let words = gpu.read_back(self.fragments)?;
        Ok(words
            .chunks_exact(FRAGMENT_WORDS as usize)
            .take(count)
            .map(|pair| VoxelFragment {
                position: unpack_position(pair[0]),
                color: unpack_rgba8(pair[1]),
            })
            .collect())
    }

    pub fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        gpu.release(self.fragments, Owner::SparseVoxelizer)?;
        self.counter.release(gpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoxelGiConfig;
    use crate::core::SceneGeometry;
    use crate::reference_cpu::ReferenceBackend;

    fn context() -> GpuContext<ReferenceBackend> {
        GpuContext::new(ReferenceBackend::new(), &VoxelGiConfig::default(), LogContext::new("voxelizer"))
    }

    fn upload(gpu: &mut GpuContext<ReferenceBackend>, triangles: Vec<[Vec3; 3]>) -> GpuScene {
        GpuScene::upload(gpu, &SceneGeometry { triangles, colors: None }).unwrap()
    }

    #[test]
    fn tiny_triangle_yields_a_single_fragment() {
        let mut gpu = context();
        let scene = upload(
            &mut gpu,
            vec![[
                Vec3::new(64.6, 64.6, 65.0),
                Vec3::new(65.4, 64.6, 65.0),
                Vec3::new(64.6, 65.4, 65.0),
            ]],
        );
        let grid = VoxelGrid::new(Vec3::ZERO, 128.0).unwrap();
        let mut voxelizer = SparseVoxelizer::initialize_in(&mut gpu, grid, 6, 1 << 15).unwrap();
        assert_eq!(voxelizer.voxelize(&mut gpu, &scene).unwrap(), 1);
        assert_eq!(voxelizer.fragment_count(), Some(1));

        let fragments = voxelizer.read_voxel_fragments(&mut gpu).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].position, UVec3::new(32, 32, 32));
    }

    #[test]
    fn axis_aligned_quad_covers_one_slice() {
        let mut gpu = context();
        let (a, b, c, d) = (
            Vec3::new(0.0, 0.0, 2.5),
            Vec3::new(8.0, 0.0, 2.5),
            Vec3::new(8.0, 8.0, 2.5),
            Vec3::new(0.0, 8.0, 2.5),
        );
        let scene = upload(&mut gpu, vec![[a, b, c], [a, c, d]]);
        let grid = VoxelGrid::new(Vec3::ZERO, 8.0).unwrap();
        let mut voxelizer = SparseVoxelizer::initialize_in(&mut gpu, grid, 3, 4096).unwrap();
        voxelizer.voxelize(&mut gpu, &scene).unwrap();

        let mut cells: Vec<UVec3> = voxelizer
            .read_voxel_fragments(&mut gpu)
            .unwrap()
            .into_iter()
            .map(|f| f.position)
            .collect();
        cells.sort_by_key(|p| (p.x, p.y, p.z));
        cells.dedup();
        assert_eq!(cells.len(), 64);
        assert!(cells.iter().all(|p| p.z == 2));
    }

    #[test]
    fn overrun_is_reported_and_list_is_clamped() {
        let mut gpu = context();
        let scene = upload(
            &mut gpu,
            vec![[Vec3::new(0.0, 0.0, 0.5), Vec3::new(16.0, 0.0, 0.5), Vec3::new(0.0, 16.0, 0.5)]],
        );
        let grid = VoxelGrid::new(Vec3::ZERO, 16.0).unwrap();
        let mut voxelizer = SparseVoxelizer::initialize_in(&mut gpu, grid, 1, 8).unwrap();
        voxelizer.set_octree_level(4).unwrap();
        let err = voxelizer.voxelize(&mut gpu, &scene).unwrap_err();
        assert!(err.is_capacity_overrun());
        assert_eq!(voxelizer.read_voxel_fragments(&mut gpu).unwrap().len(), 8);
    }

    #[test]
    fn level_is_capped_by_fragment_capacity() {
        assert_eq!(capped_octree_level(6, 1 << 20), 6);
        assert_eq!(capped_octree_level(10, 1 << 20), 8);
        assert_eq!(capped_octree_level(10, 1), MIN_OCTREE_LEVEL);
    }

    #[test]
    fn release_frees_everything() {
        let mut gpu = context();
        let scene = upload(&mut gpu, vec![[Vec3::ZERO, Vec3::X, Vec3::Y]]);
        let voxelizer = SparseVoxelizer::initialize(&mut gpu, &scene, 4, 256).unwrap();
        assert_eq!(voxelizer.grid().origin, Vec3::ZERO);
        voxelizer.release(&mut gpu).unwrap();
        scene.release(&mut gpu).unwrap();
        assert_eq!(gpu.arena().live_count(), 0);
    }
}
