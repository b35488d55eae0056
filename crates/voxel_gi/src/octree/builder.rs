use crate::config::{BRICK_WORDS, MAX_OCTREE_LEVEL, MIN_OCTREE_LEVEL};
use crate::counter::Counter;
use crate::error::{Result, VoxelGiError};
use crate::gpu::params::*;
use crate::gpu::{
    Access, Backend, Binding, BufferDesc, BufferUsage, CommandBuffer, CounterRole, GpuContext, Owner, PipelineKind,
    QueueKind, ResourceArena, ResourceId, Workgroups,
};
use crate::logging::LogContext;
use crate::voxelizer::SparseVoxelizer;

use super::node::DecodedOctree;

const LOG_TARGET: &str = "voxel_gi::octree";

const BUILD_STATE_WORDS: u64 = STATE_LEVEL_BEGIN as u64 + MAX_OCTREE_LEVEL as u64 + 2;
const DISPATCH_ARGS_WORDS: u64 = ARGS_LEVEL_BASE as u64 + 3 * (MAX_OCTREE_LEVEL as u64 + 1);

/// Summary of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OctreeStats {
    /// Level actually built.
    pub octree_level: u32,
    /// Level the fragments were voxelized at.
    pub requested_level: u32,
    pub fragment_count: u32,
    pub node_count: u32,
    pub brick_count: u32,
    /// Start index of every level's nodes; `level_begin[octree_level + 1]` is
    /// the node count.
    pub level_begin: Vec<u32>,
}

impl OctreeStats {
    pub fn fell_back(&self) -> bool {
        self.octree_level < self.requested_level
    }

    pub fn level_node_counts(&self) -> Vec<u32> {
        self.level_begin.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// Read-only handle to the published octree for its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OctreeView {
    pub nodes: ResourceId,
    pub bricks: ResourceId,
    pub octree_level: u32,
    pub node_count: u32,
    pub brick_count: u32,
}

/// Builds a linear sparse octree from the voxelizer's fragment list.
///
/// Node and brick storage is double-buffered: a build writes the back pair
/// and is swapped in only when it completes without overrunning, so the
/// previously published octree stays valid on failure.
pub struct OctreeBuilder {
    nodes: [ResourceId; 2],
    bricks: [ResourceId; 2],
    front: usize,
    published: Option<OctreeStats>,
    node_counter: Counter,
    brick_counter: Counter,
    build_state: ResourceId,
    dispatch_args: ResourceId,
    octree_level: u32,
    max_nodes: u32,
    max_bricks: u32,
    log: LogContext,
}

struct BuildTargets {
    nodes: ResourceId,
    bricks: ResourceId,
    fragments: ResourceId,
    frag_counter: ResourceId,
    max_fragments: u32,
}

impl OctreeBuilder {
    pub fn initialize<B: Backend>(
        gpu: &mut GpuContext<B>,
        octree_level: u32,
        max_nodes: u32,
        max_bricks: u32,
    ) -> Result<Self> {
        if !(MIN_OCTREE_LEVEL..=MAX_OCTREE_LEVEL).contains(&octree_level) {
            return Err(VoxelGiError::InvalidConfig(format!(
                "octree level {octree_level} outside {MIN_OCTREE_LEVEL}..={MAX_OCTREE_LEVEL}"
            )));
        }
        if max_nodes < 9 || max_bricks == 0 {
            return Err(VoxelGiError::InvalidConfig(
                "octree needs room for at least 9 nodes and 1 brick".into(),
            ));
        }

        let mut allocated = Vec::new();
        let result = Self::allocate(gpu, max_nodes, max_bricks, &mut allocated);
        let (nodes, bricks, build_state, dispatch_args) = match result {
            Ok(ids) => ids,
            Err(err) => {
                for id in allocated {
                    gpu.release(id, Owner::OctreeBuilder)?;
                }
                return Err(err);
            }
        };
        let node_counter = Counter::initialize(gpu, CounterRole::OctreeNode)?;
        let brick_counter = Counter::initialize(gpu, CounterRole::OctreeBrick)?;

        let log = gpu.log().clone();
        log.info(
            LOG_TARGET,
            format_args!("octree builder ready: level {octree_level}, {max_nodes} nodes, {max_bricks} bricks"),
        );
        Ok(Self {
            nodes,
            bricks,
            front: 0,
            published: None,
            node_counter,
            brick_counter,
            build_state,
            dispatch_args,
            octree_level,
            max_nodes,
            max_bricks,
            log,
        })
    }

    #[allow(clippy::type_complexity)]
    fn allocate<B: Backend>(
        gpu: &mut GpuContext<B>,
        max_nodes: u32,
        max_bricks: u32,
        allocated: &mut Vec<ResourceId>,
    ) -> Result<([ResourceId; 2], [ResourceId; 2], ResourceId, ResourceId)> {
        let mut create = |label: &str, words: u64, usage: BufferUsage| -> Result<ResourceId> {
            let id = gpu.create_buffer(BufferDesc::words(label, words, usage), Owner::OctreeBuilder)?;
            allocated.push(id);
            Ok(id)
        };
        let storage = BufferUsage::STORAGE | BufferUsage::COPY_SRC;
        let nodes = [
            create("octree.nodes.0", max_nodes as u64 * 2, storage)?,
            create("octree.nodes.1", max_nodes as u64 * 2, storage)?,
        ];
        let bricks = [
            create("octree.bricks.0", max_bricks as u64 * BRICK_WORDS as u64, storage)?,
            create("octree.bricks.1", max_bricks as u64 * BRICK_WORDS as u64, storage)?,
        ];
        let build_state = create("octree.build_state", BUILD_STATE_WORDS, storage)?;
        let dispatch_args = create(
            "octree.dispatch_args",
            DISPATCH_ARGS_WORDS,
            BufferUsage::STORAGE | BufferUsage::INDIRECT,
        )?;
        Ok((nodes, bricks, build_state, dispatch_args))
    }

    pub fn octree_level(&self) -> u32 {
        self.octree_level
    }

    pub fn set_octree_level(&mut self, level: u32) -> Result<()> {
        if !(MIN_OCTREE_LEVEL..=MAX_OCTREE_LEVEL).contains(&level) {
            return Err(VoxelGiError::InvalidConfig(format!(
                "octree level {level} outside {MIN_OCTREE_LEVEL}..={MAX_OCTREE_LEVEL}"
            )));
        }
        self.octree_level = level;
        Ok(())
    }

    pub fn stats(&self) -> Option<&OctreeStats> {
        self.published.as_ref()
    }

    pub fn build_state(&self) -> ResourceId {
        self.build_state
    }

    pub fn dispatch_args(&self) -> ResourceId {
        self.dispatch_args
    }

    /// The published octree, if any build has succeeded.
    pub fn front(&self) -> Option<OctreeView> {
        self.published.as_ref().map(|stats| OctreeView {
            nodes: self.nodes[self.front],
            bricks: self.bricks[self.front],
            octree_level: stats.octree_level,
            node_count: stats.node_count,
            brick_count: stats.brick_count,
        })
    }

    fn back(&self) -> usize {
        if self.published.is_some() {
            1 - self.front
        } else {
            self.front
        }
    }

    fn dispatch_octree(
        &self,
        cmd: &mut CommandBuffer,
        label: String,
        pipeline: PipelineKind,
        bindings: Vec<Binding>,
        params: &OctreeParams,
        workgroups: Workgroups,
    ) {
        cmd.dispatch(label, pipeline, bindings, params, workgroups);
        cmd.barrier_after_last();
    }

    fn indirect(&self, offset: u64) -> Workgroups {
        Workgroups::Indirect {
            buffer: self.dispatch_args,
            offset,
        }
    }

    /// Records every build phase for a tree of depth `level` into `cmd`.
    fn cmd_build(&self, cmd: &mut CommandBuffer, t: &BuildTargets, level: u32, fragment_shift: u32) {
        let params = |pass_level: u32, mode: u32| OctreeParams {
            level: pass_level,
            octree_level: level,
            fragment_shift,
            mode,
            max_nodes: self.max_nodes,
            max_bricks: self.max_bricks,
            max_fragments: t.max_fragments,
            _pad0: 0,
        };
        let node_counter = self.node_counter.buffer();
        let brick_counter = self.brick_counter.buffer();
        let flag = |cmd: &mut CommandBuffer, l: u32| {
            self.dispatch_octree(
                cmd,
                format!("octree flag L{l}"),
                PipelineKind::OctreeFlag,
                vec![
                    Binding::new(t.fragments, Access::Read),
                    Binding::new(t.frag_counter, Access::Read),
                    Binding::new(t.nodes, Access::Atomic),
                ],
                &params(l, 0),
                self.indirect((ARGS_FRAGMENTS * 4) as u64),
            );
        };

        self.dispatch_octree(
            cmd,
            "octree init".into(),
            PipelineKind::OctreeInit,
            vec![
                Binding::new(t.nodes, Access::Write),
                Binding::new(node_counter, Access::Write),
                Binding::new(brick_counter, Access::Write),
                Binding::new(self.build_state, Access::Write),
                Binding::new(self.dispatch_args, Access::Write),
                Binding::new(t.frag_counter, Access::Read),
            ],
            &params(0, 0),
            Workgroups::Direct([1, 1, 1]),
        );

        for l in 0..level {
            flag(cmd, l);
            self.dispatch_octree(
                cmd,
                format!("octree alloc L{l}"),
                PipelineKind::OctreeAlloc,
                vec![
                    Binding::new(t.nodes, Access::ReadWrite),
                    Binding::new(node_counter, Access::Atomic),
                    Binding::new(self.build_state, Access::Atomic),
                ],
                &params(l, 0),
                self.indirect(level_args_offset(l)),
            );
            self.dispatch_octree(
                cmd,
                format!("octree modify args L{l}"),
                PipelineKind::OctreeModifyArgs,
                vec![
                    Binding::new(node_counter, Access::Read),
                    Binding::new(self.build_state, Access::ReadWrite),
                    Binding::new(self.dispatch_args, Access::ReadWrite),
                ],
                &params(l, 0),
                Workgroups::Direct([1, 1, 1]),
            );
        }

        flag(cmd, level);
        self.dispatch_octree(
            cmd,
            "octree leaf alloc".into(),
            PipelineKind::OctreeLeafAlloc,
            vec![
                Binding::new(t.nodes, Access::ReadWrite),
                Binding::new(brick_counter, Access::Atomic),
                Binding::new(t.bricks, Access::Write),
                Binding::new(self.build_state, Access::Atomic),
            ],
            &params(level, 0),
            self.indirect(level_args_offset(level)),
        );
        self.dispatch_octree(
            cmd,
            "octree leaf write".into(),
            PipelineKind::OctreeLeafWrite,
            vec![
                Binding::new(t.fragments, Access::Read),
                Binding::new(t.frag_counter, Access::Read),
                Binding::new(t.nodes, Access::Read),
                Binding::new(t.bricks, Access::Atomic),
            ],
            &params(level, 0),
            self.indirect((ARGS_FRAGMENTS * 4) as u64),
        );

        let mipmap = |cmd: &mut CommandBuffer, l: u32, mode: u32| {
            self.dispatch_octree(
                cmd,
                format!("octree mipmap L{l}"),
                PipelineKind::OctreeMipmap,
                vec![
                    Binding::new(t.nodes, Access::ReadWrite),
                    Binding::new(brick_counter, Access::Atomic),
                    Binding::new(t.bricks, Access::ReadWrite),
                    Binding::new(self.build_state, Access::Atomic),
                ],
                &params(l, mode),
                self.indirect(level_args_offset(l)),
            );
        };
        mipmap(cmd, level, MIPMAP_FINALIZE_LEAVES);
        for l in (0..level).rev() {
            mipmap(cmd, l, MIPMAP_INTERIOR);
        }
    }

    /// Builds from the voxelizer's last fragment list.
    ///
    /// On node or brick overrun the build is retried one level coarser, reusing
    /// the same fragments, down to `MIN_OCTREE_LEVEL`. The published octree is
    /// replaced only by a build that fits.
    pub fn build<B: Backend>(&mut self, gpu: &mut GpuContext<B>, voxelizer: &mut SparseVoxelizer) -> Result<OctreeStats> {
        let fragment_level = voxelizer.octree_level();
        let fragment_count = match voxelizer.fragment_count() {
            Some(count) => count,
            None => voxelizer.read_fragment_count(gpu)?,
        };
        let requested = self.octree_level.min(fragment_level);
        let back = self.back();
        let targets = BuildTargets {
            nodes: self.nodes[back],
            bricks: self.bricks[back],
            fragments: voxelizer.fragments(),
            frag_counter: voxelizer.counter().buffer(),
            max_fragments: voxelizer.max_fragments(),
        };

        let mut last_error = None;
        for level in (MIN_OCTREE_LEVEL..=requested).rev() {
            let mut cmd = gpu.begin(format!("octree build L{level}"));
            self.acquire_for_compute(&mut cmd, gpu.arena(), &[targets.nodes, targets.bricks])?;
            self.cmd_build(&mut cmd, &targets, level, fragment_level - level);
            gpu.submit_and_wait(cmd)?;
            self.node_counter.invalidate();
            self.brick_counter.invalidate();

            let nodes = self.node_counter.read(gpu)?;
            let bricks = self.brick_counter.read(gpu)?;
            let overrun = if nodes > self.max_nodes {
                Some(("octree nodes", nodes, self.max_nodes))
            } else if bricks > self.max_bricks {
                Some(("octree bricks", bricks, self.max_bricks))
            } else {
                None
            };
            if let Some((resource, requested, capacity)) = overrun {
                self.log.warn(
                    LOG_TARGET,
                    format_args!("level {level} build overran {resource} ({requested} > {capacity})"),
                );
                last_error = Some(VoxelGiError::CapacityOverrun {
                    resource,
                    requested: requested as u64,
                    capacity: capacity as u64,
                });
                continue;
            }

            let state = gpu.read_back(self.build_state)?;
            let level_begin = state
                .get(STATE_LEVEL_BEGIN..STATE_LEVEL_BEGIN + level as usize + 2)
                .ok_or_else(|| VoxelGiError::Device("build state readback truncated".into()))?
                .to_vec();
            let stats = OctreeStats {
                octree_level: level,
                requested_level: fragment_level,
                fragment_count,
                node_count: nodes,
                brick_count: bricks,
                level_begin,
            };
            self.front = back;
            self.published = Some(stats.clone());
            self.log.info(
                LOG_TARGET,
                format_args!(
                    "built level {level} octree: {nodes} nodes, {bricks} bricks from {fragment_count} fragments"
                ),
            );
            return Ok(stats);
        }
        Err(last_error.unwrap_or(VoxelGiError::InvalidConfig(format!(
            "no octree level fits below {requested}"
        ))))
    }

    fn acquire_for_compute(&self, cmd: &mut CommandBuffer, arena: &ResourceArena, ids: &[ResourceId]) -> Result<()> {
        for &id in ids {
            if arena.queue_of(id)? == QueueKind::Graphics {
                cmd.acquire_ownership(id, QueueKind::Graphics, Access::Read, Access::Write);
            }
        }
        Ok(())
    }

    /// Records the release of the published octree to the graphics queue.
    /// Returns `false` when there is nothing to transfer.
    pub fn record_transfer_ownership(&self, cmd: &mut CommandBuffer, arena: &ResourceArena) -> Result<bool> {
        let Some(view) = self.front() else {
            return Ok(false);
        };
        let mut recorded = false;
        for id in [view.nodes, view.bricks] {
            if arena.queue_of(id)? == QueueKind::Compute {
                cmd.transfer_ownership(id, Access::Write, Access::Read, QueueKind::Graphics);
                recorded = true;
            }
        }
        Ok(recorded)
    }

    /// Hands the published octree to the graphics queue for cone tracing.
    pub fn transfer_ownership<B: Backend>(&self, gpu: &mut GpuContext<B>) -> Result<()> {
        let mut cmd = gpu.begin("octree ownership transfer");
        if self.record_transfer_ownership(&mut cmd, gpu.arena())? {
            gpu.submit_and_wait(cmd)?;
        }
        Ok(())
    }

    /// Host copy of the published octree.
    pub fn read_octree<B: Backend>(&self, gpu: &mut GpuContext<B>) -> Result<DecodedOctree> {
        let Some(view) = self.front() else {
            return Ok(DecodedOctree::default());
        };
        let nodes = gpu.read_back(view.nodes)?;
        let bricks = gpu.read_back(view.bricks)?;
        Ok(DecodedOctree::decode(&nodes, &bricks, view.octree_level))
    }

    pub fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        for id in self
            .nodes
            .into_iter()
            .chain(self.bricks)
            .chain([self.build_state, self.dispatch_args])
        {
            gpu.release(id, Owner::OctreeBuilder)?;
        }
        self.node_counter.release(gpu)?;
        self.brick_counter.release(gpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoxelGiConfig;
    use crate::core::SceneGeometry;
    use crate::reference_cpu::ReferenceBackend;
    use crate::scene::GpuScene;
    use crate::voxelizer::VoxelGrid;
    use glam::{UVec3, Vec3};
    use rand::{Rng, SeedableRng};

    fn context() -> GpuContext<ReferenceBackend> {
        GpuContext::new(ReferenceBackend::new(), &VoxelGiConfig::default(), LogContext::new("octree"))
    }

    fn voxelized(
        gpu: &mut GpuContext<ReferenceBackend>,
        triangles: Vec<[Vec3; 3]>,
        extent: f32,
        level: u32,
    ) -> (GpuScene, SparseVoxelizer) {
        let scene = GpuScene::upload(gpu, &SceneGeometry { triangles, colors: None }).unwrap();
        let grid = VoxelGrid::new(Vec3::ZERO, extent).unwrap();
        let mut voxelizer = SparseVoxelizer::initialize_in(gpu, grid, level, 1 << 16).unwrap();
        voxelizer.voxelize(gpu, &scene).unwrap();
        (scene, voxelizer)
    }

    fn tiny_triangle() -> Vec<[Vec3; 3]> {
        vec![[
            Vec3::new(64.6, 64.6, 65.0),
            Vec3::new(65.4, 64.6, 65.0),
            Vec3::new(64.6, 65.4, 65.0),
        ]]
    }

    #[test]
    fn single_triangle_builds_one_leaf_at_its_voxel() {
        let mut gpu = context();
        let (_scene, mut voxelizer) = voxelized(&mut gpu, tiny_triangle(), 128.0, 6);
        let mut builder = OctreeBuilder::initialize(&mut gpu, 6, 4096, 1024).unwrap();
        let stats = builder.build(&mut gpu, &mut voxelizer).unwrap();

        assert_eq!(stats.octree_level, 6);
        assert!(!stats.fell_back());
        // One path: root plus eight children per flagged level.
        assert_eq!(stats.node_count, 1 + 8 * 6);
        assert_eq!(stats.brick_count, 7);

        let octree = builder.read_octree(&mut gpu).unwrap();
        assert_eq!(octree.leaves.len(), 1);
        let leaf = &octree.leaves[0];
        assert_eq!(leaf.position, UVec3::new(32, 32, 32));
        assert_eq!(leaf.brick.count, 1);
        assert_eq!(leaf.brick.level, 6);
        assert_eq!(octree.bricks_per_level, vec![1; 7]);
        assert_eq!(octree.root.map(|b| b.count), Some(1));
    }

    #[test]
    fn node_counts_grow_monotonically() {
        let mut gpu = context();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let triangles: Vec<[Vec3; 3]> = (0..12)
            .map(|_| {
                let base = Vec3::new(rng.gen_range(1.0..30.0), rng.gen_range(1.0..30.0), rng.gen_range(1.0..30.0));
                [base, base + Vec3::new(1.5, 0.2, 0.0), base + Vec3::new(0.0, 1.0, 0.7)]
            })
            .collect();
        let (_scene, mut voxelizer) = voxelized(&mut gpu, triangles, 32.0, 5);
        let mut builder = OctreeBuilder::initialize(&mut gpu, 5, 1 << 14, 1 << 14).unwrap();
        let stats = builder.build(&mut gpu, &mut voxelizer).unwrap();

        assert!(stats.level_begin.windows(2).all(|w| w[1] >= w[0]));
        let counts = stats.level_node_counts();
        assert_eq!(counts[0], 1);
        assert!(counts.windows(2).all(|w| w[1] >= w[0]), "{counts:?}");
        assert_eq!(*stats.level_begin.last().unwrap(), stats.node_count);
        assert!(stats.node_count <= 1 << 14);
    }

    #[test]
    fn flagging_twice_matches_flagging_once() {
        let mut gpu = context();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..4 {
            let triangles: Vec<[Vec3; 3]> = (0..6)
                .map(|_| {
                    let a = Vec3::new(rng.gen_range(0.0..16.0), rng.gen_range(0.0..16.0), rng.gen_range(0.0..16.0));
                    [a, a + Vec3::X * rng.gen_range(0.1..3.0), a + Vec3::Y * rng.gen_range(0.1..3.0)]
                })
                .collect();
            let (scene, voxelizer) = voxelized(&mut gpu, triangles, 16.0, 4);
            let builder = OctreeBuilder::initialize(&mut gpu, 4, 1 << 12, 1 << 12).unwrap();
            let targets = BuildTargets {
                nodes: builder.nodes[0],
                bricks: builder.bricks[0],
                fragments: voxelizer.fragments(),
                frag_counter: voxelizer.counter().buffer(),
                max_fragments: voxelizer.max_fragments(),
            };

            let mut cmd = gpu.begin("build");
            builder.cmd_build(&mut cmd, &targets, 4, 0);
            gpu.submit_and_wait(cmd).unwrap();
            let once = gpu.read_back(targets.nodes).unwrap();

            let mut cmd = gpu.begin("flag again");
            builder.dispatch_octree(
                &mut cmd,
                "octree flag L4".into(),
                PipelineKind::OctreeFlag,
                vec![
                    Binding::new(targets.fragments, Access::Read),
                    Binding::new(targets.frag_counter, Access::Read),
                    Binding::new(targets.nodes, Access::Atomic),
                ],
                &OctreeParams {
                    level: 4,
                    octree_level: 4,
                    fragment_shift: 0,
                    mode: 0,
                    max_nodes: 1 << 12,
                    max_bricks: 1 << 12,
                    max_fragments: voxelizer.max_fragments(),
                    _pad0: 0,
                },
                builder.indirect(0),
            );
            gpu.submit_and_wait(cmd).unwrap();
            assert_eq!(gpu.read_back(targets.nodes).unwrap(), once);

            builder.release(&mut gpu).unwrap();
            voxelizer.release(&mut gpu).unwrap();
            scene.release(&mut gpu).unwrap();
        }
        assert_eq!(gpu.arena().live_count(), 0);
    }

    #[test]
    fn overrun_falls_back_to_coarser_level() {
        let mut gpu = context();
        let triangles = vec![[Vec3::new(0.0, 0.0, 8.5), Vec3::new(16.0, 0.0, 8.5), Vec3::new(0.0, 16.0, 8.5)]];
        let (_scene, mut voxelizer) = voxelized(&mut gpu, triangles, 16.0, 4);
        // Level 4 needs far more than 64 nodes; level 1 needs 9.
        let mut builder = OctreeBuilder::initialize(&mut gpu, 4, 64, 1 << 10).unwrap();
        let stats = builder.build(&mut gpu, &mut voxelizer).unwrap();
        assert!(stats.fell_back());
        assert!(stats.octree_level < 4);
        assert!(stats.node_count <= 64);

        let octree = builder.read_octree(&mut gpu).unwrap();
        let res = 1u32 << stats.octree_level;
        assert!(octree.leaves.iter().all(|leaf| leaf.position.max_element() < res));
    }

    #[test]
    fn failed_build_keeps_previous_octree_published() {
        let mut gpu = context();
        let (_scene, mut voxelizer) = voxelized(&mut gpu, tiny_triangle(), 128.0, 6);
        let mut builder = OctreeBuilder::initialize(&mut gpu, 6, 64, 7).unwrap();
        let first = builder.build(&mut gpu, &mut voxelizer).unwrap();
        let published = builder.front().unwrap();

        // Seven bricks fit one path at level 6; shrink the budget so nothing fits.
        builder.max_bricks = 1;
        let err = builder.build(&mut gpu, &mut voxelizer).unwrap_err();
        assert!(err.is_capacity_overrun());
        assert_eq!(builder.front(), Some(published));
        assert_eq!(builder.stats(), Some(&first));
    }

    #[test]
    fn ownership_moves_to_graphics_and_back() {
        let mut gpu = context();
        let (_scene, mut voxelizer) = voxelized(&mut gpu, tiny_triangle(), 128.0, 6);
        let mut builder = OctreeBuilder::initialize(&mut gpu, 6, 4096, 1024).unwrap();
        builder.build(&mut gpu, &mut voxelizer).unwrap();
        builder.transfer_ownership(&mut gpu).unwrap();
        let view = builder.front().unwrap();
        assert_eq!(gpu.queue_of(view.nodes).unwrap(), QueueKind::Graphics);
        assert_eq!(gpu.queue_of(view.bricks).unwrap(), QueueKind::Graphics);

        // Second build writes the other pair; third reacquires the first.
        builder.build(&mut gpu, &mut voxelizer).unwrap();
        builder.transfer_ownership(&mut gpu).unwrap();
        builder.build(&mut gpu, &mut voxelizer).unwrap();
        assert_eq!(builder.front().unwrap().nodes, view.nodes);
        assert_eq!(gpu.queue_of(view.nodes).unwrap(), QueueKind::Compute);
    }
}
