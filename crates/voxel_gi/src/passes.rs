//! Per-frame passes and the registry that sequences them.
//!
//! Each pass kind is a variant of [`RenderPass`]; the registry runs
//! `begin_pass`, `update` and `end_pass` of every registered pass in
//! registration order, so the frame's phase order is explicit data.

use crate::clipmap::{Clipmap, ClipmapPlan, ClipmapView};
use crate::config::{VoxelGiConfig, MIN_OCTREE_LEVEL};
use crate::core::Aabb;
use crate::error::{Result, VoxelGiError};
use crate::gpu::{Backend, GpuContext};
use crate::logging::LogContext;
use crate::octree::{OctreeBuilder, OctreeView};
use crate::scene::GpuScene;
use crate::session::{ConeTracingInputs, FrameReport};
use crate::voxelizer::SparseVoxelizer;

const LOG_TARGET: &str = "voxel_gi::passes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    ClipmapVoxelization,
    OctreeBuild,
    ConeTracing,
}

/// Everything a pass may touch during one frame.
pub struct PassContext<'a, B: Backend> {
    pub gpu: &'a mut GpuContext<B>,
    pub scene: &'a GpuScene,
    pub camera: Aabb,
    pub report: &'a mut FrameReport,
    /// Finished clip volumes, set once they belong to the graphics queue.
    pub clipmap: Option<ClipmapView>,
    /// Published octree, set once it belongs to the graphics queue.
    pub octree: Option<OctreeView>,
}

pub struct ClipmapVoxelizationPass {
    clipmap: Clipmap,
    plan: Option<ClipmapPlan>,
}

impl ClipmapVoxelizationPass {
    pub fn new(clipmap: Clipmap) -> Self {
        Self { clipmap, plan: None }
    }

    pub fn clipmap(&self) -> &Clipmap {
        &self.clipmap
    }

    fn begin_pass<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        self.plan = Some(self.clipmap.plan(&ctx.camera));
        Ok(())
    }

    fn update<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        let Some(plan) = &self.plan else {
            return Ok(());
        };
        let update = match self.clipmap.apply(ctx.gpu, ctx.scene, plan) {
            Ok(update) => update,
            Err(err) => {
                self.plan = None;
                return Err(err);
            }
        };
        ctx.report.dirty_levels = update.dirty_levels;
        ctx.report.revoxelized = update.revoxelized;
        ctx.report.down_sampled = update.down_sampled;
        ctx.report.passes.extend(update.passes);
        Ok(())
    }

    fn end_pass<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        if let Some(plan) = self.plan.take() {
            self.clipmap.commit(&plan);
        }
        ctx.clipmap = self.clipmap.view(ctx.gpu.arena())?;
        Ok(())
    }
}

/// Voxelizes the scene into fragments and rebuilds the octree whenever the
/// scene changes.
pub struct OctreeBuildPass {
    builder: OctreeBuilder,
    voxelizer: Option<SparseVoxelizer>,
    octree_level: u32,
    max_fragments: u32,
    stale: bool,
    log: LogContext,
}

impl OctreeBuildPass {
    pub fn initialize<B: Backend>(gpu: &mut GpuContext<B>, config: &VoxelGiConfig) -> Result<Self> {
        let builder = OctreeBuilder::initialize(
            gpu,
            config.octree_level,
            config.max_octree_nodes,
            config.max_octree_bricks,
        )?;
        Ok(Self {
            builder,
            voxelizer: None,
            octree_level: config.octree_level,
            max_fragments: config.max_fragments,
            stale: true,
            log: gpu.log().clone(),
        })
    }

    pub fn builder(&self) -> &OctreeBuilder {
        &self.builder
    }

    pub fn voxelizer(&self) -> Option<&SparseVoxelizer> {
        self.voxelizer.as_ref()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Drops the fragment list of the old scene; the next frame rebuilds.
    pub fn on_scene_changed<B: Backend>(&mut self, gpu: &mut GpuContext<B>) -> Result<()> {
        self.stale = true;
        match self.voxelizer.take() {
            Some(voxelizer) => voxelizer.release(gpu),
            None => Ok(()),
        }
    }

    fn begin_pass<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        if self.stale && self.voxelizer.is_none() {
            self.voxelizer = Some(SparseVoxelizer::initialize(
                ctx.gpu,
                ctx.scene,
                self.octree_level,
                self.max_fragments,
            )?);
        }
        Ok(())
    }

    /// Voxelizes, stepping the level down while the fragment list overruns,
    /// then builds.
    fn update<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        if !self.stale {
            return Ok(());
        }
        let Some(voxelizer) = self.voxelizer.as_mut() else {
            return Ok(());
        };
        loop {
            match voxelizer.voxelize(ctx.gpu, ctx.scene) {
                Ok(_) => break,
                Err(err) if err.is_capacity_overrun() && voxelizer.octree_level() > MIN_OCTREE_LEVEL => {
                    let level = voxelizer.octree_level() - 1;
                    self.log
                        .warn(LOG_TARGET, format_args!("{err}; voxelizing at level {level} instead"));
                    voxelizer.set_octree_level(level)?;
                    ctx.report.octree_fell_back = true;
                }
                Err(err) => return Err(err),
            }
        }
        ctx.report.passes.push(format!("voxelize fragments L{}", voxelizer.octree_level()));
        let stats = self.builder.build(ctx.gpu, voxelizer)?;
        ctx.report.passes.push(format!("octree build L{}", stats.octree_level));
        ctx.report.octree_fell_back |= stats.fell_back();
        ctx.report.octree = Some(stats);
        self.stale = false;
        Ok(())
    }

    fn end_pass<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        self.builder.transfer_ownership(ctx.gpu)?;
        ctx.octree = self.builder.front();
        Ok(())
    }

    fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        if let Some(voxelizer) = self.voxelizer {
            voxelizer.release(gpu)?;
        }
        self.builder.release(gpu)
    }
}

/// The consumer end of the frame: gathers what cone tracing may sample.
#[derive(Debug, Default)]
pub struct ConeTracingPass {
    inputs: Option<ConeTracingInputs>,
}

impl ConeTracingPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> Option<&ConeTracingInputs> {
        self.inputs.as_ref()
    }

    fn begin_pass<B: Backend>(&mut self, _ctx: &mut PassContext<'_, B>) -> Result<()> {
        self.inputs = None;
        Ok(())
    }

    fn update<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        if ctx.clipmap.is_none() && ctx.octree.is_none() {
            return Ok(());
        }
        self.inputs = Some(ConeTracingInputs {
            octree: ctx.octree,
            clipmap: ctx.clipmap,
        });
        Ok(())
    }

    fn end_pass<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        ctx.report.cone_tracing = self.inputs;
        Ok(())
    }
}

pub enum RenderPass {
    ClipmapVoxelization(ClipmapVoxelizationPass),
    OctreeBuild(OctreeBuildPass),
    ConeTracing(ConeTracingPass),
}

impl RenderPass {
    pub fn kind(&self) -> PassKind {
        match self {
            RenderPass::ClipmapVoxelization(_) => PassKind::ClipmapVoxelization,
            RenderPass::OctreeBuild(_) => PassKind::OctreeBuild,
            RenderPass::ConeTracing(_) => PassKind::ConeTracing,
        }
    }

    pub fn begin_pass<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        match self {
            RenderPass::ClipmapVoxelization(pass) => pass.begin_pass(ctx),
            RenderPass::OctreeBuild(pass) => pass.begin_pass(ctx),
            RenderPass::ConeTracing(pass) => pass.begin_pass(ctx),
        }
    }

    pub fn update<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        match self {
            RenderPass::ClipmapVoxelization(pass) => pass.update(ctx),
            RenderPass::OctreeBuild(pass) => pass.update(ctx),
            RenderPass::ConeTracing(pass) => pass.update(ctx),
        }
    }

    pub fn end_pass<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        match self {
            RenderPass::ClipmapVoxelization(pass) => pass.end_pass(ctx),
            RenderPass::OctreeBuild(pass) => pass.end_pass(ctx),
            RenderPass::ConeTracing(pass) => pass.end_pass(ctx),
        }
    }

    pub fn on_scene_changed<B: Backend>(&mut self, gpu: &mut GpuContext<B>) -> Result<()> {
        match self {
            RenderPass::ClipmapVoxelization(pass) => {
                pass.clipmap.set_full_revoxelization();
                Ok(())
            }
            RenderPass::OctreeBuild(pass) => pass.on_scene_changed(gpu),
            RenderPass::ConeTracing(_) => Ok(()),
        }
    }

    pub fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        match self {
            RenderPass::ClipmapVoxelization(pass) => pass.clipmap.release(gpu),
            RenderPass::OctreeBuild(pass) => pass.release(gpu),
            RenderPass::ConeTracing(_) => Ok(()),
        }
    }
}

/// Passes in the order they run each frame; at most one per kind.
#[derive(Default)]
pub struct PassRegistry {
    passes: Vec<RenderPass>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pass: RenderPass) -> Result<()> {
        let kind = pass.kind();
        if self.get(kind).is_some() {
            return Err(VoxelGiError::InvalidConfig(format!("{kind:?} pass registered twice")));
        }
        self.passes.push(pass);
        Ok(())
    }

    pub fn kinds(&self) -> Vec<PassKind> {
        self.passes.iter().map(RenderPass::kind).collect()
    }

    pub fn get(&self, kind: PassKind) -> Option<&RenderPass> {
        self.passes.iter().find(|pass| pass.kind() == kind)
    }

    pub fn clipmap(&self) -> Option<&Clipmap> {
        self.passes.iter().find_map(|pass| match pass {
            RenderPass::ClipmapVoxelization(pass) => Some(pass.clipmap()),
            _ => None,
        })
    }

    pub fn octree(&self) -> Option<&OctreeBuildPass> {
        self.passes.iter().find_map(|pass| match pass {
            RenderPass::OctreeBuild(pass) => Some(pass),
            _ => None,
        })
    }

    /// Runs every pass to completion in registration order.
    pub fn run_frame<B: Backend>(&mut self, ctx: &mut PassContext<'_, B>) -> Result<()> {
        for pass in &mut self.passes {
            pass.begin_pass(ctx)?;
            pass.update(ctx)?;
            pass.end_pass(ctx)?;
            ctx.report.pass_order.push(pass.kind());
        }
        Ok(())
    }

    pub fn on_scene_changed<B: Backend>(&mut self, gpu: &mut GpuContext<B>) -> Result<()> {
        for pass in &mut self.passes {
            pass.on_scene_changed(gpu)?;
        }
        Ok(())
    }

    pub fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        for pass in self.passes {
            pass.release(gpu)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicate_kinds_and_keeps_order() {
        let mut registry = PassRegistry::new();
        registry.register(RenderPass::ConeTracing(ConeTracingPass::new())).unwrap();
        assert!(registry.register(RenderPass::ConeTracing(ConeTracingPass::new())).is_err());
        assert_eq!(registry.kinds(), vec![PassKind::ConeTracing]);
        assert!(registry.clipmap().is_none());
        assert!(registry.octree().is_none());
    }
}
