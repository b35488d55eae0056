//! Per-frame driver for voxel GI.

use crate::clipmap::{ClipLevelImage, Clipmap, ClipmapRegion, ClipmapView, RegionBox};
use crate::config::{VoxelGiConfig, CLIP_REGION_COUNT};
use crate::core::{CameraSource, SceneGeometry};
use crate::error::{Result, VoxelGiError};
use crate::gpu::{Backend, GpuContext};
use crate::loader::{LoadStatus, SceneLoader};
use crate::logging::LogContext;
use crate::octree::{DecodedOctree, OctreeStats, OctreeView};
use crate::passes::{
    ClipmapVoxelizationPass, ConeTracingPass, OctreeBuildPass, PassContext, PassKind, PassRegistry, RenderPass,
};
use crate::scene::GpuScene;

const LOG_TARGET: &str = "voxel_gi::session";

/// What cone tracing may read this frame. Every resource named here already
/// belongs to the graphics queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConeTracingInputs {
    pub octree: Option<OctreeView>,
    pub clipmap: Option<ClipmapView>,
}

impl ConeTracingInputs {
    /// Clip level footprints for mapping world positions to texels.
    pub fn regions(&self) -> Option<&[ClipmapRegion; CLIP_REGION_COUNT]> {
        self.clipmap.as_ref().map(|view| &view.regions)
    }
}

/// Outcome of one [`VoxelGiSession::frame`].
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame: u64,
    /// `false` while a background load is still running.
    pub scene_ready: bool,
    pub dirty_levels: Vec<usize>,
    pub revoxelized: Vec<(usize, RegionBox)>,
    pub down_sampled: Vec<(usize, RegionBox)>,
    /// GPU work in submission order.
    pub passes: Vec<String>,
    pub pass_order: Vec<PassKind>,
    /// Set on the frames that rebuilt the octree.
    pub octree: Option<OctreeStats>,
    pub octree_fell_back: bool,
    pub cone_tracing: Option<ConeTracingInputs>,
}

pub struct VoxelGiSession<B: Backend> {
    config: VoxelGiConfig,
    gpu: GpuContext<B>,
    registry: PassRegistry,
    scene: Option<GpuScene>,
    loader: Option<SceneLoader>,
    frame: u64,
    last_inputs: Option<ConeTracingInputs>,
    log: LogContext,
}

impl<B: Backend> VoxelGiSession<B> {
    pub fn new(backend: B, config: VoxelGiConfig, label: &str) -> Result<Self> {
        config.validate()?;
        let log = LogContext::new(label);
        let mut gpu = GpuContext::new(backend, &config, log.clone());
        let mut registry = PassRegistry::new();
        if config.clipmap_enabled {
            let clipmap = Clipmap::initialize(&mut gpu, &config)?;
            registry.register(RenderPass::ClipmapVoxelization(ClipmapVoxelizationPass::new(clipmap)))?;
        }
        if config.octree_enabled {
            let octree = match OctreeBuildPass::initialize(&mut gpu, &config) {
                Ok(octree) => octree,
                Err(err) => {
                    registry.release(&mut gpu)?;
                    return Err(err);
                }
            };
            registry.register(RenderPass::OctreeBuild(octree))?;
        }
        registry.register(RenderPass::ConeTracing(ConeTracingPass::new()))?;
        log.info(LOG_TARGET, format_args!("session started with passes {:?}", registry.kinds()));
        Ok(Self {
            config,
            gpu,
            registry,
            scene: None,
            loader: None,
            frame: 0,
            last_inputs: None,
            log,
        })
    }

    pub fn config(&self) -> &VoxelGiConfig {
        &self.config
    }

    pub fn gpu(&self) -> &GpuContext<B> {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut GpuContext<B> {
        &mut self.gpu
    }

    pub fn registry(&self) -> &PassRegistry {
        &self.registry
    }

    pub fn clipmap(&self) -> Option<&Clipmap> {
        self.registry.clipmap()
    }

    pub fn octree(&self) -> Option<&OctreeBuildPass> {
        self.registry.octree()
    }

    pub fn has_scene(&self) -> bool {
        self.scene.is_some()
    }

    /// Inputs published by the last successful frame.
    pub fn cone_tracing_inputs(&self) -> Option<&ConeTracingInputs> {
        self.last_inputs.as_ref()
    }

    /// Uploads `geometry`, replacing any previous scene, and schedules a full
    /// rebuild of every voxel structure.
    pub fn set_scene(&mut self, geometry: &SceneGeometry) -> Result<()> {
        let scene = GpuScene::upload(&mut self.gpu, geometry)?;
        if let Some(old) = self.scene.replace(scene) {
            old.release(&mut self.gpu)?;
        }
        self.registry.on_scene_changed(&mut self.gpu)?;
        self.log.info(
            LOG_TARGET,
            format_args!("scene set: {} triangles", geometry.triangles.len()),
        );
        Ok(())
    }

    /// Loads the scene on a background thread; [`frame`](Self::frame) picks
    /// it up once ready.
    pub fn load_scene<F>(&mut self, label: &str, load: F) -> Result<()>
    where
        F: FnOnce() -> Result<SceneGeometry> + Send + 'static,
    {
        self.loader = Some(SceneLoader::spawn(label, load)?);
        Ok(())
    }

    fn poll_loader(&mut self) -> Result<bool> {
        let Some(loader) = self.loader.as_mut() else {
            return Ok(true);
        };
        match loader.poll() {
            LoadStatus::Pending => Ok(false),
            LoadStatus::Ready(geometry) => {
                self.loader = None;
                self.set_scene(&geometry)?;
                Ok(true)
            }
            LoadStatus::Failed(err) => {
                self.loader = None;
                self.log.error(LOG_TARGET, format_args!("{err}"));
                Err(err)
            }
            LoadStatus::Delivered => {
                self.loader = None;
                Ok(true)
            }
        }
    }

    /// Runs every pass once for `camera`.
    ///
    /// On error the previously published clipmap regions and octree stay in
    /// place and [`cone_tracing_inputs`](Self::cone_tracing_inputs) keeps
    /// returning the last good frame.
    pub fn frame(&mut self, camera: &dyn CameraSource) -> Result<FrameReport> {
        self.frame += 1;
        let mut report = FrameReport {
            frame: self.frame,
            ..FrameReport::default()
        };
        if !self.poll_loader()? {
            return Ok(report);
        }
        let Some(scene) = self.scene else {
            return Err(VoxelGiError::SceneNotReady);
        };
        let camera = camera.bounding_region();
        camera.validate()?;
        report.scene_ready = true;

        let mut ctx = PassContext {
            gpu: &mut self.gpu,
            scene: &scene,
            camera,
            report: &mut report,
            clipmap: None,
            octree: None,
        };
        if let Err(err) = self.registry.run_frame(&mut ctx) {
            self.log
                .error(LOG_TARGET, format_args!("frame {} abandoned: {err}", self.frame));
            return Err(err);
        }
        if report.cone_tracing.is_some() {
            self.last_inputs = report.cone_tracing;
        }
        self.log.debug(
            LOG_TARGET,
            format_args!(
                "frame {}: dirty levels {:?}, {} dispatch groups",
                self.frame,
                report.dirty_levels,
                report.passes.len()
            ),
        );
        Ok(report)
    }

    /// Host copy of the published octree; empty when none was built.
    pub fn read_octree(&mut self) -> Result<DecodedOctree> {
        match self.registry.octree() {
            Some(pass) => pass.builder().read_octree(&mut self.gpu),
            None => Ok(DecodedOctree::default()),
        }
    }

    /// Host copy of one clip level of both volumes.
    pub fn read_clip_level(&mut self, level: usize) -> Result<ClipLevelImage> {
        match self.registry.clipmap() {
            Some(clipmap) => clipmap.read_level(&mut self.gpu, level),
            None => Err(VoxelGiError::InvalidConfig("clipmap is disabled".into())),
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.registry.release(&mut self.gpu)?;
        if let Some(scene) = self.scene.take() {
            scene.release(&mut self.gpu)?;
        }
        Ok(())
    }
}
