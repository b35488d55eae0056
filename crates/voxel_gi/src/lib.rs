//! Voxel structures for voxel cone tracing: a sparse brick octree built from
//! scene triangles and a camera-anchored six-level clipmap that is
//! re-voxelized incrementally as the camera moves.

pub mod clipmap;
pub mod config;
pub mod core;
pub mod counter;
pub mod error;
pub mod gpu;
pub mod loader;
pub mod logging;
pub mod octree;
pub mod passes;
pub mod reference_cpu;
pub mod scene;
pub mod session;
pub mod voxelizer;

pub use crate::clipmap::{Clipmap, ClipmapRegion, ClipmapTracker, ClipmapUpdate, ClipmapView, RegionBox};
pub use crate::config::VoxelGiConfig;
pub use crate::core::{Aabb, CameraSource, SceneGeometry, VoxelFragment};
pub use crate::counter::Counter;
pub use crate::error::{Result, VoxelGiError};
pub use crate::gpu::{Backend, GpuContext, QueueKind, WgpuBackend};
pub use crate::octree::{DecodedOctree, OctreeBuilder, OctreeStats, OctreeView};
pub use crate::passes::{PassKind, PassRegistry, RenderPass};
pub use crate::reference_cpu::ReferenceBackend;
pub use crate::scene::GpuScene;
pub use crate::session::{ConeTracingInputs, FrameReport, VoxelGiSession};
pub use crate::voxelizer::SparseVoxelizer;
