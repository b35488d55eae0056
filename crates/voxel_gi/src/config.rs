//! Startup constants and the session configuration.

use std::time::Duration;

use crate::error::{Result, VoxelGiError};

/// Coarsest octree level the builder accepts.
pub const MIN_OCTREE_LEVEL: u32 = 1;
/// Finest octree level the builder accepts (1024³ leaves).
pub const MAX_OCTREE_LEVEL: u32 = 10;
/// Upper bound on octree nodes (root included).
pub const MAX_OCTREE_NODE_NUM: u32 = 1 << 22;
/// Upper bound on octree bricks (leaf and interior).
pub const MAX_OCTREE_BRICK_NUM: u32 = 1 << 20;
/// Number of concentric clip levels.
pub const CLIP_REGION_COUNT: usize = 6;
/// Border texels added on every side of a clip level.
pub const VOXEL_BORDER: u32 = 1;
/// Voxels per axis of every clip level.
pub const BASE_VOXEL_RESOLUTION: u32 = 128;
/// Margin, in coarse texels, re-aggregated around each down-sampled region.
pub const DOWN_SAMPLE_REGION_SIZE: u32 = 10;
/// Invocations per workgroup for every compute kernel.
pub const WORKGROUP_SIZE: u32 = 64;
/// `u32` words per octree brick.
pub const BRICK_WORDS: u32 = 8;
/// Default bound for fence waits.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-level minimum camera displacement, in voxels of that level, that
/// triggers re-voxelization.
pub const DEFAULT_CLIP_MIN_CHANGE: [u32; CLIP_REGION_COUNT] = [2, 2, 4, 4, 8, 8];

/// Configuration for a voxel GI session.
#[derive(Debug, Clone)]
pub struct VoxelGiConfig {
    /// Octree depth; leaf resolution is `2^octree_level`.
    pub octree_level: u32,
    /// Capacity of the octree node buffer.
    pub max_octree_nodes: u32,
    /// Capacity of the octree brick buffer.
    pub max_octree_bricks: u32,
    /// Capacity of the voxel fragment list.
    pub max_fragments: u32,
    /// Voxels per axis of each clip level.
    pub clipmap_resolution: u32,
    /// World-space edge length of a voxel at clip level 0.
    pub base_voxel_size: f32,
    /// Border texels per side of each clip level.
    pub voxel_border: u32,
    /// See [`DEFAULT_CLIP_MIN_CHANGE`].
    pub clip_min_change: [u32; CLIP_REGION_COUNT],
    /// See [`DOWN_SAMPLE_REGION_SIZE`].
    pub down_sample_region_size: u32,
    /// Bound applied to every fence wait.
    pub fence_timeout: Duration,
    /// Run the barrier/ownership validator on every submission.
    pub validate_dependencies: bool,
    /// Build the sparse octree each time the scene changes.
    pub octree_enabled: bool,
    /// Maintain the camera-anchored clipmap every frame.
    pub clipmap_enabled: bool,
}

impl Default for VoxelGiConfig {
    fn default() -> Self {
        Self {
            octree_level: 7,
            max_octree_nodes: MAX_OCTREE_NODE_NUM,
            max_octree_bricks: MAX_OCTREE_BRICK_NUM,
            max_fragments: MAX_OCTREE_NODE_NUM,
            clipmap_resolution: BASE_VOXEL_RESOLUTION,
            base_voxel_size: 0.125,
            voxel_border: VOXEL_BORDER,
            clip_min_change: DEFAULT_CLIP_MIN_CHANGE,
            down_sample_region_size: DOWN_SAMPLE_REGION_SIZE,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            validate_dependencies: cfg!(debug_assertions),
            octree_enabled: true,
            clipmap_enabled: true,
        }
    }
}

impl VoxelGiConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_OCTREE_LEVEL..=MAX_OCTREE_LEVEL).contains(&self.octree_level) {
            return Err(VoxelGiError::InvalidConfig(format!(
                "octree_level must be in {MIN_OCTREE_LEVEL}..={MAX_OCTREE_LEVEL} (got {})",
                self.octree_level
            )));
        }
        if self.max_octree_nodes < 9 || self.max_octree_nodes > MAX_OCTREE_NODE_NUM {
            return Err(VoxelGiError::InvalidConfig(format!(
                "max_octree_nodes must be in 9..={MAX_OCTREE_NODE_NUM} (got {})",
                self.max_octree_nodes
            )));
        }
        if self.max_octree_bricks == 0 || self.max_octree_bricks > MAX_OCTREE_BRICK_NUM {
            return Err(VoxelGiError::InvalidConfig(format!(
                "max_octree_bricks must be in 1..={MAX_OCTREE_BRICK_NUM} (got {})",
                self.max_octree_bricks
            )));
        }
        if self.max_fragments == 0 {
            return Err(VoxelGiError::InvalidConfig("max_fragments must be >= 1".into()));
        }
        if self.clipmap_resolution < 4
            || !self.clipmap_resolution.is_power_of_two()
            || self.clipmap_resolution > 512
        {
            return Err(VoxelGiError::InvalidConfig(format!(
                "clipmap_resolution must be a power of two in 4..=512 (got {})",
                self.clipmap_resolution
            )));
        }
        if !self.base_voxel_size.is_finite() || self.base_voxel_size <= 0.0 {
            return Err(VoxelGiError::InvalidConfig(
                "base_voxel_size must be finite and > 0".into(),
            ));
        }
        if self.voxel_border > self.clipmap_resolution / 2 {
            return Err(VoxelGiError::InvalidConfig(format!(
                "voxel_border {} exceeds half the clipmap resolution",
                self.voxel_border
            )));
        }
        for (level, pair) in self.clip_min_change.windows(2).enumerate() {
            if pair[0] == 0 {
                return Err(VoxelGiError::InvalidConfig(format!(
                    "clip_min_change[{level}] must be >= 1"
                )));
            }
            if pair[1] < pair[0] {
                return Err(VoxelGiError::InvalidConfig(format!(
                    "clip_min_change must not decrease from level {level} to {}",
                    level + 1
                )));
            }
        }
        if self.clip_min_change.iter().any(|&t| t > self.clipmap_resolution) {
            return Err(VoxelGiError::InvalidConfig(
                "clip_min_change entries must not exceed clipmap_resolution".into(),
            ));
        }
        if self.fence_timeout.is_zero() {
            return Err(VoxelGiError::InvalidConfig("fence_timeout must be > 0".into()));
        }
        Ok(())
    }

    /// Padded texel count per axis of one clip level.
    pub fn padded_resolution(&self) -> u32 {
        self.clipmap_resolution + 2 * self.voxel_border
    }

    /// Voxel edge length at `level`.
    pub fn voxel_size(&self, level: usize) -> f32 {
        self.base_voxel_size * (1u32 << level) as f32
    }
}
