//! Uniform parameter blocks shared by command recording, the WGSL kernels and
//! the CPU reference kernels. Layouts match the WGSL `Params` structs.

use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct VoxelizeFragmentParams {
    /// Grid origin in world space; `w` is the inverse voxel size.
    pub origin: [f32; 4],
    pub resolution: u32,
    pub num_triangles: u32,
    pub max_fragments: u32,
    pub _pad0: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ClipmapVoxelizeParams {
    /// Region min corner in level voxel coordinates; `w` is the clip level.
    pub region_min: [i32; 4],
    pub region_extent: [u32; 4],
    pub voxel_size: f32,
    pub resolution: u32,
    pub border: u32,
    pub num_triangles: u32,
}

/// Parameters shared by the clear, border-wrap, down-sample and copy-alpha
/// kernels. Border wrap and copy alpha ignore the region and always cover the
/// whole padded level.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ClipmapPassParams {
    pub region_min: [i32; 4],
    pub region_extent: [u32; 4],
    pub level: u32,
    pub resolution: u32,
    pub border: u32,
    pub mode: u32,
}

pub const DOWN_SAMPLE_OPACITY: u32 = 0;
pub const DOWN_SAMPLE_RADIANCE: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct OctreeParams {
    /// Level the pass operates on.
    pub level: u32,
    /// Leaf depth of the octree being built.
    pub octree_level: u32,
    /// Right shift applied to fragment positions (coarser-level fallback).
    pub fragment_shift: u32,
    pub mode: u32,
    pub max_nodes: u32,
    pub max_bricks: u32,
    pub max_fragments: u32,
    pub _pad0: u32,
}

pub const MIPMAP_FINALIZE_LEAVES: u32 = 0;
pub const MIPMAP_INTERIOR: u32 = 1;

/// Octree node flag: the node needs subdivision (interior) or a brick (leaf).
pub const NODE_FLAG: u32 = 0x8000_0000;
pub const NODE_CHILD_MASK: u32 = 0x7fff_ffff;

/// `build_state` word layout.
pub const STATE_OVERFLOW: usize = 0;
pub const STATE_FRAGMENT_COUNT: usize = 1;
pub const STATE_LEVEL_BEGIN: usize = 4;

pub const OVERFLOW_NODES: u32 = 1;
pub const OVERFLOW_BRICKS: u32 = 1 << 1;

/// `dispatch_args` word layout: fragment arguments, then one triple per level.
pub const ARGS_FRAGMENTS: usize = 0;
pub const ARGS_LEVEL_BASE: usize = 3;

/// Byte offset of the indirect arguments for octree level `level`.
pub fn level_args_offset(level: u32) -> u64 {
    ((ARGS_LEVEL_BASE + 3 * level as usize) * 4) as u64
}

/// Brick word layout.
pub const BRICK_SUM: usize = 0;
pub const BRICK_COUNT: usize = 4;
pub const BRICK_AVERAGE: usize = 5;
pub const BRICK_CHILD_MASK: usize = 6;
pub const BRICK_LEVEL: usize = 7;
