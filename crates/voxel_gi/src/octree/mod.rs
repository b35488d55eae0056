//! Linear sparse voxel octree built on the GPU in dependent passes.
//!
//! A build runs init, then flag/alloc/modify-args once per level, then leaf
//! flag, leaf alloc, leaf write and a bottom-up mipmap. Per-level dispatch
//! sizes are read from an indirect argument buffer written by the previous
//! level's passes.

mod builder;
mod node;

pub use builder::{OctreeBuilder, OctreeStats, OctreeView};
pub use node::{Brick, DecodedLeaf, DecodedOctree, OctreeNode};
