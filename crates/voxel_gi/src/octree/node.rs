//! Host-side decoding of the linear octree and its bricks.

use glam::UVec3;

use crate::core::unpack_rgba8;
use crate::gpu::params::{
    BRICK_AVERAGE, BRICK_CHILD_MASK, BRICK_COUNT, BRICK_LEVEL, BRICK_SUM, NODE_CHILD_MASK, NODE_FLAG,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OctreeNode {
    pub child: u32,
    pub payload: u32,
}

impl OctreeNode {
    pub fn from_words(words: &[u32], index: u32) -> Self {
        let at = index as usize * 2;
        Self {
            child: words.get(at).copied().unwrap_or(0),
            payload: words.get(at + 1).copied().unwrap_or(0),
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.child & NODE_FLAG != 0
    }

    /// Index of the first of eight children.
    pub fn child_base(&self) -> Option<u32> {
        match self.child & NODE_CHILD_MASK {
            0 => None,
            base => Some(base),
        }
    }

    pub fn brick(&self) -> Option<u32> {
        self.payload.checked_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Brick {
    pub sum: [u32; 4],
    pub count: u32,
    pub average: [u8; 4],
    pub child_mask: u8,
    pub level: u32,
}

impl Brick {
    pub fn from_words(words: &[u32], index: u32) -> Option<Self> {
        let base = index as usize * 8;
        let w = words.get(base..base + 8)?;
        Some(Self {
            sum: [w[BRICK_SUM], w[BRICK_SUM + 1], w[BRICK_SUM + 2], w[BRICK_SUM + 3]],
            count: w[BRICK_COUNT],
            average: unpack_rgba8(w[BRICK_AVERAGE]),
            child_mask: w[BRICK_CHILD_MASK] as u8,
            level: w[BRICK_LEVEL],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLeaf {
    pub position: UVec3,
    pub brick: Brick,
}

/// Full host copy of a built octree.
#[derive(Debug, Clone, Default)]
pub struct DecodedOctree {
    pub octree_level: u32,
    pub leaves: Vec<DecodedLeaf>,
    /// Nodes carrying a brick, per level, root first.
    pub bricks_per_level: Vec<u32>,
    pub root: Option<Brick>,
}

impl DecodedOctree {
    /// Walks `nodes` from the root down to `octree_level`.
    pub fn decode(nodes: &[u32], bricks: &[u32], octree_level: u32) -> Self {
        let mut out = Self {
            octree_level,
            bricks_per_level: vec![0; octree_level as usize + 1],
            ..Self::default()
        };
        let root = OctreeNode::from_words(nodes, 0);
        out.root = root.brick().and_then(|b| Brick::from_words(bricks, b));

        let mut stack = vec![(0u32, 0u32, UVec3::ZERO)];
        while let Some((index, depth, position)) = stack.pop() {
            let node = OctreeNode::from_words(nodes, index);
            let brick = node.brick().and_then(|b| Brick::from_words(bricks, b));
            if brick.is_some() {
                out.bricks_per_level[depth as usize] += 1;
            }
            if depth == octree_level {
                if let Some(brick) = brick {
                    out.leaves.push(DecodedLeaf { position, brick });
                }
                continue;
            }
            if let Some(base) = node.child_base() {
                for k in 0..8u32 {
                    let offset = UVec3::new(k & 1, (k >> 1) & 1, (k >> 2) & 1);
                    stack.push((base + k, depth + 1, position * 2 + offset));
                }
            }
        }
        out.leaves.sort_by_key(|leaf| (leaf.position.z, leaf.position.y, leaf.position.x));
        out
    }

    pub fn leaf_at(&self, position: UVec3) -> Option<&DecodedLeaf> {
        self.leaves.iter().find(|leaf| leaf.position == position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_follows_child_pointers() {
        // Root -> children 1..9, child 7 (octant x=1,y=1,z=1) is a leaf with brick 0.
        let mut nodes = vec![0u32; 9 * 2];
        nodes[0] = NODE_FLAG | 1;
        nodes[1] = 2;
        nodes[8 * 2] = NODE_FLAG;
        nodes[8 * 2 + 1] = 1;
        let mut bricks = vec![0u32; 16];
        bricks[BRICK_COUNT] = 3;
        bricks[BRICK_AVERAGE] = u32::from_le_bytes([1, 2, 3, 255]);
        bricks[8 + BRICK_CHILD_MASK] = 1 << 7;

        let octree = DecodedOctree::decode(&nodes, &bricks, 1);
        assert_eq!(octree.leaves.len(), 1);
        assert_eq!(octree.leaves[0].position, UVec3::ONE);
        assert_eq!(octree.leaves[0].brick.average, [1, 2, 3, 255]);
        assert_eq!(octree.bricks_per_level, vec![1, 1]);
        assert_eq!(octree.root.map(|b| b.child_mask), Some(1 << 7));
    }
}
