use glam::{IVec3, UVec3, Vec3};

use crate::core::Aabb;

/// Axis-aligned box of voxels in one clip level's integer grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionBox {
    pub min: IVec3,
    pub extent: UVec3,
}

impl RegionBox {
    pub fn new(min: IVec3, extent: UVec3) -> Self {
        Self { min, extent }
    }

    /// Box spanning `min..max` (exclusive); empty when any axis is inverted.
    pub fn from_bounds(min: IVec3, max: IVec3) -> Self {
        Self {
            min,
            extent: (max - min).max(IVec3::ZERO).as_uvec3(),
        }
    }

    /// Exclusive upper corner.
    pub fn max(&self) -> IVec3 {
        self.min + self.extent.as_ivec3()
    }

    pub fn is_empty(&self) -> bool {
        self.extent.cmpeq(UVec3::ZERO).any()
    }

    pub fn voxel_count(&self) -> u64 {
        self.extent.x as u64 * self.extent.y as u64 * self.extent.z as u64
    }

    pub fn contains(&self, v: IVec3) -> bool {
        v.cmpge(self.min).all() && v.cmplt(self.max()).all()
    }

    pub fn intersection(&self, other: &RegionBox) -> RegionBox {
        RegionBox::from_bounds(self.min.max(other.min), self.max().min(other.max()))
    }

    /// Smallest box containing both; an empty operand is ignored.
    pub fn union_bounds(&self, other: &RegionBox) -> RegionBox {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        RegionBox::from_bounds(self.min.min(other.min), self.max().max(other.max()))
    }

    pub fn grown(&self, margin: u32) -> RegionBox {
        let m = IVec3::splat(margin as i32);
        RegionBox::from_bounds(self.min - m, self.max() + m)
    }

    /// The box at the next coarser level covering every texel this one touches.
    pub fn coarsened(&self) -> RegionBox {
        let max = self.max();
        RegionBox::from_bounds(
            IVec3::new(self.min.x.div_euclid(2), self.min.y.div_euclid(2), self.min.z.div_euclid(2)),
            IVec3::new(
                (max.x + 1).div_euclid(2),
                (max.y + 1).div_euclid(2),
                (max.z + 1).div_euclid(2),
            ),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = IVec3> + '_ {
        let (min, max) = (self.min, self.max());
        (min.z..max.z).flat_map(move |z| (min.y..max.y).flat_map(move |y| (min.x..max.x).map(move |x| IVec3::new(x, y, z))))
    }
}

/// The footprint of one clip level: a fixed-size cube of voxels anchored at
/// `min_corner`, in units of that level's `voxel_size`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipmapRegion {
    pub min_corner: IVec3,
    pub extent: UVec3,
    pub voxel_size: f32,
}

impl ClipmapRegion {
    pub fn footprint(&self) -> RegionBox {
        RegionBox::new(self.min_corner, self.extent)
    }

    pub fn world_bounds(&self) -> Aabb {
        let min = self.min_corner.as_vec3() * self.voxel_size;
        Aabb::new(min, min + self.extent.as_vec3() * self.voxel_size)
    }

    /// World-space center of voxel `v` of this level.
    pub fn voxel_center(&self, v: IVec3) -> Vec3 {
        (v.as_vec3() + Vec3::splat(0.5)) * self.voxel_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarsened_covers_odd_bounds() {
        let fine = RegionBox::new(IVec3::new(-3, 1, 4), UVec3::new(3, 2, 1));
        let coarse = fine.coarsened();
        for v in fine.iter() {
            let parent = IVec3::new(v.x.div_euclid(2), v.y.div_euclid(2), v.z.div_euclid(2));
            assert!(coarse.contains(parent), "{v} -> {parent} not in {coarse:?}");
        }
        assert_eq!(coarse.min, IVec3::new(-2, 0, 2));
        assert_eq!(coarse.max(), IVec3::new(0, 2, 3));
    }

    #[test]
    fn union_ignores_empty_boxes() {
        let a = RegionBox::new(IVec3::ZERO, UVec3::splat(2));
        let empty = RegionBox::new(IVec3::splat(100), UVec3::ZERO);
        assert_eq!(a.union_bounds(&empty), a);
        assert_eq!(empty.union_bounds(&a), a);
        let b = RegionBox::new(IVec3::splat(4), UVec3::ONE);
        assert_eq!(a.union_bounds(&b), RegionBox::new(IVec3::ZERO, UVec3::splat(5)));
    }

    #[test]
    fn intersection_of_disjoint_boxes_is_empty() {
        let a = RegionBox::new(IVec3::ZERO, UVec3::splat(2));
        let b = RegionBox::new(IVec3::splat(3), UVec3::splat(2));
        assert!(a.intersection(&b).is_empty());
        assert_eq!(a.intersection(&a), a);
    }
}
