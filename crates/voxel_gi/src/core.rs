use bytemuck::{Pod, Zeroable};
use glam::{UVec3, Vec3};

use crate::error::{Result, VoxelGiError};

/// Axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extent(center: Vec3, half: Vec3) -> Self {
        Self {
            min: center - half,
            max: center + half,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn translated(&self, offset: Vec3) -> Self {
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(VoxelGiError::InvalidConfig("aabb must be finite".into()));
        }
        if self.min.cmpgt(self.max).any() {
            return Err(VoxelGiError::InvalidConfig("aabb min exceeds max".into()));
        }
        Ok(())
    }
}

/// Anything that can report the camera's current world-space bounding region.
pub trait CameraSource {
    fn bounding_region(&self) -> Aabb;
}

impl CameraSource for Aabb {
    fn bounding_region(&self) -> Aabb {
        *self
    }
}

/// Triangle soup handed to the voxelizers.
///
/// `colors` carries one RGBA8 material color per triangle; when absent a
/// stable per-triangle color is derived from the triangle index.
#[derive(Debug, Clone, Default)]
pub struct SceneGeometry {
    pub triangles: Vec<[Vec3; 3]>,
    pub colors: Option<Vec<[u8; 4]>>,
}

impl SceneGeometry {
    pub fn validate(&self) -> Result<()> {
        if let Some(colors) = &self.colors {
            if colors.len() != self.triangles.len() {
                return Err(VoxelGiError::InvalidConfig(
                    "colors length must match triangles length".into(),
                ));
            }
        }
        for tri in &self.triangles {
            for v in tri.iter() {
                if !v.is_finite() {
                    return Err(VoxelGiError::InvalidConfig(
                        "triangle contains non-finite vertex".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Scene-space bounds; `None` for an empty scene.
    pub fn bounds(&self) -> Option<Aabb> {
        let mut iter = self.triangles.iter().flat_map(|tri| tri.iter().copied());
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Some(Aabb { min, max })
    }

    pub fn triangle_color(&self, index: usize) -> u32 {
        match &self.colors {
            Some(colors) => pack_rgba8(colors[index]),
            None => hash_color(index as u32),
        }
    }

    /// GPU layout: three `vec4<f32>` per triangle, the packed color bit-cast
    /// into the `w` lane of the first vertex.
    pub fn gpu_triangle_data(&self) -> Vec<[f32; 4]> {
        let mut data = Vec::with_capacity(self.triangles.len() * TRIANGLE_STRIDE as usize);
        for (index, tri) in self.triangles.iter().enumerate() {
            let color = f32::from_bits(self.triangle_color(index));
            data.push([tri[0].x, tri[0].y, tri[0].z, color]);
            data.push([tri[1].x, tri[1].y, tri[1].z, 0.0]);
            data.push([tri[2].x, tri[2].y, tri[2].z, 0.0]);
        }
        data
    }
}

/// `vec4` slots per triangle in the GPU triangle buffer.
pub const TRIANGLE_STRIDE: u32 = 3;

/// Decodes triangle `index` from the GPU triangle words.
pub fn gpu_triangle(words: &[u32], index: usize) -> ([Vec3; 3], u32) {
    let base = index * TRIANGLE_STRIDE as usize * 4;
    let v = |slot: usize| {
        let at = base + slot * 4;
        Vec3::new(
            f32::from_bits(words[at]),
            f32::from_bits(words[at + 1]),
            f32::from_bits(words[at + 2]),
        )
    };
    ([v(0), v(1), v(2)], words[base + 3])
}

/// A rasterized surface sample prior to octree or clipmap integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelFragment {
    pub position: UVec3,
    pub color: [u8; 4],
}

/// GPU form of [`VoxelFragment`]: 10 bits per axis, RGBA8 payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct GpuFragment {
    pub position: u32,
    pub color: u32,
}

pub const FRAGMENT_WORDS: u32 = 2;

impl VoxelFragment {
    pub fn pack(&self) -> GpuFragment {
        GpuFragment {
            position: pack_position(self.position),
            color: pack_rgba8(self.color),
        }
    }
}

impl GpuFragment {
    pub fn unpack(&self) -> VoxelFragment {
        VoxelFragment {
            position: unpack_position(self.position),
            color: unpack_rgba8(self.color),
        }
    }
}

pub fn pack_position(p: UVec3) -> u32 {
    (p.x & 0x3ff) | ((p.y & 0x3ff) << 10) | ((p.z & 0x3ff) << 20)
}

pub fn unpack_position(packed: u32) -> UVec3 {
    UVec3::new(packed & 0x3ff, (packed >> 10) & 0x3ff, (packed >> 20) & 0x3ff)
}

pub fn pack_rgba8(c: [u8; 4]) -> u32 {
    u32::from_le_bytes(c)
}

pub fn unpack_rgba8(packed: u32) -> [u8; 4] {
    packed.to_le_bytes()
}

/// Child slot (0..8) of `position` at the octree depth whose split bit is `bit`.
pub fn octant(position: UVec3, bit: u32) -> u32 {
    ((position.x >> bit) & 1) | (((position.y >> bit) & 1) << 1) | (((position.z >> bit) & 1) << 2)
}

pub fn hash_color(id: u32) -> u32 {
    let mut x = id.wrapping_mul(1664525).wrapping_add(1013904223);
    let r = (x & 0xff) as u8;
    x = x.wrapping_mul(1664525).wrapping_add(1013904223);
    let g = (x & 0xff) as u8;
    x = x.wrapping_mul(1664525).wrapping_add(1013904223);
    let b = (x & 0xff) as u8;
    u32::from_le_bytes([r, g, b, 255])
}

/// Separating-axis test between a triangle and an axis-aligned box.
pub fn triangle_box_overlap(box_center: Vec3, box_half: Vec3, v0: Vec3, v1: Vec3, v2: Vec3) -> bool {
    let v0 = v0 - box_center;
    let v1 = v1 - box_center;
    let v2 = v2 - box_center;

    if v0.x.min(v1.x.min(v2.x)) > box_half.x
        || v0.x.max(v1.x.max(v2.x)) < -box_half.x
        || v0.y.min(v1.y.min(v2.y)) > box_half.y
        || v0.y.max(v1.y.max(v2.y)) < -box_half.y
        || v0.z.min(v1.z.min(v2.z)) > box_half.z
        || v0.z.max(v1.z.max(v2.z)) < -box_half.z
    {
        return false;
    }

    let e0 = v1 - v0;
    let e1 = v2 - v1;
    let e2 = v0 - v2;

    let normal = e0.cross(e1);
    let r = box_half.x * normal.x.abs() + box_half.y * normal.y.abs() + box_half.z * normal.z.abs();
    if normal.dot(v0).abs() > r {
        return false;
    }

    let axes = [
        Vec3::new(0.0, -e0.z, e0.y),
        Vec3::new(0.0, -e1.z, e1.y),
        Vec3::new(0.0, -e2.z, e2.y),
        Vec3::new(e0.z, 0.0, -e0.x),
        Vec3::new(e1.z, 0.0, -e1.x),
        Vec3::new(e2.z, 0.0, -e2.x),
        Vec3::new(-e0.y, e0.x, 0.0),
        Vec3::new(-e1.y, e1.x, 0.0),
        Vec3::new(-e2.y, e2.x, 0.0),
    ];

    for axis in axes.iter() {
        let p0 = v0.dot(*axis);
        let p1 = v1.dot(*axis);
        let p2 = v2.dot(*axis);
        let min_p = p0.min(p1.min(p2));
        let max_p = p0.max(p1.max(p2));
        let r = box_half.x * axis.x.abs() + box_half.y * axis.y.abs() + box_half.z * axis.z.abs();
        if min_p > r || max_p < -r {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_pack_roundtrip_at_max_coordinate() {
        let fragment = VoxelFragment {
            position: UVec3::new(1023, 0, 517),
            color: [10, 20, 30, 255],
        };
        assert_eq!(fragment.pack().unpack(), fragment);
    }

    #[test]
    fn octant_selects_split_bits() {
        let p = UVec3::new(0b101, 0b010, 0b111);
        assert_eq!(octant(p, 0), 0b101);
        assert_eq!(octant(p, 1), 0b110);
        assert_eq!(octant(p, 2), 0b101);
    }

    #[test]
    fn overlap_detects_touching_and_distant_triangles() {
        let half = Vec3::splat(0.5);
        let center = Vec3::splat(0.5);
        let inside = [
            Vec3::new(0.1, 0.1, 0.5),
            Vec3::new(0.9, 0.1, 0.5),
            Vec3::new(0.1, 0.9, 0.5),
        ];
        assert!(triangle_box_overlap(center, half, inside[0], inside[1], inside[2]));

        let far = inside.map(|v| v + Vec3::new(5.0, 0.0, 0.0));
        assert!(!triangle_box_overlap(center, half, far[0], far[1], far[2]));
    }

    #[test]
    fn scene_bounds_cover_all_vertices() {
        let scene = SceneGeometry {
            triangles: vec![
                [Vec3::ZERO, Vec3::X, Vec3::Y],
                [Vec3::new(-2.0, 0.0, 0.0), Vec3::Z * 3.0, Vec3::Y],
            ],
            colors: None,
        };
        let bounds = scene.bounds().expect("bounds");
        assert_eq!(bounds.min, Vec3::new(-2.0, 0.0, 0.0));
        assert_eq!(bounds.max, Vec3::new(1.0, 1.0, 3.0));
        assert!(SceneGeometry::default().bounds().is_none());
    }

    #[test]
    fn scene_validation_rejects_mismatched_colors() {
        let scene = SceneGeometry {
            triangles: vec![[Vec3::ZERO, Vec3::X, Vec3::Y]],
            colors: Some(vec![]),
        };
        assert!(scene.validate().is_err());
    }

    #[test]
    fn gpu_triangle_roundtrips_color_bits() {
        let scene = SceneGeometry {
            triangles: vec![[Vec3::ZERO, Vec3::X, Vec3::Y]],
            colors: Some(vec![[1, 2, 3, 4]]),
        };
        let words: Vec<u32> = bytemuck::cast_slice(&scene.gpu_triangle_data()).to_vec();
        let (tri, color) = gpu_triangle(&words, 0);
        assert_eq!(tri[1], Vec3::X);
        assert_eq!(unpack_rgba8(color), [1, 2, 3, 4]);
    }
}
