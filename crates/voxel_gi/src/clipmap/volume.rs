//! The two stacked clip volumes (opacity and radiance).

use glam::{IVec3, UVec3};

use crate::config::{VoxelGiConfig, CLIP_REGION_COUNT};
use crate::core::unpack_rgba8;
use crate::error::{Result, VoxelGiError};
use crate::gpu::{Backend, BufferDesc, BufferUsage, GpuContext, Owner, ResourceId};

/// Word index of world voxel `v` of clip `level` in a stacked padded volume.
///
/// Voxels wrap toroidally inside the level and are offset by the border, so a
/// moving footprint never needs its retained contents copied.
pub fn texel_index(level: u32, v: IVec3, resolution: u32, border: u32) -> usize {
    let res = resolution as i32;
    let padded = (resolution + 2 * border) as usize;
    let wrap = |c: i32| c.rem_euclid(res) as usize + border as usize;
    level as usize * padded * padded * padded + wrap(v.x) + padded * (wrap(v.y) + padded * wrap(v.z))
}

/// Opacity and radiance volumes, `CLIP_REGION_COUNT` padded levels each,
/// stored as one RGBA8 word per texel.
#[derive(Debug)]
pub struct ClipmapVolume {
    opacity: ResourceId,
    radiance: ResourceId,
    resolution: u32,
    border: u32,
}

impl ClipmapVolume {
    pub fn allocate<B: Backend>(gpu: &mut GpuContext<B>, config: &VoxelGiConfig) -> Result<Self> {
        let padded = config.padded_resolution() as u64;
        let words = CLIP_REGION_COUNT as u64 * padded * padded * padded;
        let usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let opacity = gpu.create_buffer(BufferDesc::words("clipmap.opacity", words, usage), Owner::ClipmapVoxelizer)?;
        let radiance = match gpu.create_buffer(
            BufferDesc::words("clipmap.radiance", words, usage),
            Owner::ClipmapVoxelizer,
        ) {
            Ok(radiance) => radiance,
            Err(err) => {
                gpu.release(opacity, Owner::ClipmapVoxelizer)?;
                return Err(err);
            }
        };
        Ok(Self {
            opacity,
            radiance,
            resolution: config.clipmap_resolution,
            border: config.voxel_border,
        })
    }

    pub fn opacity(&self) -> ResourceId {
        self.opacity
    }

    pub fn radiance(&self) -> ResourceId {
        self.radiance
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn border(&self) -> u32 {
        self.border
    }

    pub fn padded_resolution(&self) -> u32 {
        self.resolution + 2 * self.border
    }

    pub fn texels_per_level(&self) -> usize {
        (self.padded_resolution() as usize).pow(3)
    }

    /// Host copy of one level of both volumes.
    pub fn read_level<B: Backend>(&self, gpu: &mut GpuContext<B>, level: usize) -> Result<ClipLevelImage> {
        if level >= CLIP_REGION_COUNT {
            return Err(VoxelGiError::InvalidConfig(format!(
                "clip level {level} out of range (levels: {CLIP_REGION_COUNT})"
            )));
        }
        let texels = self.texels_per_level();
        let span = level * texels..(level + 1) * texels;
        let opacity = gpu.read_back(self.opacity)?;
        let radiance = gpu.read_back(self.radiance)?;
        let slice = |words: &[u32]| -> Result<Vec<u32>> {
            words
                .get(span.clone())
                .map(<[u32]>::to_vec)
                .ok_or_else(|| VoxelGiError::Device(format!("clip volume readback shorter than level {level}")))
        };
        Ok(ClipLevelImage {
            level: level as u32,
            resolution: self.resolution,
            border: self.border,
            opacity: slice(&opacity)?,
            radiance: slice(&radiance)?,
        })
    }

    pub fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        gpu.release(self.opacity, Owner::ClipmapVoxelizer)?;
        gpu.release(self.radiance, Owner::ClipmapVoxelizer)
    }
}

/// One padded clip level read back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipLevelImage {
    pub level: u32,
    pub resolution: u32,
    pub border: u32,
    pub opacity: Vec<u32>,
    pub radiance: Vec<u32>,
}

impl ClipLevelImage {
    fn local(&self, v: IVec3) -> usize {
        texel_index(0, v, self.resolution, self.border)
    }

    /// RGBA8 opacity at world voxel `v`.
    pub fn opacity_at(&self, v: IVec3) -> [u8; 4] {
        unpack_rgba8(self.opacity.get(self.local(v)).copied().unwrap_or(0))
    }

    /// RGBA8 radiance at world voxel `v`.
    pub fn radiance_at(&self, v: IVec3) -> [u8; 4] {
        unpack_rgba8(self.radiance.get(self.local(v)).copied().unwrap_or(0))
    }

    /// Raw words at padded coordinate `p`, border included.
    pub fn padded_texel(&self, p: UVec3) -> (u32, u32) {
        let padded = (self.resolution + 2 * self.border) as usize;
        let i = p.x as usize + padded * (p.y as usize + padded * p.z as usize);
        (
            self.opacity.get(i).copied().unwrap_or(0),
            self.radiance.get(i).copied().unwrap_or(0),
        )
    }

    /// Number of interior texels with non-zero opacity.
    pub fn occupied(&self) -> usize {
        let (b, end) = (self.border, self.border + self.resolution);
        let padded = self.resolution + 2 * self.border;
        (0..padded.pow(3))
            .filter(|&i| {
                let p = UVec3::new(i % padded, (i / padded) % padded, i / (padded * padded));
                p.cmpge(UVec3::splat(b)).all() && p.cmplt(UVec3::splat(end)).all()
            })
            .filter(|&i| self.opacity.get(i as usize).is_some_and(|&w| w != 0))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_index_wraps_and_offsets_by_border() {
        let padded = 6usize;
        assert_eq!(texel_index(0, IVec3::ZERO, 4, 1), 1 + padded * (1 + padded));
        assert_eq!(texel_index(0, IVec3::new(4, 0, 0), 4, 1), texel_index(0, IVec3::ZERO, 4, 1));
        assert_eq!(texel_index(0, IVec3::new(-1, 0, 0), 4, 1), texel_index(0, IVec3::new(3, 0, 0), 4, 1));
        assert_eq!(
            texel_index(2, IVec3::ZERO, 4, 1) - texel_index(0, IVec3::ZERO, 4, 1),
            2 * padded * padded * padded
        );
    }
}
