//! Device-resident copy of the scene's triangle soup.

use crate::core::{Aabb, SceneGeometry, TRIANGLE_STRIDE};
use crate::error::Result;
use crate::gpu::{Backend, BufferDesc, BufferUsage, GpuContext, Owner, ResourceId};

const LOG_TARGET: &str = "voxel_gi::scene";

/// Triangles uploaded once and read by both voxelizers.
#[derive(Debug, Clone, Copy)]
pub struct GpuScene {
    triangles: ResourceId,
    triangle_count: u32,
    bounds: Option<Aabb>,
}

impl GpuScene {
    pub fn upload<B: Backend>(gpu: &mut GpuContext<B>, scene: &SceneGeometry) -> Result<Self> {
        scene.validate()?;
        let data = scene.gpu_triangle_data();
        let words: &[u32] = bytemuck::cast_slice(&data);
        let triangles = gpu.create_buffer(
            BufferDesc::words(
                "scene.triangles",
                words.len() as u64,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            ),
            Owner::SceneGeometry,
        )?;
        if !words.is_empty() {
            gpu.write_words(triangles, 0, words)?;
        }
        gpu.log().info(
            LOG_TARGET,
            format_args!(
                "uploaded {} triangles ({} vec4 slots)",
                scene.triangles.len(),
                scene.triangles.len() * TRIANGLE_STRIDE as usize
            ),
        );
        Ok(Self {
            triangles,
            triangle_count: scene.triangles.len() as u32,
            bounds: scene.bounds(),
        })
    }

    pub fn triangles(&self) -> ResourceId {
        self.triangles
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    /// Scene-space bounds; `None` for an empty scene.
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        gpu.release(self.triangles, Owner::SceneGeometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoxelGiConfig;
    use crate::logging::LogContext;
    use crate::reference_cpu::ReferenceBackend;
    use glam::Vec3;

    #[test]
    fn upload_keeps_triangle_layout_and_releases() {
        let mut gpu = GpuContext::new(ReferenceBackend::new(), &VoxelGiConfig::default(), LogContext::new("scene"));
        let geometry = SceneGeometry {
            triangles: vec![[Vec3::ZERO, Vec3::X, Vec3::Y]; 2],
            colors: None,
        };
        let scene = GpuScene::upload(&mut gpu, &geometry).unwrap();
        assert_eq!(scene.triangle_count(), 2);
        let words = gpu.backend().words(scene.triangles()).unwrap();
        assert_eq!(words.len(), 2 * 12);
        assert_eq!(f32::from_bits(words[4]), 1.0);

        scene.release(&mut gpu).unwrap();
        assert_eq!(gpu.arena().live_count(), 0);
    }
}
