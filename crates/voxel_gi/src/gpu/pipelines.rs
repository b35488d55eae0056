use std::collections::HashMap;

use super::shaders;
use crate::config::WORKGROUP_SIZE;
use crate::error::{Result, VoxelGiError};

/// Every compute kernel the pipeline records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    VoxelizeFragments,
    VoxelizeClipmap,
    ClearRegion,
    BorderWrap,
    DownSample,
    CopyAlpha,
    OctreeInit,
    OctreeFlag,
    OctreeAlloc,
    OctreeModifyArgs,
    OctreeLeafAlloc,
    OctreeLeafWrite,
    OctreeMipmap,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 13] = [
        PipelineKind::VoxelizeFragments,
        PipelineKind::VoxelizeClipmap,
        PipelineKind::ClearRegion,
        PipelineKind::BorderWrap,
        PipelineKind::DownSample,
        PipelineKind::CopyAlpha,
        PipelineKind::OctreeInit,
        PipelineKind::OctreeFlag,
        PipelineKind::OctreeAlloc,
        PipelineKind::OctreeModifyArgs,
        PipelineKind::OctreeLeafAlloc,
        PipelineKind::OctreeLeafWrite,
        PipelineKind::OctreeMipmap,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PipelineKind::VoxelizeFragments => "voxelize_fragments",
            PipelineKind::VoxelizeClipmap => "voxelize_clipmap",
            PipelineKind::ClearRegion => "clear_region",
            PipelineKind::BorderWrap => "border_wrap",
            PipelineKind::DownSample => "down_sample",
            PipelineKind::CopyAlpha => "copy_alpha",
            PipelineKind::OctreeInit => "octree_init",
            PipelineKind::OctreeFlag => "octree_flag",
            PipelineKind::OctreeAlloc => "octree_alloc",
            PipelineKind::OctreeModifyArgs => "octree_modify_args",
            PipelineKind::OctreeLeafAlloc => "octree_leaf_alloc",
            PipelineKind::OctreeLeafWrite => "octree_leaf_write",
            PipelineKind::OctreeMipmap => "octree_mipmap",
        }
    }

    /// `read_only` flag of each storage binding, in slot order. The params
    /// uniform occupies the slot after the last storage binding.
    pub fn storage_bindings(self) -> &'static [bool] {
        match self {
            PipelineKind::VoxelizeFragments => &[true, false, false],
            PipelineKind::VoxelizeClipmap => &[true, false, false],
            PipelineKind::ClearRegion => &[false, false],
            PipelineKind::BorderWrap => &[false, false],
            PipelineKind::DownSample => &[false],
            PipelineKind::CopyAlpha => &[true, false],
            PipelineKind::OctreeInit => &[false, false, false, false, false, true],
            PipelineKind::OctreeFlag => &[true, true, false],
            PipelineKind::OctreeAlloc => &[false, false, false],
            PipelineKind::OctreeModifyArgs => &[true, false, false],
            PipelineKind::OctreeLeafAlloc => &[false, false, false, false],
            PipelineKind::OctreeLeafWrite => &[true, true, true, false],
            PipelineKind::OctreeMipmap => &[false, false, false, false],
        }
    }

    pub fn shader_source(self) -> &'static str {
        match self {
            PipelineKind::VoxelizeFragments => shaders::VOXELIZE_FRAGMENTS_WGSL,
            PipelineKind::VoxelizeClipmap => shaders::VOXELIZE_CLIPMAP_WGSL,
            PipelineKind::ClearRegion => shaders::CLEAR_REGION_WGSL,
            PipelineKind::BorderWrap => shaders::BORDER_WRAP_WGSL,
            PipelineKind::DownSample => shaders::DOWN_SAMPLE_WGSL,
            PipelineKind::CopyAlpha => shaders::COPY_ALPHA_WGSL,
            PipelineKind::OctreeInit => shaders::OCTREE_INIT_WGSL,
            PipelineKind::OctreeFlag => shaders::OCTREE_FLAG_WGSL,
            PipelineKind::OctreeAlloc => shaders::OCTREE_ALLOC_WGSL,
            PipelineKind::OctreeModifyArgs => shaders::OCTREE_MODIFY_ARGS_WGSL,
            PipelineKind::OctreeLeafAlloc => shaders::OCTREE_LEAF_ALLOC_WGSL,
            PipelineKind::OctreeLeafWrite => shaders::OCTREE_LEAF_WRITE_WGSL,
            PipelineKind::OctreeMipmap => shaders::OCTREE_MIPMAP_WGSL,
        }
    }
}

pub struct CompiledPipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

fn layout_entries(kind: PipelineKind) -> Vec<wgpu::BindGroupLayoutEntry> {
    let storage = kind.storage_bindings();
    let mut entries: Vec<wgpu::BindGroupLayoutEntry> = storage
        .iter()
        .enumerate()
        .map(|(slot, &read_only)| wgpu::BindGroupLayoutEntry {
            binding: slot as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();
    entries.push(wgpu::BindGroupLayoutEntry {
        binding: storage.len() as u32,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    });
    entries
}

pub async fn create_pipelines(device: &wgpu::Device) -> Result<HashMap<PipelineKind, CompiledPipeline>> {
    let mut constants = HashMap::new();
    constants.insert("WORKGROUP_SIZE".to_string(), WORKGROUP_SIZE as f64);

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let mut compiled = HashMap::with_capacity(PipelineKind::ALL.len());
    for kind in PipelineKind::ALL {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kind.label()),
            source: wgpu::ShaderSource::Wgsl(kind.shader_source().into()),
        });
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kind.label()),
            entries: &layout_entries(kind),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kind.label()),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kind.label()),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        });
        compiled.insert(
            kind,
            CompiledPipeline {
                pipeline,
                bind_group_layout,
            },
        );
    }
    if let Some(err) = device.pop_error_scope().await {
        return Err(VoxelGiError::Allocation {
            label: "compute pipelines".into(),
            reason: err.to_string(),
        });
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kernel_declares_params_binding_after_storage() {
        for kind in PipelineKind::ALL {
            let binding = kind.storage_bindings().len();
            let needle = format!("@binding({binding}) var<uniform> params");
            assert!(
                kind.shader_source().contains(&needle),
                "{} is missing `{needle}`",
                kind.label()
            );
        }
    }

    #[test]
    fn read_only_bindings_match_shader_declarations() {
        for kind in PipelineKind::ALL {
            for (slot, read_only) in kind.storage_bindings().iter().enumerate() {
                let access = if *read_only { "read" } else { "read_write" };
                let needle = format!("@binding({slot}) var<storage, {access}>");
                assert!(
                    kind.shader_source().contains(&needle),
                    "{} slot {slot} should be declared `{access}`",
                    kind.label()
                );
            }
        }
    }

    #[test]
    fn labels_are_unique() {
        let mut labels: Vec<&str> = PipelineKind::ALL.iter().map(|kind| kind.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), PipelineKind::ALL.len());
    }
}
