use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wgpu::util::DeviceExt;

use super::buffers::map_buffer_words;
use super::commands::{Command, CommandBuffer, Dispatch, Workgroups};
use super::pipelines::{create_pipelines, CompiledPipeline, PipelineKind};
use super::resources::{BufferDesc, BufferUsage, ResourceId};
use super::Backend;
use crate::error::{Result, VoxelGiError};

/// Executes command buffers on a wgpu device.
///
/// wgpu tracks buffer usage between compute passes itself, so recorded
/// barriers only feed the dependency validator. Queue ownership transfers
/// are likewise bookkeeping: wgpu exposes a single queue.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: HashMap<PipelineKind, CompiledPipeline>,
    buffers: HashMap<ResourceId, wgpu::Buffer>,
    completed: Arc<AtomicU64>,
    device_error: Arc<Mutex<Option<String>>>,
    max_buffer_size: u64,
    max_storage_buffer_binding_size: u64,
}

fn to_wgpu_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::empty();
    let pairs = [
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::INDIRECT, wgpu::BufferUsages::INDIRECT),
        (BufferUsage::COPY_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::COPY_DST, wgpu::BufferUsages::COPY_DST),
        (BufferUsage::MAP_READ, wgpu::BufferUsages::MAP_READ),
    ];
    for (ours, theirs) in pairs {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

impl WgpuBackend {
    /// Requests the default adapter and device and compiles every kernel.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .ok_or_else(|| VoxelGiError::Device("no GPU adapter available".into()))?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default(), None)
            .await
            .map_err(|e| VoxelGiError::Device(format!("failed to request device: {e}")))?;
        Self::from_device(device, queue).await
    }

    /// Wraps an existing device, e.g. the renderer's.
    pub async fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Result<Self> {
        let pipelines = create_pipelines(&device).await?;
        let device_error = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&device_error);
        device.on_uncaptured_error(Box::new(move |err| {
            if let Ok(mut slot) = slot.lock() {
                slot.get_or_insert_with(|| err.to_string());
            }
        }));
        let limits = device.limits();
        Ok(Self {
            max_buffer_size: limits.max_buffer_size,
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size as u64,
            device,
            queue,
            pipelines,
            buffers: HashMap::new(),
            completed: Arc::new(AtomicU64::new(0)),
            device_error,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The wgpu buffer behind `id`, for consumers binding it in their own passes.
    pub fn buffer(&self, id: ResourceId) -> Result<&wgpu::Buffer> {
        self.buffers.get(&id).ok_or(VoxelGiError::UnknownResource(id))
    }

    fn take_device_error(&self) -> Result<()> {
        let message = match self.device_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => Some("device error handler poisoned".to_string()),
        };
        match message {
            Some(message) => Err(VoxelGiError::Device(message)),
            None => Ok(()),
        }
    }

    fn encode_dispatch(&self, encoder: &mut wgpu::CommandEncoder, dispatch: &Dispatch) -> Result<()> {
        let compiled = self
            .pipelines
            .get(&dispatch.pipeline)
            .ok_or_else(|| VoxelGiError::Device(format!("pipeline {} missing", dispatch.pipeline.label())))?;
        let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&dispatch.label),
            contents: &dispatch.params,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries = Vec::with_capacity(dispatch.bindings.len() + 1);
        for (slot, binding) in dispatch.bindings.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32,
                resource: self.buffer(binding.resource)?.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: dispatch.bindings.len() as u32,
            resource: params.as_entire_binding(),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&dispatch.label),
            layout: &compiled.bind_group_layout,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(&dispatch.label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&compiled.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        match dispatch.workgroups {
            Workgroups::Direct([x, y, z]) => pass.dispatch_workgroups(x, y, z),
            Workgroups::Indirect { buffer, offset } => {
                pass.dispatch_workgroups_indirect(self.buffer(buffer)?, offset)
            }
        }
        Ok(())
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(&mut self, id: ResourceId, desc: &BufferDesc) -> Result<()> {
        if desc.size > self.max_buffer_size {
            return Err(VoxelGiError::Allocation {
                label: desc.label.clone(),
                reason: format!("{} bytes exceeds max buffer size {}", desc.size, self.max_buffer_size),
            });
        }
        if desc.usage.contains(BufferUsage::STORAGE) && desc.size > self.max_storage_buffer_binding_size {
            return Err(VoxelGiError::Allocation {
                label: desc.label.clone(),
                reason: format!(
                    "{} bytes exceeds max storage binding size {}",
                    desc.size, self.max_storage_buffer_binding_size
                ),
            });
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: desc.size,
            usage: to_wgpu_usage(desc.usage),
            mapped_at_creation: false,
        });
        self.take_device_error().map_err(|err| VoxelGiError::Allocation {
            label: desc.label.clone(),
            reason: err.to_string(),
        })?;
        self.buffers.insert(id, buffer);
        Ok(())
    }

    fn destroy_buffer(&mut self, id: ResourceId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            buffer.destroy();
        }
    }

    fn write_buffer(&mut self, id: ResourceId, offset: u64, words: &[u32]) -> Result<()> {
        self.queue
            .write_buffer(self.buffer(id)?, offset * 4, bytemuck::cast_slice(words));
        Ok(())
    }

    fn submit(&mut self, cmd: &CommandBuffer, submission: u64) -> Result<()> {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(cmd.label()),
        });
        for command in cmd.commands() {
            match command {
                Command::Dispatch(dispatch) => self.encode_dispatch(&mut encoder, dispatch)?,
                Command::ClearBuffer { dst } => encoder.clear_buffer(self.buffer(*dst)?, 0, None),
                Command::CopyBuffer { src, dst, size } => {
                    encoder.copy_buffer_to_buffer(self.buffer(*src)?, 0, self.buffer(*dst)?, 0, *size)
                }
                Command::Barrier(_) => {}
            }
        }
        self.queue.submit(Some(encoder.finish()));
        let completed = Arc::clone(&self.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(submission, Ordering::SeqCst);
        });
        self.take_device_error()
    }

    fn wait(&mut self, submission: u64, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        loop {
            self.device.poll(wgpu::Maintain::Poll);
            if self.completed.load(Ordering::SeqCst) >= submission {
                return self.take_device_error().map(|()| true);
            }
            if started.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::yield_now();
        }
    }

    fn read_mapped(&mut self, id: ResourceId, timeout: Duration) -> Result<Option<Vec<u32>>> {
        map_buffer_words(self.buffer(id)?, &self.device, timeout)
    }
}
