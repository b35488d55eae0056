//! CPU interpreter for recorded command buffers.
//!
//! Kernels mirror the WGSL shaders invocation by invocation, so every GPU pass
//! can be exercised and inspected without a device.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{Result, VoxelGiError};
use crate::gpu::{Backend, BufferDesc, BufferUsage, Command, CommandBuffer, Dispatch, ResourceId, Workgroups};

mod kernels;

#[derive(Debug, Default)]
pub struct ReferenceBackend {
    buffers: HashMap<ResourceId, Vec<u32>>,
    usages: HashMap<ResourceId, BufferUsage>,
    completed: u64,
    stalled: bool,
    dispatches: u64,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, submissions still execute but their fences never signal and
    /// staging maps never complete.
    pub fn stall_fences(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    /// Direct view of a buffer's contents.
    pub fn words(&self, id: ResourceId) -> Option<&[u32]> {
        self.buffers.get(&id).map(Vec::as_slice)
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    fn indirect_workgroups(&self, buffer: ResourceId, offset: u64) -> Result<[u32; 3]> {
        let words = self.buffers.get(&buffer).ok_or(VoxelGiError::UnknownResource(buffer))?;
        let at = (offset / 4) as usize;
        match words.get(at..at + 3) {
            Some(args) => Ok([args[0], args[1], args[2]]),
            None => Err(VoxelGiError::Device(format!(
                "indirect arguments at byte {offset} past buffer end"
            ))),
        }
    }

    fn run_dispatch(&mut self, dispatch: &Dispatch) -> Result<()> {
        let workgroups = match dispatch.workgroups {
            Workgroups::Direct(groups) => groups,
            Workgroups::Indirect { buffer, offset } => self.indirect_workgroups(buffer, offset)?,
        };

        let mut seen = HashSet::new();
        for binding in &dispatch.bindings {
            if !self.buffers.contains_key(&binding.resource) {
                return Err(VoxelGiError::UnknownResource(binding.resource));
            }
            if !seen.insert(binding.resource) {
                return Err(VoxelGiError::Device(format!(
                    "'{}' binds {} twice",
                    dispatch.label, binding.resource
                )));
            }
        }
        let mut bound: Vec<Vec<u32>> = dispatch
            .bindings
            .iter()
            .filter_map(|binding| self.buffers.remove(&binding.resource))
            .collect();

        let result = kernels::run(dispatch.pipeline, &dispatch.params, &mut bound, workgroups);

        for (binding, words) in dispatch.bindings.iter().zip(bound) {
            self.buffers.insert(binding.resource, words);
        }
        self.dispatches += 1;
        result
    }

    fn buffer_mut(&mut self, id: ResourceId) -> Result<&mut Vec<u32>> {
        self.buffers.get_mut(&id).ok_or(VoxelGiError::UnknownResource(id))
    }
}

impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference-cpu"
    }

    fn create_buffer(&mut self, id: ResourceId, desc: &BufferDesc) -> Result<()> {
        self.buffers.insert(id, vec![0; desc.word_count()]);
        self.usages.insert(id, desc.usage);
        Ok(())
    }

    fn destroy_buffer(&mut self, id: ResourceId) {
        self.buffers.remove(&id);
        self.usages.remove(&id);
    }

    fn write_buffer(&mut self, id: ResourceId, offset: u64, words: &[u32]) -> Result<()> {
        let buffer = self.buffer_mut(id)?;
        let start = offset as usize;
        match buffer.get_mut(start..start + words.len()) {
            Some(dst) => {
                dst.copy_from_slice(words);
                Ok(())
            }
            None => Err(VoxelGiError::Device(format!("write past end of {id}"))),
        }
    }

    fn submit(&mut self, cmd: &CommandBuffer, submission: u64) -> Result<()> {
        for command in cmd.commands() {
            match command {
                Command::Dispatch(dispatch) => self.run_dispatch(dispatch)?,
                Command::ClearBuffer { dst } => self.buffer_mut(*dst)?.fill(0),
                Command::CopyBuffer { src, dst, size } => {
                    let words = (*size / 4) as usize;
                    let data: Vec<u32> = self
                        .buffers
                        .get(src)
                        .ok_or(VoxelGiError::UnknownResource(*src))?
                        .iter()
                        .take(words)
                        .copied()
                        .collect();
                    let target = self.buffer_mut(*dst)?;
                    let len = data.len().min(target.len());
                    target[..len].copy_from_slice(&data[..len]);
                }
                Command::Barrier(_) => {}
            }
        }
        if !self.stalled {
            self.completed = self.completed.max(submission);
        }
        Ok(())
    }

    fn wait(&mut self, submission: u64, _timeout: Duration) -> Result<bool> {
        Ok(!self.stalled && self.completed >= submission)
    }

    fn read_mapped(&mut self, id: ResourceId, _timeout: Duration) -> Result<Option<Vec<u32>>> {
        let usage = self.usages.get(&id).ok_or(VoxelGiError::UnknownResource(id))?;
        if !usage.contains(BufferUsage::MAP_READ) {
            return Err(VoxelGiError::Device(format!("{id} is not mappable")));
        }
        if self.stalled {
            return Ok(None);
        }
        Ok(self.buffers.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoxelGiConfig;
    use crate::error::VoxelGiError;
    use crate::gpu::{GpuContext, Owner};
    use crate::logging::LogContext;

    fn context() -> GpuContext<ReferenceBackend> {
        GpuContext::new(ReferenceBackend::new(), &VoxelGiConfig::default(), LogContext::new("test"))
    }

    #[test]
    fn read_back_returns_written_words() {
        let mut gpu = context();
        let id = gpu
            .create_buffer(
                BufferDesc::words("data", 4, BufferUsage::STORAGE | BufferUsage::COPY_SRC),
                Owner::SparseVoxelizer,
            )
            .unwrap();
        gpu.write_words(id, 1, &[7, 8]).unwrap();
        assert_eq!(gpu.read_back(id).unwrap(), vec![0, 7, 8, 0]);
        assert_eq!(gpu.arena().owned_by(Owner::Readback), Vec::new());
    }

    #[test]
    fn stalled_fence_times_out_instead_of_returning_zero() {
        let mut gpu = context();
        let id = gpu
            .create_buffer(
                BufferDesc::words("data", 1, BufferUsage::STORAGE | BufferUsage::COPY_SRC),
                Owner::SparseVoxelizer,
            )
            .unwrap();
        gpu.backend_mut().stall_fences(true);
        assert!(matches!(gpu.read_back(id), Err(VoxelGiError::SyncTimeout { .. })));
        gpu.backend_mut().stall_fences(false);
        assert!(gpu.read_back(id).is_ok());
    }

    #[test]
    fn map_requires_map_read_usage() {
        let mut backend = ReferenceBackend::new();
        let mut arena = crate::gpu::ResourceArena::new();
        let desc = BufferDesc::words("data", 1, BufferUsage::STORAGE);
        let id = arena.insert(desc.clone(), Owner::OctreeBuilder);
        backend.create_buffer(id, &desc).unwrap();
        assert!(backend.read_mapped(id, Duration::from_millis(1)).is_err());
    }
}
