//! Command-submission substrate shared by every voxel pass.
//!
//! Components allocate buffers through [`GpuContext`], record one-shot
//! [`CommandBuffer`]s and submit them to a [`Backend`]: the wgpu device for
//! real work, or the CPU reference interpreter in tests.

use std::time::Duration;

use crate::config::{VoxelGiConfig, WORKGROUP_SIZE};
use crate::error::{Result, VoxelGiError};
use crate::logging::LogContext;

mod buffers;
mod commands;
pub mod params;
mod pipelines;
mod resources;
mod shaders;
mod validate;
mod wgpu_backend;

pub use commands::{
    Access, Barrier, Binding, Command, CommandBuffer, Dispatch, LevelMask, QueueTransfer, Workgroups,
};
pub use pipelines::PipelineKind;
pub use resources::{
    BufferDesc, BufferUsage, CounterRole, Owner, QueueKind, ResourceArena, ResourceId, ResourceRecord,
};
pub use validate::validate;
pub use wgpu_backend::WgpuBackend;

const LOG_TARGET: &str = "voxel_gi::gpu";

/// Largest workgroup count per dispatch dimension.
pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;

/// Workgroup counts covering `invocations` one-dimensional invocations.
pub fn linear_workgroups(invocations: u32) -> [u32; 3] {
    let groups = invocations.div_ceil(WORKGROUP_SIZE);
    if groups <= MAX_WORKGROUPS_PER_DIMENSION {
        [groups, 1, 1]
    } else {
        [
            MAX_WORKGROUPS_PER_DIMENSION,
            groups.div_ceil(MAX_WORKGROUPS_PER_DIMENSION),
            1,
        ]
    }
}

/// Execution target for recorded command buffers.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn create_buffer(&mut self, id: ResourceId, desc: &BufferDesc) -> Result<()>;

    fn destroy_buffer(&mut self, id: ResourceId);

    /// Writes `words` starting at word `offset`.
    fn write_buffer(&mut self, id: ResourceId, offset: u64, words: &[u32]) -> Result<()>;

    /// Queues `cmd` for execution as submission number `submission`.
    fn submit(&mut self, cmd: &CommandBuffer, submission: u64) -> Result<()>;

    /// Blocks until `submission` completes; `Ok(false)` once `timeout` expires.
    fn wait(&mut self, submission: u64, timeout: Duration) -> Result<bool>;

    /// Maps a `MAP_READ` buffer; `Ok(None)` once `timeout` expires.
    fn read_mapped(&mut self, id: ResourceId, timeout: Duration) -> Result<Option<Vec<u32>>>;
}

/// Completion handle for one submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fence {
    submission: u64,
}

impl Fence {
    pub fn submission(&self) -> u64 {
        self.submission
    }
}

pub struct GpuContext<B: Backend> {
    backend: B,
    arena: ResourceArena,
    fence_timeout: Duration,
    validate_dependencies: bool,
    next_submission: u64,
    log: LogContext,
}

impl<B: Backend> GpuContext<B> {
    pub fn new(backend: B, config: &VoxelGiConfig, log: LogContext) -> Self {
        log.info(
            LOG_TARGET,
            format_args!(
                "gpu context on {} backend (validation {})",
                backend.name(),
                if config.validate_dependencies { "on" } else { "off" }
            ),
        );
        Self {
            backend,
            arena: ResourceArena::new(),
            fence_timeout: config.fence_timeout,
            validate_dependencies: config.validate_dependencies,
            next_submission: 1,
            log,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn arena(&self) -> &ResourceArena {
        &self.arena
    }

    pub fn log(&self) -> &LogContext {
        &self.log
    }

    pub fn fence_timeout(&self) -> Duration {
        self.fence_timeout
    }

    pub fn set_validate_dependencies(&mut self, enabled: bool) {
        self.validate_dependencies = enabled;
    }

    pub fn queue_of(&self, id: ResourceId) -> Result<QueueKind> {
        self.arena.queue_of(id)
    }

    pub fn create_buffer(&mut self, desc: BufferDesc, owner: Owner) -> Result<ResourceId> {
        if desc.usage.contains(BufferUsage::MAP_READ)
            && (desc.usage.bits() & !(BufferUsage::MAP_READ | BufferUsage::COPY_DST).bits()) != 0
        {
            return Err(VoxelGiError::Allocation {
                label: desc.label,
                reason: "MAP_READ buffers may only be copy destinations".into(),
            });
        }
        if desc.size % 4 != 0 {
            return Err(VoxelGiError::Allocation {
                label: desc.label,
                reason: format!("size {} is not word aligned", desc.size),
            });
        }
        let label = desc.label.clone();
        let id = self.arena.insert(desc, owner);
        let created = match self.arena.get(id) {
            Ok(record) => self.backend.create_buffer(id, &record.desc),
            Err(err) => Err(err),
        };
        if let Err(err) = created {
            self.arena.remove(id, owner)?;
            self.log.error(LOG_TARGET, format_args!("allocating '{label}' failed: {err}"));
            return Err(err);
        }
        self.log.debug(LOG_TARGET, format_args!("allocated '{label}' as {id} for {owner}"));
        Ok(id)
    }

    /// Releases `id`; only the owning component may do so.
    pub fn release(&mut self, id: ResourceId, caller: Owner) -> Result<()> {
        let record = self.arena.remove(id, caller)?;
        self.backend.destroy_buffer(id);
        self.log.debug(LOG_TARGET, format_args!("released '{}' ({id})", record.desc.label));
        Ok(())
    }

    pub fn write_words(&mut self, id: ResourceId, offset: u64, words: &[u32]) -> Result<()> {
        let record = self.arena.get(id)?;
        if offset + words.len() as u64 > record.desc.size / 4 {
            return Err(VoxelGiError::CapacityOverrun {
                resource: "buffer upload",
                requested: offset + words.len() as u64,
                capacity: record.desc.size / 4,
            });
        }
        self.backend.write_buffer(id, offset, words)
    }

    pub fn begin(&self, label: impl Into<String>) -> CommandBuffer {
        CommandBuffer::new(label, QueueKind::Compute)
    }

    pub fn submit(&mut self, cmd: CommandBuffer) -> Result<Fence> {
        let transfers = if self.validate_dependencies {
            validate(&cmd, &self.arena).map_err(|err| {
                self.log
                    .error(LOG_TARGET, format_args!("rejected '{}': {err}", cmd.label()));
                err
            })?
        } else {
            ownership_transfers(&cmd)
        };
        let submission = self.next_submission;
        self.next_submission += 1;
        self.backend.submit(&cmd, submission)?;
        for (resource, queue) in transfers {
            self.arena.set_queue(resource, queue)?;
        }
        self.log.debug(
            LOG_TARGET,
            format_args!(
                "submitted '{}' as #{submission} ({} commands)",
                cmd.label(),
                cmd.commands().len()
            ),
        );
        Ok(Fence { submission })
    }

    /// Waits for `fence` within the configured timeout.
    pub fn wait(&mut self, fence: Fence) -> Result<()> {
        if self.backend.wait(fence.submission, self.fence_timeout)? {
            return Ok(());
        }
        self.log.error(
            LOG_TARGET,
            format_args!(
                "submission #{} did not complete within {:?}",
                fence.submission, self.fence_timeout
            ),
        );
        Err(VoxelGiError::SyncTimeout {
            submission: fence.submission,
            timeout_ms: self.fence_timeout.as_millis(),
        })
    }

    pub fn submit_and_wait(&mut self, cmd: CommandBuffer) -> Result<()> {
        let fence = self.submit(cmd)?;
        self.wait(fence)
    }

    /// Maps a host-visible staging buffer after its copy has completed.
    pub fn map_staging(&mut self, staging: ResourceId) -> Result<Vec<u32>> {
        match self.backend.read_mapped(staging, self.fence_timeout)? {
            Some(words) => Ok(words),
            None => Err(VoxelGiError::SyncTimeout {
                submission: self.next_submission - 1,
                timeout_ms: self.fence_timeout.as_millis(),
            }),
        }
    }

    /// Copies the whole of `id` into a temporary staging buffer and returns it.
    ///
    /// The copy runs on whichever queue currently owns `id`.
    pub fn read_back(&mut self, id: ResourceId) -> Result<Vec<u32>> {
        let record = self.arena.get(id)?;
        let size = record.desc.size;
        let queue = record.queue;
        let label = format!("{}.readback", record.desc.label);
        let staging = self.create_buffer(
            BufferDesc {
                label: label.clone(),
                size,
                usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
            },
            Owner::Readback,
        )?;
        self.arena.set_queue(staging, queue)?;
        let mut cmd = CommandBuffer::new(label, queue);
        cmd.copy_buffer(id, staging, size);
        let result = self
            .submit_and_wait(cmd)
            .and_then(|()| self.map_staging(staging));
        self.release(staging, Owner::Readback)?;
        result
    }
}

fn ownership_transfers(cmd: &CommandBuffer) -> Vec<(ResourceId, QueueKind)> {
    cmd.commands()
        .iter()
        .filter_map(|command| match command {
            Command::Barrier(Barrier {
                resource,
                transfer: Some(transfer),
                ..
            }) => Some((*resource, transfer.to)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_workgroups_spill_into_y() {
        assert_eq!(linear_workgroups(0), [0, 1, 1]);
        assert_eq!(linear_workgroups(1), [1, 1, 1]);
        assert_eq!(linear_workgroups(64 * 10), [10, 1, 1]);
        let [x, y, _] = linear_workgroups(u32::MAX);
        assert_eq!(x, MAX_WORKGROUPS_PER_DIMENSION);
        assert!(x as u64 * y as u64 * WORKGROUP_SIZE as u64 >= u32::MAX as u64);
    }
}
