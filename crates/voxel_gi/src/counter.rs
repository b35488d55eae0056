//! GPU atomic counter with a host-readable staging mirror.

use crate::error::{Result, VoxelGiError};
use crate::gpu::{Backend, BufferDesc, BufferUsage, CounterRole, GpuContext, Owner, ResourceId};
use crate::logging::LogContext;

const LOG_TARGET: &str = "voxel_gi::counter";

/// One `u32` atomic on the device plus a mappable copy of it.
///
/// The mirror is only meaningful right after [`Counter::read`]; any GPU work
/// that may touch the counter must be followed by [`Counter::invalidate`].
#[derive(Debug)]
pub struct Counter {
    role: CounterRole,
    device: ResourceId,
    staging: ResourceId,
    staging_mirror: Option<u32>,
    log: LogContext,
}

impl Counter {
    pub fn initialize<B: Backend>(gpu: &mut GpuContext<B>, role: CounterRole) -> Result<Self> {
        let owner = Owner::Counter(role);
        let device = gpu.create_buffer(
            BufferDesc::words(
                format!("{role:?}.counter"),
                1,
                BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            ),
            owner,
        )?;
        let staging = match gpu.create_buffer(
            BufferDesc::words(
                format!("{role:?}.counter.staging"),
                1,
                BufferUsage::MAP_READ | BufferUsage::COPY_DST,
            ),
            owner,
        ) {
            Ok(staging) => staging,
            Err(err) => {
                gpu.release(device, owner)?;
                return Err(err);
            }
        };
        Ok(Self {
            role,
            device,
            staging,
            staging_mirror: None,
            log: gpu.log().clone(),
        })
    }

    pub fn role(&self) -> CounterRole {
        self.role
    }

    /// Device buffer bound as the atomic target.
    pub fn buffer(&self) -> ResourceId {
        self.device
    }

    pub fn staging_mirror(&self) -> Option<u32> {
        self.staging_mirror
    }

    pub fn invalidate(&mut self) {
        self.staging_mirror = None;
    }

    /// Zeroes the device value and blocks until the clear has executed.
    ///
    /// The clear runs on the device; staging is only the readback path.
    pub fn reset<B: Backend>(&mut self, gpu: &mut GpuContext<B>) -> Result<()> {
        self.staging_mirror = None;
        let mut cmd = gpu.begin(format!("{:?} counter reset", self.role));
        cmd.clear_buffer(self.device);
        gpu.submit_and_wait(cmd)
    }

    /// Copies the device value to staging, waits, and returns it.
    pub fn read<B: Backend>(&mut self, gpu: &mut GpuContext<B>) -> Result<u32> {
        self.staging_mirror = None;
        let mut cmd = gpu.begin(format!("{:?} counter read", self.role));
        cmd.copy_buffer(self.device, self.staging, 4);
        gpu.submit_and_wait(cmd)?;
        let value = mapped_value(self.role, &gpu.map_staging(self.staging)?)?;
        self.staging_mirror = Some(value);
        self.log
            .debug(LOG_TARGET, format_args!("{:?} counter = {value}", self.role));
        Ok(value)
    }

    pub fn release<B: Backend>(self, gpu: &mut GpuContext<B>) -> Result<()> {
        let owner = Owner::Counter(self.role);
        gpu.release(self.device, owner)?;
        gpu.release(self.staging, owner)
    }
}

fn mapped_value(role: CounterRole, words: &[u32]) -> Result<u32> {
    words
        .first()
        .copied()
        .ok_or_else(|| VoxelGiError::Device(format!("{role:?} counter staging mapped no words")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoxelGiConfig;
    use crate::reference_cpu::ReferenceBackend;

    fn context() -> GpuContext<ReferenceBackend> {
        GpuContext::new(ReferenceBackend::new(), &VoxelGiConfig::default(), LogContext::new("counter"))
    }

    #[test]
    fn reset_then_read_returns_zero() {
        let mut gpu = context();
        let mut counter = Counter::initialize(&mut gpu, CounterRole::Fragment).unwrap();
        for value in [0, 1, 77, u32::MAX] {
            gpu.write_words(counter.buffer(), 0, &[value]).unwrap();
            assert_eq!(counter.read(&mut gpu).unwrap(), value);
            counter.reset(&mut gpu).unwrap();
            assert_eq!(counter.staging_mirror(), None);
            assert_eq!(counter.read(&mut gpu).unwrap(), 0);
            assert_eq!(counter.staging_mirror(), Some(0));
        }
    }

    #[test]
    fn stalled_read_escalates_instead_of_reporting_zero() {
        let mut gpu = context();
        let mut counter = Counter::initialize(&mut gpu, CounterRole::OctreeNode).unwrap();
        gpu.write_words(counter.buffer(), 0, &[5]).unwrap();
        gpu.backend_mut().stall_fences(true);
        assert!(matches!(counter.read(&mut gpu), Err(VoxelGiError::SyncTimeout { .. })));
        assert_eq!(counter.staging_mirror(), None);
    }

    #[test]
    fn empty_mapping_is_a_device_error() {
        assert!(matches!(mapped_value(CounterRole::Fragment, &[]), Err(VoxelGiError::Device(_))));
        assert_eq!(mapped_value(CounterRole::Fragment, &[9, 4]).unwrap(), 9);
    }

    #[test]
    fn only_the_counter_releases_its_buffers() {
        let mut gpu = context();
        let counter = Counter::initialize(&mut gpu, CounterRole::OctreeBrick).unwrap();
        assert!(matches!(
            gpu.release(counter.buffer(), Owner::SparseVoxelizer),
            Err(VoxelGiError::NotOwner { .. })
        ));
        counter.release(&mut gpu).unwrap();
        assert_eq!(gpu.arena().live_count(), 0);
    }
}
