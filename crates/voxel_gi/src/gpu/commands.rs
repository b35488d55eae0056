//! One-shot command recording.
//!
//! A [`CommandBuffer`] is backend-agnostic: it records what to run and which
//! resources each command touches, so the dependency validator and tests can
//! inspect ordering before any backend executes it.

use std::ops::BitOr;

use super::pipelines::PipelineKind;
use super::resources::{QueueKind, ResourceId};

/// How a command touches a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    /// Commutative read-modify-write (atomic add/or/max).
    Atomic,
    /// Read as indirect dispatch arguments.
    Indirect,
}

impl Access {
    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite | Access::Atomic)
    }

    pub fn reads(self) -> bool {
        matches!(
            self,
            Access::Read | Access::ReadWrite | Access::Atomic | Access::Indirect
        )
    }
}

/// Clip levels (bit per level) a command touches inside a stacked resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelMask(pub u32);

impl LevelMask {
    pub const ALL: Self = Self(u32::MAX);

    pub fn level(level: usize) -> Self {
        Self(1 << level)
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for LevelMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub resource: ResourceId,
    pub access: Access,
    pub levels: LevelMask,
}

impl Binding {
    pub fn new(resource: ResourceId, access: Access) -> Self {
        Self {
            resource,
            access,
            levels: LevelMask::ALL,
        }
    }

    pub fn levels(resource: ResourceId, access: Access, levels: LevelMask) -> Self {
        Self {
            resource,
            access,
            levels,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workgroups {
    Direct([u32; 3]),
    /// Three `u32` workgroup counts at `offset` bytes into `buffer`.
    Indirect { buffer: ResourceId, offset: u64 },
}

#[derive(Clone, Debug)]
pub struct Dispatch {
    pub label: String,
    pub pipeline: PipelineKind,
    /// Storage bindings in binding-slot order; the params uniform follows.
    pub bindings: Vec<Binding>,
    pub params: Vec<u8>,
    pub workgroups: Workgroups,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueTransfer {
    pub from: QueueKind,
    pub to: QueueKind,
}

/// Makes earlier accesses to `resource` visible to later ones and, when
/// `transfer` is set, hands the resource to another queue family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub levels: LevelMask,
    pub src: Access,
    pub dst: Access,
    pub transfer: Option<QueueTransfer>,
}

#[derive(Clone, Debug)]
pub enum Command {
    Dispatch(Dispatch),
    ClearBuffer { dst: ResourceId },
    CopyBuffer { src: ResourceId, dst: ResourceId, size: u64 },
    Barrier(Barrier),
}

impl Command {
    pub fn pipeline(&self) -> Option<PipelineKind> {
        match self {
            Command::Dispatch(dispatch) => Some(dispatch.pipeline),
            _ => None,
        }
    }

    /// Every resource access this command performs.
    pub fn accesses(&self) -> Vec<Binding> {
        match self {
            Command::Dispatch(dispatch) => {
                let mut accesses = dispatch.bindings.clone();
                if let Workgroups::Indirect { buffer, .. } = dispatch.workgroups {
                    accesses.push(Binding::new(buffer, Access::Indirect));
                }
                accesses
            }
            Command::ClearBuffer { dst } => vec![Binding::new(*dst, Access::Write)],
            Command::CopyBuffer { src, dst, .. } => vec![
                Binding::new(*src, Access::Read),
                Binding::new(*dst, Access::Write),
            ],
            Command::Barrier(_) => Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct CommandBuffer {
    label: String,
    queue: QueueKind,
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new(label: impl Into<String>, queue: QueueKind) -> Self {
        Self {
            label: label.into(),
            queue,
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn dispatch<P: bytemuck::Pod>(
        &mut self,
        label: impl Into<String>,
        pipeline: PipelineKind,
        bindings: Vec<Binding>,
        params: &P,
        workgroups: Workgroups,
    ) {
        self.commands.push(Command::Dispatch(Dispatch {
            label: label.into(),
            pipeline,
            bindings,
            params: bytemuck::bytes_of(params).to_vec(),
            workgroups,
        }));
    }

    pub fn clear_buffer(&mut self, dst: ResourceId) {
        self.commands.push(Command::ClearBuffer { dst });
    }

    pub fn copy_buffer(&mut self, src: ResourceId, dst: ResourceId, size: u64) {
        self.commands.push(Command::CopyBuffer { src, dst, size });
    }

    pub fn barrier(&mut self, resource: ResourceId, src: Access, dst: Access) {
        self.barrier_levels(resource, LevelMask::ALL, src, dst);
    }

    pub fn barrier_levels(&mut self, resource: ResourceId, levels: LevelMask, src: Access, dst: Access) {
        self.commands.push(Command::Barrier(Barrier {
            resource,
            levels,
            src,
            dst,
            transfer: None,
        }));
    }

    /// Releases `resource` from this buffer's queue to `to`.
    pub fn transfer_ownership(&mut self, resource: ResourceId, src: Access, dst: Access, to: QueueKind) {
        self.commands.push(Command::Barrier(Barrier {
            resource,
            levels: LevelMask::ALL,
            src,
            dst,
            transfer: Some(QueueTransfer {
                from: self.queue,
                to,
            }),
        }));
    }

    /// Takes `resource` back from the `from` queue onto this buffer's queue.
    pub fn acquire_ownership(&mut self, resource: ResourceId, from: QueueKind, src: Access, dst: Access) {
        self.commands.push(Command::Barrier(Barrier {
            resource,
            levels: LevelMask::ALL,
            src,
            dst,
            transfer: Some(QueueTransfer { from, to: self.queue }),
        }));
    }

    /// Full barriers on every resource the most recent command touched.
    pub fn barrier_after_last(&mut self) {
        let Some(last) = self.commands.last() else {
            return;
        };
        let mut resources: Vec<(ResourceId, Access)> = Vec::new();
        for access in last.accesses() {
            if !resources.iter().any(|(id, _)| *id == access.resource) {
                resources.push((access.resource, access.access));
            }
        }
        for (resource, access) in resources {
            self.barrier(resource, access, Access::ReadWrite);
        }
    }

    /// Indices of dispatches running `pipeline`, in recording order.
    pub fn positions_of(&self, pipeline: PipelineKind) -> Vec<usize> {
        self.commands
            .iter()
            .enumerate()
            .filter(|(_, command)| command.pipeline() == Some(pipeline))
            .map(|(index, _)| index)
            .collect()
    }

    /// Index of the first dispatch whose label equals `label`.
    pub fn position_of_label(&self, label: &str) -> Option<usize> {
        self.commands.iter().position(|command| match command {
            Command::Dispatch(dispatch) => dispatch.label == label,
            _ => false,
        })
    }

    /// Whether a barrier on `resource` covering `levels` sits strictly between
    /// command indices `first` and `second`.
    pub fn has_barrier_between(&self, first: usize, second: usize, resource: ResourceId, levels: LevelMask) -> bool {
        self.commands
            .get(first + 1..second)
            .unwrap_or(&[])
            .iter()
            .any(|command| match command {
                Command::Barrier(barrier) => barrier.resource == resource && barrier.levels.intersects(levels),
                _ => false,
            })
    }

    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::Dispatch(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::resources::{BufferDesc, BufferUsage, Owner, ResourceArena};

    #[test]
    fn indirect_dispatch_reports_argument_read() {
        let mut arena = ResourceArena::new();
        let args = arena.insert(
            BufferDesc::words("args", 3, BufferUsage::INDIRECT),
            Owner::OctreeBuilder,
        );
        let mut cmd = CommandBuffer::new("test", QueueKind::Compute);
        cmd.dispatch(
            "flag",
            PipelineKind::OctreeFlag,
            Vec::new(),
            &[0u32; 4],
            Workgroups::Indirect { buffer: args, offset: 0 },
        );
        let accesses = cmd.commands()[0].accesses();
        assert_eq!(accesses, vec![Binding::new(args, Access::Indirect)]);
    }

    #[test]
    fn barrier_search_respects_levels() {
        let mut arena = ResourceArena::new();
        let volume = arena.insert(
            BufferDesc::words("volume", 8, BufferUsage::STORAGE),
            Owner::ClipmapVoxelizer,
        );
        let mut cmd = CommandBuffer::new("test", QueueKind::Compute);
        cmd.clear_buffer(volume);
        cmd.barrier_levels(volume, LevelMask::level(2), Access::Write, Access::Read);
        cmd.clear_buffer(volume);
        assert!(cmd.has_barrier_between(0, 2, volume, LevelMask::level(2)));
        assert!(!cmd.has_barrier_between(0, 2, volume, LevelMask::level(1)));
    }

    #[test]
    fn transfer_records_source_queue() {
        let mut arena = ResourceArena::new();
        let nodes = arena.insert(
            BufferDesc::words("nodes", 8, BufferUsage::STORAGE),
            Owner::OctreeBuilder,
        );
        let mut cmd = CommandBuffer::new("handoff", QueueKind::Compute);
        cmd.transfer_ownership(nodes, Access::Write, Access::Read, QueueKind::Graphics);
        match &cmd.commands()[0] {
            Command::Barrier(barrier) => assert_eq!(
                barrier.transfer,
                Some(QueueTransfer {
                    from: QueueKind::Compute,
                    to: QueueKind::Graphics
                })
            ),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
