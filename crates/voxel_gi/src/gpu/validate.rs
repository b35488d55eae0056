//! In-process dependency checking for recorded command buffers.
//!
//! Tracks, per resource and clip-level mask, the accesses made since the last
//! covering barrier. A read after a write, a write after a read, or a write
//! after a write with no barrier in between is an ordering violation. Atomic
//! accesses commute with each other and need no barrier.

use std::collections::HashMap;

use super::commands::{Access, Barrier, Command, CommandBuffer, LevelMask, Workgroups};
use super::resources::{BufferUsage, QueueKind, ResourceArena, ResourceId};
use crate::error::{Result, VoxelGiError};

#[derive(Clone, Copy, Debug)]
struct Pending {
    command: usize,
    access: Access,
    levels: LevelMask,
}

fn hazard(earlier: Access, later: Access) -> Option<&'static str> {
    if earlier == Access::Atomic && later == Access::Atomic {
        return None;
    }
    if earlier.writes() && later.writes() {
        Some("write-after-write")
    } else if earlier.writes() && later.reads() {
        Some("read-after-write")
    } else if earlier.reads() && later.writes() {
        Some("write-after-read")
    } else {
        None
    }
}

fn violation(cmd: &CommandBuffer, detail: String) -> VoxelGiError {
    VoxelGiError::OrderingViolation {
        command_buffer: cmd.label().to_string(),
        detail,
    }
}

fn describe(cmd: &CommandBuffer, index: usize) -> String {
    match &cmd.commands()[index] {
        Command::Dispatch(dispatch) => format!("#{index} '{}'", dispatch.label),
        Command::ClearBuffer { .. } => format!("#{index} clear"),
        Command::CopyBuffer { .. } => format!("#{index} copy"),
        Command::Barrier(_) => format!("#{index} barrier"),
    }
}

fn require_usage(
    cmd: &CommandBuffer,
    arena: &ResourceArena,
    resource: ResourceId,
    usage: BufferUsage,
    index: usize,
) -> Result<()> {
    let record = arena.get(resource)?;
    if !record.desc.usage.contains(usage) {
        return Err(violation(
            cmd,
            format!(
                "{} uses '{}' as {usage:?} but it was created with {:?}",
                describe(cmd, index),
                record.desc.label,
                record.desc.usage
            ),
        ));
    }
    Ok(())
}

fn check_usages(cmd: &CommandBuffer, arena: &ResourceArena, index: usize, command: &Command) -> Result<()> {
    match command {
        Command::Dispatch(dispatch) => {
            for binding in &dispatch.bindings {
                require_usage(cmd, arena, binding.resource, BufferUsage::STORAGE, index)?;
            }
            if let Workgroups::Indirect { buffer, offset } = dispatch.workgroups {
                require_usage(cmd, arena, buffer, BufferUsage::INDIRECT, index)?;
                if offset % 4 != 0 || offset + 12 > arena.get(buffer)?.desc.size {
                    return Err(violation(
                        cmd,
                        format!("{} reads indirect arguments out of bounds", describe(cmd, index)),
                    ));
                }
            }
            if dispatch.bindings.len() != dispatch.pipeline.storage_bindings().len() {
                return Err(violation(
                    cmd,
                    format!(
                        "{} binds {} buffers, {} expects {}",
                        describe(cmd, index),
                        dispatch.bindings.len(),
                        dispatch.pipeline.label(),
                        dispatch.pipeline.storage_bindings().len()
                    ),
                ));
            }
        }
        Command::ClearBuffer { dst } => require_usage(cmd, arena, *dst, BufferUsage::COPY_DST, index)?,
        Command::CopyBuffer { src, dst, size } => {
            require_usage(cmd, arena, *src, BufferUsage::COPY_SRC, index)?;
            require_usage(cmd, arena, *dst, BufferUsage::COPY_DST, index)?;
            if *size > arena.get(*src)?.desc.size || *size > arena.get(*dst)?.desc.size {
                return Err(violation(
                    cmd,
                    format!("{} copies {size} bytes past a buffer end", describe(cmd, index)),
                ));
            }
        }
        Command::Barrier(_) => {}
    }
    Ok(())
}

/// Checks `cmd` against the arena's current queue ownership.
///
/// Returns the ownership changes its transfer barriers make, in order, for
/// the caller to apply once the submission is accepted.
pub fn validate(cmd: &CommandBuffer, arena: &ResourceArena) -> Result<Vec<(ResourceId, QueueKind)>> {
    let mut owners: HashMap<ResourceId, QueueKind> = HashMap::new();
    let mut pending: HashMap<ResourceId, Vec<Pending>> = HashMap::new();
    let mut transfers = Vec::new();

    let owner_of = |owners: &mut HashMap<ResourceId, QueueKind>, id: ResourceId| -> Result<QueueKind> {
        if let Some(queue) = owners.get(&id) {
            return Ok(*queue);
        }
        let queue = arena.queue_of(id)?;
        owners.insert(id, queue);
        Ok(queue)
    };

    for (index, command) in cmd.commands().iter().enumerate() {
        check_usages(cmd, arena, index, command)?;

        if let Command::Barrier(Barrier {
            resource,
            levels,
            transfer,
            ..
        }) = command
        {
            let owner = owner_of(&mut owners, *resource)?;
            match transfer {
                Some(transfer) => {
                    if owner != transfer.from {
                        return Err(VoxelGiError::QueueOwnership {
                            resource: *resource,
                            owner,
                            used_on: transfer.from,
                        });
                    }
                    owners.insert(*resource, transfer.to);
                    transfers.push((*resource, transfer.to));
                }
                None if owner != cmd.queue() => {
                    return Err(VoxelGiError::QueueOwnership {
                        resource: *resource,
                        owner,
                        used_on: cmd.queue(),
                    });
                }
                None => {}
            }
            if let Some(list) = pending.get_mut(resource) {
                for entry in list.iter_mut() {
                    entry.levels = LevelMask(entry.levels.0 & !levels.0);
                }
                list.retain(|entry| entry.levels.0 != 0);
            }
            continue;
        }

        for access in command.accesses() {
            let owner = owner_of(&mut owners, access.resource)?;
            if owner != cmd.queue() {
                return Err(VoxelGiError::QueueOwnership {
                    resource: access.resource,
                    owner,
                    used_on: cmd.queue(),
                });
            }
            let list = pending.entry(access.resource).or_default();
            for earlier in list.iter() {
                if earlier.command == index || !earlier.levels.intersects(access.levels) {
                    continue;
                }
                if let Some(kind) = hazard(earlier.access, access.access) {
                    let label = arena.get(access.resource)?.desc.label.clone();
                    return Err(violation(
                        cmd,
                        format!(
                            "{kind} on '{label}' between {} and {} without a barrier",
                            describe(cmd, earlier.command),
                            describe(cmd, index)
                        ),
                    ));
                }
            }
            list.push(Pending {
                command: index,
                access: access.access,
                levels: access.levels,
            });
        }
    }
    Ok(transfers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::commands::Binding;
    use crate::gpu::pipelines::PipelineKind;
    use crate::gpu::resources::{BufferDesc, Owner};

    fn storage(arena: &mut ResourceArena, label: &str) -> ResourceId {
        arena.insert(
            BufferDesc::words(label, 64, BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::COPY_SRC),
            Owner::ClipmapVoxelizer,
        )
    }

    fn clear_region(cmd: &mut CommandBuffer, opacity: ResourceId, radiance: ResourceId, level: usize, access: Access) {
        let levels = LevelMask::level(level);
        cmd.dispatch(
            "clear",
            PipelineKind::ClearRegion,
            vec![
                Binding::levels(opacity, access, levels),
                Binding::levels(radiance, access, levels),
            ],
            &[0u32; 4],
            Workgroups::Direct([1, 1, 1]),
        );
    }

    #[test]
    fn missing_barrier_between_write_and_read_is_reported() {
        let mut arena = ResourceArena::new();
        let a = storage(&mut arena, "a");
        let b = storage(&mut arena, "b");
        let mut cmd = CommandBuffer::new("frame", QueueKind::Compute);
        clear_region(&mut cmd, a, b, 0, Access::Write);
        clear_region(&mut cmd, a, b, 0, Access::ReadWrite);
        let err = validate(&cmd, &arena).unwrap_err();
        assert!(matches!(err, VoxelGiError::OrderingViolation { .. }), "{err}");
    }

    #[test]
    fn barrier_on_touched_levels_resolves_hazard() {
        let mut arena = ResourceArena::new();
        let a = storage(&mut arena, "a");
        let b = storage(&mut arena, "b");
        let mut cmd = CommandBuffer::new("frame", QueueKind::Compute);
        clear_region(&mut cmd, a, b, 2, Access::Write);
        cmd.barrier_levels(a, LevelMask::level(2), Access::Write, Access::ReadWrite);
        cmd.barrier_levels(b, LevelMask::level(2), Access::Write, Access::ReadWrite);
        clear_region(&mut cmd, a, b, 2, Access::ReadWrite);
        validate(&cmd, &arena).expect("barriers cover both buffers");
    }

    #[test]
    fn barrier_on_other_level_does_not_help() {
        let mut arena = ResourceArena::new();
        let a = storage(&mut arena, "a");
        let b = storage(&mut arena, "b");
        let mut cmd = CommandBuffer::new("frame", QueueKind::Compute);
        clear_region(&mut cmd, a, b, 2, Access::Write);
        cmd.barrier_levels(a, LevelMask::level(3), Access::Write, Access::ReadWrite);
        cmd.barrier_levels(b, LevelMask::level(3), Access::Write, Access::ReadWrite);
        clear_region(&mut cmd, a, b, 2, Access::ReadWrite);
        assert!(validate(&cmd, &arena).is_err());
    }

    #[test]
    fn independent_levels_need_no_barrier() {
        let mut arena = ResourceArena::new();
        let a = storage(&mut arena, "a");
        let b = storage(&mut arena, "b");
        let mut cmd = CommandBuffer::new("frame", QueueKind::Compute);
        clear_region(&mut cmd, a, b, 0, Access::Write);
        clear_region(&mut cmd, a, b, 1, Access::Write);
        validate(&cmd, &arena).expect("disjoint levels");
    }

    #[test]
    fn atomics_commute() {
        let mut arena = ResourceArena::new();
        let a = storage(&mut arena, "a");
        let b = storage(&mut arena, "b");
        let mut cmd = CommandBuffer::new("frame", QueueKind::Compute);
        clear_region(&mut cmd, a, b, 0, Access::Atomic);
        clear_region(&mut cmd, a, b, 0, Access::Atomic);
        validate(&cmd, &arena).expect("atomic after atomic");
    }

    #[test]
    fn indirect_arguments_need_barrier_after_write() {
        let mut arena = ResourceArena::new();
        let args = arena.insert(
            BufferDesc::words("args", 8, BufferUsage::STORAGE | BufferUsage::INDIRECT),
            Owner::OctreeBuilder,
        );
        let nodes = storage(&mut arena, "nodes");
        let counter = storage(&mut arena, "counter");
        let state = storage(&mut arena, "state");
        let mut cmd = CommandBuffer::new("octree", QueueKind::Compute);
        cmd.dispatch(
            "modify",
            PipelineKind::OctreeModifyArgs,
            vec![
                Binding::new(counter, Access::Read),
                Binding::new(state, Access::ReadWrite),
                Binding::new(args, Access::ReadWrite),
            ],
            &[0u32; 8],
            Workgroups::Direct([1, 1, 1]),
        );
        cmd.barrier(counter, Access::Read, Access::Atomic);
        cmd.barrier(state, Access::ReadWrite, Access::Atomic);
        cmd.dispatch(
            "alloc",
            PipelineKind::OctreeAlloc,
            vec![
                Binding::new(nodes, Access::ReadWrite),
                Binding::new(counter, Access::Atomic),
                Binding::new(state, Access::Atomic),
            ],
            &[0u32; 8],
            Workgroups::Indirect { buffer: args, offset: 0 },
        );
        let err = validate(&cmd, &arena).unwrap_err();
        assert!(err.to_string().contains("read-after-write"), "{err}");
    }

    #[test]
    fn queue_ownership_follows_transfers() {
        let mut arena = ResourceArena::new();
        let a = storage(&mut arena, "a");
        let b = storage(&mut arena, "b");
        let mut cmd = CommandBuffer::new("frame", QueueKind::Compute);
        clear_region(&mut cmd, a, b, 0, Access::Write);
        cmd.transfer_ownership(a, Access::Write, Access::Read, QueueKind::Graphics);
        let transfers = validate(&cmd, &arena).expect("release to graphics");
        assert_eq!(transfers, vec![(a, QueueKind::Graphics)]);

        clear_region(&mut cmd, a, b, 1, Access::Write);
        assert!(matches!(
            validate(&cmd, &arena),
            Err(VoxelGiError::QueueOwnership { .. })
        ));
    }

    #[test]
    fn usage_mismatch_is_rejected() {
        let mut arena = ResourceArena::new();
        let staging = arena.insert(
            BufferDesc::words("staging", 1, BufferUsage::MAP_READ | BufferUsage::COPY_DST),
            Owner::Readback,
        );
        let mut cmd = CommandBuffer::new("bad", QueueKind::Compute);
        cmd.copy_buffer(staging, staging, 4);
        assert!(validate(&cmd, &arena).is_err());
    }
}
