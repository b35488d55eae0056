//! Arena of GPU resource handles with explicit ownership records.

use std::fmt;
use std::ops::BitOr;

use crate::error::{Result, VoxelGiError};

/// Generational handle into the [`ResourceArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    index: u32,
    generation: u32,
}

impl ResourceId {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Queue family a resource currently belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Voxelization, octree build and clipmap maintenance.
    Compute,
    /// Cone tracing and presentation.
    Graphics,
}

/// Component that allocated (and alone may release) a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Counter(CounterRole),
    SceneGeometry,
    SparseVoxelizer,
    OctreeBuilder,
    ClipmapVoxelizer,
    /// Temporary readback staging.
    Readback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CounterRole {
    Fragment,
    OctreeNode,
    OctreeBrick,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Counter(role) => write!(f, "{role:?} counter"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const STORAGE: Self = Self(1);
    pub const UNIFORM: Self = Self(1 << 1);
    pub const INDIRECT: Self = Self(1 << 2);
    pub const COPY_SRC: Self = Self(1 << 3);
    pub const COPY_DST: Self = Self(1 << 4);
    pub const MAP_READ: Self = Self(1 << 5);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for BufferUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 6] = ["STORAGE", "UNIFORM", "INDIRECT", "COPY_SRC", "COPY_DST", "MAP_READ"];
        let names: Vec<&str> = NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(" | "))
    }
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub label: String,
    /// Size in bytes; always a multiple of 4.
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDesc {
    pub fn words(label: impl Into<String>, words: u64, usage: BufferUsage) -> Self {
        Self {
            label: label.into(),
            size: words.max(1) * 4,
            usage,
        }
    }

    pub fn word_count(&self) -> usize {
        (self.size / 4) as usize
    }
}

#[derive(Clone, Debug)]
pub struct ResourceRecord {
    pub desc: BufferDesc,
    pub owner: Owner,
    pub queue: QueueKind,
}

#[derive(Debug, Default)]
pub struct ResourceArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<ResourceRecord>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, desc: BufferDesc, owner: Owner) -> ResourceId {
        let record = ResourceRecord {
            desc,
            owner,
            queue: QueueKind::Compute,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation += 1;
            slot.record = Some(record);
            ResourceId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                record: Some(record),
            });
            ResourceId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    pub fn get(&self, id: ResourceId) -> Result<&ResourceRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
            .ok_or(VoxelGiError::UnknownResource(id))
    }

    fn get_mut(&mut self, id: ResourceId) -> Result<&mut ResourceRecord> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
            .ok_or(VoxelGiError::UnknownResource(id))
    }

    /// Removes `id`; only its owner may do so.
    pub fn remove(&mut self, id: ResourceId, caller: Owner) -> Result<ResourceRecord> {
        let record = self.get(id)?;
        if record.owner != caller {
            return Err(VoxelGiError::NotOwner {
                resource: id,
                owner: record.owner.to_string(),
                caller: caller.to_string(),
            });
        }
        let slot = &mut self.slots[id.index as usize];
        let record = slot.record.take().ok_or(VoxelGiError::UnknownResource(id))?;
        self.free.push(id.index);
        Ok(record)
    }

    pub fn queue_of(&self, id: ResourceId) -> Result<QueueKind> {
        Ok(self.get(id)?.queue)
    }

    pub(crate) fn set_queue(&mut self, id: ResourceId, queue: QueueKind) -> Result<()> {
        self.get_mut(id)?.queue = queue;
        Ok(())
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.record.is_some()).count()
    }

    pub fn owned_by(&self, owner: Owner) -> Vec<ResourceId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.record
                    .as_ref()
                    .filter(|record| record.owner == owner)
                    .map(|_| ResourceId {
                        index: index as u32,
                        generation: slot.generation,
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> BufferDesc {
        BufferDesc::words("test", 4, BufferUsage::STORAGE)
    }

    #[test]
    fn insert_starts_on_compute_queue() {
        let mut arena = ResourceArena::new();
        let id = arena.insert(desc(), Owner::OctreeBuilder);
        assert_eq!(arena.queue_of(id).unwrap(), QueueKind::Compute);
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn only_owner_may_remove() {
        let mut arena = ResourceArena::new();
        let id = arena.insert(desc(), Owner::SparseVoxelizer);
        assert!(matches!(
            arena.remove(id, Owner::OctreeBuilder),
            Err(VoxelGiError::NotOwner { .. })
        ));
        arena.remove(id, Owner::SparseVoxelizer).expect("owner removes");
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn stale_handles_are_rejected_after_slot_reuse() {
        let mut arena = ResourceArena::new();
        let first = arena.insert(desc(), Owner::Readback);
        arena.remove(first, Owner::Readback).unwrap();
        let second = arena.insert(desc(), Owner::Readback);
        assert_eq!(first.index(), second.index());
        assert!(matches!(arena.get(first), Err(VoxelGiError::UnknownResource(_))));
        assert!(arena.get(second).is_ok());
    }

    #[test]
    fn owned_by_lists_component_resources() {
        let mut arena = ResourceArena::new();
        let a = arena.insert(desc(), Owner::ClipmapVoxelizer);
        let _b = arena.insert(desc(), Owner::OctreeBuilder);
        let c = arena.insert(desc(), Owner::ClipmapVoxelizer);
        assert_eq!(arena.owned_by(Owner::ClipmapVoxelizer), vec![a, c]);
    }

    #[test]
    fn usage_flags_combine() {
        let usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC;
        assert!(usage.contains(BufferUsage::STORAGE));
        assert!(!usage.contains(BufferUsage::MAP_READ));
        assert_eq!(format!("{usage:?}"), "STORAGE | COPY_SRC");
    }
}
