use thiserror::Error;

use crate::gpu::{QueueKind, ResourceId};

pub type Result<T> = std::result::Result<T, VoxelGiError>;

#[derive(Debug, Error)]
pub enum VoxelGiError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("allocation failed for {label}: {reason}")]
    Allocation { label: String, reason: String },

    #[error("device error: {0}")]
    Device(String),

    #[error("fence for submission {submission} still pending after {timeout_ms} ms")]
    SyncTimeout { submission: u64, timeout_ms: u128 },

    #[error("{resource} overran its capacity: needed {requested}, have {capacity}")]
    CapacityOverrun {
        resource: &'static str,
        requested: u64,
        capacity: u64,
    },

    #[error("ordering violation in '{command_buffer}': {detail}")]
    OrderingViolation {
        command_buffer: String,
        detail: String,
    },

    #[error("{resource:?} is owned by the {owner:?} queue, used on {used_on:?}")]
    QueueOwnership {
        resource: ResourceId,
        owner: QueueKind,
        used_on: QueueKind,
    },

    #[error("unknown or released resource {0:?}")]
    UnknownResource(ResourceId),

    #[error("{resource:?} belongs to {owner}, not {caller}")]
    NotOwner {
        resource: ResourceId,
        owner: String,
        caller: String,
    },

    #[error("no scene geometry has been attached")]
    SceneNotReady,

    #[error("scene loader failed: {0}")]
    Loader(String),
}

impl VoxelGiError {
    /// Overruns are recoverable by retrying with a smaller workload.
    pub fn is_capacity_overrun(&self) -> bool {
        matches!(self, VoxelGiError::CapacityOverrun { .. })
    }
}
