//! Side effects decided by a tick, executed by the adapters.

use serde::{Deserialize, Serialize};

use crate::types::{InstanceId, MachineType, TerminationReason};

/// Launch `count` machines of one type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchRequest {
    pub machine_type: MachineType,
    pub count: u32,
    pub request_id: String,
    pub requested_at_ms: u64,
}

/// Terminate one cloud instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminateRequest {
    pub request_id: String,
    pub cloud_instance_id: String,
    pub machine_type: MachineType,
    /// `None` for leaked cloud instances the store never knew about.
    pub instance_id: Option<InstanceId>,
    pub reason: TerminationReason,
}

/// Install the runtime on an allocated machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallRequest {
    pub instance_id: InstanceId,
    pub cloud_instance_id: String,
    pub machine_type: MachineType,
}

/// Drain a runtime node ahead of termination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrainRequest {
    pub instance_id: InstanceId,
    pub runtime_node_id: String,
    pub reason: TerminationReason,
}

/// All side effects decided by one `step_next`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickActions {
    pub launch: Vec<LaunchRequest>,
    pub terminate: Vec<TerminateRequest>,
    pub install: Vec<InstallRequest>,
    pub drain: Vec<DrainRequest>,
}

impl TickActions {
    pub fn is_empty(&self) -> bool {
        self.launch.is_empty()
            && self.terminate.is_empty()
            && self.install.is_empty()
            && self.drain.is_empty()
    }
}
