//! Type conversions between store records and scheduling nodes.
//!
//! Bridges `cirrus_state::Instance` plus the runtime's
//! `RuntimeNodeState` to the scheduler's `SchedulingNode`.

use std::collections::BTreeMap;

use tracing::warn;

use cirrus_core::{MachineTypeConfig, MachineType, RuntimeNodeState};
use cirrus_state::{Instance, InstanceStatus};

use crate::node::{SchedulingNode, SchedulingNodeStatus};

/// Scheduling status for an instance, or `None` when it no longer
/// contributes capacity (failed, stopping, or on its way out).
pub fn scheduling_status(status: InstanceStatus) -> Option<SchedulingNodeStatus> {
    match status {
        InstanceStatus::Queued
        | InstanceStatus::Requested
        | InstanceStatus::Allocated
        | InstanceStatus::RayInstalling => Some(SchedulingNodeStatus::Pending),
        InstanceStatus::RayRunning => Some(SchedulingNodeStatus::Running),
        InstanceStatus::AllocationFailed
        | InstanceStatus::RayInstallFailed
        | InstanceStatus::RayStopping
        | InstanceStatus::RayStopped
        | InstanceStatus::Terminating
        | InstanceStatus::Terminated
        | InstanceStatus::TerminationFailed => None,
    }
}

/// Convert one instance to a [`SchedulingNode`].
///
/// Capacity comes from the runtime when the node has joined, else from
/// the machine-type config. Runtime labels are layered over config labels.
pub fn instance_to_node(
    instance: &Instance,
    runtime: Option<&RuntimeNodeState>,
    config: &MachineTypeConfig,
) -> Option<SchedulingNode> {
    let status = scheduling_status(instance.status)?;

    let mut labels = config.labels.clone();
    let (total, available, idle_duration_ms, runtime_node_id) = match runtime {
        Some(state) => {
            labels.extend(state.labels.clone());
            (
                state.total_resources.clone(),
                state.available_resources.clone(),
                state.idle_duration_ms,
                Some(state.node_id.clone()),
            )
        }
        None => (
            config.resources.clone(),
            config.resources.clone(),
            0,
            instance.runtime_node_id.clone(),
        ),
    };

    Some(SchedulingNode {
        machine_type: instance.machine_type.clone(),
        status,
        total_resources: total,
        available_resources: available,
        labels,
        sched_requests: Vec::new(),
        launch_reason: None,
        termination_reason: None,
        idle_duration_ms,
        instance_id: Some(instance.id.clone()),
        runtime_node_id,
    })
}

/// Convert every instance that still contributes capacity.
///
/// Instances whose machine type is missing from `machine_types` are
/// skipped for this pass.
pub fn instances_to_nodes(
    instances: &[Instance],
    runtime_nodes: &[RuntimeNodeState],
    machine_types: &BTreeMap<MachineType, MachineTypeConfig>,
) -> Vec<SchedulingNode> {
    let by_cloud_id: BTreeMap<&str, &RuntimeNodeState> = runtime_nodes
        .iter()
        .filter(|n| n.status.is_alive())
        .filter_map(|n| n.cloud_instance_id.as_deref().map(|id| (id, n)))
        .collect();

    let mut nodes = Vec::new();
    for instance in instances {
        let Some(config) = machine_types.get(&instance.machine_type) else {
            if scheduling_status(instance.status).is_some() {
                warn!(
                    instance = %instance.id,
                    machine_type = %instance.machine_type,
                    "no config for machine type, skipping instance this pass"
                );
            }
            continue;
        };
        let runtime = instance
            .cloud_instance_id
            .as_deref()
            .and_then(|id| by_cloud_id.get(id).copied());
        if let Some(node) = instance_to_node(instance, runtime, config) {
            nodes.push(node);
        }
    }
    nodes
}
