//! Already-fetched views of the outside world.
//!
//! The reconciler never talks to the cloud provider or the runtime; the
//! driver fetches these snapshots and hands them in once per tick.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceMap;
use crate::types::{
    ClusterResourceConstraint, GangResourceRequest, InstanceId, MachineType,
    ResourceRequestByCount,
};

/// The cloud provider's record of one machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudInstance {
    pub cloud_instance_id: String,
    pub machine_type: MachineType,
    pub running: bool,
    /// Launch request that produced this machine, when the provider tags it.
    #[serde(default)]
    pub launch_request_id: Option<String>,
}

/// Runtime's view of a node's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeNodeStatus {
    Running,
    Idle,
    Draining,
    Dead,
}

impl RuntimeNodeStatus {
    /// The node has joined and not yet left.
    pub fn is_alive(&self) -> bool {
        !matches!(self, Self::Dead)
    }
}

/// One node as reported by the compute runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeNodeState {
    pub node_id: String,
    #[serde(default)]
    pub cloud_instance_id: Option<String>,
    pub total_resources: ResourceMap,
    pub available_resources: ResourceMap,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub status: RuntimeNodeStatus,
    #[serde(default)]
    pub idle_duration_ms: u64,
}

/// Failure reported by the cloud provider for a launch or terminate request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderError {
    pub request_id: String,
    pub machine_type: MachineType,
    pub message: String,
}

/// Failure reported by the runtime installer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallError {
    pub instance_id: InstanceId,
    pub message: String,
}

/// Outstanding demand reported by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterDemand {
    #[serde(default)]
    pub resource_requests: Vec<ResourceRequestByCount>,
    #[serde(default)]
    pub gang_resource_requests: Vec<GangResourceRequest>,
    #[serde(default)]
    pub cluster_resource_constraints: Vec<ClusterResourceConstraint>,
}

impl ClusterDemand {
    pub fn is_empty(&self) -> bool {
        self.resource_requests.is_empty()
            && self.gang_resource_requests.is_empty()
            && self.cluster_resource_constraints.is_empty()
    }
}

/// Everything one tick observes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterSnapshot {
    /// Non-terminated cloud instances keyed by cloud instance id.
    #[serde(default)]
    pub cloud_instances: BTreeMap<String, CloudInstance>,
    #[serde(default)]
    pub runtime_nodes: Vec<RuntimeNodeState>,
    #[serde(default)]
    pub provider_errors: Vec<ProviderError>,
    #[serde(default)]
    pub install_errors: Vec<InstallError>,
    #[serde(default)]
    pub demand: ClusterDemand,
    /// Unix time (ms) the snapshot was taken.
    #[serde(default)]
    pub observed_at_ms: u64,
}

impl ClusterSnapshot {
    /// Runtime node reporting the given cloud instance, if any.
    pub fn runtime_node_for(&self, cloud_instance_id: &str) -> Option<&RuntimeNodeState> {
        self.runtime_nodes
            .iter()
            .find(|n| n.cloud_instance_id.as_deref() == Some(cloud_instance_id))
    }
}
