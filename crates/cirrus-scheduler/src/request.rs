//! The scheduler's public contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use cirrus_core::{
    AutoscalerConfig, ClusterDemand, ClusterResourceConstraint, ConfigError, GangResourceRequest,
    InstanceId, LaunchRequest, MachineType, MachineTypeConfig, RequestOrder, ResourceRequest,
    ResourceRequestByCount, RuntimeNodeState, TerminationReason, cluster_max_worker_nodes,
};
use cirrus_state::Instance;

/// Immutable input to one scheduling pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingRequest {
    pub machine_types: BTreeMap<MachineType, MachineTypeConfig>,
    /// Cluster-wide worker limit; defaults to the sum of per-type limits.
    #[serde(default)]
    pub max_worker_nodes: Option<u32>,
    /// Running nodes idle at least this long may be terminated.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_order: RequestOrder,
    #[serde(default)]
    pub resource_requests: Vec<ResourceRequestByCount>,
    #[serde(default)]
    pub gang_resource_requests: Vec<GangResourceRequest>,
    #[serde(default)]
    pub cluster_resource_constraints: Vec<ClusterResourceConstraint>,
    #[serde(default)]
    pub current_instances: Vec<Instance>,
    #[serde(default)]
    pub runtime_nodes: Vec<RuntimeNodeState>,
    /// Request timestamp stamped on launch requests.
    #[serde(default)]
    pub now_ms: u64,
}

impl SchedulingRequest {
    /// Start a request from the autoscaler config.
    pub fn from_config(config: &AutoscalerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            machine_types: config.machine_types.clone(),
            max_worker_nodes: config.max_worker_nodes,
            idle_timeout_ms: Some(config.idle_timeout_ms()?),
            request_order: config.request_order.unwrap_or_default(),
            ..Self::default()
        })
    }

    pub fn with_demand(mut self, demand: &ClusterDemand) -> Self {
        self.resource_requests = demand.resource_requests.clone();
        self.gang_resource_requests = demand.gang_resource_requests.clone();
        self.cluster_resource_constraints = demand.cluster_resource_constraints.clone();
        self
    }

    /// Effective cluster-wide worker limit.
    pub fn cluster_max(&self) -> u32 {
        cluster_max_worker_nodes(self.max_worker_nodes, self.machine_types.values())
    }
}

/// Output of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulingReply {
    /// One entry per machine type to launch.
    pub to_launch: Vec<LaunchRequest>,
    pub to_terminate: BTreeMap<InstanceId, TerminationReason>,
    pub infeasible_resource_requests: Vec<ResourceRequest>,
    pub infeasible_gang_resource_requests: Vec<GangResourceRequest>,
    pub infeasible_cluster_resource_constraints: Vec<ClusterResourceConstraint>,
}

impl SchedulingReply {
    /// Machine type → number of nodes to launch.
    pub fn launch_counts(&self) -> BTreeMap<MachineType, u32> {
        self.to_launch
            .iter()
            .map(|l| (l.machine_type.clone(), l.count))
            .collect()
    }

    pub fn has_infeasible(&self) -> bool {
        !self.infeasible_resource_requests.is_empty()
            || !self.infeasible_gang_resource_requests.is_empty()
            || !self.infeasible_cluster_resource_constraints.is_empty()
    }
}

/// Deterministic id for a launch of `count` nodes of `machine_type`.
pub fn launch_request_id(machine_type: &str, count: u32, requested_at_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(machine_type.as_bytes());
    hasher.update(count.to_be_bytes());
    hasher.update(requested_at_ms.to_be_bytes());
    let digest = hasher.finalize();
    format!("launch-{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_request_id_is_stable() {
        assert_eq!(launch_request_id("m1", 2, 1000), launch_request_id("m1", 2, 1000));
        assert_ne!(launch_request_id("m1", 2, 1000), launch_request_id("m1", 3, 1000));
        assert_ne!(launch_request_id("m1", 2, 1000), launch_request_id("m1", 2, 1001));
        assert!(launch_request_id("m1", 2, 1000).starts_with("launch-"));
    }

    #[test]
    fn cluster_max_defaults_to_sum_of_types() {
        let mut request = SchedulingRequest::default();
        for (name, max) in [("a", 3), ("b", 4)] {
            request.machine_types.insert(
                name.to_string(),
                MachineTypeConfig {
                    name: name.to_string(),
                    min_worker_nodes: 0,
                    max_worker_nodes: max,
                    resources: [("CPU".to_string(), 1.0)].into_iter().collect(),
                    labels: BTreeMap::new(),
                    manual_install: false,
                },
            );
        }
        assert_eq!(request.cluster_max(), 7);
        request.max_worker_nodes = Some(5);
        assert_eq!(request.cluster_max(), 5);
    }
}
