//! Shared types used across Cirrus crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::resources::{self, ResourceMap};

/// Unique identifier of an instance record in the store.
pub type InstanceId = String;

/// Name of a machine type (e.g. `"cpu-4"`, `"gpu-a100"`).
pub type MachineType = String;

// ── Machine types ─────────────────────────────────────────────────

/// Launchable worker shape and its count bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineTypeConfig {
    /// Filled from the table key when parsed from `cirrus.toml`.
    #[serde(default)]
    pub name: MachineType,
    #[serde(default)]
    pub min_worker_nodes: u32,
    pub max_worker_nodes: u32,
    pub resources: ResourceMap,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// The runtime must be installed by the autoscaler after allocation.
    #[serde(default)]
    pub manual_install: bool,
}

impl MachineTypeConfig {
    /// Hash of the launch-relevant part of the config.
    ///
    /// Count bounds are excluded: editing min/max must not mark running
    /// machines as outdated.
    pub fn config_hash(&self) -> String {
        let launch = serde_json::json!({
            "name": self.name,
            "resources": self.resources,
            "labels": self.labels,
            "manual_install": self.manual_install,
        });
        let mut hasher = Sha256::new();
        hasher.update(launch.to_string().as_bytes());
        let digest = hasher.finalize();
        format!("sha256:{}", hex::encode(&digest[..16]))
    }

    pub fn has_gpu(&self) -> bool {
        resources::has_gpu(&self.resources)
    }
}

// ── Demand ────────────────────────────────────────────────────────

/// One resource shape to place on a single node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequest {
    pub resources: ResourceMap,
    /// Labels the hosting node must carry (all must match).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_selector: BTreeMap<String, String>,
}

impl ResourceRequest {
    pub fn new(resources: ResourceMap) -> Self {
        Self {
            resources,
            label_selector: BTreeMap::new(),
        }
    }

    /// Build a request from `(name, quantity)` pairs.
    pub fn from_pairs(pairs: &[(&str, f64)]) -> Self {
        Self::new(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.label_selector.insert(key.to_string(), value.to_string());
        self
    }

    /// True if a node with these labels may host the request.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.label_selector
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
    }

    pub fn wants_gpu(&self) -> bool {
        resources::has_gpu(&self.resources)
    }
}

/// A resource shape repeated `count` times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequestByCount {
    pub request: ResourceRequest,
    pub count: u32,
}

impl ResourceRequestByCount {
    pub fn new(request: ResourceRequest, count: u32) -> Self {
        Self { request, count }
    }

    /// Expand into `count` individual requests.
    pub fn expand(&self) -> impl Iterator<Item = ResourceRequest> + '_ {
        std::iter::repeat_n(&self.request, self.count as usize).cloned()
    }
}

/// Requests that are placed together or not at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GangResourceRequest {
    pub id: String,
    pub requests: Vec<ResourceRequest>,
}

/// Aggregate shape the cluster must be able to reach.
///
/// Feasibility-only: it never consumes capacity nor launches nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterResourceConstraint {
    pub id: String,
    pub min_bundles: Vec<ResourceRequestByCount>,
}

// ── Termination ───────────────────────────────────────────────────

/// Why an instance is being taken down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    /// Idle past the configured timeout.
    IdleTerminate,
    /// Above the cluster-wide worker limit.
    MaxWorkerNodes,
    /// Above the machine type's worker limit.
    MaxWorkerNodesPerNodeType,
    /// Launched from a machine-type config that no longer matches.
    OutdatedConfig,
    /// Cloud resource unknown to the store.
    Leaked,
    /// The runtime on the machine stopped.
    RuntimeStopped,
    /// Runtime installation failed.
    InstallFailed,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdleTerminate => "IDLE_TERMINATE",
            Self::MaxWorkerNodes => "MAX_WORKER_NODES",
            Self::MaxWorkerNodesPerNodeType => "MAX_WORKER_NODES_PER_NODE_TYPE",
            Self::OutdatedConfig => "OUTDATED_CONFIG",
            Self::Leaked => "LEAKED",
            Self::RuntimeStopped => "RUNTIME_STOPPED",
            Self::InstallFailed => "INSTALL_FAILED",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which individual resource requests are packed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrder {
    /// Most distinct resource types first, then largest summed quantity.
    #[default]
    Footprint,
    /// As submitted.
    Insertion,
}
