//! Scheduling nodes and utilization scoring.
//!
//! A `SchedulingNode` is a per-pass snapshot of one machine: what it can
//! hold, what is still free, and what this pass assigned to it. Nodes
//! are scored by a lexicographic 4-tuple:
//!
//! 1. **GPU fit** — a GPU node hosting only non-GPU work scores 0
//! 2. **Resource types** — distinct resource types touched by the placed requests
//! 3. **Min utilization** — scarcest dimension after placement
//! 4. **Mean utilization** — across all dimensions after placement

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use cirrus_core::resources::{self, EPSILON, ResourceMap};
use cirrus_core::{InstanceId, MachineType, MachineTypeConfig, ResourceRequest, TerminationReason};

/// Where a node stands in this scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulingNodeStatus {
    /// Decided in this pass; not launched yet.
    ToLaunch,
    /// Launch in flight or runtime not up yet.
    Pending,
    Running,
    /// Decided in this pass; takes no new work.
    ToTerminate,
}

/// Ranking of a candidate node for a placement (higher is better).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UtilizationScore {
    /// 0 when a GPU node would host only non-GPU requests, else 1.
    pub gpu_fit: u8,
    pub resource_types: usize,
    pub min_utilization: f64,
    pub mean_utilization: f64,
}

impl Ord for UtilizationScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.gpu_fit
            .cmp(&other.gpu_fit)
            .then(self.resource_types.cmp(&other.resource_types))
            .then(self.min_utilization.total_cmp(&other.min_utilization))
            .then(self.mean_utilization.total_cmp(&other.mean_utilization))
    }
}

impl PartialOrd for UtilizationScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for UtilizationScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for UtilizationScore {}

/// One machine as seen by a single scheduling pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulingNode {
    pub machine_type: MachineType,
    pub status: SchedulingNodeStatus,
    pub total_resources: ResourceMap,
    pub available_resources: ResourceMap,
    pub labels: BTreeMap<String, String>,
    /// Requests assigned during this pass.
    pub sched_requests: Vec<ResourceRequest>,
    pub launch_reason: Option<String>,
    pub termination_reason: Option<TerminationReason>,
    pub idle_duration_ms: u64,
    /// Backing store record; `None` for nodes decided in this pass.
    pub instance_id: Option<InstanceId>,
    pub runtime_node_id: Option<String>,
}

impl SchedulingNode {
    /// A brand-new node cloned from a machine-type config.
    pub fn to_launch(config: &MachineTypeConfig, reason: &str) -> Self {
        Self {
            machine_type: config.name.clone(),
            status: SchedulingNodeStatus::ToLaunch,
            total_resources: config.resources.clone(),
            available_resources: config.resources.clone(),
            labels: config.labels.clone(),
            sched_requests: Vec::new(),
            launch_reason: Some(reason.to_string()),
            termination_reason: None,
            idle_duration_ms: 0,
            instance_id: None,
            runtime_node_id: None,
        }
    }

    /// Counts toward the cluster's shape (everything but `ToTerminate`).
    pub fn is_active(&self) -> bool {
        self.status != SchedulingNodeStatus::ToTerminate
    }

    pub fn has_gpu(&self) -> bool {
        resources::has_gpu(&self.total_resources)
    }

    /// Place `requests` in the given order, skipping those that do not fit.
    ///
    /// There is no backtracking: a request that does not fit stays in the
    /// returned remainder and the next one is tried. The score covers the
    /// requests placed by this call only.
    pub fn try_schedule(&mut self, requests: &[ResourceRequest]) -> (Vec<ResourceRequest>, UtilizationScore) {
        let mut placed = Vec::new();
        let mut remaining = Vec::new();

        for request in requests {
            if !self.is_active()
                || !request.selects(&self.labels)
                || !resources::fits(&self.available_resources, &request.resources)
                || resources::subtract(&mut self.available_resources, &request.resources).is_err()
            {
                remaining.push(request.clone());
                continue;
            }
            self.sched_requests.push(request.clone());
            placed.push(request.clone());
        }

        let score = self.compute_score(&placed);
        (remaining, score)
    }

    /// Score this node's current state for the given freshly placed requests.
    pub fn compute_score(&self, placed: &[ResourceRequest]) -> UtilizationScore {
        let wants_gpu = placed.iter().any(ResourceRequest::wants_gpu);
        let gpu_fit = if self.has_gpu() && !wants_gpu { 0 } else { 1 };

        let touched: BTreeSet<&String> = placed
            .iter()
            .flat_map(|r| resources::nonzero_keys(&r.resources))
            .collect();

        let ratios: Vec<f64> = self
            .total_resources
            .iter()
            .filter(|(_, total)| **total > EPSILON)
            .map(|(name, total)| {
                let available = self.available_resources.get(name).copied().unwrap_or(0.0);
                ((total - available) / total).clamp(0.0, 1.0)
            })
            .collect();

        let (min_utilization, mean_utilization) = if ratios.is_empty() {
            (0.0, 0.0)
        } else {
            let min = ratios.iter().copied().fold(f64::INFINITY, f64::min);
            let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
            (min, mean)
        };

        UtilizationScore {
            gpu_fit,
            resource_types: touched.len(),
            min_utilization,
            mean_utilization,
        }
    }

    /// Reset to an empty node of the same shape (for what-if checks).
    pub fn emptied(&self) -> Self {
        Self {
            available_resources: self.total_resources.clone(),
            sched_requests: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(pairs: &[(&str, f64)]) -> ResourceMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn make_node(name: &str, total: &[(&str, f64)]) -> SchedulingNode {
        let config = MachineTypeConfig {
            name: name.to_string(),
            min_worker_nodes: 0,
            max_worker_nodes: 10,
            resources: resources(total),
            labels: BTreeMap::new(),
            manual_install: false,
        };
        let mut node = SchedulingNode::to_launch(&config, "test");
        node.status = SchedulingNodeStatus::Running;
        node
    }

    fn req(pairs: &[(&str, f64)]) -> ResourceRequest {
        ResourceRequest::from_pairs(pairs)
    }

    #[test]
    fn places_until_full_without_backtracking() {
        let mut node = make_node("m1", &[("CPU", 4.0)]);
        let requests = vec![req(&[("CPU", 3.0)]), req(&[("CPU", 2.0)]), req(&[("CPU", 1.0)])];

        let (remaining, score) = node.try_schedule(&requests);

        // 3 fits, 2 is skipped, 1 still fits afterwards.
        assert_eq!(remaining, vec![req(&[("CPU", 2.0)])]);
        assert_eq!(node.sched_requests.len(), 2);
        assert_eq!(node.available_resources["CPU"], 0.0);
        assert_eq!(score.resource_types, 1);
        assert_eq!(score.min_utilization, 1.0);
    }

    #[test]
    fn same_input_same_outcome() {
        let base = make_node("m1", &[("CPU", 8.0), ("memory", 16.0)]);
        let requests = vec![
            req(&[("CPU", 2.0), ("memory", 4.0)]),
            req(&[("CPU", 7.0)]),
            req(&[("memory", 8.0)]),
        ];

        let mut a = base.clone();
        let mut b = base.clone();
        assert_eq!(a.try_schedule(&requests), b.try_schedule(&requests));
        assert_eq!(a, b);
    }

    #[test]
    fn gpu_node_penalized_for_cpu_work() {
        let mut gpu = make_node("gpu", &[("CPU", 4.0), ("GPU", 1.0)]);
        let mut cpu = make_node("cpu", &[("CPU", 4.0)]);

        let (_, gpu_score) = gpu.try_schedule(&[req(&[("CPU", 1.0)])]);
        let (_, cpu_score) = cpu.try_schedule(&[req(&[("CPU", 1.0)])]);

        assert_eq!(gpu_score.gpu_fit, 0);
        assert_eq!(cpu_score.gpu_fit, 1);
        assert!(cpu_score > gpu_score);
    }

    #[test]
    fn gpu_work_on_gpu_node_is_fine() {
        let mut gpu = make_node("gpu", &[("CPU", 4.0), ("GPU", 1.0)]);
        let (remaining, score) = gpu.try_schedule(&[req(&[("GPU", 1.0)])]);
        assert!(remaining.is_empty());
        assert_eq!(score.gpu_fit, 1);
    }

    #[test]
    fn fuller_node_scores_higher() {
        let mut nearly_full = make_node("a", &[("CPU", 4.0)]);
        nearly_full.available_resources = resources(&[("CPU", 2.0)]);
        let mut empty = make_node("b", &[("CPU", 4.0)]);

        let (_, s1) = nearly_full.try_schedule(&[req(&[("CPU", 2.0)])]);
        let (_, s2) = empty.try_schedule(&[req(&[("CPU", 2.0)])]);

        assert!(s1 > s2, "nearly full ({s1:?}) should outrank empty ({s2:?})");
    }

    #[test]
    fn more_resource_types_outrank_utilization() {
        let score_a = UtilizationScore {
            gpu_fit: 1,
            resource_types: 2,
            min_utilization: 0.1,
            mean_utilization: 0.1,
        };
        let score_b = UtilizationScore {
            gpu_fit: 1,
            resource_types: 1,
            min_utilization: 0.9,
            mean_utilization: 0.9,
        };
        assert!(score_a > score_b);
    }

    #[test]
    fn label_selector_rejects_unlabeled_node() {
        let mut node = make_node("m1", &[("CPU", 4.0)]);
        let request = req(&[("CPU", 1.0)]).with_label("zone", "a");
        let (remaining, _) = node.try_schedule(std::slice::from_ref(&request));
        assert_eq!(remaining, vec![request]);
        assert!(node.sched_requests.is_empty());
    }

    #[test]
    fn terminating_node_takes_nothing() {
        let mut node = make_node("m1", &[("CPU", 4.0)]);
        node.status = SchedulingNodeStatus::ToTerminate;
        let (remaining, _) = node.try_schedule(&[req(&[("CPU", 1.0)])]);
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn emptied_restores_capacity() {
        let mut node = make_node("m1", &[("CPU", 4.0)]);
        node.try_schedule(&[req(&[("CPU", 3.0)])]);
        let empty = node.emptied();
        assert_eq!(empty.available_resources, node.total_resources);
        assert!(empty.sched_requests.is_empty());
    }
}
