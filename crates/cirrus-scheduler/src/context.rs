//! Working set for one scheduling pass.
//!
//! Owns the node list and the remaining launch budgets. Each phase gets
//! the context by `&mut` and reads through copying accessors, so no
//! phase holds onto another phase's view.

use std::collections::BTreeMap;

use tracing::debug;

use cirrus_core::{MachineType, MachineTypeConfig, RequestOrder, TerminationReason};

use crate::convert::instances_to_nodes;
use crate::node::{SchedulingNode, SchedulingNodeStatus};
use crate::request::SchedulingRequest;

/// Saved nodes and budgets, for rolling back an attempted placement.
#[derive(Debug, Clone)]
pub struct ContextCheckpoint {
    nodes: Vec<SchedulingNode>,
    launch_budget: BTreeMap<MachineType, u32>,
    cluster_budget: u32,
}

#[derive(Debug, Clone)]
pub struct ScheduleContext {
    nodes: Vec<SchedulingNode>,
    machine_types: BTreeMap<MachineType, MachineTypeConfig>,
    /// Machine type → nodes that may still be launched.
    launch_budget: BTreeMap<MachineType, u32>,
    /// Nodes that may still be launched across all types.
    cluster_budget: u32,
    max_worker_nodes: u32,
    idle_timeout_ms: Option<u64>,
    request_order: RequestOrder,
    now_ms: u64,
}

impl ScheduleContext {
    /// Build the working set from a request.
    pub fn from_request(request: &SchedulingRequest) -> Self {
        let nodes = instances_to_nodes(
            &request.current_instances,
            &request.runtime_nodes,
            &request.machine_types,
        );
        let mut ctx = Self {
            nodes,
            machine_types: request
                .machine_types
                .iter()
                .map(|(name, config)| {
                    let config = MachineTypeConfig {
                        name: name.clone(),
                        ..config.clone()
                    };
                    (name.clone(), config)
                })
                .collect(),
            launch_budget: BTreeMap::new(),
            cluster_budget: 0,
            max_worker_nodes: request.cluster_max(),
            idle_timeout_ms: request.idle_timeout_ms,
            request_order: request.request_order,
            now_ms: request.now_ms,
        };
        ctx.refresh_budgets();
        debug!(
            nodes = ctx.nodes.len(),
            cluster_budget = ctx.cluster_budget,
            "schedule context built"
        );
        ctx
    }

    /// Recompute budgets from the active node counts.
    pub fn refresh_budgets(&mut self) {
        let counts = self.active_counts();
        self.launch_budget = self
            .machine_types
            .iter()
            .map(|(name, config)| {
                let count = counts.get(name).copied().unwrap_or(0);
                (name.clone(), config.max_worker_nodes.saturating_sub(count))
            })
            .collect();
        let total: u32 = counts.values().sum();
        self.cluster_budget = self.max_worker_nodes.saturating_sub(total);
    }

    // ── Reads (copies) ─────────────────────────────────────────────

    pub fn get_nodes(&self) -> Vec<SchedulingNode> {
        self.nodes.clone()
    }

    pub fn get_launch_budget(&self) -> BTreeMap<MachineType, u32> {
        self.launch_budget.clone()
    }

    pub fn get_machine_types(&self) -> BTreeMap<MachineType, MachineTypeConfig> {
        self.machine_types.clone()
    }

    pub fn cluster_budget(&self) -> u32 {
        self.cluster_budget
    }

    pub fn max_worker_nodes(&self) -> u32 {
        self.max_worker_nodes
    }

    pub fn idle_timeout_ms(&self) -> Option<u64> {
        self.idle_timeout_ms
    }

    pub fn request_order(&self) -> RequestOrder {
        self.request_order
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Machine type → active (not `ToTerminate`) node count.
    pub fn active_counts(&self) -> BTreeMap<MachineType, u32> {
        let mut counts = BTreeMap::new();
        for node in self.nodes.iter().filter(|n| n.is_active()) {
            *counts.entry(node.machine_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Budget left for one machine type, also bounded by the cluster budget.
    pub fn remaining_launches(&self, machine_type: &str) -> u32 {
        self.launch_budget
            .get(machine_type)
            .copied()
            .unwrap_or(0)
            .min(self.cluster_budget)
    }

    /// Machine types with launch budget left, in name order.
    pub fn launchable_types(&self) -> Vec<MachineType> {
        self.machine_types
            .keys()
            .filter(|name| self.remaining_launches(name) > 0)
            .cloned()
            .collect()
    }

    /// A fresh candidate of the given type, if the budget allows one.
    ///
    /// Nothing is committed; see [`ScheduleContext::launch_node`].
    pub fn candidate(&self, machine_type: &str, reason: &str) -> Option<SchedulingNode> {
        if self.remaining_launches(machine_type) == 0 {
            return None;
        }
        self.machine_types
            .get(machine_type)
            .map(|config| SchedulingNode::to_launch(config, reason))
    }

    // ── Writes ─────────────────────────────────────────────────────

    pub(crate) fn nodes(&self) -> &[SchedulingNode] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut Vec<SchedulingNode> {
        &mut self.nodes
    }

    /// Take a node out of the plan. Returns false if it already was.
    pub fn mark_terminate(&mut self, index: usize, reason: TerminationReason) -> bool {
        let Some(node) = self.nodes.get_mut(index) else {
            return false;
        };
        if !node.is_active() {
            return false;
        }
        node.status = SchedulingNodeStatus::ToTerminate;
        node.termination_reason = Some(reason);
        debug!(
            machine_type = %node.machine_type,
            instance = node.instance_id.as_deref().unwrap_or("-"),
            %reason,
            "node marked for termination"
        );
        true
    }

    /// Add a `ToLaunch` node and charge the budgets.
    ///
    /// Returns its index, or `None` when no budget remains.
    pub fn launch_node(&mut self, node: SchedulingNode) -> Option<usize> {
        if node.status != SchedulingNodeStatus::ToLaunch
            || self.remaining_launches(&node.machine_type) == 0
        {
            return None;
        }
        if let Some(budget) = self.launch_budget.get_mut(&node.machine_type) {
            *budget -= 1;
        }
        self.cluster_budget -= 1;
        debug!(
            machine_type = %node.machine_type,
            reason = node.launch_reason.as_deref().unwrap_or(""),
            "node added to launch plan"
        );
        self.nodes.push(node);
        Some(self.nodes.len() - 1)
    }

    pub fn checkpoint(&self) -> ContextCheckpoint {
        ContextCheckpoint {
            nodes: self.nodes.clone(),
            launch_budget: self.launch_budget.clone(),
            cluster_budget: self.cluster_budget,
        }
    }

    pub fn restore(&mut self, checkpoint: ContextCheckpoint) {
        self.nodes = checkpoint.nodes;
        self.launch_budget = checkpoint.launch_budget;
        self.cluster_budget = checkpoint.cluster_budget;
    }

    /// The same cluster with every node empty, for what-if checks.
    pub fn emptied(&self) -> Self {
        Self {
            nodes: self.nodes.iter().map(SchedulingNode::emptied).collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_state::Instance;

    fn machine(name: &str, max: u32) -> MachineTypeConfig {
        MachineTypeConfig {
            name: name.to_string(),
            min_worker_nodes: 0,
            max_worker_nodes: max,
            resources: [("CPU".to_string(), 4.0)].into_iter().collect(),
            labels: BTreeMap::new(),
            manual_install: false,
        }
    }

    fn request() -> SchedulingRequest {
        let mut request = SchedulingRequest::default();
        request.machine_types.insert("m1".to_string(), machine("m1", 3));
        request.machine_types.insert("m2".to_string(), machine("m2", 2));
        request.max_worker_nodes = Some(4);
        request.current_instances = vec![Instance::queued(
            "i-1".to_string(),
            "m1".to_string(),
            String::new(),
            0,
        )];
        request
    }

    #[test]
    fn budgets_subtract_existing_nodes() {
        let ctx = ScheduleContext::from_request(&request());
        assert_eq!(ctx.get_launch_budget()["m1"], 2);
        assert_eq!(ctx.get_launch_budget()["m2"], 2);
        assert_eq!(ctx.cluster_budget(), 3);
    }

    #[test]
    fn launch_node_charges_both_budgets() {
        let mut ctx = ScheduleContext::from_request(&request());
        let node = ctx.candidate("m2", "test").unwrap();
        assert_eq!(ctx.launch_node(node), Some(1));
        assert_eq!(ctx.get_launch_budget()["m2"], 1);
        assert_eq!(ctx.cluster_budget(), 2);
    }

    #[test]
    fn cluster_budget_caps_type_budget() {
        let mut ctx = ScheduleContext::from_request(&request());
        for _ in 0..3 {
            let node = ctx.candidate("m2", "test").or_else(|| ctx.candidate("m1", "test")).unwrap();
            ctx.launch_node(node).unwrap();
        }
        assert_eq!(ctx.cluster_budget(), 0);
        assert!(ctx.candidate("m1", "test").is_none());
        assert_eq!(ctx.remaining_launches("m1"), 0);
    }

    #[test]
    fn restore_undoes_launches() {
        let mut ctx = ScheduleContext::from_request(&request());
        let checkpoint = ctx.checkpoint();
        let node = ctx.candidate("m1", "test").unwrap();
        ctx.launch_node(node).unwrap();
        ctx.restore(checkpoint);
        assert_eq!(ctx.get_nodes().len(), 1);
        assert_eq!(ctx.cluster_budget(), 3);
    }

    #[test]
    fn terminated_node_frees_budget_after_refresh() {
        let mut ctx = ScheduleContext::from_request(&request());
        assert!(ctx.mark_terminate(0, TerminationReason::MaxWorkerNodes));
        assert!(!ctx.mark_terminate(0, TerminationReason::MaxWorkerNodes));
        ctx.refresh_budgets();
        assert_eq!(ctx.get_launch_budget()["m1"], 3);
        assert_eq!(ctx.cluster_budget(), 4);
        assert_eq!(ctx.launchable_types(), vec!["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn reads_are_copies() {
        let ctx = ScheduleContext::from_request(&request());
        let mut nodes = ctx.get_nodes();
        nodes.clear();
        assert_eq!(ctx.get_nodes().len(), 1);
    }
}
