//! Resource-demand scheduler — computes the target cluster shape.
//!
//! One call to [`ResourceDemandScheduler::schedule`] builds a fresh
//! [`ScheduleContext`] and runs these phases in order, each seeing what
//! the earlier ones reserved:
//!
//! 0. Enforce per-type and cluster-wide maximums
//! 1. Launch up to per-type minimums
//! 2. Check cluster resource constraints (feasibility only)
//! 3. Place gang requests, all or nothing
//! 4. Place individual requests, largest footprint first
//! 5. Terminate idle nodes above their type's minimum

use std::cmp::Reverse;
use std::collections::BTreeMap;

use tracing::{debug, info};

use cirrus_core::resources;
use cirrus_core::{
    ClusterResourceConstraint, GangResourceRequest, LaunchRequest, MachineType, RequestOrder,
    ResourceRequest, ResourceRequestByCount, TerminationReason,
};

use crate::context::ScheduleContext;
use crate::node::{SchedulingNode, SchedulingNodeStatus, UtilizationScore};
use crate::request::{SchedulingReply, SchedulingRequest, launch_request_id};

/// Anything that turns a scheduling request into a plan.
pub trait DemandScheduler {
    fn schedule(&self, request: &SchedulingRequest) -> SchedulingReply;
}

/// Bin-packing scheduler over a [`ScheduleContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceDemandScheduler;

impl DemandScheduler for ResourceDemandScheduler {
    fn schedule(&self, request: &SchedulingRequest) -> SchedulingReply {
        let mut ctx = ScheduleContext::from_request(request);
        self.schedule_in(&mut ctx, request)
    }
}

impl ResourceDemandScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Run every phase against an existing context.
    ///
    /// `ctx` is left holding the final node assignment.
    pub fn schedule_in(&self, ctx: &mut ScheduleContext, request: &SchedulingRequest) -> SchedulingReply {
        let mut reply = SchedulingReply::default();

        enforce_max_counts(ctx);
        enforce_min_counts(ctx);
        reply.infeasible_cluster_resource_constraints =
            enforce_constraints(ctx, &request.cluster_resource_constraints);
        reply.infeasible_gang_resource_requests =
            schedule_gangs(ctx, &request.gang_resource_requests);
        reply.infeasible_resource_requests = schedule_requests(ctx, &request.resource_requests);
        terminate_idle(ctx);

        reply.to_launch = launch_plan(ctx);
        reply.to_terminate = ctx
            .nodes()
            .iter()
            .filter(|n| n.status == SchedulingNodeStatus::ToTerminate)
            .filter_map(|n| Some((n.instance_id.clone()?, n.termination_reason?)))
            .collect();

        info!(
            launch = ?reply.launch_counts(),
            terminate = reply.to_terminate.len(),
            infeasible_requests = reply.infeasible_resource_requests.len(),
            infeasible_gangs = reply.infeasible_gang_resource_requests.len(),
            infeasible_constraints = reply.infeasible_cluster_resource_constraints.len(),
            "scheduling pass complete"
        );
        reply
    }
}

// ── Phase 0: maximums ──────────────────────────────────────────────

/// Victim order: pending before running, longest idle, least work, id.
fn victim_key(node: &SchedulingNode) -> (bool, Reverse<u64>, usize, Option<String>) {
    (
        node.status != SchedulingNodeStatus::Pending,
        Reverse(node.idle_duration_ms),
        node.sched_requests.len(),
        node.instance_id.clone(),
    )
}

fn enforce_max_counts(ctx: &mut ScheduleContext) {
    let machine_types = ctx.get_machine_types();

    for (name, config) in &machine_types {
        let mut members: Vec<usize> = ctx
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_active() && &n.machine_type == name)
            .map(|(i, _)| i)
            .collect();
        let excess = members.len().saturating_sub(config.max_worker_nodes as usize);
        if excess == 0 {
            continue;
        }
        members.sort_by_key(|&i| victim_key(&ctx.nodes()[i]));
        for &index in members.iter().take(excess) {
            ctx.mark_terminate(index, TerminationReason::MaxWorkerNodesPerNodeType);
        }
        info!(machine_type = %name, excess, "above per-type maximum");
    }

    let mut active: Vec<usize> = ctx
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, n)| n.is_active())
        .map(|(i, _)| i)
        .collect();
    let excess = active.len().saturating_sub(ctx.max_worker_nodes() as usize);
    if excess > 0 {
        active.sort_by_key(|&i| victim_key(&ctx.nodes()[i]));
        for &index in active.iter().take(excess) {
            ctx.mark_terminate(index, TerminationReason::MaxWorkerNodes);
        }
        info!(excess, max = ctx.max_worker_nodes(), "above cluster maximum");
    }

    ctx.refresh_budgets();
}

// ── Phase 1: minimums ──────────────────────────────────────────────

fn enforce_min_counts(ctx: &mut ScheduleContext) {
    let counts = ctx.active_counts();
    for (name, config) in ctx.get_machine_types() {
        let current = counts.get(&name).copied().unwrap_or(0);
        for _ in current..config.min_worker_nodes {
            let Some(node) = ctx.candidate(&name, "min_worker_nodes") else {
                debug!(machine_type = %name, "minimum bounded by launch budget");
                break;
            };
            ctx.launch_node(node);
        }
    }
}

// ── Phase 2: constraints ───────────────────────────────────────────

/// Check each constraint on an emptied copy of the cluster.
///
/// The copy may launch new nodes within budget; it is thrown away, so a
/// constraint never consumes capacity.
fn enforce_constraints(
    ctx: &ScheduleContext,
    constraints: &[ClusterResourceConstraint],
) -> Vec<ClusterResourceConstraint> {
    let mut infeasible = Vec::new();
    for constraint in constraints {
        let mut trial = ctx.emptied();
        let requests = order_requests(expand(&constraint.min_bundles), ctx.request_order());
        let unplaced = requests
            .iter()
            .filter(|r| !place_one(&mut trial, r, "cluster_resource_constraint"))
            .count();
        if unplaced > 0 {
            info!(constraint = %constraint.id, unplaced, "cluster resource constraint infeasible");
            infeasible.push(constraint.clone());
        }
    }
    infeasible
}

// ── Phase 3: gangs ─────────────────────────────────────────────────

fn schedule_gangs(ctx: &mut ScheduleContext, gangs: &[GangResourceRequest]) -> Vec<GangResourceRequest> {
    let mut infeasible = Vec::new();
    for gang in gangs {
        let checkpoint = ctx.checkpoint();
        let reason = format!("gang:{}", gang.id);
        let requests = order_requests(gang.requests.clone(), ctx.request_order());
        let placed = requests.iter().all(|r| place_one(ctx, r, &reason));
        if placed {
            debug!(gang = %gang.id, requests = requests.len(), "gang placed");
        } else {
            ctx.restore(checkpoint);
            info!(gang = %gang.id, "gang infeasible, placements rolled back");
            infeasible.push(gang.clone());
        }
    }
    infeasible
}

// ── Phase 4: individual requests ───────────────────────────────────

fn schedule_requests(ctx: &mut ScheduleContext, requests: &[ResourceRequestByCount]) -> Vec<ResourceRequest> {
    let ordered = order_requests(expand(requests), ctx.request_order());
    let infeasible: Vec<ResourceRequest> = ordered
        .into_iter()
        .filter(|r| !place_one(ctx, r, "resource_request"))
        .collect();
    if !infeasible.is_empty() {
        info!(count = infeasible.len(), "resource requests infeasible");
    }
    infeasible
}

// ── Phase 5: idle nodes ────────────────────────────────────────────

fn terminate_idle(ctx: &mut ScheduleContext) {
    let Some(idle_timeout_ms) = ctx.idle_timeout_ms() else {
        return;
    };
    let mut counts = ctx.active_counts();
    let machine_types = ctx.get_machine_types();

    let mut idle: Vec<usize> = ctx
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, n)| {
            n.status == SchedulingNodeStatus::Running
                && n.sched_requests.is_empty()
                && n.instance_id.is_some()
                && n.idle_duration_ms >= idle_timeout_ms
        })
        .map(|(i, _)| i)
        .collect();
    idle.sort_by_key(|&i| {
        let n = &ctx.nodes()[i];
        (Reverse(n.idle_duration_ms), n.instance_id.clone())
    });

    for index in idle {
        let machine_type = ctx.nodes()[index].machine_type.clone();
        let min = machine_types
            .get(&machine_type)
            .map(|m| m.min_worker_nodes)
            .unwrap_or(0);
        let count = counts.entry(machine_type).or_insert(0);
        if *count <= min {
            continue;
        }
        if ctx.mark_terminate(index, TerminationReason::IdleTerminate) {
            *count -= 1;
        }
    }
}

// ── Placement ──────────────────────────────────────────────────────

enum Target {
    Existing(usize),
    Fresh(MachineType),
}

/// Place one request on the best-scoring node, launching one if needed.
///
/// Existing nodes are scored in insertion order. Only when none of them
/// fits is one fresh candidate per launchable type scored, in name order.
/// A strictly higher score is needed to replace the current best.
fn place_one(ctx: &mut ScheduleContext, request: &ResourceRequest, reason: &str) -> bool {
    let single = std::slice::from_ref(request);
    let mut best: Option<(Target, UtilizationScore)> = None;

    for (index, node) in ctx.nodes().iter().enumerate() {
        if !node.is_active() {
            continue;
        }
        let mut trial = node.clone();
        let (remaining, score) = trial.try_schedule(single);
        if remaining.is_empty() && best.as_ref().is_none_or(|(_, s)| score > *s) {
            best = Some((Target::Existing(index), score));
        }
    }

    if best.is_none() {
        best = best_fresh(ctx, single, reason);
    }

    match best {
        Some((Target::Existing(index), _)) => {
            let (remaining, _) = ctx.nodes_mut()[index].try_schedule(single);
            remaining.is_empty()
        }
        Some((Target::Fresh(machine_type), _)) => {
            let Some(mut node) = ctx.candidate(&machine_type, reason) else {
                return false;
            };
            let (remaining, _) = node.try_schedule(single);
            remaining.is_empty() && ctx.launch_node(node).is_some()
        }
        None => false,
    }
}

fn best_fresh(
    ctx: &ScheduleContext,
    single: &[ResourceRequest],
    reason: &str,
) -> Option<(Target, UtilizationScore)> {
    let mut best: Option<(Target, UtilizationScore)> = None;
    for machine_type in ctx.launchable_types() {
        let Some(mut trial) = ctx.candidate(&machine_type, reason) else {
            continue;
        };
        let (remaining, score) = trial.try_schedule(single);
        if remaining.is_empty() && best.as_ref().is_none_or(|(_, s)| score > *s) {
            best = Some((Target::Fresh(machine_type), score));
        }
    }
    best
}

fn expand(requests: &[ResourceRequestByCount]) -> Vec<ResourceRequest> {
    requests.iter().flat_map(ResourceRequestByCount::expand).collect()
}

/// Sort requests for packing. Both orders are stable.
pub fn order_requests(mut requests: Vec<ResourceRequest>, order: RequestOrder) -> Vec<ResourceRequest> {
    if order == RequestOrder::Footprint {
        requests.sort_by(|a, b| {
            let a_types = resources::nonzero_keys(&a.resources).count();
            let b_types = resources::nonzero_keys(&b.resources).count();
            b_types.cmp(&a_types).then_with(|| {
                resources::total_quantity(&b.resources).total_cmp(&resources::total_quantity(&a.resources))
            })
        });
    }
    requests
}

/// Group `ToLaunch` nodes into one request per machine type.
fn launch_plan(ctx: &ScheduleContext) -> Vec<LaunchRequest> {
    let mut counts: BTreeMap<MachineType, u32> = BTreeMap::new();
    for node in ctx.nodes() {
        if node.status == SchedulingNodeStatus::ToLaunch {
            *counts.entry(node.machine_type.clone()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .map(|(machine_type, count)| LaunchRequest {
            request_id: launch_request_id(&machine_type, count, ctx.now_ms()),
            machine_type,
            count,
            requested_at_ms: ctx.now_ms(),
        })
        .collect()
}
