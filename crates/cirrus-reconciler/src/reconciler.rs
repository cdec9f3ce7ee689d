//! Reconciler — advances the instance state machine once per tick.
//!
//! A tick is two calls:
//!
//! - [`Reconciler::sync_from`] folds already-fetched external state into
//!   instance statuses. It has no side effects beyond the store.
//! - [`Reconciler::step_next`] runs the scheduler and turns its plan into
//!   transitions plus the launch/terminate/install/drain requests the
//!   driver hands to the adapters.
//!
//! Both read every record, work on a copy, and commit the changes as one
//! versioned batch. A failure anywhere leaves the store as it was.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use cirrus_core::{
    AutoscalerConfig, ClusterSnapshot, DrainRequest, InstallRequest, InstanceId, LaunchRequest,
    MachineType, MachineTypeConfig, RequestOrder, RuntimeNodeStatus, TerminateRequest,
    TerminationReason, TickActions,
};
use cirrus_scheduler::{DemandScheduler, SchedulingRequest, launch_request_id};
use cirrus_state::{Instance, InstanceBatch, InstanceEvent, InstanceStatus, InstanceStore};

use crate::error::{ReconcileError, ReconcileResult};

/// Apply `event`, logging the hop. Returns false for an illegal event.
fn transition(instance: &mut Instance, event: &InstanceEvent, now_ms: u64) -> bool {
    let from = instance.status;
    if !instance.apply(event, now_ms) {
        return false;
    }
    debug!(
        instance = %instance.id,
        %from,
        to = %instance.status,
        event = event.name(),
        "instance transition"
    );
    true
}

/// Everything `step_next` changes before it commits.
struct Tick {
    instances: Vec<Instance>,
    deletes: Vec<(InstanceId, u64)>,
    actions: TickActions,
    /// Instances already moved this tick; later steps leave them alone.
    touched: BTreeSet<InstanceId>,
    now_ms: u64,
}

impl Tick {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.id == id)
    }

    fn is_touched(&self, index: usize) -> bool {
        self.touched.contains(&self.instances[index].id)
    }

    fn apply(&mut self, index: usize, event: &InstanceEvent) -> bool {
        let instance = &mut self.instances[index];
        if !transition(instance, event, self.now_ms) {
            return false;
        }
        self.touched.insert(instance.id.clone());
        true
    }

    /// Move a cloud-backed instance to TERMINATING and emit the request.
    fn terminate(&mut self, index: usize, reason: TerminationReason) -> bool {
        let instance = &self.instances[index];
        let Some(cloud_instance_id) = instance.cloud_instance_id.clone() else {
            return false;
        };
        let request_id = format!(
            "terminate-{}-{}",
            instance.id,
            instance.termination_attempts + 1
        );
        let event = InstanceEvent::TerminateRequested {
            request_id: request_id.clone(),
            reason,
        };
        if !self.apply(index, &event) {
            return false;
        }
        let instance = &self.instances[index];
        info!(
            instance = %instance.id,
            cloud_instance = %cloud_instance_id,
            %reason,
            "terminating instance"
        );
        self.actions.terminate.push(TerminateRequest {
            request_id,
            cloud_instance_id,
            machine_type: instance.machine_type.clone(),
            instance_id: Some(instance.id.clone()),
            reason,
        });
        true
    }
}

/// Drives instance records from observed and decided events.
#[derive(Debug, Clone)]
pub struct Reconciler {
    machine_types: BTreeMap<MachineType, MachineTypeConfig>,
    config_hashes: BTreeMap<MachineType, String>,
    max_worker_nodes: Option<u32>,
    idle_timeout_ms: u64,
    request_timeout_ms: u64,
    max_concurrent_launches: Option<u32>,
    max_launch_attempts: u32,
    max_termination_attempts: u32,
    request_order: RequestOrder,
}

impl Reconciler {
    /// Build a reconciler from a validated config.
    pub fn new(config: &AutoscalerConfig) -> ReconcileResult<Self> {
        config.validate()?;
        let machine_types: BTreeMap<MachineType, MachineTypeConfig> = config
            .machine_types
            .iter()
            .map(|(name, m)| {
                let m = MachineTypeConfig {
                    name: name.clone(),
                    ..m.clone()
                };
                (name.clone(), m)
            })
            .collect();
        let config_hashes = machine_types
            .iter()
            .map(|(name, m)| (name.clone(), m.config_hash()))
            .collect();
        Ok(Self {
            machine_types,
            config_hashes,
            max_worker_nodes: config.max_worker_nodes,
            idle_timeout_ms: config.idle_timeout_ms()?,
            request_timeout_ms: config.request_timeout_ms()?,
            max_concurrent_launches: config.max_concurrent_launches,
            max_launch_attempts: config.max_launch_attempts(),
            max_termination_attempts: config.max_termination_attempts(),
            request_order: config.request_order.unwrap_or_default(),
        })
    }

    pub fn machine_types(&self) -> &BTreeMap<MachineType, MachineTypeConfig> {
        &self.machine_types
    }

    /// True when the instance was launched from a config that is gone or changed.
    fn is_outdated(&self, instance: &Instance) -> bool {
        self.config_hashes
            .get(&instance.machine_type)
            .is_none_or(|hash| *hash != instance.config_hash)
    }

    // ── Passive pass ───────────────────────────────────────────────

    /// Merge external state into instance statuses.
    ///
    /// The rules run in priority order, each over every instance, and each
    /// sees what the earlier ones did. A second call with the same snapshot
    /// finds nothing left to do. Returns the number of records updated.
    pub fn sync_from<S: InstanceStore + ?Sized>(
        &self,
        store: &S,
        snapshot: &ClusterSnapshot,
    ) -> ReconcileResult<usize> {
        let original = store.get_all()?;
        let mut instances = original.clone();
        let dropped = apply_observations(&mut instances, snapshot);

        let batch = build_batch(&original, instances, Vec::new())?;
        let updated = batch.upserts.len();
        store.apply(&batch)?;
        if updated > 0 {
            info!(updated, dropped_errors = dropped, "synced instances from cluster state");
        }
        Ok(updated)
    }

    // ── Active pass ────────────────────────────────────────────────

    /// Decide the next moves and the side effects that go with them.
    ///
    /// The returned actions are only valid once this call has committed;
    /// on error nothing was written and nothing should be dispatched.
    pub fn step_next<S, D>(
        &self,
        store: &S,
        snapshot: &ClusterSnapshot,
        scheduler: &D,
    ) -> ReconcileResult<TickActions>
    where
        S: InstanceStore + ?Sized,
        D: DemandScheduler + ?Sized,
    {
        let original = store.get_all()?;
        let mut tick = Tick {
            instances: original.clone(),
            deletes: Vec::new(),
            actions: TickActions::default(),
            touched: BTreeSet::new(),
            now_ms: snapshot.observed_at_ms,
        };

        self.housekeeping(&mut tick);
        self.terminate_extras(&mut tick, snapshot);
        let drains = self.apply_schedule(&mut tick, snapshot, scheduler);
        self.request_launches(&mut tick);
        self.request_installs(&mut tick);
        self.request_drains(&mut tick, drains);

        let batch = build_batch(&original, tick.instances, tick.deletes)?;
        store.apply(&batch)?;

        let actions = tick.actions;
        if !actions.is_empty() {
            info!(
                launch = actions.launch.len(),
                terminate = actions.terminate.len(),
                install = actions.install.len(),
                drain = actions.drain.len(),
                "tick decided actions"
            );
        }
        Ok(actions)
    }

    /// Retries, timeouts and purging of finished records.
    fn housekeeping(&self, tick: &mut Tick) {
        let mut index = 0;
        while index < tick.instances.len() {
            if tick.instances[index].status.is_terminal() {
                let done = tick.instances.remove(index);
                debug!(instance = %done.id, "purging terminated instance");
                tick.deletes.push((done.id, done.version));
            } else {
                index += 1;
            }
        }

        for index in 0..tick.instances.len() {
            let instance = &tick.instances[index];
            match instance.status {
                InstanceStatus::AllocationFailed => {
                    if instance.launch_attempts < self.max_launch_attempts {
                        tick.apply(index, &InstanceEvent::Requeued);
                    } else {
                        warn!(
                            instance = %instance.id,
                            attempts = instance.launch_attempts,
                            "launch attempts exhausted, giving up"
                        );
                        tick.apply(index, &InstanceEvent::Abandoned { reason: None });
                    }
                }
                InstanceStatus::TerminationFailed => {
                    if instance.termination_attempts >= self.max_termination_attempts {
                        warn!(
                            instance = %instance.id,
                            attempts = instance.termination_attempts,
                            "termination attempts exhausted"
                        );
                        continue;
                    }
                    let reason = instance
                        .termination_reason
                        .unwrap_or(TerminationReason::OutdatedConfig);
                    tick.terminate(index, reason);
                }
                InstanceStatus::Requested
                    if instance.time_in_status_ms(tick.now_ms) >= self.request_timeout_ms =>
                {
                    warn!(
                        instance = %instance.id,
                        request = instance.launch_request_id.as_deref().unwrap_or("-"),
                        "launch request timed out"
                    );
                    tick.apply(index, &InstanceEvent::LaunchFailed);
                }
                InstanceStatus::RayInstalling
                    if instance.time_in_status_ms(tick.now_ms) >= self.request_timeout_ms =>
                {
                    warn!(instance = %instance.id, "runtime install timed out");
                    tick.apply(index, &InstanceEvent::InstallFailed);
                }
                InstanceStatus::RayStopping
                    if instance.time_in_status_ms(tick.now_ms) >= self.request_timeout_ms =>
                {
                    warn!(
                        instance = %instance.id,
                        node = instance.runtime_node_id.as_deref().unwrap_or("-"),
                        "drain timed out"
                    );
                    tick.apply(index, &InstanceEvent::RuntimeStopped);
                }
                _ => {}
            }
        }
    }

    /// Step 1: leaked, outdated, stopped and install-failed machines.
    fn terminate_extras(&self, tick: &mut Tick, snapshot: &ClusterSnapshot) {
        let referenced: BTreeSet<&str> = tick
            .instances
            .iter()
            .filter_map(|i| i.cloud_instance_id.as_deref())
            .collect();
        let awaiting: BTreeSet<&str> = tick
            .instances
            .iter()
            .filter(|i| i.status.awaits_allocation())
            .map(|i| i.machine_type.as_str())
            .collect();
        let leaked: Vec<TerminateRequest> = snapshot
            .cloud_instances
            .iter()
            .filter(|(cid, cloud)| {
                !referenced.contains(cid.as_str()) && !awaiting.contains(cloud.machine_type.as_str())
            })
            .map(|(cid, cloud)| TerminateRequest {
                request_id: format!("terminate-leaked-{cid}"),
                cloud_instance_id: cid.clone(),
                machine_type: cloud.machine_type.clone(),
                instance_id: None,
                reason: TerminationReason::Leaked,
            })
            .collect();
        for request in leaked {
            warn!(
                cloud_instance = %request.cloud_instance_id,
                machine_type = %request.machine_type,
                "terminating leaked cloud instance"
            );
            tick.actions.terminate.push(request);
        }

        for index in 0..tick.instances.len() {
            if tick.is_touched(index) {
                continue;
            }
            let instance = &tick.instances[index];
            let outdated = self.is_outdated(instance);
            match instance.status {
                InstanceStatus::Queued if outdated => {
                    info!(instance = %instance.id, "dropping queued instance with outdated config");
                    tick.apply(
                        index,
                        &InstanceEvent::Abandoned {
                            reason: Some(TerminationReason::OutdatedConfig),
                        },
                    );
                }
                InstanceStatus::Allocated
                | InstanceStatus::RayInstalling
                | InstanceStatus::RayRunning
                    if outdated =>
                {
                    tick.terminate(index, TerminationReason::OutdatedConfig);
                }
                InstanceStatus::RayStopped => {
                    let reason = instance
                        .termination_reason
                        .unwrap_or(TerminationReason::RuntimeStopped);
                    tick.terminate(index, reason);
                }
                InstanceStatus::RayInstallFailed => {
                    tick.terminate(index, TerminationReason::InstallFailed);
                }
                _ => {}
            }
        }
    }

    /// Step 2: run the scheduler, queue new instances, apply its terminations.
    ///
    /// Returns the instances to drain in step 5.
    fn apply_schedule<D: DemandScheduler + ?Sized>(
        &self,
        tick: &mut Tick,
        snapshot: &ClusterSnapshot,
        scheduler: &D,
    ) -> Vec<InstanceId> {
        let request = SchedulingRequest {
            machine_types: self.machine_types.clone(),
            max_worker_nodes: self.max_worker_nodes,
            idle_timeout_ms: Some(self.idle_timeout_ms),
            request_order: self.request_order,
            current_instances: tick.instances.clone(),
            runtime_nodes: snapshot.runtime_nodes.clone(),
            now_ms: tick.now_ms,
            ..SchedulingRequest::default()
        }
        .with_demand(&snapshot.demand);
        let reply = scheduler.schedule(&request);

        if reply.has_infeasible() {
            warn!(
                requests = reply.infeasible_resource_requests.len(),
                gangs = reply.infeasible_gang_resource_requests.len(),
                constraints = reply.infeasible_cluster_resource_constraints.len(),
                "demand cannot be met by any machine type"
            );
        }

        for launch in &reply.to_launch {
            let Some(hash) = self.config_hashes.get(&launch.machine_type) else {
                warn!(machine_type = %launch.machine_type, "scheduler chose unknown machine type");
                continue;
            };
            for n in 0..launch.count {
                let id = format!("{}-{n}", launch.request_id);
                tick.instances.push(Instance::queued(
                    id,
                    launch.machine_type.clone(),
                    hash.clone(),
                    tick.now_ms,
                ));
            }
            info!(machine_type = %launch.machine_type, count = launch.count, "queued new instances");
        }

        let mut drains = Vec::new();
        for (id, reason) in &reply.to_terminate {
            let Some(index) = tick.index_of(id) else {
                warn!(instance = %id, "scheduler chose unknown instance");
                continue;
            };
            if tick.is_touched(index) {
                continue;
            }
            let instance = &tick.instances[index];
            match instance.status {
                InstanceStatus::RayRunning
                    if *reason == TerminationReason::IdleTerminate
                        && instance.runtime_node_id.is_some() =>
                {
                    drains.push(id.clone());
                }
                status if status.holds_cloud_instance() => {
                    tick.terminate(index, *reason);
                }
                InstanceStatus::Queued => {
                    tick.apply(index, &InstanceEvent::Abandoned { reason: Some(*reason) });
                }
                status => {
                    debug!(instance = %id, %status, %reason, "termination deferred until allocated");
                }
            }
        }
        drains
    }

    /// Step 3: QUEUED → REQUESTED, oldest first, batched per machine type.
    fn request_launches(&self, tick: &mut Tick) {
        let in_flight = tick
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Requested)
            .count();
        let allowed = self
            .max_concurrent_launches
            .map_or(usize::MAX, |max| (max as usize).saturating_sub(in_flight));

        let mut queued: Vec<usize> = (0..tick.instances.len())
            .filter(|&i| tick.instances[i].status == InstanceStatus::Queued && !tick.is_touched(i))
            .collect();
        queued.sort_by(|&a, &b| {
            let (a, b) = (&tick.instances[a], &tick.instances[b]);
            a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id))
        });
        if queued.len() > allowed {
            debug!(queued = queued.len(), allowed, "launches throttled");
            queued.truncate(allowed);
        }

        let mut by_type: BTreeMap<MachineType, Vec<usize>> = BTreeMap::new();
        for index in queued {
            by_type
                .entry(tick.instances[index].machine_type.clone())
                .or_default()
                .push(index);
        }

        for (machine_type, indices) in by_type {
            let count = indices.len() as u32;
            let request_id = launch_request_id(&machine_type, count, tick.now_ms);
            for index in indices {
                tick.apply(
                    index,
                    &InstanceEvent::LaunchRequested {
                        request_id: request_id.clone(),
                    },
                );
            }
            info!(%machine_type, count, request = %request_id, "requesting launch");
            tick.actions.launch.push(LaunchRequest {
                machine_type,
                count,
                request_id,
                requested_at_ms: tick.now_ms,
            });
        }
    }

    /// Step 4: ALLOCATED → RAY_INSTALLING for manually installed types.
    fn request_installs(&self, tick: &mut Tick) {
        for index in 0..tick.instances.len() {
            let instance = &tick.instances[index];
            let manual = self
                .machine_types
                .get(&instance.machine_type)
                .is_some_and(|m| m.manual_install);
            if instance.status != InstanceStatus::Allocated || !manual || tick.is_touched(index) {
                continue;
            }
            let Some(cloud_instance_id) = instance.cloud_instance_id.clone() else {
                continue;
            };
            let request = InstallRequest {
                instance_id: instance.id.clone(),
                cloud_instance_id,
                machine_type: instance.machine_type.clone(),
            };
            if tick.apply(index, &InstanceEvent::InstallStarted) {
                tick.actions.install.push(request);
            }
        }
    }

    /// Step 5: RAY_RUNNING → RAY_STOPPING for idle nodes.
    fn request_drains(&self, tick: &mut Tick, drains: Vec<InstanceId>) {
        let reason = TerminationReason::IdleTerminate;
        for id in drains {
            let Some(index) = tick.index_of(&id) else {
                continue;
            };
            let Some(runtime_node_id) = tick.instances[index].runtime_node_id.clone() else {
                continue;
            };
            if tick.apply(index, &InstanceEvent::DrainRequested { reason }) {
                info!(instance = %id, node = %runtime_node_id, "draining idle node");
                tick.actions.drain.push(DrainRequest {
                    instance_id: id,
                    runtime_node_id,
                    reason,
                });
            }
        }
    }
}

/// Pair cloud instances with instances awaiting allocation.
///
/// Tagged request ids are matched first, then any free cloud instance of
/// the same machine type, both in id order.
fn allocate(instances: &mut [Instance], snapshot: &ClusterSnapshot, now_ms: u64) {
    let mut assigned: BTreeSet<String> = instances
        .iter()
        .filter(|i| !i.status.is_terminal())
        .filter_map(|i| i.cloud_instance_id.clone())
        .collect();

    for exact in [true, false] {
        for instance in instances.iter_mut() {
            if !instance.status.awaits_allocation() || instance.cloud_instance_id.is_some() {
                continue;
            }
            let Some(request_id) = instance.launch_request_id.as_deref() else {
                continue;
            };
            let found = snapshot.cloud_instances.iter().find(|(cid, cloud)| {
                !assigned.contains(cid.as_str())
                    && cloud.machine_type == instance.machine_type
                    && (!exact || cloud.launch_request_id.as_deref() == Some(request_id))
            });
            let Some((cid, _)) = found else {
                continue;
            };
            let event = InstanceEvent::CloudAllocated {
                cloud_instance_id: cid.clone(),
            };
            if transition(instance, &event, now_ms) {
                assigned.insert(cid.clone());
            }
        }
    }
}

/// Run the sync rules in priority order over every instance.
///
/// Returns how many reported errors no rule consumed.
fn apply_observations(instances: &mut [Instance], snapshot: &ClusterSnapshot) -> usize {
    let now = snapshot.observed_at_ms;

    allocate(instances, snapshot, now);
    let mut consumed: BTreeSet<&str> = BTreeSet::new();

    // Launch errors.
    for instance in instances.iter_mut() {
        if instance.status != InstanceStatus::Requested {
            continue;
        }
        let Some(error) = instance.launch_request_id.as_deref().and_then(|rid| {
            snapshot.provider_errors.iter().find(|e| e.request_id == rid)
        }) else {
            continue;
        };
        warn!(
            instance = %instance.id,
            request = %error.request_id,
            message = %error.message,
            "launch failed"
        );
        if transition(instance, &InstanceEvent::LaunchFailed, now) {
            consumed.insert(error.request_id.as_str());
        }
    }

    // Runtime joined.
    for instance in instances.iter_mut() {
        let Some(node) = instance.cloud_instance_id.as_deref().and_then(|cid| {
            snapshot
                .runtime_nodes
                .iter()
                .find(|n| n.cloud_instance_id.as_deref() == Some(cid) && n.status.is_alive())
        }) else {
            continue;
        };
        let event = InstanceEvent::RuntimeJoined {
            runtime_node_id: node.node_id.clone(),
        };
        transition(instance, &event, now);
    }

    // Cloud instance gone.
    for instance in instances.iter_mut() {
        let gone = instance.status.holds_cloud_instance()
            && instance
                .cloud_instance_id
                .as_ref()
                .is_some_and(|cid| !snapshot.cloud_instances.contains_key(cid));
        if gone {
            transition(instance, &InstanceEvent::CloudGone, now);
        }
    }

    // Termination errors.
    for instance in instances.iter_mut() {
        if instance.status != InstanceStatus::Terminating {
            continue;
        }
        let Some(error) = instance.terminate_request_id.as_deref().and_then(|rid| {
            snapshot.provider_errors.iter().find(|e| e.request_id == rid)
        }) else {
            continue;
        };
        warn!(
            instance = %instance.id,
            request = %error.request_id,
            message = %error.message,
            "termination failed"
        );
        if transition(instance, &InstanceEvent::TerminationFailed, now) {
            consumed.insert(error.request_id.as_str());
        }
    }

    // Runtime stopped.
    for instance in instances.iter_mut() {
        let Some(cid) = instance.cloud_instance_id.as_deref() else {
            continue;
        };
        let nodes: Vec<_> = snapshot
            .runtime_nodes
            .iter()
            .filter(|n| n.cloud_instance_id.as_deref() == Some(cid))
            .collect();
        // A drained node may simply vanish from the runtime's list.
        let stopped = if nodes.is_empty() {
            instance.status == InstanceStatus::RayStopping
        } else {
            nodes.iter().all(|n| n.status == RuntimeNodeStatus::Dead)
        };
        if stopped {
            transition(instance, &InstanceEvent::RuntimeStopped, now);
        }
    }

    // Install errors.
    let mut installs_consumed: BTreeSet<&str> = BTreeSet::new();
    for instance in instances.iter_mut() {
        if instance.status != InstanceStatus::RayInstalling {
            continue;
        }
        if let Some(error) = snapshot
            .install_errors
            .iter()
            .find(|e| e.instance_id == instance.id)
        {
            warn!(instance = %instance.id, message = %error.message, "runtime install failed");
            if transition(instance, &InstanceEvent::InstallFailed, now) {
                installs_consumed.insert(error.instance_id.as_str());
            }
        }
    }

    log_unmatched_errors(snapshot, &consumed, &installs_consumed)
}

/// Warn about reported errors that no sync rule consumed.
fn log_unmatched_errors(
    snapshot: &ClusterSnapshot,
    consumed: &BTreeSet<&str>,
    installs_consumed: &BTreeSet<&str>,
) -> usize {
    let mut dropped = 0;
    for error in &snapshot.provider_errors {
        if !consumed.contains(error.request_id.as_str()) {
            dropped += 1;
            warn!(
                request = %error.request_id,
                machine_type = %error.machine_type,
                message = %error.message,
                "dropping provider error with no in-flight request"
            );
        }
    }
    for error in &snapshot.install_errors {
        if !installs_consumed.contains(error.instance_id.as_str()) {
            dropped += 1;
            warn!(
                instance = %error.instance_id,
                message = %error.message,
                "dropping install error for instance not installing"
            );
        }
    }
    dropped
}

/// Diff the working copy against what was read, checking every changed record.
fn build_batch(
    original: &[Instance],
    instances: Vec<Instance>,
    deletes: Vec<(InstanceId, u64)>,
) -> ReconcileResult<InstanceBatch> {
    let before: BTreeMap<&str, &Instance> = original.iter().map(|i| (i.id.as_str(), i)).collect();
    let mut upserts = Vec::new();
    for instance in instances {
        if before.get(instance.id.as_str()) == Some(&&instance) {
            continue;
        }
        instance.check_invariants().map_err(ReconcileError::Invariant)?;
        upserts.push(instance);
    }
    Ok(InstanceBatch { upserts, deletes })
}
