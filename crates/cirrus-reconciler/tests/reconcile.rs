//! Reconciler ticks against an in-memory store.

use std::collections::BTreeMap;

use cirrus_core::*;
use cirrus_reconciler::{ReconcileError, Reconciler};
use cirrus_scheduler::ResourceDemandScheduler;
use cirrus_state::*;

fn config() -> AutoscalerConfig {
    AutoscalerConfig::from_toml_str(
        r#"
        idle_timeout = "60s"

        [machine_types.m1]
        max_worker_nodes = 2
        resources = { CPU = 4.0 }

        [machine_types.gpu]
        max_worker_nodes = 1
        resources = { CPU = 8.0, GPU = 1.0 }
        manual_install = true
        "#,
    )
    .unwrap()
}

fn reconciler() -> Reconciler {
    Reconciler::new(&config()).unwrap()
}

fn store_with(instances: &[Instance]) -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    for instance in instances {
        store.upsert(instance).unwrap();
    }
    store
}

fn get(store: &StateStore, id: &str) -> Instance {
    store.get_instance(id).unwrap().unwrap()
}

/// Build an instance by replaying events from QUEUED.
fn instance(id: &str, machine_type: &str, events: &[InstanceEvent]) -> Instance {
    let hash = reconciler().machine_types()[machine_type].config_hash();
    let mut inst = Instance::queued(id.to_string(), machine_type.to_string(), hash, 0);
    for (t, event) in events.iter().enumerate() {
        assert!(inst.apply(event, t as u64 + 1), "{} rejected {:?}", inst.status, event);
    }
    inst
}

fn launched(request_id: &str) -> InstanceEvent {
    InstanceEvent::LaunchRequested {
        request_id: request_id.to_string(),
    }
}

fn allocated(cloud_id: &str) -> InstanceEvent {
    InstanceEvent::CloudAllocated {
        cloud_instance_id: cloud_id.to_string(),
    }
}

fn joined(node_id: &str) -> InstanceEvent {
    InstanceEvent::RuntimeJoined {
        runtime_node_id: node_id.to_string(),
    }
}

fn running(id: &str, cloud_id: &str) -> Instance {
    instance(id, "m1", &[launched(&format!("r-{id}")), allocated(cloud_id), joined(&format!("n-{id}"))])
}

fn cloud(id: &str, machine_type: &str) -> (String, CloudInstance) {
    (
        id.to_string(),
        CloudInstance {
            cloud_instance_id: id.to_string(),
            machine_type: machine_type.to_string(),
            running: true,
            launch_request_id: None,
        },
    )
}

fn tagged(id: &str, machine_type: &str, request_id: &str) -> (String, CloudInstance) {
    let (id, mut instance) = cloud(id, machine_type);
    instance.launch_request_id = Some(request_id.to_string());
    (id, instance)
}

fn node(node_id: &str, cloud_id: &str, status: RuntimeNodeStatus, idle_ms: u64) -> RuntimeNodeState {
    RuntimeNodeState {
        node_id: node_id.to_string(),
        cloud_instance_id: Some(cloud_id.to_string()),
        total_resources: [("CPU".to_string(), 4.0)].into_iter().collect(),
        available_resources: [("CPU".to_string(), 4.0)].into_iter().collect(),
        labels: BTreeMap::new(),
        status,
        idle_duration_ms: idle_ms,
    }
}

fn provider_error(request_id: &str) -> ProviderError {
    ProviderError {
        request_id: request_id.to_string(),
        machine_type: "m1".to_string(),
        message: "capacity exhausted".to_string(),
    }
}

#[test]
fn scenario_d_provider_error_fails_only_its_launch() {
    let store = store_with(&[
        instance("a", "m1", &[launched("r-a")]),
        instance("b", "m1", &[launched("r-b")]),
    ]);
    let b_before = get(&store, "b");
    let snapshot = ClusterSnapshot {
        provider_errors: vec![provider_error("r-a")],
        ..ClusterSnapshot::default()
    };

    let updated = reconciler().sync_from(&store, &snapshot).unwrap();

    assert_eq!(updated, 1);
    assert_eq!(get(&store, "a").status, InstanceStatus::AllocationFailed);
    assert_eq!(get(&store, "b"), b_before);
}

#[test]
fn sync_is_idempotent() {
    let store = store_with(&[
        instance("queued", "m1", &[]),
        instance("requested", "m1", &[launched("r-1")]),
        instance("failing", "m1", &[launched("r-2")]),
        instance("allocated", "m1", &[launched("r-3"), allocated("c-3")]),
        running("running", "c-4"),
        running("stopping", "c-5"),
        running("vanished", "c-6"),
        instance(
            "installing",
            "gpu",
            &[launched("r-7"), allocated("c-7"), InstanceEvent::InstallStarted],
        ),
    ]);
    let snapshot = ClusterSnapshot {
        cloud_instances: [
            tagged("c-1", "m1", "r-1"),
            cloud("c-3", "m1"),
            cloud("c-4", "m1"),
            cloud("c-5", "m1"),
            cloud("c-7", "gpu"),
        ]
        .into_iter()
        .collect(),
        runtime_nodes: vec![
            node("n-3", "c-3", RuntimeNodeStatus::Running, 0),
            node("n-5", "c-5", RuntimeNodeStatus::Dead, 0),
        ],
        provider_errors: vec![provider_error("r-2"), provider_error("r-unknown")],
        install_errors: vec![InstallError {
            instance_id: "installing".to_string(),
            message: "apt failed".to_string(),
        }],
        observed_at_ms: 10_000,
        ..ClusterSnapshot::default()
    };
    let r = reconciler();

    assert!(r.sync_from(&store, &snapshot).unwrap() > 0);
    let after_first = store.get_all().unwrap();
    assert_eq!(r.sync_from(&store, &snapshot).unwrap(), 0);
    assert_eq!(store.get_all().unwrap(), after_first);

    let status = |id: &str| get(&store, id).status;
    assert_eq!(status("queued"), InstanceStatus::Queued);
    assert_eq!(status("requested"), InstanceStatus::Allocated);
    assert_eq!(get(&store, "requested").cloud_instance_id.as_deref(), Some("c-1"));
    assert_eq!(status("failing"), InstanceStatus::AllocationFailed);
    assert_eq!(status("allocated"), InstanceStatus::RayRunning);
    assert_eq!(status("running"), InstanceStatus::RayRunning);
    assert_eq!(status("stopping"), InstanceStatus::RayStopped);
    assert_eq!(status("vanished"), InstanceStatus::Terminated);
    assert_eq!(status("installing"), InstanceStatus::RayInstallFailed);
}

#[test]
fn sync_never_creates_or_deletes_records() {
    let store = store_with(&[running("a", "c-1")]);
    let snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-1", "m1"), cloud("c-2", "m1")].into_iter().collect(),
        ..ClusterSnapshot::default()
    };
    reconciler().sync_from(&store, &snapshot).unwrap();
    assert_eq!(store.get_all().unwrap().len(), 1);
}

#[test]
fn outdated_running_instance_is_terminated_and_purged() {
    let mut stale = running("a", "c-1");
    stale.config_hash = "sha256:previous".to_string();
    let store = store_with(&[stale]);
    let r = reconciler();
    let scheduler = ResourceDemandScheduler::new();
    let mut snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-1", "m1")].into_iter().collect(),
        runtime_nodes: vec![node("n-a", "c-1", RuntimeNodeStatus::Running, 0)],
        ..ClusterSnapshot::default()
    };

    let actions = r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert_eq!(actions.terminate.len(), 1);
    assert_eq!(actions.terminate[0].reason, TerminationReason::OutdatedConfig);
    assert_eq!(actions.terminate[0].instance_id.as_deref(), Some("a"));
    assert_eq!(get(&store, "a").status, InstanceStatus::Terminating);

    // The provider finished; the cloud instance is gone.
    snapshot.cloud_instances.clear();
    snapshot.runtime_nodes.clear();
    r.sync_from(&store, &snapshot).unwrap();
    assert_eq!(get(&store, "a").status, InstanceStatus::Terminated);

    r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert!(store.get_instance("a").unwrap().is_none());
}

#[test]
fn failed_termination_is_retried() {
    let store = store_with(&[running("a", "c-1")]);
    let r = reconciler();
    let scheduler = ResourceDemandScheduler::new();
    let mut snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-1", "m1")].into_iter().collect(),
        runtime_nodes: vec![node("n-a", "c-1", RuntimeNodeStatus::Dead, 0)],
        ..ClusterSnapshot::default()
    };

    r.sync_from(&store, &snapshot).unwrap();
    assert_eq!(get(&store, "a").status, InstanceStatus::RayStopped);

    let first = r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert_eq!(first.terminate.len(), 1);
    assert_eq!(first.terminate[0].reason, TerminationReason::RuntimeStopped);

    snapshot.provider_errors = vec![provider_error(&first.terminate[0].request_id)];
    r.sync_from(&store, &snapshot).unwrap();
    assert_eq!(get(&store, "a").status, InstanceStatus::TerminationFailed);

    let retry = r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert_eq!(retry.terminate.len(), 1);
    assert_ne!(retry.terminate[0].request_id, first.terminate[0].request_id);
    let a = get(&store, "a");
    assert_eq!(a.status, InstanceStatus::Terminating);
    assert_eq!(a.termination_attempts, 2);
}

#[test]
fn idle_node_is_drained_then_terminated() {
    let store = store_with(&[running("a", "c-1")]);
    let r = reconciler();
    let scheduler = ResourceDemandScheduler::new();
    let mut snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-1", "m1")].into_iter().collect(),
        runtime_nodes: vec![node("n-a", "c-1", RuntimeNodeStatus::Idle, 120_000)],
        ..ClusterSnapshot::default()
    };

    let actions = r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert_eq!(actions.drain.len(), 1);
    assert_eq!(actions.drain[0].runtime_node_id, "n-a");
    assert!(actions.terminate.is_empty());
    assert_eq!(get(&store, "a").status, InstanceStatus::RayStopping);

    // The runtime lets the node go.
    snapshot.runtime_nodes.clear();
    r.sync_from(&store, &snapshot).unwrap();
    assert_eq!(get(&store, "a").status, InstanceStatus::RayStopped);

    let actions = r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert_eq!(actions.terminate.len(), 1);
    assert_eq!(actions.terminate[0].reason, TerminationReason::IdleTerminate);
}

#[test]
fn instances_above_type_maximum_are_terminated() {
    let store = store_with(&[running("a", "c-1"), running("b", "c-2"), running("c", "c-3")]);
    let snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-1", "m1"), cloud("c-2", "m1"), cloud("c-3", "m1")]
            .into_iter()
            .collect(),
        runtime_nodes: vec![
            node("n-a", "c-1", RuntimeNodeStatus::Running, 0),
            node("n-b", "c-2", RuntimeNodeStatus::Running, 0),
            node("n-c", "c-3", RuntimeNodeStatus::Running, 0),
        ],
        ..ClusterSnapshot::default()
    };

    let actions = reconciler()
        .step_next(&store, &snapshot, &ResourceDemandScheduler::new())
        .unwrap();

    assert_eq!(actions.terminate.len(), 1);
    assert_eq!(
        actions.terminate[0].reason,
        TerminationReason::MaxWorkerNodesPerNodeType
    );
}

#[test]
fn demand_queues_and_requests_launches_in_one_tick() {
    let store = store_with(&[]);
    let snapshot = ClusterSnapshot {
        demand: ClusterDemand {
            resource_requests: vec![ResourceRequestByCount::new(
                ResourceRequest::from_pairs(&[("CPU", 3.0)]),
                2,
            )],
            ..ClusterDemand::default()
        },
        observed_at_ms: 7_000,
        ..ClusterSnapshot::default()
    };

    let actions = reconciler()
        .step_next(&store, &snapshot, &ResourceDemandScheduler::new())
        .unwrap();

    assert_eq!(actions.launch.len(), 1);
    assert_eq!(actions.launch[0].machine_type, "m1");
    assert_eq!(actions.launch[0].count, 2);
    let all = store.get_all().unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|i| i.status == InstanceStatus::Requested));
    assert!(all.iter().all(|i| i.launch_attempts == 1));
}

/// Lets another writer bump a record between read and commit.
struct RacingStore {
    inner: StateStore,
    victim: String,
}

impl InstanceStore for RacingStore {
    fn get_all(&self) -> StateResult<Vec<Instance>> {
        let all = self.inner.get_all()?;
        if let Some(mut victim) = self.inner.get_instance(&self.victim)? {
            victim.launch_attempts += 1;
            self.inner.upsert(&victim)?;
        }
        Ok(all)
    }

    fn upsert(&self, instance: &Instance) -> StateResult<Instance> {
        self.inner.upsert(instance)
    }

    fn apply(&self, batch: &InstanceBatch) -> StateResult<()> {
        self.inner.apply(batch)
    }
}

#[test]
fn conflicting_write_abandons_whole_sync() {
    let inner = store_with(&[
        instance("a", "m1", &[launched("r-a")]),
        instance("b", "m1", &[launched("r-b")]),
    ]);
    let store = RacingStore {
        inner: inner.clone(),
        victim: "b".to_string(),
    };
    let snapshot = ClusterSnapshot {
        provider_errors: vec![provider_error("r-a"), provider_error("r-b")],
        ..ClusterSnapshot::default()
    };

    let err = reconciler().sync_from(&store, &snapshot).unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::State(StateError::VersionConflict { .. })
    ));
    assert_eq!(get(&inner, "a").status, InstanceStatus::Requested);
    assert_eq!(get(&inner, "b").status, InstanceStatus::Requested);
}

#[test]
fn node_dying_before_join_is_reaped_and_replaced() {
    let store = store_with(&[instance("a", "m1", &[launched("r-a"), allocated("c-1")])]);
    let r = reconciler();
    let snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-1", "m1")].into_iter().collect(),
        runtime_nodes: vec![node("n-a", "c-1", RuntimeNodeStatus::Dead, 0)],
        demand: ClusterDemand {
            resource_requests: vec![ResourceRequestByCount::new(
                ResourceRequest::from_pairs(&[("CPU", 4.0)]),
                1,
            )],
            ..ClusterDemand::default()
        },
        ..ClusterSnapshot::default()
    };

    r.sync_from(&store, &snapshot).unwrap();
    assert_eq!(get(&store, "a").status, InstanceStatus::RayStopped);

    let actions = r
        .step_next(&store, &snapshot, &ResourceDemandScheduler::new())
        .unwrap();
    assert_eq!(actions.terminate.len(), 1);
    assert_eq!(actions.terminate[0].reason, TerminationReason::RuntimeStopped);
    assert_eq!(actions.launch.len(), 1);
    assert_eq!(actions.launch[0].machine_type, "m1");
}

#[test]
fn stalled_install_times_out_then_terminates() {
    let store = store_with(&[instance(
        "g",
        "gpu",
        &[launched("r-g"), allocated("c-7"), InstanceEvent::InstallStarted],
    )]);
    let r = reconciler();
    let scheduler = ResourceDemandScheduler::new();
    let snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-7", "gpu")].into_iter().collect(),
        observed_at_ms: 700_000,
        ..ClusterSnapshot::default()
    };

    let first = r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert!(first.terminate.is_empty());
    assert_eq!(get(&store, "g").status, InstanceStatus::RayInstallFailed);

    let second = r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert_eq!(second.terminate.len(), 1);
    assert_eq!(second.terminate[0].reason, TerminationReason::InstallFailed);
}

#[test]
fn lost_drain_times_out_then_terminates() {
    let drain = InstanceEvent::DrainRequested {
        reason: TerminationReason::IdleTerminate,
    };
    let store = store_with(&[instance(
        "a",
        "m1",
        &[launched("r-a"), allocated("c-1"), joined("n-a"), drain],
    )]);
    let r = reconciler();
    let scheduler = ResourceDemandScheduler::new();
    let snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-1", "m1")].into_iter().collect(),
        runtime_nodes: vec![node("n-a", "c-1", RuntimeNodeStatus::Running, 0)],
        observed_at_ms: 700_000,
        ..ClusterSnapshot::default()
    };

    r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert_eq!(get(&store, "a").status, InstanceStatus::RayStopped);

    let actions = r.step_next(&store, &snapshot, &scheduler).unwrap();
    assert_eq!(actions.terminate.len(), 1);
    assert_eq!(actions.terminate[0].reason, TerminationReason::IdleTerminate);
}

#[test]
fn recent_install_is_left_alone() {
    let store = store_with(&[instance(
        "g",
        "gpu",
        &[launched("r-g"), allocated("c-7"), InstanceEvent::InstallStarted],
    )]);
    let snapshot = ClusterSnapshot {
        cloud_instances: [cloud("c-7", "gpu")].into_iter().collect(),
        observed_at_ms: 60_000,
        ..ClusterSnapshot::default()
    };

    let actions = reconciler()
        .step_next(&store, &snapshot, &ResourceDemandScheduler::new())
        .unwrap();

    assert!(actions.is_empty());
    assert_eq!(get(&store, "g").status, InstanceStatus::RayInstalling);
}
