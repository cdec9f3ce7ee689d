//! Dry-run planning over a cluster file.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

use cirrus_core::{AutoscalerConfig, ClusterSnapshot, TickActions};
use cirrus_reconciler::Reconciler;
use cirrus_scheduler::{DemandScheduler, ResourceDemandScheduler, SchedulingReply, SchedulingRequest};
use cirrus_state::{Instance, InstanceStore, StateStore};

/// Contents of a `--snapshot` file.
#[derive(Debug, Default, Deserialize)]
pub struct PlanInput {
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub snapshot: ClusterSnapshot,
}

pub fn load_input(path: &Path) -> anyhow::Result<PlanInput> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let input: PlanInput = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    debug!(
        instances = input.instances.len(),
        cloud_instances = input.snapshot.cloud_instances.len(),
        runtime_nodes = input.snapshot.runtime_nodes.len(),
        "loaded cluster file"
    );
    Ok(input)
}

/// One scheduler pass over the given instances and demand.
pub fn schedule(config: &AutoscalerConfig, input: &PlanInput) -> anyhow::Result<SchedulingReply> {
    let request = SchedulingRequest {
        current_instances: input.instances.clone(),
        runtime_nodes: input.snapshot.runtime_nodes.clone(),
        now_ms: input.snapshot.observed_at_ms,
        ..SchedulingRequest::from_config(config)?
    }
    .with_demand(&input.snapshot.demand);
    Ok(ResourceDemandScheduler::new().schedule(&request))
}

/// A full reconcile tick against a throwaway in-memory store.
pub fn tick(config: &AutoscalerConfig, input: &PlanInput) -> anyhow::Result<TickActions> {
    let reconciler = Reconciler::new(config)?;
    let store = StateStore::open_in_memory()?;
    for instance in &input.instances {
        // Exported records carry their old store version; seed them fresh.
        let fresh = Instance {
            version: 0,
            ..instance.clone()
        };
        store.upsert(&fresh)?;
    }
    reconciler.sync_from(&store, &input.snapshot)?;
    let actions = reconciler.step_next(&store, &input.snapshot, &ResourceDemandScheduler::new())?;
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use cirrus_state::InstanceEvent;

    const CONFIG: &str = r#"
[machine_types.m1]
min_worker_nodes = 1
max_worker_nodes = 3
resources = { CPU = 4.0 }
"#;

    const CLUSTER: &str = r#"{
  "snapshot": {
    "demand": {
      "resource_requests": [
        { "request": { "resources": { "CPU": 4.0 } }, "count": 2 }
      ]
    },
    "observed_at_ms": 1000
  }
}"#;

    fn write_cluster(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_input_defaults_missing_sections() {
        let file = write_cluster("{}");
        let input = load_input(file.path()).unwrap();
        assert!(input.instances.is_empty());
        assert_eq!(input.snapshot, ClusterSnapshot::default());
    }

    #[test]
    fn load_input_reports_bad_json() {
        let file = write_cluster("{ not json");
        let err = load_input(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[test]
    fn schedule_launches_for_demand() {
        let config = AutoscalerConfig::from_toml_str(CONFIG).unwrap();
        let input = load_input(write_cluster(CLUSTER).path()).unwrap();

        let reply = schedule(&config, &input).unwrap();

        assert_eq!(reply.launch_counts()["m1"], 2);
        assert_eq!(reply.to_launch[0].requested_at_ms, 1000);
        assert!(!reply.has_infeasible());
    }

    #[test]
    fn tick_accepts_exported_records() {
        let config = AutoscalerConfig::from_toml_str(CONFIG).unwrap();
        let hash = config.machine_types["m1"].config_hash();
        let mut running = Instance::queued("i-1".to_string(), "m1".to_string(), hash, 0);
        for event in [
            InstanceEvent::LaunchRequested {
                request_id: "r-1".to_string(),
            },
            InstanceEvent::CloudAllocated {
                cloud_instance_id: "c-1".to_string(),
            },
        ] {
            assert!(running.apply(&event, 1));
        }
        running.version = 3;
        let cluster = serde_json::json!({
            "instances": [running],
            "snapshot": {
                "cloud_instances": {
                    "c-1": { "cloud_instance_id": "c-1", "machine_type": "m1", "running": true }
                },
                "observed_at_ms": 1000
            }
        });
        let input = load_input(write_cluster(&cluster.to_string()).path()).unwrap();
        assert_eq!(input.instances[0].version, 3);

        let actions = tick(&config, &input).unwrap();

        // The allocated instance already covers the minimum.
        assert!(actions.launch.is_empty());
        assert!(actions.terminate.is_empty());
    }

    #[test]
    fn tick_requests_the_same_launches() {
        let config = AutoscalerConfig::from_toml_str(CONFIG).unwrap();
        let input = load_input(write_cluster(CLUSTER).path()).unwrap();

        let actions = tick(&config, &input).unwrap();

        assert_eq!(actions.launch.len(), 1);
        assert_eq!(actions.launch[0].count, 2);
        assert!(actions.terminate.is_empty());
    }
}
