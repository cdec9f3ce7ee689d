//! Autoscaler — the control loop around the reconciler.
//!
//! Each tick fetches snapshots from the adapters, runs `sync_from` then
//! `step_next`, and hands the decided actions back to the adapters. A
//! failed tick commits nothing; the next one starts from fresh snapshots.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use cirrus_core::{ClusterSnapshot, TickActions};
use cirrus_scheduler::{DemandScheduler, ResourceDemandScheduler};
use cirrus_state::InstanceStore;

use crate::adapter::{CloudProvider, Installer, RuntimeMonitor};
use crate::error::{ReconcileError, ReconcileResult};
use crate::reconciler::Reconciler;

/// Owns the store, the scheduler and the adapters for one cluster.
pub struct Autoscaler<S, P, R, I, D = ResourceDemandScheduler> {
    store: S,
    reconciler: Reconciler,
    scheduler: D,
    provider: P,
    runtime: R,
    installer: I,
}

impl<S, P, R, I> Autoscaler<S, P, R, I, ResourceDemandScheduler> {
    /// Create an autoscaler with the default bin-packing scheduler.
    pub fn new(store: S, reconciler: Reconciler, provider: P, runtime: R, installer: I) -> Self {
        Self {
            store,
            reconciler,
            scheduler: ResourceDemandScheduler::new(),
            provider,
            runtime,
            installer,
        }
    }
}

impl<S, P, R, I, D> Autoscaler<S, P, R, I, D>
where
    S: InstanceStore,
    P: CloudProvider,
    R: RuntimeMonitor,
    I: Installer,
    D: DemandScheduler,
{
    /// Swap in a different scheduler.
    pub fn with_scheduler<D2: DemandScheduler>(self, scheduler: D2) -> Autoscaler<S, P, R, I, D2> {
        Autoscaler {
            store: self.store,
            reconciler: self.reconciler,
            scheduler,
            provider: self.provider,
            runtime: self.runtime,
            installer: self.installer,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetch one snapshot of the cluster.
    ///
    /// Without the cloud view every instance would look gone, so that
    /// failure aborts the tick. Other failures degrade to empty data.
    pub async fn observe(&self) -> ReconcileResult<ClusterSnapshot> {
        let cloud_instances = self
            .provider
            .get_non_terminated()
            .await
            .map_err(|e| ReconcileError::Observe(e.to_string()))?;

        let provider_errors = self.provider.poll_errors().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to poll provider errors");
            Vec::new()
        });
        let install_errors = self.installer.poll_errors().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to poll install errors");
            Vec::new()
        });
        let runtime_nodes = self.runtime.node_states().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to fetch runtime node states");
            Vec::new()
        });
        let demand = self.runtime.pending_demand().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to fetch pending demand");
            Default::default()
        });

        Ok(ClusterSnapshot {
            cloud_instances,
            runtime_nodes,
            provider_errors,
            install_errors,
            demand,
            observed_at_ms: epoch_ms(),
        })
    }

    /// Run one full reconcile tick and dispatch its actions.
    pub async fn tick(&self) -> ReconcileResult<TickActions> {
        let snapshot = self.observe().await?;
        self.reconciler.sync_from(&self.store, &snapshot)?;
        let actions = self
            .reconciler
            .step_next(&self.store, &snapshot, &self.scheduler)?;
        self.dispatch(&actions).await;
        Ok(actions)
    }

    /// Hand actions to the adapters. Failures are logged; the state
    /// machine notices them through timeouts and reported errors.
    async fn dispatch(&self, actions: &TickActions) {
        for request in &actions.terminate {
            if let Err(e) = self.provider.terminate(request).await {
                warn!(
                    cloud_instance = %request.cloud_instance_id,
                    request = %request.request_id,
                    error = %e,
                    "terminate request failed"
                );
            }
        }
        for request in &actions.drain {
            if let Err(e) = self.runtime.drain(request).await {
                warn!(node = %request.runtime_node_id, error = %e, "drain request failed");
            }
        }
        for request in &actions.install {
            if let Err(e) = self.installer.install(request).await {
                warn!(instance = %request.instance_id, error = %e, "install request failed");
            }
        }
        for request in &actions.launch {
            if let Err(e) = self.provider.launch(request).await {
                warn!(
                    machine_type = %request.machine_type,
                    count = request.count,
                    request = %request.request_id,
                    error = %e,
                    "launch request failed"
                );
            }
        }
    }

    /// Run the autoscaler loop until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
