//! Seams to the outside world.
//!
//! The reconciler only ever sees the data these return; the driver owns
//! the calls. Implementations may write `async fn` directly.

use std::collections::BTreeMap;
use std::future::Future;

use cirrus_core::{
    CloudInstance, ClusterDemand, DrainRequest, InstallError, InstallRequest, LaunchRequest,
    ProviderError, RuntimeNodeState, TerminateRequest,
};

/// Launches and terminates machines.
pub trait CloudProvider {
    fn launch(&self, request: &LaunchRequest) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn terminate(&self, request: &TerminateRequest) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Errors reported since the last poll.
    fn poll_errors(&self) -> impl Future<Output = anyhow::Result<Vec<ProviderError>>> + Send;

    /// Every cloud instance not yet terminated, keyed by cloud instance id.
    fn get_non_terminated(
        &self,
    ) -> impl Future<Output = anyhow::Result<BTreeMap<String, CloudInstance>>> + Send;
}

/// The compute runtime's view of the cluster.
pub trait RuntimeMonitor {
    fn node_states(&self) -> impl Future<Output = anyhow::Result<Vec<RuntimeNodeState>>> + Send;

    fn pending_demand(&self) -> impl Future<Output = anyhow::Result<ClusterDemand>> + Send;

    fn drain(&self, request: &DrainRequest) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Installs the runtime on machines that need it done by hand.
pub trait Installer {
    fn install(&self, request: &InstallRequest) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Failures reported since the last poll.
    fn poll_errors(&self) -> impl Future<Output = anyhow::Result<Vec<InstallError>>> + Send;
}
