//! cirrus-core — shared types for the Cirrus cluster autoscaler.
//!
//! Everything the reconciler and the scheduler exchange with the outside
//! world lives here: resource shapes, demand, machine-type configs, the
//! already-fetched snapshots of the cloud provider and the compute
//! runtime, and the action records handed back to the adapters.
//!
//! # Modules
//!
//! - **`resources`** — resource maps and the arithmetic on them
//! - **`types`** — machine types, demand, termination reasons
//! - **`snapshot`** — external views (cloud instances, runtime nodes, errors)
//! - **`actions`** — launch / terminate / install / drain requests
//! - **`config`** — `cirrus.toml` parsing

pub mod actions;
pub mod config;
pub mod resources;
pub mod snapshot;
pub mod types;

pub use actions::{DrainRequest, InstallRequest, LaunchRequest, TerminateRequest, TickActions};
pub use config::{AutoscalerConfig, ConfigError, cluster_max_worker_nodes, parse_duration_ms};
pub use resources::ResourceMap;
pub use snapshot::{
    CloudInstance, ClusterDemand, ClusterSnapshot, InstallError, ProviderError, RuntimeNodeState,
    RuntimeNodeStatus,
};
pub use types::*;
