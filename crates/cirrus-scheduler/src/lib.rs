//! Cirrus resource-demand scheduler — bin-packing, gangs, constraints.
//!
//! Given the current cluster shape and outstanding demand, computes which
//! machines to launch and which to terminate. It never touches the
//! instance store; the reconciler turns the reply into transitions.
//!
//! # Components
//!
//! - **`node`** — `SchedulingNode` placement and utilization scoring
//! - **`context`** — `ScheduleContext`, the per-pass working set and launch budgets
//! - **`scheduler`** — `ResourceDemandScheduler` and its phases
//! - **`request`** — `SchedulingRequest` / `SchedulingReply`
//! - **`convert`** — Type conversions from state store types

pub mod context;
pub mod convert;
pub mod node;
pub mod request;
pub mod scheduler;

pub use context::{ContextCheckpoint, ScheduleContext};
pub use convert::{instance_to_node, instances_to_nodes, scheduling_status};
pub use node::{SchedulingNode, SchedulingNodeStatus, UtilizationScore};
pub use request::{SchedulingReply, SchedulingRequest, launch_request_id};
pub use scheduler::{DemandScheduler, ResourceDemandScheduler, order_requests};
