//! cirrus-reconciler — the autoscaler's control loop.
//!
//! Merges what the cloud provider and the compute runtime report into the
//! instance store, asks the scheduler for a target shape, and turns the
//! answer into launch, terminate, install and drain requests.
//!
//! # Tick
//!
//! ```text
//! snapshot  = provider + runtime + installer views
//! sync_from(snapshot)          // passive: observed truth → statuses
//! actions = step_next(snapshot) // active: plan → statuses + requests
//! dispatch(actions)            // adapters do the I/O
//! ```
//!
//! Every store write in a tick goes out as one atomic batch, so a tick
//! either lands completely or not at all.

pub mod adapter;
pub mod autoscaler;
pub mod error;
pub mod reconciler;

pub use adapter::{CloudProvider, Installer, RuntimeMonitor};
pub use autoscaler::Autoscaler;
pub use error::{ReconcileError, ReconcileResult};
pub use reconciler::Reconciler;
