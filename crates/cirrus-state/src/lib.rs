//! cirrus-state — the autoscaler's instance bookkeeping.
//!
//! Backed by [redb](https://docs.rs/redb). Each `Instance` record is
//! JSON-serialized into a `&[u8]` value keyed by instance id.
//!
//! # Architecture
//!
//! - `InstanceStatus` is a closed enum; `InstanceStatus::next` is the
//!   only transition function and yields at most one successor per event.
//! - Records carry a version. Writes check the version they were read at
//!   (`StateError::VersionConflict` otherwise), and `apply` commits a
//!   whole batch in one redb write transaction or nothing.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{InstanceBatch, InstanceStore, StateStore};
pub use types::*;
