//! Domain types for the Cirrus instance store.
//!
//! An `Instance` is the autoscaler's bookkeeping for one machine,
//! independent of the cloud resource backing it. Its status only moves
//! through [`Instance::apply`], which defers to [`InstanceStatus::next`].

use serde::{Deserialize, Serialize};

pub use cirrus_core::{InstanceId, MachineType, TerminationReason};

/// Status entries kept per instance; older ones are dropped.
pub const STATUS_HISTORY_LIMIT: usize = 32;

// ── Status ────────────────────────────────────────────────────────

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Queued,
    Requested,
    Allocated,
    AllocationFailed,
    RayInstalling,
    RayRunning,
    RayInstallFailed,
    RayStopping,
    RayStopped,
    Terminating,
    Terminated,
    TerminationFailed,
}

/// Something that happened to an instance, observed or decided.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    /// A launch request was sent to the provider.
    LaunchRequested { request_id: String },
    /// A cloud instance was matched to this record.
    CloudAllocated { cloud_instance_id: String },
    /// The provider reported the launch failed.
    LaunchFailed,
    /// A failed launch is queued again.
    Requeued,
    /// Runtime installation was requested.
    InstallStarted,
    /// The runtime reports the node joined.
    RuntimeJoined { runtime_node_id: String },
    /// The installer reported a failure.
    InstallFailed,
    /// The node is being drained ahead of termination.
    DrainRequested { reason: TerminationReason },
    /// The runtime reports the node left.
    RuntimeStopped,
    /// A terminate request was sent to the provider.
    TerminateRequested {
        request_id: String,
        reason: TerminationReason,
    },
    /// The provider reported the termination failed.
    TerminationFailed,
    /// The cloud instance no longer exists.
    CloudGone,
    /// Dropped before any cloud resource existed.
    Abandoned { reason: Option<TerminationReason> },
}

impl InstanceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LaunchRequested { .. } => "launch_requested",
            Self::CloudAllocated { .. } => "cloud_allocated",
            Self::LaunchFailed => "launch_failed",
            Self::Requeued => "requeued",
            Self::InstallStarted => "install_started",
            Self::RuntimeJoined { .. } => "runtime_joined",
            Self::InstallFailed => "install_failed",
            Self::DrainRequested { .. } => "drain_requested",
            Self::RuntimeStopped => "runtime_stopped",
            Self::TerminateRequested { .. } => "terminate_requested",
            Self::TerminationFailed => "termination_failed",
            Self::CloudGone => "cloud_gone",
            Self::Abandoned { .. } => "abandoned",
        }
    }
}

impl InstanceStatus {
    /// The single transition function.
    ///
    /// Returns the successor status, or `None` when the event does not
    /// move an instance in this status.
    pub fn next(self, event: &InstanceEvent) -> Option<InstanceStatus> {
        use InstanceEvent as E;
        use InstanceStatus as S;

        match (self, event) {
            (S::Queued, E::LaunchRequested { .. }) => Some(S::Requested),
            (S::Queued | S::Requested, E::CloudAllocated { .. }) => Some(S::Allocated),
            (S::Requested, E::LaunchFailed) => Some(S::AllocationFailed),
            (S::AllocationFailed, E::Requeued) => Some(S::Queued),
            (S::Queued | S::AllocationFailed, E::Abandoned { .. }) => Some(S::Terminated),
            (S::Allocated, E::InstallStarted) => Some(S::RayInstalling),
            (S::Allocated | S::RayInstalling, E::RuntimeJoined { .. }) => Some(S::RayRunning),
            (S::RayInstalling, E::InstallFailed) => Some(S::RayInstallFailed),
            (S::RayRunning, E::DrainRequested { .. }) => Some(S::RayStopping),
            (S::Allocated | S::RayInstalling | S::RayRunning | S::RayStopping, E::RuntimeStopped) => {
                Some(S::RayStopped)
            }
            (s, E::TerminateRequested { .. }) if s.holds_cloud_instance() && s != S::Terminating => {
                Some(S::Terminating)
            }
            (S::Terminating, E::TerminationFailed) => Some(S::TerminationFailed),
            (s, E::CloudGone) if s.holds_cloud_instance() => Some(S::Terminated),
            _ => None,
        }
    }

    /// Statuses in which a cloud instance is assigned.
    pub fn holds_cloud_instance(&self) -> bool {
        matches!(
            self,
            Self::Allocated
                | Self::RayInstalling
                | Self::RayRunning
                | Self::RayInstallFailed
                | Self::RayStopping
                | Self::RayStopped
                | Self::Terminating
                | Self::TerminationFailed
        )
    }

    /// A launch is pending and a cloud instance may still be matched.
    pub fn awaits_allocation(&self) -> bool {
        matches!(self, Self::Queued | Self::Requested)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Requested => "REQUESTED",
            Self::Allocated => "ALLOCATED",
            Self::AllocationFailed => "ALLOCATION_FAILED",
            Self::RayInstalling => "RAY_INSTALLING",
            Self::RayRunning => "RAY_RUNNING",
            Self::RayInstallFailed => "RAY_INSTALL_FAILED",
            Self::RayStopping => "RAY_STOPPING",
            Self::RayStopped => "RAY_STOPPED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::TerminationFailed => "TERMINATION_FAILED",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// One recorded status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: InstanceStatus,
    pub at_ms: u64,
}

/// The autoscaler's record of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub machine_type: MachineType,
    pub status: InstanceStatus,
    /// Store version this copy was read at; 0 for records not yet stored.
    #[serde(default)]
    pub version: u64,
    /// Hash of the machine-type config the instance was launched from.
    pub config_hash: String,
    pub launch_request_id: Option<String>,
    pub terminate_request_id: Option<String>,
    pub cloud_instance_id: Option<String>,
    pub runtime_node_id: Option<String>,
    pub termination_reason: Option<TerminationReason>,
    #[serde(default)]
    pub launch_attempts: u32,
    #[serde(default)]
    pub termination_attempts: u32,
    pub created_at_ms: u64,
    pub status_changed_at_ms: u64,
    #[serde(default)]
    pub status_history: Vec<StatusChange>,
}

impl Instance {
    /// A fresh QUEUED record.
    pub fn queued(id: InstanceId, machine_type: MachineType, config_hash: String, now_ms: u64) -> Self {
        Self {
            id,
            machine_type,
            status: InstanceStatus::Queued,
            version: 0,
            config_hash,
            launch_request_id: None,
            terminate_request_id: None,
            cloud_instance_id: None,
            runtime_node_id: None,
            termination_reason: None,
            launch_attempts: 0,
            termination_attempts: 0,
            created_at_ms: now_ms,
            status_changed_at_ms: now_ms,
            status_history: vec![StatusChange {
                status: InstanceStatus::Queued,
                at_ms: now_ms,
            }],
        }
    }

    /// Apply an event. Returns false, leaving the record untouched, when
    /// the event is not a legal transition from the current status.
    pub fn apply(&mut self, event: &InstanceEvent, now_ms: u64) -> bool {
        let Some(next) = self.status.next(event) else {
            return false;
        };

        match event {
            InstanceEvent::LaunchRequested { request_id } => {
                self.launch_request_id = Some(request_id.clone());
                self.launch_attempts += 1;
            }
            InstanceEvent::CloudAllocated { cloud_instance_id } => {
                self.cloud_instance_id = Some(cloud_instance_id.clone());
            }
            InstanceEvent::Requeued => {
                self.launch_request_id = None;
            }
            InstanceEvent::RuntimeJoined { runtime_node_id } => {
                self.runtime_node_id = Some(runtime_node_id.clone());
            }
            InstanceEvent::DrainRequested { reason } => {
                self.termination_reason = Some(*reason);
            }
            InstanceEvent::TerminateRequested { request_id, reason } => {
                self.terminate_request_id = Some(request_id.clone());
                self.termination_reason = Some(*reason);
                self.termination_attempts += 1;
            }
            InstanceEvent::Abandoned { reason } => {
                if reason.is_some() {
                    self.termination_reason = *reason;
                }
            }
            InstanceEvent::LaunchFailed
            | InstanceEvent::InstallStarted
            | InstanceEvent::InstallFailed
            | InstanceEvent::RuntimeStopped
            | InstanceEvent::TerminationFailed
            | InstanceEvent::CloudGone => {}
        }

        self.status = next;
        self.status_changed_at_ms = now_ms;
        self.status_history.push(StatusChange {
            status: next,
            at_ms: now_ms,
        });
        if self.status_history.len() > STATUS_HISTORY_LIMIT {
            let overflow = self.status_history.len() - STATUS_HISTORY_LIMIT;
            self.status_history.drain(..overflow);
        }
        true
    }

    /// Check record-level invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.status.holds_cloud_instance() && self.cloud_instance_id.is_none() {
            return Err(format!(
                "instance {} is {} without a cloud instance",
                self.id, self.status
            ));
        }
        if self.status.awaits_allocation() && self.cloud_instance_id.is_some() {
            return Err(format!(
                "instance {} is {} but already holds cloud instance",
                self.id, self.status
            ));
        }
        Ok(())
    }

    /// Milliseconds spent in the current status.
    pub fn time_in_status_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.status_changed_at_ms)
    }
}
